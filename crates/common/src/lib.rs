//! Shared error types and utilities used across the gateway crates.

pub mod error;

pub use error::{Error, FromMessage, Result};
