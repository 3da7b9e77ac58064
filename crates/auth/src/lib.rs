//! Cryptographic primitives and identity resolution for the conversation
//! gateway.
//!
//! - [`crypto`]: Ed25519 sign/verify, SHA-256, canonical JSON — the wire
//!   contract the signed social event chain is built on.
//! - [`tokens`]: session/resume bearer token generation.
//! - [`identity`]: `auth_token` → `user_id` resolution backing
//!   `session.start`.

pub mod crypto;
pub mod identity;
pub mod tokens;

pub use identity::{IdentityError, IdentityStore};
