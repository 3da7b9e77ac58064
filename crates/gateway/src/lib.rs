//! Conversation gateway: authenticated, durable, multi-tenant message
//! delivery.
//!
//! Lifecycle:
//! 1. Load + validate config ([`config`]).
//! 2. Open the durable backend and run migrations ([`db`]).
//! 3. Build the shared [`state::Runtime`].
//! 4. Start the HTTP/WS server ([`server`]), the retention sweeper
//!    ([`retention`]), and the presence sweeper ([`presence`]).
//!
//! Domain logic lives in the store modules (`conversation_log`,
//! `cursor_store`, `conversation_store`, `session_store`, `keypackage_store`,
//! `social_chain`, `presence`, `subscription_hub`, `rate_limiter`,
//! `retention`) and is invoked from the request handlers in the flat
//! `*_routes` modules and from the duplex transport in `ws`.

pub mod auth_extractor;
pub mod config;
pub mod conversation_log;
pub mod conversation_routes;
pub mod conversation_store;
pub mod cursor_store;
pub mod db;
pub mod error;
pub mod gateway_directory;
pub mod inbox_routes;
pub mod infra_routes;
pub mod keypackage_routes;
pub mod keypackage_store;
pub mod presence;
pub mod presence_routes;
pub mod rate_limiter;
pub mod retention;
pub mod server;
pub mod session_routes;
pub mod session_store;
pub mod social_chain;
pub mod social_routes;
pub mod sse;
pub mod state;
pub mod subscription_hub;
pub mod ws;

pub use config::GatewayConfig;
pub use state::Runtime;

/// Run database migrations for the gateway crate.
pub async fn run_migrations(pool: &sqlx::SqlitePool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
