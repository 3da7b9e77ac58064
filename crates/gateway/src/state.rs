//! The shared `Runtime`: every store, the hub, and the background sweepers
//! owned by one value and passed by reference into request handlers (spec
//! §9 "Global mutable state" redesign flag — no module-level singletons).

use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::watch;

use convgw_auth::IdentityStore;

use crate::{
    config::GatewayConfig,
    conversation_log::ConversationLog,
    conversation_store::ConversationStore,
    cursor_store::CursorStore,
    gateway_directory::GatewayDirectory,
    keypackage_store::KeyPackageStore,
    presence::{Presence, PresenceConfig},
    rate_limiter::RateLimiter,
    retention,
    session_store::SessionStore,
    social_chain::SocialChain,
    subscription_hub::SubscriptionHub,
};

/// Current wall-clock time in milliseconds, the one place this crate reads
/// the system clock outside of tests (every store takes `now_ms` as a
/// parameter so its logic stays deterministic and testable).
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub struct Runtime {
    pub config: GatewayConfig,
    pub pool: SqlitePool,
    pub identity: IdentityStore,
    pub sessions: SessionStore,
    pub conv_log: ConversationLog,
    pub cursors: CursorStore,
    pub convs: ConversationStore,
    pub keypackages: KeyPackageStore,
    pub social: SocialChain,
    pub presence: Presence,
    pub hub: SubscriptionHub,
    pub rate_limiter: RateLimiter,
    pub directory: GatewayDirectory,
    shutdown_tx: watch::Sender<bool>,
}

impl Runtime {
    pub fn new(config: GatewayConfig, pool: SqlitePool) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        let rate_limiter = RateLimiter::new(
            config.conv_sends_per_min,
            config.social_publishes_per_min,
            config.dms_creates_per_min,
        );
        Arc::new(Self {
            identity: IdentityStore::new(pool.clone()),
            sessions: SessionStore::new(pool.clone(), config.session_ttl_s as i64 * 1000),
            conv_log: ConversationLog::new(pool.clone()),
            cursors: CursorStore::new(pool.clone()),
            convs: ConversationStore::new(pool.clone()),
            keypackages: KeyPackageStore::new(pool.clone()),
            social: SocialChain::new(pool.clone(), config.max_social_event_bytes),
            presence: Presence::new(PresenceConfig::default()),
            hub: SubscriptionHub::new(config.outbound_queue_capacity),
            directory: GatewayDirectory::new(pool.clone()),
            rate_limiter,
            pool,
            config,
            shutdown_tx,
        })
    }

    /// Start the retention and presence sweepers. Returns join handles the
    /// caller can ignore: both loops stop cleanly when `shutdown()` is
    /// called.
    pub fn spawn_sweepers(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let retention_handle = tokio::spawn(retention::run_sweeper(
            self.conv_log.clone(),
            self.cursors.clone(),
            self.config.retention,
            self.shutdown_tx.subscribe(),
        ));

        let presence = self.presence.clone();
        let interval_ms =
            (self.presence.config().sweeper_interval_seconds * 1000.0).max(100.0) as u64;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let presence_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        presence.expire(now_ms());
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            return;
                        }
                    }
                }
            }
        });

        vec![retention_handle, presence_handle]
    }

    /// Signal the sweeper loops to stop. In-flight transactions they hold
    /// complete first because each tick is a single self-contained call.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
