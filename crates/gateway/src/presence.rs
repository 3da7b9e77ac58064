//! Presence: leases, mutual-consent watchlists, block lists (spec §4.9,
//! SPEC_FULL §9.8).
//!
//! Entirely in-memory, like the subscription hub — presence is ephemeral by
//! nature and the original has no durable presence store either. `watch`
//! and `block` reuse the same two-sided set bookkeeping shape; the block
//! list carries no size cap since it's a safety control, not a resource a
//! peer can exhaust against another.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use thiserror::Error;
use tokio::sync::mpsc;

use convgw_protocol::{LastSeenBucket, PresenceStatus};

#[derive(Debug, Clone, Copy)]
pub struct PresenceConfig {
    pub max_ttl_seconds: u64,
    pub min_ttl_seconds: u64,
    pub max_watchlist_size: usize,
    pub max_watchers_per_target: usize,
    pub watch_mutations_per_min: u32,
    pub renews_per_min: u32,
    pub sweeper_interval_seconds: f64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            max_ttl_seconds: 300,
            min_ttl_seconds: 15,
            max_watchlist_size: 256,
            max_watchers_per_target: 256,
            watch_mutations_per_min: 60,
            renews_per_min: 60,
            sweeper_interval_seconds: 1.0,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PresenceError {
    #[error("rate limit exceeded")]
    RateLimitExceeded,
    #[error("limit exceeded")]
    LimitExceeded(&'static str),
}

#[derive(Debug, Clone, Copy)]
struct Lease {
    expires_at_ms: i64,
    invisible: bool,
    last_seen_ms: i64,
}

struct FixedWindowRateLimiter {
    limit: u32,
    window_ms: i64,
    windows: HashMap<String, (i64, u32)>,
}

impl FixedWindowRateLimiter {
    fn new(limit: u32) -> Self {
        Self {
            limit,
            window_ms: 60_000,
            windows: HashMap::new(),
        }
    }

    fn allow(&mut self, key: &str, now_ms: i64) -> bool {
        let (window_start, count) = self.windows.get(key).copied().unwrap_or((now_ms, 0));
        let (window_start, count) = if now_ms - window_start >= self.window_ms {
            (now_ms, 0)
        } else {
            (window_start, count)
        };
        let count = count + 1;
        self.windows.insert(key.to_string(), (window_start, count));
        count <= self.limit
    }
}

pub struct PresenceUpdate {
    pub user_id: String,
    pub status: PresenceStatus,
    pub expires_at: i64,
    pub last_seen_bucket: LastSeenBucket,
}

/// A point-in-time read of one device's presence, for `/v1/presence/status`
/// and the duplex transport's own status lookups. `expires_at` is only
/// carried alongside `Online` — an offline entry has nothing live to report.
#[derive(Debug, Clone, Copy)]
pub struct PresenceSnapshot {
    pub status: PresenceStatus,
    pub expires_at: Option<i64>,
    pub last_seen_bucket: Option<LastSeenBucket>,
}

struct Inner {
    leases: HashMap<String, Lease>,
    watchlists: HashMap<String, HashSet<String>>,
    reverse_watchers: HashMap<String, HashSet<String>>,
    blocked: HashMap<String, HashSet<String>>,
    callbacks: HashMap<String, mpsc::Sender<PresenceUpdate>>,
    watch_rate: FixedWindowRateLimiter,
    renew_rate: FixedWindowRateLimiter,
}

#[derive(Clone)]
pub struct Presence {
    config: PresenceConfig,
    inner: Arc<Mutex<Inner>>,
}

impl Presence {
    pub fn new(config: PresenceConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                leases: HashMap::new(),
                watchlists: HashMap::new(),
                reverse_watchers: HashMap::new(),
                blocked: HashMap::new(),
                callbacks: HashMap::new(),
                watch_rate: FixedWindowRateLimiter::new(config.watch_mutations_per_min),
                renew_rate: FixedWindowRateLimiter::new(config.renews_per_min),
            })),
            config,
        }
    }

    pub fn config(&self) -> PresenceConfig {
        self.config
    }

    pub fn register_callback(&self, device_id: &str, tx: mpsc::Sender<PresenceUpdate>) {
        self.inner.lock().unwrap().callbacks.insert(device_id.to_string(), tx);
    }

    pub fn unregister_callback(&self, device_id: &str) {
        self.inner.lock().unwrap().callbacks.remove(device_id);
    }

    fn clamp_ttl(&self, ttl_seconds: u64) -> u64 {
        ttl_seconds.clamp(self.config.min_ttl_seconds, self.config.max_ttl_seconds)
    }

    fn bucket_last_seen(now_ms: i64, last_seen_ms: i64) -> LastSeenBucket {
        LastSeenBucket::from_age_ms((now_ms - last_seen_ms).max(0))
    }

    fn notify(
        inner: &mut Inner,
        target_device_id: &str,
        status: PresenceStatus,
        expires_at_ms: i64,
        last_seen_ms: i64,
        invisible: bool,
        now_ms: i64,
    ) {
        if invisible {
            return;
        }
        let Some(target_watchlist) = inner.watchlists.get(target_device_id).cloned() else {
            return;
        };
        let Some(watchers) = inner.reverse_watchers.get(target_device_id).cloned() else {
            return;
        };
        let blocked_by_target = inner
            .blocked
            .get(target_device_id)
            .cloned()
            .unwrap_or_default();

        for watcher in watchers {
            if !target_watchlist.contains(&watcher) {
                continue;
            }
            if blocked_by_target.contains(&watcher) {
                continue;
            }
            if inner
                .blocked
                .get(&watcher)
                .is_some_and(|b| b.contains(target_device_id))
            {
                continue;
            }
            if let Some(tx) = inner.callbacks.get(&watcher) {
                let _ = tx.try_send(PresenceUpdate {
                    user_id: target_device_id.to_string(),
                    status,
                    expires_at: expires_at_ms,
                    last_seen_bucket: Self::bucket_last_seen(now_ms, last_seen_ms),
                });
            }
        }
    }

    pub fn lease(
        &self,
        device_id: &str,
        ttl_seconds: u64,
        invisible: bool,
        now_ms: i64,
    ) -> Result<i64, PresenceError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.renew_rate.allow(device_id, now_ms) {
            return Err(PresenceError::RateLimitExceeded);
        }
        let ttl_ms = self.clamp_ttl(ttl_seconds) as i64 * 1000;
        let expires_at_ms = now_ms + ttl_ms;
        let prior = inner.leases.get(device_id).copied();
        let was_visible = prior.is_some_and(|p| p.expires_at_ms > now_ms && !p.invisible);

        inner.leases.insert(
            device_id.to_string(),
            Lease {
                expires_at_ms,
                invisible,
                last_seen_ms: now_ms,
            },
        );

        let now_visible = expires_at_ms > now_ms && !invisible;
        if now_visible && !was_visible {
            Self::notify(
                &mut inner,
                device_id,
                PresenceStatus::Online,
                expires_at_ms,
                now_ms,
                invisible,
                now_ms,
            );
        }
        if was_visible && invisible && let Some(prior) = prior {
            Self::notify(
                &mut inner,
                device_id,
                PresenceStatus::Offline,
                expires_at_ms,
                prior.last_seen_ms,
                prior.invisible,
                now_ms,
            );
        }
        Ok(expires_at_ms)
    }

    pub fn renew(
        &self,
        device_id: &str,
        ttl_seconds: u64,
        invisible: Option<bool>,
        now_ms: i64,
    ) -> Result<i64, PresenceError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.renew_rate.allow(device_id, now_ms) {
            return Err(PresenceError::RateLimitExceeded);
        }
        let prior = inner.leases.get(device_id).copied();
        let current_invisible = prior.map(|p| p.invisible).unwrap_or(false);
        let new_invisible = invisible.unwrap_or(current_invisible);

        let ttl_ms = self.clamp_ttl(ttl_seconds) as i64 * 1000;
        let expires_at_ms = now_ms + ttl_ms;
        let was_visible = prior.is_some_and(|p| p.expires_at_ms > now_ms && !p.invisible);

        inner.leases.insert(
            device_id.to_string(),
            Lease {
                expires_at_ms,
                invisible: new_invisible,
                last_seen_ms: now_ms,
            },
        );

        let now_visible = expires_at_ms > now_ms && !new_invisible;
        if now_visible && !was_visible {
            Self::notify(
                &mut inner,
                device_id,
                PresenceStatus::Online,
                expires_at_ms,
                now_ms,
                new_invisible,
                now_ms,
            );
        }
        if was_visible && new_invisible && let Some(prior) = prior {
            Self::notify(
                &mut inner,
                device_id,
                PresenceStatus::Offline,
                expires_at_ms,
                prior.last_seen_ms,
                prior.invisible,
                now_ms,
            );
        }
        Ok(expires_at_ms)
    }

    /// Sweep expired leases, notifying eligible watchers `offline`. Called
    /// on `sweeper_interval_seconds` by the runtime's background task.
    pub fn expire(&self, now_ms: i64) {
        let mut inner = self.inner.lock().unwrap();
        let expired: Vec<(String, Lease)> = inner
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at_ms <= now_ms)
            .map(|(id, lease)| (id.clone(), *lease))
            .collect();
        for (device_id, _) in &expired {
            inner.leases.remove(device_id);
        }
        for (device_id, lease) in expired {
            Self::notify(
                &mut inner,
                &device_id,
                PresenceStatus::Offline,
                lease.expires_at_ms,
                lease.last_seen_ms,
                lease.invisible,
                now_ms,
            );
        }
    }

    pub fn watch(
        &self,
        watcher_device_id: &str,
        contacts: &[String],
        now_ms: i64,
    ) -> Result<usize, PresenceError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.watch_rate.allow(watcher_device_id, now_ms) {
            return Err(PresenceError::RateLimitExceeded);
        }
        let watchlist = inner
            .watchlists
            .get(watcher_device_id)
            .cloned()
            .unwrap_or_default();
        let contacts_set: HashSet<String> = contacts.iter().cloned().collect();
        let new_total = watchlist.union(&contacts_set).count();
        if new_total > self.config.max_watchlist_size {
            return Err(PresenceError::LimitExceeded("watchlist too large"));
        }
        for target in &contacts_set {
            if watchlist.contains(target) {
                continue;
            }
            let watchers = inner.reverse_watchers.get(target).cloned().unwrap_or_default();
            if watchers.len() >= self.config.max_watchers_per_target {
                return Err(PresenceError::LimitExceeded("target watcher cap reached"));
            }
        }

        let mut watchlist = watchlist;
        for target in contacts_set {
            if watchlist.insert(target.clone()) {
                inner
                    .reverse_watchers
                    .entry(target)
                    .or_default()
                    .insert(watcher_device_id.to_string());
            }
        }
        let size = watchlist.len();
        inner.watchlists.insert(watcher_device_id.to_string(), watchlist);
        Ok(size)
    }

    pub fn unwatch(
        &self,
        watcher_device_id: &str,
        contacts: &[String],
        now_ms: i64,
    ) -> Result<usize, PresenceError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.watch_rate.allow(watcher_device_id, now_ms) {
            return Err(PresenceError::RateLimitExceeded);
        }
        let mut watchlist = inner
            .watchlists
            .get(watcher_device_id)
            .cloned()
            .unwrap_or_default();
        for target in contacts {
            if watchlist.remove(target)
                && let Some(watchers) = inner.reverse_watchers.get_mut(target)
            {
                watchers.remove(watcher_device_id);
                if watchers.is_empty() {
                    inner.reverse_watchers.remove(target);
                }
            }
        }
        let size = watchlist.len();
        if watchlist.is_empty() {
            inner.watchlists.remove(watcher_device_id);
        } else {
            inner.watchlists.insert(watcher_device_id.to_string(), watchlist);
        }
        Ok(size)
    }

    pub fn block(&self, user_id: &str, contacts: &[String]) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.blocked.entry(user_id.to_string()).or_default();
        for c in contacts {
            entry.insert(c.clone());
        }
        entry.len()
    }

    pub fn unblock(&self, user_id: &str, contacts: &[String]) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.blocked.get_mut(user_id) else {
            return 0;
        };
        for c in contacts {
            entry.remove(c);
        }
        let size = entry.len();
        if entry.is_empty() {
            inner.blocked.remove(user_id);
        }
        size
    }

    pub fn is_blocked(&self, a: &str, b: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.blocked.get(a).is_some_and(|s| s.contains(b))
            || inner.blocked.get(b).is_some_and(|s| s.contains(a))
    }

    pub fn blocklist(&self, user_id: &str) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut list: Vec<String> = inner
            .blocked
            .get(user_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        list.sort();
        list
    }

    /// Current status of `device_id`, independent of any watch
    /// relationship. The caller (the route handler, which knows the
    /// requester's identity) is responsible for consulting
    /// [`Presence::is_blocked`] first and substituting a minimal offline
    /// entry when either side has blocked the other — this method always
    /// reports the true lease state.
    pub fn status(&self, device_id: &str, now_ms: i64) -> PresenceSnapshot {
        let inner = self.inner.lock().unwrap();
        match inner.leases.get(device_id) {
            Some(lease) if lease.expires_at_ms > now_ms && !lease.invisible => PresenceSnapshot {
                status: PresenceStatus::Online,
                expires_at: Some(lease.expires_at_ms),
                last_seen_bucket: Some(Self::bucket_last_seen(now_ms, lease.last_seen_ms)),
            },
            Some(lease) => PresenceSnapshot {
                status: PresenceStatus::Offline,
                expires_at: None,
                last_seen_bucket: Some(Self::bucket_last_seen(now_ms, lease.last_seen_ms)),
            },
            None => PresenceSnapshot {
                status: PresenceStatus::Offline,
                expires_at: None,
                last_seen_bucket: None,
            },
        }
    }

    pub fn watchlist_size(&self, watcher_device_id: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .watchlists
            .get(watcher_device_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_notifies_mutual_watchers_only() {
        let presence = Presence::new(PresenceConfig::default());
        let (tx, mut rx) = mpsc::channel(8);
        presence.register_callback("watcher", tx);
        presence.watch("watcher", &["target".to_string()], 0).unwrap();
        presence.watch("target", &["watcher".to_string()], 0).unwrap();
        // Mutual watch is already established, so this lease is the
        // visibility flip and emits to the watcher.
        presence.lease("target", 60, false, 1_000).unwrap();
        let update = rx.try_recv().unwrap();
        assert_eq!(update.user_id, "target");
        assert!(matches!(update.status, PresenceStatus::Online));
    }

    #[test]
    fn blocked_peers_never_receive_updates() {
        let presence = Presence::new(PresenceConfig::default());
        let (tx, mut rx) = mpsc::channel(8);
        presence.register_callback("watcher", tx);
        presence.watch("watcher", &["target".to_string()], 0).unwrap();
        presence.watch("target", &["watcher".to_string()], 0).unwrap();
        presence.block("target", &["watcher".to_string()]);
        presence.lease("target", 60, false, 1_000).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn ttl_is_clamped_to_config_bounds() {
        let presence = Presence::new(PresenceConfig::default());
        let expires_at = presence.lease("d1", 5, false, 0).unwrap();
        assert_eq!(expires_at, 15_000); // clamped up to min_ttl_seconds
        let expires_at = presence.lease("d2", 10_000, false, 0).unwrap();
        assert_eq!(expires_at, 300_000); // clamped down to max_ttl_seconds
    }

    #[test]
    fn watchlist_cap_is_enforced() {
        let config = PresenceConfig {
            max_watchlist_size: 1,
            ..PresenceConfig::default()
        };
        let presence = Presence::new(config);
        presence.watch("watcher", &["a".to_string()], 0).unwrap();
        let err = presence
            .watch("watcher", &["b".to_string()], 1)
            .unwrap_err();
        assert_eq!(err, PresenceError::LimitExceeded("watchlist too large"));
    }

    #[test]
    fn expire_clears_lease_and_notifies_offline() {
        let presence = Presence::new(PresenceConfig::default());
        let (tx, mut rx) = mpsc::channel(8);
        presence.register_callback("watcher", tx);
        presence.watch("watcher", &["target".to_string()], 0).unwrap();
        presence.watch("target", &["watcher".to_string()], 0).unwrap();
        presence.lease("target", 15, false, 1_000).unwrap();
        rx.try_recv().unwrap(); // online notification
        presence.expire(20_000);
        let update = rx.try_recv().unwrap();
        assert!(matches!(update.status, PresenceStatus::Offline));
        assert_eq!(presence.watchlist_size("watcher"), 1);
    }

    #[test]
    fn status_reports_online_only_while_leased_and_visible() {
        let presence = Presence::new(PresenceConfig::default());
        assert!(matches!(presence.status("d1", 0).status, PresenceStatus::Offline));
        assert!(presence.status("d1", 0).last_seen_bucket.is_none());

        presence.lease("d1", 60, false, 1_000).unwrap();
        let snapshot = presence.status("d1", 1_000);
        assert!(matches!(snapshot.status, PresenceStatus::Online));
        assert_eq!(snapshot.expires_at, Some(61_000));

        presence.expire(70_000);
        let snapshot = presence.status("d1", 70_000);
        assert!(matches!(snapshot.status, PresenceStatus::Offline));
        assert!(snapshot.expires_at.is_none());
        assert!(snapshot.last_seen_bucket.is_some());
    }

    #[test]
    fn block_and_unblock_round_trip() {
        let presence = Presence::new(PresenceConfig::default());
        presence.block("a", &["b".to_string(), "c".to_string()]);
        assert!(presence.is_blocked("a", "b"));
        assert!(presence.is_blocked("b", "a")); // symmetric check
        assert_eq!(presence.blocklist("a"), vec!["b".to_string(), "c".to_string()]);
        presence.unblock("a", &["b".to_string()]);
        assert!(!presence.is_blocked("a", "b"));
        assert!(presence.is_blocked("a", "c"));
    }
}
