//! Fixed-window rate limiting for abuse-sensitive actions (spec §4.10,
//! SPEC_FULL §9.9).
//!
//! Generalizes the request-path throttle pattern from a `(ip, scope)` key to
//! an arbitrary `(action, key)` pair, since here the limited actions are
//! `conv.send`, `social.publish`, `dm.create` keyed by user/device rather
//! than by source IP and route.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use dashmap::{DashMap, mapref::entry::Entry};

const CLEANUP_EVERY_CHECKS: u64 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    ConvSend,
    SocialPublish,
    DmCreate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct LimiterKey {
    action: Action,
    key: u64,
}

#[derive(Debug, Clone, Copy)]
struct WindowState {
    started_at: Instant,
    count: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub max_count: u32,
    pub window: Duration,
}

pub enum Decision {
    Allowed,
    Denied { retry_after: Duration },
}

#[derive(Clone)]
pub struct RateLimiter {
    limits: Arc<dashmap::DashMap<Action, RateLimit>>,
    buckets: Arc<DashMap<LimiterKey, WindowState>>,
    checks_seen: Arc<AtomicU64>,
}

impl RateLimiter {
    pub fn new(conv_sends_per_min: u32, social_publishes_per_min: u32, dms_creates_per_min: u32) -> Self {
        let limits = DashMap::new();
        limits.insert(
            Action::ConvSend,
            RateLimit {
                max_count: conv_sends_per_min,
                window: Duration::from_secs(60),
            },
        );
        limits.insert(
            Action::SocialPublish,
            RateLimit {
                max_count: social_publishes_per_min,
                window: Duration::from_secs(60),
            },
        );
        limits.insert(
            Action::DmCreate,
            RateLimit {
                max_count: dms_creates_per_min,
                window: Duration::from_secs(60),
            },
        );
        Self {
            limits: Arc::new(limits),
            buckets: Arc::new(DashMap::new()),
            checks_seen: Arc::new(AtomicU64::new(0)),
        }
    }

    /// `key` identifies the acting principal (hash of user_id, device_id,
    /// whatever scope the action is limited per); callers pass a stable
    /// hash so this module stays string-agnostic.
    pub fn check(&self, action: Action, key: u64) -> Decision {
        self.check_at(action, key, Instant::now())
    }

    fn check_at(&self, action: Action, key: u64, now: Instant) -> Decision {
        let limit = match self.limits.get(&action) {
            Some(l) => *l,
            None => return Decision::Allowed,
        };
        if limit.max_count == 0 {
            return Decision::Denied {
                retry_after: limit.window.max(Duration::from_secs(1)),
            };
        }

        let lookup = LimiterKey { action, key };
        let decision = match self.buckets.entry(lookup) {
            Entry::Occupied(mut occupied) => {
                let state = occupied.get_mut();
                let elapsed = now.duration_since(state.started_at);
                if elapsed >= limit.window {
                    state.started_at = now;
                    state.count = 1;
                    Decision::Allowed
                } else if state.count < limit.max_count {
                    state.count += 1;
                    Decision::Allowed
                } else {
                    Decision::Denied {
                        retry_after: limit.window.saturating_sub(elapsed),
                    }
                }
            },
            Entry::Vacant(vacant) => {
                vacant.insert(WindowState {
                    started_at: now,
                    count: 1,
                });
                Decision::Allowed
            },
        };

        self.cleanup_if_needed(now);
        decision
    }

    fn cleanup_if_needed(&self, now: Instant) {
        let seen = self.checks_seen.fetch_add(1, Ordering::Relaxed) + 1;
        if !seen.is_multiple_of(CLEANUP_EVERY_CHECKS) {
            return;
        }
        let stale_after = Duration::from_secs(60 * 3);
        self.buckets
            .retain(|_, state| now.duration_since(state.started_at) <= stale_after);
    }
}

/// Stable hash of a string key for use with [`RateLimiter::check`].
pub fn hash_key(s: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_limit_then_denies() {
        let limiter = RateLimiter::new(2, 100, 100);
        let key = hash_key("user1");
        let now = Instant::now();
        assert!(matches!(
            limiter.check_at(Action::ConvSend, key, now),
            Decision::Allowed
        ));
        assert!(matches!(
            limiter.check_at(Action::ConvSend, key, now),
            Decision::Allowed
        ));
        match limiter.check_at(Action::ConvSend, key, now) {
            Decision::Denied { retry_after } => assert_eq!(retry_after, Duration::from_secs(60)),
            Decision::Allowed => panic!("expected third send to be denied"),
        }
    }

    #[test]
    fn window_resets_after_elapsed() {
        let limiter = RateLimiter::new(1, 100, 100);
        let key = hash_key("user1");
        let now = Instant::now();
        assert!(matches!(
            limiter.check_at(Action::ConvSend, key, now),
            Decision::Allowed
        ));
        assert!(matches!(
            limiter.check_at(Action::ConvSend, key, now + Duration::from_secs(61)),
            Decision::Allowed
        ));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new(1, 100, 100);
        let now = Instant::now();
        assert!(matches!(
            limiter.check_at(Action::ConvSend, hash_key("a"), now),
            Decision::Allowed
        ));
        assert!(matches!(
            limiter.check_at(Action::ConvSend, hash_key("b"), now),
            Decision::Allowed
        ));
    }

    #[test]
    fn zero_limit_always_denies() {
        let limiter = RateLimiter::new(0, 100, 100);
        match limiter.check(Action::ConvSend, hash_key("a")) {
            Decision::Denied { .. } => {},
            Decision::Allowed => panic!("expected zero limit to deny"),
        }
    }
}
