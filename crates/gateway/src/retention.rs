//! Retention engine: bounded history, safe-mode vs hard-limit pruning (spec
//! §4.6, SPEC_FULL §9.5).

use std::time::Duration;

use tracing::{info, warn};

use crate::{conversation_log::ConversationLog, cursor_store::CursorStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_events_per_conv: u64,
    pub max_age_s: u64,
    pub sweep_interval_s: u64,
    pub cursor_stale_after_s: u64,
    pub hard_limits: bool,
}

impl RetentionPolicy {
    pub fn enabled(&self) -> bool {
        self.max_events_per_conv > 0 || self.max_age_s > 0
    }

    pub fn max_age_ms(&self) -> i64 {
        (self.max_age_s as i64) * 1000
    }

    pub fn cursor_stale_after_ms(&self) -> i64 {
        (self.cursor_stale_after_s as i64) * 1000
    }
}

/// Prune a single conversation's log against `policy`.
///
/// Mirrors the original's `SQLiteConversationLog.prune_conv`: compute the
/// count-cap and age-cap bounds, take their max, floor at `min_seq - 1`
/// (never deletes below what's already there), then in safe mode clamp down
/// to `active_min_next_seq - 1` so no non-stale cursor's unacked tail is
/// ever pruned.
pub async fn prune_conv(
    log: &ConversationLog,
    conv_id: &str,
    policy: &RetentionPolicy,
    now_ms: i64,
    active_min_next_seq: Option<i64>,
) -> Result<u64, sqlx::Error> {
    if !policy.enabled() {
        return Ok(0);
    }

    let bounds = log.bounds(conv_id).await?;
    let (Some(min_seq), Some(max_seq)) = (bounds.earliest_seq, bounds.latest_seq) else {
        return Ok(0);
    };

    let mut delete_upto_seq: Option<i64> = None;

    if policy.max_events_per_conv > 0 {
        let cap_before_seq = max_seq - policy.max_events_per_conv as i64 + 1;
        delete_upto_seq = Some(cap_before_seq - 1);
    }

    if policy.max_age_s > 0 {
        let age_cutoff_ms = now_ms - policy.max_age_ms();
        // The age-cap bound is the greatest seq whose ts_ms predates the
        // cutoff; we query via list_from-free direct SQL in conversation_log
        // only indirectly — reuse bounds' backing table through a small
        // dedicated query on the log's pool is avoided here to keep this
        // module pool-agnostic, so the caller supplies it via `log`.
        if let Some(age_delete_upto) = log.max_seq_before(conv_id, age_cutoff_ms).await? {
            delete_upto_seq = Some(match delete_upto_seq {
                Some(existing) => existing.max(age_delete_upto),
                None => age_delete_upto,
            });
        }
    }

    let Some(mut delete_upto_seq) = delete_upto_seq else {
        return Ok(0);
    };

    delete_upto_seq = delete_upto_seq.max(min_seq - 1);

    if !policy.hard_limits
        && let Some(active_min_next_seq) = active_min_next_seq
    {
        delete_upto_seq = delete_upto_seq.min(active_min_next_seq - 1);
    }

    if delete_upto_seq < min_seq {
        return Ok(0);
    }

    log.delete_up_to(conv_id, delete_upto_seq).await
}

/// Background sweeper: iterates known conversations and prunes each on a
/// fixed interval (spec §4.6 "Sweeper loop"). Stops when the process shuts
/// down; in-flight transactions complete first because `prune_conv` is a
/// single self-contained call.
pub async fn run_sweeper(
    log: ConversationLog,
    cursors: CursorStore,
    policy: RetentionPolicy,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    if !policy.enabled() {
        info!("retention: policy disabled, sweeper not started");
        return;
    }
    let mut ticker = tokio::time::interval(Duration::from_secs(policy.sweep_interval_s));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sweep_once(&log, &cursors, &policy).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("retention: sweeper shutting down");
                    return;
                }
            }
        }
    }
}

async fn sweep_once(log: &ConversationLog, cursors: &CursorStore, policy: &RetentionPolicy) {
    let conv_ids = match log.list_conversations().await {
        Ok(ids) => ids,
        Err(e) => {
            warn!(error = %e, "retention: failed to list conversations, will retry next tick");
            return;
        },
    };
    let now_ms = crate::state::now_ms();
    for conv_id in conv_ids {
        let active_min_next_seq = if policy.hard_limits {
            None
        } else {
            match cursors
                .active_min_next_seq(&conv_id, now_ms, policy.cursor_stale_after_ms())
                .await
            {
                Ok(v) => v,
                Err(e) => {
                    warn!(conv_id = %conv_id, error = %e, "retention: failed to read cursors, skipping conv this tick");
                    continue;
                },
            }
        };
        match prune_conv(log, &conv_id, policy, now_ms, active_min_next_seq).await {
            Ok(0) => {},
            Ok(deleted) => info!(conv_id = %conv_id, deleted, "retention: pruned conversation"),
            Err(e) => warn!(conv_id = %conv_id, error = %e, "retention: prune failed, will retry next tick"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::SqlitePool;

    async fn setup() -> (ConversationLog, CursorStore) {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        crate::run_migrations(&pool).await.unwrap();
        (
            ConversationLog::new(pool.clone()),
            CursorStore::new(pool),
        )
    }

    fn policy(max_events: u64, hard_limits: bool) -> RetentionPolicy {
        RetentionPolicy {
            max_events_per_conv: max_events,
            max_age_s: 0,
            sweep_interval_s: 60,
            cursor_stale_after_s: 0,
            hard_limits,
        }
    }

    #[tokio::test]
    async fn safe_mode_never_deletes_past_active_cursor() {
        let (log, cursors) = setup().await;
        for i in 0..10 {
            log.append("c1", &format!("m{i}"), "AA", "d1", i).await.unwrap();
        }
        cursors.ack("d1", "c1", 3, 0).await.unwrap(); // next_seq = 4
        let policy = policy(3, false);
        let active_min_next_seq = cursors.active_min_next_seq("c1", 0, 0).await.unwrap();
        let deleted = prune_conv(&log, "c1", &policy, 0, active_min_next_seq)
            .await
            .unwrap();
        assert_eq!(deleted, 3); // deletes seq 1..=3, preserves seq>=4
        let bounds = log.bounds("c1").await.unwrap();
        assert_eq!(bounds.earliest_seq, Some(4));
    }

    #[tokio::test]
    async fn hard_limit_mode_overtakes_slow_cursor() {
        let (log, cursors) = setup().await;
        for i in 0..10 {
            log.append("c1", &format!("m{i}"), "AA", "d1", i).await.unwrap();
        }
        cursors.ack("d1", "c1", 1, 0).await.unwrap(); // next_seq = 2
        let policy = policy(3, true);
        let deleted = prune_conv(&log, "c1", &policy, 0, None).await.unwrap();
        assert_eq!(deleted, 7); // keeps only the newest 3, ignoring the cursor
        let bounds = log.bounds("c1").await.unwrap();
        assert_eq!(bounds.earliest_seq, Some(8));
    }

    #[tokio::test]
    async fn disabled_policy_is_a_no_op() {
        let (log, _cursors) = setup().await;
        for i in 0..5 {
            log.append("c1", &format!("m{i}"), "AA", "d1", i).await.unwrap();
        }
        let policy = policy(0, false);
        let deleted = prune_conv(&log, "c1", &policy, 0, None).await.unwrap();
        assert_eq!(deleted, 0);
    }
}
