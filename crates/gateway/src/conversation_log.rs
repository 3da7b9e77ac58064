//! The conversation log: ordered, idempotent, sequence-numbered event
//! append (spec §4.1, SPEC_FULL §9.1).
//!
//! `append` is idempotent on `(conv_id, msg_id)`: a unique-constraint
//! violation on a concurrent racer is treated as the idempotent case (the
//! existing row is re-read and returned with `created = false`), not an
//! error — there is no `msg_id` reuse surface for a client to observe.

use serde::Serialize;
use sqlx::SqlitePool;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConversationEvent {
    pub conv_id: String,
    pub seq: i64,
    pub msg_id: String,
    pub env_b64: String,
    pub sender_device_id: String,
    pub ts_ms: i64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Bounds {
    pub earliest_seq: Option<i64>,
    pub latest_seq: Option<i64>,
    pub latest_ts_ms: Option<i64>,
}

#[derive(Debug, Error)]
pub enum ListFromError {
    #[error("from_seq must be at least 1")]
    InvalidFromSeq,
    #[error("replay window exceeded")]
    ReplayWindowExceeded {
        conv_id: String,
        requested_from_seq: i64,
        earliest_seq: i64,
        latest_seq: i64,
    },
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

#[derive(Clone)]
pub struct ConversationLog {
    pool: SqlitePool,
}

impl ConversationLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn append(
        &self,
        conv_id: &str,
        msg_id: &str,
        env_b64: &str,
        sender_device_id: &str,
        ts_ms: i64,
    ) -> Result<(i64, ConversationEvent, bool), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<(i64, String, String, i64)> = sqlx::query_as(
            "SELECT seq, env_b64, sender_device_id, ts_ms FROM conv_events WHERE conv_id = ? AND msg_id = ?",
        )
        .bind(conv_id)
        .bind(msg_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((seq, env_b64, sender_device_id, ts_ms)) = existing {
            tx.commit().await?;
            let event = ConversationEvent {
                conv_id: conv_id.to_string(),
                seq,
                msg_id: msg_id.to_string(),
                env_b64,
                sender_device_id,
                ts_ms,
            };
            return Ok((seq, event, false));
        }

        sqlx::query("INSERT OR IGNORE INTO conv_seq (conv_id, next_seq) VALUES (?, 1)")
            .bind(conv_id)
            .execute(&mut *tx)
            .await?;
        let (seq,): (i64,) = sqlx::query_as("SELECT next_seq FROM conv_seq WHERE conv_id = ?")
            .bind(conv_id)
            .fetch_one(&mut *tx)
            .await?;
        sqlx::query("UPDATE conv_seq SET next_seq = next_seq + 1 WHERE conv_id = ?")
            .bind(conv_id)
            .execute(&mut *tx)
            .await?;

        let insert_result = sqlx::query(
            "INSERT INTO conv_events (conv_id, seq, msg_id, env_b64, sender_device_id, ts_ms)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(conv_id)
        .bind(seq)
        .bind(msg_id)
        .bind(env_b64)
        .bind(sender_device_id)
        .bind(ts_ms)
        .execute(&mut *tx)
        .await;

        match insert_result {
            Ok(_) => {
                tx.commit().await?;
                let event = ConversationEvent {
                    conv_id: conv_id.to_string(),
                    seq,
                    msg_id: msg_id.to_string(),
                    env_b64: env_b64.to_string(),
                    sender_device_id: sender_device_id.to_string(),
                    ts_ms,
                };
                Ok((seq, event, true))
            },
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                tx.rollback().await.ok();
                let (seq, env_b64, sender_device_id, ts_ms): (i64, String, String, i64) = sqlx::query_as(
                    "SELECT seq, env_b64, sender_device_id, ts_ms FROM conv_events WHERE conv_id = ? AND msg_id = ?",
                )
                .bind(conv_id)
                .bind(msg_id)
                .fetch_one(&self.pool)
                .await?;
                let event = ConversationEvent {
                    conv_id: conv_id.to_string(),
                    seq,
                    msg_id: msg_id.to_string(),
                    env_b64,
                    sender_device_id,
                    ts_ms,
                };
                Ok((seq, event, false))
            },
            Err(e) => {
                tx.rollback().await.ok();
                Err(e)
            },
        }
    }

    pub async fn bounds(&self, conv_id: &str) -> Result<Bounds, sqlx::Error> {
        let row: (Option<i64>, Option<i64>) =
            sqlx::query_as("SELECT MIN(seq), MAX(seq) FROM conv_events WHERE conv_id = ?")
                .bind(conv_id)
                .fetch_one(&self.pool)
                .await?;
        let (earliest_seq, latest_seq) = row;
        if earliest_seq.is_none() || latest_seq.is_none() {
            return Ok(Bounds::default());
        }
        let (latest_ts_ms,): (Option<i64>,) = sqlx::query_as(
            "SELECT ts_ms FROM conv_events WHERE conv_id = ? ORDER BY seq DESC LIMIT 1",
        )
        .bind(conv_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(Bounds {
            earliest_seq,
            latest_seq,
            latest_ts_ms,
        })
    }

    /// `retention_enabled` gates the replay-window check (spec: only
    /// enforced once retention is actually pruning history).
    pub async fn list_from(
        &self,
        conv_id: &str,
        from_seq: i64,
        limit: Option<i64>,
        retention_enabled: bool,
    ) -> Result<Vec<ConversationEvent>, ListFromError> {
        if from_seq < 1 {
            return Err(ListFromError::InvalidFromSeq);
        }

        let bounds = self.bounds(conv_id).await?;
        if retention_enabled
            && let Some(earliest_seq) = bounds.earliest_seq
            && from_seq < earliest_seq
        {
            let latest_seq = bounds.latest_seq.unwrap_or(earliest_seq);
            return Err(ListFromError::ReplayWindowExceeded {
                conv_id: conv_id.to_string(),
                requested_from_seq: from_seq,
                earliest_seq,
                latest_seq,
            });
        }

        let limit = limit.map(|l| l.max(0)).unwrap_or(i64::MAX);
        let rows: Vec<(String, i64, String, String, String, i64)> = sqlx::query_as(
            "SELECT conv_id, seq, msg_id, env_b64, sender_device_id, ts_ms
             FROM conv_events WHERE conv_id = ? AND seq >= ? ORDER BY seq ASC LIMIT ?",
        )
        .bind(conv_id)
        .bind(from_seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(conv_id, seq, msg_id, env_b64, sender_device_id, ts_ms)| ConversationEvent {
                    conv_id,
                    seq,
                    msg_id,
                    env_b64,
                    sender_device_id,
                    ts_ms,
                },
            )
            .collect())
    }

    /// Greatest seq whose `ts_ms` predates `cutoff_ms`, for age-cap pruning.
    pub async fn max_seq_before(
        &self,
        conv_id: &str,
        cutoff_ms: i64,
    ) -> Result<Option<i64>, sqlx::Error> {
        let (seq,): (Option<i64>,) = sqlx::query_as(
            "SELECT MAX(seq) FROM conv_events WHERE conv_id = ? AND ts_ms < ?",
        )
        .bind(conv_id)
        .bind(cutoff_ms)
        .fetch_one(&self.pool)
        .await?;
        Ok(seq)
    }

    pub async fn list_conversations(&self) -> Result<Vec<String>, sqlx::Error> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT conv_id FROM conv_events ORDER BY conv_id ASC")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(c,)| c).collect())
    }

    /// Delete pruned rows. See `retention::RetentionPolicy::delete_upto_seq`
    /// for the cap math; this method is the mechanical DELETE only.
    pub async fn delete_up_to(&self, conv_id: &str, delete_upto_seq: i64) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM conv_events WHERE conv_id = ? AND seq <= ?")
            .bind(conv_id)
            .bind(delete_upto_seq)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_log() -> ConversationLog {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        crate::run_migrations(&pool).await.unwrap();
        ConversationLog::new(pool)
    }

    #[tokio::test]
    async fn idempotent_append_returns_same_seq_once() {
        let log = test_log().await;
        let (seq1, _, created1) = log.append("c1", "m1", "ZW52", "d1", 1000).await.unwrap();
        let (seq2, _, created2) = log.append("c1", "m1", "ZW52", "d1", 1000).await.unwrap();
        assert_eq!(seq1, 1);
        assert_eq!(seq1, seq2);
        assert!(created1);
        assert!(!created2);
    }

    #[tokio::test]
    async fn seq_is_dense_and_ordered() {
        let log = test_log().await;
        for i in 0..5 {
            log.append("c1", &format!("m{i}"), "ZW52", "d1", 1000 + i)
                .await
                .unwrap();
        }
        let events = log.list_from("c1", 1, None, false).await.unwrap();
        let seqs: Vec<i64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn msg_id_uniqueness_is_scoped_per_conversation() {
        let log = test_log().await;
        let (seq_a, _, _) = log.append("c1", "m1", "AA", "d1", 1).await.unwrap();
        let (seq_b, _, _) = log.append("c2", "m1", "BB", "d1", 2).await.unwrap();
        assert_eq!(seq_a, 1);
        assert_eq!(seq_b, 1);
    }

    #[tokio::test]
    async fn list_from_rejects_invalid_from_seq() {
        let log = test_log().await;
        let err = log.list_from("c1", 0, None, false).await.unwrap_err();
        assert!(matches!(err, ListFromError::InvalidFromSeq));
    }

    #[tokio::test]
    async fn replay_window_exceeded_carries_bounds() {
        let log = test_log().await;
        for i in 0..3 {
            log.append("c1", &format!("m{i}"), "AA", "d1", i).await.unwrap();
        }
        log.delete_up_to("c1", 1).await.unwrap();
        let err = log.list_from("c1", 1, None, true).await.unwrap_err();
        match err {
            ListFromError::ReplayWindowExceeded {
                earliest_seq,
                latest_seq,
                requested_from_seq,
                ..
            } => {
                assert_eq!(earliest_seq, 2);
                assert_eq!(latest_seq, 3);
                assert_eq!(requested_from_seq, 1);
            },
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn bounds_reports_none_when_empty() {
        let log = test_log().await;
        let bounds = log.bounds("unknown").await.unwrap();
        assert!(bounds.earliest_seq.is_none());
        assert!(bounds.latest_seq.is_none());
    }
}
