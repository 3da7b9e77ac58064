//! Durable per-device per-conversation delivery cursors (spec §4.3,
//! SPEC_FULL §9.2).
//!
//! `ack` is a single upsert whose `ON CONFLICT` clause clamps to
//! `max(existing.next_seq, candidate.next_seq)` — monotonicity enforced at
//! the SQL layer, not with a read-modify-write race.

use sqlx::SqlitePool;

#[derive(Clone)]
pub struct CursorStore {
    pool: SqlitePool,
}

impl CursorStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn ack(
        &self,
        device_id: &str,
        conv_id: &str,
        acked_seq: i64,
        now_ms: i64,
    ) -> Result<i64, sqlx::Error> {
        let next_seq = (acked_seq + 1).max(1);
        sqlx::query(
            "INSERT INTO cursors (device_id, conv_id, next_seq, updated_ms) VALUES (?, ?, ?, ?)
             ON CONFLICT(device_id, conv_id) DO UPDATE SET
                 next_seq = CASE WHEN excluded.next_seq > cursors.next_seq
                                 THEN excluded.next_seq ELSE cursors.next_seq END,
                 updated_ms = excluded.updated_ms",
        )
        .bind(device_id)
        .bind(conv_id)
        .bind(next_seq)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;

        let (stored,): (i64,) =
            sqlx::query_as("SELECT next_seq FROM cursors WHERE device_id = ? AND conv_id = ?")
                .bind(device_id)
                .bind(conv_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(stored)
    }

    pub async fn next_seq(&self, device_id: &str, conv_id: &str) -> Result<i64, sqlx::Error> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT next_seq FROM cursors WHERE device_id = ? AND conv_id = ?")
                .bind(device_id)
                .bind(conv_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(n,)| n).unwrap_or(1))
    }

    pub async fn active_min_next_seq(
        &self,
        conv_id: &str,
        now_ms: i64,
        stale_after_ms: i64,
    ) -> Result<Option<i64>, sqlx::Error> {
        let row: (Option<i64>,) = if stale_after_ms <= 0 {
            sqlx::query_as("SELECT MIN(next_seq) FROM cursors WHERE conv_id = ?")
                .bind(conv_id)
                .fetch_one(&self.pool)
                .await?
        } else {
            let stale_cutoff_ms = now_ms - stale_after_ms;
            sqlx::query_as("SELECT MIN(next_seq) FROM cursors WHERE conv_id = ? AND updated_ms >= ?")
                .bind(conv_id)
                .bind(stale_cutoff_ms)
                .fetch_one(&self.pool)
                .await?
        };
        Ok(row.0)
    }

    pub async fn list_cursors(&self, device_id: &str) -> Result<Vec<(String, i64)>, sqlx::Error> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT conv_id, next_seq FROM cursors WHERE device_id = ? ORDER BY conv_id ASC",
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> CursorStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        crate::run_migrations(&pool).await.unwrap();
        CursorStore::new(pool)
    }

    #[tokio::test]
    async fn ack_never_regresses() {
        let store = test_store().await;
        assert_eq!(store.ack("d1", "c1", 5, 1000).await.unwrap(), 6);
        assert_eq!(store.ack("d1", "c1", 2, 1001).await.unwrap(), 6);
        assert_eq!(store.ack("d1", "c1", 9, 1002).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn next_seq_defaults_to_one() {
        let store = test_store().await;
        assert_eq!(store.next_seq("d1", "c1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn active_min_next_seq_filters_stale_cursors() {
        let store = test_store().await;
        store.ack("d1", "c1", 1, 1_000).await.unwrap();
        store.ack("d2", "c1", 9, 100_000).await.unwrap();
        let min = store
            .active_min_next_seq("c1", 100_500, 1_000)
            .await
            .unwrap();
        assert_eq!(min, Some(10));
    }
}
