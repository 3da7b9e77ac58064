//! MLS-style key package publish/fetch/rotate with FIFO eviction (spec
//! §4.7, SPEC_FULL §9.6).
//!
//! The unissued-per-device cap evicts the oldest (lowest `kp_id`) rows
//! first, matching the original `SQLiteKeyPackageStore._enforce_cap`.
//! `fetch` is scoped per `user_id` and draws from the lowest-`kp_id`
//! unissued rows across every device that user owns — spec.md §4.7
//! explicitly widens the original's per-device fetch to this shape.

use sqlx::SqlitePool;

const DEFAULT_CAP: i64 = 1000;

#[derive(Clone)]
pub struct KeyPackageStore {
    pool: SqlitePool,
    cap: i64,
}

impl KeyPackageStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool, cap: DEFAULT_CAP }
    }

    pub fn with_cap(pool: SqlitePool, cap: i64) -> Self {
        Self { pool, cap }
    }

    pub async fn publish(
        &self,
        user_id: &str,
        device_id: &str,
        keypackages: &[String],
    ) -> Result<(), sqlx::Error> {
        if keypackages.is_empty() {
            return Ok(());
        }
        let now_ms = crate::state::now_ms();
        let mut tx = self.pool.begin().await?;
        for kp in keypackages {
            sqlx::query(
                "INSERT INTO keypackages (user_id, device_id, kp_b64, created_ms) VALUES (?, ?, ?, ?)",
            )
            .bind(user_id)
            .bind(device_id)
            .bind(kp)
            .bind(now_ms)
            .execute(&mut *tx)
            .await?;
        }
        enforce_cap(&mut tx, device_id, self.cap).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Lowest-`kp_id` unissued, unrevoked rows across every device
    /// `user_id` owns, marked issued in the same transaction they're read.
    pub async fn fetch(&self, user_id: &str, count: i64) -> Result<Vec<String>, sqlx::Error> {
        if count <= 0 {
            return Ok(Vec::new());
        }
        let mut tx = self.pool.begin().await?;
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT kp_id, kp_b64 FROM keypackages
             WHERE user_id = ? AND issued_ms IS NULL AND revoked_ms IS NULL
             ORDER BY kp_id ASC LIMIT ?",
        )
        .bind(user_id)
        .bind(count)
        .fetch_all(&mut *tx)
        .await?;
        let issued_at = crate::state::now_ms();
        for (kp_id, _) in &rows {
            sqlx::query("UPDATE keypackages SET issued_ms = ? WHERE kp_id = ?")
                .bind(issued_at)
                .bind(kp_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(rows.into_iter().map(|(_, kp_b64)| kp_b64).collect())
    }

    pub async fn rotate(
        &self,
        user_id: &str,
        device_id: &str,
        revoke: bool,
        replacement: &[String],
    ) -> Result<(), sqlx::Error> {
        let now_ms = crate::state::now_ms();
        let mut tx = self.pool.begin().await?;
        if revoke {
            sqlx::query(
                "UPDATE keypackages SET revoked_ms = ?
                 WHERE device_id = ? AND issued_ms IS NULL AND revoked_ms IS NULL",
            )
            .bind(now_ms)
            .bind(device_id)
            .execute(&mut *tx)
            .await?;
        }
        if !replacement.is_empty() {
            for kp in replacement {
                sqlx::query(
                    "INSERT INTO keypackages (user_id, device_id, kp_b64, created_ms) VALUES (?, ?, ?, ?)",
                )
                .bind(user_id)
                .bind(device_id)
                .bind(kp)
                .bind(now_ms)
                .execute(&mut *tx)
                .await?;
            }
            enforce_cap(&mut tx, device_id, self.cap).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn unissued_count(&self, device_id: &str) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM keypackages WHERE device_id = ? AND issued_ms IS NULL AND revoked_ms IS NULL",
        )
        .bind(device_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

async fn enforce_cap(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    device_id: &str,
    cap: i64,
) -> Result<(), sqlx::Error> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        "SELECT kp_id FROM keypackages
         WHERE device_id = ? AND issued_ms IS NULL AND revoked_ms IS NULL
         ORDER BY kp_id ASC",
    )
    .bind(device_id)
    .fetch_all(&mut **tx)
    .await?;
    let overflow = rows.len() as i64 - cap;
    if overflow <= 0 {
        return Ok(());
    }
    for (kp_id,) in rows.into_iter().take(overflow as usize) {
        sqlx::query("DELETE FROM keypackages WHERE kp_id = ?")
            .bind(kp_id)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store(cap: i64) -> KeyPackageStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        crate::run_migrations(&pool).await.unwrap();
        KeyPackageStore::with_cap(pool, cap)
    }

    #[tokio::test]
    async fn publish_then_fetch_marks_issued_and_fifo_orders() {
        let store = test_store(1000).await;
        store
            .publish("u1", "d1", &["a".to_string(), "b".to_string(), "c".to_string()])
            .await
            .unwrap();
        let fetched = store.fetch("u1", 2).await.unwrap();
        assert_eq!(fetched, vec!["a".to_string(), "b".to_string()]);
        let remaining = store.fetch("u1", 10).await.unwrap();
        assert_eq!(remaining, vec!["c".to_string()]);
        assert_eq!(store.unissued_count("d1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fetch_draws_across_all_of_a_users_devices() {
        let store = test_store(1000).await;
        store.publish("u1", "d1", &["a".to_string()]).await.unwrap();
        store.publish("u1", "d2", &["b".to_string()]).await.unwrap();
        let fetched = store.fetch("u1", 10).await.unwrap();
        assert_eq!(fetched, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn cap_evicts_oldest_unissued_first() {
        let store = test_store(2).await;
        store
            .publish("u1", "d1", &["a".to_string(), "b".to_string(), "c".to_string()])
            .await
            .unwrap();
        let remaining = store.fetch("u1", 10).await.unwrap();
        assert_eq!(remaining, vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn rotate_revokes_unissued_and_publishes_replacement() {
        let store = test_store(1000).await;
        store.publish("u1", "d1", &["a".to_string()]).await.unwrap();
        store
            .rotate("u1", "d1", true, &["b".to_string()])
            .await
            .unwrap();
        let fetched = store.fetch("u1", 10).await.unwrap();
        assert_eq!(fetched, vec!["b".to_string()]);
    }
}
