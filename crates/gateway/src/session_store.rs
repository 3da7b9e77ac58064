//! Durable session layer: bearer + resume tokens (spec §4.4, SPEC_FULL
//! §9.3).
//!
//! `consume_resume` runs inside `BEGIN IMMEDIATE` semantics via a
//! transaction so a resume token is single-use even under concurrent
//! reconnects: the old token is atomically swapped for a new one, and a
//! racer reading the already-rotated row gets no match.

use convgw_auth::tokens;
use sqlx::SqlitePool;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub device_id: String,
    pub session_token: String,
    pub resume_token: String,
    pub expires_at_ms: i64,
    pub created_at_ms: i64,
    pub last_seen_at_ms: i64,
    pub client_label: Option<String>,
}

impl Session {
    /// The SHA-256 hex of `session_token` — the only session identifier
    /// ever exposed to clients (`GET /v1/session/list` never returns the
    /// token itself).
    pub fn session_id(&self) -> String {
        tokens::session_id_for(&self.session_token)
    }
}

type SessionRow = (String, String, String, String, i64, i64, i64, Option<String>);

fn row_to_session(row: SessionRow) -> Session {
    let (session_token, resume_token, device_id, user_id, expires_at_ms, created_at_ms, last_seen_at_ms, client_label) =
        row;
    Session {
        user_id,
        device_id,
        session_token,
        resume_token,
        expires_at_ms,
        created_at_ms,
        last_seen_at_ms,
        client_label,
    }
}

const SESSION_COLUMNS: &str =
    "session_token, resume_token, device_id, user_id, expires_at_ms, created_at_ms, last_seen_at_ms, client_label";

#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
    ttl_ms: i64,
}

impl SessionStore {
    pub fn new(pool: SqlitePool, ttl_ms: i64) -> Self {
        Self { pool, ttl_ms }
    }

    pub async fn create(
        &self,
        user_id: &str,
        device_id: &str,
        client_label: Option<&str>,
        now_ms: i64,
    ) -> Result<Session, sqlx::Error> {
        let session = Session {
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            session_token: tokens::new_session_token(),
            resume_token: tokens::new_resume_token(),
            expires_at_ms: now_ms + self.ttl_ms,
            created_at_ms: now_ms,
            last_seen_at_ms: now_ms,
            client_label: client_label.map(str::to_string),
        };
        sqlx::query(
            "INSERT INTO sessions
                 (session_token, resume_token, device_id, user_id, expires_at_ms,
                  created_at_ms, last_seen_at_ms, client_label)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.session_token)
        .bind(&session.resume_token)
        .bind(&session.device_id)
        .bind(&session.user_id)
        .bind(session.expires_at_ms)
        .bind(session.created_at_ms)
        .bind(session.last_seen_at_ms)
        .bind(&session.client_label)
        .execute(&self.pool)
        .await?;
        Ok(session)
    }

    pub async fn get_by_session(
        &self,
        session_token: &str,
        now_ms: i64,
    ) -> Result<Option<Session>, sqlx::Error> {
        let row = self.fetch_by("session_token", session_token).await?;
        let session = self.expire_if_stale(row, now_ms).await?;
        if session.is_some() {
            self.touch_last_seen(session_token, now_ms).await?;
        }
        Ok(session)
    }

    pub async fn get_by_resume(
        &self,
        resume_token: &str,
        now_ms: i64,
    ) -> Result<Option<Session>, sqlx::Error> {
        let row = self.fetch_by("resume_token", resume_token).await?;
        self.expire_if_stale(row, now_ms).await
    }

    async fn touch_last_seen(&self, session_token: &str, now_ms: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE sessions SET last_seen_at_ms = ? WHERE session_token = ?")
            .bind(now_ms)
            .bind(session_token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fetch_by(&self, column: &str, value: &str) -> Result<Option<Session>, sqlx::Error> {
        let query = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE {column} = ?");
        let row: Option<SessionRow> = sqlx::query_as(&query).bind(value).fetch_optional(&self.pool).await?;
        Ok(row.map(row_to_session))
    }

    async fn expire_if_stale(
        &self,
        session: Option<Session>,
        now_ms: i64,
    ) -> Result<Option<Session>, sqlx::Error> {
        let Some(session) = session else { return Ok(None) };
        if session.expires_at_ms <= now_ms {
            self.invalidate_token(&session.session_token).await?;
            return Ok(None);
        }
        Ok(Some(session))
    }

    /// Atomically rotate a resume token and extend the session's TTL.
    /// Returns `None` if the token is unknown or expired.
    pub async fn consume_resume(
        &self,
        resume_token: &str,
        now_ms: i64,
    ) -> Result<Option<Session>, sqlx::Error> {
        let new_resume_token = tokens::new_resume_token();
        let expires_at_ms = now_ms + self.ttl_ms;

        let mut tx = self.pool.begin().await?;
        let query = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE resume_token = ?");
        let row: Option<SessionRow> = sqlx::query_as(&query)
            .bind(resume_token)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(existing) = row.map(row_to_session) else {
            tx.commit().await?;
            return Ok(None);
        };

        if existing.expires_at_ms <= now_ms {
            sqlx::query("DELETE FROM sessions WHERE resume_token = ?")
                .bind(resume_token)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            return Ok(None);
        }

        let result = sqlx::query(
            "UPDATE sessions SET resume_token = ?, expires_at_ms = ?, last_seen_at_ms = ? WHERE resume_token = ?",
        )
        .bind(&new_resume_token)
        .bind(expires_at_ms)
        .bind(now_ms)
        .bind(resume_token)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        if result.rows_affected() == 0 {
            // Raced with a concurrent consume of the same token.
            return Ok(None);
        }

        Ok(Some(Session {
            resume_token: new_resume_token,
            expires_at_ms,
            last_seen_at_ms: now_ms,
            ..existing
        }))
    }

    pub async fn rotate_resume(&self, session: &Session, now_ms: i64) -> Result<Session, sqlx::Error> {
        let new_token = tokens::new_resume_token();
        let expires_at_ms = now_ms + self.ttl_ms;
        sqlx::query("UPDATE sessions SET resume_token = ?, expires_at_ms = ? WHERE session_token = ?")
            .bind(&new_token)
            .bind(expires_at_ms)
            .bind(&session.session_token)
            .execute(&self.pool)
            .await?;
        Ok(Session {
            resume_token: new_token,
            expires_at_ms,
            ..session.clone()
        })
    }

    /// Sorted `(device_id asc, session_token asc)`; the caller (the
    /// request handler, which knows which session authenticated the
    /// request) prepends the `is_current desc` ordering and the
    /// `session_id`/`is_current` projection per spec §4.4.
    pub async fn list_for_user(&self, user_id: &str, now_ms: i64) -> Result<Vec<Session>, sqlx::Error> {
        sqlx::query("DELETE FROM sessions WHERE user_id = ? AND expires_at_ms <= ?")
            .bind(user_id)
            .bind(now_ms)
            .execute(&self.pool)
            .await?;
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE user_id = ? ORDER BY device_id ASC, session_token ASC"
        );
        let rows: Vec<SessionRow> = sqlx::query_as(&query).bind(user_id).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(row_to_session).collect())
    }

    pub async fn invalidate_token(&self, session_token: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM sessions WHERE session_token = ?")
            .bind(session_token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn invalidate_all_for_user(
        &self,
        user_id: &str,
        keep_session_token: Option<&str>,
    ) -> Result<u64, sqlx::Error> {
        let result = match keep_session_token {
            None => {
                sqlx::query("DELETE FROM sessions WHERE user_id = ?")
                    .bind(user_id)
                    .execute(&self.pool)
                    .await?
            },
            Some(keep) => {
                sqlx::query("DELETE FROM sessions WHERE user_id = ? AND session_token <> ?")
                    .bind(user_id)
                    .bind(keep)
                    .execute(&self.pool)
                    .await?
            },
        };
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> SessionStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        crate::run_migrations(&pool).await.unwrap();
        SessionStore::new(pool, 3_600_000)
    }

    #[tokio::test]
    async fn create_and_fetch_roundtrips() {
        let store = test_store().await;
        let session = store.create("u1", "d1", None, 0).await.unwrap();
        let fetched = store.get_by_session(&session.session_token, 1_000).await.unwrap();
        assert_eq!(fetched, Some(session));
    }

    #[tokio::test]
    async fn expired_session_is_invalidated_on_read() {
        let store = test_store().await;
        let session = store.create("u1", "d1", None, 0).await.unwrap();
        let fetched = store
            .get_by_session(&session.session_token, session.expires_at_ms + 1)
            .await
            .unwrap();
        assert!(fetched.is_none());
        assert!(
            store
                .get_by_session(&session.session_token, 0)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn consume_resume_rotates_token_and_is_single_use() {
        let store = test_store().await;
        let session = store.create("u1", "d1", None, 0).await.unwrap();
        let resumed = store.consume_resume(&session.resume_token, 1_000).await.unwrap().unwrap();
        assert_ne!(resumed.resume_token, session.resume_token);
        assert_eq!(resumed.session_token, session.session_token);

        // The old resume_token no longer resolves.
        assert!(
            store
                .consume_resume(&session.resume_token, 2_000)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn invalidate_all_for_user_can_keep_one_session() {
        let store = test_store().await;
        let keep = store.create("u1", "d1", None, 0).await.unwrap();
        store.create("u1", "d2", None, 0).await.unwrap();
        let removed = store
            .invalidate_all_for_user("u1", Some(&keep.session_token))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        let remaining = store.list_for_user("u1", 0).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].session_token, keep.session_token);
    }

    #[tokio::test]
    async fn session_id_is_not_the_raw_token() {
        let store = test_store().await;
        let session = store.create("u1", "d1", Some("cli"), 0).await.unwrap();
        assert_ne!(session.session_id(), session.session_token);
        assert_eq!(session.session_id().len(), 64);
    }
}
