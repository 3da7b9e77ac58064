//! Identity resolution: mapping an opaque `auth_token` presented at
//! `session.start` to a `user_id`.
//!
//! The gateway core does not run its own signup/password flow (spec §1 places
//! identity provisioning with external collaborators); it only needs to turn
//! a bearer credential into a `user_id` it can trust for the rest of the
//! request. `auth_token`s are treated the same way session/resume tokens are:
//! opaque, high-entropy, and stored hashed so a database leak does not hand
//! out live credentials.

use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

fn hash_token(auth_token: &str) -> String {
    let digest = Sha256::digest(auth_token.as_bytes());
    format!("{digest:x}")
}

#[derive(Clone)]
pub struct IdentityStore {
    pool: SqlitePool,
}

impl IdentityStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Resolve `auth_token` to the `user_id` it was provisioned for, if any.
    pub async fn resolve(&self, auth_token: &str) -> Result<Option<String>, IdentityError> {
        let token_hash = hash_token(auth_token);
        let row: Option<(String,)> =
            sqlx::query_as("SELECT user_id FROM identities WHERE auth_token_hash = ?")
                .bind(token_hash)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(user_id,)| user_id))
    }

    /// Provision (or reassign) an `auth_token` for `user_id`. Idempotent.
    pub async fn provision(&self, user_id: &str, auth_token: &str) -> Result<(), IdentityError> {
        let token_hash = hash_token(auth_token);
        sqlx::query(
            "INSERT INTO identities (auth_token_hash, user_id) VALUES (?, ?)
             ON CONFLICT(auth_token_hash) DO UPDATE SET user_id = excluded.user_id",
        )
        .bind(token_hash)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::query(
            "CREATE TABLE identities (
                auth_token_hash TEXT PRIMARY KEY,
                user_id TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .unwrap();
        pool
    }

    #[tokio::test]
    async fn resolves_provisioned_token() {
        let store = IdentityStore::new(test_pool().await);
        store.provision("u_alice", "secret-token").await.unwrap();
        assert_eq!(
            store.resolve("secret-token").await.unwrap(),
            Some("u_alice".to_string())
        );
        assert_eq!(store.resolve("unknown-token").await.unwrap(), None);
    }

    #[tokio::test]
    async fn reprovisioning_reassigns_owner() {
        let store = IdentityStore::new(test_pool().await);
        store.provision("u_alice", "shared-token").await.unwrap();
        store.provision("u_bob", "shared-token").await.unwrap();
        assert_eq!(
            store.resolve("shared-token").await.unwrap(),
            Some("u_bob".to_string())
        );
    }
}
