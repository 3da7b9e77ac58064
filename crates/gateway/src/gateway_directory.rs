//! Static gateway directory: `gateway_id → gateway_url` lookup backing
//! `GET /v1/gateways/resolve` (spec §6.1 "Infrastructure").
//!
//! The directory is seeded once at startup from a JSON file (spec §4's
//! "home gateway" concept needs somewhere to resolve a peer gateway's URL;
//! the core itself never federates) and served out of the same durable
//! backend as everything else rather than re-reading the file per request.

use std::path::Path;

use serde::Deserialize;
use sqlx::SqlitePool;

#[derive(Clone)]
pub struct GatewayDirectory {
    pool: SqlitePool,
}

#[derive(Debug, Deserialize)]
struct DirectoryFile {
    gateways: Vec<DirectoryEntry>,
}

#[derive(Debug, Deserialize)]
struct DirectoryEntry {
    gateway_id: String,
    gateway_url: String,
}

impl GatewayDirectory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn resolve(&self, gateway_id: &str) -> Result<Option<String>, sqlx::Error> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT gateway_url FROM gateway_directory WHERE gateway_id = ?")
                .bind(gateway_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(url,)| url))
    }

    pub async fn upsert(&self, gateway_id: &str, gateway_url: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO gateway_directory (gateway_id, gateway_url) VALUES (?, ?)
             ON CONFLICT(gateway_id) DO UPDATE SET gateway_url = excluded.gateway_url",
        )
        .bind(gateway_id)
        .bind(gateway_url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Load a static directory file (best-effort: a missing or malformed
    /// file is a startup warning, not a fatal error — the directory is an
    /// optional convenience, not load-bearing for the core's own traffic).
    pub async fn load_from_file(&self, path: impl AsRef<Path>) -> convgw_common::Result<usize> {
        let raw = std::fs::read_to_string(path)?;
        let parsed: DirectoryFile = serde_json::from_str(&raw).map_err(convgw_common::Error::other)?;
        let count = parsed.gateways.len();
        for entry in parsed.gateways {
            self.upsert(&entry.gateway_id, &entry.gateway_url).await.map_err(convgw_common::Error::other)?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_directory() -> GatewayDirectory {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        crate::run_migrations(&pool).await.unwrap();
        GatewayDirectory::new(pool)
    }

    #[tokio::test]
    async fn resolve_returns_none_for_unknown_gateway() {
        let dir = test_directory().await;
        assert_eq!(dir.resolve("gw-unknown").await.unwrap(), None);
    }

    #[tokio::test]
    async fn upsert_then_resolve_round_trips() {
        let dir = test_directory().await;
        dir.upsert("gw1", "https://gw1.example.com").await.unwrap();
        assert_eq!(
            dir.resolve("gw1").await.unwrap(),
            Some("https://gw1.example.com".to_string())
        );
        dir.upsert("gw1", "https://gw1-v2.example.com").await.unwrap();
        assert_eq!(
            dir.resolve("gw1").await.unwrap(),
            Some("https://gw1-v2.example.com".to_string())
        );
    }
}
