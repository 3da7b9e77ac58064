//! The signed, prev-hash-linked per-user social event chain (spec §4.8,
//! SPEC_FULL §9.7).
//!
//! Every event's `event_hash` is the SHA-256 of the canonical JSON of
//! `{kind, payload, prev_hash, ts_ms, user_id}` (`prev_hash` is `""` for a
//! chain head); the signature in `sig_b64` is verified over the same bytes
//! against the Ed25519 public key encoded (base64url, no padding) in
//! `user_id` itself — there is no separate key registration step. A
//! per-user lock (the row in `social_chain_heads`, mutated inside the same
//! transaction that inserts the event) makes the head-check-then-append
//! atomic, so concurrent publishes from the same user can't both observe
//! the same head and fork the chain.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;
use thiserror::Error;

use convgw_auth::crypto;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SocialEvent {
    pub user_id: String,
    pub prev_hash: String,
    pub ts_ms: i64,
    pub kind: String,
    pub payload: Value,
    pub sig_b64: String,
    pub event_hash: String,
}

#[derive(Debug, Error)]
pub enum SocialChainError {
    #[error("event exceeds max_social_event_bytes")]
    TooLarge,
    #[error("prev_hash does not match chain head")]
    PrevHashMismatch,
    #[error("signature verification failed")]
    InvalidSignature,
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

impl From<crypto::CryptoError> for SocialChainError {
    fn from(_: crypto::CryptoError) -> Self {
        SocialChainError::InvalidSignature
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProfileView {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub banner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interests: Option<Value>,
    pub friends: Vec<String>,
    pub latest_posts: Vec<SocialEvent>,
}

#[derive(Debug, Clone)]
pub struct FeedPage {
    pub items: Vec<SocialEvent>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FeedCursor {
    ts: i64,
    id: String,
}

fn encode_cursor(ts_ms: i64, event_hash: &str) -> String {
    let cursor = FeedCursor { ts: ts_ms, id: event_hash.to_string() };
    let json = serde_json::to_vec(&cursor).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(json)
}

fn decode_cursor(cursor: &str) -> Option<(i64, String)> {
    let bytes = URL_SAFE_NO_PAD.decode(cursor).ok()?;
    let parsed: FeedCursor = serde_json::from_slice(&bytes).ok()?;
    Some((parsed.ts, parsed.id))
}

const PROFILE_KINDS: [&str; 5] = ["username", "description", "avatar", "banner", "interests"];

#[derive(Clone)]
pub struct SocialChain {
    pool: SqlitePool,
    max_event_bytes: usize,
}

impl SocialChain {
    pub fn new(pool: SqlitePool, max_event_bytes: usize) -> Self {
        Self { pool, max_event_bytes }
    }

    fn canonical_message(
        kind: &str,
        payload: &Value,
        prev_hash: &str,
        ts_ms: i64,
        user_id: &str,
    ) -> Result<Vec<u8>, SocialChainError> {
        let value = serde_json::json!({
            "kind": kind,
            "payload": payload,
            "prev_hash": prev_hash,
            "ts_ms": ts_ms,
            "user_id": user_id,
        });
        Ok(crypto::canonical_json(&value)?)
    }

    pub async fn publish(
        &self,
        user_id: &str,
        prev_hash: Option<&str>,
        ts_ms: i64,
        kind: &str,
        payload: Value,
        sig_b64: &str,
    ) -> Result<SocialEvent, SocialChainError> {
        let prev_hash = prev_hash.unwrap_or("").to_string();
        let canonical = Self::canonical_message(kind, &payload, &prev_hash, ts_ms, user_id)?;
        if canonical.len() > self.max_event_bytes {
            return Err(SocialChainError::TooLarge);
        }
        crypto::verify_signature(user_id, &canonical, sig_b64)?;
        let event_hash = crypto::sha256_hex(&canonical);

        let mut tx = self.pool.begin().await?;
        let current_head: Option<(String,)> =
            sqlx::query_as("SELECT head_hash FROM social_chain_heads WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await?;
        let current_head = current_head.map(|(h,)| h).unwrap_or_default();
        if current_head != prev_hash {
            tx.rollback().await.ok();
            return Err(SocialChainError::PrevHashMismatch);
        }

        let payload_json = serde_json::to_string(&payload).unwrap_or_else(|_| "null".to_string());
        sqlx::query(
            "INSERT INTO social_events (event_hash, user_id, prev_hash, ts_ms, kind, payload_json, sig_b64)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event_hash)
        .bind(user_id)
        .bind(&prev_hash)
        .bind(ts_ms)
        .bind(kind)
        .bind(&payload_json)
        .bind(sig_b64)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO social_chain_heads (user_id, head_hash) VALUES (?, ?)
             ON CONFLICT(user_id) DO UPDATE SET head_hash = excluded.head_hash",
        )
        .bind(user_id)
        .bind(&event_hash)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(SocialEvent {
            user_id: user_id.to_string(),
            prev_hash,
            ts_ms,
            kind: kind.to_string(),
            payload,
            sig_b64: sig_b64.to_string(),
            event_hash,
        })
    }

    pub async fn get(&self, event_hash: &str) -> Result<Option<SocialEvent>, sqlx::Error> {
        let row: Option<(String, String, i64, String, String, String)> = sqlx::query_as(
            "SELECT user_id, prev_hash, ts_ms, kind, payload_json, sig_b64
             FROM social_events WHERE event_hash = ?",
        )
        .bind(event_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(user_id, prev_hash, ts_ms, kind, payload_json, sig_b64)| SocialEvent {
            user_id,
            prev_hash,
            ts_ms,
            kind,
            payload: serde_json::from_str(&payload_json).unwrap_or(Value::Null),
            sig_b64,
            event_hash: event_hash.to_string(),
        }))
    }

    pub async fn list(
        &self,
        user_id: &str,
        after_hash: Option<&str>,
        limit: i64,
    ) -> Result<Vec<SocialEvent>, sqlx::Error> {
        let cursor = match after_hash {
            Some(hash) => {
                let row: Option<(i64,)> = sqlx::query_as(
                    "SELECT ts_ms FROM social_events WHERE user_id = ? AND event_hash = ?",
                )
                .bind(user_id)
                .bind(hash)
                .fetch_optional(&self.pool)
                .await?;
                row.map(|(ts,)| (ts, hash.to_string()))
            },
            None => None,
        };

        let rows: Vec<(String, String, i64, String, String, String)> = match cursor {
            Some((ts, hash)) => {
                sqlx::query_as(
                    "SELECT event_hash, prev_hash, ts_ms, kind, payload_json, sig_b64
                     FROM social_events
                     WHERE user_id = ? AND (ts_ms, event_hash) > (?, ?)
                     ORDER BY ts_ms ASC, event_hash ASC LIMIT ?",
                )
                .bind(user_id)
                .bind(ts)
                .bind(hash)
                .bind(limit.max(0))
                .fetch_all(&self.pool)
                .await?
            },
            None => {
                sqlx::query_as(
                    "SELECT event_hash, prev_hash, ts_ms, kind, payload_json, sig_b64
                     FROM social_events WHERE user_id = ?
                     ORDER BY ts_ms ASC, event_hash ASC LIMIT ?",
                )
                .bind(user_id)
                .bind(limit.max(0))
                .fetch_all(&self.pool)
                .await?
            },
        };

        Ok(rows
            .into_iter()
            .map(|(event_hash, prev_hash, ts_ms, kind, payload_json, sig_b64)| {
                let payload: Value = serde_json::from_str(&payload_json).unwrap_or(Value::Null);
                SocialEvent {
                    user_id: user_id.to_string(),
                    prev_hash,
                    ts_ms,
                    kind,
                    payload,
                    sig_b64,
                    event_hash,
                }
            })
            .collect())
    }

    /// Last-writer-wins projection of the chain into profile fields, plus
    /// mutual-free follow-derived `friends` and the newest `limit` posts.
    pub async fn profile(&self, user_id: &str, limit: i64) -> Result<ProfileView, sqlx::Error> {
        let mut view = ProfileView::default();

        for kind in PROFILE_KINDS {
            let row: Option<(String,)> = sqlx::query_as(
                "SELECT payload_json FROM social_events
                 WHERE user_id = ? AND kind = ?
                 ORDER BY ts_ms DESC, event_hash DESC LIMIT 1",
            )
            .bind(user_id)
            .bind(kind)
            .fetch_optional(&self.pool)
            .await?;
            let Some((payload_json,)) = row else { continue };
            let payload: Value = serde_json::from_str(&payload_json).unwrap_or(Value::Null);
            let text = || payload.get("value").and_then(Value::as_str).map(str::to_string);
            match kind {
                "username" => view.username = text(),
                "description" => view.description = text(),
                "avatar" => view.avatar = text(),
                "banner" => view.banner = text(),
                "interests" => view.interests = Some(payload),
                _ => unreachable!(),
            }
        }

        view.friends = self.friends(user_id).await?;

        let post_rows: Vec<(String, String, i64, String, String)> = sqlx::query_as(
            "SELECT event_hash, prev_hash, ts_ms, payload_json, sig_b64
             FROM social_events WHERE user_id = ? AND kind = 'post'
             ORDER BY ts_ms DESC, event_hash DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;
        view.latest_posts = post_rows
            .into_iter()
            .map(|(event_hash, prev_hash, ts_ms, payload_json, sig_b64)| SocialEvent {
                user_id: user_id.to_string(),
                prev_hash,
                ts_ms,
                kind: "post".to_string(),
                payload: serde_json::from_str(&payload_json).unwrap_or(Value::Null),
                sig_b64,
                event_hash,
            })
            .collect();

        Ok(view)
    }

    /// Targets whose latest `follow` event (by `(ts_ms, event_hash)`) has
    /// `following: true`.
    async fn friends(&self, user_id: &str) -> Result<Vec<String>, sqlx::Error> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT payload_json FROM social_events
             WHERE user_id = ? AND kind = 'follow'
             ORDER BY ts_ms ASC, event_hash ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        let mut latest: std::collections::BTreeMap<String, bool> = std::collections::BTreeMap::new();
        for (payload_json,) in rows {
            let payload: Value = serde_json::from_str(&payload_json).unwrap_or(Value::Null);
            let (Some(target), Some(following)) = (
                payload.get("target_user_id").and_then(Value::as_str),
                payload.get("following").and_then(Value::as_bool),
            ) else {
                continue;
            };
            latest.insert(target.to_string(), following);
        }
        Ok(latest
            .into_iter()
            .filter_map(|(target, following)| following.then_some(target))
            .collect())
    }

    /// Union of self-posts and posts by followed users, newest first,
    /// paginated by a base64url-JSON `{ts, id}` cursor.
    pub async fn feed(
        &self,
        user_id: &str,
        limit: i64,
        cursor: Option<&str>,
    ) -> Result<FeedPage, sqlx::Error> {
        let limit = limit.max(0);
        let mut authors = self.friends(user_id).await?;
        authors.push(user_id.to_string());

        let placeholders = authors.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let decoded = cursor.and_then(decode_cursor);

        let query = if decoded.is_some() {
            format!(
                "SELECT event_hash, user_id, prev_hash, ts_ms, payload_json, sig_b64
                 FROM social_events WHERE kind = 'post' AND user_id IN ({placeholders})
                 AND (ts_ms, event_hash) < (?, ?)
                 ORDER BY ts_ms DESC, event_hash DESC LIMIT ?"
            )
        } else {
            format!(
                "SELECT event_hash, user_id, prev_hash, ts_ms, payload_json, sig_b64
                 FROM social_events WHERE kind = 'post' AND user_id IN ({placeholders})
                 ORDER BY ts_ms DESC, event_hash DESC LIMIT ?"
            )
        };

        let mut q = sqlx::query_as(&query);
        for author in &authors {
            q = q.bind(author);
        }
        if let Some((ts, id)) = &decoded {
            q = q.bind(*ts).bind(id.clone());
        }
        q = q.bind(limit + 1);

        let rows: Vec<(String, String, String, i64, String, String)> = q.fetch_all(&self.pool).await?;
        let has_more = rows.len() as i64 > limit;
        let mut items: Vec<SocialEvent> = rows
            .into_iter()
            .take(limit as usize)
            .map(|(event_hash, user_id, prev_hash, ts_ms, payload_json, sig_b64)| SocialEvent {
                user_id,
                prev_hash,
                ts_ms,
                kind: "post".to_string(),
                payload: serde_json::from_str(&payload_json).unwrap_or(Value::Null),
                sig_b64,
                event_hash,
            })
            .collect();

        let next_cursor = if has_more {
            items.last().map(|e| encode_cursor(e.ts_ms, &e.event_hash))
        } else {
            None
        };
        items.truncate(limit as usize);

        Ok(FeedPage { items, next_cursor })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::Signer;

    struct Signer2 {
        signing_key: ed25519_dalek::SigningKey,
        user_id: String,
    }

    fn new_signer() -> Signer2 {
        let signing_key = ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng);
        let user_id = URL_SAFE_NO_PAD.encode(signing_key.verifying_key().to_bytes());
        Signer2 { signing_key, user_id }
    }

    async fn test_chain() -> SocialChain {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        crate::run_migrations(&pool).await.unwrap();
        SocialChain::new(pool, 65_536)
    }

    async fn publish_signed(
        chain: &SocialChain,
        signer: &Signer2,
        prev_hash: Option<&str>,
        ts_ms: i64,
        kind: &str,
        payload: Value,
    ) -> SocialEvent {
        let canonical =
            SocialChain::canonical_message(kind, &payload, prev_hash.unwrap_or(""), ts_ms, &signer.user_id)
                .unwrap();
        let sig = signer.signing_key.sign(&canonical);
        let sig_b64 = base64::engine::general_purpose::STANDARD.encode(sig.to_bytes());
        chain
            .publish(&signer.user_id, prev_hash, ts_ms, kind, payload, &sig_b64)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn publish_rejects_mismatched_prev_hash() {
        let chain = test_chain().await;
        let signer = new_signer();
        publish_signed(&chain, &signer, None, 10, "post", serde_json::json!({"text": "one"})).await;
        let canonical =
            SocialChain::canonical_message("post", &serde_json::json!({"text": "two"}), "bogus", 20, &signer.user_id)
                .unwrap();
        let sig = signer.signing_key.sign(&canonical);
        let sig_b64 = base64::engine::general_purpose::STANDARD.encode(sig.to_bytes());
        let err = chain
            .publish(&signer.user_id, Some("bogus"), 20, "post", serde_json::json!({"text": "two"}), &sig_b64)
            .await
            .unwrap_err();
        assert!(matches!(err, SocialChainError::PrevHashMismatch));
    }

    #[tokio::test]
    async fn publish_chains_and_profile_is_last_writer_wins() {
        let chain = test_chain().await;
        let signer = new_signer();
        publish_signed(&chain, &signer, None, 10, "username", serde_json::json!({"value": "a"})).await;
        let e1 = publish_signed(&chain, &signer, None, 10, "post", serde_json::json!({"text": "one"})).await;
        // username@t1=a, username@t2=b where t2 > t1
        let head = chain
            .list(&signer.user_id, None, 10)
            .await
            .unwrap()
            .last()
            .unwrap()
            .event_hash
            .clone();
        assert_eq!(head, e1.event_hash);
        let e2 = publish_signed(
            &chain,
            &signer,
            Some(&e1.event_hash),
            20,
            "username",
            serde_json::json!({"value": "b"}),
        )
        .await;
        assert_ne!(e2.event_hash, e1.event_hash);

        let profile = chain.profile(&signer.user_id, 10).await.unwrap();
        assert_eq!(profile.username, Some("b".to_string()));
        assert_eq!(profile.latest_posts[0].payload["text"], "one");
    }

    #[tokio::test]
    async fn feed_includes_self_and_followed_posts() {
        let chain = test_chain().await;
        let alice = new_signer();
        let bob = new_signer();
        let e1 = publish_signed(&chain, &alice, None, 10, "post", serde_json::json!({"text": "alice1"})).await;
        publish_signed(
            &chain,
            &alice,
            Some(&e1.event_hash),
            20,
            "follow",
            serde_json::json!({"target_user_id": bob.user_id, "following": true}),
        )
        .await;
        publish_signed(&chain, &bob, None, 15, "post", serde_json::json!({"text": "bob1"})).await;

        let feed = chain.feed(&alice.user_id, 10, None).await.unwrap();
        let texts: Vec<&str> = feed.items.iter().map(|e| e.payload["text"].as_str().unwrap()).collect();
        assert_eq!(texts, vec!["alice1", "bob1"]);
    }
}
