//! Conversation store: membership, roles, bans, per-member view state
//! (spec §4.5).

use std::collections::BTreeSet;

use serde::Serialize;
use sqlx::SqlitePool;
use thiserror::Error;

use crate::rate_limiter::{Action, RateLimiter, hash_key};

pub const MAX_MEMBERS_PER_CONV: i64 = 1024;
pub const MAX_INLINE_MEMBERS: usize = 20;
const MAX_CONVERSATION_TITLE_LEN: usize = 64;
const MAX_CONVERSATION_LABEL_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Admin,
    Member,
}

impl Role {
    fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Admin => "admin",
            Role::Member => "member",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(Role::Owner),
            "admin" => Some(Role::Admin),
            "member" => Some(Role::Member),
            _ => None,
        }
    }

    fn is_admin_or_owner(&self) -> bool {
        matches!(self, Role::Owner | Role::Admin)
    }
}

#[derive(Debug, Error)]
pub enum ConvStoreError {
    #[error("conversation already exists")]
    AlreadyExists,
    #[error("unknown conversation")]
    UnknownConversation,
    #[error("forbidden")]
    Forbidden,
    #[error("member is banned")]
    Banned,
    #[error("too many members")]
    TooManyMembers,
    #[error("title too long")]
    TitleTooLong,
    #[error("label too long")]
    LabelTooLong,
    #[error("rate limit exceeded")]
    RateLimitExceeded,
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct MemberRow {
    pub user_id: String,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationRow {
    pub conv_id: String,
    pub role: Role,
    pub created_at_ms: i64,
    pub home_gateway: String,
    pub member_count: i64,
    pub title: String,
    pub label: String,
    pub pinned: bool,
    pub pinned_at_ms: i64,
    pub muted: bool,
    pub archived: bool,
    pub latest_seq: Option<i64>,
    pub earliest_seq: Option<i64>,
    pub latest_ts_ms: Option<i64>,
    pub last_read_seq: Option<i64>,
    pub unread_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub members: Option<Vec<String>>,
}

fn normalize_title(title: &str) -> Result<String, ConvStoreError> {
    let collapsed = title.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() > MAX_CONVERSATION_TITLE_LEN {
        return Err(ConvStoreError::TitleTooLong);
    }
    Ok(collapsed)
}

fn normalize_label(label: &str) -> Result<String, ConvStoreError> {
    let trimmed = label.trim().to_string();
    if trimmed.chars().count() > MAX_CONVERSATION_LABEL_LEN {
        return Err(ConvStoreError::LabelTooLong);
    }
    Ok(trimmed)
}

#[derive(Clone)]
pub struct ConversationStore {
    pool: SqlitePool,
    invite_limits: RateLimiter,
    remove_limits: RateLimiter,
}

impl ConversationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            invite_limits: RateLimiter::new(60, u32::MAX, u32::MAX),
            remove_limits: RateLimiter::new(60, u32::MAX, u32::MAX),
        }
    }

    pub async fn create(
        &self,
        conv_id: &str,
        owner_user_id: &str,
        members: &[String],
        home_gateway: &str,
        now_ms: i64,
    ) -> Result<(), ConvStoreError> {
        let mut member_set: BTreeSet<String> = members.iter().cloned().collect();
        member_set.insert(owner_user_id.to_string());
        if member_set.len() as i64 > MAX_MEMBERS_PER_CONV {
            return Err(ConvStoreError::TooManyMembers);
        }

        let mut tx = self.pool.begin().await?;
        let existing: Option<(String,)> =
            sqlx::query_as("SELECT conv_id FROM conversations WHERE conv_id = ?")
                .bind(conv_id)
                .fetch_optional(&mut *tx)
                .await?;
        if existing.is_some() {
            tx.rollback().await.ok();
            return Err(ConvStoreError::AlreadyExists);
        }

        sqlx::query(
            "INSERT INTO conversations (conv_id, owner_user_id, created_at_ms, home_gateway, title)
             VALUES (?, ?, ?, ?, '')",
        )
        .bind(conv_id)
        .bind(owner_user_id)
        .bind(now_ms)
        .bind(home_gateway)
        .execute(&mut *tx)
        .await?;

        for member in &member_set {
            let role = if member == owner_user_id { Role::Owner } else { Role::Member };
            sqlx::query("INSERT INTO conversation_members (conv_id, user_id, role) VALUES (?, ?, ?)")
                .bind(conv_id)
                .bind(member)
                .bind(role.as_str())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn require_owner_and_role(
        &self,
        conv_id: &str,
    ) -> Result<String, ConvStoreError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT owner_user_id FROM conversations WHERE conv_id = ?")
                .bind(conv_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(owner,)| owner).ok_or(ConvStoreError::UnknownConversation)
    }

    async fn require_admin(&self, conv_id: &str, actor_user_id: &str) -> Result<(), ConvStoreError> {
        self.require_owner_and_role(conv_id).await?;
        let role = self.role(conv_id, actor_user_id).await?;
        match role {
            Some(r) if r.is_admin_or_owner() => Ok(()),
            _ => Err(ConvStoreError::Forbidden),
        }
    }

    async fn require_owner(&self, conv_id: &str, actor_user_id: &str) -> Result<(), ConvStoreError> {
        let owner = self.require_owner_and_role(conv_id).await?;
        if owner != actor_user_id {
            return Err(ConvStoreError::Forbidden);
        }
        Ok(())
    }

    pub async fn invite(
        &self,
        conv_id: &str,
        actor_user_id: &str,
        members: &[String],
    ) -> Result<(), ConvStoreError> {
        self.require_admin(conv_id, actor_user_id).await?;
        let limit_key = hash_key(&format!("{conv_id}:{actor_user_id}"));
        if matches!(
            self.invite_limits.check(Action::ConvSend, limit_key),
            crate::rate_limiter::Decision::Denied { .. }
        ) {
            return Err(ConvStoreError::RateLimitExceeded);
        }

        let mut tx = self.pool.begin().await?;
        let existing: Vec<(String,)> =
            sqlx::query_as("SELECT user_id FROM conversation_members WHERE conv_id = ?")
                .bind(conv_id)
                .fetch_all(&mut *tx)
                .await?;
        let existing_set: BTreeSet<String> = existing.into_iter().map(|(u,)| u).collect();

        let banned: Vec<(String,)> =
            sqlx::query_as("SELECT user_id FROM conversation_bans WHERE conv_id = ?")
                .bind(conv_id)
                .fetch_all(&mut *tx)
                .await?;
        let banned_set: BTreeSet<String> = banned.into_iter().map(|(u,)| u).collect();
        for member in members {
            if banned_set.contains(member) {
                tx.rollback().await.ok();
                return Err(ConvStoreError::Banned);
            }
        }

        let new_members: BTreeSet<String> = members
            .iter()
            .filter(|m| !existing_set.contains(*m))
            .cloned()
            .collect();
        if (existing_set.len() + new_members.len()) as i64 > MAX_MEMBERS_PER_CONV {
            tx.rollback().await.ok();
            return Err(ConvStoreError::TooManyMembers);
        }
        for member in &new_members {
            sqlx::query(
                "INSERT OR IGNORE INTO conversation_members (conv_id, user_id, role) VALUES (?, ?, 'member')",
            )
            .bind(conv_id)
            .bind(member)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn remove(
        &self,
        conv_id: &str,
        actor_user_id: &str,
        members: &[String],
    ) -> Result<(), ConvStoreError> {
        let owner = self.require_admin_with_owner(conv_id, actor_user_id).await?;
        let limit_key = hash_key(&format!("{conv_id}:{actor_user_id}"));
        if matches!(
            self.remove_limits.check(Action::ConvSend, limit_key),
            crate::rate_limiter::Decision::Denied { .. }
        ) {
            return Err(ConvStoreError::RateLimitExceeded);
        }
        for member in members {
            if member == &owner {
                continue;
            }
            sqlx::query("DELETE FROM conversation_members WHERE conv_id = ? AND user_id = ?")
                .bind(conv_id)
                .bind(member)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn require_admin_with_owner(
        &self,
        conv_id: &str,
        actor_user_id: &str,
    ) -> Result<String, ConvStoreError> {
        let owner = self.require_owner_and_role(conv_id).await?;
        let role = self.role(conv_id, actor_user_id).await?;
        match role {
            Some(r) if r.is_admin_or_owner() => Ok(owner),
            _ => Err(ConvStoreError::Forbidden),
        }
    }

    pub async fn ban(
        &self,
        conv_id: &str,
        actor_user_id: &str,
        members: &[String],
        now_ms: i64,
    ) -> Result<(), ConvStoreError> {
        let owner = self.require_admin_with_owner(conv_id, actor_user_id).await?;
        let mut tx = self.pool.begin().await?;
        for member in members {
            if member == &owner {
                continue;
            }
            sqlx::query("DELETE FROM conversation_members WHERE conv_id = ? AND user_id = ?")
                .bind(conv_id)
                .bind(member)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "INSERT INTO conversation_bans (conv_id, user_id, banned_by_user_id, banned_at_ms)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT(conv_id, user_id) DO UPDATE SET
                     banned_by_user_id = excluded.banned_by_user_id,
                     banned_at_ms = excluded.banned_at_ms",
            )
            .bind(conv_id)
            .bind(member)
            .bind(actor_user_id)
            .bind(now_ms)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn unban(
        &self,
        conv_id: &str,
        actor_user_id: &str,
        members: &[String],
    ) -> Result<(), ConvStoreError> {
        self.require_admin(conv_id, actor_user_id).await?;
        for member in members {
            sqlx::query("DELETE FROM conversation_bans WHERE conv_id = ? AND user_id = ?")
                .bind(conv_id)
                .bind(member)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    pub async fn is_banned(&self, conv_id: &str, user_id: &str) -> Result<bool, sqlx::Error> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM conversation_bans WHERE conv_id = ? AND user_id = ?")
                .bind(conv_id)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    pub async fn list_bans(&self, conv_id: &str) -> Result<Vec<String>, ConvStoreError> {
        if !self.is_known(conv_id).await? {
            return Err(ConvStoreError::UnknownConversation);
        }
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT user_id FROM conversation_bans WHERE conv_id = ? ORDER BY user_id ASC")
                .bind(conv_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(u,)| u).collect())
    }

    /// Admin-gated room moderation mute: distinct from the self-service
    /// `set_muted` (a member silencing their own notifications for a
    /// conversation they stay fully active in).
    pub async fn mute_members(
        &self,
        conv_id: &str,
        actor_user_id: &str,
        members: &[String],
        now_ms: i64,
    ) -> Result<(), ConvStoreError> {
        self.require_admin(conv_id, actor_user_id).await?;
        let mut tx = self.pool.begin().await?;
        for member in members {
            sqlx::query(
                "INSERT INTO conversation_member_mutes (conv_id, user_id, muted_by_user_id, muted_at_ms)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT(conv_id, user_id) DO UPDATE SET
                     muted_by_user_id = excluded.muted_by_user_id,
                     muted_at_ms = excluded.muted_at_ms",
            )
            .bind(conv_id)
            .bind(member)
            .bind(actor_user_id)
            .bind(now_ms)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn unmute_members(
        &self,
        conv_id: &str,
        actor_user_id: &str,
        members: &[String],
    ) -> Result<(), ConvStoreError> {
        self.require_admin(conv_id, actor_user_id).await?;
        for member in members {
            sqlx::query("DELETE FROM conversation_member_mutes WHERE conv_id = ? AND user_id = ?")
                .bind(conv_id)
                .bind(member)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    pub async fn list_muted_members(&self, conv_id: &str) -> Result<Vec<String>, ConvStoreError> {
        if !self.is_known(conv_id).await? {
            return Err(ConvStoreError::UnknownConversation);
        }
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT user_id FROM conversation_member_mutes WHERE conv_id = ? ORDER BY user_id ASC",
        )
        .bind(conv_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(u,)| u).collect())
    }

    pub async fn promote_admin(
        &self,
        conv_id: &str,
        actor_user_id: &str,
        members: &[String],
    ) -> Result<(), ConvStoreError> {
        let owner = self.require_owner_and_role(conv_id).await?;
        self.require_owner(conv_id, actor_user_id).await?;
        for member in members {
            if member == &owner {
                continue;
            }
            sqlx::query("UPDATE conversation_members SET role = 'admin' WHERE conv_id = ? AND user_id = ?")
                .bind(conv_id)
                .bind(member)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    pub async fn demote_admin(
        &self,
        conv_id: &str,
        actor_user_id: &str,
        members: &[String],
    ) -> Result<(), ConvStoreError> {
        let owner = self.require_owner_and_role(conv_id).await?;
        self.require_owner(conv_id, actor_user_id).await?;
        for member in members {
            if member == &owner {
                continue;
            }
            sqlx::query(
                "UPDATE conversation_members SET role = 'member' WHERE conv_id = ? AND user_id = ? AND role = 'admin'",
            )
            .bind(conv_id)
            .bind(member)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn is_member(&self, conv_id: &str, user_id: &str) -> Result<bool, sqlx::Error> {
        Ok(self.role(conv_id, user_id).await?.is_some())
    }

    pub async fn role(&self, conv_id: &str, user_id: &str) -> Result<Option<Role>, sqlx::Error> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT role FROM conversation_members WHERE conv_id = ? AND user_id = ?")
                .bind(conv_id)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|(r,)| Role::from_str(&r)))
    }

    pub async fn is_known(&self, conv_id: &str) -> Result<bool, sqlx::Error> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM conversations WHERE conv_id = ?")
            .bind(conv_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn set_title(
        &self,
        conv_id: &str,
        actor_user_id: &str,
        title: &str,
    ) -> Result<(), ConvStoreError> {
        self.require_admin(conv_id, actor_user_id).await?;
        let normalized = normalize_title(title)?;
        sqlx::query("UPDATE conversations SET title = ? WHERE conv_id = ?")
            .bind(normalized)
            .bind(conv_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_label(
        &self,
        conv_id: &str,
        user_id: &str,
        label: &str,
        now_ms: i64,
    ) -> Result<(), ConvStoreError> {
        if !self.is_member(conv_id, user_id).await? {
            return Err(ConvStoreError::Forbidden);
        }
        let normalized = normalize_label(label)?;
        sqlx::query(
            "INSERT INTO conversation_user_meta (conv_id, user_id, label, pinned, pinned_at_ms, updated_at_ms)
             VALUES (?, ?, ?, 0, 0, ?)
             ON CONFLICT(conv_id, user_id) DO UPDATE SET
                 label = excluded.label, updated_at_ms = excluded.updated_at_ms",
        )
        .bind(conv_id)
        .bind(user_id)
        .bind(normalized)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_pinned(
        &self,
        conv_id: &str,
        user_id: &str,
        pinned: bool,
        now_ms: i64,
    ) -> Result<(), ConvStoreError> {
        if !self.is_member(conv_id, user_id).await? {
            return Err(ConvStoreError::Forbidden);
        }
        let pinned_at_ms = if pinned { now_ms } else { 0 };
        sqlx::query(
            "INSERT INTO conversation_user_meta (conv_id, user_id, label, pinned, pinned_at_ms, updated_at_ms)
             VALUES (?, ?, '', ?, ?, ?)
             ON CONFLICT(conv_id, user_id) DO UPDATE SET
                 pinned = excluded.pinned, pinned_at_ms = excluded.pinned_at_ms, updated_at_ms = excluded.updated_at_ms",
        )
        .bind(conv_id)
        .bind(user_id)
        .bind(pinned)
        .bind(pinned_at_ms)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_muted(
        &self,
        conv_id: &str,
        user_id: &str,
        muted: bool,
        now_ms: i64,
    ) -> Result<(), ConvStoreError> {
        if !self.is_member(conv_id, user_id).await? {
            return Err(ConvStoreError::Forbidden);
        }
        sqlx::query(
            "INSERT INTO conversation_user_meta (conv_id, user_id, label, pinned, pinned_at_ms, muted, archived, updated_at_ms)
             VALUES (?, ?, '', 0, 0, ?, 0, ?)
             ON CONFLICT(conv_id, user_id) DO UPDATE SET
                 muted = excluded.muted, updated_at_ms = excluded.updated_at_ms",
        )
        .bind(conv_id)
        .bind(user_id)
        .bind(muted)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_archived(
        &self,
        conv_id: &str,
        user_id: &str,
        archived: bool,
        now_ms: i64,
    ) -> Result<(), ConvStoreError> {
        if !self.is_member(conv_id, user_id).await? {
            return Err(ConvStoreError::Forbidden);
        }
        sqlx::query(
            "INSERT INTO conversation_user_meta (conv_id, user_id, label, pinned, pinned_at_ms, muted, archived, updated_at_ms)
             VALUES (?, ?, '', 0, 0, 0, ?, ?)
             ON CONFLICT(conv_id, user_id) DO UPDATE SET
                 archived = excluded.archived, updated_at_ms = excluded.updated_at_ms",
        )
        .bind(conv_id)
        .bind(user_id)
        .bind(archived)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Marks every conversation `user_id` belongs to as read up to each
    /// conversation's latest seq, regardless of archived status (an
    /// archived conversation still accrues unread state and is still
    /// covered by "mark everything read").
    pub async fn mark_all_read(&self, user_id: &str, now_ms: i64) -> Result<usize, ConvStoreError> {
        let conv_ids: Vec<(String,)> =
            sqlx::query_as("SELECT conv_id FROM conversation_members WHERE user_id = ?")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;
        let mut updated = 0usize;
        for (conv_id,) in conv_ids {
            let bounds: Option<(Option<i64>, Option<i64>)> = sqlx::query_as(
                "SELECT MIN(seq), MAX(seq) FROM conv_events WHERE conv_id = ?",
            )
            .bind(&conv_id)
            .fetch_optional(&self.pool)
            .await?;
            let (earliest_seq, latest_seq) = bounds.unwrap_or((None, None));
            self.mark_read(&conv_id, user_id, latest_seq, now_ms, latest_seq, earliest_seq)
                .await?;
            updated += 1;
        }
        Ok(updated)
    }

    pub async fn list_members(&self, conv_id: &str) -> Result<Vec<MemberRow>, ConvStoreError> {
        if !self.is_known(conv_id).await? {
            return Err(ConvStoreError::UnknownConversation);
        }
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT user_id, role FROM conversation_members WHERE conv_id = ?")
                .bind(conv_id)
                .fetch_all(&self.pool)
                .await?;
        let mut members: Vec<MemberRow> = rows
            .into_iter()
            .filter_map(|(user_id, role)| Role::from_str(&role).map(|role| MemberRow { user_id, role }))
            .collect();
        members.sort_by(|a, b| a.role.cmp(&b.role).then_with(|| a.user_id.cmp(&b.user_id)));
        Ok(members)
    }

    pub async fn get_last_read_seq(
        &self,
        conv_id: &str,
        user_id: &str,
    ) -> Result<Option<i64>, sqlx::Error> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT last_read_seq FROM conversation_reads WHERE conv_id = ? AND user_id = ?")
                .bind(conv_id)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(v,)| v))
    }

    /// Clamps `to_seq` into `[earliest_seq-1, latest_seq]` and never
    /// regresses an existing read marker.
    pub async fn mark_read(
        &self,
        conv_id: &str,
        user_id: &str,
        to_seq: Option<i64>,
        now_ms: i64,
        latest_seq: Option<i64>,
        earliest_seq: Option<i64>,
    ) -> Result<i64, ConvStoreError> {
        let mut tx = self.pool.begin().await?;
        let member: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM conversation_members WHERE conv_id = ? AND user_id = ?")
                .bind(conv_id)
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await?;
        if member.is_none() {
            tx.rollback().await.ok();
            return Err(ConvStoreError::Forbidden);
        }

        let existing: Option<(i64,)> =
            sqlx::query_as("SELECT last_read_seq FROM conversation_reads WHERE conv_id = ? AND user_id = ?")
                .bind(conv_id)
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await?;

        let min_allowed = earliest_seq.map(|s| s - 1).unwrap_or(0).max(0);
        let max_allowed = latest_seq.unwrap_or(min_allowed);
        let target = to_seq.unwrap_or(max_allowed);
        let mut clamped = target.clamp(min_allowed, max_allowed);
        if let Some((existing,)) = existing {
            clamped = clamped.max(existing);
        }

        sqlx::query(
            "INSERT INTO conversation_reads (conv_id, user_id, last_read_seq, updated_at_ms)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(conv_id, user_id) DO UPDATE SET
                 last_read_seq = excluded.last_read_seq, updated_at_ms = excluded.updated_at_ms",
        )
        .bind(conv_id)
        .bind(user_id)
        .bind(clamped)
        .bind(now_ms)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(clamped)
    }

    /// Every conversation `user_id` belongs to, sorted
    /// `(pinned desc, pinned_at_ms desc, created_at_ms asc, conv_id asc)`.
    #[allow(clippy::type_complexity)]
    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<ConversationRow>, sqlx::Error> {
        let rows: Vec<(
            String,
            i64,
            String,
            String,
            String,
            String,
            bool,
            i64,
            bool,
            bool,
            i64,
            Option<i64>,
            Option<i64>,
            Option<i64>,
            Option<i64>,
        )> = sqlx::query_as(
            "SELECT
                 c.conv_id, c.created_at_ms, c.home_gateway, c.title, cm.role,
                 COALESCE(cum.label, ''), COALESCE(cum.pinned, 0), COALESCE(cum.pinned_at_ms, 0),
                 COALESCE(cum.muted, 0), COALESCE(cum.archived, 0),
                 (SELECT COUNT(*) FROM conversation_members cm2 WHERE cm2.conv_id = c.conv_id),
                 (SELECT MIN(seq) FROM conv_events ce WHERE ce.conv_id = c.conv_id),
                 (SELECT MAX(seq) FROM conv_events ce WHERE ce.conv_id = c.conv_id),
                 (SELECT MAX(ts_ms) FROM conv_events ce WHERE ce.conv_id = c.conv_id),
                 cr.last_read_seq
             FROM conversations c
             JOIN conversation_members cm ON cm.conv_id = c.conv_id
             LEFT JOIN conversation_user_meta cum ON cum.conv_id = c.conv_id AND cum.user_id = cm.user_id
             LEFT JOIN conversation_reads cr ON cr.conv_id = c.conv_id AND cr.user_id = cm.user_id
             WHERE cm.user_id = ?
             ORDER BY COALESCE(cum.pinned, 0) DESC, COALESCE(cum.pinned_at_ms, 0) DESC,
                      c.created_at_ms ASC, c.conv_id ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for (
            conv_id,
            created_at_ms,
            home_gateway,
            title,
            role,
            label,
            pinned,
            pinned_at_ms,
            muted,
            archived,
            member_count,
            earliest_seq,
            latest_seq,
            latest_ts_ms,
            last_read_seq,
        ) in rows
        {
            let members = if member_count as usize <= MAX_INLINE_MEMBERS {
                let member_rows: Vec<(String,)> = sqlx::query_as(
                    "SELECT user_id FROM conversation_members WHERE conv_id = ? ORDER BY user_id ASC",
                )
                .bind(&conv_id)
                .fetch_all(&self.pool)
                .await?;
                Some(member_rows.into_iter().map(|(u,)| u).collect())
            } else {
                None
            };
            let unread_count = match (latest_seq, last_read_seq) {
                (Some(latest), Some(read)) => {
                    let floor = earliest_seq.map(|s| s - 1).unwrap_or(0);
                    (latest - read.max(floor)).max(0)
                },
                (Some(latest), None) => {
                    let floor = earliest_seq.map(|s| s - 1).unwrap_or(0);
                    (latest - floor).max(0)
                },
                (None, _) => 0,
            };
            out.push(ConversationRow {
                conv_id,
                role: Role::from_str(&role).unwrap_or(Role::Member),
                created_at_ms,
                home_gateway,
                member_count,
                title,
                label,
                pinned,
                pinned_at_ms,
                muted,
                archived,
                latest_seq,
                earliest_seq,
                latest_ts_ms,
                last_read_seq,
                unread_count,
                members,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> ConversationStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        crate::run_migrations(&pool).await.unwrap();
        ConversationStore::new(pool)
    }

    #[tokio::test]
    async fn create_rejects_duplicate_conv_id() {
        let store = test_store().await;
        store.create("c1", "owner", &[], "gw1", 0).await.unwrap();
        let err = store.create("c1", "owner", &[], "gw1", 0).await.unwrap_err();
        assert!(matches!(err, ConvStoreError::AlreadyExists));
    }

    #[tokio::test]
    async fn owner_is_never_removable() {
        let store = test_store().await;
        store
            .create("c1", "owner", &["m1".to_string()], "gw1", 0)
            .await
            .unwrap();
        store
            .remove("c1", "owner", &["owner".to_string(), "m1".to_string()])
            .await
            .unwrap();
        assert!(store.is_member("c1", "owner").await.unwrap());
        assert!(!store.is_member("c1", "m1").await.unwrap());
    }

    #[tokio::test]
    async fn banned_user_cannot_be_invited() {
        let store = test_store().await;
        store.create("c1", "owner", &[], "gw1", 0).await.unwrap();
        store
            .ban("c1", "owner", &["bad".to_string()], 0)
            .await
            .unwrap();
        let err = store
            .invite("c1", "owner", &["bad".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ConvStoreError::Banned));
    }

    #[tokio::test]
    async fn mute_members_requires_admin_and_is_reversible() {
        let store = test_store().await;
        store
            .create("c1", "owner", &["m1".to_string()], "gw1", 0)
            .await
            .unwrap();
        let err = store
            .mute_members("c1", "m1", &["owner".to_string()], 0)
            .await
            .unwrap_err();
        assert!(matches!(err, ConvStoreError::Forbidden));

        store
            .mute_members("c1", "owner", &["m1".to_string()], 0)
            .await
            .unwrap();
        assert_eq!(store.list_muted_members("c1").await.unwrap(), vec!["m1".to_string()]);

        store
            .unmute_members("c1", "owner", &["m1".to_string()])
            .await
            .unwrap();
        assert!(store.list_muted_members("c1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mark_read_clamps_and_never_regresses() {
        let store = test_store().await;
        store
            .create("c1", "owner", &[], "gw1", 0)
            .await
            .unwrap();
        let clamped = store
            .mark_read("c1", "owner", Some(100), 0, Some(10), Some(1))
            .await
            .unwrap();
        assert_eq!(clamped, 10); // clamped to latest_seq
        let clamped = store
            .mark_read("c1", "owner", Some(2), 0, Some(10), Some(1))
            .await
            .unwrap();
        assert_eq!(clamped, 10); // never regresses below existing
    }

    #[tokio::test]
    async fn only_owner_can_promote_to_admin() {
        let store = test_store().await;
        store
            .create("c1", "owner", &["m1".to_string()], "gw1", 0)
            .await
            .unwrap();
        let err = store
            .promote_admin("c1", "m1", &["m1".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ConvStoreError::Forbidden));
        store
            .promote_admin("c1", "owner", &["m1".to_string()])
            .await
            .unwrap();
        assert_eq!(store.role("c1", "m1").await.unwrap(), Some(Role::Admin));
    }

    #[tokio::test]
    async fn list_for_user_includes_inline_members_when_small() {
        let store = test_store().await;
        store
            .create("c1", "owner", &["m1".to_string()], "gw1", 0)
            .await
            .unwrap();
        let rows = store.list_for_user("owner").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].members, Some(vec!["m1".to_string(), "owner".to_string()]));
    }

    #[tokio::test]
    async fn muted_and_archived_round_trip_per_member() {
        let store = test_store().await;
        store.create("c1", "owner", &[], "gw1", 0).await.unwrap();
        store.set_muted("c1", "owner", true, 0).await.unwrap();
        store.set_archived("c1", "owner", true, 0).await.unwrap();
        let rows = store.list_for_user("owner").await.unwrap();
        assert!(rows[0].muted);
        assert!(rows[0].archived);
    }

    #[tokio::test]
    async fn mark_all_read_covers_archived_conversations_too() {
        let store = test_store().await;
        store.create("c1", "owner", &[], "gw1", 0).await.unwrap();
        store.create("c2", "owner", &[], "gw1", 0).await.unwrap();
        store.set_archived("c2", "owner", true, 0).await.unwrap();
        let count = store.mark_all_read("owner", 0).await.unwrap();
        assert_eq!(count, 2);
    }
}
