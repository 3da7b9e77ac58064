//! Presence endpoints (spec §6.1 "Presence").
//!
//! Presence itself is identity-agnostic (every [`crate::presence::Presence`]
//! method just takes an opaque `&str` key) so every route here keys off the
//! calling session's `device_id` for "self" and passes the wire contract's
//! `contacts`/`user_id` values straight through as presence keys — lease
//! notification matching only works if watcher, target, and lease key share
//! the same space, and leases are always taken out under `device_id`.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use convgw_protocol::{LastSeenBucket, PresenceStatus};

use crate::{auth_extractor::AuthedSession, error::ApiError, state::Runtime};

pub fn presence_router() -> Router<Arc<Runtime>> {
    Router::new()
        .route("/v1/presence/lease", post(lease))
        .route("/v1/presence/renew", post(renew))
        .route("/v1/presence/watch", post(watch))
        .route("/v1/presence/unwatch", post(unwatch))
        .route("/v1/presence/block", post(block))
        .route("/v1/presence/unblock", post(unblock))
        .route("/v1/presence/status", post(status))
        .route("/v1/presence/blocklist", get(blocklist))
}

#[derive(Deserialize)]
struct LeaseRequest {
    device_id: String,
    ttl_seconds: u64,
    #[serde(default)]
    invisible: bool,
}

#[derive(Serialize)]
struct ExpiresAtResponse {
    expires_at: i64,
}

async fn lease(
    State(state): State<Arc<Runtime>>,
    AuthedSession(_session): AuthedSession,
    Json(req): Json<LeaseRequest>,
) -> Result<Json<ExpiresAtResponse>, ApiError> {
    let expires_at =
        state.presence.lease(&req.device_id, req.ttl_seconds, req.invisible, crate::state::now_ms())?;
    Ok(Json(ExpiresAtResponse { expires_at }))
}

#[derive(Deserialize)]
struct RenewRequest {
    device_id: String,
    ttl_seconds: u64,
    #[serde(default)]
    invisible: Option<bool>,
}

async fn renew(
    State(state): State<Arc<Runtime>>,
    AuthedSession(_session): AuthedSession,
    Json(req): Json<RenewRequest>,
) -> Result<Json<ExpiresAtResponse>, ApiError> {
    let expires_at =
        state.presence.renew(&req.device_id, req.ttl_seconds, req.invisible, crate::state::now_ms())?;
    Ok(Json(ExpiresAtResponse { expires_at }))
}

#[derive(Deserialize)]
struct ContactsRequest {
    contacts: Vec<String>,
}

#[derive(Serialize)]
struct WatchingResponse {
    watching: usize,
}

async fn watch(
    State(state): State<Arc<Runtime>>,
    AuthedSession(session): AuthedSession,
    Json(req): Json<ContactsRequest>,
) -> Result<Json<WatchingResponse>, ApiError> {
    let watching = state.presence.watch(&session.device_id, &req.contacts, crate::state::now_ms())?;
    Ok(Json(WatchingResponse { watching }))
}

async fn unwatch(
    State(state): State<Arc<Runtime>>,
    AuthedSession(session): AuthedSession,
    Json(req): Json<ContactsRequest>,
) -> Result<Json<WatchingResponse>, ApiError> {
    let watching = state.presence.unwatch(&session.device_id, &req.contacts, crate::state::now_ms())?;
    Ok(Json(WatchingResponse { watching }))
}

#[derive(Serialize)]
struct BlockedResponse {
    blocked: usize,
}

async fn block(
    State(state): State<Arc<Runtime>>,
    AuthedSession(session): AuthedSession,
    Json(req): Json<ContactsRequest>,
) -> Result<Json<BlockedResponse>, ApiError> {
    let blocked = state.presence.block(&session.device_id, &req.contacts);
    Ok(Json(BlockedResponse { blocked }))
}

async fn unblock(
    State(state): State<Arc<Runtime>>,
    AuthedSession(session): AuthedSession,
    Json(req): Json<ContactsRequest>,
) -> Result<Json<BlockedResponse>, ApiError> {
    let blocked = state.presence.unblock(&session.device_id, &req.contacts);
    Ok(Json(BlockedResponse { blocked }))
}

#[derive(Serialize)]
struct StatusEntry {
    user_id: String,
    status: PresenceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_seen_bucket: Option<LastSeenBucket>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<i64>,
}

#[derive(Serialize)]
struct StatusesResponse {
    statuses: Vec<StatusEntry>,
}

async fn status(
    State(state): State<Arc<Runtime>>,
    AuthedSession(session): AuthedSession,
    Json(req): Json<ContactsRequest>,
) -> Result<Json<StatusesResponse>, ApiError> {
    let now_ms = crate::state::now_ms();
    let mut statuses: Vec<StatusEntry> = req
        .contacts
        .into_iter()
        .map(|contact| {
            if state.presence.is_blocked(&session.device_id, &contact) {
                return StatusEntry {
                    user_id: contact,
                    status: PresenceStatus::Offline,
                    last_seen_bucket: None,
                    expires_at: None,
                };
            }
            let snapshot = state.presence.status(&contact, now_ms);
            StatusEntry {
                user_id: contact,
                status: snapshot.status,
                last_seen_bucket: snapshot.last_seen_bucket,
                expires_at: snapshot.expires_at,
            }
        })
        .collect();
    statuses.sort_by(|a, b| a.user_id.cmp(&b.user_id));
    Ok(Json(StatusesResponse { statuses }))
}

#[derive(Serialize)]
struct BlocklistResponse {
    blocked: Vec<String>,
}

async fn blocklist(
    State(state): State<Arc<Runtime>>,
    AuthedSession(session): AuthedSession,
) -> Json<BlocklistResponse> {
    Json(BlocklistResponse { blocked: state.presence.blocklist(&session.device_id) })
}
