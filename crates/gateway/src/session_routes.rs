//! Session lifecycle endpoints (spec §6.1 "Session lifecycle").

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::{auth_extractor::AuthedSession, error::ApiError, state::Runtime};

pub fn session_router() -> Router<Arc<Runtime>> {
    Router::new()
        .route("/v1/session/start", post(start))
        .route("/v1/session/resume", post(resume))
        .route("/v1/session/list", get(list))
        .route("/v1/session/revoke", post(revoke))
        .route("/v1/session/logout", post(logout))
        .route("/v1/session/logout_all", post(logout_all))
}

#[derive(Deserialize)]
struct StartRequest {
    auth_token: String,
    device_id: String,
    #[serde(default)]
    device_credential: Option<String>,
    #[serde(default)]
    client_label: Option<String>,
}

#[derive(Serialize)]
struct SessionStartResponse {
    session_token: String,
    resume_token: String,
    user_id: String,
    expires_at_ms: i64,
}

async fn start(
    State(state): State<Arc<Runtime>>,
    Json(req): Json<StartRequest>,
) -> Result<Json<SessionStartResponse>, ApiError> {
    // `device_credential` is accepted for forward compatibility with
    // per-device client certs; this gateway only verifies the auth token.
    let _ = req.device_credential;
    let user_id = state
        .identity
        .resolve(&req.auth_token)
        .await?
        .ok_or_else(|| ApiError::unauthorized("invalid auth_token"))?;
    let session = state
        .sessions
        .create(
            &user_id,
            &req.device_id,
            req.client_label.as_deref(),
            crate::state::now_ms(),
        )
        .await?;
    Ok(Json(SessionStartResponse {
        session_token: session.session_token,
        resume_token: session.resume_token,
        user_id: session.user_id,
        expires_at_ms: session.expires_at_ms,
    }))
}

#[derive(Deserialize)]
struct ResumeRequest {
    resume_token: String,
}

async fn resume(
    State(state): State<Arc<Runtime>>,
    Json(req): Json<ResumeRequest>,
) -> Result<Json<SessionStartResponse>, ApiError> {
    let session = state
        .sessions
        .consume_resume(&req.resume_token, crate::state::now_ms())
        .await?
        .ok_or_else(|| ApiError::unauthorized("unknown or expired resume_token"))?;
    Ok(Json(SessionStartResponse {
        session_token: session.session_token,
        resume_token: session.resume_token,
        user_id: session.user_id,
        expires_at_ms: session.expires_at_ms,
    }))
}

#[derive(Serialize)]
struct SessionListEntry {
    session_id: String,
    device_id: String,
    expires_at_ms: i64,
    is_current: bool,
    created_at_ms: i64,
    last_seen_at_ms: i64,
    client_label: Option<String>,
}

#[derive(Serialize)]
struct SessionListResponse {
    sessions: Vec<SessionListEntry>,
    current_session_id: String,
}

async fn list(
    State(state): State<Arc<Runtime>>,
    AuthedSession(current): AuthedSession,
) -> Result<Json<SessionListResponse>, ApiError> {
    let current_session_id = current.session_id();
    let mut sessions = state
        .sessions
        .list_for_user(&current.user_id, crate::state::now_ms())
        .await?
        .into_iter()
        .map(|s| {
            let session_id = s.session_id();
            let is_current = session_id == current_session_id;
            SessionListEntry {
                session_id,
                device_id: s.device_id,
                expires_at_ms: s.expires_at_ms,
                is_current,
                created_at_ms: s.created_at_ms,
                last_seen_at_ms: s.last_seen_at_ms,
                client_label: s.client_label,
            }
        })
        .collect::<Vec<_>>();
    sessions.sort_by(|a, b| b.is_current.cmp(&a.is_current));
    Ok(Json(SessionListResponse {
        sessions,
        current_session_id,
    }))
}

#[derive(Deserialize)]
struct RevokeRequest {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    include_self: bool,
}

#[derive(Serialize)]
struct RevokeResponse {
    status: &'static str,
    revoked: u64,
    revoked_session_ids: Vec<String>,
}

async fn revoke(
    State(state): State<Arc<Runtime>>,
    AuthedSession(current): AuthedSession,
    Json(req): Json<RevokeRequest>,
) -> Result<Json<RevokeResponse>, ApiError> {
    let current_session_id = current.session_id();
    let all = state
        .sessions
        .list_for_user(&current.user_id, crate::state::now_ms())
        .await?;

    let targets: Vec<_> = all
        .into_iter()
        .filter(|s| match (&req.session_id, &req.device_id) {
            (Some(sid), _) => &s.session_id() == sid,
            (None, Some(did)) => &s.device_id == did,
            (None, None) => false,
        })
        .collect();

    if targets.is_empty() {
        return Ok(Json(RevokeResponse {
            status: "ok",
            revoked: 0,
            revoked_session_ids: Vec::new(),
        }));
    }

    if !req.include_self && targets.iter().any(|s| s.session_id() == current_session_id) {
        return Err(ApiError::invalid_request(
            "refusing to revoke the current session without include_self=true",
        ));
    }

    let mut revoked_session_ids = Vec::with_capacity(targets.len());
    for session in &targets {
        state.sessions.invalidate_token(&session.session_token).await?;
        revoked_session_ids.push(session.session_id());
    }

    Ok(Json(RevokeResponse {
        status: "ok",
        revoked: revoked_session_ids.len() as u64,
        revoked_session_ids,
    }))
}

#[derive(Serialize)]
struct LogoutResponse {
    status: &'static str,
}

async fn logout(
    State(state): State<Arc<Runtime>>,
    AuthedSession(current): AuthedSession,
) -> Result<Json<LogoutResponse>, ApiError> {
    state.sessions.invalidate_token(&current.session_token).await?;
    Ok(Json(LogoutResponse { status: "ok" }))
}

#[derive(Deserialize)]
struct LogoutAllRequest {
    #[serde(default)]
    include_self: bool,
}

#[derive(Serialize)]
struct LogoutAllResponse {
    status: &'static str,
    kept_current: bool,
}

async fn logout_all(
    State(state): State<Arc<Runtime>>,
    AuthedSession(current): AuthedSession,
    Json(req): Json<LogoutAllRequest>,
) -> Result<Json<LogoutAllResponse>, ApiError> {
    let keep = if req.include_self { None } else { Some(current.session_token.as_str()) };
    state.sessions.invalidate_all_for_user(&current.user_id, keep).await?;
    Ok(Json(LogoutAllResponse {
        status: "ok",
        kept_current: !req.include_self,
    }))
}
