//! Social event chain endpoints (spec §6.1 "Social", §4.8 cache posture).

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderValue, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use convgw_auth::crypto;

use crate::{
    auth_extractor::AuthedSession,
    error::ApiError,
    rate_limiter::{Action, hash_key},
    social_chain::{FeedPage, ProfileView, SocialEvent},
    state::Runtime,
};

pub fn social_router() -> Router<Arc<Runtime>> {
    Router::new()
        .route("/v1/social/events", post(publish).get(list))
        .route("/v1/social/events/{event_hash}", get(get_event))
        .route("/v1/social/profile", get(profile))
        .route("/v1/social/feed", get(feed))
}

#[derive(Deserialize)]
struct PublishRequest {
    user_id: String,
    #[serde(default)]
    prev_hash: Option<String>,
    ts_ms: i64,
    kind: String,
    payload: Value,
    sig_b64: String,
}

async fn publish(
    State(state): State<Arc<Runtime>>,
    AuthedSession(_session): AuthedSession,
    Json(req): Json<PublishRequest>,
) -> Result<Json<SocialEvent>, ApiError> {
    if matches!(
        state.rate_limiter.check(Action::SocialPublish, hash_key(&req.user_id)),
        crate::rate_limiter::Decision::Denied { .. }
    ) {
        return Err(ApiError::rate_limited("rate limit exceeded", 60));
    }
    let event = state
        .social
        .publish(
            &req.user_id,
            req.prev_hash.as_deref(),
            req.ts_ms,
            &req.kind,
            req.payload,
            &req.sig_b64,
        )
        .await?;
    Ok(Json(event))
}

#[derive(Deserialize)]
struct ListQuery {
    user_id: String,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    after_hash: Option<String>,
}

#[derive(Serialize)]
struct ListResponse {
    events: Vec<SocialEvent>,
}

async fn list(
    State(state): State<Arc<Runtime>>,
    AuthedSession(_session): AuthedSession,
    Query(q): Query<ListQuery>,
) -> Result<Json<ListResponse>, ApiError> {
    let events = state
        .social
        .list(&q.user_id, q.after_hash.as_deref(), q.limit.unwrap_or(50))
        .await?;
    Ok(Json(ListResponse { events }))
}

async fn get_event(
    State(state): State<Arc<Runtime>>,
    AuthedSession(_session): AuthedSession,
    Path(event_hash): Path<String>,
) -> Result<Response, ApiError> {
    let event = state
        .social
        .get(&event_hash)
        .await?
        .ok_or_else(|| ApiError::not_found("unknown social event"))?;
    let mut response = Json(event).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("max-age=31536000, immutable"),
    );
    Ok(response)
}

#[derive(Deserialize)]
struct ProfileQuery {
    user_id: String,
    #[serde(default)]
    limit: Option<i64>,
}

async fn profile(
    State(state): State<Arc<Runtime>>,
    AuthedSession(_session): AuthedSession,
    Query(q): Query<ProfileQuery>,
) -> Result<Response, ApiError> {
    let view = state.social.profile(&q.user_id, q.limit.unwrap_or(20)).await?;
    Ok(cacheable_response(&view, view.latest_posts.first().map(|p| p.ts_ms)))
}

#[derive(Deserialize)]
struct FeedQuery {
    user_id: String,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    cursor: Option<String>,
}

async fn feed(
    State(state): State<Arc<Runtime>>,
    AuthedSession(_session): AuthedSession,
    Query(q): Query<FeedQuery>,
) -> Result<Response, ApiError> {
    let page = state
        .social
        .feed(&q.user_id, q.limit.unwrap_or(20), q.cursor.as_deref())
        .await?;
    let last_modified_ms = page.items.first().map(|e| e.ts_ms);
    Ok(cacheable_response(&FeedResponse::from(page), last_modified_ms))
}

#[derive(Serialize)]
struct FeedResponse {
    items: Vec<SocialEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_cursor: Option<String>,
}

impl From<FeedPage> for FeedResponse {
    fn from(page: FeedPage) -> Self {
        Self { items: page.items, next_cursor: page.next_cursor }
    }
}

/// Short-cacheable, ETag-bearing response shared by profile and feed (spec
/// §4.8 "Cache posture"). `ETag` is the hash of the canonical response body;
/// `Last-Modified` falls back to the response construction time when the
/// payload carries no events to derive a timestamp from.
fn cacheable_response(body: &impl Serialize, last_modified_ms: Option<i64>) -> Response {
    let json = serde_json::to_value(body).unwrap_or(Value::Null);
    let canonical = crypto::canonical_json(&json).unwrap_or_default();
    let etag = crypto::sha256_hex(&canonical);
    let last_modified_ms = last_modified_ms.unwrap_or_else(crate::state::now_ms);

    let mut response = Json(json).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("public, max-age=30"));
    if let Ok(value) = HeaderValue::from_str(&format!("\"{etag}\"")) {
        headers.insert(header::ETAG, value);
    }
    if let Some(dt) = chrono::DateTime::from_timestamp_millis(last_modified_ms)
        && let Ok(value) = HeaderValue::from_str(&dt.to_rfc2822())
    {
        headers.insert(header::LAST_MODIFIED, value);
    }
    response
}
