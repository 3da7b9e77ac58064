//! Keypackage pool endpoints (spec §6.1 "Keypackages").

use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::post};
use serde::{Deserialize, Serialize};

use crate::{auth_extractor::AuthedSession, error::ApiError, state::Runtime};

pub fn keypackage_router() -> Router<Arc<Runtime>> {
    Router::new()
        .route("/v1/keypackages", post(publish))
        .route("/v1/keypackages/fetch", post(fetch))
        .route("/v1/keypackages/rotate", post(rotate))
}

#[derive(Deserialize)]
struct PublishRequest {
    device_id: String,
    keypackages: Vec<String>,
}

#[derive(Serialize, Default)]
struct Empty {}

async fn publish(
    State(state): State<Arc<Runtime>>,
    AuthedSession(session): AuthedSession,
    Json(req): Json<PublishRequest>,
) -> Result<Json<Empty>, ApiError> {
    state
        .keypackages
        .publish(&session.user_id, &req.device_id, &req.keypackages)
        .await?;
    Ok(Json(Empty::default()))
}

#[derive(Deserialize)]
struct FetchRequest {
    user_id: String,
    count: i64,
}

#[derive(Serialize)]
struct FetchResponse {
    keypackages: Vec<String>,
}

async fn fetch(
    State(state): State<Arc<Runtime>>,
    AuthedSession(_session): AuthedSession,
    Json(req): Json<FetchRequest>,
) -> Result<Json<FetchResponse>, ApiError> {
    let keypackages = state.keypackages.fetch(&req.user_id, req.count).await?;
    Ok(Json(FetchResponse { keypackages }))
}

#[derive(Deserialize)]
struct RotateRequest {
    device_id: String,
    #[serde(default)]
    revoke: bool,
    #[serde(default)]
    replacement: Vec<String>,
}

async fn rotate(
    State(state): State<Arc<Runtime>>,
    AuthedSession(session): AuthedSession,
    Json(req): Json<RotateRequest>,
) -> Result<Json<Empty>, ApiError> {
    state
        .keypackages
        .rotate(&session.user_id, &req.device_id, req.revoke, &req.replacement)
        .await?;
    Ok(Json(Empty::default()))
}
