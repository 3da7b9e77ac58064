//! Unauthenticated infrastructure endpoints (spec §6.1 "Infrastructure").

use std::sync::Arc;

use axum::{Json, Router, extract::Query, extract::State, routing::get};
use serde::{Deserialize, Serialize};

use crate::{error::ApiError, state::Runtime};

pub fn infra_router() -> Router<Arc<Runtime>> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/gateways/resolve", get(resolve))
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Deserialize)]
struct ResolveQuery {
    gateway_id: String,
}

#[derive(Serialize)]
struct ResolveResponse {
    gateway_id: String,
    gateway_url: String,
}

async fn resolve(
    State(state): State<Arc<Runtime>>,
    Query(q): Query<ResolveQuery>,
) -> Result<Json<ResolveResponse>, ApiError> {
    let gateway_url = state
        .directory
        .resolve(&q.gateway_id)
        .await?
        .ok_or_else(|| ApiError::not_found("unknown gateway"))?;
    Ok(Json(ResolveResponse { gateway_id: q.gateway_id, gateway_url }))
}
