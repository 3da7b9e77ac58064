//! Bearer-token session extraction for the REST surface (spec §6.1 "bearer
//! token unless noted").
//!
//! Mirrors the teacher's `auth_middleware::AuthSession`: an
//! `axum::extract::FromRequestParts` impl so handlers simply take
//! `AuthedSession` as an argument and axum rejects the request before the
//! handler body runs for anything unauthenticated or expired.

use std::sync::Arc;

use axum::{extract::FromRequestParts, http::HeaderMap, http::request::Parts};

use crate::{error::ApiError, session_store::Session, state::Runtime};

pub struct AuthedSession(pub Session);

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    value.strip_prefix("Bearer ").map(str::trim)
}

impl FromRequestParts<Arc<Runtime>> for AuthedSession {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<Runtime>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;
        let session = state
            .sessions
            .get_by_session(token, crate::state::now_ms())
            .await?
            .ok_or_else(|| ApiError::unauthorized("invalid or expired session"))?;
        Ok(AuthedSession(session))
    }
}
