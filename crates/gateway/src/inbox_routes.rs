//! The one-shot (non-duplex) send/ack surface (spec §6.1 "Inbox/streaming").
//!
//! `POST /v1/inbox` carries a single `conv.send` or `conv.ack` frame body.
//! Both operations are idempotent: a resend of an already-appended `msg_id`
//! or an ack regression succeeds silently rather than erroring.

use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::post};
use convgw_protocol::Frame;
use serde::Serialize;

use crate::{
    auth_extractor::AuthedSession,
    error::ApiError,
    rate_limiter::{Action, hash_key},
    state::Runtime,
};

pub fn inbox_router() -> Router<Arc<Runtime>> {
    Router::new().route("/v1/inbox", post(inbox))
}

#[derive(Serialize, Default)]
struct InboxResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    seq: Option<i64>,
}

async fn inbox(
    State(state): State<Arc<Runtime>>,
    AuthedSession(session): AuthedSession,
    Json(frame): Json<Frame>,
) -> Result<Json<InboxResponse>, ApiError> {
    match frame {
        Frame::ConvSend(frame) => {
            let body = frame.body;
            if !state.convs.is_member(&body.conv_id, &session.user_id).await? {
                return Err(ApiError::forbidden("not a member of this conversation"));
            }
            if body.env.len() > state.config.max_env_b64_len {
                return Err(ApiError::invalid_request("env exceeds max_env_b64_len"));
            }
            let limit_key = hash_key(&session.user_id);
            if matches!(
                state.rate_limiter.check(Action::ConvSend, limit_key),
                crate::rate_limiter::Decision::Denied { .. }
            ) {
                return Err(ApiError::rate_limited("rate limit exceeded", 60));
            }
            let ts_ms = body.ts.unwrap_or_else(crate::state::now_ms);
            let (seq, event, _created) = state
                .conv_log
                .append(&body.conv_id, &body.msg_id, &body.env, &session.device_id, ts_ms)
                .await?;
            state.hub.broadcast(event);
            Ok(Json(InboxResponse { seq: Some(seq) }))
        },
        Frame::ConvAck(frame) => {
            let body = frame.body;
            if !state.convs.is_member(&body.conv_id, &session.user_id).await? {
                return Err(ApiError::forbidden("not a member of this conversation"));
            }
            state
                .cursors
                .ack(&session.device_id, &body.conv_id, body.seq, crate::state::now_ms())
                .await?;
            Ok(Json(InboxResponse::default()))
        },
        _ => Err(ApiError::invalid_request("expected a conv.send or conv.ack frame")),
    }
}
