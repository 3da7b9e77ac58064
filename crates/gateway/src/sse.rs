//! The one-way push stream: `GET /v1/sse?conv_id=...&from_seq=...` (spec
//! §6.1 "Streaming", §5 "Subscribe delivers backlog before live").
//!
//! Grounded in the same backlog-then-subscribe shape `ws.rs`'s
//! `conv.subscribe` uses, re-expressed as a one-shot SSE stream instead of a
//! duplex frame exchange: history first so `[backlog, live]` stays dense,
//! then the live subscription for as long as the client holds the
//! connection open.

use std::{convert::Infallible, sync::Arc};

use axum::{
    Router,
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
};
use futures::stream::Stream;
use serde::Deserialize;

use crate::{auth_extractor::AuthedSession, error::ApiError, state::Runtime};

pub fn sse_router() -> Router<Arc<Runtime>> {
    Router::new().route("/v1/sse", get(stream_conversation))
}

#[derive(Deserialize)]
struct SseQuery {
    conv_id: String,
    #[serde(default)]
    from_seq: Option<i64>,
}

async fn stream_conversation(
    State(state): State<Arc<Runtime>>,
    AuthedSession(session): AuthedSession,
    Query(q): Query<SseQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if !state.convs.is_member(&q.conv_id, &session.user_id).await? {
        return Err(ApiError::forbidden("not a member of this conversation"));
    }

    let from_seq = match q.from_seq {
        Some(seq) => seq,
        None => state.cursors.next_seq(&session.device_id, &q.conv_id).await?,
    };

    let retention_enabled = state.config.retention.enabled();
    let backlog = state
        .conv_log
        .list_from(&q.conv_id, from_seq.max(1), None, retention_enabled)
        .await?;

    let (subscription, mut rx) = state.hub.subscribe(&session.device_id, &q.conv_id);

    let stream = async_stream::stream! {
        for event in backlog {
            if let Ok(json) = serde_json::to_string(&event) {
                yield Ok(Event::default().event("conv.event").data(json));
            }
        }
        while let Some(event) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&event) {
                yield Ok(Event::default().event("conv.event").data(json));
            }
        }
        state.hub.unsubscribe(&subscription);
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
