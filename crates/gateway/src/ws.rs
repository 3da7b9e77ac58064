//! The duplex transport: `GET /v1/ws` (spec §6.2 "Duplex frame grammar").
//!
//! Lifecycle mirrors the one-shot surfaces this module sits next to:
//! handshake (`session.start`/`session.resume`, anything else closes the
//! connection) → message loop (`conv.subscribe`/`conv.send`/`conv.ack`/
//! `ping`/`pong`) → cleanup. `conv.send` reuses the same membership/size/
//! rate-limit checks as `inbox_routes::inbox`; `conv.subscribe` reuses the
//! same backlog-then-live shape as `sse::stream_conversation`.
//!
//! A connection may subscribe to several conversations at once, each with
//! its own bounded channel from `SubscriptionHub`. Rather than polling a
//! dynamic set of receivers inside `select!`, each subscription gets a
//! small forwarding task that drains its channel into one shared
//! `events_rx` the message loop actually selects on; the forwarding task
//! exits on its own once the hub drops it (backpressure) or `unsubscribe`
//! closes the sending half.

use std::{collections::HashMap, sync::Arc};

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, stream::StreamExt};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};

use convgw_protocol::{
    ConvAckedBody, ConvAckedFrame, ConvEventBody, ConvEventFrame, CursorEntry, ErrorFrame, Frame,
    PingFrame, PongFrame, PresenceUpdateBody, PresenceUpdateFrame, SessionReadyBody,
    SessionReadyFrame,
};

use crate::{
    conversation_log::ConversationEvent,
    error::ApiError,
    presence::PresenceUpdate,
    rate_limiter::{Action, Decision, hash_key},
    session_store::Session,
    state::{Runtime, now_ms},
};

pub async fn handle_connection(socket: WebSocket, state: Arc<Runtime>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

    let write_handle = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    let session = match tokio::time::timeout(
        state.config.request_timeout(),
        wait_for_handshake(&mut ws_rx, &state),
    )
    .await
    {
        Ok(Ok(session)) => session,
        Ok(Err(shape)) => {
            send_frame(&out_tx, &Frame::Error(ErrorFrame::new(None, shape)));
            drop(out_tx);
            write_handle.abort();
            return;
        },
        Err(_) => {
            drop(out_tx);
            write_handle.abort();
            return;
        },
    };

    let cursors = state.cursors.list_cursors(&session.device_id).await.unwrap_or_default();
    send_frame(&out_tx, &Frame::SessionReady(SessionReadyFrame {
        v: 1,
        id: None,
        body: SessionReadyBody {
            session_token: session.session_token.clone(),
            resume_token: session.resume_token.clone(),
            expires_at: session.expires_at_ms,
            cursors: cursors
                .into_iter()
                .map(|(conv_id, next_seq)| CursorEntry { conv_id, next_seq })
                .collect(),
        },
    }));

    let (presence_tx, mut presence_rx) = mpsc::channel::<PresenceUpdate>(32);
    state.presence.register_callback(&session.device_id, presence_tx);

    let (events_tx, mut events_rx) = mpsc::channel::<ConversationEvent>(state.config.outbound_queue_capacity);
    let mut subscriptions: HashMap<String, (crate::subscription_hub::Subscription, JoinHandle<()>)> =
        HashMap::new();

    let mut ping_misses: u32 = 0;
    let mut ticker = tokio::time::interval(state.config.ws_ping_interval());
    ticker.tick().await; // first tick fires immediately; skip it

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                let Some(msg) = msg else { break };
                let text = match msg {
                    Ok(Message::Text(t)) => t.to_string(),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!(error = %e, "ws: read error");
                        break;
                    },
                };

                let frame: Frame = match serde_json::from_str(&text) {
                    Ok(f) => f,
                    Err(_) => {
                        send_frame(&out_tx, &Frame::Error(ErrorFrame::new(
                            None,
                            convgw_protocol::ErrorShape::invalid_request("malformed frame"),
                        )));
                        continue;
                    },
                };

                match frame {
                    Frame::Ping(frame) => send_frame(&out_tx, &Frame::Pong(PongFrame { v: 1, id: frame.id })),
                    Frame::Pong(_) => ping_misses = 0,
                    other => {
                        handle_frame(other, &state, &session, &out_tx, &mut subscriptions, &events_tx).await;
                    },
                }
            }

            _ = ticker.tick() => {
                if ping_misses >= state.config.ws_ping_miss_limit {
                    debug!(device_id = %session.device_id, "ws: ping miss limit reached, closing");
                    break;
                }
                ping_misses += 1;
                send_frame(&out_tx, &Frame::Ping(PingFrame { v: 1, id: None }));
            }

            Some(update) = presence_rx.recv() => {
                send_frame(&out_tx, &Frame::PresenceUpdate(PresenceUpdateFrame {
                    v: 1,
                    id: None,
                    body: PresenceUpdateBody {
                        user_id: update.user_id,
                        status: update.status,
                        expires_at: update.expires_at,
                        last_seen_bucket: update.last_seen_bucket,
                    },
                }));
            }

            Some(event) = events_rx.recv() => {
                send_frame(&out_tx, &Frame::ConvEvent(ConvEventFrame {
                    v: 1,
                    id: None,
                    body: ConvEventBody {
                        conv_id: event.conv_id,
                        seq: event.seq,
                        msg_id: event.msg_id,
                        env: event.env_b64,
                        sender_device_id: event.sender_device_id,
                    },
                }));
            }
        }
    }

    for (subscription, handle) in subscriptions.into_values() {
        state.hub.unsubscribe(&subscription);
        handle.abort();
    }
    state.presence.unregister_callback(&session.device_id);
    drop(out_tx);
    write_handle.abort();
}

async fn wait_for_handshake(
    rx: &mut futures::stream::SplitStream<WebSocket>,
    state: &Arc<Runtime>,
) -> Result<Session, convgw_protocol::ErrorShape> {
    while let Some(msg) = rx.next().await {
        let text = match msg {
            Ok(Message::Text(t)) => t.to_string(),
            Ok(Message::Close(_)) => {
                return Err(convgw_protocol::ErrorShape::invalid_request("connection closed before handshake"));
            },
            Ok(_) => continue,
            Err(_) => {
                return Err(convgw_protocol::ErrorShape::invalid_request("read error before handshake"));
            },
        };

        let frame: Frame = serde_json::from_str(&text)
            .map_err(|_| convgw_protocol::ErrorShape::invalid_request("malformed handshake frame"))?;

        return match frame {
            Frame::SessionStart(frame) => {
                let body = frame.body;
                let user_id = state
                    .identity
                    .resolve(&body.auth_token)
                    .await
                    .map_err(|_| convgw_protocol::ErrorShape::internal("internal error"))?
                    .ok_or_else(|| convgw_protocol::ErrorShape::unauthorized("invalid auth_token"))?;
                state
                    .sessions
                    .create(&user_id, &body.device_id, None, now_ms())
                    .await
                    .map_err(|_| convgw_protocol::ErrorShape::internal("internal error"))
            },
            Frame::SessionResume(frame) => state
                .sessions
                .consume_resume(&frame.body.resume_token, now_ms())
                .await
                .map_err(|_| convgw_protocol::ErrorShape::internal("internal error"))?
                .ok_or_else(|| convgw_protocol::ErrorShape::unauthorized("unknown or expired resume_token")),
            _ => Err(convgw_protocol::ErrorShape::invalid_request(
                "first frame must be session.start or session.resume",
            )),
        };
    }
    Err(convgw_protocol::ErrorShape::invalid_request("connection closed before handshake"))
}

async fn handle_frame(
    frame: Frame,
    state: &Arc<Runtime>,
    session: &Session,
    out_tx: &mpsc::UnboundedSender<Message>,
    subscriptions: &mut HashMap<String, (crate::subscription_hub::Subscription, JoinHandle<()>)>,
    events_tx: &mpsc::Sender<ConversationEvent>,
) {
    match frame {
        Frame::ConvSubscribe(frame) => {
            let body = frame.body;
            match state.convs.is_member(&body.conv_id, &session.user_id).await {
                Ok(true) => {},
                Ok(false) => {
                    send_frame(out_tx, &error_frame(frame.id, ApiError::forbidden("not a member of this conversation")));
                    return;
                },
                Err(_) => {
                    send_frame(out_tx, &error_frame(frame.id, ApiError::internal("internal error")));
                    return;
                },
            }

            let from_seq = match body.from_seq.or(body.after_seq.map(|s| s + 1)) {
                Some(seq) => seq,
                None => match state.cursors.next_seq(&session.device_id, &body.conv_id).await {
                    Ok(seq) => seq,
                    Err(_) => {
                        send_frame(out_tx, &error_frame(frame.id, ApiError::internal("internal error")));
                        return;
                    },
                },
            };

            let retention_enabled = state.config.retention.enabled();
            let backlog = match state
                .conv_log
                .list_from(&body.conv_id, from_seq.max(1), None, retention_enabled)
                .await
            {
                Ok(backlog) => backlog,
                Err(e) => {
                    send_frame(out_tx, &error_frame(frame.id, ApiError::from(e)));
                    return;
                },
            };

            for event in backlog {
                send_frame(out_tx, &Frame::ConvEvent(ConvEventFrame {
                    v: 1,
                    id: None,
                    body: ConvEventBody {
                        conv_id: event.conv_id,
                        seq: event.seq,
                        msg_id: event.msg_id,
                        env: event.env_b64,
                        sender_device_id: event.sender_device_id,
                    },
                }));
            }

            let (subscription, mut rx) = state.hub.subscribe(&session.device_id, &body.conv_id);
            let forward_tx = events_tx.clone();
            let handle = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    if forward_tx.send(event).await.is_err() {
                        break;
                    }
                }
            });
            if let Some((old_subscription, old_handle)) =
                subscriptions.insert(body.conv_id, (subscription, handle))
            {
                state.hub.unsubscribe(&old_subscription);
                old_handle.abort();
            }
        },
        Frame::ConvSend(frame) => {
            let id = frame.id.clone();
            let body = frame.body;
            if !matches!(state.convs.is_member(&body.conv_id, &session.user_id).await, Ok(true)) {
                send_frame(out_tx, &error_frame(id, ApiError::forbidden("not a member of this conversation")));
                return;
            }
            if body.env.len() > state.config.max_env_b64_len {
                send_frame(out_tx, &error_frame(id, ApiError::invalid_request("env exceeds max_env_b64_len")));
                return;
            }
            if matches!(
                state.rate_limiter.check(Action::ConvSend, hash_key(&session.user_id)),
                Decision::Denied { .. }
            ) {
                send_frame(out_tx, &error_frame(id, ApiError::rate_limited("rate limit exceeded", 60)));
                return;
            }
            let ts_ms = body.ts.unwrap_or_else(now_ms);
            match state
                .conv_log
                .append(&body.conv_id, &body.msg_id, &body.env, &session.device_id, ts_ms)
                .await
            {
                Ok((seq, event, _created)) => {
                    state.hub.broadcast(event);
                    send_frame(out_tx, &Frame::ConvAcked(ConvAckedFrame {
                        v: 1,
                        id,
                        body: ConvAckedBody { conv_id: body.conv_id, msg_id: body.msg_id, seq },
                    }));
                },
                Err(_) => send_frame(out_tx, &error_frame(id, ApiError::internal("internal error"))),
            }
        },
        Frame::ConvAck(frame) => {
            let body = frame.body;
            if matches!(state.convs.is_member(&body.conv_id, &session.user_id).await, Ok(true)) {
                let _ = state.cursors.ack(&session.device_id, &body.conv_id, body.seq, now_ms()).await;
            }
        },
        other => warn!(?other, "ws: ignoring unexpected frame"),
    }
}

fn error_frame(id: Option<String>, err: ApiError) -> Frame {
    Frame::Error(ErrorFrame::new(id, err.shape()))
}

fn send_frame(out_tx: &mpsc::UnboundedSender<Message>, frame: &Frame) {
    if let Ok(json) = serde_json::to_string(frame) {
        let _ = out_tx.send(Message::Text(json.into()));
    }
}
