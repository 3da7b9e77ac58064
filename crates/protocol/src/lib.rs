//! Duplex transport protocol definitions for the conversation gateway.
//!
//! Protocol version 1. Every frame is a JSON object `{v, t, id?, body?}`
//! exchanged over a WebSocket or assembled by the one-way SSE/inbox paths.
//!
//! Frame types:
//! - `session.start` / `session.resume` / `session.ready` — handshake
//! - `conv.subscribe` / `conv.send` / `conv.ack` — client → server
//! - `conv.acked` / `conv.event` / `presence.update` — server → client
//! - `ping` / `pong` — heartbeat, either direction
//! - `error` — typed failure, never a panic

use serde::{Deserialize, Serialize};

// ── Constants ────────────────────────────────────────────────────────────────

pub const PROTOCOL_VERSION: u8 = 1;

// ── Error taxonomy ───────────────────────────────────────────────────────────

pub mod error_codes {
    pub const INVALID_REQUEST: &str = "invalid_request";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const FORBIDDEN: &str = "forbidden";
    pub const NOT_FOUND: &str = "not_found";
    pub const CONFLICT: &str = "conflict";
    pub const REPLAY_WINDOW_EXCEEDED: &str = "replay_window_exceeded";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const LIMIT_EXCEEDED: &str = "limit_exceeded";
    pub const BACKPRESSURE: &str = "backpressure";
    pub const INTERNAL: &str = "internal";
}

/// `{code, message, ...detail}` — the one error shape used on every
/// surface (WS error frame, SSE error response, JSON error body).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conv_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_from_seq: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub earliest_seq: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_seq: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_s: Option<u64>,
}

impl ErrorShape {
    fn bare(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            conv_id: None,
            requested_from_seq: None,
            earliest_seq: None,
            latest_seq: None,
            retry_after_s: None,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::bare(error_codes::INVALID_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::bare(error_codes::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::bare(error_codes::FORBIDDEN, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::bare(error_codes::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::bare(error_codes::CONFLICT, message)
    }

    pub fn limit_exceeded(message: impl Into<String>) -> Self {
        Self::bare(error_codes::LIMIT_EXCEEDED, message)
    }

    pub fn backpressure(message: impl Into<String>) -> Self {
        Self::bare(error_codes::BACKPRESSURE, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::bare(error_codes::INTERNAL, message)
    }

    pub fn rate_limited(message: impl Into<String>, retry_after_s: u64) -> Self {
        let mut shape = Self::bare(error_codes::RATE_LIMITED, message);
        shape.retry_after_s = Some(retry_after_s);
        shape
    }

    pub fn replay_window_exceeded(
        conv_id: impl Into<String>,
        requested_from_seq: i64,
        earliest_seq: i64,
        latest_seq: i64,
    ) -> Self {
        let mut shape = Self::bare(
            error_codes::REPLAY_WINDOW_EXCEEDED,
            "requested history has been pruned",
        );
        shape.conv_id = Some(conv_id.into());
        shape.requested_from_seq = Some(requested_from_seq);
        shape.earliest_seq = Some(earliest_seq);
        shape.latest_seq = Some(latest_seq);
        shape
    }

    /// HTTP status matching §6.1's `code → status` table.
    pub fn http_status(&self) -> u16 {
        match self.code.as_str() {
            error_codes::INVALID_REQUEST => 400,
            error_codes::UNAUTHORIZED => 401,
            error_codes::FORBIDDEN => 403,
            error_codes::NOT_FOUND => 404,
            error_codes::CONFLICT => 409,
            error_codes::REPLAY_WINDOW_EXCEEDED => 410,
            error_codes::RATE_LIMITED => 429,
            error_codes::LIMIT_EXCEEDED => 409,
            error_codes::BACKPRESSURE => 500,
            _ => 500,
        }
    }
}

// ── Frames ───────────────────────────────────────────────────────────────────

/// Discriminated union of every frame exchanged on the duplex transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum Frame {
    #[serde(rename = "session.start")]
    SessionStart(SessionStartFrame),
    #[serde(rename = "session.resume")]
    SessionResume(SessionResumeFrame),
    #[serde(rename = "session.ready")]
    SessionReady(SessionReadyFrame),
    #[serde(rename = "conv.subscribe")]
    ConvSubscribe(ConvSubscribeFrame),
    #[serde(rename = "conv.send")]
    ConvSend(ConvSendFrame),
    #[serde(rename = "conv.ack")]
    ConvAck(ConvAckFrame),
    #[serde(rename = "conv.acked")]
    ConvAcked(ConvAckedFrame),
    #[serde(rename = "conv.event")]
    ConvEvent(ConvEventFrame),
    #[serde(rename = "presence.update")]
    PresenceUpdate(PresenceUpdateFrame),
    #[serde(rename = "ping")]
    Ping(PingFrame),
    #[serde(rename = "pong")]
    Pong(PongFrame),
    #[serde(rename = "error")]
    Error(ErrorFrame),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStartFrame {
    pub v: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub body: SessionStartBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStartBody {
    pub auth_token: String,
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_credential: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResumeFrame {
    pub v: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub body: SessionResumeBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResumeBody {
    pub resume_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReadyFrame {
    pub v: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub body: SessionReadyBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReadyBody {
    pub session_token: String,
    pub resume_token: String,
    pub expires_at: i64,
    pub cursors: Vec<CursorEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorEntry {
    pub conv_id: String,
    pub next_seq: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvSubscribeFrame {
    pub v: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub body: ConvSubscribeBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvSubscribeBody {
    pub conv_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_seq: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after_seq: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvSendFrame {
    pub v: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub body: ConvSendBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvSendBody {
    pub conv_id: String,
    pub msg_id: String,
    pub env: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvAckFrame {
    pub v: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub body: ConvAckBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvAckBody {
    pub conv_id: String,
    pub seq: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvAckedFrame {
    pub v: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub body: ConvAckedBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvAckedBody {
    pub conv_id: String,
    pub msg_id: String,
    pub seq: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvEventFrame {
    pub v: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub body: ConvEventBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvEventBody {
    pub conv_id: String,
    pub seq: i64,
    pub msg_id: String,
    pub env: String,
    pub sender_device_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceUpdateFrame {
    pub v: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub body: PresenceUpdateBody,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceUpdateBody {
    pub user_id: String,
    pub status: PresenceStatus,
    pub expires_at: i64,
    pub last_seen_bucket: LastSeenBucket,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LastSeenBucket {
    Now,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "1d")]
    OneDay,
    #[serde(rename = "7d")]
    SevenDays,
}

impl LastSeenBucket {
    /// Bucket a `now_ms - last_seen_ms` delta per the gateway's privacy rule:
    /// no precise timestamps ever leak to watchers.
    pub fn from_age_ms(age_ms: i64) -> Self {
        let age_s = age_ms.max(0) / 1000;
        if age_s < 60 {
            Self::Now
        } else if age_s < 5 * 60 {
            Self::FiveMinutes
        } else if age_s < 60 * 60 {
            Self::OneHour
        } else if age_s < 24 * 60 * 60 {
            Self::OneDay
        } else {
            Self::SevenDays
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingFrame {
    pub v: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PongFrame {
    pub v: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub v: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub body: ErrorShape,
}

impl ErrorFrame {
    pub fn new(id: Option<String>, shape: ErrorShape) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            id,
            body: shape,
        }
    }
}

impl Frame {
    /// Build an `error` frame, optionally correlated to a request `id`.
    pub fn error(id: Option<String>, shape: ErrorShape) -> Self {
        Self::Error(ErrorFrame::new(id, shape))
    }

    pub fn ping(id: Option<String>) -> Self {
        Self::Ping(PingFrame {
            v: PROTOCOL_VERSION,
            id,
        })
    }

    pub fn pong(id: Option<String>) -> Self {
        Self::Pong(PongFrame {
            v: PROTOCOL_VERSION,
            id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conv_send_round_trips_through_json() {
        let frame = Frame::ConvSend(ConvSendFrame {
            v: 1,
            id: Some("req-1".into()),
            body: ConvSendBody {
                conv_id: "c1".into(),
                msg_id: "m1".into(),
                env: "ZW52".into(),
                ts: None,
            },
        });
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["t"], "conv.send");
        assert_eq!(json["body"]["conv_id"], "c1");
        let parsed: Frame = serde_json::from_value(json).unwrap();
        match parsed {
            Frame::ConvSend(inner) => assert_eq!(inner.body.msg_id, "m1"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        let raw = serde_json::json!({"v": 1, "t": "bogus", "body": {}});
        assert!(serde_json::from_value::<Frame>(raw).is_err());
    }

    #[test]
    fn replay_window_exceeded_carries_bounds() {
        let shape = ErrorShape::replay_window_exceeded("c1", 1, 8, 10);
        assert_eq!(shape.code, error_codes::REPLAY_WINDOW_EXCEEDED);
        assert_eq!(shape.http_status(), 410);
        assert_eq!(shape.earliest_seq, Some(8));
    }

    #[test]
    fn last_seen_bucket_thresholds() {
        assert_eq!(LastSeenBucket::from_age_ms(0), LastSeenBucket::Now);
        assert_eq!(LastSeenBucket::from_age_ms(59_999), LastSeenBucket::Now);
        assert_eq!(LastSeenBucket::from_age_ms(60_000), LastSeenBucket::FiveMinutes);
        assert_eq!(
            LastSeenBucket::from_age_ms(3_600_000),
            LastSeenBucket::OneDay
        );
        assert_eq!(
            LastSeenBucket::from_age_ms(24 * 3_600_000),
            LastSeenBucket::SevenDays
        );
    }
}
