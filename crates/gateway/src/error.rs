//! Domain errors and their conversion to the wire taxonomy (spec §7).
//!
//! Everything above the transport boundary returns `Result<T, ApiError>`;
//! `ApiError` knows how to render itself as an HTTP response (via
//! `IntoResponse`) and as a duplex-frame `ErrorShape`. Nothing in this crate
//! panics on a bad request — `unwrap`/`expect` are denied workspace-wide
//! outside tests.

use axum::{
    Json,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use convgw_auth::IdentityError;
use convgw_protocol::ErrorShape;
use thiserror::Error;

use crate::{
    conversation_log::ListFromError, conversation_store::ConvStoreError, presence::PresenceError,
    social_chain::SocialChainError,
};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Shape(ErrorShape),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

impl From<IdentityError> for ApiError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::Db(e) => Self::Db(e),
        }
    }
}

impl From<ConvStoreError> for ApiError {
    fn from(err: ConvStoreError) -> Self {
        match err {
            ConvStoreError::Db(e) => Self::Db(e),
            ConvStoreError::AlreadyExists => Self::conflict("conversation already exists"),
            ConvStoreError::UnknownConversation => Self::not_found("unknown conversation"),
            ConvStoreError::Forbidden => Self::forbidden("forbidden"),
            ConvStoreError::Banned => Self::forbidden("member is banned"),
            ConvStoreError::TooManyMembers => Self::limit_exceeded("too many members"),
            ConvStoreError::TitleTooLong => Self::invalid_request("title too long"),
            ConvStoreError::LabelTooLong => Self::invalid_request("label too long"),
            ConvStoreError::RateLimitExceeded => Self::rate_limited("rate limit exceeded", 60),
        }
    }
}

impl From<ListFromError> for ApiError {
    fn from(err: ListFromError) -> Self {
        match err {
            ListFromError::Db(e) => Self::Db(e),
            ListFromError::InvalidFromSeq => Self::invalid_request("from_seq must be at least 1"),
            ListFromError::ReplayWindowExceeded {
                conv_id,
                requested_from_seq,
                earliest_seq,
                latest_seq,
            } => Self::replay_window_exceeded(conv_id, requested_from_seq, earliest_seq, latest_seq),
        }
    }
}

impl From<SocialChainError> for ApiError {
    fn from(err: SocialChainError) -> Self {
        match err {
            SocialChainError::Db(e) => Self::Db(e),
            SocialChainError::TooLarge => Self::limit_exceeded("event exceeds max_social_event_bytes"),
            SocialChainError::PrevHashMismatch => {
                Self::invalid_request("prev_hash does not match chain head")
            }
            SocialChainError::InvalidSignature => Self::invalid_request("signature verification failed"),
        }
    }
}

impl From<PresenceError> for ApiError {
    fn from(err: PresenceError) -> Self {
        match err {
            PresenceError::RateLimitExceeded => Self::rate_limited("rate limit exceeded", 60),
            PresenceError::LimitExceeded(what) => Self::limit_exceeded(what),
        }
    }
}

impl ApiError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::Shape(ErrorShape::invalid_request(message))
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Shape(ErrorShape::unauthorized(message))
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Shape(ErrorShape::forbidden(message))
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::Shape(ErrorShape::not_found(message))
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Shape(ErrorShape::conflict(message))
    }

    pub fn limit_exceeded(message: impl Into<String>) -> Self {
        Self::Shape(ErrorShape::limit_exceeded(message))
    }

    pub fn rate_limited(message: impl Into<String>, retry_after_s: u64) -> Self {
        Self::Shape(ErrorShape::rate_limited(message, retry_after_s))
    }

    pub fn replay_window_exceeded(
        conv_id: impl Into<String>,
        requested_from_seq: i64,
        earliest_seq: i64,
        latest_seq: i64,
    ) -> Self {
        Self::Shape(ErrorShape::replay_window_exceeded(
            conv_id,
            requested_from_seq,
            earliest_seq,
            latest_seq,
        ))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Shape(ErrorShape::internal(message))
    }

    pub fn shape(&self) -> ErrorShape {
        match self {
            Self::Shape(shape) => shape.clone(),
            Self::Db(e) => {
                tracing::error!(error = %e, "unexpected database error");
                ErrorShape::internal("internal error")
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let shape = self.shape();
        let status =
            StatusCode::from_u16(shape.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut headers = HeaderMap::new();
        if let Some(retry_after) = shape.retry_after_s
            && let Ok(value) = HeaderValue::from_str(&retry_after.to_string())
        {
            headers.insert(header::RETRY_AFTER, value);
        }
        if status == StatusCode::UNAUTHORIZED {
            headers.insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
            headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        }
        (status, headers, Json(shape)).into_response()
    }
}
