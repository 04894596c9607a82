//! Wire shapes returned by the HTTP gateway.
//!
//! Successful responses wrap their payload in an [`ApiEnvelope`]; failures
//! render an [`ApiErrorBody`] derived from the core [`Error`].

use serde::Serialize;

use crate::error::{Error, ErrorKind, ViolationKind};

pub const API_VERSION: &str = "v1";

#[derive(Debug, Clone, Serialize)]
pub struct ApiEnvelope<T> {
    pub version: &'static str,
    pub trace_id: String,
    pub data: T,
}

impl<T> ApiEnvelope<T> {
    pub fn new(trace_id: impl Into<String>, data: T) -> Self {
        Self {
            version: API_VERSION,
            trace_id: trace_id.into(),
            data,
        }
    }
}

/// Client-facing error codes. One code may cover several [`ErrorKind`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiErrorCode {
    InvalidRequest,
    Forbidden,
    NotFound,
    RateLimited,
    QuotaExceeded,
    /// The platform could not be reached, or its circuit is open.
    PlatformUnavailable,
    /// The platform answered with an error status.
    PlatformRejected,
    InternalError,
}

impl From<ErrorKind> for ApiErrorCode {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Security => Self::Forbidden,
            ErrorKind::InvalidRequest => Self::InvalidRequest,
            ErrorKind::NotFound => Self::NotFound,
            ErrorKind::RateLimited => Self::RateLimited,
            ErrorKind::QuotaExceeded => Self::QuotaExceeded,
            ErrorKind::CircuitOpen | ErrorKind::RetryExhausted | ErrorKind::Transport | ErrorKind::Timeout => {
                Self::PlatformUnavailable
            }
            ErrorKind::UpstreamStatus => Self::PlatformRejected,
            ErrorKind::Storage | ErrorKind::Config | ErrorKind::Serialization | ErrorKind::Internal => {
                Self::InternalError
            }
        }
    }
}

/// Machine-readable context attached to an error body.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub violation: Option<ViolationKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
}

impl ErrorDetails {
    fn of(error: &Error) -> Option<Self> {
        let details = Self {
            violation: error.violation(),
            retry_after_secs: error.retry_after().map(|after| after.as_secs_f64()),
            upstream_status: error.upstream_status(),
            attempts: error.attempts(),
        };
        (details != Self::default()).then_some(details)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiErrorBody {
    pub code: ApiErrorCode,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,
}

impl From<&Error> for ApiErrorBody {
    fn from(error: &Error) -> Self {
        let kind = error.kind();
        // Storage and config messages can carry paths; keep them in logs only.
        let message = match ApiErrorCode::from(kind) {
            ApiErrorCode::InternalError => "internal error".to_string(),
            _ => error.to_string(),
        };
        Self {
            code: kind.into(),
            message,
            retryable: matches!(
                kind,
                ErrorKind::RateLimited
                    | ErrorKind::CircuitOpen
                    | ErrorKind::RetryExhausted
                    | ErrorKind::Transport
                    | ErrorKind::Timeout
                    | ErrorKind::Storage
            ),
            details: ErrorDetails::of(error),
        }
    }
}
