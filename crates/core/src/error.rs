//! Error types for MarketOps.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Result type alias using MarketOps' Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Reason a request was rejected by the security layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// Query used an operator outside the allow-list.
    DisallowedOperator,
    /// A field key did not match the identifier pattern.
    InvalidField,
    /// Query shape was malformed (wrong operand type, too deep).
    MalformedQuery,
    /// No organization scope was supplied.
    MissingTenant,
    /// Query or document belongs to another organization.
    TenantMismatch,
    /// An update attempted to change the organization field.
    TenantReassignment,
    /// Encrypted material failed to decrypt or was tampered with.
    Integrity,
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::DisallowedOperator => "disallowed_operator",
            Self::InvalidField => "invalid_field",
            Self::MalformedQuery => "malformed_query",
            Self::MissingTenant => "missing_tenant",
            Self::TenantMismatch => "tenant_mismatch",
            Self::TenantReassignment => "tenant_reassignment",
            Self::Integrity => "integrity",
        };
        f.write_str(label)
    }
}

/// Tag for every error variant, used by the retry engine and the gateway
/// to pick a policy without inspecting message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CircuitOpen,
    RetryExhausted,
    UpstreamStatus,
    Transport,
    Timeout,
    Storage,
    NotFound,
    Security,
    InvalidRequest,
    RateLimited,
    QuotaExceeded,
    Config,
    Serialization,
    Internal,
}

/// Core error type for MarketOps.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Resilience Errors
    // =========================================================================
    #[error("Circuit breaker '{name}' is open; retry after {}s", .retry_after.as_secs_f64())]
    CircuitOpen { name: String, retry_after: Duration },

    #[error("Operation '{operation}' failed after {attempts} attempts: {source}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("Upstream returned HTTP {status}: {body}")]
    UpstreamStatus {
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    // =========================================================================
    // Store Errors
    // =========================================================================
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // =========================================================================
    // Security / Governance Errors
    // =========================================================================
    #[error("Security violation ({kind}): {message}")]
    SecurityViolation { kind: ViolationKind, message: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Rate limit exceeded for '{tenant}': {limit} requests per minute")]
    RateLimited {
        tenant: String,
        limit: u32,
        retry_after: Duration,
    },

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    // =========================================================================
    // Generic Errors
    // =========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a storage error.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create an invalid request error.
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a security violation.
    pub fn security(kind: ViolationKind, msg: impl Into<String>) -> Self {
        Self::SecurityViolation {
            kind,
            message: msg.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Tag for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            Self::UpstreamStatus { .. } => ErrorKind::UpstreamStatus,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Storage(_) => ErrorKind::Storage,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::SecurityViolation { .. } => ErrorKind::Security,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            Self::Config(_) => ErrorKind::Config,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Internal(_) | Self::Other(_) => ErrorKind::Internal,
        }
    }

    /// Errors caused by the caller's input. These are never retried.
    pub fn is_caller_fault(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Security | ErrorKind::InvalidRequest | ErrorKind::NotFound
        )
    }

    /// Hint for when the caller may try again, if the error carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_after, .. } | Self::RateLimited { retry_after, .. } => {
                Some(*retry_after)
            }
            Self::UpstreamStatus { retry_after, .. } => *retry_after,
            Self::RetryExhausted { source, .. } => source.retry_after(),
            _ => None,
        }
    }

    /// Number of attempts made, for errors produced by the retry engine.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::RetryExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    /// HTTP status of the upstream response behind this error, if any.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            Self::UpstreamStatus { status, .. } => Some(*status),
            Self::RetryExhausted { source, .. } => source.upstream_status(),
            _ => None,
        }
    }

    /// Violation tag for security errors.
    pub fn violation(&self) -> Option<ViolationKind> {
        match self {
            Self::SecurityViolation { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}
