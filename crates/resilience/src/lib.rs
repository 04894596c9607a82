#![deny(unused)]
//! Resilience layer for outbound calls.
//!
//! This crate provides:
//! - Exponential-backoff retries with status-aware HTTP handling
//! - Per-upstream circuit breakers with single-flight recovery probes
//! - A resilient HTTP client combining both
//! - The registry of third-party marketing platforms

pub mod circuit_breaker;
pub mod http_client;
pub mod platforms;
pub mod retry;

pub use circuit_breaker::{
    BreakerPermit, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry,
    CircuitState,
};
pub use http_client::{ReqwestTransport, ResilientHttpClient, ResilientHttpClientBuilder};
pub use platforms::{Platform, PlatformRegistry};
pub use retry::{
    parse_retry_after, retry_database_operation, retry_http_request, retry_with_backoff,
    RetryConfig, RetryableKinds,
};
