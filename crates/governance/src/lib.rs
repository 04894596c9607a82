#![deny(unused)]
//! Governance for MarketOps.
//!
//! This crate provides:
//! - Cost guardrail (rate limits, daily quotas, monthly spend cap)
//! - Encrypted credential storage for connected platforms
//! - Logging and distributed tracing setup
//! - Prometheus metrics

pub mod credentials;
pub mod guardrail;
pub mod metrics;
pub mod secrets;
pub mod tracing_layer;

pub use credentials::{ConnectedIntegration, CredentialVault, OAuthTokens, CREDENTIALS_COLLECTION};
pub use guardrail::{
    Clock, CostGuardrail, DenyReason, GuardrailDecision, ManualClock, SystemClock, UsageSnapshot,
};
pub use metrics::{setup_metrics_recorder, track_request};
pub use secrets::{EncryptedSecret, SecretCipher};
pub use tracing_layer::{configure_tracing, shutdown_tracing};
