#![deny(unused)]
//! HTTP gateway for MarketOps.
//!
//! This crate provides the HTTP entry point for the system: tenant-scoped
//! campaign and integration routes, guardrail admission, and operational
//! endpoints.

pub mod error;
pub mod handlers;
pub mod server;

pub use error::ApiError;
pub use handlers::CAMPAIGNS_COLLECTION;
pub use server::{AppState, GatewayConfig, GatewayServer, HealthResponse};
