//! Core types for MarketOps.
//!
//! Types are organized by concern:
//! - `tenant`: organization scope
//! - `document`: document-store values
//! - `gateway_contract`: HTTP API envelope and error body

pub mod document;
pub mod gateway_contract;
pub mod tenant;

pub use document::*;
pub use gateway_contract::*;
pub use tenant::*;
