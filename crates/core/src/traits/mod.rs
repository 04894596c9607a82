//! Core traits for MarketOps.
//!
//! - `store`: document-store driver seam
//! - `http`: outbound HTTP transport and the canonical response abstraction

pub mod http;
pub mod store;

pub use http::*;
pub use store::*;
