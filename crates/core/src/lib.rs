#![deny(unused)]
//! Core types, traits, and error definitions for MarketOps.
//!
//! This crate provides the foundational building blocks shared by the
//! resilience, store, governance and gateway layers.

pub mod config;
pub mod error;
pub mod mocks;
pub mod traits;
pub mod types;

pub use error::{Error, ErrorKind, Result, ViolationKind};
pub use traits::*;
pub use types::*;
