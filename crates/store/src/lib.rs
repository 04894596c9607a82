#![deny(unused)]
//! Tenant-scoped document persistence for MarketOps.
//!
//! Route handlers reach storage only through [`SecureDataClient`], which
//! layers query validation and tenant isolation over a [`DocumentStore`]
//! backend (in-memory or SQLite).
//!
//! [`DocumentStore`]: marketops_core::DocumentStore

pub mod isolation;
pub mod matcher;
pub mod memory;
pub mod secure;
pub mod sqlite;
pub mod validator;

use marketops_core::{config::StoreConfig, DocumentStore, Result};

pub use isolation::{enforce_tenant_filter, guard_update, stamp_document, validate_tenant_access};
pub use memory::InMemoryDocumentStore;
pub use secure::SecureDataClient;
pub use sqlite::SqliteDocumentStore;
pub use validator::QueryValidator;

/// Build the configured backend: SQLite when a path is set, else in-memory.
pub fn open_store(config: &StoreConfig) -> Result<Box<dyn DocumentStore>> {
    match &config.sqlite_path {
        Some(path) => {
            tracing::info!(path = %path, "Using SQLite document store");
            Ok(Box::new(SqliteDocumentStore::new(path)?))
        }
        None => {
            tracing::warn!("No store.sqlite_path configured; documents are kept in memory");
            Ok(Box::new(InMemoryDocumentStore::new()))
        }
    }
}
