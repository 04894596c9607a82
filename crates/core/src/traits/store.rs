//! Document store traits.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Document, UpdateResult};

/// Native document-store driver.
///
/// Implementations receive filters and updates only after the security layer
/// has validated and scoped them; they treat them as opaque and do not apply
/// any tenant logic of their own.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Return the first document matching `filter`.
    async fn find_one(&self, collection: &str, filter: &Document) -> Result<Option<Document>>;

    /// Return documents matching `filter`, up to `limit` when given.
    async fn find(
        &self,
        collection: &str,
        filter: &Document,
        limit: Option<usize>,
    ) -> Result<Vec<Document>>;

    /// Insert a document and return its `_id`.
    async fn insert_one(&self, collection: &str, document: Document) -> Result<String>;

    /// Apply `update` to the first document matching `filter`.
    async fn update_one(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
    ) -> Result<UpdateResult>;

    /// Apply `update` to every document matching `filter`.
    async fn update_many(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
    ) -> Result<UpdateResult>;

    /// Delete the first document matching `filter`. Returns whether one was removed.
    async fn delete_one(&self, collection: &str, filter: &Document) -> Result<bool>;
}
