//! In-memory document store.
//!
//! Suitable for development and tests. Collections keep insertion order.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use marketops_core::{
    traits::DocumentStore,
    types::{Document, UpdateResult, ID_FIELD},
    Error, Result,
};

use crate::matcher::{apply_update, matches};

/// Document store backed by a map of collection name to documents.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    collections: RwLock<HashMap<String, Vec<Document>>>,
}

impl InMemoryDocumentStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents in `collection`.
    pub async fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map_or(0, Vec::len)
    }

    async fn update(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
        many: bool,
    ) -> Result<UpdateResult> {
        let mut collections = self.collections.write().await;
        let Some(documents) = collections.get_mut(collection) else {
            return Ok(UpdateResult::default());
        };

        // Stage every change first so a failing match leaves the collection untouched.
        let mut staged = Vec::new();
        for (index, document) in documents.iter().enumerate().filter(|(_, d)| matches(d, filter)) {
            let mut updated = document.clone();
            let modified = apply_update(&mut updated, update)?;
            staged.push((index, updated, modified));
            if !many {
                break;
            }
        }

        let mut result = UpdateResult::default();
        for (index, updated, modified) in staged {
            result.matched += 1;
            if modified {
                result.modified += 1;
                documents[index] = updated;
            }
        }
        Ok(result)
    }
}

/// Return the document's `_id`, assigning a fresh UUID when missing.
pub(crate) fn ensure_id(document: &mut Document) -> Result<String> {
    match document.get(ID_FIELD) {
        Some(Value::String(id)) => Ok(id.clone()),
        Some(_) => Err(Error::invalid_request("_id must be a string")),
        None => {
            let id = uuid::Uuid::new_v4().to_string();
            document.insert(ID_FIELD.to_string(), Value::String(id.clone()));
            Ok(id)
        }
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn find_one(&self, collection: &str, filter: &Document) -> Result<Option<Document>> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.iter().find(|d| matches(d, filter)))
            .cloned())
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Document,
        limit: Option<usize>,
    ) -> Result<Vec<Document>> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|d| matches(d, filter))
                    .take(limit.unwrap_or(usize::MAX))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert_one(&self, collection: &str, mut document: Document) -> Result<String> {
        let id = ensure_id(&mut document)?;
        let mut collections = self.collections.write().await;
        let documents = collections.entry(collection.to_string()).or_default();

        if documents
            .iter()
            .any(|d| d.get(ID_FIELD).and_then(Value::as_str) == Some(id.as_str()))
        {
            return Err(Error::invalid_request(format!("duplicate _id '{}' in {}", id, collection)));
        }

        documents.push(document);
        tracing::debug!(collection, id = %id, total = documents.len(), "Document inserted");
        Ok(id)
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
    ) -> Result<UpdateResult> {
        self.update(collection, filter, update, false).await
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
    ) -> Result<UpdateResult> {
        self.update(collection, filter, update, true).await
    }

    async fn delete_one(&self, collection: &str, filter: &Document) -> Result<bool> {
        let mut collections = self.collections.write().await;
        let Some(documents) = collections.get_mut(collection) else {
            return Ok(false);
        };
        match documents.iter().position(|d| matches(d, filter)) {
            Some(index) => {
                documents.remove(index);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marketops_core::doc;
    use serde_json::json;

    #[tokio::test]
    async fn test_crud_round() {
        let store = InMemoryDocumentStore::new();
        let id = store
            .insert_one("campaigns", doc(json!({"name": "A", "status": "draft"})))
            .await
            .unwrap();
        store
            .insert_one("campaigns", doc(json!({"name": "B", "status": "draft"})))
            .await
            .unwrap();

        let found = store
            .find_one("campaigns", &doc(json!({"_id": id})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found["name"], "A");

        let result = store
            .update_many(
                "campaigns",
                &doc(json!({"status": "draft"})),
                &doc(json!({"$set": {"status": "active"}})),
            )
            .await
            .unwrap();
        assert_eq!(result, UpdateResult { matched: 2, modified: 2 });

        let limited = store.find("campaigns", &Document::new(), Some(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0]["name"], "A");

        assert!(store.delete_one("campaigns", &doc(json!({"name": "A"}))).await.unwrap());
        assert!(!store.delete_one("campaigns", &doc(json!({"name": "A"}))).await.unwrap());
        assert_eq!(store.count("campaigns").await, 1);
    }

    #[tokio::test]
    async fn test_update_one_touches_first_match_only() {
        let store = InMemoryDocumentStore::new();
        for n in 0..3 {
            store.insert_one("leads", doc(json!({"n": n, "hot": false}))).await.unwrap();
        }
        let result = store
            .update_one("leads", &Document::new(), &doc(json!({"$set": {"hot": true}})))
            .await
            .unwrap();
        assert_eq!(result.matched, 1);

        let hot = store.find("leads", &doc(json!({"hot": true})), None).await.unwrap();
        assert_eq!(hot.len(), 1);
        assert_eq!(hot[0]["n"], 0);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let store = InMemoryDocumentStore::new();
        store.insert_one("c", doc(json!({"_id": "x"}))).await.unwrap();
        let err = store.insert_one("c", doc(json!({"_id": "x"}))).await.unwrap_err();
        assert!(err.is_caller_fault());
    }
}
