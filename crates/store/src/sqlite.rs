//! SQLite-backed document store.
//!
//! Documents are stored as JSON text. The organization and `_id` columns are
//! indexed so tenant-scoped filters only scan one organization's rows; the
//! remaining filter is evaluated by the shared matcher.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode};
use serde_json::Value;

use marketops_core::{
    traits::DocumentStore,
    types::{Document, UpdateResult, ID_FIELD, ORGANIZATION_FIELD},
    Error, Result,
};

use crate::matcher::{apply_update, matches};
use crate::memory::ensure_id;

/// Persistent document store on a single SQLite file.
pub struct SqliteDocumentStore {
    conn: Arc<tokio::sync::Mutex<Connection>>,
}

fn db_error(context: &str, e: rusqlite::Error) -> Error {
    Error::storage(format!("{}: {}", context, e))
}

impl SqliteDocumentStore {
    /// Open (or create) the database at `path`.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| db_error("Open error", e))?;
        Self::init(conn)
    }

    /// Private in-memory database.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| db_error("Open error", e))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS documents (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                organization_id TEXT,
                body TEXT NOT NULL, -- JSON object
                UNIQUE (collection, id)
            );
            CREATE INDEX IF NOT EXISTS idx_documents_org ON documents (collection, organization_id);",
        )
        .map_err(|e| db_error("Schema error", e))?;

        Ok(Self {
            conn: Arc::new(tokio::sync::Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            f(&mut conn)
        })
        .await
        .map_err(|e| Error::internal(e.to_string()))?
    }

    async fn update(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
        many: bool,
    ) -> Result<UpdateResult> {
        let collection = collection.to_string();
        let filter = filter.clone();
        let update = update.clone();

        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(|e| db_error("Transaction error", e))?;
            let mut result = UpdateResult::default();

            for (seq, mut document) in candidates(&tx, &collection, &filter)? {
                if !matches(&document, &filter) {
                    continue;
                }
                result.matched += 1;
                if apply_update(&mut document, &update)? {
                    result.modified += 1;
                    tx.execute(
                        "UPDATE documents SET body = ?1, organization_id = ?2 WHERE seq = ?3",
                        params![
                            serde_json::to_string(&document)?,
                            organization_of(&document),
                            seq
                        ],
                    )
                    .map_err(|e| db_error("Update error", e))?;
                }
                if !many {
                    break;
                }
            }

            tx.commit().map_err(|e| db_error("Commit error", e))?;
            Ok(result)
        })
        .await
    }
}

fn organization_of(document: &Document) -> Option<&str> {
    document.get(ORGANIZATION_FIELD).and_then(Value::as_str)
}

/// Rows that could match `filter`, in insertion order.
fn candidates(conn: &Connection, collection: &str, filter: &Document) -> Result<Vec<(i64, Document)>> {
    let org = filter.get(ORGANIZATION_FIELD).and_then(Value::as_str);
    let id = filter.get(ID_FIELD).and_then(Value::as_str);

    let mut stmt = conn
        .prepare(
            "SELECT seq, body FROM documents
             WHERE collection = ?1
               AND (?2 IS NULL OR organization_id = ?2)
               AND (?3 IS NULL OR id = ?3)
             ORDER BY seq",
        )
        .map_err(|e| db_error("Prepare error", e))?;

    let rows = stmt
        .query_map(params![collection, org, id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(|e| db_error("Query error", e))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| db_error("Result error", e))?;

    rows.into_iter()
        .map(|(seq, body)| {
            serde_json::from_str::<Document>(&body)
                .map(|document| (seq, document))
                .map_err(|e| Error::storage(format!("Corrupt document #{}: {}", seq, e)))
        })
        .collect()
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn find_one(&self, collection: &str, filter: &Document) -> Result<Option<Document>> {
        Ok(self.find(collection, filter, Some(1)).await?.into_iter().next())
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Document,
        limit: Option<usize>,
    ) -> Result<Vec<Document>> {
        let collection = collection.to_string();
        let filter = filter.clone();

        self.with_conn(move |conn| {
            Ok(candidates(conn, &collection, &filter)?
                .into_iter()
                .map(|(_, document)| document)
                .filter(|document| matches(document, &filter))
                .take(limit.unwrap_or(usize::MAX))
                .collect())
        })
        .await
    }

    async fn insert_one(&self, collection: &str, mut document: Document) -> Result<String> {
        let id = ensure_id(&mut document)?;
        let collection = collection.to_string();
        let body = serde_json::to_string(&document)?;
        let org = organization_of(&document).map(str::to_string);

        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT INTO documents (collection, id, organization_id, body) VALUES (?1, ?2, ?3, ?4)",
                params![collection, id, org, body],
            );
            match inserted {
                Ok(_) => Ok(id),
                Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                    Err(Error::invalid_request(format!("duplicate _id '{}' in {}", id, collection)))
                }
                Err(e) => Err(db_error("Insert error", e)),
            }
        })
        .await
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
        let collection = collection.to_string();
        let filter = filter.clone();

        self.with_conn(move |conn| {
            let target = candidates(conn, &collection, &filter)?
                .into_iter()
                .find(|(_, document)| matches(document, &filter))
                .map(|(seq, _)| seq);

            let Some(seq) = target else {
                return Ok(false);
            };
            let deleted = conn
                .execute("DELETE FROM documents WHERE seq = ?1", params![seq])
                .map_err(|e| db_error("Delete error", e))?;
            Ok(deleted > 0)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marketops_core::doc;
    use serde_json::json;

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("marketops.db");

        let store = SqliteDocumentStore::new(&path).unwrap();
        let id = store
            .insert_one(
                "campaigns",
                doc(json!({"organization_id": "org_a", "name": "Launch", "budget": 500})),
            )
            .await
            .unwrap();
        drop(store);

        let store = SqliteDocumentStore::new(&path).unwrap();
        let found = store
            .find_one("campaigns", &doc(json!({"_id": id, "organization_id": "org_a"})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found["name"], "Launch");
    }

    #[tokio::test]
    async fn test_org_prefilter_and_matcher() {
        let store = SqliteDocumentStore::in_memory().unwrap();
        for (org, budget) in [("org_a", 100), ("org_b", 900), ("org_a", 700)] {
            store
                .insert_one("campaigns", doc(json!({"organization_id": org, "budget": budget})))
                .await
                .unwrap();
        }

        let rich = store
            .find(
                "campaigns",
                &doc(json!({"organization_id": "org_a", "budget": {"$gt": 500}})),
                None,
            )
            .await
            .unwrap();
        assert_eq!(rich.len(), 1);
        assert_eq!(rich[0]["budget"], 700);
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let store = SqliteDocumentStore::in_memory().unwrap();
        for n in 0..3 {
            store
                .insert_one("leads", doc(json!({"organization_id": "org_a", "n": n})))
                .await
                .unwrap();
        }

        let result = store
            .update_many(
                "leads",
                &doc(json!({"n": {"$gte": 1}})),
                &doc(json!({"$set": {"qualified": true}})),
            )
            .await
            .unwrap();
        assert_eq!(result, UpdateResult { matched: 2, modified: 2 });

        let result = store
            .update_one("leads", &doc(json!({"n": 2})), &doc(json!({"$set": {"qualified": true}})))
            .await
            .unwrap();
        assert_eq!(result, UpdateResult { matched: 1, modified: 0 });

        assert!(store.delete_one("leads", &doc(json!({"n": 0}))).await.unwrap());
        assert!(!store.delete_one("leads", &doc(json!({"n": 0}))).await.unwrap());
        assert_eq!(store.find("leads", &Document::new(), None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_id_is_caller_fault() {
        let store = SqliteDocumentStore::in_memory().unwrap();
        store.insert_one("c", doc(json!({"_id": "same"}))).await.unwrap();
        let err = store.insert_one("c", doc(json!({"_id": "same"}))).await.unwrap_err();
        assert!(err.is_caller_fault());
    }
}
