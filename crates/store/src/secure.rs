//! Secure Data Client: the only sanctioned path to persistent storage.
//!
//! Every call validates the query, pins it to the caller's organization and
//! retries transient storage failures. Reads are re-checked document by
//! document; writes are stamped with the caller's organization.

use serde_json::Value;

use marketops_core::{
    Document, DocumentStore, Error, OrganizationId, Result, UpdateResult, ID_FIELD,
};
use marketops_resilience::retry_database_operation;

use crate::isolation::{enforce_tenant_filter, guard_update, stamp_document, validate_tenant_access};
use crate::validator::QueryValidator;

/// Tenant-scoped facade over a [`DocumentStore`].
///
/// The client owns its store; handlers hold the client and never the store.
pub struct SecureDataClient {
    store: Box<dyn DocumentStore>,
    validator: QueryValidator,
}

impl SecureDataClient {
    pub fn new(store: Box<dyn DocumentStore>) -> Self {
        Self {
            store,
            validator: QueryValidator::new(),
        }
    }

    pub fn with_validator(mut self, validator: QueryValidator) -> Self {
        self.validator = validator;
        self
    }

    pub async fn find_one_secure(
        &self,
        collection: &str,
        query: &Document,
        org: &OrganizationId,
    ) -> Result<Option<Document>> {
        let filter = self.scoped_filter(collection, query, org)?;
        let filter = &filter;
        let found = retry_database_operation(
            move || self.store.find_one(collection, filter),
            &format!("{}.find_one", collection),
        )
        .await?;

        if let Some(document) = &found {
            self.check_access(collection, document, org)?;
        }
        Ok(found)
    }

    pub async fn find_secure(
        &self,
        collection: &str,
        query: &Document,
        org: &OrganizationId,
        limit: Option<usize>,
    ) -> Result<Vec<Document>> {
        let filter = self.scoped_filter(collection, query, org)?;
        let filter = &filter;
        let found = retry_database_operation(
            move || self.store.find(collection, filter, limit),
            &format!("{}.find", collection),
        )
        .await?;

        for document in &found {
            self.check_access(collection, document, org)?;
        }
        Ok(found)
    }

    /// Insert a document owned by `org`. Returns the new `_id`.
    pub async fn insert_one_secure(
        &self,
        collection: &str,
        document: Document,
        org: &OrganizationId,
    ) -> Result<String> {
        self.validator
            .validate_document(&document)
            .map_err(|e| self.violation(collection, org, e))?;

        let document = stamp_document(document, org);
        let document = &document;
        retry_database_operation(
            move || self.store.insert_one(collection, document.clone()),
            &format!("{}.insert_one", collection),
        )
        .await
    }

    pub async fn update_one_secure(
        &self,
        collection: &str,
        query: &Document,
        update: &Document,
        org: &OrganizationId,
    ) -> Result<UpdateResult> {
        let filter = self.scoped_filter(collection, query, org)?;
        self.check_update(collection, update, org)?;
        let filter = &filter;
        retry_database_operation(
            move || self.store.update_one(collection, filter, update),
            &format!("{}.update_one", collection),
        )
        .await
    }

    pub async fn update_many_secure(
        &self,
        collection: &str,
        query: &Document,
        update: &Document,
        org: &OrganizationId,
    ) -> Result<UpdateResult> {
        let filter = self.scoped_filter(collection, query, org)?;
        self.check_update(collection, update, org)?;
        let filter = &filter;
        retry_database_operation(
            move || self.store.update_many(collection, filter, update),
            &format!("{}.update_many", collection),
        )
        .await
    }

    pub async fn delete_one_secure(
        &self,
        collection: &str,
        query: &Document,
        org: &OrganizationId,
    ) -> Result<bool> {
        let filter = self.scoped_filter(collection, query, org)?;
        let filter = &filter;
        retry_database_operation(
            move || self.store.delete_one(collection, filter),
            &format!("{}.delete_one", collection),
        )
        .await
    }

    fn scoped_filter(&self, collection: &str, query: &Document, org: &OrganizationId) -> Result<Document> {
        self.validator
            .validate_query(query)
            .and_then(|query| enforce_tenant_filter(query, org))
            .map_err(|e| self.violation(collection, org, e))
    }

    fn check_update(&self, collection: &str, update: &Document, org: &OrganizationId) -> Result<()> {
        self.validator
            .validate_update(update)
            .and_then(guard_update)
            .map_err(|e| self.violation(collection, org, e))
    }

    fn check_access(&self, collection: &str, document: &Document, org: &OrganizationId) -> Result<()> {
        validate_tenant_access(document, org).map_err(|e| {
            let id = document.get(ID_FIELD).and_then(Value::as_str).unwrap_or("?");
            tracing::error!(collection, organization = %org, document_id = id, "Store returned a document outside the caller's scope");
            self.violation(collection, org, e)
        })
    }

    /// Log and count a security violation, then hand the error back.
    fn violation(&self, collection: &str, org: &OrganizationId, error: Error) -> Error {
        if let Some(kind) = error.violation() {
            tracing::warn!(
                collection,
                organization = %org,
                violation = %kind,
                "Security violation blocked"
            );
            metrics::counter!(
                "security_violations_total",
                "collection" => collection.to_string(),
                "kind" => kind.to_string()
            )
            .increment(1);
        }
        error
    }
}
