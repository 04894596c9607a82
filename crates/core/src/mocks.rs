//! Mock implementations of core traits for testing.
//!
//! Shared by the unit and integration tests of every crate in the workspace.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::{
    traits::{DocumentStore, HttpRequest, HttpResponse, HttpTransport},
    types::{Document, UpdateResult},
    Error, Result,
};

// =============================================================================
// Scripted HTTP transport
// =============================================================================

/// Transport that replays a queue of outcomes and records every request.
///
/// Once the script runs out, the fallback response is returned (if set),
/// otherwise an internal error.
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<HttpResponse>>>,
    fallback: Option<HttpResponse>,
    requests: Mutex<Vec<HttpRequest>>,
    calls: AtomicUsize,
}

impl ScriptedTransport {
    /// Create a transport replaying `script` in order.
    pub fn new(script: Vec<Result<HttpResponse>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Transport that always answers with `response`.
    pub fn always(response: HttpResponse) -> Self {
        Self::new(Vec::new()).with_fallback(response)
    }

    /// Response used after the script is exhausted.
    pub fn with_fallback(mut self, response: HttpResponse) -> Self {
        self.fallback = Some(response);
        self
    }

    /// Number of `send` calls.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests received so far.
    pub async fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().await.push(request);

        match self.script.lock().await.pop_front() {
            Some(outcome) => outcome,
            None => self
                .fallback
                .clone()
                .ok_or_else(|| Error::internal("scripted transport exhausted")),
        }
    }
}

// =============================================================================
// Recording document store
// =============================================================================

/// Wraps a [`DocumentStore`] and counts every call that reaches it.
///
/// The counter is shared, so a test can keep a handle after moving the store
/// into the component under test.
pub struct RecordingDocumentStore<S> {
    inner: S,
    calls: Arc<AtomicUsize>,
    last_filter: Arc<Mutex<Option<Document>>>,
}

/// Test-side view of a [`RecordingDocumentStore`].
#[derive(Clone)]
pub struct StoreRecorder {
    calls: Arc<AtomicUsize>,
    last_filter: Arc<Mutex<Option<Document>>>,
}

impl StoreRecorder {
    /// Calls that reached the inner store.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Filter passed with the most recent read/update/delete.
    pub async fn last_filter(&self) -> Option<Document> {
        self.last_filter.lock().await.clone()
    }
}

impl<S: DocumentStore> RecordingDocumentStore<S> {
    /// Wrap `inner`, returning the store and a handle onto its counters.
    pub fn new(inner: S) -> (Self, StoreRecorder) {
        let calls = Arc::new(AtomicUsize::new(0));
        let last_filter = Arc::new(Mutex::new(None));
        let recorder = StoreRecorder {
            calls: calls.clone(),
            last_filter: last_filter.clone(),
        };
        (
            Self {
                inner,
                calls,
                last_filter,
            },
            recorder,
        )
    }

    async fn record(&self, filter: Option<&Document>) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(filter) = filter {
            *self.last_filter.lock().await = Some(filter.clone());
        }
    }
}

#[async_trait]
impl<S: DocumentStore> DocumentStore for RecordingDocumentStore<S> {
    async fn find_one(&self, collection: &str, filter: &Document) -> Result<Option<Document>> {
        self.record(Some(filter)).await;
        self.inner.find_one(collection, filter).await
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Document,
        limit: Option<usize>,
    ) -> Result<Vec<Document>> {
        self.record(Some(filter)).await;
        self.inner.find(collection, filter, limit).await
    }

    async fn insert_one(&self, collection: &str, document: Document) -> Result<String> {
        self.record(None).await;
        self.inner.insert_one(collection, document).await
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
    ) -> Result<UpdateResult> {
        self.record(Some(filter)).await;
        self.inner.update_one(collection, filter, update).await
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
    ) -> Result<UpdateResult> {
        self.record(Some(filter)).await;
        self.inner.update_many(collection, filter, update).await
    }

    async fn delete_one(&self, collection: &str, filter: &Document) -> Result<bool> {
        self.record(Some(filter)).await;
        self.inner.delete_one(collection, filter).await
    }
}

/// Store that fails every call with a storage error a fixed number of times
/// before delegating. Used to exercise database retries.
pub struct FlakyDocumentStore<S> {
    inner: S,
    remaining_failures: AtomicUsize,
    attempts: Arc<AtomicUsize>,
}

impl<S: DocumentStore> FlakyDocumentStore<S> {
    /// Fail the first `failures` calls.
    pub fn new(inner: S, failures: usize) -> (Self, Arc<AtomicUsize>) {
        let attempts = Arc::new(AtomicUsize::new(0));
        (
            Self {
                inner,
                remaining_failures: AtomicUsize::new(failures),
                attempts: attempts.clone(),
            },
            attempts,
        )
    }

    fn trip(&self) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(Error::storage("connection reset by peer"));
        }
        Ok(())
    }
}

#[async_trait]
impl<S: DocumentStore> DocumentStore for FlakyDocumentStore<S> {
    async fn find_one(&self, collection: &str, filter: &Document) -> Result<Option<Document>> {
        self.trip()?;
        self.inner.find_one(collection, filter).await
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Document,
        limit: Option<usize>,
    ) -> Result<Vec<Document>> {
        self.trip()?;
        self.inner.find(collection, filter, limit).await
    }

    async fn insert_one(&self, collection: &str, document: Document) -> Result<String> {
        self.trip()?;
        self.inner.insert_one(collection, document).await
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
    ) -> Result<UpdateResult> {
        self.trip()?;
        self.inner.update_one(collection, filter, update).await
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
    ) -> Result<UpdateResult> {
        self.trip()?;
        self.inner.update_many(collection, filter, update).await
    }

    async fn delete_one(&self, collection: &str, filter: &Document) -> Result<bool> {
        self.trip()?;
        self.inner.delete_one(collection, filter).await
    }
}
