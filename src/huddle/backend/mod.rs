//! Interface to the hosted real-time document database and blob store.
//!
//! The messaging core never talks to a concrete database. Everything goes through
//! [`DocumentStore`] and [`BlobStore`], which the embedding application implements
//! for its provider. [`memory`] holds an in-process implementation of both.

pub mod memory;
mod stream_manager;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::huddle::utils::retry::Retryable;

pub use memory::{InMemoryBlobStore, InMemoryDocumentStore};
pub use stream_manager::{ChangeKind, ChangeNotice};

/// Field map of a stored document.
pub type Fields = serde_json::Map<String, Value>;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

impl Retryable for BackendError {
    fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Unavailable(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionPath(String);

impl CollectionPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn doc(&self, id: impl Into<String>) -> DocumentPath {
        DocumentPath {
            collection: self.clone(),
            id: id.into(),
        }
    }
}

impl std::fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentPath {
    collection: CollectionPath,
    id: String,
}

impl DocumentPath {
    pub fn collection(&self) -> &CollectionPath {
        &self.collection
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl std::fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// Path to a possibly nested field, e.g. `["reactions", "<user id>"]`.
///
/// Segments are kept apart so that ids containing dots stay a single key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn field(name: impl Into<String>) -> Self {
        Self(vec![name.into()])
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

/// A stored document as seen by readers.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Store-assigned identifier, unique within its collection.
    pub id: String,

    pub fields: Fields,

    /// Assigned by the store when the document is first written. Never decreases
    /// within a collection.
    pub create_time: DateTime<Utc>,
}

impl Document {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    pub fn get_bool(&self, field: &str) -> Option<bool> {
        self.fields.get(field).and_then(Value::as_bool)
    }
}

/// Which documents of a collection a reader wants.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    IdEquals(String),
    IdNotEquals(String),
    FieldEquals { field: String, value: Value },
}

impl Filter {
    pub fn matches(&self, document: &Document) -> bool {
        match self {
            Filter::All => true,
            Filter::IdEquals(id) => &document.id == id,
            Filter::IdNotEquals(id) => &document.id != id,
            Filter::FieldEquals { field, value } => document.get(field) == Some(value),
        }
    }
}

/// Full, ordered state of the matching documents at one point in time.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Snapshot {
    pub documents: Vec<Document>,
}

/// Cancels a live subscription. Cancelling must be explicit; a handle dropped
/// without [`SubscriptionHandle::cancel`] still releases the listener but logs a
/// warning, since that points at a missing teardown in the caller.
pub struct SubscriptionHandle {
    label: String,
    canceller: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl SubscriptionHandle {
    pub fn new(label: impl Into<String>, canceller: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            label: label.into(),
            canceller: Some(Box::new(canceller)),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn cancel(mut self) {
        if let Some(canceller) = self.canceller.take() {
            tracing::debug!(
                target: "huddle::backend",
                "Cancelled subscription {}",
                self.label
            );
            canceller();
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(canceller) = self.canceller.take() {
            tracing::warn!(
                target: "huddle::backend",
                "Subscription {} dropped without cancel; releasing listener",
                self.label
            );
            canceller();
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("label", &self.label)
            .field("active", &self.canceller.is_some())
            .finish()
    }
}

/// A stream of snapshots plus the handle that ends it.
#[derive(Debug)]
pub struct DocumentSubscription {
    snapshots: mpsc::UnboundedReceiver<Snapshot>,
    handle: SubscriptionHandle,
}

impl DocumentSubscription {
    pub fn new(snapshots: mpsc::UnboundedReceiver<Snapshot>, handle: SubscriptionHandle) -> Self {
        Self { snapshots, handle }
    }

    /// Waits for the next snapshot. `None` once the store closed the stream.
    pub async fn next(&mut self) -> Option<Snapshot> {
        self.snapshots.recv().await
    }

    pub fn cancel(self) {
        self.handle.cancel();
    }
}

/// Real-time document database collaborator.
///
/// Every call is a suspension point: other snapshots may be delivered before
/// the returned future resolves.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Pushes the current state of the matching documents, then a new snapshot on
    /// every change, until cancelled. Documents are ordered by `create_time`.
    async fn subscribe(
        &self,
        collection: &CollectionPath,
        filter: Filter,
    ) -> Result<DocumentSubscription, BackendError>;

    /// One-shot read of the matching documents, ordered like snapshots.
    async fn list(
        &self,
        collection: &CollectionPath,
        filter: &Filter,
    ) -> Result<Vec<Document>, BackendError>;

    async fn get(&self, path: &DocumentPath) -> Result<Option<Document>, BackendError>;

    /// Creates a document with a store-assigned id and create time.
    async fn write(&self, collection: &CollectionPath, fields: Fields)
    -> Result<Document, BackendError>;

    /// Sets individual fields of an existing document, all or none. Fails with
    /// [`BackendError::NotFound`] if the document does not exist.
    async fn update(
        &self,
        path: &DocumentPath,
        updates: Vec<(FieldPath, Value)>,
    ) -> Result<(), BackendError>;

    /// Applies `updates` only while the field at `guard` still equals `expected`,
    /// checked and written as one step. Returns `false`, writing nothing, when the
    /// field holds something else. An absent field compares equal to `null`.
    async fn update_if(
        &self,
        path: &DocumentPath,
        guard: &FieldPath,
        expected: &Value,
        updates: Vec<(FieldPath, Value)>,
    ) -> Result<bool, BackendError>;

    /// Creates the document at `path` or merges `fields` into it.
    async fn set_merge(&self, path: &DocumentPath, fields: Fields) -> Result<(), BackendError>;

    /// Removes the document. Fails with [`BackendError::NotFound`] if absent.
    async fn delete(&self, path: &DocumentPath) -> Result<(), BackendError>;
}

/// Binary attachment storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores `bytes` at `path` and returns a URL the blob can be fetched from.
    async fn upload_blob(&self, path: &str, bytes: Vec<u8>) -> Result<String, BackendError>;
}
