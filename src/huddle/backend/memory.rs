//! In-process document and blob stores.
//!
//! Behave like the hosted collaborators as far as the messaging core can tell:
//! store-assigned ids and create times, ordered snapshots pushed on every change,
//! and an offline switch that turns every call into [`BackendError::Unavailable`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{broadcast::error::RecvError, mpsc};

use super::stream_manager::{ChangeKind, ChangeNotice, ChangeStreamManager};
use super::{
    BackendError, BlobStore, CollectionPath, Document, DocumentPath, DocumentStore,
    DocumentSubscription, FieldPath, Fields, Filter, Snapshot, SubscriptionHandle,
};

struct StoredDocument {
    sequence: u64,
    document: Document,
}

#[derive(Default)]
struct Collection {
    documents: HashMap<String, StoredDocument>,
    last_create_time: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Inner {
    collections: DashMap<CollectionPath, Collection>,
    streams: ChangeStreamManager,
    offline: AtomicBool,
    failing_writes: AtomicUsize,
    sequence: AtomicU64,
}

impl Inner {
    fn snapshot(&self, collection: &CollectionPath, filter: &Filter) -> Snapshot {
        let Some(entry) = self.collections.get(collection) else {
            return Snapshot::default();
        };
        let mut stored: Vec<&StoredDocument> = entry
            .documents
            .values()
            .filter(|stored| filter.matches(&stored.document))
            .collect();
        stored.sort_by(|a, b| {
            a.document
                .create_time
                .cmp(&b.document.create_time)
                .then(a.sequence.cmp(&b.sequence))
        });
        Snapshot {
            documents: stored.into_iter().map(|s| s.document.clone()).collect(),
        }
    }

    fn ensure_online(&self) -> Result<(), BackendError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("backend offline".to_string()));
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<(), BackendError> {
        self.ensure_online()?;
        let consumed = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if consumed.is_ok() {
            return Err(BackendError::Unavailable(
                "simulated write failure".to_string(),
            ));
        }
        Ok(())
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }
}

/// Document store kept entirely in memory. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct InMemoryDocumentStore {
    inner: Arc<Inner>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates losing (or regaining) the network connection.
    pub fn set_offline(&self, offline: bool) {
        tracing::debug!(
            target: "huddle::backend::memory",
            "Document store offline: {}",
            offline
        );
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    pub fn is_offline(&self) -> bool {
        self.inner.offline.load(Ordering::SeqCst)
    }

    /// Makes the next `count` mutating calls fail with a transient error.
    pub fn fail_next_writes(&self, count: usize) {
        self.inner.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Applies every update or none of them, under the collection lock. With a
    /// guard, nothing is written unless the guarded field holds `expected`.
    fn apply_updates(
        &self,
        path: &DocumentPath,
        guard: Option<(&FieldPath, &Value)>,
        updates: Vec<(FieldPath, Value)>,
    ) -> Result<bool, BackendError> {
        self.inner.ensure_writable()?;

        {
            let mut entry = self
                .inner
                .collections
                .get_mut(path.collection())
                .ok_or_else(|| BackendError::NotFound(path.to_string()))?;
            let stored = entry
                .documents
                .get_mut(path.id())
                .ok_or_else(|| BackendError::NotFound(path.to_string()))?;

            if let Some((field_path, expected)) = guard {
                let current = get_nested(&stored.document.fields, field_path);
                if current.unwrap_or(&Value::Null) != expected {
                    return Ok(false);
                }
            }

            let mut fields = stored.document.fields.clone();
            for (field_path, value) in updates {
                set_nested(&mut fields, &field_path, value)
                    .ok_or_else(|| BackendError::InvalidPath(path.to_string()))?;
            }
            stored.document.fields = fields;
        }

        self.inner.streams.emit(
            path.collection(),
            ChangeNotice {
                document_id: path.id().to_string(),
                kind: ChangeKind::Updated,
            },
        );
        Ok(true)
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn subscribe(
        &self,
        collection: &CollectionPath,
        filter: Filter,
    ) -> Result<DocumentSubscription, BackendError> {
        self.inner.ensure_online()?;

        // Listen before reading so no change can slip between the two.
        let mut changes = self.inner.streams.subscribe(collection);
        let (sender, receiver) = mpsc::unbounded_channel();

        let initial = self.inner.snapshot(collection, &filter);
        let mut last = initial.clone();
        let _ = sender.send(initial);

        let inner = Arc::clone(&self.inner);
        let watched = collection.clone();
        let task = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(_) | Err(RecvError::Lagged(_)) => {
                        let snapshot = inner.snapshot(&watched, &filter);
                        if snapshot == last {
                            continue;
                        }
                        last = snapshot.clone();
                        if sender.send(snapshot).is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let abort = task.abort_handle();
        Ok(DocumentSubscription::new(
            receiver,
            SubscriptionHandle::new(collection.to_string(), move || abort.abort()),
        ))
    }

    async fn list(
        &self,
        collection: &CollectionPath,
        filter: &Filter,
    ) -> Result<Vec<Document>, BackendError> {
        self.inner.ensure_online()?;
        Ok(self.inner.snapshot(collection, filter).documents)
    }

    async fn get(&self, path: &DocumentPath) -> Result<Option<Document>, BackendError> {
        self.inner.ensure_online()?;
        Ok(self
            .inner
            .collections
            .get(path.collection())
            .and_then(|c| c.documents.get(path.id()).map(|s| s.document.clone())))
    }

    async fn write(
        &self,
        collection: &CollectionPath,
        fields: Fields,
    ) -> Result<Document, BackendError> {
        self.inner.ensure_writable()?;

        let document = {
            let mut entry = self.inner.collections.entry(collection.clone()).or_default();
            let now = Utc::now();
            let create_time = match entry.last_create_time {
                Some(last) if last > now => last,
                _ => now,
            };
            entry.last_create_time = Some(create_time);

            let document = Document {
                id: uuid::Uuid::new_v4().simple().to_string(),
                fields,
                create_time,
            };
            entry.documents.insert(
                document.id.clone(),
                StoredDocument {
                    sequence: self.inner.next_sequence(),
                    document: document.clone(),
                },
            );
            document
        };

        self.inner.streams.emit(
            collection,
            ChangeNotice {
                document_id: document.id.clone(),
                kind: ChangeKind::Created,
            },
        );
        Ok(document)
    }

    async fn update(
        &self,
        path: &DocumentPath,
        updates: Vec<(FieldPath, Value)>,
    ) -> Result<(), BackendError> {
        self.apply_updates(path, None, updates).map(|_| ())
    }

    async fn update_if(
        &self,
        path: &DocumentPath,
        guard: &FieldPath,
        expected: &Value,
        updates: Vec<(FieldPath, Value)>,
    ) -> Result<bool, BackendError> {
        self.apply_updates(path, Some((guard, expected)), updates)
    }

    async fn set_merge(&self, path: &DocumentPath, fields: Fields) -> Result<(), BackendError> {
        self.inner.ensure_writable()?;

        let kind = {
            let mut entry = self
                .inner
                .collections
                .entry(path.collection().clone())
                .or_default();
            match entry.documents.get_mut(path.id()) {
                Some(stored) => {
                    stored.document.fields.extend(fields);
                    ChangeKind::Updated
                }
                None => {
                    let now = Utc::now();
                    let create_time = match entry.last_create_time {
                        Some(last) if last > now => last,
                        _ => now,
                    };
                    entry.last_create_time = Some(create_time);
                    entry.documents.insert(
                        path.id().to_string(),
                        StoredDocument {
                            sequence: self.inner.next_sequence(),
                            document: Document {
                                id: path.id().to_string(),
                                fields,
                                create_time,
                            },
                        },
                    );
                    ChangeKind::Created
                }
            }
        };

        self.inner.streams.emit(
            path.collection(),
            ChangeNotice {
                document_id: path.id().to_string(),
                kind,
            },
        );
        Ok(())
    }

    async fn delete(&self, path: &DocumentPath) -> Result<(), BackendError> {
        self.inner.ensure_writable()?;

        let removed = self
            .inner
            .collections
            .get_mut(path.collection())
            .and_then(|mut entry| entry.documents.remove(path.id()));
        if removed.is_none() {
            return Err(BackendError::NotFound(path.to_string()));
        }

        self.inner.streams.emit(
            path.collection(),
            ChangeNotice {
                document_id: path.id().to_string(),
                kind: ChangeKind::Deleted,
            },
        );
        Ok(())
    }
}

fn get_nested<'a>(fields: &'a Fields, path: &FieldPath) -> Option<&'a Value> {
    let (first, rest) = path.segments().split_first()?;
    rest.iter()
        .try_fold(fields.get(first)?, |value, segment| value.get(segment))
}

/// Writes `value` at `path`, creating intermediate objects as needed.
fn set_nested(fields: &mut Fields, path: &FieldPath, value: Value) -> Option<()> {
    let (last, parents) = path.segments().split_last()?;
    let mut current = fields;
    for segment in parents {
        let slot = current
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Fields::new()));
        if !slot.is_object() {
            *slot = Value::Object(Fields::new());
        }
        current = slot.as_object_mut()?;
    }
    current.insert(last.clone(), value);
    Some(())
}

/// Blob store kept in memory. URLs use the `memory://` scheme.
#[derive(Clone, Default)]
pub struct InMemoryBlobStore {
    blobs: Arc<DashMap<String, Vec<u8>>>,
    offline: Arc<AtomicBool>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.blobs.get(path).map(|b| b.value().clone())
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn upload_blob(&self, path: &str, bytes: Vec<u8>) -> Result<String, BackendError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("blob store offline".to_string()));
        }
        if path.is_empty() {
            return Err(BackendError::InvalidPath(path.to_string()));
        }
        self.blobs.insert(path.to_string(), bytes);
        Ok(format!("memory://{}", path))
    }
}
