//! Per-collection broadcast channels for change notifications.
//!
//! Streams are created lazily on first subscribe and cleaned up on the first emit
//! after every receiver has been dropped.

use dashmap::DashMap;
use tokio::sync::broadcast;

use super::CollectionPath;

const BUFFER_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// Tells listeners that one document of a collection changed. Listeners re-read
/// the collection themselves, so a lagging receiver loses nothing but
/// intermediate states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotice {
    pub document_id: String,
    pub kind: ChangeKind,
}

pub(crate) struct ChangeStreamManager {
    streams: DashMap<CollectionPath, broadcast::Sender<ChangeNotice>>,
}

impl ChangeStreamManager {
    pub fn new() -> Self {
        Self {
            streams: DashMap::new(),
        }
    }

    pub fn subscribe(&self, collection: &CollectionPath) -> broadcast::Receiver<ChangeNotice> {
        self.streams
            .entry(collection.clone())
            .or_insert_with(|| broadcast::channel(BUFFER_SIZE).0)
            .subscribe()
    }

    pub fn emit(&self, collection: &CollectionPath, notice: ChangeNotice) {
        if let Some(sender) = self.streams.get(collection) {
            // Attempt to send; if all receivers dropped, clean up
            if sender.send(notice).is_err() && sender.receiver_count() == 0 {
                drop(sender);
                self.streams
                    .remove_if(collection, |_, sender| sender.receiver_count() == 0);
            }
        }
    }

    #[cfg(test)]
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }
}

impl Default for ChangeStreamManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notice(id: &str) -> ChangeNotice {
        ChangeNotice {
            document_id: id.to_string(),
            kind: ChangeKind::Created,
        }
    }

    #[test]
    fn subscribe_creates_new_stream() {
        let manager = ChangeStreamManager::new();
        let users = CollectionPath::new("users");

        assert!(!manager.streams.contains_key(&users));
        let _rx = manager.subscribe(&users);
        assert!(manager.streams.contains_key(&users));
    }

    #[test]
    fn multiple_subscribes_share_sender() {
        let manager = ChangeStreamManager::new();
        let users = CollectionPath::new("users");

        let _rx1 = manager.subscribe(&users);
        let _rx2 = manager.subscribe(&users);

        assert_eq!(manager.stream_count(), 1);
        let sender = manager.streams.get(&users).unwrap();
        assert_eq!(sender.receiver_count(), 2);
    }

    #[tokio::test]
    async fn emit_delivers_to_receivers() {
        let manager = ChangeStreamManager::new();
        let users = CollectionPath::new("users");

        let mut rx = manager.subscribe(&users);
        manager.emit(&users, notice("u1"));

        let received = rx.try_recv().expect("should receive notice");
        assert_eq!(received.document_id, "u1");
    }

    #[test]
    fn emit_without_subscribers_is_noop() {
        let manager = ChangeStreamManager::new();
        let users = CollectionPath::new("users");

        manager.emit(&users, notice("u2"));
        assert!(!manager.streams.contains_key(&users));
    }

    #[test]
    fn emit_cleans_up_when_all_receivers_dropped() {
        let manager = ChangeStreamManager::new();
        let users = CollectionPath::new("users");

        let rx = manager.subscribe(&users);
        drop(rx);
        assert!(manager.streams.contains_key(&users));

        manager.emit(&users, notice("u3"));
        assert!(!manager.streams.contains_key(&users));
    }

    #[test]
    fn different_collections_have_separate_streams() {
        let manager = ChangeStreamManager::new();
        let _rx1 = manager.subscribe(&CollectionPath::new("chats/a_b/messages"));
        let _rx2 = manager.subscribe(&CollectionPath::new("chats/a_c/messages"));
        assert_eq!(manager.stream_count(), 2);
    }
}
