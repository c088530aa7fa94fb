use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::huddle::{
    HuddleConfig,
    backend::{
        BackendError, BlobStore, CollectionPath, Document, DocumentPath, DocumentStore,
        DocumentSubscription, FieldPath, Fields, Filter,
    },
    conversation::ConversationKey,
    delivery::{DeliveryStatus, Transition},
    error::{HuddleError, Result},
    reactions::{ReactionLedger, validate_reaction},
    rich_content::{Decoded, RichContent, decode, encode},
    session::{Session, UserId},
    utils::retry::{RetryConfig, execute_with_retry},
};

const FIELD_TEXT: &str = "text";
const FIELD_SENDER: &str = "sender";
const FIELD_STATUS: &str = "status";
const FIELD_IMAGE: &str = "image";
const FIELD_AUDIO: &str = "audio";
const FIELD_REACTIONS: &str = "reactions";
const FIELD_REPLY_TO: &str = "replyTo";

/// Concurrent status writers can only advance a message twice before it is read.
const STATUS_WRITE_ATTEMPTS: usize = 4;

/// Store-assigned message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Image,
    Audio,
}

/// Uploaded media referenced by a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Attachment {
    Image { url: String },
    Audio { url: String },
}

impl Attachment {
    pub fn kind(&self) -> AttachmentKind {
        match self {
            Attachment::Image { .. } => AttachmentKind::Image,
            Attachment::Audio { .. } => AttachmentKind::Audio,
        }
    }

    pub fn url(&self) -> &str {
        match self {
            Attachment::Image { url } | Attachment::Audio { url } => url,
        }
    }
}

/// A message of a direct conversation, as delivered in snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_key: ConversationKey,
    pub sender_id: UserId,

    /// Assigned by the store when the message was written.
    pub timestamp: DateTime<Utc>,

    /// Encoded rich content; empty for attachment-only messages.
    pub text: String,

    pub status: DeliveryStatus,
    pub reactions: ReactionLedger,
    pub reply_to: Option<MessageId>,
    pub attachment: Option<Attachment>,
}

impl Message {
    /// Decoded text content, `None` when the message carries no text.
    pub fn content(&self) -> Option<Decoded> {
        if self.text.is_empty() {
            None
        } else {
            Some(decode(&self.text))
        }
    }

    pub fn has_text(&self) -> bool {
        !self.text.is_empty()
    }

    pub fn is_from(&self, user_id: &UserId) -> bool {
        &self.sender_id == user_id
    }

    /// One-line summary used by conversation lists and reply quotes.
    pub fn preview_text(&self) -> String {
        if let Some(content) = self.content() {
            return content.preview().to_string();
        }
        match &self.attachment {
            Some(Attachment::Image { .. }) => "Image".to_string(),
            Some(Attachment::Audio { .. }) => "Audio message".to_string(),
            None => String::new(),
        }
    }

    pub(crate) fn from_document(key: &ConversationKey, document: &Document) -> Self {
        let non_empty = |field: &str| {
            document
                .get_str(field)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let attachment = match (non_empty(FIELD_IMAGE), non_empty(FIELD_AUDIO)) {
            (Some(url), _) => Some(Attachment::Image { url }),
            (None, Some(url)) => Some(Attachment::Audio { url }),
            (None, None) => None,
        };

        Self {
            id: MessageId::new(document.id.clone()),
            conversation_key: key.clone(),
            sender_id: UserId::new(document.get_str(FIELD_SENDER).unwrap_or_default()),
            timestamp: document.create_time,
            text: document.get_str(FIELD_TEXT).unwrap_or_default().to_string(),
            status: status_of(document),
            reactions: ReactionLedger::from_value(document.get(FIELD_REACTIONS)),
            reply_to: non_empty(FIELD_REPLY_TO).map(MessageId::new),
            attachment,
        }
    }
}

fn status_of(document: &Document) -> DeliveryStatus {
    document
        .get_str(FIELD_STATUS)
        .and_then(|s| s.parse().ok())
        .unwrap_or_default()
}

fn status_update(status: DeliveryStatus) -> Vec<(FieldPath, Value)> {
    vec![(
        FieldPath::field(FIELD_STATUS),
        Value::String(status.as_str().to_string()),
    )]
}

/// What the user composed. Borrowed by [`MessageStore::send`], so a failed send
/// leaves it intact for a manual retry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutgoingMessage {
    pub content: Option<RichContent>,
    pub attachment: Option<Attachment>,
    pub reply_to: Option<MessageId>,
}

impl OutgoingMessage {
    pub fn text(content: RichContent) -> Self {
        Self {
            content: Some(content),
            ..Default::default()
        }
    }

    pub fn attachment(attachment: Attachment) -> Self {
        Self {
            attachment: Some(attachment),
            ..Default::default()
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }

    pub fn replying_to(mut self, message_id: MessageId) -> Self {
        self.reply_to = Some(message_id);
        self
    }

    pub fn has_payload(&self) -> bool {
        self.content.as_ref().is_some_and(|c| !c.is_blank()) || self.attachment.is_some()
    }

    fn to_fields(&self, sender: &UserId) -> Result<Fields> {
        let text = match &self.content {
            Some(content) if !content.is_blank() => encode(content)?,
            _ => String::new(),
        };
        let (image, audio) = match &self.attachment {
            Some(Attachment::Image { url }) => (url.clone(), String::new()),
            Some(Attachment::Audio { url }) => (String::new(), url.clone()),
            None => (String::new(), String::new()),
        };

        let mut fields = Fields::new();
        fields.insert(FIELD_TEXT.to_string(), Value::String(text));
        fields.insert(
            FIELD_SENDER.to_string(),
            Value::String(sender.as_str().to_string()),
        );
        fields.insert(
            FIELD_STATUS.to_string(),
            Value::String(DeliveryStatus::Sent.as_str().to_string()),
        );
        fields.insert(FIELD_IMAGE.to_string(), Value::String(image));
        fields.insert(FIELD_AUDIO.to_string(), Value::String(audio));
        fields.insert(FIELD_REACTIONS.to_string(), Value::Object(Fields::new()));
        fields.insert(
            FIELD_REPLY_TO.to_string(),
            self.reply_to
                .as_ref()
                .map_or(Value::Null, |id| Value::String(id.as_str().to_string())),
        );
        Ok(fields)
    }
}

/// Sole writer of conversation message logs.
#[derive(Clone)]
pub struct MessageStore {
    store: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    session: Session,
    chats_root: String,
    retry: RetryConfig,
}

impl MessageStore {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        session: Session,
        config: &HuddleConfig,
    ) -> Self {
        Self {
            store,
            blobs,
            session,
            chats_root: config.chats_collection.clone(),
            retry: config.retry,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Subscribes to the ordered message log of `key`.
    ///
    /// The stream must be cancelled before subscribing to another conversation;
    /// [`ActiveConversation`] takes care of that.
    pub async fn subscribe(&self, key: &ConversationKey) -> Result<MessageStream> {
        self.ensure_participant(key)?;
        let collection = key.messages_collection(&self.chats_root);
        let subscription = self.store.subscribe(&collection, Filter::All).await?;

        tracing::debug!(
            target: "huddle::messages::subscribe",
            "Subscribed to conversation {} as {}",
            key,
            self.session.user_id()
        );

        Ok(MessageStream {
            subscription,
            store: Arc::clone(&self.store),
            session: self.session.clone(),
            key: key.clone(),
            collection,
        })
    }

    /// One-shot read of the whole conversation, ascending by timestamp.
    pub async fn fetch_messages(&self, key: &ConversationKey) -> Result<Vec<Message>> {
        let collection = key.messages_collection(&self.chats_root);
        let documents = self.store.list(&collection, &Filter::All).await?;
        let mut messages: Vec<Message> = documents
            .iter()
            .map(|d| Message::from_document(key, d))
            .collect();
        messages.sort_by_key(|m| m.timestamp);
        Ok(messages)
    }

    pub async fn last_message(&self, key: &ConversationKey) -> Result<Option<Message>> {
        Ok(self.fetch_messages(key).await?.pop())
    }

    /// Writes a new message and advances it to `delivered` once acknowledged.
    ///
    /// # Errors
    ///
    /// - [`HuddleError::Validation`] if there is neither text nor an attachment, or the
    ///   session user is not part of `key`.
    /// - [`HuddleError::RetriesExhausted`] if the store stayed unreachable.
    pub async fn send(&self, key: &ConversationKey, outgoing: &OutgoingMessage) -> Result<Message> {
        self.ensure_participant(key)?;
        if !outgoing.has_payload() {
            return Err(HuddleError::Validation(
                "message has no text or attachment".to_string(),
            ));
        }

        let fields = outgoing.to_fields(self.session.user_id())?;
        let collection = key.messages_collection(&self.chats_root);
        let document = self
            .with_retry("send message", || {
                self.store.write(&collection, fields.clone())
            })
            .await?;
        let mut message = Message::from_document(key, &document);

        tracing::debug!(
            target: "huddle::messages::send",
            "Message {} written to {}",
            message.id,
            key
        );

        // Only the checkmarks depend on this; the message itself is stored.
        match self
            .set_status(key, &message.id, DeliveryStatus::Delivered)
            .await
        {
            Ok(transition) => message.status = transition.status(),
            Err(e) => tracing::warn!(
                target: "huddle::messages::send",
                "Failed to mark message {} delivered: {}",
                message.id,
                e
            ),
        }

        Ok(message)
    }

    /// Moves a message forward to `status`. Backward or repeated transitions are
    /// no-ops and reported as [`Transition::Ignored`].
    ///
    /// The write only lands if the stored status is still the one the transition
    /// was computed from. When another writer got there first, the message is
    /// re-read and the transition recomputed, so a `read` is never overwritten.
    pub async fn set_status(
        &self,
        key: &ConversationKey,
        message_id: &MessageId,
        status: DeliveryStatus,
    ) -> Result<Transition> {
        let path = self.message_path(key, message_id);
        let guard = FieldPath::field(FIELD_STATUS);

        for _ in 0..STATUS_WRITE_ATTEMPTS {
            let document = self
                .store
                .get(&path)
                .await?
                .ok_or_else(|| HuddleError::MessageNotFound(message_id.to_string()))?;

            let transition = status_of(&document).advance(status);
            if let Transition::Ignored { current, requested } = transition {
                tracing::debug!(
                    target: "huddle::messages::set_status",
                    "Ignoring {} -> {} for message {}",
                    current,
                    requested,
                    message_id
                );
                return Ok(transition);
            }

            let expected = document
                .fields
                .get(FIELD_STATUS)
                .cloned()
                .unwrap_or(Value::Null);
            let applied = self
                .store
                .update_if(&path, &guard, &expected, status_update(status))
                .await
                .map_err(|e| not_found_as_missing(e.into(), message_id))?;
            if applied {
                return Ok(transition);
            }

            tracing::debug!(
                target: "huddle::messages::set_status",
                "Status of message {} changed concurrently, re-reading",
                message_id
            );
        }

        Err(HuddleError::Other(anyhow::anyhow!(
            "status of message {} kept changing during update",
            message_id
        )))
    }

    /// Permanently removes a message. Replies that quote it render a placeholder.
    pub async fn delete(&self, key: &ConversationKey, message_id: &MessageId) -> Result<()> {
        self.ensure_participant(key)?;
        let path = self.message_path(key, message_id);
        self.with_retry("delete message", || self.store.delete(&path))
            .await
            .map_err(|e| not_found_as_missing(e, message_id))?;

        tracing::debug!(
            target: "huddle::messages::delete",
            "Deleted message {} from {}",
            message_id,
            key
        );
        Ok(())
    }

    /// Sets the session user's reaction on a message, replacing any earlier one.
    pub async fn react(
        &self,
        key: &ConversationKey,
        message_id: &MessageId,
        emoji: &str,
    ) -> Result<()> {
        self.ensure_participant(key)?;
        let emoji = validate_reaction(emoji)?;
        let path = self.message_path(key, message_id);
        let field = FieldPath::new([FIELD_REACTIONS, self.session.user_id().as_str()]);

        self.with_retry("react to message", || {
            self.store
                .update(&path, vec![(field.clone(), Value::String(emoji.clone()))])
        })
        .await
        .map_err(|e| not_found_as_missing(e, message_id))
    }

    /// Uploads media for a message about to be sent.
    pub async fn upload_attachment(
        &self,
        kind: AttachmentKind,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<Attachment> {
        let millis = Utc::now().timestamp_millis();
        let path = match kind {
            AttachmentKind::Image => format!("chat_images/{}_{}", millis, file_name),
            AttachmentKind::Audio => format!("voice_messages/{}_audio.webm", millis),
        };

        let url = self
            .with_retry("upload attachment", || {
                self.blobs.upload_blob(&path, bytes.clone())
            })
            .await?;

        Ok(match kind {
            AttachmentKind::Image => Attachment::Image { url },
            AttachmentKind::Audio => Attachment::Audio { url },
        })
    }

    fn ensure_participant(&self, key: &ConversationKey) -> Result<()> {
        if key.includes(self.session.user_id()) {
            Ok(())
        } else {
            Err(HuddleError::Validation(format!(
                "{} is not a participant of conversation {}",
                self.session.user_id(),
                key
            )))
        }
    }

    fn message_path(&self, key: &ConversationKey, message_id: &MessageId) -> DocumentPath {
        key.messages_collection(&self.chats_root)
            .doc(message_id.as_str())
    }

    async fn with_retry<T, F, Fut>(&self, operation: &str, attempt_fn: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = core::result::Result<T, BackendError>>,
    {
        execute_with_retry(
            operation,
            &self.retry,
            attempt_fn,
            |attempt, max_attempts, delay, err| {
                tracing::warn!(
                    target: "huddle::messages::retry",
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    operation,
                    attempt,
                    max_attempts,
                    delay,
                    err
                );
            },
        )
        .await
        .map_err(HuddleError::from)
    }
}

fn not_found_as_missing(err: HuddleError, message_id: &MessageId) -> HuddleError {
    match err {
        HuddleError::TransientIo(BackendError::NotFound(_)) => {
            HuddleError::MessageNotFound(message_id.to_string())
        }
        other => other,
    }
}

/// Live, ordered view of one conversation.
///
/// Every snapshot it yields also marks the other participant's unread messages as
/// read. Those writes are best effort: the snapshot itself may still show them as
/// `delivered`.
pub struct MessageStream {
    subscription: DocumentSubscription,
    store: Arc<dyn DocumentStore>,
    session: Session,
    key: ConversationKey,
    collection: CollectionPath,
}

impl MessageStream {
    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    /// Waits for the next snapshot. `None` once the stream has closed.
    pub async fn next(&mut self) -> Option<Vec<Message>> {
        let snapshot = self.subscription.next().await?;
        let mut messages: Vec<Message> = snapshot
            .documents
            .iter()
            .map(|d| Message::from_document(&self.key, d))
            .collect();
        messages.sort_by_key(|m| m.timestamp);

        self.mark_inbound_read(&messages).await;
        Some(messages)
    }

    pub fn cancel(self) {
        tracing::debug!(
            target: "huddle::messages::subscribe",
            "Unsubscribing from conversation {}",
            self.key
        );
        self.subscription.cancel();
    }

    async fn mark_inbound_read(&self, messages: &[Message]) {
        let unread: Vec<&Message> = messages
            .iter()
            .filter(|m| !self.session.is_current_user(&m.sender_id))
            .filter(|m| m.status != DeliveryStatus::Read)
            .collect();
        if unread.is_empty() {
            return;
        }

        let results = join_all(unread.iter().map(|message| {
            let path = self.collection.doc(message.id.as_str());
            async move {
                let result = self
                    .store
                    .update(&path, status_update(DeliveryStatus::Read))
                    .await;
                (message.id.clone(), result)
            }
        }))
        .await;

        for (message_id, result) in results {
            if let Err(e) = result {
                tracing::warn!(
                    target: "huddle::messages::read",
                    "Failed to mark message {} read: {}",
                    message_id,
                    e
                );
            }
        }
    }
}

/// The conversation currently on screen. Switching always releases the previous
/// subscription before opening the next one.
pub struct ActiveConversation {
    messages: MessageStore,
    current: Option<MessageStream>,
}

impl ActiveConversation {
    pub fn new(messages: MessageStore) -> Self {
        Self {
            messages,
            current: None,
        }
    }

    pub fn key(&self) -> Option<&ConversationKey> {
        self.current.as_ref().map(MessageStream::key)
    }

    pub async fn open(&mut self, key: &ConversationKey) -> Result<()> {
        self.close();
        self.current = Some(self.messages.subscribe(key).await?);
        Ok(())
    }

    /// Next snapshot of the open conversation; `None` if nothing is open.
    pub async fn next(&mut self) -> Option<Vec<Message>> {
        self.current.as_mut()?.next().await
    }

    pub fn close(&mut self) {
        if let Some(stream) = self.current.take() {
            stream.cancel();
        }
    }
}

impl Drop for ActiveConversation {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::huddle::backend::{InMemoryBlobStore, InMemoryDocumentStore};
    use crate::huddle::test_utils::{create_test_config, next_matching};
    use serde_json::json;

    struct Pair {
        backend: InMemoryDocumentStore,
        blobs: InMemoryBlobStore,
        alice: MessageStore,
        bob: MessageStore,
        key: ConversationKey,
    }

    fn setup() -> Pair {
        let (config, _logs) = create_test_config();
        let backend = InMemoryDocumentStore::new();
        let blobs = InMemoryBlobStore::new();
        let store = |user: &str| {
            MessageStore::new(
                Arc::new(backend.clone()),
                Arc::new(blobs.clone()),
                Session::new(user),
                &config,
            )
        };
        let alice = store("alice");
        let bob = store("bob");
        let key = alice.session().conversation_with(&UserId::from("bob"));
        Pair {
            backend,
            blobs,
            alice,
            bob,
            key,
        }
    }

    fn hello() -> OutgoingMessage {
        OutgoingMessage::text(RichContent::plain("Hello"))
    }

    #[tokio::test]
    async fn send_rejects_empty_payload() {
        let pair = setup();
        for outgoing in [
            OutgoingMessage::default(),
            OutgoingMessage::text(RichContent::plain("   ")),
        ] {
            let err = pair.alice.send(&pair.key, &outgoing).await.unwrap_err();
            assert!(matches!(err, HuddleError::Validation(_)));
        }
        assert!(pair.alice.fetch_messages(&pair.key).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_outside_conversation_is_rejected() {
        let pair = setup();
        let other = ConversationKey::derive(&UserId::from("bob"), &UserId::from("carol"));
        let err = pair.alice.send(&other, &hello()).await.unwrap_err();
        assert!(matches!(err, HuddleError::Validation(_)));
    }

    #[tokio::test]
    async fn send_stores_message_and_marks_it_delivered() {
        let pair = setup();
        let sent = pair.alice.send(&pair.key, &hello()).await.unwrap();

        assert_eq!(sent.status, DeliveryStatus::Delivered);
        assert_eq!(sent.sender_id, UserId::from("alice"));
        assert_eq!(sent.conversation_key, pair.key);
        assert_eq!(sent.content().unwrap().visible_text(), "Hello");
        assert!(sent.reactions.is_empty());

        let stored = pair.bob.fetch_messages(&pair.key).await.unwrap();
        assert_eq!(stored, vec![sent]);
    }

    #[tokio::test]
    async fn stored_fields_keep_legacy_names() {
        let pair = setup();
        let sent = pair.alice.send(&pair.key, &hello()).await.unwrap();
        let doc = pair
            .backend
            .get(&pair.key.messages_collection("chats").doc(sent.id.as_str()))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(doc.get_str("sender"), Some("alice"));
        assert_eq!(doc.get_str("status"), Some("delivered"));
        assert_eq!(doc.get_str("image"), Some(""));
        assert_eq!(doc.get("replyTo"), Some(&Value::Null));
        assert_eq!(doc.get("reactions"), Some(&json!({})));
    }

    #[test]
    fn new_messages_are_written_as_sent() {
        let fields = hello()
            .replying_to(MessageId::new("m0"))
            .to_fields(&UserId::from("alice"))
            .unwrap();
        assert_eq!(fields.get("status"), Some(&json!("sent")));
        assert_eq!(fields.get("replyTo"), Some(&json!("m0")));
        assert_eq!(fields.get("audio"), Some(&json!("")));
        let text = fields.get("text").and_then(Value::as_str).unwrap();
        assert_eq!(decode(text).visible_text(), "Hello");
    }

    #[tokio::test]
    async fn attachment_only_message_is_accepted() {
        let pair = setup();
        let attachment = pair
            .alice
            .upload_attachment(AttachmentKind::Image, "cat.png", vec![1, 2, 3])
            .await
            .unwrap();
        let url = attachment.url().to_string();
        assert!(url.starts_with("memory://chat_images/"));
        assert!(url.ends_with("_cat.png"));
        assert_eq!(
            pair.blobs.get(url.trim_start_matches("memory://")),
            Some(vec![1, 2, 3])
        );

        let sent = pair
            .alice
            .send(&pair.key, &OutgoingMessage::attachment(attachment.clone()))
            .await
            .unwrap();
        assert!(!sent.has_text());
        assert_eq!(sent.attachment, Some(attachment));
        assert_eq!(sent.preview_text(), "Image");
    }

    #[tokio::test]
    async fn audio_uploads_use_voice_message_path() {
        let pair = setup();
        let attachment = pair
            .alice
            .upload_attachment(AttachmentKind::Audio, "ignored", vec![9])
            .await
            .unwrap();
        assert_eq!(attachment.kind(), AttachmentKind::Audio);
        assert!(attachment.url().starts_with("memory://voice_messages/"));
        assert!(attachment.url().ends_with("_audio.webm"));
    }

    #[tokio::test]
    async fn set_status_never_moves_backward() {
        let pair = setup();
        let sent = pair.alice.send(&pair.key, &hello()).await.unwrap();

        let t = pair
            .bob
            .set_status(&pair.key, &sent.id, DeliveryStatus::Read)
            .await
            .unwrap();
        assert!(t.is_advanced());

        for requested in [DeliveryStatus::Sent, DeliveryStatus::Delivered] {
            let t = pair
                .alice
                .set_status(&pair.key, &sent.id, requested)
                .await
                .unwrap();
            assert_eq!(
                t,
                Transition::Ignored {
                    current: DeliveryStatus::Read,
                    requested
                }
            );
        }

        let stored = pair.alice.fetch_messages(&pair.key).await.unwrap();
        assert_eq!(stored[0].status, DeliveryStatus::Read);
    }

    /// Lets the peer's read receipt land right after the first `get` returns, so
    /// the caller holds a stale status when it writes.
    struct PeerReadsDuringGet {
        inner: InMemoryDocumentStore,
        peer_read: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl DocumentStore for PeerReadsDuringGet {
        async fn subscribe(
            &self,
            collection: &CollectionPath,
            filter: Filter,
        ) -> std::result::Result<DocumentSubscription, BackendError> {
            self.inner.subscribe(collection, filter).await
        }

        async fn list(
            &self,
            collection: &CollectionPath,
            filter: &Filter,
        ) -> std::result::Result<Vec<Document>, BackendError> {
            self.inner.list(collection, filter).await
        }

        async fn get(
            &self,
            path: &DocumentPath,
        ) -> std::result::Result<Option<Document>, BackendError> {
            let stale = self.inner.get(path).await?;
            if !self
                .peer_read
                .swap(true, std::sync::atomic::Ordering::SeqCst)
            {
                self.inner
                    .update(path, status_update(DeliveryStatus::Read))
                    .await?;
            }
            Ok(stale)
        }

        async fn write(
            &self,
            collection: &CollectionPath,
            fields: Fields,
        ) -> std::result::Result<Document, BackendError> {
            self.inner.write(collection, fields).await
        }

        async fn update(
            &self,
            path: &DocumentPath,
            updates: Vec<(FieldPath, Value)>,
        ) -> std::result::Result<(), BackendError> {
            self.inner.update(path, updates).await
        }

        async fn update_if(
            &self,
            path: &DocumentPath,
            guard: &FieldPath,
            expected: &Value,
            updates: Vec<(FieldPath, Value)>,
        ) -> std::result::Result<bool, BackendError> {
            self.inner.update_if(path, guard, expected, updates).await
        }

        async fn set_merge(
            &self,
            path: &DocumentPath,
            fields: Fields,
        ) -> std::result::Result<(), BackendError> {
            self.inner.set_merge(path, fields).await
        }

        async fn delete(&self, path: &DocumentPath) -> std::result::Result<(), BackendError> {
            self.inner.delete(path).await
        }
    }

    #[tokio::test]
    async fn delivered_never_overwrites_a_concurrent_read() {
        let (config, _logs) = create_test_config();
        let backend = InMemoryDocumentStore::new();
        let store = Arc::new(PeerReadsDuringGet {
            inner: backend.clone(),
            peer_read: std::sync::atomic::AtomicBool::new(false),
        });
        let alice = MessageStore::new(
            store,
            Arc::new(InMemoryBlobStore::new()),
            Session::new("alice"),
            &config,
        );
        let key = alice.session().conversation_with(&UserId::from("bob"));

        let sent = alice.send(&key, &hello()).await.unwrap();
        assert_eq!(sent.status, DeliveryStatus::Read);

        let stored = backend
            .get(&key.messages_collection("chats").doc(sent.id.as_str()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.fields["status"], json!("read"));
    }

    #[tokio::test]
    async fn set_status_on_missing_message_fails() {
        let pair = setup();
        let err = pair
            .alice
            .set_status(&pair.key, &MessageId::new("nope"), DeliveryStatus::Read)
            .await
            .unwrap_err();
        assert!(matches!(err, HuddleError::MessageNotFound(_)));
    }

    #[tokio::test]
    async fn viewing_marks_inbound_messages_read() {
        let pair = setup();
        let from_alice = pair.alice.send(&pair.key, &hello()).await.unwrap();
        let from_bob = pair
            .bob
            .send(&pair.key, &OutgoingMessage::text(RichContent::plain("Hi")))
            .await
            .unwrap();

        let mut bob_view = pair.bob.subscribe(&pair.key).await.unwrap();
        let first = bob_view.next().await.unwrap();
        assert_eq!(first.len(), 2);

        let settled = next_matching(&mut bob_view, |messages| {
            messages.iter().all(|m| m.status == DeliveryStatus::Read || m.id == from_bob.id)
        })
        .await;
        let alice_msg = settled.iter().find(|m| m.id == from_alice.id).unwrap();
        assert_eq!(alice_msg.status, DeliveryStatus::Read);

        // Bob's own message is untouched by his view.
        let bob_msg = settled.iter().find(|m| m.id == from_bob.id).unwrap();
        assert_eq!(bob_msg.status, DeliveryStatus::Delivered);
        bob_view.cancel();
    }

    #[tokio::test]
    async fn snapshots_are_ordered_by_timestamp() {
        let pair = setup();
        for text in ["one", "two", "three"] {
            pair.alice
                .send(&pair.key, &OutgoingMessage::text(RichContent::plain(text)))
                .await
                .unwrap();
        }

        let mut view = pair.alice.subscribe(&pair.key).await.unwrap();
        let messages = view.next().await.unwrap();
        assert!(messages.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        let texts: Vec<String> = messages.iter().map(Message::preview_text).collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
        view.cancel();
    }

    #[tokio::test]
    async fn reacting_twice_keeps_the_last_emoji() {
        let pair = setup();
        let sent = pair.alice.send(&pair.key, &hello()).await.unwrap();

        pair.bob.react(&pair.key, &sent.id, "👍").await.unwrap();
        pair.bob.react(&pair.key, &sent.id, "❤️").await.unwrap();
        pair.alice.react(&pair.key, &sent.id, "+").await.unwrap();

        let stored = pair.alice.fetch_messages(&pair.key).await.unwrap();
        let reactions = &stored[0].reactions;
        assert_eq!(reactions.len(), 2);
        assert_eq!(reactions.get(&UserId::from("bob")), Some("❤️"));
        assert_eq!(reactions.get(&UserId::from("alice")), Some("👍"));
    }

    #[tokio::test]
    async fn invalid_reaction_is_rejected() {
        let pair = setup();
        let sent = pair.alice.send(&pair.key, &hello()).await.unwrap();
        let err = pair
            .bob
            .react(&pair.key, &sent.id, "lol")
            .await
            .unwrap_err();
        assert!(matches!(err, HuddleError::Validation(_)));
    }

    #[tokio::test]
    async fn react_to_deleted_message_reports_missing() {
        let pair = setup();
        let sent = pair.alice.send(&pair.key, &hello()).await.unwrap();
        pair.alice.delete(&pair.key, &sent.id).await.unwrap();

        let err = pair
            .bob
            .react(&pair.key, &sent.id, "👍")
            .await
            .unwrap_err();
        assert!(matches!(err, HuddleError::MessageNotFound(_)));
    }

    #[tokio::test]
    async fn delete_is_permanent() {
        let pair = setup();
        let sent = pair.alice.send(&pair.key, &hello()).await.unwrap();

        pair.bob.delete(&pair.key, &sent.id).await.unwrap();
        assert!(pair.alice.fetch_messages(&pair.key).await.unwrap().is_empty());

        let err = pair.alice.delete(&pair.key, &sent.id).await.unwrap_err();
        assert!(matches!(err, HuddleError::MessageNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn send_retries_transient_failures() {
        let pair = setup();
        pair.backend.fail_next_writes(2);

        let sent = pair.alice.send(&pair.key, &hello()).await.unwrap();
        assert_eq!(sent.status, DeliveryStatus::Delivered);
        assert_eq!(pair.alice.fetch_messages(&pair.key).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn send_surfaces_failure_after_retries() {
        let pair = setup();
        pair.backend.fail_next_writes(10);

        let outgoing = hello();
        let err = pair.alice.send(&pair.key, &outgoing).await.unwrap_err();
        assert!(matches!(
            err,
            HuddleError::RetriesExhausted { attempts: 3, .. }
        ));
        assert!(err.is_transient());
        // The composed message is still there for a manual retry.
        assert_eq!(outgoing, hello());
    }

    #[tokio::test]
    async fn replies_store_the_quoted_id() {
        let pair = setup();
        let original = pair.alice.send(&pair.key, &hello()).await.unwrap();
        let reply = pair
            .bob
            .send(
                &pair.key,
                &OutgoingMessage::text(RichContent::plain("Hi back")).replying_to(original.id.clone()),
            )
            .await
            .unwrap();
        assert_eq!(reply.reply_to, Some(original.id));
    }

    #[tokio::test]
    async fn switching_conversations_releases_previous_stream() {
        let pair = setup();
        let carol_key = pair.alice.session().conversation_with(&UserId::from("carol"));

        let mut active = ActiveConversation::new(pair.alice.clone());
        active.open(&pair.key).await.unwrap();
        assert_eq!(active.key(), Some(&pair.key));
        assert!(active.next().await.unwrap().is_empty());

        active.open(&carol_key).await.unwrap();
        assert_eq!(active.key(), Some(&carol_key));
        assert!(active.next().await.unwrap().is_empty());

        // Traffic in the old conversation no longer reaches the view.
        pair.bob.send(&pair.key, &hello()).await.unwrap();
        let carol = MessageStore::new(
            Arc::new(pair.backend.clone()),
            Arc::new(pair.blobs.clone()),
            Session::new("carol"),
            &create_test_config().0,
        );
        carol.send(&carol_key, &hello()).await.unwrap();

        let snapshot = active.next().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].sender_id, UserId::from("carol"));

        active.close();
        assert!(active.key().is_none());
        assert!(active.next().await.is_none());
    }
}
