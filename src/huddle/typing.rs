//! Typing indicator channel.
//!
//! Each participant owns one document under the conversation's `typing`
//! collection, keyed by their user id, holding an `isTyping` flag. A keystroke
//! raises the flag and (re)arms an idle timer that lowers it again.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::huddle::{
    HuddleConfig,
    backend::{DocumentStore, DocumentSubscription, Fields, Filter},
    conversation::ConversationKey,
    error::{HuddleError, Result},
    session::Session,
};

const FIELD_IS_TYPING: &str = "isTyping";

#[derive(Clone)]
pub struct TypingChannel {
    store: Arc<dyn DocumentStore>,
    session: Session,
    chats_root: String,
    idle_timeout: Duration,
    timers: Arc<DashMap<ConversationKey, JoinHandle<()>>>,
}

impl TypingChannel {
    pub fn new(store: Arc<dyn DocumentStore>, session: Session, config: &HuddleConfig) -> Self {
        Self {
            store,
            session,
            chats_root: config.chats_collection.clone(),
            idle_timeout: config.typing_idle_timeout,
            timers: Arc::new(DashMap::new()),
        }
    }

    /// Signals that the session user is typing in `key`. The flag clears by
    /// itself once no keystroke arrives for the idle timeout.
    pub async fn keystroke(&self, key: &ConversationKey) {
        let deadline = Instant::now() + self.idle_timeout;
        self.disarm(key);
        self.publish(key, true).await;

        let channel = self.clone();
        let timer_key = key.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            tracing::debug!(
                target: "huddle::typing",
                "Idle timeout reached in {}",
                timer_key
            );
            channel.publish(&timer_key, false).await;
        });

        if let Some(previous) = self.timers.insert(key.clone(), timer) {
            previous.abort();
        }
    }

    /// Clears the flag right away, e.g. after a message was sent.
    pub async fn stop(&self, key: &ConversationKey) {
        self.disarm(key);
        self.publish(key, false).await;
    }

    /// Observes the other participant's flag in `key`.
    pub async fn watch(&self, key: &ConversationKey) -> Result<TypingWatch> {
        let peer = key.other_participant(self.session.user_id()).ok_or_else(|| {
            HuddleError::Validation(format!(
                "{} is not a participant of conversation {}",
                self.session.user_id(),
                key
            ))
        })?;
        let subscription = self
            .store
            .subscribe(
                &key.typing_collection(&self.chats_root),
                Filter::IdEquals(peer.as_str().to_string()),
            )
            .await?;
        Ok(TypingWatch {
            subscription,
            last: None,
        })
    }

    /// Cancels every pending idle timer without touching the stored flags.
    pub fn shutdown(&self) {
        self.timers.retain(|_, timer| {
            timer.abort();
            false
        });
    }

    fn disarm(&self, key: &ConversationKey) {
        if let Some((_, timer)) = self.timers.remove(key) {
            timer.abort();
        }
    }

    async fn publish(&self, key: &ConversationKey, typing: bool) {
        let path = key
            .typing_collection(&self.chats_root)
            .doc(self.session.user_id().as_str());
        let mut fields = Fields::new();
        fields.insert(FIELD_IS_TYPING.to_string(), Value::Bool(typing));

        if let Err(e) = self.store.set_merge(&path, fields).await {
            tracing::warn!(
                target: "huddle::typing",
                "Failed to publish typing={} in {}: {}",
                typing,
                key,
                e
            );
        }
    }
}

/// Stream of the peer's typing state. Only changes are yielded.
pub struct TypingWatch {
    subscription: DocumentSubscription,
    last: Option<bool>,
}

impl TypingWatch {
    pub async fn next(&mut self) -> Option<bool> {
        loop {
            let snapshot = self.subscription.next().await?;
            let typing = snapshot
                .documents
                .first()
                .and_then(|doc| doc.get_bool(FIELD_IS_TYPING))
                .unwrap_or(false);
            if self.last != Some(typing) {
                self.last = Some(typing);
                return Some(typing);
            }
        }
    }

    pub fn cancel(self) {
        self.subscription.cancel();
    }
}
