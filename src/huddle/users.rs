use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::huddle::{
    HuddleConfig,
    backend::{CollectionPath, Document, DocumentStore, DocumentSubscription, Fields, Filter},
    error::Result,
    session::{Session, UserId},
    utils::{format_timestamp, parse_timestamp},
};

const FIELD_DISPLAY_NAME: &str = "displayName";
const FIELD_USERNAME: &str = "username";
const FIELD_ONLINE: &str = "online";
const FIELD_LAST_SEEN: &str = "lastSeen";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub display_name: String,
    /// Users whose document lacks the flag are shown as offline.
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

impl User {
    pub(crate) fn from_document(document: &Document) -> Self {
        let display_name = document
            .get_str(FIELD_DISPLAY_NAME)
            .or_else(|| document.get_str(FIELD_USERNAME))
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(document.id.as_str())
            .to_string();

        User {
            id: UserId::new(document.id.clone()),
            display_name,
            online: document.get_bool(FIELD_ONLINE).unwrap_or(false),
            last_seen: document
                .get_str(FIELD_LAST_SEEN)
                .and_then(parse_timestamp),
        }
    }
}

/// Publishes the session user's online flag and observes everyone else's.
#[derive(Clone)]
pub struct PresenceTracker {
    store: Arc<dyn DocumentStore>,
    session: Session,
    users: CollectionPath,
}

impl PresenceTracker {
    pub fn new(store: Arc<dyn DocumentStore>, session: Session, config: &HuddleConfig) -> Self {
        Self {
            store,
            session,
            users: CollectionPath::new(config.users_collection.clone()),
        }
    }

    /// Marks the session user online. Failures are logged, never returned.
    pub async fn start_session(&self) {
        let mut fields = Fields::new();
        fields.insert(FIELD_ONLINE.to_string(), Value::Bool(true));
        self.publish(fields, "start_session").await;
    }

    /// Marks the session user offline and records when they were last seen.
    ///
    /// A failure here leaves a stale online flag behind until the next session.
    pub async fn end_session(&self) {
        let mut fields = Fields::new();
        fields.insert(FIELD_ONLINE.to_string(), Value::Bool(false));
        fields.insert(
            FIELD_LAST_SEEN.to_string(),
            Value::String(format_timestamp(&Utc::now())),
        );
        self.publish(fields, "end_session").await;
    }

    async fn publish(&self, fields: Fields, operation: &str) {
        let path = self.users.doc(self.session.user_id().as_str());
        match self.store.set_merge(&path, fields).await {
            Ok(()) => tracing::debug!(
                target: "huddle::users::presence",
                "{} succeeded for {}",
                operation,
                self.session.user_id()
            ),
            Err(e) => tracing::warn!(
                target: "huddle::users::presence",
                "{} failed for {}: {}",
                operation,
                self.session.user_id(),
                e
            ),
        }
    }

    /// Every user except the session user, in store order.
    pub async fn list_users(&self) -> Result<Vec<User>> {
        let documents = self.store.list(&self.users, &self.others()).await?;
        Ok(documents.iter().map(User::from_document).collect())
    }

    /// Live view of every other user's presence. Cancel it when leaving the screen.
    pub async fn watch(&self) -> Result<PresenceWatch> {
        let subscription = self.store.subscribe(&self.users, self.others()).await?;
        Ok(PresenceWatch { subscription })
    }

    fn others(&self) -> Filter {
        Filter::IdNotEquals(self.session.user_id().as_str().to_string())
    }
}

pub struct PresenceWatch {
    subscription: DocumentSubscription,
}

impl PresenceWatch {
    /// The full set of other users after the next change.
    pub async fn next(&mut self) -> Option<Vec<User>> {
        let snapshot = self.subscription.next().await?;
        Some(snapshot.documents.iter().map(User::from_document).collect())
    }

    pub fn cancel(self) {
        self.subscription.cancel();
    }
}
