use serde::{Deserialize, Serialize};

use crate::huddle::conversation::ConversationKey;

/// Opaque user identifier assigned by the authentication provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The signed-in user on whose behalf every component acts.
///
/// Handed to each component at construction so that several simulated users
/// can share one backend in tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    user_id: UserId,
}

impl Session {
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn is_current_user(&self, user_id: &UserId) -> bool {
        &self.user_id == user_id
    }

    /// Key of the direct conversation between the session user and `other`.
    pub fn conversation_with(&self, other: &UserId) -> ConversationKey {
        ConversationKey::derive(&self.user_id, other)
    }
}
