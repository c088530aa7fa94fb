//! Conversation identity.
//!
//! A direct conversation is not stored anywhere; it is addressed by a key derived
//! from its two participants, so both sides land on the same message log no matter
//! who starts the chat.

use serde::{Deserialize, Serialize};

use crate::huddle::backend::CollectionPath;
use crate::huddle::session::UserId;

const SEPARATOR: char = '_';

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationKey(String);

impl ConversationKey {
    /// Derives the key for the pair `(a, b)`. Symmetric: `derive(a, b) == derive(b, a)`.
    ///
    /// Ids are sorted and joined with `_`. `%` and `_` inside an id are
    /// percent-escaped, so two different pairs never share a key while plain
    /// alphanumeric ids keep the `alice_bob` form.
    pub fn derive(a: &UserId, b: &UserId) -> Self {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        Self(format!(
            "{}{}{}",
            escape(first.as_str()),
            SEPARATOR,
            escape(second.as_str())
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Both participants, in sorted order. `None` for a malformed key.
    pub fn participants(&self) -> Option<(UserId, UserId)> {
        let (first, second) = self.0.split_once(SEPARATOR)?;
        Some((UserId::new(unescape(first)?), UserId::new(unescape(second)?)))
    }

    pub fn includes(&self, user_id: &UserId) -> bool {
        self.participants()
            .is_some_and(|(first, second)| &first == user_id || &second == user_id)
    }

    /// The participant who is not `me`. `None` if `me` is not part of this conversation.
    pub fn other_participant(&self, me: &UserId) -> Option<UserId> {
        let (first, second) = self.participants()?;
        if &first == me {
            Some(second)
        } else if &second == me {
            Some(first)
        } else {
            None
        }
    }

    pub(crate) fn messages_collection(&self, chats_root: &str) -> CollectionPath {
        CollectionPath::new(format!("{}/{}/messages", chats_root, self.0))
    }

    pub(crate) fn typing_collection(&self, chats_root: &str) -> CollectionPath {
        CollectionPath::new(format!("{}/{}/typing", chats_root, self.0))
    }
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn escape(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for ch in id.chars() {
        match ch {
            '%' => out.push_str("%25"),
            '_' => out.push_str("%5F"),
            other => out.push(other),
        }
    }
    out
}

fn unescape(part: &str) -> Option<String> {
    let mut out = String::with_capacity(part.len());
    let mut rest = part;
    while let Some(idx) = rest.find('%') {
        out.push_str(&rest[..idx]);
        let code = rest.get(idx + 1..idx + 3)?;
        match code {
            "25" => out.push('%'),
            "5F" => out.push('_'),
            _ => return None,
        }
        rest = &rest[idx + 3..];
    }
    out.push_str(rest);
    Some(out)
}
