//! Reaction ledger.
//!
//! Each message carries at most one reaction per user. Reacting again replaces
//! the previous emoji; there is no way to withdraw a reaction.

mod emoji_utils;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::huddle::session::UserId;

pub use emoji_utils::{is_valid_emoji, validate_reaction};

/// Mapping of user id to that user's single emoji reaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReactionLedger(BTreeMap<UserId, String>);

/// Users who reacted with one particular emoji.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmojiReaction {
    pub emoji: String,
    pub count: usize,
    pub users: Vec<UserId>,
}

impl ReactionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `emoji` as `user`'s reaction, returning the one it replaced.
    pub fn upsert(&mut self, user: UserId, emoji: impl Into<String>) -> Option<String> {
        self.0.insert(user, emoji.into())
    }

    pub fn get(&self, user: &UserId) -> Option<&str> {
        self.0.get(user).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&UserId, &str)> {
        self.0.iter().map(|(user, emoji)| (user, emoji.as_str()))
    }

    /// Reactions grouped by emoji, most used first, ties in emoji order.
    pub fn summary(&self) -> Vec<EmojiReaction> {
        let mut by_emoji: BTreeMap<&str, Vec<UserId>> = BTreeMap::new();
        for (user, emoji) in &self.0 {
            by_emoji
                .entry(emoji.as_str())
                .or_default()
                .push(user.clone());
        }
        let mut summary: Vec<EmojiReaction> = by_emoji
            .into_iter()
            .map(|(emoji, users)| EmojiReaction {
                emoji: emoji.to_string(),
                count: users.len(),
                users,
            })
            .collect();
        summary.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.emoji.cmp(&b.emoji)));
        summary
    }

    /// Reads the stored `reactions` field, skipping entries that are not strings.
    pub(crate) fn from_value(value: Option<&Value>) -> Self {
        let Some(Value::Object(map)) = value else {
            return Self::default();
        };
        Self(
            map.iter()
                .filter_map(|(user, emoji)| {
                    emoji
                        .as_str()
                        .map(|emoji| (UserId::new(user.clone()), emoji.to_string()))
                })
                .collect(),
        )
    }
}
