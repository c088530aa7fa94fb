use futures::future::join_all;

use crate::huddle::{
    Huddle, conversation::ConversationKey, error::Result, messages::Message, users::User,
};

/// One row of the conversation list: a peer and the latest message exchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationSummary {
    pub user: User,
    pub key: ConversationKey,
    pub last_message: Option<Message>,
}

impl ConversationSummary {
    /// Preview line: first text block, media label, or a placeholder.
    pub fn preview(&self) -> String {
        match &self.last_message {
            Some(message) => message.preview_text(),
            None => "No messages yet".to_string(),
        }
    }
}

/// Most recent activity first. Conversations without messages keep their
/// relative order at the end.
fn sort_by_activity(items: &mut [ConversationSummary]) {
    items.sort_by(|a, b| {
        let a_time = a.last_message.as_ref().map(|m| m.timestamp);
        let b_time = b.last_message.as_ref().map(|m| m.timestamp);
        b_time.cmp(&a_time)
    });
}

impl Huddle {
    /// Lists every other user with the last message of the conversation with them.
    ///
    /// A conversation whose last message cannot be read is listed without one.
    pub async fn conversation_list(&self) -> Result<Vec<ConversationSummary>> {
        let users = self.presence.list_users().await?;

        let lookups = users.into_iter().map(|user| async move {
            let key = self.session.conversation_with(&user.id);
            let last_message = match self.messages.last_message(&key).await {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(
                        target: "huddle::chat_list",
                        "Failed to load last message of {}: {}",
                        key,
                        e
                    );
                    None
                }
            };
            ConversationSummary {
                user,
                key,
                last_message,
            }
        });

        let mut items = join_all(lookups).await;
        sort_by_activity(&mut items);
        Ok(items)
    }
}
