use crate::huddle::messages::{Message, MessageId};
use crate::huddle::session::UserId;

/// What a reply shows of the message it quotes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyPreview {
    Found {
        id: MessageId,
        sender_id: UserId,
        text: String,
    },
    /// The quoted message was deleted or never reached this client.
    NotFound { id: MessageId },
}

impl ReplyPreview {
    pub fn id(&self) -> &MessageId {
        match self {
            ReplyPreview::Found { id, .. } | ReplyPreview::NotFound { id } => id,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, ReplyPreview::Found { .. })
    }
}

impl std::fmt::Display for ReplyPreview {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplyPreview::Found { text, .. } => f.write_str(text),
            ReplyPreview::NotFound { .. } => f.write_str("Message not found"),
        }
    }
}

/// Resolves the message `message` replies to against the current snapshot.
/// `None` when `message` is not a reply.
pub fn resolve_reply(message: &Message, messages: &[Message]) -> Option<ReplyPreview> {
    let target = message.reply_to.as_ref()?;
    let preview = match messages.iter().find(|m| &m.id == target) {
        Some(quoted) => ReplyPreview::Found {
            id: quoted.id.clone(),
            sender_id: quoted.sender_id.clone(),
            text: quoted.preview_text(),
        },
        None => ReplyPreview::NotFound { id: target.clone() },
    };
    Some(preview)
}
