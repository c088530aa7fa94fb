use std::path::Path;
use std::sync::Mutex;

use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt::Layer, prelude::*, registry::Registry};

mod huddle;

pub use crate::huddle::backend::{
    BackendError, BlobStore, ChangeKind, ChangeNotice, CollectionPath, Document, DocumentPath,
    DocumentStore, DocumentSubscription, FieldPath, Fields, Filter, InMemoryBlobStore,
    InMemoryDocumentStore, Snapshot, SubscriptionHandle,
};
pub use crate::huddle::chat_list::ConversationSummary;
pub use crate::huddle::conversation::ConversationKey;
pub use crate::huddle::delivery::{DeliveryStatus, Transition};
pub use crate::huddle::error::{HuddleError, Result};
pub use crate::huddle::messages::{
    ActiveConversation, Attachment, AttachmentKind, Message, MessageId, MessageStore,
    MessageStream, OutgoingMessage,
};
pub use crate::huddle::reactions::{EmojiReaction, ReactionLedger, is_valid_emoji, validate_reaction};
pub use crate::huddle::replies::{ReplyPreview, resolve_reply};
pub use crate::huddle::rich_content::{
    BlockKind, DecodeError, Decoded, InlineSpan, InlineStyle, RichContent, StyledSegment,
    TextBlock, decode, encode, try_decode,
};
pub use crate::huddle::search::search;
pub use crate::huddle::session::{Session, UserId};
pub use crate::huddle::typing::{TypingChannel, TypingWatch};
pub use crate::huddle::users::{PresenceTracker, PresenceWatch, User};
pub use crate::huddle::utils::retry::RetryConfig;
pub use crate::huddle::{Huddle, HuddleConfig};

static TRACING_GUARDS: OnceCell<Mutex<Option<(WorkerGuard, WorkerGuard)>>> = OnceCell::new();
static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Installs stdout and daily-rolling file logging. Only the first call per process
/// has an effect.
fn init_tracing(logs_dir: &Path) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
            .rotation(tracing_appender::rolling::Rotation::DAILY)
            .filename_prefix("huddle")
            .filename_suffix("log")
            .build(logs_dir)
            .map_err(|e| {
                HuddleError::Configuration(format!("Failed to create file appender: {}", e))
            })?;

        let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);
        let (non_blocking_stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

        TRACING_GUARDS
            .set(Mutex::new(Some((file_guard, stdout_guard))))
            .ok();

        let stdout_layer = Layer::new()
            .with_writer(non_blocking_stdout)
            .with_ansi(true)
            .with_target(true);

        let file_layer = Layer::new()
            .with_writer(non_blocking_file)
            .with_ansi(false)
            .with_target(true);

        // Another subscriber may already be installed, e.g. by the embedding app.
        Registry::default()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(stdout_layer)
            .with(file_layer)
            .try_init()
            .ok();

        Ok(())
    })?;
    Ok(())
}
