use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub mod backend;
pub mod chat_list;
pub mod conversation;
pub mod delivery;
pub mod error;
pub mod messages;
pub mod reactions;
pub mod replies;
pub mod rich_content;
pub mod search;
pub mod session;
pub mod typing;
pub mod users;
pub mod utils;

use crate::init_tracing;

use backend::{BlobStore, DocumentStore};
use conversation::ConversationKey;
use error::{HuddleError, Result};
use messages::{ActiveConversation, MessageStore};
use session::{Session, UserId};
use typing::TypingChannel;
use users::PresenceTracker;
use utils::retry::RetryConfig;

const ENV_LOGS_DIR: &str = "HUDDLE_LOGS_DIR";
const ENV_TYPING_IDLE_MS: &str = "HUDDLE_TYPING_IDLE_MS";
const ENV_RETRY_MAX_ATTEMPTS: &str = "HUDDLE_RETRY_MAX_ATTEMPTS";
const ENV_RETRY_INITIAL_DELAY_MS: &str = "HUDDLE_RETRY_INITIAL_DELAY_MS";

#[derive(Clone, Debug)]
pub struct HuddleConfig {
    /// Directory for application logs
    pub logs_dir: PathBuf,

    /// How long after the last keystroke the typing flag is cleared
    pub typing_idle_timeout: Duration,

    /// Retry policy for send, react and delete
    pub retry: RetryConfig,

    /// Collection holding one document per user
    pub users_collection: String,

    /// Root collection under which every conversation keeps its messages and typing flags
    pub chats_collection: String,
}

impl HuddleConfig {
    pub fn new(logs_dir: &Path) -> Self {
        let env_suffix = if cfg!(debug_assertions) {
            "dev"
        } else {
            "release"
        };

        Self {
            logs_dir: logs_dir.join(env_suffix),
            typing_idle_timeout: Duration::from_secs(2),
            retry: RetryConfig::default(),
            users_collection: "users".to_string(),
            chats_collection: "chats".to_string(),
        }
    }

    /// Builds a configuration from the process environment, after loading `.env`
    /// if one is present. Unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            tracing::debug!(target: "huddle::config", "No .env file loaded: {}", e);
        }
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let logs_dir = lookup(ENV_LOGS_DIR).unwrap_or_else(|| "logs".to_string());
        let mut config = Self::new(Path::new(&logs_dir));

        if let Some(ms) = parse_var(&lookup, ENV_TYPING_IDLE_MS)? {
            config.typing_idle_timeout = Duration::from_millis(ms);
        }
        if let Some(attempts) = parse_var(&lookup, ENV_RETRY_MAX_ATTEMPTS)? {
            config.retry.max_attempts = u32::try_from(attempts).map_err(|_| {
                HuddleError::Configuration(format!("{} is out of range", ENV_RETRY_MAX_ATTEMPTS))
            })?;
        }
        if let Some(ms) = parse_var(&lookup, ENV_RETRY_INITIAL_DELAY_MS)? {
            config.retry.initial_delay = Duration::from_millis(ms);
        }

        Ok(config)
    }
}

impl Default for HuddleConfig {
    fn default() -> Self {
        Self::new(Path::new("logs"))
    }
}

fn parse_var(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<u64>> {
    lookup(name)
        .map(|raw| {
            raw.trim().parse::<u64>().map_err(|e| {
                HuddleError::Configuration(format!("{} must be a whole number: {}", name, e))
            })
        })
        .transpose()
}

/// Messaging core for one signed-in user.
pub struct Huddle {
    pub config: HuddleConfig,
    session: Session,
    presence: PresenceTracker,
    messages: MessageStore,
    typing: TypingChannel,
}

impl std::fmt::Debug for Huddle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Huddle")
            .field("config", &self.config)
            .field("session", &self.session)
            .field("store", &"<REDACTED>")
            .finish()
    }
}

impl Huddle {
    /// Wires the components together without touching the filesystem or the store.
    pub fn new(
        config: HuddleConfig,
        session: Session,
        store: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        let presence = PresenceTracker::new(Arc::clone(&store), session.clone(), &config);
        let messages = MessageStore::new(Arc::clone(&store), blobs, session.clone(), &config);
        let typing = TypingChannel::new(store, session.clone(), &config);

        Self {
            config,
            session,
            presence,
            messages,
            typing,
        }
    }

    /// Sets up logging and starts the session: the user is marked online.
    ///
    /// # Arguments
    ///
    /// * `config` - A [`HuddleConfig`] specifying the log directory and tunables.
    /// * `session` - The signed-in user.
    pub async fn initialize(
        config: HuddleConfig,
        session: Session,
        store: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
    ) -> Result<Self> {
        let logs_dir = &config.logs_dir;
        std::fs::create_dir_all(logs_dir)?;

        init_tracing(logs_dir)?;

        tracing::debug!(
            target: "huddle::initialize",
            "Logging initialized in directory: {:?}",
            logs_dir
        );

        let huddle = Self::new(config, session, store, blobs);
        huddle.presence.start_session().await;

        tracing::info!(
            target: "huddle::initialize",
            "Session started for {}",
            huddle.session.user_id()
        );
        Ok(huddle)
    }

    /// Ends the session: pending typing timers are dropped and the user is marked offline.
    pub async fn shutdown(&self) {
        self.typing.shutdown();
        self.presence.end_session().await;
        tracing::info!(
            target: "huddle::shutdown",
            "Session ended for {}",
            self.session.user_id()
        );
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn messages(&self) -> &MessageStore {
        &self.messages
    }

    pub fn typing(&self) -> &TypingChannel {
        &self.typing
    }

    pub fn conversation_with(&self, other: &UserId) -> ConversationKey {
        self.session.conversation_with(other)
    }

    /// A view that holds at most one conversation subscription at a time.
    pub fn active_conversation(&self) -> ActiveConversation {
        ActiveConversation::new(self.messages.clone())
    }
}
