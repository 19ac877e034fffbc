//! codexcord connector core
//!
//! The two seams of the bridge: the chat platform that hosts channels and
//! threads, and the agent runtime that runs interactive turns. Concrete
//! connectors (Discord, Codex) implement these traits; the server only sees
//! the traits.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors returned by a chat platform
#[derive(Debug, Clone, Error)]
pub enum ChatError {
    /// The entity does not exist (deleted out-of-band)
    #[error("not found: {0}")]
    NotFound(String),

    /// The bot lost access to the entity
    #[error("missing access: {0}")]
    MissingAccess(String),

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("api error (status {status}, code {code:?}): {message}")]
    Api {
        status: u16,
        code: Option<i64>,
        message: String,
    },

    #[error("transport error: {0}")]
    Transport(String),
}

impl ChatError {
    /// Authoritative "gone" signal: the mapped entity was deleted or revoked.
    ///
    /// Everything else is transient and must not trigger cleanup.
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::MissingAccess(_))
    }
}

/// Errors that can occur while running an agent turn
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("Failed to spawn process: {0}")]
    SpawnError(String),

    #[error("Process communication error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Provider error: {0}")]
    ProviderError(String),
}

/// A chat channel (one per project)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: String,
    pub name: String,
}

/// A chat thread (one per session)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: String,
    pub channel_id: String,
    pub name: String,
}

/// A message the bridge posted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub id: String,
}

/// Side-effecting operations on the chat platform
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    async fn create_channel(&self, name: &str, topic: Option<&str>)
        -> Result<ChannelInfo, ChatError>;

    async fn fetch_channel(&self, channel_id: &str) -> Result<ChannelInfo, ChatError>;

    async fn delete_channel(&self, channel_id: &str) -> Result<(), ChatError>;

    async fn create_thread(&self, channel_id: &str, name: &str) -> Result<ThreadInfo, ChatError>;

    async fn delete_thread(&self, thread_id: &str) -> Result<(), ChatError>;

    /// Post `content` to a thread. Long content may be split by the platform;
    /// the returned id is the last message posted.
    async fn send_message(&self, thread_id: &str, content: &str)
        -> Result<SentMessage, ChatError>;
}

/// Notifications coming from the chat platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    ThreadCreated {
        thread_id: String,
        channel_id: String,
        name: String,
    },
    ThreadDeleted {
        thread_id: String,
    },
    ChannelDeleted {
        channel_id: String,
    },
    MessageCreated {
        thread_id: String,
        message_id: String,
        author: String,
        content: String,
    },
}

/// One interactive turn to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRequest {
    pub cwd: String,
    pub prompt: String,
    /// Resume this session; start a fresh one when `None`
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub approval_policy: Option<String>,
}

/// Events streamed while a turn runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEvent {
    /// The runtime assigned (or confirmed) the session id
    SessionStarted { session_id: String },
    AgentMessage { text: String },
    Reasoning { text: String },
    Completed,
    Failed { message: String },
}

/// Runs agent turns and streams their events
#[async_trait]
pub trait TurnRunner: Send + Sync {
    /// Run one turn to completion, sending events to `events` as they arrive.
    ///
    /// Returns once the turn has finished; a turn that fails in the runtime
    /// is reported as `TurnEvent::Failed`, not as an `Err`.
    async fn run_turn(
        &self,
        request: TurnRequest,
        events: mpsc::Sender<TurnEvent>,
    ) -> Result<(), ConnectorError>;
}
