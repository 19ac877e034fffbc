//! Core types shared across the bridge

use serde::{Deserialize, Serialize};

/// Author role of a rollout message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Developer,
    System,
}

impl Role {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "developer" => Some(Self::Developer),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// Thread status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    Active,
    Completed,
    Error,
}

impl ThreadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Direction of a delivered message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    /// Chat user -> agent
    Inbound,
    /// Agent -> chat
    Outbound,
}

impl MessageDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "inbound" => Some(Self::Inbound),
            "outbound" => Some(Self::Outbound),
            _ => None,
        }
    }
}

/// A project: one canonical directory mapped to one chat channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: i64,
    pub channel_id: String,
    pub path: String,
    pub name: String,
    pub model: Option<String>,
    pub approval_policy: Option<String>,
    pub created_at: String,
}

/// Input for creating a project
#[derive(Debug, Clone)]
pub struct NewProject {
    pub channel_id: String,
    pub path: String,
    pub name: String,
    pub model: Option<String>,
    pub approval_policy: Option<String>,
}

/// A thread: one external session mapped to one chat thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub id: i64,
    pub chat_thread_id: String,
    /// `None` while the thread exists chat-side only
    pub session_id: Option<String>,
    pub project_id: i64,
    pub name: String,
    pub status: ThreadStatus,
    pub created_at: String,
    pub updated_at: String,
}

/// Audit row for a message delivered in either direction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveredMessage {
    pub id: i64,
    pub thread_id: i64,
    pub direction: MessageDirection,
    pub chat_message_id: Option<String>,
    pub content: String,
    pub event_type: String,
    pub created_at: String,
}
