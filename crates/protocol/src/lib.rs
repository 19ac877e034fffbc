//! codexcord protocol
//!
//! Shared types for the bridge: the Codex rollout record model (what the
//! tailer reads) and the mapping rows (what the store persists).

pub mod rollout;
pub mod types;

pub use rollout::{
    decode_line, is_complete_record, EventMsg, ResponseItem, RolloutRecord, SessionMeta,
    TurnContext,
};
pub use types::*;
