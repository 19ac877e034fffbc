//! Discord connector
//!
//! `DiscordClient` implements `ChatPlatform` over the Discord v10 REST API.
//! `DiscordIngress` polls mapped threads for user messages and the guild for
//! newly created threads.

mod client;
mod ingress;
mod text;

pub use client::{DiscordClient, DiscordConfig, DEFAULT_API_BASE};
pub use ingress::{DiscordIngress, WatchSet};
pub use text::{chunk_text, sanitize_channel_name, sanitize_thread_name, DISCORD_MAX_CHARS};
