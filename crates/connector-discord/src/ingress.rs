use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use codexcord_connector_core::{ChatError, ChatEvent, ChatPlatform};
use reqwest::Method;
use serde_json::Value;
use tracing::{debug, warn};

use crate::client::DiscordClient;

const MAX_POLL_BATCH_SIZE: usize = 50;
// Mapped channels are verified once every this many polls.
const CHANNEL_CHECK_INTERVAL: u64 = 20;
// Default (0) and reply (19) messages carry user text; the rest are system notices.
const USER_MESSAGE_TYPES: [i64; 2] = [0, 19];

/// Entities the bridge currently has mapped
#[derive(Debug, Clone, Default)]
pub struct WatchSet {
    pub channels: Vec<String>,
    pub threads: Vec<String>,
}

/// Polling ingress for user messages and user-created threads.
///
/// Threads already mapped when the ingress starts are primed at their newest
/// message so history is not replayed; threads that appear later are read
/// from their first message.
pub struct DiscordIngress {
    client: DiscordClient,
    cursors: HashMap<String, String>,
    announced_threads: HashSet<String>,
    primed: bool,
    polls: u64,
}

impl DiscordIngress {
    pub fn new(client: DiscordClient) -> Self {
        Self {
            client,
            cursors: HashMap::new(),
            announced_threads: HashSet::new(),
            primed: false,
            polls: 0,
        }
    }

    pub async fn poll_once(&mut self, watch: &WatchSet) -> Vec<ChatEvent> {
        let mut events = Vec::new();
        let priming = !self.primed;

        self.cursors
            .retain(|thread_id, _| watch.threads.iter().any(|t| t == thread_id));

        for thread_id in &watch.threads {
            match self.poll_thread(thread_id, priming).await {
                Ok(mut thread_events) => events.append(&mut thread_events),
                Err(err) if err.is_gone() => {
                    self.cursors.remove(thread_id);
                    events.push(ChatEvent::ThreadDeleted {
                        thread_id: thread_id.clone(),
                    });
                }
                Err(err) => {
                    warn!(
                        component = "discord_ingress",
                        event = "discord_ingress.poll_failed",
                        thread_id = %thread_id,
                        error = %err,
                        "Thread poll failed"
                    );
                }
            }
        }

        match self.poll_active_threads(watch).await {
            Ok(mut created) => events.append(&mut created),
            Err(err) => {
                warn!(
                    component = "discord_ingress",
                    event = "discord_ingress.active_threads_failed",
                    error = %err,
                    "Active thread listing failed"
                );
            }
        }

        if self.polls % CHANNEL_CHECK_INTERVAL == 0 {
            for channel_id in &watch.channels {
                match self.client.fetch_channel(channel_id).await {
                    Ok(_) => {}
                    Err(err) if err.is_gone() => events.push(ChatEvent::ChannelDeleted {
                        channel_id: channel_id.clone(),
                    }),
                    Err(err) => {
                        debug!(
                            component = "discord_ingress",
                            event = "discord_ingress.channel_check_failed",
                            channel_id = %channel_id,
                            error = %err,
                            "Channel check failed"
                        );
                    }
                }
            }
        }

        self.polls += 1;
        self.primed = true;
        events
    }

    async fn poll_thread(
        &mut self,
        thread_id: &str,
        priming: bool,
    ) -> Result<Vec<ChatEvent>, ChatError> {
        let path = format!("/channels/{thread_id}/messages");

        let cursor = match self.cursors.get(thread_id) {
            Some(cursor) => cursor.clone(),
            None if priming => {
                let value = self
                    .client
                    .request(Method::GET, &path, &[("limit", "1".to_string())], None)
                    .await?;
                let newest = newest_message_id(&value).unwrap_or_else(|| "0".to_string());
                self.cursors.insert(thread_id.to_string(), newest);
                return Ok(Vec::new());
            }
            None => "0".to_string(),
        };

        let value = self
            .client
            .request(
                Method::GET,
                &path,
                &[
                    ("after", cursor.clone()),
                    ("limit", MAX_POLL_BATCH_SIZE.to_string()),
                ],
                None,
            )
            .await?;

        let (events, latest) = messages_to_events(thread_id, &value, &cursor);
        if let Some(latest) = latest {
            self.cursors.insert(thread_id.to_string(), latest);
        }
        if !events.is_empty() {
            debug!(
                component = "discord_ingress",
                event = "discord_ingress.messages",
                thread_id = %thread_id,
                count = events.len(),
                "Ingested thread messages"
            );
        }
        Ok(events)
    }

    async fn poll_active_threads(
        &mut self,
        watch: &WatchSet,
    ) -> Result<Vec<ChatEvent>, ChatError> {
        if watch.channels.is_empty() {
            return Ok(Vec::new());
        }
        let path = format!("/guilds/{}/threads/active", self.client.guild_id());
        let value = self.client.request(Method::GET, &path, &[], None).await?;

        let mut events = Vec::new();
        let threads = value
            .get("threads")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let active: HashSet<&str> = threads
            .iter()
            .filter_map(|t| t.get("id").and_then(|v| v.as_str()))
            .collect();
        forget_settled_threads(&mut self.announced_threads, &active, watch);
        for thread in &threads {
            let (Some(id), Some(parent)) = (
                thread.get("id").and_then(|v| v.as_str()),
                thread.get("parent_id").and_then(|v| v.as_str()),
            ) else {
                continue;
            };
            if !watch.channels.iter().any(|c| c == parent)
                || watch.threads.iter().any(|t| t == id)
                || !self.announced_threads.insert(id.to_string())
            {
                continue;
            }
            events.push(ChatEvent::ThreadCreated {
                thread_id: id.to_string(),
                channel_id: parent.to_string(),
                name: thread
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            });
        }
        Ok(events)
    }
}

/// Announced threads are only remembered until they are mapped or leave the
/// active listing.
fn forget_settled_threads(
    announced: &mut HashSet<String>,
    active: &HashSet<&str>,
    watch: &WatchSet,
) {
    announced.retain(|id| {
        active.contains(id.as_str()) && !watch.threads.iter().any(|t| t == id)
    });
}

fn newest_message_id(value: &Value) -> Option<String> {
    value
        .as_array()?
        .iter()
        .filter_map(|m| m.get("id").and_then(|v| v.as_str()))
        .max_by(|a, b| compare_snowflakes(a, b))
        .map(str::to_string)
}

/// Convert a messages listing into `MessageCreated` events, oldest first.
/// Returns the events and the newest message id seen (if newer than `after`).
pub(crate) fn messages_to_events(
    thread_id: &str,
    value: &Value,
    after: &str,
) -> (Vec<ChatEvent>, Option<String>) {
    let mut messages: Vec<&Value> = value
        .as_array()
        .map(|items| items.iter().collect())
        .unwrap_or_default();
    messages.sort_by(|a, b| {
        let a = a.get("id").and_then(|v| v.as_str()).unwrap_or_default();
        let b = b.get("id").and_then(|v| v.as_str()).unwrap_or_default();
        compare_snowflakes(a, b)
    });

    let mut events = Vec::new();
    let mut latest: Option<String> = None;
    for message in messages {
        let Some(id) = message.get("id").and_then(|v| v.as_str()) else {
            continue;
        };
        if compare_snowflakes(id, after) != Ordering::Greater {
            continue;
        }
        latest = Some(id.to_string());

        let is_bot = message
            .get("author")
            .and_then(|a| a.get("bot"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let kind = message.get("type").and_then(|v| v.as_i64()).unwrap_or(0);
        let content = message
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .trim();
        if is_bot || !USER_MESSAGE_TYPES.contains(&kind) || content.is_empty() {
            continue;
        }

        let author = message
            .get("author")
            .and_then(|a| a.get("username"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        events.push(ChatEvent::MessageCreated {
            thread_id: thread_id.to_string(),
            message_id: id.to_string(),
            author: author.to_string(),
            content: content.to_string(),
        });
    }
    (events, latest)
}

/// Snowflakes are decimal u64 strings; compare numerically.
fn compare_snowflakes(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn snowflakes_compare_numerically() {
        assert_eq!(compare_snowflakes("9", "10"), Ordering::Less);
        assert_eq!(
            compare_snowflakes("1200000000000000000", "999999999999999999"),
            Ordering::Greater
        );
    }

    #[test]
    fn listing_becomes_ordered_user_events() {
        let listing = json!([
            {"id": "30", "type": 0, "content": "third", "author": {"username": "ana"}},
            {"id": "10", "type": 0, "content": "first", "author": {"username": "ana"}},
            {"id": "20", "type": 0, "content": "bot says", "author": {"username": "codexcord", "bot": true}},
            {"id": "25", "type": 18, "content": "thread created", "author": {"username": "ana"}},
            {"id": "5", "type": 0, "content": "old", "author": {"username": "ana"}}
        ]);

        let (events, latest) = messages_to_events("t1", &listing, "7");
        let texts: Vec<_> = events
            .iter()
            .map(|e| match e {
                ChatEvent::MessageCreated { content, .. } => content.as_str(),
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(texts, vec!["first", "third"]);
        assert_eq!(latest.as_deref(), Some("30"));
    }

    #[test]
    fn announced_threads_are_forgotten_once_mapped_or_archived() {
        let mut announced: HashSet<String> = ["t1", "t2", "t3"]
            .into_iter()
            .map(String::from)
            .collect();
        let watch = WatchSet {
            channels: vec!["c1".to_string()],
            threads: vec!["t1".to_string()],
        };
        let active: HashSet<&str> = ["t1", "t2"].into_iter().collect();

        forget_settled_threads(&mut announced, &active, &watch);
        assert_eq!(announced, HashSet::from(["t2".to_string()]));
    }

    #[test]
    fn empty_listing_keeps_cursor() {
        let (events, latest) = messages_to_events("t1", &json!([]), "7");
        assert!(events.is_empty());
        assert!(latest.is_none());
    }
}
