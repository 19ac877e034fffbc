use std::time::Duration;

use async_trait::async_trait;
use codexcord_connector_core::{ChannelInfo, ChatError, ChatPlatform, SentMessage, ThreadInfo};
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::text::{chunk_text, sanitize_channel_name, sanitize_thread_name, DISCORD_MAX_CHARS};

pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

const GUILD_TEXT_CHANNEL: u8 = 0;
const PUBLIC_THREAD: u8 = 11;
const THREAD_AUTO_ARCHIVE_MINUTES: u32 = 10080;
const MAX_RATE_LIMIT_RETRIES: usize = 3;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

// https://discord.com/developers/docs/topics/opcodes-and-status-codes#json
const UNKNOWN_CHANNEL: i64 = 10003;
const UNKNOWN_GUILD: i64 = 10004;
const UNKNOWN_MESSAGE: i64 = 10008;
const MISSING_ACCESS: i64 = 50001;

#[derive(Debug, Clone)]
pub struct DiscordConfig {
    pub api_base: String,
    pub bot_token: String,
    pub guild_id: String,
    /// Parent category for project channels
    pub category_id: Option<String>,
}

#[derive(Clone)]
pub struct DiscordClient {
    http: reqwest::Client,
    config: DiscordConfig,
}

impl DiscordClient {
    pub fn new(config: DiscordConfig) -> Result<Self, ChatError> {
        if config.bot_token.trim().is_empty() {
            return Err(ChatError::Transport(
                "discord bot token must not be empty".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| ChatError::Transport(err.to_string()))?;
        Ok(Self { http, config })
    }

    pub fn guild_id(&self) -> &str {
        &self.config.guild_id
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    /// Issue one REST call, retrying on 429 up to a small bound.
    pub(crate) async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Value, ChatError> {
        let url = self.endpoint(path);
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let mut builder = self
                .http
                .request(method.clone(), url.as_str())
                .header(
                    "Authorization",
                    format!("Bot {}", self.config.bot_token.trim()),
                )
                .query(query);
            if let Some(body) = body {
                builder = builder.json(body);
            }

            let response = builder
                .send()
                .await
                .map_err(|err| ChatError::Transport(err.to_string()))?;
            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|err| ChatError::Transport(err.to_string()))?;

            if status.is_success() {
                if text.trim().is_empty() {
                    return Ok(Value::Null);
                }
                return serde_json::from_str(&text)
                    .map_err(|err| ChatError::Transport(format!("invalid json: {err}")));
            }

            let error = classify_error(status, &text);
            if let ChatError::RateLimited { retry_after } = &error {
                if attempt < MAX_RATE_LIMIT_RETRIES {
                    debug!(
                        component = "discord",
                        event = "discord.rate_limited",
                        path = %path,
                        retry_after_ms = retry_after.as_millis() as u64,
                        attempt = attempt,
                        "Rate limited, backing off"
                    );
                    tokio::time::sleep(*retry_after).await;
                    continue;
                }
            }
            return Err(error);
        }
    }
}

/// Map a failed Discord response to a `ChatError`.
///
/// Only the "unknown entity" and "missing access" codes count as gone; a bare
/// 404 without a JSON code (wrong route, proxy) stays a generic API error.
pub(crate) fn classify_error(status: StatusCode, body: &str) -> ChatError {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let code = parsed
        .as_ref()
        .and_then(|v| v.get("code"))
        .and_then(|v| v.as_i64());
    let message = parsed
        .as_ref()
        .and_then(|v| v.get("message"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| body.chars().take(200).collect());

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_secs = parsed
            .as_ref()
            .and_then(|v| v.get("retry_after"))
            .and_then(|v| v.as_f64())
            .unwrap_or(1.0)
            .clamp(0.0, 60.0);
        return ChatError::RateLimited {
            retry_after: Duration::from_secs_f64(retry_secs),
        };
    }

    match code {
        Some(UNKNOWN_CHANNEL | UNKNOWN_GUILD | UNKNOWN_MESSAGE) => ChatError::NotFound(message),
        Some(MISSING_ACCESS) => ChatError::MissingAccess(message),
        _ => ChatError::Api {
            status: status.as_u16(),
            code,
            message,
        },
    }
}

fn channel_from_value(value: &Value) -> Result<ChannelInfo, ChatError> {
    let id = value
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ChatError::Transport("channel response missing id".to_string()))?;
    let name = value
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    Ok(ChannelInfo {
        id: id.to_string(),
        name: name.to_string(),
    })
}

#[async_trait]
impl ChatPlatform for DiscordClient {
    async fn create_channel(
        &self,
        name: &str,
        topic: Option<&str>,
    ) -> Result<ChannelInfo, ChatError> {
        let mut body = json!({
            "name": sanitize_channel_name(name),
            "type": GUILD_TEXT_CHANNEL,
        });
        if let Some(topic) = topic {
            body["topic"] = json!(topic.chars().take(1024).collect::<String>());
        }
        if let Some(category) = self.config.category_id.as_deref() {
            body["parent_id"] = json!(category);
        }

        let path = format!("/guilds/{}/channels", self.config.guild_id);
        let value = self.request(Method::POST, &path, &[], Some(&body)).await?;
        channel_from_value(&value)
    }

    async fn fetch_channel(&self, channel_id: &str) -> Result<ChannelInfo, ChatError> {
        let path = format!("/channels/{channel_id}");
        let value = self.request(Method::GET, &path, &[], None).await?;
        channel_from_value(&value)
    }

    async fn delete_channel(&self, channel_id: &str) -> Result<(), ChatError> {
        let path = format!("/channels/{channel_id}");
        self.request(Method::DELETE, &path, &[], None).await?;
        Ok(())
    }

    async fn create_thread(&self, channel_id: &str, name: &str) -> Result<ThreadInfo, ChatError> {
        let body = json!({
            "name": sanitize_thread_name(name),
            "type": PUBLIC_THREAD,
            "auto_archive_duration": THREAD_AUTO_ARCHIVE_MINUTES,
        });
        let path = format!("/channels/{channel_id}/threads");
        let value = self.request(Method::POST, &path, &[], Some(&body)).await?;
        let channel = channel_from_value(&value)?;
        Ok(ThreadInfo {
            id: channel.id,
            channel_id: channel_id.to_string(),
            name: channel.name,
        })
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<(), ChatError> {
        self.delete_channel(thread_id).await
    }

    async fn send_message(
        &self,
        thread_id: &str,
        content: &str,
    ) -> Result<SentMessage, ChatError> {
        let chunks = chunk_text(content, DISCORD_MAX_CHARS);
        let path = format!("/channels/{thread_id}/messages");
        let mut last_id = None;

        for (index, chunk) in chunks.iter().enumerate() {
            let body = json!({
                "content": chunk,
                "allowed_mentions": { "parse": [] },
            });
            match self.request(Method::POST, &path, &[], Some(&body)).await {
                Ok(value) => {
                    last_id = value
                        .get("id")
                        .and_then(|v| v.as_str())
                        .map(str::to_string);
                }
                Err(err) => {
                    if index > 0 {
                        warn!(
                            component = "discord",
                            event = "discord.partial_send",
                            thread_id = %thread_id,
                            chunk_index = index,
                            chunk_count = chunks.len(),
                            error = %err,
                            "Message partially delivered"
                        );
                    }
                    return Err(err);
                }
            }
        }

        let id = last_id.ok_or_else(|| {
            ChatError::Transport("message response did not include an id".to_string())
        })?;
        Ok(SentMessage { id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_channel_and_missing_access_are_gone() {
        let unknown = classify_error(
            StatusCode::NOT_FOUND,
            r#"{"message":"Unknown Channel","code":10003}"#,
        );
        assert!(matches!(unknown, ChatError::NotFound(ref m) if m == "Unknown Channel"));

        let access = classify_error(
            StatusCode::FORBIDDEN,
            r#"{"message":"Missing Access","code":50001}"#,
        );
        assert!(access.is_gone());
    }

    #[test]
    fn other_failures_are_transient() {
        let perms = classify_error(
            StatusCode::FORBIDDEN,
            r#"{"message":"Missing Permissions","code":50013}"#,
        );
        assert!(!perms.is_gone());

        let bare_404 = classify_error(StatusCode::NOT_FOUND, "<html>not found</html>");
        assert!(matches!(bare_404, ChatError::Api { status: 404, code: None, .. }));

        let server = classify_error(StatusCode::BAD_GATEWAY, "");
        assert!(!server.is_gone());
    }

    #[test]
    fn rate_limit_reads_retry_after() {
        let limited = classify_error(
            StatusCode::TOO_MANY_REQUESTS,
            r#"{"message":"You are being rate limited.","retry_after":0.25,"global":false}"#,
        );
        match limited {
            ChatError::RateLimited { retry_after } => {
                assert_eq!(retry_after, Duration::from_millis(250))
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
    }

    #[test]
    fn empty_token_is_rejected() {
        let result = DiscordClient::new(DiscordConfig {
            api_base: DEFAULT_API_BASE.to_string(),
            bot_token: "  ".to_string(),
            guild_id: "1".to_string(),
            category_id: None,
        });
        assert!(result.is_err());
    }
}
