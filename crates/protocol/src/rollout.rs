//! Codex rollout records.
//!
//! A rollout file holds one JSON object per line: `{"type": ..., "payload": ...}`.
//! Decoding is defensive: unknown fields are ignored, unknown record types map
//! to `Unrecognized`, and lines that are not JSON objects decode to `None`.

use serde::Deserialize;
use serde_json::Value;

use crate::types::Role;

/// One decoded rollout line
#[derive(Debug, Clone, PartialEq)]
pub enum RolloutRecord {
    SessionMeta(SessionMeta),
    TurnContext(TurnContext),
    ResponseItem(ResponseItem),
    EventMsg(EventMsg),
    Unrecognized,
}

/// First line of every rollout file
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionMeta {
    pub id: String,
    pub cwd: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub originator: Option<String>,
    #[serde(default)]
    pub model_provider: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct TurnContext {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub approval_policy: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseItem {
    Message { role: Role, text: Option<String> },
    Reasoning { summary: Option<String> },
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventMsg {
    UserMessage { message: String },
    AgentMessage { message: String },
    AgentReasoning { text: String },
    TaskStarted,
    TaskComplete { last_agent_message: Option<String> },
    Other(String),
}

#[derive(Deserialize)]
struct RawLine {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    payload: Option<Value>,
}

/// Decode one rollout line. Returns `None` when the line is not a JSON object.
pub fn decode_line(line: &str) -> Option<RolloutRecord> {
    let raw: RawLine = serde_json::from_str(line.trim()).ok()?;
    let (Some(kind), Some(payload)) = (raw.kind, raw.payload) else {
        return Some(RolloutRecord::Unrecognized);
    };

    let record = match kind.as_str() {
        "session_meta" => serde_json::from_value::<SessionMeta>(payload)
            .map(RolloutRecord::SessionMeta)
            .unwrap_or(RolloutRecord::Unrecognized),
        "turn_context" => serde_json::from_value::<TurnContext>(payload)
            .map(RolloutRecord::TurnContext)
            .unwrap_or(RolloutRecord::Unrecognized),
        "response_item" => decode_response_item(&payload)
            .map(RolloutRecord::ResponseItem)
            .unwrap_or(RolloutRecord::Unrecognized),
        "event_msg" => decode_event_msg(&payload)
            .map(RolloutRecord::EventMsg)
            .unwrap_or(RolloutRecord::Unrecognized),
        _ => RolloutRecord::Unrecognized,
    };
    Some(record)
}

/// True when `fragment` is a syntactically complete JSON object.
///
/// Some writers flush the last record without its line terminator; the tailer
/// uses this to emit such a record instead of holding it as a partial line.
pub fn is_complete_record(fragment: &str) -> bool {
    let trimmed = fragment.trim();
    if !trimmed.starts_with('{') {
        return false;
    }
    matches!(serde_json::from_str::<Value>(trimmed), Ok(Value::Object(_)))
}

fn decode_response_item(payload: &Value) -> Option<ResponseItem> {
    let item_type = payload.get("type")?.as_str()?;
    let item = match item_type {
        "message" => {
            let role = payload
                .get("role")
                .and_then(|v| v.as_str())
                .and_then(Role::parse)?;
            ResponseItem::Message {
                role,
                text: extract_message_text(payload),
            }
        }
        "reasoning" => ResponseItem::Reasoning {
            summary: extract_reasoning_summary(payload),
        },
        other => ResponseItem::Other(other.to_string()),
    };
    Some(item)
}

fn decode_event_msg(payload: &Value) -> Option<EventMsg> {
    let event_type = payload.get("type")?.as_str()?;
    let text_field = |key: &str| {
        payload
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    };

    let event = match event_type {
        "user_message" => EventMsg::UserMessage {
            message: text_field("message")?,
        },
        "agent_message" => EventMsg::AgentMessage {
            message: text_field("message")?,
        },
        "agent_reasoning" => EventMsg::AgentReasoning {
            text: text_field("text")?,
        },
        "task_started" | "turn_started" => EventMsg::TaskStarted,
        "task_complete" | "turn_complete" => EventMsg::TaskComplete {
            last_agent_message: text_field("last_agent_message"),
        },
        other => EventMsg::Other(other.to_string()),
    };
    Some(event)
}

fn extract_message_text(payload: &Value) -> Option<String> {
    if let Some(text) = payload.get("content").and_then(|v| v.as_str()) {
        return Some(text.to_string());
    }

    let content = payload.get("content")?.as_array()?;
    let parts: Vec<&str> = content
        .iter()
        .filter_map(|item| item.get("text").and_then(|v| v.as_str()))
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .collect();

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

fn extract_reasoning_summary(payload: &Value) -> Option<String> {
    let summary = payload.get("summary")?.as_array()?;
    let parts: Vec<&str> = summary
        .iter()
        .filter_map(|item| item.get("text").and_then(|v| v.as_str()))
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .collect();

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}
