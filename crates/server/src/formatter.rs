//! Rollout record -> chat message translation.

use codexcord_protocol::{EventMsg, ResponseItem, Role, RolloutRecord};

use crate::echo::EchoKind;
use crate::session_naming::is_bootstrap_prompt;

/// A message to post for one rollout line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub kind: EchoKind,
    /// Raw text, compared by the echo suppressor
    pub text: String,
    /// What gets posted
    pub rendered: String,
    pub event_type: &'static str,
}

/// What one decoded rollout line means for the mapped thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEffect {
    Deliver(Delivery),
    /// `turn_context` named the model in use
    ModelSeen(String),
    TaskComplete,
    Skip,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FormatOptions {
    pub show_reasoning: bool,
}

pub fn interpret(record: &RolloutRecord, options: FormatOptions) -> LineEffect {
    match record {
        RolloutRecord::TurnContext(ctx) => ctx
            .model
            .as_ref()
            .filter(|m| !m.is_empty())
            .map(|m| LineEffect::ModelSeen(m.clone()))
            .unwrap_or(LineEffect::Skip),
        RolloutRecord::ResponseItem(ResponseItem::Message {
            role,
            text: Some(text),
        }) => match role {
            Role::User => user_delivery(text, "user_message"),
            Role::Assistant => assistant_delivery(text, "agent_message"),
            Role::Developer | Role::System => LineEffect::Skip,
        },
        RolloutRecord::ResponseItem(ResponseItem::Reasoning {
            summary: Some(summary),
        }) if options.show_reasoning => reasoning_delivery(summary),
        RolloutRecord::EventMsg(EventMsg::UserMessage { message }) => {
            user_delivery(message, "user_message")
        }
        RolloutRecord::EventMsg(EventMsg::AgentMessage { message }) => {
            assistant_delivery(message, "agent_message")
        }
        RolloutRecord::EventMsg(EventMsg::AgentReasoning { text }) if options.show_reasoning => {
            reasoning_delivery(text)
        }
        RolloutRecord::EventMsg(EventMsg::TaskComplete { .. }) => LineEffect::TaskComplete,
        _ => LineEffect::Skip,
    }
}

fn user_delivery(text: &str, event_type: &'static str) -> LineEffect {
    let trimmed = text.trim();
    if trimmed.is_empty() || is_bootstrap_prompt(trimmed) {
        return LineEffect::Skip;
    }
    LineEffect::Deliver(Delivery {
        kind: EchoKind::User,
        text: trimmed.to_string(),
        rendered: render_user(trimmed),
        event_type,
    })
}

fn assistant_delivery(text: &str, event_type: &'static str) -> LineEffect {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return LineEffect::Skip;
    }
    LineEffect::Deliver(Delivery {
        kind: EchoKind::Assistant,
        text: trimmed.to_string(),
        rendered: trimmed.to_string(),
        event_type,
    })
}

fn reasoning_delivery(text: &str) -> LineEffect {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return LineEffect::Skip;
    }
    // Reasoning shares the assistant echo bucket; Codex writes it twice too.
    LineEffect::Deliver(Delivery {
        kind: EchoKind::Assistant,
        text: trimmed.to_string(),
        rendered: render_reasoning(trimmed),
        event_type: "reasoning",
    })
}

pub fn render_user(text: &str) -> String {
    format!("**user:** {text}")
}

pub fn render_reasoning(text: &str) -> String {
    text.lines()
        .map(|line| {
            if line.trim().is_empty() {
                ">".to_string()
            } else {
                format!("> _{}_", line.trim())
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_failure(message: &str) -> String {
    format!(":warning: turn failed: {}", message.trim())
}
