//! Display names for session threads.

use codexcord_protocol::{EventMsg, ResponseItem, Role, RolloutRecord};

const MAX_NAME_CHARS: usize = 72;

pub fn name_from_first_prompt(prompt: &str) -> Option<String> {
    let normalized = prompt.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() || is_bootstrap_prompt(&normalized) {
        return None;
    }

    let mut out: String = normalized.chars().take(MAX_NAME_CHARS).collect();
    if normalized.chars().count() > MAX_NAME_CHARS {
        out.push('…');
    }
    Some(out)
}

/// Context Codex injects as a "user" message before the real first prompt.
pub fn is_bootstrap_prompt(message: &str) -> bool {
    message.contains("<environment_context>")
        || message.contains("<permissions instructions>")
        || message.contains("<user_instructions>")
        || message.contains("AGENTS.md instructions for")
}

/// Name a thread after the first real user prompt among `lines`.
pub fn name_from_rollout_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Option<String> {
    lines.into_iter().find_map(|line| {
        let prompt = match codexcord_protocol::decode_line(line)? {
            RolloutRecord::EventMsg(EventMsg::UserMessage { message }) => message,
            RolloutRecord::ResponseItem(ResponseItem::Message {
                role: Role::User,
                text: Some(text),
            }) => text,
            _ => return None,
        };
        name_from_first_prompt(&prompt)
    })
}

/// Fallback when no prompt has been seen yet.
pub fn fallback_session_name(session_id: &str) -> String {
    let short: String = session_id.chars().take(8).collect();
    format!("session {short}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_bootstrap_prompt_messages() {
        assert!(name_from_first_prompt("# AGENTS.md instructions for /tmp/repo").is_none());
        assert!(name_from_first_prompt("<environment_context>...</environment_context>").is_none());
        assert!(
            name_from_first_prompt("<permissions instructions>...</permissions instructions>")
                .is_none()
        );
        assert_eq!(
            name_from_first_prompt("Fix flaky ingress test").as_deref(),
            Some("Fix flaky ingress test")
        );
    }

    #[test]
    fn truncates_and_normalizes_prompt() {
        let prompt =
            "  Please investigate auth race conditions and propose a safe migration plan.  ";
        let name = name_from_first_prompt(prompt).expect("expected name");
        assert_eq!(
            name,
            "Please investigate auth race conditions and propose a safe migration pla…"
        );
    }

    #[test]
    fn names_from_first_real_prompt_in_rollout() {
        let lines = [
            r#"{"type":"session_meta","payload":{"id":"s1","cwd":"/srv/api"}}"#,
            r#"{"type":"response_item","payload":{"type":"message","role":"user","content":[{"type":"input_text","text":"<environment_context>cwd</environment_context>"}]}}"#,
            r#"{"type":"event_msg","payload":{"type":"user_message","message":"add retries to the client"}}"#,
        ];
        assert_eq!(
            name_from_rollout_lines(lines).as_deref(),
            Some("add retries to the client")
        );
        assert_eq!(fallback_session_name("0199a2b3-c4d5"), "session 0199a2b3");
    }
}
