//! Discord text limits: message chunking and entity names.

pub const DISCORD_MAX_CHARS: usize = 2000;
const MAX_NAME_CHARS: usize = 100;

/// Split `text` into chunks of at most `max_chars` characters, preferring
/// newline boundaries, then spaces, then a hard cut.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut rest = text.trim();

    while !rest.is_empty() {
        if rest.chars().count() <= max_chars {
            chunks.push(rest.to_string());
            break;
        }

        let hard_end = rest
            .char_indices()
            .nth(max_chars)
            .map(|(idx, _)| idx)
            .unwrap_or(rest.len());
        let window = &rest[..hard_end];
        let cut = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|idx| *idx > 0)
            .unwrap_or(hard_end);

        let (head, tail) = rest.split_at(cut);
        let head = head.trim_end();
        if !head.is_empty() {
            chunks.push(head.to_string());
        }
        rest = tail.trim_start();
    }

    chunks
}

/// Guild text channel names: lowercase, `[a-z0-9_-]`, no repeated dashes.
pub fn sanitize_channel_name(raw: &str) -> String {
    let mut out = String::new();
    for ch in raw.trim().chars().flat_map(char::to_lowercase) {
        let mapped = if ch.is_alphanumeric() || ch == '_' {
            ch
        } else {
            '-'
        };
        if mapped == '-' && (out.is_empty() || out.ends_with('-')) {
            continue;
        }
        out.push(mapped);
        if out.chars().count() >= MAX_NAME_CHARS {
            break;
        }
    }
    let out = out.trim_end_matches('-').to_string();
    if out.is_empty() {
        "project".to_string()
    } else {
        out
    }
}

pub fn sanitize_thread_name(raw: &str) -> String {
    let normalized = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let truncated: String = normalized.chars().take(MAX_NAME_CHARS).collect();
    if truncated.is_empty() {
        "session".to_string()
    } else {
        truncated
    }
}
