//! Codex connector
//!
//! Runs interactive turns through `codex exec --json` and translates its
//! JSONL event stream into `TurnEvent`s.

use std::collections::VecDeque;
use std::process::Stdio;

use async_trait::async_trait;
use codexcord_connector_core::{ConnectorError, TurnEvent, TurnRequest, TurnRunner};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const STDERR_TAIL_LINES: usize = 20;

/// Turn runner backed by the `codex` CLI
#[derive(Debug, Clone)]
pub struct CodexExecRunner {
    codex_bin: String,
}

impl CodexExecRunner {
    pub fn new(codex_bin: impl Into<String>) -> Self {
        Self {
            codex_bin: codex_bin.into(),
        }
    }

    /// Arguments for one `codex exec` invocation.
    pub fn build_args(request: &TurnRequest) -> Vec<String> {
        let mut args = vec![
            "exec".to_string(),
            "--json".to_string(),
            "--skip-git-repo-check".to_string(),
            "-C".to_string(),
            request.cwd.clone(),
        ];
        if let Some(model) = request.model.as_deref().filter(|m| !m.is_empty()) {
            args.push("-m".to_string());
            args.push(model.to_string());
        }
        if let Some(policy) = request.approval_policy.as_deref().filter(|p| !p.is_empty()) {
            args.push("-c".to_string());
            args.push(format!("approval_policy=\"{policy}\""));
        }
        if let Some(session_id) = request.session_id.as_deref() {
            args.push("resume".to_string());
            args.push(session_id.to_string());
        }
        args.push(request.prompt.clone());
        args
    }
}

#[derive(Debug, Deserialize)]
struct ExecLine {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    item: Option<ExecItem>,
    #[serde(default)]
    error: Option<ExecError>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExecItem {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExecError {
    #[serde(default)]
    message: Option<String>,
}

/// Translate one line of `codex exec --json` output.
///
/// Lines that are not JSON or carry no relay-worthy content yield `None`.
pub fn parse_exec_event(line: &str) -> Option<TurnEvent> {
    let parsed: ExecLine = serde_json::from_str(line.trim()).ok()?;
    match parsed.kind.as_str() {
        "thread.started" => parsed
            .thread_id
            .filter(|id| !id.is_empty())
            .map(|session_id| TurnEvent::SessionStarted { session_id }),
        "item.completed" => {
            let item = parsed.item?;
            let text = item.text.filter(|t| !t.trim().is_empty())?;
            match item.kind.as_str() {
                "agent_message" => Some(TurnEvent::AgentMessage { text }),
                "reasoning" => Some(TurnEvent::Reasoning { text }),
                _ => None,
            }
        }
        "turn.completed" => Some(TurnEvent::Completed),
        "turn.failed" => Some(TurnEvent::Failed {
            message: parsed
                .error
                .and_then(|e| e.message)
                .unwrap_or_else(|| "turn failed".to_string()),
        }),
        "error" => Some(TurnEvent::Failed {
            message: parsed
                .message
                .or_else(|| parsed.error.and_then(|e| e.message))
                .unwrap_or_else(|| "codex reported an error".to_string()),
        }),
        _ => None,
    }
}

async fn collect_tail<R: AsyncRead + Unpin>(reader: R) -> String {
    let mut lines = BufReader::new(reader).lines();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    while let Ok(Some(line)) = lines.next_line().await {
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into_iter().collect::<Vec<_>>().join("\n")
}

#[async_trait]
impl TurnRunner for CodexExecRunner {
    async fn run_turn(
        &self,
        request: TurnRequest,
        events: mpsc::Sender<TurnEvent>,
    ) -> Result<(), ConnectorError> {
        let args = Self::build_args(&request);
        info!(
            component = "codex_exec",
            event = "codex_exec.spawn",
            cwd = %request.cwd,
            resume = request.session_id.is_some(),
            "Starting codex turn"
        );

        let mut child = Command::new(&self.codex_bin)
            .args(&args)
            .current_dir(&request.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ConnectorError::SpawnError(format!("{}: {}", self.codex_bin, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ConnectorError::SpawnError("stdout not captured".to_string()))?;
        let stderr_task = child.stderr.take().map(|stderr| tokio::spawn(collect_tail(stderr)));

        let mut saw_terminal = false;
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            let Some(event) = parse_exec_event(&line) else {
                continue;
            };
            if matches!(event, TurnEvent::Completed | TurnEvent::Failed { .. }) {
                saw_terminal = true;
            }
            if events.send(event).await.is_err() {
                debug!(
                    component = "codex_exec",
                    event = "codex_exec.receiver_dropped",
                    "Turn event receiver dropped, stopping turn"
                );
                let _ = child.kill().await;
                return Err(ConnectorError::ChannelClosed);
            }
        }

        let status = child.wait().await?;
        let stderr_tail = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if saw_terminal {
            return Ok(());
        }

        let terminal = if status.success() {
            TurnEvent::Completed
        } else {
            warn!(
                component = "codex_exec",
                event = "codex_exec.exit_failed",
                status = %status,
                "codex exited without a terminal event"
            );
            let message = if stderr_tail.trim().is_empty() {
                format!("codex exited with {status}")
            } else {
                stderr_tail
            };
            TurnEvent::Failed { message }
        };
        events
            .send(terminal)
            .await
            .map_err(|_| ConnectorError::ChannelClosed)
    }
}
