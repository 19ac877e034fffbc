//! Interactive relay: a message typed into a mapped thread runs one Codex turn
//! and streams the replies back into the thread.

use std::sync::Arc;

use codexcord_connector_core::{ChatPlatform, TurnEvent, TurnRequest, TurnRunner};
use codexcord_protocol::{MessageDirection, ProjectRecord, ThreadRecord, ThreadStatus};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::coordinator::{SyncCoordinator, SyncError};
use crate::echo::{EchoKind, EchoSuppressor};
use crate::formatter::{render_failure, render_reasoning};
use crate::store::MappingStore;

const BUSY_NOTICE: &str =
    ":hourglass: Still working on the previous message. Send this again once it finishes.";
const TURN_EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Not a mapped thread, or nothing to send
    Ignored,
    /// A turn for the thread is already running
    Busy,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RelayConfig {
    pub show_reasoning: bool,
}

pub struct InteractiveRelay {
    coordinator: Arc<SyncCoordinator>,
    store: Arc<MappingStore>,
    chat: Arc<dyn ChatPlatform>,
    echo: Arc<EchoSuppressor>,
    runner: Arc<dyn TurnRunner>,
    busy: DashMap<String, ()>,
    config: RelayConfig,
}

struct BusyGuard<'a> {
    busy: &'a DashMap<String, ()>,
    thread_id: String,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.busy.remove(&self.thread_id);
    }
}

impl InteractiveRelay {
    pub fn new(
        coordinator: Arc<SyncCoordinator>,
        store: Arc<MappingStore>,
        chat: Arc<dyn ChatPlatform>,
        echo: Arc<EchoSuppressor>,
        runner: Arc<dyn TurnRunner>,
        config: RelayConfig,
    ) -> Self {
        Self {
            coordinator,
            store,
            chat,
            echo,
            runner,
            busy: DashMap::new(),
            config,
        }
    }

    pub fn is_busy(&self, chat_thread_id: &str) -> bool {
        self.busy.contains_key(chat_thread_id)
    }

    pub async fn handle_message(
        &self,
        chat_thread_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<DeliveryOutcome, SyncError> {
        let prompt = content.trim();
        if prompt.is_empty() {
            return Ok(DeliveryOutcome::Ignored);
        }
        let Some(thread) = self.store.thread_by_chat_id(chat_thread_id)? else {
            return Ok(DeliveryOutcome::Ignored);
        };
        let Some(project) = self.store.project_by_id(thread.project_id)? else {
            return Ok(DeliveryOutcome::Ignored);
        };

        if self.busy.insert(chat_thread_id.to_string(), ()).is_some() {
            info!(
                component = "relay",
                event = "relay.busy",
                thread_id = %chat_thread_id,
                "Turn already running, refusing message"
            );
            self.chat.send_message(chat_thread_id, BUSY_NOTICE).await?;
            return Ok(DeliveryOutcome::Busy);
        }
        let _busy = BusyGuard {
            busy: &self.busy,
            thread_id: chat_thread_id.to_string(),
        };

        self.store.record_message(
            thread.id,
            MessageDirection::Inbound,
            Some(message_id),
            prompt,
            "user_message",
        )?;
        self.echo.remember(chat_thread_id, EchoKind::User, prompt);
        self.store.update_status(thread.id, ThreadStatus::Active)?;

        self.echo.begin_delivery(chat_thread_id);
        let outcome = self.run_turn(&thread, &project, prompt).await;
        self.echo.end_delivery(chat_thread_id);
        outcome
    }

    async fn run_turn(
        &self,
        thread: &ThreadRecord,
        project: &ProjectRecord,
        prompt: &str,
    ) -> Result<DeliveryOutcome, SyncError> {
        let request = TurnRequest {
            cwd: project.path.clone(),
            prompt: prompt.to_string(),
            session_id: thread.session_id.clone(),
            model: project.model.clone(),
            approval_policy: project.approval_policy.clone(),
        };
        info!(
            component = "relay",
            event = "relay.turn_started",
            thread_id = %thread.chat_thread_id,
            session_id = ?request.session_id,
            cwd = %request.cwd,
            "Running interactive turn"
        );

        let (tx, mut rx) = mpsc::channel(TURN_EVENT_BUFFER);
        let run = self.runner.run_turn(request, tx);
        let consume = async {
            let mut linked = thread.session_id.is_some();
            let mut failure: Option<String> = None;
            let mut completed = false;
            while let Some(event) = rx.recv().await {
                match event {
                    TurnEvent::SessionStarted { session_id } => {
                        if !linked {
                            linked = self.link(thread, project, &session_id).await;
                        }
                    }
                    TurnEvent::AgentMessage { text } => {
                        self.post(thread, EchoKind::Assistant, &text, text.trim(), "agent_message")
                            .await;
                    }
                    TurnEvent::Reasoning { text } if self.config.show_reasoning => {
                        let rendered = render_reasoning(text.trim());
                        self.post(thread, EchoKind::Assistant, &text, &rendered, "reasoning")
                            .await;
                    }
                    TurnEvent::Reasoning { .. } => {}
                    TurnEvent::Completed => completed = true,
                    TurnEvent::Failed { message } => failure = Some(message),
                }
            }
            (completed, failure)
        };
        let (result, (completed, failure)) = tokio::join!(run, consume);

        let failure = match result {
            Ok(()) if failure.is_none() && !completed => {
                Some("turn ended without a result".to_string())
            }
            Ok(()) => failure,
            Err(err) => Some(failure.unwrap_or_else(|| err.to_string())),
        };

        match failure {
            None => {
                self.store
                    .update_status(thread.id, ThreadStatus::Completed)?;
                info!(
                    component = "relay",
                    event = "relay.turn_completed",
                    thread_id = %thread.chat_thread_id,
                    "Interactive turn completed"
                );
                Ok(DeliveryOutcome::Completed)
            }
            Some(message) => {
                warn!(
                    component = "relay",
                    event = "relay.turn_failed",
                    thread_id = %thread.chat_thread_id,
                    error = %message,
                    "Interactive turn failed"
                );
                let notice = render_failure(&message);
                if let Err(err) = self.chat.send_message(&thread.chat_thread_id, &notice).await {
                    warn!(
                        component = "relay",
                        event = "relay.failure_notice_failed",
                        thread_id = %thread.chat_thread_id,
                        error = %err,
                        "Failed posting turn failure"
                    );
                }
                self.store.update_status(thread.id, ThreadStatus::Error)?;
                Ok(DeliveryOutcome::Failed)
            }
        }
    }

    async fn link(&self, thread: &ThreadRecord, project: &ProjectRecord, session_id: &str) -> bool {
        match self.coordinator.link_session(thread, project, session_id).await {
            Ok(true) => true,
            Ok(false) => {
                warn!(
                    component = "relay",
                    event = "relay.session_owned_elsewhere",
                    thread_id = %thread.chat_thread_id,
                    session_id = %session_id,
                    "Session belongs to a thread in another project"
                );
                true
            }
            Err(err) => {
                warn!(
                    component = "relay",
                    event = "relay.link_failed",
                    thread_id = %thread.chat_thread_id,
                    session_id = %session_id,
                    error = %err,
                    "Failed linking thread to session"
                );
                false
            }
        }
    }

    async fn post(
        &self,
        thread: &ThreadRecord,
        kind: EchoKind,
        text: &str,
        rendered: &str,
        event_type: &str,
    ) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        // Remember before sending so a fast tail replay is already covered.
        self.echo.remember(&thread.chat_thread_id, kind, text);
        match self.chat.send_message(&thread.chat_thread_id, rendered).await {
            Ok(sent) => {
                if let Err(err) = self.store.record_message(
                    thread.id,
                    MessageDirection::Outbound,
                    Some(&sent.id),
                    text,
                    event_type,
                ) {
                    warn!(
                        component = "relay",
                        event = "relay.record_failed",
                        thread_id = thread.id,
                        error = %err,
                        "Failed recording relayed message"
                    );
                }
                debug!(
                    component = "relay",
                    event = "relay.message_sent",
                    thread_id = %thread.chat_thread_id,
                    event_type = event_type,
                    "Relayed agent output"
                );
            }
            Err(err) => {
                warn!(
                    component = "relay",
                    event = "relay.send_failed",
                    thread_id = %thread.chat_thread_id,
                    error = %err,
                    "Failed relaying agent output"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use codexcord_protocol::NewProject;

    use super::*;
    use crate::coordinator::{BatchOutcome, CoordinatorConfig};
    use crate::echo::DEFAULT_ECHO_TTL;
    use crate::tailer::TailBatch;
    use crate::testing::{FakeChat, FakeRunner};

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<MappingStore>,
        chat: Arc<FakeChat>,
        coordinator: Arc<SyncCoordinator>,
        project: ProjectRecord,
        thread: ThreadRecord,
    }

    async fn fixture(session_id: Option<&str>) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MappingStore::open_in_memory().expect("store"));
        let chat = Arc::new(FakeChat::new());
        let echo = Arc::new(EchoSuppressor::new(DEFAULT_ECHO_TTL));
        let coordinator = Arc::new(SyncCoordinator::new(
            store.clone(),
            chat.clone(),
            echo,
            CoordinatorConfig::default(),
        ));

        let channel = chat.create_channel("api", None).await.expect("channel");
        let project = store
            .create_project(NewProject {
                channel_id: channel.id.clone(),
                path: dir.path().to_string_lossy().into_owned(),
                name: "api".to_string(),
                model: Some("gpt-5-codex".to_string()),
                approval_policy: Some("never".to_string()),
            })
            .expect("project");
        let info = chat
            .create_thread(&channel.id, "question")
            .await
            .expect("thread");
        let thread = store
            .create_thread(&info.id, project.id, "question", session_id)
            .expect("thread row");

        Fixture {
            _dir: dir,
            store,
            chat,
            coordinator,
            project,
            thread,
        }
    }

    fn relay(fx: &Fixture, runner: Arc<FakeRunner>) -> Arc<InteractiveRelay> {
        Arc::new(InteractiveRelay::new(
            fx.coordinator.clone(),
            fx.store.clone(),
            fx.chat.clone(),
            fx.coordinator.echo().clone(),
            runner,
            RelayConfig::default(),
        ))
    }

    #[tokio::test]
    async fn turn_links_session_and_streams_replies() {
        let fx = fixture(None).await;
        let runner = Arc::new(FakeRunner::new(vec![
            TurnEvent::SessionStarted {
                session_id: "s-new".to_string(),
            },
            TurnEvent::AgentMessage {
                text: "Looking now.".to_string(),
            },
            TurnEvent::Completed,
        ]));
        let relay = relay(&fx, runner.clone());

        let outcome = relay
            .handle_message(&fx.thread.chat_thread_id, "m1", "why is CI red?")
            .await
            .expect("relay");
        assert_eq!(outcome, DeliveryOutcome::Completed);

        let request = runner.requests().remove(0);
        assert_eq!(request.session_id, None);
        assert_eq!(request.prompt, "why is CI red?");
        assert_eq!(request.model.as_deref(), Some("gpt-5-codex"));
        assert_eq!(request.approval_policy.as_deref(), Some("never"));

        let thread = fx
            .store
            .thread_by_chat_id(&fx.thread.chat_thread_id)
            .expect("lookup")
            .expect("row");
        assert_eq!(thread.session_id.as_deref(), Some("s-new"));
        assert_eq!(thread.status, ThreadStatus::Completed);
        assert_eq!(
            fx.chat.messages_in(&fx.thread.chat_thread_id),
            vec!["Looking now."]
        );

        let directions: Vec<_> = fx
            .store
            .messages_for_thread(thread.id)
            .expect("messages")
            .into_iter()
            .map(|m| m.direction)
            .collect();
        assert_eq!(
            directions,
            vec![MessageDirection::Inbound, MessageDirection::Outbound]
        );
    }

    #[tokio::test]
    async fn tail_thread_for_a_relay_session_gives_way_to_the_user_thread() {
        let fx = fixture(None).await;
        // The tailer picks up the fresh rollout before the turn reports its id.
        let outcome = fx
            .coordinator
            .handle_batch(TailBatch {
                path: fx._dir.path().join("rollout-s-new.jsonl"),
                lines: vec![
                    serde_json::json!({"type":"session_meta","payload":{"id":"s-new","cwd":fx.project.path}}).to_string(),
                    serde_json::json!({"type":"event_msg","payload":{"type":"user_message","message":"why is CI red?"}}).to_string(),
                ],
            })
            .await;
        if let BatchOutcome::Buffered { ensure } = outcome {
            ensure.await.expect("ensure");
        }
        let auto = fx
            .store
            .thread_by_session("s-new")
            .expect("lookup")
            .expect("tail thread");
        assert_ne!(auto.id, fx.thread.id);
        assert_eq!(fx.chat.thread_count(), 2);

        let runner = Arc::new(FakeRunner::new(vec![
            TurnEvent::SessionStarted {
                session_id: "s-new".to_string(),
            },
            TurnEvent::AgentMessage {
                text: "Looking now.".to_string(),
            },
            TurnEvent::Completed,
        ]));
        let relay = relay(&fx, runner.clone());
        relay
            .handle_message(&fx.thread.chat_thread_id, "m1", "why is CI red?")
            .await
            .expect("relay");

        assert_eq!(fx.chat.thread_count(), 1);
        assert_eq!(fx.chat.deleted_threads(), vec![auto.chat_thread_id.clone()]);
        let owner = fx
            .store
            .thread_by_session("s-new")
            .expect("lookup")
            .expect("owner");
        assert_eq!(owner.chat_thread_id, fx.thread.chat_thread_id);
        assert!(fx.store.thread_by_chat_id(&auto.chat_thread_id).expect("lookup").is_none());

        relay
            .handle_message(&fx.thread.chat_thread_id, "m2", "and now?")
            .await
            .expect("relay");
        assert_eq!(runner.requests()[1].session_id.as_deref(), Some("s-new"));
        assert_eq!(fx.chat.thread_count(), 1);
    }

    #[tokio::test]
    async fn linked_thread_resumes_and_tail_replay_is_suppressed() {
        let fx = fixture(Some("s1")).await;
        let runner = Arc::new(FakeRunner::new(vec![
            TurnEvent::AgentMessage {
                text: "Fixed.".to_string(),
            },
            TurnEvent::Completed,
        ]));
        let relay = relay(&fx, runner.clone());
        relay
            .handle_message(&fx.thread.chat_thread_id, "m1", "fix it")
            .await
            .expect("relay");
        assert_eq!(runner.requests()[0].session_id.as_deref(), Some("s1"));

        let replay = |payload: serde_json::Value| payload.to_string();
        let outcome = fx
            .coordinator
            .handle_batch(TailBatch {
                path: fx._dir.path().join("rollout-s1.jsonl"),
                lines: vec![
                    replay(serde_json::json!({"type":"session_meta","payload":{"id":"s1","cwd":fx.project.path}})),
                    replay(serde_json::json!({"type":"event_msg","payload":{"type":"user_message","message":"fix it"}})),
                    replay(serde_json::json!({"type":"event_msg","payload":{"type":"agent_message","message":"Fixed."}})),
                ],
            })
            .await;
        assert!(matches!(outcome, BatchOutcome::Delivered(0)));
        assert_eq!(fx.chat.messages_in(&fx.thread.chat_thread_id), vec!["Fixed."]);
    }

    #[tokio::test]
    async fn second_message_while_running_is_refused() {
        let fx = fixture(Some("s1")).await;
        let runner = Arc::new(FakeRunner::held(vec![
            TurnEvent::AgentMessage {
                text: "On it.".to_string(),
            },
            TurnEvent::Completed,
        ]));
        let relay = relay(&fx, runner.clone());

        let first = {
            let relay = relay.clone();
            let thread_id = fx.thread.chat_thread_id.clone();
            tokio::spawn(async move { relay.handle_message(&thread_id, "m1", "first").await })
        };
        while runner.requests().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(relay.is_busy(&fx.thread.chat_thread_id));

        let second = relay
            .handle_message(&fx.thread.chat_thread_id, "m2", "second")
            .await
            .expect("relay");
        assert_eq!(second, DeliveryOutcome::Busy);

        runner.release();
        let first = first.await.expect("join").expect("relay");
        assert_eq!(first, DeliveryOutcome::Completed);
        assert!(!relay.is_busy(&fx.thread.chat_thread_id));
        assert_eq!(runner.requests().len(), 1);

        let messages = fx.chat.messages_in(&fx.thread.chat_thread_id);
        assert!(messages.contains(&BUSY_NOTICE.to_string()));
        assert!(messages.contains(&"On it.".to_string()));
    }

    #[tokio::test]
    async fn failed_turn_posts_notice_and_marks_error() {
        let fx = fixture(Some("s1")).await;
        let runner = Arc::new(FakeRunner::new(vec![TurnEvent::Failed {
            message: "model overloaded".to_string(),
        }]));
        let relay = relay(&fx, runner);

        let outcome = relay
            .handle_message(&fx.thread.chat_thread_id, "m1", "go")
            .await
            .expect("relay");
        assert_eq!(outcome, DeliveryOutcome::Failed);
        assert_eq!(
            fx.chat.messages_in(&fx.thread.chat_thread_id),
            vec![":warning: turn failed: model overloaded"]
        );
        let thread = fx
            .store
            .thread_by_chat_id(&fx.thread.chat_thread_id)
            .expect("lookup")
            .expect("row");
        assert_eq!(thread.status, ThreadStatus::Error);
    }

    #[tokio::test]
    async fn unmapped_threads_and_blank_messages_are_ignored() {
        let fx = fixture(None).await;
        let runner = Arc::new(FakeRunner::new(vec![TurnEvent::Completed]));
        let relay = relay(&fx, runner.clone());

        assert_eq!(
            relay.handle_message("nope", "m1", "hi").await.expect("relay"),
            DeliveryOutcome::Ignored
        );
        assert_eq!(
            relay
                .handle_message(&fx.thread.chat_thread_id, "m2", "   ")
                .await
                .expect("relay"),
            DeliveryOutcome::Ignored
        );
        assert!(runner.requests().is_empty());
    }
}
