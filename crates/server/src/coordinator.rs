//! Sync coordinator: tail batches and chat events -> mappings and deliveries.
//!
//! Two independent defenses keep one channel per project and one thread per
//! session: side-effecting work runs under a per-key FIFO lock (canonical
//! project path, then session id), and the store's create calls return the
//! surviving row so a loser can undo its own chat-side creation.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use codexcord_connector_core::{ChatError, ChatEvent, ChatPlatform};
use codexcord_protocol::{
    decode_line, MessageDirection, NewProject, ProjectRecord, RolloutRecord, SessionMeta,
    ThreadRecord, ThreadStatus,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::canonical::{canonicalize_project_path, project_display_name};
use crate::echo::{EchoKind, EchoSuppressor};
use crate::formatter::{interpret, FormatOptions, LineEffect};
use crate::keyed::KeyedSerializer;
use crate::session_naming::{fallback_session_name, name_from_rollout_lines};
use crate::store::{MappingStore, StoreError};
use crate::tailer::{session_meta_of, TailBatch};

pub const DEFAULT_BUFFER_CAP: usize = 2000;

/// Thread recreations `ensure_session` attempts when a flush finds the new
/// thread already gone.
const MAX_REMAP_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("chat platform: {0}")]
    Chat(#[from] ChatError),
}

#[derive(Debug, Clone, Default)]
pub struct CoordinatorConfig {
    pub buffer_cap: usize,
    pub format: FormatOptions,
    pub default_model: Option<String>,
    pub default_approval_policy: Option<String>,
}

/// Lines waiting for their session's thread to exist. Oldest lines are
/// dropped beyond the cap.
#[derive(Debug, Default)]
pub struct PendingBuffer {
    lines: VecDeque<String>,
    dropped: usize,
}

impl PendingBuffer {
    pub fn extend(&mut self, lines: impl IntoIterator<Item = String>, cap: usize) {
        for line in lines {
            if self.lines.len() >= cap.max(1) {
                self.lines.pop_front();
                self.dropped += 1;
            }
            self.lines.push_back(line);
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }

    fn take(&mut self) -> Vec<String> {
        self.lines.drain(..).collect()
    }
}

#[derive(Debug)]
pub enum BatchOutcome {
    Delivered(usize),
    /// Held until the session is mapped; `ensure` is the mapping attempt.
    Buffered { ensure: JoinHandle<()> },
    /// No `session_meta` could be found for the file
    Unattributed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnsureOutcome {
    Mapped { project_id: i64, thread_id: i64 },
    ProjectDirMissing,
}

pub struct SyncCoordinator {
    store: Arc<MappingStore>,
    chat: Arc<dyn ChatPlatform>,
    echo: Arc<EchoSuppressor>,
    project_locks: KeyedSerializer,
    session_locks: KeyedSerializer,
    pending: Mutex<HashMap<String, PendingBuffer>>,
    /// Metadata of sessions with buffered lines, for maintenance retries
    metas: Mutex<HashMap<String, SessionMeta>>,
    config: CoordinatorConfig,
}

impl SyncCoordinator {
    pub fn new(
        store: Arc<MappingStore>,
        chat: Arc<dyn ChatPlatform>,
        echo: Arc<EchoSuppressor>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            chat,
            echo,
            project_locks: KeyedSerializer::new(),
            session_locks: KeyedSerializer::new(),
            pending: Mutex::new(HashMap::new()),
            metas: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn echo(&self) -> &Arc<EchoSuppressor> {
        &self.echo
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingBuffer>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn pending_len(&self, session_id: &str) -> usize {
        self.pending().get(session_id).map_or(0, PendingBuffer::len)
    }

    fn metas(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionMeta>> {
        match self.metas.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Sessions with buffered lines and cached metadata.
    pub fn tracked_sessions(&self) -> usize {
        self.metas().len()
    }

    /// Session a batch belongs to: its own `session_meta` line, else the
    /// first line of the file on disk.
    fn resolve_session(&self, batch: &TailBatch) -> Option<SessionMeta> {
        batch
            .lines
            .iter()
            .find_map(|line| match decode_line(line)? {
                RolloutRecord::SessionMeta(meta) => Some(meta),
                _ => None,
            })
            .or_else(|| session_meta_of(&batch.path))
    }

    fn meta_for(&self, session_id: &str) -> Option<SessionMeta> {
        self.metas().get(session_id).cloned()
    }

    pub async fn handle_batch(self: &Arc<Self>, batch: TailBatch) -> BatchOutcome {
        let Some(meta) = self.resolve_session(&batch) else {
            debug!(
                component = "coordinator",
                event = "coordinator.batch_unattributed",
                path = %batch.path.display(),
                lines = batch.lines.len(),
                "No session_meta for rollout file yet"
            );
            return BatchOutcome::Unattributed;
        };

        let guard = self.session_locks.lock(&meta.id).await;
        let thread = match self.store.thread_by_session(&meta.id) {
            Ok(thread) => thread,
            Err(err) => {
                warn!(
                    component = "coordinator",
                    event = "coordinator.lookup_failed",
                    session_id = %meta.id,
                    error = %err,
                    "Thread lookup failed, buffering"
                );
                None
            }
        };

        if let Some(thread) = thread {
            let mut lines = self
                .pending()
                .remove(&meta.id)
                .map(|mut buffer| buffer.take())
                .unwrap_or_default();
            lines.extend(batch.lines);
            let (delivered, gone) = self.deliver(&meta.id, &thread, lines).await;
            if !gone {
                self.metas().remove(&meta.id);
                return BatchOutcome::Delivered(delivered);
            }
            self.metas().insert(meta.id.clone(), meta.clone());
            drop(guard);
            return BatchOutcome::Buffered {
                ensure: self.spawn_ensure(meta),
            };
        }

        self.metas().insert(meta.id.clone(), meta.clone());
        self.buffer(&meta.id, batch.lines);
        drop(guard);
        BatchOutcome::Buffered {
            ensure: self.spawn_ensure(meta),
        }
    }

    fn buffer(&self, session_id: &str, lines: Vec<String>) {
        let cap = if self.config.buffer_cap == 0 {
            DEFAULT_BUFFER_CAP
        } else {
            self.config.buffer_cap
        };
        let mut pending = self.pending();
        let buffer = pending.entry(session_id.to_string()).or_default();
        let dropped_before = buffer.dropped();
        buffer.extend(lines, cap);
        if buffer.dropped() > dropped_before {
            warn!(
                component = "coordinator",
                event = "coordinator.buffer_overflow",
                session_id = %session_id,
                dropped = buffer.dropped() - dropped_before,
                cap = cap,
                "Pending buffer full, dropped oldest lines"
            );
        }
    }

    fn spawn_ensure(self: &Arc<Self>, meta: SessionMeta) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let session_id = meta.id.clone();
            if let Err(err) = this.ensure_session(meta).await {
                warn!(
                    component = "coordinator",
                    event = "coordinator.ensure_failed",
                    session_id = %session_id,
                    error = %err,
                    "Session mapping attempt failed, will retry on next update"
                );
            }
        })
    }

    /// Make sure the session has a project channel and a thread, then flush
    /// anything buffered for it.
    pub async fn ensure_session(&self, meta: SessionMeta) -> Result<EnsureOutcome, SyncError> {
        let canonical = canonicalize_project_path(&meta.cwd);
        if !Path::new(&canonical).is_dir() {
            debug!(
                component = "coordinator",
                event = "coordinator.project_dir_missing",
                session_id = %meta.id,
                path = %canonical,
                "Project directory is gone, skipping"
            );
            return Ok(EnsureOutcome::ProjectDirMissing);
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let project_guard = self.project_locks.lock(&canonical).await;
            let project = match self.live_project(&canonical).await? {
                Some(project) => project,
                None => self.create_project_channel(&canonical).await?,
            };
            let thread = match self.store.thread_by_session(&meta.id)? {
                Some(thread) => thread,
                None => self.create_session_thread(&project, &meta).await?,
            };
            drop(project_guard);

            let (_, gone) = self.flush_session(&meta.id).await;
            if !gone || attempt >= MAX_REMAP_ATTEMPTS {
                return Ok(EnsureOutcome::Mapped {
                    project_id: project.id,
                    thread_id: thread.id,
                });
            }
            debug!(
                component = "coordinator",
                event = "coordinator.remap",
                session_id = %meta.id,
                attempt = attempt,
                "Thread vanished during flush, mapping again"
            );
        }
    }

    /// The stored project for `canonical`, or `None` when there is none or its
    /// channel is authoritatively gone (the stale row is removed). Any other
    /// fetch failure aborts.
    async fn live_project(&self, canonical: &str) -> Result<Option<ProjectRecord>, SyncError> {
        let Some(project) = self.store.project_by_path(canonical)? else {
            return Ok(None);
        };
        match self.chat.fetch_channel(&project.channel_id).await {
            Ok(_) => Ok(Some(project)),
            Err(err) if err.is_gone() => {
                warn!(
                    component = "coordinator",
                    event = "coordinator.stale_project",
                    project_id = project.id,
                    channel_id = %project.channel_id,
                    path = %canonical,
                    error = %err,
                    "Project channel is gone, dropping mapping"
                );
                self.store.delete_project(project.id)?;
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn create_project_channel(&self, canonical: &str) -> Result<ProjectRecord, SyncError> {
        let name = project_display_name(canonical);
        let channel = self.chat.create_channel(&name, Some(canonical)).await?;

        let created = self.store.create_project(NewProject {
            channel_id: channel.id.clone(),
            path: canonical.to_string(),
            name,
            model: self.config.default_model.clone(),
            approval_policy: self.config.default_approval_policy.clone(),
        });
        let project = match created {
            Ok(project) => project,
            Err(err) => {
                self.discard_channel(&channel.id).await;
                return Err(err.into());
            }
        };

        if project.channel_id != channel.id {
            info!(
                component = "coordinator",
                event = "coordinator.project_race_lost",
                path = %canonical,
                winner_channel_id = %project.channel_id,
                redundant_channel_id = %channel.id,
                "Another creator mapped this project first"
            );
            self.discard_channel(&channel.id).await;
            self.chat.fetch_channel(&project.channel_id).await?;
        } else {
            info!(
                component = "coordinator",
                event = "coordinator.project_created",
                project_id = project.id,
                channel_id = %project.channel_id,
                path = %canonical,
                "Created project channel"
            );
        }
        Ok(project)
    }

    async fn discard_channel(&self, channel_id: &str) {
        if let Err(err) = self.chat.delete_channel(channel_id).await {
            warn!(
                component = "coordinator",
                event = "coordinator.channel_cleanup_failed",
                channel_id = %channel_id,
                error = %err,
                "Failed deleting redundant channel"
            );
        }
    }

    async fn discard_thread(&self, thread_id: &str) {
        match self.chat.delete_thread(thread_id).await {
            Ok(()) => {}
            Err(err) if err.is_gone() => {}
            Err(err) => {
                warn!(
                    component = "coordinator",
                    event = "coordinator.thread_cleanup_failed",
                    thread_id = %thread_id,
                    error = %err,
                    "Failed deleting redundant thread"
                );
            }
        }
    }

    /// Thread name from the first real prompt among the buffered lines.
    fn buffered_name(&self, session_id: &str) -> Option<String> {
        let pending = self.pending();
        let buffer = pending.get(session_id)?;
        name_from_rollout_lines(buffer.lines.iter().map(String::as_str))
    }

    async fn create_session_thread(
        &self,
        project: &ProjectRecord,
        meta: &SessionMeta,
    ) -> Result<ThreadRecord, SyncError> {
        let name = self
            .buffered_name(&meta.id)
            .unwrap_or_else(|| fallback_session_name(&meta.id));

        let info = match self.chat.create_thread(&project.channel_id, &name).await {
            Ok(info) => info,
            Err(err) => {
                if err.is_gone() {
                    // Channel vanished after the liveness check.
                    self.store.delete_project(project.id)?;
                }
                return Err(err.into());
            }
        };

        let thread = self
            .store
            .create_thread(&info.id, project.id, &name, Some(&meta.id))?;
        if thread.chat_thread_id != info.id {
            info!(
                component = "coordinator",
                event = "coordinator.thread_race_lost",
                session_id = %meta.id,
                winner_thread_id = %thread.chat_thread_id,
                redundant_thread_id = %info.id,
                "Session already mapped to another thread"
            );
            self.discard_thread(&info.id).await;
            self.store.delete_thread_by_chat_id(&info.id)?;
        } else {
            info!(
                component = "coordinator",
                event = "coordinator.thread_created",
                session_id = %meta.id,
                thread_id = %thread.chat_thread_id,
                project_id = project.id,
                "Created session thread"
            );
        }
        Ok(thread)
    }

    /// Deliver whatever is buffered for `session_id` if its thread exists.
    ///
    /// Returns the delivered count and whether the thread turned out to be
    /// gone, in which case the rest is buffered again for a new mapping.
    pub async fn flush_session(&self, session_id: &str) -> (usize, bool) {
        let _guard = self.session_locks.lock(session_id).await;
        let Ok(Some(thread)) = self.store.thread_by_session(session_id) else {
            return (0, false);
        };
        let lines = self
            .pending()
            .remove(session_id)
            .map(|mut buffer| buffer.take())
            .unwrap_or_default();
        let (delivered, gone) = if lines.is_empty() {
            (0, false)
        } else {
            self.deliver(session_id, &thread, lines).await
        };
        if !gone {
            self.metas().remove(session_id);
        }
        (delivered, gone)
    }

    /// Post lines to the thread in order. Caller holds the session lock.
    ///
    /// Returns the delivered count and whether the chat thread turned out to
    /// be gone, in which case the mapping is dropped and the undelivered lines
    /// go back to the buffer.
    async fn deliver(
        &self,
        session_id: &str,
        thread: &ThreadRecord,
        lines: Vec<String>,
    ) -> (usize, bool) {
        let mut delivered = 0usize;
        let mut lines = lines.into_iter();

        while let Some(line) = lines.next() {
            let Some(record) = decode_line(&line) else {
                continue;
            };
            match interpret(&record, self.config.format) {
                LineEffect::Skip => {}
                LineEffect::ModelSeen(model) => {
                    if let Err(err) = self.store.set_project_model(thread.project_id, &model) {
                        warn!(
                            component = "coordinator",
                            event = "coordinator.model_update_failed",
                            project_id = thread.project_id,
                            error = %err,
                            "Failed recording project model"
                        );
                    }
                }
                LineEffect::TaskComplete => {
                    self.set_status(thread, ThreadStatus::Completed);
                }
                LineEffect::Deliver(delivery) => {
                    if self
                        .echo
                        .is_echo(&thread.chat_thread_id, delivery.kind, &delivery.text)
                    {
                        debug!(
                            component = "coordinator",
                            event = "coordinator.echo_suppressed",
                            thread_id = %thread.chat_thread_id,
                            event_type = delivery.event_type,
                            "Suppressed duplicate delivery"
                        );
                        continue;
                    }

                    match self
                        .chat
                        .send_message(&thread.chat_thread_id, &delivery.rendered)
                        .await
                    {
                        Ok(sent) => {
                            self.echo
                                .remember(&thread.chat_thread_id, delivery.kind, &delivery.text);
                            let direction = match delivery.kind {
                                EchoKind::User => MessageDirection::Inbound,
                                EchoKind::Assistant => MessageDirection::Outbound,
                            };
                            if let Err(err) = self.store.record_message(
                                thread.id,
                                direction,
                                Some(&sent.id),
                                &delivery.text,
                                delivery.event_type,
                            ) {
                                warn!(
                                    component = "coordinator",
                                    event = "coordinator.record_failed",
                                    thread_id = thread.id,
                                    error = %err,
                                    "Failed recording delivered message"
                                );
                            }
                            if delivery.kind == EchoKind::User {
                                self.set_status(thread, ThreadStatus::Active);
                            }
                            delivered += 1;
                        }
                        Err(err) if err.is_gone() => {
                            warn!(
                                component = "coordinator",
                                event = "coordinator.thread_gone",
                                session_id = %session_id,
                                thread_id = %thread.chat_thread_id,
                                "Chat thread is gone, remapping session"
                            );
                            if let Err(err) = self.store.delete_thread_by_chat_id(&thread.chat_thread_id) {
                                warn!(
                                    component = "coordinator",
                                    event = "coordinator.thread_cleanup_failed",
                                    thread_id = %thread.chat_thread_id,
                                    error = %err,
                                    "Failed dropping stale thread row"
                                );
                            }
                            let rest: Vec<String> = std::iter::once(line).chain(lines).collect();
                            self.buffer(session_id, rest);
                            return (delivered, true);
                        }
                        Err(err) => {
                            warn!(
                                component = "coordinator",
                                event = "coordinator.send_failed",
                                thread_id = %thread.chat_thread_id,
                                event_type = delivery.event_type,
                                error = %err,
                                "Failed delivering message"
                            );
                        }
                    }
                }
            }
        }
        (delivered, false)
    }

    fn set_status(&self, thread: &ThreadRecord, status: ThreadStatus) {
        if let Err(err) = self.store.update_status(thread.id, status) {
            warn!(
                component = "coordinator",
                event = "coordinator.status_update_failed",
                thread_id = thread.id,
                status = status.as_str(),
                error = %err,
                "Failed updating thread status"
            );
        }
    }

    /// Apply a chat-side notification. `MessageCreated` belongs to the relay
    /// and is ignored here.
    pub async fn handle_chat_event(self: &Arc<Self>, event: ChatEvent) -> Result<(), SyncError> {
        match event {
            ChatEvent::ThreadCreated {
                thread_id,
                channel_id,
                name,
            } => {
                let Some(project) = self.store.project_by_channel(&channel_id)? else {
                    return Ok(());
                };
                let thread = self
                    .store
                    .create_thread(&thread_id, project.id, &name, None)?;
                debug!(
                    component = "coordinator",
                    event = "coordinator.chat_thread_seen",
                    thread_id = %thread_id,
                    linked = thread.session_id.is_some(),
                    "Chat-side thread recorded"
                );
            }
            ChatEvent::ThreadDeleted { thread_id } => {
                let Some(thread) = self.store.thread_by_chat_id(&thread_id)? else {
                    return Ok(());
                };
                self.store.delete_thread_by_chat_id(&thread_id)?;
                info!(
                    component = "coordinator",
                    event = "coordinator.thread_deleted",
                    thread_id = %thread_id,
                    session_id = ?thread.session_id,
                    "Chat thread deleted, mapping dropped"
                );
            }
            ChatEvent::ChannelDeleted { channel_id } => {
                let Some(project) = self.store.project_by_channel(&channel_id)? else {
                    return Ok(());
                };
                self.store.delete_project(project.id)?;
                info!(
                    component = "coordinator",
                    event = "coordinator.project_deleted",
                    channel_id = %channel_id,
                    path = %project.path,
                    "Project channel deleted, mapping dropped"
                );
            }
            ChatEvent::MessageCreated { .. } => {}
        }
        Ok(())
    }

    /// Link a chat-created thread to the session a turn just started.
    ///
    /// Runs under the project key so it cannot interleave with
    /// `ensure_session` creating a thread for the same session. When the tail
    /// saw the new rollout first and opened a thread of its own, that thread
    /// is deleted and the session moves to `thread`; its lines were the same
    /// prompt and replies the relay posts. Returns false only when the session
    /// belongs to a thread in another project.
    pub async fn link_session(
        &self,
        thread: &ThreadRecord,
        project: &ProjectRecord,
        session_id: &str,
    ) -> Result<bool, SyncError> {
        let project_guard = self.project_locks.lock(&project.path).await;
        let session_guard = self.session_locks.lock(session_id).await;
        let replaced = match self.store.thread_by_session(session_id)? {
            Some(existing) if existing.id == thread.id => return Ok(true),
            Some(existing) if existing.project_id != thread.project_id => return Ok(false),
            Some(existing) => {
                self.store.delete_thread_by_chat_id(&existing.chat_thread_id)?;
                self.discard_thread(&existing.chat_thread_id).await;
                Some(existing.chat_thread_id)
            }
            None => None,
        };
        self.store.update_session_id(thread.id, session_id)?;
        drop(session_guard);
        drop(project_guard);

        info!(
            component = "coordinator",
            event = "coordinator.session_linked",
            thread_id = %thread.chat_thread_id,
            session_id = %session_id,
            replaced_thread_id = ?replaced,
            "Linked chat thread to session"
        );
        self.flush_session(session_id).await;
        Ok(true)
    }

    /// Re-attempt mapping for every session that still has buffered lines.
    pub fn retry_pending(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let ids: Vec<String> = self
            .pending()
            .iter()
            .filter(|(_, buffer)| !buffer.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| self.meta_for(&id))
            .map(|meta| self.spawn_ensure(meta))
            .collect()
    }
}
