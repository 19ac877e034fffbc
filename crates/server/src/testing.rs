//! In-memory chat platform and turn runner for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use codexcord_connector_core::{
    ChannelInfo, ChatError, ChatPlatform, ConnectorError, SentMessage, ThreadInfo, TurnEvent,
    TurnRequest, TurnRunner,
};
use tokio::sync::{mpsc, Notify};

#[derive(Default)]
struct FakeChatState {
    channels: HashMap<String, ChannelInfo>,
    threads: HashMap<String, ThreadInfo>,
    messages: Vec<(String, String)>,
    channels_created: usize,
    threads_created: usize,
    deleted_channels: Vec<String>,
    deleted_threads: Vec<String>,
    fetch_errors: HashMap<String, ChatError>,
}

/// Chat platform backed by maps. `create_*` calls sleep for `delay` so
/// concurrent callers really interleave.
pub struct FakeChat {
    state: Mutex<FakeChatState>,
    next_id: AtomicU64,
    delay: Duration,
}

impl FakeChat {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            state: Mutex::new(FakeChatState::default()),
            next_id: AtomicU64::new(1000),
            delay,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeChatState> {
        self.state.lock().expect("fake chat state")
    }

    fn next_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::SeqCst).to_string()
    }

    /// Seed a channel as if it had been created earlier.
    pub fn add_channel(&self, id: &str, name: &str) {
        self.state().channels.insert(
            id.to_string(),
            ChannelInfo {
                id: id.to_string(),
                name: name.to_string(),
            },
        );
    }

    /// Delete a channel out-of-band (an admin removed it in the client).
    pub fn remove_channel(&self, id: &str) {
        let mut state = self.state();
        state.channels.remove(id);
        state.threads.retain(|_, t| t.channel_id != id);
    }

    pub fn remove_thread(&self, id: &str) {
        self.state().threads.remove(id);
    }

    pub fn fail_fetch(&self, channel_id: &str, error: ChatError) {
        self.state()
            .fetch_errors
            .insert(channel_id.to_string(), error);
    }

    pub fn clear_fetch_errors(&self) {
        self.state().fetch_errors.clear();
    }

    pub fn channel_count(&self) -> usize {
        self.state().channels.len()
    }

    pub fn thread_count(&self) -> usize {
        self.state().threads.len()
    }

    pub fn channels_created(&self) -> usize {
        self.state().channels_created
    }

    pub fn threads_created(&self) -> usize {
        self.state().threads_created
    }

    pub fn deleted_channels(&self) -> Vec<String> {
        self.state().deleted_channels.clone()
    }

    pub fn deleted_threads(&self) -> Vec<String> {
        self.state().deleted_threads.clone()
    }

    pub fn messages_in(&self, thread_id: &str) -> Vec<String> {
        self.state()
            .messages
            .iter()
            .filter(|(t, _)| t == thread_id)
            .map(|(_, content)| content.clone())
            .collect()
    }
}

#[async_trait]
impl ChatPlatform for FakeChat {
    async fn create_channel(
        &self,
        name: &str,
        _topic: Option<&str>,
    ) -> Result<ChannelInfo, ChatError> {
        tokio::time::sleep(self.delay).await;
        let info = ChannelInfo {
            id: self.next_id(),
            name: name.to_string(),
        };
        let mut state = self.state();
        state.channels.insert(info.id.clone(), info.clone());
        state.channels_created += 1;
        Ok(info)
    }

    async fn fetch_channel(&self, channel_id: &str) -> Result<ChannelInfo, ChatError> {
        let state = self.state();
        if let Some(err) = state.fetch_errors.get(channel_id) {
            return Err(err.clone());
        }
        state
            .channels
            .get(channel_id)
            .cloned()
            .ok_or_else(|| ChatError::NotFound(format!("channel {channel_id}")))
    }

    async fn delete_channel(&self, channel_id: &str) -> Result<(), ChatError> {
        let mut state = self.state();
        if state.channels.remove(channel_id).is_none() {
            return Err(ChatError::NotFound(format!("channel {channel_id}")));
        }
        state.threads.retain(|_, t| t.channel_id != channel_id);
        state.deleted_channels.push(channel_id.to_string());
        Ok(())
    }

    async fn create_thread(&self, channel_id: &str, name: &str) -> Result<ThreadInfo, ChatError> {
        tokio::time::sleep(self.delay).await;
        let mut state = self.state();
        if !state.channels.contains_key(channel_id) {
            return Err(ChatError::NotFound(format!("channel {channel_id}")));
        }
        let info = ThreadInfo {
            id: self.next_id(),
            channel_id: channel_id.to_string(),
            name: name.to_string(),
        };
        state.threads.insert(info.id.clone(), info.clone());
        state.threads_created += 1;
        Ok(info)
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<(), ChatError> {
        let mut state = self.state();
        if state.threads.remove(thread_id).is_none() {
            return Err(ChatError::NotFound(format!("thread {thread_id}")));
        }
        state.deleted_threads.push(thread_id.to_string());
        Ok(())
    }

    async fn send_message(
        &self,
        thread_id: &str,
        content: &str,
    ) -> Result<SentMessage, ChatError> {
        let id = self.next_id();
        let mut state = self.state();
        if !state.threads.contains_key(thread_id) {
            return Err(ChatError::NotFound(format!("thread {thread_id}")));
        }
        state
            .messages
            .push((thread_id.to_string(), content.to_string()));
        Ok(SentMessage { id })
    }
}

/// Turn runner that replays a fixed script. With `hold`, the final event is
/// sent only after `release` is called.
pub struct FakeRunner {
    script: Vec<TurnEvent>,
    requests: Mutex<Vec<TurnRequest>>,
    hold: Option<Arc<Notify>>,
}

impl FakeRunner {
    pub fn new(script: Vec<TurnEvent>) -> Self {
        Self {
            script,
            requests: Mutex::new(Vec::new()),
            hold: None,
        }
    }

    pub fn held(script: Vec<TurnEvent>) -> Self {
        Self {
            hold: Some(Arc::new(Notify::new())),
            ..Self::new(script)
        }
    }

    pub fn release(&self) {
        if let Some(hold) = &self.hold {
            hold.notify_one();
        }
    }

    pub fn requests(&self) -> Vec<TurnRequest> {
        self.requests.lock().expect("requests").clone()
    }
}

#[async_trait]
impl TurnRunner for FakeRunner {
    async fn run_turn(
        &self,
        request: TurnRequest,
        events: mpsc::Sender<TurnEvent>,
    ) -> Result<(), ConnectorError> {
        self.requests.lock().expect("requests").push(request);
        let Some((last, body)) = self.script.split_last() else {
            return Ok(());
        };
        for event in body {
            events
                .send(event.clone())
                .await
                .map_err(|_| ConnectorError::ChannelClosed)?;
        }
        if let Some(hold) = &self.hold {
            hold.notified().await;
        }
        events
            .send(last.clone())
            .await
            .map_err(|_| ConnectorError::ChannelClosed)
    }
}
