//! Rollout file tailer.
//!
//! One actor owns every per-file cursor. Filesystem notifications, debounce
//! timers and follow-up polls all arrive as `TailerMessage`s on one channel,
//! so cursor state is only ever touched from the actor loop. Complete lines
//! leave as `TailBatch`es in file order.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use codexcord_protocol::{decode_line, is_complete_record, RolloutRecord, SessionMeta};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(1500);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_POLL_WINDOW: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Debug, Clone, Copy)]
pub struct TailerConfig {
    pub debounce: Duration,
    pub poll_interval: Duration,
    /// Polling stops after this long without new bytes
    pub poll_window: Duration,
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_window: DEFAULT_POLL_WINDOW,
        }
    }
}

/// Complete lines read from one file, in file order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailBatch {
    pub path: PathBuf,
    pub lines: Vec<String>,
}

/// Read position and line reassembly state for one file.
#[derive(Debug, Clone, Default)]
pub struct FileCursor {
    pub offset: u64,
    partial: Vec<u8>,
    seen: bool,
    last_activity: Option<Instant>,
}

impl FileCursor {
    pub fn is_seen(&self) -> bool {
        self.seen
    }

    fn reset(&mut self) {
        self.offset = 0;
        self.partial.clear();
    }

    /// Append freshly read bytes and split out every complete line.
    ///
    /// The trailing fragment is held for the next read unless it already is a
    /// whole JSON object (writers sometimes omit the final newline). Bytes are
    /// buffered raw so a multi-byte character split across reads survives.
    pub fn ingest(&mut self, bytes: &[u8]) -> Vec<String> {
        self.partial.extend_from_slice(bytes);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(pos) = self.partial[start..].iter().position(|b| *b == b'\n') {
            let end = start + pos;
            push_line(&mut lines, &self.partial[start..end]);
            start = end + 1;
        }
        self.partial.drain(..start);

        if !self.partial.is_empty() {
            let fragment = String::from_utf8_lossy(&self.partial);
            if is_complete_record(&fragment) {
                lines.push(fragment.trim().to_string());
                self.partial.clear();
            }
        }
        lines
    }
}

fn push_line(lines: &mut Vec<String>, raw: &[u8]) {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim();
    if !line.is_empty() {
        lines.push(line.to_string());
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct TailRead {
    pub lines: Vec<String>,
    pub bytes_read: u64,
    pub truncated: bool,
}

/// Read `[cursor.offset, size)` of `path` and advance the cursor.
///
/// A file shorter than the cursor was truncated or rewritten; the cursor
/// restarts from zero and the whole file is re-read.
pub fn read_update(path: &Path, cursor: &mut FileCursor) -> io::Result<TailRead> {
    let size = fs::metadata(path)?.len();
    let mut read = TailRead::default();

    if size < cursor.offset {
        cursor.reset();
        read.truncated = true;
    }
    if size == cursor.offset {
        return Ok(read);
    }

    let chunk = read_file_range(path, cursor.offset, size)?;
    cursor.offset += chunk.len() as u64;
    read.bytes_read = chunk.len() as u64;
    read.lines = cursor.ingest(&chunk);
    Ok(read)
}

fn read_file_range(path: &Path, start: u64, end: u64) -> io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(start))?;
    let mut buf = Vec::with_capacity(end.saturating_sub(start) as usize);
    file.take(end.saturating_sub(start)).read_to_end(&mut buf)?;
    Ok(buf)
}

pub fn read_first_line(path: &Path) -> io::Result<Option<String>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };

    let mut reader = BufReader::new(file);
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

/// The `session_meta` first line, if the file has one yet.
pub fn session_meta_of(path: &Path) -> Option<SessionMeta> {
    let line = read_first_line(path).ok()??;
    match decode_line(&line)? {
        RolloutRecord::SessionMeta(meta) => Some(meta),
        _ => None,
    }
}

pub fn session_id_of(path: &Path) -> Option<String> {
    session_meta_of(path).map(|meta| meta.id)
}

pub fn collect_jsonl_files(root: &Path) -> Vec<PathBuf> {
    let mut result = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if is_jsonl_path(&path) {
                result.push(path);
            }
        }
    }

    result.sort();
    result
}

fn is_jsonl_path(path: &Path) -> bool {
    path.extension().and_then(|s| s.to_str()) == Some("jsonl")
}

fn matches_supported_event_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any
    )
}

pub enum TailerMessage {
    FsEvent(PathBuf),
    /// Debounce elapsed
    Process(PathBuf),
    Poll(PathBuf),
    MarkSeen(PathBuf),
    Stop,
}

/// Cheap sender side of the tailer actor
#[derive(Clone)]
pub struct TailerHandle {
    tx: mpsc::UnboundedSender<TailerMessage>,
}

impl TailerHandle {
    pub fn notify(&self, path: PathBuf) {
        let _ = self.tx.send(TailerMessage::FsEvent(path));
    }

    pub fn mark_seen(&self, path: PathBuf) {
        let _ = self.tx.send(TailerMessage::MarkSeen(path));
    }

    pub fn stop(&self) {
        let _ = self.tx.send(TailerMessage::Stop);
    }
}

pub struct LogTailer {
    config: TailerConfig,
    tx: mpsc::UnboundedSender<TailerMessage>,
    rx: mpsc::UnboundedReceiver<TailerMessage>,
    output: mpsc::UnboundedSender<TailBatch>,
    cursors: HashMap<PathBuf, FileCursor>,
    debounce_tasks: HashMap<PathBuf, JoinHandle<()>>,
    poll_tasks: HashMap<PathBuf, JoinHandle<()>>,
}

impl LogTailer {
    pub fn new(config: TailerConfig, output: mpsc::UnboundedSender<TailBatch>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            config,
            tx,
            rx,
            output,
            cursors: HashMap::new(),
            debounce_tasks: HashMap::new(),
            poll_tasks: HashMap::new(),
        }
    }

    pub fn handle(&self) -> TailerHandle {
        TailerHandle {
            tx: self.tx.clone(),
        }
    }

    /// Skip the backlog: the cursor starts at the file's current size.
    pub fn mark_seen(&mut self, path: &Path) {
        let size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        let cursor = self.cursors.entry(path.to_path_buf()).or_default();
        cursor.offset = size;
        cursor.partial.clear();
        cursor.seen = true;
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            if !self.dispatch(msg) {
                break;
            }
        }
        self.stop();
    }

    /// Returns false on `Stop`.
    fn dispatch(&mut self, msg: TailerMessage) -> bool {
        match msg {
            TailerMessage::FsEvent(path) => self.on_fs_event(path),
            TailerMessage::Process(path) => {
                self.debounce_tasks.remove(&path);
                self.process(&path);
            }
            TailerMessage::Poll(path) => self.on_poll(&path),
            TailerMessage::MarkSeen(path) => self.mark_seen(&path),
            TailerMessage::Stop => return false,
        }
        true
    }

    fn on_fs_event(&mut self, path: PathBuf) {
        if is_jsonl_path(&path) {
            let seen = self.cursors.get(&path).is_some_and(FileCursor::is_seen);
            if seen {
                self.schedule(path);
            } else {
                // First sighting: read from byte zero right away so lines
                // written before the create notification are not lost.
                self.cursors.entry(path.clone()).or_default().seen = true;
                self.process(&path);
            }
        } else if path.is_dir() {
            for child in collect_jsonl_files(&path) {
                self.on_fs_event(child);
            }
        }
    }

    fn schedule(&mut self, path: PathBuf) {
        if let Some(handle) = self.debounce_tasks.remove(&path) {
            handle.abort();
        }

        let tx = self.tx.clone();
        let delay = self.config.debounce;
        let key = path.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(TailerMessage::Process(path));
        });
        self.debounce_tasks.insert(key, handle);
    }

    fn process(&mut self, path: &Path) {
        if !path.exists() {
            self.forget(path);
            return;
        }

        let cursor = self.cursors.entry(path.to_path_buf()).or_default();
        cursor.seen = true;
        let read = match read_update(path, cursor) {
            Ok(read) => read,
            Err(err) => {
                warn!(
                    component = "tailer",
                    event = "tailer.read_failed",
                    path = %path.display(),
                    error = %err,
                    "Failed reading rollout file"
                );
                return;
            }
        };

        if read.truncated {
            info!(
                component = "tailer",
                event = "tailer.truncated",
                path = %path.display(),
                "Rollout file shrank, re-reading from start"
            );
        }
        if read.bytes_read > 0 {
            cursor.last_activity = Some(Instant::now());
            self.ensure_poll(path);
        }
        if read.lines.is_empty() {
            return;
        }

        debug!(
            component = "tailer",
            event = "tailer.lines_read",
            path = %path.display(),
            lines = read.lines.len(),
            "Read rollout lines"
        );
        let _ = self.output.send(TailBatch {
            path: path.to_path_buf(),
            lines: read.lines,
        });
    }

    fn ensure_poll(&mut self, path: &Path) {
        if self.poll_tasks.contains_key(path) {
            return;
        }
        let tx = self.tx.clone();
        let interval = self.config.poll_interval;
        let target = path.to_path_buf();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if tx.send(TailerMessage::Poll(target.clone())).is_err() {
                    break;
                }
            }
        });
        self.poll_tasks.insert(path.to_path_buf(), handle);
    }

    fn on_poll(&mut self, path: &Path) {
        // Ticks queued before the poll task was aborted.
        if !self.poll_tasks.contains_key(path) {
            return;
        }
        self.process(path);

        let idle = self
            .cursors
            .get(path)
            .and_then(|c| c.last_activity)
            .map(|at| at.elapsed() >= self.config.poll_window)
            .unwrap_or(true);
        if idle {
            if let Some(handle) = self.poll_tasks.remove(path) {
                handle.abort();
            }
            debug!(
                component = "tailer",
                event = "tailer.poll_stopped",
                path = %path.display(),
                "Polling window elapsed"
            );
        }
    }

    fn forget(&mut self, path: &Path) {
        self.cursors.remove(path);
        if let Some(handle) = self.debounce_tasks.remove(path) {
            handle.abort();
        }
        if let Some(handle) = self.poll_tasks.remove(path) {
            handle.abort();
        }
    }

    /// Cancel every timer and drop all cursors.
    fn stop(&mut self) {
        for (_, handle) in self.debounce_tasks.drain() {
            handle.abort();
        }
        for (_, handle) in self.poll_tasks.drain() {
            handle.abort();
        }
        self.cursors.clear();
        info!(
            component = "tailer",
            event = "tailer.stopped",
            "Tailer stopped"
        );
    }
}

/// Mark every rollout file whose session is already mapped as seen, so only
/// appends made after startup are tailed. Returns how many were marked.
pub fn startup_seed(tailer: &mut LogTailer, root: &Path, mapped: &HashSet<String>) -> usize {
    let files = collect_jsonl_files(root);
    let mut marked = 0usize;
    for path in &files {
        if session_id_of(path).is_some_and(|id| mapped.contains(&id)) {
            tailer.mark_seen(path);
            marked += 1;
        }
    }
    info!(
        component = "tailer",
        event = "tailer.seed_complete",
        marked_files = marked,
        total_files = files.len(),
        "Rollout startup seed complete"
    );
    marked
}

/// Recursive notify watcher feeding the tailer. Keep the returned watcher
/// alive for as long as events are wanted.
pub fn watch_sessions_dir(root: &Path, handle: TailerHandle) -> notify::Result<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                if !matches_supported_event_kind(&event.kind) {
                    return;
                }
                for path in event.paths {
                    handle.notify(path);
                }
            }
            Err(err) => {
                warn!(
                    component = "tailer",
                    event = "tailer.fs_event_error",
                    error = %err,
                    "Rollout watcher event error"
                );
            }
        },
        notify::Config::default(),
    )?;

    watcher.watch(root, RecursiveMode::Recursive)?;
    info!(
        component = "tailer",
        event = "tailer.watching",
        path = %root.display(),
        "Watching rollout sessions"
    );
    Ok(watcher)
}
