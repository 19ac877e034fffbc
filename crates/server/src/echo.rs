//! Echo suppression between the interactive relay and tail replay.
//!
//! The same turn is seen twice: streamed live by the relay, then read back by
//! the tailer once Codex flushes it to the rollout file. Texts delivered on
//! one path are remembered per chat thread for a short window and matching
//! deliveries on the other path are dropped. Codex writes most messages
//! twice (`response_item` and `event_msg`), so a match is not consumed.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;

pub const DEFAULT_ECHO_TTL: Duration = Duration::from_secs(8);
const MAX_TEXTS_PER_KIND: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoKind {
    User,
    Assistant,
}

#[derive(Debug)]
struct EchoEntry {
    text: String,
    at: Instant,
}

#[derive(Debug)]
struct EchoBucket {
    user: VecDeque<EchoEntry>,
    assistant: VecDeque<EchoEntry>,
    expires_at: Instant,
    in_flight: usize,
}

impl EchoBucket {
    fn new(now: Instant, ttl: Duration) -> Self {
        Self {
            user: VecDeque::new(),
            assistant: VecDeque::new(),
            expires_at: now + ttl,
            in_flight: 0,
        }
    }

    fn texts(&mut self, kind: EchoKind) -> &mut VecDeque<EchoEntry> {
        match kind {
            EchoKind::User => &mut self.user,
            EchoKind::Assistant => &mut self.assistant,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.in_flight == 0 && now >= self.expires_at
    }
}

pub struct EchoSuppressor {
    buckets: DashMap<String, EchoBucket>,
    ttl: Duration,
}

impl EchoSuppressor {
    pub fn new(ttl: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            ttl,
        }
    }

    /// Record `text` as delivered to `thread_id` and refresh the window.
    pub fn remember(&self, thread_id: &str, kind: EchoKind, text: &str) {
        let normalized = normalize(text);
        if normalized.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut bucket = self
            .buckets
            .entry(thread_id.to_string())
            .or_insert_with(|| EchoBucket::new(now, self.ttl));
        if bucket.is_expired(now) {
            *bucket = EchoBucket::new(now, self.ttl);
        }
        bucket.expires_at = now + self.ttl;
        let texts = bucket.texts(kind);
        if texts.len() == MAX_TEXTS_PER_KIND {
            texts.pop_front();
        }
        texts.push_back(EchoEntry {
            text: normalized,
            at: now,
        });
    }

    /// True when `text` was delivered to `thread_id` within the window. While
    /// a delivery is in flight every remembered text stays live.
    pub fn is_echo(&self, thread_id: &str, kind: EchoKind, text: &str) -> bool {
        let normalized = normalize(text);
        if normalized.is_empty() {
            return false;
        }
        let now = Instant::now();
        let ttl = self.ttl;
        let Some(mut bucket) = self.buckets.get_mut(thread_id) else {
            return false;
        };
        if bucket.is_expired(now) {
            return false;
        }
        let in_flight = bucket.in_flight > 0;
        let matched = bucket
            .texts(kind)
            .iter()
            .any(|e| e.text == normalized && (in_flight || now.duration_since(e.at) < ttl));
        if matched {
            bucket.expires_at = now + ttl;
        }
        matched
    }

    /// Mark an interactive delivery as running; its bucket will not expire
    /// until the matching `end_delivery`.
    pub fn begin_delivery(&self, thread_id: &str) {
        let now = Instant::now();
        let mut bucket = self
            .buckets
            .entry(thread_id.to_string())
            .or_insert_with(|| EchoBucket::new(now, self.ttl));
        bucket.in_flight += 1;
        bucket.expires_at = now + self.ttl;
    }

    /// The window for everything remembered during the delivery restarts
    /// now, since the tail usually replays a turn after it finishes.
    pub fn end_delivery(&self, thread_id: &str) {
        if let Some(mut bucket) = self.buckets.get_mut(thread_id) {
            let now = Instant::now();
            bucket.in_flight = bucket.in_flight.saturating_sub(1);
            bucket.expires_at = now + self.ttl;
            let bucket = &mut *bucket;
            for entry in bucket.user.iter_mut().chain(bucket.assistant.iter_mut()) {
                entry.at = now;
            }
        }
    }

    /// Drop expired buckets. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| !bucket.is_expired(now));
        before - self.buckets.len()
    }

    pub fn tracked_threads(&self) -> usize {
        self.buckets.len()
    }
}

/// Whitespace-collapsed, trimmed form used for comparison.
pub fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remembered_text_suppresses_both_replayed_copies() {
        let echo = EchoSuppressor::new(DEFAULT_ECHO_TTL);
        echo.remember("t1", EchoKind::Assistant, "Done.\n\nAll tests pass.");

        assert!(echo.is_echo("t1", EchoKind::Assistant, "Done. All tests   pass."));
        assert!(echo.is_echo("t1", EchoKind::Assistant, "Done. All tests pass."));
        assert!(!echo.is_echo("t1", EchoKind::Assistant, "Done."));
    }

    #[test]
    fn kinds_and_threads_are_separate() {
        let echo = EchoSuppressor::new(DEFAULT_ECHO_TTL);
        echo.remember("t1", EchoKind::User, "run the tests");

        assert!(!echo.is_echo("t1", EchoKind::Assistant, "run the tests"));
        assert!(!echo.is_echo("t2", EchoKind::User, "run the tests"));
        assert!(echo.is_echo("t1", EchoKind::User, "run the tests"));
    }

    #[test]
    fn old_entries_stop_matching_while_bucket_is_refreshed() {
        let echo = EchoSuppressor::new(Duration::from_millis(300));
        echo.remember("t1", EchoKind::User, "continue");
        std::thread::sleep(Duration::from_millis(200));
        echo.remember("t1", EchoKind::User, "other");
        std::thread::sleep(Duration::from_millis(200));

        assert!(!echo.is_echo("t1", EchoKind::User, "continue"));
        assert!(echo.is_echo("t1", EchoKind::User, "other"));
    }

    #[test]
    fn entries_expire_after_ttl() {
        let echo = EchoSuppressor::new(Duration::from_millis(20));
        echo.remember("t1", EchoKind::User, "hello");
        std::thread::sleep(Duration::from_millis(40));

        assert!(!echo.is_echo("t1", EchoKind::User, "hello"));
        assert_eq!(echo.prune(), 1);
        assert_eq!(echo.tracked_threads(), 0);
    }

    #[test]
    fn in_flight_delivery_keeps_bucket_alive() {
        let echo = EchoSuppressor::new(Duration::from_millis(20));
        echo.begin_delivery("t1");
        echo.remember("t1", EchoKind::Assistant, "working on it");
        std::thread::sleep(Duration::from_millis(40));

        assert_eq!(echo.prune(), 0);
        assert!(echo.is_echo("t1", EchoKind::Assistant, "working on it"));

        echo.end_delivery("t1");
        assert!(echo.is_echo("t1", EchoKind::Assistant, "working on it"));
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(echo.prune(), 1);
    }

    #[test]
    fn blank_text_is_never_an_echo() {
        let echo = EchoSuppressor::new(DEFAULT_ECHO_TTL);
        echo.remember("t1", EchoKind::User, "   ");
        assert!(!echo.is_echo("t1", EchoKind::User, ""));
        assert_eq!(echo.tracked_threads(), 0);
    }
}
