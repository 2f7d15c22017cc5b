//! Durable event store interface.
//!
//! The store is append-only. Reads take equality filters on any stored field
//! and return matches in ascending time order; a limit keeps the most recent
//! matches.

use parking_lot::{Condvar, Mutex};

use crate::error::{BncError, Result};
use crate::event::Event;
use crate::identity::{fold, ChannelId};

/// Which of the three canonical shapes a record has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Message,
    ChannelEvent,
    GlobalEvent,
}

impl RecordType {
    pub fn of(event: &Event) -> Self {
        match event {
            Event::Message { .. } => RecordType::Message,
            Event::ChannelEvent { .. } => RecordType::ChannelEvent,
            Event::GlobalEvent { .. } => RecordType::GlobalEvent,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Message => "message",
            RecordType::ChannelEvent => "channelEvent",
            RecordType::GlobalEvent => "globalEvent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "message" => Some(RecordType::Message),
            "channelEvent" => Some(RecordType::ChannelEvent),
            "globalEvent" => Some(RecordType::GlobalEvent),
            _ => None,
        }
    }
}

/// Equality filters. `None` fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventQuery {
    pub record: Option<RecordType>,
    /// Folded network name.
    pub network: Option<String>,
    /// Folded channel name.
    pub channel: Option<String>,
    /// Compared case-insensitively.
    pub nick: Option<String>,
    /// Event kind as its wire string (`join`, `nickChange`, ...).
    pub kind: Option<String>,
    /// Message text or event argument, exact.
    pub text: Option<String>,
    /// Keep only the most recent `limit` matches.
    pub limit: Option<usize>,
}

impl EventQuery {
    /// The newest `limit` channel-scoped records of one channel.
    pub fn channel(id: &ChannelId, limit: usize) -> Self {
        Self {
            network: Some(id.network().to_string()),
            channel: Some(id.channel().to_string()),
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn matches(&self, event: &Event) -> bool {
        if self.record.is_some_and(|r| r != RecordType::of(event)) {
            return false;
        }
        if self.network.as_ref().is_some_and(|n| fold(n) != event.network()) {
            return false;
        }
        if let Some(channel) = &self.channel {
            match event.channel_id() {
                Some(id) if id.channel() == fold(channel) => {}
                _ => return false,
            }
        }
        if let Some(nick) = &self.nick {
            match event.nick() {
                Some(n) if fold(n) == fold(nick) => {}
                _ => return false,
            }
        }
        if let Some(kind) = &self.kind {
            if event_kind(event) != Some(kind.as_str()) {
                return false;
            }
        }
        if let Some(text) = &self.text {
            if event_text(event) != Some(text.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Kind column: `None` for messages.
pub(crate) fn event_kind(event: &Event) -> Option<&'static str> {
    match event {
        Event::Message { .. } => None,
        Event::ChannelEvent { kind, .. } => Some(kind.as_str()),
        Event::GlobalEvent { kind, .. } => Some(kind.as_str()),
    }
}

/// Text column: message body or event argument.
pub(crate) fn event_text(event: &Event) -> Option<&str> {
    match event {
        Event::Message { text, .. } => Some(text),
        Event::ChannelEvent { argument, .. } | Event::GlobalEvent { argument, .. } => {
            argument.as_deref()
        }
    }
}

/// Persistent store collaborator.
///
/// Calls block; the relay runs them on the blocking pool.
pub trait EventStore: Send + Sync {
    fn insert(&self, event: &Event) -> Result<()>;
    fn query(&self, query: &EventQuery) -> Result<Vec<Event>>;
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreState>,
    held: Mutex<bool>,
    released: Condvar,
}

#[derive(Default)]
struct MemoryStoreState {
    events: Vec<Event>,
    fail_writes: bool,
    fail_reads: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(events: Vec<Event>) -> Self {
        let store = Self::default();
        store.inner.lock().events = events;
        store
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.lock().fail_writes = fail;
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.inner.lock().fail_reads = fail;
    }

    /// While held, every insert and query blocks until released.
    pub fn set_held(&self, held: bool) {
        *self.held.lock() = held;
        if !held {
            self.released.notify_all();
        }
    }

    fn wait_released(&self) {
        let mut held = self.held.lock();
        while *held {
            self.released.wait(&mut held);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn events(&self) -> Vec<Event> {
        self.inner.lock().events.clone()
    }
}

impl EventStore for MemoryStore {
    fn insert(&self, event: &Event) -> Result<()> {
        self.wait_released();
        let mut state = self.inner.lock();
        if state.fail_writes {
            return Err(BncError::PersistenceFailure("store rejected write".into()));
        }
        state.events.push(event.clone());
        Ok(())
    }

    fn query(&self, query: &EventQuery) -> Result<Vec<Event>> {
        self.wait_released();
        let state = self.inner.lock();
        if state.fail_reads {
            return Err(BncError::PersistenceFailure("store unavailable".into()));
        }
        let mut hits: Vec<Event> =
            state.events.iter().filter(|e| query.matches(e)).cloned().collect();
        // Stable: equal timestamps keep insertion order.
        hits.sort_by_key(Event::timestamp);
        if let Some(limit) = query.limit.filter(|l| *l > 0) {
            let skip = hits.len().saturating_sub(limit);
            hits.drain(..skip);
        }
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ChannelEventKind, GlobalEventKind};
    use chrono::DateTime;

    fn msg(nick: &str, chan: &str, text: &str, ms: i64) -> Event {
        Event::Message {
            nick: nick.into(),
            text: text.into(),
            timestamp: DateTime::from_timestamp_millis(ms).unwrap(),
            channel_id: ChannelId::new("freenode", chan),
        }
    }

    #[test]
    fn filters_combine() {
        let store = MemoryStore::new();
        store.insert(&msg("alice", "#test", "one", 3)).unwrap();
        store.insert(&msg("bob", "#test", "two", 2)).unwrap();
        store.insert(&msg("Alice", "#other", "three", 1)).unwrap();
        store.insert(&msg("ALICE", "#Test", "four", 1)).unwrap();

        let hits = store
            .query(&EventQuery {
                nick: Some("alice".into()),
                channel: Some("#test".into()),
                ..Default::default()
            })
            .unwrap();
        let texts: Vec<_> = hits.iter().filter_map(event_text).collect();
        assert_eq!(texts, vec!["four", "one"]);
    }

    #[test]
    fn limit_keeps_newest() {
        let store = MemoryStore::new();
        for n in 1..=5 {
            store.insert(&msg("alice", "#test", &n.to_string(), n)).unwrap();
        }
        let hits = store
            .query(&EventQuery::channel(&ChannelId::new("freenode", "#test"), 2))
            .unwrap();
        let texts: Vec<_> = hits.iter().filter_map(event_text).collect();
        assert_eq!(texts, vec!["4", "5"]);
    }

    #[test]
    fn channel_query_excludes_global_events() {
        let store = MemoryStore::new();
        store
            .insert(&Event::GlobalEvent {
                kind: GlobalEventKind::Quit,
                nick: Some("bob".into()),
                argument: None,
                timestamp: DateTime::from_timestamp_millis(1).unwrap(),
                network: "freenode".into(),
            })
            .unwrap();
        store
            .insert(&Event::ChannelEvent {
                kind: ChannelEventKind::Join,
                nick: Some("bob".into()),
                argument: None,
                timestamp: DateTime::from_timestamp_millis(2).unwrap(),
                channel_id: ChannelId::new("freenode", "#test"),
            })
            .unwrap();
        let hits = store
            .query(&EventQuery::channel(&ChannelId::new("freenode", "#test"), 10))
            .unwrap();
        assert_eq!(hits.len(), 1);

        let kinds = store
            .query(&EventQuery { kind: Some("quit".into()), ..Default::default() })
            .unwrap();
        assert_eq!(kinds.len(), 1);
    }

    #[test]
    fn failures_are_persistence_errors() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        assert!(matches!(
            store.insert(&msg("a", "#b", "c", 0)),
            Err(BncError::PersistenceFailure(_))
        ));
        store.set_fail_reads(true);
        assert!(store.query(&EventQuery::default()).is_err());
    }
}
