//! Bounded per-channel backlog cache.
//!
//! Each channel keeps at most `limit` entries in a ring buffer. The cache is
//! a suffix of the channel's durable log, so before it is trusted it has to be
//! primed with the newest persisted rows. Until then reads return
//! [`Backlog::Unavailable`] rather than an empty list.

use std::collections::{HashMap, VecDeque};

use crate::event::Event;
use crate::identity::ChannelId;

/// A cached event with its insertion sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct BacklogEntry {
    pub seq: u64,
    pub event: Event,
}

/// Result of a backlog read.
#[derive(Debug, Clone, PartialEq)]
pub enum Backlog {
    /// The channel has not been primed from the store yet.
    Unavailable,
    /// Events in ascending time order (possibly empty).
    Ready(Vec<Event>),
}

#[derive(Debug, Default)]
struct ChannelBacklog {
    entries: VecDeque<BacklogEntry>,
    primed: bool,
}

/// Backlog cache for every channel the relay has seen.
#[derive(Debug)]
pub struct BacklogCache {
    limit: usize,
    next_seq: u64,
    channels: HashMap<ChannelId, ChannelBacklog>,
}

impl BacklogCache {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            next_seq: 0,
            channels: HashMap::new(),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Append a live event, evicting the oldest entry when over capacity.
    pub fn append_entry(&mut self, channel: &ChannelId, event: Event) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let backlog = self.channels.entry(channel.clone()).or_default();
        backlog.entries.push_back(BacklogEntry { seq, event });
        while backlog.entries.len() > self.limit {
            backlog.entries.pop_front();
        }
    }

    /// Mark a channel authoritative, seeding it with persisted events
    /// (ascending by time, at most `limit` of them).
    ///
    /// Entries appended live while the store query ran are kept after the
    /// persisted ones; a persisted row equal to one of them is skipped.
    /// Priming an already-primed channel does nothing.
    pub fn prime(&mut self, channel: &ChannelId, persisted: Vec<Event>) {
        let limit = self.limit;
        let backlog = self.channels.entry(channel.clone()).or_default();
        if backlog.primed {
            return;
        }
        let live: Vec<BacklogEntry> = backlog.entries.drain(..).collect();
        let older: Vec<Event> = persisted
            .into_iter()
            .filter(|ev| !live.iter().any(|e| &e.event == ev))
            .collect();

        let mut merged = VecDeque::with_capacity(older.len() + live.len());
        // Persisted rows predate everything in the cache; give them
        // sequence numbers below the live ones.
        let base = live.first().map_or(self.next_seq, |e| e.seq);
        let start = base.saturating_sub(older.len() as u64);
        for (i, event) in older.into_iter().enumerate() {
            merged.push_back(BacklogEntry { seq: start + i as u64, event });
        }
        merged.extend(live);
        while merged.len() > limit {
            merged.pop_front();
        }
        backlog.entries = merged;
        backlog.primed = true;
    }

    pub fn is_primed(&self, channel: &ChannelId) -> bool {
        self.channels.get(channel).is_some_and(|b| b.primed)
    }

    /// The most recent `limit` entries, oldest first. `None` or `Some(0)`
    /// returns the whole cache.
    pub fn get_backlog(&self, channel: &ChannelId, limit: Option<usize>) -> Backlog {
        match self.channels.get(channel) {
            Some(backlog) if backlog.primed => {
                let len = backlog.entries.len();
                let take = match limit {
                    Some(n) if n > 0 => n.min(len),
                    _ => len,
                };
                Backlog::Ready(
                    backlog
                        .entries
                        .iter()
                        .skip(len - take)
                        .map(|e| e.event.clone())
                        .collect(),
                )
            }
            _ => Backlog::Unavailable,
        }
    }

    /// Concatenate the backlogs of `channels` in list order. Channels that
    /// are not primed yet are skipped; there is no merge by timestamp.
    pub fn get_all_state<'a>(
        &self,
        channels: impl IntoIterator<Item = &'a ChannelId>,
        limit: Option<usize>,
    ) -> Vec<Event> {
        let mut out = Vec::new();
        for channel in channels {
            if let Backlog::Ready(events) = self.get_backlog(channel, limit) {
                out.extend(events);
            }
        }
        out
    }

    /// Drop a channel's cache entirely (on part).
    pub fn forget(&mut self, channel: &ChannelId) {
        self.channels.remove(channel);
    }
}
