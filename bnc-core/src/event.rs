//! Canonical events.
//!
//! Every upstream occurrence is turned into one of these three shapes by
//! [`crate::normalize`]. Nothing downstream of the normalizer sees upstream
//! protocol types.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::ChannelId;

/// Kinds of per-channel events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChannelEventKind {
    Join,
    Part,
    Kick,
    Names,
    Topic,
    Notice,
    ModeAdded,
    ModeRemoved,
}

/// Kinds of network-wide events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GlobalEventKind {
    Registered,
    Notice,
    NickChange,
    Invite,
    Whois,
    Quit,
    Kill,
    Error,
    Raw,
    Disconnected,
    Unrecognized,
}

impl ChannelEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelEventKind::Join => "join",
            ChannelEventKind::Part => "part",
            ChannelEventKind::Kick => "kick",
            ChannelEventKind::Names => "names",
            ChannelEventKind::Topic => "topic",
            ChannelEventKind::Notice => "notice",
            ChannelEventKind::ModeAdded => "modeAdded",
            ChannelEventKind::ModeRemoved => "modeRemoved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "join" => ChannelEventKind::Join,
            "part" => ChannelEventKind::Part,
            "kick" => ChannelEventKind::Kick,
            "names" => ChannelEventKind::Names,
            "topic" => ChannelEventKind::Topic,
            "notice" => ChannelEventKind::Notice,
            "modeAdded" => ChannelEventKind::ModeAdded,
            "modeRemoved" => ChannelEventKind::ModeRemoved,
            _ => return None,
        })
    }
}

impl GlobalEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GlobalEventKind::Registered => "registered",
            GlobalEventKind::Notice => "notice",
            GlobalEventKind::NickChange => "nickChange",
            GlobalEventKind::Invite => "invite",
            GlobalEventKind::Whois => "whois",
            GlobalEventKind::Quit => "quit",
            GlobalEventKind::Kill => "kill",
            GlobalEventKind::Error => "error",
            GlobalEventKind::Raw => "raw",
            GlobalEventKind::Disconnected => "disconnected",
            GlobalEventKind::Unrecognized => "unrecognized",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "registered" => GlobalEventKind::Registered,
            "notice" => GlobalEventKind::Notice,
            "nickChange" => GlobalEventKind::NickChange,
            "invite" => GlobalEventKind::Invite,
            "whois" => GlobalEventKind::Whois,
            "quit" => GlobalEventKind::Quit,
            "kill" => GlobalEventKind::Kill,
            "error" => GlobalEventKind::Error,
            "raw" => GlobalEventKind::Raw,
            "disconnected" => GlobalEventKind::Disconnected,
            "unrecognized" => GlobalEventKind::Unrecognized,
            _ => return None,
        })
    }
}

/// Current time at the millisecond precision events are stored with.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// A canonical event. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Event {
    Message {
        nick: String,
        text: String,
        timestamp: DateTime<Utc>,
        channel_id: ChannelId,
    },
    ChannelEvent {
        kind: ChannelEventKind,
        nick: Option<String>,
        argument: Option<String>,
        timestamp: DateTime<Utc>,
        channel_id: ChannelId,
    },
    GlobalEvent {
        kind: GlobalEventKind,
        nick: Option<String>,
        argument: Option<String>,
        timestamp: DateTime<Utc>,
        network: String,
    },
}

impl Event {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Event::Message { timestamp, .. }
            | Event::ChannelEvent { timestamp, .. }
            | Event::GlobalEvent { timestamp, .. } => *timestamp,
        }
    }

    /// The channel this event belongs to, if it is channel-scoped.
    pub fn channel_id(&self) -> Option<&ChannelId> {
        match self {
            Event::Message { channel_id, .. } | Event::ChannelEvent { channel_id, .. } => {
                Some(channel_id)
            }
            Event::GlobalEvent { .. } => None,
        }
    }

    /// Canonical (folded) network name.
    pub fn network(&self) -> &str {
        match self {
            Event::Message { channel_id, .. } | Event::ChannelEvent { channel_id, .. } => {
                channel_id.network()
            }
            Event::GlobalEvent { network, .. } => network,
        }
    }

    pub fn nick(&self) -> Option<&str> {
        match self {
            Event::Message { nick, .. } => Some(nick),
            Event::ChannelEvent { nick, .. } | Event::GlobalEvent { nick, .. } => nick.as_deref(),
        }
    }

    pub fn is_message(&self) -> bool {
        matches!(self, Event::Message { .. })
    }
}
