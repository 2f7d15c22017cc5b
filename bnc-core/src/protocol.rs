//! Session wire protocol.
//!
//! One JSON object per frame, discriminated by `"type"`. Field names are
//! camelCase; channel ids travel as `network:channel` strings.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::ChannelConfig;
use crate::error::BncError;
use crate::event::Event;

/// Commands a session can send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Inbound {
    /// Catch-up: channel list, nicks, rosters and every channel's backlog.
    GetState {
        #[serde(default)]
        backlog_limit: Option<usize>,
    },
    GetChannelState {
        channel_id: String,
        #[serde(default)]
        backlog_limit: Option<usize>,
    },
    /// Store query. Every present field is an equality filter.
    Search {
        #[serde(default)]
        channel_id: Option<String>,
        #[serde(default)]
        nick: Option<String>,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        backlog_limit: Option<usize>,
    },
    /// `channelId` may carry a join key after a space.
    Join {
        channel_id: String,
        #[serde(default)]
        display_name: Option<String>,
    },
    Part {
        channel_id: String,
    },
    RenameChannel {
        channel_id: String,
        display_name: String,
    },
    MoveChannel {
        channel_id: String,
        pos: i64,
    },
    Message {
        channel_id: String,
        text: String,
    },
    /// Opaque payload relayed to every session.
    ClientBroadcast {
        payload: serde_json::Value,
    },
    /// A raw protocol line for one network.
    Raw {
        network: String,
        bytes: String,
    },
}

impl Inbound {
    pub fn parse(frame: &str) -> serde_json::Result<Self> {
        serde_json::from_str(frame)
    }

    /// The wire name of this command, used as `where` in error replies.
    pub fn name(&self) -> &'static str {
        match self {
            Inbound::GetState { .. } => "getState",
            Inbound::GetChannelState { .. } => "getChannelState",
            Inbound::Search { .. } => "search",
            Inbound::Join { .. } => "join",
            Inbound::Part { .. } => "part",
            Inbound::RenameChannel { .. } => "renameChannel",
            Inbound::MoveChannel { .. } => "moveChannel",
            Inbound::Message { .. } => "message",
            Inbound::ClientBroadcast { .. } => "clientBroadcast",
            Inbound::Raw { .. } => "raw",
        }
    }
}

/// Frames sent to sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Outbound {
    Channels {
        channels: Vec<ChannelConfig>,
    },
    /// network -> current nick
    Nicks {
        nicks: BTreeMap<String, String>,
    },
    Messages {
        messages: Vec<Event>,
    },
    ChannelEvent {
        event: Event,
    },
    GlobalEvent {
        event: Event,
    },
    /// channel key -> nicks; an empty list means the roster is gone.
    NickLists {
        nick_lists: BTreeMap<String, Vec<String>>,
    },
    /// A channel's history has been loaded and can be requested.
    BacklogAvailable {
        channel_id: String,
    },
    BncErr {
        error: String,
        #[serde(rename = "where")]
        location: String,
    },
    BncWarn {
        warn: String,
        #[serde(rename = "where")]
        location: String,
    },
    ClientBroadcast {
        payload: serde_json::Value,
    },
}

impl Outbound {
    /// Wrap a live event in the frame type sessions expect for it.
    pub fn live(event: Event) -> Self {
        match event {
            Event::Message { .. } => Outbound::Messages { messages: vec![event] },
            Event::ChannelEvent { .. } => Outbound::ChannelEvent { event },
            Event::GlobalEvent { .. } => Outbound::GlobalEvent { event },
        }
    }

    /// `bncWarn` for lookup failures, `bncErr` for everything else.
    pub fn from_error(err: &BncError, location: &str) -> Self {
        if err.is_warning() {
            Outbound::BncWarn { warn: err.to_string(), location: location.to_string() }
        } else {
            Outbound::BncErr { error: err.to_string(), location: location.to_string() }
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ChannelId;
    use chrono::DateTime;
    use serde_json::json;

    #[test]
    fn parses_inbound_commands() {
        let cmd = Inbound::parse(r#"{"type":"moveChannel","channelId":"freenode:#a","pos":-1}"#)
            .unwrap();
        assert_eq!(cmd, Inbound::MoveChannel { channel_id: "freenode:#a".into(), pos: -1 });

        let cmd = Inbound::parse(r#"{"type":"search","nick":"alice"}"#).unwrap();
        assert_eq!(
            cmd,
            Inbound::Search {
                channel_id: None,
                nick: Some("alice".into()),
                text: None,
                backlog_limit: None,
            }
        );

        let cmd = Inbound::parse(r#"{"type":"getState","backlogLimit":20}"#).unwrap();
        assert_eq!(cmd, Inbound::GetState { backlog_limit: Some(20) });
        assert_eq!(cmd.name(), "getState");
    }

    #[test]
    fn rejects_unknown_and_incomplete_frames() {
        assert!(Inbound::parse(r#"{"type":"selfDestruct"}"#).is_err());
        assert!(Inbound::parse(r#"{"type":"part"}"#).is_err());
        assert!(Inbound::parse("not json").is_err());
    }

    #[test]
    fn error_frames_use_where() {
        let warn = Outbound::from_error(&BncError::ChannelNotFound("x:#y".into()), "part");
        let json = serde_json::to_value(&warn).unwrap();
        assert_eq!(json["type"], "bncWarn");
        assert_eq!(json["where"], "part");

        let err = Outbound::from_error(&BncError::PersistenceFailure("disk".into()), "search");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["type"], "bncErr");
        assert_eq!(json["error"], "persistence failure: disk");
    }

    #[test]
    fn live_messages_are_batched_frames() {
        let ev = Event::Message {
            nick: "alice".into(),
            text: "hi".into(),
            timestamp: DateTime::from_timestamp_millis(0).unwrap(),
            channel_id: ChannelId::new("freenode", "#test"),
        };
        let json = serde_json::to_value(Outbound::live(ev)).unwrap();
        assert_eq!(json["type"], "messages");
        assert_eq!(json["messages"][0]["text"], "hi");
    }

    #[test]
    fn client_broadcast_is_opaque() {
        let cmd = Inbound::parse(r#"{"type":"clientBroadcast","payload":{"draft":[1,2]}}"#)
            .unwrap();
        let Inbound::ClientBroadcast { payload } = cmd else { panic!("wrong variant") };
        assert_eq!(payload, json!({"draft": [1, 2]}));
    }
}
