//! UpstreamEvent → canonical Event conversion.
//!
//! This is the only place that knows upstream shapes. The mapping is pure:
//! the caller supplies the network name and the arrival timestamp.

use chrono::{DateTime, Utc};

use crate::event::{ChannelEventKind, Event, GlobalEventKind};
use crate::identity::{fold, is_channel_name, ChannelId};
use crate::upstream::UpstreamEvent;

/// Convert one upstream event into its canonical form.
pub fn normalize(network: &str, event: &UpstreamEvent, timestamp: DateTime<Utc>) -> Event {
    let channel_event =
        |kind: ChannelEventKind, channel: &str, nick: Option<&str>, argument: Option<String>| {
            Event::ChannelEvent {
                kind,
                nick: nick.map(str::to_string),
                argument,
                timestamp,
                channel_id: ChannelId::new(network, channel),
            }
        };
    let global_event = |kind: GlobalEventKind, nick: Option<&str>, argument: Option<String>| {
        Event::GlobalEvent {
            kind,
            nick: nick.map(str::to_string),
            argument,
            timestamp,
            network: fold(network),
        }
    };

    match event {
        UpstreamEvent::Registered { nick } => {
            global_event(GlobalEventKind::Registered, Some(nick.as_str()), None)
        }
        UpstreamEvent::Message { from, target, text } => {
            // Private messages are filed under the sender, like a query buffer.
            let buffer = if is_channel_name(target) { target } else { from };
            Event::Message {
                nick: from.clone(),
                text: text.clone(),
                timestamp,
                channel_id: ChannelId::new(network, buffer),
            }
        }
        UpstreamEvent::Notice { from, target, text } => {
            if is_channel_name(target) {
                channel_event(
                    ChannelEventKind::Notice,
                    target,
                    from.as_deref(),
                    Some(text.clone()),
                )
            } else {
                global_event(GlobalEventKind::Notice, from.as_deref(), Some(text.clone()))
            }
        }
        UpstreamEvent::NickChange { old_nick, new_nick } => global_event(
            GlobalEventKind::NickChange,
            Some(old_nick.as_str()),
            Some(new_nick.clone()),
        ),
        UpstreamEvent::Invite { channel, by } => {
            global_event(GlobalEventKind::Invite, Some(by.as_str()), Some(channel.clone()))
        }
        UpstreamEvent::ModeAdded { channel, by, mode, argument } => channel_event(
            ChannelEventKind::ModeAdded,
            channel,
            Some(by.as_str()),
            Some(mode_argument(mode, argument.as_deref())),
        ),
        UpstreamEvent::ModeRemoved { channel, by, mode, argument } => channel_event(
            ChannelEventKind::ModeRemoved,
            channel,
            Some(by.as_str()),
            Some(mode_argument(mode, argument.as_deref())),
        ),
        UpstreamEvent::Whois { nick, info } => {
            global_event(GlobalEventKind::Whois, Some(nick.as_str()), Some(info.clone()))
        }
        UpstreamEvent::Join { channel, nick } => {
            channel_event(ChannelEventKind::Join, channel, Some(nick.as_str()), None)
        }
        UpstreamEvent::Part { channel, nick, reason } => {
            channel_event(ChannelEventKind::Part, channel, Some(nick.as_str()), reason.clone())
        }
        UpstreamEvent::Quit { nick, reason, .. } => {
            global_event(GlobalEventKind::Quit, Some(nick.as_str()), reason.clone())
        }
        UpstreamEvent::Kick { channel, nick, by, reason } => {
            let argument = match reason.as_deref().filter(|r| !r.is_empty()) {
                Some(reason) => format!("{by}: {reason}"),
                None => by.clone(),
            };
            channel_event(ChannelEventKind::Kick, channel, Some(nick.as_str()), Some(argument))
        }
        UpstreamEvent::Kill { nick, reason, .. } => {
            global_event(GlobalEventKind::Kill, Some(nick.as_str()), reason.clone())
        }
        UpstreamEvent::Names { channel, nicks } => {
            channel_event(ChannelEventKind::Names, channel, None, Some(nicks.join(" ")))
        }
        UpstreamEvent::Topic { channel, topic, nick } => channel_event(
            ChannelEventKind::Topic,
            channel,
            nick.as_deref(),
            Some(topic.clone()),
        ),
        UpstreamEvent::Error { message } => {
            global_event(GlobalEventKind::Error, None, Some(message.clone()))
        }
        UpstreamEvent::Disconnected { reason } => {
            global_event(GlobalEventKind::Disconnected, None, Some(reason.clone()))
        }
        UpstreamEvent::Raw(line) => global_event(GlobalEventKind::Raw, None, Some(line.clone())),
        UpstreamEvent::Other { command, params } => {
            let mut argument = command.clone();
            for p in params {
                argument.push(' ');
                argument.push_str(p);
            }
            global_event(GlobalEventKind::Unrecognized, None, Some(argument))
        }
    }
}

fn mode_argument(mode: &str, argument: Option<&str>) -> String {
    match argument {
        Some(a) => format!("{mode} {a}"),
        None => mode.to_string(),
    }
}
