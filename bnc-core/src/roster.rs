//! Live channel membership.
//!
//! Rosters are ephemeral: they exist only while the relay is joined to a
//! channel and are rebuilt from the complete upstream NAMES list after every
//! (re)join or explicit names query.

use std::collections::{BTreeMap, HashMap};

use crate::error::{BncError, Result};
use crate::event::{ChannelEventKind, Event, GlobalEventKind};
use crate::identity::{fold, ChannelId};

/// Membership prefixes stripped from NAMES entries.
const NAMES_PREFIXES: &[char] = &['~', '&', '@', '%', '+'];

/// folded nick -> nick as last seen
type Roster = BTreeMap<String, String>;

#[derive(Debug, Default)]
pub struct RosterTracker {
    rosters: HashMap<ChannelId, Roster>,
}

impl RosterTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one canonical event. `own_nick` is the relay's current nick on
    /// the event's network.
    pub fn apply(&mut self, event: &Event, own_nick: &str) {
        let is_own = |nick: &str| fold(nick) == fold(own_nick);
        match event {
            Event::ChannelEvent { kind, nick, argument, channel_id, .. } => match kind {
                ChannelEventKind::Join => {
                    let Some(nick) = nick else { return };
                    if is_own(nick) {
                        // Fresh roster; NAMES will fill it in.
                        let mut roster = Roster::new();
                        roster.insert(fold(nick), nick.clone());
                        self.rosters.insert(channel_id.clone(), roster);
                    } else if let Some(roster) = self.rosters.get_mut(channel_id) {
                        roster.insert(fold(nick), nick.clone());
                    }
                }
                ChannelEventKind::Part | ChannelEventKind::Kick => {
                    let Some(nick) = nick else { return };
                    if is_own(nick) {
                        self.rosters.remove(channel_id);
                    } else if let Some(roster) = self.rosters.get_mut(channel_id) {
                        roster.remove(&fold(nick));
                    }
                }
                ChannelEventKind::Names => {
                    // NAMES for a channel we are not in does not create a roster.
                    let Some(roster) = self.rosters.get_mut(channel_id) else { return };
                    // A complete list replaces the roster; we stay in it.
                    let own = roster
                        .remove(&fold(own_nick))
                        .unwrap_or_else(|| own_nick.to_string());
                    roster.clear();
                    roster.insert(fold(&own), own);
                    for entry in argument.as_deref().unwrap_or("").split_whitespace() {
                        let nick = entry.trim_start_matches(NAMES_PREFIXES);
                        if !nick.is_empty() {
                            roster.insert(fold(nick), nick.to_string());
                        }
                    }
                }
                _ => {}
            },
            Event::GlobalEvent { kind, nick, argument, network, .. } => match kind {
                GlobalEventKind::Quit | GlobalEventKind::Kill => {
                    let Some(nick) = nick else { return };
                    if is_own(nick) {
                        self.drop_network(network);
                    } else {
                        let folded = fold(nick);
                        for roster in self.network_rosters(network) {
                            roster.remove(&folded);
                        }
                    }
                }
                GlobalEventKind::NickChange => {
                    let (Some(old), Some(new)) = (nick, argument) else { return };
                    let folded = fold(old);
                    for roster in self.network_rosters(network) {
                        if roster.remove(&folded).is_some() {
                            roster.insert(fold(new), new.clone());
                        }
                    }
                }
                GlobalEventKind::Disconnected => self.drop_network(network),
                _ => {}
            },
            Event::Message { .. } => {}
        }
    }

    fn network_rosters<'a>(&'a mut self, network: &'a str) -> impl Iterator<Item = &'a mut Roster> {
        self.rosters
            .iter_mut()
            .filter(move |(id, _)| id.network() == network)
            .map(|(_, roster)| roster)
    }

    /// Channels of `network` that currently have a roster.
    pub fn channels_on(&self, network: &str) -> Vec<ChannelId> {
        self.rosters.keys().filter(|id| id.network() == network).cloned().collect()
    }

    /// Forget every roster of a network (our own connection went away).
    pub fn drop_network(&mut self, network: &str) {
        self.rosters.retain(|id, _| id.network() != network);
    }

    /// Nicks in a channel, sorted case-insensitively.
    pub fn get_nick_list(&self, channel: &ChannelId) -> Result<Vec<String>> {
        self.rosters
            .get(channel)
            .map(|r| r.values().cloned().collect())
            .ok_or_else(|| BncError::ChannelNotFound(channel.to_string()))
    }

    /// Every tracked roster, keyed by channel.
    pub fn nick_lists(&self) -> HashMap<ChannelId, Vec<String>> {
        self.rosters
            .iter()
            .map(|(id, r)| (id.clone(), r.values().cloned().collect()))
            .collect()
    }
}
