//! Canonical channel identity.
//!
//! A channel is addressed as `network:channel[ key]`. Both parts are
//! case-folded for equality and hashing; the original casing is kept for
//! display. The canonical form is computed once, when the id is built, and
//! never re-derived downstream.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{BncError, Result};

/// Fold a network, channel or nick name for comparison, using rfc1459
/// casemapping: ASCII letters plus `[]\~` as the uppercase of `{}|^`.
/// Non-ASCII characters are left alone, as IRC servers do.
pub fn fold(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            'A'..='Z' => c.to_ascii_lowercase(),
            '[' => '{',
            ']' => '}',
            '\\' => '|',
            '~' => '^',
            c => c,
        })
        .collect()
}

/// Stable identity of one channel on one network.
#[derive(Debug, Clone)]
pub struct ChannelId {
    network: String,
    channel: String,
    display_network: String,
    display_channel: String,
}

impl ChannelId {
    /// Build an id from already-split parts.
    pub fn new(network: &str, channel: &str) -> Self {
        Self {
            network: fold(network),
            channel: fold(channel),
            display_network: network.to_string(),
            display_channel: channel.to_string(),
        }
    }

    /// Canonical (folded) network name.
    pub fn network(&self) -> &str {
        &self.network
    }

    /// Canonical (folded) channel name.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Channel name as first seen, for display and for sending upstream.
    pub fn display_channel(&self) -> &str {
        &self.display_channel
    }

    pub fn display_network(&self) -> &str {
        &self.display_network
    }

    /// The canonical `network:channel` key.
    pub fn key(&self) -> String {
        format!("{}:{}", self.network, self.channel)
    }
}

impl PartialEq for ChannelId {
    fn eq(&self, other: &Self) -> bool {
        self.network == other.network && self.channel == other.channel
    }
}

impl Eq for ChannelId {}

impl Hash for ChannelId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.network.hash(state);
        self.channel.hash(state);
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.display_network, self.display_channel)
    }
}

/// A raw reference resolved into an id plus the optional join key.
/// The key never takes part in identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRef {
    pub id: ChannelId,
    pub key: Option<String>,
}

/// Resolve `network:channel[ key]` into a [`ChannelRef`].
pub fn canonicalize(raw: &str) -> Result<ChannelRef> {
    let raw = raw.trim();
    let (network, rest) = raw
        .split_once(':')
        .ok_or_else(|| BncError::MalformedIdentifier(raw.to_string()))?;
    let (channel, key) = match rest.split_once(char::is_whitespace) {
        Some((channel, key)) => {
            let key = key.trim();
            (channel, (!key.is_empty()).then(|| key.to_string()))
        }
        None => (rest, None),
    };
    let network = network.trim();
    if network.is_empty() || channel.is_empty() {
        return Err(BncError::MalformedIdentifier(raw.to_string()));
    }
    Ok(ChannelRef {
        id: ChannelId::new(network, channel),
        key,
    })
}

impl FromStr for ChannelId {
    type Err = BncError;

    fn from_str(s: &str) -> Result<Self> {
        canonicalize(s).map(|r| r.id)
    }
}

impl Serialize for ChannelId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ChannelId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// True if `target` looks like an IRC channel name rather than a nick.
pub fn is_channel_name(target: &str) -> bool {
    target.starts_with(['#', '&', '+', '!'])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn case_insensitive_equality() {
        let a = canonicalize("Freenode:#Rust").unwrap();
        let b = canonicalize("freenode:#rust").unwrap();
        let c = canonicalize("FREENODE:#RUST secret").unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.id, c.id);

        let mut set = HashSet::new();
        set.insert(a.id.clone());
        assert!(set.contains(&c.id));
    }

    #[test]
    fn display_casing_preserved() {
        let r = canonicalize("Freenode:#Rust").unwrap();
        assert_eq!(r.id.to_string(), "Freenode:#Rust");
        assert_eq!(r.id.key(), "freenode:#rust");
        assert_eq!(r.id.display_channel(), "#Rust");
    }

    #[test]
    fn key_is_split_off() {
        let r = canonicalize("oftc:#private hunter2").unwrap();
        assert_eq!(r.id.channel(), "#private");
        assert_eq!(r.key.as_deref(), Some("hunter2"));

        let r = canonicalize("oftc:#open").unwrap();
        assert!(r.key.is_none());
    }

    #[test]
    fn missing_separator_is_malformed() {
        assert!(matches!(
            canonicalize("#rust"),
            Err(BncError::MalformedIdentifier(_))
        ));
        assert!(canonicalize(":#rust").is_err());
        assert!(canonicalize("freenode:").is_err());
    }

    #[test]
    fn serde_as_string() {
        let id = ChannelId::new("Libera", "#Test");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"Libera:#Test\"");
        let back: ChannelId = serde_json::from_str("\"libera:#test\"").unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<ChannelId>("\"nocolon\"").is_err());
    }

    #[test]
    fn rfc1459_casemapping() {
        assert_eq!(fold("Nick[Away]"), "nick{away}");
        assert_eq!(fold("a\\b~"), "a|b^");
        assert_eq!(
            ChannelId::new("Libera", "#[Rust]"),
            ChannelId::new("libera", "#{rust}")
        );
        // Not folded by IRC servers.
        assert_eq!(fold("#Ärger"), "#Ärger");
    }

    #[test]
    fn channel_name_detection() {
        assert!(is_channel_name("#rust"));
        assert!(is_channel_name("&local"));
        assert!(!is_channel_name("alice"));
    }
}
