//! Per-network connection supervision.
//!
//! A [`NetworkSupervisor`] wraps the upstream handle for one configured
//! network: it tracks registration state and the current nick, autojoins the
//! network's channels once registered, and forwards outbound commands.
//! Reconnection is the upstream collaborator's job.
//!
//! All supervisors live in one [`NetworkRegistry`], built once at start:
//! load config, connect every network, then hand the registry and the event
//! streams to the relay.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::{ChannelConfig, NetworkConfig};
use crate::error::{BncError, Result};
use crate::identity::{fold, ChannelId};
use crate::upstream::{UpstreamConnector, UpstreamEvent, UpstreamHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Registered,
}

pub struct NetworkSupervisor {
    config: NetworkConfig,
    handle: Arc<dyn UpstreamHandle>,
    state: ConnectionState,
    nick: String,
}

impl NetworkSupervisor {
    pub fn new(config: NetworkConfig, handle: Arc<dyn UpstreamHandle>) -> Self {
        let nick = config.nick.clone();
        Self {
            config,
            handle,
            state: ConnectionState::Connecting,
            nick,
        }
    }

    /// Folded network name.
    pub fn name(&self) -> String {
        fold(&self.config.name)
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn nick(&self) -> &str {
        &self.nick
    }

    pub fn set_nick(&mut self, nick: &str) {
        self.nick = nick.to_string();
    }

    /// Registration finished: record the nick and autojoin every configured
    /// channel on this network. Returns how many joins were issued.
    pub fn on_registered<'a>(
        &mut self,
        nick: &str,
        channels: impl IntoIterator<Item = &'a ChannelConfig>,
    ) -> usize {
        self.state = ConnectionState::Registered;
        self.nick = nick.to_string();
        let network = self.name();
        let mut joined = 0;
        for ch in channels.into_iter().filter(|c| c.id.network() == network) {
            if let Err(e) = self.join(&ch.id, ch.key.as_deref()) {
                tracing::warn!(network = %network, channel = %ch.id, error = %e, "Autojoin failed");
                continue;
            }
            joined += 1;
        }
        tracing::info!(network = %network, nick = %self.nick, joined, "Registered");
        joined
    }

    /// The connection dropped; the collaborator will reconnect.
    pub fn on_disconnected(&mut self) {
        self.state = ConnectionState::Disconnected;
    }

    pub fn join(&self, channel: &ChannelId, key: Option<&str>) -> Result<()> {
        self.handle.join(channel.display_channel(), key)
    }

    pub fn part(&self, channel: &ChannelId) -> Result<()> {
        self.handle.part(channel.display_channel())
    }

    pub fn send_message(&self, channel: &ChannelId, text: &str) -> Result<()> {
        self.handle.say(channel.display_channel(), text)
    }

    pub fn send_raw(&self, bytes: &[u8]) -> Result<()> {
        self.handle.send_raw(bytes)
    }
}

/// Every configured network, keyed by folded name.
#[derive(Default)]
pub struct NetworkRegistry {
    networks: HashMap<String, NetworkSupervisor>,
}

impl NetworkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect every network. Returns the registry and one event stream per
    /// network (folded name, receiver), in config order.
    pub fn connect_all(
        networks: &[NetworkConfig],
        connector: &dyn UpstreamConnector,
    ) -> (Self, Vec<(String, mpsc::Receiver<UpstreamEvent>)>) {
        let mut registry = Self::new();
        let mut streams = Vec::with_capacity(networks.len());
        for network in networks {
            let name = fold(&network.name);
            if registry.networks.contains_key(&name) {
                tracing::warn!(network = %network.name, "Duplicate network in config, skipping");
                continue;
            }
            tracing::info!(network = %network.name, host = %network.host, "Connecting");
            let (handle, events) = connector.connect(network);
            registry.insert(NetworkSupervisor::new(network.clone(), handle));
            streams.push((name, events));
        }
        (registry, streams)
    }

    pub fn insert(&mut self, supervisor: NetworkSupervisor) {
        self.networks.insert(supervisor.name(), supervisor);
    }

    pub fn get(&self, network: &str) -> Result<&NetworkSupervisor> {
        self.networks
            .get(&fold(network))
            .ok_or_else(|| BncError::NetworkNotFound(network.to_string()))
    }

    pub fn get_mut(&mut self, network: &str) -> Result<&mut NetworkSupervisor> {
        self.networks
            .get_mut(&fold(network))
            .ok_or_else(|| BncError::NetworkNotFound(network.to_string()))
    }

    /// `{network: current nick}` for every network.
    pub fn nicks(&self) -> BTreeMap<String, String> {
        self.networks
            .iter()
            .map(|(name, sup)| (name.clone(), sup.nick().to_string()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }

    pub fn states(&self) -> BTreeMap<String, ConnectionState> {
        self.networks
            .iter()
            .map(|(name, sup)| (name.clone(), sup.state()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        joins: Mutex<Vec<(String, Option<String>)>>,
    }

    impl UpstreamHandle for Recorder {
        fn join(&self, channel: &str, key: Option<&str>) -> Result<()> {
            self.joins.lock().push((channel.to_string(), key.map(str::to_string)));
            Ok(())
        }
        fn part(&self, _: &str) -> Result<()> {
            Ok(())
        }
        fn say(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        fn send_raw(&self, _: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    fn network(name: &str) -> NetworkConfig {
        NetworkConfig {
            name: name.into(),
            host: "localhost:6667".into(),
            nick: "me".into(),
            user: None,
            realname: None,
            tls: false,
            tls_insecure: false,
        }
    }

    fn channel(raw: &str, key: Option<&str>) -> ChannelConfig {
        ChannelConfig {
            id: raw.parse().unwrap(),
            display_name: raw.into(),
            position: 0,
            key: key.map(str::to_string),
        }
    }

    #[test]
    fn registered_autojoins_own_channels_with_keys() {
        let rec = Arc::new(Recorder::default());
        let mut sup = NetworkSupervisor::new(network("Freenode"), rec.clone());
        let channels = vec![
            channel("freenode:#Rust", Some("sekrit")),
            channel("oftc:#debian", None),
        ];
        assert_eq!(sup.on_registered("me_", &channels), 1);
        assert_eq!(sup.state(), ConnectionState::Registered);
        assert_eq!(sup.nick(), "me_");
        assert_eq!(*rec.joins.lock(), vec![("#Rust".to_string(), Some("sekrit".to_string()))]);
    }

    #[test]
    fn unknown_network_is_not_found() {
        let mut reg = NetworkRegistry::new();
        reg.insert(NetworkSupervisor::new(network("oftc"), Arc::new(Recorder::default())));
        assert!(reg.get("OFTC").is_ok());
        assert!(matches!(reg.get("efnet"), Err(BncError::NetworkNotFound(_))));
        assert_eq!(reg.nicks().get("oftc").map(String::as_str), Some("me"));
    }
}
