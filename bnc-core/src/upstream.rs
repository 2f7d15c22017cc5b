//! Interface to the upstream network collaborator.
//!
//! The collaborator owns the wire protocol, registration and reconnection.
//! The core only sees [`UpstreamEvent`]s on an ordered stream per network and
//! drives the connection through an [`UpstreamHandle`].

use tokio::sync::mpsc;

use crate::config::NetworkConfig;
use crate::error::Result;

/// Events emitted by an upstream connection, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    /// Registration complete; `nick` is the confirmed nick.
    Registered { nick: String },
    Message { from: String, target: String, text: String },
    /// `from` is `None` for server notices.
    Notice { from: Option<String>, target: String, text: String },
    NickChange { old_nick: String, new_nick: String },
    Invite { channel: String, by: String },
    ModeAdded { channel: String, by: String, mode: String, argument: Option<String> },
    ModeRemoved { channel: String, by: String, mode: String, argument: Option<String> },
    Whois { nick: String, info: String },
    Join { channel: String, nick: String },
    Part { channel: String, nick: String, reason: Option<String> },
    /// `channels` is whatever upstream reported; the roster does not trust it.
    Quit { nick: String, reason: Option<String>, channels: Vec<String> },
    Kick { channel: String, nick: String, by: String, reason: Option<String> },
    Kill { nick: String, reason: Option<String>, channels: Vec<String> },
    /// The complete member list of a channel, replacing what was known.
    Names { channel: String, nicks: Vec<String> },
    Topic { channel: String, topic: String, nick: Option<String> },
    Error { message: String },
    Disconnected { reason: String },
    Raw(String),
    /// A command the collaborator has no dedicated variant for.
    Other { command: String, params: Vec<String> },
}

/// Outbound side of one upstream connection.
///
/// Every method is fire-and-forget: success or failure, if observed at all,
/// arrives later as an [`UpstreamEvent`].
pub trait UpstreamHandle: Send + Sync {
    fn join(&self, channel: &str, key: Option<&str>) -> Result<()>;
    fn part(&self, channel: &str) -> Result<()>;
    fn say(&self, target: &str, text: &str) -> Result<()>;
    fn send_raw(&self, bytes: &[u8]) -> Result<()>;
}

/// Opens upstream connections.
pub trait UpstreamConnector {
    fn connect(
        &self,
        network: &NetworkConfig,
    ) -> (std::sync::Arc<dyn UpstreamHandle>, mpsc::Receiver<UpstreamEvent>);
}
