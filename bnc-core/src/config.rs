//! Config document and the channel Config Store.
//!
//! The document is loaded once at start (`~/.config/bnc/config.json` by
//! default, TOML if the file ends in `.toml`) and rewritten wholesale every
//! time the channel list changes. The Config Store owns the channel list:
//! every mutation is persisted before it counts, and is rolled back if the
//! write fails.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BncError, Result};
use crate::identity::{fold, ChannelId};

/// Default number of cached events per channel.
pub const DEFAULT_BACKLOG_LIMIT: usize = 500;
/// Default timeout for store reads issued on behalf of a session.
pub const DEFAULT_STORE_TIMEOUT_SECS: u64 = 10;

/// One upstream network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    /// Network name used in channel ids (`name:#channel`).
    pub name: String,
    /// Server address (host:port).
    pub host: String,
    pub nick: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realname: Option<String>,
    #[serde(default)]
    pub tls: bool,
    /// Skip certificate verification (self-signed upstreams).
    #[serde(default)]
    pub tls_insecure: bool,
}

/// One subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfig {
    pub id: ChannelId,
    pub display_name: String,
    #[serde(default)]
    pub position: usize,
    /// Join key sent on autojoin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogOptions {
    /// Emit JSON log lines.
    #[serde(default)]
    pub json: bool,
    /// `tracing_subscriber::EnvFilter` directive, e.g. `bnc_core=debug`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

/// The durable config document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDocument {
    #[serde(default)]
    pub networks: Vec<NetworkConfig>,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default = "default_backlog_limit")]
    pub backlog_limit: usize,
    #[serde(default)]
    pub log_options: LogOptions,
    #[serde(default = "default_store_timeout_secs")]
    pub store_timeout_secs: u64,
    /// WebSocket listen address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,
    /// SQLite database path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    /// PEM certificate chain; with `tls_key`, sessions are served as `wss://`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_cert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_key: Option<String>,
}

fn default_backlog_limit() -> usize {
    DEFAULT_BACKLOG_LIMIT
}

fn default_store_timeout_secs() -> u64 {
    DEFAULT_STORE_TIMEOUT_SECS
}

impl Default for ConfigDocument {
    fn default() -> Self {
        Self {
            networks: Vec::new(),
            channels: Vec::new(),
            backlog_limit: DEFAULT_BACKLOG_LIMIT,
            log_options: LogOptions::default(),
            store_timeout_secs: DEFAULT_STORE_TIMEOUT_SECS,
            listen: None,
            database: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

fn is_toml(path: &Path) -> bool {
    path.extension().is_some_and(|e| e.eq_ignore_ascii_case("toml"))
}

impl ConfigDocument {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text, is_toml(path))
    }

    pub fn parse(text: &str, toml: bool) -> Result<Self> {
        if toml {
            toml::from_str(text).map_err(|e| BncError::PersistenceFailure(e.to_string()))
        } else {
            serde_json::from_str(text).map_err(|e| BncError::PersistenceFailure(e.to_string()))
        }
    }

    fn render(&self, toml: bool) -> Result<String> {
        if toml {
            toml::to_string_pretty(self).map_err(|e| BncError::PersistenceFailure(e.to_string()))
        } else {
            serde_json::to_string_pretty(self)
                .map_err(|e| BncError::PersistenceFailure(e.to_string()))
        }
    }

    /// Write the document atomically: temp file in the same directory, then rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = self.render(is_toml(path))?;
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn network(&self, name: &str) -> Option<&NetworkConfig> {
        let name = fold(name);
        self.networks.iter().find(|n| fold(&n.name) == name)
    }
}

/// Durable sink for the channel list.
pub trait ConfigPersister: Send {
    /// Persist the full list. Must be all-or-nothing.
    fn persist(&mut self, channels: &[ChannelConfig]) -> Result<()>;
}

/// Rewrites the whole config document on every change.
pub struct FileConfigPersister {
    path: PathBuf,
    document: ConfigDocument,
}

impl FileConfigPersister {
    pub fn new(path: impl Into<PathBuf>, document: ConfigDocument) -> Self {
        Self { path: path.into(), document }
    }
}

impl ConfigPersister for FileConfigPersister {
    fn persist(&mut self, channels: &[ChannelConfig]) -> Result<()> {
        let mut next = self.document.clone();
        next.channels = channels.to_vec();
        next.save(&self.path)?;
        self.document = next;
        Ok(())
    }
}

/// Keeps persisted snapshots in memory. For tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryConfigPersister {
    inner: std::sync::Arc<parking_lot::Mutex<MemoryPersisterState>>,
}

#[derive(Debug, Default)]
struct MemoryPersisterState {
    writes: Vec<Vec<ChannelConfig>>,
    fail: bool,
}

impl MemoryConfigPersister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail.
    pub fn set_failing(&self, fail: bool) {
        self.inner.lock().fail = fail;
    }

    pub fn write_count(&self) -> usize {
        self.inner.lock().writes.len()
    }

    pub fn last_write(&self) -> Option<Vec<ChannelConfig>> {
        self.inner.lock().writes.last().cloned()
    }
}

impl ConfigPersister for MemoryConfigPersister {
    fn persist(&mut self, channels: &[ChannelConfig]) -> Result<()> {
        let mut state = self.inner.lock();
        if state.fail {
            return Err(BncError::PersistenceFailure("config write refused".into()));
        }
        state.writes.push(channels.to_vec());
        Ok(())
    }
}

/// Ordered, durable list of subscribed channels.
pub struct ConfigStore {
    channels: Vec<ChannelConfig>,
    persister: Box<dyn ConfigPersister>,
}

impl ConfigStore {
    /// Build from the loaded list. Duplicate ids keep their first entry and
    /// positions are renumbered densely in list order.
    pub fn new(channels: Vec<ChannelConfig>, persister: Box<dyn ConfigPersister>) -> Self {
        let mut unique: Vec<ChannelConfig> = Vec::with_capacity(channels.len());
        let mut sorted = channels;
        sorted.sort_by_key(|c| c.position);
        for ch in sorted {
            if unique.iter().any(|c| c.id == ch.id) {
                tracing::warn!(channel = %ch.id, "Dropping duplicate channel from config");
                continue;
            }
            unique.push(ch);
        }
        let mut store = Self { channels: unique, persister };
        store.renumber();
        store
    }

    pub fn channels(&self) -> &[ChannelConfig] {
        &self.channels
    }

    pub fn channel_ids(&self) -> impl Iterator<Item = &ChannelId> {
        self.channels.iter().map(|c| &c.id)
    }

    pub fn get(&self, id: &ChannelId) -> Option<&ChannelConfig> {
        self.channels.iter().find(|c| &c.id == id)
    }

    /// Channels belonging to one (folded) network, in list order.
    pub fn for_network<'a>(&'a self, network: &'a str) -> impl Iterator<Item = &'a ChannelConfig> {
        self.channels.iter().filter(move |c| c.id.network() == network)
    }

    fn position_of(&self, id: &ChannelId) -> Result<usize> {
        self.channels
            .iter()
            .position(|c| &c.id == id)
            .ok_or_else(|| BncError::ChannelNotFound(id.to_string()))
    }

    fn renumber(&mut self) {
        for (i, ch) in self.channels.iter_mut().enumerate() {
            ch.position = i;
        }
    }

    /// Renumber and persist; on failure restore `previous`.
    fn commit(&mut self, previous: Vec<ChannelConfig>) -> Result<()> {
        self.renumber();
        if let Err(e) = self.persister.persist(&self.channels) {
            tracing::error!(error = %e, "Config write failed, rolling back");
            self.channels = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Append a channel. Returns `false` (and persists nothing) if it is
    /// already present.
    pub fn join(
        &mut self,
        id: ChannelId,
        display_name: Option<String>,
        key: Option<String>,
    ) -> Result<bool> {
        if self.get(&id).is_some() {
            return Ok(false);
        }
        let previous = self.channels.clone();
        let display_name = display_name.unwrap_or_else(|| id.display_channel().to_string());
        self.channels.push(ChannelConfig {
            position: self.channels.len(),
            id,
            display_name,
            key,
        });
        self.commit(previous)?;
        Ok(true)
    }

    /// Remove a channel, returning its former entry.
    pub fn part(&mut self, id: &ChannelId) -> Result<ChannelConfig> {
        let idx = self.position_of(id)?;
        let previous = self.channels.clone();
        let removed = self.channels.remove(idx);
        self.commit(previous)?;
        Ok(removed)
    }

    pub fn rename(&mut self, id: &ChannelId, display_name: String) -> Result<()> {
        let idx = self.position_of(id)?;
        let previous = self.channels.clone();
        self.channels[idx].display_name = display_name;
        self.commit(previous)
    }

    /// Drag a channel to `pos`. Moving past its own slot lands it right after
    /// the neighbour it was dropped on; out-of-range targets clamp.
    pub fn move_channel(&mut self, id: &ChannelId, pos: i64) -> Result<()> {
        let from = self.position_of(id)?;
        let previous = self.channels.clone();
        let entry = self.channels.remove(from);
        let mut to = pos.max(0) as usize;
        if from < to {
            to -= 1;
        }
        let to = to.min(self.channels.len());
        self.channels.insert(to, entry);
        self.commit(previous)
    }
}
