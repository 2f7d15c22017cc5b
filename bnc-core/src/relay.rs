//! The relay coordinator.
//!
//! One task owns the backlog cache, the roster tracker, the config store and
//! the network registry. Everything that touches them arrives as a
//! [`RelayInput`] on a single queue:
//!
//! - upstream events, pushed by one forwarding task per network (so each
//!   network's order is preserved),
//! - session commands,
//! - completions of store reads that prime a channel's backlog.
//!
//! Live events are broadcast as soon as the cache and roster are updated.
//! Inserts go to a separate persistence worker and never hold up delivery;
//! store reads run on the blocking pool under a timeout.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::backlog::{Backlog, BacklogCache};
use crate::broadcast::{Broadcaster, SessionId};
use crate::config::{ConfigStore, DEFAULT_STORE_TIMEOUT_SECS};
use crate::error::{BncError, Result};
use crate::event::{ChannelEventKind, Event, GlobalEventKind};
use crate::identity::{canonicalize, fold, ChannelId};
use crate::normalize::normalize;
use crate::protocol::{Inbound, Outbound};
use crate::roster::RosterTracker;
use crate::store::{EventQuery, EventStore, RecordType};
use crate::supervisor::{ConnectionState, NetworkRegistry};
use crate::upstream::UpstreamEvent;

/// Input queue depth.
const INPUT_QUEUE_DEPTH: usize = 1024;

/// Inserts waiting for the store before new ones are dropped.
pub const DEFAULT_PERSIST_QUEUE_DEPTH: usize = 4096;

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub backlog_limit: usize,
    pub store_timeout: Duration,
    pub persist_queue: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            backlog_limit: crate::config::DEFAULT_BACKLOG_LIMIT,
            store_timeout: Duration::from_secs(DEFAULT_STORE_TIMEOUT_SECS),
            persist_queue: DEFAULT_PERSIST_QUEUE_DEPTH,
        }
    }
}

/// Everything the coordinator reacts to.
#[derive(Debug)]
pub enum RelayInput {
    Upstream {
        network: String,
        event: UpstreamEvent,
        received: DateTime<Utc>,
    },
    Command {
        session: SessionId,
        command: Inbound,
    },
    /// A priming read finished.
    Primed {
        channel: ChannelId,
        result: Result<Vec<Event>>,
    },
    Status(oneshot::Sender<RelayStatus>),
    Shutdown,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    pub state: ConnectionState,
    pub nick: String,
}

/// Snapshot for health checks.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatus {
    pub networks: BTreeMap<String, NetworkStatus>,
    pub channels: usize,
    pub sessions: usize,
}

/// Cloneable front door used by session transports.
#[derive(Clone)]
pub struct RelayHandle {
    tx: mpsc::Sender<RelayInput>,
    broadcaster: Arc<Broadcaster>,
}

impl RelayHandle {
    pub fn attach(&self) -> (SessionId, mpsc::Receiver<Outbound>) {
        self.broadcaster.attach()
    }

    pub fn detach(&self, session: SessionId) {
        self.broadcaster.detach(session);
    }

    pub async fn submit(&self, session: SessionId, command: Inbound) {
        if self.tx.send(RelayInput::Command { session, command }).await.is_err() {
            tracing::warn!(session = %session, "Relay stopped, dropping command");
        }
    }

    /// Parse one text frame and submit it. Malformed frames get a scoped
    /// `bncWarn` and go no further.
    pub async fn submit_frame(&self, session: SessionId, frame: &str) {
        match Inbound::parse(frame) {
            Ok(command) => self.submit(session, command).await,
            Err(e) => {
                tracing::debug!(session = %session, error = %e, "Malformed frame");
                self.broadcaster.publish_scoped(
                    session,
                    Outbound::BncWarn {
                        warn: format!("malformed frame: {e}"),
                        location: "frame".into(),
                    },
                );
            }
        }
    }

    pub async fn status(&self) -> Option<RelayStatus> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(RelayInput::Status(tx)).await.ok()?;
        rx.await.ok()
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(RelayInput::Shutdown).await;
    }
}

/// Start the coordinator, one forwarder per upstream stream, and the
/// persistence worker. Must be called inside a tokio runtime.
pub fn start(
    settings: RelaySettings,
    config: ConfigStore,
    networks: NetworkRegistry,
    streams: Vec<(String, mpsc::Receiver<UpstreamEvent>)>,
    store: Arc<dyn EventStore>,
    broadcaster: Arc<Broadcaster>,
) -> (RelayHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(INPUT_QUEUE_DEPTH);

    for (network, events) in streams {
        tokio::spawn(forward_upstream(network, events, tx.clone()));
    }

    let (persist_tx, persist_rx) = mpsc::channel(settings.persist_queue.max(1));
    tokio::spawn(persistence_worker(persist_rx, store.clone(), broadcaster.clone()));

    let relay = Relay {
        backlog: BacklogCache::new(settings.backlog_limit),
        roster: RosterTracker::new(),
        config,
        networks,
        broadcaster: broadcaster.clone(),
        store,
        persist_tx,
        persist_full: false,
        inputs: tx.clone(),
        store_timeout: settings.store_timeout,
        priming: HashSet::new(),
        waiting: HashMap::new(),
    };
    let task = tokio::spawn(relay.run(rx));
    (RelayHandle { tx, broadcaster }, task)
}

/// Drain one network's stream into the coordinator queue.
async fn forward_upstream(
    network: String,
    mut events: mpsc::Receiver<UpstreamEvent>,
    tx: mpsc::Sender<RelayInput>,
) {
    while let Some(event) = events.recv().await {
        let input = RelayInput::Upstream {
            network: network.clone(),
            event,
            received: crate::event::now(),
        };
        if tx.send(input).await.is_err() {
            break;
        }
    }
    tracing::debug!(network = %network, "Upstream stream ended");
}

/// Insert events in arrival order. Failures are reported, never retried.
async fn persistence_worker(
    mut rx: mpsc::Receiver<Event>,
    store: Arc<dyn EventStore>,
    broadcaster: Arc<Broadcaster>,
) {
    while let Some(event) = rx.recv().await {
        let store = store.clone();
        let result = tokio::task::spawn_blocking(move || store.insert(&event))
            .await
            .unwrap_or_else(|e| {
                Err(BncError::PersistenceFailure(format!("insert task failed: {e}")))
            });
        if let Err(e) = result {
            tracing::error!(error = %e, "Failed to persist event");
            broadcaster.publish(Outbound::from_error(&e, "persist"));
        }
    }
}

/// Run a store query on the blocking pool, bounded by `timeout`.
async fn query_store(
    store: Arc<dyn EventStore>,
    query: EventQuery,
    timeout: Duration,
) -> Result<Vec<Event>> {
    let task = tokio::task::spawn_blocking(move || store.query(&query));
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(BncError::PersistenceFailure(format!("store task failed: {e}"))),
        Err(_) => Err(BncError::PersistenceFailure(format!(
            "store query timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}

/// A session waiting for a channel to finish priming.
#[derive(Debug, Clone, Copy)]
struct Waiter {
    session: SessionId,
    limit: Option<usize>,
}

struct Relay {
    backlog: BacklogCache,
    roster: RosterTracker,
    config: ConfigStore,
    networks: NetworkRegistry,
    broadcaster: Arc<Broadcaster>,
    store: Arc<dyn EventStore>,
    persist_tx: mpsc::Sender<Event>,
    /// Set while inserts are being dropped; cleared by the next accepted one.
    persist_full: bool,
    inputs: mpsc::Sender<RelayInput>,
    store_timeout: Duration,
    /// Channels with a priming read in flight.
    priming: HashSet<ChannelId>,
    waiting: HashMap<ChannelId, Vec<Waiter>>,
}

impl Relay {
    async fn run(mut self, mut rx: mpsc::Receiver<RelayInput>) {
        let configured: Vec<ChannelId> = self.config.channel_ids().cloned().collect();
        tracing::info!(
            networks = self.networks.len(),
            channels = configured.len(),
            "Relay started"
        );
        for id in configured {
            self.start_priming(id);
        }

        while let Some(input) = rx.recv().await {
            match input {
                RelayInput::Upstream { network, event, received } => {
                    self.on_upstream(&network, event, received)
                }
                RelayInput::Command { session, command } => {
                    let location = command.name();
                    if let Err(e) = self.on_command(session, command) {
                        if e.is_warning() {
                            tracing::debug!(
                                session = %session, error = %e, location, "Command rejected"
                            );
                        } else {
                            tracing::warn!(
                                session = %session, error = %e, location, "Command failed"
                            );
                        }
                        let error = Outbound::from_error(&e, location);
                        self.broadcaster.publish_scoped(session, error);
                    }
                }
                RelayInput::Primed { channel, result } => self.on_primed(channel, result),
                RelayInput::Status(reply) => {
                    let _ = reply.send(self.status());
                }
                RelayInput::Shutdown => break,
            }
        }
        tracing::info!("Relay stopped");
    }

    fn status(&self) -> RelayStatus {
        let nicks = self.networks.nicks();
        let networks = self
            .networks
            .states()
            .into_iter()
            .map(|(name, state)| {
                let nick = nicks.get(&name).cloned().unwrap_or_default();
                (name, NetworkStatus { state, nick })
            })
            .collect();
        RelayStatus {
            networks,
            channels: self.config.channels().len(),
            sessions: self.broadcaster.session_count(),
        }
    }

    // ── Upstream ────────────────────────────────────────────────────────

    fn on_upstream(&mut self, network: &str, event: UpstreamEvent, received: DateTime<Utc>) {
        let network = fold(network);
        let own_nick = match self.networks.get(&network) {
            Ok(sup) => sup.nick().to_string(),
            Err(_) => {
                tracing::warn!(network = %network, "Event from unregistered network");
                return;
            }
        };
        let canonical = normalize(&network, &event, received);

        // Roster first, with the nick we had when the event was sent.
        let affected = self.roster_affected(&canonical);
        self.roster.apply(&canonical, &own_nick);

        let mut nicks_changed = false;
        if let Ok(sup) = self.networks.get_mut(&network) {
            match &event {
                UpstreamEvent::Registered { nick } => {
                    sup.on_registered(nick, self.config.channels());
                    nicks_changed = true;
                }
                UpstreamEvent::NickChange { old_nick, new_nick }
                    if fold(old_nick) == fold(sup.nick()) =>
                {
                    tracing::info!(network = %network, nick = %new_nick, "Own nick changed");
                    sup.set_nick(new_nick);
                    nicks_changed = true;
                }
                UpstreamEvent::Disconnected { reason } => {
                    tracing::warn!(network = %network, reason = %reason, "Upstream disconnected");
                    sup.on_disconnected();
                }
                UpstreamEvent::Error { message } => {
                    tracing::warn!(network = %network, message = %message, "Upstream error");
                }
                _ => {}
            }
        }

        self.ingest(canonical);

        if let Some(channels) = affected {
            let nick_lists = channels
                .into_iter()
                .map(|id| {
                    let nicks = self.roster.get_nick_list(&id).unwrap_or_default();
                    (id.to_string(), nicks)
                })
                .collect();
            self.broadcaster.publish(Outbound::NickLists { nick_lists });
        }
        if nicks_changed {
            self.broadcaster.publish(Outbound::Nicks { nicks: self.networks.nicks() });
        }
    }

    /// Channels whose roster an event may change, captured before applying it.
    fn roster_affected(&self, event: &Event) -> Option<Vec<ChannelId>> {
        match event {
            Event::ChannelEvent { kind, channel_id, .. } => match kind {
                ChannelEventKind::Join
                | ChannelEventKind::Part
                | ChannelEventKind::Kick
                | ChannelEventKind::Names => Some(vec![channel_id.clone()]),
                _ => None,
            },
            Event::GlobalEvent { kind, network, .. } => match kind {
                GlobalEventKind::Quit
                | GlobalEventKind::Kill
                | GlobalEventKind::NickChange
                | GlobalEventKind::Disconnected => {
                    let channels = self.roster.channels_on(network);
                    (!channels.is_empty()).then_some(channels)
                }
                _ => None,
            },
            Event::Message { .. } => None,
        }
    }

    /// Cache, persist and broadcast one canonical event.
    fn ingest(&mut self, event: Event) {
        if should_persist(&event) {
            self.persist(event.clone());
        }
        if let Some(channel) = event.channel_id() {
            if !is_names(&event) {
                let channel = channel.clone();
                self.backlog.append_entry(&channel, event.clone());
            }
        }
        self.broadcaster.publish(Outbound::live(event));
    }

    /// Queue an insert without waiting. A store that falls behind costs
    /// history, never delivery; one `bncErr` is raised per stretch of drops.
    fn persist(&mut self, event: Event) {
        match self.persist_tx.try_send(event) {
            Ok(()) => self.persist_full = false,
            Err(mpsc::error::TrySendError::Full(_)) => {
                if !self.persist_full {
                    self.persist_full = true;
                    let e = BncError::PersistenceFailure(
                        "store is not keeping up, dropping inserts".into(),
                    );
                    tracing::error!(error = %e, "Persistence queue full");
                    self.broadcaster.publish(Outbound::from_error(&e, "persist"));
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::error!("Persistence worker gone, event not stored");
            }
        }
    }

    // ── Priming ─────────────────────────────────────────────────────────

    fn start_priming(&mut self, channel: ChannelId) {
        if self.backlog.is_primed(&channel) || !self.priming.insert(channel.clone()) {
            return;
        }
        let store = self.store.clone();
        let query = EventQuery::channel(&channel, self.backlog.limit());
        let timeout = self.store_timeout;
        let inputs = self.inputs.clone();
        tokio::spawn(async move {
            let result = query_store(store, query, timeout).await;
            let _ = inputs.send(RelayInput::Primed { channel, result }).await;
        });
    }

    fn on_primed(&mut self, channel: ChannelId, result: Result<Vec<Event>>) {
        if !self.priming.remove(&channel) {
            // Parted while the read was in flight.
            tracing::debug!(channel = %channel, "Discarding priming result");
            return;
        }
        let waiters = self.waiting.remove(&channel).unwrap_or_default();
        match result {
            Ok(events) => {
                tracing::debug!(channel = %channel, rows = events.len(), "Backlog primed");
                self.backlog.prime(&channel, events);
                self.broadcaster.publish(Outbound::BacklogAvailable {
                    channel_id: channel.to_string(),
                });
                for waiter in waiters {
                    self.send_channel_state(waiter.session, &channel, waiter.limit);
                }
            }
            Err(e) => {
                // Left unprimed; the next request retries.
                tracing::error!(channel = %channel, error = %e, "Failed to prime backlog");
                let frame = Outbound::from_error(&e, "getChannelState");
                if waiters.is_empty() {
                    self.broadcaster.publish(frame);
                } else {
                    for waiter in waiters {
                        self.broadcaster.publish_scoped(waiter.session, frame.clone());
                    }
                }
            }
        }
    }

    fn send_channel_state(&self, session: SessionId, channel: &ChannelId, limit: Option<usize>) {
        if let Backlog::Ready(messages) = self.backlog.get_backlog(channel, limit) {
            self.broadcaster.publish_scoped(session, Outbound::Messages { messages });
        }
        if let Ok(nicks) = self.roster.get_nick_list(channel) {
            let nick_lists = BTreeMap::from([(channel.to_string(), nicks)]);
            self.broadcaster.publish_scoped(session, Outbound::NickLists { nick_lists });
        }
    }

    // ── Session commands ────────────────────────────────────────────────

    fn on_command(&mut self, session: SessionId, command: Inbound) -> Result<()> {
        match command {
            Inbound::GetState { backlog_limit } => {
                self.send_state(session, backlog_limit);
                Ok(())
            }
            Inbound::GetChannelState { channel_id, backlog_limit } => {
                let channel = canonicalize(&channel_id)?.id;
                if self.backlog.is_primed(&channel) {
                    self.send_channel_state(session, &channel, backlog_limit);
                } else {
                    // Cold: answer once the store read lands.
                    self.waiting
                        .entry(channel.clone())
                        .or_default()
                        .push(Waiter { session, limit: backlog_limit });
                    self.start_priming(channel);
                }
                Ok(())
            }
            Inbound::Search { channel_id, nick, text, backlog_limit } => {
                self.search(session, channel_id, nick, text, backlog_limit)
            }
            Inbound::Join { channel_id, display_name } => self.join(&channel_id, display_name),
            Inbound::Part { channel_id } => self.part(&channel_id),
            Inbound::RenameChannel { channel_id, display_name } => {
                let channel = canonicalize(&channel_id)?.id;
                self.config.rename(&channel, display_name)?;
                self.publish_channels();
                Ok(())
            }
            Inbound::MoveChannel { channel_id, pos } => {
                let channel = canonicalize(&channel_id)?.id;
                self.config.move_channel(&channel, pos)?;
                self.publish_channels();
                Ok(())
            }
            Inbound::Message { channel_id, text } => self.send_message(&channel_id, text),
            Inbound::ClientBroadcast { payload } => {
                self.broadcaster.publish(Outbound::ClientBroadcast { payload });
                Ok(())
            }
            Inbound::Raw { network, bytes } => {
                let sent = self.networks.get(&network)?.send_raw(bytes.as_bytes());
                self.report_upstream(&network, sent)
            }
        }
    }

    fn send_state(&self, session: SessionId, limit: Option<usize>) {
        let scoped = |msg| self.broadcaster.publish_scoped(session, msg);
        scoped(Outbound::Channels { channels: self.config.channels().to_vec() });
        scoped(Outbound::Nicks { nicks: self.networks.nicks() });
        let nick_lists = self
            .roster
            .nick_lists()
            .into_iter()
            .map(|(id, nicks)| (id.to_string(), nicks))
            .collect();
        scoped(Outbound::NickLists { nick_lists });
        let messages = self.backlog.get_all_state(self.config.channel_ids(), limit);
        scoped(Outbound::Messages { messages });
    }

    fn search(
        &self,
        session: SessionId,
        channel_id: Option<String>,
        nick: Option<String>,
        text: Option<String>,
        limit: Option<usize>,
    ) -> Result<()> {
        let mut query = EventQuery {
            record: Some(RecordType::Message),
            nick,
            text,
            limit: Some(limit.filter(|l| *l > 0).unwrap_or(self.backlog.limit())),
            ..EventQuery::default()
        };
        if let Some(raw) = channel_id {
            let channel = canonicalize(&raw)?.id;
            query.network = Some(channel.network().to_string());
            query.channel = Some(channel.channel().to_string());
        }
        let store = self.store.clone();
        let broadcaster = self.broadcaster.clone();
        let timeout = self.store_timeout;
        tokio::spawn(async move {
            let frame = match query_store(store, query, timeout).await {
                Ok(messages) => Outbound::Messages { messages },
                Err(e) => {
                    tracing::error!(session = %session, error = %e, "Search failed");
                    Outbound::from_error(&e, "search")
                }
            };
            broadcaster.publish_scoped(session, frame);
        });
        Ok(())
    }

    fn join(&mut self, raw: &str, display_name: Option<String>) -> Result<()> {
        let reference = canonicalize(raw)?;
        let channel = reference.id;
        let registered =
            self.networks.get(channel.network())?.state() == ConnectionState::Registered;
        if !self.config.join(channel.clone(), display_name, reference.key.clone())? {
            tracing::debug!(channel = %channel, "Already joined");
            return Ok(());
        }
        tracing::info!(channel = %channel, "Joined channel");
        self.publish_channels();
        // Not registered yet: autojoin picks it up.
        if registered {
            let sent = self
                .networks
                .get(channel.network())?
                .join(&channel, reference.key.as_deref());
            self.report_upstream(channel.network(), sent)?;
        }
        self.start_priming(channel);
        Ok(())
    }

    fn part(&mut self, raw: &str) -> Result<()> {
        let channel = canonicalize(raw)?.id;
        self.config.part(&channel)?;
        tracing::info!(channel = %channel, "Parted channel");
        self.publish_channels();
        self.backlog.forget(&channel);
        self.priming.remove(&channel);
        self.waiting.remove(&channel);
        let sent = match self.networks.get(channel.network()) {
            Ok(sup) if sup.state() == ConnectionState::Registered => sup.part(&channel),
            _ => Ok(()),
        };
        self.report_upstream(channel.network(), sent)
    }

    /// Send upstream and record our own line; upstream does not echo it.
    fn send_message(&mut self, raw: &str, text: String) -> Result<()> {
        let channel = canonicalize(raw)?.id;
        let sup = self.networks.get(channel.network())?;
        let sent = sup.send_message(&channel, &text);
        let nick = sup.nick().to_string();
        self.report_upstream(channel.network(), sent)?;
        let event = Event::Message {
            nick,
            text,
            timestamp: crate::event::now(),
            channel_id: channel,
        };
        self.ingest(event);
        Ok(())
    }

    /// A command the upstream could not take is also a network error event.
    fn report_upstream(&mut self, network: &str, sent: Result<()>) -> Result<()> {
        if let Err(BncError::UpstreamProtocolError(message)) = &sent {
            self.ingest(Event::GlobalEvent {
                kind: GlobalEventKind::Error,
                nick: None,
                argument: Some(message.clone()),
                timestamp: crate::event::now(),
                network: fold(network),
            });
        }
        sent
    }

    fn publish_channels(&self) {
        self.broadcaster.publish(Outbound::Channels { channels: self.config.channels().to_vec() });
    }
}

fn is_names(event: &Event) -> bool {
    matches!(event, Event::ChannelEvent { kind: ChannelEventKind::Names, .. })
}

/// NAMES replies and raw lines are roster/debug traffic, not history.
fn should_persist(event: &Event) -> bool {
    !is_names(event) && !matches!(event, Event::GlobalEvent { kind: GlobalEventKind::Raw, .. })
}
