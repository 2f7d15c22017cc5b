//! End-to-end relay tests against the in-memory store and a recording
//! upstream handle.
//!
//! Tests cover:
//! - Autojoin on registration, scoped to the registering network
//! - Backlog bounds and cold channel state
//! - Store search filters
//! - Roster updates from membership events
//! - Self-sent messages: fan-out, nick, single durable write
//! - Config Store commands through the session protocol
//! - Store failures and stalls never holding up live delivery
//! - Parting a channel while its backlog is still loading

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bnc_core::broadcast::{Broadcaster, SessionId};
use bnc_core::config::{ChannelConfig, ConfigStore, MemoryConfigPersister, NetworkConfig};
use bnc_core::event::Event;
use bnc_core::identity::ChannelId;
use bnc_core::protocol::{Inbound, Outbound};
use bnc_core::relay::{self, RelayHandle, RelaySettings};
use bnc_core::store::{EventStore, MemoryStore};
use bnc_core::supervisor::{NetworkRegistry, NetworkSupervisor};
use bnc_core::upstream::{UpstreamEvent, UpstreamHandle};
use chrono::DateTime;
use parking_lot::Mutex;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Sent {
    Join(String, Option<String>),
    Part(String),
    Say(String, String),
    Raw(Vec<u8>),
}

#[derive(Default)]
struct Recorder {
    sent: Mutex<Vec<Sent>>,
}

impl Recorder {
    fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }
}

impl UpstreamHandle for Recorder {
    fn join(&self, channel: &str, key: Option<&str>) -> bnc_core::Result<()> {
        self.sent.lock().push(Sent::Join(channel.into(), key.map(str::to_string)));
        Ok(())
    }
    fn part(&self, channel: &str) -> bnc_core::Result<()> {
        self.sent.lock().push(Sent::Part(channel.into()));
        Ok(())
    }
    fn say(&self, target: &str, text: &str) -> bnc_core::Result<()> {
        self.sent.lock().push(Sent::Say(target.into(), text.into()));
        Ok(())
    }
    fn send_raw(&self, bytes: &[u8]) -> bnc_core::Result<()> {
        self.sent.lock().push(Sent::Raw(bytes.to_vec()));
        Ok(())
    }
}

struct Harness {
    relay: RelayHandle,
    upstream: HashMap<String, mpsc::Sender<UpstreamEvent>>,
    recorders: HashMap<String, Arc<Recorder>>,
    store: Arc<MemoryStore>,
    persister: MemoryConfigPersister,
}

impl Harness {
    async fn emit(&self, network: &str, event: UpstreamEvent) {
        self.upstream[network].send(event).await.unwrap();
    }

    fn recorder(&self, network: &str) -> &Recorder {
        &self.recorders[network]
    }
}

fn network(name: &str) -> NetworkConfig {
    NetworkConfig {
        name: name.into(),
        host: format!("irc.{name}.example:6697"),
        nick: "me".into(),
        user: None,
        realname: None,
        tls: true,
        tls_insecure: false,
    }
}

fn start(
    networks: &[&str],
    channels: &[&str],
    backlog_limit: usize,
    store: MemoryStore,
) -> Harness {
    let settings = RelaySettings {
        backlog_limit,
        store_timeout: Duration::from_secs(2),
        ..RelaySettings::default()
    };
    start_with(networks, channels, settings, store)
}

fn start_with(
    networks: &[&str],
    channels: &[&str],
    settings: RelaySettings,
    store: MemoryStore,
) -> Harness {
    let mut registry = NetworkRegistry::new();
    let mut upstream = HashMap::new();
    let mut recorders = HashMap::new();
    let mut streams = Vec::new();
    for name in networks {
        let recorder = Arc::new(Recorder::default());
        registry.insert(NetworkSupervisor::new(network(name), recorder.clone()));
        let (tx, rx) = mpsc::channel(64);
        upstream.insert(name.to_string(), tx);
        recorders.insert(name.to_string(), recorder);
        streams.push((name.to_string(), rx));
    }

    let configs = channels
        .iter()
        .enumerate()
        .map(|(i, raw)| ChannelConfig {
            id: raw.parse().unwrap(),
            display_name: raw.to_string(),
            position: i,
            key: None,
        })
        .collect();
    let persister = MemoryConfigPersister::new();
    let config = ConfigStore::new(configs, Box::new(persister.clone()));

    let store = Arc::new(store);
    let (relay, _task) = relay::start(
        settings,
        config,
        registry,
        streams,
        store.clone() as Arc<dyn EventStore>,
        Arc::new(Broadcaster::default()),
    );
    Harness { relay, upstream, recorders, store, persister }
}

/// Receive frames until one matches, failing after two seconds.
async fn wait_for(
    rx: &mut mpsc::Receiver<Outbound>,
    mut pred: impl FnMut(&Outbound) -> bool,
) -> Outbound {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let frame = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("session closed");
        if pred(&frame) {
            return frame;
        }
    }
}

fn message_texts(frame: &Outbound) -> Vec<String> {
    match frame {
        Outbound::Messages { messages } => messages
            .iter()
            .filter_map(|e| match e {
                Event::Message { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect(),
        other => panic!("expected messages, got {other:?}"),
    }
}

fn channel_order(frame: &Outbound) -> Vec<String> {
    match frame {
        Outbound::Channels { channels } => channels.iter().map(|c| c.id.key()).collect(),
        other => panic!("expected channels, got {other:?}"),
    }
}

fn privmsg(from: &str, target: &str, text: &str) -> UpstreamEvent {
    UpstreamEvent::Message { from: from.into(), target: target.into(), text: text.into() }
}

async fn register(h: &Harness, session: &mut mpsc::Receiver<Outbound>, network: &str) {
    h.emit(network, UpstreamEvent::Registered { nick: "me".into() }).await;
    wait_for(session, |f| matches!(f, Outbound::Nicks { .. })).await;
}

async fn get_state(h: &Harness, id: SessionId, rx: &mut mpsc::Receiver<Outbound>) -> Vec<String> {
    h.relay.submit(id, Inbound::GetState { backlog_limit: None }).await;
    let frame = wait_for(rx, |f| matches!(f, Outbound::Channels { .. })).await;
    channel_order(&frame)
}

#[tokio::test]
async fn registered_autojoins_only_that_network() {
    let h = start(
        &["freenode", "oftc"],
        &["freenode:#test", "oftc:#debian"],
        10,
        MemoryStore::new(),
    );
    let (_, mut rx) = h.relay.attach();
    register(&h, &mut rx, "freenode").await;

    assert_eq!(h.recorder("freenode").sent(), vec![Sent::Join("#test".into(), None)]);
    assert!(h.recorder("oftc").sent().is_empty());
}

#[tokio::test]
async fn backlog_keeps_most_recent_entries() {
    let h = start(&["freenode"], &["freenode:#test"], 3, MemoryStore::new());
    let (id, mut rx) = h.relay.attach();
    for n in 1..=5 {
        h.emit("freenode", privmsg("alice", "#test", &format!("message {n}"))).await;
        wait_for(&mut rx, |f| matches!(f, Outbound::Messages { .. })).await;
    }

    h.relay
        .submit(
            id,
            Inbound::GetChannelState { channel_id: "freenode:#TEST".into(), backlog_limit: None },
        )
        .await;
    let frame = wait_for(&mut rx, |f| matches!(f, Outbound::Messages { .. })).await;
    assert_eq!(message_texts(&frame), vec!["message 3", "message 4", "message 5"]);
}

#[tokio::test]
async fn search_filters_persisted_messages() {
    let at = |ms: i64| DateTime::from_timestamp_millis(1_700_000_000_000 + ms).unwrap();
    let msg = |nick: &str, chan: &str, text: &str, ms: i64| Event::Message {
        nick: nick.into(),
        text: text.into(),
        timestamp: at(ms),
        channel_id: ChannelId::new("freenode", chan),
    };
    let store = MemoryStore::with_events(vec![
        msg("alice", "#test", "second", 2),
        msg("bob", "#test", "not alice", 3),
        msg("alice", "#test", "first", 1),
        msg("alice", "#other", "wrong channel", 4),
        Event::ChannelEvent {
            kind: bnc_core::event::ChannelEventKind::Join,
            nick: Some("alice".into()),
            argument: None,
            timestamp: at(0),
            channel_id: ChannelId::new("freenode", "#test"),
        },
    ]);
    let h = start(&["freenode"], &["freenode:#test"], 10, store);
    let (id, mut rx) = h.relay.attach();

    h.relay
        .submit(
            id,
            Inbound::Search {
                channel_id: Some("freenode:#test".into()),
                nick: Some("alice".into()),
                text: None,
                backlog_limit: None,
            },
        )
        .await;
    let frame = wait_for(&mut rx, |f| matches!(f, Outbound::Messages { .. })).await;
    let Outbound::Messages { messages } = &frame else { unreachable!() };
    assert!(messages.iter().all(Event::is_message));
    assert_eq!(message_texts(&frame), vec!["first", "second"]);
}

#[tokio::test]
async fn part_removes_nick_from_roster() {
    let h = start(&["freenode"], &["freenode:#test"], 10, MemoryStore::new());
    let (_, mut rx) = h.relay.attach();
    register(&h, &mut rx, "freenode").await;

    let join = |nick: &str| UpstreamEvent::Join { channel: "#test".into(), nick: nick.into() };
    h.emit("freenode", join("me")).await;
    h.emit("freenode", join("bob")).await;
    h.emit(
        "freenode",
        UpstreamEvent::Part { channel: "#test".into(), nick: "bob".into(), reason: None },
    )
    .await;

    let mut lists = Vec::new();
    while lists.len() < 3 {
        if let Outbound::NickLists { nick_lists } =
            wait_for(&mut rx, |f| matches!(f, Outbound::NickLists { .. })).await
        {
            lists.push(nick_lists);
        }
    }
    assert_eq!(lists[1]["freenode:#test"], vec!["bob", "me"]);
    assert_eq!(lists[2]["freenode:#test"], vec!["me"]);
}

#[tokio::test]
async fn own_message_reaches_every_session_and_is_stored_once() {
    let h = start(&["freenode"], &["freenode:#test"], 10, MemoryStore::new());
    let (a, mut rx_a) = h.relay.attach();
    let (_, mut rx_b) = h.relay.attach();
    register(&h, &mut rx_a, "freenode").await;

    h.relay
        .submit(a, Inbound::Message { channel_id: "freenode:#test".into(), text: "hi".into() })
        .await;

    for rx in [&mut rx_a, &mut rx_b] {
        let frame = wait_for(rx, |f| matches!(f, Outbound::Messages { .. })).await;
        let Outbound::Messages { messages } = frame else { unreachable!() };
        assert_eq!(messages.len(), 1);
        assert!(matches!(
            &messages[0],
            Event::Message { nick, text, .. } if nick == "me" && text == "hi"
        ));
    }
    assert_eq!(h.recorder("freenode").sent().last(), Some(&Sent::Say("#test".into(), "hi".into())));

    // The persistence worker runs behind the broadcast.
    let stored = || h.store.events().into_iter().filter(Event::is_message).count();
    for _ in 0..50 {
        if stored() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(stored(), 1);
}

#[tokio::test]
async fn join_is_idempotent_and_new_channels_persist() {
    let h = start(&["freenode"], &["freenode:#test"], 10, MemoryStore::new());
    let (id, mut rx) = h.relay.attach();
    register(&h, &mut rx, "freenode").await;

    h.relay
        .submit(id, Inbound::Join { channel_id: "FreeNode:#Test".into(), display_name: None })
        .await;
    assert_eq!(get_state(&h, id, &mut rx).await, vec!["freenode:#test"]);
    assert_eq!(h.persister.write_count(), 0);

    h.relay
        .submit(
            id,
            Inbound::Join { channel_id: "freenode:#rust hunter2".into(), display_name: None },
        )
        .await;
    let frame = wait_for(&mut rx, |f| matches!(f, Outbound::Channels { .. })).await;
    assert_eq!(channel_order(&frame), vec!["freenode:#test", "freenode:#rust"]);
    assert_eq!(h.persister.write_count(), 1);
    assert!(h
        .recorder("freenode")
        .sent()
        .contains(&Sent::Join("#rust".into(), Some("hunter2".into()))));
}

#[tokio::test]
async fn move_clamps_and_renumbers() {
    let h = start(&["n"], &["n:#a", "n:#b", "n:#c"], 10, MemoryStore::new());
    let (id, mut rx) = h.relay.attach();

    h.relay.submit(id, Inbound::MoveChannel { channel_id: "n:#a".into(), pos: 99 }).await;
    let frame = wait_for(&mut rx, |f| matches!(f, Outbound::Channels { .. })).await;
    assert_eq!(channel_order(&frame), vec!["n:#b", "n:#c", "n:#a"]);
    let Outbound::Channels { channels } = frame else { unreachable!() };
    let positions: Vec<_> = channels.iter().map(|c| c.position).collect();
    assert_eq!(positions, vec![0, 1, 2]);
}

#[tokio::test]
async fn lookup_failures_are_scoped_warnings() {
    let h = start(&["freenode"], &["freenode:#test"], 10, MemoryStore::new());
    let (id, mut rx) = h.relay.attach();
    let (_, mut other) = h.relay.attach();

    h.relay.submit(id, Inbound::Part { channel_id: "freenode:#nowhere".into() }).await;
    let frame = wait_for(&mut rx, |f| matches!(f, Outbound::BncWarn { .. })).await;
    assert!(matches!(frame, Outbound::BncWarn { ref location, .. } if location == "part"));

    h.relay.submit(id, Inbound::Raw { network: "efnet".into(), bytes: "PING x".into() }).await;
    let frame = wait_for(&mut rx, |f| matches!(f, Outbound::BncWarn { .. })).await;
    assert!(matches!(frame, Outbound::BncWarn { ref location, .. } if location == "raw"));

    h.relay.submit_frame(id, "{not json").await;
    let frame = wait_for(&mut rx, |f| matches!(f, Outbound::BncWarn { .. })).await;
    assert!(matches!(frame, Outbound::BncWarn { ref location, .. } if location == "frame"));

    assert!(!matches!(other.try_recv(), Ok(Outbound::BncWarn { .. })));
}

#[tokio::test]
async fn failed_config_write_rolls_back() {
    let h = start(&["freenode"], &["freenode:#test"], 10, MemoryStore::new());
    let (id, mut rx) = h.relay.attach();
    h.persister.set_failing(true);

    h.relay
        .submit(
            id,
            Inbound::RenameChannel {
                channel_id: "freenode:#test".into(),
                display_name: "x".into(),
            },
        )
        .await;
    let frame = wait_for(&mut rx, |f| matches!(f, Outbound::BncErr { .. })).await;
    assert!(matches!(frame, Outbound::BncErr { ref location, .. } if location == "renameChannel"));

    h.relay.submit(id, Inbound::GetState { backlog_limit: None }).await;
    let frame = wait_for(&mut rx, |f| matches!(f, Outbound::Channels { .. })).await;
    let Outbound::Channels { channels } = frame else { unreachable!() };
    assert_eq!(channels[0].display_name, "freenode:#test");
}

#[tokio::test]
async fn cold_channel_state_reports_store_failure() {
    let store = MemoryStore::new();
    store.set_fail_reads(true);
    let h = start(&["freenode"], &[], 10, store);
    let (id, mut rx) = h.relay.attach();

    h.relay
        .submit(
            id,
            Inbound::GetChannelState { channel_id: "freenode:#cold".into(), backlog_limit: None },
        )
        .await;
    let frame = wait_for(&mut rx, |f| matches!(f, Outbound::BncErr { .. })).await;
    assert!(matches!(
        frame,
        Outbound::BncErr { ref location, .. } if location == "getChannelState"
    ));
}

#[tokio::test]
async fn persisted_history_primes_the_backlog() {
    let history = (1..=4)
        .map(|n| Event::Message {
            nick: "alice".into(),
            text: format!("old {n}"),
            timestamp: DateTime::from_timestamp_millis(n).unwrap(),
            channel_id: ChannelId::new("freenode", "#test"),
        })
        .collect();
    let h = start(&["freenode"], &["freenode:#test"], 3, MemoryStore::with_events(history));
    let (id, mut rx) = h.relay.attach();

    h.relay
        .submit(
            id,
            Inbound::GetChannelState {
                channel_id: "freenode:#test".into(),
                backlog_limit: Some(2),
            },
        )
        .await;
    let frame = wait_for(&mut rx, |f| matches!(f, Outbound::Messages { .. })).await;
    assert_eq!(message_texts(&frame), vec!["old 3", "old 4"]);
}

#[tokio::test]
async fn own_nick_change_updates_nicks() {
    let h = start(&["freenode"], &[], 10, MemoryStore::new());
    let (_, mut rx) = h.relay.attach();
    register(&h, &mut rx, "freenode").await;

    h.emit("freenode", UpstreamEvent::NickChange { old_nick: "ME".into(), new_nick: "me_".into() })
        .await;
    let frame = wait_for(&mut rx, |f| matches!(f, Outbound::Nicks { .. })).await;
    let Outbound::Nicks { nicks } = frame else { unreachable!() };
    assert_eq!(nicks["freenode"], "me_");
}

#[tokio::test]
async fn client_broadcast_reaches_everyone() {
    let h = start(&["freenode"], &[], 10, MemoryStore::new());
    let (a, mut rx_a) = h.relay.attach();
    let (_, mut rx_b) = h.relay.attach();
    let payload = serde_json::json!({"typing": "freenode:#test"});

    h.relay.submit(a, Inbound::ClientBroadcast { payload: payload.clone() }).await;
    for rx in [&mut rx_a, &mut rx_b] {
        let frame = wait_for(rx, |f| matches!(f, Outbound::ClientBroadcast { .. })).await;
        assert_eq!(frame, Outbound::ClientBroadcast { payload: payload.clone() });
    }
}

#[tokio::test]
async fn failed_write_is_reported_after_delivery() {
    let store = MemoryStore::new();
    store.set_fail_writes(true);
    let h = start(&["freenode"], &[], 10, store);
    let (_, mut rx) = h.relay.attach();

    h.emit("freenode", privmsg("alice", "#test", "still delivered")).await;
    let frame = wait_for(&mut rx, |f| matches!(f, Outbound::Messages { .. })).await;
    assert_eq!(message_texts(&frame), vec!["still delivered"]);

    let frame = wait_for(&mut rx, |f| matches!(f, Outbound::BncErr { .. })).await;
    assert!(matches!(frame, Outbound::BncErr { ref location, .. } if location == "persist"));
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn stalled_store_drops_inserts_but_not_delivery() {
    let store = MemoryStore::new();
    store.set_held(true);
    let settings = RelaySettings {
        backlog_limit: 10,
        store_timeout: Duration::from_secs(2),
        persist_queue: 2,
    };
    let h = start_with(&["freenode"], &[], settings, store);
    let (_, mut rx) = h.relay.attach();

    for n in 1..=6 {
        h.emit("freenode", privmsg("alice", "#test", &format!("message {n}"))).await;
    }
    let mut delivered = Vec::new();
    let mut errors = Vec::new();
    while delivered.len() < 6 {
        let frame = wait_for(&mut rx, |f| {
            matches!(f, Outbound::Messages { .. } | Outbound::BncErr { .. })
        })
        .await;
        match frame {
            Outbound::BncErr { location, .. } => errors.push(location),
            frame => delivered.extend(message_texts(&frame)),
        }
    }
    h.store.set_held(false);

    assert_eq!(delivered, (1..=6).map(|n| format!("message {n}")).collect::<Vec<_>>());
    assert!(!errors.is_empty());
    assert!(errors.iter().all(|location| location == "persist"));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let stored = h.store.len();
    assert!(stored > 0 && stored < 6, "stored {stored}");
}

#[tokio::test]
async fn part_while_priming_discards_the_read() {
    let store = MemoryStore::new();
    // Holds the start-up priming read for #test.
    store.set_held(true);
    let h = start(&["freenode"], &["freenode:#test"], 10, store);
    let (id, mut rx) = h.relay.attach();

    h.relay.submit(id, Inbound::Part { channel_id: "freenode:#test".into() }).await;
    let frame = wait_for(&mut rx, |f| matches!(f, Outbound::Channels { .. })).await;
    assert!(channel_order(&frame).is_empty());
    h.store.set_held(false);

    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Ok(frame) = rx.try_recv() {
        assert!(
            !matches!(frame, Outbound::BacklogAvailable { .. }),
            "parted channel was primed: {frame:?}"
        );
    }
}
