//! IRC upstream client.
//!
//! One supervised task per network manages the TCP (optionally TLS)
//! connection, registration, keepalive and nick collisions, and turns server
//! lines into [`UpstreamEvent`]s. When the connection drops it emits
//! `Disconnected` and reconnects with exponential backoff plus jitter; the
//! relay re-issues autojoins on the next `Registered`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bnc_core::config::NetworkConfig;
use bnc_core::identity::{fold, is_channel_name};
use bnc_core::upstream::{UpstreamConnector, UpstreamEvent, UpstreamHandle};
use bnc_core::BncError;
use rand::Rng;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::rustls;
use tokio_rustls::TlsConnector;

use crate::irc::{sanitize, Message};

/// Nick variants tried on ERR_NICKNAMEINUSE before giving up on a connection.
const MAX_NICK_TRIES: u32 = 5;

/// Commands queued for the connection task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Join { channel: String, key: Option<String> },
    Part(String),
    Privmsg { target: String, text: String },
    Raw(String),
}

impl Command {
    fn to_lines(&self) -> Vec<String> {
        match self {
            Command::Join { channel, key: Some(key) } => {
                vec![Message::new("JOIN", vec![channel, key]).to_string()]
            }
            Command::Join { channel, key: None } => {
                vec![Message::new("JOIN", vec![channel]).to_string()]
            }
            Command::Part(channel) => vec![Message::new("PART", vec![channel]).to_string()],
            Command::Privmsg { target, text } => text
                .lines()
                .filter(|l| !l.is_empty())
                .map(|line| Message::new("PRIVMSG", vec![target, line]).to_string())
                .collect(),
            Command::Raw(line) => {
                let line = sanitize(line.trim_end());
                if line.is_empty() { Vec::new() } else { vec![line] }
            }
        }
    }
}

/// Sending side of one network connection.
#[derive(Clone)]
pub struct IrcHandle {
    network: String,
    cmd_tx: mpsc::Sender<Command>,
}

impl IrcHandle {
    fn queue(&self, cmd: Command) -> bnc_core::Result<()> {
        self.cmd_tx.try_send(cmd).map_err(|e| {
            BncError::UpstreamProtocolError(format!("{}: command not queued: {e}", self.network))
        })
    }
}

impl UpstreamHandle for IrcHandle {
    fn join(&self, channel: &str, key: Option<&str>) -> bnc_core::Result<()> {
        self.queue(Command::Join {
            channel: channel.to_string(),
            key: key.map(str::to_string),
        })
    }

    fn part(&self, channel: &str) -> bnc_core::Result<()> {
        self.queue(Command::Part(channel.to_string()))
    }

    fn say(&self, target: &str, text: &str) -> bnc_core::Result<()> {
        self.queue(Command::Privmsg {
            target: target.to_string(),
            text: text.to_string(),
        })
    }

    fn send_raw(&self, bytes: &[u8]) -> bnc_core::Result<()> {
        self.queue(Command::Raw(String::from_utf8_lossy(bytes).into_owned()))
    }
}

/// Backoff settings for reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial delay before first reconnect attempt.
    pub initial_delay: Duration,
    /// Maximum delay between reconnect attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_factor: f64,
    /// Send PING after this much silence.
    pub ping_interval: Duration,
    /// Drop the connection after this much silence.
    pub ping_timeout: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            ping_interval: Duration::from_secs(60),
            ping_timeout: Duration::from_secs(120),
        }
    }
}

impl ReconnectConfig {
    fn next_delay(&self, delay: Duration) -> Duration {
        let jitter = rand_jitter(delay.as_millis() as u64 / 4);
        Duration::from_millis(
            ((delay.as_millis() as f64 * self.backoff_factor) as u64 + jitter)
                .min(self.max_delay.as_millis() as u64),
        )
    }
}

/// Random value in `0..max`.
fn rand_jitter(max: u64) -> u64 {
    if max == 0 {
        return 0;
    }
    rand::thread_rng().gen_range(0..max)
}

/// Opens one supervised IRC connection per network.
#[derive(Debug, Clone, Default)]
pub struct IrcConnector {
    pub reconnect: ReconnectConfig,
}

impl UpstreamConnector for IrcConnector {
    fn connect(
        &self,
        network: &NetworkConfig,
    ) -> (Arc<dyn UpstreamHandle>, mpsc::Receiver<UpstreamEvent>) {
        let (event_tx, event_rx) = mpsc::channel(4096);
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let handle = IrcHandle {
            network: network.name.clone(),
            cmd_tx,
        };
        tokio::spawn(run_with_reconnect(
            network.clone(),
            self.reconnect.clone(),
            cmd_rx,
            event_tx,
        ));
        (Arc::new(handle), event_rx)
    }
}

/// Connect, run until the connection drops, back off, repeat. Ends when the
/// relay stops listening.
async fn run_with_reconnect(
    network: NetworkConfig,
    reconnect: ReconnectConfig,
    mut cmd_rx: mpsc::Receiver<Command>,
    event_tx: mpsc::Sender<UpstreamEvent>,
) {
    let mut delay = reconnect.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let outcome = match establish_connection(&network).await {
            Ok(conn) => {
                tracing::info!(network = %network.name, attempt, "Connected");
                run_connection(conn, &network, &reconnect, &mut cmd_rx, &event_tx).await
            }
            Err(e) => Err(e),
        };

        let reason = match outcome {
            Ok(Session { registered: true, reason }) => {
                attempt = 0;
                delay = reconnect.initial_delay;
                reason
            }
            Ok(Session { registered: false, reason }) => reason,
            Err(e) => e.to_string(),
        };
        if event_tx.send(UpstreamEvent::Disconnected { reason: reason.clone() }).await.is_err() {
            break;
        }
        tracing::warn!(
            network = %network.name,
            reason = %reason,
            attempt,
            delay_secs = delay.as_secs(),
            "Disconnected, will reconnect"
        );

        // Commands issued while offline are dropped; autojoin covers channels.
        tokio::time::sleep(delay).await;
        while let Ok(cmd) = cmd_rx.try_recv() {
            tracing::debug!(network = %network.name, ?cmd, "Dropping command queued while offline");
        }
        delay = reconnect.next_delay(delay);
    }
    tracing::debug!(network = %network.name, "Upstream task stopped");
}

/// How a connection ended.
#[derive(Debug)]
struct Session {
    registered: bool,
    reason: String,
}

enum Connection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

async fn run_connection(
    conn: Connection,
    network: &NetworkConfig,
    reconnect: &ReconnectConfig,
    cmd_rx: &mut mpsc::Receiver<Command>,
    event_tx: &mpsc::Sender<UpstreamEvent>,
) -> Result<Session> {
    match conn {
        Connection::Plain(tcp) => {
            let (reader, writer) = tokio::io::split(tcp);
            run_irc(BufReader::new(reader), writer, network, reconnect, cmd_rx, event_tx).await
        }
        Connection::Tls(tls) => {
            let (reader, writer) = tokio::io::split(*tls);
            run_irc(BufReader::new(reader), writer, network, reconnect, cmd_rx, event_tx).await
        }
    }
}

/// `host:port`, filling in the default port for the transport.
fn server_addr(network: &NetworkConfig) -> String {
    if network.host.rsplit_once(':').is_some_and(|(_, port)| port.parse::<u16>().is_ok()) {
        network.host.clone()
    } else {
        let port = if network.tls { 6697 } else { 6667 };
        format!("{}:{port}", network.host)
    }
}

async fn establish_connection(network: &NetworkConfig) -> Result<Connection> {
    let addr = server_addr(network);
    let mode = if network.tls { "TLS" } else { "plain" };

    tracing::debug!(network = %network.name, "Resolving {addr}...");
    let tcp = TcpStream::connect(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("TCP connect to {addr} failed: {e}"))?;
    tracing::debug!(network = %network.name, "TCP connected to {addr} ({mode})");

    if !network.tls {
        return Ok(Connection::Plain(tcp));
    }
    let tls_config = if network.tls_insecure {
        tracing::debug!(network = %network.name, "TLS: insecure mode (skipping cert verification)");
        rustls_insecure_config()
    } else {
        rustls_default_config()
    };
    let connector = TlsConnector::from(Arc::new(tls_config));
    let server_name = addr.rsplit_once(':').map_or(addr.as_str(), |(host, _)| host);
    let dns_name = rustls::pki_types::ServerName::try_from(server_name.to_string())?;
    let tls = connector
        .connect(dns_name, tcp)
        .await
        .map_err(|e| anyhow::anyhow!("TLS handshake with {addr} failed: {e}"))?;
    tracing::debug!(network = %network.name, "TLS handshake complete");
    Ok(Connection::Tls(Box::new(tls)))
}

fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

fn rustls_default_config() -> rustls::ClientConfig {
    install_crypto_provider();

    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

fn rustls_insecure_config() -> rustls::ClientConfig {
    install_crypto_provider();
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
        .with_no_client_auth()
}

#[derive(Debug)]
struct InsecureVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::CryptoProvider::get_default()
            .map(|p| p.signature_verification_algorithms.supported_schemes())
            .unwrap_or_default()
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    Ok(())
}

/// Drive one registered-or-registering connection until it ends.
async fn run_irc<R, W>(
    mut reader: R,
    mut writer: W,
    network: &NetworkConfig,
    reconnect: &ReconnectConfig,
    cmd_rx: &mut mpsc::Receiver<Command>,
    event_tx: &mpsc::Sender<UpstreamEvent>,
) -> Result<Session>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let user = network.user.clone().unwrap_or_else(|| network.nick.clone());
    let realname = network.realname.clone().unwrap_or_else(|| network.nick.clone());
    write_line(&mut writer, &Message::new("NICK", vec![&network.nick]).to_string()).await?;
    write_line(&mut writer, &Message::new("USER", vec![&user, "0", "*", &realname]).to_string())
        .await?;

    let mut registered = false;
    let mut nick = network.nick.clone();
    let mut nick_tries: u32 = 0;
    let mut pending: Vec<Command> = Vec::new();
    let mut names = NamesBuffer::default();
    let mut buf: Vec<u8> = Vec::new();
    let mut last_activity = tokio::time::Instant::now();
    let mut keepalive = tokio::time::interval(reconnect.ping_interval / 2);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut ping_sent = false;

    let end = |registered: bool, reason: &str| Session { registered, reason: reason.to_string() };

    loop {
        tokio::select! {
            // read_until keeps partial input in `buf` if another branch wins.
            result = reader.read_until(b'\n', &mut buf) => {
                if result? == 0 {
                    return Ok(end(registered, "EOF"));
                }
                last_activity = tokio::time::Instant::now();
                ping_sent = false;
                let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                buf.clear();
                let msg = match Message::parse(&line) {
                    Ok(msg) => msg,
                    Err(e) => {
                        tracing::debug!(network = %network.name, error = %e, "Unparseable line");
                        continue;
                    }
                };

                match msg.command.as_str() {
                    "PING" => {
                        let token = msg.param(0).unwrap_or("");
                        let pong = Message::new("PONG", vec![token]).to_string();
                        write_line(&mut writer, &pong).await?;
                        continue;
                    }
                    "PONG" => continue,
                    // ERR_NICKNAMEINUSE / ERR_ERRONEUSNICKNAME before registration
                    "433" | "432" if !registered => {
                        nick_tries += 1;
                        if nick_tries > MAX_NICK_TRIES {
                            return Ok(end(false, "nick in use"));
                        }
                        nick = if nick_tries == 1 {
                            format!("{}_", network.nick)
                        } else {
                            format!("{}{}", network.nick, nick_tries)
                        };
                        tracing::info!(network = %network.name, nick = %nick, "Nick in use");
                        let retry = Message::new("NICK", vec![&nick]).to_string();
                        write_line(&mut writer, &retry).await?;
                        continue;
                    }
                    "001" => {
                        registered = true;
                        if let Some(confirmed) = msg.param(0) {
                            nick = confirmed.to_string();
                        }
                        let registered_as = UpstreamEvent::Registered { nick: nick.clone() };
                        let _ = event_tx.send(registered_as).await;
                        for cmd in pending.drain(..) {
                            for line in cmd.to_lines() {
                                write_line(&mut writer, &line).await?;
                            }
                        }
                        continue;
                    }
                    "NICK" if msg.source_nick().is_some_and(|n| fold(n) == fold(&nick)) => {
                        if let Some(new_nick) = msg.param(0) {
                            nick = new_nick.to_string();
                        }
                    }
                    "ERROR" => {
                        let reason = msg.param(0).unwrap_or("closing link").to_string();
                        let error = UpstreamEvent::Error { message: reason.clone() };
                        let _ = event_tx.send(error).await;
                        return Ok(end(registered, &reason));
                    }
                    _ => {}
                }

                let events = names.accept(&msg).unwrap_or_else(|| translate(&msg, &line));
                for event in events {
                    if event_tx.send(event).await.is_err() {
                        return Ok(end(registered, "relay stopped"));
                    }
                }
            }
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    let _ = write_line(&mut writer, "QUIT :shutting down").await;
                    return Ok(end(registered, "shutting down"));
                };
                if !registered {
                    pending.push(cmd);
                    continue;
                }
                for line in cmd.to_lines() {
                    write_line(&mut writer, &line).await?;
                }
            }
            _ = keepalive.tick() => {
                let idle = last_activity.elapsed();
                if idle >= reconnect.ping_timeout {
                    return Ok(end(registered, "ping timeout"));
                }
                if idle >= reconnect.ping_interval && !ping_sent {
                    write_line(&mut writer, &Message::new("PING", vec!["bnc"]).to_string()).await?;
                    ping_sent = true;
                }
            }
        }
    }
}

/// Collects RPL_NAMREPLY (353) lines per channel until RPL_ENDOFNAMES (366),
/// so the relay only ever sees complete member lists.
#[derive(Debug, Default)]
struct NamesBuffer {
    /// folded channel -> (channel as sent, nicks so far)
    pending: HashMap<String, (String, Vec<String>)>,
}

impl NamesBuffer {
    /// `None` if the line is not part of a names reply.
    fn accept(&mut self, msg: &Message) -> Option<Vec<UpstreamEvent>> {
        match msg.command.as_str() {
            "353" if msg.params.len() >= 4 => {
                let channel = &msg.params[2];
                let (_, nicks) = self
                    .pending
                    .entry(fold(channel))
                    .or_insert_with(|| (channel.clone(), Vec::new()));
                nicks.extend(msg.params[3].split_whitespace().map(str::to_string));
                Some(Vec::new())
            }
            "366" if msg.params.len() >= 2 => {
                let channel = &msg.params[1];
                let (channel, nicks) = self
                    .pending
                    .remove(&fold(channel))
                    .unwrap_or_else(|| (channel.clone(), Vec::new()));
                Some(vec![UpstreamEvent::Names { channel, nicks }])
            }
            _ => None,
        }
    }
}

/// Modes that carry an argument when set (`+`) or unset (`-`).
fn mode_takes_arg(mode: char, adding: bool) -> bool {
    match mode {
        'o' | 'v' | 'h' | 'a' | 'q' | 'b' | 'e' | 'I' | 'k' => true,
        'l' => adding,
        _ => false,
    }
}

/// Map one server line to upstream events. Commands with no dedicated
/// variant come out as `Other`; informational numerics as `Raw`.
pub fn translate(msg: &Message, line: &str) -> Vec<UpstreamEvent> {
    let nick = || msg.source_nick().unwrap_or("").to_string();
    let p = |i: usize| msg.param(i).map(str::to_string);
    let p_or = |i: usize| p(i).unwrap_or_default();

    let event = match msg.command.as_str() {
        "PRIVMSG" if msg.params.len() >= 2 => UpstreamEvent::Message {
            from: nick(),
            target: p_or(0),
            text: p_or(1),
        },
        "NOTICE" if msg.params.len() >= 2 => UpstreamEvent::Notice {
            from: msg.from_user().then(nick),
            target: p_or(0),
            text: p_or(1),
        },
        "NICK" => UpstreamEvent::NickChange { old_nick: nick(), new_nick: p_or(0) },
        "INVITE" if msg.params.len() >= 2 => {
            UpstreamEvent::Invite { channel: p_or(1), by: nick() }
        }
        "MODE" if msg.param(0).is_some_and(is_channel_name) => return channel_modes(msg),
        "JOIN" => UpstreamEvent::Join { channel: p_or(0), nick: nick() },
        "PART" => UpstreamEvent::Part { channel: p_or(0), nick: nick(), reason: p(1) },
        "QUIT" => UpstreamEvent::Quit { nick: nick(), reason: p(0), channels: Vec::new() },
        "KICK" if msg.params.len() >= 2 => UpstreamEvent::Kick {
            channel: p_or(0),
            nick: p_or(1),
            by: msg.source_nick().unwrap_or("server").to_string(),
            reason: p(2),
        },
        "KILL" => UpstreamEvent::Kill { nick: p_or(0), reason: p(1), channels: Vec::new() },
        "TOPIC" => UpstreamEvent::Topic {
            channel: p_or(0),
            topic: p_or(1),
            nick: msg.source_nick().map(str::to_string),
        },
        // RPL_TOPIC
        "332" if msg.params.len() >= 3 => {
            UpstreamEvent::Topic { channel: p_or(1), topic: p_or(2), nick: None }
        }
        // RPL_WHOISUSER
        "311" if msg.params.len() >= 6 => UpstreamEvent::Whois {
            nick: p_or(1),
            info: format!("{} is {}@{} ({})", p_or(1), p_or(2), p_or(3), p_or(5)),
        },
        // RPL_WHOISSERVER
        "312" if msg.params.len() >= 4 => UpstreamEvent::Whois {
            nick: p_or(1),
            info: format!("{} using {} ({})", p_or(1), p_or(2), p_or(3)),
        },
        // RPL_WHOISCHANNELS
        "319" if msg.params.len() >= 3 => UpstreamEvent::Whois {
            nick: p_or(1),
            info: format!("{} on {}", p_or(1), p_or(2)),
        },
        "ERROR" => UpstreamEvent::Error { message: p_or(0) },
        cmd if is_error_numeric(cmd) => UpstreamEvent::Error {
            message: format!("{cmd} {}", msg.params[1.min(msg.params.len())..].join(" ")),
        },
        cmd if cmd.len() == 3 && cmd.bytes().all(|b| b.is_ascii_digit()) => {
            UpstreamEvent::Raw(line.to_string())
        }
        _ => UpstreamEvent::Other {
            command: msg.command.clone(),
            params: msg.params.clone(),
        },
    };
    vec![event]
}

fn is_error_numeric(cmd: &str) -> bool {
    cmd.len() == 3
        && matches!(cmd.as_bytes()[0], b'4' | b'5')
        && cmd.bytes().all(|b| b.is_ascii_digit())
}

/// Split `MODE #chan +ov-b a b mask` into one event per mode letter.
fn channel_modes(msg: &Message) -> Vec<UpstreamEvent> {
    let channel = msg.param(0).unwrap_or("").to_string();
    let by = msg.source_nick().or(msg.prefix.as_deref()).unwrap_or("server").to_string();
    let mut args = msg.params.iter().skip(2);
    let mut adding = true;
    let mut events = Vec::new();
    for c in msg.param(1).unwrap_or("").chars() {
        match c {
            '+' => adding = true,
            '-' => adding = false,
            mode => {
                let argument = if mode_takes_arg(mode, adding) {
                    args.next().cloned()
                } else {
                    None
                };
                let (channel, by, mode) = (channel.clone(), by.clone(), mode.to_string());
                events.push(if adding {
                    UpstreamEvent::ModeAdded { channel, by, mode, argument }
                } else {
                    UpstreamEvent::ModeRemoved { channel, by, mode, argument }
                });
            }
        }
    }
    events
}
