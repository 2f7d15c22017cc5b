//! SQLite persistence layer.
//!
//! Stores every persisted event in one `events` table. Uses WAL mode for
//! concurrent reads during writes.

use std::path::Path;

use chrono::DateTime;
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Result as SqlResult};

use crate::error::Result;
use crate::event::{ChannelEventKind, Event, GlobalEventKind};
use crate::identity::{fold, ChannelId};
use crate::store::{event_kind, event_text, EventQuery, EventStore, RecordType};

/// Database handle wrapping a SQLite connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

/// A persisted event row.
#[derive(Debug, Clone)]
struct EventRow {
    record: String,
    network: String,
    channel: Option<String>,
    nick: Option<String>,
    kind: Option<String>,
    text: Option<String>,
    timestamp: i64,
}

impl SqliteStore {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> SqlResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn: Mutex::new(conn) };
        db.init()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> SqlResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn: Mutex::new(conn) };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> SqlResult<()> {
        let conn = self.conn.lock();
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS events (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                record        TEXT NOT NULL,
                network       TEXT NOT NULL,
                network_key   TEXT NOT NULL,
                channel       TEXT,
                channel_key   TEXT,
                nick          TEXT,
                nick_key      TEXT,
                kind          TEXT,
                text          TEXT,
                timestamp     INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_channel_ts
                ON events(network_key, channel_key, timestamp);
            CREATE INDEX IF NOT EXISTS idx_events_nick
                ON events(nick_key);
            ",
        )?;
        Ok(())
    }

    fn insert_event(&self, event: &Event) -> SqlResult<()> {
        let (network, channel) = match event.channel_id() {
            Some(id) => (id.display_network().to_string(), Some(id.display_channel())),
            None => (event.network().to_string(), None),
        };
        let nick = event.nick();
        self.conn.lock().execute(
            "INSERT INTO events
                (record, network, network_key, channel, channel_key, nick, nick_key, kind, text, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                RecordType::of(event).as_str(),
                network,
                event.network(),
                channel,
                channel.map(fold),
                nick,
                nick.map(fold),
                event_kind(event),
                event_text(event),
                event.timestamp().timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    fn query_events(&self, query: &EventQuery) -> SqlResult<Vec<Event>> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        let mut filter = |clause: &'static str, value: Option<String>| {
            if let Some(v) = value {
                clauses.push(clause);
                values.push(Value::Text(v));
            }
        };
        filter("record = ?", query.record.map(|r| r.as_str().to_string()));
        filter("network_key = ?", query.network.as_deref().map(fold));
        filter("channel_key = ?", query.channel.as_deref().map(fold));
        filter("nick_key = ?", query.nick.as_deref().map(fold));
        filter("kind = ?", query.kind.clone());
        filter("text = ?", query.text.clone());

        let mut sql = String::from(
            "SELECT record, network, channel, nick, kind, text, timestamp FROM events",
        );
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY timestamp DESC, id DESC");
        if let Some(limit) = query.limit.filter(|l| *l > 0) {
            sql.push_str(" LIMIT ?");
            values.push(Value::Integer(limit as i64));
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), map_event_row)?;
        let mut rows = rows.collect::<SqlResult<Vec<_>>>()?;
        // Reverse to oldest-first order
        rows.reverse();
        Ok(rows.into_iter().filter_map(row_to_event).collect())
    }

    /// Number of stored rows.
    pub fn count(&self) -> SqlResult<usize> {
        let n: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

impl EventStore for SqliteStore {
    fn insert(&self, event: &Event) -> Result<()> {
        Ok(self.insert_event(event)?)
    }

    fn query(&self, query: &EventQuery) -> Result<Vec<Event>> {
        Ok(self.query_events(query)?)
    }
}

fn map_event_row(row: &rusqlite::Row) -> SqlResult<EventRow> {
    Ok(EventRow {
        record: row.get(0)?,
        network: row.get(1)?,
        channel: row.get(2)?,
        nick: row.get(3)?,
        kind: row.get(4)?,
        text: row.get(5)?,
        timestamp: row.get(6)?,
    })
}

/// Rebuild an event. Rows this build cannot decode are skipped.
fn row_to_event(row: EventRow) -> Option<Event> {
    let decoded = decode_row(&row);
    if decoded.is_none() {
        tracing::warn!(record = %row.record, kind = ?row.kind, "Skipping undecodable event row");
    }
    decoded
}

fn decode_row(row: &EventRow) -> Option<Event> {
    let timestamp = DateTime::from_timestamp_millis(row.timestamp)?;
    let channel_id = || row.channel.as_deref().map(|c| ChannelId::new(&row.network, c));
    Some(match RecordType::parse(&row.record)? {
        RecordType::Message => Event::Message {
            nick: row.nick.clone().unwrap_or_default(),
            text: row.text.clone().unwrap_or_default(),
            timestamp,
            channel_id: channel_id()?,
        },
        RecordType::ChannelEvent => Event::ChannelEvent {
            kind: ChannelEventKind::parse(row.kind.as_deref()?)?,
            nick: row.nick.clone(),
            argument: row.text.clone(),
            timestamp,
            channel_id: channel_id()?,
        },
        RecordType::GlobalEvent => Event::GlobalEvent {
            kind: GlobalEventKind::parse(row.kind.as_deref()?)?,
            nick: row.nick.clone(),
            argument: row.text.clone(),
            timestamp,
            network: fold(&row.network),
        },
    })
}
