//! Fan-out to attached sessions.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::protocol::Outbound;

/// Outbound queue depth per session.
pub const SESSION_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Session table. Publishing never blocks: a session that cannot keep up
/// is dropped.
pub struct Broadcaster {
    sessions: Mutex<HashMap<SessionId, mpsc::Sender<Outbound>>>,
    next_id: AtomicU64,
    depth: usize,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(SESSION_QUEUE_DEPTH)
    }
}

impl Broadcaster {
    pub fn new(depth: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            depth: depth.max(1),
        }
    }

    pub fn attach(&self) -> (SessionId, mpsc::Receiver<Outbound>) {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.depth);
        self.sessions.lock().insert(id, tx);
        tracing::debug!(session = %id, "Session attached");
        (id, rx)
    }

    pub fn detach(&self, id: SessionId) {
        if self.sessions.lock().remove(&id).is_some() {
            tracing::debug!(session = %id, "Session detached");
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Deliver to every attached session.
    pub fn publish(&self, msg: Outbound) {
        let mut sessions = self.sessions.lock();
        sessions.retain(|id, tx| match tx.try_send(msg.clone()) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(session = %id, error = %e, "Dropping session that cannot receive");
                false
            }
        });
    }

    /// Deliver to one session. Returns false if it is gone.
    pub fn publish_scoped(&self, id: SessionId, msg: Outbound) -> bool {
        let mut sessions = self.sessions.lock();
        let Some(tx) = sessions.get(&id) else {
            return false;
        };
        match tx.try_send(msg) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(session = %id, error = %e, "Dropping session that cannot receive");
                sessions.remove(&id);
                false
            }
        }
    }
}
