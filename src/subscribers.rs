/// In-process fan-out of refresh notifications to connected clients.
///
/// Each subscriber owns a bounded channel; broadcast never blocks and
/// drops the message when a client's buffer is full (the client catches
/// up on its next refresh or reconnect).
use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Buffered refresh messages per client before drops start.
pub const SUBSCRIBER_BUFFER: usize = 256;

/// Server push to a connected client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    Refresh { silent: bool },
}

impl ServerMessage {
    pub fn refresh(silent: bool) -> Self {
        ServerMessage::Refresh { silent }
    }

    pub fn is_silent(&self) -> bool {
        match self {
            ServerMessage::Refresh { silent } => *silent,
        }
    }
}

struct Subscriber {
    tx: mpsc::Sender<ServerMessage>,
    last_seen: Instant,
}

/// Registry of live subscribers, guarded by the store lock.
#[derive(Default)]
pub struct Subscribers {
    subs: HashMap<u64, Subscriber>,
    next_id: u64,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber; returns its handle id and the receiving
    /// end of its channel.
    pub fn add(&mut self) -> (u64, mpsc::Receiver<ServerMessage>) {
        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subs.insert(
            id,
            Subscriber {
                tx,
                last_seen: Instant::now(),
            },
        );
        (id, rx)
    }

    pub fn remove(&mut self, id: u64) -> bool {
        self.subs.remove(&id).is_some()
    }

    /// Record client liveness; stale subscribers are reaped by `sweep`.
    pub fn touch(&mut self, id: u64) {
        if let Some(sub) = self.subs.get_mut(&id) {
            sub.last_seen = Instant::now();
        }
    }

    /// Drop subscribers idle longer than `ttl`. Returns how many went.
    pub fn sweep(&mut self, ttl: Duration) -> usize {
        let now = Instant::now();
        let before = self.subs.len();
        self.subs
            .retain(|_, sub| now.duration_since(sub.last_seen) <= ttl);
        before - self.subs.len()
    }

    /// Non-blocking send to every subscriber; full buffers drop.
    pub fn broadcast(&self, msg: ServerMessage) {
        if !self.subs.is_empty() && !msg.is_silent() {
            log::info!(
                "[subscribers] broadcasting refresh to {} subscribers",
                self.subs.len()
            );
        }
        for sub in self.subs.values() {
            if sub.tx.try_send(msg.clone()).is_err() {
                log::debug!("[subscribers] dropping refresh for slow subscriber");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }
}
