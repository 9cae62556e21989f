/// The serialized edit pipeline.
///
/// Every CRDT read and write goes through one reader/writer lock. A
/// successful non-silent edit persists the new state, appends the patch
/// to the history log, notifies local subscribers, and ships the delta
/// to every peer on detached tasks after the lock is released. Silent
/// edits (presence and connection churn) skip the history log and mark
/// their refresh as silent.
use std::collections::HashSet;
use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::clock::{Hlc, HybridClock};
use crate::crdt::{BoardCrdt, Delta};
use crate::storage::{PersistenceLog, StorageError};
use crate::subscribers::{ServerMessage, Subscribers};
use crate::text::Text;
use crate::types::{initial_board, BoardState, Card, Cursor, NodeConnection, ORDER_STEP};

/// Per-request timeout for a peer push; failures are dropped and the
/// periodic pull recovers.
const PUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Subscribers idle longer than this are reaped by the sweep.
const SUBSCRIBER_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("persisted state is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

struct Inner {
    crdt: BoardCrdt,
    subs: Subscribers,
    peers: Vec<String>,
    last_count: i64,
}

/// Handle returned to a connected client: its registry id plus the
/// receiving end of its refresh channel.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<ServerMessage>,
}

pub struct Store {
    node_id: String,
    log: PersistenceLog,
    inner: RwLock<Inner>,
    http: reqwest::Client,
}

impl Store {
    /// Open persistence and load the latest state, seeding a fresh
    /// board when the slot is empty.
    pub fn new(db_path: &Path, node_id: &str, peers: Vec<String>) -> Result<Self, StoreError> {
        let log = PersistenceLog::open(db_path)?;

        let crdt = match log.load_state()? {
            Some(blob) => serde_json::from_slice::<BoardCrdt>(&blob)?,
            None => {
                let crdt = BoardCrdt::new(initial_board(), node_id);
                log.save_state(&serde_json::to_vec(&crdt)?)?;
                crdt
            }
        };

        let store = Self {
            node_id: node_id.to_string(),
            log,
            inner: RwLock::new(Inner {
                crdt,
                subs: Subscribers::new(),
                peers,
                last_count: -1,
            }),
            http: reqwest::Client::new(),
        };

        store.update_connections(0);
        Ok(store)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Read-only snapshot of the board state.
    pub fn get_board(&self) -> BoardState {
        self.inner.read().unwrap().crdt.view()
    }

    /// Full CRDT copy, served to pulling peers.
    pub fn snapshot(&self) -> BoardCrdt {
        self.inner.read().unwrap().crdt.clone()
    }

    /// Current clock reading, used to stamp refresh pings.
    pub fn current_stamp(&self) -> Hlc {
        self.inner.read().unwrap().crdt.stamp()
    }

    pub fn get_peers(&self) -> Vec<String> {
        self.inner.read().unwrap().peers.clone()
    }

    pub fn update_peers(&self, peers: Vec<String>) {
        self.inner.write().unwrap().peers = peers;
    }

    /// Run a mutator through the full pipeline: persist, log the patch,
    /// notify subscribers, push to peers.
    pub fn edit<F>(&self, mutate: F) -> Delta
    where
        F: FnOnce(&mut BoardState, &mut HybridClock),
    {
        let delta = {
            let mut inner = self.inner.write().unwrap();
            let delta = inner.crdt.edit(mutate);
            if !delta.patch.is_empty() {
                self.persist_state(&inner.crdt);
                self.append_patch(&delta);
                inner.subs.broadcast(ServerMessage::refresh(false));
            }
            delta
        };
        if !delta.patch.is_empty() {
            self.push_to_peers(delta.clone());
        }
        delta
    }

    /// Same pipeline as `edit`, but the patch is kept out of the
    /// history log and the refresh is silent. Used for presence and
    /// connection-count churn.
    pub fn silent_edit<F>(&self, mutate: F) -> Delta
    where
        F: FnOnce(&mut BoardState, &mut HybridClock),
    {
        let delta = {
            let mut inner = self.inner.write().unwrap();
            let delta = inner.crdt.edit(mutate);
            if !delta.patch.is_empty() {
                self.persist_state(&inner.crdt);
                inner.subs.broadcast(ServerMessage::refresh(true));
            }
            delta
        };
        if !delta.patch.is_empty() {
            self.push_to_peers(delta.clone());
        }
        delta
    }

    /// Apply a delta received from a peer. The refresh is silent when
    /// the patch touches only presence fields.
    pub fn apply_delta(&self, delta: &Delta) -> bool {
        let mut inner = self.inner.write().unwrap();
        let changed = inner.crdt.apply_delta(delta);
        if changed {
            log::info!("[store] applied delta from remote: {}", delta.summary);
            self.persist_state(&inner.crdt);
            self.append_patch(delta);
            let silent = delta.patch.is_presence_only();
            inner.subs.broadcast(ServerMessage::refresh(silent));
        }
        changed
    }

    /// Merge a peer's full CRDT. No patch is appended: a merged state
    /// has no single delta identity.
    pub fn merge(&self, other: &BoardCrdt) -> bool {
        let mut inner = self.inner.write().unwrap();
        if inner.crdt.merge(other) {
            log::info!("[store] merged state from remote");
            self.persist_state(&inner.crdt);
            inner.subs.broadcast(ServerMessage::refresh(false));
            true
        } else {
            false
        }
    }

    pub fn get_history(&self, limit: usize) -> Vec<String> {
        match self.log.read_patch_summaries(limit) {
            Ok(summaries) => summaries,
            Err(e) => {
                log::error!("[store] failed to read history: {e}");
                Vec::new()
            }
        }
    }

    pub fn clear_history(&self) {
        if let Err(e) = self.log.clear_patches() {
            log::error!("[store] failed to clear history: {e}");
        }
        self.broadcast_refresh(false);
    }

    /// Drop persisted state and history and return to the seed board.
    pub fn reset(&self) {
        let mut inner = self.inner.write().unwrap();
        if let Err(e) = self.log.reset() {
            log::error!("[store] failed to reset persistence: {e}");
        }
        inner.crdt = BoardCrdt::new(initial_board(), &self.node_id);
        self.persist_state(&inner.crdt);
        inner.subs.broadcast(ServerMessage::refresh(false));
    }

    /// Notify local subscribers without touching state. Used for
    /// refresh pings from peers' merges.
    pub fn broadcast_refresh(&self, silent: bool) {
        self.inner
            .read()
            .unwrap()
            .subs
            .broadcast(ServerMessage::refresh(silent));
    }

    // ── Subscribers & presence ──────────────────────────────────────────

    /// Register a client channel and publish the new local count.
    pub fn subscribe(&self) -> Subscription {
        let (sub, delta) = {
            let mut inner = self.inner.write().unwrap();
            let (id, rx) = inner.subs.add();
            let count = inner.subs.len() as i64;
            let delta = self.set_connection_count_locked(&mut inner, count);
            (Subscription { id, rx }, delta)
        };
        if let Some(delta) = delta {
            self.push_to_peers(delta);
        }
        sub
    }

    pub fn unsubscribe(&self, id: u64) {
        let delta = {
            let mut inner = self.inner.write().unwrap();
            if !inner.subs.remove(id) {
                return;
            }
            let count = inner.subs.len() as i64;
            self.set_connection_count_locked(&mut inner, count)
        };
        if let Some(delta) = delta {
            self.push_to_peers(delta);
        }
    }

    pub fn heartbeat(&self, id: u64) {
        self.inner.write().unwrap().subs.touch(id);
    }

    /// Reap subscribers that stopped talking and republish the count.
    pub fn sweep_subscribers(&self) {
        let delta = {
            let mut inner = self.inner.write().unwrap();
            let reaped = inner.subs.sweep(SUBSCRIBER_TTL);
            let count = inner.subs.len() as i64;
            if reaped == 0 && count == inner.last_count {
                None
            } else {
                self.set_connection_count_locked(&mut inner, count)
            }
        };
        if let Some(delta) = delta {
            self.push_to_peers(delta);
        }
    }

    /// Publish an explicit connection count for this node.
    pub fn update_connections(&self, count: i64) {
        let delta = {
            let mut inner = self.inner.write().unwrap();
            self.set_connection_count_locked(&mut inner, count)
        };
        if let Some(delta) = delta {
            self.push_to_peers(delta);
        }
    }

    /// Drop connection entries whose node is neither us nor a current
    /// peer host.
    pub fn cleanup_connections(&self) {
        let delta = {
            let mut inner = self.inner.write().unwrap();
            let mut keep: HashSet<String> = inner
                .peers
                .iter()
                .map(|p| p.split(':').next().unwrap_or(p).to_string())
                .collect();
            keep.insert(self.node_id.clone());

            let delta = inner.crdt.edit(|bs, _| {
                bs.node_connections.retain(|id, _| keep.contains(id));
            });
            if delta.patch.is_empty() {
                None
            } else {
                self.persist_state(&inner.crdt);
                inner.subs.broadcast(ServerMessage::refresh(true));
                Some(delta)
            }
        };
        if let Some(delta) = delta {
            self.push_to_peers(delta);
        }
    }

    /// Park a client's cursor on a card (silent).
    pub fn set_cursor(&self, cursor: Cursor) {
        self.silent_edit(move |bs, _| {
            bs.cursors.insert(cursor.id.clone(), cursor);
        });
    }

    /// Clear a client's cursor when it disconnects (silent).
    pub fn remove_cursor(&self, conn_id: &str) {
        self.silent_edit(|bs, _| {
            bs.cursors.remove(conn_id);
        });
    }

    fn set_connection_count_locked(&self, inner: &mut Inner, count: i64) -> Option<Delta> {
        inner.last_count = count;
        let node_id = self.node_id.clone();
        let delta = inner.crdt.edit(|bs, _| {
            bs.node_connections.insert(
                node_id.clone(),
                NodeConnection {
                    node_id: node_id.clone(),
                    count,
                },
            );
        });
        if delta.patch.is_empty() {
            return None;
        }
        self.persist_state(&inner.crdt);
        inner.subs.broadcast(ServerMessage::refresh(true));
        Some(delta)
    }

    // ── Card operations ─────────────────────────────────────────────────

    /// Create a card at the bottom of the `todo` column.
    pub fn add_card(&self, title: &str) -> String {
        let id = Uuid::new_v4().to_string();
        let card_id = id.clone();
        self.edit(move |bs, _| {
            let order = bs.max_order("todo") + ORDER_STEP;
            bs.board.cards.insert(
                card_id.clone(),
                Card {
                    id: card_id.clone(),
                    title: title.to_string(),
                    description: Text::new(),
                    assignee: String::new(),
                    column_id: "todo".to_string(),
                    order,
                },
            );
        });
        id
    }

    /// Reassign a card's column and drop it at the bottom. The target
    /// index is advisory: order keys are last-write-wins scalars, not a
    /// fractional index.
    pub fn move_card(&self, card_id: &str, to_col: &str, _to_index: usize) {
        self.edit(|bs, _| {
            let order = bs.max_order(to_col) + ORDER_STEP;
            if let Some(card) = bs.board.cards.get_mut(card_id) {
                card.column_id = to_col.to_string();
                card.order = order;
            }
        });
    }

    /// Dispatch a text operation onto a card description. Unknown card
    /// or op is a silent no-op.
    pub fn update_card_text(&self, card_id: &str, op: &str, val: &str, pos: usize, length: usize) {
        self.edit(|bs, clock| {
            if let Some(card) = bs.board.cards.get_mut(card_id) {
                match op {
                    "insert" => card.description.insert(pos, val, clock),
                    "delete" => {
                        card.description.delete(pos, length);
                    }
                    _ => {}
                }
            }
        });
    }

    pub fn delete_card(&self, card_id: &str) {
        self.edit(|bs, _| {
            bs.board.cards.remove(card_id);
        });
    }

    // ── Persistence & peer push ─────────────────────────────────────────

    fn persist_state(&self, crdt: &BoardCrdt) {
        match serde_json::to_vec(crdt) {
            Ok(blob) => {
                if let Err(e) = self.log.save_state(&blob) {
                    log::error!("[store] failed to persist state: {e}");
                }
            }
            Err(e) => log::error!("[store] failed to encode state: {e}"),
        }
    }

    fn append_patch(&self, delta: &Delta) {
        match serde_json::to_vec(delta) {
            Ok(blob) => {
                log::info!("[store] saving patch: {}", delta.summary);
                if let Err(e) = self.log.append_patch(&delta.timestamp, &blob, &delta.summary) {
                    log::error!("[store] failed to append patch: {e}");
                }
            }
            Err(e) => log::error!("[store] failed to encode patch: {e}"),
        }
    }

    /// Ship a delta to every known peer, one detached task per peer.
    /// Must be called without holding the store lock.
    pub fn push_to_peers(&self, delta: Delta) {
        let peers = self.get_peers();
        if peers.is_empty() {
            return;
        }
        let body = match serde_json::to_vec(&delta) {
            Ok(body) => body,
            Err(e) => {
                log::error!("[store] failed to encode delta for sync: {e}");
                return;
            }
        };
        for peer in peers {
            let client = self.http.clone();
            let body = body.clone();
            tokio::spawn(async move {
                let url = format!("http://{peer}/api/sync");
                let sent = client
                    .post(&url)
                    .header("content-type", "application/json")
                    .body(body)
                    .timeout(PUSH_TIMEOUT)
                    .send()
                    .await;
                if let Err(e) = sent {
                    log::warn!("[store] failed to sync with peer {peer}: {e}");
                }
            });
        }
    }
}
