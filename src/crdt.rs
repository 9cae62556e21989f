/// CRDT wrapper around the whole board state.
///
/// Every local mutation runs against a working copy; the value-level
/// diff against the previous state becomes a `Patch` of typed changes,
/// stamped with one `Hlc`. A versions map records the last-writer stamp
/// per field path. Scalars and keyed entries resolve by per-path LWW,
/// card descriptions by text union-merge. A path entry whose key is
/// absent from the state acts as a removal tombstone during merge.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::clock::{Hlc, HybridClock};
use crate::text::{Atom, Text};
use crate::types::{BoardState, Card, Column, Cursor, NodeConnection};

/// A positional edit of one card description, carrying its atoms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum TextEdit {
    Insert { pos: usize, atoms: Vec<Atom> },
    Delete { pos: usize, len: usize },
}

/// One field-level change inside a patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "field", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Change {
    BoardId { value: String },
    BoardTitle { value: String },
    Columns { value: Vec<Column> },
    ColumnTitle { index: usize, value: String },
    CardAdd { card: Card },
    CardRemove { id: String },
    CardTitle { id: String, value: String },
    CardAssignee { id: String, value: String },
    CardColumn { id: String, value: String },
    CardOrder { id: String, value: f64 },
    CardText { id: String, ops: Vec<TextEdit> },
    Connection { node_id: String, count: i64 },
    ConnectionRemove { node_id: String },
    CursorSet { cursor: Cursor },
    CursorRemove { id: String },
}

impl Change {
    /// Path key used for last-writer gating; set and remove of the same
    /// keyed entry share one key so they supersede each other.
    pub fn version_key(&self) -> String {
        match self {
            Change::BoardId { .. } => "board/id".to_string(),
            Change::BoardTitle { .. } => "board/title".to_string(),
            Change::Columns { .. } => "board/columns".to_string(),
            Change::ColumnTitle { index, .. } => format!("board/columns/{index}/title"),
            Change::CardAdd { card } => format!("card/{}", card.id),
            Change::CardRemove { id } => format!("card/{id}"),
            Change::CardTitle { id, .. } => format!("card/{id}/title"),
            Change::CardAssignee { id, .. } => format!("card/{id}/assignee"),
            Change::CardColumn { id, .. } => format!("card/{id}/column"),
            Change::CardOrder { id, .. } => format!("card/{id}/order"),
            Change::CardText { id, .. } => format!("card/{id}/text"),
            Change::Connection { node_id, .. } | Change::ConnectionRemove { node_id } => {
                format!("conn/{node_id}")
            }
            Change::CursorSet { cursor } => format!("cursor/{}", cursor.id),
            Change::CursorRemove { id } => format!("cursor/{id}"),
        }
    }

    /// Human-readable name of the touched field, used in summaries.
    pub fn label(&self) -> String {
        match self {
            Change::BoardId { .. } => "Board.ID".to_string(),
            Change::BoardTitle { .. } => "Board.Title".to_string(),
            Change::Columns { .. } => "Board.Columns".to_string(),
            Change::ColumnTitle { index, .. } => format!("Board.Columns[{index}].Title"),
            Change::CardAdd { card } => format!("Cards[{}]", card.id),
            Change::CardRemove { id } => format!("Cards[{id}]"),
            Change::CardTitle { id, .. } => format!("Cards[{id}].Title"),
            Change::CardAssignee { id, .. } => format!("Cards[{id}].Assignee"),
            Change::CardColumn { id, .. } => format!("Cards[{id}].ColumnID"),
            Change::CardOrder { id, .. } => format!("Cards[{id}].Order"),
            Change::CardText { id, .. } => format!("Cards[{id}].Description"),
            Change::Connection { node_id, .. } => format!("nodeConnections[{node_id}].count"),
            Change::ConnectionRemove { node_id } => format!("nodeConnections[{node_id}]"),
            Change::CursorSet { cursor } => format!("cursors[{}]", cursor.id),
            Change::CursorRemove { id } => format!("cursors[{id}]"),
        }
    }

    /// Presence-class changes produce silent refreshes and no history.
    pub fn is_presence(&self) -> bool {
        matches!(
            self,
            Change::Connection { .. }
                | Change::ConnectionRemove { .. }
                | Change::CursorSet { .. }
                | Change::CursorRemove { .. }
        )
    }
}

/// The value-level change set of one delta.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Patch {
    pub changes: Vec<Change>,
}

impl Patch {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn summary(&self) -> String {
        self.changes
            .iter()
            .map(Change::label)
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn is_presence_only(&self) -> bool {
        !self.changes.is_empty() && self.changes.iter().all(Change::is_presence)
    }
}

/// A stamped, shippable description of one state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delta {
    pub timestamp: Hlc,
    pub patch: Patch,
    pub summary: String,
}

impl Delta {
    /// Empty-patch delta: peers treat it as a refresh-only ping.
    pub fn refresh_ping(timestamp: Hlc) -> Self {
        Self {
            timestamp,
            patch: Patch::default(),
            summary: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardCrdt {
    state: BoardState,
    clock: HybridClock,
    versions: BTreeMap<String, Hlc>,
}

impl BoardCrdt {
    pub fn new(state: BoardState, node_id: &str) -> Self {
        Self {
            state,
            clock: HybridClock::new(node_id),
            versions: BTreeMap::new(),
        }
    }

    /// Read-only snapshot.
    pub fn view(&self) -> BoardState {
        self.state.clone()
    }

    pub fn state(&self) -> &BoardState {
        &self.state
    }

    /// Current clock reading without advancing.
    pub fn stamp(&self) -> Hlc {
        self.clock.stamp()
    }

    /// Run a mutator against a working copy and package the resulting
    /// diff. A mutator that changed nothing yields an empty patch and
    /// leaves the clock alone.
    pub fn edit<F>(&mut self, mutate: F) -> Delta
    where
        F: FnOnce(&mut BoardState, &mut HybridClock),
    {
        let mut next = self.state.clone();
        mutate(&mut next, &mut self.clock);

        let changes = diff_states(&self.state, &next);
        if changes.is_empty() {
            return Delta {
                timestamp: self.clock.stamp(),
                patch: Patch::default(),
                summary: String::new(),
            };
        }

        let timestamp = self.clock.now();
        for change in &changes {
            self.versions.insert(change.version_key(), timestamp.clone());
        }
        self.state = next;

        let patch = Patch { changes };
        let summary = patch.summary();
        Delta {
            timestamp,
            patch,
            summary,
        }
    }

    /// Apply a remote delta. Each change is skipped when a write at or
    /// after the delta's stamp already landed on its path, which makes
    /// re-delivery a no-op. A change that found nothing to touch (say a
    /// title edit outrunning its card's add) records no version, so the
    /// write can still land through a later delivery or merge. Returns
    /// true iff the state changed.
    pub fn apply_delta(&mut self, delta: &Delta) -> bool {
        let mut changed = false;
        for change in &delta.patch.changes {
            let key = change.version_key();
            if let Some(seen) = self.versions.get(&key) {
                if *seen >= delta.timestamp {
                    continue;
                }
            }
            if apply_change(&mut self.state, change) {
                self.versions.insert(key, delta.timestamp.clone());
                changed = true;
            }
        }
        self.clock.observe(&delta.timestamp);
        changed
    }

    /// Combine with another replica's full state. Idempotent and
    /// commutative; returns true iff the local state changed.
    pub fn merge(&mut self, other: &BoardCrdt) -> bool {
        let before = self.state.clone();

        if wins(self.versions.get("board/id"), other.versions.get("board/id")) {
            self.state.board.id = other.state.board.id.clone();
        }
        if wins(
            self.versions.get("board/title"),
            other.versions.get("board/title"),
        ) {
            self.state.board.title = other.state.board.title.clone();
        }
        if wins(
            self.versions.get("board/columns"),
            other.versions.get("board/columns"),
        ) {
            self.state.board.columns = other.state.board.columns.clone();
        }
        let shared = self.state.board.columns.len().min(other.state.board.columns.len());
        for i in 0..shared {
            let key = format!("board/columns/{i}/title");
            if wins(self.versions.get(&key), other.versions.get(&key)) {
                self.state.board.columns[i].title = other.state.board.columns[i].title.clone();
            }
        }

        self.merge_cards(other);

        merge_keyed(
            &mut self.state.node_connections,
            &other.state.node_connections,
            "conn",
            &self.versions,
            &other.versions,
        );
        merge_keyed(
            &mut self.state.cursors,
            &other.state.cursors,
            "cursor",
            &self.versions,
            &other.versions,
        );

        for (key, stamp) in &other.versions {
            match self.versions.get(key) {
                Some(mine) if mine >= stamp => {}
                _ => {
                    self.versions.insert(key.clone(), stamp.clone());
                }
            }
        }
        self.clock.observe(&other.clock.stamp());

        self.state != before
    }

    fn merge_cards(&mut self, other: &BoardCrdt) {
        for (id, ocard) in &other.state.board.cards {
            let membership = format!("card/{id}");
            if let Some(card) = self.state.board.cards.get_mut(id) {
                let key = format!("card/{id}/title");
                if wins(self.versions.get(&key), other.versions.get(&key)) {
                    card.title = ocard.title.clone();
                }
                let key = format!("card/{id}/assignee");
                if wins(self.versions.get(&key), other.versions.get(&key)) {
                    card.assignee = ocard.assignee.clone();
                }
                let key = format!("card/{id}/column");
                if wins(self.versions.get(&key), other.versions.get(&key)) {
                    card.column_id = ocard.column_id.clone();
                }
                let key = format!("card/{id}/order");
                if wins(self.versions.get(&key), other.versions.get(&key)) {
                    card.order = ocard.order;
                }
                card.description.merge(&ocard.description);
            } else {
                let mine = self.versions.get(&membership);
                let adopt = mine.is_none() || wins(mine, other.versions.get(&membership));
                if adopt {
                    self.state.board.cards.insert(id.clone(), ocard.clone());
                }
            }
        }

        let dropped: Vec<String> = self
            .state
            .board
            .cards
            .keys()
            .filter(|id| !other.state.board.cards.contains_key(*id))
            .cloned()
            .collect();
        for id in dropped {
            let membership = format!("card/{id}");
            if wins(
                self.versions.get(&membership),
                other.versions.get(&membership),
            ) {
                self.state.board.cards.remove(&id);
            }
        }
    }
}

/// True when the other side's write supersedes ours: it has a stamp for
/// the path and ours is older or missing.
fn wins(mine: Option<&Hlc>, theirs: Option<&Hlc>) -> bool {
    match (mine, theirs) {
        (_, None) => false,
        (None, Some(_)) => true,
        (Some(m), Some(t)) => t > m,
    }
}

/// LWW union of a keyed set; a version entry without a live value is a
/// removal tombstone.
fn merge_keyed<T: Clone>(
    mine: &mut BTreeMap<String, T>,
    theirs: &BTreeMap<String, T>,
    prefix: &str,
    my_versions: &BTreeMap<String, Hlc>,
    their_versions: &BTreeMap<String, Hlc>,
) {
    for (id, value) in theirs {
        let key = format!("{prefix}/{id}");
        let m = my_versions.get(&key);
        let t = their_versions.get(&key);
        if mine.contains_key(id) {
            if wins(m, t) {
                mine.insert(id.clone(), value.clone());
            }
        } else if m.is_none() || wins(m, t) {
            mine.insert(id.clone(), value.clone());
        }
    }

    let stale: Vec<String> = mine
        .keys()
        .filter(|id| !theirs.contains_key(*id))
        .cloned()
        .collect();
    for id in stale {
        let key = format!("{prefix}/{id}");
        if wins(my_versions.get(&key), their_versions.get(&key)) {
            mine.remove(&id);
        }
    }
}

fn apply_change(state: &mut BoardState, change: &Change) -> bool {
    match change {
        Change::BoardId { value } => replace(&mut state.board.id, value),
        Change::BoardTitle { value } => replace(&mut state.board.title, value),
        Change::Columns { value } => {
            if state.board.columns != *value {
                state.board.columns = value.clone();
                true
            } else {
                false
            }
        }
        Change::ColumnTitle { index, value } => match state.board.columns.get_mut(*index) {
            Some(col) => replace(&mut col.title, value),
            None => false,
        },
        Change::CardAdd { card } => {
            let prev = state.board.cards.insert(card.id.clone(), card.clone());
            prev.as_ref() != Some(card)
        }
        Change::CardRemove { id } => state.board.cards.remove(id).is_some(),
        Change::CardTitle { id, value } => match state.board.cards.get_mut(id) {
            Some(card) => replace(&mut card.title, value),
            None => false,
        },
        Change::CardAssignee { id, value } => match state.board.cards.get_mut(id) {
            Some(card) => replace(&mut card.assignee, value),
            None => false,
        },
        Change::CardColumn { id, value } => match state.board.cards.get_mut(id) {
            Some(card) => replace(&mut card.column_id, value),
            None => false,
        },
        Change::CardOrder { id, value } => match state.board.cards.get_mut(id) {
            Some(card) => {
                if card.order != *value {
                    card.order = *value;
                    true
                } else {
                    false
                }
            }
            None => false,
        },
        Change::CardText { id, ops } => match state.board.cards.get_mut(id) {
            Some(card) => {
                let mut changed = false;
                for op in ops {
                    match op {
                        TextEdit::Delete { pos, len } => {
                            changed |= card.description.delete(*pos, *len);
                        }
                        TextEdit::Insert { pos, atoms } => {
                            changed |= card.description.splice(*pos, atoms);
                        }
                    }
                }
                changed
            }
            None => false,
        },
        Change::Connection { node_id, count } => {
            let conn = NodeConnection {
                node_id: node_id.clone(),
                count: *count,
            };
            let prev = state.node_connections.insert(node_id.clone(), conn.clone());
            prev.as_ref() != Some(&conn)
        }
        Change::ConnectionRemove { node_id } => state.node_connections.remove(node_id).is_some(),
        Change::CursorSet { cursor } => {
            let prev = state.cursors.insert(cursor.id.clone(), cursor.clone());
            prev.as_ref() != Some(cursor)
        }
        Change::CursorRemove { id } => state.cursors.remove(id).is_some(),
    }
}

fn replace(slot: &mut String, value: &str) -> bool {
    if slot != value {
        *slot = value.to_string();
        true
    } else {
        false
    }
}

/// Value-level diff between two snapshots.
fn diff_states(old: &BoardState, new: &BoardState) -> Vec<Change> {
    let mut changes = Vec::new();

    if old.board.id != new.board.id {
        changes.push(Change::BoardId {
            value: new.board.id.clone(),
        });
    }
    if old.board.title != new.board.title {
        changes.push(Change::BoardTitle {
            value: new.board.title.clone(),
        });
    }

    let structural = old.board.columns.len() != new.board.columns.len()
        || old
            .board
            .columns
            .iter()
            .zip(&new.board.columns)
            .any(|(a, b)| a.id != b.id);
    if structural {
        changes.push(Change::Columns {
            value: new.board.columns.clone(),
        });
    } else {
        for (index, (a, b)) in old.board.columns.iter().zip(&new.board.columns).enumerate() {
            if a.title != b.title {
                changes.push(Change::ColumnTitle {
                    index,
                    value: b.title.clone(),
                });
            }
        }
    }

    for (id, card) in &new.board.cards {
        match old.board.cards.get(id) {
            None => changes.push(Change::CardAdd { card: card.clone() }),
            Some(prev) => {
                if prev.title != card.title {
                    changes.push(Change::CardTitle {
                        id: id.clone(),
                        value: card.title.clone(),
                    });
                }
                if prev.assignee != card.assignee {
                    changes.push(Change::CardAssignee {
                        id: id.clone(),
                        value: card.assignee.clone(),
                    });
                }
                if prev.column_id != card.column_id {
                    changes.push(Change::CardColumn {
                        id: id.clone(),
                        value: card.column_id.clone(),
                    });
                }
                if prev.order != card.order {
                    changes.push(Change::CardOrder {
                        id: id.clone(),
                        value: card.order,
                    });
                }
                if prev.description != card.description {
                    changes.push(Change::CardText {
                        id: id.clone(),
                        ops: diff_text(&prev.description, &card.description),
                    });
                }
            }
        }
    }
    for id in old.board.cards.keys() {
        if !new.board.cards.contains_key(id) {
            changes.push(Change::CardRemove { id: id.clone() });
        }
    }

    for (id, conn) in &new.node_connections {
        if old.node_connections.get(id) != Some(conn) {
            changes.push(Change::Connection {
                node_id: conn.node_id.clone(),
                count: conn.count,
            });
        }
    }
    for id in old.node_connections.keys() {
        if !new.node_connections.contains_key(id) {
            changes.push(Change::ConnectionRemove {
                node_id: id.clone(),
            });
        }
    }

    for (id, cursor) in &new.cursors {
        if old.cursors.get(id) != Some(cursor) {
            changes.push(Change::CursorSet {
                cursor: cursor.clone(),
            });
        }
    }
    for id in old.cursors.keys() {
        if !new.cursors.contains_key(id) {
            changes.push(Change::CursorRemove { id: id.clone() });
        }
    }

    changes
}

/// Positional diff of two atom sequences: trim the common prefix and
/// suffix, ship the middle as one delete plus one insert.
fn diff_text(old: &Text, new: &Text) -> Vec<TextEdit> {
    let o = old.atoms();
    let n = new.atoms();

    let mut prefix = 0;
    while prefix < o.len() && prefix < n.len() && o[prefix] == n[prefix] {
        prefix += 1;
    }
    let mut suffix = 0;
    while suffix < o.len() - prefix
        && suffix < n.len() - prefix
        && o[o.len() - 1 - suffix] == n[n.len() - 1 - suffix]
    {
        suffix += 1;
    }

    let mut ops = Vec::new();
    let removed = o.len() - prefix - suffix;
    if removed > 0 {
        ops.push(TextEdit::Delete {
            pos: prefix,
            len: removed,
        });
    }
    let added = &n[prefix..n.len() - suffix];
    if !added.is_empty() {
        ops.push(TextEdit::Insert {
            pos: prefix,
            atoms: added.to_vec(),
        });
    }
    ops
}
