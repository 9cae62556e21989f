/// Board data model shared by the CRDT, the store, and the wire.
///
/// Cards refer to their column by id, never by reference, and keyed
/// collections are BTreeMaps so two converged replicas serialize their
/// snapshots to identical bytes.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::text::Text;

/// Gap between card order keys; new cards land at max + ORDER_STEP.
pub const ORDER_STEP: f64 = 1000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    pub id: String,
    pub title: String,
    pub description: Text,
    #[serde(default)]
    pub assignee: String,
    #[serde(rename = "columnID")]
    pub column_id: String,
    pub order: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Board {
    pub id: String,
    pub title: String,
    pub columns: Vec<Column>,
    pub cards: BTreeMap<String, Card>,
}

/// Live subscriber count reported by one replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConnection {
    #[serde(rename = "nodeID")]
    pub node_id: String,
    pub count: i64,
}

/// A client cursor parked on a card, keyed by connection id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    pub id: String,
    #[serde(rename = "nodeID")]
    pub node_id: String,
    pub card_id: String,
    pub pos: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardState {
    pub board: Board,
    #[serde(default)]
    pub node_connections: BTreeMap<String, NodeConnection>,
    #[serde(default)]
    pub cursors: BTreeMap<String, Cursor>,
}

impl BoardState {
    /// Largest order key among the cards of `column_id`.
    pub fn max_order(&self, column_id: &str) -> f64 {
        self.board
            .cards
            .values()
            .filter(|c| c.column_id == column_id)
            .map(|c| c.order)
            .fold(0.0, f64::max)
    }
}

/// (local, total) subscriber counts from a snapshot's connection set.
pub fn connection_counts(state: &BoardState, node_id: &str) -> (i64, i64) {
    let mut local = 0;
    let mut total = 0;
    for conn in state.node_connections.values() {
        if conn.node_id == node_id {
            local = conn.count;
        }
        total += conn.count;
    }
    (local, total)
}

/// The board every node starts from when its persistence slot is empty.
pub fn initial_board() -> BoardState {
    let mut cards = BTreeMap::new();
    cards.insert(
        "card-1".to_string(),
        Card {
            id: "card-1".to_string(),
            title: "Try Deep Library".to_string(),
            description: Text::seeded(
                "Explore the features of the deep library.",
                "system",
            ),
            assignee: String::new(),
            column_id: "todo".to_string(),
            order: ORDER_STEP,
        },
    );

    BoardState {
        board: Board {
            id: "main-board".to_string(),
            title: "DeepBoard Kanban".to_string(),
            columns: vec![
                Column {
                    id: "todo".to_string(),
                    title: "To Do".to_string(),
                },
                Column {
                    id: "in-progress".to_string(),
                    title: "In Progress".to_string(),
                },
                Column {
                    id: "done".to_string(),
                    title: "Done".to_string(),
                },
            ],
            cards,
        },
        node_connections: BTreeMap::new(),
        cursors: BTreeMap::new(),
    }
}
