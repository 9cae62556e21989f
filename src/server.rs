/// HTTP server: board views, peer sync endpoints, and the WebSocket
/// channel clients submit edit intents over.
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{Html, IntoResponse, Redirect},
    routing::{get, post},
    Form, Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::crdt::Delta;
use crate::store::Store;
use crate::types::{connection_counts, BoardState, Cursor};

const HISTORY_VIEW_LIMIT: usize = 15;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
}

/// Messages clients send over the WebSocket. At most one payload field
/// is present, discriminated by `type`; unknown variants are dropped as
/// decode errors.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum ClientMessage {
    Move {
        #[serde(rename = "move")]
        op: MoveOp,
    },
    TextOp {
        #[serde(rename = "textOp")]
        op: TextOp,
    },
    Delete {
        #[serde(rename = "delete")]
        op: DeleteOp,
    },
    Cursor {
        #[serde(rename = "cursor")]
        op: CursorOp,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MoveOp {
    card_id: String,
    #[serde(default)]
    #[allow(dead_code)]
    from: String,
    to: String,
    #[serde(default)]
    to_index: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TextOp {
    card_id: String,
    op: String,
    #[serde(default)]
    pos: usize,
    #[serde(default)]
    val: String,
    #[serde(default)]
    length: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteOp {
    card_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CursorOp {
    card_id: String,
    #[serde(default)]
    pos: usize,
}

#[derive(Debug, Deserialize)]
struct AddCardForm {
    #[serde(default)]
    title: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CardView {
    id: String,
    title: String,
    description: String,
    assignee: String,
    #[serde(rename = "columnID")]
    column_id: String,
    order: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ColumnView {
    id: String,
    title: String,
    cards: Vec<CardView>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BoardView {
    #[serde(rename = "nodeID")]
    node_id: String,
    id: String,
    title: String,
    columns: Vec<ColumnView>,
    local_count: i64,
    total_count: i64,
    cursors: Vec<Cursor>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index))
        .route("/ws", get(ws_handler))
        .route("/board", get(board))
        .route("/stats", get(stats))
        .route("/history", get(history))
        .route("/api/add", post(add_card))
        .route("/api/sync", post(sync_delta))
        .route("/api/state", get(full_state))
        .route("/api/history/clear", post(clear_history))
        .route("/api/connections/cleanup", post(cleanup_connections))
        .route("/api/admin/reset", post(admin_reset))
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until the shutdown watch flips.
pub async fn serve(
    state: AppState,
    addr: &str,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), std::io::Error> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("[server] listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
}

fn board_view(state: &BoardState, node_id: &str) -> BoardView {
    let (local_count, total_count) = connection_counts(state, node_id);
    let columns = state
        .board
        .columns
        .iter()
        .map(|col| {
            let mut cards: Vec<CardView> = state
                .board
                .cards
                .values()
                .filter(|card| card.column_id == col.id)
                .map(|card| CardView {
                    id: card.id.clone(),
                    title: card.title.clone(),
                    description: card.description.to_string(),
                    assignee: card.assignee.clone(),
                    column_id: card.column_id.clone(),
                    order: card.order,
                })
                .collect();
            cards.sort_by(|a, b| a.order.total_cmp(&b.order));
            ColumnView {
                id: col.id.clone(),
                title: col.title.clone(),
                cards,
            }
        })
        .collect();

    BoardView {
        node_id: node_id.to_string(),
        id: state.board.id.clone(),
        title: state.board.title.clone(),
        columns,
        local_count,
        total_count,
        cursors: state.cursors.values().cloned().collect(),
    }
}

async fn index(State(state): State<AppState>) -> Html<String> {
    let snapshot = state.store.get_board();
    let (local, total) = connection_counts(&snapshot, state.store.node_id());
    Html(format!(
        "<!doctype html>\n<html><head><title>{title}</title></head><body>\n\
         <h1>{title}</h1>\n\
         <p id=\"conn-counts\">Node {node} &mdash; Local: {local} | Total: {total}</p>\n\
         <p>Board: <a href=\"/board\">/board</a> &middot; History: <a href=\"/history\">/history</a></p>\n\
         </body></html>\n",
        title = snapshot.board.title,
        node = state.store.node_id(),
    ))
}

async fn board(State(state): State<AppState>) -> Json<BoardView> {
    let snapshot = state.store.get_board();
    Json(board_view(&snapshot, state.store.node_id()))
}

async fn stats(State(state): State<AppState>) -> String {
    let snapshot = state.store.get_board();
    let (local, total) = connection_counts(&snapshot, state.store.node_id());
    format!("Local: {local} | Total: {total}")
}

async fn history(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.store.get_history(HISTORY_VIEW_LIMIT))
}

async fn add_card(State(state): State<AppState>, Form(form): Form<AddCardForm>) -> Redirect {
    let title = if form.title.is_empty() {
        "New Task"
    } else {
        form.title.as_str()
    };
    state.store.add_card(title);
    Redirect::to("/")
}

/// Inbound peer delta. An empty patch is a refresh-only ping from a
/// peer's merge.
async fn sync_delta(State(state): State<AppState>, Json(delta): Json<Delta>) -> StatusCode {
    if delta.patch.is_empty() {
        state.store.broadcast_refresh(false);
        return StatusCode::OK;
    }
    state.store.apply_delta(&delta);
    StatusCode::OK
}

/// Full serialized CRDT for pulling peers.
async fn full_state(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.snapshot())
}

async fn clear_history(State(state): State<AppState>) -> StatusCode {
    state.store.clear_history();
    StatusCode::OK
}

async fn cleanup_connections(State(state): State<AppState>) -> StatusCode {
    state.store.cleanup_connections();
    StatusCode::OK
}

async fn admin_reset(State(state): State<AppState>) -> StatusCode {
    log::info!("[server] admin reset requested");
    state.store.reset();
    StatusCode::OK
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session(socket, state))
}

async fn handle_session(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let conn_id = Uuid::new_v4().to_string();

    let subscription = state.store.subscribe();
    let sub_id = subscription.id;
    let mut refresh_rx = subscription.rx;
    log::info!("[server] websocket client {conn_id} connected");

    // Forward refresh notifications to the socket.
    let write_task = tokio::spawn(async move {
        while let Some(msg) = refresh_rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(_) => continue,
            };
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Dispatch client intents.
    let store = state.store.clone();
    let node_id = store.node_id().to_string();
    let cursor_conn = conn_id.clone();
    let read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            let text = match msg {
                Message::Text(text) => text.to_string(),
                Message::Close(_) => break,
                _ => continue,
            };
            store.heartbeat(sub_id);

            let parsed: ClientMessage = match serde_json::from_str(&text) {
                Ok(parsed) => parsed,
                Err(e) => {
                    log::debug!("[server] dropping malformed client message: {e}");
                    continue;
                }
            };
            match parsed {
                ClientMessage::Move { op } => {
                    store.move_card(&op.card_id, &op.to, op.to_index);
                }
                ClientMessage::TextOp { op } => {
                    store.update_card_text(&op.card_id, &op.op, &op.val, op.pos, op.length);
                }
                ClientMessage::Delete { op } => {
                    store.delete_card(&op.card_id);
                }
                ClientMessage::Cursor { op } => {
                    store.set_cursor(Cursor {
                        id: cursor_conn.clone(),
                        node_id: node_id.clone(),
                        card_id: op.card_id,
                        pos: op.pos,
                    });
                }
            }
        }
    });

    // Whichever side finishes first tears the session down.
    let mut write_task = write_task;
    let mut read_task = read_task;
    tokio::select! {
        _ = &mut write_task => { read_task.abort(); }
        _ = &mut read_task => { write_task.abort(); }
    }

    state.store.unsubscribe(sub_id);
    state.store.remove_cursor(&conn_id);
    log::info!("[server] websocket client {conn_id} disconnected");
}
