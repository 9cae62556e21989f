//! HTTP surface: peer sync endpoints and board views over a live server.
use std::net::SocketAddr;
use std::sync::Arc;

use deepboard::crdt::{BoardCrdt, Delta};
use deepboard::server::{router, AppState};
use deepboard::store::Store;

async fn spawn_server(node_id: &str) -> (SocketAddr, Arc<Store>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::new(&dir.path().join("board.db"), node_id, Vec::new()).unwrap());

    let app = router(AppState {
        store: store.clone(),
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, store, dir)
}

#[tokio::test]
async fn state_endpoint_serves_the_full_crdt() {
    let (addr, _store, _dir) = spawn_server("node-http").await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("http://{addr}/api/state"))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());

    let crdt: BoardCrdt = resp.json().await.unwrap();
    assert_eq!(crdt.view().board.id, "main-board");
}

#[tokio::test]
async fn pushed_delta_is_applied() {
    let (addr, store, _dir) = spawn_server("node-http").await;

    let other_dir = tempfile::tempdir().unwrap();
    let other = Store::new(&other_dir.path().join("board.db"), "node-other", Vec::new()).unwrap();
    let delta = other.edit(|bs, _| bs.board.title = "Pushed Over HTTP".to_string());

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/api/sync"))
        .json(&delta)
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    assert_eq!(store.get_board().board.title, "Pushed Over HTTP");
}

#[tokio::test]
async fn empty_delta_is_a_refresh_ping() {
    let (addr, store, _dir) = spawn_server("node-http").await;
    let before = store.get_board();

    let ping = Delta::refresh_ping(store.current_stamp());
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/api/sync"))
        .json(&ping)
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    assert_eq!(store.get_board(), before);
}

#[tokio::test]
async fn malformed_delta_is_rejected_without_state_change() {
    let (addr, store, _dir) = spawn_server("node-http").await;
    let before = store.get_board();

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/api/sync"))
        .header("content-type", "application/json")
        .body("{\"not\": \"a delta\"}")
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_client_error());
    assert_eq!(store.get_board(), before);
}

#[tokio::test]
async fn board_and_stats_views_render() {
    let (addr, _store, _dir) = spawn_server("node-http").await;
    let client = reqwest::Client::new();

    let stats = client
        .get(format!("http://{addr}/stats"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(stats, "Local: 0 | Total: 0");

    let board: serde_json::Value = client
        .get(format!("http://{addr}/board"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(board["id"], "main-board");
    assert_eq!(board["columns"].as_array().unwrap().len(), 3);
    assert_eq!(board["columns"][0]["cards"][0]["id"], "card-1");
}

#[tokio::test]
async fn add_endpoint_creates_a_card_and_redirects_home() {
    let (addr, store, _dir) = spawn_server("node-http").await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{addr}/api/add"))
        .form(&[("title", "From HTTP")])
        .send()
        .await
        .unwrap();
    // The redirect lands back on the index page.
    assert!(resp.status().is_success());

    let cards = store.get_board().board.cards;
    assert!(cards.values().any(|c| c.title == "From HTTP"));
}

#[tokio::test]
async fn history_and_admin_endpoints_work() {
    let (addr, store, _dir) = spawn_server("node-http").await;
    store.add_card("For history");
    let client = reqwest::Client::new();

    let history: Vec<String> = client
        .get(format!("http://{addr}/history"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history.len(), 1);

    let resp = client
        .post(format!("http://{addr}/api/history/clear"))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    assert!(store.get_history(10).is_empty());

    let resp = client
        .post(format!("http://{addr}/api/admin/reset"))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    assert_eq!(store.get_board().board.cards.len(), 1);
}

#[tokio::test]
async fn two_servers_converge_through_pull_style_merge() {
    let (addr1, _store1, _dir1) = spawn_server("node-a").await;
    let (addr2, store2, _dir2) = spawn_server("node-b").await;

    let client = reqwest::Client::new();
    let other_dir = tempfile::tempdir().unwrap();
    let editor = Store::new(&other_dir.path().join("board.db"), "node-editor", Vec::new()).unwrap();
    let delta = editor.edit(|bs, _| bs.board.title = "Meshed".to_string());

    // Push the edit to the first server only.
    client
        .post(format!("http://{addr1}/api/sync"))
        .json(&delta)
        .send()
        .await
        .unwrap();

    // Second server pulls the first one's full state and merges it.
    let remote: BoardCrdt = client
        .get(format!("http://{addr1}/api/state"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(store2.merge(&remote));
    assert_eq!(store2.get_board().board.title, "Meshed");
}
