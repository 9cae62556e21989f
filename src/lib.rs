//! DeepBoard: a multi-node collaborative kanban service.
//!
//! Every process holds a full replica of the board. Clients connect to
//! any replica over WebSocket and submit edit intents; replicas
//! converge through delta push plus periodic full-state pull, and each
//! one persists its state locally.
//!
//! Modules:
//! - [`clock`] — hybrid logical clock stamping every change
//! - [`text`] — sequence CRDT for card descriptions
//! - [`types`] — board data model and seed state
//! - [`crdt`] — board-level CRDT: diffs, deltas, merge
//! - [`storage`] — durable latest-state slot + patch history
//! - [`store`] — the serialized edit pipeline
//! - [`subscribers`] — refresh fan-out to connected clients
//! - [`sync`] / [`discovery`] — peer gossip and peer discovery
//! - [`server`] — HTTP + WebSocket surface

pub mod clock;
pub mod config;
pub mod crdt;
pub mod discovery;
pub mod server;
pub mod storage;
pub mod store;
pub mod subscribers;
pub mod sync;
pub mod text;
pub mod types;

use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;

pub async fn run() {
    env_logger::init();

    let args = config::Args::parse();
    let node_id = args.resolve_node_id();
    let peers = args.peer_list();

    let store = match store::Store::new(&args.db, &node_id, peers.clone()) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            log::error!("[main] failed to initialize store: {e}");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if let Some(service) = args.discovery_service() {
        discovery::spawn(store.clone(), service, shutdown_rx.clone());
    }
    sync::spawn_tasks(store.clone(), !peers.is_empty(), shutdown_rx.clone());

    let bind = args.bind_addr();
    log::info!("[main] starting on http://{bind} (node id: {node_id})");
    if !peers.is_empty() {
        log::info!("[main] peers: {peers:?}");
    }

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("[main] shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let state = server::AppState {
        store: store.clone(),
    };
    if let Err(e) = server::serve(state, &bind, shutdown_rx).await {
        log::error!("[main] server failed: {e}");
        std::process::exit(1);
    }
    log::info!("[main] shutdown complete");
}
