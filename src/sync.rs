/// Peer gossip: periodic full-state pull plus the maintenance sweeps.
///
/// Push is delta-driven and lives on the store; the loops here recover
/// whatever pushes missed. Every loop runs on its own task and stops
/// when the shutdown watch flips.
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::crdt::{BoardCrdt, Delta};
use crate::store::Store;

const PULL_INTERVAL: Duration = Duration::from_secs(30);
const CONNECTION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const SUBSCRIBER_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Spawn the background loops for one store. The subscriber sweep
/// always runs; peer loops only when peers are configured (discovery
/// may fill the list later, so "configured" means the flag at startup).
pub fn spawn_tasks(store: Arc<Store>, gossip: bool, shutdown: watch::Receiver<bool>) {
    {
        let store = store.clone();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SUBSCRIBER_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => store.sweep_subscribers(),
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    if !gossip {
        return;
    }

    {
        let store = store.clone();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            let client = reqwest::Client::new();
            let mut ticker = tokio::time::interval(PULL_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => pull_from_peers(&store, &client).await,
                    _ = shutdown.changed() => {
                        log::info!("[sync] pull loop shutting down");
                        break;
                    }
                }
            }
        });
    }

    {
        let mut shutdown = shutdown;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CONNECTION_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => store.cleanup_connections(),
                    _ = shutdown.changed() => break,
                }
            }
        });
    }
}

/// Fetch each peer's full CRDT and merge it in. A failed pull is a
/// no-op; a merge that changed anything pings the peers so their
/// clients re-render too.
async fn pull_from_peers(store: &Arc<Store>, client: &reqwest::Client) {
    let peers = store.get_peers();
    let mut merged_any = false;
    for peer in peers {
        let url = format!("http://{peer}/api/state");
        let remote = match client.get(&url).send().await {
            Ok(resp) => resp.json::<BoardCrdt>().await,
            Err(e) => {
                log::warn!("[sync] pull from {peer} failed: {e}");
                continue;
            }
        };
        match remote {
            Ok(crdt) => {
                if store.merge(&crdt) {
                    merged_any = true;
                }
            }
            Err(e) => log::warn!("[sync] bad state payload from {peer}: {e}"),
        }
    }
    if merged_any {
        store.push_to_peers(Delta::refresh_ping(store.current_stamp()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::connection_counts;

    fn temp_store(node: &str) -> (Arc<Store>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(&dir.path().join("board.db"), node, Vec::new()).unwrap();
        (Arc::new(store), dir)
    }

    #[tokio::test]
    async fn pull_merges_nothing_when_no_peers() {
        let (store, _dir) = temp_store("node-1");
        let before = store.get_board();
        pull_from_peers(&store, &reqwest::Client::new()).await;
        assert_eq!(store.get_board(), before);
    }

    #[tokio::test]
    async fn shutdown_stops_the_loops() {
        let (store, _dir) = temp_store("node-1");
        let (tx, rx) = watch::channel(false);
        spawn_tasks(store, true, rx);
        tx.send(true).unwrap();
        // Give the tasks a moment to observe the flip and exit.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn cleanup_drops_unknown_nodes_but_keeps_self() {
        let (store, _dir) = temp_store("node-1");
        store.silent_edit(|bs, _| {
            bs.node_connections.insert(
                "ghost".to_string(),
                crate::types::NodeConnection {
                    node_id: "ghost".to_string(),
                    count: 3,
                },
            );
        });
        store.cleanup_connections();

        let state = store.get_board();
        assert!(!state.node_connections.contains_key("ghost"));
        let (local, total) = connection_counts(&state, "node-1");
        assert_eq!(local, 0);
        assert_eq!(total, 0);
    }
}
