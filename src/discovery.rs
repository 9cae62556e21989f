/// Service-name peer discovery.
///
/// When the peer flag is a single bare hostname, that name is resolved
/// every 30 seconds and the peer list is replaced with `ip:8080` for
/// each returned address. Replicas behind one DNS name (a headless
/// service, a round-robin record) find each other this way.
use std::sync::Arc;
use std::time::Duration;

use tokio::net::lookup_host;
use tokio::sync::watch;

use crate::store::Store;

const RESOLVE_INTERVAL: Duration = Duration::from_secs(30);
const PEER_PORT: u16 = 8080;

pub fn spawn(store: Arc<Store>, service: String, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        log::info!("[discovery] starting peer discovery for service: {service}");
        let mut ticker = tokio::time::interval(RESOLVE_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => resolve_once(&store, &service).await,
                _ = shutdown.changed() => {
                    log::info!("[discovery] shutting down");
                    break;
                }
            }
        }
    });
}

async fn resolve_once(store: &Arc<Store>, service: &str) {
    match lookup_host((service, PEER_PORT)).await {
        Ok(addrs) => {
            let peers: Vec<String> = addrs
                .map(|addr| format!("{}:{}", addr.ip(), PEER_PORT))
                .collect();
            log::info!("[discovery] resolved {} peers: {:?}", peers.len(), peers);
            store.update_peers(peers);
        }
        Err(e) => log::warn!("[discovery] lookup for {service} failed: {e}"),
    }
}
