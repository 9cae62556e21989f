/// Process configuration: CLI flags plus env-based node identity.
use std::path::PathBuf;

use clap::Parser;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "deepboard", about = "Replicated collaborative kanban board")]
pub struct Args {
    /// HTTP listen address
    #[arg(long, default_value = ":8080")]
    pub addr: String,

    /// Path to the persistence database
    #[arg(long, default_value = "deepboard.db")]
    pub db: PathBuf,

    /// Comma-separated peer addresses, or a single service hostname to
    /// resolve peers from
    #[arg(long, default_value = "")]
    pub peers: String,

    /// Unique identifier for this node (random UUID when omitted)
    #[arg(long)]
    pub node_id: Option<String>,

    /// Read the node id from the env var named by NODE_ID_ENV
    /// (default HOSTNAME)
    #[arg(long)]
    pub node_id_from_env: bool,
}

impl Args {
    pub fn resolve_node_id(&self) -> String {
        if self.node_id_from_env {
            let mut var = std::env::var("NODE_ID_ENV").unwrap_or_default();
            if var.is_empty() {
                var = "HOSTNAME".to_string();
            }
            match std::env::var(&var) {
                Ok(id) if !id.is_empty() => return id,
                _ => log::warn!("[config] node-id-from-env set but {var} is empty"),
            }
        }
        self.node_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    }

    pub fn peer_list(&self) -> Vec<String> {
        if self.peers.is_empty() {
            return Vec::new();
        }
        self.peers
            .split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect()
    }

    /// A single peer entry without a port is a discovery service name.
    pub fn discovery_service(&self) -> Option<String> {
        match self.peer_list().as_slice() {
            [single] if !single.contains(':') => Some(single.clone()),
            _ => None,
        }
    }

    /// `:8080` style addresses bind every interface.
    pub fn bind_addr(&self) -> String {
        if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["deepboard"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn defaults() {
        let args = args(&[]);
        assert_eq!(args.bind_addr(), "0.0.0.0:8080");
        assert_eq!(args.db, PathBuf::from("deepboard.db"));
        assert!(args.peer_list().is_empty());
        assert!(args.discovery_service().is_none());
    }

    #[test]
    fn peer_list_splits_on_commas() {
        let args = args(&["--peers", "10.0.0.1:8080, 10.0.0.2:8080"]);
        assert_eq!(args.peer_list(), vec!["10.0.0.1:8080", "10.0.0.2:8080"]);
        assert!(args.discovery_service().is_none());
    }

    #[test]
    fn bare_hostname_is_a_discovery_service() {
        let args = args(&["--peers", "deepboard-headless"]);
        assert_eq!(
            args.discovery_service(),
            Some("deepboard-headless".to_string())
        );
    }

    #[test]
    fn explicit_node_id_wins_without_env_flag() {
        let args = args(&["--node-id", "node-7"]);
        assert_eq!(args.resolve_node_id(), "node-7");
    }

    #[test]
    fn node_id_from_env_reads_named_variable() {
        std::env::set_var("NODE_ID_ENV", "DEEPBOARD_TEST_NODE_ID");
        std::env::set_var("DEEPBOARD_TEST_NODE_ID", "pod-3");
        let args = args(&["--node-id-from-env"]);
        assert_eq!(args.resolve_node_id(), "pod-3");
        std::env::remove_var("NODE_ID_ENV");
        std::env::remove_var("DEEPBOARD_TEST_NODE_ID");
    }

    #[test]
    fn random_node_ids_are_unique() {
        let args = args(&[]);
        assert_ne!(args.resolve_node_id(), args.resolve_node_id());
    }
}
