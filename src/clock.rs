/// Hybrid logical clock: per-replica monotone counter tagged with the
/// node id. Stamps order deltas and text atoms across replicas.
use serde::{Deserialize, Serialize};

/// A single clock reading. Totally ordered by `(counter, node_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hlc {
    pub counter: u64,
    pub node_id: String,
}

impl Hlc {
    pub fn new(counter: u64, node_id: impl Into<String>) -> Self {
        Self {
            counter,
            node_id: node_id.into(),
        }
    }
}

impl std::fmt::Display for Hlc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.counter, self.node_id)
    }
}

/// The ticking source for one replica. Advanced on every local edit and
/// on observation of any remote stamp, so local stamps always sort after
/// everything the replica has seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HybridClock {
    pub node_id: String,
    counter: u64,
}

impl HybridClock {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            counter: 0,
        }
    }

    /// Advance the counter and return the new reading.
    pub fn now(&mut self) -> Hlc {
        self.counter += 1;
        Hlc::new(self.counter, self.node_id.clone())
    }

    /// Fold a remote stamp into the local counter: the next `now()` is
    /// guaranteed to sort after `remote`.
    pub fn observe(&mut self, remote: &Hlc) {
        self.counter = self.counter.max(remote.counter) + 1;
    }

    /// Current reading without advancing.
    pub fn stamp(&self) -> Hlc {
        Hlc::new(self.counter, self.node_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_strictly_increasing() {
        let mut clock = HybridClock::new("node-1");
        let a = clock.now();
        let b = clock.now();
        assert!(b > a);
    }

    #[test]
    fn total_order_breaks_ties_by_node_id() {
        let a = Hlc::new(5, "node-1");
        let b = Hlc::new(5, "node-2");
        assert!(a < b);
        assert!(Hlc::new(6, "node-1") > b);
    }

    #[test]
    fn observe_jumps_past_remote() {
        let mut clock = HybridClock::new("node-1");
        clock.now();
        clock.observe(&Hlc::new(41, "node-2"));
        assert_eq!(clock.now(), Hlc::new(43, "node-1"));
    }

    #[test]
    fn observe_of_older_stamp_still_advances() {
        let mut clock = HybridClock::new("node-1");
        for _ in 0..10 {
            clock.now();
        }
        clock.observe(&Hlc::new(3, "node-2"));
        assert!(clock.stamp().counter > 10);
    }
}
