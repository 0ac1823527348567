//! Peer entry flavor shared by the node-margin and static strategies.

use std::time::Instant;

use crate::peers::PeerRecord;
use crate::telemetry::{GroupsLoad, NodeMetrics};

/// One row of the margin-flavor peer table.
#[derive(Debug, Clone)]
pub struct MarginEntry {
    /// Time of the last message received from the peer.
    pub t_alive: Instant,
    /// Where the peer's proxy accepts forwarded requests.
    pub proxy_host: String,
    pub proxy_port: u16,
    /// True once the peer shares at least one function with us.
    pub common_neighbour: bool,
    /// Hardware class the peer reported (heavy=0, mid=1, light=2).
    pub node_type: i32,
    /// Functions deployed on the peer.
    pub funcs: Vec<String>,
    /// Per-group load the peer advertised with its margin.
    pub load: GroupsLoad,
    /// Spare capacity (in %) the peer offers each common neighbour.
    pub margin: f64,
    /// Overload thresholds the peer evaluates its forecasts against.
    pub max_values: NodeMetrics,
}

impl MarginEntry {
    pub fn new() -> Self {
        Self {
            t_alive: Instant::now(),
            proxy_host: String::new(),
            proxy_port: 0,
            common_neighbour: false,
            node_type: 0,
            funcs: Vec::new(),
            load: GroupsLoad::default(),
            margin: 0.0,
            max_values: NodeMetrics::default(),
        }
    }

    /// Apply a peer's node-info advertisement.
    pub fn apply_node_info(
        &mut self,
        proxy_host: &str,
        proxy_port: u16,
        node_type: i32,
        max_values: NodeMetrics,
        funcs: Vec<String>,
    ) {
        self.t_alive = Instant::now();
        self.proxy_host = proxy_host.to_string();
        self.proxy_port = proxy_port;
        self.node_type = node_type;
        self.max_values = max_values;
        self.funcs = funcs;
    }

    /// Apply a peer's margin advertisement.
    pub fn apply_margin_info(&mut self, margin: f64, load: GroupsLoad) {
        self.t_alive = Instant::now();
        self.margin = margin;
        self.load = load;
    }
}

impl Default for MarginEntry {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerRecord for MarginEntry {
    fn last_seen(&self) -> Instant {
        self.t_alive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_info_updates_identity_fields() {
        let mut entry = MarginEntry::new();
        entry.apply_node_info(
            "192.0.2.9",
            80,
            2,
            NodeMetrics {
                cpu: 80.0,
                ram: 80.0,
                power: 80.0,
            },
            vec!["figlet".into()],
        );

        assert_eq!(entry.proxy_host, "192.0.2.9");
        assert_eq!(entry.node_type, 2);
        assert_eq!(entry.funcs, vec!["figlet".to_string()]);
        assert!(!entry.common_neighbour);
        assert_eq!(entry.margin, 0.0);
    }

    #[test]
    fn test_margin_info_updates_margin_and_load() {
        let mut entry = MarginEntry::new();
        entry.apply_margin_info(
            6.25,
            GroupsLoad {
                high: 10.0,
                low: 1.0,
                medium: 2.0,
            },
        );
        assert_eq!(entry.margin, 6.25);
        assert_eq!(entry.load.high, 10.0);
        assert_eq!(entry.load.medium, 2.0);
        assert_eq!(entry.load.low, 1.0);
    }
}
