//! Peer entry flavor used by the recalc strategy.

use std::collections::HashMap;
use std::time::Instant;

use crate::peers::PeerRecord;

/// What we know and decide about one function on one peer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FuncData {
    /// Max req/s we accept from that peer for this function (our decision).
    pub limit_in: f64,
    /// Max req/s the peer accepts from us (its advertisement).
    pub limit_out: f64,
    /// Forwarding weight toward that peer for this function (our decision).
    pub weight: u32,
}

/// One row of the recalc-flavor peer table.
#[derive(Debug, Clone)]
pub struct RecalcEntry {
    /// Time of the last message received from the peer.
    pub t_alive: Instant,
    /// Where the peer's proxy accepts forwarded requests.
    pub proxy_host: String,
    pub proxy_port: u16,
    /// Per-function limits and weights, keyed by function name.
    pub funcs: HashMap<String, FuncData>,
}

impl RecalcEntry {
    pub fn new() -> Self {
        Self {
            t_alive: Instant::now(),
            proxy_host: String::new(),
            proxy_port: 0,
            funcs: HashMap::new(),
        }
    }

    /// Apply a peer's advertisement: refresh liveness and address, drop
    /// functions the peer no longer mentions, and record the advertised
    /// limits as `limit_out`. Functions new to us start with zero
    /// `limit_in` and weight.
    pub fn apply_advertisement(
        &mut self,
        proxy_host: &str,
        proxy_port: u16,
        limits: &HashMap<String, f64>,
    ) {
        self.t_alive = Instant::now();
        self.proxy_host = proxy_host.to_string();
        self.proxy_port = proxy_port;

        self.funcs.retain(|name, _| limits.contains_key(name));

        for (name, &limit) in limits {
            match self.funcs.get_mut(name) {
                Some(data) => data.limit_out = limit,
                None => {
                    self.funcs.insert(
                        name.clone(),
                        FuncData {
                            limit_in: 0.0,
                            limit_out: limit,
                            weight: 0,
                        },
                    );
                }
            }
        }
    }
}

impl Default for RecalcEntry {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerRecord for RecalcEntry {
    fn last_seen(&self) -> Instant {
        self.t_alive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advertisement_reconstructs_limit_out() {
        let mut entry = RecalcEntry::new();
        let limits = HashMap::from([("figlet".to_string(), 60.0), ("shasum".to_string(), 0.0)]);
        entry.apply_advertisement("192.0.2.7", 80, &limits);

        assert_eq!(entry.proxy_host, "192.0.2.7");
        assert_eq!(entry.funcs["figlet"].limit_out, 60.0);
        assert_eq!(entry.funcs["figlet"].limit_in, 0.0);
        assert_eq!(entry.funcs["figlet"].weight, 0);
        assert_eq!(entry.funcs["shasum"].limit_out, 0.0);
    }

    #[test]
    fn test_advertisement_is_idempotent() {
        let mut entry = RecalcEntry::new();
        let limits = HashMap::from([("figlet".to_string(), 60.0)]);
        entry.apply_advertisement("192.0.2.7", 80, &limits);
        let first = entry.funcs.clone();
        entry.apply_advertisement("192.0.2.7", 80, &limits);
        assert_eq!(entry.funcs, first);
    }

    #[test]
    fn test_dropped_functions_are_removed() {
        let mut entry = RecalcEntry::new();
        entry.apply_advertisement(
            "192.0.2.7",
            80,
            &HashMap::from([("figlet".to_string(), 60.0), ("shasum".to_string(), 10.0)]),
        );
        entry.apply_advertisement("192.0.2.7", 80, &HashMap::from([("figlet".to_string(), 50.0)]));

        assert!(!entry.funcs.contains_key("shasum"));
        assert_eq!(entry.funcs["figlet"].limit_out, 50.0);
    }

    #[test]
    fn test_update_preserves_our_decisions() {
        let mut entry = RecalcEntry::new();
        entry.apply_advertisement("192.0.2.7", 80, &HashMap::from([("figlet".to_string(), 60.0)]));
        entry.funcs.get_mut("figlet").unwrap().limit_in = 33.0;
        entry.funcs.get_mut("figlet").unwrap().weight = 70;

        entry.apply_advertisement("192.0.2.7", 80, &HashMap::from([("figlet".to_string(), 45.0)]));
        let data = &entry.funcs["figlet"];
        assert_eq!(data.limit_out, 45.0);
        assert_eq!(data.limit_in, 33.0);
        assert_eq!(data.weight, 70);
    }

    #[test]
    fn test_t_alive_is_monotonic() {
        let mut entry = RecalcEntry::new();
        let before = entry.t_alive;
        entry.apply_advertisement("h", 80, &HashMap::new());
        assert!(entry.t_alive >= before);
    }
}
