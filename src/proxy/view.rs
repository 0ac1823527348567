//! Immutable views handed to the renderer.
//!
//! Every map is a `BTreeMap` so the renderer iterates in sorted order.

use std::collections::BTreeMap;

use crate::overlay::NodeId;

/// Where a peer's proxy accepts forwarded requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

/// Per-function data for the recalc configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecalcFunction {
    /// Declared max req/s on the local gateway; zero when the function is
    /// not deployed locally and exists only to be forwarded.
    pub limit: u32,
    /// Forwarding weight per peer.
    pub weights: BTreeMap<NodeId, u32>,
    /// Admitted req/s per peer (their share of our margin).
    pub limits_in: BTreeMap<NodeId, u32>,
}

/// View for the recalc strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct RecalcView {
    pub node_id: NodeId,
    pub gateway_host: String,
    pub gateway_port: u16,
    pub period_secs: u64,
    pub nodes: BTreeMap<NodeId, NodeAddress>,
    pub functions: BTreeMap<String, RecalcFunction>,
}

/// Per-function data for the weight-only strategies (node-margin, static).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeightedFunction {
    /// Forwarding weight per node; the local node appears under its own id.
    pub weights: BTreeMap<NodeId, u32>,
}

/// View for the node-margin and static strategies.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedView {
    pub node_id: NodeId,
    pub gateway_host: String,
    pub gateway_port: u16,
    pub period_secs: u64,
    pub nodes: BTreeMap<NodeId, NodeAddress>,
    pub functions: BTreeMap<String, WeightedFunction>,
}

/// View for the all-local strategy: function name to optional execution
/// timeout in milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct AllLocalView {
    pub node_id: NodeId,
    pub gateway_host: String,
    pub gateway_port: u16,
    pub functions: BTreeMap<String, Option<u64>>,
}
