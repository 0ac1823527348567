//! Load-balancing strategies.
//!
//! # Data Flow
//! ```text
//! wall-clock alignment ──▶ tick:
//!     observe (gateway, stick-tables, metrics, forecaster)
//!     decide  (limits, weights)
//!     publish (node info on the overlay topic)
//!     render  (proxy configuration ──▶ Data Plane API)
//! ```
//!
//! # Design Decisions
//! - The strategy set is closed; dispatch is an enum, not a trait object
//! - One strategy instance per process, built once in the agent and shared
//!   between the tick runner and the receiver loop
//! - A failed tick is abandoned, logged, and retried after a short back-off
//! - Per-tick working state lives on the tick's stack; only the peer table
//!   carries information across ticks

pub mod all_local;
pub mod node_margin;
pub mod recalc;
pub mod static_split;

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::broadcast;

use crate::config::{AgentConfig, StrategyKind};
use crate::messages::{CodecError, Message};
use crate::overlay::{NodeId, OverlayError, OverlayHandle};
use crate::peers::{MarginEntry, PeerTable};
use crate::proxy::{DataPlaneClient, ProxyError};
use crate::telemetry::{
    ForecasterClient, GatewayClient, NodeMetrics, PromClient, StickTableReader, TelemetryError,
};

pub use all_local::AllLocalStrategy;
pub use node_margin::NodeMarginStrategy;
pub use recalc::RecalcStrategy;
pub use static_split::StaticStrategy;

/// Pause after a failed tick before the next attempt.
pub(crate) const FAILED_TICK_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum StrategyError {
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error(transparent)]
    Overlay(#[from] OverlayError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// The slice of configuration every strategy needs.
#[derive(Debug, Clone)]
pub struct StrategySettings {
    /// Tick interval.
    pub period: Duration,
    /// Public proxy address advertised to peers.
    pub advertised_host: String,
    pub advertised_port: u16,
    /// Local gateway address written into rendered configurations.
    pub gateway_host: String,
    pub gateway_port: u16,
}

impl StrategySettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            period: config.recalc_period,
            advertised_host: config.haproxy_host.clone(),
            advertised_port: config.haproxy_port,
            gateway_host: config.openfaas_host.clone(),
            gateway_port: config.openfaas_port,
        }
    }
}

/// Sleep duration until the next tick boundary.
///
/// Boundaries are multiples of `period` on the wall clock, shifted back by
/// `offset`; the recalc strategy uses a half-period offset for its second
/// phase so all nodes publish limits before any node derives weights.
pub(crate) fn time_to_boundary(period: Duration, offset: Duration) -> Duration {
    let interval = period.as_millis().max(1) as u64;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let elapsed = (now + offset.as_millis() as u64) % interval;
    Duration::from_millis(interval - elapsed)
}

/// Mark peers sharing at least one function with us as common neighbours
/// and collect the shared functions per peer.
///
/// Returns the target map (peer id to shared function names) and the number
/// of common neighbours.
pub(crate) fn update_common_neighbours(
    table: &PeerTable<MarginEntry>,
    funcs: &[String],
) -> (HashMap<NodeId, Vec<String>>, usize) {
    table.with_entries(|entries| {
        let mut targets: HashMap<NodeId, Vec<String>> = HashMap::new();
        for (id, entry) in entries.iter_mut() {
            let shared: Vec<String> = funcs
                .iter()
                .filter(|f| entry.funcs.contains(f))
                .cloned()
                .collect();
            if !shared.is_empty() {
                entry.common_neighbour = true;
                targets.insert(id.clone(), shared);
            }
        }
        let count = targets.len();
        (targets, count)
    })
}

/// The process-wide strategy instance, selected at startup.
pub enum ActiveStrategy {
    Recalc(RecalcStrategy),
    NodeMargin(NodeMarginStrategy),
    Static(StaticStrategy),
    AllLocal(AllLocalStrategy),
}

impl ActiveStrategy {
    /// Construct the strategy the configuration asks for, wiring up its
    /// collaborator clients.
    pub fn build(config: &AgentConfig, overlay: OverlayHandle) -> Self {
        let settings = StrategySettings::from_config(config);
        let period = config.recalc_period;

        let gateway = || {
            GatewayClient::new(
                config.gateway_url(),
                config.openfaas_user.clone(),
                config.openfaas_pass.clone(),
            )
        };
        let sticktables = || {
            StickTableReader::new(
                config.dataplane_url(),
                config.haproxy_user.clone(),
                config.haproxy_pass.clone(),
            )
        };
        let dataplane = || {
            DataPlaneClient::new(
                config.dataplane_url(),
                config.haproxy_user.clone(),
                config.haproxy_pass.clone(),
            )
        };

        match config.strategy {
            StrategyKind::Recalc => {
                // Validity slightly above one period: one missed
                // publication does not evict a live peer.
                let table = PeerTable::new(period + period / 5);
                ActiveStrategy::Recalc(RecalcStrategy::new(
                    overlay,
                    table,
                    gateway(),
                    sticktables(),
                    PromClient::new(config.prometheus_url()),
                    dataplane(),
                    settings,
                ))
            }
            StrategyKind::NodeMargin => {
                let table = PeerTable::new(period * 2);
                ActiveStrategy::NodeMargin(NodeMarginStrategy::new(
                    overlay,
                    table,
                    gateway(),
                    sticktables(),
                    PromClient::new(config.prometheus_url()),
                    ForecasterClient::new(config.forecaster_url()),
                    dataplane(),
                    settings,
                    config.node_type.as_int(),
                    NodeMetrics {
                        cpu: config.nms_cpu_threshold,
                        ram: config.nms_ram_threshold,
                        power: config.nms_power_threshold,
                    },
                    config.group_list_file_name.clone(),
                ))
            }
            StrategyKind::Static => {
                let table = PeerTable::new(period * 2);
                ActiveStrategy::Static(StaticStrategy::new(
                    overlay,
                    table,
                    gateway(),
                    dataplane(),
                    settings,
                ))
            }
            StrategyKind::AllLocal => ActiveStrategy::AllLocal(AllLocalStrategy::new(
                overlay,
                gateway(),
                dataplane(),
                settings,
            )),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            ActiveStrategy::Recalc(_) => "recalcstrategy",
            ActiveStrategy::NodeMargin(_) => "nodemarginstrategy",
            ActiveStrategy::Static(_) => "static",
            ActiveStrategy::AllLocal(_) => "alllocal",
        }
    }

    /// Drive ticks until shutdown or a fatal error.
    pub async fn run(&self, shutdown: broadcast::Receiver<()>) -> Result<(), StrategyError> {
        match self {
            ActiveStrategy::Recalc(s) => s.run(shutdown).await,
            ActiveStrategy::NodeMargin(s) => s.run(shutdown).await,
            ActiveStrategy::Static(s) => s.run(shutdown).await,
            ActiveStrategy::AllLocal(s) => s.run(shutdown).await,
        }
    }

    /// Feed one decoded inbound message to the strategy.
    pub fn on_received(&self, sender: &NodeId, message: Message) -> Result<(), StrategyError> {
        match self {
            ActiveStrategy::Recalc(s) => s.on_received(sender, message),
            ActiveStrategy::NodeMargin(s) => s.on_received(sender, message),
            ActiveStrategy::Static(s) => s.on_received(sender, message),
            ActiveStrategy::AllLocal(s) => s.on_received(sender, message),
        }
    }
}
