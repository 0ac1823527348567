//! Static strategy.
//!
//! A fixed split: the local node keeps 60% of the weight budget and divides
//! the remaining 40% evenly among its common neighbours. With no common
//! neighbours everything stays local. No margins, no forecasts.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::messages::{self, Message};
use crate::observability::metrics;
use crate::overlay::{NodeId, OverlayHandle};
use crate::peers::{MarginEntry, PeerTable};
use crate::proxy::{render, DataPlaneClient, NodeAddress, WeightedFunction, WeightedView};
use crate::strategy::{
    time_to_boundary, update_common_neighbours, StrategyError, StrategySettings,
    FAILED_TICK_BACKOFF,
};
use crate::telemetry::GatewayClient;
use crate::MAX_WEIGHT;

const LOCAL_SHARE: f64 = 0.6;

pub struct StaticStrategy {
    overlay: OverlayHandle,
    table: PeerTable<MarginEntry>,
    gateway: GatewayClient,
    dataplane: DataPlaneClient,
    settings: StrategySettings,
}

impl StaticStrategy {
    pub fn new(
        overlay: OverlayHandle,
        table: PeerTable<MarginEntry>,
        gateway: GatewayClient,
        dataplane: DataPlaneClient,
        settings: StrategySettings,
    ) -> Self {
        Self {
            overlay,
            table,
            gateway,
            dataplane,
            settings,
        }
    }

    /// Peer table, visible for inspection.
    pub fn table(&self) -> &PeerTable<MarginEntry> {
        &self.table
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), StrategyError> {
        let period = self.settings.period;

        loop {
            let started = Instant::now();
            match self.tick().await {
                Ok(()) => metrics::record_iteration(started.elapsed()),
                Err(e) => {
                    error!(error = %e, "static iteration failed, skipping");
                    warn!(backoff = ?FAILED_TICK_BACKOFF, "waiting before the next attempt");
                    tokio::select! {
                        _ = shutdown.recv() => return Ok(()),
                        _ = tokio::time::sleep(FAILED_TICK_BACKOFF) => {}
                    }
                    continue;
                }
            }

            tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                _ = tokio::time::sleep(time_to_boundary(period, Duration::ZERO)) => {}
            }
        }
    }

    async fn tick(&self) -> Result<(), StrategyError> {
        let funcs = self.gateway.function_names().await?;

        let message = Message::NodeInfoStatic {
            proxy_host: self.settings.advertised_host.clone(),
            proxy_port: self.settings.advertised_port,
            functions: funcs.clone(),
        };
        self.overlay.publish(messages::encode(&message)?).await?;

        let (_targets, common_count) = update_common_neighbours(&self.table, &funcs);
        debug!(common = common_count, "common neighbours");

        let neighbour_ids = self.table.with_entries(|entries| {
            let mut ids: Vec<NodeId> = entries
                .iter()
                .filter(|(_, entry)| entry.common_neighbour)
                .map(|(id, _)| id.clone())
                .collect();
            ids.sort();
            ids
        });

        let local_id = self.overlay.local_id().clone();
        let weights = compute_static_weights(&local_id, &funcs, &neighbour_ids);
        debug!(?weights, "static weights");

        let snapshot = self.table.with_entries(|entries| entries.clone());
        let mut view = WeightedView {
            node_id: local_id,
            gateway_host: self.settings.gateway_host.clone(),
            gateway_port: self.settings.gateway_port,
            period_secs: self.settings.period.as_secs().max(1),
            nodes: BTreeMap::new(),
            functions: BTreeMap::new(),
        };
        for (id, entry) in &snapshot {
            view.nodes.insert(
                id.clone(),
                NodeAddress {
                    host: entry.proxy_host.clone(),
                    port: entry.proxy_port,
                },
            );
        }
        for (function, function_weights) in &weights {
            view.functions.insert(
                function.clone(),
                WeightedFunction {
                    weights: function_weights
                        .iter()
                        .map(|(id, weight)| (id.clone(), *weight))
                        .collect(),
                },
            );
        }

        self.dataplane
            .push_config(&render::render_weighted(&view))
            .await?;
        Ok(())
    }

    pub fn on_received(&self, sender: &NodeId, message: Message) -> Result<(), StrategyError> {
        match message {
            Message::Text { text } => {
                debug!(sender = %sender, %text, "text message");
            }
            Message::NodeInfoStatic {
                proxy_host,
                proxy_port,
                functions,
            } => {
                debug!(sender = %sender, ?functions, "peer node info");
                self.table.with_entries(|entries| {
                    let entry = entries
                        .entry(sender.clone())
                        .or_insert_with(MarginEntry::new);
                    entry.t_alive = Instant::now();
                    entry.proxy_host = proxy_host;
                    entry.proxy_port = proxy_port;
                    entry.funcs = functions;
                });
            }
            other => {
                warn!(
                    msg_type = other.msg_type(),
                    "unexpected message type for the static strategy"
                );
            }
        }
        Ok(())
    }
}

/// 60% local, 40% split evenly among common neighbours; all local when
/// there are none.
fn compute_static_weights(
    local_id: &NodeId,
    funcs: &[String],
    neighbours: &[NodeId],
) -> HashMap<String, HashMap<NodeId, u32>> {
    let local_weight = (f64::from(MAX_WEIGHT) * LOCAL_SHARE).round() as u32;
    let shared_budget = f64::from(MAX_WEIGHT) * (1.0 - LOCAL_SHARE);

    let mut weights = HashMap::new();
    for function in funcs {
        let mut function_weights = HashMap::new();
        if neighbours.is_empty() {
            function_weights.insert(local_id.clone(), MAX_WEIGHT);
        } else {
            function_weights.insert(local_id.clone(), local_weight);
            let per_neighbour = (shared_budget / neighbours.len() as f64).round() as u32;
            for id in neighbours {
                function_weights.insert(id.clone(), per_neighbour);
            }
        }
        weights.insert(function.clone(), function_weights);
    }
    weights
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_with_one_neighbour() {
        let local = NodeId::from("QmSelf");
        let weights = compute_static_weights(
            &local,
            &["figlet".to_string()],
            &[NodeId::from("QmB")],
        );
        let figlet = &weights["figlet"];
        assert_eq!(figlet[&local], 60);
        assert_eq!(figlet[&NodeId::from("QmB")], 40);
    }

    #[test]
    fn test_split_with_two_neighbours() {
        let local = NodeId::from("QmSelf");
        let weights = compute_static_weights(
            &local,
            &["figlet".to_string()],
            &[NodeId::from("QmB"), NodeId::from("QmC")],
        );
        let figlet = &weights["figlet"];
        assert_eq!(figlet[&local], 60);
        assert_eq!(figlet[&NodeId::from("QmB")], 20);
        assert_eq!(figlet[&NodeId::from("QmC")], 20);
    }

    #[test]
    fn test_no_neighbours_keeps_everything_local() {
        let local = NodeId::from("QmSelf");
        let weights = compute_static_weights(&local, &["figlet".to_string()], &[]);
        let figlet = &weights["figlet"];
        assert_eq!(figlet.len(), 1);
        assert_eq!(figlet[&local], MAX_WEIGHT);
    }

    #[test]
    fn test_every_function_gets_weights() {
        let local = NodeId::from("QmSelf");
        let funcs = vec!["a".to_string(), "b".to_string()];
        let weights = compute_static_weights(&local, &funcs, &[NodeId::from("QmB")]);
        assert_eq!(weights.len(), 2);
    }
}
