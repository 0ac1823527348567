//! Node-margin strategy.
//!
//! Single-phase ticks. Every node forecasts its own resource usage from its
//! per-group request load, derives a spare-capacity margin, and offers that
//! margin to the neighbours it shares functions with. An overloaded node
//! shifts load onto those neighbours one percent at a time, re-forecasting
//! after every shift, until the forecast clears or no neighbour fits more.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
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
use crate::telemetry::{
    ForecasterClient, FunctionGroups, GatewayClient, GroupsLoad, NodeMetrics, PromClient,
    StickTableReader,
};
use crate::MAX_WEIGHT;

/// Share of the remaining local load moved per redistribution step.
const SHIFT_STEP: f64 = 0.01;

pub struct NodeMarginStrategy {
    overlay: OverlayHandle,
    table: PeerTable<MarginEntry>,
    gateway: GatewayClient,
    sticktables: StickTableReader,
    prom: PromClient,
    forecaster: ForecasterClient,
    dataplane: DataPlaneClient,
    settings: StrategySettings,
    node_type: i32,
    thresholds: NodeMetrics,
    groups_file: PathBuf,
    /// Last successful self forecast, used when the forecaster blips.
    last_forecast: Mutex<Option<NodeMetrics>>,
}

impl NodeMarginStrategy {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        overlay: OverlayHandle,
        table: PeerTable<MarginEntry>,
        gateway: GatewayClient,
        sticktables: StickTableReader,
        prom: PromClient,
        forecaster: ForecasterClient,
        dataplane: DataPlaneClient,
        settings: StrategySettings,
        node_type: i32,
        thresholds: NodeMetrics,
        groups_file: PathBuf,
    ) -> Self {
        Self {
            overlay,
            table,
            gateway,
            sticktables,
            prom,
            forecaster,
            dataplane,
            settings,
            node_type,
            thresholds,
            groups_file,
            last_forecast: Mutex::new(None),
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
                    error!(error = %e, "node-margin iteration failed, skipping");
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
        // Aggregate node metrics go to the log; the decisions below rest on
        // the forecaster.
        match self.prom.node_cpu_usage(self.settings.period).await {
            Ok(cpu) => debug!(?cpu, "node cpu usage"),
            Err(e) => warn!(error = %e, "cpu usage query failed"),
        }
        match self.prom.node_ram_usage(self.settings.period).await {
            Ok(ram) => debug!(?ram, "node ram usage"),
            Err(e) => warn!(error = %e, "ram usage query failed"),
        }

        let funcs = self.gateway.function_names().await?;
        let message = Message::NodeInfoNms {
            proxy_host: self.settings.advertised_host.clone(),
            proxy_port: self.settings.advertised_port,
            node_type: self.node_type,
            max_values: self.thresholds.to_map(),
            functions: funcs.clone(),
        };
        self.overlay.publish(messages::encode(&message)?).await?;

        let (targets, common_count) = update_common_neighbours(&self.table, &funcs);
        debug!(common = common_count, "common neighbours");

        let rates = self.function_rates(&funcs).await;
        let groups = FunctionGroups::load(&self.groups_file)?;
        let load = groups.group_rates(&rates);
        debug!(?load, "local group load");

        let predictions = self.forecast_self(&load).await?;
        let overload = predictions.any_exceeds(&self.thresholds);
        debug!(overload, "node overload");

        let margin = if overload || common_count == 0 {
            0.0
        } else {
            let percent = predictions.percent_of(&self.thresholds);
            debug!(percent, "node usage percentage");
            (100.0 - percent) / common_count as f64
        };
        debug!(margin, "node margin");

        if common_count > 0 {
            // The load travels with the margin only when there is actually
            // spare capacity on offer.
            let advertised_load = if margin > 0.0 {
                load.clone()
            } else {
                GroupsLoad::default()
            };
            let message = Message::NodeMarginInfoNms {
                margin,
                load: advertised_load,
            };
            self.overlay.publish(messages::encode(&message)?).await?;
        }

        let weights = self
            .calculate_weights(&funcs, &rates, &load, overload, targets, &groups)
            .await?;

        let view = self.build_view(&funcs, weights);
        self.dataplane
            .push_config(&render::render_weighted(&view))
            .await?;
        Ok(())
    }

    /// Per-function user request rates from the proxy stick tables.
    async fn function_rates(&self, funcs: &[String]) -> HashMap<String, f64> {
        let mut rates = HashMap::new();
        for name in funcs {
            let table = StickTableReader::users_table(name);
            for entry in self.sticktables.read(&table).await.values() {
                rates.insert(name.clone(), entry.http_req_rate as f64);
            }
        }
        rates
    }

    /// Forecast our own usage, falling back to the previous prediction when
    /// the forecaster is unreachable (first tick excepted).
    async fn forecast_self(&self, load: &GroupsLoad) -> Result<NodeMetrics, StrategyError> {
        match self.forecaster.node_usage(self.node_type, load).await {
            Ok(predictions) => {
                *self
                    .last_forecast
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(predictions);
                Ok(predictions)
            }
            Err(e) => {
                let previous = *self
                    .last_forecast
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                match previous {
                    Some(predictions) => {
                        warn!(error = %e, "forecaster unreachable, reusing previous prediction");
                        Ok(predictions)
                    }
                    None => Err(e.into()),
                }
            }
        }
    }

    /// The iterative redistribution.
    ///
    /// While the node stays overloaded, shift 1% of the remaining local load
    /// of one shared function onto one target peer, provided that peer's
    /// advertised margin covers the forecast usage increase. Peers and
    /// functions are visited round-robin; a function that does not fit on a
    /// peer is struck from that peer's candidates.
    async fn calculate_weights(
        &self,
        funcs: &[String],
        rates: &HashMap<String, f64>,
        load: &GroupsLoad,
        initially_overloaded: bool,
        mut targets: HashMap<NodeId, Vec<String>>,
        groups: &FunctionGroups,
    ) -> Result<HashMap<String, HashMap<NodeId, u32>>, StrategyError> {
        // The forecaster is consulted inside the loop, so work on a
        // snapshot instead of holding the table's critical section.
        let snapshot = self.table.with_entries(|entries| entries.clone());

        targets.retain(|id, shared| {
            !shared.is_empty()
                && snapshot
                    .get(id)
                    .map(|entry| entry.margin != 0.0)
                    .unwrap_or(false)
        });

        let mut maintained: HashMap<String, f64> = rates.clone();
        let mut maintained_load = load.clone();
        let mut forwarded: HashMap<NodeId, HashMap<String, f64>> = snapshot
            .keys()
            .map(|id| {
                (
                    id.clone(),
                    funcs.iter().map(|f| (f.clone(), 0.0)).collect(),
                )
            })
            .collect();
        let mut overload = initially_overloaded;

        let mut target_cursor = 0usize;
        let mut func_cursors: HashMap<NodeId, usize> =
            targets.keys().map(|id| (id.clone(), 0)).collect();

        while overload && !targets.is_empty() {
            let mut target_ids: Vec<NodeId> = targets.keys().cloned().collect();
            target_ids.sort();
            if target_cursor >= target_ids.len() {
                target_cursor = 0;
            }
            let node_to = target_ids[target_cursor].clone();
            target_cursor += 1;

            let func_to = {
                let shared = &targets[&node_to];
                let cursor = func_cursors.get(&node_to).copied().unwrap_or(0) % shared.len();
                shared[cursor].clone()
            };
            debug!(node = %node_to, function = %func_to, "redistribution candidate");

            let remaining = maintained.get(&func_to).copied().unwrap_or(0.0);
            if remaining <= 0.0 {
                // Nothing left of this function to shift anywhere.
                self.strike_function(&func_to, &mut targets, &mut func_cursors);
                continue;
            }

            let Some(entry) = snapshot.get(&node_to) else {
                targets.remove(&node_to);
                func_cursors.remove(&node_to);
                continue;
            };

            let before = self
                .forecaster
                .node_usage(entry.node_type, &entry.load)
                .await?
                .percent_of(&entry.max_values);

            let delta = remaining * SHIFT_STEP;

            // Hypothetical load on the target: its advertised load, the
            // shift under test, and everything already assigned to it.
            let mut hypothetical = entry.load.clone();
            if let Some(group) = groups.classify(&func_to) {
                hypothetical.add(group, delta);
            }
            if let Some(assigned) = forwarded.get(&node_to) {
                for (function, rate) in assigned {
                    if let Some(group) = groups.classify(function) {
                        hypothetical.add(group, *rate);
                    }
                }
            }

            let after = self
                .forecaster
                .node_usage(entry.node_type, &hypothetical)
                .await?
                .percent_of(&entry.max_values);

            if entry.margin > after - before {
                *maintained.entry(func_to.clone()).or_insert(0.0) -= delta;
                if let Some(assigned) = forwarded.get_mut(&node_to) {
                    *assigned.entry(func_to.clone()).or_insert(0.0) += delta;
                }
                if let Some(group) = groups.classify(&func_to) {
                    maintained_load.add(group, -delta);
                }

                let own = self
                    .forecaster
                    .node_usage(self.node_type, &maintained_load)
                    .await?;
                overload = own.any_exceeds(&self.thresholds);

                let shared_len = targets[&node_to].len();
                let cursor = func_cursors.entry(node_to.clone()).or_insert(0);
                *cursor = (*cursor + 1) % shared_len;
            } else {
                // Does not fit on this peer; stop proposing it there.
                let remaining_shared = match targets.get_mut(&node_to) {
                    Some(shared) => {
                        shared.retain(|f| f != &func_to);
                        shared.len()
                    }
                    None => continue,
                };
                if remaining_shared == 0 {
                    targets.remove(&node_to);
                    func_cursors.remove(&node_to);
                } else if let Some(cursor) = func_cursors.get_mut(&node_to) {
                    if *cursor >= remaining_shared {
                        *cursor = 0;
                    }
                }
            }
        }

        // Final weights: the kept share stays local, each peer gets its
        // assigned share, everything scaled to the weight budget.
        let mut weights: HashMap<String, HashMap<NodeId, u32>> = HashMap::new();
        let local_id = self.overlay.local_id().clone();
        for function in funcs {
            let mut function_weights = HashMap::new();
            let total = rates.get(function).copied().unwrap_or(0.0);
            if total == 0.0 {
                function_weights.insert(local_id.clone(), MAX_WEIGHT);
                for id in snapshot.keys() {
                    function_weights.insert(id.clone(), 0);
                }
            } else {
                let kept = maintained.get(function).copied().unwrap_or(0.0);
                function_weights.insert(
                    local_id.clone(),
                    ((kept / total) * f64::from(MAX_WEIGHT)).round() as u32,
                );
                for id in snapshot.keys() {
                    let assigned = forwarded
                        .get(id)
                        .and_then(|m| m.get(function))
                        .copied()
                        .unwrap_or(0.0);
                    function_weights.insert(
                        id.clone(),
                        ((assigned / total) * f64::from(MAX_WEIGHT)).round() as u32,
                    );
                }
            }
            weights.insert(function.clone(), function_weights);
        }

        debug!(?weights, "computed forwarding weights");
        Ok(weights)
    }

    /// Remove `function` from every target's candidate list.
    fn strike_function(
        &self,
        function: &str,
        targets: &mut HashMap<NodeId, Vec<String>>,
        func_cursors: &mut HashMap<NodeId, usize>,
    ) {
        let mut emptied = Vec::new();
        for (id, shared) in targets.iter_mut() {
            shared.retain(|f| f != function);
            if shared.is_empty() {
                emptied.push(id.clone());
            }
        }
        for id in emptied {
            targets.remove(&id);
            func_cursors.remove(&id);
        }
        for (id, shared) in targets.iter() {
            if let Some(cursor) = func_cursors.get_mut(id) {
                if *cursor >= shared.len() {
                    *cursor = 0;
                }
            }
        }
    }

    fn build_view(
        &self,
        funcs: &[String],
        weights: HashMap<String, HashMap<NodeId, u32>>,
    ) -> WeightedView {
        let snapshot = self.table.with_entries(|entries| entries.clone());

        let mut view = WeightedView {
            node_id: self.overlay.local_id().clone(),
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

        for function in funcs {
            let function_weights = weights
                .get(function)
                .map(|w| w.iter().map(|(id, weight)| (id.clone(), *weight)).collect())
                .unwrap_or_default();
            view.functions.insert(
                function.clone(),
                WeightedFunction {
                    weights: function_weights,
                },
            );
        }

        view
    }

    pub fn on_received(&self, sender: &NodeId, message: Message) -> Result<(), StrategyError> {
        match message {
            Message::Text { text } => {
                debug!(sender = %sender, %text, "text message");
            }
            Message::NodeInfoNms {
                proxy_host,
                proxy_port,
                node_type,
                max_values,
                functions,
            } => {
                debug!(sender = %sender, ?functions, "peer node info");
                self.table.with_entries(|entries| {
                    entries
                        .entry(sender.clone())
                        .or_insert_with(MarginEntry::new)
                        .apply_node_info(
                            &proxy_host,
                            proxy_port,
                            node_type,
                            NodeMetrics::from_map(&max_values),
                            functions,
                        );
                });
            }
            Message::NodeMarginInfoNms { margin, load } => {
                self.table.with_entries(|entries| match entries.get_mut(sender) {
                    Some(entry) if entry.common_neighbour => {
                        debug!(sender = %sender, margin, ?load, "peer margin info");
                        entry.apply_margin_info(margin, load);
                    }
                    _ => {
                        debug!(sender = %sender, "margin info from a non-common neighbour, ignored");
                    }
                });
            }
            other => {
                warn!(
                    msg_type = other.msg_type(),
                    "unexpected message type for the node-margin strategy"
                );
            }
        }
        Ok(())
    }
}
