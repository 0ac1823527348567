//! Recalc strategy.
//!
//! Two phases half a period apart. Phase 1 observes local user rates,
//! classifies each function as overloaded or not, splits the remaining
//! margin into per-peer admission limits and publishes them. Phase 2, once
//! every node has published, turns the limits peers granted us into
//! forwarding weights and installs the new proxy configuration.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::messages::{self, Message};
use crate::observability::metrics;
use crate::overlay::{NodeId, OverlayHandle};
use crate::peers::{PeerTable, RecalcEntry};
use crate::proxy::{
    render, DataPlaneClient, NodeAddress, RecalcFunction, RecalcView,
};
use crate::strategy::{time_to_boundary, StrategyError, StrategySettings, FAILED_TICK_BACKOFF};
use crate::telemetry::{GatewayClient, PromClient, StickTableReader};
use crate::MAX_WEIGHT;

/// Working view of the local node, rebuilt from scratch every tick.
struct TickState {
    /// Local functions with their declared max rates.
    funcs: HashMap<String, u32>,
    /// Smoothed user-only invocation rates.
    user_rates: HashMap<String, f64>,
    /// Overload classification per function.
    overloaded: HashMap<String, bool>,
}

pub struct RecalcStrategy {
    overlay: OverlayHandle,
    table: PeerTable<RecalcEntry>,
    gateway: GatewayClient,
    sticktables: StickTableReader,
    prom: PromClient,
    dataplane: DataPlaneClient,
    settings: StrategySettings,
}

impl RecalcStrategy {
    pub fn new(
        overlay: OverlayHandle,
        table: PeerTable<RecalcEntry>,
        gateway: GatewayClient,
        sticktables: StickTableReader,
        prom: PromClient,
        dataplane: DataPlaneClient,
        settings: StrategySettings,
    ) -> Self {
        Self {
            overlay,
            table,
            gateway,
            sticktables,
            prom,
            dataplane,
            settings,
        }
    }

    /// Peer table, visible for inspection.
    pub fn table(&self) -> &PeerTable<RecalcEntry> {
        &self.table
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), StrategyError> {
        let period = self.settings.period;
        let half = period / 2;

        loop {
            tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                _ = tokio::time::sleep(time_to_boundary(period, Duration::ZERO)) => {}
            }

            let phase_one_started = Instant::now();
            let state = match self.phase_one().await {
                Ok(state) => state,
                Err(e) => {
                    error!(error = %e, "recalc phase 1 failed, skipping iteration");
                    warn!(backoff = ?FAILED_TICK_BACKOFF, "waiting before the next attempt");
                    tokio::select! {
                        _ = shutdown.recv() => return Ok(()),
                        _ = tokio::time::sleep(FAILED_TICK_BACKOFF) => {}
                    }
                    continue;
                }
            };
            let phase_one_work = phase_one_started.elapsed();

            tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                _ = tokio::time::sleep(time_to_boundary(period, half)) => {}
            }

            let phase_two_started = Instant::now();
            if let Err(e) = self.phase_two(&state).await {
                error!(error = %e, "recalc phase 2 failed, skipping iteration");
                warn!(backoff = ?FAILED_TICK_BACKOFF, "waiting before the next attempt");
                tokio::select! {
                    _ = shutdown.recv() => return Ok(()),
                    _ = tokio::time::sleep(FAILED_TICK_BACKOFF) => {}
                }
                continue;
            }

            metrics::record_iteration(phase_one_work + phase_two_started.elapsed());
        }
    }

    /// Observe, set admission limits, publish them.
    async fn phase_one(&self) -> Result<TickState, StrategyError> {
        let peer_ids = self.overlay.connected_peers().await?;
        debug!(peers = peer_ids.len(), "connected overlay peers");

        let funcs = self.gateway.functions_with_max_rates().await?;
        debug!(?funcs, "local functions with max rates");

        // User-only invocation rates. The count is doubled because the proxy
        // reload at phase 2 halves the effective sampling window.
        let period_secs = self.settings.period.as_secs().max(1);
        let mut user_rates = HashMap::new();
        for name in funcs.keys() {
            let table = StickTableReader::users_table(name);
            let content = self.sticktables.read(&table).await;
            for entry in content.values() {
                // A single row, keyed by the frontend port.
                user_rates.insert(
                    name.clone(),
                    entry.http_req_cnt as f64 / period_secs as f64 * 2.0,
                );
            }
            debug!(table = %table, rows = content.len());
        }
        debug!(?user_rates, "user invocation rates");

        // Locally served and peer-forwarded counters, observed for the logs.
        for name in funcs.keys() {
            let table = StickTableReader::local_table(name);
            let content = self.sticktables.read(&table).await;
            debug!(table = %table, rows = content.len());
            for peer in &peer_ids {
                let table = StickTableReader::peer_table(name, peer);
                let content = self.sticktables.read(&table).await;
                debug!(table = %table, rows = content.len());
            }
        }

        self.observe_aggregate_metrics(&funcs).await;

        let mut overloaded = HashMap::new();
        for (name, &max_rate) in &funcs {
            let over = user_rates
                .get(name)
                .is_some_and(|rate| *rate >= f64::from(max_rate));
            overloaded.insert(name.clone(), over);
            debug!(function = %name, overloaded = over);
        }

        // Admission limits: an overloaded function accepts nothing from
        // peers; otherwise the margin splits evenly across the peers that
        // run the function. Weights stay zero until phase 2.
        self.table.with_entries(|entries| {
            for (name, &max_rate) in &funcs {
                if overloaded.get(name).copied().unwrap_or(false) {
                    for entry in entries.values_mut() {
                        if let Some(data) = entry.funcs.get_mut(name) {
                            data.limit_in = 0.0;
                        }
                    }
                    continue;
                }

                let margin = match user_rates.get(name) {
                    Some(rate) => max_rate.saturating_sub(*rate as u32),
                    None => max_rate,
                };

                let mut holders = 0u32;
                for entry in entries.values_mut() {
                    if let Some(data) = entry.funcs.get_mut(name) {
                        data.weight = 0;
                        holders += 1;
                    }
                }
                if holders > 0 {
                    let limit_in = f64::from(margin / holders);
                    for entry in entries.values_mut() {
                        if let Some(data) = entry.funcs.get_mut(name) {
                            data.limit_in = limit_in;
                        }
                    }
                }
            }
        });

        // Advertise the limits we just granted, per connected peer. A peer
        // we have no entry for yet gets explicit zeroes for our functions.
        let func_limits = self.table.with_entries(|entries| {
            let mut limits: HashMap<NodeId, HashMap<String, f64>> = HashMap::new();
            for peer in &peer_ids {
                let granted = match entries.get(peer) {
                    Some(entry) => entry
                        .funcs
                        .iter()
                        .map(|(name, data)| (name.clone(), data.limit_in))
                        .collect(),
                    None => funcs.keys().map(|name| (name.clone(), 0.0)).collect(),
                };
                limits.insert(peer.clone(), granted);
            }
            limits
        });

        let message = Message::NodeInfoRecalc {
            proxy_host: self.settings.advertised_host.clone(),
            proxy_port: self.settings.advertised_port,
            func_limits,
        };
        self.overlay.publish(messages::encode(&message)?).await?;

        Ok(TickState {
            funcs,
            user_rates,
            overloaded,
        })
    }

    /// Aggregate metrics from the metrics backend, for the operator's eyes.
    /// A failed query degrades to a warning; the tick keeps going.
    async fn observe_aggregate_metrics(&self, funcs: &HashMap<String, u32>) {
        let span = self.settings.period;

        match self.prom.avg_exec_time(span).await {
            Ok(afet) => debug!(?afet, "average function execution times"),
            Err(e) => warn!(error = %e, "execution time query failed"),
        }
        match self.prom.invocation_rates(span).await {
            Ok(rates) => debug!(?rates, "invocation rates by http code"),
            Err(e) => warn!(error = %e, "invocation rate query failed"),
        }
        match self.prom.replica_counts().await {
            Ok(replicas) => debug!(?replicas, "function replica counts"),
            Err(e) => warn!(error = %e, "replica count query failed"),
        }
        match self.prom.node_cpu_usage(span).await {
            Ok(cpu) => debug!(?cpu, "node cpu usage"),
            Err(e) => warn!(error = %e, "cpu usage query failed"),
        }
        match self.prom.node_ram_usage(span).await {
            Ok(ram) => debug!(?ram, "node ram usage"),
            Err(e) => warn!(error = %e, "ram usage query failed"),
        }

        let names: Vec<String> = funcs.keys().cloned().collect();
        match self.prom.function_cpu_usage(span, &names).await {
            Ok(cpu) => debug!(?cpu, "per-function cpu usage"),
            Err(e) => warn!(error = %e, "per-function cpu usage query failed"),
        }
        match self.prom.function_ram_usage(span, &names).await {
            Ok(ram) => debug!(?ram, "per-function ram usage"),
            Err(e) => warn!(error = %e, "per-function ram usage query failed"),
        }
    }

    /// Turn peer-granted limits into weights and install the configuration.
    async fn phase_two(&self, state: &TickState) -> Result<(), StrategyError> {
        self.table.with_entries(|entries| {
            for (name, &over) in &state.overloaded {
                if !over {
                    continue;
                }

                let mut total_limits_out: f64 = entries
                    .values()
                    .filter_map(|entry| entry.funcs.get(name))
                    .map(|data| data.limit_out)
                    .sum();
                if total_limits_out <= 0.0 {
                    // No peer takes this function; keep the division sound,
                    // every weight comes out zero.
                    total_limits_out = 1.0;
                }

                for entry in entries.values_mut() {
                    if let Some(data) = entry.funcs.get_mut(name) {
                        data.weight = (data.limit_out * f64::from(MAX_WEIGHT) / total_limits_out)
                            .round() as u32;
                    }
                }
            }
        });

        let snapshot = self.table.with_entries(|entries| entries.clone());
        let view = self.build_view(&snapshot, state);
        let rendered = render::render_recalc(&view);
        self.dataplane.push_config(&rendered).await?;
        Ok(())
    }

    fn build_view(
        &self,
        entries: &HashMap<NodeId, RecalcEntry>,
        state: &TickState,
    ) -> RecalcView {
        let mut view = RecalcView {
            node_id: self.overlay.local_id().clone(),
            gateway_host: self.settings.gateway_host.clone(),
            gateway_port: self.settings.gateway_port,
            period_secs: self.settings.period.as_secs().max(1),
            nodes: BTreeMap::new(),
            functions: BTreeMap::new(),
        };

        for (name, &limit) in &state.funcs {
            view.functions.insert(
                name.clone(),
                RecalcFunction {
                    limit,
                    ..RecalcFunction::default()
                },
            );
        }

        for (id, entry) in entries {
            view.nodes.insert(
                id.clone(),
                NodeAddress {
                    host: entry.proxy_host.clone(),
                    port: entry.proxy_port,
                },
            );

            for (name, data) in &entry.funcs {
                // A function peers run but we do not: forward-only, the
                // local gateway never sees it.
                let function = view.functions.entry(name.clone()).or_default();
                function.weights.insert(id.clone(), data.weight);
                function.limits_in.insert(id.clone(), data.limit_in as u32);
            }
        }

        debug!(rates = ?state.user_rates, "rendering configuration");
        view
    }

    pub fn on_received(&self, sender: &NodeId, message: Message) -> Result<(), StrategyError> {
        match message {
            Message::Text { text } => {
                debug!(sender = %sender, %text, "text message");
            }
            Message::NodeInfoRecalc {
                proxy_host,
                proxy_port,
                func_limits,
            } => {
                // A sender that does not know us yet is ignored; it will
                // include us once it sees our own advertisement.
                let Some(granted) = func_limits.get(self.overlay.local_id()) else {
                    return Ok(());
                };
                debug!(sender = %sender, limits = granted.len(), "peer advertisement");

                self.table.with_entries(|entries| {
                    entries
                        .entry(sender.clone())
                        .or_insert_with(RecalcEntry::new)
                        .apply_advertisement(&proxy_host, proxy_port, granted);
                });
            }
            other => {
                warn!(msg_type = other.msg_type(), "unexpected message type for the recalc strategy");
            }
        }
        Ok(())
    }
}
