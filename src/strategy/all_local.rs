//! All-local strategy.
//!
//! No peer coordination at all: every function is served by the local
//! gateway. The proxy configuration is rewritten only when the deployed
//! function set (or a per-function timeout) changes, so an idle cluster
//! causes no proxy reloads.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::messages::Message;
use crate::observability::metrics;
use crate::overlay::{NodeId, OverlayHandle};
use crate::proxy::{render, AllLocalView, DataPlaneClient};
use crate::strategy::{
    time_to_boundary, StrategyError, StrategySettings, FAILED_TICK_BACKOFF,
};
use crate::telemetry::GatewayClient;

pub struct AllLocalStrategy {
    overlay: OverlayHandle,
    gateway: GatewayClient,
    dataplane: DataPlaneClient,
    settings: StrategySettings,
    /// Function list (with timeouts) as of the last installed configuration.
    previous: Mutex<Option<Vec<(String, Option<u64>)>>>,
}

impl AllLocalStrategy {
    pub fn new(
        overlay: OverlayHandle,
        gateway: GatewayClient,
        dataplane: DataPlaneClient,
        settings: StrategySettings,
    ) -> Self {
        Self {
            overlay,
            gateway,
            dataplane,
            settings,
            previous: Mutex::new(None),
        }
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), StrategyError> {
        let period = self.settings.period;

        loop {
            let started = Instant::now();
            match self.tick().await {
                Ok(changed) => {
                    if changed {
                        debug!("proxy configuration updated");
                    }
                    metrics::record_iteration(started.elapsed());
                }
                Err(e) => {
                    error!(error = %e, "all-local iteration failed, skipping");
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

    /// Returns whether a new configuration was installed.
    async fn tick(&self) -> Result<bool, StrategyError> {
        let mut funcs: Vec<(String, Option<u64>)> = self
            .gateway
            .function_timeouts()
            .await?
            .into_iter()
            .collect();
        // Sorted so set membership, not ordering, decides equality.
        funcs.sort();

        let unchanged = {
            let previous = self
                .previous
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            previous.as_deref() == Some(funcs.as_slice())
        };
        if unchanged {
            return Ok(false);
        }

        info!("updating proxy configuration after function changes");
        let view = AllLocalView {
            node_id: self.overlay.local_id().clone(),
            gateway_host: self.settings.gateway_host.clone(),
            gateway_port: self.settings.gateway_port,
            functions: funcs.iter().cloned().collect::<BTreeMap<_, _>>(),
        };
        self.dataplane
            .push_config(&render::render_all_local(&view))
            .await?;

        *self
            .previous
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(funcs);
        Ok(true)
    }

    /// This strategy ignores every overlay message.
    pub fn on_received(&self, _sender: &NodeId, _message: Message) -> Result<(), StrategyError> {
        Ok(())
    }
}
