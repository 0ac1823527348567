//! Agent runtime: wiring and lifecycle.
//!
//! # Data Flow
//! ```text
//! Startup:
//!     identity → overlay host → metrics recorder → strategy (once)
//!     → spawn receiver, strategy runner, http server
//!
//! Shutdown:
//!     SIGINT/SIGTERM or a fatal task error → broadcast → tasks drain → exit
//! ```
//!
//! # Design Decisions
//! - The strategy is constructed exactly once and shared behind an Arc
//! - Only a decode error or a dead transport kills the receiver; strategy
//!   dispatch failures are logged and skipped

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use crate::config::AgentConfig;
use crate::identity::{self, IdentityError};
use crate::messages::{self, CodecError};
use crate::observability::metrics as agent_metrics;
use crate::overlay::{swarm, InboundMessage, NodeId, OverlayError};
use crate::strategy::{ActiveStrategy, StrategyError};
use crate::http;
use crate::telemetry::{ForecasterClient, GatewayClient};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Overlay(#[from] OverlayError),

    #[error(transparent)]
    Strategy(#[from] StrategyError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("cannot install metrics recorder: {0}")]
    Metrics(String),

    #[error("http server failed: {0}")]
    Http(std::io::Error),

    #[error("pub/sub subscription closed")]
    SubscriptionClosed,

    #[error("background task aborted")]
    TaskAborted,
}

/// Coordinator for graceful shutdown: one broadcast channel every
/// long-running task subscribes to.
pub struct Shutdown {
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// The assembled agent.
pub struct Agent {
    config: AgentConfig,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    /// Run until shutdown signal or fatal error.
    pub async fn run(self) -> Result<(), AgentError> {
        let config = self.config;

        let identity = identity::load_or_generate(config.private_key_file.as_deref())?;
        if let Some(pem) = &identity.generated_pem {
            info!("generated a new overlay private key; store it to keep this identity:\n{pem}");
        }

        let (overlay, inbound, overlay_task) = swarm::spawn(&config, identity.keypair).await?;
        info!(node_id = %overlay.local_id(), "overlay host started");

        let prometheus = agent_metrics::install_recorder().map_err(AgentError::Metrics)?;

        // The one strategy instance of this process.
        let strategy = Arc::new(ActiveStrategy::build(&config, overlay.clone()));
        info!(strategy = strategy.kind_name(), "strategy selected");

        let shutdown = Shutdown::new();

        let receiver_task = {
            let strategy = Arc::clone(&strategy);
            let local_id = overlay.local_id().clone();
            let rx = shutdown.subscribe();
            tokio::spawn(run_receiver(strategy, local_id, inbound, rx))
        };

        let runner_task = {
            let strategy = Arc::clone(&strategy);
            let rx = shutdown.subscribe();
            tokio::spawn(async move { strategy.run(rx).await })
        };

        let http_task = {
            let gateway = GatewayClient::new(
                config.gateway_url(),
                config.openfaas_user.clone(),
                config.openfaas_pass.clone(),
            );
            let forecaster = ForecasterClient::new(config.forecaster_url());
            let rx = shutdown.subscribe();
            tokio::spawn(http::server::run(
                config.http_host.clone(),
                config.http_port,
                gateway,
                forecaster,
                prometheus,
                rx,
            ))
        };

        let result: Result<(), AgentError> = tokio::select! {
            _ = shutdown_signal() => {
                warn!("shutdown signal caught, stopping");
                Ok(())
            }
            joined = receiver_task => flatten(joined),
            joined = runner_task => flatten(joined.map(|r| r.map_err(AgentError::from))),
            joined = http_task => flatten(joined.map(|r| r.map_err(AgentError::Http))),
        };

        shutdown.trigger();
        overlay_task.abort();

        if let Err(e) = &result {
            error!(error = %e, "agent stopped on error");
        }
        result
    }
}

fn flatten(joined: Result<Result<(), AgentError>, tokio::task::JoinError>) -> Result<(), AgentError> {
    match joined {
        Ok(result) => result,
        Err(_) => Err(AgentError::TaskAborted),
    }
}

/// Single consumer of the pub/sub subscription: decode and dispatch.
async fn run_receiver(
    strategy: Arc<ActiveStrategy>,
    local_id: NodeId,
    mut inbound: mpsc::Receiver<InboundMessage>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), AgentError> {
    loop {
        tokio::select! {
            _ = shutdown.recv() => return Ok(()),
            received = inbound.recv() => {
                let Some(received) = received else {
                    return Err(AgentError::SubscriptionClosed);
                };
                if received.sender == local_id {
                    continue;
                }

                match messages::decode(&received.data) {
                    // A malformed stream means protocol mismatch: fatal.
                    Err(e) => return Err(e.into()),
                    Ok(None) => {}
                    Ok(Some(message)) => {
                        if let Err(e) = strategy.on_received(&received.sender, message) {
                            warn!(sender = %received.sender, error = %e, "inbound dispatch failed");
                        }
                    }
                }
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
