//! Telemetry collectors.
//!
//! Narrow adapters over the agent's four external data sources: the local
//! function gateway, the proxy's runtime stick-tables, the metrics backend
//! and the forecaster. Strategies consume these interfaces only; transient
//! transport failures are degraded locally (log + previous value) wherever
//! the tick can keep going without fresh data.

pub mod forecaster;
pub mod gateway;
pub mod groups;
pub mod prom;
pub mod sticktables;

use std::path::PathBuf;

pub use forecaster::{ForecasterClient, NodeMetrics};
pub use gateway::GatewayClient;
pub use groups::{FunctionGroup, FunctionGroups, GroupsLoad};
pub use prom::PromClient;
pub use sticktables::{StickTableEntry, StickTableReader};

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected response from {service}: {detail}")]
    BadResponse {
        service: &'static str,
        detail: String,
    },

    #[error("function {function} has an invalid {label} label: {value:?}")]
    BadLabel {
        function: String,
        label: &'static str,
        value: Option<String>,
    },

    #[error("cannot read group list file {path}: {source}")]
    GroupsIo {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse group list file {path}: {source}")]
    GroupsParse {
        path: PathBuf,
        source: serde_json::Error,
    },
}
