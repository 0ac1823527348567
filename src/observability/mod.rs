//! Logging and metrics.
//!
//! # Design Decisions
//! - Uses the tracing crate for structured logging
//! - Prometheus exposition goes through the agent's own HTTP server instead
//!   of a dedicated listener, so one port serves /healthz and /metrics

pub mod logging;
pub mod metrics;
