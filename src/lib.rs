//! Per-node control-plane agent for a federated FaaS cluster.
//!
//! Each node of the federation runs a function gateway, a reverse proxy in
//! front of it, and one instance of this agent. Agents join a peer-to-peer
//! overlay, periodically exchange load and capacity information over a single
//! pub/sub topic, and rewrite the local proxy configuration so that incoming
//! invocations are served locally, rate-limited, or forwarded to peers with
//! computed weights.
//!
//! # Architecture Overview
//!
//! ```text
//!                ┌────────────────────────────────────────────────┐
//!                │                 faasmesh-agent                 │
//!                │                                                │
//!   pub/sub ────▶│  overlay ──▶ receiver ──▶ strategy.on_received │
//!                │                                │               │
//!                │                                ▼               │
//!                │                           peer table           │
//!                │                                ▲               │
//!                │  ticker ──▶ strategy tick ─────┘               │
//!                │                 │                              │
//!                │                 ├──▶ telemetry (gateway,       │
//!                │                 │        stick-tables,         │
//!                │                 │        metrics, forecaster)  │
//!                │                 ├──▶ overlay.publish           │
//!                │                 └──▶ proxy renderer ──▶ POST   │
//!                │                                                │
//!                │  http: /healthz /metrics                       │
//!                └────────────────────────────────────────────────┘
//! ```

// Core subsystems
pub mod config;
pub mod messages;
pub mod peers;
pub mod proxy;
pub mod strategy;
pub mod telemetry;

// Overlay networking
pub mod identity;
pub mod overlay;

// Cross-cutting concerns
pub mod agent;
pub mod http;
pub mod observability;

/// Upper bound for proxy forwarding weights.
pub const MAX_WEIGHT: u32 = 100;

pub use agent::Agent;
pub use config::AgentConfig;
