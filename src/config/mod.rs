//! Agent configuration.
//!
//! # Data Flow
//! ```text
//! Process env (AGENT_*) ──┐
//!                         ├──▶ clap parse ──▶ validate ──▶ AgentConfig
//! --config file (.env) ───┘
//! ```
//!
//! # Design Decisions
//! - Every key is both a CLI flag and an AGENT_* environment variable
//! - The --config file overwrites process env before parsing
//! - Validation runs once at startup; any failure is fatal

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::load;
pub use schema::{AgentConfig, NodeType, StrategyKind};
pub use validation::ConfigError;
