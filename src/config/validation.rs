//! Configuration validation.

use std::path::PathBuf;

use crate::config::schema::{AgentConfig, StrategyKind};

/// Error raised while loading or validating the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid command line or environment: {0}")]
    Parse(#[from] clap::Error),

    #[error("cannot read config file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Check cross-field constraints that clap cannot express.
pub fn validate(config: &AgentConfig) -> Result<(), ConfigError> {
    if config.recalc_period.is_zero() {
        return Err(ConfigError::Invalid(
            "recalc period must be a positive duration".into(),
        ));
    }

    if config.listen.is_empty() {
        return Err(ConfigError::Invalid(
            "at least one overlay listen address is required".into(),
        ));
    }

    // No ambient public bootstrap list exists in this implementation, so the
    // public shortcut still needs an explicit list or file.
    if config.bootstrap_nodes
        && config.public_bootstrap_nodes
        && config.bootstrap_nodes_list.is_empty()
        && config.bootstrap_nodes_file.is_none()
    {
        return Err(ConfigError::Invalid(
            "public bootstrap nodes requested but no bootstrap list or file given".into(),
        ));
    }

    if config.strategy == StrategyKind::NodeMargin {
        for (name, value) in [
            ("cpu", config.nms_cpu_threshold),
            ("ram", config.nms_ram_threshold),
            ("power", config.nms_power_threshold),
        ] {
            if value <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "node-margin strategy requires a positive {name} threshold"
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn base() -> AgentConfig {
        AgentConfig::parse_from(["agent"])
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(validate(&base()).is_ok());
    }

    #[test]
    fn test_zero_period_rejected() {
        let cfg = AgentConfig::parse_from(["agent", "--recalc-period", "0s"]);
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn test_public_bootstrap_requires_list() {
        let cfg = AgentConfig::parse_from([
            "agent",
            "--bootstrap-nodes",
            "true",
            "--public-bootstrap-nodes",
            "true",
        ]);
        assert!(validate(&cfg).is_err());

        let cfg = AgentConfig::parse_from([
            "agent",
            "--bootstrap-nodes",
            "true",
            "--public-bootstrap-nodes",
            "true",
            "--bootstrap-nodes-list",
            "/ip4/192.0.2.1/tcp/31600/p2p/12D3KooWQYhTNQdmr3oWqwA7tWro6IJ6XyS4mJcVzAqS4y9HyXF9",
        ]);
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn test_nms_thresholds_required() {
        let cfg = AgentConfig::parse_from(["agent", "--strategy", "nodemarginstrategy"]);
        assert!(validate(&cfg).is_err());

        let cfg = AgentConfig::parse_from([
            "agent",
            "--strategy",
            "nodemarginstrategy",
            "--nms-cpu-threshold",
            "80",
            "--nms-ram-threshold",
            "80",
            "--nms-power-threshold",
            "80",
        ]);
        assert!(validate(&cfg).is_ok());
    }
}
