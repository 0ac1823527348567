//! Forecaster client.
//!
//! The forecaster predicts a node's resource usage (CPU, RAM, power) from
//! its hardware class and the per-group request load it would carry.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::telemetry::{GroupsLoad, TelemetryError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub const CPU_METRIC: &str = "cpu_usage_node";
pub const RAM_METRIC: &str = "ram_usage_node";
pub const POWER_METRIC: &str = "power_usage_node";

/// One value per forecast metric. Also used for the overload thresholds a
/// node advertises, which share the same metric names on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NodeMetrics {
    pub cpu: f64,
    pub ram: f64,
    pub power: f64,
}

impl NodeMetrics {
    /// Wire form keyed by metric name. Missing keys read as zero.
    pub fn from_map(map: &HashMap<String, f64>) -> Self {
        Self {
            cpu: map.get(CPU_METRIC).copied().unwrap_or_default(),
            ram: map.get(RAM_METRIC).copied().unwrap_or_default(),
            power: map.get(POWER_METRIC).copied().unwrap_or_default(),
        }
    }

    pub fn to_map(self) -> HashMap<String, f64> {
        HashMap::from([
            (CPU_METRIC.to_string(), self.cpu),
            (RAM_METRIC.to_string(), self.ram),
            (POWER_METRIC.to_string(), self.power),
        ])
    }

    /// True when any metric exceeds its limit.
    pub fn any_exceeds(&self, limits: &NodeMetrics) -> bool {
        self.cpu > limits.cpu || self.ram > limits.ram || self.power > limits.power
    }

    /// Mean usage percentage relative to `limits`.
    pub fn percent_of(&self, limits: &NodeMetrics) -> f64 {
        let cpu = self.cpu * 100.0 / limits.cpu;
        let ram = self.ram * 100.0 / limits.ram;
        let power = self.power * 100.0 / limits.power;
        (cpu + ram + power) / 3.0
    }
}

#[derive(Debug, Serialize)]
struct UsageRequest {
    #[serde(rename = "rate_group_HIGH_USAGE")]
    rate_high: f64,
    #[serde(rename = "rate_group_LOW_USAGE")]
    rate_low: f64,
    #[serde(rename = "rate_group_MEDIUM_USAGE")]
    rate_medium: f64,
    node_type: i32,
}

#[derive(Debug, Deserialize)]
struct UsageResponse {
    cpu_usage_node: f64,
    ram_usage_node: f64,
    power_usage_node: f64,
}

/// Client for the forecaster service.
#[derive(Clone)]
pub struct ForecasterClient {
    base: String,
    http: reqwest::Client,
}

impl ForecasterClient {
    pub fn new(base: String) -> Self {
        Self {
            base,
            http: reqwest::Client::new(),
        }
    }

    /// Predicted node usage for `node_type` under `load`.
    pub async fn node_usage(
        &self,
        node_type: i32,
        load: &GroupsLoad,
    ) -> Result<NodeMetrics, TelemetryError> {
        let request = UsageRequest {
            rate_high: load.high,
            rate_low: load.low,
            rate_medium: load.medium,
            node_type,
        };

        let predictions: Vec<UsageResponse> = self
            .http
            .get(format!("{}/node_usage", self.base))
            .json(&request)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let first = predictions
            .first()
            .ok_or_else(|| TelemetryError::BadResponse {
                service: "forecaster",
                detail: "empty prediction array".into(),
            })?;

        Ok(NodeMetrics {
            cpu: first.cpu_usage_node,
            ram: first.ram_usage_node,
            power: first.power_usage_node,
        })
    }

    /// Forecaster liveness probe.
    pub async fn healthz(&self) -> Result<(), TelemetryError> {
        self.http
            .get(format!("{}/", self.base))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_round_trip() {
        let metrics = NodeMetrics {
            cpu: 1.5,
            ram: 2.5,
            power: 3.5,
        };
        assert_eq!(NodeMetrics::from_map(&metrics.to_map()), metrics);
    }

    #[test]
    fn test_missing_map_keys_read_as_zero() {
        let map = HashMap::from([(CPU_METRIC.to_string(), 4.0)]);
        let metrics = NodeMetrics::from_map(&map);
        assert_eq!(metrics.cpu, 4.0);
        assert_eq!(metrics.ram, 0.0);
        assert_eq!(metrics.power, 0.0);
    }

    #[test]
    fn test_any_exceeds() {
        let limits = NodeMetrics {
            cpu: 80.0,
            ram: 80.0,
            power: 80.0,
        };
        let under = NodeMetrics {
            cpu: 70.0,
            ram: 70.0,
            power: 70.0,
        };
        let over = NodeMetrics {
            cpu: 70.0,
            ram: 81.0,
            power: 70.0,
        };
        assert!(!under.any_exceeds(&limits));
        assert!(over.any_exceeds(&limits));
    }

    #[test]
    fn test_percent_of() {
        let limits = NodeMetrics {
            cpu: 80.0,
            ram: 80.0,
            power: 80.0,
        };
        let usage = NodeMetrics {
            cpu: 70.0,
            ram: 70.0,
            power: 70.0,
        };
        assert!((usage.percent_of(&limits) - 87.5).abs() < 1e-9);
    }
}
