//! Function usage groups.
//!
//! Every function known to the node belongs to at most one usage group; the
//! classification lives in an external JSON file read once per tick. A
//! function absent from the file contributes to no group rate.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::telemetry::TelemetryError;

/// Closed set of usage groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionGroup {
    High,
    Medium,
    Low,
}

/// Aggregate request rate per usage group on one node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupsLoad {
    #[serde(rename = "RateHighUsage")]
    pub high: f64,
    #[serde(rename = "RateLowUsage")]
    pub low: f64,
    #[serde(rename = "RateMediumUsage")]
    pub medium: f64,
}

impl GroupsLoad {
    pub fn add(&mut self, group: FunctionGroup, delta: f64) {
        match group {
            FunctionGroup::High => self.high += delta,
            FunctionGroup::Medium => self.medium += delta,
            FunctionGroup::Low => self.low += delta,
        }
    }
}

/// Contents of the group classification file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FunctionGroups {
    #[serde(rename = "HIGH_USAGE", default)]
    pub high: Vec<String>,
    #[serde(rename = "MEDIUM_USAGE", default)]
    pub medium: Vec<String>,
    #[serde(rename = "LOW_USAGE", default)]
    pub low: Vec<String>,
}

impl FunctionGroups {
    /// Read the classification file.
    pub fn load(path: &Path) -> Result<Self, TelemetryError> {
        let content = std::fs::read_to_string(path).map_err(|source| TelemetryError::GroupsIo {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| TelemetryError::GroupsParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Group of `function`, or `None` when unclassified.
    pub fn classify(&self, function: &str) -> Option<FunctionGroup> {
        if self.high.iter().any(|f| f == function) {
            Some(FunctionGroup::High)
        } else if self.medium.iter().any(|f| f == function) {
            Some(FunctionGroup::Medium)
        } else if self.low.iter().any(|f| f == function) {
            Some(FunctionGroup::Low)
        } else {
            None
        }
    }

    /// Sum per-function rates into their group buckets.
    pub fn group_rates(&self, rates: &HashMap<String, f64>) -> GroupsLoad {
        let mut load = GroupsLoad::default();
        for (function, rate) in rates {
            if let Some(group) = self.classify(function) {
                load.add(group, *rate);
            }
        }
        load
    }
}
