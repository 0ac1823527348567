//! Proxy stick-table reader.
//!
//! Reads request counters from the proxy's runtime API. A table that the
//! proxy does not know about yields an empty map: the configuration may
//! simply not mention that function yet. A transport failure yields the last
//! successfully read content for that table, so one flaky read does not
//! zero out a tick's observations.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::overlay::NodeId;
use crate::telemetry::TelemetryError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// One row of a stick table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StickTableEntry {
    pub http_req_cnt: u64,
    pub http_req_rate: u64,
}

#[derive(Debug, Deserialize)]
struct TableDescriptor {
    name: String,
}

#[derive(Debug, Deserialize)]
struct WireEntry {
    key: String,
    #[serde(default)]
    http_req_cnt: u64,
    #[serde(default)]
    http_req_rate: u64,
}

/// Reader over the proxy's runtime stick-table API.
pub struct StickTableReader {
    base: String,
    user: String,
    pass: String,
    http: reqwest::Client,
    cache: Mutex<HashMap<String, HashMap<String, StickTableEntry>>>,
}

impl StickTableReader {
    pub fn new(base: String, user: String, pass: String) -> Self {
        Self {
            base,
            user,
            pass,
            http: reqwest::Client::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Table counting user-only invocations of `function`.
    pub fn users_table(function: &str) -> String {
        format!("st_users_func_{function}")
    }

    /// Table counting locally served invocations of `function`.
    pub fn local_table(function: &str) -> String {
        format!("st_local_func_{function}")
    }

    /// Table counting invocations of `function` forwarded to us by `peer`.
    pub fn peer_table(function: &str, peer: &NodeId) -> String {
        format!("st_other_node_{function}_{peer}")
    }

    /// Read a stick table, keyed by entry key.
    pub async fn read(&self, name: &str) -> HashMap<String, StickTableEntry> {
        match self.try_read(name).await {
            Ok(entries) => {
                self.cache
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(name.to_string(), entries.clone());
                entries
            }
            Err(e) => {
                warn!(table = name, error = %e, "stick-table read failed, keeping previous observations");
                self.cache
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(name)
                    .cloned()
                    .unwrap_or_default()
            }
        }
    }

    async fn try_read(
        &self,
        name: &str,
    ) -> Result<HashMap<String, StickTableEntry>, TelemetryError> {
        let tables: Vec<TableDescriptor> = self
            .http
            .get(format!(
                "{}/v3/services/haproxy/runtime/stick_tables",
                self.base
            ))
            .basic_auth(&self.user, Some(&self.pass))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if !tables.iter().any(|t| t.name == name) {
            return Ok(HashMap::new());
        }

        let entries: Vec<WireEntry> = self
            .http
            .get(format!(
                "{}/v3/services/haproxy/runtime/stick_tables/{}/entries",
                self.base, name
            ))
            .basic_auth(&self.user, Some(&self.pass))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(entries
            .into_iter()
            .map(|e| {
                (
                    e.key,
                    StickTableEntry {
                        http_req_cnt: e.http_req_cnt,
                        http_req_rate: e.http_req_rate,
                    },
                )
            })
            .collect())
    }
}
