//! Local function gateway client.
//!
//! The gateway's `/system/functions` endpoint is the source of truth for the
//! deployed function list. Rate limits and execution timeouts ride along as
//! function labels.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::telemetry::TelemetryError;

const MAX_RATE_LABEL: &str = "dfaas.maxrate";
const TIMEOUT_LABEL: &str = "dfaas.timeout_ms";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct FunctionItem {
    name: String,
    #[serde(default)]
    labels: HashMap<String, String>,
}

/// Client for the function gateway's management API.
#[derive(Clone)]
pub struct GatewayClient {
    base: String,
    user: String,
    pass: String,
    http: reqwest::Client,
}

impl GatewayClient {
    pub fn new(base: String, user: String, pass: String) -> Self {
        Self {
            base,
            user,
            pass,
            http: reqwest::Client::new(),
        }
    }

    async fn fetch_functions(&self) -> Result<Vec<FunctionItem>, TelemetryError> {
        let items = self
            .http
            .get(format!("{}/system/functions", self.base))
            .basic_auth(&self.user, Some(&self.pass))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(items)
    }

    /// Function names with their declared max request rate. The rate label
    /// is mandatory here: a function without it cannot take part in the
    /// limit calculation, so the whole read fails.
    pub async fn functions_with_max_rates(&self) -> Result<HashMap<String, u32>, TelemetryError> {
        let items = self.fetch_functions().await?;
        let mut result = HashMap::with_capacity(items.len());
        for item in items {
            let raw = item.labels.get(MAX_RATE_LABEL);
            let max_rate = raw
                .and_then(|v| v.parse::<u32>().ok())
                .ok_or_else(|| TelemetryError::BadLabel {
                    function: item.name.clone(),
                    label: MAX_RATE_LABEL,
                    value: raw.cloned(),
                })?;
            result.insert(item.name, max_rate);
        }
        Ok(result)
    }

    /// Just the deployed function names.
    pub async fn function_names(&self) -> Result<Vec<String>, TelemetryError> {
        let items = self.fetch_functions().await?;
        Ok(items.into_iter().map(|item| item.name).collect())
    }

    /// Function names with their optional execution timeout in milliseconds.
    /// An unparseable timeout label is treated as absent.
    pub async fn function_timeouts(
        &self,
    ) -> Result<HashMap<String, Option<u64>>, TelemetryError> {
        let items = self.fetch_functions().await?;
        let mut result = HashMap::with_capacity(items.len());
        for item in items {
            let timeout = match item.labels.get(TIMEOUT_LABEL) {
                Some(raw) => match raw.parse::<u64>() {
                    Ok(ms) => Some(ms),
                    Err(_) => {
                        warn!(function = %item.name, value = %raw, "ignoring unparseable timeout label");
                        None
                    }
                },
                None => None,
            };
            result.insert(item.name, timeout);
        }
        Ok(result)
    }

    /// Gateway liveness probe.
    pub async fn healthz(&self) -> Result<(), TelemetryError> {
        self.http
            .get(format!("{}/healthz", self.base))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
