//! Metrics backend client.
//!
//! Thin wrapper over the backend's instant-query API with typed helpers for
//! the queries the strategies and operators care about.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::telemetry::TelemetryError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct QueryResponse {
    data: QueryData,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<QueryResult>,
}

#[derive(Debug, Deserialize)]
struct QueryResult {
    #[serde(default)]
    metric: HashMap<String, String>,
    value: (f64, String),
}

/// One sample of an instant query.
#[derive(Debug, Clone)]
pub struct Sample {
    pub labels: HashMap<String, String>,
    pub value: f64,
}

/// Client for the metrics backend's HTTP query API.
#[derive(Clone)]
pub struct PromClient {
    base: String,
    http: reqwest::Client,
}

impl PromClient {
    pub fn new(base: String) -> Self {
        Self {
            base,
            http: reqwest::Client::new(),
        }
    }

    /// Execute an instant query.
    pub async fn query(&self, query: &str) -> Result<Vec<Sample>, TelemetryError> {
        let response: QueryResponse = self
            .http
            .get(format!("{}/api/v1/query", self.base))
            .query(&[("query", query)])
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut samples = Vec::with_capacity(response.data.result.len());
        for item in response.data.result {
            let value =
                item.value
                    .1
                    .parse::<f64>()
                    .map_err(|_| TelemetryError::BadResponse {
                        service: "metrics backend",
                        detail: format!("non-numeric sample value {:?}", item.value.1),
                    })?;
            samples.push(Sample {
                labels: item.metric,
                value,
            });
        }
        Ok(samples)
    }

    fn span(duration: Duration) -> String {
        format!("{}s", duration.as_secs().max(1))
    }

    fn by_label(samples: Vec<Sample>, label: &str) -> HashMap<String, f64> {
        samples
            .into_iter()
            .filter_map(|s| s.labels.get(label).cloned().map(|k| (k, s.value)))
            .collect()
    }

    /// Average execution time per function over `span`, in seconds.
    pub async fn avg_exec_time(
        &self,
        span: Duration,
    ) -> Result<HashMap<String, f64>, TelemetryError> {
        let t = Self::span(span);
        let query = format!(
            "rate(gateway_functions_seconds_sum[{t}]) / rate(gateway_functions_seconds_count[{t}])"
        );
        Ok(Self::by_label(self.query(&query).await?, "function_name"))
    }

    /// Invocation rate per function and HTTP code over `span`.
    pub async fn invocation_rates(
        &self,
        span: Duration,
    ) -> Result<HashMap<String, HashMap<String, f64>>, TelemetryError> {
        let t = Self::span(span);
        let query = format!("rate(gateway_function_invocation_total[{t}])");
        let mut result: HashMap<String, HashMap<String, f64>> = HashMap::new();
        for sample in self.query(&query).await? {
            let (Some(function), Some(code)) = (
                sample.labels.get("function_name"),
                sample.labels.get("code"),
            ) else {
                continue;
            };
            result
                .entry(function.clone())
                .or_default()
                .insert(code.clone(), sample.value);
        }
        Ok(result)
    }

    /// Active replica count per function.
    pub async fn replica_counts(&self) -> Result<HashMap<String, i64>, TelemetryError> {
        let samples = self.query("gateway_service_count").await?;
        Ok(Self::by_label(samples, "function_name")
            .into_iter()
            .map(|(k, v)| (k, v as i64))
            .collect())
    }

    /// Fraction of CPU used per node-exporter instance over `span`.
    pub async fn node_cpu_usage(
        &self,
        span: Duration,
    ) -> Result<HashMap<String, f64>, TelemetryError> {
        let t = Self::span(span);
        let query = format!(
            "1 - (avg by (instance) (rate(node_cpu_seconds_total{{job=\"node-exporter\",mode=\"idle\"}}[{t}])))"
        );
        Ok(Self::by_label(self.query(&query).await?, "instance"))
    }

    /// Fraction of RAM used per node-exporter instance over `span`.
    pub async fn node_ram_usage(
        &self,
        span: Duration,
    ) -> Result<HashMap<String, f64>, TelemetryError> {
        let t = Self::span(span);
        let query = format!(
            "(1 - ((avg_over_time(node_memory_MemFree_bytes[{t}]) + avg_over_time(node_memory_Cached_bytes[{t}]) + avg_over_time(node_memory_Buffers_bytes[{t}])) / avg_over_time(node_memory_MemTotal_bytes[{t}])))"
        );
        Ok(Self::by_label(self.query(&query).await?, "instance"))
    }

    /// CPU used per function container over `span`, relative to the node.
    pub async fn function_cpu_usage(
        &self,
        span: Duration,
        functions: &[String],
    ) -> Result<HashMap<String, f64>, TelemetryError> {
        if functions.is_empty() {
            return Ok(HashMap::new());
        }
        let t = Self::span(span);
        let filter = functions.join("|");
        let query = format!(
            "sum by (id) (irate(container_cpu_usage_seconds_total{{id=~\".*({filter}).*\"}}[{t}])) / on() group_left() sum by (instance) (irate(node_cpu_seconds_total{{job=\"node-exporter\"}}[{t}]))"
        );
        Ok(Self::by_label(self.query(&query).await?, "id"))
    }

    /// RAM used per function container over `span`, relative to the node.
    pub async fn function_ram_usage(
        &self,
        span: Duration,
        functions: &[String],
    ) -> Result<HashMap<String, f64>, TelemetryError> {
        if functions.is_empty() {
            return Ok(HashMap::new());
        }
        let t = Self::span(span);
        let filter = functions.join("|");
        let query = format!(
            "sum by (id) (avg_over_time(container_memory_usage_bytes{{id=~\".*({filter}).*\"}}[{t}])) / on() group_left() avg_over_time(node_memory_MemTotal_bytes[{t}])"
        );
        Ok(Self::by_label(self.query(&query).await?, "id"))
    }
}
