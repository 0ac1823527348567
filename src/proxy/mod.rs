//! Proxy configuration management.
//!
//! # Data Flow
//! ```text
//! strategy ──▶ view (BTreeMaps) ──▶ render ──▶ bytes ──▶ Data Plane API POST
//! ```
//!
//! # Design Decisions
//! - Views are immutable snapshots built inside one tick and discarded
//! - Rendering is deterministic: sorted-map iteration, no timestamps, so
//!   identical inputs produce byte-identical output
//! - A non-2xx answer from the Data Plane API fails the whole tick

pub mod render;
pub mod view;

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use tracing::debug;

pub use view::{AllLocalView, NodeAddress, RecalcFunction, RecalcView, WeightedFunction, WeightedView};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("data plane api returned {status}: {body}")]
    Rejected { status: StatusCode, body: String },
}

/// Client for the proxy's configuration API.
#[derive(Clone)]
pub struct DataPlaneClient {
    base: String,
    user: String,
    pass: String,
    http: reqwest::Client,
}

impl DataPlaneClient {
    pub fn new(base: String, user: String, pass: String) -> Self {
        Self {
            base,
            user,
            pass,
            http: reqwest::Client::new(),
        }
    }

    /// Install a rendered configuration. The proxy reloads itself with the
    /// new configuration on success.
    pub async fn push_config(&self, config: &str) -> Result<(), ProxyError> {
        let response = self
            .http
            .post(format!(
                "{}/v3/services/haproxy/configuration/raw?skip_version=true",
                self.base
            ))
            .basic_auth(&self.user, Some(&self.pass))
            .header(CONTENT_TYPE, "text/plain")
            .timeout(REQUEST_TIMEOUT)
            .body(config.to_string())
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(ProxyError::Rejected { status, body });
        }

        debug!(%status, body = %body, "data plane api accepted the configuration");
        Ok(())
    }
}
