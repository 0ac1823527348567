//! Metrics registration and recording helpers.

use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, gauge, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub const SUCCESS_ITERATIONS: &str = "agent_strategy_success_iterations_total";
pub const ITERATION_DURATION: &str = "agent_strategy_iteration_duration_seconds";

/// Install the Prometheus recorder and return the handle used by the
/// /metrics endpoint to render the exposition text.
pub fn install_recorder() -> Result<PrometheusHandle, String> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| e.to_string())?;

    describe_counter!(
        SUCCESS_ITERATIONS,
        Unit::Count,
        "Total number of successful strategy iterations."
    );
    describe_gauge!(
        ITERATION_DURATION,
        Unit::Seconds,
        "Wall-clock duration of the last strategy iteration."
    );

    Ok(handle)
}

/// Record one successful strategy iteration and its duration.
pub fn record_iteration(duration: Duration) {
    counter!(SUCCESS_ITERATIONS).increment(1);
    gauge!(ITERATION_DURATION).set(duration.as_secs_f64());
}
