use faasmesh_agent::{observability, Agent};

#[tokio::main]
async fn main() {
    let config = match faasmesh_agent::config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(2);
        }
    };

    observability::logging::init(config.debug, config.log_datetime, config.log_colors);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "faasmesh-agent starting");
    tracing::debug!(?config, "loaded configuration");

    if let Err(e) = Agent::new(config).run().await {
        tracing::error!(error = %e, "fatal: {e}");
        std::process::exit(1);
    }
}
