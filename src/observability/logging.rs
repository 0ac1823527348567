//! Structured logging setup.

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber.
///
/// `debug` raises the default level from `info` to `debug` for this crate;
/// `RUST_LOG` still wins when set. `datetime` and `colors` control the
/// timestamp and ANSI rendering of log lines.
pub fn init(debug: bool, datetime: bool, colors: bool) {
    let default_directive = if debug {
        "faasmesh_agent=debug,info"
    } else {
        "info"
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(colors);

    if datetime {
        builder.init();
    } else {
        builder.without_time().init();
    }
}
