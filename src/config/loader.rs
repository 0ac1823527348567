//! Configuration loading.
//!
//! Values come from `AGENT_*` environment variables; an optional `.env`-style
//! file given with `--config` overwrites them before the full parse.

use clap::Parser;

use crate::config::schema::AgentConfig;
use crate::config::validation::{validate, ConfigError};

/// Load and validate the agent configuration from CLI flags and environment.
///
/// `--help` and `--version` print and exit the process here, like any CLI.
pub fn load() -> Result<AgentConfig, ConfigError> {
    match load_from(std::env::args_os()) {
        Err(ConfigError::Parse(e))
            if e.kind() == clap::error::ErrorKind::DisplayHelp
                || e.kind() == clap::error::ErrorKind::DisplayVersion =>
        {
            e.exit()
        }
        other => other,
    }
}

/// Same as [`load`] but with an explicit argument list, for tests.
pub fn load_from<I, T>(args: I) -> Result<AgentConfig, ConfigError>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let args: Vec<std::ffi::OsString> = args.into_iter().map(Into::into).collect();

    // The --config file must land in the environment before clap resolves
    // env-backed flags, so scan for it ahead of the real parse.
    if let Some(path) = preparse_config_flag(&args) {
        dotenvy::from_path_override(&path)
            .map_err(|source| ConfigError::EnvFile { path, source })?;
    }

    let config = AgentConfig::try_parse_from(args)?;
    validate(&config)?;
    Ok(config)
}

/// Extract the value of `--config` (either `--config PATH` or
/// `--config=PATH`) without running the full parser.
fn preparse_config_flag(args: &[std::ffi::OsString]) -> Option<std::path::PathBuf> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let arg = arg.to_string_lossy();
        if arg == "--config" {
            return iter.next().map(|v| std::path::PathBuf::from(v.clone()));
        }
        if let Some(value) = arg.strip_prefix("--config=") {
            return Some(std::path::PathBuf::from(value));
        }
    }
    None
}
