//! Log output setup.
use std::{
    fs::{self, OpenOptions},
    io,
    path::Path,
    sync::Mutex,
};

use tracing_subscriber::EnvFilter;

use crate::cli::LogLevelArg;

/// Builds the filter from `--log-level`, then `RUST_LOG`, then `info`.
pub fn env_filter(level: Option<LogLevelArg>) -> EnvFilter {
    match level {
        Some(level) => EnvFilter::new(level.as_str()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    }
}

/// Installs the global subscriber. Logs go to stderr, or are appended to
/// `log_path` without ANSI colors when one is given.
///
/// Calling this more than once keeps the first subscriber.
pub fn init_logging(level: Option<LogLevelArg>, log_path: Option<&Path>) -> io::Result<()> {
    let filter = env_filter(level);

    match log_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .try_init();
        }
        None => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(io::stderr)
                .try_init();
        }
    }
    Ok(())
}
