//! Tracing subscriber setup for applications embedding the client.
//!
//! Logs always go to a daily-rotating file in the platform log directory
//! (for bug reports). A stderr layer is added on request. `RUST_LOG`
//! overrides both filters.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

const LOG_FILE_NAME: &str = "fluux-client.log";
const APP_DIR: &str = "com.processone.fluux";

/// How verbose the stderr layer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// No stderr output.
    #[default]
    Quiet,
    /// Client events, no stanza content.
    Verbose,
    /// Also raw XMPP traffic.
    Traffic,
}

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Directory for the rotating log file. Defaults to [`default_log_dir`].
    pub log_dir: Option<PathBuf>,
    pub stderr: Verbosity,
}

/// Platform log directory:
///   macOS:   ~/Library/Logs/com.processone.fluux/
///   Linux:   ~/.local/share/com.processone.fluux/logs/
///   Windows: %LOCALAPPDATA%\com.processone.fluux\logs\
pub fn default_log_dir() -> PathBuf {
    let dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("logs");

    #[cfg(target_os = "macos")]
    let dir = dirs::home_dir()
        .map(|h| h.join("Library").join("Logs").join(APP_DIR))
        .unwrap_or(dir);

    dir
}

fn env_override() -> Option<EnvFilter> {
    std::env::var("RUST_LOG")
        .is_ok()
        .then(EnvFilter::from_default_env)
}

fn stderr_directives(verbosity: Verbosity) -> Option<&'static str> {
    match verbosity {
        Verbosity::Quiet => None,
        Verbosity::Verbose => Some("fluux_client=info,fluux_client::transport=info,info"),
        Verbosity::Traffic => Some("fluux_client=debug,info"),
    }
}

/// Install the global subscriber. Keep the returned guard alive for as
/// long as file logging is wanted; dropping it flushes and stops the
/// background writer.
pub fn init(options: &LogOptions) -> Result<WorkerGuard> {
    let log_dir = options.log_dir.clone().unwrap_or_else(default_log_dir);
    std::fs::create_dir_all(&log_dir).map_err(|e| {
        Error::Config(format!("could not create log directory '{}': {e}", log_dir.display()))
    })?;

    let file_filter = env_override().unwrap_or_else(|| EnvFilter::new("fluux_client=info,info"));
    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(file_filter);

    let stderr_filter = match (env_override(), stderr_directives(options.stderr)) {
        (Some(filter), _) => Some(filter),
        (None, Some(directives)) => Some(EnvFilter::new(directives)),
        (None, None) => None,
    };
    let stderr_layer = stderr_filter.map(|filter| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(filter)
    });

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .map_err(|e| Error::Config(format!("tracing subscriber already installed: {e}")))?;

    tracing::info!(log_dir = %log_dir.display(), "Logging initialized");
    Ok(guard)
}
