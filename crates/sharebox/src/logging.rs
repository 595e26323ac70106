//! Tracing initialisation.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Keeps the background log writer alive; drop it last.
#[derive(Debug)]
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Filter directive for the configured `level`.
///
/// `--verbose` forces debug. Otherwise `RUST_LOG` wins over the config.
pub fn filter_directive(level: &str, verbose: bool) -> String {
    if verbose {
        return "debug".to_string();
    }
    match std::env::var("RUST_LOG") {
        Ok(directive) if !directive.is_empty() => directive,
        _ => level.to_lowercase(),
    }
}

/// Install the global subscriber.
///
/// Logs go to stderr so command output on stdout stays clean. When
/// `log_file` is set they go to that file instead, through a non-blocking
/// writer.
pub fn init(level: &str, verbose: bool, log_file: Option<&Path>) -> Result<LogGuard> {
    let filter = EnvFilter::try_new(filter_directive(level, verbose))
        .with_context(|| format!("Invalid log filter: {level}"))?;

    let Some(path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialise logging: {e}"))?;
        return Ok(LogGuard { _file: None });
    };

    let directory = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .with_context(|| format!("Log file path has no file name: {}", path.display()))?;
    std::fs::create_dir_all(directory)
        .with_context(|| format!("Failed to create log directory: {}", directory.display()))?;

    let appender = tracing_appender::rolling::never(directory, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialise logging: {e}"))?;

    Ok(LogGuard { _file: Some(guard) })
}
