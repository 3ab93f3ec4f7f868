//! Tracing subscriber setup.
//!
//! Console output goes to stderr, plain or JSON. When file logging is on,
//! every event is also written as JSON lines to a daily-rolled file under
//! `.conductor/logs/`.

use crate::config::ConductorConfig;
use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const LOG_FILE_PREFIX: &str = "conductor.log";

/// Filter directive: `RUST_LOG` wins, then `--verbose`, then the config.
fn filter_directive(config: &ConductorConfig) -> String {
    if config.verbose {
        "conductor=debug".to_string()
    } else {
        config.toml.logging.level.clone()
    }
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop; keep it alive for
/// the whole program.
pub fn init_logging(config: &ConductorConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(config)));

    let console_layer = if config.toml.logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    let (file_layer, guard) = if config.toml.logging.file {
        let dir = config.log_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
        let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_ansi(false)
            .with_writer(writer);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_filter_directive_uses_config_level() {
        let dir = tempdir().unwrap();
        let mut config = ConductorConfig::new(dir.path().to_path_buf()).unwrap();
        assert_eq!(filter_directive(&config), "conductor=info");

        config.toml.logging.level = "conductor=trace,reqwest=warn".to_string();
        assert_eq!(filter_directive(&config), "conductor=trace,reqwest=warn");

        config.verbose = true;
        assert_eq!(filter_directive(&config), "conductor=debug");
    }
}
