//! File logging for the sync engine
//!
//! Logging is opt-in: the CLI calls [`init`] only under `--verbose`, since
//! stdout carries command output and `tail` redraws it continuously.
//! Records go to `$XDG_STATE_HOME/chronicle/`, one file per UTC day named
//! `chronicle.log.YYYY-MM-DD`, pruned to `logging.max_files`.
//!
//! `RUST_LOG` replaces the configured level entirely. Without it, the
//! HTTP and WebSocket stacks are held at `warn` so reconnect storms stay
//! readable at `debug`.

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{Config, LoggingConfig};
use crate::error::{Error, Result};

const FILE_PREFIX: &str = "chronicle.log";

/// Transport crates that log every frame and pooled connection
const QUIET_TARGETS: &[&str] = &["hyper", "hyper_util", "reqwest", "rustls", "tungstenite", "tokio_tungstenite"];

/// Keeps the background writer alive; pending records flush on drop.
pub struct LoggingGuard {
    _guard: tracing_appender::non_blocking::WorkerGuard,
}

pub fn init(config: &LoggingConfig) -> Result<LoggingGuard> {
    let log_dir = Config::state_dir();
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(FILE_PREFIX)
        .max_log_files(config.max_files.max(1))
        .build(&log_dir)
        .map_err(|e| Error::Config(format!("failed to create log file: {}", e)))?;
    let (writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter_for(config))
        .with(file_layer)
        .init();

    tracing::info!(
        file = %log_file_at(Utc::now()).display(),
        level = %config.level,
        "Logging initialized"
    );

    Ok(LoggingGuard { _guard: guard })
}

fn filter_for(config: &LoggingConfig) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let mut directives = vec![config.level.clone()];
    directives.extend(QUIET_TARGETS.iter().map(|t| format!("{}=warn", t)));
    EnvFilter::try_new(directives.join(",")).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// File the appender writes to at `now`
pub fn log_file_at(now: DateTime<Utc>) -> PathBuf {
    Config::state_dir().join(format!("{}.{}", FILE_PREFIX, now.format("%Y-%m-%d")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_log_file_is_dated() {
        let now = Utc.with_ymd_and_hms(2025, 3, 9, 23, 59, 0).unwrap();
        let path = log_file_at(now);
        assert!(path.ends_with("chronicle/chronicle.log.2025-03-09"));
    }

    #[test]
    fn test_transport_crates_are_quieted() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = LoggingConfig {
            level: "debug".to_string(),
            max_files: 3,
        };
        let filter = filter_for(&config).to_string();
        assert!(filter.contains("debug"));
        assert!(filter.contains("tungstenite=warn"));
        assert!(filter.contains("hyper=warn"));
    }
}
