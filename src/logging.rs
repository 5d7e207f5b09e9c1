//! Logging setup with journald support on Linux.
//!
//! Logs go to systemd's journal when it is reachable, otherwise to a daily
//! rolling file under the local data directory. Interactive commands can ask
//! for stderr output instead.

use anyhow::Result;
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Where log records are written
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    /// journald on Linux when available, else a rolling file
    System { log_dir: Option<PathBuf> },
    Stderr,
}

/// Initialize the logging system.
///
/// The level is read from `EVENTLENS_LOG` (`debug`, `info`, `warn`, `error`
/// or any `EnvFilter` directive) and defaults to `info`.
pub fn init(target: LogTarget) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_env("EVENTLENS_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    let log_dir = match target {
        LogTarget::Stderr => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .try_init()?;
            return Ok(());
        }
        LogTarget::System { log_dir } => log_dir,
    };

    #[cfg(target_os = "linux")]
    {
        if let Ok(journald_layer) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(journald_layer.with_syslog_identifier("eventlens".to_string()))
                .try_init()?;

            tracing::debug!("Logging initialized with journald backend");
            return Ok(());
        }
    }

    let log_dir = log_dir.unwrap_or_else(default_log_dir);
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "eventlens.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Held for the life of the process so buffered lines get flushed
    static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
        std::sync::OnceLock::new();
    let _ = GUARD.set(guard);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .try_init()?;

    tracing::debug!("Logging initialized with file backend at {:?}", log_dir);
    Ok(())
}

fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("eventlens")
        .join("logs")
}
