//! Tracing setup: journald on Linux, a daily rolling file elsewhere, or
//! stderr when asked for interactively.
//!
//! `PICTOR_LOG` takes an `EnvFilter` directive, e.g. `PICTOR_LOG=debug` or
//! `PICTOR_LOG=pictor::faces=trace,info`. The default is `info`.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Where log records go.
#[derive(Debug, Clone, Default)]
pub enum LogTarget {
    /// journald when reachable, otherwise a rolling file.
    #[default]
    System,
    /// Rolling file in the given directory.
    File(PathBuf),
    Stderr,
}

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

fn filter() -> EnvFilter {
    EnvFilter::try_from_env("PICTOR_LOG").unwrap_or_else(|_| EnvFilter::new("info"))
}

pub fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pictor")
        .join("logs")
}

/// Install the global subscriber. Call once at startup; a second call fails.
pub fn init(target: LogTarget) -> Result<()> {
    let log_dir = match target {
        LogTarget::Stderr => {
            tracing_subscriber::registry()
                .with(filter())
                .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
                .try_init()?;
            return Ok(());
        }
        LogTarget::File(dir) => dir,
        LogTarget::System => {
            #[cfg(target_os = "linux")]
            {
                if let Ok(journald) = tracing_journald::layer() {
                    tracing_subscriber::registry()
                        .with(filter())
                        .with(journald.with_syslog_identifier("pictor".to_string()))
                        .try_init()?;
                    tracing::debug!("Logging to journald");
                    return Ok(());
                }
            }
            default_log_dir()
        }
    };

    std::fs::create_dir_all(&log_dir)?;
    let appender = tracing_appender::rolling::daily(&log_dir, "pictor.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = FILE_GUARD.set(guard);

    tracing_subscriber::registry()
        .with(filter())
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .try_init()?;

    tracing::debug!(dir = %log_dir.display(), "Logging to file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_unwritable_log_dir_is_an_error() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();

        assert!(init(LogTarget::File(blocker.join("logs"))).is_err());
    }
}
