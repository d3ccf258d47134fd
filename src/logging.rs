//! Structured logging: console plus a daily rolling file.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{Error, Result};

pub const LOG_FILE_PREFIX: &str = "fieldrep";
pub const MAX_LOG_FILES: usize = 10;
const DEFAULT_FILTER: &str = "info,fieldrep_sync=debug";

/// Logs live next to the database.
pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
///
/// The returned guard flushes the file writer on drop; hold it for the
/// lifetime of the process. If a subscriber is already installed the new
/// layers are not applied and the guard is still returned.
pub fn init(log_dir: &Path) -> Result<WorkerGuard> {
    fs::create_dir_all(log_dir)
        .map_err(|e| Error::LocalStore(format!("cannot create log dir {}: {e}", log_dir.display())))?;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    if tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .is_err()
    {
        warn!("tracing subscriber already installed; keeping it");
    }

    prune_old_logs(log_dir, MAX_LOG_FILES);
    Ok(guard)
}

/// Delete all but the newest `keep` log files. Daily file names carry the
/// date, so name order is age order. Returns how many files were removed.
pub fn prune_old_logs(log_dir: &Path, keep: usize) -> usize {
    let Ok(entries) = fs::read_dir(log_dir) else {
        return 0;
    };

    let mut log_files: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX))
        })
        .collect();

    // Newest first.
    log_files.sort_by(|a, b| b.file_name().cmp(&a.file_name()));

    let mut removed = 0;
    for path in log_files.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to prune log file {}: {e}", path.display()),
        }
    }
    removed
}
