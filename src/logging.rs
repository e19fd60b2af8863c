//! Structured logging: console plus a daily rolling file.
//!
//! The log directory defaults to the per-user data dir
//! (`%LOCALAPPDATA%\com.thesmall.customer-screen\logs` or
//! `~/.local/share/com.thesmall.customer-screen/logs`) and can be moved with
//! `CUSTOMER_SCREEN_LOG_DIR`. Old files are pruned at startup.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const ENV_LOG_DIR: &str = "CUSTOMER_SCREEN_LOG_DIR";

/// Maximum number of log files to keep.
pub const MAX_LOG_FILES: usize = 10;

const LOG_FILE_PREFIX: &str = "customer-screen";
const DEFAULT_FILTER: &str = "info,customer_screen_lib=debug";

pub fn get_log_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(ENV_LOG_DIR) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir.trim());
        }
    }

    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join("com.thesmall.customer-screen").join("logs")
}

/// Keep only the newest `keep` log files in `log_dir`.
pub fn prune_old_logs(log_dir: &Path, keep: usize) {
    if !log_dir.exists() {
        return;
    }

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX));
            if is_log {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::UNIX_EPOCH);
                log_files.push((path, modified));
            }
        }
    }

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    for (path, _) in log_files.iter().skip(keep) {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to prune log file {}: {e}", path.display());
        }
    }
}

/// Install the global subscriber. Call once, before anything logs.
pub fn init_logging() -> PathBuf {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let log_dir = get_log_dir();
    prune_old_logs(&log_dir, MAX_LOG_FILES);
    fs::create_dir_all(&log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    // Dropping the guard flushes and stops the writer; the screen runs until
    // process exit.
    std::mem::forget(guard);

    log_dir
}
