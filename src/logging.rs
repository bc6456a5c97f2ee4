//! Tracing subscriber installation for hosts embedding the engine.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

pub const LOG_FILE_NAME: &str = "bpmn.log";

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

pub fn log_file_path(config: &LoggingConfig) -> PathBuf {
    config.log_dir.join(LOG_FILE_NAME)
}

fn open_log_file(dir: &Path) -> std::io::Result<std::fs::File> {
    std::fs::create_dir_all(dir)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(LOG_FILE_NAME))
}

/// Install the global subscriber. Returns `false` when one was already
/// installed.
///
/// Development mode logs to the console at `debug`; otherwise records are
/// appended to `<log_dir>/bpmn.log` at `info`. `RUST_LOG` overrides the
/// level in both modes.
pub fn init(config: &LoggingConfig) -> bool {
    if config.development {
        return tracing_subscriber::fmt()
            .with_env_filter(filter("debug"))
            .try_init()
            .is_ok();
    }

    match open_log_file(&config.log_dir) {
        Ok(file) => tracing_subscriber::fmt()
            .with_env_filter(filter("info"))
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init()
            .is_ok(),
        Err(e) => {
            let installed = tracing_subscriber::fmt()
                .with_env_filter(filter("info"))
                .try_init()
                .is_ok();
            tracing::warn!(
                log_dir = %config.log_dir.display(),
                error = %e,
                "Cannot open log file, logging to console"
            );
            installed
        }
    }
}
