//! Engine configuration: defaults, `BPMN_ENGINE_*` environment variables,
//! or a YAML file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PREFIX: &str = "BPMN_ENGINE_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Console output at debug level instead of a log file at info level.
    pub development: bool,
    pub log_dir: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            development: false,
            log_dir: PathBuf::from("logs"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Milliseconds between scheduler ticks.
    pub interval_ms: u64,
    /// Instances that faulted this many times are no longer selected.
    pub bad_execution_times: u32,
    /// Instances processed per tick.
    pub max_processes: usize,
    /// Minimum delay before a reload-requested instance runs again.
    pub reload_delay_secs: u64,
    /// Account name for unattended sessions.
    pub unattended_account: Option<String>,
    /// Directory template URLs are resolved against.
    pub definitions_root: PathBuf,
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            bad_execution_times: 4,
            max_processes: 10,
            reload_delay_secs: 240,
            unattended_account: None,
            definitions_root: PathBuf::from("."),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn reload_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.reload_delay_secs.min(u64::from(u32::MAX)) as i64)
    }

    /// Read `BPMN_ENGINE_*` variables over the defaults. Unparseable values
    /// are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = parsed(&var, "INTERVAL_MS") {
            config.interval_ms = v;
        }
        if let Some(v) = parsed(&var, "BAD_EXECUTION_TIMES") {
            config.bad_execution_times = v;
        }
        if let Some(v) = parsed(&var, "MAX_PROCESSES") {
            config.max_processes = v;
        }
        if let Some(v) = parsed(&var, "RELOAD_DELAY_SECS") {
            config.reload_delay_secs = v;
        }
        if let Some(v) = parsed(&var, "DEVELOPMENT") {
            config.logging.development = v;
        }
        if let Some(v) = var("UNATTENDED_ACCOUNT") {
            config.unattended_account = Some(v);
        }
        if let Some(v) = var("DEFINITIONS_ROOT") {
            config.definitions_root = PathBuf::from(v);
        }
        if let Some(v) = var("LOG_DIR") {
            config.logging.log_dir = PathBuf::from(v);
        }
        config
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
        serde_yaml::from_str(&content).with_context(|| format!("Parsing {}", path.display()))
    }
}

fn parsed<T: std::str::FromStr>(var: impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = var(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = %format!("{ENV_PREFIX}{name}"), value = %raw, "Ignoring invalid configuration value");
            None
        }
    }
}
