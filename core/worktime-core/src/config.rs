//! Configuration loading for the hook and the daemon.
//!
//! Handles paths and precedence for:
//! - `~/.worktime/config.toml` (or `WORKTIME_CONFIG`, or `--config`)
//! - runtime overrides from command-line flags
//!
//! Precedence is override > file > built-in default. A missing file is not an
//! error; a malformed one is, but callers on the capture path swallow it via
//! [`load_config_or_default`].

use crate::error::ConfigError;
use crate::ignore::IgnoreMatcher;
use fs_err as fs;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV: &str = "WORKTIME_CONFIG";
pub const DEFAULT_DAEMON_URL: &str = "http://127.0.0.1:9193";
pub const DEFAULT_LISTEN: &str = "127.0.0.1:9193";
pub const DEFAULT_TIMEOUT_MS: u64 = 100;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_SESSION_HOURS: u64 = 5;

const WORKTIME_DIR: &str = ".worktime";
const CONFIG_FILE: &str = "config.toml";
const FALLBACK_LOG_FILE: &str = "fallback-activities.log";
const DATABASE_FILE: &str = "worktime.db";

/// Returns `~/.worktime`.
pub fn worktime_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(WORKTIME_DIR))
}

/// Returns the config path, honoring `WORKTIME_CONFIG`.
pub fn default_config_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|value| !value.is_empty()) {
        return Some(PathBuf::from(path));
    }
    worktime_dir().map(|dir| dir.join(CONFIG_FILE))
}

pub fn default_log_dir() -> Option<PathBuf> {
    worktime_dir().map(|dir| dir.join("logs"))
}

pub fn default_fallback_log_path() -> Option<PathBuf> {
    default_log_dir().map(|dir| dir.join(FALLBACK_LOG_FILE))
}

pub fn default_database_path() -> Option<PathBuf> {
    worktime_dir().map(|dir| dir.join("daemon").join(DATABASE_FILE))
}

/// Expands a leading `~/` against the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub enabled: bool,
    pub daemon_url: String,
    pub timeout_ms: u64,
    pub fallback_log: Option<PathBuf>,
    pub user_id: Option<String>,
    pub project_names: BTreeMap<String, String>,
    pub ignore_patterns: Vec<String>,
    pub daemon: DaemonConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            daemon_url: DEFAULT_DAEMON_URL.to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            fallback_log: None,
            user_id: None,
            project_names: BTreeMap::new(),
            ignore_patterns: Vec::new(),
            daemon: DaemonConfig::default(),
        }
    }
}

impl Config {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Explicit `fallback_log`, else `~/.worktime/logs/fallback-activities.log`.
    pub fn fallback_log_path(&self) -> Option<PathBuf> {
        match &self.fallback_log {
            Some(path) => Some(expand_home(path)),
            None => default_fallback_log_path(),
        }
    }

    pub fn ignore_matcher(&self) -> Result<IgnoreMatcher, ConfigError> {
        IgnoreMatcher::new(&self.ignore_patterns)
    }

    pub fn with_overrides(mut self, overrides: &ConfigOverrides) -> Self {
        if let Some(enabled) = overrides.enabled {
            self.enabled = enabled;
        }
        if let Some(url) = &overrides.daemon_url {
            self.daemon_url = url.clone();
        }
        if let Some(timeout_ms) = overrides.timeout_ms {
            self.timeout_ms = timeout_ms;
        }
        if let Some(path) = &overrides.fallback_log {
            self.fallback_log = Some(path.clone());
        }
        if let Some(listen) = &overrides.listen {
            self.daemon.listen = listen.clone();
        }
        if let Some(database) = &overrides.database {
            self.daemon.database = Some(database.clone());
        }
        self
    }
}

/// Settings only the daemon reads (`[daemon]` table).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub listen: String,
    pub database: Option<PathBuf>,
    pub sweep_interval_secs: u64,
    pub idle_timeout_secs: u64,
    pub session_hours: u64,
    pub log_dir: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            database: None,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            session_hours: DEFAULT_SESSION_HOURS,
            log_dir: None,
        }
    }
}

impl DaemonConfig {
    pub fn database_path(&self) -> Option<PathBuf> {
        match &self.database {
            Some(path) => Some(expand_home(path)),
            None => default_database_path(),
        }
    }

    pub fn log_dir_path(&self) -> Option<PathBuf> {
        match &self.log_dir {
            Some(path) => Some(expand_home(path)),
            None => default_log_dir(),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.max(1))
    }

    pub fn session_length(&self) -> Duration {
        Duration::from_secs(self.session_hours.max(1) * 3600)
    }

    /// Sweep interval, never longer than the idle timeout and never zero.
    pub fn sweep_interval(&self) -> Duration {
        let idle = self.idle_timeout();
        Duration::from_secs(self.sweep_interval_secs.max(1)).min(idle)
    }
}

/// Values supplied on the command line. `None` leaves the file value alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub enabled: Option<bool>,
    pub daemon_url: Option<String>,
    pub timeout_ms: Option<u64>,
    pub fallback_log: Option<PathBuf>,
    pub listen: Option<String>,
    pub database: Option<PathBuf>,
}

/// Loads configuration from `path`, or the default location when `None`.
///
/// A missing file yields `Config::default()`.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = match path {
        Some(path) => expand_home(path),
        None => match default_config_path() {
            Some(path) => path,
            None => return Ok(Config::default()),
        },
    };

    if !path.exists() {
        return Ok(Config::default());
    }

    let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;

    let config: Config = toml::from_str(&contents).map_err(|err| ConfigError::Malformed {
        path: path.clone(),
        details: err.message().to_string(),
    })?;

    // Surface bad globs at load time instead of on every capture.
    config.ignore_matcher()?;
    Ok(config)
}

/// Like [`load_config`], but any error reverts to defaults with a warning.
pub fn load_config_or_default(path: Option<&Path>) -> Config {
    match load_config(path) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(error = %err, "Config unusable; using defaults");
            Config::default()
        }
    }
}
