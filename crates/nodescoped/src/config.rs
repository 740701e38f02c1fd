//! Configuration management for nodescoped.
//!
//! Loads settings from /etc/nodescope/config.toml (or `$NODESCOPE_CONFIG`) and
//! falls back to defaults. The log path can also come from `$NODESCOPE_LOG` or
//! `$COMFYUI_LOG`; it is the one setting startup cannot do without.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use nodescope_common::{DEFAULT_LEDGER_CAPACITY, DEFAULT_MAX_READ_BYTES, DEFAULT_MAX_TRACEBACK_LINES};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/nodescope/config.toml";

/// Environment variable naming an alternative config file
pub const CONFIG_ENV: &str = "NODESCOPE_CONFIG";

/// Environment variables that override the log path, in priority order
pub const LOG_PATH_ENV: [&str; 2] = ["NODESCOPE_LOG", "COMFYUI_LOG"];

/// Log following
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log file written by the host process
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Poll interval in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Upper bound on bytes read per poll
    #[serde(default = "default_max_read_bytes")]
    pub max_read_bytes: usize,

    /// Lines a single traceback may span before it is dropped
    #[serde(default = "default_max_traceback_lines")]
    pub max_traceback_lines: usize,

    /// Raw lines kept for log queries
    #[serde(default = "default_tail_lines")]
    pub tail_lines: usize,
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_max_read_bytes() -> usize {
    DEFAULT_MAX_READ_BYTES
}

fn default_max_traceback_lines() -> usize {
    DEFAULT_MAX_TRACEBACK_LINES
}

fn default_tail_lines() -> usize {
    2000
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            path: None,
            poll_interval_ms: default_poll_interval(),
            max_read_bytes: default_max_read_bytes(),
            max_traceback_lines: default_max_traceback_lines(),
            tail_lines: default_tail_lines(),
        }
    }
}

/// Error history and classification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorsConfig {
    /// Classified errors kept in memory
    #[serde(default = "default_ledger_capacity")]
    pub ledger_capacity: usize,

    /// Directory of extra `*.json` pattern files
    #[serde(default)]
    pub patterns_dir: Option<PathBuf>,
}

fn default_ledger_capacity() -> usize {
    DEFAULT_LEDGER_CAPACITY
}

impl Default for ErrorsConfig {
    fn default() -> Self {
        Self {
            ledger_capacity: default_ledger_capacity(),
            patterns_dir: None,
        }
    }
}

/// Node plugins and registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodesConfig {
    /// Root of the plugin tree; frames under it name the owning node
    #[serde(default)]
    pub plugin_root: Option<PathBuf>,

    /// Saved node-info document used for validation
    #[serde(default)]
    pub registry_path: Option<PathBuf>,

    /// Plugin file changes kept in memory
    #[serde(default = "default_file_change_capacity")]
    pub file_change_capacity: usize,
}

fn default_file_change_capacity() -> usize {
    200
}

impl Default for NodesConfig {
    fn default() -> Self {
        Self {
            plugin_root: None,
            registry_path: None,
            file_change_capacity: default_file_change_capacity(),
        }
    }
}

/// Workflow sync
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Quiet period before a coalesced push, in milliseconds
    #[serde(default = "default_quiet_ms")]
    pub quiet_ms: u64,
}

fn default_quiet_ms() -> u64 {
    500
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            quiet_ms: default_quiet_ms(),
        }
    }
}

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub errors: ErrorsConfig,

    #[serde(default)]
    pub nodes: NodesConfig,

    #[serde(default)]
    pub sync: SyncConfig,
}

impl Config {
    /// Load config from the standard locations, then apply environment overrides.
    pub fn load() -> Self {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| CONFIG_PATH.to_string());
        let mut config = Self::load_from_path(Path::new(&path)).unwrap_or_else(|e| {
            warn!("Config not found, using defaults: {}", e);
            Config::default()
        });
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Load config from specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Override settings from the environment.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = LOG_PATH_ENV.iter().find_map(|key| lookup(key)) {
            if !path.trim().is_empty() {
                self.log.path = Some(PathBuf::from(path));
            }
        }
    }

    /// Reject settings the daemon cannot start with.
    pub fn validate(&self) -> Result<()> {
        match &self.log.path {
            None => bail!(
                "no log file configured: set [log] path in {} or {}",
                CONFIG_PATH,
                LOG_PATH_ENV.join("/")
            ),
            Some(p) if p.as_os_str().is_empty() => bail!("[log] path is empty"),
            Some(_) => {}
        }
        if self.log.poll_interval_ms == 0 {
            bail!("[log] poll_interval_ms must be positive");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.log.poll_interval_ms)
    }

    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.sync.quiet_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log.poll_interval_ms, 1000);
        assert_eq!(config.errors.ledger_capacity, 50);
        assert_eq!(config.sync.quiet_ms, 500);
        assert_eq!(config.nodes.file_change_capacity, 200);
        assert!(config.log.path.is_none());
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
[log]
path = "/srv/host/comfyui.log"
poll_interval_ms = 250

[nodes]
plugin_root = "/srv/host/custom_nodes"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.log.path.as_deref(), Some(Path::new("/srv/host/comfyui.log")));
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert_eq!(
            config.nodes.plugin_root.as_deref(),
            Some(Path::new("/srv/host/custom_nodes"))
        );
        // Defaults for missing fields
        assert_eq!(config.log.max_traceback_lines, DEFAULT_MAX_TRACEBACK_LINES);
        assert_eq!(config.quiet_period(), Duration::from_millis(500));
    }

    #[test]
    fn test_missing_log_path_fails_validation() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides_log_path() {
        let mut config = Config::default();
        config.apply_env(|key| match key {
            "COMFYUI_LOG" => Some("/tmp/comfyui.log".to_string()),
            _ => None,
        });
        assert_eq!(config.log.path.as_deref(), Some(Path::new("/tmp/comfyui.log")));
        assert!(config.validate().is_ok());

        config.apply_env(|key| match key {
            "NODESCOPE_LOG" => Some("/var/log/host.log".to_string()),
            "COMFYUI_LOG" => Some("/tmp/comfyui.log".to_string()),
            _ => None,
        });
        assert_eq!(config.log.path.as_deref(), Some(Path::new("/var/log/host.log")));
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let mut config = Config::default();
        config.log.path = Some(PathBuf::from("/tmp/x.log"));
        config.log.poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[errors]\nledger_capacity = 7\n").unwrap();
        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.errors.ledger_capacity, 7);
        assert!(Config::load_from_path(&dir.path().join("none.toml")).is_err());
    }
}
