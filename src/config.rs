use crate::watcher::FailurePolicy;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from dingdongditch.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub hardware: HardwareConfig,
    pub units: Vec<UnitConfig>,
    pub settings: SettingsConfig,
    pub watcher: WatcherConfig,
    pub status: StatusConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    /// How long the buzzer must be held before it counts as a press.
    pub buzzer_hold_ms: u64,
    /// How often buzzer inputs are sampled.
    pub poll_interval_ms: u64,
}

/// Pin assignment for one unit. A unit with an empty id is not wired up.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct UnitConfig {
    pub id: String,
    pub buzzer: u8,
    pub bell: u8,
    pub strike: u8,
}

/// Which remote settings store to talk to.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[default]
    Firebase,
    File,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SettingsConfig {
    pub backend: Backend,
    /// Firebase database URL, e.g. `https://my-gate.firebaseio.com`.
    pub url: Option<String>,
    /// Firebase database secret or ID token, sent as `auth=`.
    pub auth: Option<String>,
    /// JSON document used by the file backend.
    pub path: PathBuf,
    /// Key under which per-unit settings live.
    pub root: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub interval_secs: u64,
    pub on_failure: FailurePolicy,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub path: PathBuf,
}

// --- Default implementations ---

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            buzzer_hold_ms: 100,
            poll_interval_ms: 20,
        }
    }
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            url: None,
            auth: None,
            path: PathBuf::from("settings.json"),
            root: "settings".to_string(),
            timeout_secs: 10,
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            on_failure: FailurePolicy::default(),
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("dingdongditch.status"),
        }
    }
}

impl HardwareConfig {
    pub fn buzzer_hold(&self) -> Duration {
        Duration::from_millis(self.buzzer_hold_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl SettingsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl WatcherConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Config {
    /// Ids of the units that are actually wired up.
    pub fn unit_ids(&self) -> Vec<&str> {
        self.units
            .iter()
            .map(|u| u.id.as_str())
            .filter(|id| !id.is_empty())
            .collect()
    }

    /// Reject configurations the controller cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.watcher.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "watcher.interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.hardware.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "hardware.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for id in self.unit_ids() {
            if !seen.insert(id) {
                return Err(ConfigError::Invalid(format!("duplicate unit id {id:?}")));
            }
        }
        Ok(())
    }

    /// Checks needed only by commands that talk to the settings store.
    pub fn validate_settings(&self) -> Result<(), ConfigError> {
        if self.settings.backend == Backend::Firebase
            && self.settings.url.as_deref().map_or(true, str::is_empty)
        {
            return Err(ConfigError::Invalid(
                "settings.url is required for the firebase backend".to_string(),
            ));
        }
        Ok(())
    }
}

/// Read and parse a config file.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    let config: Config = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    tracing::debug!(path = %path.display(), units = config.units.len(), "loaded config");
    Ok(config)
}

/// Errors from loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}
