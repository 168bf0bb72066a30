//! Datasource configuration.
//!
//! Options live in the instance's `jsonData`; secrets in its decrypted
//! secure map. The CLI reads the same shape from a TOML file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::host::DataSourceInstanceSettings;

/// Which kind of environment hosts the script module.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// A V8 isolate on a dedicated thread of this process.
    #[default]
    InProcess,
    /// A `scriptds-host` child process.
    Subprocess,
}

/// Restart policy for environments that die.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RestartSettings {
    pub max_restarts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    /// A stable run this long resets the restart count.
    pub restart_window_ms: u64,
}

impl Default for RestartSettings {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
            restart_window_ms: 300_000,
        }
    }
}

/// Runtime options, all optional in `jsonData.runtime`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuntimeSettings {
    pub strategy: Strategy,
    /// Name of the module's exported entry function.
    pub entry_point: String,
    pub query_timeout_ms: u64,
    pub startup_timeout_ms: u64,
    /// Time top-level async work of the module gets to finish during load.
    pub settle_ms: u64,
    /// Path to `scriptds-host`; defaults to the current executable's
    /// directory, then `PATH`.
    pub host_binary: Option<PathBuf>,
    pub app: String,
    pub timezone: String,
    pub default_interval_ms: u64,
    pub restart: RestartSettings,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            strategy: Strategy::InProcess,
            entry_point: "runQuery".to_string(),
            query_timeout_ms: 30_000,
            startup_timeout_ms: 10_000,
            settle_ms: 250,
            host_binary: None,
            app: "dashboard".to_string(),
            timezone: "browser".to_string(),
            default_interval_ms: 30_000,
            restart: RestartSettings::default(),
        }
    }
}

impl RuntimeSettings {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

/// Options parsed from `jsonData`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginSettings {
    /// Location of the script module on disk.
    pub path: String,
    pub runtime: RuntimeSettings,
    #[serde(skip)]
    pub secrets: SecretPluginSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretPluginSettings {
    #[serde(rename = "apiKey", default)]
    pub api_key: String,
}

/// Parse the plugin options and secrets of a datasource instance.
pub fn load_plugin_settings(
    source: &DataSourceInstanceSettings,
) -> Result<PluginSettings, ConfigError> {
    let mut settings = if source.json_data.is_null() {
        PluginSettings::default()
    } else {
        serde_json::from_value::<PluginSettings>(source.json_data.clone())
            .map_err(|e| ConfigError::InvalidJsonData(e.to_string()))?
    };

    settings.secrets = SecretPluginSettings {
        api_key: source
            .decrypted_secure_json_data
            .get("apiKey")
            .cloned()
            .unwrap_or_default(),
    };
    Ok(settings)
}

/// Read instance settings from a TOML file.
pub fn load_settings_file(path: &Path) -> Result<DataSourceInstanceSettings, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    parse_settings(&content)
}

/// Parse instance settings from TOML text.
pub fn parse_settings(content: &str) -> Result<DataSourceInstanceSettings, ConfigError> {
    toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
}
