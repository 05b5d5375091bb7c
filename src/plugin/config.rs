use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use super::PluginError;

const DEFAULT_PLUGIN_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_RUN_BUDGET_MS: u64 = 15_000;
const DEFAULT_INIT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MAX_CONCURRENT_RUNS: usize = 4;
const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid settings for plugin {plugin}: {reason}")]
    InvalidEntry { plugin: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineSettings {
    pub plugin_timeout_ms: u64,
    pub run_budget_ms: u64,
    pub init_timeout_ms: u64,
    pub max_concurrent_runs: usize,
    /// Consecutive failed or timed-out calls before a plugin is disabled.
    /// Zero keeps failing plugins enabled forever.
    pub max_consecutive_failures: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            plugin_timeout_ms: DEFAULT_PLUGIN_TIMEOUT_MS,
            run_budget_ms: DEFAULT_RUN_BUDGET_MS,
            init_timeout_ms: DEFAULT_INIT_TIMEOUT_MS,
            max_concurrent_runs: DEFAULT_MAX_CONCURRENT_RUNS,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
        }
    }
}

impl PipelineSettings {
    pub fn plugin_timeout(&self) -> Duration {
        Duration::from_millis(self.plugin_timeout_ms.max(1))
    }

    pub fn run_budget(&self) -> Duration {
        Duration::from_millis(self.run_budget_ms.max(1))
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms.max(1))
    }

    pub fn concurrency(&self) -> usize {
        self.max_concurrent_runs.max(1)
    }
}

/// Pipeline tuning plus raw per-plugin entries. Plugin entries stay as JSON
/// until the named plugin registers, so one bad entry only affects its owner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub pipeline: PipelineSettings,
    pub plugins: BTreeMap<String, Value>,
}

impl PipelineConfig {
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match Self::from_path(path) {
            Ok(config) => config,
            Err(err) => {
                warn!("using default pipeline config, {}: {err}", path.display());
                Self::default()
            }
        }
    }

    pub fn plugin_settings(&self, plugin: &str) -> Result<PluginSettings, ConfigError> {
        match self.plugins.get(plugin) {
            None => Ok(PluginSettings::default()),
            Some(raw) => PluginSettings::from_value(plugin, raw),
        }
    }

    pub fn set_plugin(&mut self, plugin: &str, settings: &PluginSettings) {
        self.plugins.insert(plugin.to_string(), settings.to_value());
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PluginSettings {
    pub enabled: bool,
    pub options: PluginOptions,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            options: PluginOptions::default(),
        }
    }
}

impl PluginSettings {
    pub fn from_value(plugin: &str, raw: &Value) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidEntry {
            plugin: plugin.to_string(),
            reason: reason.to_string(),
        };

        let entry = raw.as_object().ok_or_else(|| invalid("entry must be an object"))?;
        let enabled = match entry.get("enabled") {
            None | Some(Value::Null) => true,
            Some(Value::Bool(enabled)) => *enabled,
            Some(_) => return Err(invalid("`enabled` must be a boolean")),
        };
        let options = match entry.get("config") {
            None | Some(Value::Null) => PluginOptions::default(),
            Some(Value::Object(map)) => PluginOptions::from_map(map.clone()),
            Some(_) => return Err(invalid("`config` must be an object")),
        };

        Ok(Self { enabled, options })
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "enabled": self.enabled,
            "config": self.options.as_map(),
        })
    }
}

/// Free-form plugin options. Keys the plugin does not know are kept as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginOptions(Map<String, Value>);

impl PluginOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn bool_or(&self, key: &str, default: bool) -> Result<bool, PluginError> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(Value::Bool(value)) => Ok(*value),
            Some(_) => Err(type_error(key, "a boolean")),
        }
    }

    pub fn f64_or(&self, key: &str, default: f64) -> Result<f64, PluginError> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(value) => value
                .as_f64()
                .filter(|number| number.is_finite())
                .ok_or_else(|| type_error(key, "a number")),
        }
    }

    pub fn u64_or(&self, key: &str, default: u64) -> Result<u64, PluginError> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(value) => value
                .as_u64()
                .ok_or_else(|| type_error(key, "a non-negative integer")),
        }
    }

    pub fn string_list(&self, key: &str) -> Result<Option<Vec<String>>, PluginError> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| type_error(key, "a list of strings"))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Some),
            Some(_) => Err(type_error(key, "a list of strings")),
        }
    }
}

fn type_error(key: &str, expected: &str) -> PluginError {
    PluginError::Config(format!("option `{key}` must be {expected}"))
}
