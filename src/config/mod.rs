//! Configuration system (layered: code > env > config file).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use bon::Builder;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::{Result, TroupeError};

/// Default ceiling on model calls per invocation.
pub const DEFAULT_MAX_LLM_CALLS: usize = 500;

const APP_NAME_ENV: &str = "TROUPE_APP_NAME";
const MAX_LLM_CALLS_ENV: &str = "TROUPE_MAX_LLM_CALLS";
const STREAMING_MODE_ENV: &str = "TROUPE_STREAMING_MODE";
const CONFIG_FILE_NAME: &str = "config.toml";

/// How model output is delivered to the caller.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum StreamingMode {
    /// One response per model call.
    #[default]
    None,
    /// Server-sent incremental responses; intermediate events are `partial`.
    Sse,
    /// Bidirectional live connection.
    Bidi,
}

/// Per-invocation settings.
#[derive(Debug, Clone, Builder, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    /// Maximum model calls per invocation; 0 disables the limit.
    #[builder(default = DEFAULT_MAX_LLM_CALLS)]
    pub max_llm_calls: usize,
    #[builder(default)]
    pub streaming_mode: StreamingMode,
    #[builder(default)]
    pub custom_metadata: HashMap<String, serde_json::Value>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_llm_calls: DEFAULT_MAX_LLM_CALLS,
            streaming_mode: StreamingMode::None,
            custom_metadata: HashMap::new(),
        }
    }
}

impl RunConfig {
    /// Apply environment overrides (`TROUPE_MAX_LLM_CALLS`, `TROUPE_STREAMING_MODE`).
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(limit) = env_value(MAX_LLM_CALLS_ENV).and_then(|v| v.trim().parse().ok()) {
            self.max_llm_calls = limit;
        }
        if let Some(mode) = env_value(STREAMING_MODE_ENV).and_then(|v| v.trim().parse().ok()) {
            self.streaming_mode = mode;
        }
        self
    }
}

/// Runner-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunnerConfig {
    pub app_name: String,
    /// Create the session on first use instead of failing.
    pub auto_create_session: bool,
    pub run: RunConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            app_name: "troupe".to_string(),
            auto_create_session: true,
            run: RunConfig::default(),
        }
    }
}

impl RunnerConfig {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            ..Self::default()
        }
    }

    /// Parse a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw)
            .map_err(|e| TroupeError::Configuration(format!("invalid runner config: {e}")))
    }

    /// Load a TOML file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    /// Resolve configuration: config file (if present), then `.env` and
    /// process environment on top.
    pub fn load() -> Result<Self> {
        let base = match default_config_path() {
            Some(path) if path.exists() => Self::from_path(&path)?,
            _ => Self::default(),
        };
        Ok(base.with_env_overrides())
    }

    pub fn with_env_overrides(mut self) -> Self {
        let _ = dotenvy::dotenv(); // load .env if present, ignore error
        if let Some(app_name) = env_value(APP_NAME_ENV).filter(|v| !v.trim().is_empty()) {
            self.app_name = app_name;
        }
        self.run = self.run.with_env_overrides();
        self
    }
}

/// Platform config location, e.g. `~/.config/troupe/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "troupe")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

/// Platform data directory used for on-disk session stores.
pub fn default_data_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "troupe").map(|dirs| dirs.data_dir().to_path_buf())
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok()
}
