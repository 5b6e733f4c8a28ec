//! Client settings.
//!
//! Settings are read once at startup from `~/.config/runwire/config.toml`
//! (every field optional) and then passed explicitly to the reducer and the
//! interaction layer. Environment variables `RUNWIRE_API_BASE` and
//! `RUNWIRE_TOKEN` override the file.

use crate::error::{ClientError, Result};
use crate::stream::FragmentDedup;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_API_BASE: &str = "https://localhost:7210";
pub const DEFAULT_HUB_PATH: &str = "/hubs/agent-events";

const ENV_API_BASE: &str = "RUNWIRE_API_BASE";
const ENV_TOKEN: &str = "RUNWIRE_TOKEN";

/// Root settings structure for config.toml
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ClientSettings {
    /// Backend base URL, without trailing slash
    pub api_base: String,
    /// Push hub path relative to `api_base`
    pub hub_path: String,
    /// Upper bound for a single hub connect attempt
    pub connect_timeout_ms: u64,
    pub reconnect: ReconnectSettings,
    /// Duplicate-fragment suppression for streamed text
    pub fragment_dedup: FragmentDedup,
    /// Legacy model selector sent as `model` ("OpenAI" or "Google")
    pub default_model: String,
    /// Optional model key sent as `ModelKey`
    pub model_key: Option<String>,
    /// Optional provider sent as `Provider`
    pub provider: Option<String>,
    /// Bearer token; normally supplied through `RUNWIRE_TOKEN`
    pub token: Option<String>,
}

/// Reconnect backoff: `min(base_delay * 2^attempt, max_delay)`.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ReconnectSettings {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
    /// Randomize each delay within `[0, capped_delay]`
    pub jitter: bool,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 5,
            jitter: false,
        }
    }
}

impl ReconnectSettings {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            hub_path: DEFAULT_HUB_PATH.to_string(),
            connect_timeout_ms: 20_000,
            reconnect: ReconnectSettings::default(),
            fragment_dedup: FragmentDedup::default(),
            default_model: "OpenAI".to_string(),
            model_key: None,
            provider: None,
            token: None,
        }
    }
}

impl ClientSettings {
    /// Loads settings from the default location and applies environment overrides.
    pub fn load() -> Result<Self> {
        let settings = Self::load_from(&default_config_path()?)?;
        Ok(settings.with_env_overrides(|key| std::env::var(key).ok()))
    }

    /// Loads settings from `path`. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("[Config] {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| {
            ClientError::config(format!(
                "Failed to read configuration file at {}: {}",
                path.display(),
                e
            ))
        })?;

        toml::from_str(&content).map_err(|e| {
            ClientError::config(format!(
                "Failed to parse configuration file at {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Applies `RUNWIRE_API_BASE` / `RUNWIRE_TOKEN` using the given lookup.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(api_base) = lookup(ENV_API_BASE).filter(|v| !v.trim().is_empty()) {
            self.api_base = api_base;
        }
        if let Some(token) = lookup(ENV_TOKEN).filter(|v| !v.trim().is_empty()) {
            self.token = Some(token);
        }
        self
    }

    /// Joins an API path onto the base URL.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.api_base.trim_end_matches('/'), path)
    }

    pub fn hub_url(&self) -> String {
        self.endpoint(&self.hub_path)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Returns the path to the configuration file: ~/.config/runwire/config.toml
pub fn default_config_path() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| ClientError::config("Could not determine home directory"))?;
    Ok(home.join(".config").join("runwire").join("config.toml"))
}
