//! Tracker configuration
//!
//! Read from `~/.onemind/balance.toml` when present. `ONEMIND_BALANCE_API`
//! overrides the backend base URL; callers may override anything afterwards.

use crate::error::{BalanceError, BalanceResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "http://localhost:3001/api";
pub const DEFAULT_STALENESS_MS: u64 = 5000;
pub const BASE_URL_ENV: &str = "ONEMIND_BALANCE_API";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Cache age after which `load_balances` schedules a refresh.
    #[serde(default = "default_staleness_ms")]
    pub staleness_ms: u64,

    /// Per-request timeout. Unset means requests may run indefinitely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_secs: Option<u64>,

    /// Currency used for locally built records.
    #[serde(default = "default_currency")]
    pub currency: String,

    /// Where CSV exports are written. Falls back to the download directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_dir: Option<PathBuf>,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_staleness_ms() -> u64 {
    DEFAULT_STALENESS_MS
}

fn default_currency() -> String {
    "USD".to_string()
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            staleness_ms: default_staleness_ms(),
            request_timeout_secs: None,
            currency: default_currency(),
            export_dir: None,
        }
    }
}

impl TrackerConfig {
    /// Load from the default location, then apply the environment override.
    pub fn load() -> BalanceResult<Self> {
        let mut config = match Self::default_config_path() {
            Some(path) => Self::load_from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Read a TOML config file. A missing file yields the defaults.
    pub fn load_from_file(path: &Path) -> BalanceResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .map_err(|e| BalanceError::Io(format!("Failed to read {}: {e}", path.display())))?;
        let config: TrackerConfig = toml::from_str(&content)?;
        log::debug!("[BalanceConfig] Loaded {}", path.display());
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(BASE_URL_ENV) {
            if !url.trim().is_empty() {
                self.base_url = url.trim().to_string();
            }
        }
    }

    pub fn default_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".onemind").join("balance.toml"))
    }

    pub fn staleness(&self) -> Duration {
        Duration::from_millis(self.staleness_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    pub fn resolved_export_dir(&self) -> PathBuf {
        self.export_dir
            .clone()
            .or_else(dirs::download_dir)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}
