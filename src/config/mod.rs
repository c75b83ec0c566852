pub mod log_config;
pub mod reconnect_config;
pub mod scan_config;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

use crate::config::log_config::LogConfig;
use crate::config::reconnect_config::ReconnectConfig;
use crate::config::scan_config::ScanConfig;
use crate::core::bluetooth::{ManagerConfig, ReconnectPolicy};
use crate::utils::ensure_directory_exists;

const APP_DIR_NAME: &str = "ble-vitals-monitor";
const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("reconnect.backoff_ms must not be empty")]
    EmptyBackoff,

    #[error("reconnect.max_attempts must be at least 1")]
    ZeroAttempts,

    #[error("scan.duration_ms must be greater than zero")]
    ZeroScanDuration,

    #[error("unknown log level: {0}")]
    InvalidLogLevel(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub scan: ScanConfig,
    pub reconnect: ReconnectConfig,
    pub log: LogConfig,
}

impl AppConfig {
    /// `<config dir>/ble-vitals-monitor/config.json`, or a relative path when
    /// the platform has no config directory.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Loads the config from `path`. A missing file yields the defaults.
    pub async fn load_config(path: impl AsRef<Path>) -> Result<Self> {
        let file_path = path.as_ref();

        if !file_path.exists() {
            warn!("Config file not found at {:?}, using default.", file_path);
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(file_path)
            .await
            .with_context(|| format!("Failed to read config at {:?}", file_path))?;
        let config: Self = serde_json::from_str(&config_json)
            .with_context(|| format!("Malformed config at {:?}", file_path))?;
        config.validate()?;

        info!("Config loaded from {:?}", file_path);
        Ok(config)
    }

    /// Saves the config to `path`, creating its directory if needed.
    pub async fn save_config(&self, path: impl AsRef<Path>) -> Result<()> {
        let file_path = path.as_ref();
        if let Some(config_dir) = file_path.parent() {
            ensure_directory_exists(config_dir).await?;
        }

        let config_json = match serde_json::to_string_pretty(&self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize config to JSON: {}", e);
                return Err(e.into());
            }
        };

        fs::write(file_path, config_json).await?;

        info!("Config saved to {:?}.", file_path);
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reconnect.backoff_ms.is_empty() {
            return Err(ConfigError::EmptyBackoff);
        }
        if self.reconnect.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        if self.scan.duration_ms == 0 {
            return Err(ConfigError::ZeroScanDuration);
        }
        if self.log.level_filter().is_none() {
            return Err(ConfigError::InvalidLogLevel(self.log.level.clone()));
        }
        Ok(())
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            scan_duration: Duration::from_millis(self.scan.duration_ms),
            min_rssi: self.scan.min_rssi,
            name_filter: self.scan.name_filter.clone(),
            auto_reconnect: self.reconnect.enabled,
            reconnect_policy: ReconnectPolicy {
                delays: self
                    .reconnect
                    .backoff_ms
                    .iter()
                    .copied()
                    .map(Duration::from_millis)
                    .collect(),
                max_attempts: self.reconnect.max_attempts,
            },
            confirm_timeout: Duration::from_millis(self.reconnect.confirm_timeout_ms),
        }
    }
}
