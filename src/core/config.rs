//! Application configuration management

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::task::DEFAULT_MAX_RETRIES;

pub const DEFAULT_ITEM_CONCURRENCY: usize = 2;
pub const DEFAULT_SUB_ITEM_CONCURRENCY: usize = 4;
pub const MAX_CONCURRENCY: usize = 32;
pub const MAX_RETRIES_LIMIT: u32 = 10;

const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// Main application configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub download: DownloadConfig,
    pub logging: LoggingConfig,
}

/// Admission ceilings for the two concurrency tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrentLimit {
    /// Items downloading at once
    pub item: usize,
    /// Sub-items downloading at once, across all items
    pub sub_item: usize,
}

impl Default for ConcurrentLimit {
    fn default() -> Self {
        Self {
            item: DEFAULT_ITEM_CONCURRENCY,
            sub_item: DEFAULT_SUB_ITEM_CONCURRENCY,
        }
    }
}

/// Download engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub concurrent_limit: ConcurrentLimit,
    pub max_retries: u32,
    /// Scheduling loop tick
    pub schedule_interval_ms: u64,
    /// Minimum gap between two non-terminal progress events for the same sub-task
    pub progress_throttle_ms: u64,
    pub download_base: PathBuf,
    /// Give every item its own folder under the download base
    pub create_item_folder: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            concurrent_limit: ConcurrentLimit::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            schedule_interval_ms: 500,
            progress_throttle_ms: 500,
            download_base: PathBuf::from("downloads"),
            create_item_folder: true,
        }
    }
}

impl DownloadConfig {
    /// Copy with zero concurrency limits replaced by the defaults
    pub fn normalized(&self) -> Self {
        let mut config = self.clone();
        if config.concurrent_limit.item == 0 {
            config.concurrent_limit.item = DEFAULT_ITEM_CONCURRENCY;
        }
        if config.concurrent_limit.sub_item == 0 {
            config.concurrent_limit.sub_item = DEFAULT_SUB_ITEM_CONCURRENCY;
        }
        config
    }

    pub fn schedule_interval(&self) -> Duration {
        Duration::from_millis(self.schedule_interval_ms.max(1))
    }

    pub fn progress_throttle(&self) -> Duration {
        Duration::from_millis(self.progress_throttle_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrent_limit.item > MAX_CONCURRENCY {
            anyhow::bail!("Item concurrency should not exceed {}", MAX_CONCURRENCY);
        }

        if self.concurrent_limit.sub_item > MAX_CONCURRENCY {
            anyhow::bail!("Sub-item concurrency should not exceed {}", MAX_CONCURRENCY);
        }

        if self.max_retries > MAX_RETRIES_LIMIT {
            anyhow::bail!("Retry attempts should not exceed {}", MAX_RETRIES_LIMIT);
        }

        if self.schedule_interval_ms == 0 || self.schedule_interval_ms > 10_000 {
            anyhow::bail!("Schedule interval should be between 1 and 10000 milliseconds");
        }

        if self.download_base.as_os_str().is_empty() {
            anyhow::bail!("Download base directory must not be empty");
        }

        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String, // "error", "warn", "info", "debug", "trace"
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the platform config file, creating it with
    /// defaults when missing
    pub fn load() -> Result<Self> {
        let config_path = Self::get_config_path()?;

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Self::default();
            config.save()?;
            tracing::info!("Created default configuration at: {:?}", config_path);
            Ok(config)
        }
    }

    /// Save configuration to the platform config file
    pub fn save(&self) -> Result<()> {
        let config_path = Self::get_config_path()?;
        self.save_to(&config_path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: AppConfig =
            serde_json::from_str(&content).with_context(|| "Failed to parse config file")?;

        config
            .validate()
            .with_context(|| format!("Invalid configuration in {:?}", path))?;

        tracing::info!("Loaded configuration from: {:?}", path);
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }
        }

        let content =
            serde_json::to_string_pretty(self).with_context(|| "Failed to serialize config")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        tracing::info!("Saved configuration to: {:?}", path);
        Ok(())
    }

    /// Get the path to the configuration file
    pub fn get_config_path() -> Result<PathBuf> {
        let project_dirs = ProjectDirs::from("com", "videoarchiver", "archiver")
            .with_context(|| "Failed to get project directories")?;

        Ok(project_dirs.config_dir().join("config.json"))
    }

    /// Export configuration as JSON string
    pub fn export(&self) -> Result<String> {
        serde_json::to_string_pretty(self).with_context(|| "Failed to export configuration")
    }

    /// Parse and validate a configuration from a JSON string
    pub fn import(json: &str) -> Result<Self> {
        let config: AppConfig =
            serde_json::from_str(json).with_context(|| "Failed to parse imported configuration")?;

        config
            .validate()
            .with_context(|| "Imported configuration is invalid")?;

        tracing::info!("Imported and validated configuration from JSON");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.download.validate()?;

        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            anyhow::bail!(
                "Invalid log level: must be 'error', 'warn', 'info', 'debug', or 'trace'"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validation() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.download.concurrent_limit.item, 2);
        assert_eq!(config.download.concurrent_limit.sub_item, 4);
        assert_eq!(config.download.max_retries, 3);
    }

    #[test]
    fn test_config_serialization() {
        let config = AppConfig::default();
        let json = config.export().unwrap();
        let parsed_config = AppConfig::import(&json).unwrap();
        assert_eq!(config, parsed_config);
    }

    #[test]
    fn test_invalid_config_validation() {
        let mut config = AppConfig::default();
        config.download.concurrent_limit.item = 33;
        assert!(config.validate().is_err());

        config = AppConfig::default();
        config.download.concurrent_limit.sub_item = 64;
        assert!(config.validate().is_err());

        config = AppConfig::default();
        config.download.max_retries = 11;
        assert!(config.validate().is_err());

        config = AppConfig::default();
        config.download.schedule_interval_ms = 0;
        assert!(config.validate().is_err());

        config.download.schedule_interval_ms = 10_001;
        assert!(config.validate().is_err());

        config = AppConfig::default();
        config.download.download_base = PathBuf::new();
        assert!(config.validate().is_err());

        config = AppConfig::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_concurrency_normalizes_to_default() {
        let mut config = DownloadConfig::default();
        config.concurrent_limit = ConcurrentLimit { item: 0, sub_item: 0 };
        assert!(config.validate().is_ok());

        let normalized = config.normalized();
        assert_eq!(normalized.concurrent_limit, ConcurrentLimit::default());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = AppConfig::import(r#"{"download": {"max_retries": 5}}"#).unwrap();
        assert_eq!(config.download.max_retries, 5);
        assert_eq!(config.download.schedule_interval_ms, 500);
        assert_eq!(config.logging.level, "info");
    }
}
