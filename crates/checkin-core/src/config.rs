//! Application configuration management.
//!
//! This module handles loading and saving the application configuration:
//! the document store URL, the last used username, listener timings and
//! id number rules. Environment variables override the file.
//!
//! Configuration is stored at `~/.config/checkin-admin/config.json`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::sync::listener::{DEFAULT_DEBOUNCE_MS, DEFAULT_POLL_INTERVAL_SECS};
use crate::sync::ListenerConfig;
use crate::utils::id_number::DEFAULT_ID_NUMBER_LENGTH;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "checkin-admin";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Environment variable overriding `store_url`
pub const ENV_STORE_URL: &str = "CHECKIN_STORE_URL";
/// Environment variable holding a service token for the store
pub const ENV_STORE_TOKEN: &str = "CHECKIN_STORE_TOKEN";
pub const ENV_USERNAME: &str = "CHECKIN_USERNAME";
pub const ENV_PASSWORD: &str = "CHECKIN_PASSWORD";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store_url: Option<String>,
    pub last_username: Option<String>,
    pub debounce_ms: u64,
    pub poll_interval_secs: u64,
    pub id_number_length: usize,
    pub encrypt_cache: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_url: None,
            last_username: None,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            id_number_length: DEFAULT_ID_NUMBER_LENGTH,
            encrypt_cache: true,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_env();
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(ENV_STORE_URL) {
            if !url.trim().is_empty() {
                self.store_url = Some(url.trim().to_string());
            }
        }
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn store_url(&self) -> Result<&str> {
        self.store_url.as_deref().ok_or_else(|| {
            anyhow::anyhow!(
                "No store URL configured - set {} or store_url in the config file",
                ENV_STORE_URL
            )
        })
    }

    pub fn listener(&self) -> ListenerConfig {
        ListenerConfig {
            debounce: Duration::from_millis(self.debounce_ms),
            poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
        }
    }
}
