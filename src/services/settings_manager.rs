// SettingsManager Service
// Persists settings and destinations; exposes a read-only settings accessor

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;

use crate::models::{Destination, Settings};

const CONFIG_FILE_NAME: &str = "freestream-config.json";

/// Read-only settings accessor consulted on every supervisor operation
pub trait SettingsProvider: Send + Sync {
    fn settings(&self) -> Settings;
}

impl SettingsProvider for Settings {
    fn settings(&self) -> Settings {
        self.clone()
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Destination not found: {0}")]
    DestinationNotFound(String),
}

/// On-disk configuration document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub destinations: Vec<Destination>,
}

/// JSON file-backed configuration with an in-memory cache
pub struct ConfigStore {
    config_path: PathBuf,
    cache: RwLock<Option<ConfigFile>>,
}

impl ConfigStore {
    /// Create a store rooted at the given app data directory
    pub fn new(app_data_dir: impl AsRef<Path>) -> Self {
        Self {
            config_path: app_data_dir.as_ref().join(CONFIG_FILE_NAME),
            cache: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Load config from disk, or write and return defaults if not found.
    /// Keys missing from an older file are filled from defaults and saved back.
    pub fn load(&self) -> Result<ConfigFile, ConfigError> {
        if let Ok(cache) = self.cache.read() {
            if let Some(ref config) = *cache {
                return Ok(config.clone());
            }
        }

        let config = if self.config_path.exists() {
            let content = std::fs::read_to_string(&self.config_path)?;
            let mut user_value: Value = serde_json::from_str(&content)?;
            let defaults_value = serde_json::to_value(ConfigFile::default())?;
            let changed = merge_missing_settings(&mut user_value, &defaults_value);

            let config: ConfigFile = serde_json::from_value(user_value)?;
            if changed {
                log::debug!("Filled missing config keys with defaults");
                self.save_internal(&config)?;
            }
            config
        } else {
            log::info!("No config at {:?}, writing defaults", self.config_path);
            let defaults = ConfigFile::default();
            self.save_internal(&defaults)?;
            defaults
        };

        self.update_cache(&config);
        Ok(config)
    }

    pub fn save(&self, config: &ConfigFile) -> Result<(), ConfigError> {
        self.save_internal(config)?;
        self.update_cache(config);
        Ok(())
    }

    pub fn save_settings(&self, settings: &Settings) -> Result<(), ConfigError> {
        let mut config = self.load()?;
        config.settings = settings.clone();
        self.save(&config)
    }

    pub fn destinations(&self) -> Result<Vec<Destination>, ConfigError> {
        Ok(self.load()?.destinations)
    }

    pub fn enabled_destinations(&self) -> Result<Vec<Destination>, ConfigError> {
        Ok(self
            .load()?
            .destinations
            .into_iter()
            .filter(|d| d.enabled)
            .collect())
    }

    /// Insert a destination, or replace the one with the same id
    pub fn upsert_destination(&self, destination: Destination) -> Result<(), ConfigError> {
        let mut config = self.load()?;
        match config.destinations.iter_mut().find(|d| d.id == destination.id) {
            Some(existing) => *existing = destination,
            None => config.destinations.push(destination),
        }
        self.save(&config)
    }

    pub fn remove_destination(&self, id: &str) -> Result<(), ConfigError> {
        let mut config = self.load()?;
        let before = config.destinations.len();
        config.destinations.retain(|d| d.id != id);
        if config.destinations.len() == before {
            return Err(ConfigError::DestinationNotFound(id.to_string()));
        }
        self.save(&config)
    }

    pub fn set_destination_enabled(&self, id: &str, enabled: bool) -> Result<(), ConfigError> {
        let mut config = self.load()?;
        let destination = config
            .destinations
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| ConfigError::DestinationNotFound(id.to_string()))?;
        destination.enabled = enabled;
        self.save(&config)
    }

    fn save_internal(&self, config: &ConfigFile) -> Result<(), ConfigError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(config)?;
        std::fs::write(&self.config_path, content)?;
        Ok(())
    }

    fn update_cache(&self, config: &ConfigFile) {
        if let Ok(mut cache) = self.cache.write() {
            *cache = Some(config.clone());
        }
    }
}

impl SettingsProvider for ConfigStore {
    fn settings(&self) -> Settings {
        match self.load() {
            Ok(config) => config.settings,
            Err(e) => {
                log::warn!("Failed to load settings, using defaults: {e}");
                Settings::default()
            }
        }
    }
}

/// Recursively copy keys present in `defaults` but missing in `target`
fn merge_missing_settings(target: &mut Value, defaults: &Value) -> bool {
    match (target, defaults) {
        (Value::Object(target_map), Value::Object(defaults_map)) => {
            let mut changed = false;
            for (key, default_value) in defaults_map {
                match target_map.get_mut(key) {
                    Some(target_value) => {
                        if merge_missing_settings(target_value, default_value) {
                            changed = true;
                        }
                    }
                    None => {
                        target_map.insert(key.clone(), default_value.clone());
                        changed = true;
                    }
                }
            }
            changed
        }
        _ => false,
    }
}
