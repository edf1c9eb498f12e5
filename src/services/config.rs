use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SyncError};

const APP_DIR: &str = "convo-sync";
const ENV_PREFIX: &str = "CONVO_SYNC";

/// Server endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    pub api_base_url: String,
    pub ws_url: String,
    pub request_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8080/api".to_string(),
            ws_url: "ws://127.0.0.1:8080/live".to_string(),
            request_timeout_secs: 15,
        }
    }
}

impl ServerSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// Timeline and send limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChatSettings {
    pub page_size: usize,
    pub preview_page_size: usize,
    /// Bytes.
    pub max_message_size: usize,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            page_size: 30,
            preview_page_size: 1,
            max_message_size: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ViewportSettings {
    /// Pixels from the bottom still treated as "at the bottom".
    pub near_bottom_threshold: f64,
    pub persist_scroll: bool,
}

impl Default for ViewportSettings {
    fn default() -> Self {
        Self {
            near_bottom_threshold: 80.0,
            persist_scroll: true,
        }
    }
}

/// Application configuration persisted as TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSettings,
    pub chat: ChatSettings,
    pub viewport: ViewportSettings,
}

pub struct ConfigService {
    path: Option<PathBuf>,
    config: AppConfig,
}

impl ConfigService {
    /// Load from the user config directory, falling back to defaults.
    pub fn new() -> Self {
        let path = default_config_path();
        let config = match Self::load(path.as_deref()) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("Failed to load config, using defaults: {}", e);
                AppConfig::default()
            }
        };
        Self { path, config }
    }

    /// Load from an explicit file.
    pub fn with_path(path: PathBuf) -> Result<Self> {
        let config = Self::load(Some(&path))?;
        Ok(Self {
            path: Some(path),
            config,
        })
    }

    /// Defaults, then the TOML file if present, then `CONVO_SYNC__*` overrides.
    pub fn load(path: Option<&Path>) -> Result<AppConfig> {
        let defaults = config::Config::try_from(&AppConfig::default())
            .map_err(|e| SyncError::Config(format!("Invalid defaults: {}", e)))?;

        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            log::debug!("Reading config from {}", path.display());
            builder = builder.add_source(
                config::File::from(path.to_path_buf())
                    .format(config::FileFormat::Toml)
                    .required(false),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(|c| c.try_deserialize::<AppConfig>())
            .map_err(|e| SyncError::Config(e.to_string()))
    }

    pub fn get(&self) -> AppConfig {
        self.config.clone()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Replace the configuration and persist it.
    pub fn update(&mut self, config: AppConfig) -> Result<()> {
        self.config = config;
        self.save()
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Err(SyncError::Config("No config directory available".to_string()));
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(&self.config)
            .map_err(|e| SyncError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        log::info!("Saved config to {}", path.display());
        Ok(())
    }
}

impl Default for ConfigService {
    fn default() -> Self {
        Self::new()
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_DIR).join("config.toml"))
}

/// Where scroll positions are stored when persistence is enabled.
pub fn scroll_state_path() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join(APP_DIR).join("scroll_positions.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = ConfigService::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.chat.page_size, 30);
        assert_eq!(config.chat.preview_page_size, 1);
        assert_eq!(config.viewport.near_bottom_threshold, 80.0);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[chat]\npage_size = 50\n").unwrap();

        let service = ConfigService::with_path(path).unwrap();
        let config = service.get();
        assert_eq!(config.chat.page_size, 50);
        assert_eq!(config.chat.preview_page_size, 1);
        assert_eq!(config.server, ServerSettings::default());
    }

    #[test]
    fn test_update_round_trips_through_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut service = ConfigService::with_path(path.clone()).unwrap();
        let mut config = service.get();
        config.server.api_base_url = "https://chat.example.com/api".to_string();
        config.viewport.persist_scroll = false;
        service.update(config.clone()).unwrap();

        let reloaded = ConfigService::with_path(path).unwrap();
        assert_eq!(reloaded.get().server.api_base_url, "https://chat.example.com/api");
        assert!(!reloaded.get().viewport.persist_scroll);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[chat\npage_size = ").unwrap();
        assert!(matches!(
            ConfigService::with_path(path),
            Err(SyncError::Config(_))
        ));
    }
}
