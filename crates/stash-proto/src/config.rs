use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::platform;
use crate::playback::DEFAULT_VOLUME;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub stations: StationsConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Local store directory (station lists, playback preferences, log).
    #[serde(default = "platform::data_dir")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Volume (0-100) used until the user changes it.
    #[serde(default = "default_volume")]
    pub default_volume: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationsConfig {
    /// Optional TOML file whose `[[station]]` tables replace the built-in
    /// seed list.
    #[serde(default = "default_seed_toml")]
    pub seed_toml: PathBuf,
}

/// Station directory used by search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_search_url")]
    pub base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_search_limit")]
    pub limit: u32,
}

/// Per-account document store used to mirror the station list once signed
/// in.  Disabled unless `enabled` is set and `base_url` is filled in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_remote_table")]
    pub table: String,
    /// Quiet period before a burst of edits is pushed.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl RemoteConfig {
    pub fn is_active(&self) -> bool {
        self.enabled && !self.base_url.trim().is_empty()
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: platform::data_dir(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            default_volume: default_volume(),
        }
    }
}

impl Default for StationsConfig {
    fn default() -> Self {
        Self {
            seed_toml: default_seed_toml(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            base_url: default_search_url(),
            user_agent: default_user_agent(),
            limit: default_search_limit(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: String::new(),
            api_key: String::new(),
            table: default_remote_table(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8989
}

fn default_volume() -> u8 {
    DEFAULT_VOLUME
}

fn default_seed_toml() -> PathBuf {
    platform::config_dir().join("stations.toml")
}

fn default_search_url() -> String {
    "https://de1.api.radio-browser.info".to_string()
}

fn default_user_agent() -> String {
    "Stash.fm".to_string()
}

fn default_search_limit() -> u32 {
    50
}

fn default_remote_table() -> String {
    "stations".to_string()
}

fn default_debounce_ms() -> u64 {
    500
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}
