// src/config.rs
use config::{Config, ConfigError, File, FileFormat};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct StreamSettings {
    /// WebSocket endpoint of the live update stream.
    pub url: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecoverySettings {
    /// Base URL of the replay endpoint used for gap recovery.
    pub base_url: String,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

/// Reconnect schedule. Delays double from `base_delay_ms` up to
/// `max_delay_ms`; after `max_attempts` consecutive failures the channel
/// stops retrying.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectSettings {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub stream: StreamSettings,
    pub recovery: RecoverySettings,
    #[serde(default)]
    pub reconnect: ReconnectSettings,
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_fetch_timeout_secs() -> u64 {
    10
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30000
}

fn default_max_attempts() -> u32 {
    10
}

impl Settings {
    /// Load the config from `Settings.toml` plus optional environment overrides.
    pub fn new() -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::new("Settings", FileFormat::Toml))
            .add_source(config::Environment::default().separator("__"));

        let config = builder.build()?;
        config.try_deserialize()
    }
}
