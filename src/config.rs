// src/config.rs
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const HOME_CONFIG_FILE_NAME: &str = ".rabbit-exclusive.toml";
pub const URI_ENV_VAR: &str = "RABBITMQ_URI";

// Configuration structures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarnessConfig {
    pub rabbitmq: RabbitSettings,
    #[serde(default)]
    pub harness: HarnessSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RabbitSettings {
    pub uri: String,
    #[serde(default = "default_connection_name")]
    pub connection_name: String,
    #[serde(default = "default_dial_attempts")]
    pub dial_attempts: u32,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
}

/// What the exclusivity check declares and how long it drains afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarnessSettings {
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default = "default_routing_key")]
    pub routing_key: String,
    #[serde(default = "default_exchange")]
    pub exchange: String,
    #[serde(default = "default_true")]
    pub exclusive_queue: bool,
    #[serde(default = "default_true")]
    pub exclusive_consumer: bool,
    #[serde(default = "default_drain_window")]
    pub drain_window_ms: u64,
    #[serde(default = "default_true")]
    pub publish_probe: bool,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        HarnessSettings {
            queue: default_queue(),
            routing_key: default_routing_key(),
            exchange: default_exchange(),
            exclusive_queue: true,
            exclusive_consumer: true,
            drain_window_ms: default_drain_window(),
            publish_probe: true,
        }
    }
}

// Default values
fn default_connection_name() -> String { "rabbit-exclusive".to_string() }
fn default_dial_attempts() -> u32 { 5 }
fn default_reconnect_delay() -> u64 { 1000 }
fn default_queue() -> String { "exclusive-test-queue".to_string() }
fn default_routing_key() -> String { "test-key".to_string() }
fn default_exchange() -> String { "test-exchange".to_string() }
fn default_drain_window() -> u64 { 2000 }
fn default_true() -> bool { true }

/// Looks for the config file in the working directory, then the home directory.
pub fn find_config_file() -> Result<PathBuf> {
    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    find_config_file_in(&cwd, home::home_dir())
}

pub fn find_config_file_in(dir: &Path, home_dir: Option<PathBuf>) -> Result<PathBuf> {
    let locations = [
        ("Current directory", dir.join(CONFIG_FILE_NAME)),
        ("Current directory (alternative)", dir.join("config").join(CONFIG_FILE_NAME)),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Ok(path.clone());
        }
    }

    // Try the user's home directory
    if let Some(home_dir) = home_dir {
        let home_config = home_dir.join(HOME_CONFIG_FILE_NAME);
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Ok(home_config);
        }
    }

    Err(anyhow!(
        "Could not find {} in {} (or config/{}), nor ~/{}",
        CONFIG_FILE_NAME,
        dir.display(),
        CONFIG_FILE_NAME,
        HOME_CONFIG_FILE_NAME
    ))
}

/// Finds, reads and validates the configuration, honouring `.env` and
/// `RABBITMQ_URI`.
pub fn load_config() -> Result<HarnessConfig> {
    dotenv::dotenv().ok();

    let config_path = find_config_file()?;
    let mut config = load_config_from(&config_path)?;
    if let Ok(uri) = std::env::var(URI_ENV_VAR) {
        info!("Using broker URI from {}", URI_ENV_VAR);
        config = with_uri_override(config, Some(uri));
    }
    validate(&config)?;

    info!("Loaded configuration from {}", config_path.display());
    Ok(config)
}

pub fn load_config_from(path: &Path) -> Result<HarnessConfig> {
    let config_content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    parse_config(&config_content)
        .with_context(|| format!("Invalid configuration in {}", path.display()))
}

pub fn parse_config(content: &str) -> Result<HarnessConfig> {
    toml::from_str(content)
        .context("Configuration file contains invalid TOML or missing required fields")
}

pub fn with_uri_override(mut config: HarnessConfig, uri: Option<String>) -> HarnessConfig {
    if let Some(uri) = uri.filter(|uri| !uri.trim().is_empty()) {
        config.rabbitmq.uri = uri;
    }
    config
}

// Validate essential fields
pub fn validate(config: &HarnessConfig) -> Result<()> {
    let uri = config.rabbitmq.uri.trim();
    if uri.is_empty() {
        return Err(anyhow!("Configuration error: rabbitmq.uri cannot be empty"));
    }
    if !(uri.starts_with("amqp://") || uri.starts_with("amqps://")) {
        return Err(anyhow!(
            "Configuration error: rabbitmq.uri must start with amqp:// or amqps://"
        ));
    }
    if config.rabbitmq.dial_attempts == 0 {
        return Err(anyhow!("Configuration error: rabbitmq.dial_attempts must be at least 1"));
    }
    if config.harness.queue.is_empty() {
        return Err(anyhow!("Configuration error: harness.queue cannot be empty"));
    }
    Ok(())
}
