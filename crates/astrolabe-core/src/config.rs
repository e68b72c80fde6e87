use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::backoff::{
    ReconnectPolicy, DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY_MS,
};
use crate::client::{ClientConfig, DEFAULT_KEEPALIVE_INTERVAL, DEFAULT_MAX_MISSED_PONGS};
use crate::protocol::{interpret_url, InterpretationType};

pub const DEFAULT_BACKEND_ORIGIN: &str = "http://localhost:8000";
pub const BACKEND_ENV: &str = "ASTROLABE_BACKEND";
pub const TOKEN_ENV: &str = "ASTROLABE_TOKEN";
/// Longest keepalive interval accepted, one hour
pub const MAX_KEEPALIVE_INTERVAL_SECS: u64 = 3600;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub backend_origin: String,
    pub user_token: Option<String>,
    pub default_interpretation_type: InterpretationType,
    pub keepalive_interval_secs: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub max_missed_pongs: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Self {
            backend_origin: DEFAULT_BACKEND_ORIGIN.to_string(),
            user_token: None,
            default_interpretation_type: InterpretationType::Natal,
            keepalive_interval_secs: DEFAULT_KEEPALIVE_INTERVAL.as_secs(),
            max_reconnect_attempts: DEFAULT_MAX_ATTEMPTS,
            reconnect_base_ms: DEFAULT_BASE_DELAY_MS,
            reconnect_max_ms: DEFAULT_MAX_DELAY_MS,
            max_missed_pongs: DEFAULT_MAX_MISSED_PONGS,
        }
    }

    /// Load from the default location, then apply environment overrides
    pub fn load() -> Result<Self> {
        let config_path = Self::get_config_path()?;
        let mut config = Self::load_from(&config_path)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// A missing file yields the defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let config_content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&config_content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::get_config_path()?;
        self.save_to(&config_path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Create config directory if it doesn't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let config_content = serde_json::to_string_pretty(self)?;
        fs::write(path, config_content)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(origin) = lookup(BACKEND_ENV).filter(|v| !v.trim().is_empty()) {
            self.backend_origin = origin;
        }
        if let Some(token) = lookup(TOKEN_ENV).filter(|v| !v.trim().is_empty()) {
            self.user_token = Some(token);
        }
    }

    /// Update one field from its string form, as used by `config set`
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "backend_origin" => {
                let origin = Url::parse(value)
                    .with_context(|| format!("'{}' is not a valid URL", value))?;
                interpret_url(&origin)?;
                self.backend_origin = value.to_string();
            }
            "user_token" => {
                self.user_token = if value.trim().is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "default_interpretation_type" => {
                self.default_interpretation_type = InterpretationType::from_str(value)
                    .ok_or_else(|| anyhow!("Unknown interpretation type '{}'", value))?;
            }
            "keepalive_interval_secs" => {
                let secs = parse_number(key, value)?;
                check_keepalive(secs)?;
                self.keepalive_interval_secs = secs;
            }
            "max_reconnect_attempts" => self.max_reconnect_attempts = parse_number(key, value)?,
            "reconnect_base_ms" => self.reconnect_base_ms = parse_number(key, value)?,
            "reconnect_max_ms" => self.reconnect_max_ms = parse_number(key, value)?,
            "max_missed_pongs" => self.max_missed_pongs = parse_number(key, value)?,
            _ => return Err(anyhow!("Unknown config key '{}'", key)),
        }
        Ok(())
    }

    pub fn keys() -> &'static [&'static str] {
        &[
            "backend_origin",
            "user_token",
            "default_interpretation_type",
            "keepalive_interval_secs",
            "max_reconnect_attempts",
            "reconnect_base_ms",
            "reconnect_max_ms",
            "max_missed_pongs",
        ]
    }

    pub fn client_config(&self) -> Result<ClientConfig> {
        let origin = Url::parse(&self.backend_origin)
            .with_context(|| format!("Invalid backend origin '{}'", self.backend_origin))?;
        check_keepalive(self.keepalive_interval_secs)?;

        let mut client = ClientConfig::new(origin);
        client.keepalive_interval = Duration::from_secs(self.keepalive_interval_secs);
        client.reconnect = ReconnectPolicy {
            base_delay: Duration::from_millis(self.reconnect_base_ms),
            max_delay: Duration::from_millis(self.reconnect_max_ms),
            max_attempts: self.max_reconnect_attempts,
        };
        client.max_missed_pongs = self.max_missed_pongs;
        client.interpret_url()?;
        Ok(client)
    }

    pub fn get_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow!("Could not determine config directory"))?;

        Ok(config_dir.join("astrolabe").join("config.json"))
    }
}

fn check_keepalive(secs: u64) -> Result<()> {
    if secs == 0 || secs > MAX_KEEPALIVE_INTERVAL_SECS {
        return Err(anyhow!(
            "keepalive_interval_secs must be between 1 and {}",
            MAX_KEEPALIVE_INTERVAL_SECS
        ));
    }
    Ok(())
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow!("'{}' is not a valid value for {}", value, key))
}
