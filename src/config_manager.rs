//! Config manager - trader configuration and credentials
//!
//! Settings come from `config.json` (same keys the operator's settings dialog
//! writes: `api_key`, `secret_key`, `timeout`) and are then overridden by
//! `TRADER_*` environment variables. Credentials are never defaulted.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::exchange::DEFAULT_BASE_URL;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing credentials: {0}")]
    MissingCredentials(String),
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn default_timeout() -> u64 {
    10
}
fn default_symbol() -> String {
    "BTCBRL".to_string()
}
fn default_base_asset() -> String {
    "BTC".to_string()
}
fn default_quote_asset() -> String {
    "BRL".to_string()
}
fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}
fn default_quantity_precision() -> usize {
    5
}
fn default_true() -> bool {
    true
}
fn default_paper_balance() -> f64 {
    10_000.0
}

#[derive(Clone, Serialize, Deserialize)]
pub struct TraderConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default, alias = "secret_key", skip_serializing)]
    pub api_secret: String,
    /// Network timeout per exchange call, also the polling cadence
    #[serde(default = "default_timeout", alias = "timeout")]
    pub timeout_seconds: u64,
    /// Overrides the polling cadence when set
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    #[serde(default = "default_symbol")]
    pub symbol: String,
    #[serde(default = "default_base_asset")]
    pub base_asset: String,
    #[serde(default = "default_quote_asset")]
    pub quote_asset: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_quantity_precision")]
    pub quantity_precision: usize,
    /// Cancel holdings that outlive their validity below the sell threshold
    #[serde(default = "default_true")]
    pub cancel_on_expiry: bool,
    /// Trade against the in-process paper exchange instead of the live API
    #[serde(default)]
    pub paper_trading: bool,
    /// Starting quote-asset balance of the paper account
    #[serde(default = "default_paper_balance")]
    pub paper_quote_balance: f64,
}

impl Default for TraderConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_secret: String::new(),
            timeout_seconds: default_timeout(),
            poll_interval_ms: None,
            symbol: default_symbol(),
            base_asset: default_base_asset(),
            quote_asset: default_quote_asset(),
            base_url: default_base_url(),
            quantity_precision: default_quantity_precision(),
            cancel_on_expiry: true,
            paper_trading: false,
            paper_quote_balance: default_paper_balance(),
        }
    }
}

// Keeps the secret out of logs
impl std::fmt::Debug for TraderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraderConfig")
            .field("api_key", &mask(&self.api_key))
            .field("api_secret", &mask(&self.api_secret))
            .field("timeout_seconds", &self.timeout_seconds)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("symbol", &self.symbol)
            .field("base_url", &self.base_url)
            .field("quantity_precision", &self.quantity_precision)
            .field("cancel_on_expiry", &self.cancel_on_expiry)
            .field("paper_trading", &self.paper_trading)
            .field("paper_quote_balance", &self.paper_quote_balance)
            .finish()
    }
}

fn mask(value: &str) -> &'static str {
    if value.is_empty() {
        "<unset>"
    } else {
        "<redacted>"
    }
}

/// Validated API credentials
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl TraderConfig {
    /// Load from a JSON file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: TraderConfig = serde_json::from_str(&content)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Apply `TRADER_*` overrides from the process environment
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, get: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = get("TRADER_API_KEY") {
            self.api_key = v;
        }
        if let Some(v) = get("TRADER_API_SECRET") {
            self.api_secret = v;
        }
        if let Some(v) = get("TRADER_TIMEOUT_SECONDS") {
            self.timeout_seconds = v
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("TRADER_TIMEOUT_SECONDS='{}'", v)))?;
        }
        if let Some(v) = get("TRADER_SYMBOL") {
            self.symbol = v;
        }
        if let Some(v) = get("TRADER_BASE_URL") {
            self.base_url = v;
        }
        if let Some(v) = get("TRADER_PAPER_TRADING") {
            self.paper_trading = matches!(v.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        Ok(())
    }

    /// Credentials for the live exchange; fails fast when either is blank
    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        let api_key = self.api_key.trim();
        let api_secret = self.api_secret.trim();
        if api_key.is_empty() {
            return Err(ConfigError::MissingCredentials("api_key is not set".to_string()));
        }
        if api_secret.is_empty() {
            return Err(ConfigError::MissingCredentials("api_secret is not set".to_string()));
        }
        Ok(Credentials {
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_seconds == 0 {
            return Err(ConfigError::Invalid("timeout_seconds must be at least 1".to_string()));
        }
        if self.symbol.trim().is_empty() {
            return Err(ConfigError::Invalid("symbol must not be empty".to_string()));
        }
        if self.quantity_precision > 8 {
            return Err(ConfigError::Invalid("quantity_precision must be at most 8".to_string()));
        }
        self.base_url()?;
        Ok(())
    }

    pub fn base_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.base_url)
            .map_err(|e| ConfigError::Invalid(format!("base_url '{}': {}", self.base_url, e)))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        match self.poll_interval_ms {
            Some(ms) if ms > 0 => Duration::from_millis(ms),
            _ => self.timeout(),
        }
    }
}

/// Runtime settings the operator may change while the engine is stopped
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsUpdate {
    pub api_key: Option<String>,
    #[serde(alias = "secret_key")]
    pub api_secret: Option<String>,
    #[serde(alias = "timeout")]
    pub timeout_seconds: Option<u64>,
    pub cancel_on_expiry: Option<bool>,
    pub paper_trading: Option<bool>,
}

/// Manages trader configuration
pub struct ConfigManager {
    config: RwLock<TraderConfig>,
}

impl ConfigManager {
    pub fn new(config: TraderConfig) -> Self {
        info!(
            "ConfigManager initialized: symbol={}, timeout={}s, cancel_on_expiry={}, paper={}",
            config.symbol, config.timeout_seconds, config.cancel_on_expiry, config.paper_trading
        );

        Self {
            config: RwLock::new(config),
        }
    }

    /// Apply a settings change. Nothing is written if the result is invalid.
    pub fn update_settings(&self, update: SettingsUpdate) -> Result<TraderConfig, ConfigError> {
        let mut next = self.config.read().clone();

        if let Some(key) = update.api_key {
            next.api_key = key;
        }
        if let Some(secret) = update.api_secret {
            next.api_secret = secret;
        }
        if let Some(timeout) = update.timeout_seconds {
            next.timeout_seconds = timeout;
        }
        if let Some(cancel) = update.cancel_on_expiry {
            next.cancel_on_expiry = cancel;
        }
        if let Some(paper) = update.paper_trading {
            next.paper_trading = paper;
        }
        next.validate()?;

        *self.config.write() = next.clone();
        info!("Updated trader settings: {:?}", next);
        Ok(next)
    }

    /// Get current configuration
    pub fn get_config(&self) -> TraderConfig {
        self.config.read().clone()
    }
}
