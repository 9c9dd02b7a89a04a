//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs. Every
//! section has defaults, so a missing file or section still yields a
//! working configuration. The database URL is referenced by env-var name
//! and resolved at runtime into a `SecretString`.

use anyhow::{ensure, Context, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::currency::CurrencyItemDetection;
use crate::engine::rates::RatePolicy;
use crate::types::ExchequerError;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub rates: RatesConfig,
    pub store: StoreConfig,
    pub aliases: AliasesConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EngineConfig {
    /// Canonical name of the currency every value is expressed in.
    pub reference_currency: String,
    pub batch_size: u32,
    /// Continuous mode: pause between polls once caught up.
    pub poll_interval_secs: u64,
    /// Deferred listings re-attempted per retry pass.
    pub retry_limit: u32,
    pub currency_item_detection: CurrencyItemDetection,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reference_currency: "Chaos Orb".into(),
            batch_size: 1000,
            poll_interval_secs: 1,
            retry_limit: 1000,
            currency_item_detection: CurrencyItemDetection::Flag,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RatesConfig {
    pub max_step: f64,
    pub min_step: f64,
    pub taper: f64,
}

impl Default for RatesConfig {
    fn default() -> Self {
        let policy = RatePolicy::default();
        Self {
            max_step: policy.max_step,
            min_step: policy.min_step,
            taper: policy.taper,
        }
    }
}

impl From<&RatesConfig> for RatePolicy {
    fn from(cfg: &RatesConfig) -> Self {
        RatePolicy {
            max_step: cfg.max_step,
            min_step: cfg.min_step,
            taper: cfg.taper,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConfig {
    /// Environment variable holding the database URL.
    pub database_url_env: String,
    pub max_connections: u32,
    pub busy_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url_env: "EXCHEQUER_DATABASE_URL".into(),
            max_connections: 4,
            busy_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AliasesConfig {
    pub path: String,
}

impl Default for AliasesConfig {
    fn default() -> Self {
        Self {
            path: "aliases.json".into(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            Self::load(path)
        } else {
            info!(path, "No config file found, using defaults");
            Ok(Self::default())
        }
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        Ok(config)
    }

    pub fn rate_policy(&self) -> RatePolicy {
        RatePolicy::from(&self.rates)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.engine.reference_currency.trim().is_empty(),
            ExchequerError::Config("engine.reference_currency must not be empty".into())
        );
        ensure!(
            self.engine.batch_size > 0,
            ExchequerError::Config("engine.batch_size must be positive".into())
        );
        ensure!(
            !self.store.database_url_env.is_empty(),
            ExchequerError::Config("store.database_url_env must not be empty".into())
        );
        self.rate_policy()
            .validate()
            .map_err(|e| ExchequerError::Config(e.to_string()))?;
        Ok(())
    }

    /// Resolve an environment variable name to its value.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    /// The database URL: an explicit override wins over the configured
    /// environment variable.
    pub fn database_url(&self, explicit: Option<&str>) -> Result<SecretString> {
        let url = match explicit {
            Some(url) => url.to_string(),
            None => Self::resolve_env(&self.store.database_url_env)?,
        };
        Ok(SecretString::new(url))
    }
}
