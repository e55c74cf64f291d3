//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (the cron trigger token) are referenced by env-var name in the
//! config and resolved at runtime.

use anyhow::{Context, Result};
use rust_decimal::prelude::*;
use secrecy::SecretString;
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::engine::classifier::ResolutionPolicy;
use crate::engine::resolver::ResolverConfig;
use crate::engine::settlement::{SettlementCalculator, SettlementPolicy};
use crate::feed::RetryConfig;
use crate::types::ArenaError;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub resolution: ResolutionConfig,
    pub feed: FeedConfig,
    pub storage: StorageConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResolutionConfig {
    #[serde(default)]
    pub policy: ResolutionPolicy,
    #[serde(default)]
    pub settlement: SettlementPolicy,
    /// Theoretical stake per prediction, USD.
    pub stake: f64,
    /// Price floor applied before computing payouts.
    pub min_price: f64,
    pub fetch_delay_ms: u64,
    pub cycle_budget_secs: u64,
    /// Seconds between scheduled cycles.
    pub interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeedConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sqlite,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub database_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub enabled: bool,
    pub port: u16,
    /// Name of the env var holding the cron bearer token.
    pub cron_secret_env: String,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid config file: {path}"))
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ArenaError> {
        let r = &self.resolution;
        if !(r.stake.is_finite() && r.stake > 0.0) {
            return Err(ArenaError::Config(format!("stake must be positive, got {}", r.stake)));
        }
        if !(r.min_price > 0.0 && r.min_price < 1.0) {
            return Err(ArenaError::Config(format!(
                "min_price must be within (0, 1), got {}",
                r.min_price
            )));
        }
        if r.interval_secs == 0 {
            return Err(ArenaError::Config("interval_secs must be non-zero".to_string()));
        }
        if self.storage.database_url.trim().is_empty() && self.storage.backend == StorageBackend::Sqlite {
            return Err(ArenaError::Config("database_url is required for sqlite".to_string()));
        }
        Ok(())
    }

    /// Build the settlement calculator described by `[resolution]`.
    pub fn settlement_calculator(&self) -> Result<SettlementCalculator, ArenaError> {
        let r = &self.resolution;
        let stake = Decimal::from_f64(r.stake)
            .ok_or_else(|| ArenaError::Config(format!("stake not representable: {}", r.stake)))?;
        let min_price = Decimal::from_f64(r.min_price)
            .ok_or_else(|| ArenaError::Config(format!("min_price not representable: {}", r.min_price)))?;
        Ok(SettlementCalculator::new(r.settlement, stake, min_price))
    }

    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            policy: self.resolution.policy,
            fetch_delay: Duration::from_millis(self.resolution.fetch_delay_ms),
            cycle_budget: Duration::from_secs(self.resolution.cycle_budget_secs),
            retry: RetryConfig {
                max_retries: self.feed.max_retries,
                initial_delay_ms: self.feed.initial_backoff_ms,
                max_delay_ms: self.feed.max_backoff_ms,
                backoff_factor: 2.0,
            },
        }
    }

    /// The cron bearer token, if its env var is set and non-empty.
    pub fn cron_secret(&self) -> Option<SecretString> {
        Self::resolve_env(&self.server.cron_secret_env)
            .ok()
            .filter(|s| !s.is_empty())
            .map(SecretString::new)
    }

    /// Resolve an environment variable name to its value.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }
}
