//! Typed configuration from environment variables.
//!
//! | 変数                  | 既定値                    |
//! |-----------------------|---------------------------|
//! | `BATON_LEDGER`        | `TASKS/MASTER_TASKS.json` |
//! | `BATON_LOCK_ATTEMPTS` | `5`                       |
//! | `BATON_LOCK_DELAY_MS` | `500`                     |
//! | `BATON_LOCK_TTL_SECS` | `30`                      |
//!
//! ローカル開発では `dotenvy::dotenv().ok()` を先に呼んでください。
//! 古い claim の閾値（3600 秒）はポリシー定数なので、ここでは変えられません。

use std::path::PathBuf;

use thiserror::Error;

use crate::impls::DEFAULT_LEASE_TTL_SECS;

pub const DEFAULT_LEDGER: &str = "TASKS/MASTER_TASKS.json";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be {expected}, got '{value}'")]
    Invalid {
        name: &'static str,
        value: String,
        expected: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    pub ledger: PathBuf,
    pub lock_attempts: u32,
    pub lock_delay_ms: u64,
    pub lock_ttl_secs: i64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            ledger: PathBuf::from(DEFAULT_LEDGER),
            lock_attempts: 5,
            lock_delay_ms: 500,
            lock_ttl_secs: DEFAULT_LEASE_TTL_SECS,
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            ledger: lookup("BATON_LEDGER")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.ledger),
            lock_attempts: positive(&lookup, "BATON_LOCK_ATTEMPTS")?
                .unwrap_or(defaults.lock_attempts),
            lock_delay_ms: number(&lookup, "BATON_LOCK_DELAY_MS")?
                .unwrap_or(defaults.lock_delay_ms),
            lock_ttl_secs: positive(&lookup, "BATON_LOCK_TTL_SECS")?
                .unwrap_or(defaults.lock_ttl_secs),
        })
    }
}

fn number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                name,
                value,
                expected: "a non-negative integer",
            }),
    }
}

fn positive<T: std::str::FromStr + PartialOrd + Default>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    let parsed: Option<T> = number(lookup, name).map_err(|err| match err {
        ConfigError::Invalid { name, value, .. } => ConfigError::Invalid {
            name,
            value,
            expected: "a positive integer",
        },
    })?;
    match parsed {
        Some(n) if n <= T::default() => Err(ConfigError::Invalid {
            name,
            value: lookup(name).unwrap_or_default(),
            expected: "a positive integer",
        }),
        other => Ok(other),
    }
}
