//! Configuration loading and representation.
//!
//! Everything is read from environment variables; unset variables fall back to defaults.
//! The `from_lookup` constructors take the variable source as a closure so tests never
//! touch the process environment.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use coffer_wallet::RefundOverridePolicy;

/// Credit granted when an account is opened without an explicit amount.
pub const DEFAULT_INITIAL_CREDIT: i64 = 10_000;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set when USE_PERSISTENT_STORES=true")]
    Missing(&'static str),
}

/// Tunables of the wallet engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub initial_credit: i64,
    /// Attempts per operation when the store reports a version conflict (>= 1).
    pub max_attempts: u32,
    /// Base backoff between attempts; attempt `n` sleeps `n * retry_backoff_ms`.
    pub retry_backoff_ms: u64,
    pub refund_override_policy: RefundOverridePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_credit: DEFAULT_INITIAL_CREDIT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            refund_override_policy: RefundOverridePolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Read `COFFER_INITIAL_CREDIT`, `COFFER_MAX_ATTEMPTS`, `COFFER_RETRY_BACKOFF_MS` and
    /// `COFFER_REFUND_OVERRIDE` (`cap` | `permissive`).
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let initial_credit = match parse_or("COFFER_INITIAL_CREDIT", &lookup, defaults.initial_credit) {
            credit if credit < 0 => {
                warn!(value = credit, "negative COFFER_INITIAL_CREDIT, using default");
                defaults.initial_credit
            }
            credit => credit,
        };
        let max_attempts = parse_or("COFFER_MAX_ATTEMPTS", &lookup, defaults.max_attempts).max(1);
        let retry_backoff_ms =
            parse_or("COFFER_RETRY_BACKOFF_MS", &lookup, defaults.retry_backoff_ms);

        let refund_override_policy = match lookup("COFFER_REFUND_OVERRIDE").as_deref() {
            None => defaults.refund_override_policy,
            Some("cap") => RefundOverridePolicy::CapAtPurchasePrice,
            Some("permissive") => RefundOverridePolicy::Permissive,
            Some(other) => {
                warn!(value = other, "unknown COFFER_REFUND_OVERRIDE, using default");
                defaults.refund_override_policy
            }
        };

        Self {
            initial_credit,
            max_attempts,
            retry_backoff_ms,
            refund_override_policy,
        }
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

fn parse_or<T>(key: &str, lookup: &impl Fn(&str) -> Option<String>, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "unparsable value, using default");
            default
        }),
    }
}

/// Which storage backend to wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    InMemory,
    Postgres { database_url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub backend: StoreBackend,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::InMemory,
        }
    }
}

impl StoreConfig {
    /// `USE_PERSISTENT_STORES=true` selects Postgres at `DATABASE_URL`; anything else keeps
    /// the in-memory store.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let use_persistent = lookup("USE_PERSISTENT_STORES")
            .and_then(|v| v.trim().parse::<bool>().ok())
            .unwrap_or(false);

        if !use_persistent {
            return Ok(Self::default());
        }

        let database_url = lookup("DATABASE_URL")
            .filter(|url| !url.trim().is_empty())
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;

        Ok(Self {
            backend: StoreBackend::Postgres { database_url },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = EngineConfig::from_lookup(env(&[]));
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.initial_credit, 10_000);
        assert_eq!(config.refund_override_policy, RefundOverridePolicy::CapAtPurchasePrice);
        assert_eq!(config.retry_backoff(), Duration::from_millis(5));
    }

    #[test]
    fn overrides_are_read() {
        let config = EngineConfig::from_lookup(env(&[
            ("COFFER_INITIAL_CREDIT", "250"),
            ("COFFER_MAX_ATTEMPTS", "9"),
            ("COFFER_RETRY_BACKOFF_MS", "0"),
            ("COFFER_REFUND_OVERRIDE", "permissive"),
        ]));
        assert_eq!(config.initial_credit, 250);
        assert_eq!(config.max_attempts, 9);
        assert_eq!(config.retry_backoff_ms, 0);
        assert_eq!(config.refund_override_policy, RefundOverridePolicy::Permissive);
    }

    #[test]
    fn bad_values_fall_back() {
        let config = EngineConfig::from_lookup(env(&[
            ("COFFER_INITIAL_CREDIT", "lots"),
            ("COFFER_MAX_ATTEMPTS", "0"),
            ("COFFER_REFUND_OVERRIDE", "generous"),
        ]));
        assert_eq!(config.initial_credit, DEFAULT_INITIAL_CREDIT);
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.refund_override_policy, RefundOverridePolicy::CapAtPurchasePrice);
    }

    #[test]
    fn negative_initial_credit_falls_back_to_default() {
        let config = EngineConfig::from_lookup(env(&[("COFFER_INITIAL_CREDIT", "-250")]));
        assert_eq!(config.initial_credit, DEFAULT_INITIAL_CREDIT);

        let config = EngineConfig::from_lookup(env(&[("COFFER_INITIAL_CREDIT", "0")]));
        assert_eq!(config.initial_credit, 0);
    }

    #[test]
    fn persistent_store_requires_database_url() {
        assert_eq!(
            StoreConfig::from_lookup(env(&[("USE_PERSISTENT_STORES", "true")])),
            Err(ConfigError::Missing("DATABASE_URL"))
        );

        let config = StoreConfig::from_lookup(env(&[
            ("USE_PERSISTENT_STORES", "true"),
            ("DATABASE_URL", "postgres://localhost/coffer"),
        ]))
        .unwrap();
        assert_eq!(
            config.backend,
            StoreBackend::Postgres {
                database_url: "postgres://localhost/coffer".to_string()
            }
        );

        assert_eq!(
            StoreConfig::from_lookup(env(&[("USE_PERSISTENT_STORES", "nope")])).unwrap(),
            StoreConfig::default()
        );
    }
}
