//! Config - relay と consumer の実行時設定
//!
//! 既定値を持つ素の struct と、`COURIER_*` 環境変数から読む `from_env()` を提供します。
//! トポロジー（名前、MAX_ATTEMPTS、PREFETCH、バックオフ列）はサービス間の契約なので設定できません。
//!
//! | 変数 | 既定値 |
//! |------|--------|
//! | `COURIER_RELAY_POLL_INTERVAL_MS` | 5000 |
//! | `COURIER_RELAY_BATCH_SIZE` | 100 |
//! | `COURIER_RELAY_CLAIM_LEASE_MS` | 30000 |
//! | `COURIER_CONSUMER_WORKERS` | 10 (= PREFETCH) |

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::topology::PREFETCH;

pub const RELAY_POLL_INTERVAL_MS: &str = "COURIER_RELAY_POLL_INTERVAL_MS";
pub const RELAY_BATCH_SIZE: &str = "COURIER_RELAY_BATCH_SIZE";
pub const RELAY_CLAIM_LEASE_MS: &str = "COURIER_RELAY_CLAIM_LEASE_MS";
pub const CONSUMER_WORKERS: &str = "COURIER_CONSUMER_WORKERS";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key}={value:?} is not a valid number")]
    NotANumber { key: &'static str, value: String },

    #[error("{key}={value} is out of range ({min}..={max})")]
    OutOfRange {
        key: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
}

/// RelayConfig は outbox relay の設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// バッチ間の待ち時間
    pub poll_interval: Duration,
    /// 1 回に claim する最大件数
    pub batch_size: usize,
    /// claim したエントリを他の relay から隠す時間
    pub claim_lease: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 100,
            claim_lease: Duration::from_secs(30),
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// `lookup` で値を引く。未設定のキーは既定値
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let poll_ms = read(&lookup, RELAY_POLL_INTERVAL_MS, 1, u64::MAX)?
            .unwrap_or(defaults.poll_interval.as_millis() as u64);
        let batch_size = read(&lookup, RELAY_BATCH_SIZE, 1, 10_000)?
            .map_or(defaults.batch_size, |v| v as usize);
        let lease_ms = read(&lookup, RELAY_CLAIM_LEASE_MS, 1, u64::MAX)?
            .unwrap_or(defaults.claim_lease.as_millis() as u64);

        Ok(Self {
            poll_interval: Duration::from_millis(poll_ms),
            batch_size,
            claim_lease: Duration::from_millis(lease_ms),
        })
    }
}

/// ConsumerConfig は 1 つの consumer（queue）の設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// 並行 worker 数。各 worker は未 ack の配送を最大 1 件持つので、これが prefetch になる
    pub workers: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self { workers: PREFETCH }
    }
}

impl ConsumerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let workers = read(&lookup, CONSUMER_WORKERS, 1, PREFETCH as u64)?
            .map_or(PREFETCH, |v| v as usize);
        Ok(Self { workers })
    }
}

fn read(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    min: u64,
    max: u64,
) -> Result<Option<u64>, ConfigError> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let value = u64::from_str(raw.trim()).map_err(|_| ConfigError::NotANumber {
        key,
        value: raw.clone(),
    })?;
    if !(min..=max).contains(&value) {
        return Err(ConfigError::OutOfRange {
            key,
            value,
            min,
            max,
        });
    }
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn missing_variables_fall_back_to_defaults() {
        assert_eq!(RelayConfig::from_lookup(lookup(&[])).unwrap(), RelayConfig::default());
        assert_eq!(
            ConsumerConfig::from_lookup(lookup(&[])).unwrap(),
            ConsumerConfig { workers: 10 }
        );
    }

    #[test]
    fn variables_override_defaults() {
        let config = RelayConfig::from_lookup(lookup(&[
            (RELAY_POLL_INTERVAL_MS, "250"),
            (RELAY_BATCH_SIZE, " 20 "),
            (RELAY_CLAIM_LEASE_MS, "1000"),
        ]))
        .unwrap();

        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.batch_size, 20);
        assert_eq!(config.claim_lease, Duration::from_secs(1));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = RelayConfig::from_lookup(lookup(&[(RELAY_BATCH_SIZE, "lots")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::NotANumber {
                key: RELAY_BATCH_SIZE,
                value: "lots".into()
            }
        );

        let err = ConsumerConfig::from_lookup(lookup(&[(CONSUMER_WORKERS, "11")])).unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { value: 11, max: 10, .. }));

        let err = RelayConfig::from_lookup(lookup(&[(RELAY_POLL_INTERVAL_MS, "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { .. }));
    }
}
