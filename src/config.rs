use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::ensemble::EnsembleWeights;
use crate::error::ConfigError;
use crate::monitor::MAX_PREDICTIONS;
use crate::store::RetryPolicy;

const CACHE_DIR: &str = "matchcast";
const DB_FILE: &str = "matchcast.sqlite";

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub weights: EnsembleWeights,
    pub db_path: Option<PathBuf>,
    pub store_timeout: Duration,
    pub store_retries: u32,
    pub store_backoff: Duration,
    pub curve_cache_capacity: usize,
    pub curve_cache_ttl: Duration,
    pub max_predictions: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            weights: EnsembleWeights::default(),
            db_path: default_db_path(),
            store_timeout: Duration::from_millis(500),
            store_retries: 2,
            store_backoff: Duration::from_millis(25),
            curve_cache_capacity: 256,
            curve_cache_ttl: Duration::from_secs(300),
            max_predictions: MAX_PREDICTIONS,
        }
    }
}

impl EngineConfig {
    /// Reads `MATCHCAST_*` from the process environment. Call `load_dotenv` first to
    /// pick up `.env.local` / `.env`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| {
            env::var(key)
                .ok()
                .and_then(|val| if val.trim().is_empty() { None } else { Some(val) })
        })
    }

    /// Builds a config from any key lookup. Unparseable values fall back to defaults; only
    /// an unusable weight set is an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let num = |key: &str| lookup(key).and_then(|v| v.trim().parse::<f64>().ok());
        let int = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        let weights = match (
            num("MATCHCAST_WEIGHT_DENSE"),
            num("MATCHCAST_WEIGHT_LSTM"),
            num("MATCHCAST_WEIGHT_CNN"),
        ) {
            (None, None, None) => defaults.weights,
            (dense, lstm, cnn) => EnsembleWeights::normalized(
                dense.unwrap_or(defaults.weights.dense),
                lstm.unwrap_or(defaults.weights.lstm),
                cnn.unwrap_or(defaults.weights.cnn),
            )?,
        };

        let db_path = match lookup("MATCHCAST_DB_PATH") {
            Some(raw) if raw.trim().eq_ignore_ascii_case("memory") => None,
            Some(raw) => Some(PathBuf::from(raw.trim())),
            None => defaults.db_path,
        };

        Ok(Self {
            weights,
            db_path,
            store_timeout: Duration::from_millis(
                int("MATCHCAST_STORE_TIMEOUT_MS")
                    .unwrap_or(defaults.store_timeout.as_millis() as u64)
                    .clamp(10, 30_000),
            ),
            store_retries: int("MATCHCAST_STORE_RETRIES")
                .unwrap_or(defaults.store_retries as u64)
                .min(10) as u32,
            store_backoff: Duration::from_millis(
                int("MATCHCAST_STORE_BACKOFF_MS")
                    .unwrap_or(defaults.store_backoff.as_millis() as u64)
                    .min(5_000),
            ),
            curve_cache_capacity: int("MATCHCAST_CURVE_CACHE_CAPACITY")
                .map(|v| v as usize)
                .unwrap_or(defaults.curve_cache_capacity)
                .clamp(1, 100_000),
            curve_cache_ttl: Duration::from_secs(
                int("MATCHCAST_CURVE_CACHE_TTL_SECS")
                    .unwrap_or(defaults.curve_cache_ttl.as_secs())
                    .clamp(1, 86_400),
            ),
            max_predictions: int("MATCHCAST_MAX_PREDICTIONS")
                .map(|v| v as usize)
                .unwrap_or(defaults.max_predictions)
                .clamp(1, 1_000_000),
        })
    }

    /// In-memory store only; nothing read from the environment.
    pub fn ephemeral() -> Self {
        Self {
            db_path: None,
            ..Self::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.store_retries,
            backoff: self.store_backoff,
        }
    }

    pub fn curve_cache_ttl_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.curve_cache_ttl).unwrap_or(chrono::Duration::minutes(5))
    }
}

pub fn load_dotenv() {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");
}

pub fn default_db_path() -> Option<PathBuf> {
    // Prefer XDG cache.
    if let Ok(base) = env::var("XDG_CACHE_HOME")
        && !base.trim().is_empty()
    {
        return Some(PathBuf::from(base).join(CACHE_DIR).join(DB_FILE));
    }
    let home = env::var("HOME").ok()?;
    if home.trim().is_empty() {
        return None;
    }
    Some(PathBuf::from(home).join(".cache").join(CACHE_DIR).join(DB_FILE))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn empty_lookup_gives_defaults() {
        let cfg = EngineConfig::from_lookup(|_| None).unwrap();
        assert_eq!(cfg.weights, EnsembleWeights::default());
        assert_eq!(cfg.max_predictions, MAX_PREDICTIONS);
        assert_eq!(cfg.store_retries, 2);
    }

    #[test]
    fn weights_are_normalized() {
        let cfg = EngineConfig::from_lookup(lookup(&[
            ("MATCHCAST_WEIGHT_DENSE", "2"),
            ("MATCHCAST_WEIGHT_LSTM", "1"),
            ("MATCHCAST_WEIGHT_CNN", "1"),
        ]))
        .unwrap();
        assert!((cfg.weights.dense - 0.5).abs() < 1e-12);
        assert!((cfg.weights.cnn - 0.25).abs() < 1e-12);
    }

    #[test]
    fn zero_weights_are_rejected() {
        let err = EngineConfig::from_lookup(lookup(&[
            ("MATCHCAST_WEIGHT_DENSE", "0"),
            ("MATCHCAST_WEIGHT_LSTM", "0"),
            ("MATCHCAST_WEIGHT_CNN", "0"),
        ]));
        assert!(matches!(err, Err(ConfigError::InvalidWeights(_))));
    }

    #[test]
    fn numeric_values_are_clamped_and_garbage_ignored() {
        let cfg = EngineConfig::from_lookup(lookup(&[
            ("MATCHCAST_STORE_TIMEOUT_MS", "1"),
            ("MATCHCAST_STORE_RETRIES", "lots"),
            ("MATCHCAST_MAX_PREDICTIONS", "0"),
            ("MATCHCAST_DB_PATH", "memory"),
        ]))
        .unwrap();
        assert_eq!(cfg.store_timeout, Duration::from_millis(10));
        assert_eq!(cfg.store_retries, 2);
        assert_eq!(cfg.max_predictions, 1);
        assert!(cfg.db_path.is_none());
    }
}
