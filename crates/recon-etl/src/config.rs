//! Configuration management

use crate::dedup::DedupStrategy;
use crate::error::{EtlError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default database URL for local runs; a file next to the working directory.
pub const DEFAULT_DATABASE_URL: &str = "sqlite://recon.db";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 1;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default directory for `metrics_<pipeline_id>.json` files.
pub const DEFAULT_METRICS_DIR: &str = "./data/metrics";

/// Default deduplication strategy name.
pub const DEFAULT_DEDUP_STRATEGY: &str = "hash";

/// Default number of runs a batch executes at once.
pub const DEFAULT_MAX_CONCURRENT_RUNS: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub metrics_dir: PathBuf,
    /// Deduplicated sets are only written when set
    pub processed_dir: Option<PathBuf>,
    pub dedup_strategy: String,
    pub max_concurrent_runs: usize,
}

impl Config {
    /// Load configuration from `.env`, the environment and defaults
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any variable source; unparsable numbers fall back to defaults
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        fn parsed<T: FromStr>(value: Option<String>, default: T) -> T {
            value.and_then(|s| s.trim().parse().ok()).unwrap_or(default)
        }

        let config = Config {
            database: DatabaseConfig {
                url: var("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
                max_connections: parsed(
                    var("DATABASE_MAX_CONNECTIONS"),
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                ),
                min_connections: parsed(
                    var("DATABASE_MIN_CONNECTIONS"),
                    DEFAULT_DATABASE_MIN_CONNECTIONS,
                ),
                connect_timeout_secs: parsed(
                    var("DATABASE_CONNECT_TIMEOUT"),
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
            },
            pipeline: PipelineConfig {
                metrics_dir: var("RECON_METRICS_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_METRICS_DIR)),
                processed_dir: var("RECON_PROCESSED_DIR")
                    .filter(|s| !s.trim().is_empty())
                    .map(PathBuf::from),
                dedup_strategy: var("RECON_DEDUP_STRATEGY")
                    .unwrap_or_else(|| DEFAULT_DEDUP_STRATEGY.to_string()),
                max_concurrent_runs: parsed(
                    var("RECON_MAX_CONCURRENT_RUNS"),
                    DEFAULT_MAX_CONCURRENT_RUNS,
                ),
            },
        };

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(EtlError::config("DATABASE_URL cannot be empty"));
        }

        if self.database.max_connections == 0 {
            return Err(EtlError::config(
                "DATABASE_MAX_CONNECTIONS must be greater than 0",
            ));
        }

        if self.database.min_connections > self.database.max_connections {
            return Err(EtlError::config(format!(
                "DATABASE_MIN_CONNECTIONS ({}) cannot be greater than DATABASE_MAX_CONNECTIONS ({})",
                self.database.min_connections, self.database.max_connections
            )));
        }

        if self.pipeline.max_concurrent_runs == 0 {
            return Err(EtlError::config(
                "RECON_MAX_CONCURRENT_RUNS must be greater than 0",
            ));
        }

        self.dedup_strategy()?;

        Ok(())
    }

    /// The configured strategy with its default parameters
    pub fn dedup_strategy(&self) -> Result<DedupStrategy> {
        self.pipeline.dedup_strategy.parse()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            },
            pipeline: PipelineConfig {
                metrics_dir: PathBuf::from(DEFAULT_METRICS_DIR),
                processed_dir: None,
                dedup_strategy: DEFAULT_DEDUP_STRATEGY.to_string(),
                max_concurrent_runs: DEFAULT_MAX_CONCURRENT_RUNS,
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.database.url, DEFAULT_DATABASE_URL);
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.pipeline.max_concurrent_runs, 4);
        assert!(config.pipeline.processed_dir.is_none());
        assert_eq!(config.dedup_strategy().unwrap(), DedupStrategy::Hash);
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgresql://localhost/recon"),
            ("DATABASE_MAX_CONNECTIONS", "15"),
            ("RECON_PROCESSED_DIR", "/tmp/processed"),
            ("RECON_DEDUP_STRATEGY", "key"),
            ("RECON_MAX_CONCURRENT_RUNS", "not-a-number"),
        ]))
        .unwrap();

        assert_eq!(config.database.max_connections, 15);
        assert!(config.database.url.contains("localhost/recon"));
        assert_eq!(config.pipeline.processed_dir, Some(PathBuf::from("/tmp/processed")));
        assert_eq!(config.dedup_strategy().unwrap().name(), "key");
        assert_eq!(config.pipeline.max_concurrent_runs, DEFAULT_MAX_CONCURRENT_RUNS);
    }

    #[test]
    fn test_invalid_pool_bounds() {
        let err = Config::from_lookup(lookup(&[
            ("DATABASE_MAX_CONNECTIONS", "2"),
            ("DATABASE_MIN_CONNECTIONS", "5"),
        ]))
        .unwrap_err();
        assert!(matches!(err, EtlError::Config(_)));
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let err = Config::from_lookup(lookup(&[("RECON_DEDUP_STRATEGY", "fuzzy")])).unwrap_err();
        assert!(matches!(err, EtlError::UnknownStrategy(_)));
    }
}
