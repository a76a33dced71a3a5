//! Environment-driven service configuration.

use cohort_zk::constants::DEFAULT_SHARD_SIZE;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },

    #[error("{0}")]
    Constraint(String),
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Address the HTTP server binds to.
    pub bind_addr: String,
    /// Holds the SQLite ledger and the Groth16 key files.
    pub data_dir: PathBuf,
    /// Value expected in `X-API-KEY` on mutating routes.
    pub api_key: String,
    /// Records per shard. Part of the circuit shape.
    pub shard_size: usize,
    pub default_dataset_size: u64,
    pub max_dataset_size: u64,
    /// Upper bound on shards being built/proved concurrently per dataset.
    pub prover_workers: usize,
    pub ledger_write_attempts: u32,
    pub ledger_retry_backoff: Duration,
    pub synthetic_seed: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            data_dir: PathBuf::from("data"),
            api_key: "dev-secret-key".to_string(),
            shard_size: DEFAULT_SHARD_SIZE,
            default_dataset_size: 1_000_000,
            max_dataset_size: 10_000_000,
            prover_workers: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            ledger_write_attempts: 3,
            ledger_retry_backoff: Duration::from_millis(50),
            synthetic_seed: 0x485F_4C45_4447_4552,
        }
    }
}

fn env_or<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value.parse().map_err(|_| ConfigError::Invalid { var, value }),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let config = Self {
            bind_addr: env_or("BACKEND_ADDR", d.bind_addr)?,
            data_dir: env_or("DATA_DIR", d.data_dir)?,
            api_key: env_or("API_KEY", d.api_key)?,
            shard_size: env_or("SHARD_SIZE", d.shard_size)?,
            default_dataset_size: env_or("DEFAULT_DATASET_SIZE", d.default_dataset_size)?,
            max_dataset_size: env_or("MAX_DATASET_SIZE", d.max_dataset_size)?,
            prover_workers: env_or("PROVER_WORKERS", d.prover_workers)?,
            ledger_write_attempts: env_or("LEDGER_WRITE_ATTEMPTS", d.ledger_write_attempts)?,
            ledger_retry_backoff: Duration::from_millis(env_or(
                "LEDGER_RETRY_BACKOFF_MS",
                d.ledger_retry_backoff.as_millis() as u64,
            )?),
            synthetic_seed: env_or("SYNTHETIC_SEED", d.synthetic_seed)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shard_size == 0 {
            return Err(ConfigError::Constraint("SHARD_SIZE must be positive".to_string()));
        }
        if self.prover_workers == 0 {
            return Err(ConfigError::Constraint("PROVER_WORKERS must be positive".to_string()));
        }
        if self.ledger_write_attempts == 0 {
            return Err(ConfigError::Constraint("LEDGER_WRITE_ATTEMPTS must be positive".to_string()));
        }
        Ok(())
    }

    /// Small shards and a private data dir, for tests.
    pub fn testing(data_dir: PathBuf, shard_size: usize) -> Self {
        Self {
            data_dir,
            shard_size,
            default_dataset_size: 2 * shard_size as u64,
            max_dataset_size: 64 * shard_size as u64,
            prover_workers: 2,
            ledger_retry_backoff: Duration::from_millis(1),
            ..Self::default()
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("ledger.sqlite")
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.data_dir.join("keys")
    }
}
