//! Environment-based configuration.

use std::time::Duration;

use crate::executor::ExecutorConfig;
use crate::lock::DEFAULT_LOCK_MAX_DURATION;

/// Configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,

    /// Lease window before another executor may take over a workflow
    pub lock_max_duration: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

        let lock_max_duration = std::env::var("BELAY_LOCK_MAX_DURATION_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_LOCK_MAX_DURATION);

        Ok(Config {
            database_url,
            lock_max_duration,
        })
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            lock_max_duration: self.lock_max_duration,
        }
    }
}
