//! Worker configuration, loaded once at process start from the environment.
//!
//! Required variables are validated eagerly: a missing `FILES` or
//! `DATABASE_URL` is a startup error, never a panic deferred to first use.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

/// Top-level worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Root directory for input/processed/uploads/reports.
    pub files_root: PathBuf,
    /// Postgres connection string backing the document-store adapter.
    pub database_url: String,
    /// Postgres connection string backing the apalis task queue.
    /// Defaults to `database_url` when unset.
    pub task_queue_database_url: String,
    /// Skips issuing non-GET upload requests, short-circuiting with a
    /// synthetic success, for exercising upload pipelines without side
    /// effects.
    pub api_post_dryrun: bool,
    pub pool: PoolConfig,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { max_connections: 20, min_connections: 5, connect_timeout_secs: 30 }
    }
}

impl WorkerConfig {
    /// Load from the environment, failing fast on missing required vars.
    pub fn from_env() -> Result<Self> {
        let files_root = required_env("FILES").map(PathBuf::from)?;
        let database_url = required_env("DATABASE_URL")?;
        let task_queue_database_url =
            std::env::var("TASK_QUEUE_DATABASE_URL").unwrap_or_else(|_| database_url.clone());
        let api_post_dryrun = std::env::var("API_POST_DRYRUN")
            .ok()
            .map(|v| is_truthy(&v))
            .unwrap_or(false);

        let pool = PoolConfig {
            max_connections: optional_env_parse("DB_MAX_CONNECTIONS", 20)?,
            min_connections: optional_env_parse("DB_MIN_CONNECTIONS", 5)?,
            connect_timeout_secs: optional_env_parse("DB_CONNECT_TIMEOUT_SECS", 30)?,
        };

        let config =
            Self { files_root, database_url, task_queue_database_url, api_post_dryrun, pool };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.database_url.is_empty() {
            bail!("DATABASE_URL must not be empty");
        }
        if self.pool.max_connections == 0 {
            bail!("DB_MAX_CONNECTIONS must be greater than 0");
        }
        if self.pool.min_connections > self.pool.max_connections {
            bail!("DB_MIN_CONNECTIONS must not exceed DB_MAX_CONNECTIONS");
        }
        Ok(())
    }
}

fn required_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("{key} must be set"))
}

fn optional_env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.parse::<T>().map_err(|e| anyhow::anyhow!("invalid {key}: {e}")),
        Err(_) => Ok(default),
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "FILES",
            "DATABASE_URL",
            "TASK_QUEUE_DATABASE_URL",
            "API_POST_DRYRUN",
            "DB_MAX_CONNECTIONS",
            "DB_MIN_CONNECTIONS",
            "DB_CONNECT_TIMEOUT_SECS",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn missing_files_is_an_error() {
        clear_env();
        std::env::set_var("DATABASE_URL", "postgresql://localhost/test");
        assert!(WorkerConfig::from_env().is_err());
        clear_env();
    }

    #[test]
    #[serial]
    fn task_queue_database_url_defaults_to_database_url() {
        clear_env();
        std::env::set_var("FILES", "/tmp/inflow-files");
        std::env::set_var("DATABASE_URL", "postgresql://localhost/test");
        let config = WorkerConfig::from_env().unwrap();
        assert_eq!(config.task_queue_database_url, config.database_url);
        clear_env();
    }

    #[test]
    #[serial]
    fn api_post_dryrun_is_truthy_parsed() {
        clear_env();
        std::env::set_var("FILES", "/tmp/inflow-files");
        std::env::set_var("DATABASE_URL", "postgresql://localhost/test");
        std::env::set_var("API_POST_DRYRUN", "TRUE");
        let config = WorkerConfig::from_env().unwrap();
        assert!(config.api_post_dryrun);
        clear_env();
    }

    #[test]
    #[serial]
    fn min_exceeding_max_connections_is_rejected() {
        clear_env();
        std::env::set_var("FILES", "/tmp/inflow-files");
        std::env::set_var("DATABASE_URL", "postgresql://localhost/test");
        std::env::set_var("DB_MAX_CONNECTIONS", "2");
        std::env::set_var("DB_MIN_CONNECTIONS", "5");
        assert!(WorkerConfig::from_env().is_err());
        clear_env();
    }
}
