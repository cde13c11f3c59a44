//! Configuration management

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use txload_common::types::TerminalFolder;

use crate::loader::{
    RetryPolicy, DEFAULT_RETRY_BASE_DELAY_MS, DEFAULT_RETRY_MAX_ATTEMPTS, DEFAULT_RETRY_MAX_DELAY_MS,
};
use crate::orchestrator::{
    OrchestratorConfig, DEFAULT_PROCESSED_SUFFIX, DEFAULT_REQUEST_DELAY_SECS,
    DEFAULT_REQUEST_LOOKBACK_DAYS,
};
use crate::pool::DEFAULT_WORKER_POOL_SIZE;
use crate::stats::DEFAULT_ERROR_SAMPLE_LIMIT;
use crate::store::DEFAULT_BATCH_SIZE;
use crate::transport::ftp::{FtpConfig, DEFAULT_FTP_PORT, DEFAULT_FTP_TIMEOUT_SECS};
use crate::transport::pool::DEFAULT_SESSION_POOL_SIZE;

// ============================================================================
// Server Configuration Constants
// ============================================================================

/// Default HTTP host binding.
pub const DEFAULT_HTTP_HOST: &str = "127.0.0.1";

/// Default HTTP port.
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/txload";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

/// Default FTP host.
pub const DEFAULT_FTP_HOST: &str = "localhost";

/// Default FTP user.
pub const DEFAULT_FTP_USERNAME: &str = "anonymous";

/// Default request folder root on the transfer server.
pub const DEFAULT_REQUEST_ROOT: &str = "/requests";

/// Default response folder root on the transfer server.
pub const DEFAULT_RESPONSE_ROOT: &str = "/responses";

/// Default pause between two runs (15 minutes).
pub const DEFAULT_RUN_INTERVAL_SECS: u64 = 900;

/// Service configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub http: HttpConfig,
    pub database: DatabaseConfig,
    pub ftp: FtpSettings,
    pub etl: EtlConfig,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub auto_create_tables: bool,
}

#[derive(Debug, Clone)]
pub struct FtpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct EtlConfig {
    pub folders: Vec<TerminalFolder>,
    pub request_root: String,
    pub response_root: String,
    pub processed_suffix: String,
    pub worker_pool_size: i64,
    pub session_pool_size: usize,
    pub batch_size: usize,
    pub request_delay_secs: u64,
    pub request_lookback_days: u64,
    pub run_interval_secs: u64,
    pub error_sample_limit: usize,
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

/// Parsed value of `key`, or `default` when unset or unparsable
fn parse_or<T: FromStr>(vars: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    vars(key).and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

fn string_or(vars: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> String {
    vars(key).unwrap_or_else(|| default.to_string())
}

impl Config {
    /// Load configuration from `.env`, the environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from a variable lookup
    pub fn from_lookup(vars: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let request_root = string_or(&vars, "ETL_REQUEST_ROOT", DEFAULT_REQUEST_ROOT);
        let response_root = string_or(&vars, "ETL_RESPONSE_ROOT", DEFAULT_RESPONSE_ROOT);
        let folder_list = vars("ETL_TERMINAL_FOLDERS").unwrap_or_default();
        let folders = TerminalFolder::parse_list(&folder_list, &request_root, &response_root)
            .context("Invalid ETL_TERMINAL_FOLDERS")?;

        let config = Config {
            http: HttpConfig {
                host: string_or(&vars, "HTTP_HOST", DEFAULT_HTTP_HOST),
                port: parse_or(&vars, "HTTP_PORT", DEFAULT_HTTP_PORT),
            },
            database: DatabaseConfig {
                url: string_or(&vars, "DATABASE_URL", DEFAULT_DATABASE_URL),
                max_connections: parse_or(&vars, "DATABASE_MAX_CONNECTIONS", DEFAULT_DATABASE_MAX_CONNECTIONS),
                min_connections: parse_or(&vars, "DATABASE_MIN_CONNECTIONS", DEFAULT_DATABASE_MIN_CONNECTIONS),
                connect_timeout_secs: parse_or(
                    &vars,
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
                idle_timeout_secs: parse_or(&vars, "DATABASE_IDLE_TIMEOUT", DEFAULT_DATABASE_IDLE_TIMEOUT_SECS),
                auto_create_tables: parse_or(&vars, "DB_AUTO_CREATE_TABLES", true),
            },
            ftp: FtpSettings {
                host: string_or(&vars, "FTP_HOST", DEFAULT_FTP_HOST),
                port: parse_or(&vars, "FTP_PORT", DEFAULT_FTP_PORT),
                username: string_or(&vars, "FTP_USERNAME", DEFAULT_FTP_USERNAME),
                password: vars("FTP_PASSWORD").unwrap_or_default(),
                timeout_secs: parse_or(&vars, "FTP_TIMEOUT_SECS", DEFAULT_FTP_TIMEOUT_SECS),
            },
            etl: EtlConfig {
                folders,
                request_root,
                response_root,
                processed_suffix: string_or(&vars, "ETL_PROCESSED_SUFFIX", DEFAULT_PROCESSED_SUFFIX),
                worker_pool_size: parse_or(&vars, "ETL_WORKER_POOL_SIZE", DEFAULT_WORKER_POOL_SIZE as i64),
                session_pool_size: parse_or(&vars, "ETL_SESSION_POOL_SIZE", DEFAULT_SESSION_POOL_SIZE),
                batch_size: parse_or(&vars, "ETL_BATCH_SIZE", DEFAULT_BATCH_SIZE),
                request_delay_secs: parse_or(&vars, "ETL_REQUEST_DELAY_SECS", DEFAULT_REQUEST_DELAY_SECS),
                request_lookback_days: parse_or(
                    &vars,
                    "ETL_REQUEST_LOOKBACK_DAYS",
                    DEFAULT_REQUEST_LOOKBACK_DAYS,
                ),
                run_interval_secs: parse_or(&vars, "ETL_RUN_INTERVAL_SECS", DEFAULT_RUN_INTERVAL_SECS),
                error_sample_limit: parse_or(&vars, "ETL_ERROR_SAMPLE_LIMIT", DEFAULT_ERROR_SAMPLE_LIMIT),
                retry_max_attempts: parse_or(&vars, "ETL_RETRY_MAX_ATTEMPTS", DEFAULT_RETRY_MAX_ATTEMPTS),
                retry_base_delay_ms: parse_or(&vars, "ETL_RETRY_BASE_DELAY_MS", DEFAULT_RETRY_BASE_DELAY_MS),
                retry_max_delay_ms: parse_or(&vars, "ETL_RETRY_MAX_DELAY_MS", DEFAULT_RETRY_MAX_DELAY_MS),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.http.port == 0 {
            anyhow::bail!("HTTP port must be greater than 0");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        if self.ftp.host.is_empty() {
            anyhow::bail!("FTP host cannot be empty");
        }

        if self.etl.folders.is_empty() {
            anyhow::bail!("ETL_TERMINAL_FOLDERS must list at least one TERMINAL/FOLDER");
        }

        let suffix = &self.etl.processed_suffix;
        if suffix.is_empty() || suffix.contains('/') {
            anyhow::bail!("Processed suffix '{}' must be non-empty and contain no '/'", suffix);
        }

        if self.etl.batch_size == 0 {
            anyhow::bail!("Batch size must be greater than 0");
        }

        if self.etl.retry_max_attempts == 0 {
            anyhow::bail!("Retry max attempts must be greater than 0");
        }

        if self.etl.retry_base_delay_ms > self.etl.retry_max_delay_ms {
            anyhow::bail!(
                "Retry base delay ({}ms) cannot exceed max delay ({}ms)",
                self.etl.retry_base_delay_ms,
                self.etl.retry_max_delay_ms
            );
        }

        if self.etl.worker_pool_size <= 0 {
            tracing::warn!(
                requested = self.etl.worker_pool_size,
                fallback = DEFAULT_WORKER_POOL_SIZE,
                "Worker pool size not positive, using default"
            );
        }

        Ok(())
    }

    pub fn ftp_config(&self) -> FtpConfig {
        FtpConfig {
            host: self.ftp.host.clone(),
            port: self.ftp.port,
            username: self.ftp.username.clone(),
            password: self.ftp.password.clone(),
            timeout: Duration::from_secs(self.ftp.timeout_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.etl.retry_max_attempts,
            base_delay: Duration::from_millis(self.etl.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.etl.retry_max_delay_ms),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            folders: self.etl.folders.clone(),
            processed_suffix: self.etl.processed_suffix.clone(),
            worker_pool_size: self.etl.worker_pool_size,
            request_delay: Duration::from_secs(self.etl.request_delay_secs),
            request_lookback_days: self.etl.request_lookback_days,
            error_sample_limit: self.etl.error_sample_limit,
        }
    }

    /// Build configuration from a fixed map, for tests and tools
    pub fn from_map(vars: &HashMap<String, String>) -> anyhow::Result<Self> {
        Self::from_lookup(|key| vars.get(key).cloned())
    }
}
