//! Service configuration: plaintext settings TOML plus a separate
//! secrets TOML, assembled into a runtime [`Ctx`].

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use sqlx::SqlitePool;
use tracing::Level;
use url::Url;

use crate::rewards::ChannelConfig;
use crate::sweeper::SweeperConfig;

#[derive(Parser, Debug)]
pub struct Env {
    /// Path to plaintext TOML configuration file
    #[clap(long)]
    pub config: PathBuf,
    /// Path to TOML secrets file
    #[clap(long)]
    pub secrets: PathBuf,
}

/// Non-secret settings deserialized from the plaintext config TOML.
#[derive(Deserialize)]
struct Config {
    database_url: String,
    log_level: Option<LogLevel>,
    sweep_interval_secs: Option<u64>,
    sweep_max_jitter_secs: Option<u64>,
    payout: Option<ChannelConfig>,
}

/// Secret credentials deserialized from the secrets TOML.
#[derive(Deserialize)]
struct Secrets {
    directory: DirectorySecrets,
}

/// Member directory API endpoint and credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct DirectorySecrets {
    pub base_url: Url,
    pub api_token: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML")]
    Toml(#[from] toml::de::Error),
}

/// Combined runtime context assembled from config and secrets.
#[derive(Debug, Clone)]
pub struct Ctx {
    pub database_url: String,
    pub log_level: LogLevel,
    pub sweeper: SweeperConfig,
    pub channels: ChannelConfig,
    pub directory: DirectorySecrets,
}

impl Env {
    pub fn into_ctx(self) -> Result<Ctx, ConfigError> {
        let config: Config = toml::from_str(&std::fs::read_to_string(&self.config)?)?;
        let secrets: Secrets = toml::from_str(&std::fs::read_to_string(&self.secrets)?)?;

        let default_sweeper = SweeperConfig::default();
        let sweeper = SweeperConfig {
            interval: config
                .sweep_interval_secs
                .map_or(default_sweeper.interval, Duration::from_secs),
            max_jitter: config
                .sweep_max_jitter_secs
                .map_or(default_sweeper.max_jitter, Duration::from_secs),
        };

        Ok(Ctx {
            database_url: config.database_url,
            log_level: config.log_level.unwrap_or(LogLevel::Info),
            sweeper,
            channels: config.payout.unwrap_or_default(),
            directory: secrets.directory,
        })
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(log_level: LogLevel) -> Self {
        match log_level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

pub async fn configure_sqlite_pool(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let pool = SqlitePool::connect(database_url).await?;

    // WAL allows concurrent readers alongside the single writer.
    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;

    // Blocked writers wait instead of failing immediately with
    // "database is locked".
    sqlx::query("PRAGMA busy_timeout = 10000")
        .execute(&pool)
        .await?;

    Ok(pool)
}
