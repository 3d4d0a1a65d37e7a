//! Environment-based configuration.
//!
//! The daemon is configured entirely through environment variables; periods
//! and the TTL use the same duration grammar as the time-range DSL
//! (`"30d"`, `"1h 30m"`).

use crate::query::time_range;
use crate::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Background maintenance periods.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Sealed chunks whose whole range is older than this are expired.
    pub logs_ttl: Duration,
    pub aligning_period: Duration,
    pub del_expired_period: Duration,
    pub rm_files_period: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            logs_ttl: Duration::from_secs(30 * 24 * 3600),
            aligning_period: Duration::from_secs(60),
            del_expired_period: Duration::from_secs(3600),
            rm_files_period: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen port.
    pub port: u16,
    /// Writer instances; each owns a disjoint shard of the chunk id space.
    pub writers: u8,
    /// Reader instances.
    pub readers: u8,
    /// Deleter worker instances.
    pub deleters: u8,
    /// Shutdown password.
    pub password: String,
    /// Data root holding `storages/`, `transactions/`, `delete_tasks/`.
    pub data_dir: PathBuf,
    pub scheduler: SchedulerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8070,
            writers: 10,
            readers: 10,
            deleters: 1,
            password: String::new(),
            data_dir: PathBuf::from("."),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Config {
    /// Build configuration from the environment:
    ///
    /// - `PORT` (default 8070)
    /// - `WRITERS`, `READERS`, `DELETERS` (defaults 10/10/1)
    /// - `PASSWORD` (required)
    /// - `DB_LOGS_DIR` (data root, default current directory)
    /// - `LOGS_TTL`, `ALIGNING_CHUNKS_PERIOD`,
    ///   `DELETING_EXPIRED_CHUNKS_PERIOD`, `REMOVING_FILES_PERIOD`
    ///   (duration grammar; defaults 30d/1m/1h/1m)
    pub fn from_env() -> Result<Config> {
        let mut config = Config {
            password: require_env("PASSWORD")?,
            ..Config::default()
        };

        if let Some(port) = optional_env("PORT") {
            config.port = port
                .parse()
                .map_err(|_| Error::bad_request(format!("PORT must be a port number: {port}")))?;
        }
        config.writers = parse_count("WRITERS", config.writers)?;
        config.readers = parse_count("READERS", config.readers)?;
        config.deleters = parse_count("DELETERS", config.deleters)?;

        if let Some(dir) = optional_env("DB_LOGS_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        config.scheduler.logs_ttl = parse_period("LOGS_TTL", config.scheduler.logs_ttl)?;
        config.scheduler.aligning_period =
            parse_period("ALIGNING_CHUNKS_PERIOD", config.scheduler.aligning_period)?;
        config.scheduler.del_expired_period = parse_period(
            "DELETING_EXPIRED_CHUNKS_PERIOD",
            config.scheduler.del_expired_period,
        )?;
        config.scheduler.rm_files_period =
            parse_period("REMOVING_FILES_PERIOD", config.scheduler.rm_files_period)?;

        Ok(config)
    }
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

fn require_env(key: &str) -> Result<String> {
    optional_env(key).ok_or_else(|| Error::bad_request(format!("{key} not specified")))
}

fn parse_count(key: &str, default: u8) -> Result<u8> {
    let Some(value) = optional_env(key) else {
        return Ok(default);
    };
    let count: u8 = value.parse().map_err(|_| {
        Error::bad_request(format!("{key} must be an integer from 0 to 255: {value}"))
    })?;
    Ok(if count == 0 { default } else { count })
}

fn parse_period(key: &str, default: Duration) -> Result<Duration> {
    let Some(value) = optional_env(key) else {
        return Ok(default);
    };
    time_range::parse_duration(&value)
        .map_err(|e| Error::bad_request(format!("{key} must be a period: {e}")))
}
