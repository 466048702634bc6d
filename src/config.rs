//! Environment-driven configuration for the fetch activity and the host.
//!
//! Every value has a default. Values that fail to parse fall back to the
//! default and are reported through [`HostConfig::warnings`] so the binary
//! can log them once logging is up.

use std::fmt;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use rand::Rng;

use crate::logging::{LogFormat, LoggingConfig};
use crate::orchestrations::DEFAULT_MAX_PARALLELISM;

pub const MIN_DELAY_VAR: &str = "DEMO_MIN_DELAY_SECONDS";
pub const MAX_DELAY_VAR: &str = "DEMO_MAX_DELAY_SECONDS";
pub const BIND_ADDR_VAR: &str = "FANOUT_BIND_ADDR";
pub const DATA_DIR_VAR: &str = "FANOUT_DATA_DIR";
pub const MAX_PARALLELISM_VAR: &str = "FANOUT_MAX_PARALLELISM";
pub const ACTIVITY_TIMEOUT_VAR: &str = "FANOUT_ACTIVITY_TIMEOUT_SECONDS";
pub const LOG_FORMAT_VAR: &str = "FANOUT_LOG_FORMAT";
pub const LOG_LEVEL_VAR: &str = "FANOUT_LOG_LEVEL";

pub const DEFAULT_MIN_DELAY_SECONDS: u64 = 20;
pub const DEFAULT_MAX_DELAY_SECONDS: u64 = 60;
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:7071";

/// A configuration value that could not be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub key: String,
    pub value: String,
    pub reason: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={:?}: {}", self.key, self.value, self.reason)
    }
}

impl std::error::Error for ConfigError {}

/// Parse `key` via `lookup`. Unset or blank is `Ok(None)`.
fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed.parse::<T>().map(Some).map_err(|e| ConfigError {
        key: key.to_string(),
        value: raw.clone(),
        reason: e.to_string(),
    })
}

/// `parse_var` that records the error and yields `None` instead.
fn lenient<T, F>(lookup: &F, key: &str, warnings: &mut Vec<ConfigError>) -> Option<T>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    parse_var(lookup, key).unwrap_or_else(|e| {
        warnings.push(e);
        None
    })
}

/// Delay range of the fetch activity, in whole seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityConfig {
    pub min_delay_seconds: u64,
    pub max_delay_seconds: u64,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            min_delay_seconds: DEFAULT_MIN_DELAY_SECONDS,
            max_delay_seconds: DEFAULT_MAX_DELAY_SECONDS,
        }
    }
}

impl ActivityConfig {
    /// No delay at all; for tests and local runs.
    pub fn immediate() -> Self {
        Self {
            min_delay_seconds: 0,
            max_delay_seconds: 0,
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from a key lookup. Unparseable values use the defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut ignored = Vec::new();
        Self::from_lookup_with_warnings(&lookup, &mut ignored)
    }

    fn from_lookup_with_warnings<F>(lookup: &F, warnings: &mut Vec<ConfigError>) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            min_delay_seconds: lenient(lookup, MIN_DELAY_VAR, warnings).unwrap_or(defaults.min_delay_seconds),
            max_delay_seconds: lenient(lookup, MAX_DELAY_VAR, warnings).unwrap_or(defaults.max_delay_seconds),
        }
    }

    /// Inclusive delay range. A maximum below the minimum collapses to the minimum.
    pub fn delay_range(&self) -> RangeInclusive<u64> {
        self.min_delay_seconds..=self.max_delay_seconds.max(self.min_delay_seconds)
    }

    /// Draw one delay uniformly from [`Self::delay_range`].
    pub fn sample_delay(&self) -> Duration {
        Duration::from_secs(rand::thread_rng().gen_range(self.delay_range()))
    }
}

/// Settings of the `durable-fanout` binary.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub bind_addr: SocketAddr,
    /// Directory of the file-backed store; in-memory when unset.
    pub data_dir: Option<PathBuf>,
    /// Batch size for requests that do not name one.
    pub max_parallelism: i64,
    pub activity_timeout: Option<Duration>,
    pub logging: LoggingConfig,
    pub activity: ActivityConfig,
    /// Values that were set but ignored.
    pub warnings: Vec<ConfigError>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl HostConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut warnings = Vec::new();
        let default_addr = SocketAddr::from(([127, 0, 0, 1], 7071));

        let bind_addr = lenient(&lookup, BIND_ADDR_VAR, &mut warnings).unwrap_or(default_addr);
        let data_dir = lookup(DATA_DIR_VAR)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        let max_parallelism = match lenient::<i64, _>(&lookup, MAX_PARALLELISM_VAR, &mut warnings) {
            Some(k) if k >= 1 => k,
            Some(k) => {
                warnings.push(ConfigError {
                    key: MAX_PARALLELISM_VAR.to_string(),
                    value: k.to_string(),
                    reason: "must be >= 1".to_string(),
                });
                DEFAULT_MAX_PARALLELISM
            }
            None => DEFAULT_MAX_PARALLELISM,
        };

        let activity_timeout = match lenient::<u64, _>(&lookup, ACTIVITY_TIMEOUT_VAR, &mut warnings) {
            Some(0) | None => None,
            Some(secs) => Some(Duration::from_secs(secs)),
        };

        let mut logging = LoggingConfig::default();
        if let Some(raw) = lookup(LOG_FORMAT_VAR).filter(|v| !v.trim().is_empty()) {
            match LogFormat::parse(&raw) {
                Some(format) => logging.format = format,
                None => warnings.push(ConfigError {
                    key: LOG_FORMAT_VAR.to_string(),
                    value: raw,
                    reason: "expected json, pretty or compact".to_string(),
                }),
            }
        }
        if let Some(level) = lookup(LOG_LEVEL_VAR).filter(|v| !v.trim().is_empty()) {
            logging.level = level.trim().to_string();
        }

        let activity = ActivityConfig::from_lookup_with_warnings(&lookup, &mut warnings);

        Self {
            bind_addr,
            data_dir,
            max_parallelism,
            activity_timeout,
            logging,
            activity,
            warnings,
        }
    }
}
