//! Configuration for the sync coordinator worker.
//!
//! Follows `pg_doorman`'s config module in spirit: a TOML file deserialized
//! into a typed struct, human-readable durations via [`Duration`], and every
//! field defaulted so an empty file is a valid config.

mod duration;

pub use duration::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Tuning knobs for every [`crate::runner::SyncRunner`] (§ SPEC_FULL
/// "Configuration"). `Copy` because runners are handed a value, not a
/// shared reference — there is no live-reload requirement in this system.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// How long the supervisor waits for a ping reply during host election
    /// before marking a candidate closed (§4.3 "Host election").
    #[serde(default = "RunnerConfig::default_ping_timeout")]
    pub ping_timeout: Duration,

    /// Fixed retry delay handed to the streaming-sync engine (§4.3.2 step 5).
    #[serde(default = "RunnerConfig::default_engine_retry_delay")]
    pub engine_retry_delay: Duration,

    /// Whether the engine's fetch transport is configured for CORS (§4.3.2
    /// step 5).
    #[serde(default = "RunnerConfig::default_fetch_cors")]
    pub fetch_cors: bool,

    /// Capacity of the worker-wide log broadcast channel (§4.2 "Log
    /// forwarding"); bounds how far a slow client can lag before it starts
    /// dropping records.
    #[serde(default = "RunnerConfig::default_log_channel_capacity")]
    pub log_channel_capacity: usize,
}

impl RunnerConfig {
    const fn default_ping_timeout() -> Duration {
        Duration::from_secs(5)
    }

    const fn default_engine_retry_delay() -> Duration {
        Duration::from_secs(3)
    }

    const fn default_fetch_cors() -> bool {
        true
    }

    const fn default_log_channel_capacity() -> usize {
        1024
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            ping_timeout: RunnerConfig::default_ping_timeout(),
            engine_retry_delay: RunnerConfig::default_engine_retry_delay(),
            fetch_cors: RunnerConfig::default_fetch_cors(),
            log_channel_capacity: RunnerConfig::default_log_channel_capacity(),
        }
    }
}

/// Top-level configuration file shape.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub runner: RunnerConfig,
}

impl Config {
    /// Load and parse a TOML config file (§ SPEC_FULL "Configuration").
    pub async fn load(path: &str) -> Result<Config, ConfigError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_string(),
                source,
            })?;
        toml::from_str(&contents).map_err(|err| ConfigError::Parse(err.to_string()))
    }
}
