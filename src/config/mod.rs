//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::util::time::{TimeMs, DEFAULT_TICK_RATE};

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Allowed CORS origins (comma-separated)
    pub client_origin: String,
    /// Simulation ticks per second
    pub tick_rate: u32,
    /// Maximum participants per session
    pub max_participants: usize,
    /// Tunables handed to every engine context
    pub engine: EngineConfig,
}

/// Engine tunables. Passed by value into each context; nothing reads them
/// from process-wide state.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    /// Fire queue retransmit interval
    pub fire_queue_drain_ms: TimeMs,
    /// Upper bound on latency covered by rewind / fast-forward
    pub max_prediction_ping_ms: TimeMs,
    /// Latency assumed to be absorbed by interpolation, subtracted before predicting
    pub prediction_fudge_ms: TimeMs,
    /// Window in which a stop right after a start is deferred until the first shot
    pub tap_grace_ms: TimeMs,
    /// Extra acceptance distance for targets the controller reported hitting
    pub hit_padding: f32,
    /// Log client/authority hit disagreements
    pub debug_hit_mismatch: bool,
    /// Allow hitting teammates
    pub friendly_fire: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fire_queue_drain_ms: 40,
            max_prediction_ping_ms: 120,
            prediction_fudge_ms: 20,
            tap_grace_ms: 120,
            hit_padding: 10.0,
            debug_hit_mismatch: false,
            friendly_fire: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Hosting platforms provide PORT, fall back to SERVER_ADDR or default
        let server_addr = match lookup("PORT") {
            Some(port) => format!("0.0.0.0:{}", port),
            None => lookup("SERVER_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
        };

        let defaults = EngineConfig::default();
        let engine = EngineConfig {
            fire_queue_drain_ms: parse_or(&lookup, "FIRE_QUEUE_DRAIN_MS", defaults.fire_queue_drain_ms)?,
            max_prediction_ping_ms: parse_or(
                &lookup,
                "MAX_PREDICTION_PING_MS",
                defaults.max_prediction_ping_ms,
            )?,
            prediction_fudge_ms: parse_or(&lookup, "PREDICTION_FUDGE_MS", defaults.prediction_fudge_ms)?,
            tap_grace_ms: parse_or(&lookup, "TAP_GRACE_MS", defaults.tap_grace_ms)?,
            hit_padding: parse_or(&lookup, "HIT_PADDING", defaults.hit_padding)?,
            debug_hit_mismatch: parse_or(&lookup, "DEBUG_HIT_MISMATCH", defaults.debug_hit_mismatch)?,
            friendly_fire: parse_or(&lookup, "FRIENDLY_FIRE", defaults.friendly_fire)?,
        };

        if engine.fire_queue_drain_ms == 0 {
            return Err(ConfigError::Invalid("FIRE_QUEUE_DRAIN_MS"));
        }

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            client_origin: lookup("CLIENT_ORIGIN").unwrap_or_else(|| "http://localhost:3000".to_string()),
            tick_rate: parse_or(&lookup, "TICK_RATE", DEFAULT_TICK_RATE)?,
            max_participants: parse_or(&lookup, "MAX_PARTICIPANTS", 16)?,
            engine,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(key)),
        None => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,
}
