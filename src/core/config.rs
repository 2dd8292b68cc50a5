//! Configuration management for racenet
//!
//! Every tunable of a session is a field here and is handed to the session at
//! construction, so independent sessions can run side by side in one process.

use crate::constants::{
    DEFAULT_CHANNEL_LABEL, DEFAULT_HEARTBEAT_INTERVAL_SECS, DEFAULT_ICE_SERVERS,
    DEFAULT_LIVENESS_WINDOW_MS, DEFAULT_MAX_SERVER_AGE_SECS, DEFAULT_TICK_RATE_HZ,
};
use crate::core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Session tunables
    #[serde(default)]
    pub session: SessionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Demo binary settings
    #[serde(default)]
    pub demo: DemoConfig,
}

/// Timing and topology tunables of one session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Broadcast / uplink period
    #[serde(with = "duration_str")]
    pub tick_interval: Duration,

    /// Period of the host's inactivity sweep
    #[serde(with = "duration_str")]
    pub inactivity_check_interval: Duration,

    /// A RemoteObject is active while its last update is younger than this
    #[serde(with = "duration_str")]
    pub liveness_window: Duration,

    /// ServerRecords at least this old are ignored by discovery
    #[serde(with = "duration_str")]
    pub max_server_age: Duration,

    /// How often a host refreshes its ServerRecord
    #[serde(with = "duration_str")]
    pub heartbeat_interval: Duration,

    /// Pause between a disconnect and the next discovery attempt
    #[serde(with = "duration_str")]
    pub rediscover_delay: Duration,

    /// How long a client waits for a lost host link to come back before it
    /// gives up on that host
    #[serde(with = "duration_str")]
    pub host_unreachable_grace: Duration,

    /// Let an idle host step down in favour of a fresher rival record
    pub yield_to_fresher_host: bool,

    /// Label of the data channel opened by the initiator
    pub channel_label: String,

    /// ICE servers handed to real transports
    pub ice_servers: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (compact, pretty)
    pub format: String,

    /// Log file path (None = stdout)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

/// Settings for the bundled demo binary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    /// Number of simulated nodes
    pub nodes: usize,

    /// How long the simulation runs
    #[serde(with = "duration_str")]
    pub duration: Duration,

    /// Delay between node start-ups
    #[serde(with = "duration_str")]
    pub stagger: Duration,

    /// Print Prometheus metrics on exit
    pub print_metrics: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(1000 / DEFAULT_TICK_RATE_HZ),
            inactivity_check_interval: Duration::from_secs(1),
            liveness_window: Duration::from_millis(DEFAULT_LIVENESS_WINDOW_MS),
            max_server_age: Duration::from_secs(DEFAULT_MAX_SERVER_AGE_SECS),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            rediscover_delay: Duration::from_secs(1),
            host_unreachable_grace: Duration::from_secs(10),
            yield_to_fresher_host: true,
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
            file: None,
        }
    }
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            nodes: 3,
            duration: Duration::from_secs(5),
            stagger: Duration::from_millis(200),
            print_metrics: false,
        }
    }
}

impl SessionConfig {
    /// Liveness window in milliseconds
    pub fn liveness_window_ms(&self) -> u64 {
        self.liveness_window.as_millis() as u64
    }

    /// Maximum server age in milliseconds
    pub fn max_server_age_ms(&self) -> u64 {
        self.max_server_age.as_millis() as u64
    }

    /// Validate timing relationships
    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("tick_interval", self.tick_interval),
            ("inactivity_check_interval", self.inactivity_check_interval),
            ("liveness_window", self.liveness_window),
            ("max_server_age", self.max_server_age),
            ("heartbeat_interval", self.heartbeat_interval),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(Error::config(format!("{} must be non-zero", name)));
            }
        }

        if self.liveness_window <= self.tick_interval {
            return Err(Error::config("liveness_window must be longer than tick_interval"));
        }

        // A host must refresh its record before discovery considers it stale
        if self.heartbeat_interval >= self.max_server_age {
            return Err(Error::config("heartbeat_interval must be shorter than max_server_age"));
        }

        if self.channel_label.is_empty() {
            return Err(Error::config("channel_label must not be empty"));
        }

        Ok(())
    }
}

impl Config {
    /// Load configuration from `racenet.toml` (if present) and environment variables
    pub fn load() -> Result<Self> {
        let mut config = Config::default();

        if let Ok(file_config) = Self::from_file("racenet.toml") {
            config = file_config;
        }

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&contents)
            .map_err(|e| Error::config(format!("Failed to parse config file: {}", e)))
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        use std::env;

        if let Ok(v) = env::var("RACENET_TICK_INTERVAL") {
            self.session.tick_interval = parse_duration(&v)
                .map_err(|e| Error::config(format!("Invalid tick interval: {}", e)))?;
        }

        if let Ok(v) = env::var("RACENET_MAX_SERVER_AGE") {
            self.session.max_server_age = parse_duration(&v)
                .map_err(|e| Error::config(format!("Invalid max server age: {}", e)))?;
        }

        if let Ok(v) = env::var("RACENET_HEARTBEAT_INTERVAL") {
            self.session.heartbeat_interval = parse_duration(&v)
                .map_err(|e| Error::config(format!("Invalid heartbeat interval: {}", e)))?;
        }

        if let Ok(v) = env::var("RACENET_LIVENESS_WINDOW") {
            self.session.liveness_window = parse_duration(&v)
                .map_err(|e| Error::config(format!("Invalid liveness window: {}", e)))?;
        }

        if let Ok(level) = env::var("RACENET_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(format) = env::var("RACENET_LOG_FORMAT") {
            self.logging.format = format;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        self.session.validate()?;

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => return Err(Error::config("Invalid log level")),
        }

        if self.demo.nodes == 0 {
            return Err(Error::config("demo.nodes must be at least 1"));
        }

        Ok(())
    }
}

/// Human-readable duration strings (`"50ms"`, `"30s"`, `"5m"`, `"1h"`)
pub mod duration_str {
    use super::parse_duration;
    use serde::de::{self, Deserializer, Visitor};
    use serde::Serializer;
    use std::fmt;
    use std::time::Duration;

    /// Serialize as the shortest exact unit
    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let ms = value.as_millis();
        let text = if ms % 1000 != 0 {
            format!("{}ms", ms)
        } else if ms % 60_000 != 0 {
            format!("{}s", ms / 1000)
        } else {
            format!("{}m", ms / 60_000)
        };
        serializer.serialize_str(&text)
    }

    /// Deserialize from a duration string or a bare number of seconds
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DurationVisitor;

        impl<'de> Visitor<'de> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a duration string like '50ms', '30s' or '5m'")
            }

            fn visit_str<E>(self, value: &str) -> Result<Duration, E>
            where
                E: de::Error,
            {
                parse_duration(value).map_err(E::custom)
            }

            fn visit_u64<E>(self, value: u64) -> Result<Duration, E>
            where
                E: de::Error,
            {
                Ok(Duration::from_secs(value))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Duration, E>
            where
                E: de::Error,
            {
                u64::try_from(value)
                    .map(Duration::from_secs)
                    .map_err(|_| E::custom("duration must not be negative"))
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}

/// Simple duration parser for common formats
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        let ms: u64 = ms.parse().map_err(|_| "Invalid milliseconds")?;
        Ok(Duration::from_millis(ms))
    } else if let Some(secs) = s.strip_suffix('s') {
        let secs: u64 = secs.parse().map_err(|_| "Invalid seconds")?;
        Ok(Duration::from_secs(secs))
    } else if let Some(mins) = s.strip_suffix('m') {
        let mins: u64 = mins.parse().map_err(|_| "Invalid minutes")?;
        Ok(Duration::from_secs(mins * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        let hours: u64 = hours.parse().map_err(|_| "Invalid hours")?;
        Ok(Duration::from_secs(hours * 3600))
    } else {
        // Try parsing as raw seconds
        let secs: u64 = s.parse().map_err(|_| "Invalid duration format")?;
        Ok(Duration::from_secs(secs))
    }
}
