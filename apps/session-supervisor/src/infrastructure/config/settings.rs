//! Supervisor Configuration Settings
//!
//! Configuration types for the session supervisor, loaded from environment
//! variables. Parsing goes through a lookup function so tests can supply
//! values without touching the process environment.

use std::path::PathBuf;
use std::time::Duration;

use chrono_tz::Tz;

use crate::application::services::{DEFAULT_POLL_INTERVAL, DEFAULT_TIMEZONE, SupervisorSettings};
use crate::domain::schedule::AccountId;
use crate::domain::subscription::{InstrumentId, SubscriptionMode};

/// Default streaming endpoint.
pub const DEFAULT_STREAM_URL: &str = "wss://ws.kite.trade";

/// Stream transport settings.
#[derive(Clone)]
pub struct StreamSettings {
    /// WebSocket base URL.
    pub url: String,
    api_key: String,
    /// Client ping interval.
    pub ping_interval: Duration,
    /// Silence after which the connection is considered dead.
    pub heartbeat_timeout: Duration,
    /// Handshake timeout.
    pub connect_timeout: Duration,
}

impl StreamSettings {
    /// Create settings with default timings.
    #[must_use]
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            ping_interval: Duration::from_secs(20),
            heartbeat_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Get the API key.
    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }
}

impl std::fmt::Debug for StreamSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSettings")
            .field("url", &self.url)
            .field("api_key", &"[REDACTED]")
            .field("ping_interval", &self.ping_interval)
            .field("heartbeat_timeout", &self.heartbeat_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

/// Channel capacities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSettings {
    /// Transport event channel capacity.
    pub event_capacity: usize,
    /// Tick broadcast channel capacity.
    pub tick_capacity: usize,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            event_capacity: 4096,
            tick_capacity: 10_000,
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSettings {
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// Complete supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Supervised account.
    pub account: AccountId,
    /// File the external login flow writes the access token to.
    pub token_file: PathBuf,
    /// Optional JSON schedule document; defaults are seeded when unset.
    pub schedule_file: Option<PathBuf>,
    /// Instruments subscribed at startup.
    pub instruments: Vec<InstrumentId>,
    /// Mode for startup instruments.
    pub subscription_mode: SubscriptionMode,
    /// Stream transport settings.
    pub stream: StreamSettings,
    /// Control loop settings.
    pub supervisor: SupervisorSettings,
    /// Server port settings.
    pub server: ServerSettings,
    /// Channel capacities.
    pub channels: ChannelSettings,
}

impl SupervisorConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or a
    /// value cannot be interpreted.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Same as [`SupervisorConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let account = AccountId::new(env.required("SUPERVISOR_ACCOUNT_ID")?);
        let api_key = env.required("STREAM_API_KEY")?;
        let token_file = PathBuf::from(env.required("STREAM_TOKEN_FILE")?);

        let mut stream = StreamSettings::new(
            env.get("STREAM_URL")
                .unwrap_or_else(|| DEFAULT_STREAM_URL.to_string()),
            api_key,
        );
        stream.ping_interval = env.duration_secs("STREAM_PING_INTERVAL_SECS", stream.ping_interval);
        stream.heartbeat_timeout =
            env.duration_secs("STREAM_HEARTBEAT_TIMEOUT_SECS", stream.heartbeat_timeout);
        stream.connect_timeout =
            env.duration_secs("STREAM_CONNECT_TIMEOUT_SECS", stream.connect_timeout);

        let poll_interval = env.duration_secs("SUPERVISOR_POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL);
        if poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "SUPERVISOR_POLL_INTERVAL_SECS".to_string(),
                reason: "must be at least one second".to_string(),
            });
        }

        let timezone = match env.get("SUPERVISOR_TIMEZONE") {
            Some(name) => name.trim().parse::<Tz>().map_err(|_| ConfigError::InvalidValue {
                key: "SUPERVISOR_TIMEZONE".to_string(),
                reason: format!("unknown IANA timezone '{name}'"),
            })?,
            None => DEFAULT_TIMEZONE,
        };

        let instruments = env
            .get("SUPERVISOR_INSTRUMENTS")
            .map(|raw| parse_instruments(&raw))
            .transpose()?
            .unwrap_or_default();

        let subscription_mode = env
            .get("SUPERVISOR_SUBSCRIPTION_MODE")
            .map(|s| SubscriptionMode::from_str_case_insensitive(&s))
            .unwrap_or_default();

        let server = ServerSettings {
            health_port: env.parse_or("SUPERVISOR_HEALTH_PORT", ServerSettings::default().health_port),
        };

        let channels = ChannelSettings {
            event_capacity: env.parse_or(
                "SUPERVISOR_EVENT_CHANNEL_CAPACITY",
                ChannelSettings::default().event_capacity,
            ),
            tick_capacity: env.parse_or(
                "SUPERVISOR_TICK_CHANNEL_CAPACITY",
                ChannelSettings::default().tick_capacity,
            ),
        };

        Ok(Self {
            account,
            token_file,
            schedule_file: env.get("SUPERVISOR_SCHEDULE_FILE").map(PathBuf::from),
            instruments,
            subscription_mode,
            stream,
            supervisor: SupervisorSettings {
                poll_interval,
                timezone,
            },
            server,
            channels,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable could not be interpreted.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// What was wrong with it.
        reason: String,
    },
}

fn parse_instruments(raw: &str) -> Result<Vec<InstrumentId>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<InstrumentId>()
                .map_err(|e| ConfigError::InvalidValue {
                    key: "SUPERVISOR_INSTRUMENTS".to_string(),
                    reason: format!("'{s}': {e}"),
                })
        })
        .collect()
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        let value = (self.0)(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))?;
        if value.trim().is_empty() {
            return Err(ConfigError::EmptyValue(key.to_string()));
        }
        Ok(value.trim().to_string())
    }

    fn parse_or<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn duration_secs(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }
}
