//! Configuration Module
//!
//! Configuration loading for the session supervisor.

mod settings;

pub use settings::{
    ChannelSettings, ConfigError, DEFAULT_STREAM_URL, ServerSettings, StreamSettings,
    SupervisorConfig,
};
