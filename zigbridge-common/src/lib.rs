//! Zigbridge Common Library
//!
//! This crate provides shared types and utilities for the Zigbee to MQTT bridge:
//!
//! - [`config`] - Configuration loading (JSON5 format), MQTT and logging settings
//! - [`topic`] - Topic builders, parsers, and wildcard matching
//! - [`backoff`] - Exponential backoff with full jitter
//! - [`availability`] - Availability payloads
//! - [`error`] - Error types

pub mod availability;
pub mod backoff;
pub mod config;
pub mod error;
pub mod topic;

// Re-export commonly used types at the crate root
pub use availability::Availability;
pub use backoff::{Backoff, BackoffConfig};
pub use config::{BaseConfig, DEFAULT_BASE_TOPIC, LogFormat, LoggingConfig, MqttConfig, parse_config};
pub use error::{Error, Result};
pub use topic::{ParsedTopic, TopicBuilder, is_valid_device_name, parse_topic, topic_matches};

/// Initialize tracing with the given configuration.
///
/// Supports two output formats:
/// - `LogFormat::Text` (default): Human-readable text format
/// - `LogFormat::Json`: Structured JSON format for log aggregation systems
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
    }

    Ok(())
}
