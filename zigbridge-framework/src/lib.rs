//! Zigbridge Bridge Framework
//!
//! Bus-side abstractions for bridges that publish device state to MQTT.
//!
//! # Overview
//!
//! This framework provides:
//! - [`BridgeConfig`] trait for configuration loading and validation
//! - [`BridgeRunner`] for managing bridge lifecycle (startup, ordered shutdown, signal handling)
//! - [`BusClient`] for talking to the MQTT broker with automatic reconnection
//! - [`AvailabilityTracker`] for retained per-device availability
//! - [`BridgeArgs`] for common CLI argument parsing
//! - [`BridgeInfo`] for standardized status reporting
//!
//! # Example
//!
//! ```ignore
//! use zigbridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = BridgeArgs::parse_with_default("mybridge.json5");
//!     let config = MyBridgeConfig::load(&args.config)?;
//!
//!     let mut runner = BridgeRunner::new_with_args("mybridge", config, Some(&args)).await?;
//!
//!     let core = tokio::spawn(my_core(runner.publisher()));
//!
//!     // Run until Ctrl+C
//!     runner.run_until_shutdown(core, async {}).await?;
//!     Ok(())
//! }
//! ```

mod args;
mod availability;
mod bus;
mod config;
mod error;
mod runner;
mod status;

pub use args::BridgeArgs;
pub use availability::AvailabilityTracker;
pub use bus::{
    BusClient, BusMessage, BusPublisher, BusRequest, MemoryBus, OutboundPublish, SessionState,
    Subscription,
};
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use runner::BridgeRunner;
pub use status::{BridgeInfo, StatusPublisher};

// Re-export commonly used types from zigbridge-common
pub use zigbridge_common::{
    Availability, BackoffConfig, LogFormat, LoggingConfig, MqttConfig, ParsedTopic, TopicBuilder,
};
