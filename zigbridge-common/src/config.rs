use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default base topic under which every bridge topic lives.
pub const DEFAULT_BASE_TOPIC: &str = "zigbee2mqtt";

/// MQTT broker connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker host name or IP address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Broker port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Client identifier. Generated from the base topic when absent.
    #[serde(default)]
    pub client_id: Option<String>,

    /// Username for broker authentication.
    #[serde(default)]
    pub username: Option<String>,

    /// Password for broker authentication.
    #[serde(default)]
    pub password: Option<String>,

    /// Keep-alive interval in seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Base topic for every published and subscribed topic.
    #[serde(default = "default_base_topic")]
    pub base_topic: String,

    /// How long startup waits for the first broker connection.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Publishes held while disconnected before new ones are rejected.
    #[serde(default = "default_max_queued")]
    pub max_queued_publishes: usize,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    1883
}

fn default_keep_alive() -> u64 {
    60
}

fn default_base_topic() -> String {
    DEFAULT_BASE_TOPIC.to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_max_queued() -> usize {
    1000
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            client_id: None,
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive(),
            base_topic: default_base_topic(),
            connect_timeout_secs: default_connect_timeout(),
            max_queued_publishes: default_max_queued(),
        }
    }
}

impl MqttConfig {
    /// Client identifier, falling back to one derived from the base topic.
    pub fn client_id(&self) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("{}-bridge", self.base_topic.replace('/', "-")))
    }

    /// Get the full broker address.
    pub fn broker_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check the connection settings for values the broker would reject.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Config("mqtt.host cannot be empty".to_string()));
        }
        if self.port == 0 {
            return Err(Error::Config("mqtt.port must be non-zero".to_string()));
        }
        if self.base_topic.is_empty()
            || self.base_topic.contains(['+', '#'])
            || self.base_topic.ends_with('/')
        {
            return Err(Error::Config(format!(
                "mqtt.base_topic '{}' must be a non-empty topic without wildcards or trailing '/'",
                self.base_topic
            )));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(Error::Config(
                "mqtt.password requires mqtt.username".to_string(),
            ));
        }
        if self.keep_alive_secs < 5 {
            return Err(Error::Config(
                "mqtt.keep_alive_secs must be at least 5".to_string(),
            ));
        }
        Ok(())
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format (default).
    #[default]
    Text,
    /// Structured JSON format.
    Json,
}

/// Common logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Base configuration shared by every bridge binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BaseConfig {
    /// MQTT connection settings.
    #[serde(default)]
    pub mqtt: MqttConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Load a configuration from a JSON5 string.
pub fn parse_config<T: for<'de> Deserialize<'de>>(content: &str) -> Result<T> {
    json5::from_str(content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
}
