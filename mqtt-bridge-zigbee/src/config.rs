//! Configuration for the Zigbee bridge.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use zigbridge_common::is_valid_device_name;
use zigbridge_framework::{
    BackoffConfig, BridgeConfig, BridgeError, LoggingConfig, MqttConfig, Result,
};

use crate::coordinator::FormRequest;
use crate::transport::LinkConfig;
use crate::types::{IeeeAddress, NetworkKey};

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZigbeeBridgeConfig {
    /// MQTT broker settings
    #[serde(default)]
    pub mqtt: MqttConfig,

    /// Radio adapter and network settings
    #[serde(default)]
    pub zigbee: ZigbeeConfig,

    /// Command transaction settings
    #[serde(default)]
    pub transactions: TransactionConfig,

    /// Per-device overrides keyed by IEEE address
    #[serde(default)]
    pub devices: HashMap<IeeeAddress, DeviceOverride>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Radio adapter and network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZigbeeConfig {
    /// Serial port of the adapter (e.g. "/dev/ttyACM0")
    #[serde(default = "default_port")]
    pub port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Radio channel (11-26)
    #[serde(default = "default_channel")]
    pub channel: u8,

    /// 16-bit PAN id; JSON5 hex literals such as 0x1a62 are accepted
    #[serde(default = "default_pan_id")]
    pub pan_id: u16,

    /// Extended PAN id as a hex string. Generated when forming if absent.
    #[serde(default)]
    pub extended_pan_id: Option<IeeeAddress>,

    /// Network key as 32 hex digits. Generated when forming if absent.
    #[serde(default)]
    pub network_key: Option<NetworkKey>,

    /// Directory holding network.json and devices.json
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Directory of per-model device definitions
    #[serde(default = "default_definitions_dir")]
    pub definitions_dir: PathBuf,

    /// Expected reporting interval; a device silent for three intervals is offline
    #[serde(default = "default_reporting_interval")]
    pub reporting_interval_secs: u64,

    /// How often silent devices are checked
    #[serde(default = "default_sweep_interval")]
    pub offline_sweep_secs: u64,

    /// Permit-join duration when a request does not name one
    #[serde(default = "default_permit_join")]
    pub permit_join_secs: u8,

    /// Adapter outage after which the bridge gives up
    #[serde(default = "default_max_outage")]
    pub max_outage_secs: u64,

    /// Reconnection backoff for the adapter and the broker
    #[serde(default)]
    pub reconnect: BackoffConfig,

    /// Capacity of the router intake queue
    #[serde(default = "default_intake_capacity")]
    pub intake_capacity: usize,
}

fn default_port() -> String {
    "/dev/ttyACM0".to_string()
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_channel() -> u8 {
    11
}

fn default_pan_id() -> u16 {
    0x1a62
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_definitions_dir() -> PathBuf {
    PathBuf::from("definitions")
}

fn default_reporting_interval() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_permit_join() -> u8 {
    60
}

fn default_max_outage() -> u64 {
    600
}

fn default_intake_capacity() -> usize {
    1024
}

impl Default for ZigbeeConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud_rate: default_baud_rate(),
            channel: default_channel(),
            pan_id: default_pan_id(),
            extended_pan_id: None,
            network_key: None,
            data_dir: default_data_dir(),
            definitions_dir: default_definitions_dir(),
            reporting_interval_secs: default_reporting_interval(),
            offline_sweep_secs: default_sweep_interval(),
            permit_join_secs: default_permit_join(),
            max_outage_secs: default_max_outage(),
            reconnect: BackoffConfig::default(),
            intake_capacity: default_intake_capacity(),
        }
    }
}

impl ZigbeeConfig {
    pub fn network_path(&self) -> PathBuf {
        self.data_dir.join("network.json")
    }

    pub fn devices_path(&self) -> PathBuf {
        self.data_dir.join("devices.json")
    }

    /// Silence after which a device is considered offline.
    pub fn offline_after(&self) -> chrono::Duration {
        chrono::Duration::seconds((self.reporting_interval_secs.saturating_mul(3)) as i64)
    }

    pub fn offline_sweep(&self) -> Duration {
        Duration::from_secs(self.offline_sweep_secs)
    }

    /// Formation request from the configured parameters.
    pub fn form_request(&self) -> FormRequest {
        FormRequest {
            channel: self.channel,
            pan_id: self.pan_id,
            extended_pan_id: self.extended_pan_id,
            network_key: self.network_key,
        }
    }

    /// The network is formed at startup only when every parameter is configured.
    pub fn auto_form(&self) -> Option<FormRequest> {
        (self.extended_pan_id.is_some() && self.network_key.is_some())
            .then(|| self.form_request())
    }

    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            port: self.port.clone(),
            baud_rate: self.baud_rate,
            backoff: self.reconnect,
            max_outage: Duration::from_secs(self.max_outage_secs),
        }
    }
}

/// Command transaction configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// Response deadline for devices that are always listening
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Response deadline for sleepy end devices
    #[serde(default = "default_sleepy_timeout_ms")]
    pub sleepy_timeout_ms: u64,

    /// Sends per transaction, counting the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u8,

    /// Delay between a timeout and the next send
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Age up to which a cached value answers a get request
    #[serde(default = "default_cache_max_age")]
    pub cache_max_age_secs: u64,
}

fn default_timeout_ms() -> u64 {
    3_000
}

fn default_sleepy_timeout_ms() -> u64 {
    10_000
}

fn default_max_attempts() -> u8 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_cache_max_age() -> u64 {
    60
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            sleepy_timeout_ms: default_sleepy_timeout_ms(),
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            cache_max_age_secs: default_cache_max_age(),
        }
    }
}

impl TransactionConfig {
    pub fn timeout(&self, sleepy: bool) -> Duration {
        Duration::from_millis(if sleepy {
            self.sleepy_timeout_ms
        } else {
            self.timeout_ms
        })
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn cache_max_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cache_max_age_secs as i64)
    }
}

/// Per-device settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceOverride {
    /// Name used in topics instead of the IEEE address
    #[serde(default)]
    pub friendly_name: Option<String>,
}

impl ZigbeeBridgeConfig {
    /// Friendly names by IEEE address.
    pub fn friendly_names(&self) -> HashMap<IeeeAddress, String> {
        self.devices
            .iter()
            .filter_map(|(ieee, o)| o.friendly_name.clone().map(|n| (*ieee, n)))
            .collect()
    }

    fn validate_zigbee(&self) -> std::result::Result<(), String> {
        let zigbee = &self.zigbee;
        if zigbee.port.trim().is_empty() {
            return Err("zigbee.port cannot be empty".to_string());
        }
        if zigbee.baud_rate == 0 {
            return Err("zigbee.baud_rate must be non-zero".to_string());
        }
        if !(11..=26).contains(&zigbee.channel) {
            return Err(format!("zigbee.channel {} must be 11-26", zigbee.channel));
        }
        if zigbee.pan_id == 0x0000 || zigbee.pan_id == 0xFFFF {
            return Err(format!("zigbee.pan_id 0x{:04x} is reserved", zigbee.pan_id));
        }
        if zigbee.reporting_interval_secs == 0 || zigbee.offline_sweep_secs == 0 {
            return Err(
                "zigbee.reporting_interval_secs and zigbee.offline_sweep_secs must be non-zero"
                    .to_string(),
            );
        }
        if zigbee.intake_capacity == 0 {
            return Err("zigbee.intake_capacity must be non-zero".to_string());
        }

        let tx = &self.transactions;
        if tx.max_attempts == 0 {
            return Err("transactions.max_attempts must be at least 1".to_string());
        }
        if tx.timeout_ms == 0 || tx.sleepy_timeout_ms == 0 {
            return Err("transactions timeouts must be non-zero".to_string());
        }

        let mut names = HashSet::new();
        for (ieee, device) in &self.devices {
            if let Some(name) = &device.friendly_name {
                if !is_valid_device_name(name) {
                    return Err(format!(
                        "Device {}: friendly_name '{}' cannot be used as a topic level",
                        ieee, name
                    ));
                }
                if name.parse::<IeeeAddress>().is_ok() {
                    return Err(format!(
                        "Device {}: friendly_name '{}' looks like an IEEE address",
                        ieee, name
                    ));
                }
                if !names.insert(name.as_str()) {
                    return Err(format!("Duplicate friendly_name '{}'", name));
                }
            }
        }
        Ok(())
    }
}

impl BridgeConfig for ZigbeeBridgeConfig {
    fn mqtt(&self) -> &MqttConfig {
        &self.mqtt
    }

    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    fn backoff(&self) -> BackoffConfig {
        self.zigbee.reconnect
    }

    fn validate(&self) -> Result<()> {
        self.mqtt
            .validate()
            .map_err(|e| BridgeError::validation(e.to_string()))?;
        self.validate_zigbee().map_err(BridgeError::validation)
    }
}
