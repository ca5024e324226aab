//! Core data model: addresses, devices, endpoints, and the formed network.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::coordinator::JoinError;

/// 64-bit IEEE radio address. Immutable for a device's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IeeeAddress(pub u64);

impl fmt::Display for IeeeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

impl FromStr for IeeeAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hex_u64(s).map(Self)
    }
}

impl Serialize for IeeeAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IeeeAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// 16-bit network short address. Reassignable on every join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShortAddress(pub u16);

impl ShortAddress {
    /// The coordinator always owns 0x0000.
    pub const COORDINATOR: Self = Self(0x0000);
    /// Lowest address handed to joining devices.
    pub const FIRST_ASSIGNABLE: Self = Self(0x0001);
    /// Highest address handed to joining devices; above it are broadcast addresses.
    pub const LAST_ASSIGNABLE: Self = Self(0xFFF7);
    /// Marks a device whose address was taken over by another device.
    pub const UNASSIGNED: Self = Self(0xFFFF);

    /// Whether this address may be owned by a device.
    pub fn is_assignable(self) -> bool {
        (Self::FIRST_ASSIGNABLE.0..=Self::LAST_ASSIGNABLE.0).contains(&self.0)
    }
}

impl fmt::Display for ShortAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

/// Parse a hex string with optional `0x` prefix.
pub fn parse_hex_u64(s: &str) -> Result<u64, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    if digits.is_empty() || digits.len() > 16 {
        return Err(format!("'{}' is not a 64-bit hex value", s));
    }
    u64::from_str_radix(digits, 16).map_err(|e| format!("'{}' is not a hex value: {}", s, e))
}

/// 128-bit network security key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct NetworkKey(pub [u8; 16]);

impl NetworkKey {
    /// Generate a random key.
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Hex representation, as persisted.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Debug for NetworkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NetworkKey(<redacted>)")
    }
}

impl FromStr for NetworkKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        if digits.len() != 32 || !digits.is_ascii() {
            return Err("network key must be 32 hex digits".to_string());
        }
        let mut key = [0u8; 16];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&digits[i * 2..i * 2 + 2], 16)
                .map_err(|e| format!("invalid network key: {}", e))?;
        }
        Ok(Self(key))
    }
}

impl Serialize for NetworkKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NetworkKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Parameters identifying a formed network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkParams {
    pub channel: u8,
    pub pan_id: u16,
    pub extended_pan_id: IeeeAddress,
    pub network_key: NetworkKey,
}

/// The formed network. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    #[serde(flatten)]
    pub params: NetworkParams,
    /// Short address of the coordinator.
    pub coordinator: ShortAddress,
    pub formed_at: DateTime<Utc>,
}

/// Per-device commissioning state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommissioningState {
    Unjoined,
    Joining,
    Authenticating,
    Active,
    Offline,
    Leaving,
    Removed,
}

impl CommissioningState {
    /// Whether `self -> to` is a legal transition.
    pub fn can_transition(self, to: Self) -> bool {
        use CommissioningState::*;
        matches!(
            (self, to),
            (Unjoined, Joining)
                | (Joining, Authenticating)
                | (Joining, Unjoined)
                | (Authenticating, Active)
                | (Authenticating, Unjoined)
                | (Active, Offline)
                | (Offline, Active)
                // Rejoin of a commissioned device.
                | (Active, Joining)
                | (Offline, Joining)
                | (Active, Leaving)
                | (Offline, Leaving)
                // A leaving device only moves on to removal, even if it is
                // heard from again before its address is revoked.
                | (Leaving, Removed)
        )
    }

    /// Commissioned and part of the network.
    pub fn is_commissioned(self) -> bool {
        matches!(self, Self::Active | Self::Offline)
    }
}

impl fmt::Display for CommissioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unjoined => "unjoined",
            Self::Joining => "joining",
            Self::Authenticating => "authenticating",
            Self::Active => "active",
            Self::Offline => "offline",
            Self::Leaving => "leaving",
            Self::Removed => "removed",
        };
        f.write_str(s)
    }
}

/// A cached attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedAttribute {
    pub value: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

/// An application endpoint on a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: u8,
    pub profile_id: u16,
    pub device_id: u16,
    /// Server clusters.
    pub in_clusters: Vec<u16>,
    /// Attribute cache keyed by state field name.
    #[serde(default)]
    pub attributes: BTreeMap<String, CachedAttribute>,
}

impl Endpoint {
    pub fn new(id: u8, profile_id: u16, device_id: u16, in_clusters: Vec<u16>) -> Self {
        Self {
            id,
            profile_id,
            device_id,
            in_clusters,
            attributes: BTreeMap::new(),
        }
    }

    pub fn has_cluster(&self, cluster: u16) -> bool {
        self.in_clusters.contains(&cluster)
    }
}

/// MAC capability flags sent with a join request.
pub mod capability {
    pub const ALTERNATE_PAN_COORDINATOR: u8 = 0x01;
    pub const FULL_FUNCTION_DEVICE: u8 = 0x02;
    pub const MAINS_POWERED: u8 = 0x04;
    pub const RECEIVER_ON_WHEN_IDLE: u8 = 0x08;
    pub const RESERVED: u8 = 0x30;
    pub const SECURITY_CAPABLE: u8 = 0x40;
    pub const ALLOCATE_ADDRESS: u8 = 0x80;
}

/// A known device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub ieee: IeeeAddress,
    pub nwk: ShortAddress,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub friendly_name: Option<String>,
    #[serde(default)]
    pub capabilities: u8,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub online: bool,
    pub state: CommissioningState,
    #[serde(default)]
    pub last_command_failed: bool,
}

impl Device {
    /// A device that has just asked to join.
    pub fn new(ieee: IeeeAddress, nwk: ShortAddress, capabilities: u8) -> Self {
        Self {
            ieee,
            nwk,
            manufacturer: None,
            model: None,
            friendly_name: None,
            capabilities,
            endpoints: Vec::new(),
            last_seen: None,
            online: false,
            state: CommissioningState::Unjoined,
            last_command_failed: false,
        }
    }

    /// Name used in topics: the friendly name, else the IEEE address.
    pub fn name(&self) -> String {
        self.friendly_name
            .clone()
            .unwrap_or_else(|| self.ieee.to_string())
    }

    /// Sleepy end devices turn their receiver off when idle.
    pub fn is_sleepy(&self) -> bool {
        self.capabilities & capability::RECEIVER_ON_WHEN_IDLE == 0
    }

    pub fn endpoint(&self, id: u8) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| e.id == id)
    }

    pub fn endpoint_mut(&mut self, id: u8) -> Option<&mut Endpoint> {
        self.endpoints.iter_mut().find(|e| e.id == id)
    }

    /// First endpoint serving a cluster.
    pub fn endpoint_for_cluster(&self, cluster: u16) -> Option<u8> {
        self.endpoints
            .iter()
            .find(|e| e.has_cluster(cluster))
            .map(|e| e.id)
    }

    /// Move to a new commissioning state.
    pub fn transition(&mut self, to: CommissioningState) -> Result<(), JoinError> {
        if !self.state.can_transition(to) {
            return Err(JoinError::InvalidTransition {
                ieee: self.ieee,
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// Aggregated state document across all endpoints.
    pub fn state_document(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut doc = serde_json::Map::new();
        for endpoint in &self.endpoints {
            for (field, cached) in &endpoint.attributes {
                doc.insert(field.clone(), cached.value.clone());
            }
        }
        doc
    }

    /// Summary published in the bridge device list.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "ieee_address": self.ieee.to_string(),
            "network_address": self.nwk.0,
            "friendly_name": self.name(),
            "manufacturer": self.manufacturer,
            "model": self.model,
            "state": self.state.to_string(),
            "online": self.online,
            "last_seen": self.last_seen,
            "endpoints": self.endpoints.iter().map(|e| serde_json::json!({
                "id": e.id,
                "profile_id": e.profile_id,
                "device_id": e.device_id,
                "clusters": e.in_clusters,
            })).collect::<Vec<_>>(),
        })
    }
}
