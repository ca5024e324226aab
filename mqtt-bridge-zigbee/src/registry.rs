//! Device registry.
//!
//! Authoritative record of known devices, persisted to `devices.json` keyed by
//! IEEE address. Every mutation rewrites the file atomically. A failed write
//! leaves the registry dirty; the next mutation (or [`Registry::flush`])
//! retries it.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::persist;
use crate::types::{CachedAttribute, CommissioningState, Device, IeeeAddress, ShortAddress};

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Failed to persist registry to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to load registry from {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Ways to look a device up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRef<'a> {
    Ieee(IeeeAddress),
    Nwk(ShortAddress),
    /// Friendly name, or an IEEE address in its string form.
    Name(&'a str),
}

impl std::fmt::Display for DeviceRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceRef::Ieee(ieee) => write!(f, "{}", ieee),
            DeviceRef::Nwk(nwk) => write!(f, "{}", nwk),
            DeviceRef::Name(name) => f.write_str(name),
        }
    }
}

/// The device registry.
#[derive(Debug)]
pub struct Registry {
    devices: BTreeMap<IeeeAddress, Device>,
    by_nwk: HashMap<ShortAddress, IeeeAddress>,
    path: Option<PathBuf>,
    offline_after: chrono::Duration,
    dirty: bool,
}

impl Registry {
    /// Registry that never touches the disk.
    pub fn in_memory(offline_after: chrono::Duration) -> Self {
        Self {
            devices: BTreeMap::new(),
            by_nwk: HashMap::new(),
            path: None,
            offline_after,
            dirty: false,
        }
    }

    /// Load the registry from `path`, starting empty if the file does not exist.
    pub fn open(
        path: impl Into<PathBuf>,
        offline_after: chrono::Duration,
    ) -> Result<Self, RegistryError> {
        let path = path.into();
        let devices: BTreeMap<IeeeAddress, Device> = persist::read_json(&path)
            .map_err(|source| RegistryError::Load {
                path: path.clone(),
                source,
            })?
            .unwrap_or_default();

        let mut registry = Self {
            devices: BTreeMap::new(),
            by_nwk: HashMap::new(),
            path: Some(path),
            offline_after,
            dirty: false,
        };
        for (_, device) in devices {
            registry.insert_indexed(device);
        }

        info!(
            devices = registry.devices.len(),
            path = %registry.path_display(),
            "Device registry loaded"
        );
        Ok(registry)
    }

    fn path_display(&self) -> String {
        self.path
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<memory>".to_string())
    }

    /// Persistence file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Threshold after which a silent device counts as offline.
    pub fn offline_after(&self) -> chrono::Duration {
        self.offline_after
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Whether a previous write failed and has not been retried successfully.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Insert or replace a device.
    ///
    /// If another device held the same short address it loses it and goes
    /// offline; its IEEE address is returned.
    pub fn upsert(&mut self, device: Device) -> Result<Option<IeeeAddress>, RegistryError> {
        let displaced = self.insert_indexed(device);
        self.persist()?;
        Ok(displaced)
    }

    fn insert_indexed(&mut self, device: Device) -> Option<IeeeAddress> {
        let ieee = device.ieee;
        let nwk = device.nwk;

        if let Some(previous) = self.devices.get(&ieee) {
            if previous.nwk != nwk && self.by_nwk.get(&previous.nwk) == Some(&ieee) {
                self.by_nwk.remove(&previous.nwk);
            }
        }

        let mut displaced = None;
        if nwk != ShortAddress::UNASSIGNED {
            if let Some(holder) = self.by_nwk.insert(nwk, ieee) {
                if holder != ieee {
                    if let Some(other) = self.devices.get_mut(&holder) {
                        warn!(
                            nwk = %nwk,
                            previous = %holder,
                            new = %ieee,
                            "Short address reassigned"
                        );
                        other.nwk = ShortAddress::UNASSIGNED;
                        other.online = false;
                    }
                    displaced = Some(holder);
                }
            }
        }

        self.devices.insert(ieee, device);
        displaced
    }

    /// Look a device up.
    pub fn get(&self, by: DeviceRef<'_>) -> Result<&Device, RegistryError> {
        let found = match by {
            DeviceRef::Ieee(ieee) => self.devices.get(&ieee),
            DeviceRef::Nwk(nwk) => self.by_nwk.get(&nwk).and_then(|i| self.devices.get(i)),
            DeviceRef::Name(name) => self
                .devices
                .values()
                .find(|d| d.friendly_name.as_deref() == Some(name))
                .or_else(|| {
                    name.parse::<IeeeAddress>()
                        .ok()
                        .and_then(|ieee| self.devices.get(&ieee))
                }),
        };
        found.ok_or_else(|| RegistryError::NotFound(by.to_string()))
    }

    /// Look a device up, marking it offline first if it has been silent too long.
    ///
    /// Returns an owned copy.
    pub fn query(&mut self, by: DeviceRef<'_>, now: DateTime<Utc>) -> Result<Device, RegistryError> {
        let ieee = self.get(by)?.ieee;
        let stale = self
            .devices
            .get(&ieee)
            .is_some_and(|d| self.is_stale(d, now));
        if stale {
            self.update(ieee, mark_offline)?;
        }
        self.get(DeviceRef::Ieee(ieee)).cloned()
    }

    fn is_stale(&self, device: &Device, now: DateTime<Utc>) -> bool {
        device.state == CommissioningState::Active
            && device
                .last_seen
                .is_some_and(|seen| now.signed_duration_since(seen) > self.offline_after)
    }

    /// Apply `f` to a device and persist.
    pub fn update<F, R>(&mut self, ieee: IeeeAddress, f: F) -> Result<R, RegistryError>
    where
        F: FnOnce(&mut Device) -> R,
    {
        let device = self
            .devices
            .get_mut(&ieee)
            .ok_or_else(|| RegistryError::NotFound(ieee.to_string()))?;
        let previous_nwk = device.nwk;
        let result = f(device);

        if device.nwk != previous_nwk {
            let device = device.clone();
            if self.by_nwk.get(&previous_nwk) == Some(&ieee) {
                self.by_nwk.remove(&previous_nwk);
            }
            self.insert_indexed(device);
        }
        self.persist()?;
        Ok(result)
    }

    /// Remove a device.
    pub fn remove(&mut self, ieee: IeeeAddress) -> Result<Device, RegistryError> {
        let device = self
            .devices
            .remove(&ieee)
            .ok_or_else(|| RegistryError::NotFound(ieee.to_string()))?;
        if self.by_nwk.get(&device.nwk) == Some(&ieee) {
            self.by_nwk.remove(&device.nwk);
        }
        self.persist()?;
        Ok(device)
    }

    /// Remove every device. Used when the network is re-formed.
    pub fn clear(&mut self) -> Result<Vec<Device>, RegistryError> {
        let removed: Vec<Device> = std::mem::take(&mut self.devices).into_values().collect();
        self.by_nwk.clear();
        self.persist()?;
        Ok(removed)
    }

    /// Owned snapshot of every device, ordered by IEEE address.
    pub fn list(&self) -> Vec<Device> {
        self.devices.values().cloned().collect()
    }

    /// Short addresses currently owned by devices.
    pub fn used_addresses(&self) -> impl Iterator<Item = ShortAddress> + '_ {
        self.by_nwk.keys().copied()
    }

    /// Record that a frame arrived from a device.
    ///
    /// Returns true when the device came back from offline.
    pub fn mark_seen(&mut self, ieee: IeeeAddress, now: DateTime<Utc>) -> Result<bool, RegistryError> {
        self.update(ieee, |device| {
            device.last_seen = Some(now);
            if device.state == CommissioningState::Offline {
                device.state = CommissioningState::Active;
            }
            let revived = !device.online && device.state == CommissioningState::Active;
            if device.state == CommissioningState::Active {
                device.online = true;
            }
            revived
        })
    }

    /// Mark silent devices offline. Returns the devices that changed.
    pub fn sweep_offline(&mut self, now: DateTime<Utc>) -> Result<Vec<Device>, RegistryError> {
        let stale: Vec<IeeeAddress> = self
            .devices
            .values()
            .filter(|d| self.is_stale(d, now))
            .map(|d| d.ieee)
            .collect();

        if stale.is_empty() {
            return Ok(Vec::new());
        }

        let mut changed = Vec::with_capacity(stale.len());
        for ieee in &stale {
            if let Some(device) = self.devices.get_mut(ieee) {
                mark_offline(device);
                changed.push(device.clone());
            }
        }
        debug!(count = changed.len(), "Devices marked offline");
        self.persist()?;
        Ok(changed)
    }

    /// Merge attribute values into a device's cache.
    ///
    /// Returns only the fields whose value actually changed.
    pub fn update_attributes(
        &mut self,
        ieee: IeeeAddress,
        endpoint: u8,
        fields: &serde_json::Map<String, serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<serde_json::Map<String, serde_json::Value>, RegistryError> {
        self.update(ieee, |device| {
            if device.endpoint(endpoint).is_none() {
                device
                    .endpoints
                    .push(crate::types::Endpoint::new(endpoint, 0, 0, Vec::new()));
            }
            let mut changed = serde_json::Map::new();
            if let Some(ep) = device.endpoint_mut(endpoint) {
                for (field, value) in fields {
                    let previous = ep.attributes.insert(
                        field.clone(),
                        CachedAttribute {
                            value: value.clone(),
                            received_at: now,
                        },
                    );
                    if previous.as_ref().map(|p| &p.value) != Some(value) {
                        changed.insert(field.clone(), value.clone());
                    }
                }
            }
            changed
        })
    }

    /// A cached value no older than `max_age`.
    pub fn cached(
        &self,
        ieee: IeeeAddress,
        field: &str,
        now: DateTime<Utc>,
        max_age: chrono::Duration,
    ) -> Option<serde_json::Value> {
        let device = self.devices.get(&ieee)?;
        device
            .endpoints
            .iter()
            .filter_map(|ep| ep.attributes.get(field))
            .filter(|c| now.signed_duration_since(c.received_at) <= max_age)
            .max_by_key(|c| c.received_at)
            .map(|c| c.value.clone())
    }

    /// Retry a failed write, if any.
    pub fn flush(&mut self) -> Result<(), RegistryError> {
        if self.dirty {
            self.persist()?;
        }
        Ok(())
    }

    fn persist(&mut self) -> Result<(), RegistryError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        self.dirty = true;
        persist::write_json_atomic(path, &self.devices).map_err(|source| {
            RegistryError::Persist {
                path: path.clone(),
                source,
            }
        })?;
        self.dirty = false;
        Ok(())
    }
}

fn mark_offline(device: &mut Device) {
    if device.state == CommissioningState::Active {
        device.state = CommissioningState::Offline;
    }
    device.online = false;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Endpoint;
    use serde_json::json;

    fn device(ieee: u64, nwk: u16) -> Device {
        let mut device = Device::new(IeeeAddress(ieee), ShortAddress(nwk), 0x80);
        device.state = CommissioningState::Active;
        device.online = true;
        device
    }

    fn minutes(n: i64) -> chrono::Duration {
        chrono::Duration::minutes(n)
    }

    #[test]
    fn test_lookup_by_ieee_nwk_and_name() {
        let mut registry = Registry::in_memory(minutes(15));
        let mut lamp = device(1, 0x0001);
        lamp.friendly_name = Some("lamp".to_string());
        registry.upsert(lamp).unwrap();

        assert_eq!(registry.get(DeviceRef::Nwk(ShortAddress(1))).unwrap().ieee, IeeeAddress(1));
        assert_eq!(registry.get(DeviceRef::Name("lamp")).unwrap().ieee, IeeeAddress(1));
        assert_eq!(
            registry
                .get(DeviceRef::Name("0x0000000000000001"))
                .unwrap()
                .nwk,
            ShortAddress(1)
        );
        assert!(matches!(
            registry.get(DeviceRef::Nwk(ShortAddress(2))),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn test_short_address_owned_by_one_device() {
        let mut registry = Registry::in_memory(minutes(15));
        registry.upsert(device(1, 0x0005)).unwrap();
        let displaced = registry.upsert(device(2, 0x0005)).unwrap();

        assert_eq!(displaced, Some(IeeeAddress(1)));
        assert_eq!(registry.get(DeviceRef::Nwk(ShortAddress(5))).unwrap().ieee, IeeeAddress(2));
        let old = registry.get(DeviceRef::Ieee(IeeeAddress(1))).unwrap();
        assert_eq!(old.nwk, ShortAddress::UNASSIGNED);
        assert!(!old.online);
    }

    #[test]
    fn test_address_change_reindexes() {
        let mut registry = Registry::in_memory(minutes(15));
        registry.upsert(device(1, 0x0005)).unwrap();
        registry.update(IeeeAddress(1), |d| d.nwk = ShortAddress(9)).unwrap();

        assert!(registry.get(DeviceRef::Nwk(ShortAddress(5))).is_err());
        assert_eq!(registry.get(DeviceRef::Nwk(ShortAddress(9))).unwrap().ieee, IeeeAddress(1));
        assert_eq!(registry.used_addresses().collect::<Vec<_>>(), vec![ShortAddress(9)]);
    }

    #[test]
    fn test_list_is_a_snapshot() {
        let mut registry = Registry::in_memory(minutes(15));
        registry.upsert(device(2, 2)).unwrap();
        registry.upsert(device(1, 1)).unwrap();
        let snapshot = registry.list();
        registry.remove(IeeeAddress(1)).unwrap();

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].ieee, IeeeAddress(1));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        let now = Utc::now();

        {
            let mut registry = Registry::open(&path, minutes(15)).unwrap();
            let mut sensor = device(0x00124b0001abcdef, 0x0003);
            sensor.endpoints.push(Endpoint::new(1, 0x0104, 0x0302, vec![0x0402]));
            registry.upsert(sensor).unwrap();
            let mut fields = serde_json::Map::new();
            fields.insert("temperature".to_string(), json!(21.5));
            registry
                .update_attributes(IeeeAddress(0x00124b0001abcdef), 1, &fields, now)
                .unwrap();
        }

        let registry = Registry::open(&path, minutes(15)).unwrap();
        let sensor = registry.get(DeviceRef::Nwk(ShortAddress(3))).unwrap();
        assert_eq!(sensor.endpoints[0].in_clusters, vec![0x0402]);
        assert_eq!(sensor.state_document()["temperature"], json!(21.5));

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert!(raw.get("0x00124b0001abcdef").is_some());
    }

    #[test]
    fn test_failed_write_stays_dirty_and_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        let mut registry = Registry::open(&path, minutes(15)).unwrap();

        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("block"), b"x").unwrap();
        assert!(matches!(
            registry.upsert(device(1, 1)),
            Err(RegistryError::Persist { .. })
        ));
        assert!(registry.is_dirty());
        assert_eq!(registry.len(), 1);

        std::fs::remove_dir_all(&path).unwrap();
        registry.flush().unwrap();
        assert!(!registry.is_dirty());
        let reloaded = Registry::open(&path, minutes(15)).unwrap();
        assert_eq!(reloaded.len(), 1);
    }

    #[test]
    fn test_offline_sweep_and_lazy_query() {
        let now = Utc::now();
        let mut registry = Registry::in_memory(minutes(15));

        let mut silent = device(1, 1);
        silent.last_seen = Some(now - minutes(20));
        let mut chatty = device(2, 2);
        chatty.last_seen = Some(now - minutes(1));
        let mut lazy = device(3, 3);
        lazy.last_seen = Some(now - minutes(30));
        registry.upsert(silent).unwrap();
        registry.upsert(chatty).unwrap();

        let changed = registry.sweep_offline(now).unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].ieee, IeeeAddress(1));
        assert_eq!(changed[0].state, CommissioningState::Offline);
        assert!(registry.sweep_offline(now).unwrap().is_empty());

        registry.upsert(lazy).unwrap();
        let queried = registry.query(DeviceRef::Ieee(IeeeAddress(3)), now).unwrap();
        assert!(!queried.online);
        assert_eq!(registry.len(), 3);

        assert!(registry.mark_seen(IeeeAddress(1), now).unwrap());
        let back = registry.get(DeviceRef::Ieee(IeeeAddress(1))).unwrap();
        assert_eq!(back.state, CommissioningState::Active);
        assert!(back.online);
    }

    #[test]
    fn test_attribute_cache_changes_and_freshness() {
        let now = Utc::now();
        let mut registry = Registry::in_memory(minutes(15));
        registry.upsert(device(1, 1)).unwrap();

        let mut fields = serde_json::Map::new();
        fields.insert("state".to_string(), json!("ON"));
        fields.insert("brightness".to_string(), json!(120));
        let changed = registry
            .update_attributes(IeeeAddress(1), 1, &fields, now - chrono::Duration::seconds(90))
            .unwrap();
        assert_eq!(changed.len(), 2);

        let mut again = serde_json::Map::new();
        again.insert("state".to_string(), json!("ON"));
        let changed = registry
            .update_attributes(IeeeAddress(1), 1, &again, now)
            .unwrap();
        assert!(changed.is_empty());

        let max_age = chrono::Duration::seconds(60);
        assert_eq!(registry.cached(IeeeAddress(1), "state", now, max_age), Some(json!("ON")));
        assert_eq!(registry.cached(IeeeAddress(1), "brightness", now, max_age), None);
    }
}
