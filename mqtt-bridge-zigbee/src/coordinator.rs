//! Network coordinator.
//!
//! Owns the formed network and the permit-join window, and decides joins and
//! leaves. It never writes the device registry: every operation returns the
//! updated [`Device`] together with the adapter message to send, and the
//! router applies both.

use std::collections::HashSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::persist;
use crate::registry::{DeviceRef, Registry};
use crate::transport::{RadioMessage, RejectReason};
use crate::types::{
    CommissioningState, Device, IeeeAddress, Network, NetworkKey, NetworkParams, ShortAddress,
    capability,
};

/// Errors forming or loading the network.
#[derive(Debug, Error)]
pub enum FormationError {
    #[error("Requested {field} {requested} does not match the formed network ({persisted})")]
    Mismatch {
        field: &'static str,
        persisted: String,
        requested: String,
    },

    #[error("Invalid network parameters: {0}")]
    InvalidParams(String),

    #[error("Adapter refused to start the network (status 0x{0:02x})")]
    AdapterRejected(u8),

    #[error("Failed to persist network to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to load network from {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors handling joins, leaves and commissioning.
#[derive(Debug, Error, PartialEq)]
pub enum JoinError {
    #[error("No network has been formed")]
    NoNetwork,

    #[error("Permit join is closed")]
    PermitJoinClosed,

    #[error("Invalid capability flags 0x{0:02x}")]
    InvalidCapabilities(u8),

    #[error("No free short address left")]
    AddressSpaceExhausted,

    #[error("Device {ieee}: illegal transition {from} -> {to}")]
    InvalidTransition {
        ieee: IeeeAddress,
        from: CommissioningState,
        to: CommissioningState,
    },

    #[error("Unknown device {0}")]
    UnknownDevice(String),
}

impl JoinError {
    /// Reason sent to the adapter when a join is refused.
    pub fn reject_reason(&self) -> RejectReason {
        match self {
            JoinError::NoNetwork => RejectReason::NoNetwork,
            JoinError::InvalidCapabilities(_) => RejectReason::InvalidCapabilities,
            JoinError::AddressSpaceExhausted => RejectReason::AddressSpaceFull,
            _ => RejectReason::NotPermitted,
        }
    }
}

/// Parameters of a formation request. Missing identifiers are generated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FormRequest {
    pub channel: u8,
    pub pan_id: u16,
    #[serde(default)]
    pub extended_pan_id: Option<IeeeAddress>,
    #[serde(default)]
    pub network_key: Option<NetworkKey>,
}

impl FormRequest {
    fn validate(&self) -> Result<(), FormationError> {
        if !(11..=26).contains(&self.channel) {
            return Err(FormationError::InvalidParams(format!(
                "channel {} is outside 11..=26",
                self.channel
            )));
        }
        if self.pan_id == 0x0000 || self.pan_id == 0xFFFF {
            return Err(FormationError::InvalidParams(format!(
                "PAN id 0x{:04x} is reserved",
                self.pan_id
            )));
        }
        if matches!(self.extended_pan_id, Some(IeeeAddress(0)) | Some(IeeeAddress(u64::MAX))) {
            return Err(FormationError::InvalidParams(
                "extended PAN id must not be all zeros or all ones".to_string(),
            ));
        }
        Ok(())
    }

    /// Compare against a formed network.
    fn check(&self, network: &Network) -> Result<(), FormationError> {
        let params = &network.params;
        if self.channel != params.channel {
            return Err(mismatch("channel", params.channel, self.channel));
        }
        if self.pan_id != params.pan_id {
            return Err(mismatch(
                "PAN id",
                format!("0x{:04x}", params.pan_id),
                format!("0x{:04x}", self.pan_id),
            ));
        }
        if let Some(ext) = self.extended_pan_id {
            if ext != params.extended_pan_id {
                return Err(mismatch("extended PAN id", params.extended_pan_id, ext));
            }
        }
        if let Some(key) = self.network_key {
            if key != params.network_key {
                return Err(mismatch("network key", "<persisted>", "<requested>"));
            }
        }
        Ok(())
    }
}

fn mismatch(
    field: &'static str,
    persisted: impl ToString,
    requested: impl ToString,
) -> FormationError {
    FormationError::Mismatch {
        field,
        persisted: persisted.to_string(),
        requested: requested.to_string(),
    }
}

/// Open permit-join window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermitWindow {
    pub generation: u64,
    pub until: DateTime<Utc>,
}

/// An accepted join.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinOutcome {
    /// The device, now authenticating.
    pub device: Device,
    pub accept: RadioMessage,
    pub rejoin: bool,
}

/// A started leave. The device is removed once `revoke` has been sent.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaveOutcome {
    pub device: Device,
    pub revoke: RadioMessage,
}

/// The network coordinator.
#[derive(Debug)]
pub struct Coordinator {
    path: Option<PathBuf>,
    network: Option<Network>,
    started: bool,
    permit: Option<PermitWindow>,
    generation: u64,
}

impl Coordinator {
    /// Coordinator without persistence.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            network: None,
            started: false,
            permit: None,
            generation: 0,
        }
    }

    /// Load the persisted network, if any. The network is never re-formed here.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, FormationError> {
        let path = path.into();
        let network: Option<Network> =
            persist::read_json(&path).map_err(|source| FormationError::Load {
                path: path.clone(),
                source,
            })?;

        match &network {
            Some(n) => info!(
                channel = n.params.channel,
                pan_id = n.params.pan_id,
                extended_pan_id = %n.params.extended_pan_id,
                "Loaded formed network"
            ),
            None => info!(path = %path.display(), "No formed network; waiting for a formation request"),
        }

        Ok(Self {
            path: Some(path),
            network,
            started: false,
            permit: None,
            generation: 0,
        })
    }

    pub fn network(&self) -> Option<&Network> {
        self.network.as_ref()
    }

    pub fn is_formed(&self) -> bool {
        self.network.is_some()
    }

    /// Whether the adapter confirmed the network is up.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Form the network, or confirm the request matches the formed one.
    pub fn form_network(
        &mut self,
        request: &FormRequest,
        now: DateTime<Utc>,
    ) -> Result<Network, FormationError> {
        if let Some(network) = &self.network {
            request.check(network)?;
            debug!("Formation request matches the formed network");
            return Ok(network.clone());
        }
        request.validate()?;

        let network = Network {
            params: NetworkParams {
                channel: request.channel,
                pan_id: request.pan_id,
                extended_pan_id: request
                    .extended_pan_id
                    .unwrap_or_else(|| IeeeAddress(random_extended_pan_id())),
                network_key: request.network_key.unwrap_or_else(NetworkKey::random),
            },
            coordinator: ShortAddress::COORDINATOR,
            formed_at: now,
        };

        if let Some(path) = &self.path {
            persist::write_json_atomic(path, &network).map_err(|source| {
                FormationError::Persist {
                    path: path.clone(),
                    source,
                }
            })?;
        }

        info!(
            channel = network.params.channel,
            pan_id = network.params.pan_id,
            extended_pan_id = %network.params.extended_pan_id,
            "Network formed"
        );
        self.network = Some(network.clone());
        self.started = false;
        Ok(network)
    }

    /// Discard the formed network and form a new one. Every commissioned
    /// device has to join again afterwards.
    pub fn reform(
        &mut self,
        request: &FormRequest,
        now: DateTime<Utc>,
    ) -> Result<Network, FormationError> {
        request.validate()?;
        if let Some(old) = self.network.take() {
            warn!(
                channel = old.params.channel,
                pan_id = old.params.pan_id,
                extended_pan_id = %old.params.extended_pan_id,
                "RE-FORMING NETWORK: all devices must be re-paired"
            );
        }
        self.permit = None;
        match self.form_network(request, now) {
            Ok(network) => Ok(network),
            Err(e) => {
                // Nothing was persisted; the previous file is still on disk.
                if let Some(path) = &self.path {
                    self.network = persist::read_json(path).ok().flatten();
                }
                Err(e)
            }
        }
    }

    /// Message that (re)starts the formed network on the adapter.
    pub fn start_message(&self) -> Option<RadioMessage> {
        self.network.as_ref().map(|n| RadioMessage::StartNetwork {
            channel: n.params.channel,
            pan_id: n.params.pan_id,
            extended_pan_id: n.params.extended_pan_id.0,
            key: n.params.network_key,
        })
    }

    pub fn on_network_started(&mut self, status: u8) -> Result<(), FormationError> {
        if status != 0 {
            self.started = false;
            return Err(FormationError::AdapterRejected(status));
        }
        self.started = true;
        info!("Network started on adapter");
        Ok(())
    }

    /// Adapter link dropped; the network must be started again.
    pub fn on_link_down(&mut self) {
        self.started = false;
    }

    pub fn permit_window(&self, now: DateTime<Utc>) -> Option<PermitWindow> {
        self.permit.filter(|w| now < w.until)
    }

    /// Open (or with `duration == 0`, close) the permit-join window.
    ///
    /// Returns the message for the adapter and the window generation the
    /// auto-close timer must carry.
    pub fn permit_join(
        &mut self,
        duration: u8,
        now: DateTime<Utc>,
    ) -> Result<(RadioMessage, u64), JoinError> {
        if self.network.is_none() {
            return Err(JoinError::NoNetwork);
        }
        self.generation += 1;
        self.permit = (duration > 0).then(|| PermitWindow {
            generation: self.generation,
            until: now + chrono::Duration::seconds(duration as i64),
        });
        info!(duration, "Permit join {}", if duration > 0 { "opened" } else { "closed" });
        Ok((RadioMessage::PermitJoin { duration }, self.generation))
    }

    /// Close the window opened as `generation`, unless it was replaced since.
    pub fn close_permit_join(&mut self, generation: u64) -> Option<RadioMessage> {
        match self.permit {
            Some(w) if w.generation == generation => {
                self.permit = None;
                info!("Permit join closed");
                Some(RadioMessage::PermitJoin { duration: 0 })
            }
            _ => None,
        }
    }

    /// Decide a join request.
    pub fn handle_join_request(
        &self,
        registry: &Registry,
        ieee: IeeeAddress,
        capabilities: u8,
        now: DateTime<Utc>,
    ) -> Result<JoinOutcome, JoinError> {
        let network = self.network.as_ref().ok_or(JoinError::NoNetwork)?;

        if capabilities & (capability::RESERVED | capability::ALTERNATE_PAN_COORDINATOR) != 0 {
            return Err(JoinError::InvalidCapabilities(capabilities));
        }

        let existing = registry.get(DeviceRef::Ieee(ieee)).ok();
        let rejoin = existing.is_some_and(|d| d.state.is_commissioned());
        if !rejoin && self.permit_window(now).is_none() {
            return Err(JoinError::PermitJoinClosed);
        }

        let kept = existing
            .map(|d| d.nwk)
            .filter(|nwk| nwk.is_assignable())
            .filter(|nwk| registry.get(DeviceRef::Nwk(*nwk)).is_ok_and(|d| d.ieee == ieee));
        let nwk = match kept {
            Some(nwk) => nwk,
            None => allocate(registry)?,
        };

        let mut device = match existing {
            Some(d) if d.state.is_commissioned() || d.state == CommissioningState::Unjoined => {
                d.clone()
            }
            Some(d) => {
                // An interrupted join or leave starts over.
                let mut fresh = Device::new(ieee, nwk, capabilities);
                fresh.friendly_name = d.friendly_name.clone();
                fresh.manufacturer = d.manufacturer.clone();
                fresh.model = d.model.clone();
                fresh
            }
            None => Device::new(ieee, nwk, capabilities),
        };
        device.nwk = nwk;
        device.capabilities = capabilities;
        device.transition(CommissioningState::Joining)?;
        device.transition(CommissioningState::Authenticating)?;
        device.last_seen = Some(now);

        debug!(ieee = %ieee, nwk = %nwk, rejoin, "Join accepted");
        Ok(JoinOutcome {
            accept: RadioMessage::JoinAccept {
                ieee,
                nwk,
                key: network.params.network_key,
            },
            device,
            rejoin,
        })
    }

    /// A device announced itself on the network and is now active.
    pub fn handle_announce(
        &self,
        registry: &Registry,
        ieee: IeeeAddress,
        nwk: ShortAddress,
        now: DateTime<Utc>,
    ) -> Result<Device, JoinError> {
        let mut device = registry
            .get(DeviceRef::Ieee(ieee))
            .map_err(|_| JoinError::UnknownDevice(ieee.to_string()))?
            .clone();

        if device.state != CommissioningState::Active {
            device.transition(CommissioningState::Active)?;
        }
        device.nwk = nwk;
        device.online = true;
        device.last_seen = Some(now);
        Ok(device)
    }

    /// Start removing the device owning `nwk`.
    pub fn handle_leave(
        &self,
        registry: &Registry,
        nwk: ShortAddress,
    ) -> Result<LeaveOutcome, JoinError> {
        let device = registry
            .get(DeviceRef::Nwk(nwk))
            .map_err(|_| JoinError::UnknownDevice(nwk.to_string()))?
            .clone();
        self.begin_leave(device)
    }

    /// Start removing a known device.
    pub fn begin_leave(&self, mut device: Device) -> Result<LeaveOutcome, JoinError> {
        match device.state {
            CommissioningState::Leaving => {}
            CommissioningState::Joining | CommissioningState::Authenticating => {
                device.transition(CommissioningState::Unjoined)?;
            }
            CommissioningState::Unjoined | CommissioningState::Removed => {}
            _ => device.transition(CommissioningState::Leaving)?,
        }
        device.online = false;
        Ok(LeaveOutcome {
            revoke: RadioMessage::RevokeAddress { nwk: device.nwk },
            device,
        })
    }

    /// The address was revoked; the device is gone.
    pub fn complete_leave(&self, mut device: Device) -> Result<Device, JoinError> {
        if device.state == CommissioningState::Leaving {
            device.transition(CommissioningState::Removed)?;
        }
        Ok(device)
    }

    /// Ask a device to leave the network.
    pub fn leave_request(&self, device: &Device) -> Result<RadioMessage, JoinError> {
        if self.network.is_none() {
            return Err(JoinError::NoNetwork);
        }
        Ok(RadioMessage::LeaveRequest {
            ieee: device.ieee,
            nwk: device.nwk,
        })
    }
}

/// Lowest short address no device owns.
fn allocate(registry: &Registry) -> Result<ShortAddress, JoinError> {
    let used: HashSet<ShortAddress> = registry.used_addresses().collect();
    (ShortAddress::FIRST_ASSIGNABLE.0..=ShortAddress::LAST_ASSIGNABLE.0)
        .map(ShortAddress)
        .find(|a| !used.contains(a))
        .ok_or(JoinError::AddressSpaceExhausted)
}

fn random_extended_pan_id() -> u64 {
    loop {
        let candidate: u64 = rand::random();
        if candidate != 0 && candidate != u64::MAX {
            return candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> FormRequest {
        FormRequest {
            channel: 15,
            pan_id: 0x1a62,
            extended_pan_id: None,
            network_key: None,
        }
    }

    fn formed() -> Coordinator {
        let mut coordinator = Coordinator::in_memory();
        coordinator.form_network(&request(), Utc::now()).unwrap();
        coordinator
    }

    fn registry() -> Registry {
        Registry::in_memory(chrono::Duration::minutes(15))
    }

    fn active(ieee: u64, nwk: u16) -> Device {
        let mut device = Device::new(IeeeAddress(ieee), ShortAddress(nwk), 0x80);
        device.state = CommissioningState::Active;
        device
    }

    #[test]
    fn test_form_is_idempotent_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("network.json");
        let now = Utc::now();

        let mut coordinator = Coordinator::load(&path).unwrap();
        assert!(!coordinator.is_formed());
        let first = coordinator.form_network(&request(), now).unwrap();
        let again = coordinator.form_network(&request(), now).unwrap();
        assert_eq!(first, again);
        assert_ne!(first.params.extended_pan_id, IeeeAddress(0));

        let reloaded = Coordinator::load(&path).unwrap();
        assert_eq!(reloaded.network(), Some(&first));
    }

    #[test]
    fn test_form_mismatch_fails() {
        let mut coordinator = formed();
        let mut other = request();
        other.channel = 20;
        assert!(matches!(
            coordinator.form_network(&other, Utc::now()),
            Err(FormationError::Mismatch { field: "channel", .. })
        ));

        let mut other = request();
        other.network_key = Some(NetworkKey([1; 16]));
        assert!(matches!(
            coordinator.form_network(&other, Utc::now()),
            Err(FormationError::Mismatch { field: "network key", .. })
        ));
    }

    #[test]
    fn test_invalid_params() {
        let mut coordinator = Coordinator::in_memory();
        let mut bad = request();
        bad.channel = 27;
        assert!(matches!(
            coordinator.form_network(&bad, Utc::now()),
            Err(FormationError::InvalidParams(_))
        ));
        assert!(!coordinator.is_formed());
    }

    #[test]
    fn test_reform_replaces_network() {
        let mut coordinator = formed();
        let before = coordinator.network().cloned().unwrap();
        let mut other = request();
        other.channel = 25;
        let after = coordinator.reform(&other, Utc::now()).unwrap();
        assert_eq!(after.params.channel, 25);
        assert_ne!(before.params.network_key, after.params.network_key);
    }

    #[test]
    fn test_join_requires_network_and_open_window() {
        let now = Utc::now();
        let registry = registry();
        assert_eq!(
            Coordinator::in_memory()
                .handle_join_request(&registry, IeeeAddress(1), 0x80, now)
                .unwrap_err(),
            JoinError::NoNetwork
        );

        let mut coordinator = formed();
        assert_eq!(
            coordinator
                .handle_join_request(&registry, IeeeAddress(1), 0x80, now)
                .unwrap_err(),
            JoinError::PermitJoinClosed
        );

        let (_, generation) = coordinator.permit_join(60, now).unwrap();
        let outcome = coordinator
            .handle_join_request(&registry, IeeeAddress(1), 0x80, now)
            .unwrap();
        assert_eq!(outcome.device.state, CommissioningState::Authenticating);
        assert_eq!(outcome.device.nwk, ShortAddress(1));

        assert!(coordinator.close_permit_join(generation + 1).is_none());
        assert_eq!(
            coordinator.close_permit_join(generation),
            Some(RadioMessage::PermitJoin { duration: 0 })
        );
        let later = now + chrono::Duration::seconds(61);
        coordinator.permit_join(60, now).unwrap();
        assert!(coordinator.permit_window(later).is_none());
    }

    #[test]
    fn test_capability_validation() {
        let mut coordinator = formed();
        let now = Utc::now();
        coordinator.permit_join(60, now).unwrap();
        for caps in [0x10, 0x20, 0x01, 0x8f] {
            let err = coordinator
                .handle_join_request(&registry(), IeeeAddress(1), caps, now)
                .unwrap_err();
            assert_eq!(err, JoinError::InvalidCapabilities(caps));
            assert_eq!(err.reject_reason(), RejectReason::InvalidCapabilities);
        }
    }

    #[test]
    fn test_lowest_free_address_is_allocated() {
        let mut coordinator = formed();
        let now = Utc::now();
        coordinator.permit_join(60, now).unwrap();
        let mut registry = registry();
        registry.upsert(active(10, 0x0001)).unwrap();
        registry.upsert(active(11, 0x0002)).unwrap();
        registry.upsert(active(12, 0x0004)).unwrap();

        let outcome = coordinator
            .handle_join_request(&registry, IeeeAddress(99), 0x80, now)
            .unwrap();
        assert_eq!(outcome.device.nwk, ShortAddress(0x0003));
        assert!(!outcome.rejoin);
    }

    #[test]
    fn test_rejoin_keeps_address_without_permit() {
        let coordinator = formed();
        let now = Utc::now();
        let mut registry = registry();
        let mut device = active(10, 0x0042);
        device.friendly_name = Some("lamp".to_string());
        registry.upsert(device).unwrap();

        let outcome = coordinator
            .handle_join_request(&registry, IeeeAddress(10), 0x8e, now)
            .unwrap();
        assert!(outcome.rejoin);
        assert_eq!(outcome.device.nwk, ShortAddress(0x0042));
        assert_eq!(outcome.device.friendly_name.as_deref(), Some("lamp"));
        assert_eq!(
            outcome.accept,
            RadioMessage::JoinAccept {
                ieee: IeeeAddress(10),
                nwk: ShortAddress(0x0042),
                key: coordinator.network().unwrap().params.network_key,
            }
        );
    }

    #[test]
    fn test_announce_then_leave() {
        let mut coordinator = formed();
        let now = Utc::now();
        coordinator.permit_join(60, now).unwrap();
        let mut registry = registry();

        let joined = coordinator
            .handle_join_request(&registry, IeeeAddress(5), 0x80, now)
            .unwrap();
        registry.upsert(joined.device).unwrap();

        let announced = coordinator
            .handle_announce(&registry, IeeeAddress(5), ShortAddress(1), now)
            .unwrap();
        assert_eq!(announced.state, CommissioningState::Active);
        assert!(announced.online);
        registry.upsert(announced).unwrap();

        let leave = coordinator.handle_leave(&registry, ShortAddress(1)).unwrap();
        assert_eq!(leave.device.state, CommissioningState::Leaving);
        assert_eq!(leave.revoke, RadioMessage::RevokeAddress { nwk: ShortAddress(1) });
        let removed = coordinator.complete_leave(leave.device).unwrap();
        assert_eq!(removed.state, CommissioningState::Removed);

        assert!(matches!(
            coordinator.handle_leave(&registry, ShortAddress(9)),
            Err(JoinError::UnknownDevice(_))
        ));
    }
}
