//! Router: the single consumer of the intake queue.
//!
//! Every registry and network mutation happens here, one event at a time.
//! Bus commands become pending transactions correlated with radio responses
//! by ZCL sequence number and short address. Timeouts, retries, the offline
//! sweep and permit-join expiry arrive as timer events on the same queue.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use zigbridge_common::{
    Availability, ParsedTopic, TopicBuilder, is_valid_device_name, parse_topic,
};
use zigbridge_framework::{AvailabilityTracker, BusMessage, BusPublisher};

use crate::config::{TransactionConfig, ZigbeeBridgeConfig};
use crate::coordinator::{Coordinator, FormRequest, FormationError, JoinError, LeaveOutcome};
use crate::definitions::Definitions;
use crate::events::{Event, Scheduler, TimerEvent};
use crate::registry::{DeviceRef, Registry, RegistryError};
use crate::translator::{
    self, Action, DecodedFrame, EncodingError, FrameKind, Outbound, ZclFrame, clusters,
};
use crate::transport::{LinkEvent, RadioMessage, RadioSink, ZclEnvelope};
use crate::types::{CommissioningState, Device, Endpoint, IeeeAddress, ShortAddress};

/// Errors surfaced while handling an event.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Radio adapter unreachable for {}s", .0.as_secs())]
    LinkLost(Duration),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Formation(#[from] FormationError),

    #[error(transparent)]
    Join(#[from] JoinError),
}

impl RouterError {
    /// Fatal errors stop the router; everything else is logged.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RouterError::LinkLost(_))
    }
}

/// Whether the router keeps going after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// What created a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A `/set` command.
    Command,
    /// A `/get` request the cache could not answer.
    Read,
    /// Reading manufacturer and model after endpoint discovery.
    Interview,
}

/// A request sent to a device and awaiting its response.
#[derive(Debug, Clone)]
pub struct PendingTransaction {
    pub seq: u8,
    pub ieee: IeeeAddress,
    pub nwk: ShortAddress,
    /// Topic name of the device when the transaction was created.
    pub device: String,
    pub sleepy: bool,
    pub outbound: Outbound,
    /// Sends so far, counting the first.
    pub attempts: u8,
    /// Set while the current attempt is on the air.
    pub deadline: Option<Instant>,
    pub origin: Origin,
}

#[derive(Debug, Deserialize)]
struct PermitJoinRequest {
    #[serde(default = "default_true")]
    value: bool,
    #[serde(default)]
    time: Option<u8>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct RemoveRequest {
    id: String,
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Deserialize)]
struct RenameRequest {
    from: String,
    to: String,
}

#[derive(Debug, Deserialize)]
struct FormNetworkRequest {
    #[serde(flatten)]
    params: FormRequest,
    #[serde(default)]
    force: bool,
}

/// The router.
pub struct Router {
    registry: Registry,
    coordinator: Coordinator,
    definitions: Definitions,
    friendly_names: HashMap<IeeeAddress, String>,
    transactions: TransactionConfig,
    configured_network: FormRequest,
    auto_form: Option<FormRequest>,
    permit_join_secs: u8,
    offline_sweep: Duration,
    radio: Box<dyn RadioSink>,
    bus: Arc<dyn BusPublisher>,
    topics: TopicBuilder,
    availability: AvailabilityTracker,
    scheduler: Box<dyn Scheduler>,
    pending: BTreeMap<u8, PendingTransaction>,
    next_seq: u8,
    /// Addresses whose revocation was lost with the link.
    unrevoked: Vec<ShortAddress>,
}

impl Router {
    pub fn new(
        config: &ZigbeeBridgeConfig,
        registry: Registry,
        coordinator: Coordinator,
        definitions: Definitions,
        radio: Box<dyn RadioSink>,
        bus: Arc<dyn BusPublisher>,
        scheduler: Box<dyn Scheduler>,
    ) -> Self {
        let topics = TopicBuilder::new(config.mqtt.base_topic.clone());
        Self {
            registry,
            coordinator,
            definitions,
            friendly_names: config.friendly_names(),
            transactions: config.transactions.clone(),
            configured_network: config.zigbee.form_request(),
            auto_form: config.zigbee.auto_form(),
            permit_join_secs: config.zigbee.permit_join_secs,
            offline_sweep: config.zigbee.offline_sweep(),
            availability: AvailabilityTracker::new(bus.clone(), topics.clone()),
            radio,
            bus,
            topics,
            scheduler,
            pending: BTreeMap::new(),
            next_seq: 1,
            unrevoked: Vec::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingTransaction> {
        self.pending.values()
    }

    /// Drain the intake until shutdown.
    pub async fn run(mut self, mut events: mpsc::Receiver<Event>) -> Result<(), RouterError> {
        if let Err(e) = self.start(Utc::now()) {
            error!(error = %e, "Router startup incomplete");
        }

        while let Some(event) = events.recv().await {
            match self.handle(event) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => return Ok(()),
                Err(e) => {
                    error!(error = %e, "Router stopping");
                    self.shutdown();
                    return Err(e);
                }
            }
        }

        debug!("Intake closed without a shutdown event");
        self.shutdown();
        Ok(())
    }

    /// Apply configured names, form the network if fully configured, publish
    /// the current device picture and start the offline sweep.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), RouterError> {
        self.scheduler
            .schedule(self.offline_sweep, TimerEvent::OfflineSweep);

        if !self.coordinator.is_formed() {
            if let Some(request) = self.auto_form.clone() {
                info!("Forming network from configured parameters");
                self.coordinator.form_network(&request, now)?;
            }
        }

        let renames: Vec<(IeeeAddress, String)> = self
            .friendly_names
            .iter()
            .filter(|(ieee, name)| {
                self.registry
                    .get(DeviceRef::Ieee(**ieee))
                    .is_ok_and(|d| d.friendly_name.as_ref() != Some(*name))
            })
            .map(|(ieee, name)| (*ieee, name.clone()))
            .collect();
        for (ieee, name) in renames {
            self.registry
                .update(ieee, |d| d.friendly_name = Some(name))?;
        }

        self.registry.sweep_offline(now)?;
        for device in self.registry.list() {
            if device.state.is_commissioned() {
                self.set_availability(&device.name(), device.online);
            }
        }
        self.publish_devices();

        info!(
            devices = self.registry.len(),
            definitions = self.definitions.len(),
            formed = self.coordinator.is_formed(),
            "Router started"
        );
        Ok(())
    }

    /// Handle one event.
    pub fn handle(&mut self, event: Event) -> Result<Flow, RouterError> {
        self.handle_at(event, Utc::now())
    }

    /// Handle one event with an explicit wall-clock time.
    pub fn handle_at(&mut self, event: Event, now: DateTime<Utc>) -> Result<Flow, RouterError> {
        let result = match event {
            Event::Link(link) => self.on_link(link, now),
            Event::Bus(message) => self.on_bus(message, now),
            Event::Timer(timer) => self.on_timer(timer, now),
            Event::Shutdown => {
                self.shutdown();
                return Ok(Flow::Stop);
            }
        };

        match result {
            Ok(()) => Ok(Flow::Continue),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                error!(error = %e, "Event handling failed");
                Ok(Flow::Continue)
            }
        }
    }

    /// Abandon pending transactions and flush the registry.
    fn shutdown(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        for tx in pending.values() {
            debug!(seq = tx.seq, device = %tx.device, "Transaction cancelled");
            self.publish_status(&tx.device, json!({ "status": "cancelled" }));
        }
        if let Err(e) = self.registry.flush() {
            error!(error = %e, "Registry not persisted at shutdown");
        }
        info!(cancelled = pending.len(), "Router stopped");
    }

    fn on_link(&mut self, event: LinkEvent, now: DateTime<Utc>) -> Result<(), RouterError> {
        match event {
            LinkEvent::Connected => {
                info!("Radio adapter connected");
                match self.coordinator.start_message() {
                    Some(message) => {
                        self.send(&message);
                    }
                    None => warn!(
                        topic = %self.topics.bridge_request("network/form"),
                        "No network formed yet, waiting for a formation request"
                    ),
                }
                self.resend_lost_revocations();
                self.retry_revocations()
            }
            LinkEvent::Undelivered(messages) => {
                for message in messages {
                    self.on_undelivered(message)?;
                }
                Ok(())
            }
            LinkEvent::Disconnected { reason } => {
                warn!(reason = %reason, pending = self.pending.len(), "Radio adapter disconnected");
                self.coordinator.on_link_down();
                Ok(())
            }
            LinkEvent::Lost { outage } => Err(RouterError::LinkLost(outage)),
            LinkEvent::Frame(message) => self.on_radio(message, now),
        }
    }

    /// A message the link accepted but never wrote.
    fn on_undelivered(&mut self, message: RadioMessage) -> Result<(), RouterError> {
        match message {
            RadioMessage::Zcl(envelope) => {
                let Ok(frame) = ZclFrame::decode(&envelope.payload) else {
                    return Ok(());
                };
                let seq = frame.header.seq;
                let in_flight = self
                    .pending
                    .get(&seq)
                    .is_some_and(|t| t.nwk == envelope.nwk && t.deadline.is_some());
                if !in_flight {
                    return Ok(());
                }
                debug!(seq, nwk = %envelope.nwk, "Transaction lost with the radio link");
                self.attempt_failed(seq)
            }
            RadioMessage::RevokeAddress { nwk } => {
                warn!(nwk = %nwk, "Address revocation lost, resending on reconnect");
                if !self.unrevoked.contains(&nwk) {
                    self.unrevoked.push(nwk);
                }
                Ok(())
            }
            other => {
                debug!(kind = other.kind(), "Undelivered radio message dropped");
                Ok(())
            }
        }
    }

    /// Resend revocations for addresses nobody has taken since.
    fn resend_lost_revocations(&mut self) {
        let unrevoked = std::mem::take(&mut self.unrevoked);
        for nwk in unrevoked {
            if self.registry.get(DeviceRef::Nwk(nwk)).is_ok() {
                debug!(nwk = %nwk, "Address reassigned, revocation dropped");
                continue;
            }
            if !self.send(&RadioMessage::RevokeAddress { nwk }) {
                self.unrevoked.push(nwk);
            }
        }
    }

    /// Devices stuck in `Leaving` had their revocation fail; try again.
    fn retry_revocations(&mut self) -> Result<(), RouterError> {
        let leaving: Vec<Device> = self
            .registry
            .list()
            .into_iter()
            .filter(|d| d.state == CommissioningState::Leaving)
            .collect();
        for device in leaving {
            let outcome = self.coordinator.begin_leave(device)?;
            self.finish_leave(outcome, "device_leave")?;
        }
        Ok(())
    }

    fn on_radio(&mut self, message: RadioMessage, now: DateTime<Utc>) -> Result<(), RouterError> {
        trace!(kind = message.kind(), "Radio message");
        match message {
            RadioMessage::NetworkStarted { status } => {
                self.coordinator.on_network_started(status)?;
                Ok(())
            }
            RadioMessage::JoinRequest { ieee, capabilities } => {
                self.on_join_request(ieee, capabilities, now)
            }
            RadioMessage::DeviceAnnounce { ieee, nwk } => self.on_announce(ieee, nwk, now),
            RadioMessage::LeaveIndication { nwk } => self.on_leave_indication(nwk),
            RadioMessage::EndpointsResponse { nwk, endpoints } => {
                self.on_endpoints(nwk, endpoints)
            }
            RadioMessage::Zcl(envelope) => self.on_zcl(envelope, now),
            other => {
                debug!(kind = other.kind(), "Ignoring host-bound message from adapter");
                Ok(())
            }
        }
    }

    fn on_join_request(
        &mut self,
        ieee: IeeeAddress,
        capabilities: u8,
        now: DateTime<Utc>,
    ) -> Result<(), RouterError> {
        let outcome =
            match self
                .coordinator
                .handle_join_request(&self.registry, ieee, capabilities, now)
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(ieee = %ieee, capabilities, error = %e, "Join rejected");
                    self.send(&RadioMessage::JoinReject {
                        ieee,
                        reason: e.reject_reason(),
                    });
                    return Ok(());
                }
            };

        // Without the accept the device retries its join on its own.
        if !self.send(&outcome.accept) {
            return Ok(());
        }

        let mut device = outcome.device;
        if device.friendly_name.is_none() {
            device.friendly_name = self.friendly_names.get(&ieee).cloned();
        }
        let name = device.name();
        let nwk = device.nwk;
        if let Some(holder) = self.registry.upsert(device)? {
            self.on_displaced(holder);
        }

        info!(ieee = %ieee, nwk = %nwk, rejoin = outcome.rejoin, "Device joined");
        self.publish_event(
            "device_joined",
            json!({
                "ieee_address": ieee.to_string(),
                "network_address": nwk.0,
                "friendly_name": name,
                "rejoin": outcome.rejoin,
            }),
        );
        self.publish_devices();
        Ok(())
    }

    fn on_announce(
        &mut self,
        ieee: IeeeAddress,
        nwk: ShortAddress,
        now: DateTime<Utc>,
    ) -> Result<(), RouterError> {
        let device = match self
            .coordinator
            .handle_announce(&self.registry, ieee, nwk, now)
        {
            Ok(device) => device,
            Err(JoinError::UnknownDevice(_)) => {
                warn!(ieee = %ieee, nwk = %nwk, "Announce from a device that never joined");
                return Ok(());
            }
            Err(JoinError::InvalidTransition {
                from: CommissioningState::Leaving,
                ..
            }) => {
                info!(ieee = %ieee, nwk = %nwk, "Announce from a device being removed ignored");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let name = device.name();
        let needs_interview = device.endpoints.is_empty() || device.model.is_none();
        if let Some(holder) = self.registry.upsert(device)? {
            self.on_displaced(holder);
        }
        for tx in self.pending.values_mut().filter(|t| t.ieee == ieee) {
            tx.nwk = nwk;
        }

        info!(device = %name, nwk = %nwk, "Device announced");
        self.set_availability(&name, true);
        self.publish_event(
            "device_announce",
            json!({
                "ieee_address": ieee.to_string(),
                "network_address": nwk.0,
                "friendly_name": name,
            }),
        );
        if needs_interview {
            self.send(&RadioMessage::EndpointsRequest { nwk });
        }
        self.publish_devices();
        Ok(())
    }

    /// Another device took over the short address of `holder`.
    fn on_displaced(&mut self, holder: IeeeAddress) {
        let name = match self.registry.get(DeviceRef::Ieee(holder)) {
            Ok(device) => device.name(),
            Err(_) => return,
        };
        self.cancel_pending_for(holder);
        self.set_availability(&name, false);
    }

    fn on_leave_indication(&mut self, nwk: ShortAddress) -> Result<(), RouterError> {
        match self.coordinator.handle_leave(&self.registry, nwk) {
            Ok(outcome) => self.finish_leave(outcome, "device_leave"),
            Err(JoinError::UnknownDevice(_)) => {
                debug!(nwk = %nwk, "Leave indication from unknown address");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Revoke the address and drop the device. If the revocation cannot be
    /// sent the device stays `Leaving` until the adapter reconnects.
    fn finish_leave(&mut self, outcome: LeaveOutcome, event: &str) -> Result<(), RouterError> {
        let LeaveOutcome { device, revoke } = outcome;
        let ieee = device.ieee;
        let name = device.name();

        self.cancel_pending_for(ieee);
        self.registry.upsert(device.clone())?;
        if !self.send(&revoke) {
            warn!(device = %name, "Address revocation not sent, retrying on reconnect");
            return Ok(());
        }

        let device = self.coordinator.complete_leave(device)?;
        self.registry.remove(ieee)?;
        if let Err(e) = self.availability.forget(&name) {
            warn!(device = %name, error = %e, "Failed to clear availability");
        }
        self.clear_retained(&self.topics.device_state(&name));

        info!(device = %name, ieee = %ieee, state = %device.state, "Device removed");
        self.publish_event(
            event,
            json!({ "ieee_address": ieee.to_string(), "friendly_name": name }),
        );
        self.publish_devices();
        Ok(())
    }

    fn on_endpoints(
        &mut self,
        nwk: ShortAddress,
        endpoints: Vec<Endpoint>,
    ) -> Result<(), RouterError> {
        let Ok(device) = self.registry.get(DeviceRef::Nwk(nwk)) else {
            debug!(nwk = %nwk, "Endpoints from unknown address");
            return Ok(());
        };
        let ieee = device.ieee;

        self.registry.update(ieee, |device| {
            let mut merged = Vec::with_capacity(endpoints.len());
            for mut endpoint in endpoints {
                if let Some(known) = device.endpoint(endpoint.id) {
                    endpoint.attributes = known.attributes.clone();
                }
                merged.push(endpoint);
            }
            device.endpoints = merged;
        })?;

        let device = self.registry.get(DeviceRef::Ieee(ieee))?.clone();
        info!(device = %device.name(), endpoints = device.endpoints.len(), "Endpoints discovered");

        if device.manufacturer.is_none() || device.model.is_none() {
            let endpoint = device
                .endpoint_for_cluster(clusters::BASIC)
                .or_else(|| device.endpoints.first().map(|e| e.id))
                .unwrap_or(1);
            let read = Outbound::read(
                endpoint,
                clusters::BASIC,
                vec![clusters::BASIC_MANUFACTURER, clusters::BASIC_MODEL],
            );
            self.start_transaction(&device, read, Origin::Interview)?;
        } else {
            self.publish_devices();
        }
        Ok(())
    }

    fn on_zcl(&mut self, envelope: ZclEnvelope, now: DateTime<Utc>) -> Result<(), RouterError> {
        let ZclEnvelope {
            nwk,
            endpoint,
            cluster,
            payload,
        } = envelope;

        let Ok(device) = self.registry.get(DeviceRef::Nwk(nwk)) else {
            debug!(nwk = %nwk, cluster, "Frame from unknown short address dropped");
            return Ok(());
        };
        let ieee = device.ieee;

        if self.registry.mark_seen(ieee, now)? {
            let name = self.registry.get(DeviceRef::Ieee(ieee))?.name();
            info!(device = %name, "Device back online");
            self.set_availability(&name, true);
        }

        let frame = match translator::decode(cluster, &payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(nwk = %nwk, cluster, error = %e, "Malformed ZCL frame discarded");
                return Ok(());
            }
        };

        let transaction = if frame.is_response() {
            let found = self.take_pending(frame.seq, nwk);
            if found.is_none() {
                debug!(seq = frame.seq, nwk = %nwk, "Response matches no pending transaction");
            }
            found
        } else {
            None
        };

        if let FrameKind::Other(command) = frame.kind {
            debug!(nwk = %nwk, cluster, command, "Unhandled global command");
        }

        let force = transaction
            .as_ref()
            .is_some_and(|t| t.origin == Origin::Read);
        self.apply_fields(ieee, endpoint, &frame.fields, now, force)?;

        if let Some(tx) = transaction {
            self.complete(tx, &frame, now)?;
        }
        Ok(())
    }

    /// Merge decoded fields into the device and publish its state when
    /// something changed (or always, when `force` is set).
    fn apply_fields(
        &mut self,
        ieee: IeeeAddress,
        endpoint: u8,
        fields: &Map<String, Value>,
        now: DateTime<Utc>,
        force: bool,
    ) -> Result<(), RouterError> {
        if fields.is_empty() && !force {
            return Ok(());
        }

        let mut state = fields.clone();
        let manufacturer = state.remove("manufacturer");
        let model = state.remove("model");
        if manufacturer.is_some() || model.is_some() {
            self.registry.update(ieee, |device| {
                if let Some(Value::String(m)) = manufacturer {
                    device.manufacturer = Some(m);
                }
                if let Some(Value::String(m)) = model {
                    device.model = Some(m);
                }
            })?;
        }

        let changed = if state.is_empty() {
            Map::new()
        } else {
            self.registry
                .update_attributes(ieee, endpoint, &state, now)?
        };

        if !changed.is_empty() || force {
            let device = self.registry.get(DeviceRef::Ieee(ieee))?;
            trace!(device = %device.name(), changed = changed.len(), "State updated");
            self.publish_state(device);
        }
        Ok(())
    }

    fn complete(
        &mut self,
        tx: PendingTransaction,
        frame: &DecodedFrame,
        now: DateTime<Utc>,
    ) -> Result<(), RouterError> {
        let success = frame.is_success();
        debug!(
            seq = tx.seq,
            device = %tx.device,
            attempts = tx.attempts,
            success,
            "Transaction completed"
        );

        match tx.origin {
            Origin::Command if success => {
                let failed_before = self
                    .registry
                    .get(DeviceRef::Ieee(tx.ieee))
                    .is_ok_and(|d| d.last_command_failed);
                if failed_before {
                    self.registry
                        .update(tx.ieee, |d| d.last_command_failed = false)?;
                }
                self.apply_fields(tx.ieee, tx.outbound.endpoint, &tx.outbound.expected, now, false)
            }
            Origin::Command | Origin::Read if !success && frame.fields.is_empty() => {
                self.publish_status(
                    &tx.device,
                    json!({
                        "status": "error",
                        "message": format!("device returned status 0x{:02x}", frame.status),
                    }),
                );
                Ok(())
            }
            Origin::Command | Origin::Read => Ok(()),
            Origin::Interview => self.finish_interview(tx.ieee, success),
        }
    }

    fn finish_interview(&mut self, ieee: IeeeAddress, success: bool) -> Result<(), RouterError> {
        let device = self.registry.get(DeviceRef::Ieee(ieee))?;
        let definition = self
            .definitions
            .identify(device.model.as_deref(), device.manufacturer.as_deref());
        let status = if success && device.model.is_some() {
            "successful"
        } else {
            "failed"
        };

        info!(
            device = %device.name(),
            manufacturer = device.manufacturer.as_deref().unwrap_or("unknown"),
            model = device.model.as_deref().unwrap_or("unknown"),
            supported = definition.is_some(),
            "Interview {}",
            status
        );
        self.publish_event(
            "device_interview",
            json!({
                "ieee_address": ieee.to_string(),
                "friendly_name": device.name(),
                "status": status,
                "supported": definition.is_some(),
                "definition": definition.map(|d| json!({
                    "model": d.model_id,
                    "vendor": d.vendor,
                    "description": d.description,
                })),
            }),
        );
        self.publish_devices();
        Ok(())
    }

    fn on_timer(&mut self, timer: TimerEvent, now: DateTime<Utc>) -> Result<(), RouterError> {
        match timer {
            TimerEvent::TransactionTimeout { seq, attempt } => {
                let in_flight = self
                    .pending
                    .get(&seq)
                    .is_some_and(|t| t.deadline.is_some());
                if !self.is_current(seq, attempt) || !in_flight {
                    trace!(seq, attempt, "Stale timeout ignored");
                    return Ok(());
                }
                if let Some(tx) = self.pending.get(&seq) {
                    debug!(seq, device = %tx.device, attempt, "Transaction timed out");
                }
                self.attempt_failed(seq)
            }
            TimerEvent::RetryDue { seq, attempt } => {
                if !self.is_current(seq, attempt) {
                    trace!(seq, attempt, "Stale retry ignored");
                    return Ok(());
                }
                self.send_attempt(seq)
            }
            TimerEvent::OfflineSweep => {
                self.scheduler
                    .schedule(self.offline_sweep, TimerEvent::OfflineSweep);
                for device in self.registry.sweep_offline(now)? {
                    info!(device = %device.name(), last_seen = ?device.last_seen, "Device offline");
                    self.set_availability(&device.name(), false);
                }
                Ok(())
            }
            TimerEvent::PermitJoinExpired { generation } => {
                if let Some(message) = self.coordinator.close_permit_join(generation) {
                    self.send(&message);
                    self.publish_event("permit_join", json!({ "value": false, "time": 0 }));
                }
                Ok(())
            }
        }
    }

    fn on_bus(&mut self, message: BusMessage, now: DateTime<Utc>) -> Result<(), RouterError> {
        let Some(parsed) = parse_topic(self.topics.base(), &message.topic) else {
            trace!(topic = %message.topic, "Ignoring bus message");
            return Ok(());
        };
        match parsed {
            ParsedTopic::DeviceSet(name) => self.on_set(name, &message.payload, now),
            ParsedTopic::DeviceGet(name) => self.on_get(name, &message.payload, now),
            ParsedTopic::BridgeRequest(request) => {
                self.on_bridge_request(request, &message.payload, now);
                Ok(())
            }
        }
    }

    /// Look a device up by topic name, syncing its availability with the
    /// lazy offline check.
    fn lookup(&mut self, name: &str, now: DateTime<Utc>) -> Result<Option<Device>, RouterError> {
        match self.registry.query(DeviceRef::Name(name), now) {
            Ok(device) => {
                if !device.online && device.state.is_commissioned() {
                    self.set_availability(&device.name(), false);
                }
                Ok(Some(device))
            }
            Err(RegistryError::NotFound(_)) => {
                warn!(device = %name, "Request for unknown device");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn on_set(&mut self, name: &str, payload: &[u8], now: DateTime<Utc>) -> Result<(), RouterError> {
        let Some(device) = self.lookup(name, now)? else {
            return Ok(());
        };
        let fields = match self.command_fields(&device, payload) {
            Some(fields) => fields,
            None => return Ok(()),
        };
        let definition = self
            .definitions
            .identify(device.model.as_deref(), device.manufacturer.as_deref())
            .cloned();

        for (field, value) in fields {
            let checked = match &definition {
                Some(definition) => definition.validate_set(&field, &value),
                None => Ok(()),
            };
            let encoded =
                checked.and_then(|()| translator::encode(&Action::Set(value), &device, &field));
            match encoded {
                Ok(outbound) => {
                    self.start_transaction(&device, outbound, Origin::Command)?;
                }
                Err(e) => self.reject(&device.name(), &field, &e),
            }
        }
        Ok(())
    }

    fn on_get(&mut self, name: &str, payload: &[u8], now: DateTime<Utc>) -> Result<(), RouterError> {
        let Some(device) = self.lookup(name, now)? else {
            return Ok(());
        };
        let fields = match self.command_fields(&device, payload) {
            Some(fields) => fields,
            None => return Ok(()),
        };
        let definition = self
            .definitions
            .identify(device.model.as_deref(), device.manufacturer.as_deref())
            .cloned();
        let max_age = self.transactions.cache_max_age();

        let mut served = false;
        for field in fields.keys() {
            if let Some(Err(e)) = definition.as_ref().map(|d| d.validate_get(field)) {
                self.reject(&device.name(), field, &e);
                continue;
            }
            if self
                .registry
                .cached(device.ieee, field, now, max_age)
                .is_some()
            {
                trace!(device = %device.name(), field = %field, "Get served from cache");
                served = true;
                continue;
            }
            match translator::encode(&Action::Get, &device, field) {
                Ok(outbound) => {
                    self.start_transaction(&device, outbound, Origin::Read)?;
                }
                Err(e) => self.reject(&device.name(), field, &e),
            }
        }

        if served {
            let device = self.registry.get(DeviceRef::Ieee(device.ieee))?;
            self.publish_state(device);
        }
        Ok(())
    }

    /// Parse a `/set` or `/get` payload; rejects it on the status topic if
    /// it is not a JSON object or the device is not commissioned.
    fn command_fields(&self, device: &Device, payload: &[u8]) -> Option<Map<String, Value>> {
        let parsed = if !device.state.is_commissioned() {
            Err(format!("device is {}", device.state))
        } else {
            match serde_json::from_slice::<Value>(payload) {
                Ok(Value::Object(fields)) => Ok(fields),
                Ok(other) => Err(format!("expected a JSON object, got {}", other)),
                Err(e) => Err(format!("invalid JSON: {}", e)),
            }
        };
        match parsed {
            Ok(fields) => Some(fields),
            Err(message) => {
                warn!(device = %device.name(), error = %message, "Command rejected");
                self.publish_status(
                    &device.name(),
                    json!({ "status": "error", "message": message }),
                );
                None
            }
        }
    }

    fn reject(&self, device: &str, field: &str, error: &EncodingError) {
        warn!(device = %device, field = %field, error = %error, "Command rejected");
        self.publish_status(
            device,
            json!({ "status": "error", "field": field, "message": error.to_string() }),
        );
    }

    fn on_bridge_request(&mut self, request: &str, payload: &[u8], now: DateTime<Utc>) {
        let body: Value = if payload.is_empty() {
            Value::Null
        } else {
            match serde_json::from_slice(payload) {
                Ok(body) => body,
                Err(e) => {
                    self.respond(request, None, Err(format!("invalid JSON: {}", e)));
                    return;
                }
            }
        };
        let transaction = body.get("transaction").cloned();
        debug!(request = %request, "Bridge request");

        let result = match request {
            "permit_join" => self.request_permit_join(&body, now),
            "device/remove" => self.request_remove(&body),
            "device/rename" => self.request_rename(&body),
            "network/form" => self.request_form(&body, now),
            "devices" => {
                self.publish_devices();
                Ok(json!({ "count": self.registry.len() }))
            }
            other => Err(format!("unknown request '{}'", other)),
        };
        self.respond(request, transaction, result);
    }

    fn respond(&self, request: &str, transaction: Option<Value>, result: Result<Value, String>) {
        let mut response = match result {
            Ok(data) => json!({ "status": "ok", "data": data }),
            Err(error) => {
                warn!(request = %request, error = %error, "Bridge request failed");
                json!({ "status": "error", "data": {}, "error": error })
            }
        };
        if let Some(transaction) = transaction {
            response["transaction"] = transaction;
        }
        self.publish(&self.topics.bridge_response(request), &response, false);
    }

    fn request_permit_join(&mut self, body: &Value, now: DateTime<Utc>) -> Result<Value, String> {
        let request = match body {
            Value::Bool(value) => PermitJoinRequest {
                value: *value,
                time: None,
            },
            Value::Null => PermitJoinRequest {
                value: true,
                time: None,
            },
            other => parse_request(other)?,
        };
        let duration = if request.value {
            request.time.unwrap_or(self.permit_join_secs)
        } else {
            0
        };

        let (message, generation) = self
            .coordinator
            .permit_join(duration, now)
            .map_err(|e| e.to_string())?;
        if !self.send(&message) {
            self.coordinator.close_permit_join(generation);
            return Err("radio adapter unavailable".to_string());
        }
        if duration > 0 {
            self.scheduler.schedule(
                Duration::from_secs(u64::from(duration)),
                TimerEvent::PermitJoinExpired { generation },
            );
        }

        let data = json!({ "value": duration > 0, "time": duration });
        self.publish_event("permit_join", data.clone());
        Ok(data)
    }

    fn request_remove(&mut self, body: &Value) -> Result<Value, String> {
        let request: RemoveRequest = parse_request(body)?;
        let device = self
            .registry
            .get(DeviceRef::Name(&request.id))
            .map_err(|e| e.to_string())?
            .clone();
        let ieee = device.ieee;

        if !request.force {
            let leave = self
                .coordinator
                .leave_request(&device)
                .map_err(|e| e.to_string())?;
            if !self.send(&leave) {
                return Err("radio adapter unavailable, use force to remove anyway".to_string());
            }
        }

        let outcome = self
            .coordinator
            .begin_leave(device)
            .map_err(|e| e.to_string())?;
        self.finish_leave(outcome, "device_removed")
            .map_err(|e| e.to_string())?;
        Ok(json!({
            "id": request.id,
            "ieee_address": ieee.to_string(),
            "force": request.force,
        }))
    }

    fn request_rename(&mut self, body: &Value) -> Result<Value, String> {
        let request: RenameRequest = parse_request(body)?;
        if !is_valid_device_name(&request.to) || request.to.parse::<IeeeAddress>().is_ok() {
            return Err(format!("'{}' cannot be used as a device name", request.to));
        }
        if self.registry.get(DeviceRef::Name(&request.to)).is_ok() {
            return Err(format!("name '{}' is already in use", request.to));
        }

        let device = self
            .registry
            .get(DeviceRef::Name(&request.from))
            .map_err(|e| e.to_string())?;
        let ieee = device.ieee;
        let old = device.name();

        let to = request.to.clone();
        self.registry
            .update(ieee, |d| d.friendly_name = Some(to))
            .map_err(|e| e.to_string())?;
        if let Err(e) = self.availability.rename(&old, &request.to) {
            warn!(device = %request.to, error = %e, "Failed to move availability");
        }
        for tx in self.pending.values_mut().filter(|t| t.ieee == ieee) {
            tx.device = request.to.clone();
        }

        self.clear_retained(&self.topics.device_state(&old));
        if let Ok(device) = self.registry.get(DeviceRef::Ieee(ieee)) {
            self.publish_state(device);
        }
        self.publish_devices();
        info!(from = %old, to = %request.to, "Device renamed");
        Ok(json!({ "from": old, "to": request.to }))
    }

    fn request_form(&mut self, body: &Value, now: DateTime<Utc>) -> Result<Value, String> {
        let request = if body.is_null() {
            FormNetworkRequest {
                params: self.configured_network.clone(),
                force: false,
            }
        } else {
            parse_request(body)?
        };

        let network = if request.force {
            let network = self
                .coordinator
                .reform(&request.params, now)
                .map_err(|e| e.to_string())?;
            self.pending.clear();
            let removed = self.registry.clear().map_err(|e| e.to_string())?;
            for device in &removed {
                let name = device.name();
                if let Err(e) = self.availability.forget(&name) {
                    warn!(device = %name, error = %e, "Failed to clear availability");
                }
                self.clear_retained(&self.topics.device_state(&name));
            }
            warn!(removed = removed.len(), "Registry cleared after re-formation");
            network
        } else {
            self.coordinator
                .form_network(&request.params, now)
                .map_err(|e| e.to_string())?
        };

        if request.force || !self.coordinator.is_started() {
            if let Some(message) = self.coordinator.start_message() {
                self.send(&message);
            }
        }
        self.publish_devices();

        Ok(json!({
            "channel": network.params.channel,
            "pan_id": network.params.pan_id,
            "extended_pan_id": network.params.extended_pan_id.to_string(),
        }))
    }

    /// Create a transaction with a fresh sequence number and send it.
    fn start_transaction(
        &mut self,
        device: &Device,
        outbound: Outbound,
        origin: Origin,
    ) -> Result<(), RouterError> {
        let Some(seq) = self.allocate_seq() else {
            warn!(device = %device.name(), "No free transaction sequence number");
            self.publish_status(
                &device.name(),
                json!({ "status": "error", "message": "too many pending transactions" }),
            );
            return Ok(());
        };

        self.pending.insert(
            seq,
            PendingTransaction {
                seq,
                ieee: device.ieee,
                nwk: device.nwk,
                device: device.name(),
                sleepy: device.is_sleepy(),
                outbound,
                attempts: 0,
                deadline: None,
                origin,
            },
        );
        self.send_attempt(seq)
    }

    fn allocate_seq(&mut self) -> Option<u8> {
        for _ in 0..=u8::MAX {
            let seq = self.next_seq;
            self.next_seq = self.next_seq.wrapping_add(1);
            if !self.pending.contains_key(&seq) {
                return Some(seq);
            }
        }
        None
    }

    fn send_attempt(&mut self, seq: u8) -> Result<(), RouterError> {
        let Some(tx) = self.pending.get_mut(&seq) else {
            return Ok(());
        };
        tx.attempts += 1;
        let attempt = tx.attempts;
        let timeout = self.transactions.timeout(tx.sleepy);
        let message = RadioMessage::Zcl(tx.outbound.envelope(tx.nwk, seq));
        let device = tx.device.clone();

        match self.radio.send(&message) {
            Ok(()) => {
                if let Some(tx) = self.pending.get_mut(&seq) {
                    tx.deadline = Some(Instant::now() + timeout);
                }
                trace!(seq, device = %device, attempt, "Transaction sent");
                self.scheduler
                    .schedule(timeout, TimerEvent::TransactionTimeout { seq, attempt });
                Ok(())
            }
            Err(e) => {
                warn!(seq, device = %device, attempt, error = %e, "Transaction send failed");
                self.attempt_failed(seq)
            }
        }
    }

    fn is_current(&self, seq: u8, attempt: u8) -> bool {
        self.pending
            .get(&seq)
            .is_some_and(|t| t.attempts == attempt)
    }

    fn attempt_failed(&mut self, seq: u8) -> Result<(), RouterError> {
        let Some(tx) = self.pending.get_mut(&seq) else {
            return Ok(());
        };
        tx.deadline = None;
        if tx.attempts < self.transactions.max_attempts {
            self.scheduler.schedule(
                self.transactions.retry_delay(),
                TimerEvent::RetryDue {
                    seq,
                    attempt: tx.attempts,
                },
            );
            return Ok(());
        }
        self.exhaust(seq)
    }

    /// Give up on a transaction: one failure notification, no more retries.
    fn exhaust(&mut self, seq: u8) -> Result<(), RouterError> {
        let Some(tx) = self.pending.remove(&seq) else {
            return Ok(());
        };
        warn!(seq, device = %tx.device, attempts = tx.attempts, "Device unreachable, giving up");

        if tx.origin == Origin::Interview {
            return self.finish_interview(tx.ieee, false);
        }
        self.publish_status(&tx.device, json!({ "status": "unreachable" }));
        self.registry
            .update(tx.ieee, |d| d.last_command_failed = true)?;
        Ok(())
    }

    fn take_pending(&mut self, seq: u8, nwk: ShortAddress) -> Option<PendingTransaction> {
        if self.pending.get(&seq).is_some_and(|t| t.nwk == nwk) {
            self.pending.remove(&seq)
        } else {
            None
        }
    }

    fn cancel_pending_for(&mut self, ieee: IeeeAddress) {
        let before = self.pending.len();
        self.pending.retain(|_, t| t.ieee != ieee);
        let dropped = before - self.pending.len();
        if dropped > 0 {
            debug!(ieee = %ieee, dropped, "Pending transactions dropped");
        }
    }

    fn send(&self, message: &RadioMessage) -> bool {
        match self.radio.send(message) {
            Ok(()) => true,
            Err(e) => {
                warn!(kind = message.kind(), error = %e, "Radio send failed");
                false
            }
        }
    }

    fn set_availability(&mut self, device: &str, online: bool) {
        if let Err(e) = self
            .availability
            .set(device, Availability::from_online(online))
        {
            warn!(device = %device, error = %e, "Failed to publish availability");
        }
    }

    fn publish(&self, topic: &str, value: &Value, retain: bool) {
        if let Err(e) = self.bus.publish_json(topic, value, retain) {
            warn!(topic = %topic, error = %e, "Publish failed");
        }
    }

    /// An empty retained payload deletes the retained message.
    fn clear_retained(&self, topic: &str) {
        if let Err(e) = self.bus.publish(topic, Vec::new(), true) {
            warn!(topic = %topic, error = %e, "Failed to clear retained message");
        }
    }

    fn publish_state(&self, device: &Device) {
        self.publish(
            &self.topics.device_state(&device.name()),
            &Value::Object(device.state_document()),
            true,
        );
    }

    fn publish_status(&self, device: &str, status: Value) {
        self.publish(&self.topics.device_status(device), &status, false);
    }

    fn publish_event(&self, name: &str, data: Value) {
        self.publish(&self.topics.bridge_event(name), &data, false);
    }

    fn publish_devices(&self) {
        let devices: Vec<Value> = self.registry.list().iter().map(Device::summary).collect();
        self.publish(&self.topics.bridge_devices(), &Value::Array(devices), true);
    }
}

fn parse_request<T: DeserializeOwned>(body: &Value) -> Result<T, String> {
    serde_json::from_value(body.clone()).map_err(|e| format!("invalid request: {}", e))
}
