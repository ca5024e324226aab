//! Router integration tests against an in-memory bus and a recording radio.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};

use mqtt_bridge_zigbee::config::ZigbeeBridgeConfig;
use mqtt_bridge_zigbee::coordinator::{Coordinator, FormRequest};
use mqtt_bridge_zigbee::definitions::{Definitions, DeviceDefinition};
use mqtt_bridge_zigbee::events::{Event, Intake, Scheduler, TimerEvent};
use mqtt_bridge_zigbee::registry::{DeviceRef, Registry};
use mqtt_bridge_zigbee::router::{Flow, Router, RouterError};
use mqtt_bridge_zigbee::translator::clusters;
use mqtt_bridge_zigbee::translator::zcl::{self, ZclFrame, ZclHeader, ZclValue};
use mqtt_bridge_zigbee::transport::{
    LinkEvent, RadioMessage, RadioSink, RejectReason, TransportError, ZclEnvelope,
};
use mqtt_bridge_zigbee::types::{
    CommissioningState, Device, Endpoint, IeeeAddress, ShortAddress, capability,
};
use zigbridge_framework::{BusMessage, MemoryBus};

const SENSOR: IeeeAddress = IeeeAddress(0x00124b0001abcdef);
const SENSOR_STATE: &str = "zigbee2mqtt/0x00124b0001abcdef";
const SENSOR_STATUS: &str = "zigbee2mqtt/0x00124b0001abcdef/status";

#[derive(Clone, Default)]
struct RecordingRadio {
    sent: Arc<Mutex<Vec<RadioMessage>>>,
    down: Arc<AtomicBool>,
}

impl RadioSink for RecordingRadio {
    fn send(&self, message: &RadioMessage) -> Result<(), TransportError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

impl RecordingRadio {
    fn sent(&self) -> Vec<RadioMessage> {
        self.sent.lock().unwrap().clone()
    }

    fn zcl(&self) -> Vec<ZclEnvelope> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m {
                RadioMessage::Zcl(envelope) => Some(envelope),
                _ => None,
            })
            .collect()
    }
}

#[derive(Clone, Default)]
struct RecordingTimers(Arc<Mutex<Vec<(Duration, TimerEvent)>>>);

impl Scheduler for RecordingTimers {
    fn schedule(&self, after: Duration, event: TimerEvent) {
        self.0.lock().unwrap().push((after, event));
    }
}

impl RecordingTimers {
    fn take(&self) -> Vec<(Duration, TimerEvent)> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

struct Harness {
    router: Router,
    radio: RecordingRadio,
    timers: RecordingTimers,
    bus: Arc<MemoryBus>,
}

impl Harness {
    fn new(registry: Registry) -> Self {
        Self::with_definitions(registry, Definitions::new())
    }

    fn with_definitions(registry: Registry, definitions: Definitions) -> Self {
        let config: ZigbeeBridgeConfig = json5::from_str("{}").unwrap();
        let radio = RecordingRadio::default();
        let timers = RecordingTimers::default();
        let bus = Arc::new(MemoryBus::new());

        let mut coordinator = Coordinator::in_memory();
        coordinator
            .form_network(
                &FormRequest {
                    channel: 15,
                    pan_id: 0x1a62,
                    ..Default::default()
                },
                Utc::now(),
            )
            .unwrap();

        let router = Router::new(
            &config,
            registry,
            coordinator,
            definitions,
            Box::new(radio.clone()),
            bus.clone(),
            Box::new(timers.clone()),
        );
        Self {
            router,
            radio,
            timers,
            bus,
        }
    }

    fn handle(&mut self, event: Event) -> Flow {
        self.router.handle(event).unwrap()
    }

    /// Fire every scheduled timer until none are left.
    fn run_timers(&mut self) {
        for _ in 0..32 {
            let due = self.timers.take();
            if due.is_empty() {
                return;
            }
            for (_, event) in due {
                self.handle(Event::Timer(event));
            }
        }
        panic!("timers kept rescheduling");
    }
}

fn active_device(ieee: IeeeAddress, nwk: u16) -> Device {
    let mut device = Device::new(
        ieee,
        ShortAddress(nwk),
        capability::MAINS_POWERED | capability::RECEIVER_ON_WHEN_IDLE,
    );
    device.state = CommissioningState::Active;
    device.online = true;
    device.last_seen = Some(Utc::now());
    device.endpoints.push(Endpoint::new(
        1,
        0x0104,
        0x0302,
        vec![clusters::BASIC, clusters::ON_OFF, clusters::TEMPERATURE],
    ));
    device
}

fn registry_with(devices: impl IntoIterator<Item = Device>) -> Registry {
    let mut registry = Registry::in_memory(chrono::Duration::minutes(15));
    for device in devices {
        registry.upsert(device).unwrap();
    }
    registry
}

fn radio(message: RadioMessage) -> Event {
    Event::Link(LinkEvent::Frame(message))
}

fn zcl_from(nwk: u16, cluster: u16, header: ZclHeader, payload: Vec<u8>) -> Event {
    radio(RadioMessage::Zcl(ZclEnvelope {
        nwk: ShortAddress(nwk),
        endpoint: 1,
        cluster,
        payload: ZclFrame { header, payload }.encode(),
    }))
}

fn temperature_report(nwk: u16, raw: i16) -> Event {
    zcl_from(
        nwk,
        clusters::TEMPERATURE,
        ZclHeader::global(0x10, zcl::command::REPORT_ATTRIBUTES),
        zcl::encode_report_attributes(&[(0x0000, ZclValue::I16(raw))]),
    )
}

fn bus(topic: &str, payload: Value) -> Event {
    Event::Bus(BusMessage {
        topic: topic.to_string(),
        payload: serde_json::to_vec(&payload).unwrap(),
    })
}

fn seq_of(envelope: &ZclEnvelope) -> u8 {
    ZclFrame::decode(&envelope.payload).unwrap().header.seq
}

#[test]
fn test_temperature_report_publishes_scaled_state() {
    let mut h = Harness::new(registry_with([active_device(SENSOR, 0x0003)]));

    h.handle(temperature_report(0x0003, 2150));
    assert_eq!(h.bus.json_on(SENSOR_STATE), vec![json!({ "temperature": 21.5 })]);

    // Unchanged value is not republished.
    h.handle(temperature_report(0x0003, 2150));
    assert_eq!(h.bus.json_on(SENSOR_STATE).len(), 1);

    h.handle(temperature_report(0x0003, 2200));
    assert_eq!(h.bus.json_on(SENSOR_STATE)[1], json!({ "temperature": 22.0 }));
}

#[test]
fn test_frame_from_unknown_address_is_dropped() {
    let mut h = Harness::new(registry_with([active_device(SENSOR, 0x0003)]));
    h.handle(temperature_report(0x0042, 2150));
    h.handle(zcl_from(0x0003, clusters::TEMPERATURE, ZclHeader::global(1, 0x0A), vec![0x00]));
    assert!(h.bus.json_on(SENSOR_STATE).is_empty());
}

#[test]
fn test_join_assigns_lowest_free_address() {
    let mut h = Harness::new(registry_with([
        active_device(IeeeAddress(1), 0x0001),
        active_device(IeeeAddress(2), 0x0002),
    ]));
    h.handle(bus("zigbee2mqtt/bridge/request/permit_join", json!({ "value": true })));

    let sleepy = IeeeAddress(0x0017880100000003);
    h.handle(radio(RadioMessage::JoinRequest {
        ieee: sleepy,
        capabilities: capability::ALLOCATE_ADDRESS,
    }));

    let device = h.router.registry().get(DeviceRef::Nwk(ShortAddress(0x0003))).unwrap();
    assert_eq!(device.ieee, sleepy);
    assert!(device.is_sleepy());
    assert!(h.radio.sent().iter().any(|m| matches!(
        m,
        RadioMessage::JoinAccept { ieee, nwk: ShortAddress(0x0003), .. } if *ieee == sleepy
    )));
    assert_eq!(
        h.bus.json_on("zigbee2mqtt/bridge/event/device_joined")[0]["network_address"],
        json!(3)
    );
}

#[test]
fn test_join_then_leave_forgets_device() {
    let mut h = Harness::new(Registry::in_memory(chrono::Duration::minutes(15)));
    h.handle(bus("zigbee2mqtt/bridge/request/permit_join", json!({ "value": true, "time": 60 })));

    let ieee = IeeeAddress(0x0017880100000001);
    h.handle(radio(RadioMessage::JoinRequest {
        ieee,
        capabilities: capability::ALLOCATE_ADDRESS,
    }));
    let nwk = h.router.registry().get(DeviceRef::Ieee(ieee)).unwrap().nwk;
    assert_eq!(nwk, ShortAddress(0x0001));

    h.handle(radio(RadioMessage::DeviceAnnounce { ieee, nwk }));
    assert!(h.radio.sent().contains(&RadioMessage::EndpointsRequest { nwk }));
    h.handle(radio(RadioMessage::EndpointsResponse {
        nwk,
        endpoints: vec![Endpoint::new(1, 0x0104, 0x0302, vec![clusters::BASIC])],
    }));
    assert_eq!(h.router.pending().count(), 1);

    h.handle(radio(RadioMessage::LeaveIndication { nwk }));

    assert!(h.router.registry().get(DeviceRef::Ieee(ieee)).is_err());
    assert!(h.router.registry().get(DeviceRef::Nwk(nwk)).is_err());
    assert_eq!(h.router.pending().count(), 0);
    assert!(h.radio.sent().contains(&RadioMessage::RevokeAddress { nwk }));
    assert_eq!(h.bus.json_on("zigbee2mqtt/bridge/event/device_leave").len(), 1);
}

#[test]
fn test_join_rejected_when_permit_join_closed() {
    let mut h = Harness::new(Registry::in_memory(chrono::Duration::minutes(15)));
    let ieee = IeeeAddress(0x0017880100000009);

    h.handle(radio(RadioMessage::JoinRequest { ieee, capabilities: 0 }));
    assert!(h.radio.sent().contains(&RadioMessage::JoinReject {
        ieee,
        reason: RejectReason::NotPermitted,
    }));
    assert!(h.router.registry().is_empty());
}

#[test]
fn test_permit_join_expires() {
    let mut h = Harness::new(Registry::in_memory(chrono::Duration::minutes(15)));
    h.handle(bus("zigbee2mqtt/bridge/request/permit_join", json!({ "value": true, "time": 30 })));

    let due = h.timers.take();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].0, Duration::from_secs(30));
    h.handle(Event::Timer(due[0].1));

    assert_eq!(
        h.radio.sent().last(),
        Some(&RadioMessage::PermitJoin { duration: 0 })
    );
    let events = h.bus.json_on("zigbee2mqtt/bridge/event/permit_join");
    assert_eq!(events, vec![json!({ "value": true, "time": 30 }), json!({ "value": false, "time": 0 })]);
    assert_eq!(
        h.bus.json_on("zigbee2mqtt/bridge/response/permit_join")[0]["status"],
        json!("ok")
    );
}

#[test]
fn test_command_resolved_by_response() {
    let mut h = Harness::new(registry_with([active_device(SENSOR, 0x0003)]));
    h.handle(bus("zigbee2mqtt/0x00124b0001abcdef/set", json!({ "state": "on" })));

    let sent = h.radio.zcl();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].cluster, clusters::ON_OFF);
    let seq = seq_of(&sent[0]);

    // A response from another address does not match.
    h.handle(zcl_from(
        0x0004,
        clusters::ON_OFF,
        ZclHeader::global(seq, zcl::command::DEFAULT_RESPONSE),
        vec![clusters::on_off::ON, zcl::status::SUCCESS],
    ));
    assert_eq!(h.router.pending().count(), 1);

    h.handle(zcl_from(
        0x0003,
        clusters::ON_OFF,
        ZclHeader::global(seq, zcl::command::DEFAULT_RESPONSE),
        vec![clusters::on_off::ON, zcl::status::SUCCESS],
    ));
    assert_eq!(h.router.pending().count(), 0);
    assert_eq!(h.bus.json_on(SENSOR_STATE), vec![json!({ "state": "ON" })]);
    assert!(h.bus.json_on(SENSOR_STATUS).is_empty());
}

#[test]
fn test_unreachable_after_max_attempts() {
    let mut h = Harness::new(registry_with([active_device(SENSOR, 0x0003)]));
    h.handle(bus("zigbee2mqtt/0x00124b0001abcdef/set", json!({ "state": "ON" })));
    let seq = seq_of(&h.radio.zcl()[0]);

    h.run_timers();

    let sent = h.radio.zcl();
    assert_eq!(sent.len(), 3);
    assert!(sent.iter().all(|e| seq_of(e) == seq));
    assert_eq!(h.bus.json_on(SENSOR_STATUS), vec![json!({ "status": "unreachable" })]);
    assert_eq!(h.router.pending().count(), 0);
    assert!(h.router.registry().get(DeviceRef::Ieee(SENSOR)).unwrap().last_command_failed);

    // A late timer for the last attempt changes nothing.
    h.handle(Event::Timer(TimerEvent::TransactionTimeout { seq, attempt: 3 }));
    h.handle(Event::Timer(TimerEvent::RetryDue { seq, attempt: 3 }));
    assert_eq!(h.radio.zcl().len(), 3);
    assert_eq!(h.bus.json_on(SENSOR_STATUS).len(), 1);
}

#[test]
fn test_send_failures_count_as_attempts() {
    let mut h = Harness::new(registry_with([active_device(SENSOR, 0x0003)]));
    h.radio.down.store(true, Ordering::SeqCst);

    h.handle(bus("zigbee2mqtt/0x00124b0001abcdef/set", json!({ "state": "OFF" })));
    let due = h.timers.take();
    assert!(matches!(due[0].1, TimerEvent::RetryDue { attempt: 1, .. }));
    assert_eq!(due[0].0, Duration::from_secs(1));
    for (_, event) in due {
        h.handle(Event::Timer(event));
    }
    h.run_timers();

    assert_eq!(h.bus.json_on(SENSOR_STATUS), vec![json!({ "status": "unreachable" })]);
    assert_eq!(h.router.pending().count(), 0);
}

#[test]
fn test_command_lost_with_link_is_retried() {
    let mut h = Harness::new(registry_with([active_device(SENSOR, 0x0003)]));
    h.handle(bus("zigbee2mqtt/0x00124b0001abcdef/set", json!({ "state": "ON" })));
    let sent = h.radio.zcl();
    let seq = seq_of(&sent[0]);

    h.handle(Event::Link(LinkEvent::Undelivered(vec![RadioMessage::Zcl(
        sent[0].clone(),
    )])));
    let due = h.timers.take();
    assert!(due.iter().any(|(_, e)| *e == TimerEvent::RetryDue { seq, attempt: 1 }));

    // The timeout for the lost attempt no longer counts.
    h.handle(Event::Timer(TimerEvent::TransactionTimeout { seq, attempt: 1 }));
    assert!(h.timers.take().is_empty());

    h.handle(Event::Timer(TimerEvent::RetryDue { seq, attempt: 1 }));
    let sent = h.radio.zcl();
    assert_eq!(sent.len(), 2);
    assert_eq!(seq_of(&sent[1]), seq);
    assert!(h.bus.json_on(SENSOR_STATUS).is_empty());
    assert_eq!(h.router.pending().next().unwrap().attempts, 2);
}

#[test]
fn test_lost_revocation_is_resent_on_reconnect() {
    let mut h = Harness::new(registry_with([active_device(SENSOR, 0x0003)]));
    let revoke = RadioMessage::RevokeAddress {
        nwk: ShortAddress(0x0003),
    };

    h.handle(radio(RadioMessage::LeaveIndication {
        nwk: ShortAddress(0x0003),
    }));
    assert!(h.router.registry().is_empty());

    h.handle(Event::Link(LinkEvent::Undelivered(vec![revoke.clone()])));
    h.handle(Event::Link(LinkEvent::Disconnected {
        reason: "unplugged".to_string(),
    }));
    h.handle(Event::Link(LinkEvent::Connected));

    let revocations = h.radio.sent().into_iter().filter(|m| *m == revoke).count();
    assert_eq!(revocations, 2);

    // Sent once per loss.
    h.handle(Event::Link(LinkEvent::Connected));
    let revocations = h.radio.sent().into_iter().filter(|m| *m == revoke).count();
    assert_eq!(revocations, 2);
}

#[test]
fn test_announce_while_leaving_is_ignored() {
    let mut device = active_device(SENSOR, 0x0003);
    device.state = CommissioningState::Leaving;
    device.online = false;
    let mut h = Harness::new(registry_with([device]));

    h.handle(radio(RadioMessage::DeviceAnnounce {
        ieee: SENSOR,
        nwk: ShortAddress(0x0003),
    }));
    let device = h.router.registry().get(DeviceRef::Ieee(SENSOR)).unwrap();
    assert_eq!(device.state, CommissioningState::Leaving);
    assert!(!device.online);
    assert!(h.bus.json_on("zigbee2mqtt/bridge/event/device_announce").is_empty());

    // The pending revocation still completes the removal.
    h.handle(Event::Link(LinkEvent::Connected));
    assert!(h.router.registry().is_empty());
    assert!(h.radio.sent().contains(&RadioMessage::RevokeAddress {
        nwk: ShortAddress(0x0003),
    }));
}

#[test]
fn test_invalid_command_reports_error() {
    let mut h = Harness::new(registry_with([active_device(SENSOR, 0x0003)]));
    h.handle(bus(
        "zigbee2mqtt/0x00124b0001abcdef/set",
        json!({ "temperature": 20, "volume": 3 }),
    ));

    let statuses = h.bus.json_on(SENSOR_STATUS);
    assert_eq!(statuses.len(), 2);
    assert!(statuses.iter().all(|s| s["status"] == "error"));
    assert!(h.radio.zcl().is_empty());
    assert_eq!(h.router.pending().count(), 0);
}

#[test]
fn test_definition_limits_commands() {
    let definition: DeviceDefinition = json5::from_str(
        r#"{
            model_id: "TS0001",
            exposes: [{ type: "binary", name: "state", property: "state", values: ["ON", "OFF"] }],
        }"#,
    )
    .unwrap();
    let mut definitions = Definitions::new();
    definitions.insert(definition);

    let mut device = active_device(SENSOR, 0x0003);
    device.model = Some("TS0001".to_string());
    let mut h = Harness::with_definitions(registry_with([device]), definitions);

    h.handle(bus("zigbee2mqtt/0x00124b0001abcdef/set", json!({ "state": "DIM" })));
    h.handle(bus("zigbee2mqtt/0x00124b0001abcdef/set", json!({ "color_temp": 300 })));
    assert_eq!(h.bus.json_on(SENSOR_STATUS).len(), 2);
    assert!(h.radio.zcl().is_empty());

    h.handle(bus("zigbee2mqtt/0x00124b0001abcdef/set", json!({ "state": "OFF" })));
    assert_eq!(h.radio.zcl().len(), 1);
}

#[test]
fn test_get_served_from_fresh_cache() {
    let mut h = Harness::new(registry_with([active_device(SENSOR, 0x0003)]));
    let reported = Utc::now();
    h.router
        .handle_at(temperature_report(0x0003, 2150), reported)
        .unwrap();

    let get = || bus("zigbee2mqtt/0x00124b0001abcdef/get", json!({ "temperature": "" }));

    h.router
        .handle_at(get(), reported + chrono::Duration::seconds(30))
        .unwrap();
    assert!(h.radio.zcl().is_empty());
    assert_eq!(h.bus.json_on(SENSOR_STATE).len(), 2);

    h.router
        .handle_at(get(), reported + chrono::Duration::seconds(90))
        .unwrap();
    let sent = h.radio.zcl();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].cluster, clusters::TEMPERATURE);
    assert_eq!(h.router.pending().count(), 1);
}

#[test]
fn test_remove_and_rename_requests() {
    let mut h = Harness::new(registry_with([
        active_device(SENSOR, 0x0003),
        active_device(IeeeAddress(7), 0x0007),
    ]));

    h.handle(bus(
        "zigbee2mqtt/bridge/request/device/rename",
        json!({ "from": "0x00124b0001abcdef", "to": "kitchen", "transaction": "t1" }),
    ));
    let response = &h.bus.json_on("zigbee2mqtt/bridge/response/device/rename")[0];
    assert_eq!(response["status"], "ok");
    assert_eq!(response["transaction"], "t1");
    assert!(h.router.registry().get(DeviceRef::Name("kitchen")).is_ok());

    h.handle(bus(
        "zigbee2mqtt/bridge/request/device/remove",
        json!({ "id": "kitchen" }),
    ));
    assert!(h.router.registry().get(DeviceRef::Ieee(SENSOR)).is_err());
    assert!(h.radio.sent().iter().any(|m| matches!(m, RadioMessage::LeaveRequest { .. })));
    assert_eq!(h.bus.json_on("zigbee2mqtt/bridge/event/device_removed").len(), 1);

    h.handle(bus("zigbee2mqtt/bridge/request/device/remove", json!({ "id": "kitchen" })));
    assert_eq!(
        h.bus.json_on("zigbee2mqtt/bridge/response/device/remove")[1]["status"],
        "error"
    );
    assert_eq!(h.router.registry().len(), 1);
}

#[test]
fn test_form_request_mismatch_fails() {
    let mut h = Harness::new(Registry::in_memory(chrono::Duration::minutes(15)));
    h.handle(bus(
        "zigbee2mqtt/bridge/request/network/form",
        json!({ "channel": 20, "pan_id": 0x1a62 }),
    ));
    let response = &h.bus.json_on("zigbee2mqtt/bridge/response/network/form")[0];
    assert_eq!(response["status"], "error");
    assert_eq!(h.router.coordinator().network().unwrap().params.channel, 15);

    h.handle(bus(
        "zigbee2mqtt/bridge/request/network/form",
        json!({ "channel": 15, "pan_id": 0x1a62 }),
    ));
    let response = &h.bus.json_on("zigbee2mqtt/bridge/response/network/form")[1];
    assert_eq!(response["status"], "ok");
    assert_eq!(response["data"]["channel"], 15);
}

#[test]
fn test_shutdown_cancels_pending() {
    let mut h = Harness::new(registry_with([active_device(SENSOR, 0x0003)]));
    h.handle(bus("zigbee2mqtt/0x00124b0001abcdef/set", json!({ "state": "ON" })));

    assert_eq!(h.handle(Event::Shutdown), Flow::Stop);
    assert_eq!(h.bus.json_on(SENSOR_STATUS), vec![json!({ "status": "cancelled" })]);
    assert_eq!(h.router.pending().count(), 0);
}

#[test]
fn test_link_lost_is_fatal() {
    let mut h = Harness::new(Registry::in_memory(chrono::Duration::minutes(15)));
    let result = h.router.handle(Event::Link(LinkEvent::Lost {
        outage: Duration::from_secs(600),
    }));
    assert!(matches!(result, Err(RouterError::LinkLost(_))));
}

#[test]
fn test_connected_starts_network() {
    let mut h = Harness::new(Registry::in_memory(chrono::Duration::minutes(15)));
    h.handle(Event::Link(LinkEvent::Connected));
    assert!(matches!(
        h.radio.sent().first(),
        Some(RadioMessage::StartNetwork { channel: 15, pan_id: 0x1a62, .. })
    ));

    h.handle(radio(RadioMessage::NetworkStarted { status: 0 }));
    assert!(h.router.coordinator().is_started());
}

#[test]
fn test_offline_sweep_publishes_availability() {
    let mut device = active_device(SENSOR, 0x0003);
    device.last_seen = Some(Utc::now() - chrono::Duration::hours(1));
    let mut h = Harness::new(registry_with([device]));

    h.router
        .handle_at(Event::Timer(TimerEvent::OfflineSweep), Utc::now())
        .unwrap();
    assert_eq!(
        h.bus.json_on("zigbee2mqtt/0x00124b0001abcdef/availability"),
        vec![json!("offline")]
    );
    let due = h.timers.take();
    assert!(matches!(due.as_slice(), [(_, TimerEvent::OfflineSweep)]));

    // Any frame brings it back.
    h.handle(temperature_report(0x0003, 1900));
    assert_eq!(
        h.bus.json_on("zigbee2mqtt/0x00124b0001abcdef/availability"),
        vec![json!("offline"), json!("online")]
    );
}

#[tokio::test]
async fn test_run_drains_until_shutdown() {
    let h = Harness::new(registry_with([active_device(SENSOR, 0x0003)]));
    let (intake, events) = Intake::channel(16);
    let bus = h.bus.clone();
    let core = tokio::spawn(h.router.run(events));

    assert!(intake.submit(temperature_report(0x0003, 2150)).await);
    intake.shutdown().await;
    assert!(!intake.submit(temperature_report(0x0003, 2300)).await);

    core.await.unwrap().unwrap();
    assert_eq!(bus.json_on(SENSOR_STATE), vec![json!({ "temperature": 21.5 })]);
    assert!(!bus.json_on("zigbee2mqtt/bridge/devices").is_empty());
}
