//! Zigbee ↔ MQTT translation.
//!
//! Pure functions from bus commands to ZCL requests and from ZCL frames to
//! state fields. Nothing here touches the registry or the network.
//!
//! - [`zcl`] - ZCL frame and data type codecs
//! - [`clusters`] - per-cluster handlers and the attribute mapping table

pub mod clusters;
pub mod zcl;

pub use clusters::{AttributeSpec, ClusterHandler, SetRequest, find_field};
pub use zcl::{DataType, ZclFrame, ZclHeader, ZclValue};

use serde_json::{Map, Value};
use thiserror::Error;

use crate::transport::ZclEnvelope;
use crate::types::{Device, ShortAddress};

/// Errors turning a bus command into a ZCL request.
#[derive(Debug, Error, PartialEq)]
pub enum EncodingError {
    #[error("Unknown field '{0}'")]
    UnknownField(String),

    #[error("Field '{0}' is read-only")]
    ReadOnly(String),

    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Value {value} for '{field}' is outside {min}..={max}")]
    OutOfRange {
        field: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Device has no endpoint serving cluster 0x{cluster:04x} for '{field}'")]
    NoEndpoint { field: String, cluster: u16 },

    #[error("Model '{model}' does not expose '{field}'")]
    NotExposed { field: String, model: String },
}

/// Errors parsing a ZCL frame.
#[derive(Debug, Error, PartialEq)]
pub enum DecodingError {
    #[error("Truncated ZCL frame: missing {0}")]
    Truncated(&'static str),
}

/// What a bus command asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Set(Value),
    Get,
}

/// ZCL request produced by [`encode`].
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Command { command: u8, payload: Vec<u8> },
    Write { attribute: u16, value: ZclValue },
    Read { attributes: Vec<u16> },
}

/// An encoded request addressed to a device endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub endpoint: u8,
    pub cluster: u16,
    pub request: Request,
    /// State fields confirmed by a successful response.
    pub expected: Map<String, Value>,
}

impl Outbound {
    /// Read request, as used by the interview.
    pub fn read(endpoint: u8, cluster: u16, attributes: Vec<u16>) -> Self {
        Self {
            endpoint,
            cluster,
            request: Request::Read { attributes },
            expected: Map::new(),
        }
    }

    pub fn frame(&self, seq: u8) -> ZclFrame {
        match &self.request {
            Request::Command { command, payload } => ZclFrame {
                header: ZclHeader::cluster_specific(seq, *command),
                payload: payload.clone(),
            },
            Request::Write { attribute, value } => ZclFrame {
                header: ZclHeader::global(seq, zcl::command::WRITE_ATTRIBUTES),
                payload: zcl::encode_write_attributes(&[(*attribute, value.clone())]),
            },
            Request::Read { attributes } => ZclFrame {
                header: ZclHeader::global(seq, zcl::command::READ_ATTRIBUTES),
                payload: zcl::encode_read_attributes(attributes),
            },
        }
    }

    pub fn envelope(&self, nwk: ShortAddress, seq: u8) -> ZclEnvelope {
        ZclEnvelope {
            nwk,
            endpoint: self.endpoint,
            cluster: self.cluster,
            payload: self.frame(seq).encode(),
        }
    }
}

/// Encode a bus command on one state field for `device`.
pub fn encode(action: &Action, device: &Device, field: &str) -> Result<Outbound, EncodingError> {
    let (handler, spec) =
        find_field(field).ok_or_else(|| EncodingError::UnknownField(field.to_string()))?;
    let endpoint = select_endpoint(device, spec)?;

    match action {
        Action::Get => Ok(Outbound::read(endpoint, spec.cluster, vec![spec.attribute])),
        Action::Set(value) => {
            let request = match handler.encode_set(spec, value)? {
                SetRequest::Command { command, payload } => Request::Command { command, payload },
                SetRequest::Write { attribute, value } => Request::Write { attribute, value },
            };
            let mut expected = Map::new();
            if let Some(confirmed) = normalize(spec, value) {
                expected.insert(field.to_string(), confirmed);
            }
            Ok(Outbound {
                endpoint,
                cluster: spec.cluster,
                request,
                expected,
            })
        }
    }
}

/// Endpoint serving the field's cluster. Devices whose endpoints are not
/// known yet are addressed on endpoint 1.
fn select_endpoint(device: &Device, spec: &AttributeSpec) -> Result<u8, EncodingError> {
    match device.endpoint_for_cluster(spec.cluster) {
        Some(id) => Ok(id),
        None if device.endpoints.is_empty() => Ok(1),
        None => Err(EncodingError::NoEndpoint {
            field: spec.field.to_string(),
            cluster: spec.cluster,
        }),
    }
}

/// Value as it will be published once confirmed. A toggle has no known
/// outcome; the device's next report carries it.
fn normalize(spec: &AttributeSpec, value: &Value) -> Option<Value> {
    match (spec.cluster, value) {
        (clusters::ON_OFF, Value::String(s)) if s.eq_ignore_ascii_case("toggle") => None,
        (clusters::ON_OFF, Value::String(s)) => Some(Value::String(s.to_ascii_uppercase())),
        (clusters::ON_OFF, Value::Bool(b)) => {
            Some(Value::String(if *b { "ON" } else { "OFF" }.to_string()))
        }
        _ => Some(value.clone()),
    }
}

/// Kind of an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Report,
    ReadResponse,
    WriteResponse,
    /// Answer to the command with this id.
    DefaultResponse { command: u8 },
    /// Cluster-specific command sent by the device.
    Command(u8),
    /// Global command the bridge does not handle.
    Other(u8),
}

/// Result of [`decode`].
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub seq: u8,
    pub kind: FrameKind,
    pub fields: Map<String, Value>,
    /// First non-success status carried by a response.
    pub status: u8,
}

impl DecodedFrame {
    /// Responses complete pending transactions; everything else is unsolicited.
    pub fn is_response(&self) -> bool {
        matches!(
            self.kind,
            FrameKind::ReadResponse | FrameKind::WriteResponse | FrameKind::DefaultResponse { .. }
        )
    }

    pub fn is_success(&self) -> bool {
        self.status == zcl::status::SUCCESS
    }
}

/// Decode a ZCL frame received on `cluster`.
pub fn decode(cluster: u16, bytes: &[u8]) -> Result<DecodedFrame, DecodingError> {
    let frame = ZclFrame::decode(bytes)?;
    let handler = ClusterHandler::for_cluster(cluster);
    let seq = frame.header.seq;
    let mut fields = Map::new();
    let mut status = zcl::status::SUCCESS;

    if frame.header.is_cluster_specific() {
        return Ok(DecodedFrame {
            seq,
            kind: FrameKind::Command(frame.header.command),
            fields: handler.decode_command(frame.header.command, &frame.payload),
            status,
        });
    }

    let kind = match frame.header.command {
        zcl::command::REPORT_ATTRIBUTES => {
            for record in zcl::decode_report_attributes(&frame.payload)? {
                if let Some(value) = &record.value {
                    let (field, json) = handler.decode_attribute(record.attribute, value);
                    fields.insert(field, json);
                }
            }
            FrameKind::Report
        }
        zcl::command::READ_ATTRIBUTES_RESPONSE => {
            for record in zcl::decode_read_attributes_response(&frame.payload)? {
                match &record.value {
                    Some(value) => {
                        let (field, json) = handler.decode_attribute(record.attribute, value);
                        fields.insert(field, json);
                    }
                    None if status == zcl::status::SUCCESS => status = record.status,
                    None => {}
                }
            }
            FrameKind::ReadResponse
        }
        zcl::command::WRITE_ATTRIBUTES_RESPONSE => {
            if let Some(failed) = zcl::decode_write_attributes_response(&frame.payload)?
                .into_iter()
                .find(|s| s.status != zcl::status::SUCCESS)
            {
                status = failed.status;
            }
            FrameKind::WriteResponse
        }
        zcl::command::DEFAULT_RESPONSE => {
            let (command, code) = zcl::decode_default_response(&frame.payload)?;
            status = code;
            FrameKind::DefaultResponse { command }
        }
        other => FrameKind::Other(other),
    };

    Ok(DecodedFrame {
        seq,
        kind,
        fields,
        status,
    })
}
