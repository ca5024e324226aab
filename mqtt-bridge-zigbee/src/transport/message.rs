//! Adapter messages carried inside serial frames.
//!
//! The first payload byte is the command id; all integers are little-endian.

use crate::types::{Endpoint, IeeeAddress, NetworkKey, ShortAddress};
use crate::wire::ByteReader;

use super::TransportError;

const START_NETWORK: u8 = 0x01;
const PERMIT_JOIN: u8 = 0x02;
const JOIN_ACCEPT: u8 = 0x03;
const JOIN_REJECT: u8 = 0x04;
const LEAVE_REQUEST: u8 = 0x05;
const ENDPOINTS_REQUEST: u8 = 0x06;
const REVOKE_ADDRESS: u8 = 0x07;
const ZCL: u8 = 0x20;
const NETWORK_STARTED: u8 = 0x81;
const JOIN_REQUEST: u8 = 0x82;
const DEVICE_ANNOUNCE: u8 = 0x83;
const LEAVE_INDICATION: u8 = 0x84;
const ENDPOINTS_RESPONSE: u8 = 0x85;

/// Reasons sent with a join rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RejectReason {
    NotPermitted = 0x01,
    InvalidCapabilities = 0x02,
    AddressSpaceFull = 0x03,
    NoNetwork = 0x04,
}

impl RejectReason {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(Self::NotPermitted),
            0x02 => Some(Self::InvalidCapabilities),
            0x03 => Some(Self::AddressSpaceFull),
            0x04 => Some(Self::NoNetwork),
            _ => None,
        }
    }
}

/// ZCL payload addressed to or from a device endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZclEnvelope {
    pub nwk: ShortAddress,
    pub endpoint: u8,
    pub cluster: u16,
    pub payload: Vec<u8>,
}

/// A message exchanged with the radio adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioMessage {
    // host -> adapter
    StartNetwork {
        channel: u8,
        pan_id: u16,
        extended_pan_id: u64,
        key: NetworkKey,
    },
    PermitJoin {
        duration: u8,
    },
    JoinAccept {
        ieee: IeeeAddress,
        nwk: ShortAddress,
        key: NetworkKey,
    },
    JoinReject {
        ieee: IeeeAddress,
        reason: RejectReason,
    },
    LeaveRequest {
        ieee: IeeeAddress,
        nwk: ShortAddress,
    },
    EndpointsRequest {
        nwk: ShortAddress,
    },
    RevokeAddress {
        nwk: ShortAddress,
    },
    // adapter -> host
    NetworkStarted {
        status: u8,
    },
    JoinRequest {
        ieee: IeeeAddress,
        capabilities: u8,
    },
    DeviceAnnounce {
        ieee: IeeeAddress,
        nwk: ShortAddress,
    },
    LeaveIndication {
        nwk: ShortAddress,
    },
    EndpointsResponse {
        nwk: ShortAddress,
        endpoints: Vec<Endpoint>,
    },
    // both directions
    Zcl(ZclEnvelope),
}

impl RadioMessage {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StartNetwork { .. } => "start_network",
            Self::PermitJoin { .. } => "permit_join",
            Self::JoinAccept { .. } => "join_accept",
            Self::JoinReject { .. } => "join_reject",
            Self::LeaveRequest { .. } => "leave_request",
            Self::EndpointsRequest { .. } => "endpoints_request",
            Self::RevokeAddress { .. } => "revoke_address",
            Self::NetworkStarted { .. } => "network_started",
            Self::JoinRequest { .. } => "join_request",
            Self::DeviceAnnounce { .. } => "device_announce",
            Self::LeaveIndication { .. } => "leave_indication",
            Self::EndpointsResponse { .. } => "endpoints_response",
            Self::Zcl(_) => "zcl",
        }
    }

    /// Serialize into a frame payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        match self {
            Self::StartNetwork {
                channel,
                pan_id,
                extended_pan_id,
                key,
            } => {
                out.push(START_NETWORK);
                out.push(*channel);
                out.extend_from_slice(&pan_id.to_le_bytes());
                out.extend_from_slice(&extended_pan_id.to_le_bytes());
                out.extend_from_slice(&key.0);
            }
            Self::PermitJoin { duration } => {
                out.push(PERMIT_JOIN);
                out.push(*duration);
            }
            Self::JoinAccept { ieee, nwk, key } => {
                out.push(JOIN_ACCEPT);
                out.extend_from_slice(&ieee.0.to_le_bytes());
                out.extend_from_slice(&nwk.0.to_le_bytes());
                out.extend_from_slice(&key.0);
            }
            Self::JoinReject { ieee, reason } => {
                out.push(JOIN_REJECT);
                out.extend_from_slice(&ieee.0.to_le_bytes());
                out.push(*reason as u8);
            }
            Self::LeaveRequest { ieee, nwk } => {
                out.push(LEAVE_REQUEST);
                out.extend_from_slice(&ieee.0.to_le_bytes());
                out.extend_from_slice(&nwk.0.to_le_bytes());
            }
            Self::EndpointsRequest { nwk } => {
                out.push(ENDPOINTS_REQUEST);
                out.extend_from_slice(&nwk.0.to_le_bytes());
            }
            Self::RevokeAddress { nwk } => {
                out.push(REVOKE_ADDRESS);
                out.extend_from_slice(&nwk.0.to_le_bytes());
            }
            Self::NetworkStarted { status } => {
                out.push(NETWORK_STARTED);
                out.push(*status);
            }
            Self::JoinRequest { ieee, capabilities } => {
                out.push(JOIN_REQUEST);
                out.extend_from_slice(&ieee.0.to_le_bytes());
                out.push(*capabilities);
            }
            Self::DeviceAnnounce { ieee, nwk } => {
                out.push(DEVICE_ANNOUNCE);
                out.extend_from_slice(&ieee.0.to_le_bytes());
                out.extend_from_slice(&nwk.0.to_le_bytes());
            }
            Self::LeaveIndication { nwk } => {
                out.push(LEAVE_INDICATION);
                out.extend_from_slice(&nwk.0.to_le_bytes());
            }
            Self::EndpointsResponse { nwk, endpoints } => {
                out.push(ENDPOINTS_RESPONSE);
                out.extend_from_slice(&nwk.0.to_le_bytes());
                out.push(endpoints.len() as u8);
                for endpoint in endpoints {
                    out.push(endpoint.id);
                    out.extend_from_slice(&endpoint.profile_id.to_le_bytes());
                    out.extend_from_slice(&endpoint.device_id.to_le_bytes());
                    out.push(endpoint.in_clusters.len() as u8);
                    for cluster in &endpoint.in_clusters {
                        out.extend_from_slice(&cluster.to_le_bytes());
                    }
                }
            }
            Self::Zcl(envelope) => {
                out.push(ZCL);
                out.extend_from_slice(&envelope.nwk.0.to_le_bytes());
                out.push(envelope.endpoint);
                out.extend_from_slice(&envelope.cluster.to_le_bytes());
                out.extend_from_slice(&envelope.payload);
            }
        }
        out
    }

    /// Parse a frame payload.
    pub fn decode(payload: &[u8]) -> Result<Self, TransportError> {
        let mut r = ByteReader::new(payload);
        let id = r.u8().ok_or_else(|| malformed("empty payload"))?;
        let truncated = || malformed(format!("truncated message 0x{:02x}", id));

        let message = match id {
            START_NETWORK => Self::StartNetwork {
                channel: r.u8().ok_or_else(truncated)?,
                pan_id: r.u16().ok_or_else(truncated)?,
                extended_pan_id: r.u64().ok_or_else(truncated)?,
                key: NetworkKey(r.array().ok_or_else(truncated)?),
            },
            PERMIT_JOIN => Self::PermitJoin {
                duration: r.u8().ok_or_else(truncated)?,
            },
            JOIN_ACCEPT => Self::JoinAccept {
                ieee: IeeeAddress(r.u64().ok_or_else(truncated)?),
                nwk: ShortAddress(r.u16().ok_or_else(truncated)?),
                key: NetworkKey(r.array().ok_or_else(truncated)?),
            },
            JOIN_REJECT => {
                let ieee = IeeeAddress(r.u64().ok_or_else(truncated)?);
                let code = r.u8().ok_or_else(truncated)?;
                let reason = RejectReason::from_u8(code)
                    .ok_or_else(|| malformed(format!("unknown reject reason 0x{:02x}", code)))?;
                Self::JoinReject { ieee, reason }
            }
            LEAVE_REQUEST => Self::LeaveRequest {
                ieee: IeeeAddress(r.u64().ok_or_else(truncated)?),
                nwk: ShortAddress(r.u16().ok_or_else(truncated)?),
            },
            ENDPOINTS_REQUEST => Self::EndpointsRequest {
                nwk: ShortAddress(r.u16().ok_or_else(truncated)?),
            },
            REVOKE_ADDRESS => Self::RevokeAddress {
                nwk: ShortAddress(r.u16().ok_or_else(truncated)?),
            },
            NETWORK_STARTED => Self::NetworkStarted {
                status: r.u8().ok_or_else(truncated)?,
            },
            JOIN_REQUEST => Self::JoinRequest {
                ieee: IeeeAddress(r.u64().ok_or_else(truncated)?),
                capabilities: r.u8().ok_or_else(truncated)?,
            },
            DEVICE_ANNOUNCE => Self::DeviceAnnounce {
                ieee: IeeeAddress(r.u64().ok_or_else(truncated)?),
                nwk: ShortAddress(r.u16().ok_or_else(truncated)?),
            },
            LEAVE_INDICATION => Self::LeaveIndication {
                nwk: ShortAddress(r.u16().ok_or_else(truncated)?),
            },
            ENDPOINTS_RESPONSE => {
                let nwk = ShortAddress(r.u16().ok_or_else(truncated)?);
                let count = r.u8().ok_or_else(truncated)?;
                let mut endpoints = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let id = r.u8().ok_or_else(truncated)?;
                    let profile_id = r.u16().ok_or_else(truncated)?;
                    let device_id = r.u16().ok_or_else(truncated)?;
                    let n = r.u8().ok_or_else(truncated)?;
                    let clusters = (0..n)
                        .map(|_| r.u16().ok_or_else(truncated))
                        .collect::<Result<Vec<_>, _>>()?;
                    endpoints.push(Endpoint::new(id, profile_id, device_id, clusters));
                }
                Self::EndpointsResponse { nwk, endpoints }
            }
            ZCL => Self::Zcl(ZclEnvelope {
                nwk: ShortAddress(r.u16().ok_or_else(truncated)?),
                endpoint: r.u8().ok_or_else(truncated)?,
                cluster: r.u16().ok_or_else(truncated)?,
                payload: r.rest().to_vec(),
            }),
            other => return Err(malformed(format!("unknown command id 0x{:02x}", other))),
        };

        if !r.is_empty() {
            return Err(malformed(format!(
                "{} trailing bytes after message 0x{:02x}",
                r.remaining(),
                id
            )));
        }
        Ok(message)
    }
}

fn malformed(msg: impl Into<String>) -> TransportError {
    TransportError::Malformed(msg.into())
}
