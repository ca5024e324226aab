//! MQTT bridge for Zigbee networks.
//!
//! The bridge drives a serial radio adapter, forms and commissions the
//! Zigbee network, and exposes every device on the broker as JSON state.
//!
//! # Topics
//!
//! ```text
//! <base>/<device>                  retained aggregated state
//! <base>/<device>/set              commands, e.g. {"state":"ON"}
//! <base>/<device>/get              reads, e.g. {"temperature":""}
//! <base>/<device>/availability     online / offline (retained)
//! <base>/<device>/status           transaction failures
//! <base>/bridge/request/<name>     permit_join, device/remove, device/rename,
//!                                  network/form, devices
//! <base>/bridge/response/<name>
//! <base>/bridge/event/<name>
//! ```
//!
//! Where:
//! - `<base>` - configured base topic, `zigbee2mqtt` by default
//! - `<device>` - friendly name, or the IEEE address as `0x` + 16 hex digits
//!
//! # Modules
//!
//! - [`transport`] - serial framing, adapter messages and the link supervisor
//! - [`coordinator`] - network formation, permit join, joins and leaves
//! - [`registry`] - persisted device registry with attribute cache
//! - [`translator`] - ZCL codecs and the cluster mapping table
//! - [`router`] - the single event loop correlating commands and responses

pub mod config;
pub mod coordinator;
pub mod definitions;
pub mod events;
pub mod persist;
pub mod registry;
pub mod router;
pub mod translator;
pub mod transport;
pub mod types;
pub(crate) mod wire;
