//! Radio adapter transport.
//!
//! - [`frame`] - serial framing with checksum and resynchronisation
//! - [`message`] - adapter command set carried in frames
//! - [`link`] - serial link supervisor with reconnect and outage detection

pub mod frame;
pub mod link;
pub mod message;

pub use frame::{FrameDecoder, MAX_PAYLOAD, encode_frame};
pub use link::{Link, LinkConfig, LinkEvent, LinkHandle, RadioSink};
pub use message::{RadioMessage, RejectReason, ZclEnvelope};

use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to open {path}: {message}")]
    Open { path: String, message: String },

    #[error("Radio link is closed")]
    Closed,

    #[error("Radio send queue is full")]
    QueueFull,

    #[error("Payload of {0} bytes exceeds the frame limit")]
    Oversize(usize),

    #[error("Malformed adapter message: {0}")]
    Malformed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
