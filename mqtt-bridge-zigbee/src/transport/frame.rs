//! Serial framing: `0xFE | len | payload | fcs`.
//!
//! `fcs` is the XOR of the length byte and every payload byte. The decoder
//! resynchronises on the next start byte after garbage, a bad checksum, or an
//! impossible length; such frames are logged and dropped.

use tracing::warn;

use super::TransportError;

/// Start-of-frame marker.
pub const START_OF_FRAME: u8 = 0xFE;

/// Largest payload a frame can carry.
pub const MAX_PAYLOAD: usize = 250;

/// Frame check sequence over the length byte and payload.
pub fn checksum(len: u8, payload: &[u8]) -> u8 {
    payload.iter().fold(len, |acc, b| acc ^ b)
}

/// Wrap a payload in a frame.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, TransportError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(TransportError::Oversize(payload.len()));
    }
    let len = payload.len() as u8;
    let mut frame = Vec::with_capacity(payload.len() + 3);
    frame.push(START_OF_FRAME);
    frame.push(len);
    frame.extend_from_slice(payload);
    frame.push(checksum(len, payload));
    Ok(frame)
}

/// Incremental frame decoder fed with raw serial reads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    discarded: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of frames (or garbage runs) dropped so far.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Bytes buffered waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Feed bytes and return every complete, valid payload.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(bytes);
        let mut payloads = Vec::new();

        loop {
            match self.buf.iter().position(|&b| b == START_OF_FRAME) {
                Some(0) => {}
                Some(skip) => {
                    warn!(bytes = skip, "Discarding garbage before frame start");
                    self.discarded += 1;
                    self.buf.drain(..skip);
                }
                None => {
                    if !self.buf.is_empty() {
                        warn!(bytes = self.buf.len(), "Discarding garbage without frame start");
                        self.discarded += 1;
                        self.buf.clear();
                    }
                    break;
                }
            }

            let Some(&len) = self.buf.get(1) else {
                break;
            };
            let len = len as usize;
            if len > MAX_PAYLOAD {
                warn!(len, "Discarding frame with oversize length");
                self.discarded += 1;
                self.buf.drain(..1);
                continue;
            }

            let total = len + 3;
            if self.buf.len() < total {
                break;
            }

            let payload = &self.buf[2..2 + len];
            let fcs = self.buf[2 + len];
            let expected = checksum(len as u8, payload);
            if fcs != expected {
                warn!(
                    len,
                    fcs = format!("0x{:02x}", fcs),
                    expected = format!("0x{:02x}", expected),
                    "Discarding frame with bad checksum"
                );
                self.discarded += 1;
                self.buf.drain(..1);
                continue;
            }

            payloads.push(payload.to_vec());
            self.buf.drain(..total);
        }

        payloads
    }
}
