//! TLV metadata framing for signed commands.
//!
//! Metadata is an ordered tag/length/value sequence (tags strictly
//! ascending, single-byte tag and length) terminated by a bare `0xFF`
//! separator with no length byte. The HMAC tag is computed over the full
//! encoding including the separator, followed by the command payload.

use crate::errors::{NodeError, Result};

pub const TAG_SIGNATURE_TYPE: u8 = 0x00;
pub const TAG_DOMAIN: u8 = 0x01;
pub const TAG_PERSONALIZATION: u8 = 0x02;
pub const TAG_EPOCH: u8 = 0x03;
pub const TAG_EXPIRES_AT: u8 = 0x04;
pub const TAG_COUNTER: u8 = 0x05;
pub const TAG_FLAGS: u8 = 0x07;

pub const END: u8 = 0xFF;

/// HMAC-PERSONALIZED signature scheme identifier.
pub const SIGNATURE_TYPE_HMAC_PERSONALIZED: u8 = 8;

/// Builds a TLV sequence, enforcing ascending tag order at construction.
pub struct TlvWriter {
    buf: Vec<u8>,
    last_tag: Option<u8>,
}

impl TlvWriter {
    pub fn new() -> Self {
        Self { buf: Vec::with_capacity(64), last_tag: None }
    }

    pub fn push(&mut self, tag: u8, value: &[u8]) -> Result<()> {
        if let Some(last) = self.last_tag {
            if tag <= last {
                return Err(NodeError::Decode(format!(
                    "TLV tags must ascend: {tag:#04x} after {last:#04x}"
                )));
            }
        }
        if value.len() > u8::MAX as usize {
            return Err(NodeError::Decode(format!(
                "TLV value for tag {tag:#04x} exceeds 255 bytes"
            )));
        }
        self.buf.push(tag);
        self.buf.push(value.len() as u8);
        self.buf.extend_from_slice(value);
        self.last_tag = Some(tag);
        Ok(())
    }

    /// Terminate with the bare `0xFF` separator and return the encoding.
    pub fn finish(mut self) -> Vec<u8> {
        self.buf.push(END);
        self.buf
    }
}

/// Decode a TLV sequence up to and including the `0xFF` terminator.
/// Returns the ordered `(tag, value)` entries.
pub fn decode(bytes: &[u8]) -> Result<Vec<(u8, Vec<u8>)>> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    loop {
        let tag = *bytes
            .get(pos)
            .ok_or_else(|| NodeError::Decode("TLV truncated before terminator".into()))?;
        pos += 1;
        if tag == END {
            return Ok(out);
        }
        let len = *bytes
            .get(pos)
            .ok_or_else(|| NodeError::Decode("TLV truncated at length".into()))? as usize;
        pos += 1;
        let value = bytes
            .get(pos..pos + len)
            .ok_or_else(|| NodeError::Decode("TLV truncated in value".into()))?;
        pos += len;
        if let Some((last, _)) = out.last() {
            if tag <= *last {
                return Err(NodeError::Decode(format!(
                    "TLV tags out of order: {tag:#04x} after {last:#04x}"
                )));
            }
        }
        out.push((tag, value.to_vec()));
    }
}
