//! Host-controller message codec.
//!
//! Every message between a host module or gateway and the host controller is
//! a multi-part frame whose first part is a one-byte tag:
//!
//! - `M` + command string: management request or response
//! - `D` + raw packet bytes: a debug interconnect packet
//!
//! On the TCP stream a frame is encoded as
//!
//! ```text
//! u16 BE   number of parts
//! per part:
//!   u32 BE   part length in bytes
//!   [u8]     part content
//! ```

use crate::error::{DiError, DiResult};
use crate::packet::Packet;
use std::io::{Read, Write};

/// Tag of management frames.
pub const TAG_MANAGEMENT: &[u8] = b"M";
/// Tag of data (packet) frames.
pub const TAG_DATA: &[u8] = b"D";

/// Upper bound of a frame on the wire.
pub const MAX_FRAME_BYTES: usize = 1 << 20;
/// Upper bound of the number of parts in a frame.
pub const MAX_PARTS: usize = 16;

const COUNT_BYTES: usize = 2;
const LEN_BYTES: usize = 4;

/// Management command strings.
pub mod cmd {
    /// Host module asks for a diaddr; answered with the decimal address.
    pub const DIADDR_REQUEST: &str = "DIADDR_REQUEST";
    /// Host module returns its diaddr: `DIADDR_RELEASE <diaddr>`.
    pub const DIADDR_RELEASE: &str = "DIADDR_RELEASE";
    /// Gateway claims a subnet: `GW_REGISTER <subnet>`.
    pub const GW_REGISTER: &str = "GW_REGISTER";
    /// Gateway releases a subnet: `GW_UNREGISTER <subnet>`.
    pub const GW_UNREGISTER: &str = "GW_UNREGISTER";
    /// Positive acknowledgement.
    pub const ACK: &str = "ACK";
    /// Negative acknowledgement.
    pub const NACK: &str = "NACK";
}

/// A message exchanged with the host controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// `M` frame with a command or status string.
    Management(String),
    /// `D` frame with raw packet bytes.
    Data(Vec<u8>),
}

impl Message {
    pub fn management(command: impl Into<String>) -> Self {
        Self::Management(command.into())
    }

    /// `D` frame carrying `pkt` in its raw representation.
    pub fn packet(pkt: &Packet) -> Self {
        Self::Data(pkt.to_bytes())
    }

    /// Whether this is an `M ACK` frame.
    pub fn is_ack(&self) -> bool {
        matches!(self, Self::Management(s) if s == cmd::ACK)
    }

    /// Decode the packet carried by a `D` frame.
    pub fn to_packet(&self) -> DiResult<Packet> {
        match self {
            Self::Data(bytes) => Packet::from_bytes(bytes)
                .map_err(|e| DiError::failure(format!("malformed packet in D frame: {e}"))),
            Self::Management(s) => Err(DiError::failure(format!(
                "expected a D frame, got management message '{s}'"
            ))),
        }
    }

    /// Split into frame parts (tag first).
    pub fn to_parts(&self) -> [&[u8]; 2] {
        match self {
            Self::Management(s) => [TAG_MANAGEMENT, s.as_bytes()],
            Self::Data(bytes) => [TAG_DATA, bytes.as_slice()],
        }
    }

    /// Build from received frame parts.
    pub fn from_parts(mut parts: Vec<Vec<u8>>) -> DiResult<Self> {
        if parts.len() != 2 {
            return Err(DiError::failure(format!(
                "expected a two-part frame, got {} parts",
                parts.len()
            )));
        }
        let body = parts.pop().unwrap_or_default();
        let tag = parts.pop().unwrap_or_default();
        match tag.as_slice() {
            TAG_MANAGEMENT => String::from_utf8(body)
                .map(Self::Management)
                .map_err(|_| DiError::failure("management message is not valid UTF-8")),
            TAG_DATA => Ok(Self::Data(body)),
            other => Err(DiError::failure(format!(
                "unexpected frame tag '{}'",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    /// Encode into a complete wire frame.
    pub fn encode(&self) -> DiResult<Vec<u8>> {
        encode_parts(&self.to_parts())
    }
}

/// Encode frame parts for the wire.
pub fn encode_parts(parts: &[&[u8]]) -> DiResult<Vec<u8>> {
    if parts.len() > MAX_PARTS {
        return Err(DiError::invalid(format!(
            "frame with {} parts exceeds the limit of {MAX_PARTS}",
            parts.len()
        )));
    }
    let total = COUNT_BYTES + parts.iter().map(|p| LEN_BYTES + p.len()).sum::<usize>();
    if total > MAX_FRAME_BYTES {
        return Err(DiError::invalid(format!(
            "frame of {total} bytes exceeds the limit of {MAX_FRAME_BYTES}"
        )));
    }

    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&(parts.len() as u16).to_be_bytes());
    for part in parts {
        buf.extend_from_slice(&(part.len() as u32).to_be_bytes());
        buf.extend_from_slice(part);
    }
    Ok(buf)
}

/// Try to decode one frame from the start of `buf`.
///
/// Returns `Ok(None)` if `buf` does not yet hold a complete frame, otherwise
/// the parts and the number of bytes consumed.
pub fn decode_parts(buf: &[u8]) -> DiResult<Option<(Vec<Vec<u8>>, usize)>> {
    let Some(count) = buf.get(..COUNT_BYTES) else {
        return Ok(None);
    };
    let count = u16::from_be_bytes([count[0], count[1]]) as usize;
    if count > MAX_PARTS {
        return Err(DiError::failure(format!(
            "frame announces {count} parts (limit {MAX_PARTS})"
        )));
    }

    let mut pos = COUNT_BYTES;
    let mut parts = Vec::with_capacity(count);
    for _ in 0..count {
        let Some(len) = buf.get(pos..pos + LEN_BYTES) else {
            return Ok(None);
        };
        let len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;
        pos += LEN_BYTES;
        if pos + len > MAX_FRAME_BYTES {
            return Err(DiError::failure(format!(
                "frame exceeds the limit of {MAX_FRAME_BYTES} bytes"
            )));
        }
        let Some(part) = buf.get(pos..pos + len) else {
            return Ok(None);
        };
        parts.push(part.to_vec());
        pos += len;
    }
    Ok(Some((parts, pos)))
}

/// Blocking read of one message.
pub fn read_message<R: Read>(reader: &mut R) -> DiResult<Message> {
    let mut count = [0u8; COUNT_BYTES];
    reader.read_exact(&mut count)?;
    let count = u16::from_be_bytes(count) as usize;
    if count > MAX_PARTS {
        return Err(DiError::failure(format!(
            "frame announces {count} parts (limit {MAX_PARTS})"
        )));
    }

    let mut parts = Vec::with_capacity(count);
    let mut total = COUNT_BYTES;
    for _ in 0..count {
        let mut len = [0u8; LEN_BYTES];
        reader.read_exact(&mut len)?;
        let len = u32::from_be_bytes(len) as usize;
        total += LEN_BYTES + len;
        if total > MAX_FRAME_BYTES {
            return Err(DiError::failure(format!(
                "frame exceeds the limit of {MAX_FRAME_BYTES} bytes"
            )));
        }
        let mut part = vec![0u8; len];
        reader.read_exact(&mut part)?;
        parts.push(part);
    }
    Message::from_parts(parts)
}

/// Blocking write of one message.
pub fn write_message<W: Write>(writer: &mut W, msg: &Message) -> DiResult<()> {
    writer.write_all(&msg.encode()?)?;
    writer.flush()?;
    Ok(())
}
