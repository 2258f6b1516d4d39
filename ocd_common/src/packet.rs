//! Debug interconnect packets.
//!
//! A packet is a sequence of 16-bit words: a header of three words
//! (destination, source, flags) followed by the payload. On the wire it is
//! preceded by a size word holding the number of data words.
//!
//! ```text
//!  word 0   size      number of data words (3 + payload)
//!  word 1   dest      destination diaddr
//!  word 2   src       source diaddr
//!  word 3   flags     [15:14] type  [13:10] type_sub  [9:0] reserved
//!  word 4.. payload
//! ```
//!
//! Words are little-endian inside host-controller `D` frames.

use crate::error::{DiError, DiResult};
use std::fmt;

/// Number of header words (dest, src, flags).
pub const HEADER_WORDS: usize = 3;

/// Largest payload a packet can carry (the size word is 16 bits).
pub const MAX_PAYLOAD_WORDS: usize = u16::MAX as usize - HEADER_WORDS;

const TYPE_SHIFT: u16 = 14;
const TYPE_MASK: u16 = 0b11;
const TYPE_SUB_SHIFT: u16 = 10;
const TYPE_SUB_MASK: u16 = 0b1111;

// REG type-qualifiers: requests
/// Read a 16-bit register.
pub const REG_REQ_READ_16: u8 = 0x0;
/// Read a 32-bit register.
pub const REG_REQ_READ_32: u8 = 0x1;
/// Read a 64-bit register.
pub const REG_REQ_READ_64: u8 = 0x2;
/// Read a 128-bit register.
pub const REG_REQ_READ_128: u8 = 0x3;
/// Write a 16-bit register.
pub const REG_REQ_WRITE_16: u8 = 0x4;
/// Write a 32-bit register.
pub const REG_REQ_WRITE_32: u8 = 0x5;
/// Write a 64-bit register.
pub const REG_REQ_WRITE_64: u8 = 0x6;
/// Write a 128-bit register.
pub const REG_REQ_WRITE_128: u8 = 0x7;

// REG type-qualifiers: responses
/// Successful 16-bit read.
pub const REG_RESP_READ_SUCCESS_16: u8 = 0x8;
/// Successful 32-bit read.
pub const REG_RESP_READ_SUCCESS_32: u8 = 0x9;
/// Successful 64-bit read.
pub const REG_RESP_READ_SUCCESS_64: u8 = 0xA;
/// Successful 128-bit read.
pub const REG_RESP_READ_SUCCESS_128: u8 = 0xB;
/// Read failed in the module.
pub const REG_RESP_READ_ERROR: u8 = 0xC;
/// Write acknowledged.
pub const REG_RESP_WRITE_SUCCESS: u8 = 0xD;
/// Write failed in the module.
pub const REG_RESP_WRITE_ERROR: u8 = 0xE;

/// Last (or only) packet of an event.
pub const EVENT_LAST: u8 = 0x0;
/// More packets of this event follow.
pub const EVENT_CONT: u8 = 0x1;

/// Packet type, encoded in the two most significant flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Register access request or response
    Reg = 0,
    /// Plain data
    Plain = 1,
    /// Event (trace data, UART characters, ...)
    Event = 2,
}

impl PacketType {
    /// Convert from the raw two-bit value. Returns `None` for the reserved
    /// value 3.
    #[inline]
    pub const fn from_bits(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Reg),
            1 => Some(Self::Plain),
            2 => Some(Self::Event),
            _ => None,
        }
    }
}

/// A debug interconnect packet.
///
/// Packets are immutable once built. Ownership moves with the value when a
/// packet is handed across a channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Packet {
    /// Data words: header followed by payload. Never shorter than
    /// `HEADER_WORDS`.
    data: Vec<u16>,
}

impl Packet {
    /// Build a packet from header fields and payload.
    ///
    /// # Panics
    /// Panics if `type_sub` does not fit into four bits or the payload is
    /// longer than [`MAX_PAYLOAD_WORDS`]. Use [`Packet::try_new`] for
    /// values that are not known to be valid.
    pub fn new(dest: u16, src: u16, ptype: PacketType, type_sub: u8, payload: &[u16]) -> Self {
        assert!(
            u16::from(type_sub) <= TYPE_SUB_MASK,
            "type_sub {type_sub:#x} does not fit into four bits"
        );
        assert!(
            payload.len() <= MAX_PAYLOAD_WORDS,
            "payload of {} words exceeds packet capacity",
            payload.len()
        );

        let flags = (ptype as u16) << TYPE_SHIFT | u16::from(type_sub) << TYPE_SUB_SHIFT;
        let mut data = Vec::with_capacity(HEADER_WORDS + payload.len());
        data.extend_from_slice(&[dest, src, flags]);
        data.extend_from_slice(payload);
        Self { data }
    }

    /// Like [`Packet::new`], failing with `InvalidArgument` instead of
    /// panicking.
    pub fn try_new(
        dest: u16,
        src: u16,
        ptype: PacketType,
        type_sub: u8,
        payload: &[u16],
    ) -> DiResult<Self> {
        if u16::from(type_sub) > TYPE_SUB_MASK {
            return Err(DiError::invalid(format!(
                "type_sub {type_sub:#x} does not fit into four bits"
            )));
        }
        if payload.len() > MAX_PAYLOAD_WORDS {
            return Err(DiError::invalid(format!(
                "payload of {} words exceeds packet capacity",
                payload.len()
            )));
        }
        Ok(Self::new(dest, src, ptype, type_sub, payload))
    }

    /// Build a packet from its data words (header and payload, no size word).
    pub fn from_data_words(data: Vec<u16>) -> DiResult<Self> {
        if data.len() < HEADER_WORDS {
            return Err(DiError::invalid(format!(
                "packet of {} words is shorter than its header",
                data.len()
            )));
        }
        if data.len() > u16::MAX as usize {
            return Err(DiError::invalid("packet exceeds maximum size"));
        }
        Ok(Self { data })
    }

    /// Parse the raw little-endian representation (size word included).
    pub fn from_bytes(bytes: &[u8]) -> DiResult<Self> {
        if bytes.len() % 2 != 0 {
            return Err(DiError::invalid(format!(
                "odd packet length of {} bytes",
                bytes.len()
            )));
        }
        let mut words = bytes
            .chunks_exact(2)
            .map(|w| u16::from_le_bytes([w[0], w[1]]));
        let size = words
            .next()
            .ok_or_else(|| DiError::invalid("empty packet buffer"))? as usize;
        let data: Vec<u16> = words.collect();
        if data.len() != size {
            return Err(DiError::invalid(format!(
                "size word announces {size} data words, buffer holds {}",
                data.len()
            )));
        }
        Self::from_data_words(data)
    }

    /// Raw little-endian representation, size word first.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.size_bytes());
        bytes.extend_from_slice(&(self.data.len() as u16).to_le_bytes());
        for word in &self.data {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    /// Destination diaddr.
    #[inline]
    pub fn dest(&self) -> u16 {
        self.data[0]
    }

    /// Source diaddr.
    #[inline]
    pub fn src(&self) -> u16 {
        self.data[1]
    }

    /// Raw flags word.
    #[inline]
    pub fn flags(&self) -> u16 {
        self.data[2]
    }

    /// Packet type, `None` if the reserved type value is set.
    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_bits(((self.flags() >> TYPE_SHIFT) & TYPE_MASK) as u8)
    }

    /// Type-qualifier (sub-opcode).
    pub fn type_sub(&self) -> u8 {
        ((self.flags() >> TYPE_SUB_SHIFT) & TYPE_SUB_MASK) as u8
    }

    /// Payload words.
    #[inline]
    pub fn payload(&self) -> &[u16] {
        &self.data[HEADER_WORDS..]
    }

    /// Header and payload words (what follows the size word).
    #[inline]
    pub fn data_words(&self) -> &[u16] {
        &self.data
    }

    /// Number of data words, i.e. the value of the size word.
    #[inline]
    pub fn data_size_words(&self) -> usize {
        self.data.len()
    }

    /// Size of the raw representation in bytes, size word included.
    #[inline]
    pub fn size_bytes(&self) -> usize {
        (1 + self.data.len()) * 2
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ptype = match self.packet_type() {
            Some(PacketType::Reg) => "REG",
            Some(PacketType::Plain) => "PLAIN",
            Some(PacketType::Event) => "EVENT",
            None => "RESERVED",
        };
        write!(
            f,
            "{} -> {} {ptype}/{:#x} [",
            self.src(),
            self.dest(),
            self.type_sub()
        )?;
        for (i, word) in self.payload().iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{word:04x}")?;
        }
        f.write_str("]")
    }
}
