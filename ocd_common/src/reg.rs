//! Register map and register access parameters.
//!
//! Only the base registers shared by every debug module are defined here.
//! Module-specific maps belong to the module drivers.

use crate::error::{DiError, DiResult};
use crate::packet;
use bitflags::bitflags;

/// Module vendor id.
pub const REG_BASE_MOD_VENDOR: u16 = 0x0000;
/// Module type id.
pub const REG_BASE_MOD_TYPE: u16 = 0x0001;
/// Module version.
pub const REG_BASE_MOD_VERSION: u16 = 0x0002;
/// Control and status.
pub const REG_BASE_MOD_CS: u16 = 0x0003;
/// Activate (1) or stall (0) the module.
pub const REG_BASE_MOD_CS_ACTIVE: u16 = 1 << 0;
/// Destination diaddr for events emitted by the module.
pub const REG_BASE_MOD_EVENT_DEST: u16 = 0x0004;

bitflags! {
    /// Options for a single register access.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RegFlags: u32 {
        /// Wait for the response without a time bound.
        ///
        /// The call still returns `NotConnected` when the connection to the
        /// host controller is lost.
        const BLOCKING = 1 << 0;
    }
}

/// Width of a register access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegWidth {
    W16,
    W32,
    W64,
    W128,
}

impl RegWidth {
    /// Width in bits.
    pub const fn bits(self) -> u32 {
        match self {
            Self::W16 => 16,
            Self::W32 => 32,
            Self::W64 => 64,
            Self::W128 => 128,
        }
    }

    /// Number of 16-bit payload words holding a value of this width.
    pub const fn words(self) -> usize {
        (self.bits() / 16) as usize
    }

    /// Largest value representable in this width.
    pub const fn max_value(self) -> u128 {
        match self {
            Self::W128 => u128::MAX,
            _ => (1u128 << self.bits()) - 1,
        }
    }

    /// Type-qualifier of a read request.
    pub const fn read_request(self) -> u8 {
        packet::REG_REQ_READ_16 + self.index()
    }

    /// Type-qualifier of a write request.
    pub const fn write_request(self) -> u8 {
        packet::REG_REQ_WRITE_16 + self.index()
    }

    /// Type-qualifier of a successful read response.
    pub const fn read_success(self) -> u8 {
        packet::REG_RESP_READ_SUCCESS_16 + self.index()
    }

    const fn index(self) -> u8 {
        match self {
            Self::W16 => 0,
            Self::W32 => 1,
            Self::W64 => 2,
            Self::W128 => 3,
        }
    }

    /// Split `value` into payload words, most significant word first.
    pub fn encode(self, value: u128) -> DiResult<Vec<u16>> {
        if value > self.max_value() {
            return Err(DiError::invalid(format!(
                "value {value:#x} does not fit into {} bits",
                self.bits()
            )));
        }
        Ok((0..self.words())
            .rev()
            .map(|i| (value >> (16 * i)) as u16)
            .collect())
    }

    /// Assemble a value from payload words, most significant word first.
    pub fn decode(self, words: &[u16]) -> DiResult<u128> {
        if words.len() != self.words() {
            return Err(DiError::failure(format!(
                "{}-bit register value carried in {} words",
                self.bits(),
                words.len()
            )));
        }
        Ok(words
            .iter()
            .fold(0u128, |acc, w| (acc << 16) | u128::from(*w)))
    }
}

impl TryFrom<u32> for RegWidth {
    type Error = DiError;

    fn try_from(bits: u32) -> Result<Self, Self::Error> {
        match bits {
            16 => Ok(Self::W16),
            32 => Ok(Self::W32),
            64 => Ok(Self::W64),
            128 => Ok(Self::W128),
            other => Err(DiError::invalid(format!(
                "unsupported register width of {other} bits"
            ))),
        }
    }
}
