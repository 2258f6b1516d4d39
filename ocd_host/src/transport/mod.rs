//! Device transports.
//!
//! A gateway reaches its device subnet through a pair of blocking
//! primitives. The reader is owned by the gateway's device thread, the
//! writer by the gateway worker thread.
//!
//! # Contract
//!
//! - `NotConnected` from either side means the device is gone. The device
//!   thread ends on it; a write failing with it unregisters the gateway.
//! - A reader may return `Timeout` when no packet arrived within its poll
//!   interval. The device thread uses these returns to observe
//!   cancellation.
//! - Any other error is transient: reads are retried, failed writes drop
//!   the packet.

pub mod memory;
pub mod stream;

use ocd_common::error::DiResult;
use ocd_common::packet::Packet;

pub use memory::{DeviceEndpoint, MemoryDevice, MemoryReader, MemoryWriter};
pub use stream::{StreamDevice, StreamReader, StreamWriter};

/// Blocking source of packets from the device.
pub trait DeviceReader: Send {
    fn read(&mut self) -> DiResult<Packet>;
}

/// Blocking sink of packets to the device.
pub trait DeviceWriter: Send {
    fn write(&mut self, pkt: &Packet) -> DiResult<()>;
}

impl<F> DeviceReader for F
where
    F: FnMut() -> DiResult<Packet> + Send,
{
    fn read(&mut self) -> DiResult<Packet> {
        self()
    }
}

impl<F> DeviceWriter for F
where
    F: FnMut(&Packet) -> DiResult<()> + Send,
{
    fn write(&mut self, pkt: &Packet) -> DiResult<()> {
        self(pkt)
    }
}
