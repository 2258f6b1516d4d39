//! In-process device.
//!
//! Two channels stand in for a physical link. The [`DeviceEndpoint`] is the
//! device side: it injects packets towards the gateway, observes packets the
//! gateway wrote, and can unplug the link.

use super::{DeviceReader, DeviceWriter};
use ocd_common::error::{DiError, DiResult};
use ocd_common::packet::Packet;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

/// How long a read waits before returning `Timeout`.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Gateway side of an in-process device.
pub struct MemoryDevice {
    pub reader: MemoryReader,
    pub writer: MemoryWriter,
}

impl MemoryDevice {
    /// Create a linked device and endpoint.
    pub fn new() -> (Self, DeviceEndpoint) {
        let (to_host_tx, to_host_rx) = mpsc::channel();
        let (to_device_tx, to_device_rx) = mpsc::channel();
        let device = Self {
            reader: MemoryReader {
                rx: to_host_rx,
                poll_interval: DEFAULT_POLL_INTERVAL,
            },
            writer: MemoryWriter { tx: to_device_tx },
        };
        let endpoint = DeviceEndpoint {
            to_host: Some(to_host_tx),
            from_host: Some(to_device_rx),
        };
        (device, endpoint)
    }

    /// Split into reader and writer.
    pub fn split(self) -> (MemoryReader, MemoryWriter) {
        (self.reader, self.writer)
    }
}

/// Reading half of a [`MemoryDevice`].
pub struct MemoryReader {
    rx: Receiver<Packet>,
    poll_interval: Duration,
}

impl MemoryReader {
    pub fn set_poll_interval(&mut self, interval: Duration) {
        self.poll_interval = interval;
    }
}

impl DeviceReader for MemoryReader {
    fn read(&mut self) -> DiResult<Packet> {
        self.rx.recv_timeout(self.poll_interval).map_err(|e| match e {
            RecvTimeoutError::Timeout => DiError::Timeout,
            RecvTimeoutError::Disconnected => DiError::NotConnected,
        })
    }
}

/// Writing half of a [`MemoryDevice`].
pub struct MemoryWriter {
    tx: Sender<Packet>,
}

impl DeviceWriter for MemoryWriter {
    fn write(&mut self, pkt: &Packet) -> DiResult<()> {
        self.tx.send(pkt.clone()).map_err(|_| DiError::NotConnected)
    }
}

/// Device side of a [`MemoryDevice`].
pub struct DeviceEndpoint {
    to_host: Option<Sender<Packet>>,
    from_host: Option<Receiver<Packet>>,
}

impl DeviceEndpoint {
    /// Emit a packet from the device.
    pub fn inject(&self, pkt: Packet) -> DiResult<()> {
        let tx = self.to_host.as_ref().ok_or(DiError::NotConnected)?;
        tx.send(pkt).map_err(|_| DiError::NotConnected)
    }

    /// Wait for a packet written to the device.
    pub fn recv_timeout(&self, timeout: Duration) -> DiResult<Packet> {
        let rx = self.from_host.as_ref().ok_or(DiError::NotConnected)?;
        rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => DiError::Timeout,
            RecvTimeoutError::Disconnected => DiError::NotConnected,
        })
    }

    /// Drop the link. Pending reads and all later writes on the gateway
    /// side fail with `NotConnected`.
    pub fn unplug(&mut self) {
        self.to_host = None;
        self.from_host = None;
    }

    pub fn is_plugged(&self) -> bool {
        self.to_host.is_some()
    }
}
