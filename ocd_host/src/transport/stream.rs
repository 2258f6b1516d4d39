//! Debug Transport Datagrams over a byte stream.
//!
//! Every packet is sent as its size word followed by its data words, all
//! big-endian:
//!
//! ```text
//! u16 BE   size (number of data words)
//! u16 BE   dest, src, flags, payload...
//! ```
//!
//! Works over any `Read`/`Write` pair, e.g. a TCP connection to a device
//! simulator.

use super::{DeviceReader, DeviceWriter};
use ocd_common::error::{DiError, DiResult};
use ocd_common::packet::Packet;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::debug;

const READ_CHUNK: usize = 1024;

/// Constructors for stream-based device transports.
pub struct StreamDevice;

impl StreamDevice {
    /// Connect to a device (or simulator) listening on TCP.
    ///
    /// `poll_interval` becomes the socket read timeout; reads return
    /// `Timeout` when it elapses without a complete packet.
    pub fn connect_tcp<A: ToSocketAddrs>(
        addr: A,
        poll_interval: Duration,
    ) -> DiResult<(StreamReader<TcpStream>, StreamWriter<TcpStream>)> {
        let stream = TcpStream::connect(addr)
            .map_err(|e| DiError::connection_failed(format!("device connection: {e}")))?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(poll_interval))?;
        let reader = stream.try_clone()?;
        debug!(peer = ?stream.peer_addr().ok(), "connected to device");
        Ok((StreamReader::new(reader), StreamWriter::new(stream)))
    }
}

/// Reading half of a DTD stream.
pub struct StreamReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: Read + Send> StreamReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(READ_CHUNK),
        }
    }

    /// Take one complete datagram from the buffer.
    fn take_datagram(&mut self) -> Option<DiResult<Packet>> {
        let size = u16::from_be_bytes([*self.buf.first()?, *self.buf.get(1)?]) as usize;
        let total = 2 + size * 2;
        if self.buf.len() < total {
            return None;
        }
        let words: Vec<u16> = self.buf[2..total]
            .chunks_exact(2)
            .map(|w| u16::from_be_bytes([w[0], w[1]]))
            .collect();
        self.buf.drain(..total);
        Some(
            Packet::from_data_words(words)
                .map_err(|e| DiError::failure(format!("malformed datagram: {e}"))),
        )
    }
}

impl<R: Read + Send> DeviceReader for StreamReader<R> {
    fn read(&mut self) -> DiResult<Packet> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(result) = self.take_datagram() {
                return result;
            }
            match self.inner.read(&mut chunk) {
                Ok(0) => return Err(DiError::NotConnected),
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Writing half of a DTD stream.
pub struct StreamWriter<W> {
    inner: W,
}

impl<W: Write + Send> StreamWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: Write + Send> DeviceWriter for StreamWriter<W> {
    fn write(&mut self, pkt: &Packet) -> DiResult<()> {
        let mut frame = Vec::with_capacity(pkt.size_bytes());
        frame.extend_from_slice(&(pkt.data_size_words() as u16).to_be_bytes());
        for word in pkt.data_words() {
            frame.extend_from_slice(&word.to_be_bytes());
        }
        self.inner.write_all(&frame)?;
        self.inner.flush()?;
        Ok(())
    }
}
