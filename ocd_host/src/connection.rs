//! TCP connection to the host controller.
//!
//! Used from inside a worker's event loop. [`HostConnection::recv`] is
//! cancel-safe: partially received frames stay buffered across calls, so it
//! can sit in a `select!` next to the control channel.

use ocd_common::error::{DiError, DiResult};
use ocd_common::wire::{self, Message};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

const READ_CHUNK: usize = 4096;

/// Framed connection to the host controller.
pub struct HostConnection {
    stream: TcpStream,
    endpoint: String,
    rx_buf: Vec<u8>,
}

impl HostConnection {
    /// Connect to `endpoint` (`tcp://host:port` or `host:port`).
    pub async fn connect(endpoint: &str, timeout: Duration) -> DiResult<Self> {
        let addr = endpoint.strip_prefix("tcp://").unwrap_or(endpoint);
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(DiError::connection_failed(format!(
                    "unable to connect to {endpoint}: {e}"
                )));
            }
            Err(_) => {
                return Err(DiError::connection_failed(format!(
                    "connecting to {endpoint} timed out"
                )));
            }
        };
        stream.set_nodelay(true)?;
        debug!(endpoint, "connected to host controller");

        Ok(Self {
            stream,
            endpoint: endpoint.to_string(),
            rx_buf: Vec::with_capacity(READ_CHUNK),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Send one message.
    pub async fn send(&mut self, msg: &Message) -> DiResult<()> {
        let frame = msg.encode()?;
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    /// Receive the next well-formed message.
    ///
    /// Frames with an unknown tag are logged and skipped. An error means the
    /// connection is no longer usable.
    pub async fn recv(&mut self) -> DiResult<Message> {
        loop {
            if let Some((parts, used)) = wire::decode_parts(&self.rx_buf)? {
                self.rx_buf.drain(..used);
                match Message::from_parts(parts) {
                    Ok(msg) => return Ok(msg),
                    Err(e) => {
                        warn!(endpoint = %self.endpoint, error = %e, "dropping frame");
                        continue;
                    }
                }
            }

            self.rx_buf.reserve(READ_CHUNK);
            if self.stream.read_buf(&mut self.rx_buf).await? == 0 {
                debug!(endpoint = %self.endpoint, "host controller closed the connection");
                return Err(DiError::NotConnected);
            }
        }
    }

    /// Send a management command and wait for the management reply.
    ///
    /// `D` frames arriving before the reply are dropped.
    pub async fn request(&mut self, command: &str, timeout: Duration) -> DiResult<String> {
        self.send(&Message::management(command)).await?;

        let reply = tokio::time::timeout(timeout, async {
            loop {
                match self.recv().await {
                    Ok(Message::Management(reply)) => break Ok(reply),
                    Ok(Message::Data(bytes)) => {
                        debug!(
                            len = bytes.len(),
                            command, "dropping data frame while awaiting reply"
                        );
                    }
                    Err(e) => break Err(e),
                }
            }
        })
        .await
        .map_err(|_| DiError::Timeout)??;

        debug!(command, reply = %reply, "management exchange");
        Ok(reply)
    }
}
