//! Device gateway.
//!
//! A [`Gateway`] makes a device subnet, reachable only through a blocking
//! [`DeviceReader`]/[`DeviceWriter`] pair, appear to the host controller as
//! one registered peer. Packets are forwarded unchanged in both directions.
//!
//! ```text
//!  Device ──read()──► device RX thread ──(bounded)──┐
//!                                                   ▼
//!  Device ◄─write()── gateway worker ◄──TCP──► host controller
//! ```
//!
//! The gateway has two connection axes that connect and disconnect
//! independently:
//!
//! - host controller: registration of the subnet (`GW_REGISTER`)
//! - device: the device RX thread
//!
//! The gateway is operational when both are connected. [`Gateway::connect`]
//! brings up the host controller first, [`Gateway::disconnect`] takes the
//! device down first.

use crate::connection::HostConnection;
use crate::transport::{DeviceReader, DeviceWriter};
use crate::worker::{
    CMD_CONNECT, CMD_DISCONNECT, ControlMessage, Payload, STATUS_CONNECT_DONE,
    STATUS_CONNECTION_LOST, STATUS_DISCONNECT_DONE, Worker, WorkerContext, WorkerHandler,
};
use ocd_common::config::{GatewayConfig, Timeouts};
use ocd_common::error::{DiError, DiResult};
use ocd_common::packet::Packet;
use ocd_common::wire::{Message, cmd};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Unsolicited: a device write reported `NotConnected`, the subnet was
/// unregistered.
pub const STATUS_DEVICE_LOST: &str = "I-DEVICE-LOST";

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Pause between retries after a transient device read error.
const READ_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Why the device RX thread ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceExit {
    /// Cancelled by `disconnect`.
    Cancelled,
    /// The reader reported `NotConnected`.
    DeviceLost,
    /// The gateway worker stopped accepting packets.
    ChannelClosed,
}

impl fmt::Display for DeviceExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cancelled => "cancelled",
            Self::DeviceLost => "device connection dropped",
            Self::ChannelClosed => "forwarding channel closed",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostAxis {
    Disconnected,
    Registered,
}

enum DeviceAxis {
    Disconnected(Box<dyn DeviceReader>),
    Connected(DeviceRxThread),
    /// The RX thread did not stop in time and took the reader with it.
    Detached,
}

/// Bridge between a device subnet and the host controller.
pub struct Gateway {
    subnet: u16,
    join_timeout: Duration,
    worker: Worker,
    host: HostAxis,
    device: DeviceAxis,
    device_tx: mpsc::Sender<Packet>,
}

impl Gateway {
    /// Create a gateway and start its worker. Does not connect.
    pub fn new<R, W>(config: GatewayConfig, reader: R, writer: W) -> DiResult<Self>
    where
        R: DeviceReader + 'static,
        W: DeviceWriter + 'static,
    {
        config
            .validate()
            .map_err(|e| DiError::invalid(e.to_string()))?;

        let (device_tx, device_rx) = mpsc::channel(config.device_queue_depth);
        let io = GatewayIo {
            endpoint: config.host_controller.clone(),
            subnet: config.subnet,
            timeouts: config.timeouts,
            conn: None,
            writer: Box::new(writer),
            device_rx: Some(device_rx),
        };
        let worker = Worker::start(
            &format!("{}-gateway-{}", config.service_name(), config.subnet),
            io,
            config.timeouts.control(),
        )?;

        Ok(Self {
            subnet: config.subnet,
            join_timeout: config.timeouts.device_join(),
            worker,
            host: HostAxis::Disconnected,
            device: DeviceAxis::Disconnected(Box::new(reader)),
            device_tx,
        })
    }

    /// Subnet served by this gateway.
    pub fn subnet(&self) -> u16 {
        self.subnet
    }

    /// Connect both axes, host controller first.
    pub fn connect(&mut self) -> DiResult<()> {
        self.connect_hostctrl()?;
        self.connect_device()
    }

    /// Disconnect both axes, device first. Cleanup always runs on both.
    pub fn disconnect(&mut self) -> DiResult<()> {
        let device = self.disconnect_device();
        let host = self.disconnect_hostctrl();
        device.and(host)
    }

    /// Both axes connected.
    pub fn is_connected(&mut self) -> bool {
        self.is_connected_to_hostctrl() && self.is_connected_to_device()
    }

    pub fn is_connected_to_hostctrl(&mut self) -> bool {
        self.process_unsolicited();
        self.host == HostAxis::Registered
    }

    pub fn is_connected_to_device(&mut self) -> bool {
        self.reap_device_thread();
        matches!(self.device, DeviceAxis::Connected(_))
    }

    /// Register the subnet with the host controller.
    pub fn connect_hostctrl(&mut self) -> DiResult<()> {
        if self.is_connected_to_hostctrl() {
            return Ok(());
        }

        let result = self
            .worker
            .request(ControlMessage::empty(CMD_CONNECT), STATUS_CONNECT_DONE);
        match result {
            Ok(_) => {
                self.host = HostAxis::Registered;
                debug!(subnet = self.subnet, "connection with host controller established");
                Ok(())
            }
            Err(e) => {
                error!(
                    subnet = self.subnet,
                    error = %e,
                    "unable to establish connection to host controller"
                );
                Err(match e {
                    DiError::ConnectionFailed(_) => e,
                    other => DiError::connection_failed(other.to_string()),
                })
            }
        }
    }

    /// Unregister the subnet and close the host controller connection.
    pub fn disconnect_hostctrl(&mut self) -> DiResult<()> {
        self.process_unsolicited();
        if self.host == HostAxis::Disconnected {
            return Ok(());
        }

        let result = self
            .worker
            .request(ControlMessage::empty(CMD_DISCONNECT), STATUS_DISCONNECT_DONE);
        self.host = HostAxis::Disconnected;
        result.map(drop)
    }

    /// Start the device RX thread.
    pub fn connect_device(&mut self) -> DiResult<()> {
        self.reap_device_thread();
        match std::mem::replace(&mut self.device, DeviceAxis::Detached) {
            DeviceAxis::Disconnected(reader) => {
                let thread = DeviceRxThread::spawn(reader, self.device_tx.clone(), self.subnet)?;
                self.device = DeviceAxis::Connected(thread);
                debug!(subnet = self.subnet, "device RX thread started");
                Ok(())
            }
            connected @ DeviceAxis::Connected(_) => {
                self.device = connected;
                Ok(())
            }
            DeviceAxis::Detached => Err(DiError::failure(
                "device reader was lost with a detached RX thread",
            )),
        }
    }

    /// Cancel and join the device RX thread.
    pub fn disconnect_device(&mut self) -> DiResult<()> {
        match std::mem::replace(&mut self.device, DeviceAxis::Detached) {
            DeviceAxis::Connected(thread) => {
                self.device = thread.stop(self.join_timeout);
            }
            other => self.device = other,
        }
        Ok(())
    }

    fn process_unsolicited(&mut self) {
        for msg in self.worker.take_unsolicited() {
            match msg.name {
                STATUS_CONNECTION_LOST | STATUS_DEVICE_LOST => {
                    if self.host == HostAxis::Registered {
                        warn!(
                            subnet = self.subnet,
                            status = msg.name,
                            "no longer registered with host controller"
                        );
                    }
                    self.host = HostAxis::Disconnected;
                }
                other => debug!(status = other, "ignoring unsolicited worker status"),
            }
        }
    }

    /// Collect a device thread that ended on its own.
    fn reap_device_thread(&mut self) {
        let finished = matches!(&self.device, DeviceAxis::Connected(t) if t.is_finished());
        if !finished {
            return;
        }
        if let DeviceAxis::Connected(thread) =
            std::mem::replace(&mut self.device, DeviceAxis::Detached)
        {
            self.device = thread.join();
        }
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        if self.is_connected_to_device() {
            warn!(subnet = self.subnet, "gateway dropped while connected to device");
            if let Err(e) = self.disconnect_device() {
                warn!(error = %e, "stopping device RX thread on drop failed");
            }
        }
        if self.is_connected_to_hostctrl() {
            warn!(subnet = self.subnet, "gateway dropped while connected to host controller");
            if let Err(e) = self.disconnect_hostctrl() {
                warn!(error = %e, "unregistering on drop failed");
            }
        }
    }
}

/// Handle of the device RX thread.
struct DeviceRxThread {
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<(Box<dyn DeviceReader>, DeviceExit)>,
}

impl DeviceRxThread {
    fn spawn(
        reader: Box<dyn DeviceReader>,
        tx: mpsc::Sender<Packet>,
        subnet: u16,
    ) -> DiResult<Self> {
        let cancel = Arc::new(AtomicBool::new(false));
        let thread_cancel = Arc::clone(&cancel);
        let handle = thread::Builder::new()
            .name(format!("ocd-device-rx-{subnet}"))
            .spawn(move || device_rx_loop(reader, tx, thread_cancel))
            .map_err(|e| DiError::failure(format!("unable to spawn device RX thread: {e}")))?;
        Ok(Self { cancel, handle })
    }

    fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Request cancellation and join within `timeout`.
    fn stop(self, timeout: Duration) -> DeviceAxis {
        self.cancel.store(true, Ordering::Release);

        let deadline = Instant::now() + timeout;
        while !self.handle.is_finished() {
            if Instant::now() >= deadline {
                warn!(?timeout, "device RX thread did not observe cancellation, detaching");
                return DeviceAxis::Detached;
            }
            thread::sleep(JOIN_POLL_INTERVAL);
        }
        self.join()
    }

    fn join(self) -> DeviceAxis {
        match self.handle.join() {
            Ok((reader, exit)) => {
                match exit {
                    DeviceExit::Cancelled => {
                        debug!("device RX thread terminated through cancellation");
                    }
                    DeviceExit::DeviceLost => {
                        debug!("device RX thread terminated earlier when connection was dropped");
                    }
                    DeviceExit::ChannelClosed => {
                        warn!("device RX thread terminated, gateway worker is gone");
                    }
                }
                DeviceAxis::Disconnected(reader)
            }
            Err(_) => {
                error!("device RX thread panicked");
                DeviceAxis::Detached
            }
        }
    }
}

/// Body of the device RX thread.
fn device_rx_loop(
    mut reader: Box<dyn DeviceReader>,
    tx: mpsc::Sender<Packet>,
    cancel: Arc<AtomicBool>,
) -> (Box<dyn DeviceReader>, DeviceExit) {
    loop {
        if cancel.load(Ordering::Acquire) {
            return (reader, DeviceExit::Cancelled);
        }
        match reader.read() {
            Ok(pkt) => {
                if tx.blocking_send(pkt).is_err() {
                    return (reader, DeviceExit::ChannelClosed);
                }
            }
            Err(DiError::NotConnected) => {
                info!("device connection dropped, ending device RX thread");
                return (reader, DeviceExit::DeviceLost);
            }
            Err(DiError::Timeout) => {}
            Err(e) => {
                warn!(error = %e, "device read failed, retrying");
                thread::sleep(READ_RETRY_DELAY);
            }
        }
    }
}

enum GatewayEvent {
    HostCtrl(DiResult<Message>),
    Device(Option<Packet>),
}

/// Worker side of a gateway.
struct GatewayIo {
    endpoint: String,
    subnet: u16,
    timeouts: Timeouts,
    conn: Option<HostConnection>,
    writer: Box<dyn DeviceWriter>,
    device_rx: Option<mpsc::Receiver<Packet>>,
}

impl GatewayIo {
    async fn register(&mut self) -> DiResult<Payload> {
        if self.conn.is_some() {
            return Ok(Payload::Address(self.subnet));
        }

        let mut conn = HostConnection::connect(&self.endpoint, self.timeouts.connect()).await?;
        let command = format!("{} {}", cmd::GW_REGISTER, self.subnet);
        match conn.request(&command, self.timeouts.response()).await {
            Ok(reply) if reply == cmd::ACK => {
                info!(subnet = self.subnet, endpoint = %self.endpoint, "subnet registered");
                self.conn = Some(conn);
                Ok(Payload::Address(self.subnet))
            }
            Ok(reply) => Err(DiError::connection_failed(format!(
                "host controller rejected subnet {}: '{reply}'",
                self.subnet
            ))),
            Err(e) => Err(DiError::connection_failed(format!(
                "registration of subnet {} failed: {e}",
                self.subnet
            ))),
        }
    }

    async fn unregister(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        let command = format!("{} {}", cmd::GW_UNREGISTER, self.subnet);
        match conn.request(&command, self.timeouts.response()).await {
            Ok(reply) if reply == cmd::ACK => {
                info!(subnet = self.subnet, "subnet unregistered");
            }
            Ok(reply) => warn!(
                subnet = self.subnet,
                reply = %reply,
                "host controller did not acknowledge unregistration"
            ),
            Err(e) => warn!(subnet = self.subnet, error = %e, "unable to unregister subnet"),
        }
    }

    async fn forward_to_host(&mut self, ctx: &WorkerContext, pkt: Packet) {
        let Some(conn) = self.conn.as_mut() else {
            warn!(%pkt, "not registered with host controller, dropping device packet");
            return;
        };
        if let Err(e) = conn.send(&Message::packet(&pkt)).await {
            self.lose_connection(ctx, e);
        }
    }

    async fn forward_to_device(&mut self, ctx: &WorkerContext, msg: Message) {
        let pkt = match msg {
            Message::Data(_) => match msg.to_packet() {
                Ok(pkt) => pkt,
                Err(e) => {
                    warn!(error = %e, "dropping malformed data frame");
                    return;
                }
            },
            Message::Management(s) => {
                debug!(message = %s, "ignoring management message from host controller");
                return;
            }
        };

        match self.writer.write(&pkt) {
            Ok(()) => {}
            Err(DiError::NotConnected) => {
                error!(
                    subnet = self.subnet,
                    "device gone while writing, unregistering from host controller"
                );
                self.unregister().await;
                ctx.send_status(ControlMessage::new(
                    STATUS_DEVICE_LOST,
                    Payload::Error(DiError::NotConnected),
                ));
            }
            Err(e) => warn!(error = %e, %pkt, "device write failed, dropping packet"),
        }
    }

    fn lose_connection(&mut self, ctx: &WorkerContext, reason: DiError) {
        warn!(subnet = self.subnet, error = %reason, "host controller connection lost");
        self.conn = None;
        ctx.send_status(ControlMessage::new(
            STATUS_CONNECTION_LOST,
            Payload::Error(reason),
        ));
    }
}

impl WorkerHandler for GatewayIo {
    type Event = GatewayEvent;

    async fn init(&mut self, _ctx: &WorkerContext) -> DiResult<()> {
        Ok(())
    }

    async fn next_event(&mut self) -> GatewayEvent {
        let conn = self.conn.as_mut();
        let device_rx = self.device_rx.as_mut();

        let from_host = async move {
            match conn {
                Some(conn) => conn.recv().await,
                None => std::future::pending().await,
            }
        };
        let from_device = async move {
            match device_rx {
                Some(rx) => rx.recv().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            msg = from_host => GatewayEvent::HostCtrl(msg),
            pkt = from_device => GatewayEvent::Device(pkt),
        }
    }

    async fn handle_event(&mut self, ctx: &WorkerContext, event: GatewayEvent) {
        match event {
            GatewayEvent::HostCtrl(Ok(msg)) => self.forward_to_device(ctx, msg).await,
            GatewayEvent::HostCtrl(Err(e)) => self.lose_connection(ctx, e),
            GatewayEvent::Device(Some(pkt)) => self.forward_to_host(ctx, pkt).await,
            GatewayEvent::Device(None) => {
                debug!("device forwarding channel closed");
                self.device_rx = None;
            }
        }
    }

    async fn handle_request(&mut self, ctx: &WorkerContext, msg: ControlMessage) {
        match msg.name {
            CMD_CONNECT => {
                let result = self.register().await;
                ctx.send_status(ControlMessage::outcome(STATUS_CONNECT_DONE, result));
            }
            CMD_DISCONNECT => {
                self.unregister().await;
                ctx.send_status(ControlMessage::empty(STATUS_DISCONNECT_DONE));
            }
            other => warn!(command = other, "unknown gateway command"),
        }
    }

    async fn teardown(&mut self, _ctx: &WorkerContext) {
        self.unregister().await;
    }
}
