//! Host module: a host-side participant on the debug interconnect.
//!
//! A [`HostMod`] registers with the host controller, obtains a diaddr and
//! then offers synchronous register access to debug modules and an
//! asynchronous event channel.
//!
//! # Threads and queues
//!
//! The connection lives on a [`Worker`] thread. The worker demultiplexes
//! inbound packets into two queues towards the owner:
//!
//! - REG packets go to the register response queue
//! - EVENT packets addressed to this module go to the event queue
//!
//! Register requests and received events therefore never see each other's
//! traffic. Only one register request may be in flight at a time; the
//! protocol pairs requests and responses by order alone, so an overlapping
//! call fails with `Busy`. Stale responses (from a request that timed out
//! earlier) are discarded before each new request.
//!
//! # Connection states
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──ok──► Connected
//!      ▲                          │                  │
//!      └────────────failed────────┘           disconnect() / lost
//!      └──────────────────────── Disconnecting ◄─────┘
//! ```

use crate::connection::HostConnection;
use crate::worker::{
    CMD_CONNECT, CMD_DISCONNECT, ControlMessage, Payload, STATUS_CONNECT_DONE,
    STATUS_CONNECTION_LOST, STATUS_DISCONNECT_DONE, Worker, WorkerContext, WorkerHandler,
    send_control,
};
use ocd_common::addr;
use ocd_common::config::{HostModConfig, Timeouts};
use ocd_common::error::{DiError, DiResult};
use ocd_common::module::ModuleDescriptor;
use ocd_common::packet::{
    Packet, PacketType, REG_RESP_READ_ERROR, REG_RESP_WRITE_ERROR, REG_RESP_WRITE_SUCCESS,
};
use ocd_common::reg::{
    REG_BASE_MOD_CS, REG_BASE_MOD_CS_ACTIVE, REG_BASE_MOD_EVENT_DEST, REG_BASE_MOD_TYPE,
    REG_BASE_MOD_VENDOR, REG_BASE_MOD_VERSION, RegFlags, RegWidth,
};
use ocd_common::wire::{Message, cmd};
use parking_lot::{Mutex, RwLock};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};
use tokio::sync::mpsc as tokio_mpsc;
use tracing::{debug, info, warn};

/// Send a packet to the host controller.
pub const CMD_SEND: &str = "I-SEND";

/// Items on the owner-facing queues. `Err` means the connection ended.
type Inbound = DiResult<Packet>;

/// Connection state of a host module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug)]
struct Link {
    state: LinkState,
    diaddr: u16,
}

impl Link {
    fn reset(&mut self) {
        self.state = LinkState::Disconnected;
        self.diaddr = addr::DIADDR_UNASSIGNED;
    }
}

/// Client side of the host-module protocol.
///
/// All methods take `&self`; a `HostMod` can be shared between an RPC
/// thread and an event-receiving thread.
pub struct HostMod {
    config: HostModConfig,
    /// Held for the duration of a connect/disconnect transition.
    worker: Mutex<Worker>,
    commands: tokio_mpsc::Sender<ControlMessage>,
    link: RwLock<Link>,
    /// Held for the duration of a register request.
    responses: Mutex<Receiver<Inbound>>,
    events: Mutex<Receiver<Inbound>>,
}

impl HostMod {
    /// Create a host module and start its worker. Does not connect.
    pub fn new(config: HostModConfig) -> DiResult<Self> {
        config
            .validate()
            .map_err(|e| DiError::invalid(e.to_string()))?;

        let (response_tx, response_rx) = mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel();
        let io = HostModIo {
            endpoint: config.host_controller.clone(),
            timeouts: config.timeouts,
            conn: None,
            diaddr: addr::DIADDR_UNASSIGNED,
            response_tx,
            event_tx,
        };
        let worker = Worker::start(
            &format!("{}-hostmod-io", config.service_name()),
            io,
            config.timeouts.control(),
        )?;
        let commands = worker.command_sender();

        Ok(Self {
            config,
            worker: Mutex::new(worker),
            commands,
            link: RwLock::new(Link {
                state: LinkState::Disconnected,
                diaddr: addr::DIADDR_UNASSIGNED,
            }),
            responses: Mutex::new(response_rx),
            events: Mutex::new(event_rx),
        })
    }

    /// Register with the host controller and obtain a diaddr.
    ///
    /// Connecting an already connected module is a no-op. Fails with
    /// `Busy` while another transition is in flight.
    pub fn connect(&self) -> DiResult<()> {
        let mut worker = self.worker.try_lock().ok_or(DiError::Busy)?;
        self.process_unsolicited(&mut worker);

        {
            let mut link = self.link.write();
            if link.state == LinkState::Connected {
                return Ok(());
            }
            link.state = LinkState::Connecting;
        }

        // leftovers of a previous connection, never of the new one
        self.drain_queues();
        let result = worker.request(ControlMessage::empty(CMD_CONNECT), STATUS_CONNECT_DONE);

        let mut link = self.link.write();
        match result {
            Ok(Payload::Address(diaddr)) => {
                link.state = LinkState::Connected;
                link.diaddr = diaddr;
                info!(
                    diaddr,
                    endpoint = %self.config.host_controller,
                    "connected to host controller"
                );
                Ok(())
            }
            Ok(other) => {
                link.reset();
                Err(DiError::connection_failed(format!(
                    "unexpected connect status payload {other:?}"
                )))
            }
            Err(e) => {
                link.reset();
                warn!(
                    endpoint = %self.config.host_controller,
                    error = %e,
                    "unable to connect to host controller"
                );
                Err(match e {
                    DiError::ConnectionFailed(_) => e,
                    other => DiError::connection_failed(other.to_string()),
                })
            }
        }
    }

    /// Release the diaddr and close the connection.
    pub fn disconnect(&self) -> DiResult<()> {
        let mut worker = self.worker.try_lock().ok_or(DiError::Busy)?;
        self.process_unsolicited(&mut worker);

        {
            let mut link = self.link.write();
            if link.state != LinkState::Connected {
                return Err(DiError::NotConnected);
            }
            link.state = LinkState::Disconnecting;
        }

        let result = worker.request(
            ControlMessage::empty(CMD_DISCONNECT),
            STATUS_DISCONNECT_DONE,
        );
        self.link.write().reset();
        result?;
        info!("disconnected from host controller");
        Ok(())
    }

    /// Whether the module is registered with the host controller.
    pub fn is_connected(&self) -> bool {
        self.link.read().state == LinkState::Connected
    }

    /// Current connection state.
    pub fn state(&self) -> LinkState {
        self.link.read().state
    }

    /// diaddr assigned by the host controller; `None` while not connected.
    pub fn diaddr(&self) -> Option<u16> {
        let link = self.link.read();
        (link.state == LinkState::Connected).then_some(link.diaddr)
    }

    /// Read a register of the module at `target`.
    pub fn reg_read(
        &self,
        target: u16,
        reg: u16,
        width_bits: u32,
        flags: RegFlags,
    ) -> DiResult<u128> {
        let width = RegWidth::try_from(width_bits)?;
        let src = self.connected_diaddr()?;

        let request = Packet::new(target, src, PacketType::Reg, width.read_request(), &[reg]);
        let success = width.read_success();
        let response = self.transact(request, flags, |sub| {
            sub == success || sub == REG_RESP_READ_ERROR
        })?;

        if response.type_sub() == REG_RESP_READ_ERROR {
            return Err(DiError::failure(format!(
                "module {target} reported an error reading register {reg:#06x}"
            )));
        }
        width.decode(response.payload())
    }

    /// Write a register of the module at `target`.
    pub fn reg_write(
        &self,
        target: u16,
        reg: u16,
        width_bits: u32,
        value: u128,
        flags: RegFlags,
    ) -> DiResult<()> {
        let width = RegWidth::try_from(width_bits)?;
        let words = width.encode(value)?;
        let src = self.connected_diaddr()?;

        let mut payload = Vec::with_capacity(1 + words.len());
        payload.push(reg);
        payload.extend(words);
        let request = Packet::new(target, src, PacketType::Reg, width.write_request(), &payload);
        let response = self.transact(request, flags, |sub| {
            sub == REG_RESP_WRITE_SUCCESS || sub == REG_RESP_WRITE_ERROR
        })?;

        if response.type_sub() == REG_RESP_WRITE_ERROR {
            return Err(DiError::failure(format!(
                "module {target} reported an error writing register {reg:#06x}"
            )));
        }
        Ok(())
    }

    /// Read the identification registers of the module at `target`.
    pub fn describe_module(&self, target: u16) -> DiResult<ModuleDescriptor> {
        let read = |reg| {
            self.reg_read(target, reg, 16, RegFlags::empty())
                .map(|v| v as u16)
        };
        Ok(ModuleDescriptor {
            addr: target,
            vendor: read(REG_BASE_MOD_VENDOR)?,
            module_type: read(REG_BASE_MOD_TYPE)?,
            version: read(REG_BASE_MOD_VERSION)?,
        })
    }

    /// Make this module the event destination of the module at `target`.
    pub fn set_event_destination(&self, target: u16) -> DiResult<()> {
        let own = self.connected_diaddr()?;
        self.reg_write(
            target,
            REG_BASE_MOD_EVENT_DEST,
            16,
            u128::from(own),
            RegFlags::empty(),
        )
    }

    /// Activate or stall the module at `target`.
    pub fn set_module_active(&self, target: u16, active: bool) -> DiResult<()> {
        let cs = if active { REG_BASE_MOD_CS_ACTIVE } else { 0 };
        self.reg_write(target, REG_BASE_MOD_CS, 16, u128::from(cs), RegFlags::empty())
    }

    /// Send an EVENT packet. Fire and forget.
    pub fn event_send(&self, pkt: Packet) -> DiResult<()> {
        self.connected_diaddr()?;
        if pkt.packet_type() != Some(PacketType::Event) {
            return Err(DiError::invalid(format!(
                "event_send requires an EVENT packet, got {pkt}"
            )));
        }
        send_control(&self.commands, ControlMessage::new(CMD_SEND, Payload::Packet(pkt)))
    }

    /// Block until an EVENT packet for this module arrives.
    pub fn event_receive(&self) -> DiResult<Packet> {
        self.receive_event(None)
    }

    /// Like [`HostMod::event_receive`], failing with `Timeout` after
    /// `timeout`.
    pub fn event_receive_timeout(&self, timeout: Duration) -> DiResult<Packet> {
        self.receive_event(Some(timeout))
    }

    fn receive_event(&self, timeout: Option<Duration>) -> DiResult<Packet> {
        self.connected_diaddr()?;
        let events = self.events.lock();
        let next = match timeout {
            Some(t) => events.recv_timeout(t),
            None => events.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match next {
            Ok(Ok(pkt)) => Ok(pkt),
            Ok(Err(e)) => Err(self.connection_ended(e)),
            Err(RecvTimeoutError::Timeout) => Err(DiError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(DiError::NotConnected),
        }
    }

    /// Send a REG request and wait for the matching response.
    fn transact(
        &self,
        request: Packet,
        flags: RegFlags,
        accepts: impl Fn(u8) -> bool,
    ) -> DiResult<Packet> {
        let responses = self.responses.try_lock().ok_or(DiError::Busy)?;

        for stale in responses.try_iter() {
            match stale {
                Ok(pkt) => debug!(%pkt, "discarding stale register response"),
                Err(e) => return Err(self.connection_ended(e)),
            }
        }

        let target = request.dest();
        debug!(%request, "register request");
        send_control(
            &self.commands,
            ControlMessage::new(CMD_SEND, Payload::Packet(request)),
        )?;

        let deadline = (!flags.contains(RegFlags::BLOCKING))
            .then(|| Instant::now() + self.config.timeouts.response());
        loop {
            let next = match deadline {
                Some(deadline) => {
                    responses.recv_timeout(deadline.saturating_duration_since(Instant::now()))
                }
                None => responses.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match next {
                Ok(Ok(pkt)) if pkt.src() == target && accepts(pkt.type_sub()) => {
                    debug!(response = %pkt, "register response");
                    return Ok(pkt);
                }
                Ok(Ok(pkt)) => debug!(%pkt, "discarding unrelated register response"),
                Ok(Err(e)) => return Err(self.connection_ended(e)),
                Err(RecvTimeoutError::Timeout) => {
                    debug!(module = target, "register request timed out");
                    return Err(DiError::Timeout);
                }
                Err(RecvTimeoutError::Disconnected) => return Err(DiError::NotConnected),
            }
        }
    }

    fn connected_diaddr(&self) -> DiResult<u16> {
        self.diaddr().ok_or(DiError::NotConnected)
    }

    /// The worker reported the end of the connection on a queue.
    fn connection_ended(&self, reason: DiError) -> DiError {
        let mut link = self.link.write();
        if link.state == LinkState::Connected {
            warn!(error = %reason, "connection to host controller lost");
            link.reset();
        }
        DiError::NotConnected
    }

    fn process_unsolicited(&self, worker: &mut Worker) {
        for msg in worker.take_unsolicited() {
            if msg.name == STATUS_CONNECTION_LOST {
                let reason = msg.into_result().err().unwrap_or(DiError::NotConnected);
                self.connection_ended(reason);
            } else {
                debug!(status = msg.name, "ignoring unsolicited worker status");
            }
        }
    }

    /// Drop everything queued so far.
    fn drain_queues(&self) {
        if let Some(responses) = self.responses.try_lock() {
            responses.try_iter().for_each(drop);
        }
        if let Some(events) = self.events.try_lock() {
            events.try_iter().for_each(drop);
        }
    }
}

impl Drop for HostMod {
    fn drop(&mut self) {
        if self.is_connected() {
            debug!("host module dropped while connected, disconnecting");
            if let Err(e) = self.disconnect() {
                warn!(error = %e, "disconnect on drop failed");
            }
        }
    }
}

/// Worker side of a host module.
struct HostModIo {
    endpoint: String,
    timeouts: Timeouts,
    conn: Option<HostConnection>,
    diaddr: u16,
    response_tx: Sender<Inbound>,
    event_tx: Sender<Inbound>,
}

impl HostModIo {
    async fn register(&mut self) -> DiResult<Payload> {
        if self.conn.is_some() {
            return Ok(Payload::Address(self.diaddr));
        }

        let mut conn = HostConnection::connect(&self.endpoint, self.timeouts.connect()).await?;
        let reply = conn
            .request(cmd::DIADDR_REQUEST, self.timeouts.response())
            .await
            .map_err(|e| DiError::connection_failed(format!("address request failed: {e}")))?;
        let diaddr = reply
            .trim()
            .parse::<u16>()
            .ok()
            .filter(|a| addr::is_assigned(*a))
            .ok_or_else(|| {
                DiError::connection_failed(format!("host controller refused address: '{reply}'"))
            })?;

        debug!(diaddr, "obtained diaddr");
        self.conn = Some(conn);
        self.diaddr = diaddr;
        Ok(Payload::Address(diaddr))
    }

    async fn release(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        let command = format!("{} {}", cmd::DIADDR_RELEASE, self.diaddr);
        match conn.request(&command, self.timeouts.response()).await {
            Ok(reply) if reply == cmd::ACK => debug!(diaddr = self.diaddr, "diaddr released"),
            Ok(reply) => warn!(reply = %reply, "host controller did not acknowledge release"),
            Err(e) => warn!(error = %e, "unable to release diaddr"),
        }
        self.diaddr = addr::DIADDR_UNASSIGNED;
        self.notify_closed(DiError::NotConnected);
    }

    /// Wake up owner threads blocked on the queues.
    fn notify_closed(&self, reason: DiError) {
        let _ = self.response_tx.send(Err(reason.clone()));
        let _ = self.event_tx.send(Err(reason));
    }

    fn dispatch(&self, pkt: Packet) {
        match pkt.packet_type() {
            Some(PacketType::Reg) => {
                let _ = self.response_tx.send(Ok(pkt));
            }
            Some(PacketType::Event) if pkt.dest() == self.diaddr => {
                let _ = self.event_tx.send(Ok(pkt));
            }
            _ => debug!(%pkt, "dropping packet not meant for this module"),
        }
    }

    fn lose_connection(&mut self, ctx: &WorkerContext, reason: DiError) {
        warn!(endpoint = %self.endpoint, error = %reason, "host controller connection lost");
        self.conn = None;
        self.diaddr = addr::DIADDR_UNASSIGNED;
        self.notify_closed(reason.clone());
        ctx.send_status(ControlMessage::new(
            STATUS_CONNECTION_LOST,
            Payload::Error(reason),
        ));
    }
}

impl WorkerHandler for HostModIo {
    type Event = DiResult<Message>;

    async fn init(&mut self, _ctx: &WorkerContext) -> DiResult<()> {
        Ok(())
    }

    async fn next_event(&mut self) -> DiResult<Message> {
        match self.conn.as_mut() {
            Some(conn) => conn.recv().await,
            None => std::future::pending().await,
        }
    }

    async fn handle_event(&mut self, ctx: &WorkerContext, event: DiResult<Message>) {
        match event {
            Ok(msg @ Message::Data(_)) => match msg.to_packet() {
                Ok(pkt) => self.dispatch(pkt),
                Err(e) => warn!(error = %e, "dropping malformed data frame"),
            },
            Ok(Message::Management(s)) => {
                debug!(message = %s, "ignoring unsolicited management message");
            }
            Err(e) => self.lose_connection(ctx, e),
        }
    }

    async fn handle_request(&mut self, ctx: &WorkerContext, msg: ControlMessage) {
        match msg.name {
            CMD_CONNECT => {
                let result = self.register().await;
                ctx.send_status(ControlMessage::outcome(STATUS_CONNECT_DONE, result));
            }
            CMD_DISCONNECT => {
                self.release().await;
                ctx.send_status(ControlMessage::empty(STATUS_DISCONNECT_DONE));
            }
            CMD_SEND => {
                let Payload::Packet(pkt) = msg.payload else {
                    warn!("send command without packet");
                    return;
                };
                let Some(conn) = self.conn.as_mut() else {
                    warn!(%pkt, "not connected, dropping outbound packet");
                    return;
                };
                if let Err(e) = conn.send(&Message::packet(&pkt)).await {
                    self.lose_connection(ctx, e);
                }
            }
            other => warn!(command = other, "unknown host module command"),
        }
    }

    async fn teardown(&mut self, _ctx: &WorkerContext) {
        self.release().await;
    }
}
