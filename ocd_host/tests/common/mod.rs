//! Mock host controller shared by the integration tests.
//!
//! Listens on an ephemeral localhost port and answers scripted requests.
//! Every received message is recorded so tests can wait for it.

#![allow(dead_code)]

use ocd_common::config::{GatewayConfig, HostModConfig, Timeouts};
use ocd_common::packet::{
    Packet, PacketType, REG_REQ_READ_16, REG_REQ_WRITE_16, REG_RESP_READ_ERROR,
    REG_RESP_READ_SUCCESS_16, REG_RESP_WRITE_SUCCESS,
};
use ocd_common::wire::{self, Message, cmd};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// diaddr handed out by [`MockHostController::expect_registration`].
pub const MOCK_DIADDR: u16 = 7;

/// Generous bound for waiting on asynchronous effects.
pub const WAIT: Duration = Duration::from_secs(3);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_timeouts() -> Timeouts {
    Timeouts {
        connect_ms: 500,
        response_ms: 300,
        control_ms: 3000,
        device_join_ms: 1000,
    }
}

pub fn hostmod_config(endpoint: &str) -> HostModConfig {
    HostModConfig {
        timeouts: test_timeouts(),
        ..HostModConfig::new(endpoint)
    }
}

pub fn gateway_config(endpoint: &str, subnet: u16) -> GatewayConfig {
    GatewayConfig {
        timeouts: test_timeouts(),
        ..GatewayConfig::new(endpoint, subnet)
    }
}

/// An endpoint nobody listens on.
pub fn unreachable_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("tcp://{addr}")
}

/// `DIADDR_RELEASE` for [`MOCK_DIADDR`].
pub fn release_command() -> String {
    format!("{} {MOCK_DIADDR}", cmd::DIADDR_RELEASE)
}

pub fn read16_request(target: u16, src: u16, reg: u16) -> Packet {
    Packet::new(target, src, PacketType::Reg, REG_REQ_READ_16, &[reg])
}

pub fn read16_response(target: u16, dest: u16, value: u16) -> Packet {
    Packet::new(dest, target, PacketType::Reg, REG_RESP_READ_SUCCESS_16, &[value])
}

pub fn read_error_response(target: u16, dest: u16) -> Packet {
    Packet::new(dest, target, PacketType::Reg, REG_RESP_READ_ERROR, &[])
}

pub fn write16_request(target: u16, src: u16, reg: u16, value: u16) -> Packet {
    Packet::new(target, src, PacketType::Reg, REG_REQ_WRITE_16, &[reg, value])
}

pub fn write_success_response(target: u16, dest: u16) -> Packet {
    Packet::new(dest, target, PacketType::Reg, REG_RESP_WRITE_SUCCESS, &[])
}

struct Expectation {
    request: Message,
    replies: Vec<Message>,
    delay: Duration,
}

#[derive(Default)]
struct Inner {
    expectations: VecDeque<Expectation>,
    received: Vec<Message>,
    clients: Vec<TcpStream>,
}

struct Shared {
    inner: Mutex<Inner>,
    changed: Condvar,
    shutdown: AtomicBool,
}

pub struct MockHostController {
    addr: SocketAddr,
    shared: Arc<Shared>,
    accept: Option<JoinHandle<()>>,
}

impl MockHostController {
    pub fn start() -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner::default()),
            changed: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let accept_shared = Arc::clone(&shared);
        let accept = thread::spawn(move || accept_loop(listener, accept_shared));
        Self {
            addr,
            shared,
            accept: Some(accept),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    /// Answer the first message equal to `request` with `reply`.
    pub fn expect(&self, request: Message, reply: Option<Message>) {
        self.expect_replies(request, reply.into_iter().collect(), Duration::ZERO);
    }

    /// Answer the first message equal to `request` with `replies`, in
    /// order, after `delay`.
    pub fn expect_replies(&self, request: Message, replies: Vec<Message>, delay: Duration) {
        self.shared
            .inner
            .lock()
            .expectations
            .push_back(Expectation {
                request,
                replies,
                delay,
            });
    }

    pub fn expect_management(&self, request: &str, reply: &str) {
        self.expect(Message::management(request), Some(Message::management(reply)));
    }

    pub fn expect_packet(&self, request: Packet, reply: Option<Packet>) {
        self.expect(
            Message::packet(&request),
            reply.as_ref().map(Message::packet),
        );
    }

    /// Host module registration and release for [`MOCK_DIADDR`].
    pub fn expect_registration(&self) {
        self.expect_management(cmd::DIADDR_REQUEST, &MOCK_DIADDR.to_string());
        self.expect_management(&release_command(), cmd::ACK);
    }

    pub fn received(&self) -> Vec<Message> {
        self.shared.inner.lock().received.clone()
    }

    /// Number of received `D` frames.
    pub fn data_frames(&self) -> usize {
        self.received()
            .iter()
            .filter(|m| matches!(m, Message::Data(_)))
            .count()
    }

    /// Wait until a message matching `pred` was received.
    pub fn wait_for_match(
        &self,
        pred: impl Fn(&Message) -> bool,
        timeout: Duration,
    ) -> Option<Message> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.shared.inner.lock();
        loop {
            if let Some(msg) = inner.received.iter().find(|m| pred(m)) {
                return Some(msg.clone());
            }
            if Instant::now() >= deadline {
                return None;
            }
            self.shared.changed.wait_until(&mut inner, deadline);
        }
    }

    pub fn wait_for(&self, msg: &Message) -> bool {
        self.wait_for_match(|m| m == msg, WAIT).is_some()
    }

    /// Push an unsolicited message to every connected client.
    pub fn send(&self, msg: &Message) {
        let mut inner = self.shared.inner.lock();
        for client in &mut inner.clients {
            let _ = wire::write_message(client, msg);
        }
    }

    /// Close all client connections.
    pub fn disconnect_clients(&self) {
        let mut inner = self.shared.inner.lock();
        for client in inner.clients.drain(..) {
            let _ = client.shutdown(Shutdown::Both);
        }
    }

    pub fn pending_expectations(&self) -> usize {
        self.shared.inner.lock().expectations.len()
    }
}

impl Drop for MockHostController {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.disconnect_clients();
        // wake up the blocking accept
        let _ = TcpStream::connect(self.addr);
        if let Some(accept) = self.accept.take() {
            let _ = accept.join();
        }
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    for stream in listener.incoming() {
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }
        let Ok(stream) = stream else { continue };
        let Ok(writer) = stream.try_clone() else {
            continue;
        };
        shared.inner.lock().clients.push(writer);
        let conn_shared = Arc::clone(&shared);
        thread::spawn(move || serve(stream, conn_shared));
    }
}

fn serve(mut stream: TcpStream, shared: Arc<Shared>) {
    let Ok(mut writer) = stream.try_clone() else {
        return;
    };
    while let Ok(msg) = wire::read_message(&mut stream) {
        let matched = {
            let mut inner = shared.inner.lock();
            inner.received.push(msg.clone());
            let pos = inner.expectations.iter().position(|e| e.request == msg);
            shared.changed.notify_all();
            pos.and_then(|pos| inner.expectations.remove(pos))
        };
        let Some(expectation) = matched else { continue };
        if !expectation.delay.is_zero() {
            thread::sleep(expectation.delay);
        }
        // replies share the socket with `send`, write them under the lock
        let _inner = shared.inner.lock();
        for reply in &expectation.replies {
            let _ = wire::write_message(&mut writer, reply);
        }
    }
}
