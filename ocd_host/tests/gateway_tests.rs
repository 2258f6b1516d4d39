//! Gateway tests against the mock host controller and in-memory devices.

mod common;

use common::*;
use ocd_common::config::{ConfigLoader, GatewayConfig};
use ocd_common::error::{DiError, DiResult};
use ocd_common::packet::{EVENT_CONT, EVENT_LAST, Packet, PacketType};
use ocd_common::wire::{Message, cmd};
use ocd_host::gateway::Gateway;
use ocd_host::transport::{DeviceEndpoint, DeviceReader, DeviceWriter, MemoryDevice, StreamDevice};
use std::io::Write;
use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const SUBNET: u16 = 5;

fn register(subnet: u16) -> String {
    format!("{} {subnet}", cmd::GW_REGISTER)
}

fn unregister(subnet: u16) -> String {
    format!("{} {subnet}", cmd::GW_UNREGISTER)
}

fn memory_gateway(mock: &MockHostController) -> (Gateway, DeviceEndpoint) {
    let (device, endpoint) = MemoryDevice::new();
    let (reader, writer) = device.split();
    let gateway = Gateway::new(gateway_config(&mock.endpoint(), SUBNET), reader, writer).unwrap();
    (gateway, endpoint)
}

fn device_packet(payload: &[u16]) -> Packet {
    // from a module in subnet 5 to host module 7
    Packet::new(MOCK_DIADDR, (SUBNET << 10) | 1, PacketType::Event, EVENT_LAST, payload)
}

/// Poll `cond` until it holds or `WAIT` elapses.
fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn connect_registers_and_disconnect_unregisters() {
    let mock = MockHostController::start();
    mock.expect_management(&register(SUBNET), cmd::ACK);
    // a non-ACK reply to the unregistration must not fail the disconnect
    mock.expect_management(&unregister(SUBNET), cmd::NACK);
    let (mut gateway, _endpoint) = memory_gateway(&mock);

    assert!(!gateway.is_connected());
    gateway.connect().unwrap();
    assert!(gateway.is_connected());
    assert!(gateway.is_connected_to_hostctrl());
    assert!(gateway.is_connected_to_device());

    gateway.disconnect().unwrap();
    assert!(!gateway.is_connected());
    assert!(!gateway.is_connected_to_hostctrl());
    assert!(!gateway.is_connected_to_device());
    assert!(mock.wait_for(&Message::management(unregister(SUBNET))));
}

#[test]
fn connected_only_when_both_axes_are_up() {
    let mock = MockHostController::start();
    mock.expect_management(&register(SUBNET), cmd::ACK);
    mock.expect_management(&unregister(SUBNET), cmd::ACK);
    let (mut gateway, _endpoint) = memory_gateway(&mock);

    gateway.connect_hostctrl().unwrap();
    assert!(gateway.is_connected_to_hostctrl());
    assert!(!gateway.is_connected());

    gateway.connect_device().unwrap();
    assert!(gateway.is_connected());

    gateway.disconnect_device().unwrap();
    assert!(!gateway.is_connected());
    assert!(gateway.is_connected_to_hostctrl());

    // device axis can be brought up again with the same reader
    gateway.connect_device().unwrap();
    assert!(gateway.is_connected());
    gateway.disconnect().unwrap();
}

#[test]
fn rejected_registration_leaves_device_untouched() {
    let mock = MockHostController::start();
    mock.expect_management(&register(SUBNET), cmd::NACK);
    let (mut gateway, _endpoint) = memory_gateway(&mock);

    assert!(matches!(gateway.connect(), Err(DiError::ConnectionFailed(_))));
    assert!(!gateway.is_connected_to_hostctrl());
    assert!(!gateway.is_connected_to_device());
}

#[test]
fn unreachable_host_controller_fails_to_connect() {
    init_tracing();
    let (device, _endpoint) = MemoryDevice::new();
    let (reader, writer) = device.split();
    let mut gateway =
        Gateway::new(gateway_config(&unreachable_endpoint(), SUBNET), reader, writer).unwrap();

    assert!(matches!(gateway.connect(), Err(DiError::ConnectionFailed(_))));
    assert!(!gateway.is_connected());
}

#[test]
fn device_packet_reaches_host_controller_unchanged() {
    let mock = MockHostController::start();
    mock.expect_management(&register(SUBNET), cmd::ACK);
    mock.expect_management(&unregister(SUBNET), cmd::ACK);
    let (mut gateway, endpoint) = memory_gateway(&mock);
    gateway.connect().unwrap();

    let pkt = device_packet(&[0x0102, 0x0304]);
    endpoint.inject(pkt.clone()).unwrap();

    let frame = Message::Data(pkt.to_bytes());
    assert!(mock.wait_for(&frame));
    gateway.disconnect().unwrap();
}

#[test]
fn host_packet_reaches_device() {
    let mock = MockHostController::start();
    mock.expect_management(&register(SUBNET), cmd::ACK);
    mock.expect_management(&unregister(SUBNET), cmd::ACK);
    let (mut gateway, endpoint) = memory_gateway(&mock);
    gateway.connect().unwrap();

    let pkt = Packet::new((SUBNET << 10) | 1, MOCK_DIADDR, PacketType::Event, EVENT_CONT, &[9]);
    mock.send(&Message::packet(&pkt));
    // management frames from the host controller are not forwarded
    mock.send(&Message::management("HELLO"));

    assert_eq!(endpoint.recv_timeout(WAIT).unwrap(), pkt);
    assert_eq!(
        endpoint.recv_timeout(Duration::from_millis(100)),
        Err(DiError::Timeout)
    );
    gateway.disconnect().unwrap();
}

#[test]
fn device_packets_are_dropped_while_unregistered() {
    let mock = MockHostController::start();
    let (mut gateway, endpoint) = memory_gateway(&mock);

    gateway.connect_device().unwrap();
    endpoint.inject(device_packet(&[1])).unwrap();
    thread::sleep(Duration::from_millis(100));

    assert!(mock.received().is_empty());
    gateway.disconnect().unwrap();
}

#[test]
fn unplugged_device_ends_rx_thread() {
    let mock = MockHostController::start();
    mock.expect_management(&register(SUBNET), cmd::ACK);
    mock.expect_management(&unregister(SUBNET), cmd::ACK);
    let (mut gateway, mut endpoint) = memory_gateway(&mock);
    gateway.connect().unwrap();

    endpoint.unplug();
    assert!(eventually(|| !gateway.is_connected_to_device()));
    // the host axis is unaffected by a read-side disconnect
    assert!(gateway.is_connected_to_hostctrl());

    gateway.disconnect().unwrap();
    assert!(mock.wait_for(&Message::management(unregister(SUBNET))));
}

#[test]
fn device_lost_on_write_unregisters() {
    let mock = MockHostController::start();
    mock.expect_management(&register(SUBNET), cmd::ACK);
    mock.expect_management(&unregister(SUBNET), cmd::ACK);

    let (device, mut endpoint) = MemoryDevice::new();
    let writer = device.writer;
    // a reader that never reports the loss, only the writer sees it
    let reader = || -> DiResult<Packet> {
        thread::sleep(Duration::from_millis(10));
        Err(DiError::Timeout)
    };
    let mut gateway =
        Gateway::new(gateway_config(&mock.endpoint(), SUBNET), reader, writer).unwrap();
    gateway.connect().unwrap();

    endpoint.unplug();
    mock.send(&Message::packet(&device_packet(&[2])));

    assert!(mock.wait_for(&Message::management(unregister(SUBNET))));
    assert!(eventually(|| !gateway.is_connected_to_hostctrl()));
    assert!(gateway.is_connected_to_device());

    gateway.disconnect().unwrap();
    // unregistered exactly once
    let unregisters = mock
        .received()
        .into_iter()
        .filter(|m| *m == Message::management(unregister(SUBNET)))
        .count();
    assert_eq!(unregisters, 1);
}

#[test]
fn lost_host_controller_is_observed() {
    let mock = MockHostController::start();
    mock.expect_management(&register(SUBNET), cmd::ACK);
    let (mut gateway, _endpoint) = memory_gateway(&mock);
    gateway.connect().unwrap();

    mock.disconnect_clients();
    assert!(eventually(|| !gateway.is_connected_to_hostctrl()));
    gateway.disconnect().unwrap();
}

#[test]
fn drop_stops_device_before_unregistering() {
    let mock = Arc::new(MockHostController::start());
    mock.expect_management(&register(SUBNET), cmd::ACK);
    mock.expect_management(&unregister(SUBNET), cmd::ACK);

    let read_after_unregister = Arc::new(AtomicBool::new(false));
    let reader = {
        let mock = Arc::clone(&mock);
        let flag = Arc::clone(&read_after_unregister);
        let unregistered = Message::management(unregister(SUBNET));
        move || -> DiResult<Packet> {
            if mock.received().contains(&unregistered) {
                flag.store(true, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_millis(5));
            Err(DiError::Timeout)
        }
    };
    let writer = |_: &Packet| -> DiResult<()> { Ok(()) };
    let mut gateway =
        Gateway::new(gateway_config(&mock.endpoint(), SUBNET), reader, writer).unwrap();
    gateway.connect().unwrap();

    drop(gateway);
    assert!(mock.wait_for(&Message::management(unregister(SUBNET))));
    assert!(!read_after_unregister.load(Ordering::SeqCst));
}

#[test]
fn closure_transports() {
    let mock = MockHostController::start();
    mock.expect_management(&register(SUBNET), cmd::ACK);
    mock.expect_management(&unregister(SUBNET), cmd::ACK);

    let pkt = device_packet(&[0xabcd]);
    let mut pending = Some(pkt.clone());
    let reader = move || -> DiResult<Packet> {
        match pending.take() {
            Some(pkt) => Ok(pkt),
            None => Err(DiError::NotConnected),
        }
    };
    let writer = |_: &Packet| -> DiResult<()> { Ok(()) };
    let mut gateway =
        Gateway::new(gateway_config(&mock.endpoint(), SUBNET), reader, writer).unwrap();
    gateway.connect().unwrap();

    assert!(mock.wait_for(&Message::packet(&pkt)));
    assert!(eventually(|| !gateway.is_connected_to_device()));
    gateway.disconnect().unwrap();
}

#[test]
fn stream_device_over_tcp() {
    let mock = MockHostController::start();
    mock.expect_management(&register(SUBNET), cmd::ACK);
    mock.expect_management(&unregister(SUBNET), cmd::ACK);

    let simulator = TcpListener::bind("127.0.0.1:0").unwrap();
    let (reader, writer) =
        StreamDevice::connect_tcp(simulator.local_addr().unwrap(), Duration::from_millis(20))
            .unwrap();
    let (mut sim, _) = simulator.accept().unwrap();

    let mut gateway =
        Gateway::new(gateway_config(&mock.endpoint(), SUBNET), reader, writer).unwrap();
    gateway.connect().unwrap();

    // size 4, dest 7, src 0x1401, flags EVENT/LAST, payload 0x1234
    sim.write_all(&[0, 4, 0, 7, 0x14, 0x01, 0x80, 0x00, 0x12, 0x34])
        .unwrap();
    let expected = device_packet(&[0x1234]);
    assert!(mock.wait_for(&Message::packet(&expected)));

    gateway.disconnect().unwrap();
}

#[test]
fn gateway_from_config_file() {
    let mock = MockHostController::start();
    mock.expect_management(&register(3), cmd::ACK);
    mock.expect_management(&unregister(3), cmd::ACK);

    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("gateway.toml");
    std::fs::write(
        &path,
        format!(
            "host_controller = \"{}\"\nsubnet = 3\n\n[timeouts]\nresponse_ms = 300\n",
            mock.endpoint()
        ),
    )
    .unwrap();

    let config = GatewayConfig::load(&path).unwrap();
    let (device, _endpoint) = MemoryDevice::new();
    let (reader, writer) = device.split();
    let mut gateway = Gateway::new(config, reader, writer).unwrap();
    assert_eq!(gateway.subnet(), 3);

    gateway.connect().unwrap();
    assert!(gateway.is_connected());
    gateway.disconnect().unwrap();
}

#[test]
fn invalid_config_is_rejected() {
    init_tracing();
    let (device, _endpoint) = MemoryDevice::new();
    let (reader, writer) = device.split();
    let mut config = gateway_config(&unreachable_endpoint(), SUBNET);
    config.device_queue_depth = 0;

    assert!(matches!(
        Gateway::new(config, reader, writer),
        Err(DiError::InvalidArgument(_))
    ));
}

// hand-written transports outside the crate
struct CountingWriter(usize);

impl DeviceWriter for CountingWriter {
    fn write(&mut self, _pkt: &Packet) -> DiResult<()> {
        self.0 += 1;
        Ok(())
    }
}

struct SilentReader;

impl DeviceReader for SilentReader {
    fn read(&mut self) -> DiResult<Packet> {
        thread::sleep(Duration::from_millis(10));
        Err(DiError::Timeout)
    }
}

#[test]
fn custom_transports() {
    let mock = MockHostController::start();
    mock.expect_management(&register(SUBNET), cmd::ACK);
    mock.expect_management(&unregister(SUBNET), cmd::ACK);

    let mut gateway = Gateway::new(
        gateway_config(&mock.endpoint(), SUBNET),
        SilentReader,
        CountingWriter(0),
    )
    .unwrap();
    gateway.connect().unwrap();
    assert!(gateway.is_connected());
    gateway.disconnect().unwrap();
}
