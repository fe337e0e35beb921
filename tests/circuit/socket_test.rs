/*!
 * Socket Circuit Test
 * Two participants exchanging buffers over loopback TCP
 */

use super::common::{consume, produce, transport_with};
use circuit_dataplane::core::config::SocketConfig;
use circuit_dataplane::xfer::socket::SocketDriver;
use circuit_dataplane::{CircuitDescription, Protocol, Transport};
use pretty_assertions::assert_eq;
use serial_test::serial;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const CIRCUIT: u32 = 1;
const DEADLINE: Duration = Duration::from_secs(10);

fn socket_transport() -> Transport {
    transport_with(Arc::new(SocketDriver::new(SocketConfig::default())))
}

/// Poll both sides until `done` holds or the deadline passes
fn poll_until(
    producer: &mut Transport,
    consumer: &mut Transport,
    mut done: impl FnMut(&mut Transport, &mut Transport) -> bool,
) -> bool {
    let start = Instant::now();
    while start.elapsed() < DEADLINE {
        if done(producer, consumer) {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

fn connected() -> (Transport, Transport) {
    let mut producer = socket_transport();
    let mut consumer = socket_transport();
    let out = producer.add_local_endpoint(Protocol::Socket, 0, 2).unwrap();
    let input = consumer.add_local_endpoint(Protocol::Socket, 1, 2).unwrap();
    assert!(out.starts_with("ocpi-socket-rdma:127.0.0.1:"));

    let description = CircuitDescription::point_to_point(&out, &input, 3, 1024);
    producer.create_circuit(CIRCUIT, description.clone()).unwrap();
    consumer.create_circuit(CIRCUIT, description).unwrap();

    let ready = poll_until(&mut producer, &mut consumer, |p, c| {
        let p_ready = p.ready(CIRCUIT).unwrap();
        let c_ready = c.ready(CIRCUIT).unwrap();
        p_ready && c_ready
    });
    assert!(ready, "socket circuit never became ready");
    (producer, consumer)
}

#[test]
#[serial]
fn test_socket_round_trip() {
    let (mut producer, mut consumer) = connected();
    assert!(produce(&mut producer, CIRCUIT, 0, b"over tcp", 11));

    let mut received = None;
    let arrived = poll_until(&mut producer, &mut consumer, |_, c| {
        received = consume(c, CIRCUIT, 1);
        received.is_some()
    });
    assert!(arrived);
    let (input, payload) = received.unwrap();
    assert_eq!(payload, b"over tcp".to_vec());
    assert_eq!(input.opcode, 11);
}

#[test]
#[serial]
fn test_socket_flow_control() {
    let (mut producer, mut consumer) = connected();
    let mut sent = 0u32;
    let mut received = Vec::new();

    let finished = poll_until(&mut producer, &mut consumer, |p, c| {
        if sent < 12 && produce(p, CIRCUIT, 0, &sent.to_le_bytes(), sent) {
            sent += 1;
        }
        p.dispatch().unwrap();
        while let Some((_, payload)) = consume(c, CIRCUIT, 1) {
            received.push(u32::from_le_bytes(payload.try_into().unwrap()));
        }
        received.len() == 12
    });

    assert!(finished);
    assert_eq!(received, (0..12).collect::<Vec<u32>>());
    assert_eq!(producer.stats().transfers_failed, 0);
}
