/*!
 * Co-located Circuit Test
 * Producer and consumer in one participant: flow control without mailbox traffic
 */

use super::common::{consume, produce};
use circuit_dataplane::mailbox::ContainerComms;
use circuit_dataplane::transport::BufferPhase;
use circuit_dataplane::{
    CircuitDescription, CircuitState, MetaFlags, PortSetDescription, Protocol, Transport,
    TransportConfig,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

fn colocated(buffers: usize) -> (Transport, u32) {
    let mut transport = Transport::with_defaults(TransportConfig::default()).unwrap();
    let endpoint = transport.add_local_endpoint(Protocol::Pio, 0, 2).unwrap();
    let id = transport
        .open_circuit(CircuitDescription::point_to_point(&endpoint, &endpoint, buffers, 128))
        .unwrap();
    (transport, id)
}

#[test]
fn test_hundred_messages_in_order_without_mailbox_traffic() {
    let (mut transport, id) = colocated(4);
    assert!(transport.ready(id).unwrap());

    let mut sent = 0u32;
    let mut received = Vec::new();
    while received.len() < 100 {
        // Producer runs ahead until flow control stops it
        while sent < 100 && produce(&mut transport, id, 0, &sent.to_le_bytes(), sent) {
            sent += 1;
            if transport.circuit(id).unwrap().queued() > 0 {
                break;
            }
        }
        while let Some((input, payload)) = consume(&mut transport, id, 1) {
            assert_eq!(input.opcode as usize, received.len());
            received.push(u32::from_le_bytes(payload.try_into().unwrap()));
        }
    }

    assert_eq!(received, (0..100).collect::<Vec<u32>>());
    let stats = transport.stats();
    assert_eq!(stats.mailbox_requests_sent, 0);
    assert_eq!(stats.transfers_posted, 100);
    assert_eq!(stats.buffers_consumed, 100);
    assert_eq!(stats.bytes_transferred, 400);
}

#[test]
fn test_producer_stalls_when_consumer_is_slow() {
    let (mut transport, id) = colocated(2);
    for i in 0..3u32 {
        assert!(produce(&mut transport, id, 0, &[i as u8], i));
    }

    let circuit = transport.circuit(id).unwrap();
    assert_eq!(circuit.queued(), 1);
    assert_eq!(circuit.count_in_phase(1, BufferPhase::Full).unwrap(), 2);
    assert_eq!(transport.stats().transfers_queued, 1);

    let (_, first) = consume(&mut transport, id, 1).unwrap();
    assert_eq!(first, vec![0]);
    transport.dispatch().unwrap();
    assert_eq!(transport.circuit(id).unwrap().queued(), 0);

    let (_, second) = consume(&mut transport, id, 1).unwrap();
    let (_, third) = consume(&mut transport, id, 1).unwrap();
    assert_eq!((second, third), (vec![1], vec![2]));
}

#[test]
fn test_round_robin_and_end_of_stream_broadcast() {
    let mut transport = Transport::with_defaults(TransportConfig::default()).unwrap();
    let endpoint = transport.add_local_endpoint(Protocol::Pio, 0, 2).unwrap();
    let description = CircuitDescription {
        buffer_count: 2,
        buffer_size: 64,
        output: PortSetDescription::new(vec![endpoint.clone()]),
        inputs: vec![PortSetDescription::new(vec![endpoint.clone(), endpoint.clone()])],
    };
    let id = transport.open_circuit(description).unwrap();

    assert!(produce(&mut transport, id, 0, b"a", 1));
    assert!(produce(&mut transport, id, 0, b"b", 2));
    assert_eq!(consume(&mut transport, id, 1).unwrap().1, b"a".to_vec());
    assert_eq!(consume(&mut transport, id, 2).unwrap().1, b"b".to_vec());

    let out = transport.next_empty_output_buffer(id, 0).unwrap().unwrap();
    transport.write_buffer(&out, b"eos").unwrap();
    transport
        .send_output_buffer(&out, 3, 0, MetaFlags::END_OF_STREAM)
        .unwrap();

    for port in [1, 2] {
        let input = transport.next_full_input_buffer(id, port).unwrap().unwrap();
        let meta = transport.buffer_metadata(&input).unwrap();
        assert!(meta.meta_flags().contains(MetaFlags::END_OF_STREAM | MetaFlags::BROADCAST));
        transport.input_available(&input).unwrap();
    }
}

#[test]
fn test_end_of_circuit_disconnects_and_release_closes() {
    let (mut transport, id) = colocated(2);
    let out = transport.next_empty_output_buffer(id, 0).unwrap().unwrap();
    transport
        .send_output_buffer(&out, 0, 0, MetaFlags::END_OF_CIRCUIT)
        .unwrap();

    let input = transport.next_full_input_buffer(id, 1).unwrap().unwrap();
    transport.input_available(&input).unwrap();

    let circuit = transport.circuit(id).unwrap();
    assert_eq!(circuit.state(), CircuitState::Disconnecting);
    assert_eq!(circuit.released_by().unwrap(), vec![0]);
    assert!(transport.next_empty_output_buffer(id, 0).is_err());

    let smb = transport.context().local_resources()[0].clone();
    transport.release_circuit(id).unwrap();
    assert_eq!(smb.allocator().unwrap().stats().allocated, ContainerComms::size());
    assert_eq!(transport.stats().circuits_closed, 1);
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Produce,
    Consume,
    Dispatch,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![Just(Step::Produce), Just(Step::Consume), Just(Step::Dispatch)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_full_buffers_never_exceed_ring(
        buffers in 1usize..5,
        steps in prop::collection::vec(step(), 1..80),
    ) {
        let (mut transport, id) = colocated(buffers);
        let mut next = 0u32;
        let mut expected = 0u32;

        for step in steps {
            match step {
                Step::Produce => {
                    if produce(&mut transport, id, 0, &next.to_le_bytes(), next) {
                        next += 1;
                    }
                }
                Step::Consume => {
                    if let Some((_, payload)) = consume(&mut transport, id, 1) {
                        prop_assert_eq!(payload, expected.to_le_bytes().to_vec());
                        expected += 1;
                    }
                }
                Step::Dispatch => {
                    transport.dispatch().unwrap();
                }
            }
            let circuit = transport.circuit(id).unwrap();
            let full = circuit.count_in_phase(1, BufferPhase::Full).unwrap();
            prop_assert!(full <= buffers);
            prop_assert!(expected + full as u32 <= next);
        }
    }
}
