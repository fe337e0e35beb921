/*!
 * Remote Circuit Test
 * Producer and consumer in separate participants over a shared PIO namespace
 */

use super::common::{consume, negotiate, pio_pair, produce, MAX_ROUNDS};
use circuit_dataplane::mailbox::{ContainerComms, MailboxSlot, RequestType, MAILBOX_COPY_FAILED};
use circuit_dataplane::transport::{BufferOffsets, NegotiationState};
use circuit_dataplane::{
    CircuitDescription, CircuitState, DataplaneError, MetaFlags, Protocol, Transport,
};
use pretty_assertions::assert_eq;

const CIRCUIT: u32 = 1;

/// Producer in mailbox 2, consumer in mailbox 1; both sides build circuit 1
fn connected(buffers: usize) -> (Transport, Transport) {
    let (mut producer, mut consumer) = pio_pair();
    let out = producer.add_local_endpoint(Protocol::Pio, 2, 4).unwrap();
    let input = consumer.add_local_endpoint(Protocol::Pio, 1, 4).unwrap();
    let description = CircuitDescription::point_to_point(&out, &input, buffers, 512);

    producer.create_circuit(CIRCUIT, description.clone()).unwrap();
    consumer.create_circuit(CIRCUIT, description).unwrap();
    assert!(negotiate(&mut producer, &mut consumer, CIRCUIT));
    (producer, consumer)
}

#[test]
fn test_negotiation_exchanges_offsets() {
    let (producer, consumer) = connected(2);

    let input = consumer.circuit(CIRCUIT).unwrap().port(1).unwrap();
    assert!(input.is_real());
    let shadow = producer.circuit(CIRCUIT).unwrap().shadow(1).unwrap();
    assert_eq!(shadow.negotiation(), NegotiationState::Ready);

    for tid in 0..2 {
        let entry = input.offsets(tid).unwrap();
        assert_eq!(entry.shadow_offset(2), shadow.state_offset(tid, 0));
        assert!(shadow.offsets(tid).unwrap().has_input_offsets());
    }
    assert!(producer.stats().mailbox_requests_sent > 0);
    assert!(consumer.stats().mailbox_requests_answered > 0);
}

#[test]
fn test_messages_cross_participants_in_order() {
    let (mut producer, mut consumer) = connected(2);

    let mut next = 0u32;
    let mut received = Vec::new();
    for _ in 0..MAX_ROUNDS {
        if next < 20 && produce(&mut producer, CIRCUIT, 0, format!("msg-{}", next).as_bytes(), next) {
            next += 1;
        }
        while let Some((input, payload)) = consume(&mut consumer, CIRCUIT, 1) {
            assert_eq!(input.opcode as usize, received.len());
            received.push(String::from_utf8(payload).unwrap());
        }
        if received.len() == 20 {
            break;
        }
    }

    let expected: Vec<String> = (0..20).map(|i| format!("msg-{}", i)).collect();
    assert_eq!(received, expected);
    assert_eq!(producer.stats().transfers_posted, 20);
    assert_eq!(consumer.stats().buffers_consumed, 20);
}

#[test]
fn test_remote_consumer_release_reaches_producer() {
    let (mut producer, mut consumer) = connected(2);

    let out = producer.next_empty_output_buffer(CIRCUIT, 0).unwrap().unwrap();
    producer
        .send_output_buffer(&out, 0, 0, MetaFlags::END_OF_CIRCUIT)
        .unwrap();

    let mut input = None;
    for _ in 0..MAX_ROUNDS {
        input = consumer.next_full_input_buffer(CIRCUIT, 1).unwrap();
        if input.is_some() {
            break;
        }
    }
    let input = input.unwrap();
    let meta = consumer.buffer_metadata(&input).unwrap();
    assert!(meta.meta_flags().contains(MetaFlags::END_OF_CIRCUIT));
    consumer.input_available(&input).unwrap();
    assert_eq!(consumer.circuit(CIRCUIT).unwrap().state(), CircuitState::Disconnecting);

    for _ in 0..MAX_ROUNDS {
        consumer.dispatch().unwrap();
        producer.dispatch().unwrap();
        if !producer.circuit(CIRCUIT).unwrap().released_by().unwrap().is_empty() {
            break;
        }
    }
    assert_eq!(producer.circuit(CIRCUIT).unwrap().released_by().unwrap(), vec![1]);
}

#[test]
fn test_request_for_unknown_circuit_stays_pending() {
    let (mut producer, mut consumer) = pio_pair();
    let out = producer.add_local_endpoint(Protocol::Pio, 2, 4).unwrap();
    let input = consumer.add_local_endpoint(Protocol::Pio, 1, 4).unwrap();
    let description = CircuitDescription::point_to_point(&out, &input, 2, 64);

    // Only the producer knows the circuit so far
    producer.create_circuit(CIRCUIT, description.clone()).unwrap();
    for _ in 0..10 {
        assert!(!producer.ready(CIRCUIT).unwrap());
        assert_eq!(consumer.dispatch().unwrap(), 0);
    }

    consumer.create_circuit(CIRCUIT, description).unwrap();
    assert!(negotiate(&mut producer, &mut consumer, CIRCUIT));
}

#[test]
fn test_unanswerable_request_is_cleared_with_error() {
    let (mut producer, mut consumer) = connected(2);
    let out = producer.local_endpoints()[0].clone();
    let consumer_smb = consumer.context().local_resources()[0].clone();
    let producer_smb = producer.context().local_resources()[0].clone();

    // Answer would land far outside the producer's SMB
    let slot = MailboxSlot::request(
        RequestType::ReqInputOffsets,
        CIRCUIT,
        1,
        &out,
        1 << 40,
        2 * BufferOffsets::SIZE,
        2,
    )
    .unwrap();
    ContainerComms::write_slot(consumer_smb.region().unwrap(), 2, &slot).unwrap();

    assert_eq!(consumer.dispatch().unwrap(), 1);
    assert_eq!(consumer.dispatch().unwrap(), 0);
    let cleared = ContainerComms::read_slot(producer_smb.region().unwrap(), 2).unwrap();
    assert!(cleared.is_empty());
    assert_eq!(cleared.error_code, MAILBOX_COPY_FAILED);

    // The mailbox keeps working for the rest of the circuit
    assert!(produce(&mut producer, CIRCUIT, 0, b"still alive", 4));
    let mut received = None;
    for _ in 0..MAX_ROUNDS {
        received = consume(&mut consumer, CIRCUIT, 1);
        if received.is_some() {
            break;
        }
    }
    assert_eq!(received.unwrap().1, b"still alive".to_vec());
}

#[test]
fn test_malformed_requester_is_discarded() {
    let (mut producer, mut consumer) = connected(2);
    let out = producer.local_endpoints()[0].clone();
    let consumer_smb = consumer.context().local_resources()[0].clone();

    let mut slot =
        MailboxSlot::request(RequestType::ReqInputOffsets, CIRCUIT, 1, &out, 0, 0, 2).unwrap();
    slot.url[0] = 0xff;
    ContainerComms::write_slot(consumer_smb.region().unwrap(), 2, &slot).unwrap();

    assert_eq!(consumer.dispatch().unwrap(), 1);
    assert!(ContainerComms::read_slot(consumer_smb.region().unwrap(), 2)
        .unwrap()
        .is_empty());
    assert!(producer.ready(CIRCUIT).unwrap());
}

#[test]
fn test_rejected_request_reports_missing_port() {
    let (mut producer, mut consumer) = pio_pair();
    let out = producer.add_local_endpoint(Protocol::Pio, 2, 4).unwrap();
    let input = consumer.add_local_endpoint(Protocol::Pio, 1, 4).unwrap();
    producer
        .create_circuit(CIRCUIT, CircuitDescription::point_to_point(&out, &input, 2, 64))
        .unwrap();
    // The consumer's copy of the circuit has the directions swapped
    consumer
        .create_circuit(CIRCUIT, CircuitDescription::point_to_point(&input, &out, 2, 64))
        .unwrap();

    let mut outcome = Ok(false);
    for _ in 0..MAX_ROUNDS {
        outcome = producer.ready(CIRCUIT);
        if outcome != Ok(false) {
            break;
        }
        consumer.dispatch().unwrap();
    }
    assert_eq!(
        outcome,
        Err(DataplaneError::PortNotFound {
            circuit: CIRCUIT,
            port: 1,
        })
    );

    // Reported once; the next poll asks again
    assert_eq!(producer.ready(CIRCUIT), Ok(false));
}
