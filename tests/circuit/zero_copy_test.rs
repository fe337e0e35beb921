/*!
 * Zero-Copy Forwarding Test
 * Input buffers forwarded through output buffers of chained circuits
 */

use super::common::{consume, produce, MAX_ROUNDS};
use circuit_dataplane::transport::BufferPhase;
use circuit_dataplane::{CircuitDescription, Protocol, Transport, TransportConfig};
use pretty_assertions::assert_eq;

/// Three circuits A -> B -> C sharing one SMB; C has a single buffer
fn chain() -> (Transport, [u32; 3]) {
    let mut transport = Transport::with_defaults(TransportConfig::default()).unwrap();
    let endpoint = transport.add_local_endpoint(Protocol::Pio, 0, 2).unwrap();
    let mut ids = [0; 3];
    for (i, buffers) in [2usize, 2, 1].into_iter().enumerate() {
        ids[i] = transport
            .open_circuit(CircuitDescription::point_to_point(&endpoint, &endpoint, buffers, 256))
            .unwrap();
    }
    (transport, ids)
}

#[test]
fn test_forward_completes_and_consumes_input() {
    let (mut transport, [a, b, _]) = chain();
    assert!(produce(&mut transport, a, 0, b"forwarded", 5));

    let input = transport.next_full_input_buffer(a, 1).unwrap().unwrap();
    let output = transport.next_empty_output_buffer(b, 0).unwrap().unwrap();
    transport.send_zero_copy(&input, &output, 6).unwrap();

    assert!(transport.zero_copy_links().is_empty());
    let circuit_a = transport.circuit(a).unwrap();
    assert_eq!(circuit_a.count_in_phase(1, BufferPhase::Full).unwrap(), 0);
    assert_eq!(transport.stats().buffers_consumed, 1);

    let (received, payload) = consume(&mut transport, b, 1).unwrap();
    assert_eq!(payload, b"forwarded".to_vec());
    assert_eq!(received.opcode, 6);
}

#[test]
fn test_forward_through_two_hops() {
    let (mut transport, [a, b, c]) = chain();
    assert!(produce(&mut transport, a, 0, b"hop", 1));

    for (from, to) in [(a, b), (b, c)] {
        let input = transport.next_full_input_buffer(from, 1).unwrap().unwrap();
        let output = transport.next_empty_output_buffer(to, 0).unwrap().unwrap();
        transport.send_zero_copy(&input, &output, 2).unwrap();
        assert!(transport.zero_copy_links().is_empty());
    }

    assert_eq!(consume(&mut transport, c, 1).unwrap().1, b"hop".to_vec());
    assert_eq!(transport.stats().buffers_consumed, 3);
}

#[test]
fn test_blocked_forward_keeps_link_until_release() {
    let (mut transport, [a, b, c]) = chain();

    // Fill C's only input buffer
    assert!(produce(&mut transport, c, 0, b"first", 1));
    assert!(produce(&mut transport, a, 0, b"second", 1));
    let a_input = transport.next_full_input_buffer(a, 1).unwrap().unwrap();
    let b_output = transport.next_empty_output_buffer(b, 0).unwrap().unwrap();
    transport.send_zero_copy(&a_input, &b_output, 1).unwrap();

    let b_input = transport.next_full_input_buffer(b, 1).unwrap().unwrap();
    let c_output = transport.next_empty_output_buffer(c, 0).unwrap().unwrap();
    transport.send_zero_copy(&b_input, &c_output, 1).unwrap();

    assert_eq!(transport.circuit(c).unwrap().queued(), 1);
    assert_eq!(transport.zero_copy_links().len(), 1);
    assert_eq!(
        transport.zero_copy_links().linked(&c_output.key),
        Some(b_input.key)
    );

    transport.release_circuit(c).unwrap();
    assert!(transport.zero_copy_links().is_empty());

    // The forwarded input went back to B's producer
    let circuit_b = transport.circuit(b).unwrap();
    assert_eq!(circuit_b.count_in_phase(1, BufferPhase::Full).unwrap(), 0);
    for i in 0..6u32 {
        assert!(produce(&mut transport, b, 0, &i.to_le_bytes(), i));
        assert_eq!(consume(&mut transport, b, 1).unwrap().1, i.to_le_bytes().to_vec());
    }
    assert_eq!(transport.circuit(b).unwrap().queued(), 0);
}

#[test]
fn test_releasing_upstream_keeps_queued_payload() {
    let (mut transport, [a, _, c]) = chain();

    // C's only buffer is full, so the forward out of A has to wait
    assert!(produce(&mut transport, c, 0, b"first", 1));
    assert!(produce(&mut transport, a, 0, b"second", 2));
    let a_input = transport.next_full_input_buffer(a, 1).unwrap().unwrap();
    let c_output = transport.next_empty_output_buffer(c, 0).unwrap().unwrap();
    transport.send_zero_copy(&a_input, &c_output, 2).unwrap();
    assert_eq!(transport.circuit(c).unwrap().queued(), 1);

    transport.release_circuit(a).unwrap();
    assert!(transport.zero_copy_links().is_empty());

    // A new circuit takes over the memory A gave back
    let endpoint = transport.local_endpoints()[0].clone();
    let d = transport
        .open_circuit(CircuitDescription::point_to_point(&endpoint, &endpoint, 2, 256))
        .unwrap();
    assert!(produce(&mut transport, d, 0, b"CLOBBER", 3));

    let mut received = Vec::new();
    for _ in 0..MAX_ROUNDS {
        if let Some((_, payload)) = consume(&mut transport, c, 1) {
            received.push(payload);
        }
        if received.len() == 2 {
            break;
        }
    }
    assert_eq!(received, vec![b"first".to_vec(), b"second".to_vec()]);
}

#[test]
fn test_forward_rejects_oversized_payload() {
    let mut transport = Transport::with_defaults(TransportConfig::default()).unwrap();
    let endpoint = transport.add_local_endpoint(Protocol::Pio, 0, 2).unwrap();
    let wide = transport
        .open_circuit(CircuitDescription::point_to_point(&endpoint, &endpoint, 2, 256))
        .unwrap();
    let narrow = transport
        .open_circuit(CircuitDescription::point_to_point(&endpoint, &endpoint, 2, 16))
        .unwrap();

    assert!(produce(&mut transport, wide, 0, &[7u8; 64], 1));
    let input = transport.next_full_input_buffer(wide, 1).unwrap().unwrap();
    let output = transport.next_empty_output_buffer(narrow, 0).unwrap().unwrap();

    assert!(transport.send_zero_copy(&input, &output, 1).is_err());
    assert!(transport.send_zero_copy(&output, &input, 1).is_err());
    assert!(transport.zero_copy_links().is_empty());
}
