/*!
 * RDMA Circuit Test
 * Two participants over the software verbs fabric
 */

use super::common::{consume, negotiate, produce, transport_with, MAX_ROUNDS};
use circuit_dataplane::core::config::OfedConfig;
use circuit_dataplane::xfer::ofed::{OfedDriver, SoftFabric};
use circuit_dataplane::xfer::XferServices;
use circuit_dataplane::{
    CircuitDescription, CircuitState, DataplaneError, MetaFlags, Protocol, Transport,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;

const CIRCUIT: u32 = 1;

struct Rig {
    fabric: Arc<SoftFabric>,
    producer: Transport,
    consumer: Transport,
    out: String,
    input: String,
}

fn rig() -> Rig {
    let fabric = SoftFabric::new(&["soft0"]);
    let mut producer = transport_with(Arc::new(OfedDriver::new(fabric.clone(), OfedConfig::default())));
    let mut consumer = transport_with(Arc::new(OfedDriver::new(fabric.clone(), OfedConfig::default())));
    let out = producer.add_local_endpoint(Protocol::Ofed, 2, 4).unwrap();
    let input = consumer.add_local_endpoint(Protocol::Ofed, 1, 4).unwrap();

    let description = CircuitDescription::point_to_point(&out, &input, 2, 4096);
    producer.create_circuit(CIRCUIT, description.clone()).unwrap();
    consumer.create_circuit(CIRCUIT, description).unwrap();
    assert!(negotiate(&mut producer, &mut consumer, CIRCUIT));

    Rig {
        fabric,
        producer,
        consumer,
        out,
        input,
    }
}

#[test]
fn test_endpoints_carry_hardware_address() {
    let rig = rig();
    for endpoint in [&rig.out, &rig.input] {
        assert!(endpoint.starts_with("ocpi-ofed-rdma:soft0:"));
        assert_eq!(endpoint.matches(':').count(), 8);
    }
    assert!(rig.fabric.queue_pairs().len() >= 2);
}

#[test]
fn test_payload_lands_before_flag() {
    let mut rig = rig();
    let payload = vec![0x5au8; 1500];
    assert!(produce(&mut rig.producer, CIRCUIT, 0, &payload, 9));

    let services = rig
        .producer
        .context()
        .services(&rig.out, &rig.input)
        .unwrap()
        .unwrap();
    let work = rig.fabric.posted_work(services.connection_cookie() as u32);
    assert!(work.len() >= 3);
    let last: Vec<bool> = work[work.len() - 3..].iter().map(|w| w.fenced).collect();
    assert_eq!(last, vec![false, false, true]);
    assert_eq!(work[work.len() - 3].length, 1500);

    let mut received = None;
    for _ in 0..MAX_ROUNDS {
        received = consume(&mut rig.consumer, CIRCUIT, 1);
        if received.is_some() {
            break;
        }
    }
    let (input, data) = received.unwrap();
    assert_eq!(input.opcode, 9);
    assert_eq!(data, payload);
}

#[test]
fn test_sustained_exchange() {
    let mut rig = rig();
    let mut sent = 0u32;
    let mut received = 0u32;
    for _ in 0..MAX_ROUNDS {
        if sent < 16 && produce(&mut rig.producer, CIRCUIT, 0, &sent.to_be_bytes(), sent) {
            sent += 1;
        }
        while let Some((_, data)) = consume(&mut rig.consumer, CIRCUIT, 1) {
            assert_eq!(data, received.to_be_bytes().to_vec());
            received += 1;
        }
        if received == 16 {
            break;
        }
    }
    assert_eq!(received, 16);
    assert_eq!(rig.producer.stats().transfers_failed, 0);
}

#[test]
fn test_remote_access_error_quiesces_circuit() {
    let mut rig = rig();
    rig.fabric.inject_remote_access_errors(1);

    let out = rig
        .producer
        .next_empty_output_buffer(CIRCUIT, 0)
        .unwrap()
        .unwrap();
    rig.producer.write_buffer(&out, b"doomed").unwrap();
    let sent = rig
        .producer
        .send_output_buffer(&out, 6, 0, MetaFlags::empty());
    if let Err(e) = sent {
        assert!(matches!(e, DataplaneError::TransferFailed { .. }));
    }

    for _ in 0..MAX_ROUNDS {
        rig.producer.dispatch().unwrap();
        if rig.producer.circuit(CIRCUIT).unwrap().fault().is_some() {
            break;
        }
    }

    let circuit = rig.producer.circuit(CIRCUIT).unwrap();
    assert!(circuit.fault().is_some());
    assert_eq!(circuit.state(), CircuitState::Disconnecting);
    assert_eq!(circuit.outstanding(), 0);
    assert_eq!(circuit.queued(), 0);
    assert_eq!(rig.producer.stats().transfers_failed, 1);
    let detail = circuit.fault().unwrap().to_string();

    let err = rig.producer.next_empty_output_buffer(CIRCUIT, 0).unwrap_err();
    assert_eq!(
        err,
        DataplaneError::TransferFailed {
            circuit: CIRCUIT,
            detail,
        }
    );
}
