/*!
 * Shared helpers for circuit tests
 */

#![allow(dead_code)]

use circuit_dataplane::core::types::{CircuitId, PortOrdinal};
use circuit_dataplane::xfer::pio::{PioDriver, PioNamespace};
use circuit_dataplane::xfer::TransferDriver;
use circuit_dataplane::{
    BufferHandle, DriverRegistry, MetaFlags, Transport, TransportConfig, TransportContext,
};
use std::sync::Arc;

/// Upper bound on dispatch rounds before a negotiation is considered stuck
pub const MAX_ROUNDS: usize = 200;

pub fn config() -> TransportConfig {
    TransportConfig::default().with_smb_size(1024 * 1024)
}

pub fn transport_with(driver: Arc<dyn TransferDriver>) -> Transport {
    let registry = DriverRegistry::new().with_driver(driver);
    Transport::new(TransportContext::new(config(), registry).unwrap())
}

/// Two participants that see each other's PIO regions
pub fn pio_pair() -> (Transport, Transport) {
    let namespace = PioNamespace::new();
    (
        transport_with(Arc::new(PioDriver::new(namespace.clone()))),
        transport_with(Arc::new(PioDriver::new(namespace))),
    )
}

/// Dispatch both sides until the circuit is ready on each
pub fn negotiate(a: &mut Transport, b: &mut Transport, id: CircuitId) -> bool {
    for _ in 0..MAX_ROUNDS {
        let a_ready = a.ready(id).unwrap();
        let b_ready = b.ready(id).unwrap();
        if a_ready && b_ready {
            return true;
        }
    }
    false
}

/// Fill and send one message; `false` when no output buffer is free
pub fn produce(
    transport: &mut Transport,
    id: CircuitId,
    port: PortOrdinal,
    payload: &[u8],
    opcode: u32,
) -> bool {
    let Some(out) = transport.next_empty_output_buffer(id, port).unwrap() else {
        return false;
    };
    transport.write_buffer(&out, payload).unwrap();
    transport
        .send_output_buffer(&out, payload.len() as u64, opcode, MetaFlags::empty())
        .unwrap();
    true
}

/// Receive and consume one message
pub fn consume(transport: &mut Transport, id: CircuitId, port: PortOrdinal) -> Option<(BufferHandle, Vec<u8>)> {
    let input = transport.next_full_input_buffer(id, port).unwrap()?;
    let payload = transport.read_buffer(&input).unwrap();
    transport.input_available(&input).unwrap();
    Some((input, payload))
}
