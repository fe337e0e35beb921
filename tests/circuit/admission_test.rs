/*!
 * Admission Control Test
 * Outstanding-transfer window and completion polling with a scripted backend
 */

use super::common::{config, negotiate, MAX_ROUNDS};
use circuit_dataplane::core::types::{BufferTid, MailboxId, Offset};
use circuit_dataplane::smb::SmemServices;
use circuit_dataplane::transport::BufferPhase;
use circuit_dataplane::xfer::pio::{PioDriver, PioNamespace};
use circuit_dataplane::xfer::{
    CompletionStatus, TransferDriver, XferFlags, XferRequest, XferServices,
};
use circuit_dataplane::{
    CircuitDescription, DataplaneResult, DriverRegistry, Endpoint, MetaFlags, Protocol,
    Transport, TransportConfig, TransportContext,
};
use mockall::mock;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::Arc;

const CIRCUIT: u32 = 1;
/// Polls answered with `Pending` before a request reports its real status
const PENDING_POLLS: usize = 2;

mock! {
    pub Request {}

    impl XferRequest for Request {
        fn copy(&mut self, src: Offset, dst: Offset, len: u64, flags: XferFlags) -> DataplaneResult<()>;
        fn post(&mut self) -> DataplaneResult<()>;
        fn status(&mut self) -> DataplaneResult<CompletionStatus>;
        fn copy_count(&self) -> usize;
    }
}

/// Request that performs real copies but completes late
fn delayed(inner: Box<dyn XferRequest>) -> MockRequest {
    let inner = Arc::new(Mutex::new(inner));
    let mut request = MockRequest::new();

    let copier = inner.clone();
    request
        .expect_copy()
        .returning(move |src, dst, len, flags| copier.lock().copy(src, dst, len, flags));
    let poster = inner.clone();
    request.expect_post().returning(move || poster.lock().post());
    let counter = inner.clone();
    request
        .expect_copy_count()
        .returning(move || counter.lock().copy_count());

    let mut polls = 0;
    request.expect_status().returning(move || {
        polls += 1;
        if polls <= PENDING_POLLS {
            Ok(CompletionStatus::Pending)
        } else {
            inner.lock().status()
        }
    });
    request
}

struct ScriptedServices {
    inner: Arc<dyn XferServices>,
}

impl XferServices for ScriptedServices {
    fn source(&self) -> &Arc<SmemServices> {
        self.inner.source()
    }

    fn target(&self) -> &Arc<SmemServices> {
        self.inner.target()
    }

    fn create_request(&self) -> DataplaneResult<Box<dyn XferRequest>> {
        Ok(Box::new(delayed(self.inner.create_request()?)))
    }
}

struct ScriptedDriver {
    inner: PioDriver,
}

impl TransferDriver for ScriptedDriver {
    fn protocol(&self) -> Protocol {
        self.inner.protocol()
    }

    fn allocate_endpoint(
        &self,
        config: &TransportConfig,
        mailbox: MailboxId,
        max_mailboxes: u16,
    ) -> DataplaneResult<Endpoint> {
        self.inner.allocate_endpoint(config, mailbox, max_mailboxes)
    }

    fn connect(
        &self,
        endpoint: &Endpoint,
        local: bool,
        config: &TransportConfig,
    ) -> DataplaneResult<Arc<SmemServices>> {
        self.inner.connect(endpoint, local, config)
    }

    fn create_connection(
        &self,
        source: &Arc<SmemServices>,
        target: &Arc<SmemServices>,
    ) -> DataplaneResult<Arc<dyn XferServices>> {
        Ok(Arc::new(ScriptedServices {
            inner: self.inner.create_connection(source, target)?,
        }))
    }
}

/// Scripted producer and plain PIO consumer sharing one namespace
fn rig(max_outstanding: usize) -> (Transport, Transport) {
    let namespace = PioNamespace::new();
    let scripted = ScriptedDriver {
        inner: PioDriver::new(namespace.clone()),
    };
    let registry = DriverRegistry::new().with_driver(Arc::new(scripted));
    let producer_config = config().with_max_outstanding(max_outstanding);
    let mut producer = Transport::new(TransportContext::new(producer_config, registry).unwrap());

    let registry = DriverRegistry::new().with_driver(Arc::new(PioDriver::new(namespace)));
    let mut consumer = Transport::new(TransportContext::new(config(), registry).unwrap());

    let out = producer.add_local_endpoint(Protocol::Pio, 0, 2).unwrap();
    let input = consumer.add_local_endpoint(Protocol::Pio, 1, 2).unwrap();
    let description = CircuitDescription::point_to_point(&out, &input, 4, 64);
    producer.create_circuit(CIRCUIT, description.clone()).unwrap();
    consumer.create_circuit(CIRCUIT, description).unwrap();
    assert!(negotiate(&mut producer, &mut consumer, CIRCUIT));
    (producer, consumer)
}

fn send(producer: &mut Transport, payload: &[u8]) -> BufferTid {
    let out = producer.next_empty_output_buffer(CIRCUIT, 0).unwrap().unwrap();
    producer.write_buffer(&out, payload).unwrap();
    producer
        .send_output_buffer(&out, payload.len() as u64, 0, MetaFlags::empty())
        .unwrap();
    out.key.tid
}

#[test]
fn test_output_stays_in_flight_until_completion() {
    let (mut producer, _consumer) = rig(4);
    let tid = send(&mut producer, b"slow");

    let phase = |p: &Transport| p.circuit(CIRCUIT).unwrap().buffer_phase(0, tid).unwrap();
    assert_eq!(phase(&producer), BufferPhase::InFlight);
    assert_eq!(producer.circuit(CIRCUIT).unwrap().outstanding(), 1);

    for _ in 0..PENDING_POLLS {
        producer.dispatch().unwrap();
        assert_eq!(phase(&producer), BufferPhase::InFlight);
    }
    producer.dispatch().unwrap();
    assert_eq!(phase(&producer), BufferPhase::Empty);
    assert_eq!(producer.circuit(CIRCUIT).unwrap().outstanding(), 0);
    assert_eq!(producer.stats().transfers_completed, 1);
}

#[test]
fn test_window_queues_beyond_max_outstanding() {
    let (mut producer, mut consumer) = rig(1);
    send(&mut producer, b"first");
    send(&mut producer, b"second");

    let circuit = producer.circuit(CIRCUIT).unwrap();
    assert_eq!(circuit.outstanding(), 1);
    assert_eq!(circuit.queued(), 1);
    assert_eq!(producer.stats().transfers_queued, 1);

    // The first completion makes room for the queued send
    for _ in 0..=PENDING_POLLS {
        producer.dispatch().unwrap();
    }
    let circuit = producer.circuit(CIRCUIT).unwrap();
    assert_eq!(circuit.queued(), 0);
    assert_eq!(circuit.outstanding(), 1);

    let mut payloads = Vec::new();
    for _ in 0..MAX_ROUNDS {
        if let Some(input) = consumer.next_full_input_buffer(CIRCUIT, 1).unwrap() {
            payloads.push(consumer.read_buffer(&input).unwrap());
            consumer.input_available(&input).unwrap();
        }
        if payloads.len() == 2 {
            break;
        }
    }
    assert_eq!(payloads, vec![b"first".to_vec(), b"second".to_vec()]);
}
