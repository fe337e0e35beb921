/*!
 * Transport
 * Circuits, ports and buffers over the local SMBs of one participant
 *
 * A `Transport` owns the participant's local SMBs and every circuit it takes
 * part in. All progress is made by polling: `dispatch()` answers mailbox
 * requests from peers and advances outstanding transfers, and the worker
 * operations never block.
 */

mod buffer;
mod circuit;
mod context;
mod controller;
mod description;
mod descriptor;
mod events;
mod flags;
mod layout;
mod port;
mod port_set;
mod worker;
mod zero_copy;

pub use buffer::{BufferHandle, BufferKey, BufferPhase};
pub use circuit::{Circuit, CircuitState};
pub use context::TransportContext;
pub use controller::{TransferController, TransferTarget};
pub use description::{CircuitDescription, Distribution, PortSetDescription};
pub use descriptor::{DescriptorRole, FlagDescriptor, OobDescriptor, PortDescriptor};
pub use events::EventManager;
pub use flags::FlagEncoding;
pub use layout::{BufferMetaData, BufferOffsets, BufferState, MetaFlags, OutputPortSetControl};
pub use port::{NegotiationState, Port, PortLayout};
pub use port_set::PortSet;
pub use worker::WorkerPort;
pub use zero_copy::ZeroCopyLinks;

use crate::core::config::TransportConfig;
use crate::core::errors::{DataplaneError, DataplaneResult};
use crate::core::types::{CircuitId, MailboxId, PortDirection, PortOrdinal};
use crate::endpoint::Protocol;
use crate::mailbox::{
    ContainerComms, MailboxSlot, RequestType, XferMailbox, MAILBOX_COPY_FAILED,
    MAILBOX_NO_SUCH_PORT, MAILBOX_UNKNOWN_REQUEST,
};
use crate::monitoring::{CircuitSpan, StatsSnapshot};
use crate::smb::SmbResources;
use crate::xfer::{wait_for_completion, CompletionStatus};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Transport {
    ctx: Arc<TransportContext>,
    local: Vec<Arc<SmbResources>>,
    circuits: BTreeMap<CircuitId, Circuit>,
    next_circuit_id: CircuitId,
    zero_copy: ZeroCopyLinks,
}

impl Transport {
    pub fn new(ctx: Arc<TransportContext>) -> Self {
        Self {
            ctx,
            local: Vec::new(),
            circuits: BTreeMap::new(),
            next_circuit_id: 1,
            zero_copy: ZeroCopyLinks::new(),
        }
    }

    /// Transport over the compiled-in backends
    pub fn with_defaults(config: TransportConfig) -> DataplaneResult<Self> {
        Ok(Self::new(TransportContext::with_defaults(config)?))
    }

    pub fn context(&self) -> &Arc<TransportContext> {
        &self.ctx
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.stats().snapshot()
    }

    // Endpoints

    /// Create a local SMB and return its finalized endpoint string
    pub fn add_local_endpoint(
        &mut self,
        protocol: Protocol,
        mailbox: MailboxId,
        max_mailboxes: u16,
    ) -> DataplaneResult<String> {
        let smb = self.ctx.create_local(protocol, mailbox, max_mailboxes)?;
        let key = smb.key().to_string();
        self.local.push(smb);
        Ok(key)
    }

    /// Create a local SMB for an explicit endpoint string
    pub fn add_local_endpoint_from(&mut self, endpoint: &str) -> DataplaneResult<String> {
        let smb = self.ctx.create_local_from(endpoint)?;
        let key = smb.key().to_string();
        self.local.push(smb);
        Ok(key)
    }

    pub fn local_endpoints(&self) -> Vec<String> {
        self.local.iter().map(|smb| smb.key().to_string()).collect()
    }

    pub fn is_local_endpoint(&self, endpoint: &str) -> bool {
        self.local.iter().any(|smb| smb.key() == endpoint)
    }

    // Circuits

    /// Next unused circuit id
    pub fn allocate_circuit_id(&mut self) -> CircuitId {
        while self.circuits.contains_key(&self.next_circuit_id) {
            self.next_circuit_id = self.next_circuit_id.wrapping_add(1).max(1);
        }
        let id = self.next_circuit_id;
        self.next_circuit_id = id.wrapping_add(1).max(1);
        id
    }

    /// Build this participant's side of circuit `id`
    ///
    /// Every participant must use the same id and description.
    pub fn create_circuit(
        &mut self,
        id: CircuitId,
        description: CircuitDescription,
    ) -> DataplaneResult<CircuitId> {
        let span = CircuitSpan::new("create_circuit", id);
        let _entered = span.enter();

        if self.circuits.contains_key(&id) {
            span.record_result(false);
            return Err(DataplaneError::invalid_state(format!(
                "circuit {} already exists",
                id
            )));
        }
        match Circuit::new(&self.ctx, id, description, &self.local) {
            Ok(circuit) => {
                self.circuits.insert(id, circuit);
                if id >= self.next_circuit_id {
                    self.next_circuit_id = id.wrapping_add(1).max(1);
                }
                span.record_result(true);
                Ok(id)
            }
            Err(e) => {
                span.record_result(false);
                warn!(circuit = id, "Circuit creation failed: {}", e);
                Err(e)
            }
        }
    }

    /// Create a circuit under a freshly allocated id
    pub fn open_circuit(&mut self, description: CircuitDescription) -> DataplaneResult<CircuitId> {
        let id = self.allocate_circuit_id();
        self.create_circuit(id, description)
    }

    pub fn circuit(&self, id: CircuitId) -> DataplaneResult<&Circuit> {
        self.circuits
            .get(&id)
            .ok_or(DataplaneError::CircuitNotFound { circuit: id })
    }

    fn circuit_mut(&mut self, id: CircuitId) -> DataplaneResult<&mut Circuit> {
        self.circuits
            .get_mut(&id)
            .ok_or(DataplaneError::CircuitNotFound { circuit: id })
    }

    pub fn circuit_ids(&self) -> Vec<CircuitId> {
        self.circuits.keys().copied().collect()
    }

    /// Dispatch once, then poll the circuit's offset negotiation
    pub fn ready(&mut self, id: CircuitId) -> DataplaneResult<bool> {
        self.dispatch()?;
        let ctx = self.ctx.clone();
        self.circuit_mut(id)?.ready(&ctx)
    }

    /// Free a circuit's memory and drop it
    pub fn release_circuit(&mut self, id: CircuitId) -> DataplaneResult<()> {
        let span = CircuitSpan::new("release_circuit", id);
        let _entered = span.enter();

        let mut circuit = self
            .circuits
            .remove(&id)
            .ok_or(DataplaneError::CircuitNotFound { circuit: id })?;

        // Partners are settled while this circuit's memory is still mapped
        let partners = self.zero_copy.detach_circuit(id);
        for partner in &partners {
            if let Err(e) = self.settle_partner(partner) {
                warn!(circuit = id, partner = partner.circuit, "Zero-copy partner not settled: {}", e);
            }
        }
        if !partners.is_empty() {
            debug!(circuit = id, links = partners.len(), "Zero-copy links detached");
        }

        circuit.release(&self.ctx);
        span.record_result(true);
        Ok(())
    }

    /// Free the surviving side of a zero-copy link whose other side is going away
    ///
    /// An output still queued to send out of the departing input gets the
    /// payload staged into its own buffer. An input forwarded into a departing
    /// output is consumed so its producer gets the buffer back.
    fn settle_partner(&mut self, partner: &BufferKey) -> DataplaneResult<()> {
        let ctx = self.ctx.clone();
        let Some(circuit) = self.circuits.get_mut(&partner.circuit) else {
            return Ok(());
        };
        if circuit.is_local_output(partner.port) {
            circuit.stage_forwarded(partner.port, partner.tid)?;
            return Ok(());
        }
        circuit.input_available(&ctx, partner.port, partner.tid)
    }

    pub fn zero_copy_links(&self) -> &ZeroCopyLinks {
        &self.zero_copy
    }

    // Progress

    /// Answer pending mailbox requests and advance every circuit
    ///
    /// Returns the number of requests answered.
    pub fn dispatch(&mut self) -> DataplaneResult<usize> {
        self.ctx.accept_handshakes()?;

        let mut answered = 0;
        for smb in &self.local {
            let own = smb.endpoint().mailbox();
            for mailbox in 0..smb.endpoint().max_mailboxes() {
                if mailbox == own {
                    continue;
                }
                let slot = ContainerComms::read_slot(smb.region()?, mailbox)?;
                if slot.is_empty() {
                    continue;
                }
                if self.answer(smb, mailbox, &slot)? {
                    answered += 1;
                }
            }
        }

        self.poll_circuits()?;
        Ok(answered)
    }

    /// Answer one request; `false` leaves it pending for a later dispatch
    ///
    /// A request that cannot be answered is still cleared, with an error
    /// code, so one bad slot never wedges the mailbox.
    fn answer(&self, smb: &Arc<SmbResources>, mailbox: MailboxId, slot: &MailboxSlot) -> DataplaneResult<bool> {
        let spin = self.ctx.config().mailbox_spin_limit;
        let requester = match slot.url() {
            Ok(url) => url.to_string(),
            Err(e) => {
                warn!(mailbox, "Discarding mailbox request: {}", e);
                XferMailbox::discard(smb, mailbox)?;
                return Ok(true);
            }
        };

        let reply = match self.ctx.services(smb.key(), &requester) {
            Ok(Some(reply)) => reply,
            Ok(None) => return Ok(false),
            Err(e) => {
                warn!(mailbox, requester = %requester, "Cannot reach requester: {}", e);
                return Ok(false);
            }
        };
        // The local slot is freed before the copy back, so a failed copy only
        // leaves the requester waiting
        let clear = |code: i32| {
            if let Err(e) = XferMailbox::clear_remote(smb, reply.as_ref(), mailbox, slot, code, spin) {
                warn!(mailbox, requester = %requester, code, "Mailbox clear not delivered: {}", e);
            }
        };

        let Some(request) = slot
            .request_type()
            .filter(|r| *r != RequestType::NoRequest)
        else {
            warn!(mailbox, request = slot.request_type, "Unknown mailbox request");
            clear(MAILBOX_UNKNOWN_REQUEST);
            return Ok(true);
        };

        // The circuit may not exist here yet; answer once it does
        let Some(circuit) = self.circuits.get(&slot.circuit_id) else {
            return Ok(false);
        };
        let Some(port) = circuit.responder(slot.port_id, request, smb.key()) else {
            warn!(
                circuit = slot.circuit_id,
                port = slot.port_id,
                ?request,
                "No port can answer mailbox request"
            );
            clear(MAILBOX_NO_SUCH_PORT);
            return Ok(true);
        };

        let copies = match self.respond(port, &requester, request, slot, spin) {
            Ok(Some(copies)) => copies,
            Ok(None) => return Ok(false),
            Err(e) => {
                warn!(
                    circuit = slot.circuit_id,
                    port = slot.port_id,
                    ?request,
                    "Mailbox answer failed: {}",
                    e
                );
                clear(MAILBOX_COPY_FAILED);
                return Ok(true);
            }
        };

        clear(0);
        self.ctx.stats().record_mailbox_answer();
        debug!(
            circuit = slot.circuit_id,
            port = slot.port_id,
            mailbox,
            ?request,
            copies,
            "Mailbox request answered"
        );
        Ok(true)
    }

    /// Copy the answer into the requester's offsets table
    ///
    /// Returns the number of copies, or `None` while the requester's
    /// connection is not ready.
    fn respond(
        &self,
        port: &Port,
        requester: &str,
        request: RequestType,
        slot: &MailboxSlot,
        spin: u32,
    ) -> DataplaneResult<Option<usize>> {
        let Some(services) = self.ctx.services(port.smb().key(), requester)? else {
            return Ok(None);
        };
        let copies = port.response_copies(request, slot.return_offset, slot.return_size)?;
        let mut transfer = services.create_request()?;
        for op in &copies {
            transfer.copy(op.src, op.dst, op.len, op.flags)?;
        }
        transfer.post()?;
        match wait_for_completion(transfer.as_mut(), spin)? {
            CompletionStatus::CompleteSuccess => Ok(Some(copies.len())),
            status => Err(DataplaneError::api(
                "mailbox_answer",
                format!("response copy to {} ended {:?}", requester, status),
            )),
        }
    }

    fn poll_circuits(&mut self) -> DataplaneResult<()> {
        let mut completed = Vec::new();
        for circuit in self.circuits.values_mut() {
            if circuit.state() == CircuitState::Closed || circuit.fault().is_some() {
                continue;
            }
            if let Err(e) = circuit.progress(&self.ctx) {
                warn!(circuit = circuit.id(), "Circuit progress failed: {}", e);
            }
            completed.extend(circuit.take_completed());
        }

        // A forwarded buffer is consumed once the copy out of it has landed
        for key in completed {
            let Some(input) = self.zero_copy.detach(&key) else {
                continue;
            };
            if let Some(circuit) = self.circuits.get_mut(&input.circuit) {
                circuit.input_available(&self.ctx, input.port, input.tid)?;
            }
        }
        Ok(())
    }

    // Worker operations

    pub fn next_empty_output_buffer(
        &mut self,
        circuit: CircuitId,
        port: PortOrdinal,
    ) -> DataplaneResult<Option<BufferHandle>> {
        self.dispatch()?;
        let ctx = self.ctx.clone();
        self.circuit_mut(circuit)?.next_empty_output_buffer(&ctx, port)
    }

    pub fn send_output_buffer(
        &mut self,
        handle: &BufferHandle,
        length: u64,
        opcode: u32,
        flags: MetaFlags,
    ) -> DataplaneResult<()> {
        let ctx = self.ctx.clone();
        let key = handle.key;
        self.circuit_mut(key.circuit)?
            .send_output_buffer(&ctx, key.port, key.tid, length, opcode, flags)
    }

    /// Forward a full input buffer through an empty output buffer
    ///
    /// When both buffers live in the same SMB the payload is copied straight
    /// out of the input and the input is consumed once that transfer lands.
    /// Otherwise the payload is staged into the output buffer and the input is
    /// consumed immediately.
    pub fn send_zero_copy(
        &mut self,
        input: &BufferHandle,
        output: &BufferHandle,
        opcode: u32,
    ) -> DataplaneResult<()> {
        if input.direction != PortDirection::Input || output.direction != PortDirection::Output {
            return Err(DataplaneError::invalid_state(
                "zero-copy forwarding needs an input and an output buffer",
            ));
        }
        if input.length > output.capacity {
            return Err(DataplaneError::OutOfBounds {
                offset: output.data_offset,
                len: input.length,
                region_size: output.capacity,
            });
        }
        let ctx = self.ctx.clone();

        if input.endpoint != output.endpoint {
            let payload = self.read_buffer(input)?;
            self.write_buffer(output, &payload)?;
            self.send_output_buffer(output, input.length, opcode, MetaFlags::empty())?;
            return self.input_available(input);
        }

        self.circuit_mut(input.key.circuit)?
            .take_input_buffer(input.key.port, input.key.tid)?;
        self.zero_copy.attach(output.key, input.key);
        let sent = self.circuit_mut(output.key.circuit)?.send_from(
            &ctx,
            output.key.port,
            output.key.tid,
            input.length,
            opcode,
            input.data_offset,
        );
        if let Err(e) = sent {
            self.zero_copy.detach(&output.key);
            return Err(e);
        }
        // The transfer may already have completed inside the send
        self.poll_circuits()
    }

    pub fn release_output_buffer(&mut self, handle: &BufferHandle) -> DataplaneResult<()> {
        self.zero_copy.detach(&handle.key);
        self.circuit_mut(handle.key.circuit)?
            .release_output_buffer(handle.key.port, handle.key.tid)
    }

    pub fn next_full_input_buffer(
        &mut self,
        circuit: CircuitId,
        port: PortOrdinal,
    ) -> DataplaneResult<Option<BufferHandle>> {
        self.dispatch()?;
        let ctx = self.ctx.clone();
        self.circuit_mut(circuit)?.next_full_input_buffer(&ctx, port)
    }

    /// Consume an input buffer and hand it back to its producer
    pub fn input_available(&mut self, handle: &BufferHandle) -> DataplaneResult<()> {
        self.zero_copy.detach(&handle.key);
        let ctx = self.ctx.clone();
        let key = handle.key;
        self.circuit_mut(key.circuit)?.input_available(&ctx, key.port, key.tid)
    }

    /// Keep an input buffer without consuming it
    pub fn take_input_buffer(&mut self, handle: &BufferHandle) -> DataplaneResult<()> {
        let key = handle.key;
        self.circuit_mut(key.circuit)?.take_input_buffer(key.port, key.tid)
    }

    /// Payload of a buffer (`length` bytes)
    pub fn read_buffer(&self, handle: &BufferHandle) -> DataplaneResult<Vec<u8>> {
        let smb = self.ctx.resources(&handle.endpoint)?;
        smb.region()?.read_bytes(handle.data_offset, handle.length)
    }

    /// Write a payload into an output buffer
    pub fn write_buffer(&self, handle: &BufferHandle, data: &[u8]) -> DataplaneResult<()> {
        if data.len() as u64 > handle.capacity {
            return Err(DataplaneError::OutOfBounds {
                offset: handle.data_offset,
                len: data.len() as u64,
                region_size: handle.capacity,
            });
        }
        let smb = self.ctx.resources(&handle.endpoint)?;
        smb.region()?.write_bytes(handle.data_offset, data)
    }

    pub fn buffer_metadata(&self, handle: &BufferHandle) -> DataplaneResult<BufferMetaData> {
        let key = handle.key;
        let circuit = self.circuit(key.circuit)?;
        let port = circuit
            .ports()
            .iter()
            .find(|p| p.ordinal() == key.port && p.is_real())
            .ok_or(DataplaneError::PortNotFound {
                circuit: key.circuit,
                port: key.port,
            })?;
        let contrib = if port.direction().is_output() {
            0
        } else {
            TransferController::contributor(key.tid, circuit.description().output_count())
        };
        port.metadata(key.tid, contrib)
    }

    /// Circuit and port a flag word signals, when events are enabled
    pub fn event_source(&self, flag: u64) -> Option<(CircuitId, PortOrdinal)> {
        self.ctx.events().resolve(flag)
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        for (_, mut circuit) in std::mem::take(&mut self.circuits) {
            circuit.release(&self.ctx);
        }
        for smb in self.local.drain(..) {
            self.ctx.release_local(smb.key());
        }
        info!("Transport shut down");
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("local", &self.local_endpoints())
            .field("circuits", &self.circuits.keys().collect::<Vec<_>>())
            .field("zero_copy_links", &self.zero_copy.len())
            .finish()
    }
}
