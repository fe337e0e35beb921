/*!
 * Circuits
 * Fixed producer/consumer topology and the buffer transfers flowing through it
 *
 * Every participant builds the same circuit from the same description and
 * keeps only its own part: real ports for the endpoints it hosts, shadow
 * inputs for remote consumers it produces into, shadow outputs for remote
 * producers it consumes from.
 */

use super::buffer::{BufferHandle, BufferKey, BufferPhase, InputRing, OutputPhase, OutputRing};
use super::context::TransportContext;
use super::controller::{TransferController, TransferTarget};
use super::description::CircuitDescription;
use super::descriptor::PortDescriptor;
use super::flags::FlagEncoding;
use super::layout::{BufferMetaData, BufferState, MetaFlags, OutputPortSetControl};
use super::port::{Port, PortSpec, ProducerLink, RELEASE_ACK};
use super::port_set::PortSet;
use crate::core::errors::{DataplaneError, DataplaneResult};
use crate::core::types::{
    BufferTid, CircuitId, MailboxId, Offset, PortDirection, PortKind, PortOrdinal,
};
use crate::endpoint::Endpoint;
use crate::mailbox::RequestType;
use crate::smb::{Region, SmbResources};
use crate::xfer::{CompletionStatus, XferFlags, XferRequest};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

/// Circuit lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Active,
    /// End-of-circuit consumed or a transfer failed; no new sends
    Disconnecting,
    /// Ports released and memory returned
    Closed,
}

#[derive(Debug, Clone, Copy)]
struct PendingTransfer {
    port: PortOrdinal,
    tid: BufferTid,
    length: u64,
    flags: MetaFlags,
    /// Payload taken from another buffer of the same SMB instead of the output's own
    data_source: Option<Offset>,
}

impl PendingTransfer {
    fn broadcast(&self) -> bool {
        self.flags
            .intersects(MetaFlags::BROADCAST | MetaFlags::END_OF_STREAM)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InflightKind {
    Produce(BufferKey),
    Consume(BufferKey),
    ReleaseAck(PortOrdinal),
}

struct Inflight {
    kind: InflightKind,
    requests: Vec<Box<dyn XferRequest>>,
}

/// Where a message lands in one input buffer, as seen by the producer
struct TargetView {
    endpoint: String,
    data: Offset,
    state: Offset,
    meta: Offset,
    /// Producer-side shadow word to mark busy before posting
    shadow_state: Option<Offset>,
    flags: FlagEncoding,
}

/// Releases every port unless the batch is committed
struct PortBatch {
    ports: Vec<Port>,
    committed: bool,
}

impl PortBatch {
    fn new() -> Self {
        Self {
            ports: Vec::new(),
            committed: false,
        }
    }

    fn commit(mut self) -> Vec<Port> {
        self.committed = true;
        std::mem::take(&mut self.ports)
    }
}

impl Drop for PortBatch {
    fn drop(&mut self) {
        if !self.committed {
            for port in &mut self.ports {
                port.release();
            }
        }
    }
}

pub struct Circuit {
    id: CircuitId,
    description: CircuitDescription,
    state: CircuitState,
    sets: Vec<PortSet>,
    ports: Vec<Port>,
    outputs: HashMap<PortOrdinal, OutputRing>,
    inputs: HashMap<PortOrdinal, InputRing>,
    queue: VecDeque<PendingTransfer>,
    inflight: Vec<Inflight>,
    completed: Vec<BufferKey>,
    sequence: u64,
    fault: Option<String>,
    ready: bool,
}

impl Circuit {
    /// Build this participant's part of a circuit
    ///
    /// `local` lists the SMBs this participant owns; every endpoint of the
    /// description that matches one of them becomes a real port.
    pub fn new(
        ctx: &TransportContext,
        id: CircuitId,
        description: CircuitDescription,
        local: &[Arc<SmbResources>],
    ) -> DataplaneResult<Self> {
        description.validate()?;
        let local_of = |endpoint: &str| local.iter().find(|smb| smb.key() == endpoint).cloned();

        let count = description.buffer_count;
        let size = description.buffer_size;
        let output_ranks = description.output_count();
        let input_ordinals = description.input_ordinals();
        let events = ctx.events();

        let producers = description
            .output
            .endpoints
            .iter()
            .map(|endpoint| {
                Ok(ProducerLink {
                    endpoint: endpoint.clone(),
                    mailbox: Endpoint::parse_finalized(endpoint)?.mailbox(),
                    local: local_of(endpoint).is_some(),
                })
            })
            .collect::<DataplaneResult<Vec<_>>>()?;

        let spec = |ordinal: PortOrdinal,
                    direction: PortDirection,
                    kind: PortKind,
                    rank: usize,
                    endpoint: &str| PortSpec {
            circuit: id,
            ordinal,
            direction,
            kind,
            rank,
            endpoint: endpoint.to_string(),
            buffer_count: count,
            buffer_size: size,
            flags: FlagEncoding::new(events.range_for(id, ordinal)),
            producers: Vec::new(),
        };

        let mut batch = PortBatch::new();

        // Real ports
        for (rank, endpoint) in description.output.endpoints.iter().enumerate() {
            if let Some(smb) = local_of(endpoint) {
                let ordinal = rank as PortOrdinal;
                let mut port_spec = spec(ordinal, PortDirection::Output, PortKind::Real, rank, endpoint);
                port_spec.flags = events.register(id, ordinal);
                batch.ports.push(Port::allocate(port_spec, smb)?);
            }
        }
        for (set, ordinals) in description.inputs.iter().zip(&input_ordinals) {
            for (rank, (endpoint, &ordinal)) in set.endpoints.iter().zip(ordinals).enumerate() {
                if let Some(smb) = local_of(endpoint) {
                    let mut port_spec = spec(ordinal, PortDirection::Input, PortKind::Real, rank, endpoint);
                    port_spec.flags = events.register(id, ordinal);
                    port_spec.producers = producers.clone();
                    batch.ports.push(Port::allocate(port_spec, smb)?);
                }
            }
        }

        // One shadow per remote input in every local SMB hosting output ranks
        let mut output_smbs: Vec<Arc<SmbResources>> = Vec::new();
        for endpoint in &description.output.endpoints {
            if let Some(smb) = local_of(endpoint) {
                if !output_smbs.iter().any(|s| s.key() == smb.key()) {
                    output_smbs.push(smb);
                }
            }
        }
        for (set, ordinals) in description.inputs.iter().zip(&input_ordinals) {
            for (rank, (endpoint, &ordinal)) in set.endpoints.iter().zip(ordinals).enumerate() {
                if local_of(endpoint).is_some() {
                    continue;
                }
                for smb in &output_smbs {
                    let port_spec = spec(ordinal, PortDirection::Input, PortKind::Shadow, rank, endpoint);
                    batch.ports.push(Port::allocate(port_spec, smb.clone())?);
                }
            }
        }

        // Consumers keep a shadow of each remote output for the release handshake
        let input_smb = description
            .inputs
            .iter()
            .flat_map(|set| set.endpoints.iter())
            .find_map(|endpoint| local_of(endpoint));
        if let Some(smb) = input_smb {
            for (rank, producer) in producers.iter().enumerate() {
                if producer.local {
                    continue;
                }
                let port_spec = spec(
                    rank as PortOrdinal,
                    PortDirection::Output,
                    PortKind::Shadow,
                    rank,
                    &producer.endpoint,
                );
                batch.ports.push(Port::allocate(port_spec, smb.clone())?);
            }
        }

        if batch.ports.is_empty() {
            return Err(DataplaneError::invalid_state(format!(
                "no endpoint of circuit {} is hosted by this participant",
                id
            )));
        }
        let ports = batch.commit();

        let mut sets = vec![PortSet::producer((0..output_ranks as PortOrdinal).collect())];
        for (index, (set, ordinals)) in description.inputs.iter().zip(input_ordinals).enumerate() {
            sets.push(PortSet::consumer(
                index + 1,
                TransferController::new(set.distribution, ordinals, count, output_ranks),
            ));
        }

        let mut outputs = HashMap::new();
        let mut inputs = HashMap::new();
        for port in ports.iter().filter(|p| p.is_real()) {
            if port.direction().is_output() {
                outputs.insert(port.ordinal(), OutputRing::new(count));
            } else {
                inputs.insert(port.ordinal(), InputRing::new(count));
            }
        }

        info!(
            circuit = id,
            buffers = count,
            buffer_size = size,
            real = outputs.len() + inputs.len(),
            shadow = ports.len() - outputs.len() - inputs.len(),
            "Circuit created"
        );
        ctx.stats().record_circuit_created();

        Ok(Self {
            id,
            description,
            state: CircuitState::Active,
            sets,
            ports,
            outputs,
            inputs,
            queue: VecDeque::new(),
            inflight: Vec::new(),
            completed: Vec::new(),
            sequence: 0,
            fault: None,
            ready: false,
        })
    }

    #[inline]
    pub fn id(&self) -> CircuitId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn description(&self) -> &CircuitDescription {
        &self.description
    }

    pub fn port_sets(&self) -> &[PortSet] {
        &self.sets
    }

    pub fn ports(&self) -> &[Port] {
        &self.ports
    }

    /// The real port with this ordinal, or else its first shadow
    pub fn port(&self, ordinal: PortOrdinal) -> Option<&Port> {
        self.ports
            .iter()
            .find(|p| p.ordinal() == ordinal && p.is_real())
            .or_else(|| self.shadow(ordinal))
    }

    pub fn shadow(&self, ordinal: PortOrdinal) -> Option<&Port> {
        self.ports
            .iter()
            .find(|p| p.ordinal() == ordinal && !p.is_real())
    }

    /// Reason the circuit was quiesced, if it was
    pub fn fault(&self) -> Option<&str> {
        self.fault.as_deref()
    }

    /// Transfer requests posted and not yet complete
    pub fn outstanding(&self) -> usize {
        self.inflight.len()
    }

    /// Filled output buffers waiting for admission
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Output buffers whose transfer completed since the last call
    pub(crate) fn take_completed(&mut self) -> Vec<BufferKey> {
        std::mem::take(&mut self.completed)
    }

    fn check_usable(&self) -> DataplaneResult<()> {
        if self.state == CircuitState::Closed {
            return Err(DataplaneError::invalid_state(format!(
                "circuit {} is closed",
                self.id
            )));
        }
        if let Some(detail) = &self.fault {
            return Err(DataplaneError::TransferFailed {
                circuit: self.id,
                detail: detail.clone(),
            });
        }
        Ok(())
    }

    fn check_active(&self) -> DataplaneResult<()> {
        self.check_usable()?;
        if self.state != CircuitState::Active {
            return Err(DataplaneError::invalid_state(format!(
                "circuit {} is disconnecting",
                self.id
            )));
        }
        Ok(())
    }

    /// Poll every local port's offset negotiation
    pub fn ready(&mut self, ctx: &TransportContext) -> DataplaneResult<bool> {
        self.check_usable()?;
        if self.ready {
            return Ok(true);
        }
        let mut all = true;
        for port in self.ports.iter_mut() {
            if !port.ready(ctx)? {
                all = false;
            }
        }
        if all {
            debug!(circuit = self.id, "Circuit ready");
        }
        self.ready = all;
        Ok(all)
    }

    /// Port able to answer a mailbox request that arrived in `smb`
    pub(crate) fn responder(
        &self,
        ordinal: PortOrdinal,
        request: RequestType,
        smb: &str,
    ) -> Option<&Port> {
        let matching = |p: &&Port| p.ordinal() == ordinal;
        match request {
            RequestType::ReqShadowRstateOffset => {
                let shadows = || {
                    self.ports
                        .iter()
                        .filter(matching)
                        .filter(|p| !p.is_real() && !p.direction().is_output())
                };
                shadows()
                    .find(|p| p.smb().key() == smb)
                    .or_else(|| shadows().next())
            }
            RequestType::ReqInputOffsets => find_real(&self.ports, ordinal, PortDirection::Input).ok(),
            RequestType::ReqOutputControlOffset => {
                find_real(&self.ports, ordinal, PortDirection::Output).ok()
            }
            RequestType::NoRequest => None,
        }
    }

    // Producer side

    /// Next empty buffer of a local output port, or `None` when all are busy
    pub fn next_empty_output_buffer(
        &mut self,
        ctx: &TransportContext,
        ordinal: PortOrdinal,
    ) -> DataplaneResult<Option<BufferHandle>> {
        self.check_active()?;
        if !self.ready(ctx)? {
            return Ok(None);
        }
        self.progress(ctx)?;

        let port = find_real(&self.ports, ordinal, PortDirection::Output)?;
        let ring = ring_of(&mut self.outputs, self.id, ordinal)?;
        let Some(tid) = ring.acquire() else {
            return Ok(None);
        };

        self.sequence += 1;
        let meta = BufferMetaData {
            sequence: self.sequence,
            source_rank: port.rank() as u32,
            timestamp: now_nanos(),
            ..Default::default()
        };
        port.smb().region()?.write(port.meta_offset(tid, 0), &meta)?;

        Ok(Some(handle(self.id, port, tid, port.buffer_size(), 0)))
    }

    /// Hand a filled output buffer to the transfer engine
    ///
    /// Starts immediately when the targets are empty and the outstanding
    /// window has room; otherwise the buffer waits in FIFO order.
    pub fn send_output_buffer(
        &mut self,
        ctx: &TransportContext,
        ordinal: PortOrdinal,
        tid: BufferTid,
        length: u64,
        opcode: u32,
        flags: MetaFlags,
    ) -> DataplaneResult<()> {
        self.queue_send(ctx, ordinal, tid, length, opcode, flags, None)
    }

    /// Send with the payload read from `data_source` in the output's own SMB
    pub(crate) fn send_from(
        &mut self,
        ctx: &TransportContext,
        ordinal: PortOrdinal,
        tid: BufferTid,
        length: u64,
        opcode: u32,
        data_source: Offset,
    ) -> DataplaneResult<()> {
        self.queue_send(ctx, ordinal, tid, length, opcode, MetaFlags::empty(), Some(data_source))
    }

    #[allow(clippy::too_many_arguments)]
    fn queue_send(
        &mut self,
        ctx: &TransportContext,
        ordinal: PortOrdinal,
        tid: BufferTid,
        length: u64,
        opcode: u32,
        flags: MetaFlags,
        data_source: Option<Offset>,
    ) -> DataplaneResult<()> {
        self.check_active()?;
        let port = find_real(&self.ports, ordinal, PortDirection::Output)?;
        if length > port.buffer_size() {
            return Err(DataplaneError::OutOfBounds {
                offset: port.data_offset(tid),
                len: length,
                region_size: port.buffer_size(),
            });
        }
        let ring = ring_of(&mut self.outputs, self.id, ordinal)?;
        if ring.phase(tid) != Some(OutputPhase::Held) {
            return Err(DataplaneError::invalid_state(format!(
                "output buffer {} of port {} is not held by the worker",
                tid, ordinal
            )));
        }

        let flags = if flags.contains(MetaFlags::END_OF_STREAM) {
            flags | MetaFlags::BROADCAST
        } else {
            flags
        };
        let region = port.smb().region()?;
        region.update::<BufferMetaData, _>(port.meta_offset(tid, 0), |meta| {
            meta.length = length as u32;
            meta.opcode = opcode;
            meta.flags = flags.bits();
        })?;

        ring.set(tid, OutputPhase::Queued);
        self.queue.push_back(PendingTransfer {
            port: ordinal,
            tid,
            length,
            flags,
            data_source,
        });
        self.progress(ctx)?;

        if self.queue.iter().any(|p| p.port == ordinal && p.tid == tid) {
            ctx.stats().record_transfer_queued();
            debug!(circuit = self.id, port = ordinal, tid, "Transfer queued");
        }
        Ok(())
    }

    /// Return an unsent output buffer to the empty pool
    pub fn release_output_buffer(&mut self, ordinal: PortOrdinal, tid: BufferTid) -> DataplaneResult<()> {
        self.check_usable()?;
        let ring = ring_of(&mut self.outputs, self.id, ordinal)?;
        if ring.phase(tid) == Some(OutputPhase::Held) {
            ring.set(tid, OutputPhase::Empty);
        }
        Ok(())
    }

    /// Move a queued forward's payload into the output's own buffer
    ///
    /// Called before the forwarded input's memory goes away. Returns `false`
    /// when no queued send of this buffer reads from another buffer.
    pub(crate) fn stage_forwarded(&mut self, ordinal: PortOrdinal, tid: BufferTid) -> DataplaneResult<bool> {
        let Some(pending) = self
            .queue
            .iter_mut()
            .find(|p| p.port == ordinal && p.tid == tid)
        else {
            return Ok(false);
        };
        let Some(source) = pending.data_source else {
            return Ok(false);
        };
        let port = find_real(&self.ports, ordinal, PortDirection::Output)?;
        let region = port.smb().region()?;
        Region::copy_between(region, source, region, port.data_offset(tid), pending.length)?;
        pending.data_source = None;
        debug!(circuit = self.id, port = ordinal, tid, "Forwarded payload staged");
        Ok(true)
    }

    /// Whether `ordinal` is an output port hosted here
    pub(crate) fn is_local_output(&self, ordinal: PortOrdinal) -> bool {
        self.outputs.contains_key(&ordinal)
    }

    /// Poll outstanding transfers and start queued ones that fit
    pub fn progress(&mut self, ctx: &TransportContext) -> DataplaneResult<()> {
        if self.state == CircuitState::Closed {
            return Ok(());
        }
        self.check_usable()?;
        self.poll_inflight(ctx)?;

        while let Some(&front) = self.queue.front() {
            if !self.can_transfer_buffer(ctx, &front)? {
                break;
            }
            self.queue.pop_front();
            self.start_buffer_transfer(ctx, front)?;
        }
        Ok(())
    }

    fn can_transfer_buffer(&self, ctx: &TransportContext, pending: &PendingTransfer) -> DataplaneResult<bool> {
        if self.inflight.len() >= ctx.config().max_outstanding_transfers {
            return Ok(false);
        }
        let out = find_real(&self.ports, pending.port, PortDirection::Output)?;
        for target in self.targets(out.rank(), pending.broadcast()) {
            if !self.target_empty(out, &target)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn targets(&self, rank: usize, broadcast: bool) -> Vec<TransferTarget> {
        self.sets
            .iter()
            .filter_map(PortSet::controller)
            .flat_map(|controller| controller.targets(rank, broadcast))
            .collect()
    }

    fn target_empty(&self, out: &Port, target: &TransferTarget) -> DataplaneResult<bool> {
        if let Ok(input) = find_real(&self.ports, target.port, PortDirection::Input) {
            let word = input.state_word(target.tid, out.rank())?;
            return Ok(!FlagEncoding::is_full(word));
        }
        let shadow = self.shadow_input(target.port, out.smb().key())?;
        Ok(FlagEncoding::is_shadow_empty(shadow.state_word(target.tid, 0)?))
    }

    fn shadow_input(&self, ordinal: PortOrdinal, smb: &str) -> DataplaneResult<&Port> {
        self.ports
            .iter()
            .find(|p| {
                p.ordinal() == ordinal
                    && !p.is_real()
                    && !p.direction().is_output()
                    && p.smb().key() == smb
            })
            .ok_or(DataplaneError::PortNotFound {
                circuit: self.id,
                port: ordinal,
            })
    }

    fn target_view(&self, out: &Port, target: &TransferTarget) -> DataplaneResult<TargetView> {
        let rank = out.rank();
        if let Ok(input) = find_real(&self.ports, target.port, PortDirection::Input) {
            return Ok(TargetView {
                endpoint: input.smb().key().to_string(),
                data: input.data_offset(target.tid),
                state: input.state_offset(target.tid, rank),
                meta: input.meta_offset(target.tid, rank),
                shadow_state: None,
                flags: input.flags(),
            });
        }

        let shadow = self.shadow_input(target.port, out.smb().key())?;
        let entry = shadow.offsets(target.tid)?;
        if !entry.has_input_offsets() {
            return Err(DataplaneError::invalid_state(format!(
                "offsets of input {} buffer {} are not known yet",
                target.port, target.tid
            )));
        }
        Ok(TargetView {
            endpoint: shadow.endpoint().to_string(),
            data: entry.buffer_offset,
            state: entry.local_state_offset + rank as u64 * BufferState::SIZE,
            meta: entry.meta_data_offset + rank as u64 * BufferMetaData::SIZE,
            shadow_state: Some(shadow.state_offset(target.tid, 0)),
            flags: shadow.flags(),
        })
    }

    fn start_buffer_transfer(&mut self, ctx: &TransportContext, pending: PendingTransfer) -> DataplaneResult<()> {
        let broadcast = pending.broadcast();
        let posted = self.post_transfer(ctx, &pending, broadcast);
        let (rank, requests) = match posted {
            Ok(posted) => posted,
            Err(e) => return Err(self.fail(ctx, e.to_string())),
        };

        for controller in self.sets.iter_mut().filter_map(PortSet::controller_mut) {
            controller.advance(rank, broadcast);
        }
        if let Some(ring) = self.outputs.get_mut(&pending.port) {
            ring.set(pending.tid, OutputPhase::InFlight);
        }
        self.inflight.push(Inflight {
            kind: InflightKind::Produce(BufferKey::new(self.id, pending.port, pending.tid)),
            requests,
        });
        Ok(())
    }

    fn post_transfer(
        &self,
        ctx: &TransportContext,
        pending: &PendingTransfer,
        broadcast: bool,
    ) -> DataplaneResult<(usize, Vec<Box<dyn XferRequest>>)> {
        let out = find_real(&self.ports, pending.port, PortDirection::Output)?;
        let region = out.smb().region()?;
        let output_count = self.description.output_count() as PortOrdinal;
        let source = pending
            .data_source
            .unwrap_or_else(|| out.data_offset(pending.tid));

        let mut requests = Vec::new();
        for target in self.targets(out.rank(), broadcast) {
            let view = self.target_view(out, &target)?;
            let staging = out.staging_offset(pending.tid, (target.port - output_count) as usize);
            region.write(staging, &BufferState::with_flag(view.flags.full()))?;
            if let Some(shadow_state) = view.shadow_state {
                // Busy before the consumer can possibly answer with an empty flag
                region.write(shadow_state, &BufferState::with_flag(0))?;
            }

            let services = ctx.services(out.smb().key(), &view.endpoint)?.ok_or_else(|| {
                DataplaneError::invalid_state(format!("connection to {} is not ready", view.endpoint))
            })?;
            let mut request = services.create_request()?;
            if pending.length > 0 {
                request.copy(source, view.data, pending.length, XferFlags::DATA_TRANSFER)?;
            }
            request.copy(
                out.meta_offset(pending.tid, 0),
                view.meta,
                BufferMetaData::SIZE,
                XferFlags::empty(),
            )?;
            request.copy(
                staging,
                view.state,
                BufferState::SIZE,
                XferFlags::FLAG_TRANSFER | XferFlags::LAST_TRANSFER,
            )?;
            request.post()?;
            ctx.stats().record_transfer_posted(pending.length);
            requests.push(request);
        }
        Ok((out.rank(), requests))
    }

    fn poll_inflight(&mut self, ctx: &TransportContext) -> DataplaneResult<()> {
        let mut index = 0;
        while index < self.inflight.len() {
            let mut failure = None;
            {
                let requests = &mut self.inflight[index].requests;
                let mut i = 0;
                while i < requests.len() {
                    match requests[i].status() {
                        Ok(CompletionStatus::CompleteSuccess) => {
                            requests.swap_remove(i);
                        }
                        Ok(CompletionStatus::Pending) => i += 1,
                        Ok(CompletionStatus::CompleteFailure) => {
                            failure = Some("transfer request completed with failure".to_string());
                            break;
                        }
                        Err(e) => {
                            failure = Some(e.to_string());
                            break;
                        }
                    }
                }
            }
            if let Some(detail) = failure {
                return Err(self.fail(ctx, detail));
            }
            if !self.inflight[index].requests.is_empty() {
                index += 1;
                continue;
            }

            let finished = self.inflight.remove(index);
            ctx.stats().record_transfer_completed();
            if let InflightKind::Produce(key) = finished.kind {
                if let Some(ring) = self.outputs.get_mut(&key.port) {
                    ring.set(key.tid, OutputPhase::Empty);
                }
                self.completed.push(key);
            }
        }
        Ok(())
    }

    /// Record a transfer failure and stop the circuit
    fn fail(&mut self, ctx: &TransportContext, detail: String) -> DataplaneError {
        ctx.stats().record_transfer_failed();
        error!(circuit = self.id, detail = %detail, "Transfer failed, quiescing circuit");
        if self.state == CircuitState::Active {
            self.state = CircuitState::Disconnecting;
        }
        self.queue.clear();
        self.inflight.clear();
        self.fault = Some(detail.clone());
        DataplaneError::TransferFailed {
            circuit: self.id,
            detail,
        }
    }

    // Consumer side

    /// Next full buffer of a local input port, or `None` when none has arrived
    pub fn next_full_input_buffer(
        &mut self,
        ctx: &TransportContext,
        ordinal: PortOrdinal,
    ) -> DataplaneResult<Option<BufferHandle>> {
        self.check_usable()?;
        if !self.ready(ctx)? {
            return Ok(None);
        }
        self.progress(ctx)?;

        let output_ranks = self.description.output_count();
        let port = find_real(&self.ports, ordinal, PortDirection::Input)?;
        let ring = ring_of(&mut self.inputs, self.id, ordinal)?;

        let mut found = None;
        for tid in ring.scan_order() {
            if !ring.is_free(tid) {
                continue;
            }
            let contrib = TransferController::contributor(tid, output_ranks);
            if FlagEncoding::is_full(port.state_word(tid, contrib)?) {
                found = Some((tid, contrib));
                break;
            }
        }
        let Some((tid, contrib)) = found else {
            return Ok(None);
        };
        ring.hold(tid);

        let meta = port.metadata(tid, contrib)?;
        Ok(Some(handle(self.id, port, tid, meta.length as u64, meta.opcode)))
    }

    /// Keep a full input buffer out of the ring without consuming it
    pub fn take_input_buffer(&mut self, ordinal: PortOrdinal, tid: BufferTid) -> DataplaneResult<()> {
        self.check_usable()?;
        ring_of(&mut self.inputs, self.id, ordinal)?.take(tid);
        Ok(())
    }

    /// Mark an input buffer consumed and tell its producer it is empty
    pub fn input_available(
        &mut self,
        ctx: &TransportContext,
        ordinal: PortOrdinal,
        tid: BufferTid,
    ) -> DataplaneResult<()> {
        if self.state == CircuitState::Closed {
            return Err(DataplaneError::invalid_state(format!(
                "circuit {} is closed",
                self.id
            )));
        }
        let output_ranks = self.description.output_count();
        let contrib = TransferController::contributor(tid, output_ranks);

        let (end_of_circuit, posted) = {
            let port = find_real(&self.ports, ordinal, PortDirection::Input)?;
            if !FlagEncoding::is_full(port.state_word(tid, contrib)?) {
                return Err(DataplaneError::invalid_state(format!(
                    "input buffer {} of port {} is not full",
                    tid, ordinal
                )));
            }
            let meta = port.metadata(tid, contrib)?;
            port.smb()
                .region()?
                .write(port.state_offset(tid, contrib), &BufferState::default())?;
            (
                meta.meta_flags().contains(MetaFlags::END_OF_CIRCUIT),
                post_empty_flag(ctx, port, tid, contrib),
            )
        };

        if let Some(ring) = self.inputs.get_mut(&ordinal) {
            ring.clear(tid);
        }
        ctx.stats().record_buffer_consumed();

        match posted {
            Ok(Some(request)) => self.inflight.push(Inflight {
                kind: InflightKind::Consume(BufferKey::new(self.id, ordinal, tid)),
                requests: vec![request],
            }),
            Ok(None) => {}
            Err(e) => return Err(self.fail(ctx, e.to_string())),
        }

        if end_of_circuit {
            self.begin_disconnect(ctx);
        }
        Ok(())
    }

    fn begin_disconnect(&mut self, ctx: &TransportContext) {
        if self.state != CircuitState::Active {
            return;
        }
        self.state = CircuitState::Disconnecting;
        info!(circuit = self.id, "End of circuit consumed, disconnecting");

        let Some(consumer) = self
            .ports
            .iter()
            .find(|p| p.is_real() && !p.direction().is_output())
        else {
            return;
        };
        let mailbox = consumer.smb().endpoint().mailbox();

        let mut acks = Vec::new();
        for rank in 0..self.description.output_count() as PortOrdinal {
            match release_ack(ctx, &self.ports, rank, mailbox) {
                Ok(Some(request)) => acks.push((rank, request)),
                Ok(None) => {}
                Err(e) => warn!(circuit = self.id, rank, "Release acknowledgement failed: {}", e),
            }
        }
        for (rank, request) in acks {
            self.inflight.push(Inflight {
                kind: InflightKind::ReleaseAck(rank),
                requests: vec![request],
            });
        }
    }

    /// Mailboxes of consumers that acknowledged end-of-circuit to local producers
    pub fn released_by(&self) -> DataplaneResult<Vec<MailboxId>> {
        let mut released = Vec::new();
        for port in self
            .ports
            .iter()
            .filter(|p| p.is_real() && p.direction().is_output())
        {
            let control = port.control()?;
            for (mailbox, &word) in control.released.iter().enumerate() {
                let mailbox = mailbox as MailboxId;
                if word != 0 && !released.contains(&mailbox) {
                    released.push(mailbox);
                }
            }
        }
        released.sort_unstable();
        Ok(released)
    }

    /// Flow-control phase of one local buffer
    pub fn buffer_phase(&self, ordinal: PortOrdinal, tid: BufferTid) -> DataplaneResult<BufferPhase> {
        if let Some(ring) = self.outputs.get(&ordinal) {
            return ring.phase(tid).map(OutputPhase::phase).ok_or_else(|| {
                DataplaneError::invalid_state(format!("port {} has no buffer {}", ordinal, tid))
            });
        }
        let port = find_real(&self.ports, ordinal, PortDirection::Input)?;
        let contrib = TransferController::contributor(tid, self.description.output_count());
        Ok(if FlagEncoding::is_full(port.state_word(tid, contrib)?) {
            BufferPhase::Full
        } else {
            BufferPhase::Empty
        })
    }

    /// Buffers of a local port currently in `phase`
    pub fn count_in_phase(&self, ordinal: PortOrdinal, phase: BufferPhase) -> DataplaneResult<usize> {
        let mut count = 0;
        for tid in 0..self.description.buffer_count {
            if self.buffer_phase(ordinal, tid)? == phase {
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn descriptors(&self) -> Vec<PortDescriptor> {
        self.ports
            .iter()
            .filter_map(|port| PortDescriptor::from_port(self.id, port))
            .collect()
    }

    /// Free every port's memory and close the circuit
    pub fn release(&mut self, ctx: &TransportContext) {
        if self.state == CircuitState::Closed {
            return;
        }
        self.queue.clear();
        self.inflight.clear();
        for port in self.ports.iter_mut() {
            port.release();
        }
        ctx.events().release_circuit(self.id);
        self.state = CircuitState::Closed;
        self.ready = false;
        ctx.stats().record_circuit_closed();
        info!(circuit = self.id, "Circuit closed");
    }
}

impl std::fmt::Debug for Circuit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Circuit")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("ports", &self.ports)
            .field("queued", &self.queue.len())
            .field("outstanding", &self.inflight.len())
            .field("fault", &self.fault)
            .finish()
    }
}

fn find_real(ports: &[Port], ordinal: PortOrdinal, direction: PortDirection) -> DataplaneResult<&Port> {
    ports
        .iter()
        .find(|p| p.ordinal() == ordinal && p.is_real() && p.direction() == direction)
        .ok_or_else(|| DataplaneError::PortNotFound {
            circuit: ports.first().map(Port::circuit).unwrap_or_default(),
            port: ordinal,
        })
}

fn ring_of<R>(rings: &mut HashMap<PortOrdinal, R>, circuit: CircuitId, ordinal: PortOrdinal) -> DataplaneResult<&mut R> {
    rings
        .get_mut(&ordinal)
        .ok_or(DataplaneError::PortNotFound {
            circuit,
            port: ordinal,
        })
}

fn handle(circuit: CircuitId, port: &Port, tid: BufferTid, length: u64, opcode: u32) -> BufferHandle {
    BufferHandle {
        key: BufferKey::new(circuit, port.ordinal(), tid),
        direction: port.direction(),
        endpoint: port.smb().key().to_string(),
        data_offset: port.data_offset(tid),
        capacity: port.buffer_size(),
        length,
        opcode,
    }
}

/// Copy the shadow-empty word to the producer that filled `tid`
fn post_empty_flag(
    ctx: &TransportContext,
    port: &Port,
    tid: BufferTid,
    contrib: usize,
) -> DataplaneResult<Option<Box<dyn XferRequest>>> {
    let Some(producer) = port.producers().get(contrib) else {
        return Ok(None);
    };
    if producer.local {
        // The producer reads our state word directly
        return Ok(None);
    }
    let target = port.offsets(tid)?.shadow_offset(producer.mailbox);
    if target == 0 {
        return Err(DataplaneError::invalid_state(format!(
            "no shadow state offset from mailbox {} for buffer {}",
            producer.mailbox, tid
        )));
    }
    let services = ctx.services(port.smb().key(), &producer.endpoint)?.ok_or_else(|| {
        DataplaneError::invalid_state(format!("connection to {} is not ready", producer.endpoint))
    })?;
    let mut request = services.create_request()?;
    request.copy(
        port.layout().flag_source,
        target,
        BufferState::SIZE,
        XferFlags::FLAG_TRANSFER | XferFlags::LAST_TRANSFER,
    )?;
    request.post()?;
    Ok(Some(request))
}

/// Write our release word into the control block of output `rank`
fn release_ack(
    ctx: &TransportContext,
    ports: &[Port],
    rank: PortOrdinal,
    mailbox: MailboxId,
) -> DataplaneResult<Option<Box<dyn XferRequest>>> {
    let field = OutputPortSetControl::released_offset(mailbox);
    if let Ok(output) = find_real(ports, rank, PortDirection::Output) {
        output
            .smb()
            .region()?
            .write_u64(output.layout().control + field, RELEASE_ACK)?;
        return Ok(None);
    }
    let Some(shadow) = ports
        .iter()
        .find(|p| p.ordinal() == rank && !p.is_real() && p.direction().is_output())
    else {
        return Ok(None);
    };
    let control = shadow.offsets(0)?.port_set_control_offset;
    if control == 0 {
        return Ok(None);
    }
    let Some(services) = ctx.services(shadow.smb().key(), shadow.endpoint())? else {
        return Ok(None);
    };
    let mut request = services.create_request()?;
    request.copy(
        shadow.release_ack_offset(),
        control + field,
        8,
        XferFlags::FLAG_TRANSFER | XferFlags::LAST_TRANSFER,
    )?;
    request.post()?;
    Ok(Some(request))
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
