/*!
 * Ports
 * One participant's view of a circuit port: real ports own buffer memory,
 * shadow ports mirror a remote port's flow-control offsets
 *
 * Memory carved per port (all in the hosting SMB):
 * - real output: data, state (empty words + full-flag staging words),
 *   metadata, port-set control block, offsets table
 * - real input: data, state (one word per contributing rank), metadata,
 *   offsets table, flag source (shadow-empty word + release ack)
 * - shadow input: one state word per buffer, offsets table
 * - shadow output: offsets table, flag source
 */

use super::context::TransportContext;
use super::flags::FlagEncoding;
use super::layout::{BufferMetaData, BufferOffsets, BufferState, OutputPortSetControl};
use crate::core::errors::{DataplaneError, DataplaneResult};
use crate::core::limits::{BUFFER_ALIGNMENT, MAX_PCONTRIBS, SMB_ALIGNMENT};
use crate::core::types::{
    align_up, BufferTid, CircuitId, MailboxId, Offset, PortDirection, PortKind, PortOrdinal,
};
use crate::mailbox::{
    MailboxSlot, RequestType, XferMailbox, MAILBOX_NO_SUCH_PORT, MAILBOX_UNKNOWN_REQUEST,
};
use crate::smb::{AllocationBatch, ResourceAllocator, SmbResources};
use crate::xfer::{CopyOp, XferFlags};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error};

/// Shadow-empty word followed by the release acknowledgement word
pub(crate) const FLAG_SOURCE_LEN: u64 = 32;

/// Value a consumer writes into the producer's control block on release
pub(crate) const RELEASE_ACK: u64 = 1;

/// Offset negotiation progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    Uninitialized,
    AwaitingOffsets,
    Ready,
}

/// Offsets of everything a port carved out of its SMB
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortLayout {
    pub data: Offset,
    pub data_pitch: u64,
    pub state: Offset,
    pub state_pitch: u64,
    pub meta: Offset,
    pub meta_pitch: u64,
    pub control: Offset,
    pub offsets: Offset,
    pub flag_source: Offset,
}

/// Output rank feeding a real input port, in rank order
#[derive(Debug, Clone)]
pub(crate) struct ProducerLink {
    pub(crate) endpoint: String,
    pub(crate) mailbox: MailboxId,
    /// Hosted by this participant; no shadow or mailbox traffic needed
    pub(crate) local: bool,
}

pub(crate) struct PortSpec {
    pub(crate) circuit: CircuitId,
    pub(crate) ordinal: PortOrdinal,
    pub(crate) direction: PortDirection,
    pub(crate) kind: PortKind,
    pub(crate) rank: usize,
    /// Endpoint of the real port
    pub(crate) endpoint: String,
    pub(crate) buffer_count: usize,
    pub(crate) buffer_size: u64,
    pub(crate) flags: FlagEncoding,
    pub(crate) producers: Vec<ProducerLink>,
}

pub struct Port {
    circuit: CircuitId,
    ordinal: PortOrdinal,
    direction: PortDirection,
    kind: PortKind,
    rank: usize,
    endpoint: String,
    smb: Arc<SmbResources>,
    buffer_count: usize,
    buffer_size: u64,
    layout: PortLayout,
    allocations: Vec<(Offset, u64)>,
    flags: FlagEncoding,
    producers: Vec<ProducerLink>,
    negotiation: NegotiationState,
}

impl Port {
    /// Carve and initialize the port's memory in `smb`
    ///
    /// On failure nothing stays allocated.
    pub(crate) fn allocate(spec: PortSpec, smb: Arc<SmbResources>) -> DataplaneResult<Self> {
        let carved = carve(
            spec.kind,
            spec.direction,
            spec.buffer_count as u64,
            spec.buffer_size,
            smb.allocator()?,
        );
        let (layout, allocations) = carved.map_err(|e| {
            if e.is_exhaustion() {
                DataplaneError::NoMoreBufferAvailable {
                    endpoint: smb.key().to_string(),
                    circuit: spec.circuit,
                    port: spec.ordinal,
                }
            } else {
                e
            }
        })?;

        let mut port = Self {
            circuit: spec.circuit,
            ordinal: spec.ordinal,
            direction: spec.direction,
            kind: spec.kind,
            rank: spec.rank,
            endpoint: spec.endpoint,
            smb,
            buffer_count: spec.buffer_count,
            buffer_size: spec.buffer_size,
            layout,
            allocations,
            flags: spec.flags,
            producers: spec.producers,
            negotiation: NegotiationState::Uninitialized,
        };

        if let Err(e) = port.initialize() {
            port.release();
            return Err(e);
        }

        debug!(
            circuit = port.circuit,
            port = port.ordinal,
            direction = ?port.direction,
            kind = ?port.kind,
            smb = %port.smb.key(),
            "Port allocated"
        );
        Ok(port)
    }

    fn initialize(&self) -> DataplaneResult<()> {
        let region = self.smb.region()?;
        for &(offset, size) in &self.allocations {
            region.fill(offset, size, 0)?;
        }

        match self.kind {
            PortKind::Real => {
                for tid in 0..self.buffer_count {
                    let mut entry = BufferOffsets::empty();
                    entry.buffer_offset = self.data_offset(tid);
                    entry.buffer_size = self.buffer_size;
                    entry.local_state_offset = self.state_offset(tid, 0);
                    entry.meta_data_offset = self.meta_offset(tid, 0);
                    if self.direction.is_output() {
                        entry.port_set_control_offset = self.layout.control;
                    }
                    region.write(self.table_offset(tid), &entry)?;
                }
            }
            PortKind::Shadow if !self.direction.is_output() => {
                let mailbox = self.local_mailbox() as usize;
                for tid in 0..self.buffer_count {
                    let state = self.state_offset(tid, 0);
                    region.write(state, &BufferState::with_flag(self.flags.shadow_empty()))?;
                    let mut entry = BufferOffsets::empty();
                    entry.my_shadows_remote_state_offsets[mailbox] = state;
                    region.write(self.table_offset(tid), &entry)?;
                }
            }
            PortKind::Shadow => {}
        }

        if self.layout.flag_source != 0 {
            region.write(
                self.layout.flag_source,
                &BufferState::with_flag(self.flags.shadow_empty()),
            )?;
            region.write_u64(self.release_ack_offset(), RELEASE_ACK)?;
        }
        Ok(())
    }

    /// Return every allocation to the SMB
    pub(crate) fn release(&mut self) {
        let Ok(allocator) = self.smb.allocator() else {
            return;
        };
        for (offset, size) in self.allocations.drain(..) {
            if let Err(e) = allocator.free(offset, size) {
                error!(
                    circuit = self.circuit,
                    port = self.ordinal,
                    "Freeing offset {} ({} bytes) failed: {}",
                    offset,
                    size,
                    e
                );
            }
        }
        self.negotiation = NegotiationState::Uninitialized;
    }

    #[inline]
    pub fn circuit(&self) -> CircuitId {
        self.circuit
    }

    #[inline]
    pub fn ordinal(&self) -> PortOrdinal {
        self.ordinal
    }

    #[inline]
    pub fn direction(&self) -> PortDirection {
        self.direction
    }

    #[inline]
    pub fn kind(&self) -> PortKind {
        self.kind
    }

    #[inline]
    pub fn is_real(&self) -> bool {
        self.kind == PortKind::Real
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Endpoint of the real port
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Local SMB holding this port's memory
    pub fn smb(&self) -> &Arc<SmbResources> {
        &self.smb
    }

    pub fn buffer_count(&self) -> usize {
        self.buffer_count
    }

    pub fn buffer_size(&self) -> u64 {
        self.buffer_size
    }

    pub fn layout(&self) -> &PortLayout {
        &self.layout
    }

    pub fn flags(&self) -> FlagEncoding {
        self.flags
    }

    pub fn negotiation(&self) -> NegotiationState {
        self.negotiation
    }

    pub fn is_allocated(&self) -> bool {
        !self.allocations.is_empty()
    }

    pub(crate) fn producers(&self) -> &[ProducerLink] {
        &self.producers
    }

    fn local_mailbox(&self) -> MailboxId {
        self.smb.endpoint().mailbox()
    }

    // Layout arithmetic

    pub fn data_offset(&self, tid: BufferTid) -> Offset {
        self.layout.data + tid as u64 * self.layout.data_pitch
    }

    /// State word of `contrib` for buffer `tid`
    pub fn state_offset(&self, tid: BufferTid, contrib: usize) -> Offset {
        self.layout.state + tid as u64 * self.layout.state_pitch + contrib as u64 * BufferState::SIZE
    }

    /// Full-flag staging word of an output buffer for input slot `slot`
    pub fn staging_offset(&self, tid: BufferTid, slot: usize) -> Offset {
        self.state_offset(tid, MAX_PCONTRIBS + slot)
    }

    pub fn meta_offset(&self, tid: BufferTid, contrib: usize) -> Offset {
        self.layout.meta + tid as u64 * self.layout.meta_pitch + contrib as u64 * BufferMetaData::SIZE
    }

    pub fn table_offset(&self, tid: BufferTid) -> Offset {
        self.layout.offsets + tid as u64 * BufferOffsets::SIZE
    }

    pub(crate) fn release_ack_offset(&self) -> Offset {
        self.layout.flag_source + BufferState::SIZE
    }

    pub fn offsets(&self, tid: BufferTid) -> DataplaneResult<BufferOffsets> {
        self.smb.region()?.read(self.table_offset(tid))
    }

    pub fn offsets_table(&self) -> DataplaneResult<Vec<BufferOffsets>> {
        (0..self.buffer_count).map(|tid| self.offsets(tid)).collect()
    }

    pub fn state_word(&self, tid: BufferTid, contrib: usize) -> DataplaneResult<u64> {
        self.smb.region()?.read_u64(self.state_offset(tid, contrib))
    }

    pub fn metadata(&self, tid: BufferTid, contrib: usize) -> DataplaneResult<BufferMetaData> {
        self.smb.region()?.read(self.meta_offset(tid, contrib))
    }

    /// Producer-side control block (real output only)
    pub fn control(&self) -> DataplaneResult<OutputPortSetControl> {
        if self.layout.control == 0 {
            return Err(DataplaneError::invalid_state(format!(
                "port {} has no control block",
                self.ordinal
            )));
        }
        self.smb.region()?.read(self.layout.control)
    }

    // Offset negotiation

    /// Level-triggered readiness poll
    ///
    /// Sends at most one mailbox request per call and returns `false` until
    /// every offset this port depends on is known.
    pub(crate) fn ready(&mut self, ctx: &TransportContext) -> DataplaneResult<bool> {
        if self.negotiation == NegotiationState::Ready {
            return Ok(true);
        }
        if !self.is_allocated() {
            return Err(DataplaneError::invalid_state(format!(
                "port {} of circuit {} is released",
                self.ordinal, self.circuit
            )));
        }

        let ready = match (self.kind, self.direction) {
            (PortKind::Real, PortDirection::Output) => true,
            (PortKind::Real, PortDirection::Input) => self.shadow_offsets_known(ctx)?,
            (PortKind::Shadow, PortDirection::Input) => {
                let last = self.offsets(self.buffer_count - 1)?;
                if !last.has_input_offsets() {
                    self.request_offsets(ctx, RequestType::ReqInputOffsets, &self.endpoint)?;
                }
                last.has_input_offsets()
            }
            (PortKind::Shadow, PortDirection::Output) => {
                let last = self.offsets(self.buffer_count - 1)?;
                if last.port_set_control_offset == 0 {
                    self.request_offsets(ctx, RequestType::ReqOutputControlOffset, &self.endpoint)?;
                }
                last.port_set_control_offset != 0
            }
        };

        self.negotiation = if ready {
            NegotiationState::Ready
        } else {
            NegotiationState::AwaitingOffsets
        };
        Ok(ready)
    }

    fn shadow_offsets_known(&self, ctx: &TransportContext) -> DataplaneResult<bool> {
        let last = self.offsets(self.buffer_count - 1)?;
        let missing: Vec<&ProducerLink> = self
            .producers
            .iter()
            .filter(|p| !p.local && last.shadow_offset(p.mailbox) == 0)
            .collect();

        // One slot per participant: ask the first producer whose answer is missing
        if let Some(producer) = missing.first() {
            self.request_offsets(ctx, RequestType::ReqShadowRstateOffset, &producer.endpoint)?;
        }
        Ok(missing.is_empty())
    }

    fn request_offsets(
        &self,
        ctx: &TransportContext,
        request: RequestType,
        target: &str,
    ) -> DataplaneResult<bool> {
        let mailbox = XferMailbox::new(self.local_mailbox());
        if let Some(rejected) = mailbox.take_rejection(&self.smb)? {
            return Err(rejection_error(&rejected, target));
        }
        if !mailbox.is_available(&self.smb)? {
            return Ok(false);
        }
        let Some(services) = ctx.services(self.smb.key(), target)? else {
            return Ok(false);
        };

        let slot = MailboxSlot::request(
            request,
            self.circuit,
            self.ordinal,
            self.smb.key(),
            self.layout.offsets,
            self.buffer_count as u64 * BufferOffsets::SIZE,
            mailbox.id(),
        )?;
        mailbox.make_request(
            &self.smb,
            services.as_ref(),
            &slot,
            ctx.config().mailbox_spin_limit,
        )?;
        ctx.stats().record_mailbox_request();
        Ok(true)
    }

    /// Copies answering `request` into the requester's offsets table
    ///
    /// Only the requested fields are written so the requester's own entries
    /// survive.
    pub(crate) fn response_copies(
        &self,
        request: RequestType,
        return_offset: Offset,
        return_size: u64,
    ) -> DataplaneResult<Vec<CopyOp>> {
        let (field, len) = match (request, self.kind, self.direction) {
            (RequestType::ReqShadowRstateOffset, PortKind::Shadow, PortDirection::Input) => {
                (BufferOffsets::shadow_field(self.local_mailbox()), 8)
            }
            (RequestType::ReqInputOffsets, PortKind::Real, PortDirection::Input) => {
                (0, BufferOffsets::INPUT_OFFSETS_LEN)
            }
            (RequestType::ReqOutputControlOffset, PortKind::Real, PortDirection::Output) => {
                (BufferOffsets::CONTROL_FIELD, 8)
            }
            _ => {
                return Err(DataplaneError::invalid_state(format!(
                    "{:?} {:?} port {} cannot answer {:?}",
                    self.kind, self.direction, self.ordinal, request
                )))
            }
        };

        let entries = (return_size / BufferOffsets::SIZE).min(self.buffer_count as u64);
        Ok((0..entries)
            .map(|tid| CopyOp {
                src: self.table_offset(tid as BufferTid) + field,
                dst: return_offset + tid * BufferOffsets::SIZE + field,
                len,
                flags: XferFlags::empty(),
            })
            .collect())
    }
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("circuit", &self.circuit)
            .field("ordinal", &self.ordinal)
            .field("direction", &self.direction)
            .field("kind", &self.kind)
            .field("rank", &self.rank)
            .field("smb", &self.smb.key())
            .field("negotiation", &self.negotiation)
            .finish()
    }
}

fn carve(
    kind: PortKind,
    direction: PortDirection,
    count: u64,
    buffer_size: u64,
    allocator: &ResourceAllocator,
) -> DataplaneResult<(PortLayout, Vec<(Offset, u64)>)> {
    let mut batch = AllocationBatch::new(allocator);
    let mut layout = PortLayout::default();

    match (kind, direction) {
        (PortKind::Real, _) => {
            layout.data_pitch = align_up(buffer_size, BUFFER_ALIGNMENT);
            layout.data = batch.alloc(count * layout.data_pitch, BUFFER_ALIGNMENT)?;

            let words = if direction.is_output() {
                MAX_PCONTRIBS * 2
            } else {
                MAX_PCONTRIBS
            };
            layout.state_pitch = BufferState::SIZE * words as u64;
            layout.state = batch.alloc(count * layout.state_pitch, SMB_ALIGNMENT)?;

            layout.meta_pitch = BufferMetaData::SIZE * MAX_PCONTRIBS as u64;
            layout.meta = batch.alloc(count * layout.meta_pitch, SMB_ALIGNMENT)?;

            if direction.is_output() {
                layout.control = batch.alloc(OutputPortSetControl::SIZE, SMB_ALIGNMENT)?;
            } else {
                layout.flag_source = batch.alloc(FLAG_SOURCE_LEN, SMB_ALIGNMENT)?;
            }
        }
        (PortKind::Shadow, PortDirection::Input) => {
            layout.state_pitch = BufferState::SIZE;
            layout.state = batch.alloc(count * layout.state_pitch, SMB_ALIGNMENT)?;
        }
        (PortKind::Shadow, PortDirection::Output) => {
            layout.flag_source = batch.alloc(FLAG_SOURCE_LEN, SMB_ALIGNMENT)?;
        }
    }
    layout.offsets = batch.alloc(count * BufferOffsets::SIZE, SMB_ALIGNMENT)?;

    Ok((layout, batch.commit()))
}

/// Error for a request `target` cleared with an error code
fn rejection_error(rejected: &MailboxSlot, target: &str) -> DataplaneError {
    match rejected.error_code {
        MAILBOX_NO_SUCH_PORT => DataplaneError::PortNotFound {
            circuit: rejected.circuit_id,
            port: rejected.port_id,
        },
        MAILBOX_UNKNOWN_REQUEST => DataplaneError::api(
            "mailbox_request",
            format!("{} did not recognize the request", target),
        ),
        code => DataplaneError::api(
            "mailbox_request",
            format!("{} could not answer the request (code {})", target, code),
        ),
    }
}
