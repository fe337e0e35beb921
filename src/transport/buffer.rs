/*!
 * Buffers
 * Ring slots of a port and the handles workers hold on them
 */

use crate::core::types::{BufferTid, CircuitId, Offset, PortDirection, PortOrdinal};
use serde::{Deserialize, Serialize};

/// Identity of one buffer slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BufferKey {
    pub circuit: CircuitId,
    pub port: PortOrdinal,
    pub tid: BufferTid,
}

impl BufferKey {
    pub fn new(circuit: CircuitId, port: PortOrdinal, tid: BufferTid) -> Self {
        Self { circuit, port, tid }
    }
}

/// Flow-control phase of a buffer as seen by its local owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferPhase {
    Empty,
    Full,
    InFlight,
}

/// Producer-side bookkeeping of one output buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputPhase {
    Empty,
    /// Handed to the worker for filling
    Held,
    /// Filled and waiting for admission
    Queued,
    InFlight,
}

impl OutputPhase {
    pub(crate) fn phase(self) -> BufferPhase {
        match self {
            OutputPhase::Empty | OutputPhase::Held => BufferPhase::Empty,
            OutputPhase::Queued => BufferPhase::Full,
            OutputPhase::InFlight => BufferPhase::InFlight,
        }
    }
}

/// Output buffers of one real output port
#[derive(Debug)]
pub(crate) struct OutputRing {
    phases: Vec<OutputPhase>,
    cursor: usize,
}

impl OutputRing {
    pub(crate) fn new(count: usize) -> Self {
        Self {
            phases: vec![OutputPhase::Empty; count],
            cursor: 0,
        }
    }

    pub(crate) fn phase(&self, tid: BufferTid) -> Option<OutputPhase> {
        self.phases.get(tid).copied()
    }

    pub(crate) fn set(&mut self, tid: BufferTid, phase: OutputPhase) {
        if let Some(slot) = self.phases.get_mut(tid) {
            *slot = phase;
        }
    }

    /// Next empty buffer in ring order, marked held
    pub(crate) fn acquire(&mut self) -> Option<BufferTid> {
        let count = self.phases.len();
        let tid = (0..count)
            .map(|i| (self.cursor + i) % count)
            .find(|&tid| self.phases[tid] == OutputPhase::Empty)?;
        self.phases[tid] = OutputPhase::Held;
        self.cursor = (tid + 1) % count;
        Some(tid)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct InputSlot {
    held: bool,
    taken: bool,
}

/// Consumer-side bookkeeping of one real input port
#[derive(Debug)]
pub(crate) struct InputRing {
    slots: Vec<InputSlot>,
    cursor: usize,
}

impl InputRing {
    pub(crate) fn new(count: usize) -> Self {
        Self {
            slots: vec![InputSlot::default(); count],
            cursor: 0,
        }
    }

    /// Tids in scan order, starting after the last one handed out
    pub(crate) fn scan_order(&self) -> impl Iterator<Item = BufferTid> + '_ {
        let count = self.slots.len();
        (0..count).map(move |i| (self.cursor + i) % count)
    }

    pub(crate) fn is_free(&self, tid: BufferTid) -> bool {
        self.slots
            .get(tid)
            .map(|s| !s.held && !s.taken)
            .unwrap_or(false)
    }

    pub(crate) fn hold(&mut self, tid: BufferTid) {
        if let Some(slot) = self.slots.get_mut(tid) {
            slot.held = true;
            self.cursor = (tid + 1) % self.slots.len();
        }
    }

    pub(crate) fn take(&mut self, tid: BufferTid) {
        if let Some(slot) = self.slots.get_mut(tid) {
            slot.held = false;
            slot.taken = true;
        }
    }

    pub(crate) fn clear(&mut self, tid: BufferTid) {
        if let Some(slot) = self.slots.get_mut(tid) {
            *slot = InputSlot::default();
        }
    }
}

/// A buffer lent to a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferHandle {
    pub key: BufferKey,
    pub direction: PortDirection,
    /// Local SMB holding the payload
    pub endpoint: String,
    pub data_offset: Offset,
    pub capacity: u64,
    /// Valid payload bytes (input) or capacity (output)
    pub length: u64,
    pub opcode: u32,
}
