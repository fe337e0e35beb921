/*!
 * Core Types
 * Common types used across the dataplane
 */

use serde::{Deserialize, Serialize};

/// Byte offset into a shared-memory block
pub type Offset = u64;

/// Size type for region operations
pub type Size = usize;

/// Circuit identifier, unique within a transport
pub type CircuitId = u32;

/// Port ordinal within a circuit (output ports first, then input ports)
pub type PortOrdinal = u32;

/// Participant slot number inside a circuit
pub type MailboxId = u16;

/// Buffer index inside a port's ring
pub type BufferTid = usize;

/// Direction of a port relative to the data flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortDirection {
    Input,
    Output,
}

impl PortDirection {
    #[inline]
    pub fn is_output(self) -> bool {
        matches!(self, PortDirection::Output)
    }
}

/// Whether a port owns memory or only mirrors a remote port's flow-control state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortKind {
    Real,
    Shadow,
}

/// Round `value` up to the next multiple of `align` (`align` must be a power of two)
#[inline]
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}
