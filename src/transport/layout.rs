/*!
 * Shared-Memory Layout
 * Flow-control structures placed in SMBs and read by remote participants
 */

use crate::core::limits::{MAX_MAILBOXES, MAX_PCONTRIBS};
use crate::core::types::{MailboxId, Offset};
use bitflags::bitflags;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Full/empty flag of one buffer for one contributor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct BufferState {
    pub flag: u64,
    pub pad: u64,
}

impl BufferState {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    pub fn with_flag(flag: u64) -> Self {
        Self { flag, pad: 0 }
    }
}

bitflags! {
    /// `BufferMetaData::flags`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MetaFlags: u32 {
        const END_OF_STREAM = 0x1;
        const BROADCAST = 0x2;
        const END_OF_CIRCUIT = 0x4;
    }
}

/// Per-message metadata written by the producer next to the payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct BufferMetaData {
    pub sequence: u64,
    pub length: u32,
    pub opcode: u32,
    pub source_rank: u32,
    pub flags: u32,
    /// Temporal id: nanoseconds since the Unix epoch when the buffer was handed out
    pub timestamp: u64,
}

impl BufferMetaData {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    #[inline]
    pub fn meta_flags(&self) -> MetaFlags {
        MetaFlags::from_bits_truncate(self.flags)
    }
}

/// Output port-set control block
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct OutputPortSetControl {
    pub sequence: u64,
    /// Non-zero once the consumer with that mailbox has released the circuit
    pub released: [u64; MAX_MAILBOXES],
}

impl OutputPortSetControl {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    pub fn released_offset(mailbox: MailboxId) -> Offset {
        (std::mem::offset_of!(OutputPortSetControl, released) + mailbox as usize * 8) as Offset
    }
}

/// Offsets of one buffer, exchanged through the mailbox protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct BufferOffsets {
    pub buffer_offset: u64,
    pub buffer_size: u64,
    pub local_state_offset: u64,
    pub meta_data_offset: u64,
    pub port_set_control_offset: u64,
    /// Where each producer participant (by mailbox) tracks this buffer's emptiness
    pub my_shadows_remote_state_offsets: [u64; MAX_PCONTRIBS],
}

impl BufferOffsets {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    /// Bytes answered for `ReqInputOffsets`: buffer, size, state and metadata offsets
    pub const INPUT_OFFSETS_LEN: u64 = 4 * 8;

    pub const CONTROL_FIELD: Offset =
        std::mem::offset_of!(BufferOffsets, port_set_control_offset) as Offset;

    pub fn shadow_field(mailbox: MailboxId) -> Offset {
        (std::mem::offset_of!(BufferOffsets, my_shadows_remote_state_offsets) + mailbox as usize * 8)
            as Offset
    }

    pub fn empty() -> Self {
        Self::new_zeroed()
    }

    pub fn shadow_offset(&self, mailbox: MailboxId) -> u64 {
        self.my_shadows_remote_state_offsets
            .get(mailbox as usize)
            .copied()
            .unwrap_or(0)
    }

    /// Buffer, state and metadata offsets have all been learned
    pub fn has_input_offsets(&self) -> bool {
        self.buffer_offset != 0 && self.local_state_offset != 0 && self.meta_data_offset != 0
    }
}
