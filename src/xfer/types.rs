/*!
 * Transfer Types
 * Copy flags and completion status shared by every backend
 */

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Role of one copy inside a transfer request
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct XferFlags: u32 {
        /// Producer's final, fenced "now visible" write
        const FLAG_TRANSFER = 0x01;
        const FIRST_TRANSFER = 0x02;
        const LAST_TRANSFER = 0x04;
        /// Length may be reduced before post
        const SIZE_MODIFIABLE = Self::FIRST_TRANSFER.bits() | Self::LAST_TRANSFER.bits();
        /// Payload copy, posted ahead of everything else in the request
        const DATA_TRANSFER = 0x08;
        const WAKEUP_NOTIFICATION = 0x10;
    }
}

/// Outcome of a posted transfer request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    CompleteSuccess,
    CompleteFailure,
    Pending,
}

impl CompletionStatus {
    #[inline]
    pub fn is_done(self) -> bool {
        !matches!(self, CompletionStatus::Pending)
    }
}

/// One accumulated `copy()` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyOp {
    pub src: u64,
    pub dst: u64,
    pub len: u64,
    pub flags: XferFlags,
}

/// Order copies for posting: data first, flagged copies last, others in between
///
/// Stable within each class, so copies keep their submission order.
pub fn posting_order(copies: &[CopyOp]) -> Vec<CopyOp> {
    let class = |op: &CopyOp| {
        if op.flags.contains(XferFlags::DATA_TRANSFER) {
            0
        } else if op.flags.contains(XferFlags::FLAG_TRANSFER) {
            2
        } else {
            1
        }
    };
    let mut ordered = copies.to_vec();
    ordered.sort_by_key(class);
    ordered
}
