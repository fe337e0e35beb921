/*!
 * Flag Encoding
 * Full/empty flag words that double as event-wakeup tokens
 */

use crate::core::limits::{EVENT_RANGE_SHIFT, FLAG_VALID_BIT, NO_EVENT_RANGE};

const RANGE_MASK: u64 = 0x7fff_ffff;

/// Flag values for one input port
///
/// A full word is `1 | range << 32 | valid`; a shadow empty word is
/// `range << 32 | valid`. Without event support the range is `0xfff`.
/// A real input state word of zero means empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagEncoding {
    range: u64,
}

impl FlagEncoding {
    pub fn new(range: Option<u32>) -> Self {
        Self {
            range: range.map(|r| r as u64 & RANGE_MASK).unwrap_or(NO_EVENT_RANGE),
        }
    }

    #[inline]
    pub fn full(&self) -> u64 {
        1 | (self.range << EVENT_RANGE_SHIFT) | FLAG_VALID_BIT
    }

    #[inline]
    pub fn shadow_empty(&self) -> u64 {
        (self.range << EVENT_RANGE_SHIFT) | FLAG_VALID_BIT
    }

    #[inline]
    pub fn is_full(word: u64) -> bool {
        word & FLAG_VALID_BIT != 0 && word & 1 == 1
    }

    #[inline]
    pub fn is_shadow_empty(word: u64) -> bool {
        word & FLAG_VALID_BIT != 0 && word & 1 == 0
    }

    /// Event range carried by a flag word, if any
    pub fn event_range(word: u64) -> Option<u32> {
        if word & FLAG_VALID_BIT == 0 {
            return None;
        }
        let range = (word >> EVENT_RANGE_SHIFT) & RANGE_MASK;
        (range != NO_EVENT_RANGE).then_some(range as u32)
    }
}
