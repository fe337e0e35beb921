/*!
 * Event Ranges
 * Maps event range ids embedded in flag words back to circuit ports
 */

use crate::core::limits::{MAX_EVENT_RANGES, MAX_PCONTRIBS};
use crate::core::types::{CircuitId, PortOrdinal};
use ahash::RandomState;
use dashmap::DashMap;

use super::flags::FlagEncoding;

/// Event range registry of one transport context
///
/// Range ids are derived from (circuit, port) so every participant computes
/// the same id for a port without negotiation. Ids repeat modulo the range
/// space; the most recent registration wins.
pub struct EventManager {
    enabled: bool,
    ports: DashMap<u32, (CircuitId, PortOrdinal), RandomState>,
}

impl EventManager {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ports: DashMap::with_hasher(RandomState::new()),
        }
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Range id for a port, or `None` when events are disabled
    pub fn range_for(&self, circuit: CircuitId, ordinal: PortOrdinal) -> Option<u32> {
        if !self.enabled {
            return None;
        }
        let raw = circuit as u64 * (MAX_PCONTRIBS as u64 * 2) + ordinal as u64;
        Some((raw % MAX_EVENT_RANGES as u64) as u32)
    }

    /// Register a local port and return its flag encoding
    pub fn register(&self, circuit: CircuitId, ordinal: PortOrdinal) -> FlagEncoding {
        let range = self.range_for(circuit, ordinal);
        if let Some(range) = range {
            self.ports.insert(range, (circuit, ordinal));
        }
        FlagEncoding::new(range)
    }

    /// Port whose event a flag word carries
    pub fn resolve(&self, word: u64) -> Option<(CircuitId, PortOrdinal)> {
        let range = FlagEncoding::event_range(word)?;
        self.ports.get(&range).map(|entry| *entry.value())
    }

    pub fn release_circuit(&self, circuit: CircuitId) {
        self.ports.retain(|_, (c, _)| *c != circuit);
    }
}
