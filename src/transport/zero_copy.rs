/*!
 * Zero-Copy Links
 * Relation between an input buffer and the output buffer forwarding its payload
 */

use super::buffer::BufferKey;
use crate::core::types::CircuitId;
use ahash::RandomState;
use dashmap::DashMap;

/// Bidirectional map of linked buffers
///
/// Neither side owns the other; either may go away and take the link with it.
pub struct ZeroCopyLinks {
    links: DashMap<BufferKey, BufferKey, RandomState>,
}

impl ZeroCopyLinks {
    pub fn new() -> Self {
        Self {
            links: DashMap::with_hasher(RandomState::new()),
        }
    }

    pub fn attach(&self, output: BufferKey, input: BufferKey) {
        self.detach(&output);
        self.detach(&input);
        self.links.insert(output, input);
        self.links.insert(input, output);
    }

    /// Remove the link touching `key`, returning the other side
    pub fn detach(&self, key: &BufferKey) -> Option<BufferKey> {
        let (_, other) = self.links.remove(key)?;
        self.links.remove(&other);
        Some(other)
    }

    pub fn linked(&self, key: &BufferKey) -> Option<BufferKey> {
        self.links.get(key).map(|entry| *entry.value())
    }

    /// Drop every link with a side in `circuit`
    ///
    /// Returns the surviving partners, the sides outside `circuit`.
    pub fn detach_circuit(&self, circuit: CircuitId) -> Vec<BufferKey> {
        let touching: Vec<BufferKey> = self
            .links
            .iter()
            .filter(|entry| entry.key().circuit == circuit)
            .map(|entry| *entry.key())
            .collect();
        touching
            .iter()
            .filter_map(|key| self.detach(key))
            .filter(|other| other.circuit != circuit)
            .collect()
    }

    /// Number of live links
    pub fn len(&self) -> usize {
        self.links.len() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

impl Default for ZeroCopyLinks {
    fn default() -> Self {
        Self::new()
    }
}
