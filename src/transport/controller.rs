/*!
 * Transfer Controller
 * Buffer distribution policy of one consumer port set
 */

use super::description::Distribution;
use crate::core::types::{BufferTid, PortOrdinal};

/// Input buffer a message is written into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferTarget {
    pub port: PortOrdinal,
    pub tid: BufferTid,
}

/// Chooses input buffers for each message of each output rank
///
/// Output rank `r` of `k` owns the input buffers with `tid % k == r`, so
/// ranks never race for a buffer. Within its share every rank walks each
/// input port's buffers in order.
#[derive(Debug, Clone)]
pub struct TransferController {
    distribution: Distribution,
    inputs: Vec<PortOrdinal>,
    buffer_count: usize,
    output_ranks: usize,
    next_port: Vec<usize>,
    next_tid: Vec<Vec<BufferTid>>,
}

impl TransferController {
    pub fn new(
        distribution: Distribution,
        inputs: Vec<PortOrdinal>,
        buffer_count: usize,
        output_ranks: usize,
    ) -> Self {
        let output_ranks = output_ranks.max(1);
        let next_tid = (0..output_ranks).map(|rank| vec![rank; inputs.len()]).collect();
        Self {
            distribution,
            inputs,
            buffer_count,
            output_ranks,
            next_port: vec![0; output_ranks],
            next_tid,
        }
    }

    #[inline]
    pub fn distribution(&self) -> Distribution {
        self.distribution
    }

    pub fn inputs(&self) -> &[PortOrdinal] {
        &self.inputs
    }

    /// Output rank whose messages land in input buffer `tid`
    #[inline]
    pub fn contributor(tid: BufferTid, output_ranks: usize) -> usize {
        tid % output_ranks.max(1)
    }

    /// Buffers the next message of `rank` goes to; `broadcast` overrides the policy
    pub fn targets(&self, rank: usize, broadcast: bool) -> Vec<TransferTarget> {
        let Some(cursors) = self.next_tid.get(rank) else {
            return Vec::new();
        };
        if broadcast || self.distribution == Distribution::Broadcast {
            self.inputs
                .iter()
                .zip(cursors)
                .map(|(&port, &tid)| TransferTarget { port, tid })
                .collect()
        } else {
            let index = self.next_port[rank];
            vec![TransferTarget {
                port: self.inputs[index],
                tid: cursors[index],
            }]
        }
    }

    /// Move past the buffers returned by [`targets`](Self::targets)
    pub fn advance(&mut self, rank: usize, broadcast: bool) {
        if rank >= self.output_ranks {
            return;
        }
        if broadcast || self.distribution == Distribution::Broadcast {
            for index in 0..self.inputs.len() {
                self.step(rank, index);
            }
        } else {
            let index = self.next_port[rank];
            self.step(rank, index);
            self.next_port[rank] = (index + 1) % self.inputs.len();
        }
    }

    fn step(&mut self, rank: usize, index: usize) {
        let tid = &mut self.next_tid[rank][index];
        *tid += self.output_ranks;
        if *tid >= self.buffer_count {
            *tid = rank;
        }
    }
}
