/*!
 * Dataplane Statistics
 * Lock-free counters shared by every circuit of a transport context
 */

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated on the hot path
///
/// # Performance
/// - Cache-line aligned so the counters do not share a line with neighbours
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct DataplaneStats {
    mailbox_requests_sent: AtomicU64,
    mailbox_requests_answered: AtomicU64,
    transfers_posted: AtomicU64,
    transfers_completed: AtomicU64,
    transfers_failed: AtomicU64,
    transfers_queued: AtomicU64,
    bytes_transferred: AtomicU64,
    buffers_consumed: AtomicU64,
    circuits_created: AtomicU64,
    circuits_closed: AtomicU64,
}

/// Point-in-time copy of [`DataplaneStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub mailbox_requests_sent: u64,
    pub mailbox_requests_answered: u64,
    pub transfers_posted: u64,
    pub transfers_completed: u64,
    pub transfers_failed: u64,
    pub transfers_queued: u64,
    pub bytes_transferred: u64,
    pub buffers_consumed: u64,
    pub circuits_created: u64,
    pub circuits_closed: u64,
}

impl DataplaneStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_mailbox_request(&self) {
        self.mailbox_requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_mailbox_answer(&self) {
        self.mailbox_requests_answered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_transfer_posted(&self, bytes: u64) {
        self.transfers_posted.fetch_add(1, Ordering::Relaxed);
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_transfer_completed(&self) {
        self.transfers_completed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_transfer_failed(&self) {
        self.transfers_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_transfer_queued(&self) {
        self.transfers_queued.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_buffer_consumed(&self) {
        self.buffers_consumed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_circuit_created(&self) {
        self.circuits_created.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_circuit_closed(&self) {
        self.circuits_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            mailbox_requests_sent: self.mailbox_requests_sent.load(Ordering::Relaxed),
            mailbox_requests_answered: self.mailbox_requests_answered.load(Ordering::Relaxed),
            transfers_posted: self.transfers_posted.load(Ordering::Relaxed),
            transfers_completed: self.transfers_completed.load(Ordering::Relaxed),
            transfers_failed: self.transfers_failed.load(Ordering::Relaxed),
            transfers_queued: self.transfers_queued.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            buffers_consumed: self.buffers_consumed.load(Ordering::Relaxed),
            circuits_created: self.circuits_created.load(Ordering::Relaxed),
            circuits_closed: self.circuits_closed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = DataplaneStats::new();
        stats.record_transfer_posted(128);
        stats.record_transfer_posted(64);
        stats.record_transfer_completed();
        stats.record_mailbox_request();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.transfers_posted, 2);
        assert_eq!(snapshot.bytes_transferred, 192);
        assert_eq!(snapshot.transfers_completed, 1);
        assert_eq!(snapshot.mailbox_requests_sent, 1);
        assert_eq!(snapshot.transfers_failed, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_string(&StatsSnapshot::default()).unwrap();
        assert!(json.contains("\"mailbox_requests_sent\":0"));
    }
}
