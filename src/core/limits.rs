/*!
 * Dataplane Limits and Constants
 *
 * Protocol-wide limits shared by every participant of a circuit. Values that
 * appear in shared-memory layouts must agree across all participants, so they
 * are compile-time constants rather than configuration.
 *
 * - Wire-visible constants are marked with [WIRE]
 * - Performance-related constants are marked with [PERF]
 */

use std::time::Duration;

// =============================================================================
// MAILBOX / PARTICIPANT LIMITS
// =============================================================================

/// Maximum participants in one circuit, and slots in the container comms block
/// [WIRE] Slot array length of `ContainerComms`
pub const MAX_MAILBOXES: usize = 32;

/// Maximum contributing ranks per buffer (one state word per contributor)
/// [WIRE] Tied to `MAX_MAILBOXES` because shadow offsets are indexed by mailbox
pub const MAX_PCONTRIBS: usize = MAX_MAILBOXES;

/// Length of the endpoint string field in a mailbox slot
/// [WIRE]
pub const MAX_URL_LEN: usize = 128;

/// Marker written into `ContainerComms::up_and_running` once the block is usable
/// [WIRE]
pub const COMMS_UP_AND_RUNNING: u32 = 0x5550_4e44;

// =============================================================================
// SHARED-MEMORY LAYOUT
// =============================================================================

/// Default SMB size (4MB)
pub const DEFAULT_SMB_SIZE: u64 = 4 * 1024 * 1024;

/// Smallest SMB that still holds the comms block and one small port
pub const MIN_SMB_SIZE: u64 = 64 * 1024;

/// Alignment of allocator bookkeeping and control structures
/// [WIRE] Every structure in shared memory is a multiple of 8 bytes
pub const SMB_ALIGNMENT: u64 = 8;

/// Alignment of data buffers
/// [PERF] Cache-line aligned so producers and consumers never share a line
pub const BUFFER_ALIGNMENT: u64 = 64;

// =============================================================================
// FLOW-CONTROL FLAGS
// =============================================================================

/// Top bit of every non-zero flag word
/// [WIRE]
pub const FLAG_VALID_BIT: u64 = 1 << 63;

/// Event range id used when hardware events are unavailable
/// [WIRE]
pub const NO_EVENT_RANGE: u64 = 0xfff;

/// Shift of the event range id inside a flag word
/// [WIRE]
pub const EVENT_RANGE_SHIFT: u32 = 32;

/// Event range ids available per transport context (bits 32..44 minus the sentinel)
pub const MAX_EVENT_RANGES: u32 = 0xffe;

// =============================================================================
// TRANSFER ENGINE
// =============================================================================

/// Default number of in-flight transfer requests per circuit before sends queue
pub const DEFAULT_MAX_OUTSTANDING_TRANSFERS: usize = 64;

/// Send queue depth of an RC queue pair
pub const OFED_MAX_TX_DEPTH: u32 = 8192;

/// Completion queue depth per SMB
pub const OFED_MAX_CQ_DEPTH: u32 = 4096;

/// Yields before a blocking mailbox post gives up on a stalled completion
/// [PERF] Completions on local and socket paths arrive on the first poll
pub const DEFAULT_MAILBOX_SPIN_LIMIT: u32 = 1_000_000;

/// Accept poll interval of the socket listener thread
/// Bounds how long `close()` waits for the listener to notice shutdown
pub const SOCKET_ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Socket frame header size (offset u64, length u32, count u32)
/// [WIRE]
pub const SOCKET_FRAME_HEADER_LEN: usize = 16;
