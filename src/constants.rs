//! Global constants for the dpmux shared-memory layout and wire format

// ============================================================================
// SHARED MEMORY
// ============================================================================

/// Magic bytes at the start of every dpmux shared region
pub const SHM_MAGIC: [u8; 8] = *b"DPMUXSHM";

/// Layout version; bumped whenever a header changes shape
pub const SHM_LAYOUT_VERSION: u32 = 1;

/// Alignment of every ring inside the region (two cache lines)
pub const RING_ALIGN: usize = 128;

/// Number of ring pairs reserved ahead of the flow pool (the dummy pair)
pub const RESERVED_PAIRS: usize = 1;

/// Signal records each signal ring must be able to hold per flow
pub const SIGNAL_SLOTS_PER_FLOW: usize = 4;

/// Extra signal slots on top of the per-flow budget
pub const SIGNAL_SLOTS_BASE: usize = 16;

// ============================================================================
// ADDRESS PAIR WIDTHS
// ============================================================================

/// Client address width (hostnames are at most 253 ASCII characters)
pub const CLIENT_ADDR_LEN: usize = 256;

/// Port width (five digits plus terminator)
pub const PORT_LEN: usize = 6;

/// Server address width
pub const SERVER_ADDR_LEN: usize = 256;

/// Encoded size of an address pair
pub const ADDRESS_PAIR_LEN: usize = CLIENT_ADDR_LEN + PORT_LEN + SERVER_ADDR_LEN + PORT_LEN;

// ============================================================================
// CONTROL PROTOCOL
// ============================================================================

/// Encoded size of one control record: stream id, stream type, status, addresses
pub const CONTROL_MESSAGE_LEN: usize = 8 + 1 + 1 + ADDRESS_PAIR_LEN;

/// Encoded size of one signal record: queue id, status, padding
pub const SIGNAL_RECORD_LEN: usize = 16;

/// Stream id of the control stream. The initiating peer opens it before any
/// other stream, and QUIC numbers the first client bidirectional stream 0.
pub const CONTROL_STREAM_ID: u64 = 0;

// ============================================================================
// BUFFER SIZES
// ============================================================================

/// Default per-ring capacity (2 MiB)
pub const DEFAULT_QUEUE_CAPACITY: usize = 2 * 1024 * 1024;

/// Largest single read taken from a socket or stream
pub const MAX_READ_CHUNK: usize = 16 * 1024;

/// Unwritten bytes a socket or stream writer may hold before the core stops
/// handing it more
pub const WRITE_WINDOW: usize = 256 * 1024;
