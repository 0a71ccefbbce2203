//! Protocol constants for the tag link.

use std::time::Duration;

// ============================================================================
// Deadlines
// ============================================================================

/// Deadline for each guarded leg: scanning, connecting, service discovery,
/// and characteristic discovery (including the subscription chain).
pub const LEG_DEADLINE: Duration = Duration::from_secs(10);

// ============================================================================
// Connection Retry
// ============================================================================

/// Platform status code for a transient link-establishment failure.
/// Retrying the connect usually succeeds.
pub const LINK_ESTABLISH_FAILED: i32 = 133;

/// Connect attempts retried on `LINK_ESTABLISH_FAILED` before giving up.
pub const MAX_CONNECT_RETRIES: u8 = 2;

// ============================================================================
// Out-of-Range Heuristics
// ============================================================================

/// Disconnect codes that mean the tag wandered out of radio range rather
/// than unpairing: unknown, connection timed out, peripheral disconnected,
/// connection failed.
pub const OUT_OF_RANGE_CODES: &[i32] = &[0, 6, 7, 10];

/// Check whether a disconnect code matches the out-of-range heuristics.
pub fn is_out_of_range_code(code: i32) -> bool {
    OUT_OF_RANGE_CODES.contains(&code)
}

// ============================================================================
// Packet Layout
// ============================================================================

/// Packet header length: byte 0 declares the chunk's packet total,
/// byte 1 is the packet's index within the chunk.
pub const PACKET_HEADER_LEN: usize = 2;

/// Usable payload bytes per packet after the header (20-byte ATT value).
pub const PACKET_PAYLOAD_LEN: usize = 18;

// ============================================================================
// Record Layout
// ============================================================================

/// Record header length: 2-byte event type, 4-byte timestamp, 1-byte
/// payload length, all little-endian.
pub const RECORD_HEADER_LEN: usize = 7;

/// When fewer than this many bytes remain and all of them are zero, the
/// decoder treats them as trailing filler from the final packet.
pub const RECORD_FILLER_THRESHOLD: usize = 18;

// ============================================================================
// Transfer Markers
// ============================================================================

/// Transferring notification value opening a chunk.
pub const CHUNK_BEGIN: u8 = 1;

/// Transferring notification value closing a chunk.
pub const CHUNK_END: u8 = 0;

/// Written to TransferSummaryData to ask the tag to start transmitting.
pub const SUMMARY_REQUEST: u8 = 1;

/// TransferSummaryData notification value meaning no more chunks will come.
pub const TRANSFER_COMPLETE: u8 = 0;

/// Leading byte of the Response payload that carries missing packet indices.
pub const MISSING_LIST_TAG: u8 = 1;

/// Verdict written to the Ack/Nack characteristic when a chunk closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkVerdict {
    /// Every declared packet arrived.
    Ack = 1,
    /// Packets are missing; a Response write listing them follows.
    Nack = 2,
}
