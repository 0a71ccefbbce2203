//! Vendor GATT profile for the summary tag.
//!
//! Every service and characteristic lives in the vendor namespace
//! `240FXXXX-2498-4B36-BC0C-EDCCC32D0635`, with a fixed 2-byte ID per role.

use uuid::{uuid, Uuid};

// ============================================================================
// Beacon Identity
// ============================================================================

/// Beacon namespace shared by every tag; combined with the major/minor
/// fields of a decoded identity to address a specific tag.
pub const BEACON_NAMESPACE: Uuid = uuid!("152ad1e0-63af-11ea-bc55-0242ac130003");

// ============================================================================
// Summary Service (0xAA00)
// ============================================================================

/// Summary service; also the scan filter, since every tag advertises it.
pub const SUMMARY_SERVICE: Uuid = uuid!("240FAA00-2498-4B36-BC0C-EDCCC32D0635");

/// Notifies one packet of record data at a time during a transfer.
pub const DATA: Uuid = uuid!("240FAA01-2498-4B36-BC0C-EDCCC32D0635");

/// Written `1` to start a transfer; notifies `0` when all chunks are sent.
pub const TRANSFER_SUMMARY_DATA: Uuid = uuid!("240FAA02-2498-4B36-BC0C-EDCCC32D0635");

/// Notifies `1` when a chunk of packets begins and `0` when it ends.
pub const TRANSFERRING: Uuid = uuid!("240FAA03-2498-4B36-BC0C-EDCCC32D0635");

/// Written `1` (ack) or `2` (nack) after each chunk closes.
pub const ACK_NACK: Uuid = uuid!("240FAA04-2498-4B36-BC0C-EDCCC32D0635");

/// Written the missing packet indices when a chunk closes incomplete.
pub const RESPONSE: Uuid = uuid!("240FAA05-2498-4B36-BC0C-EDCCC32D0635");

/// Registration flag maintained by the tag firmware.
pub const REGISTERED: Uuid = uuid!("240FAA06-2498-4B36-BC0C-EDCCC32D0635");

/// Debug logging switch on the tag firmware.
pub const ENABLE_DEBUG: Uuid = uuid!("240FAA07-2498-4B36-BC0C-EDCCC32D0635");

/// Read once to fetch the tag's identity block (serial, beacon fields).
pub const SERIAL_NUMBER: Uuid = uuid!("240FAA08-2498-4B36-BC0C-EDCCC32D0635");

/// Reserved by the firmware for transfer fault reporting.
pub const TRANSFER_ERROR: Uuid = uuid!("240FAA09-2498-4B36-BC0C-EDCCC32D0635");

// ============================================================================
// Device Info Service (0xAC00)
// ============================================================================

/// Vendor device-info service.
pub const DEVICE_INFO_SERVICE: Uuid = uuid!("240FAC00-2498-4B36-BC0C-EDCCC32D0635");

/// Firmware revision string.
pub const FIRMWARE_REVISION: Uuid = uuid!("240FAC01-2498-4B36-BC0C-EDCCC32D0635");

/// Hardware revision string.
pub const HARDWARE_REVISION: Uuid = uuid!("240FAC02-2498-4B36-BC0C-EDCCC32D0635");

/// Model number string.
pub const MODEL_NUMBER: Uuid = uuid!("240FAC03-2498-4B36-BC0C-EDCCC32D0635");

/// Serial number string (device-info copy).
pub const INFO_SERIAL_NUMBER: Uuid = uuid!("240FAC04-2498-4B36-BC0C-EDCCC32D0635");

/// Tag clock; written 4-byte little-endian unix seconds.
pub const CLOCK: Uuid = uuid!("240FAC05-2498-4B36-BC0C-EDCCC32D0635");

/// Short display name for a characteristic, for log lines.
pub fn characteristic_name(id: Uuid) -> &'static str {
    match id {
        DATA => "Data",
        TRANSFER_SUMMARY_DATA => "TransferSummaryData",
        TRANSFERRING => "Transferring",
        ACK_NACK => "AckNack",
        RESPONSE => "Response",
        REGISTERED => "Registered",
        ENABLE_DEBUG => "EnableDebug",
        SERIAL_NUMBER => "SerialNumber",
        TRANSFER_ERROR => "TransferError",
        FIRMWARE_REVISION => "FirmwareRevision",
        HARDWARE_REVISION => "HardwareRevision",
        MODEL_NUMBER => "ModelNumber",
        INFO_SERIAL_NUMBER => "InfoSerialNumber",
        CLOCK => "Clock",
        _ => "unknown",
    }
}
