//! Record decoding for a completed transfer.
//!
//! The transfer hands over one flattened byte stream: every packet's
//! payload, in chunk and packet order, with the 2-byte packet headers
//! already stripped. Records are parsed from the front with a cursor,
//! 2-byte type, 4-byte timestamp, 1-byte length, then the payload, all
//! little-endian. The final packet is zero padded by the firmware, so a
//! short all-zero tail is filler rather than data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::link::config;

/// What a summary record measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// Seconds the tag spent awake.
    AwakeTime,
    /// Trigger activation count.
    TriggerPulls,
    /// Tilt angle samples, one per 4 payload bytes.
    TiltAngle,
    /// Opaque unsigned blob, carried raw.
    BlobUInt,
    /// Opaque float blob, carried raw.
    BlobFloat,
    /// A type code this client does not know.
    Unknown(u16),
}

impl EventKind {
    pub fn from_code(code: u16) -> Self {
        match code {
            0 => EventKind::AwakeTime,
            1 => EventKind::TriggerPulls,
            2 => EventKind::TiltAngle,
            3 => EventKind::BlobUInt,
            4 => EventKind::BlobFloat,
            other => EventKind::Unknown(other),
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            EventKind::AwakeTime => 0,
            EventKind::TriggerPulls => 1,
            EventKind::TiltAngle => 2,
            EventKind::BlobUInt => 3,
            EventKind::BlobFloat => 4,
            EventKind::Unknown(code) => *code,
        }
    }

    /// Display label matching the tag's documented event names.
    pub fn label(&self) -> &'static str {
        match self {
            EventKind::AwakeTime => "Awake Time",
            EventKind::TriggerPulls => "Trigger Pulls",
            EventKind::TiltAngle => "Tilt Angle",
            EventKind::BlobUInt => "Blob UInt",
            EventKind::BlobFloat => "Blob Float",
            EventKind::Unknown(_) => "Unknown",
        }
    }
}

/// Decoded payload of a summary record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventValue {
    /// Single counter, for scalar kinds.
    Count(u32),
    /// Sample series, for tilt angles.
    Series(Vec<u32>),
    /// Raw payload, for blob kinds.
    Blob(Vec<u8>),
    /// Unknown kinds decode to no value.
    Empty,
}

/// One decoded entry of the tag's event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryEvent {
    /// Fresh id assigned at decode time, for host-side bookkeeping.
    pub event_id: Uuid,
    pub kind: EventKind,
    /// When the tag recorded the event.
    pub recorded_at: DateTime<Utc>,
    pub value: EventValue,
}

/// Parse summary events from the front of `stream` until it is exhausted.
///
/// Truncation never fails the decode: a partial trailing record is dropped
/// with a warning and everything parsed before it is kept.
pub fn decode_events(stream: &[u8]) -> Vec<SummaryEvent> {
    let mut events = Vec::new();
    let mut cursor = 0;

    while cursor < stream.len() {
        let rest = &stream[cursor..];

        if rest.len() < config::RECORD_FILLER_THRESHOLD && rest.iter().all(|&byte| byte == 0) {
            debug!(bytes = rest.len(), "trailing filler, decode finished");
            break;
        }
        if rest.len() < config::RECORD_HEADER_LEN {
            warn!(bytes = rest.len(), "record header truncated, dropping partial record");
            break;
        }

        let code = u16::from_le_bytes([rest[0], rest[1]]);
        let seconds = u32::from_le_bytes([rest[2], rest[3], rest[4], rest[5]]);
        let length = rest[6] as usize;

        let Some(payload) = rest.get(config::RECORD_HEADER_LEN..config::RECORD_HEADER_LEN + length)
        else {
            warn!(
                declared = length,
                available = rest.len() - config::RECORD_HEADER_LEN,
                "record payload truncated, dropping partial record"
            );
            break;
        };

        let kind = EventKind::from_code(code);
        events.push(SummaryEvent {
            event_id: Uuid::new_v4(),
            kind,
            recorded_at: DateTime::from_timestamp(i64::from(seconds), 0)
                .unwrap_or(DateTime::UNIX_EPOCH),
            value: decode_value(kind, payload),
        });

        cursor += config::RECORD_HEADER_LEN + length;
    }

    events
}

fn decode_value(kind: EventKind, payload: &[u8]) -> EventValue {
    match kind {
        EventKind::AwakeTime | EventKind::TriggerPulls => EventValue::Count(scalar_field(payload)),
        EventKind::TiltAngle => EventValue::Series(series_field(payload)),
        EventKind::BlobUInt | EventKind::BlobFloat => EventValue::Blob(payload.to_vec()),
        EventKind::Unknown(_) => EventValue::Empty,
    }
}

/// First four payload bytes as a little-endian value, zero padded when the
/// payload is shorter.
fn scalar_field(payload: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    for (slot, byte) in word.iter_mut().zip(payload) {
        *slot = *byte;
    }
    u32::from_le_bytes(word)
}

/// One sample per 4 payload bytes; a trailing partial group is zero padded.
fn series_field(payload: &[u8]) -> Vec<u32> {
    payload.chunks(4).map(scalar_field).collect()
}
