//! Tag-facing data: scan results and the decoded identity block.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::link::error::{LinkError, LinkResult};
use crate::link::transport::PeripheralId;
use crate::link::uuids;

/// A peripheral seen while scanning, with its advertisement metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredTag {
    /// Transport handle used to connect to this tag.
    pub peripheral: PeripheralId,
    /// Advertised local name, when the advertisement carried one.
    pub name: Option<String>,
    /// Signal strength at the time of the advertisement, in dBm.
    pub rssi: Option<i16>,
}

/// Identity block decoded from the tag's SerialNumber characteristic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagIdentity {
    /// Uppercase hex rendering of the whole identity value.
    pub serial: String,
    /// Beacon namespace shared by every tag.
    pub beacon: Uuid,
    /// Beacon major field, bytes 2..4 of the identity value.
    pub major: u16,
    /// Beacon minor field, bytes 0..2 of the identity value.
    pub minor: u16,
}

impl TagIdentity {
    /// Decode the raw characteristic value.
    ///
    /// The first four bytes carry the beacon minor and major fields in
    /// big-endian order; the serial covers the whole value. Shorter
    /// values cannot identify a tag.
    pub fn decode(value: &[u8]) -> LinkResult<Self> {
        if value.len() < 4 {
            return Err(LinkError::IdentityMalformed { len: value.len() });
        }

        let minor = u16::from_be_bytes([value[0], value[1]]);
        let major = u16::from_be_bytes([value[2], value[3]]);
        let serial: String = value.iter().map(|byte| format!("{byte:02X}")).collect();

        Ok(TagIdentity {
            serial,
            beacon: uuids::BEACON_NAMESPACE,
            major,
            minor,
        })
    }
}
