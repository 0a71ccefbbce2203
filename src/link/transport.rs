//! Transport seam between the link engine and a platform BLE stack.
//!
//! The engine never talks to a radio directly. It issues non-blocking
//! commands through [`Transport`] and consumes the stack's answers as
//! [`TransportEvent`] values, delivered through one serialized stream.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

use crate::link::error::LinkResult;

/// Opaque handle to a peripheral known to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeripheralId(pub Uuid);

impl std::fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Commands the engine issues to the platform BLE stack.
///
/// Every method submits work and returns immediately; results arrive later
/// as [`TransportEvent`]s. An `Err` here means the submission itself was
/// rejected (radio gone, invalid handle), not that the operation failed.
#[cfg_attr(test, automock)]
pub trait Transport {
    /// Whether the radio is powered on and commands can be issued.
    fn is_powered_on(&self) -> bool;

    /// Start scanning for peripherals advertising `service`.
    fn start_scan(&mut self, service: Uuid) -> LinkResult<()>;

    /// Stop an in-progress scan.
    fn stop_scan(&mut self) -> LinkResult<()>;

    /// Look up a peripheral by a persisted identifier.
    fn resolve_peripheral(&mut self, identifier: Uuid) -> LinkResult<Option<PeripheralId>>;

    /// Open a connection. Also used for the passive out-of-range reconnect,
    /// where the stack completes it whenever the peripheral reappears.
    fn connect(&mut self, peripheral: PeripheralId) -> LinkResult<()>;

    /// Tear down a connection or abandon a pending connect.
    fn disconnect(&mut self, peripheral: PeripheralId) -> LinkResult<()>;

    /// Ask whether the peripheral exposes `service`.
    fn discover_service(&mut self, peripheral: PeripheralId, service: Uuid) -> LinkResult<()>;

    /// Ask for the listed characteristics of a discovered service.
    fn discover_characteristics(
        &mut self,
        peripheral: PeripheralId,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> LinkResult<()>;

    /// Enable value-change notifications for a characteristic.
    fn subscribe(&mut self, peripheral: PeripheralId, characteristic: Uuid) -> LinkResult<()>;

    /// Read a characteristic value once.
    fn read(&mut self, peripheral: PeripheralId, characteristic: Uuid) -> LinkResult<()>;

    /// Write a characteristic value, confirmed by `WriteConfirmed`.
    fn write(
        &mut self,
        peripheral: PeripheralId,
        characteristic: Uuid,
        value: &[u8],
    ) -> LinkResult<()>;
}

/// Answers and unsolicited data from the platform BLE stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A peripheral matching the scan filter advertised.
    AdvertisementSeen {
        peripheral: PeripheralId,
        name: Option<String>,
        rssi: Option<i16>,
    },
    /// A connect command completed.
    Connected { peripheral: PeripheralId },
    /// A connect command failed with a platform status code.
    ConnectFailed { peripheral: PeripheralId, code: i32 },
    /// The link dropped. `code` is `None` for a locally requested,
    /// orderly disconnect and a platform status code otherwise.
    Disconnected {
        peripheral: PeripheralId,
        code: Option<i32>,
    },
    /// Service discovery answered; `found` tells whether the service exists.
    ServiceDiscovered {
        peripheral: PeripheralId,
        service: Uuid,
        found: bool,
    },
    /// Characteristic discovery answered with the characteristics present.
    CharacteristicsDiscovered {
        peripheral: PeripheralId,
        service: Uuid,
        found: Vec<Uuid>,
    },
    /// A subscribe command took effect.
    SubscribeConfirmed {
        peripheral: PeripheralId,
        characteristic: Uuid,
    },
    /// A read command completed with the characteristic's value.
    ReadResult {
        peripheral: PeripheralId,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    /// A write command was acknowledged by the peripheral.
    WriteConfirmed {
        peripheral: PeripheralId,
        characteristic: Uuid,
    },
    /// A subscribed characteristic changed value.
    Notification {
        peripheral: PeripheralId,
        characteristic: Uuid,
        value: Vec<u8>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peripheral_id_display_matches_inner_uuid() {
        let id = Uuid::new_v4();
        assert_eq!(PeripheralId(id).to_string(), id.to_string());
    }

    #[test]
    fn test_mock_transport_submits_commands() {
        let mut transport = MockTransport::new();
        transport.expect_is_powered_on().return_const(true);
        transport
            .expect_start_scan()
            .withf(|service| *service == crate::link::uuids::SUMMARY_SERVICE)
            .returning(|_| Ok(()));

        assert!(transport.is_powered_on());
        assert!(transport.start_scan(crate::link::uuids::SUMMARY_SERVICE).is_ok());
    }
}
