//! Error types for tag link operations.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for link operations.
pub type LinkResult<T> = Result<T, LinkError>;

/// Errors that can resolve a link request.
///
/// Every public request resolves exactly once, with a result or with one
/// of these. Decode-time anomalies (truncated trailing record, unknown
/// event type, empty chunk) are absorbed and logged, never surfaced here.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    /// The Bluetooth radio is off or otherwise unusable.
    #[error("Bluetooth transport is unavailable")]
    TransportUnavailable,

    /// The connection could not be established before the deadline, or
    /// link establishment kept failing after retries.
    #[error("Timed out connecting to the tag")]
    ConnectionTimeout,

    /// No known peripheral matches a saved identifier.
    #[error("No peripheral matches identifier {identifier}")]
    IdentifierNotFound { identifier: Uuid },

    /// Service discovery did not answer before the deadline.
    #[error("Timed out discovering service {service}")]
    ServiceDiscoveryTimeout { service: Uuid },

    /// Characteristic discovery or the subscription chain did not finish
    /// before the deadline.
    #[error("Timed out discovering characteristics of service {service}")]
    CharacteristicDiscoveryTimeout { service: Uuid },

    /// Discovery answered and the service is not on the tag.
    #[error("Tag does not expose service {service}")]
    ServiceMissing { service: Uuid },

    /// Discovery answered and a required characteristic is not on the tag.
    #[error("Tag does not expose characteristic {characteristic}")]
    CharacteristicMissing { characteristic: Uuid },

    /// The tag disconnected, or the request was superseded, before a
    /// result was delivered.
    #[error("Tag disconnected before the request completed")]
    UnexpectedDisconnect,

    /// The identity block read from the tag is too short to decode.
    #[error("Identity value too short: {len} bytes, need at least 4")]
    IdentityMalformed { len: usize },

    /// The transport rejected a command at submission.
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// The session driver has shut down.
    #[error("Session is closed")]
    SessionClosed,
}

impl LinkError {
    /// Transient errors where retrying the request may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            LinkError::ConnectionTimeout
                | LinkError::ServiceDiscoveryTimeout { .. }
                | LinkError::CharacteristicDiscoveryTimeout { .. }
                | LinkError::UnexpectedDisconnect
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::uuids;

    #[test]
    fn test_error_is_retriable() {
        assert!(LinkError::ConnectionTimeout.is_retriable());
        assert!(LinkError::UnexpectedDisconnect.is_retriable());
        assert!(LinkError::ServiceDiscoveryTimeout {
            service: uuids::SUMMARY_SERVICE
        }
        .is_retriable());
        assert!(!LinkError::TransportUnavailable.is_retriable());
        assert!(!LinkError::IdentityMalformed { len: 2 }.is_retriable());
    }

    #[test]
    fn test_error_display() {
        let error = LinkError::IdentityMalformed { len: 2 };
        assert_eq!(error.to_string(), "Identity value too short: 2 bytes, need at least 4");

        let error = LinkError::ServiceMissing {
            service: uuids::DEVICE_INFO_SERVICE,
        };
        assert!(error.to_string().contains("240fac00"));
    }
}
