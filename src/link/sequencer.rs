//! Per-request negotiation plans.
//!
//! Each request kind knows which service and characteristics it needs and
//! the order its subscriptions must be confirmed in. The order matters:
//! the tag only starts transmitting once the last expected subscription
//! is active, so the chain runs strictly one confirmation at a time.

use uuid::Uuid;

use crate::link::uuids;

/// The three connected request kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    FetchSummary,
    ReadIdentity,
    SetTime,
}

/// Next action after a discovery result or subscription confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Subscribe to this characteristic and wait for its confirmation.
    Subscribe(Uuid),
    /// Read this characteristic; its value completes the request.
    Read(Uuid),
    /// Write the clock value; the write confirmation completes the request.
    WriteClock,
    /// All subscriptions are active; ask the tag to start transmitting.
    StartTransfer,
    /// The confirmation was not the one the plan is waiting for.
    Ignore,
}

const SUMMARY_CHARACTERISTICS: &[Uuid] = &[
    uuids::DATA,
    uuids::TRANSFER_SUMMARY_DATA,
    uuids::TRANSFERRING,
    uuids::ACK_NACK,
    uuids::RESPONSE,
];

/// Data first, then Transferring, then TransferSummaryData.
const SUMMARY_SUBSCRIPTIONS: &[Uuid] =
    &[uuids::DATA, uuids::TRANSFERRING, uuids::TRANSFER_SUMMARY_DATA];

const IDENTITY_CHARACTERISTICS: &[Uuid] = &[uuids::SERIAL_NUMBER];

const SET_TIME_CHARACTERISTICS: &[Uuid] = &[uuids::CLOCK];

/// Tracks one request's progress through discovery and subscription.
#[derive(Debug)]
pub struct Negotiation {
    kind: RequestKind,
    confirmed: usize,
}

impl Negotiation {
    pub fn new(kind: RequestKind) -> Self {
        Negotiation { kind, confirmed: 0 }
    }

    /// Service this request negotiates against.
    pub fn service(&self) -> Uuid {
        match self.kind {
            RequestKind::FetchSummary | RequestKind::ReadIdentity => uuids::SUMMARY_SERVICE,
            RequestKind::SetTime => uuids::DEVICE_INFO_SERVICE,
        }
    }

    /// Characteristics to request from discovery.
    pub fn characteristics(&self) -> &'static [Uuid] {
        match self.kind {
            RequestKind::FetchSummary => SUMMARY_CHARACTERISTICS,
            RequestKind::ReadIdentity => IDENTITY_CHARACTERISTICS,
            RequestKind::SetTime => SET_TIME_CHARACTERISTICS,
        }
    }

    fn subscriptions(&self) -> &'static [Uuid] {
        match self.kind {
            RequestKind::FetchSummary => SUMMARY_SUBSCRIPTIONS,
            RequestKind::ReadIdentity | RequestKind::SetTime => &[],
        }
    }

    /// First required characteristic absent from a discovery result.
    pub fn missing_characteristic(&self, found: &[Uuid]) -> Option<Uuid> {
        self.characteristics()
            .iter()
            .find(|required| !found.contains(required))
            .copied()
    }

    /// Step to take once discovery has validated the characteristics.
    pub fn first_step(&self) -> Step {
        match self.subscriptions().first() {
            Some(&characteristic) => Step::Subscribe(characteristic),
            None => self.terminal_step(),
        }
    }

    /// Advance the chain with a subscription confirmation.
    pub fn confirm_subscription(&mut self, characteristic: Uuid) -> Step {
        let subscriptions = self.subscriptions();
        if subscriptions.get(self.confirmed) != Some(&characteristic) {
            return Step::Ignore;
        }

        self.confirmed += 1;
        match subscriptions.get(self.confirmed) {
            Some(&next) => Step::Subscribe(next),
            None => self.terminal_step(),
        }
    }

    fn terminal_step(&self) -> Step {
        match self.kind {
            RequestKind::FetchSummary => Step::StartTransfer,
            RequestKind::ReadIdentity => Step::Read(uuids::SERIAL_NUMBER),
            RequestKind::SetTime => Step::WriteClock,
        }
    }
}
