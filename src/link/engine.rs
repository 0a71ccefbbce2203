//! Link engine: the connection state machine and request orchestrator.
//!
//! One engine serves one tag at a time. A driver feeds it serialized
//! inputs (submitted requests, transport events, fired deadlines) and the
//! engine answers with transport commands and at most one new deadline
//! per call, picked up through [`LinkEngine::take_timer`]. Every request
//! resolves its reply channel exactly once; timeouts, link loss, and
//! superseding requests all land in the same teardown path.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::link::config;
use crate::link::error::{LinkError, LinkResult};
use crate::link::sequencer::{Negotiation, RequestKind, Step};
use crate::link::summary::{decode_events, SummaryEvent};
use crate::link::tag::{DiscoveredTag, TagIdentity};
use crate::link::timeout::{DeadlineKind, DeadlineToken, TimeoutSupervisor};
use crate::link::transfer::{ChunkOutcome, PacketOutcome, TransferSession};
use crate::link::transport::{PeripheralId, Transport, TransportEvent};
use crate::link::uuids;

// ============================================================================
// Requests
// ============================================================================

/// How a connected request names its tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Peripheral handle from a finished scan.
    Discovered(PeripheralId),
    /// Persisted identifier, resolved through the transport.
    Saved(Uuid),
}

/// Requests the session facade submits to the engine.
///
/// Each carries the oneshot sender its result is delivered on.
#[derive(Debug)]
pub enum LinkRequest {
    /// Collect advertising tags until the scan window closes.
    Scan {
        reply: oneshot::Sender<LinkResult<Vec<DiscoveredTag>>>,
    },
    /// Pull and decode the tag's summary event log.
    FetchSummary {
        target: Target,
        reply: oneshot::Sender<LinkResult<Vec<SummaryEvent>>>,
    },
    /// Read the tag's identity block.
    ReadIdentity {
        target: Target,
        reply: oneshot::Sender<LinkResult<TagIdentity>>,
    },
    /// Set the tag's clock.
    SetTime {
        target: Target,
        when: DateTime<Utc>,
        reply: oneshot::Sender<LinkResult<()>>,
    },
}

/// Deadline the driver must schedule after the current engine call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerRequest {
    pub token: DeadlineToken,
    pub after: Duration,
}

// ============================================================================
// Connection state
// ============================================================================

/// Connection lifecycle, carrying the peripheral wherever one is in play.
///
/// `Idle` is the state before the first request; `Disconnected` is where
/// every request ends, success or failure. Both accept new requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Idle,
    Scanning,
    Connecting {
        peripheral: PeripheralId,
        retries_left: u8,
    },
    DiscoveringServices {
        peripheral: PeripheralId,
    },
    /// Covers characteristic discovery and the whole subscription chain.
    DiscoveringCharacteristics {
        peripheral: PeripheralId,
    },
    /// Terminal read or write in flight, no deadline guarding it.
    Connected {
        peripheral: PeripheralId,
    },
    Transferring {
        peripheral: PeripheralId,
    },
    /// Link lost to a known link-loss code; a passive reconnect waits
    /// indefinitely for the tag to come back.
    OutOfRange {
        peripheral: PeripheralId,
    },
    Disconnected,
}

impl LinkState {
    fn peripheral(&self) -> Option<PeripheralId> {
        match *self {
            LinkState::Connecting { peripheral, .. }
            | LinkState::DiscoveringServices { peripheral }
            | LinkState::DiscoveringCharacteristics { peripheral }
            | LinkState::Connected { peripheral }
            | LinkState::Transferring { peripheral }
            | LinkState::OutOfRange { peripheral } => Some(peripheral),
            LinkState::Idle | LinkState::Scanning | LinkState::Disconnected => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            LinkState::Idle => "Idle",
            LinkState::Scanning => "Scanning",
            LinkState::Connecting { .. } => "Connecting",
            LinkState::DiscoveringServices { .. } => "DiscoveringServices",
            LinkState::DiscoveringCharacteristics { .. } => "DiscoveringCharacteristics",
            LinkState::Connected { .. } => "Connected",
            LinkState::Transferring { .. } => "Transferring",
            LinkState::OutOfRange { .. } => "OutOfRange",
            LinkState::Disconnected => "Disconnected",
        }
    }
}

/// The request currently being served, with its reply channel.
enum Pending {
    Scan {
        found: Vec<DiscoveredTag>,
        reply: oneshot::Sender<LinkResult<Vec<DiscoveredTag>>>,
    },
    Summary {
        negotiation: Negotiation,
        reply: oneshot::Sender<LinkResult<Vec<SummaryEvent>>>,
    },
    Identity {
        negotiation: Negotiation,
        reply: oneshot::Sender<LinkResult<TagIdentity>>,
    },
    SetTime {
        negotiation: Negotiation,
        when: DateTime<Utc>,
        reply: oneshot::Sender<LinkResult<()>>,
    },
}

impl Pending {
    /// Resolve the caller with an error. The receiver may already be
    /// gone; a dropped reply is not the engine's problem.
    fn fail(self, error: LinkError) {
        match self {
            Pending::Scan { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Pending::Summary { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Pending::Identity { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Pending::SetTime { reply, .. } => {
                let _ = reply.send(Err(error));
            }
        }
    }

    fn negotiation(&self) -> Option<&Negotiation> {
        match self {
            Pending::Scan { .. } => None,
            Pending::Summary { negotiation, .. }
            | Pending::Identity { negotiation, .. }
            | Pending::SetTime { negotiation, .. } => Some(negotiation),
        }
    }

    fn negotiation_mut(&mut self) -> Option<&mut Negotiation> {
        match self {
            Pending::Scan { .. } => None,
            Pending::Summary { negotiation, .. }
            | Pending::Identity { negotiation, .. }
            | Pending::SetTime { negotiation, .. } => Some(negotiation),
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Single-session protocol engine over an abstract transport.
pub struct LinkEngine<T: Transport> {
    transport: T,
    state: LinkState,
    timeouts: TimeoutSupervisor,
    pending: Option<Pending>,
    transfer: TransferSession,
    timer: Option<TimerRequest>,
}

impl<T: Transport> LinkEngine<T> {
    pub fn new(transport: T) -> Self {
        LinkEngine {
            transport,
            state: LinkState::Idle,
            timeouts: TimeoutSupervisor::new(),
            pending: None,
            transfer: TransferSession::new(),
            timer: None,
        }
    }

    /// Current state, for logging and diagnostics.
    pub fn state_name(&self) -> &'static str {
        self.state.name()
    }

    /// Deadline the driver should schedule, at most one per engine call.
    pub fn take_timer(&mut self) -> Option<TimerRequest> {
        self.timer.take()
    }

    /// Accept a new request, superseding whatever is in flight.
    pub fn submit(&mut self, request: LinkRequest) {
        self.supersede();

        match request {
            LinkRequest::Scan { reply } => self.begin_scan(reply),
            LinkRequest::FetchSummary { target, reply } => self.begin_connected(
                target,
                Pending::Summary {
                    negotiation: Negotiation::new(RequestKind::FetchSummary),
                    reply,
                },
            ),
            LinkRequest::ReadIdentity { target, reply } => self.begin_connected(
                target,
                Pending::Identity {
                    negotiation: Negotiation::new(RequestKind::ReadIdentity),
                    reply,
                },
            ),
            LinkRequest::SetTime {
                target,
                when,
                reply,
            } => self.begin_connected(
                target,
                Pending::SetTime {
                    negotiation: Negotiation::new(RequestKind::SetTime),
                    when,
                    reply,
                },
            ),
        }
    }

    /// Tear everything down when the driver stops. The pending caller,
    /// if any, learns the session is gone.
    pub fn shutdown(&mut self) {
        self.teardown(LinkError::SessionClosed);
    }

    fn begin_scan(&mut self, reply: oneshot::Sender<LinkResult<Vec<DiscoveredTag>>>) {
        if !self.transport.is_powered_on() {
            let _ = reply.send(Err(LinkError::TransportUnavailable));
            return;
        }
        if let Err(error) = self.transport.start_scan(uuids::SUMMARY_SERVICE) {
            let _ = reply.send(Err(error));
            return;
        }

        debug!("scan window open");
        self.pending = Some(Pending::Scan {
            found: Vec::new(),
            reply,
        });
        self.state = LinkState::Scanning;
        self.arm(DeadlineKind::Scan);
    }

    fn begin_connected(&mut self, target: Target, pending: Pending) {
        if !self.transport.is_powered_on() {
            pending.fail(LinkError::TransportUnavailable);
            return;
        }

        let peripheral = match self.resolve_target(target) {
            Ok(peripheral) => peripheral,
            Err(error) => {
                pending.fail(error);
                return;
            }
        };

        if let Err(error) = self.transport.connect(peripheral) {
            pending.fail(error);
            return;
        }

        debug!(%peripheral, "connecting");
        self.pending = Some(pending);
        self.state = LinkState::Connecting {
            peripheral,
            retries_left: config::MAX_CONNECT_RETRIES,
        };
        self.arm(DeadlineKind::Connect);
    }

    fn resolve_target(&mut self, target: Target) -> LinkResult<PeripheralId> {
        match target {
            Target::Discovered(peripheral) => Ok(peripheral),
            Target::Saved(identifier) => self
                .transport
                .resolve_peripheral(identifier)?
                .ok_or(LinkError::IdentifierNotFound { identifier }),
        }
    }

    // ------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------

    /// Process one transport event. Events for a state the machine has
    /// already left are logged and dropped.
    pub fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::AdvertisementSeen {
                peripheral,
                name,
                rssi,
            } => self.on_advertisement(peripheral, name, rssi),
            TransportEvent::Connected { peripheral } => self.on_connected(peripheral),
            TransportEvent::ConnectFailed { peripheral, code } => {
                self.on_connect_failed(peripheral, code)
            }
            TransportEvent::Disconnected { peripheral, code } => {
                self.on_disconnected(peripheral, code)
            }
            TransportEvent::ServiceDiscovered {
                peripheral,
                service,
                found,
            } => self.on_service_discovered(peripheral, service, found),
            TransportEvent::CharacteristicsDiscovered {
                peripheral, found, ..
            } => self.on_characteristics_discovered(peripheral, found),
            TransportEvent::SubscribeConfirmed {
                peripheral,
                characteristic,
            } => self.on_subscribe_confirmed(peripheral, characteristic),
            TransportEvent::ReadResult {
                peripheral,
                characteristic,
                value,
            } => self.on_read_result(peripheral, characteristic, value),
            TransportEvent::WriteConfirmed {
                peripheral,
                characteristic,
            } => self.on_write_confirmed(peripheral, characteristic),
            TransportEvent::Notification {
                peripheral,
                characteristic,
                value,
            } => self.on_notification(peripheral, characteristic, value),
        }
    }

    fn on_advertisement(
        &mut self,
        peripheral: PeripheralId,
        name: Option<String>,
        rssi: Option<i16>,
    ) {
        if self.state != LinkState::Scanning {
            debug!(%peripheral, "ignoring advertisement outside scan window");
            return;
        }
        let Some(Pending::Scan { found, .. }) = self.pending.as_mut() else {
            return;
        };
        // One entry per peripheral; the first advertisement wins
        if found.iter().any(|tag| tag.peripheral == peripheral) {
            return;
        }

        debug!(%peripheral, ?name, ?rssi, "tag advertisement");
        found.push(DiscoveredTag {
            peripheral,
            name,
            rssi,
        });
    }

    fn on_connected(&mut self, peripheral: PeripheralId) {
        match self.state {
            LinkState::Connecting {
                peripheral: expected,
                ..
            } if expected == peripheral => {
                let Some(service) = self.pending_service() else {
                    return;
                };
                debug!(%peripheral, "link up, discovering services");
                if let Err(error) = self.transport.discover_service(peripheral, service) {
                    self.abort(error);
                    return;
                }
                self.state = LinkState::DiscoveringServices { peripheral };
                self.arm(DeadlineKind::ServiceDiscovery);
            }
            LinkState::OutOfRange {
                peripheral: expected,
            } if expected == peripheral => {
                // Nothing is waiting on this link anymore. Release it so
                // the tag can advertise again.
                info!(%peripheral, "tag back in range, releasing link");
                if let Err(error) = self.transport.disconnect(peripheral) {
                    debug!(%error, "disconnect failed after out-of-range return");
                }
                self.state = LinkState::Disconnected;
            }
            _ => debug!(%peripheral, state = self.state.name(), "ignoring stale connect"),
        }
    }

    fn on_connect_failed(&mut self, peripheral: PeripheralId, code: i32) {
        match self.state {
            LinkState::Connecting {
                peripheral: expected,
                retries_left,
            } if expected == peripheral => {
                if code == config::LINK_ESTABLISH_FAILED && retries_left > 0 {
                    warn!(%peripheral, code, retries_left, "link establishment failed, retrying");
                    if let Err(error) = self.transport.connect(peripheral) {
                        self.abort(error);
                        return;
                    }
                    // The original connect deadline keeps running
                    self.state = LinkState::Connecting {
                        peripheral,
                        retries_left: retries_left - 1,
                    };
                } else {
                    warn!(%peripheral, code, "link establishment failed");
                    self.abort(LinkError::ConnectionTimeout);
                }
            }
            LinkState::OutOfRange {
                peripheral: expected,
            } if expected == peripheral => {
                debug!(%peripheral, code, "passive reconnect attempt failed, reissuing");
                if let Err(error) = self.transport.connect(peripheral) {
                    debug!(%error, "passive reconnect rejected, giving up");
                    self.state = LinkState::Disconnected;
                }
            }
            _ => debug!(%peripheral, code, "ignoring stale connect failure"),
        }
    }

    fn on_disconnected(&mut self, peripheral: PeripheralId, code: Option<i32>) {
        let Some(code) = code else {
            // Locally requested teardown completing
            debug!(%peripheral, "orderly disconnect");
            return;
        };

        match self.state {
            LinkState::Connected {
                peripheral: expected,
            }
            | LinkState::Transferring {
                peripheral: expected,
            } if expected == peripheral && config::is_out_of_range_code(code) => {
                warn!(%peripheral, code, "tag out of range, waiting for it to return");
                self.fail_pending(LinkError::UnexpectedDisconnect);
                self.transfer.reset();
                // Passive reconnect: no deadline, the tag may be back in
                // minutes or days
                if let Err(error) = self.transport.connect(peripheral) {
                    debug!(%error, "passive reconnect rejected");
                    self.state = LinkState::Disconnected;
                    return;
                }
                self.state = LinkState::OutOfRange { peripheral };
            }
            LinkState::Connecting {
                peripheral: expected,
                ..
            }
            | LinkState::DiscoveringServices {
                peripheral: expected,
            }
            | LinkState::DiscoveringCharacteristics {
                peripheral: expected,
            }
            | LinkState::Connected {
                peripheral: expected,
            }
            | LinkState::Transferring {
                peripheral: expected,
            } if expected == peripheral => {
                warn!(%peripheral, code, "tag disconnected");
                self.timeouts.cancel();
                self.fail_pending(LinkError::UnexpectedDisconnect);
                self.transfer.reset();
                self.state = LinkState::Disconnected;
            }
            _ => {
                debug!(%peripheral, code, state = self.state.name(), "ignoring stale disconnect")
            }
        }
    }

    fn on_service_discovered(&mut self, peripheral: PeripheralId, service: Uuid, found: bool) {
        let LinkState::DiscoveringServices {
            peripheral: expected,
        } = self.state
        else {
            debug!(%peripheral, "ignoring stale service discovery");
            return;
        };
        if expected != peripheral {
            return;
        }

        if !found {
            warn!(%peripheral, %service, "service not present on tag");
            self.abort(LinkError::ServiceMissing { service });
            return;
        }

        let Some(negotiation) = self.pending.as_ref().and_then(Pending::negotiation) else {
            return;
        };
        let characteristics = negotiation.characteristics();
        debug!(%peripheral, %service, "service found, discovering characteristics");
        if let Err(error) =
            self.transport
                .discover_characteristics(peripheral, service, characteristics)
        {
            self.abort(error);
            return;
        }
        self.state = LinkState::DiscoveringCharacteristics { peripheral };
        self.arm(DeadlineKind::CharacteristicDiscovery);
    }

    fn on_characteristics_discovered(&mut self, peripheral: PeripheralId, found: Vec<Uuid>) {
        let LinkState::DiscoveringCharacteristics {
            peripheral: expected,
        } = self.state
        else {
            debug!(%peripheral, "ignoring stale characteristic discovery");
            return;
        };
        if expected != peripheral {
            return;
        }

        let Some(negotiation) = self.pending.as_ref().and_then(Pending::negotiation) else {
            return;
        };
        if let Some(characteristic) = negotiation.missing_characteristic(&found) {
            warn!(
                %peripheral,
                name = uuids::characteristic_name(characteristic),
                "required characteristic missing"
            );
            self.abort(LinkError::CharacteristicMissing { characteristic });
            return;
        }

        let step = negotiation.first_step();
        self.dispatch(peripheral, step);
    }

    fn on_subscribe_confirmed(&mut self, peripheral: PeripheralId, characteristic: Uuid) {
        let LinkState::DiscoveringCharacteristics {
            peripheral: expected,
        } = self.state
        else {
            debug!(%peripheral, "ignoring stale subscription confirmation");
            return;
        };
        if expected != peripheral {
            return;
        }

        let Some(negotiation) = self.pending.as_mut().and_then(Pending::negotiation_mut) else {
            return;
        };
        debug!(
            name = uuids::characteristic_name(characteristic),
            "subscription active"
        );
        let step = negotiation.confirm_subscription(characteristic);
        self.dispatch(peripheral, step);
    }

    /// Run a negotiation step. Leaving the discovery phase cancels its
    /// deadline; the terminal read and write run unguarded.
    fn dispatch(&mut self, peripheral: PeripheralId, step: Step) {
        match step {
            Step::Subscribe(characteristic) => {
                debug!(
                    name = uuids::characteristic_name(characteristic),
                    "subscribing"
                );
                if let Err(error) = self.transport.subscribe(peripheral, characteristic) {
                    self.abort(error);
                }
            }
            Step::Read(characteristic) => {
                self.timeouts.cancel();
                self.state = LinkState::Connected { peripheral };
                if let Err(error) = self.transport.read(peripheral, characteristic) {
                    self.abort(error);
                }
            }
            Step::WriteClock => {
                let Some(when) = self.pending_clock() else {
                    return;
                };
                self.timeouts.cancel();
                self.state = LinkState::Connected { peripheral };
                debug!(%when, "writing tag clock");
                if let Err(error) =
                    self.transport
                        .write(peripheral, uuids::CLOCK, &clock_bytes(when))
                {
                    self.abort(error);
                }
            }
            Step::StartTransfer => {
                self.timeouts.cancel();
                self.state = LinkState::Transferring { peripheral };
                self.transfer.start();
                debug!("subscriptions active, requesting summary transmission");
                if let Err(error) = self.transport.write(
                    peripheral,
                    uuids::TRANSFER_SUMMARY_DATA,
                    &[config::SUMMARY_REQUEST],
                ) {
                    self.abort(error);
                }
            }
            Step::Ignore => {}
        }
    }

    fn on_read_result(&mut self, peripheral: PeripheralId, characteristic: Uuid, value: Vec<u8>) {
        let LinkState::Connected {
            peripheral: expected,
        } = self.state
        else {
            debug!(%peripheral, "ignoring stale read result");
            return;
        };
        if expected != peripheral || characteristic != uuids::SERIAL_NUMBER {
            return;
        }

        match self.pending.take() {
            Some(Pending::Identity { reply, .. }) => {
                let identity = TagIdentity::decode(&value);
                if let Ok(identity) = &identity {
                    info!(serial = %identity.serial, "tag identity read");
                }
                self.disconnect_and_settle(peripheral);
                let _ = reply.send(identity);
            }
            other => self.pending = other,
        }
    }

    fn on_write_confirmed(&mut self, peripheral: PeripheralId, characteristic: Uuid) {
        match self.state {
            LinkState::Connected {
                peripheral: expected,
            } if expected == peripheral && characteristic == uuids::CLOCK => {
                match self.pending.take() {
                    Some(Pending::SetTime { reply, .. }) => {
                        info!("tag clock set");
                        self.disconnect_and_settle(peripheral);
                        let _ = reply.send(Ok(()));
                    }
                    other => self.pending = other,
                }
            }
            LinkState::Transferring {
                peripheral: expected,
            } if expected == peripheral && characteristic == uuids::ACK_NACK => {
                // The tag saw the verdict; the chunk folds whichever way
                // it went
                self.transfer.fold_chunk();
            }
            LinkState::Transferring {
                peripheral: expected,
            } if expected == peripheral => {
                debug!(
                    name = uuids::characteristic_name(characteristic),
                    "write confirmed"
                );
            }
            _ => debug!(%peripheral, "ignoring stale write confirmation"),
        }
    }

    fn on_notification(&mut self, peripheral: PeripheralId, characteristic: Uuid, value: Vec<u8>) {
        let LinkState::Transferring {
            peripheral: expected,
        } = self.state
        else {
            debug!(%peripheral, "ignoring stale notification");
            return;
        };
        if expected != peripheral {
            return;
        }

        if characteristic == uuids::DATA {
            match self.transfer.record_packet(&value) {
                PacketOutcome::Recorded { index } => {
                    debug!(index, len = value.len(), "packet recorded")
                }
                PacketOutcome::Duplicate { index } => warn!(index, "duplicate packet replaced"),
                PacketOutcome::TooShort => warn!(len = value.len(), "packet too short to carry a header"),
            }
        } else if characteristic == uuids::TRANSFERRING {
            match value.first().copied() {
                Some(config::CHUNK_BEGIN) => debug!("chunk begins"),
                Some(config::CHUNK_END) => self.close_chunk(peripheral),
                flag => debug!(?flag, "unrecognized transferring flag"),
            }
        } else if characteristic == uuids::TRANSFER_SUMMARY_DATA {
            if value.first().copied() == Some(config::TRANSFER_COMPLETE) {
                self.finish_transfer(peripheral);
            }
        } else {
            debug!(
                name = uuids::characteristic_name(characteristic),
                "unhandled notification"
            );
        }
    }

    /// Judge the chunk the tag just finished sending and write the
    /// verdict. A chunk that closed without packets gets no verdict at
    /// all; the tag drives the next cycle.
    fn close_chunk(&mut self, peripheral: PeripheralId) {
        match self.transfer.close_chunk() {
            ChunkOutcome::Empty => warn!("chunk closed without packets"),
            ChunkOutcome::Complete => {
                debug!("chunk complete, acknowledging");
                if let Err(error) = self.transport.write(
                    peripheral,
                    uuids::ACK_NACK,
                    &[config::ChunkVerdict::Ack as u8],
                ) {
                    self.abort(error);
                }
            }
            ChunkOutcome::Incomplete(missing) => {
                warn!(missing = missing.len(), "chunk incomplete, requesting resend");
                if let Err(error) = self.transport.write(
                    peripheral,
                    uuids::ACK_NACK,
                    &[config::ChunkVerdict::Nack as u8],
                ) {
                    self.abort(error);
                    return;
                }
                let payload = TransferSession::response_payload(&missing);
                if let Err(error) = self.transport.write(peripheral, uuids::RESPONSE, &payload) {
                    self.abort(error);
                }
            }
        }
    }

    /// The tag signalled that no more chunks will arrive. Decode what was
    /// assembled, hand it to the caller, and drop the link.
    fn finish_transfer(&mut self, peripheral: PeripheralId) {
        let stream = self.transfer.take_assembled();
        let events = decode_events(&stream);
        info!(
            events = events.len(),
            chunks = self.transfer.chunks_folded(),
            elapsed = ?self.transfer.elapsed(),
            "summary transfer complete"
        );
        self.transfer.reset();
        self.disconnect_and_settle(peripheral);

        match self.pending.take() {
            Some(Pending::Summary { reply, .. }) => {
                let _ = reply.send(Ok(events));
            }
            other => self.pending = other,
        }
    }

    // ------------------------------------------------------------------
    // Deadlines
    // ------------------------------------------------------------------

    /// Process a fired deadline. Tokens from a leg the machine already
    /// left fall on the floor.
    pub fn handle_deadline(&mut self, token: DeadlineToken) {
        let Some(kind) = self.timeouts.try_fire(token) else {
            debug!("stale deadline");
            return;
        };

        match kind {
            DeadlineKind::Scan => self.finish_scan(),
            DeadlineKind::Connect => {
                warn!(state = self.state.name(), "connection deadline expired");
                self.abort(LinkError::ConnectionTimeout);
            }
            DeadlineKind::ServiceDiscovery => {
                let service = self.pending_service().unwrap_or(uuids::SUMMARY_SERVICE);
                warn!(%service, "service discovery deadline expired");
                self.abort(LinkError::ServiceDiscoveryTimeout { service });
            }
            DeadlineKind::CharacteristicDiscovery => {
                let service = self.pending_service().unwrap_or(uuids::SUMMARY_SERVICE);
                warn!(%service, "characteristic discovery deadline expired");
                self.abort(LinkError::CharacteristicDiscoveryTimeout { service });
            }
        }
    }

    /// The scan window closed. Whatever advertised is the answer; an
    /// empty scan is not an error.
    fn finish_scan(&mut self) {
        if let Err(error) = self.transport.stop_scan() {
            debug!(%error, "stop_scan failed at window close");
        }
        self.state = LinkState::Disconnected;

        match self.pending.take() {
            Some(Pending::Scan { found, reply }) => {
                info!(tags = found.len(), "scan window closed");
                let _ = reply.send(Ok(found));
            }
            other => self.pending = other,
        }
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// A new request takes over: whatever is in flight fails first and
    /// the link activity behind it is torn down.
    fn supersede(&mut self) {
        let at_rest = self.pending.is_none()
            && matches!(self.state, LinkState::Idle | LinkState::Disconnected);
        if at_rest {
            return;
        }

        warn!(state = self.state.name(), "superseding request in flight");
        self.teardown(LinkError::UnexpectedDisconnect);
    }

    /// Resolve the pending request with `error` after dropping the link.
    fn abort(&mut self, error: LinkError) {
        self.timeouts.cancel();
        if let Some(peripheral) = self.state.peripheral() {
            if let Err(disconnect_error) = self.transport.disconnect(peripheral) {
                debug!(error = %disconnect_error, "disconnect failed during abort");
            }
        }
        self.transfer.reset();
        self.fail_pending(error);
        self.state = LinkState::Disconnected;
    }

    fn teardown(&mut self, error: LinkError) {
        self.timeouts.cancel();
        self.timer = None;

        match self.state {
            LinkState::Scanning => {
                if let Err(stop_error) = self.transport.stop_scan() {
                    debug!(error = %stop_error, "stop_scan failed during teardown");
                }
            }
            _ => {
                if let Some(peripheral) = self.state.peripheral() {
                    if let Err(disconnect_error) = self.transport.disconnect(peripheral) {
                        debug!(error = %disconnect_error, "disconnect failed during teardown");
                    }
                }
            }
        }

        self.transfer.reset();
        self.fail_pending(error);
        self.state = LinkState::Disconnected;
    }

    fn fail_pending(&mut self, error: LinkError) {
        if let Some(pending) = self.pending.take() {
            pending.fail(error);
        }
    }

    /// Orderly teardown after a completed request.
    fn disconnect_and_settle(&mut self, peripheral: PeripheralId) {
        if let Err(error) = self.transport.disconnect(peripheral) {
            debug!(%error, "disconnect failed after completed request");
        }
        self.state = LinkState::Disconnected;
    }

    fn arm(&mut self, kind: DeadlineKind) {
        let token = self.timeouts.arm(kind);
        self.timer = Some(TimerRequest {
            token,
            after: config::LEG_DEADLINE,
        });
    }

    fn pending_service(&self) -> Option<Uuid> {
        self.pending
            .as_ref()
            .and_then(Pending::negotiation)
            .map(Negotiation::service)
    }

    fn pending_clock(&self) -> Option<DateTime<Utc>> {
        match self.pending.as_ref() {
            Some(Pending::SetTime { when, .. }) => Some(*when),
            _ => None,
        }
    }
}

/// Clock value the tag expects: unix seconds, 4-byte little-endian.
fn clock_bytes(when: DateTime<Utc>) -> [u8; 4] {
    (when.timestamp() as u32).to_le_bytes()
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use chrono::TimeZone;
    use uuid::uuid;

    use super::*;
    use crate::link::summary::{EventKind, EventValue};

    // ------------------------------------------------------------------
    // Scripted transport: records every command, answers are injected by
    // the test through handle_transport
    // ------------------------------------------------------------------

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        StartScan(Uuid),
        StopScan,
        Resolve(Uuid),
        Connect(PeripheralId),
        Disconnect(PeripheralId),
        DiscoverService(PeripheralId, Uuid),
        DiscoverCharacteristics(PeripheralId, Uuid, Vec<Uuid>),
        Subscribe(PeripheralId, Uuid),
        Read(PeripheralId, Uuid),
        Write(PeripheralId, Uuid, Vec<u8>),
    }

    struct ScriptTransport {
        calls: Rc<RefCell<Vec<Call>>>,
        powered: bool,
        resolves_to: Option<PeripheralId>,
    }

    impl Transport for ScriptTransport {
        fn is_powered_on(&self) -> bool {
            self.powered
        }

        fn start_scan(&mut self, service: Uuid) -> LinkResult<()> {
            self.calls.borrow_mut().push(Call::StartScan(service));
            Ok(())
        }

        fn stop_scan(&mut self) -> LinkResult<()> {
            self.calls.borrow_mut().push(Call::StopScan);
            Ok(())
        }

        fn resolve_peripheral(&mut self, identifier: Uuid) -> LinkResult<Option<PeripheralId>> {
            self.calls.borrow_mut().push(Call::Resolve(identifier));
            Ok(self.resolves_to)
        }

        fn connect(&mut self, peripheral: PeripheralId) -> LinkResult<()> {
            self.calls.borrow_mut().push(Call::Connect(peripheral));
            Ok(())
        }

        fn disconnect(&mut self, peripheral: PeripheralId) -> LinkResult<()> {
            self.calls.borrow_mut().push(Call::Disconnect(peripheral));
            Ok(())
        }

        fn discover_service(&mut self, peripheral: PeripheralId, service: Uuid) -> LinkResult<()> {
            self.calls
                .borrow_mut()
                .push(Call::DiscoverService(peripheral, service));
            Ok(())
        }

        fn discover_characteristics(
            &mut self,
            peripheral: PeripheralId,
            service: Uuid,
            characteristics: &[Uuid],
        ) -> LinkResult<()> {
            self.calls.borrow_mut().push(Call::DiscoverCharacteristics(
                peripheral,
                service,
                characteristics.to_vec(),
            ));
            Ok(())
        }

        fn subscribe(&mut self, peripheral: PeripheralId, characteristic: Uuid) -> LinkResult<()> {
            self.calls
                .borrow_mut()
                .push(Call::Subscribe(peripheral, characteristic));
            Ok(())
        }

        fn read(&mut self, peripheral: PeripheralId, characteristic: Uuid) -> LinkResult<()> {
            self.calls
                .borrow_mut()
                .push(Call::Read(peripheral, characteristic));
            Ok(())
        }

        fn write(
            &mut self,
            peripheral: PeripheralId,
            characteristic: Uuid,
            value: &[u8],
        ) -> LinkResult<()> {
            self.calls
                .borrow_mut()
                .push(Call::Write(peripheral, characteristic, value.to_vec()));
            Ok(())
        }
    }

    fn test_engine() -> (LinkEngine<ScriptTransport>, Rc<RefCell<Vec<Call>>>) {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let transport = ScriptTransport {
            calls: Rc::clone(&calls),
            powered: true,
            resolves_to: None,
        };
        (LinkEngine::new(transport), calls)
    }

    fn tag() -> PeripheralId {
        PeripheralId(uuid!("6d9231f2-8d6a-4b96-a2e5-9f0d08c0f2aa"))
    }

    fn last_call(calls: &Rc<RefCell<Vec<Call>>>) -> Option<Call> {
        calls.borrow().last().cloned()
    }

    /// Drive a summary request up to the point where the transfer starts.
    fn establish_transfer(
        engine: &mut LinkEngine<ScriptTransport>,
        peripheral: PeripheralId,
    ) -> tokio::sync::oneshot::Receiver<LinkResult<Vec<SummaryEvent>>> {
        let (reply, rx) = oneshot::channel();
        engine.submit(LinkRequest::FetchSummary {
            target: Target::Discovered(peripheral),
            reply,
        });
        engine.handle_transport(TransportEvent::Connected { peripheral });
        engine.handle_transport(TransportEvent::ServiceDiscovered {
            peripheral,
            service: uuids::SUMMARY_SERVICE,
            found: true,
        });
        engine.handle_transport(TransportEvent::CharacteristicsDiscovered {
            peripheral,
            service: uuids::SUMMARY_SERVICE,
            found: vec![
                uuids::DATA,
                uuids::TRANSFER_SUMMARY_DATA,
                uuids::TRANSFERRING,
                uuids::ACK_NACK,
                uuids::RESPONSE,
            ],
        });
        for characteristic in [uuids::DATA, uuids::TRANSFERRING, uuids::TRANSFER_SUMMARY_DATA] {
            engine.handle_transport(TransportEvent::SubscribeConfirmed {
                peripheral,
                characteristic,
            });
        }
        rx
    }

    fn notify(
        engine: &mut LinkEngine<ScriptTransport>,
        peripheral: PeripheralId,
        characteristic: Uuid,
        value: &[u8],
    ) {
        engine.handle_transport(TransportEvent::Notification {
            peripheral,
            characteristic,
            value: value.to_vec(),
        });
    }

    // ------------------------------------------------------------------
    // Scan
    // ------------------------------------------------------------------

    #[test]
    fn test_scan_collects_unique_tags_until_deadline() {
        let (mut engine, calls) = test_engine();
        let (reply, mut rx) = oneshot::channel();

        engine.submit(LinkRequest::Scan { reply });
        assert_eq!(
            last_call(&calls),
            Some(Call::StartScan(uuids::SUMMARY_SERVICE))
        );
        let timer = engine.take_timer().unwrap();
        assert_eq!(timer.after, config::LEG_DEADLINE);

        let first = tag();
        let second = PeripheralId(uuid!("0d4cb283-11b5-45f2-b6b0-2be54a4b2a98"));
        engine.handle_transport(TransportEvent::AdvertisementSeen {
            peripheral: first,
            name: Some("ResearchBit".into()),
            rssi: Some(-52),
        });
        engine.handle_transport(TransportEvent::AdvertisementSeen {
            peripheral: second,
            name: None,
            rssi: None,
        });
        // Same tag advertising again does not duplicate
        engine.handle_transport(TransportEvent::AdvertisementSeen {
            peripheral: first,
            name: Some("ResearchBit".into()),
            rssi: Some(-60),
        });

        engine.handle_deadline(timer.token);

        let found = rx.try_recv().unwrap().unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].peripheral, first);
        assert_eq!(found[0].name.as_deref(), Some("ResearchBit"));
        assert_eq!(last_call(&calls), Some(Call::StopScan));
        assert_eq!(engine.state_name(), "Disconnected");
    }

    #[test]
    fn test_scan_with_radio_off_fails_immediately() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let transport = ScriptTransport {
            calls: Rc::clone(&calls),
            powered: false,
            resolves_to: None,
        };
        let mut engine = LinkEngine::new(transport);
        let (reply, mut rx) = oneshot::channel();

        engine.submit(LinkRequest::Scan { reply });

        assert_eq!(rx.try_recv().unwrap(), Err(LinkError::TransportUnavailable));
        assert!(calls.borrow().is_empty());
    }

    #[test]
    fn test_empty_scan_is_not_an_error() {
        let (mut engine, _calls) = test_engine();
        let (reply, mut rx) = oneshot::channel();

        engine.submit(LinkRequest::Scan { reply });
        let timer = engine.take_timer().unwrap();
        engine.handle_deadline(timer.token);

        assert_eq!(rx.try_recv().unwrap(), Ok(Vec::new()));
    }

    // ------------------------------------------------------------------
    // Identity and clock
    // ------------------------------------------------------------------

    #[test]
    fn test_identity_request_walks_discovery_and_reads() {
        let (mut engine, calls) = test_engine();
        let peripheral = tag();
        let (reply, mut rx) = oneshot::channel();

        engine.submit(LinkRequest::ReadIdentity {
            target: Target::Discovered(peripheral),
            reply,
        });
        assert_eq!(last_call(&calls), Some(Call::Connect(peripheral)));

        engine.handle_transport(TransportEvent::Connected { peripheral });
        assert_eq!(
            last_call(&calls),
            Some(Call::DiscoverService(peripheral, uuids::SUMMARY_SERVICE))
        );

        engine.handle_transport(TransportEvent::ServiceDiscovered {
            peripheral,
            service: uuids::SUMMARY_SERVICE,
            found: true,
        });
        assert_eq!(
            last_call(&calls),
            Some(Call::DiscoverCharacteristics(
                peripheral,
                uuids::SUMMARY_SERVICE,
                vec![uuids::SERIAL_NUMBER]
            ))
        );

        engine.handle_transport(TransportEvent::CharacteristicsDiscovered {
            peripheral,
            service: uuids::SUMMARY_SERVICE,
            found: vec![uuids::SERIAL_NUMBER],
        });
        assert_eq!(
            last_call(&calls),
            Some(Call::Read(peripheral, uuids::SERIAL_NUMBER))
        );

        engine.handle_transport(TransportEvent::ReadResult {
            peripheral,
            characteristic: uuids::SERIAL_NUMBER,
            value: vec![0x00, 0x2A, 0x01, 0x07],
        });

        let identity = rx.try_recv().unwrap().unwrap();
        assert_eq!(identity.minor, 0x002A);
        assert_eq!(identity.major, 0x0107);
        assert_eq!(identity.serial, "002A0107");
        assert!(calls.borrow().contains(&Call::Disconnect(peripheral)));
        assert_eq!(engine.state_name(), "Disconnected");
    }

    #[test]
    fn test_set_time_writes_little_endian_seconds() {
        let (mut engine, calls) = test_engine();
        let peripheral = tag();
        let (reply, mut rx) = oneshot::channel();
        let when = Utc.timestamp_opt(0x0102_0304, 0).unwrap();

        engine.submit(LinkRequest::SetTime {
            target: Target::Discovered(peripheral),
            when,
            reply,
        });
        engine.handle_transport(TransportEvent::Connected { peripheral });
        assert_eq!(
            last_call(&calls),
            Some(Call::DiscoverService(peripheral, uuids::DEVICE_INFO_SERVICE))
        );

        engine.handle_transport(TransportEvent::ServiceDiscovered {
            peripheral,
            service: uuids::DEVICE_INFO_SERVICE,
            found: true,
        });
        engine.handle_transport(TransportEvent::CharacteristicsDiscovered {
            peripheral,
            service: uuids::DEVICE_INFO_SERVICE,
            found: vec![uuids::CLOCK],
        });
        assert_eq!(
            last_call(&calls),
            Some(Call::Write(
                peripheral,
                uuids::CLOCK,
                vec![0x04, 0x03, 0x02, 0x01]
            ))
        );

        engine.handle_transport(TransportEvent::WriteConfirmed {
            peripheral,
            characteristic: uuids::CLOCK,
        });

        assert_eq!(rx.try_recv().unwrap(), Ok(()));
        assert!(calls.borrow().contains(&Call::Disconnect(peripheral)));
    }

    #[test]
    fn test_saved_identifier_not_found() {
        let (mut engine, _calls) = test_engine();
        let identifier = uuid!("b7f67aa1-0c2b-4f11-9f3e-3f2d5c6b7a90");
        let (reply, mut rx) = oneshot::channel();

        engine.submit(LinkRequest::ReadIdentity {
            target: Target::Saved(identifier),
            reply,
        });

        assert_eq!(
            rx.try_recv().unwrap(),
            Err(LinkError::IdentifierNotFound { identifier })
        );
    }

    #[test]
    fn test_short_identity_value_is_malformed() {
        let (mut engine, _calls) = test_engine();
        let peripheral = tag();
        let (reply, mut rx) = oneshot::channel();

        engine.submit(LinkRequest::ReadIdentity {
            target: Target::Discovered(peripheral),
            reply,
        });
        engine.handle_transport(TransportEvent::Connected { peripheral });
        engine.handle_transport(TransportEvent::ServiceDiscovered {
            peripheral,
            service: uuids::SUMMARY_SERVICE,
            found: true,
        });
        engine.handle_transport(TransportEvent::CharacteristicsDiscovered {
            peripheral,
            service: uuids::SUMMARY_SERVICE,
            found: vec![uuids::SERIAL_NUMBER],
        });
        engine.handle_transport(TransportEvent::ReadResult {
            peripheral,
            characteristic: uuids::SERIAL_NUMBER,
            value: vec![0xAB, 0xCD],
        });

        assert_eq!(
            rx.try_recv().unwrap(),
            Err(LinkError::IdentityMalformed { len: 2 })
        );
    }

    // ------------------------------------------------------------------
    // Summary transfer
    // ------------------------------------------------------------------

    #[test]
    fn test_summary_negotiation_subscribes_in_order_then_starts() {
        let (mut engine, calls) = test_engine();
        let peripheral = tag();

        let _rx = establish_transfer(&mut engine, peripheral);

        let subscribed: Vec<Uuid> = calls
            .borrow()
            .iter()
            .filter_map(|call| match call {
                Call::Subscribe(_, characteristic) => Some(*characteristic),
                _ => None,
            })
            .collect();
        assert_eq!(
            subscribed,
            vec![uuids::DATA, uuids::TRANSFERRING, uuids::TRANSFER_SUMMARY_DATA]
        );
        assert_eq!(
            last_call(&calls),
            Some(Call::Write(
                peripheral,
                uuids::TRANSFER_SUMMARY_DATA,
                vec![config::SUMMARY_REQUEST]
            ))
        );
        assert_eq!(engine.state_name(), "Transferring");
    }

    #[test]
    fn test_summary_transfer_decodes_assembled_records() {
        let (mut engine, calls) = test_engine();
        let peripheral = tag();
        let mut rx = establish_transfer(&mut engine, peripheral);

        // One record: TriggerPulls at t=0x10 with field 0xDDCCBBAA
        let mut packet = vec![1u8, 0u8];
        packet.extend_from_slice(&[
            0x01, 0x00, 0x10, 0x00, 0x00, 0x00, 0x04, 0xAA, 0xBB, 0xCC, 0xDD,
        ]);

        notify(&mut engine, peripheral, uuids::TRANSFERRING, &[config::CHUNK_BEGIN]);
        notify(&mut engine, peripheral, uuids::DATA, &packet);
        notify(&mut engine, peripheral, uuids::TRANSFERRING, &[config::CHUNK_END]);
        assert_eq!(
            last_call(&calls),
            Some(Call::Write(
                peripheral,
                uuids::ACK_NACK,
                vec![config::ChunkVerdict::Ack as u8]
            ))
        );

        engine.handle_transport(TransportEvent::WriteConfirmed {
            peripheral,
            characteristic: uuids::ACK_NACK,
        });
        notify(
            &mut engine,
            peripheral,
            uuids::TRANSFER_SUMMARY_DATA,
            &[config::TRANSFER_COMPLETE],
        );

        let events = rx.try_recv().unwrap().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::TriggerPulls);
        assert_eq!(events[0].recorded_at.timestamp(), 0x10);
        assert_eq!(events[0].value, EventValue::Count(0xDDCC_BBAA));
        assert!(calls.borrow().contains(&Call::Disconnect(peripheral)));
        assert_eq!(engine.state_name(), "Disconnected");
    }

    #[test]
    fn test_incomplete_chunk_nacks_with_missing_indices() {
        let (mut engine, calls) = test_engine();
        let peripheral = tag();
        let _rx = establish_transfer(&mut engine, peripheral);

        notify(&mut engine, peripheral, uuids::TRANSFERRING, &[config::CHUNK_BEGIN]);
        for index in [0u8, 1, 3, 4] {
            notify(&mut engine, peripheral, uuids::DATA, &[5, index, 0xEE]);
        }
        notify(&mut engine, peripheral, uuids::TRANSFERRING, &[config::CHUNK_END]);

        let writes: Vec<Call> = calls
            .borrow()
            .iter()
            .rev()
            .take(2)
            .rev()
            .cloned()
            .collect();
        assert_eq!(
            writes,
            vec![
                Call::Write(
                    peripheral,
                    uuids::ACK_NACK,
                    vec![config::ChunkVerdict::Nack as u8]
                ),
                Call::Write(peripheral, uuids::RESPONSE, vec![config::MISSING_LIST_TAG, 2]),
            ]
        );
    }

    #[test]
    fn test_chunk_closing_without_packets_writes_nothing() {
        let (mut engine, calls) = test_engine();
        let peripheral = tag();
        let _rx = establish_transfer(&mut engine, peripheral);
        let before = calls.borrow().len();

        notify(&mut engine, peripheral, uuids::TRANSFERRING, &[config::CHUNK_BEGIN]);
        notify(&mut engine, peripheral, uuids::TRANSFERRING, &[config::CHUNK_END]);

        assert_eq!(calls.borrow().len(), before);
        assert_eq!(engine.state_name(), "Transferring");
    }

    // ------------------------------------------------------------------
    // Retries, timeouts, link loss
    // ------------------------------------------------------------------

    #[test]
    fn test_connect_retries_twice_on_link_establish_code() {
        let (mut engine, calls) = test_engine();
        let peripheral = tag();
        let (reply, mut rx) = oneshot::channel();

        engine.submit(LinkRequest::ReadIdentity {
            target: Target::Discovered(peripheral),
            reply,
        });
        let timer = engine.take_timer().unwrap();

        engine.handle_transport(TransportEvent::ConnectFailed {
            peripheral,
            code: config::LINK_ESTABLISH_FAILED,
        });
        // Retry shares the original deadline
        assert!(engine.take_timer().is_none());
        engine.handle_transport(TransportEvent::ConnectFailed {
            peripheral,
            code: config::LINK_ESTABLISH_FAILED,
        });
        let connects = calls
            .borrow()
            .iter()
            .filter(|call| matches!(call, Call::Connect(_)))
            .count();
        assert_eq!(connects, 3);

        engine.handle_transport(TransportEvent::ConnectFailed {
            peripheral,
            code: config::LINK_ESTABLISH_FAILED,
        });
        assert_eq!(rx.try_recv().unwrap(), Err(LinkError::ConnectionTimeout));

        // The original deadline is now stale
        engine.handle_deadline(timer.token);
        assert_eq!(engine.state_name(), "Disconnected");
    }

    #[test]
    fn test_connect_failure_with_other_code_aborts() {
        let (mut engine, _calls) = test_engine();
        let peripheral = tag();
        let (reply, mut rx) = oneshot::channel();

        engine.submit(LinkRequest::ReadIdentity {
            target: Target::Discovered(peripheral),
            reply,
        });
        engine.handle_transport(TransportEvent::ConnectFailed {
            peripheral,
            code: 62,
        });

        assert_eq!(rx.try_recv().unwrap(), Err(LinkError::ConnectionTimeout));
    }

    #[test]
    fn test_connect_deadline_times_out() {
        let (mut engine, calls) = test_engine();
        let peripheral = tag();
        let (reply, mut rx) = oneshot::channel();

        engine.submit(LinkRequest::ReadIdentity {
            target: Target::Discovered(peripheral),
            reply,
        });
        let timer = engine.take_timer().unwrap();
        engine.handle_deadline(timer.token);

        assert_eq!(rx.try_recv().unwrap(), Err(LinkError::ConnectionTimeout));
        assert_eq!(last_call(&calls), Some(Call::Disconnect(peripheral)));
        assert_eq!(engine.state_name(), "Disconnected");
    }

    #[test]
    fn test_stale_deadline_is_a_noop() {
        let (mut engine, _calls) = test_engine();
        let peripheral = tag();
        let (reply, mut rx) = oneshot::channel();

        engine.submit(LinkRequest::ReadIdentity {
            target: Target::Discovered(peripheral),
            reply,
        });
        let connect_timer = engine.take_timer().unwrap();
        engine.handle_transport(TransportEvent::Connected { peripheral });
        assert!(engine.take_timer().is_some());

        // The connect deadline fires after its leg already finished
        engine.handle_deadline(connect_timer.token);

        assert_eq!(engine.state_name(), "DiscoveringServices");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_service_discovery_timeout_names_the_service() {
        let (mut engine, _calls) = test_engine();
        let peripheral = tag();
        let (reply, mut rx) = oneshot::channel();

        engine.submit(LinkRequest::SetTime {
            target: Target::Discovered(peripheral),
            when: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            reply,
        });
        engine.handle_transport(TransportEvent::Connected { peripheral });
        let timer = engine.take_timer().unwrap();
        engine.handle_deadline(timer.token);

        assert_eq!(
            rx.try_recv().unwrap(),
            Err(LinkError::ServiceDiscoveryTimeout {
                service: uuids::DEVICE_INFO_SERVICE
            })
        );
    }

    #[test]
    fn test_missing_service_aborts() {
        let (mut engine, _calls) = test_engine();
        let peripheral = tag();
        let (reply, mut rx) = oneshot::channel();

        engine.submit(LinkRequest::ReadIdentity {
            target: Target::Discovered(peripheral),
            reply,
        });
        engine.handle_transport(TransportEvent::Connected { peripheral });
        engine.handle_transport(TransportEvent::ServiceDiscovered {
            peripheral,
            service: uuids::SUMMARY_SERVICE,
            found: false,
        });

        assert_eq!(
            rx.try_recv().unwrap(),
            Err(LinkError::ServiceMissing {
                service: uuids::SUMMARY_SERVICE
            })
        );
    }

    #[test]
    fn test_missing_characteristic_aborts() {
        let (mut engine, _calls) = test_engine();
        let peripheral = tag();
        let (reply, mut rx) = oneshot::channel();

        engine.submit(LinkRequest::FetchSummary {
            target: Target::Discovered(peripheral),
            reply,
        });
        engine.handle_transport(TransportEvent::Connected { peripheral });
        engine.handle_transport(TransportEvent::ServiceDiscovered {
            peripheral,
            service: uuids::SUMMARY_SERVICE,
            found: true,
        });
        engine.handle_transport(TransportEvent::CharacteristicsDiscovered {
            peripheral,
            service: uuids::SUMMARY_SERVICE,
            found: vec![uuids::DATA, uuids::TRANSFERRING],
        });

        assert_eq!(
            rx.try_recv().unwrap(),
            Err(LinkError::CharacteristicMissing {
                characteristic: uuids::TRANSFER_SUMMARY_DATA
            })
        );
    }

    #[test]
    fn test_out_of_range_code_reconnects_passively() {
        let (mut engine, calls) = test_engine();
        let peripheral = tag();
        let mut rx = establish_transfer(&mut engine, peripheral);
        engine.take_timer();

        engine.handle_transport(TransportEvent::Disconnected {
            peripheral,
            code: Some(7),
        });

        assert_eq!(rx.try_recv().unwrap(), Err(LinkError::UnexpectedDisconnect));
        assert_eq!(last_call(&calls), Some(Call::Connect(peripheral)));
        assert!(engine.take_timer().is_none());
        assert_eq!(engine.state_name(), "OutOfRange");

        // Tag comes back; nothing is pending, so the link is released
        engine.handle_transport(TransportEvent::Connected { peripheral });
        assert_eq!(last_call(&calls), Some(Call::Disconnect(peripheral)));
        assert_eq!(engine.state_name(), "Disconnected");
    }

    #[test]
    fn test_unpairing_code_stays_disconnected() {
        let (mut engine, calls) = test_engine();
        let peripheral = tag();
        let mut rx = establish_transfer(&mut engine, peripheral);
        let before = calls.borrow().len();

        engine.handle_transport(TransportEvent::Disconnected {
            peripheral,
            code: Some(19),
        });

        assert_eq!(rx.try_recv().unwrap(), Err(LinkError::UnexpectedDisconnect));
        // No reconnect issued
        assert_eq!(calls.borrow().len(), before);
        assert_eq!(engine.state_name(), "Disconnected");
    }

    #[test]
    fn test_orderly_disconnect_changes_nothing() {
        let (mut engine, _calls) = test_engine();
        let peripheral = tag();
        let mut rx = establish_transfer(&mut engine, peripheral);

        engine.handle_transport(TransportEvent::Disconnected {
            peripheral,
            code: None,
        });

        assert_eq!(engine.state_name(), "Transferring");
        assert!(rx.try_recv().is_err());
    }

    // ------------------------------------------------------------------
    // Superseding
    // ------------------------------------------------------------------

    #[test]
    fn test_new_request_supersedes_the_one_in_flight() {
        let (mut engine, calls) = test_engine();
        let peripheral = tag();
        let (first_reply, mut first_rx) = oneshot::channel();
        let (second_reply, _second_rx) = oneshot::channel();

        engine.submit(LinkRequest::ReadIdentity {
            target: Target::Discovered(peripheral),
            reply: first_reply,
        });
        engine.handle_transport(TransportEvent::Connected { peripheral });

        engine.submit(LinkRequest::Scan {
            reply: second_reply,
        });

        assert_eq!(
            first_rx.try_recv().unwrap(),
            Err(LinkError::UnexpectedDisconnect)
        );
        assert!(calls.borrow().contains(&Call::Disconnect(peripheral)));
        assert_eq!(
            last_call(&calls),
            Some(Call::StartScan(uuids::SUMMARY_SERVICE))
        );
        assert_eq!(engine.state_name(), "Scanning");
    }

    #[test]
    fn test_shutdown_fails_pending_with_session_closed() {
        let (mut engine, calls) = test_engine();
        let peripheral = tag();
        let (reply, mut rx) = oneshot::channel();

        engine.submit(LinkRequest::ReadIdentity {
            target: Target::Discovered(peripheral),
            reply,
        });
        engine.shutdown();

        assert_eq!(rx.try_recv().unwrap(), Err(LinkError::SessionClosed));
        assert!(calls.borrow().contains(&Call::Disconnect(peripheral)));
    }

    // ------------------------------------------------------------------
    // Stale events
    // ------------------------------------------------------------------

    #[test]
    fn test_stale_events_are_dropped() {
        let (mut engine, calls) = test_engine();
        let peripheral = tag();
        let before = calls.borrow().len();

        // No request was ever submitted
        engine.handle_transport(TransportEvent::Connected { peripheral });
        engine.handle_transport(TransportEvent::SubscribeConfirmed {
            peripheral,
            characteristic: uuids::DATA,
        });
        engine.handle_transport(TransportEvent::Notification {
            peripheral,
            characteristic: uuids::DATA,
            value: vec![1, 0, 0xFF],
        });

        assert_eq!(calls.borrow().len(), before);
        assert_eq!(engine.state_name(), "Idle");
    }
}
