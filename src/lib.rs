//! Client engine for syncing summary event logs from ResearchBit BLE
//! sensor tags.
//!
//! A tag accumulates biometric events (awake time, trigger pulls, tilt
//! angles) in its on-board log. This crate implements the host side of
//! the sync protocol: scanning, connection negotiation, the chunked
//! transfer with ack/nack repair, and decoding of the assembled event
//! stream. The radio stays behind the [`Transport`] trait, so the engine
//! runs unchanged on any platform stack that can deliver its callbacks
//! as [`TransportEvent`]s.
//!
//! # Example
//!
//! ```ignore
//! use bitlink::{Session, Target};
//!
//! let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
//! let transport = PlatformTransport::new(events_tx);
//! let session = Session::spawn(transport, events_rx);
//!
//! let tags = session.scan().await?;
//! if let Some(tag) = tags.first() {
//!     let events = session
//!         .fetch_summary(Target::Discovered(tag.peripheral))
//!         .await?;
//!     println!("synced {} events", events.len());
//! }
//! ```

pub mod link;
pub mod session;

pub use link::{
    DiscoveredTag, EventKind, EventValue, LinkEngine, LinkError, LinkRequest, LinkResult,
    PeripheralId, SummaryEvent, TagIdentity, Target, TimerRequest, Transport, TransportEvent,
};
pub use session::Session;
