//! Chunk accounting for one summary-data pull.
//!
//! The tag sends records as chunks of indexed packets. Packets collect in
//! a per-chunk buffer; when the chunk closes, the verdict is ack when the
//! packet count matches the declared total and nack otherwise, with the
//! missing indices reported for retransmission. A chunk folds into the
//! assembled stream when the tag confirms the verdict write, and the
//! stream is decoded once, after the tag signals overall completion.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::link::config;

/// How a data packet landed in the current chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOutcome {
    Recorded { index: u8 },
    /// Same index seen twice in one chunk; the newer payload wins.
    Duplicate { index: u8 },
    /// Shorter than the packet header, carries nothing.
    TooShort,
}

/// Verdict for a closed chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Closed without a single packet. An anomaly: write nothing and let
    /// the tag drive the next cycle.
    Empty,
    /// Packet count matches the declared total; acknowledge.
    Complete,
    /// Packets are missing; request retransmission of these indices.
    Incomplete(Vec<u8>),
}

/// Packet buffers for one summary-data pull.
#[derive(Debug, Default)]
pub struct TransferSession {
    /// Header-stripped payloads of every folded chunk, in arrival order.
    assembled: Vec<u8>,
    /// Current chunk, packet index to payload.
    chunk: BTreeMap<u8, Vec<u8>>,
    /// Packet total declared by byte 0 of the chunk's first packet.
    declared_total: Option<u8>,
    chunks_folded: u32,
    started: Option<Instant>,
}

impl TransferSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all buffers, for an abandoned request.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Begin a fresh pull.
    pub fn start(&mut self) {
        self.reset();
        self.started = Some(Instant::now());
    }

    /// Record one Data notification into the current chunk.
    pub fn record_packet(&mut self, value: &[u8]) -> PacketOutcome {
        if value.len() < config::PACKET_HEADER_LEN {
            return PacketOutcome::TooShort;
        }

        let index = value[1];
        self.declared_total.get_or_insert(value[0]);

        let payload = value[config::PACKET_HEADER_LEN..].to_vec();
        match self.chunk.insert(index, payload) {
            Some(_) => PacketOutcome::Duplicate { index },
            None => PacketOutcome::Recorded { index },
        }
    }

    /// Close the current chunk and judge it.
    ///
    /// The missing set is recomputed from scratch on every close: an index
    /// is missing when no received packet carried it.
    pub fn close_chunk(&mut self) -> ChunkOutcome {
        let Some(total) = self.declared_total else {
            return ChunkOutcome::Empty;
        };
        if self.chunk.is_empty() {
            return ChunkOutcome::Empty;
        }

        if self.chunk.len() == usize::from(total) {
            return ChunkOutcome::Complete;
        }

        let missing: Vec<u8> = (0..total)
            .filter(|index| !self.chunk.contains_key(index))
            .collect();
        ChunkOutcome::Incomplete(missing)
    }

    /// Fold the current chunk into the assembled stream, in packet-index
    /// order. Called when the tag confirms the verdict write, whichever
    /// verdict it was.
    pub fn fold_chunk(&mut self) {
        if self.chunk.is_empty() {
            return;
        }
        for payload in std::mem::take(&mut self.chunk).into_values() {
            self.assembled.extend_from_slice(&payload);
        }
        self.declared_total = None;
        self.chunks_folded += 1;
    }

    /// Hand over the assembled stream for decoding.
    pub fn take_assembled(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.assembled)
    }

    pub fn chunks_folded(&self) -> u32 {
        self.chunks_folded
    }

    /// Wall time since the pull started.
    pub fn elapsed(&self) -> Option<Duration> {
        self.started.map(|started| started.elapsed())
    }

    /// Payload for the Response characteristic: the list marker followed
    /// by the missing packet indices.
    pub fn response_payload(missing: &[u8]) -> Vec<u8> {
        let mut payload = Vec::with_capacity(missing.len() + 1);
        payload.push(config::MISSING_LIST_TAG);
        payload.extend_from_slice(missing);
        payload
    }
}
