// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message and connection statistics.

use crate::protocol::MessageKind;
use std::sync::atomic::{AtomicU64, Ordering};

const KINDS: usize = MessageKind::ALL.len();

/// Per-kind inbound/outbound message counters.
#[derive(Debug)]
pub struct MessageSpy {
    inbound: [AtomicU64; KINDS],
    outbound: [AtomicU64; KINDS],
    dropped: AtomicU64,
}

impl MessageSpy {
    pub fn new() -> Self {
        Self {
            inbound: std::array::from_fn(|_| AtomicU64::new(0)),
            outbound: std::array::from_fn(|_| AtomicU64::new(0)),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn record_inbound(&self, kind: MessageKind) {
        self.inbound[kind as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outbound(&self, kind: MessageKind) {
        self.outbound[kind as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Message received but not processed (not master, unsupported, late).
    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MessageSpySnapshot {
        let counters = MessageKind::ALL
            .iter()
            .map(|&kind| MessageCount {
                kind,
                inbound: self.inbound[kind as usize].load(Ordering::Relaxed),
                outbound: self.outbound[kind as usize].load(Ordering::Relaxed),
            })
            .filter(|c| c.inbound > 0 || c.outbound > 0)
            .collect();
        MessageSpySnapshot {
            counters,
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for MessageSpy {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageCount {
    pub kind: MessageKind,
    pub inbound: u64,
    pub outbound: u64,
}

/// Point-in-time copy of a [`MessageSpy`]; only non-zero kinds are listed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageSpySnapshot {
    pub counters: Vec<MessageCount>,
    pub dropped: u64,
}

impl MessageSpySnapshot {
    pub fn inbound(&self, kind: MessageKind) -> u64 {
        self.counters
            .iter()
            .find(|c| c.kind == kind)
            .map_or(0, |c| c.inbound)
    }

    pub fn outbound(&self, kind: MessageKind) -> u64 {
        self.counters
            .iter()
            .find(|c| c.kind == kind)
            .map_or(0, |c| c.outbound)
    }

    pub fn total_inbound(&self) -> u64 {
        self.counters.iter().map(|c| c.inbound).sum()
    }

    pub fn total_outbound(&self) -> u64 {
        self.counters.iter().map(|c| c.outbound).sum()
    }
}

/// Connection-level counters kept by the connection manager.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    pub accepted: AtomicU64,
    pub established: AtomicU64,
    pub handshake_failures: AtomicU64,
    pub duplicates_closed: AtomicU64,
    pub refused: AtomicU64,
    pub disconnected: AtomicU64,
}

impl ConnectionStats {
    pub fn snapshot(&self) -> ConnectionStatsSnapshot {
        ConnectionStatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            established: self.established.load(Ordering::Relaxed),
            handshake_failures: self.handshake_failures.load(Ordering::Relaxed),
            duplicates_closed: self.duplicates_closed.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
            disconnected: self.disconnected.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStatsSnapshot {
    pub accepted: u64,
    pub established: u64,
    pub handshake_failures: u64,
    pub duplicates_closed: u64,
    pub refused: u64,
    pub disconnected: u64,
}
