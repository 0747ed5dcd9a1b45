// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bounded flow/group history for operational visibility.
//!
//! Append-only ring buffer: once full, the oldest entry is evicted on every
//! insert. Only the device context records entries; everyone else gets
//! copies through [`FlowGroupHistory::read_entries`].

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// What the entry refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    Flow { table_id: u8 },
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryStatus {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub kind: HistoryKind,
    pub status: EntryStatus,
    pub timestamp: DateTime<Utc>,
}

/// Fixed-capacity history ring.
pub struct FlowGroupHistory {
    ring: Mutex<VecDeque<HistoryEntry>>,
    capacity: usize,
    evicted: AtomicU64,
}

impl FlowGroupHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            evicted: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_flow(&self, table_id: u8, id: impl Into<String>, status: EntryStatus) {
        self.push(HistoryEntry {
            id: id.into(),
            kind: HistoryKind::Flow { table_id },
            status,
            timestamp: Utc::now(),
        });
    }

    pub(crate) fn record_group(&self, group_id: u32, status: EntryStatus) {
        self.push(HistoryEntry {
            id: group_id.to_string(),
            kind: HistoryKind::Group,
            status,
            timestamp: Utc::now(),
        });
    }

    fn push(&self, entry: HistoryEntry) {
        let mut ring = self.ring.lock();
        if ring.len() >= self.capacity {
            ring.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        ring.push_back(entry);
    }

    /// Snapshot of the history, oldest first.
    pub fn read_entries(&self) -> Vec<HistoryEntry> {
        self.ring.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries dropped to make room since creation.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_oldest() {
        let history = FlowGroupHistory::new(3);
        for i in 0..5 {
            history.record_flow(0, format!("flow-{}", i), EntryStatus::Added);
        }
        let ids: Vec<String> = history.read_entries().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["flow-2", "flow-3", "flow-4"]);
        assert_eq!(history.evicted(), 2);
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let history = FlowGroupHistory::new(10);
        history.record_group(7, EntryStatus::Added);
        let mut snapshot = history.read_entries();
        snapshot.clear();
        history.record_group(7, EntryStatus::Removed);

        let entries = history.read_entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].status, EntryStatus::Added);
        assert_eq!(entries[1].status, EntryStatus::Removed);
        assert_eq!(entries[1].kind, HistoryKind::Group);
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let history = FlowGroupHistory::new(0);
        history.record_flow(1, "a", EntryStatus::Modified);
        history.record_flow(1, "b", EntryStatus::Modified);
        assert_eq!(history.capacity(), 1);
        assert_eq!(history.read_entries()[0].id, "b");
    }
}
