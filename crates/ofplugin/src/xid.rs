// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transaction id allocation.

use crate::protocol::Xid;
use std::sync::atomic::{AtomicU32, Ordering};

/// First id handed out on a fresh connection. Lower ids are left to the device.
pub const FIRST_XID: Xid = 20;

/// Monotonic, wrapping transaction id source for one device connection.
///
/// Uniqueness against live requests is enforced by
/// [`PendingRequestTable::register_next`](crate::pending::PendingRequestTable::register_next),
/// which skips ids that are still pending after a wrap.
#[derive(Debug)]
pub struct TransactionIdAllocator {
    next: AtomicU32,
}

impl TransactionIdAllocator {
    pub fn new() -> Self {
        Self::starting_at(FIRST_XID)
    }

    pub fn starting_at(first: Xid) -> Self {
        Self {
            next: AtomicU32::new(first),
        }
    }

    /// Next id. Wraps on overflow.
    pub fn next(&self) -> Xid {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Id the next call will return.
    pub fn peek(&self) -> Xid {
        self.next.load(Ordering::Relaxed)
    }
}

impl Default for TransactionIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
