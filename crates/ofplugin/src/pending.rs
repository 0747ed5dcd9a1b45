// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pending request table.
//!
//! Correlates outbound requests with device replies by transaction id.
//! The table is the single arbiter between the three completion paths
//! (reply, cancellation, timeout): whichever removes the entry from the map
//! first resolves the handle, later attempts find nothing and are no-ops.

use crate::error::{CancelCause, RequestError};
use crate::protocol::{OfMessage, Xid};
use crate::xid::TransactionIdAllocator;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

/// Successful reply to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Single correlated message.
    Message(OfMessage),
    /// All fragments of a multipart reply, in arrival order.
    Multipart(Vec<OfMessage>),
    /// Confirmed by a later barrier without any reply of its own.
    Acknowledged,
}

impl Reply {
    /// Messages carried by the reply.
    pub fn messages(&self) -> &[OfMessage] {
        match self {
            Self::Message(msg) => std::slice::from_ref(msg),
            Self::Multipart(msgs) => msgs,
            Self::Acknowledged => &[],
        }
    }
}

pub type RequestResult = Result<Reply, RequestError>;

/// What happened to a completion attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// The pending entry was resolved by this call.
    Completed,
    /// Fragment stored, more expected.
    Accumulated,
    /// No pending entry for the id (late or duplicate reply).
    UnknownTransaction,
}

struct PendingEntry {
    token: u64,
    created: Instant,
    deadline: Instant,
    tx: oneshot::Sender<RequestResult>,
    fragments: Vec<OfMessage>,
}

/// Counters for one table.
#[derive(Debug, Default)]
pub struct PendingStats {
    pub registered: AtomicU64,
    pub completed: AtomicU64,
    pub timed_out: AtomicU64,
    pub cancelled: AtomicU64,
    pub unknown: AtomicU64,
}

impl PendingStats {
    pub fn snapshot(&self) -> PendingStatsSnapshot {
        PendingStatsSnapshot {
            registered: self.registered.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            unknown: self.unknown.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingStatsSnapshot {
    pub registered: u64,
    pub completed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub unknown: u64,
}

struct TableInner {
    entries: DashMap<Xid, PendingEntry>,
    /// `Some(cause)` once the table has been cancelled. Registration holds the
    /// read side while inserting so `cancel_all` cannot miss an entry.
    closed: RwLock<Option<CancelCause>>,
    next_token: AtomicU64,
    stats: PendingStats,
}

impl TableInner {
    fn remove_token(&self, xid: Xid, token: u64) -> Option<PendingEntry> {
        self.entries
            .remove_if(&xid, |_, entry| entry.token == token)
            .map(|(_, entry)| entry)
    }
}

/// Per-device table of outstanding requests.
#[derive(Clone)]
pub struct PendingRequestTable {
    inner: Arc<TableInner>,
    timeout: Duration,
}

impl PendingRequestTable {
    /// Create a table whose entries expire `timeout` after registration.
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(TableInner {
                entries: DashMap::new(),
                closed: RwLock::new(None),
                next_token: AtomicU64::new(1),
                stats: PendingStats::default(),
            }),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register `xid` with the default deadline.
    pub fn register(&self, xid: Xid) -> Result<RequestHandle, RequestError> {
        self.register_with_deadline(xid, Instant::now() + self.timeout)
    }

    /// Register `xid` with an explicit deadline.
    ///
    /// Fails with `DuplicateTransactionId` if `xid` is already pending and
    /// with `Cancelled` once the table has been torn down.
    pub fn register_with_deadline(
        &self,
        xid: Xid,
        deadline: Instant,
    ) -> Result<RequestHandle, RequestError> {
        let closed = self.inner.closed.read();
        if let Some(cause) = *closed {
            return Err(RequestError::Cancelled(cause));
        }
        match self.inner.entries.entry(xid) {
            Entry::Occupied(_) => Err(RequestError::DuplicateTransactionId(xid)),
            Entry::Vacant(slot) => {
                let handle = self.insert(slot, xid, deadline);
                Ok(handle)
            }
        }
    }

    /// Allocate a fresh id from `allocator` and register it.
    ///
    /// Ids still pending after a wrap-around are skipped.
    pub fn register_next(
        &self,
        allocator: &TransactionIdAllocator,
    ) -> Result<RequestHandle, RequestError> {
        let closed = self.inner.closed.read();
        if let Some(cause) = *closed {
            return Err(RequestError::Cancelled(cause));
        }
        let deadline = Instant::now() + self.timeout;
        let attempts = self.inner.entries.len() + 1;
        let mut last = allocator.peek();
        for _ in 0..attempts {
            let xid = allocator.next();
            last = xid;
            match self.inner.entries.entry(xid) {
                Entry::Occupied(_) => {
                    debug!("xid {} still pending after wrap, skipping", xid);
                }
                Entry::Vacant(slot) => return Ok(self.insert(slot, xid, deadline)),
            }
        }
        Err(RequestError::DuplicateTransactionId(last))
    }

    fn insert(
        &self,
        slot: dashmap::mapref::entry::VacantEntry<'_, Xid, PendingEntry>,
        xid: Xid,
        deadline: Instant,
    ) -> RequestHandle {
        let (tx, rx) = oneshot::channel();
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        slot.insert(PendingEntry {
            token,
            created: Instant::now(),
            deadline,
            tx,
            fragments: Vec::new(),
        });
        self.inner.stats.registered.fetch_add(1, Ordering::Relaxed);
        RequestHandle {
            xid,
            token,
            rx,
            table: self.inner.clone(),
            resolved: false,
        }
    }

    /// Resolve `xid` with `result`.
    ///
    /// Unknown ids are expected under races and only logged.
    pub fn complete(&self, xid: Xid, result: RequestResult) -> CompletionOutcome {
        match self.inner.entries.remove(&xid) {
            Some((_, entry)) => {
                let result = match result {
                    Ok(Reply::Message(msg)) if !entry.fragments.is_empty() => {
                        let mut fragments = entry.fragments;
                        fragments.push(msg);
                        Ok(Reply::Multipart(fragments))
                    }
                    other => other,
                };
                self.inner.stats.completed.fetch_add(1, Ordering::Relaxed);
                // Receiver may already be gone if the caller dropped the handle.
                let _ = entry.tx.send(result);
                CompletionOutcome::Completed
            }
            None => {
                self.inner.stats.unknown.fetch_add(1, Ordering::Relaxed);
                debug!("Reply for unknown transaction {} dropped", xid);
                CompletionOutcome::UnknownTransaction
            }
        }
    }

    /// Accumulate one multipart fragment; on `is_last` resolve with all of them.
    pub fn complete_fragment(
        &self,
        xid: Xid,
        fragment: OfMessage,
        is_last: bool,
    ) -> CompletionOutcome {
        if is_last {
            return match self.inner.entries.remove(&xid) {
                Some((_, mut entry)) => {
                    entry.fragments.push(fragment);
                    self.inner.stats.completed.fetch_add(1, Ordering::Relaxed);
                    let _ = entry.tx.send(Ok(Reply::Multipart(entry.fragments)));
                    CompletionOutcome::Completed
                }
                None => {
                    self.inner.stats.unknown.fetch_add(1, Ordering::Relaxed);
                    debug!("Final fragment for unknown transaction {} dropped", xid);
                    CompletionOutcome::UnknownTransaction
                }
            };
        }

        match self.inner.entries.get_mut(&xid) {
            Some(mut entry) => {
                entry.fragments.push(fragment);
                CompletionOutcome::Accumulated
            }
            None => {
                self.inner.stats.unknown.fetch_add(1, Ordering::Relaxed);
                debug!("Fragment for unknown transaction {} dropped", xid);
                CompletionOutcome::UnknownTransaction
            }
        }
    }

    /// Resolve every pending entry with `Cancelled(cause)` and refuse new ones.
    ///
    /// Returns the number of entries cancelled. Calling it again is a no-op.
    pub fn cancel_all(&self, cause: CancelCause) -> usize {
        let mut closed = self.inner.closed.write();
        if closed.is_some() {
            return 0;
        }
        *closed = Some(cause);
        drop(closed);

        let xids: Vec<Xid> = self.inner.entries.iter().map(|e| *e.key()).collect();
        let mut cancelled = 0;
        for xid in xids {
            if let Some((_, entry)) = self.inner.entries.remove(&xid) {
                let _ = entry.tx.send(Err(RequestError::Cancelled(cause)));
                cancelled += 1;
            }
        }
        self.inner
            .stats
            .cancelled
            .fetch_add(cancelled as u64, Ordering::Relaxed);
        cancelled
    }

    /// Resolve every entry whose deadline is at or before `now` with `Timeout`.
    pub fn expire(&self, now: Instant) -> Vec<Xid> {
        let overdue: Vec<Xid> = self
            .inner
            .entries
            .iter()
            .filter(|e| e.deadline <= now)
            .map(|e| *e.key())
            .collect();

        let mut expired = Vec::with_capacity(overdue.len());
        for xid in overdue {
            if let Some((_, entry)) = self
                .inner
                .entries
                .remove_if(&xid, |_, entry| entry.deadline <= now)
            {
                debug!(
                    "Transaction {} timed out after {:?}",
                    xid,
                    now.saturating_duration_since(entry.created)
                );
                let _ = entry.tx.send(Err(RequestError::Timeout));
                expired.push(xid);
            }
        }
        self.inner
            .stats
            .timed_out
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired
    }

    pub fn contains(&self, xid: Xid) -> bool {
        self.inner.entries.contains_key(&xid)
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Cause recorded by `cancel_all`, if it ran.
    pub fn closed_cause(&self) -> Option<CancelCause> {
        *self.inner.closed.read()
    }

    pub fn stats(&self) -> PendingStatsSnapshot {
        self.inner.stats.snapshot()
    }
}

/// Caller-side handle for one pending request.
///
/// Resolves exactly once. Dropping an unresolved handle withdraws the
/// pending entry.
pub struct RequestHandle {
    xid: Xid,
    token: u64,
    rx: oneshot::Receiver<RequestResult>,
    table: Arc<TableInner>,
    resolved: bool,
}

impl RequestHandle {
    pub fn xid(&self) -> Xid {
        self.xid
    }

    /// Withdraw the request. Returns `false` if it had already been resolved.
    pub fn cancel(mut self) -> bool {
        self.resolved = true;
        match self.table.remove_token(self.xid, self.token) {
            Some(_) => {
                self.table.stats.cancelled.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Non-blocking check, for callers that poll instead of awaiting.
    pub fn try_result(&mut self) -> Option<RequestResult> {
        match self.rx.try_recv() {
            Ok(result) => {
                self.resolved = true;
                Some(result)
            }
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.resolved = true;
                Some(Err(RequestError::Cancelled(CancelCause::DeviceDisconnected)))
            }
        }
    }
}

impl Future for RequestHandle {
    type Output = RequestResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(result)) => {
                this.resolved = true;
                Poll::Ready(result)
            }
            Poll::Ready(Err(_)) => {
                this.resolved = true;
                Poll::Ready(Err(RequestError::Cancelled(
                    CancelCause::DeviceDisconnected,
                )))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for RequestHandle {
    fn drop(&mut self) {
        if !self.resolved {
            self.table.remove_token(self.xid, self.token);
        }
    }
}

impl std::fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle")
            .field("xid", &self.xid)
            .field("resolved", &self.resolved)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MessageBody, MultipartBody, OfVersion};

    fn barrier_reply(xid: Xid) -> OfMessage {
        OfMessage::new(OfVersion::V1_3, xid, MessageBody::BarrierReply)
    }

    fn fragment(xid: Xid, more: bool) -> OfMessage {
        OfMessage::new(
            OfVersion::V1_3,
            xid,
            MessageBody::MultipartReply {
                more,
                body: MultipartBody::Groups(Vec::new()),
            },
        )
    }

    #[tokio::test]
    async fn test_complete_resolves_handle() {
        let table = PendingRequestTable::new(Duration::from_secs(5));
        let handle = table.register(42).unwrap();
        assert!(table.contains(42));

        let outcome = table.complete(42, Ok(Reply::Message(barrier_reply(42))));
        assert_eq!(outcome, CompletionOutcome::Completed);
        assert!(table.is_empty());
        assert_eq!(handle.await, Ok(Reply::Message(barrier_reply(42))));
    }

    #[tokio::test]
    async fn test_second_complete_is_noop() {
        let table = PendingRequestTable::new(Duration::from_secs(5));
        let handle = table.register(7).unwrap();

        assert_eq!(
            table.complete(7, Ok(Reply::Acknowledged)),
            CompletionOutcome::Completed
        );
        assert_eq!(
            table.complete(7, Err(RequestError::Timeout)),
            CompletionOutcome::UnknownTransaction
        );
        assert_eq!(handle.await, Ok(Reply::Acknowledged));
        assert_eq!(table.stats().unknown, 1);
    }

    #[test]
    fn test_duplicate_registration() {
        let table = PendingRequestTable::new(Duration::from_secs(5));
        let _handle = table.register(1).unwrap();
        assert_eq!(
            table.register(1).unwrap_err(),
            RequestError::DuplicateTransactionId(1)
        );
    }

    #[test]
    fn test_unknown_transaction_is_not_an_error() {
        let table = PendingRequestTable::new(Duration::from_secs(5));
        assert_eq!(
            table.complete(99, Ok(Reply::Acknowledged)),
            CompletionOutcome::UnknownTransaction
        );
        assert_eq!(
            table.complete_fragment(99, fragment(99, true), false),
            CompletionOutcome::UnknownTransaction
        );
    }

    #[tokio::test]
    async fn test_multipart_aggregation() {
        let table = PendingRequestTable::new(Duration::from_secs(5));
        let handle = table.register(3).unwrap();

        assert_eq!(
            table.complete_fragment(3, fragment(3, true), false),
            CompletionOutcome::Accumulated
        );
        assert_eq!(
            table.complete_fragment(3, fragment(3, true), false),
            CompletionOutcome::Accumulated
        );
        assert!(table.contains(3));
        assert_eq!(
            table.complete_fragment(3, fragment(3, false), true),
            CompletionOutcome::Completed
        );

        match handle.await {
            Ok(Reply::Multipart(parts)) => assert_eq!(parts.len(), 3),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let table = PendingRequestTable::new(Duration::from_secs(5));
        let handles: Vec<_> = (0..10).map(|i| table.register(i).unwrap()).collect();

        assert_eq!(table.cancel_all(CancelCause::DeviceDisconnected), 10);
        assert!(table.is_empty());
        for handle in handles {
            assert_eq!(
                handle.await,
                Err(RequestError::Cancelled(CancelCause::DeviceDisconnected))
            );
        }

        // Second teardown is a no-op and the table stays closed.
        assert_eq!(table.cancel_all(CancelCause::Shutdown), 0);
        assert_eq!(
            table.register(11).unwrap_err(),
            RequestError::Cancelled(CancelCause::DeviceDisconnected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_never_early() {
        let table = PendingRequestTable::new(Duration::from_millis(500));
        let mut handle = table.register(5).unwrap();
        let start = Instant::now();

        tokio::time::advance(Duration::from_millis(499)).await;
        assert!(table.expire(Instant::now()).is_empty());
        assert!(handle.try_result().is_none());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(table.expire(Instant::now()), vec![5]);
        assert_eq!(handle.try_result(), Some(Err(RequestError::Timeout)));
        assert!(Instant::now() >= start + Duration::from_millis(500));
        assert_eq!(table.stats().timed_out, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_after_timeout_is_unknown() {
        let table = PendingRequestTable::new(Duration::from_millis(10));
        let handle = table.register(8).unwrap();
        tokio::time::advance(Duration::from_millis(20)).await;
        table.expire(Instant::now());

        assert_eq!(
            table.complete(8, Ok(Reply::Acknowledged)),
            CompletionOutcome::UnknownTransaction
        );
        assert_eq!(handle.await, Err(RequestError::Timeout));
    }

    #[test]
    fn test_register_next_skips_live_ids() {
        let table = PendingRequestTable::new(Duration::from_secs(5));
        let alloc = TransactionIdAllocator::starting_at(u32::MAX);
        let _a = table.register(0).unwrap();
        let _b = table.register(1).unwrap();

        let first = table.register_next(&alloc).unwrap();
        assert_eq!(first.xid(), u32::MAX);
        let second = table.register_next(&alloc).unwrap();
        assert_eq!(second.xid(), 2);
    }

    #[test]
    fn test_cancel_and_drop_withdraw_entry() {
        let table = PendingRequestTable::new(Duration::from_secs(5));
        let handle = table.register(1).unwrap();
        assert!(handle.cancel());
        assert!(!table.contains(1));

        let handle = table.register(2).unwrap();
        drop(handle);
        assert!(table.is_empty());
    }

    #[test]
    fn test_stale_handle_drop_keeps_reused_xid() {
        let table = PendingRequestTable::new(Duration::from_secs(5));
        let mut first = table.register(9).unwrap();
        table.complete(9, Ok(Reply::Acknowledged));
        let _second = table.register(9).unwrap();

        // The old handle never observed its result; dropping it must not
        // withdraw the new entry that reuses the same xid.
        assert!(first.try_result().is_some());
        drop(first);
        assert!(table.contains(9));
    }

    #[test]
    fn test_concurrent_register_next_unique() {
        let table = PendingRequestTable::new(Duration::from_secs(5));
        let alloc = Arc::new(TransactionIdAllocator::new());
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let table = table.clone();
                let alloc = alloc.clone();
                std::thread::spawn(move || {
                    (0..250)
                        .map(|_| table.register_next(&alloc).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let handles: Vec<RequestHandle> = threads
            .into_iter()
            .flat_map(|t| t.join().unwrap())
            .collect();
        assert_eq!(table.len(), 1000);
        assert_eq!(handles.len(), 1000);
    }
}
