// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Operational store capability.
//!
//! The store only mirrors final device state (node, ports, flows, groups,
//! meters); registries remain the source of truth. Writes are batched in a
//! transaction and committed asynchronously.

use crate::handshake::HandshakeOutcome;
use crate::protocol::{DatapathId, PortDesc};
use crate::registry::{FlowDescriptor, FlowRegistryKey, GroupId, MeterId};
use parking_lot::RwLock;
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Value stored at a path.
pub type StoreValue = serde_json::Value;

/// Future returned by [`StoreTransaction::commit`].
pub type CommitFuture = Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'static>>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("commit failed: {0}")]
    CommitFailed(String),
}

/// Slash-separated path in the operational tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorePath(String);

impl StorePath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn node(datapath_id: DatapathId) -> Self {
        Self(format!("nodes/{}", datapath_id.node_id()))
    }

    pub fn flow(datapath_id: DatapathId, descriptor: &FlowDescriptor) -> Self {
        Self(format!(
            "nodes/{}/tables/{}/flows/{}",
            datapath_id.node_id(),
            descriptor.table_id,
            descriptor.flow_id
        ))
    }

    /// Parent of every flow path of the node.
    pub fn tables(datapath_id: DatapathId) -> Self {
        Self(format!("nodes/{}/tables", datapath_id.node_id()))
    }

    pub fn groups(datapath_id: DatapathId) -> Self {
        Self(format!("nodes/{}/groups", datapath_id.node_id()))
    }

    pub fn group(datapath_id: DatapathId, group_id: GroupId) -> Self {
        Self(format!("nodes/{}/groups/{}", datapath_id.node_id(), group_id))
    }

    pub fn meters(datapath_id: DatapathId) -> Self {
        Self(format!("nodes/{}/meters", datapath_id.node_id()))
    }

    pub fn meter(datapath_id: DatapathId, meter_id: MeterId) -> Self {
        Self(format!("nodes/{}/meters/{}", datapath_id.node_id(), meter_id))
    }

    pub fn port(datapath_id: DatapathId, port_no: u32) -> Self {
        Self(format!("nodes/{}/ports/{}", datapath_id.node_id(), port_no))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `self` is `ancestor` or lies below it.
    pub fn is_under(&self, ancestor: &StorePath) -> bool {
        self.0 == ancestor.0
            || (self.0.starts_with(&ancestor.0)
                && self.0.as_bytes().get(ancestor.0.len()) == Some(&b'/'))
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One batch of writes and deletes.
pub trait StoreTransaction: Send {
    fn write(&mut self, path: StorePath, value: StoreValue);

    /// Delete `path` and everything below it.
    fn delete(&mut self, path: StorePath);

    fn commit(self: Box<Self>) -> CommitFuture;
}

/// Store capability.
pub trait OperationalStore: Send + Sync {
    fn begin(&self) -> Box<dyn StoreTransaction>;
}

#[derive(Debug, Clone)]
enum StoreOp {
    Write(StorePath, StoreValue),
    Delete(StorePath),
}

#[derive(Default)]
struct MemoryInner {
    data: RwLock<BTreeMap<StorePath, StoreValue>>,
    commits: AtomicU64,
    failures: AtomicUsize,
}

/// In-process store, used by the standalone binary and by tests.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<MemoryInner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &StorePath) -> Option<StoreValue> {
        self.inner.data.read().get(path).cloned()
    }

    pub fn contains(&self, path: &StorePath) -> bool {
        self.inner.data.read().contains_key(path)
    }

    /// Paths at or below `prefix`, sorted.
    pub fn paths_under(&self, prefix: &StorePath) -> Vec<StorePath> {
        self.inner
            .data
            .read()
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.as_str().starts_with(prefix.as_str()))
            .filter(|(path, _)| path.is_under(prefix))
            .map(|(path, _)| path.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.data.read().is_empty()
    }

    /// Successful commits so far.
    pub fn commits(&self) -> u64 {
        self.inner.commits.load(Ordering::SeqCst)
    }

    /// Make the next `n` commits fail without applying anything.
    pub fn fail_next_commits(&self, n: usize) {
        self.inner.failures.store(n, Ordering::SeqCst);
    }
}

impl OperationalStore for InMemoryStore {
    fn begin(&self) -> Box<dyn StoreTransaction> {
        Box::new(InMemoryTransaction {
            inner: self.inner.clone(),
            ops: Vec::new(),
        })
    }
}

struct InMemoryTransaction {
    inner: Arc<MemoryInner>,
    ops: Vec<StoreOp>,
}

impl StoreTransaction for InMemoryTransaction {
    fn write(&mut self, path: StorePath, value: StoreValue) {
        self.ops.push(StoreOp::Write(path, value));
    }

    fn delete(&mut self, path: StorePath) {
        self.ops.push(StoreOp::Delete(path));
    }

    fn commit(self: Box<Self>) -> CommitFuture {
        let InMemoryTransaction { inner, ops } = *self;
        Box::pin(async move {
            let failing = inner
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(StoreError::CommitFailed("injected failure".into()));
            }

            let mut data = inner.data.write();
            for op in ops {
                match op {
                    StoreOp::Write(path, value) => {
                        data.insert(path, value);
                    }
                    StoreOp::Delete(path) => {
                        data.retain(|existing, _| !existing.is_under(&path));
                    }
                }
            }
            inner.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// Writes one device's state into the operational store.
#[derive(Clone)]
pub struct DeviceMirror {
    store: Arc<dyn OperationalStore>,
    datapath_id: DatapathId,
}

impl DeviceMirror {
    pub fn new(store: Arc<dyn OperationalStore>, datapath_id: DatapathId) -> Self {
        Self { store, datapath_id }
    }

    pub fn begin(&self) -> MirrorTransaction {
        MirrorTransaction {
            tx: self.store.begin(),
            datapath_id: self.datapath_id,
            ops: 0,
        }
    }
}

/// Typed wrapper over a store transaction for one device.
pub struct MirrorTransaction {
    tx: Box<dyn StoreTransaction>,
    datapath_id: DatapathId,
    ops: usize,
}

impl MirrorTransaction {
    pub fn write_node(&mut self, outcome: &HandshakeOutcome) {
        self.write(
            StorePath::node(self.datapath_id),
            json!({
                "id": self.datapath_id.node_id(),
                "datapath_id": self.datapath_id.to_string(),
                "version": outcome.version.to_string(),
                "n_tables": outcome.features.n_tables,
                "n_buffers": outcome.features.n_buffers,
                "capabilities": outcome.features.capabilities,
            }),
        );
    }

    pub fn delete_node(&mut self) {
        self.delete(StorePath::node(self.datapath_id));
    }

    pub fn write_flow(&mut self, key: &FlowRegistryKey, descriptor: &FlowDescriptor) {
        let value = json!({
            "id": descriptor.flow_id.0,
            "table_id": key.table_id,
            "priority": key.priority,
            "match": key.flow_match,
        });
        self.write(StorePath::flow(self.datapath_id, descriptor), value);
    }

    pub fn delete_flow(&mut self, descriptor: &FlowDescriptor) {
        self.delete(StorePath::flow(self.datapath_id, descriptor));
    }

    pub fn delete_all_flows(&mut self) {
        self.delete(StorePath::tables(self.datapath_id));
    }

    pub fn write_group(&mut self, group_id: GroupId) {
        self.write(
            StorePath::group(self.datapath_id, group_id),
            json!({ "group_id": group_id }),
        );
    }

    pub fn delete_group(&mut self, group_id: GroupId) {
        self.delete(StorePath::group(self.datapath_id, group_id));
    }

    pub fn delete_all_groups(&mut self) {
        self.delete(StorePath::groups(self.datapath_id));
    }

    pub fn write_meter(&mut self, meter_id: MeterId) {
        self.write(
            StorePath::meter(self.datapath_id, meter_id),
            json!({ "meter_id": meter_id }),
        );
    }

    pub fn delete_meter(&mut self, meter_id: MeterId) {
        self.delete(StorePath::meter(self.datapath_id, meter_id));
    }

    pub fn delete_all_meters(&mut self) {
        self.delete(StorePath::meters(self.datapath_id));
    }

    pub fn write_port(&mut self, desc: &PortDesc) {
        let value = json!({
            "port_no": desc.port_no,
            "name": desc.name,
            "hw_addr": desc.hw_addr,
            "config": desc.config,
            "state": desc.state,
            "link_down": desc.is_link_down(),
        });
        self.write(StorePath::port(self.datapath_id, desc.port_no), value);
    }

    pub fn delete_port(&mut self, port_no: u32) {
        self.delete(StorePath::port(self.datapath_id, port_no));
    }

    fn write(&mut self, path: StorePath, value: StoreValue) {
        self.ops += 1;
        self.tx.write(path, value);
    }

    fn delete(&mut self, path: StorePath) {
        self.ops += 1;
        self.tx.delete(path);
    }

    pub fn is_empty(&self) -> bool {
        self.ops == 0
    }

    /// Commit; failures are logged and reported as `false`.
    pub async fn submit(self) -> bool {
        if self.ops == 0 {
            return true;
        }
        let ops = self.ops;
        let datapath_id = self.datapath_id;
        match self.tx.commit().await {
            Ok(()) => {
                debug!("Mirrored {} operations for {}", ops, datapath_id);
                true
            }
            Err(e) => {
                warn!("Operational store commit for {} failed: {}", datapath_id, e);
                false
            }
        }
    }
}
