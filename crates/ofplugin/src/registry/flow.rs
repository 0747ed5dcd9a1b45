// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Flow registry.

use super::CommonDeviceRegistry;
use crate::protocol::{FlowMatch, FlowMod, FlowStats};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Prefix of ids generated for flows the controller did not install.
pub const ALIEN_FLOW_ID_PREFIX: &str = "#UF$TABLE*";

/// Structural flow identity on a switch: table, priority and match.
///
/// The match is normalized on construction, so keys built from equivalent
/// matches hash and compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowRegistryKey {
    pub table_id: u8,
    pub priority: u16,
    pub flow_match: FlowMatch,
}

impl FlowRegistryKey {
    pub fn new(table_id: u8, priority: u16, flow_match: &FlowMatch) -> Self {
        Self {
            table_id,
            priority,
            flow_match: flow_match.normalized(),
        }
    }

    pub fn from_flow_mod(flow: &FlowMod) -> Self {
        Self::new(flow.table_id, flow.priority, &flow.flow_match)
    }

    pub fn from_stats(stats: &FlowStats) -> Self {
        Self::new(stats.table_id, stats.priority, &stats.flow_match)
    }
}

/// Datastore flow id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowId(pub String);

impl FlowId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Whether the id was generated for an unknown flow.
    pub fn is_alien(&self) -> bool {
        self.0.starts_with(ALIEN_FLOW_ID_PREFIX)
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Datastore identity correlated with a device-local flow key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowDescriptor {
    pub table_id: u8,
    pub flow_id: FlowId,
}

impl FlowDescriptor {
    pub fn new(table_id: u8, flow_id: FlowId) -> Self {
        Self { table_id, flow_id }
    }
}

/// Registry of flows believed installed on one device.
pub struct DeviceFlowRegistry {
    flows: CommonDeviceRegistry<FlowRegistryKey, FlowDescriptor>,
    alien_counter: AtomicU64,
}

impl DeviceFlowRegistry {
    pub fn new() -> Self {
        Self {
            flows: CommonDeviceRegistry::new(),
            alien_counter: AtomicU64::new(0),
        }
    }

    /// Store `key` with a known descriptor (last store wins).
    pub fn store_descriptor(&self, key: FlowRegistryKey, descriptor: FlowDescriptor) {
        self.flows.store_value(key, descriptor);
    }

    /// Store `key`, keeping an existing descriptor or generating an alien id.
    ///
    /// Returns the descriptor in effect afterwards.
    pub fn store(&self, key: FlowRegistryKey) -> FlowDescriptor {
        let table_id = key.table_id;
        self.flows.store_with(key, |existing| match existing {
            Some(descriptor) => descriptor.clone(),
            None => FlowDescriptor::new(table_id, self.next_alien_id(table_id)),
        })
    }

    fn next_alien_id(&self, table_id: u8) -> FlowId {
        let n = self.alien_counter.fetch_add(1, Ordering::Relaxed);
        FlowId(format!("{}{}-{}", ALIEN_FLOW_ID_PREFIX, table_id, n))
    }

    pub fn retrieve_descriptor(&self, key: &FlowRegistryKey) -> Option<FlowDescriptor> {
        self.flows.get(key)
    }

    pub fn add_mark(&self, key: FlowRegistryKey) {
        self.flows.add_mark(key);
    }

    pub fn has_mark(&self, key: &FlowRegistryKey) -> bool {
        self.flows.has_mark(key)
    }

    pub fn process_marks(&self) -> Vec<FlowRegistryKey> {
        self.flows.process_marks()
    }

    /// Drop one flow without sweeping the other marks.
    pub fn remove(&self, key: &FlowRegistryKey) -> Option<FlowDescriptor> {
        self.flows.remove(key)
    }

    pub fn for_each<F>(&self, visitor: F)
    where
        F: FnMut(&FlowRegistryKey, &FlowDescriptor),
    {
        self.flows.for_each(visitor);
    }

    pub fn snapshot(&self) -> Vec<(FlowRegistryKey, FlowDescriptor)> {
        self.flows.snapshot()
    }

    pub fn size(&self) -> usize {
        self.flows.size()
    }

    pub fn close(&self) {
        self.flows.close();
    }
}

impl Default for DeviceFlowRegistry {
    fn default() -> Self {
        Self::new()
    }
}
