// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Port status registry.

use super::CommonDeviceRegistry;
use crate::protocol::{PortDesc, PortReason};

/// Effect of one port status message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortChange {
    Updated(PortDesc),
    Removed(u32),
    /// Delete for a port the registry never saw.
    Ignored(u32),
}

/// Ports reported by one device, keyed by port number.
#[derive(Default)]
pub struct PortStatusRegistry {
    ports: CommonDeviceRegistry<u32, PortDesc>,
}

impl PortStatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a port status message.
    pub fn apply(&self, reason: PortReason, desc: PortDesc) -> PortChange {
        match reason {
            PortReason::Add | PortReason::Modify => {
                self.ports.store_value(desc.port_no, desc.clone());
                PortChange::Updated(desc)
            }
            PortReason::Delete => {
                self.ports.add_mark(desc.port_no);
                if self.ports.process_marks().contains(&desc.port_no) {
                    PortChange::Removed(desc.port_no)
                } else {
                    PortChange::Ignored(desc.port_no)
                }
            }
        }
    }

    pub fn get(&self, port_no: u32) -> Option<PortDesc> {
        self.ports.get(&port_no)
    }

    /// Ports sorted by number.
    pub fn ports(&self) -> Vec<PortDesc> {
        let mut ports: Vec<PortDesc> = self.ports.snapshot().into_iter().map(|(_, d)| d).collect();
        ports.sort_by_key(|p| p.port_no);
        ports
    }

    pub fn size(&self) -> usize {
        self.ports.size()
    }

    pub fn close(&self) {
        self.ports.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(port_no: u32, state: u32) -> PortDesc {
        PortDesc {
            port_no,
            name: format!("eth{}", port_no),
            hw_addr: "00:00:00:00:00:01".into(),
            config: 0,
            state,
        }
    }

    #[test]
    fn test_add_modify_delete() {
        let registry = PortStatusRegistry::new();
        registry.apply(PortReason::Add, port(2, 0));
        registry.apply(PortReason::Add, port(1, 0));
        registry.apply(PortReason::Modify, port(1, PortDesc::STATE_LINK_DOWN));

        let ports = registry.ports();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].port_no, 1);
        assert!(ports[0].is_link_down());

        assert_eq!(registry.apply(PortReason::Delete, port(1, 0)), PortChange::Removed(1));
        assert_eq!(registry.apply(PortReason::Delete, port(9, 0)), PortChange::Ignored(9));
        assert_eq!(registry.size(), 1);
        assert!(registry.get(2).is_some());
    }
}
