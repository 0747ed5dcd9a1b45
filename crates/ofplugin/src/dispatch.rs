// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Inbound/outbound routing table keyed by (version, message kind).

use crate::protocol::{MessageKind, OfVersion};
use std::collections::{HashMap, HashSet};

/// Where an inbound message goes once the session is established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundRoute {
    Handshake,
    Echo,
    /// Single reply correlated by xid.
    Reply,
    /// Multipart fragment correlated by xid.
    MultipartFragment,
    /// Error reply correlated by xid.
    DeviceError,
    PortStatus,
    FlowRemoved,
    PacketIn,
    Experimenter,
}

/// Routing table built once per process and shared by every connection.
#[derive(Debug, Clone, Default)]
pub struct DispatchTable {
    inbound: HashMap<(OfVersion, MessageKind), InboundRoute>,
    outbound: HashSet<(OfVersion, MessageKind)>,
}

impl DispatchTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Standard table for the given versions.
    pub fn standard(versions: &[OfVersion]) -> Self {
        let mut table = Self::new();
        for &version in versions {
            table.register_inbound(version, MessageKind::Hello, InboundRoute::Handshake);
            table.register_inbound(version, MessageKind::FeaturesReply, InboundRoute::Reply);
            table.register_inbound(version, MessageKind::EchoRequest, InboundRoute::Echo);
            table.register_inbound(version, MessageKind::EchoReply, InboundRoute::Reply);
            table.register_inbound(version, MessageKind::BarrierReply, InboundRoute::Reply);
            table.register_inbound(version, MessageKind::Error, InboundRoute::DeviceError);
            table.register_inbound(
                version,
                MessageKind::MultipartReply,
                InboundRoute::MultipartFragment,
            );
            table.register_inbound(version, MessageKind::PortStatus, InboundRoute::PortStatus);
            table.register_inbound(version, MessageKind::FlowRemoved, InboundRoute::FlowRemoved);
            table.register_inbound(version, MessageKind::PacketIn, InboundRoute::PacketIn);
            table.register_inbound(
                version,
                MessageKind::Experimenter,
                InboundRoute::Experimenter,
            );

            for kind in [
                MessageKind::Hello,
                MessageKind::EchoRequest,
                MessageKind::EchoReply,
                MessageKind::FeaturesRequest,
                MessageKind::FlowMod,
                MessageKind::MultipartRequest,
                MessageKind::BarrierRequest,
                MessageKind::Experimenter,
            ] {
                table.register_outbound(version, kind);
            }
            // Role messages appeared in 1.2
            if version >= OfVersion::V1_2 {
                table.register_inbound(version, MessageKind::RoleReply, InboundRoute::Reply);
                table.register_outbound(version, MessageKind::RoleRequest);
            }
            if version.has_groups_and_meters() {
                table.register_outbound(version, MessageKind::GroupMod);
                table.register_outbound(version, MessageKind::MeterMod);
            }
        }
        table
    }

    pub fn register_inbound(&mut self, version: OfVersion, kind: MessageKind, route: InboundRoute) {
        self.inbound.insert((version, kind), route);
    }

    pub fn register_outbound(&mut self, version: OfVersion, kind: MessageKind) {
        self.outbound.insert((version, kind));
    }

    /// Route for an inbound message, `None` if unsupported.
    pub fn route(&self, version: OfVersion, kind: MessageKind) -> Option<InboundRoute> {
        self.inbound.get(&(version, kind)).copied()
    }

    /// Whether the controller may send `kind` on a `version` session.
    pub fn can_send(&self, version: OfVersion, kind: MessageKind) -> bool {
        self.outbound.contains(&(version, kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_routes() {
        let table = DispatchTable::standard(&[OfVersion::V1_0, OfVersion::V1_3]);
        assert_eq!(
            table.route(OfVersion::V1_3, MessageKind::MultipartReply),
            Some(InboundRoute::MultipartFragment)
        );
        assert_eq!(
            table.route(OfVersion::V1_0, MessageKind::PortStatus),
            Some(InboundRoute::PortStatus)
        );
        assert_eq!(table.route(OfVersion::V1_4, MessageKind::PortStatus), None);
        // Requests are never expected inbound
        assert_eq!(table.route(OfVersion::V1_3, MessageKind::FlowMod), None);
    }

    #[test]
    fn test_groups_and_meters_not_on_1_0() {
        let table = DispatchTable::standard(&[OfVersion::V1_0, OfVersion::V1_3]);
        assert!(!table.can_send(OfVersion::V1_0, MessageKind::GroupMod));
        assert!(!table.can_send(OfVersion::V1_0, MessageKind::MeterMod));
        assert!(table.can_send(OfVersion::V1_0, MessageKind::FlowMod));
        assert!(table.can_send(OfVersion::V1_3, MessageKind::GroupMod));
        assert!(!table.can_send(OfVersion::V1_0, MessageKind::RoleRequest));
        assert!(table.can_send(OfVersion::V1_3, MessageKind::RoleRequest));
    }
}
