// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! OpenFlow message model.
//!
//! Messages are typed values with an extractable transaction id and kind
//! tag. Byte layouts belong to the codec (see [`crate::codec`]); this module
//! only carries the fields the controller core reasons about.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Per-connection transaction id.
pub type Xid = u32;

/// OpenFlow protocol version (wire value).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OfVersion(pub u8);

impl OfVersion {
    pub const V1_0: OfVersion = OfVersion(0x01);
    pub const V1_1: OfVersion = OfVersion(0x02);
    pub const V1_2: OfVersion = OfVersion(0x03);
    pub const V1_3: OfVersion = OfVersion(0x04);
    pub const V1_4: OfVersion = OfVersion(0x05);
    pub const V1_5: OfVersion = OfVersion(0x06);

    /// Whether this is a version the message model knows about.
    pub fn is_known(self) -> bool {
        (0x01..=0x06).contains(&self.0)
    }

    /// Group and meter tables appeared after 1.0.
    pub fn has_groups_and_meters(self) -> bool {
        self.0 >= Self::V1_3.0
    }
}

impl fmt::Display for OfVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            0x01..=0x06 => write!(f, "1.{}", self.0 - 1),
            other => write!(f, "0x{:02x}", other),
        }
    }
}

/// Version bitmap carried in the hello "versionbitmap" element.
///
/// Bit `n` is set when wire version `n` is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionBitmap(pub u32);

impl VersionBitmap {
    pub fn from_versions(versions: &[OfVersion]) -> Self {
        let bits = versions
            .iter()
            .filter(|v| v.0 < 32)
            .fold(0u32, |acc, v| acc | (1 << v.0));
        Self(bits)
    }

    pub fn contains(&self, version: OfVersion) -> bool {
        version.0 < 32 && self.0 & (1 << version.0) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Highest version present in the bitmap.
    pub fn highest(&self) -> Option<OfVersion> {
        if self.0 == 0 {
            None
        } else {
            Some(OfVersion(31 - self.0.leading_zeros() as u8))
        }
    }

    /// Highest version present in both bitmaps.
    pub fn highest_common(&self, other: &VersionBitmap) -> Option<OfVersion> {
        VersionBitmap(self.0 & other.0).highest()
    }

    /// Versions in ascending order.
    pub fn versions(&self) -> Vec<OfVersion> {
        (0..32u8)
            .filter(|bit| self.0 & (1 << bit) != 0)
            .map(OfVersion)
            .collect()
    }
}

impl fmt::Display for VersionBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.versions().iter().map(|v| v.to_string()).collect();
        write!(f, "{{{}}}", names.join(","))
    }
}

/// Switch datapath identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatapathId(pub u64);

impl DatapathId {
    /// Inventory node id, e.g. `openflow:1`.
    pub fn node_id(&self) -> String {
        format!("openflow:{}", self.0)
    }
}

impl fmt::Display for DatapathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

/// Message type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageKind {
    Hello,
    Error,
    EchoRequest,
    EchoReply,
    Experimenter,
    FeaturesRequest,
    FeaturesReply,
    PacketIn,
    FlowRemoved,
    PortStatus,
    FlowMod,
    GroupMod,
    MeterMod,
    MultipartRequest,
    MultipartReply,
    BarrierRequest,
    BarrierReply,
    RoleRequest,
    RoleReply,
}

impl MessageKind {
    pub const ALL: [MessageKind; 19] = [
        MessageKind::Hello,
        MessageKind::Error,
        MessageKind::EchoRequest,
        MessageKind::EchoReply,
        MessageKind::Experimenter,
        MessageKind::FeaturesRequest,
        MessageKind::FeaturesReply,
        MessageKind::PacketIn,
        MessageKind::FlowRemoved,
        MessageKind::PortStatus,
        MessageKind::FlowMod,
        MessageKind::GroupMod,
        MessageKind::MeterMod,
        MessageKind::MultipartRequest,
        MessageKind::MultipartReply,
        MessageKind::BarrierRequest,
        MessageKind::BarrierReply,
        MessageKind::RoleRequest,
        MessageKind::RoleReply,
    ];

    /// Modifications of device state that require mastership.
    pub fn is_control_write(self) -> bool {
        matches!(self, Self::FlowMod | Self::GroupMod | Self::MeterMod)
    }
}

/// Match field names understood by the flow registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchField {
    InPort,
    Metadata,
    EthSrc,
    EthDst,
    EthType,
    VlanVid,
    VlanPcp,
    IpProto,
    IpDscp,
    Ipv4Src,
    Ipv4Dst,
    Ipv6Src,
    Ipv6Dst,
    TcpSrc,
    TcpDst,
    UdpSrc,
    UdpDst,
    ArpSha,
    ArpTha,
    TunnelId,
}

/// Flow match: field name to textual value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowMatch {
    pub fields: BTreeMap<MatchField, String>,
}

impl FlowMatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field insertion.
    pub fn with(mut self, field: MatchField, value: impl Into<String>) -> Self {
        self.fields.insert(field, value.into());
        self
    }

    /// Canonical form used for registry keys.
    ///
    /// MAC addresses are lower-cased and host prefixes (`/32`, `/128`) are
    /// dropped so that switch-reported matches compare equal to the ones the
    /// controller sent.
    pub fn normalized(&self) -> Self {
        let fields = self
            .fields
            .iter()
            .map(|(field, value)| {
                let value = value.trim();
                let value = match field {
                    MatchField::EthSrc
                    | MatchField::EthDst
                    | MatchField::ArpSha
                    | MatchField::ArpTha => value.to_ascii_lowercase(),
                    MatchField::Ipv4Src | MatchField::Ipv4Dst => {
                        value.strip_suffix("/32").unwrap_or(value).to_string()
                    }
                    MatchField::Ipv6Src | MatchField::Ipv6Dst => value
                        .strip_suffix("/128")
                        .unwrap_or(value)
                        .to_ascii_lowercase(),
                    _ => value.to_string(),
                };
                (*field, value)
            })
            .collect();
        Self { fields }
    }
}

/// Modification command shared by flow, group and meter mods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModCommand {
    Add,
    Modify,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowMod {
    pub command: ModCommand,
    pub table_id: u8,
    pub priority: u16,
    pub flow_match: FlowMatch,
    #[serde(default)]
    pub cookie: u64,
    /// Encoded instruction list, opaque to the core.
    #[serde(default)]
    pub instructions: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupType {
    All,
    Select,
    Indirect,
    FastFailover,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMod {
    pub command: ModCommand,
    pub group_id: u32,
    pub group_type: GroupType,
    #[serde(default)]
    pub buckets: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterMod {
    pub command: ModCommand,
    pub meter_id: u32,
    #[serde(default)]
    pub flags: u16,
    #[serde(default)]
    pub bands: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchFeatures {
    pub datapath_id: u64,
    pub n_buffers: u32,
    pub n_tables: u8,
    #[serde(default)]
    pub auxiliary_id: u8,
    #[serde(default)]
    pub capabilities: u32,
}

/// Port description as reported by the switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDesc {
    pub port_no: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub hw_addr: String,
    #[serde(default)]
    pub config: u32,
    #[serde(default)]
    pub state: u32,
}

impl PortDesc {
    /// OFPPS_LINK_DOWN
    pub const STATE_LINK_DOWN: u32 = 1;

    pub fn is_link_down(&self) -> bool {
        self.state & Self::STATE_LINK_DOWN != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortReason {
    Add,
    Delete,
    Modify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultipartKind {
    Flow,
    GroupDesc,
    MeterConfig,
    PortDesc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowStats {
    pub table_id: u8,
    pub priority: u16,
    pub flow_match: FlowMatch,
    #[serde(default)]
    pub cookie: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDesc {
    pub group_id: u32,
    pub group_type: GroupType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterConfig {
    pub meter_id: u32,
    #[serde(default)]
    pub flags: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "entries", rename_all = "snake_case")]
pub enum MultipartBody {
    Flows(Vec<FlowStats>),
    Groups(Vec<GroupDesc>),
    Meters(Vec<MeterConfig>),
    Ports(Vec<PortDesc>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerRole {
    NoChange,
    Equal,
    Master,
    Slave,
}

/// Message payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    Hello {
        #[serde(default)]
        bitmap: Option<VersionBitmap>,
    },
    Error {
        err_type: u16,
        code: u16,
        #[serde(default)]
        data: Vec<u8>,
    },
    EchoRequest {
        #[serde(default)]
        data: Vec<u8>,
    },
    EchoReply {
        #[serde(default)]
        data: Vec<u8>,
    },
    Experimenter {
        experimenter: u32,
        exp_type: u32,
        #[serde(default)]
        data: Vec<u8>,
    },
    FeaturesRequest,
    FeaturesReply(SwitchFeatures),
    PacketIn {
        buffer_id: u32,
        table_id: u8,
        reason: u8,
        #[serde(default)]
        cookie: u64,
        #[serde(default)]
        data: Vec<u8>,
    },
    FlowRemoved {
        table_id: u8,
        priority: u16,
        flow_match: FlowMatch,
        #[serde(default)]
        cookie: u64,
        reason: u8,
    },
    PortStatus {
        reason: PortReason,
        desc: PortDesc,
    },
    FlowMod(FlowMod),
    GroupMod(GroupMod),
    MeterMod(MeterMod),
    MultipartRequest {
        kind: MultipartKind,
    },
    MultipartReply {
        #[serde(default)]
        more: bool,
        body: MultipartBody,
    },
    BarrierRequest,
    BarrierReply,
    RoleRequest {
        role: ControllerRole,
        generation_id: u64,
    },
    RoleReply {
        role: ControllerRole,
        generation_id: u64,
    },
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Hello { .. } => MessageKind::Hello,
            Self::Error { .. } => MessageKind::Error,
            Self::EchoRequest { .. } => MessageKind::EchoRequest,
            Self::EchoReply { .. } => MessageKind::EchoReply,
            Self::Experimenter { .. } => MessageKind::Experimenter,
            Self::FeaturesRequest => MessageKind::FeaturesRequest,
            Self::FeaturesReply(_) => MessageKind::FeaturesReply,
            Self::PacketIn { .. } => MessageKind::PacketIn,
            Self::FlowRemoved { .. } => MessageKind::FlowRemoved,
            Self::PortStatus { .. } => MessageKind::PortStatus,
            Self::FlowMod(_) => MessageKind::FlowMod,
            Self::GroupMod(_) => MessageKind::GroupMod,
            Self::MeterMod(_) => MessageKind::MeterMod,
            Self::MultipartRequest { .. } => MessageKind::MultipartRequest,
            Self::MultipartReply { .. } => MessageKind::MultipartReply,
            Self::BarrierRequest => MessageKind::BarrierRequest,
            Self::BarrierReply => MessageKind::BarrierReply,
            Self::RoleRequest { .. } => MessageKind::RoleRequest,
            Self::RoleReply { .. } => MessageKind::RoleReply,
        }
    }
}

/// A complete OpenFlow message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfMessage {
    pub version: OfVersion,
    pub xid: Xid,
    pub body: MessageBody,
}

impl OfMessage {
    pub fn new(version: OfVersion, xid: Xid, body: MessageBody) -> Self {
        Self { version, xid, body }
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    pub fn hello(version: OfVersion, xid: Xid, bitmap: Option<VersionBitmap>) -> Self {
        Self::new(version, xid, MessageBody::Hello { bitmap })
    }

    /// True for multipart fragments announcing more to come.
    pub fn has_more(&self) -> bool {
        matches!(self.body, MessageBody::MultipartReply { more: true, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_display() {
        assert_eq!(OfVersion::V1_0.to_string(), "1.0");
        assert_eq!(OfVersion::V1_3.to_string(), "1.3");
        assert_eq!(OfVersion(0x2a).to_string(), "0x2a");
    }

    #[test]
    fn test_bitmap_highest_common() {
        let controller = VersionBitmap::from_versions(&[OfVersion::V1_0, OfVersion::V1_3]);
        let device = VersionBitmap::from_versions(&[OfVersion::V1_3, OfVersion::V1_4]);
        assert_eq!(controller.highest_common(&device), Some(OfVersion::V1_3));
        assert_eq!(device.highest(), Some(OfVersion::V1_4));

        let disjoint = VersionBitmap::from_versions(&[OfVersion::V1_4]);
        assert_eq!(controller.highest_common(&disjoint), None);
    }

    #[test]
    fn test_bitmap_versions_ascending() {
        let bitmap = VersionBitmap::from_versions(&[OfVersion::V1_4, OfVersion::V1_0]);
        assert_eq!(bitmap.versions(), vec![OfVersion::V1_0, OfVersion::V1_4]);
        assert_eq!(bitmap.to_string(), "{1.0,1.4}");
        assert!(VersionBitmap::default().is_empty());
    }

    #[test]
    fn test_match_normalization() {
        let a = FlowMatch::new()
            .with(MatchField::EthSrc, "AA:BB:CC:00:11:22")
            .with(MatchField::Ipv4Dst, "10.0.0.1/32");
        let b = FlowMatch::new()
            .with(MatchField::Ipv4Dst, "10.0.0.1")
            .with(MatchField::EthSrc, "aa:bb:cc:00:11:22");
        assert_ne!(a, b);
        assert_eq!(a.normalized(), b.normalized());
    }

    #[test]
    fn test_message_kind() {
        let msg = OfMessage::hello(OfVersion::V1_3, 1, None);
        assert_eq!(msg.kind(), MessageKind::Hello);
        assert!(MessageKind::FlowMod.is_control_write());
        assert!(!MessageKind::MultipartRequest.is_control_write());
    }

    #[test]
    fn test_datapath_id_formats() {
        let dpid = DatapathId(1);
        assert_eq!(dpid.node_id(), "openflow:1");
        assert_eq!(dpid.to_string(), "0x0000000000000001");
    }
}
