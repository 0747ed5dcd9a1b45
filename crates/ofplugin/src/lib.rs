// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! OpenFlow southbound controller plugin.
//!
//! Accepts switch connections, negotiates the protocol version, learns the
//! datapath id, tracks this controller's role for each device and keeps
//! per-device registries of flows, groups, meters and ports consistent with
//! what the switch reports.
//!
//! # Features
//!
//! - **Handshake**: version-bitmap or step-wise hello negotiation, features exchange
//! - **Request correlation**: per-connection transaction ids, deadlines, multipart assembly
//! - **Roles**: MASTER/SLAVE tracking driven by a pluggable ownership service
//! - **Registries**: mark/sweep flow, group and meter registries with a bounded history
//! - **Connection management**: one live context per datapath id, admission control
//!
//! # Quick Start
//!
//! ```bash
//! # Listen on the default port (6653) with a single-node ownership service
//! ofplugin run
//!
//! # Print a default configuration, then run with it
//! ofplugin gen-config > ofplugin.toml
//! ofplugin --config ofplugin.toml run
//! ```
//!
//! # Configuration File
//!
//! ```toml
//! bind_address = "0.0.0.0"
//! port = 6653
//! supported_versions = [4, 1]
//! request_timeout_ms = 10000
//! role_wait_timeout_secs = 10
//! device_connection_hold_time_ms = 0
//! ```

pub mod admission;
pub mod codec;
pub mod config;
pub mod connection;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod handshake;
pub mod manager;
pub mod ownership;
pub mod pending;
pub mod protocol;
pub mod registry;
pub mod role;
pub mod server;
pub mod stats;
pub mod store;
pub mod tls;
pub mod xid;

pub use admission::{AdmissionControl, Refusal};
pub use codec::{CodecError, JsonCodec, MessageCodec};
pub use config::{ConfigError, PluginConfig};
pub use connection::{ConnectionError, TransportEnd, TransportHandle};
pub use device::{
    ConnectionId, ConnectionState, DeviceConnectionContext, DeviceNotification, DeviceServices,
    DeviceSettings, ReconcileSummary,
};
pub use dispatch::{DispatchTable, InboundRoute};
pub use error::{CancelCause, HandshakeError, PluginError, RequestError};
pub use handshake::{HandshakeOutcome, HandshakeState, HandshakeStateMachine};
pub use manager::ConnectionManager;
pub use ownership::{
    EntityId, LocalOwnershipService, MockOwnershipService, OwnershipError, OwnershipService, Role,
};
pub use pending::{CompletionOutcome, PendingRequestTable, Reply, RequestHandle, RequestResult};
pub use protocol::{DatapathId, MessageBody, MessageKind, OfMessage, OfVersion, Xid};
pub use registry::{
    DeviceFlowRegistry, DeviceGroupRegistry, DeviceMeterRegistry, FlowDescriptor,
    FlowGroupHistory, FlowId, FlowRegistryKey, PortStatusRegistry,
};
pub use role::{RoleContext, RoleState};
pub use server::{OpenFlowServer, ServerError};
pub use stats::{ConnectionStatsSnapshot, MessageSpy, MessageSpySnapshot};
pub use store::{InMemoryStore, OperationalStore, StorePath};
pub use tls::TlsError;
pub use xid::TransactionIdAllocator;
