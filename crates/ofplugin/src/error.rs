// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types shared across the plugin.
//!
//! Callers issuing control-plane requests only ever see [`RequestError`]:
//! transport and codec failures are folded into [`RequestError::Cancelled`]
//! before they reach them.

use crate::protocol::{MessageKind, OfVersion, Xid};
use std::fmt;
use thiserror::Error;

/// Why a pending request was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelCause {
    /// Transport closed by the device or the network.
    DeviceDisconnected,
    /// A newer connection for the same datapath replaced this one.
    Superseded,
    /// The handshake failed before the session was usable.
    HandshakeFailed,
    /// The controller is shutting down.
    Shutdown,
    /// The caller gave up on the request.
    CallerCancelled,
    /// Admission control turned the device away.
    Refused,
}

impl fmt::Display for CancelCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceDisconnected => write!(f, "device disconnected"),
            Self::Superseded => write!(f, "superseded by a newer connection"),
            Self::HandshakeFailed => write!(f, "handshake failed"),
            Self::Shutdown => write!(f, "controller shutdown"),
            Self::CallerCancelled => write!(f, "cancelled by caller"),
            Self::Refused => write!(f, "connection refused"),
        }
    }
}

/// Outcome of a request sent to a device.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    /// This controller instance is not master for the device.
    #[error("not master for this device")]
    NotMaster,

    /// No reply arrived before the request deadline.
    #[error("request timed out")]
    Timeout,

    /// The session has not finished its handshake yet.
    #[error("device session not established")]
    NotEstablished,

    /// The device context was torn down; do not retry.
    #[error("request cancelled: {0}")]
    Cancelled(CancelCause),

    /// The transaction id was already pending (allocator bug).
    #[error("duplicate transaction id {0}")]
    DuplicateTransactionId(Xid),

    /// The device answered with an OpenFlow error message.
    #[error("device rejected request (type {err_type}, code {code})")]
    Rejected { err_type: u16, code: u16 },

    /// The negotiated version has no such message.
    #[error("{kind:?} is not supported by OpenFlow {version}")]
    Unsupported { kind: MessageKind, version: OfVersion },
}

impl RequestError {
    /// Whether a caller may reasonably retry the request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

/// Handshake failures. Fatal to the connection only.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("no common version found (device advertised {device})")]
    NoCommonVersion { device: String },

    #[error("version negotiation stalled at OpenFlow {0}")]
    Stalled(OfVersion),

    #[error("unexpected {kind:?} in handshake state {state}")]
    UnexpectedMessage { kind: MessageKind, state: String },

    #[error("features reply carried no datapath id")]
    MissingDatapathId,

    #[error("features reply xid {got} does not match request xid {expected}")]
    XidMismatch { expected: Xid, got: Xid },
}

/// Process-level errors surfaced by the connection manager.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("handshake failed: {0}")]
    HandshakeFailed(#[from] HandshakeError),

    #[error("connection refused: {0}")]
    Refused(String),

    #[error("no tokio runtime available")]
    NoRuntime,

    #[error("unknown connection {0}")]
    UnknownConnection(u64),

    #[error("outbound queue closed")]
    OutboundClosed,

    #[error("outbound queue full")]
    OutboundFull,
}
