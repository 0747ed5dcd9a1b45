// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Version negotiation and feature discovery for one connection.
//!
//! The state machine does no I/O. It consumes inbound messages and returns
//! the actions the connection should take, which keeps it testable without
//! a socket.
//!
//! ```text
//! AwaitingHello -> VersionNegotiating -> FeaturesRequesting -> Established
//!        \________________\____________________\______________-> Failed
//! ```

use crate::error::HandshakeError;
use crate::protocol::{
    DatapathId, MessageBody, MessageKind, OfMessage, OfVersion, SwitchFeatures, VersionBitmap,
    Xid,
};
use crate::xid::TransactionIdAllocator;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingHello,
    VersionNegotiating,
    FeaturesRequesting,
    Established,
    Failed,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AwaitingHello => "AWAITING_HELLO",
            Self::VersionNegotiating => "VERSION_NEGOTIATING",
            Self::FeaturesRequesting => "FEATURES_REQUESTING",
            Self::Established => "ESTABLISHED",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Outcome of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeOutcome {
    pub version: OfVersion,
    pub datapath_id: DatapathId,
    pub features: SwitchFeatures,
}

/// What the connection must do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeAction {
    Send(OfMessage),
    Established(HandshakeOutcome),
    Failed(HandshakeError),
}

pub struct HandshakeStateMachine {
    state: HandshakeState,
    /// Supported versions, highest first.
    supported: Vec<OfVersion>,
    bitmap: VersionBitmap,
    use_bitmap: bool,
    xids: Arc<TransactionIdAllocator>,
    hello_sent: bool,
    last_proposed: OfVersion,
    last_received: Option<OfVersion>,
    version: Option<OfVersion>,
    features_xid: Option<Xid>,
}

impl HandshakeStateMachine {
    /// `supported` must not be empty (configuration validation guarantees it).
    pub fn new(
        supported: &[OfVersion],
        use_bitmap: bool,
        xids: Arc<TransactionIdAllocator>,
    ) -> Self {
        let mut supported = supported.to_vec();
        supported.sort_unstable_by(|a, b| b.cmp(a));
        supported.dedup();
        let highest = supported.first().copied().unwrap_or(OfVersion::V1_3);

        Self {
            state: HandshakeState::AwaitingHello,
            bitmap: VersionBitmap::from_versions(&supported),
            supported,
            use_bitmap,
            xids,
            hello_sent: false,
            last_proposed: highest,
            last_received: None,
            version: None,
            features_xid: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Negotiated version, once settled.
    pub fn version(&self) -> Option<OfVersion> {
        self.version
    }

    pub fn is_established(&self) -> bool {
        self.state == HandshakeState::Established
    }

    pub fn is_failed(&self) -> bool {
        self.state == HandshakeState::Failed
    }

    /// Send the controller hello. Calling it again has no effect.
    pub fn start(&mut self) -> Vec<HandshakeAction> {
        if self.hello_sent || self.state != HandshakeState::AwaitingHello {
            return Vec::new();
        }
        vec![self.send_hello(self.last_proposed)]
    }

    /// Feed one inbound message.
    pub fn handle(&mut self, msg: &OfMessage) -> Vec<HandshakeAction> {
        match self.state {
            HandshakeState::Established | HandshakeState::Failed => return Vec::new(),
            _ => {}
        }

        match &msg.body {
            MessageBody::Hello { bitmap } => self.on_hello(msg.version, *bitmap),
            MessageBody::FeaturesReply(features) => self.on_features_reply(msg.xid, features),
            _ => self.fail(HandshakeError::UnexpectedMessage {
                kind: msg.kind(),
                state: self.state.to_string(),
            }),
        }
    }

    fn on_hello(
        &mut self,
        remote: OfVersion,
        remote_bitmap: Option<VersionBitmap>,
    ) -> Vec<HandshakeAction> {
        if self.version.is_some() {
            debug!("Hello from device after version settled, ignoring");
            return Vec::new();
        }

        if self.use_bitmap {
            if let Some(remote_bitmap) = remote_bitmap.filter(|b| !b.is_empty()) {
                return match self.bitmap.highest_common(&remote_bitmap) {
                    Some(version) => self.settle(version),
                    None => self.fail(HandshakeError::NoCommonVersion {
                        device: remote_bitmap.to_string(),
                    }),
                };
            }
        }

        self.negotiate_stepwise(remote)
    }

    fn negotiate_stepwise(&mut self, remote: OfVersion) -> Vec<HandshakeAction> {
        if remote >= self.last_proposed {
            // The device speaks at least what we proposed; the lower wins.
            return self.settle(self.last_proposed);
        }

        if self.last_received == Some(remote) {
            return self.fail(HandshakeError::Stalled(remote));
        }
        self.last_received = Some(remote);

        let proposal = match self.supported.iter().copied().find(|v| *v <= remote) {
            Some(version) => version,
            None => {
                return self.fail(HandshakeError::NoCommonVersion {
                    device: remote.to_string(),
                })
            }
        };

        if proposal == remote {
            return self.settle(remote);
        }

        debug!("Device offered {}, proposing {}", remote, proposal);
        self.state = HandshakeState::VersionNegotiating;
        self.last_proposed = proposal;
        vec![self.send_hello(proposal)]
    }

    fn settle(&mut self, version: OfVersion) -> Vec<HandshakeAction> {
        self.version = Some(version);

        let mut actions = Vec::with_capacity(2);
        if !self.hello_sent {
            actions.push(self.send_hello(version));
        }

        let xid = self.xids.next();
        self.features_xid = Some(xid);
        actions.push(HandshakeAction::Send(OfMessage::new(
            version,
            xid,
            MessageBody::FeaturesRequest,
        )));
        self.state = HandshakeState::FeaturesRequesting;
        actions
    }

    fn on_features_reply(&mut self, xid: Xid, features: &SwitchFeatures) -> Vec<HandshakeAction> {
        let (version, expected) = match (self.state, self.version, self.features_xid) {
            (HandshakeState::FeaturesRequesting, Some(version), Some(expected)) => {
                (version, expected)
            }
            _ => {
                return self.fail(HandshakeError::UnexpectedMessage {
                    kind: MessageKind::FeaturesReply,
                    state: self.state.to_string(),
                })
            }
        };

        if xid != expected {
            return self.fail(HandshakeError::XidMismatch { expected, got: xid });
        }
        if features.datapath_id == 0 {
            return self.fail(HandshakeError::MissingDatapathId);
        }

        self.state = HandshakeState::Established;
        vec![HandshakeAction::Established(HandshakeOutcome {
            version,
            datapath_id: DatapathId(features.datapath_id),
            features: features.clone(),
        })]
    }

    fn send_hello(&mut self, version: OfVersion) -> HandshakeAction {
        self.hello_sent = true;
        let bitmap = self.use_bitmap.then_some(self.bitmap);
        HandshakeAction::Send(OfMessage::hello(version, self.xids.next(), bitmap))
    }

    fn fail(&mut self, error: HandshakeError) -> Vec<HandshakeAction> {
        self.state = HandshakeState::Failed;
        vec![HandshakeAction::Failed(error)]
    }
}
