// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Codec capability.
//!
//! The core never looks at bytes; it hands [`OfMessage`] values to a
//! [`MessageCodec`] and gets them back. [`JsonCodec`] is the bundled
//! implementation used by the test suite and the tooling; binary OpenFlow
//! codecs implement the same trait.

use crate::protocol::OfMessage;
use thiserror::Error;

/// Codec errors.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),
}

/// Message encoder/decoder.
pub trait MessageCodec: Send + Sync + 'static {
    fn encode(&self, msg: &OfMessage) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<OfMessage, CodecError>;
}

/// JSON codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode(&self, msg: &OfMessage) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(msg).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<OfMessage, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(format!("Invalid JSON: {}", e)))
    }
}
