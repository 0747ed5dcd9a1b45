// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport plumbing between a socket and a device context.
//!
//! The context only ever sees a [`TransportHandle`]: an outbound queue and a
//! close signal. The connection task owns the other ends and the stream,
//! split into a framed reader and writer so reads are never cancelled by
//! outbound traffic.

use crate::codec::{CodecError, MessageCodec};
use crate::error::PluginError;
use crate::protocol::OfMessage;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};

/// Length prefix size.
pub const FRAME_HEADER_LEN: usize = 4;

/// Connection error types.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Context-side half of a transport.
#[derive(Clone)]
pub struct TransportHandle {
    peer: String,
    outbound: mpsc::Sender<OfMessage>,
    close: Arc<watch::Sender<bool>>,
}

/// Connection-side half of a transport.
pub struct TransportEnd {
    pub outbound: mpsc::Receiver<OfMessage>,
    pub close: watch::Receiver<bool>,
}

impl TransportHandle {
    /// Create a connected handle/end pair.
    pub fn channel(peer: impl Into<String>, capacity: usize) -> (Self, TransportEnd) {
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity.max(1));
        let (close_tx, close_rx) = watch::channel(false);
        let handle = Self {
            peer: peer.into(),
            outbound: outbound_tx,
            close: Arc::new(close_tx),
        };
        let end = TransportEnd {
            outbound: outbound_rx,
            close: close_rx,
        };
        (handle, end)
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Queue without waiting. Used from the connection's own event stream,
    /// which is also the one draining the queue.
    pub fn try_send(&self, msg: OfMessage) -> Result<(), PluginError> {
        self.outbound.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PluginError::OutboundFull,
            mpsc::error::TrySendError::Closed(_) => PluginError::OutboundClosed,
        })
    }

    /// Queue, waiting for room.
    pub async fn send(&self, msg: OfMessage) -> Result<(), PluginError> {
        self.outbound
            .send(msg)
            .await
            .map_err(|_| PluginError::OutboundClosed)
    }

    /// Ask the connection task to drop the transport.
    pub fn close(&self) {
        self.close.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.close.borrow() || self.outbound.is_closed()
    }
}

impl std::fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHandle")
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Reads length-prefixed messages.
pub struct MessageReader<R, C> {
    stream: R,
    codec: Arc<C>,
    max_message_size: usize,
    read_buffer: Vec<u8>,
}

impl<R, C> MessageReader<R, C>
where
    R: AsyncRead + Unpin,
    C: MessageCodec,
{
    pub fn new(stream: R, codec: Arc<C>, max_message_size: usize) -> Self {
        Self {
            stream,
            codec,
            max_message_size,
            read_buffer: Vec::with_capacity(4096),
        }
    }

    /// Read one message.
    ///
    /// Returns `Ok(None)` if the peer closed the connection.
    pub async fn read_message(&mut self) -> Result<Option<OfMessage>, ConnectionError> {
        let mut len_buf = [0u8; FRAME_HEADER_LEN];
        match self.stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            return Err(ConnectionError::Protocol("Empty message".into()));
        }
        if len > self.max_message_size {
            return Err(ConnectionError::Protocol(format!(
                "Message too large: {} > {}",
                len, self.max_message_size
            )));
        }

        self.read_buffer.clear();
        self.read_buffer.resize(len, 0);
        self.stream.read_exact(&mut self.read_buffer).await?;

        Ok(Some(self.codec.decode(&self.read_buffer)?))
    }
}

/// Writes length-prefixed messages.
pub struct MessageWriter<W, C> {
    stream: W,
    codec: Arc<C>,
    max_message_size: usize,
}

impl<W, C> MessageWriter<W, C>
where
    W: AsyncWrite + Unpin,
    C: MessageCodec,
{
    pub fn new(stream: W, codec: Arc<C>, max_message_size: usize) -> Self {
        Self {
            stream,
            codec,
            max_message_size,
        }
    }

    pub async fn send_message(&mut self, msg: &OfMessage) -> Result<(), ConnectionError> {
        let bytes = self.codec.encode(msg)?;
        if bytes.len() > self.max_message_size {
            return Err(ConnectionError::Protocol(format!(
                "Message too large: {} > {}",
                bytes.len(),
                self.max_message_size
            )));
        }

        let len = bytes.len() as u32;
        self.stream.write_all(&len.to_be_bytes()).await?;
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), ConnectionError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Split `stream` into a framed reader and writer sharing `codec`.
pub fn framed<S, C>(
    stream: S,
    codec: Arc<C>,
    max_message_size: usize,
) -> (
    MessageReader<tokio::io::ReadHalf<S>, C>,
    MessageWriter<tokio::io::WriteHalf<S>, C>,
)
where
    S: AsyncRead + AsyncWrite,
    C: MessageCodec,
{
    let (read_half, write_half) = tokio::io::split(stream);
    (
        MessageReader::new(read_half, codec.clone(), max_message_size),
        MessageWriter::new(write_half, codec, max_message_size),
    )
}
