// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Switch-facing listener.
//!
//! One task per accepted transport. The reader half feeds the manager in
//! arrival order; a separate writer task drains the context's outbound queue.

use crate::codec::JsonCodec;
use crate::config::{ConfigError, PluginConfig};
use crate::connection::{framed, TransportEnd, TransportHandle};
use crate::manager::ConnectionManager;
use crate::ownership::OwnershipService;
use crate::store::OperationalStore;
use crate::tls::{self, TlsError};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("Bind error: {0}")]
    Bind(String),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// OpenFlow controller endpoint.
#[derive(Clone)]
pub struct OpenFlowServer {
    config: Arc<PluginConfig>,
    manager: Arc<ConnectionManager>,
    codec: Arc<JsonCodec>,
    tls: Option<TlsAcceptor>,
    shutdown: Arc<Notify>,
    running: Arc<AtomicBool>,
}

impl OpenFlowServer {
    pub fn new(
        config: PluginConfig,
        ownership: Arc<dyn OwnershipService>,
        store: Arc<dyn OperationalStore>,
    ) -> Result<Self, ServerError> {
        config.validate()?;

        let tls = match (config.tls_enabled, &config.tls_cert_path, &config.tls_key_path) {
            (true, Some(cert), Some(key)) => Some(tls::load_acceptor(cert, key)?),
            _ => None,
        };

        let manager = ConnectionManager::new(&config, ownership, store);
        Ok(Self {
            config: Arc::new(config),
            manager,
            codec: Arc::new(JsonCodec),
            tls,
            shutdown: Arc::new(Notify::new()),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let addr = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ServerError::Bind(format!("{}: {}", addr, e)))?;
        self.serve(listener).await
    }

    /// Serve an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }

        let shutdown = self.shutdown.notified();
        tokio::pin!(shutdown);

        info!(
            "OpenFlow controller listening on {} ({})",
            listener.local_addr()?,
            if self.tls.is_some() { "tls" } else { "tcp" }
        );

        let sweeper = self
            .manager
            .spawn_timeout_sweeper(self.config.timeout_sweep_interval(), self.shutdown.clone());

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!("New connection from {}", peer_addr);
                            if let Err(e) = stream.set_nodelay(true) {
                                debug!("set_nodelay failed for {}: {}", peer_addr, e);
                            }
                            self.spawn_connection(stream, peer_addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        sweeper.abort();
        self.manager.shutdown();
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn spawn_connection(&self, stream: tokio::net::TcpStream, peer_addr: SocketAddr) {
        let server = self.clone();
        match self.tls.clone() {
            Some(acceptor) => {
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => server.handle_connection(tls_stream, peer_addr).await,
                        Err(e) => warn!("TLS handshake with {} failed: {}", peer_addr, e),
                    }
                });
            }
            None => {
                tokio::spawn(async move { server.handle_connection(stream, peer_addr).await });
            }
        }
    }

    async fn handle_connection<S>(&self, stream: S, peer_addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (transport, end) =
            TransportHandle::channel(peer_addr.to_string(), self.config.outbound_queue_capacity);
        let ctx = match self.manager.on_new_connection(transport) {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!("Connection from {} rejected: {}", peer_addr, e);
                return;
            }
        };
        let id = ctx.id();
        drop(ctx);

        let (mut reader, mut writer) =
            framed(stream, self.codec.clone(), self.config.max_message_size);
        let TransportEnd {
            outbound: mut outbound_rx,
            close: mut close_rx,
        } = end;

        let mut writer_close = close_rx.clone();
        let writer_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = outbound_rx.recv() => match msg {
                        Some(msg) => {
                            if let Err(e) = writer.send_message(&msg).await {
                                warn!("Write to {} failed: {}", peer_addr, e);
                                return;
                            }
                        }
                        None => break,
                    },
                    _ = writer_close.changed() => break,
                }
            }
            // Flush what was queued before the close.
            while let Ok(msg) = outbound_rx.try_recv() {
                if writer.send_message(&msg).await.is_err() {
                    return;
                }
            }
            let _ = writer.shutdown().await;
        });

        let shutdown = self.shutdown.notified();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                result = reader.read_message() => {
                    match result {
                        Ok(Some(msg)) => {
                            if let Err(e) = self.manager.on_message(id, msg) {
                                info!("Closing {}: {}", peer_addr, e);
                                break;
                            }
                        }
                        Ok(None) => {
                            info!("Connection closed: {}", peer_addr);
                            break;
                        }
                        Err(e) => {
                            warn!("Read error from {}: {}", peer_addr, e);
                            break;
                        }
                    }
                }
                _ = close_rx.changed() => {
                    debug!("Connection {} closed by controller", peer_addr);
                    break;
                }
                _ = &mut shutdown => {
                    debug!("Connection handler shutting down: {}", peer_addr);
                    break;
                }
            }
        }

        self.manager.on_disconnect(id);
        let _ = writer_task.await;
    }

    /// Signal the server to shutdown.
    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ownership::MockOwnershipService;
    use crate::store::InMemoryStore;
    use std::time::Duration;

    fn services() -> (Arc<dyn OwnershipService>, Arc<dyn OperationalStore>) {
        (
            Arc::new(MockOwnershipService::new()),
            Arc::new(InMemoryStore::new()),
        )
    }

    #[test]
    fn test_invalid_config_rejected() {
        let (ownership, store) = services();
        let config = PluginConfig {
            supported_versions: Vec::new(),
            ..PluginConfig::default()
        };
        assert!(matches!(
            OpenFlowServer::new(config, ownership, store),
            Err(ServerError::Config(_))
        ));
    }

    #[test]
    fn test_missing_tls_material() {
        let (ownership, store) = services();
        let config = PluginConfig {
            tls_enabled: true,
            tls_cert_path: Some("/nonexistent/cert.pem".into()),
            tls_key_path: Some("/nonexistent/key.pem".into()),
            ..PluginConfig::default()
        };
        assert!(matches!(
            OpenFlowServer::new(config, ownership, store),
            Err(ServerError::Tls(_))
        ));
    }

    #[tokio::test]
    async fn test_serve_and_shutdown() {
        let (ownership, store) = services();
        let server = OpenFlowServer::new(PluginConfig::default(), ownership, store).unwrap();
        assert!(!server.tls_enabled());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let handle = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };

        for _ in 0..100 {
            if server.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(server.is_running());

        let second = TcpListener::bind("127.0.0.1:0").await.unwrap();
        assert!(matches!(
            server.serve(second).await,
            Err(ServerError::AlreadyRunning)
        ));

        server.shutdown();
        handle.await.unwrap().unwrap();
        assert!(!server.is_running());
    }
}
