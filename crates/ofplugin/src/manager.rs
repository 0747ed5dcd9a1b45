// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection manager.
//!
//! Owns every device context, keyed by transport until the handshake
//! names the device, then also by datapath id. At most one live context
//! exists per datapath id: a newer connection closes the older one.

use crate::admission::AdmissionControl;
use crate::config::PluginConfig;
use crate::connection::TransportHandle;
use crate::device::{
    ConnectionId, DeviceConnectionContext, DeviceServices, DeviceSettings, SessionEvent,
};
use crate::dispatch::DispatchTable;
use crate::error::{CancelCause, PluginError};
use crate::handshake::HandshakeOutcome;
use crate::ownership::OwnershipService;
use crate::protocol::{DatapathId, OfMessage};
use crate::registry::FlowGroupHistory;
use crate::stats::{ConnectionStats, ConnectionStatsSnapshot, MessageSpy, MessageSpySnapshot};
use crate::store::OperationalStore;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Registry of device connections.
///
/// Shared as `Arc<ConnectionManager>` between the accept loop, the
/// per-connection tasks and whoever issues control-plane requests.
pub struct ConnectionManager {
    settings: Arc<DeviceSettings>,
    services: DeviceServices,
    admission: AdmissionControl,
    max_connections: usize,
    history_capacity: usize,
    next_id: AtomicU64,
    /// Slots taken, reserved before the context is inserted.
    open: AtomicUsize,
    connections: DashMap<ConnectionId, Arc<DeviceConnectionContext>>,
    devices: DashMap<DatapathId, ConnectionId>,
    /// One bounded ring per datapath ever seen; survives reconnects.
    histories: DashMap<DatapathId, Arc<FlowGroupHistory>>,
    stats: ConnectionStats,
}

impl ConnectionManager {
    /// Build a manager from `config` around the cluster ownership service
    /// and the operational store.
    pub fn new(
        config: &PluginConfig,
        ownership: Arc<dyn OwnershipService>,
        store: Arc<dyn OperationalStore>,
    ) -> Arc<Self> {
        let settings = config.device_settings();
        let services = DeviceServices {
            ownership,
            store,
            dispatch: Arc::new(DispatchTable::standard(&settings.supported_versions)),
            spy: Arc::new(MessageSpy::new()),
        };

        Arc::new(Self {
            settings: Arc::new(settings),
            services,
            admission: AdmissionControl::new(
                config.device_connection_hold_time(),
                config.connection_rate_limit_per_sec,
            ),
            max_connections: config.max_connections,
            history_capacity: config.history_capacity,
            next_id: AtomicU64::new(1),
            open: AtomicUsize::new(0),
            connections: DashMap::new(),
            devices: DashMap::new(),
            histories: DashMap::new(),
            stats: ConnectionStats::default(),
        })
    }

    /// Accept a transport: create its context and send the controller hello.
    ///
    /// The context is keyed by connection id only until the handshake
    /// names the device.
    ///
    /// # Errors
    ///
    /// `Refused` when `max_connections` transports are already open (the
    /// transport is closed), `NoRuntime` outside a tokio runtime.
    pub fn on_new_connection(
        &self,
        transport: TransportHandle,
    ) -> Result<Arc<DeviceConnectionContext>, PluginError> {
        if !self.reserve_slot() {
            self.stats.refused.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Refusing {}: {} connections open",
                transport.peer(),
                self.max_connections
            );
            transport.close();
            return Err(PluginError::Refused("too many connections".into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let ctx = match DeviceConnectionContext::new(
            id,
            transport,
            self.settings.clone(),
            self.services.clone(),
        ) {
            Ok(ctx) => ctx,
            Err(e) => {
                self.release_slot();
                return Err(e);
            }
        };
        self.connections.insert(id, ctx.clone());
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        debug!("Connection {} from {} accepted", id, ctx.peer());

        ctx.start();
        Ok(ctx)
    }

    fn reserve_slot(&self) -> bool {
        self.open
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |open| {
                (self.max_connections == 0 || open < self.max_connections).then_some(open + 1)
            })
            .is_ok()
    }

    fn release_slot(&self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }

    /// Route one inbound message to its context.
    ///
    /// Before the handshake completes the message drives the handshake;
    /// afterwards it goes to the pending table, the registries or the
    /// notification channel. A completed handshake runs admission control
    /// and the duplicate-device check here.
    ///
    /// An error means the connection must be dropped.
    pub fn on_message(&self, id: ConnectionId, msg: OfMessage) -> Result<(), PluginError> {
        let ctx = self
            .connection(id)
            .ok_or(PluginError::UnknownConnection(id))?;

        match ctx.handle_message(msg) {
            None => Ok(()),
            Some(SessionEvent::Established(outcome)) => self.on_established(&ctx, outcome),
            Some(SessionEvent::Failed(err)) => {
                self.stats.handshake_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Handshake with {} failed: {}", ctx.peer(), err);
                self.teardown(id, CancelCause::HandshakeFailed);
                Err(PluginError::HandshakeFailed(err))
            }
        }
    }

    fn on_established(
        &self,
        ctx: &Arc<DeviceConnectionContext>,
        outcome: HandshakeOutcome,
    ) -> Result<(), PluginError> {
        let id = ctx.id();
        let datapath_id = outcome.datapath_id;

        if let Err(refusal) = self.admission.check(datapath_id, Instant::now()) {
            self.stats.refused.fetch_add(1, Ordering::Relaxed);
            info!("Device {} from {} refused: {}", datapath_id, ctx.peer(), refusal);
            self.teardown(id, CancelCause::Refused);
            return Err(PluginError::Refused(refusal.to_string()));
        }

        if let Some(previous) = self.devices.insert(datapath_id, id) {
            if previous != id {
                if let Some((_, stale)) = self.connections.remove(&previous) {
                    self.release_slot();
                    self.stats.duplicates_closed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Device {} reconnected from {}, closing stale connection {} ({})",
                        datapath_id,
                        ctx.peer(),
                        previous,
                        stale.peer()
                    );
                    stale.shutdown(CancelCause::Superseded);
                }
            }
        }

        let history = self
            .histories
            .entry(datapath_id)
            .or_insert_with(|| Arc::new(FlowGroupHistory::new(self.history_capacity)))
            .clone();

        if ctx.activate(outcome.clone(), history) {
            self.stats.established.fetch_add(1, Ordering::Relaxed);
            info!(
                "Device {} connected from {} (OpenFlow {}, {} tables)",
                datapath_id,
                ctx.peer(),
                outcome.version,
                outcome.features.n_tables
            );
        }
        Ok(())
    }

    /// Transport closed. Cancels pending requests, closes the role and the
    /// registries and forgets the context, whatever state it reached.
    /// Unknown ids are ignored.
    pub fn on_disconnect(&self, id: ConnectionId) {
        if self.teardown(id, CancelCause::DeviceDisconnected) {
            self.stats.disconnected.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn teardown(&self, id: ConnectionId, cause: CancelCause) -> bool {
        let Some((_, ctx)) = self.connections.remove(&id) else {
            return false;
        };
        self.release_slot();
        if let Some(datapath_id) = ctx.datapath_id() {
            self.devices.remove_if(&datapath_id, |_, owner| *owner == id);
        }
        ctx.shutdown(cause);
        true
    }

    /// Close every connection.
    pub fn shutdown(&self) {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.teardown(id, CancelCause::Shutdown);
        }
    }

    /// Time out overdue requests on every connection once per `interval`.
    ///
    /// Runs until `shutdown` is notified or the manager is dropped.
    pub fn spawn_timeout_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: Arc<Notify>,
    ) -> tokio::task::JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let Some(manager) = manager.upgrade() else {
                            break;
                        };
                        let expired = manager.expire_requests(Instant::now());
                        if expired > 0 {
                            debug!("Timed out {} request(s)", expired);
                        }
                    }
                    _ = shutdown.notified() => {
                        debug!("Timeout sweeper shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Expire overdue requests on all connections.
    pub fn expire_requests(&self, now: Instant) -> usize {
        let contexts: Vec<Arc<DeviceConnectionContext>> =
            self.connections.iter().map(|e| e.value().clone()).collect();
        contexts.iter().map(|ctx| ctx.expire_requests(now)).sum()
    }

    /// Context for a transport, handshaking or not.
    pub fn connection(&self, id: ConnectionId) -> Option<Arc<DeviceConnectionContext>> {
        self.connections.get(&id).map(|e| e.value().clone())
    }

    /// Live context for a device.
    pub fn device(&self, datapath_id: DatapathId) -> Option<Arc<DeviceConnectionContext>> {
        let id = *self.devices.get(&datapath_id)?;
        self.connection(id)
    }

    /// Datapath ids with a live context, sorted.
    pub fn devices(&self) -> Vec<DatapathId> {
        let mut devices: Vec<DatapathId> = self.devices.iter().map(|e| *e.key()).collect();
        devices.sort_unstable();
        devices
    }

    /// History of a device, kept across reconnects.
    ///
    /// Entries stay for the lifetime of the manager, one ring of at most
    /// `history_capacity` entries per datapath.
    pub fn history_for(&self, datapath_id: DatapathId) -> Option<Arc<FlowGroupHistory>> {
        self.histories.get(&datapath_id).map(|e| e.value().clone())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn stats(&self) -> ConnectionStatsSnapshot {
        self.stats.snapshot()
    }

    /// Per-kind message counters across all connections.
    pub fn message_stats(&self) -> MessageSpySnapshot {
        self.services.spy.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::TransportEnd;
    use crate::ownership::MockOwnershipService;
    use crate::protocol::{MessageBody, MessageKind, OfVersion, SwitchFeatures, VersionBitmap};
    use crate::store::InMemoryStore;

    fn manager(config: PluginConfig) -> Arc<ConnectionManager> {
        ConnectionManager::new(
            &config,
            Arc::new(MockOwnershipService::new()),
            Arc::new(InMemoryStore::new()),
        )
    }

    async fn handshake(
        manager: &ConnectionManager,
        end: &mut TransportEnd,
        id: ConnectionId,
        datapath_id: u64,
    ) -> Result<(), PluginError> {
        let _hello = end.outbound.recv().await.unwrap();
        manager.on_message(
            id,
            OfMessage::hello(
                OfVersion::V1_3,
                1,
                Some(VersionBitmap::from_versions(&[OfVersion::V1_3])),
            ),
        )?;
        let request = end.outbound.recv().await.unwrap();
        assert_eq!(request.kind(), MessageKind::FeaturesRequest);
        manager.on_message(
            id,
            OfMessage::new(
                OfVersion::V1_3,
                request.xid,
                MessageBody::FeaturesReply(SwitchFeatures {
                    datapath_id,
                    n_buffers: 0,
                    n_tables: 4,
                    auxiliary_id: 0,
                    capabilities: 0,
                }),
            ),
        )
    }

    #[tokio::test]
    async fn test_max_connections() {
        let manager = manager(PluginConfig {
            max_connections: 1,
            ..PluginConfig::default()
        });
        let (first, _end1) = TransportHandle::channel("a", 8);
        let (second, _end2) = TransportHandle::channel("b", 8);
        assert!(manager.on_new_connection(first).is_ok());
        assert!(matches!(
            manager.on_new_connection(second),
            Err(PluginError::Refused(_))
        ));
        assert_eq!(manager.stats().refused, 1);
    }

    #[tokio::test]
    async fn test_unknown_connection() {
        let manager = manager(PluginConfig::default());
        assert!(matches!(
            manager.on_message(42, OfMessage::hello(OfVersion::V1_3, 1, None)),
            Err(PluginError::UnknownConnection(42))
        ));
    }

    #[tokio::test]
    async fn test_hold_time_refuses_first_connection() {
        let manager = manager(PluginConfig {
            device_connection_hold_time_ms: 60_000,
            ..PluginConfig::default()
        });
        let (transport, mut end) = TransportHandle::channel("a", 8);
        let ctx = manager.on_new_connection(transport).unwrap();
        let result = handshake(&manager, &mut end, ctx.id(), 7).await;
        assert!(matches!(result, Err(PluginError::Refused(_))));
        assert!(ctx.is_closed());
        assert_eq!(manager.connection_count(), 0);
        assert!(manager.device(DatapathId(7)).is_none());
    }

    #[tokio::test]
    async fn test_handshake_failure_tears_down() {
        let manager = manager(PluginConfig::default());
        let (transport, mut end) = TransportHandle::channel("a", 8);
        let ctx = manager.on_new_connection(transport).unwrap();
        let _hello = end.outbound.recv().await.unwrap();

        // 1.4 only, controller speaks 1.3 and 1.0
        let result = manager.on_message(
            ctx.id(),
            OfMessage::hello(
                OfVersion::V1_4,
                1,
                Some(VersionBitmap::from_versions(&[OfVersion::V1_4])),
            ),
        );
        assert!(matches!(result, Err(PluginError::HandshakeFailed(_))));
        assert_eq!(manager.stats().handshake_failures, 1);
        assert_eq!(manager.connection_count(), 0);
        assert!(ctx.is_closed());
    }

    #[tokio::test]
    async fn test_history_survives_reconnect() {
        let manager = manager(PluginConfig::default());
        let (transport, mut end) = TransportHandle::channel("a", 8);
        let ctx = manager.on_new_connection(transport).unwrap();
        handshake(&manager, &mut end, ctx.id(), 5).await.unwrap();

        let history = manager.history_for(DatapathId(5)).unwrap();
        manager.on_disconnect(ctx.id());
        assert_eq!(manager.device_count(), 0);

        let (transport, mut end) = TransportHandle::channel("a", 8);
        let ctx = manager.on_new_connection(transport).unwrap();
        handshake(&manager, &mut end, ctx.id(), 5).await.unwrap();
        assert!(Arc::ptr_eq(ctx.history().unwrap(), &history));
        assert_eq!(manager.histories.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_max_connections_under_concurrent_accepts() {
        let manager = manager(PluginConfig {
            max_connections: 4,
            ..PluginConfig::default()
        });

        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let manager = manager.clone();
                tokio::spawn(async move {
                    let (transport, end) = TransportHandle::channel(format!("peer-{}", i), 8);
                    manager.on_new_connection(transport).map(|ctx| (ctx, end))
                })
            })
            .collect();

        let mut accepted = Vec::new();
        for task in tasks {
            if let Ok(conn) = task.await.unwrap() {
                accepted.push(conn);
            }
        }
        assert_eq!(accepted.len(), 4);
        assert_eq!(manager.connection_count(), 4);
        assert_eq!(manager.stats().refused, 28);

        // A closed connection frees its slot.
        let (ctx, _end) = accepted.pop().unwrap();
        manager.on_disconnect(ctx.id());
        let (transport, _end) = TransportHandle::channel("late", 8);
        assert!(manager.on_new_connection(transport).is_ok());
        let (transport, _end) = TransportHandle::channel("later", 8);
        assert!(manager.on_new_connection(transport).is_err());
    }
}
