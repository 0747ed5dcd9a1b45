// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-switch connection context.
//!
//! One context exists per accepted transport. It drives the handshake,
//! owns the pending request table and the device registries, and after
//! activation reacts to role changes (role request, reconciliation).
//!
//! Inbound messages are fed by the connection task one at a time through
//! [`DeviceConnectionContext::handle_message`]. Control-plane operations
//! are async and may be called from any task.

use crate::connection::TransportHandle;
use crate::dispatch::{DispatchTable, InboundRoute};
use crate::error::{CancelCause, HandshakeError, PluginError, RequestError};
use crate::handshake::{HandshakeAction, HandshakeOutcome, HandshakeState, HandshakeStateMachine};
use crate::ownership::{EntityId, OwnershipService};
use crate::pending::{PendingRequestTable, Reply, RequestHandle, RequestResult};
use crate::protocol::{
    ControllerRole, DatapathId, FlowMod, GroupMod, MessageBody, MessageKind, MeterMod, ModCommand,
    MultipartBody, MultipartKind, OfMessage, OfVersion, PortDesc, PortReason, SwitchFeatures,
};
use crate::registry::{
    CommonDeviceRegistry, DeviceFlowRegistry, DeviceGroupRegistry, DeviceMeterRegistry,
    EntryStatus, FlowDescriptor, FlowGroupHistory, FlowId, FlowRegistryKey, GroupId, MeterId,
    PortChange, PortStatusRegistry,
};
use crate::role::{RetryPolicy, RoleContext, RoleState};
use crate::stats::MessageSpy;
use crate::store::{DeviceMirror, OperationalStore};
use crate::xid::TransactionIdAllocator;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Manager-assigned transport identifier.
pub type ConnectionId = u64;

const NOTIFICATION_CAPACITY: usize = 256;

/// Lifecycle of a connection context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Handshaking,
    Working,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Handshaking => "HANDSHAKING",
            Self::Working => "WORKING",
            Self::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Handshake result surfaced to the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Established(HandshakeOutcome),
    Failed(HandshakeError),
}

/// Asynchronous device message published to subscribers while master.
#[derive(Debug, Clone)]
pub struct DeviceNotification {
    pub datapath_id: DatapathId,
    pub message: OfMessage,
}

/// Counts after one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub flows: usize,
    pub groups: usize,
    pub meters: usize,
    /// Entries swept because the device no longer reported them.
    pub removed: usize,
}

/// Per-device tunables, shared by every context of a manager.
#[derive(Debug, Clone)]
pub struct DeviceSettings {
    pub supported_versions: Vec<OfVersion>,
    pub use_version_bitmap: bool,
    pub request_timeout: Duration,
    pub role_wait_timeout: Duration,
    pub ownership_retry: RetryPolicy,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            supported_versions: vec![OfVersion::V1_3, OfVersion::V1_0],
            use_version_bitmap: true,
            request_timeout: Duration::from_secs(10),
            role_wait_timeout: Duration::from_secs(10),
            ownership_retry: RetryPolicy::default(),
        }
    }
}

/// Process-wide collaborators handed to every context.
#[derive(Clone)]
pub struct DeviceServices {
    pub ownership: Arc<dyn OwnershipService>,
    pub store: Arc<dyn OperationalStore>,
    pub dispatch: Arc<DispatchTable>,
    pub spy: Arc<MessageSpy>,
}

/// State that only exists once the handshake completed.
struct Session {
    outcome: HandshakeOutcome,
    role: Arc<RoleContext>,
    mirror: DeviceMirror,
    history: Arc<FlowGroupHistory>,
}

/// Everything the controller knows about one switch connection.
///
/// Created in `Handshaking` by the connection manager, moved to `Working`
/// by [`activate`](Self::activate) and to `Closed` by
/// [`shutdown`](Self::shutdown). The registries exist from the start but
/// only fill up once the device is working.
pub struct DeviceConnectionContext {
    id: ConnectionId,
    transport: TransportHandle,
    settings: Arc<DeviceSettings>,
    services: DeviceServices,
    runtime: Handle,
    xids: Arc<TransactionIdAllocator>,
    pending: PendingRequestTable,
    handshake: Mutex<HandshakeStateMachine>,
    state: Mutex<ConnectionState>,
    session: OnceLock<Session>,
    flows: DeviceFlowRegistry,
    groups: DeviceGroupRegistry,
    meters: DeviceMeterRegistry,
    ports: PortStatusRegistry,
    /// Port status received before activation.
    early_ports: Mutex<Vec<(PortReason, PortDesc)>>,
    notifications: broadcast::Sender<DeviceNotification>,
    role_generation: AtomicU64,
    closed: AtomicBool,
}

impl DeviceConnectionContext {
    /// Create a context for a freshly accepted transport.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        id: ConnectionId,
        transport: TransportHandle,
        settings: Arc<DeviceSettings>,
        services: DeviceServices,
    ) -> Result<Arc<Self>, PluginError> {
        let runtime = Handle::try_current().map_err(|_| PluginError::NoRuntime)?;
        let xids = Arc::new(TransactionIdAllocator::new());
        let handshake = HandshakeStateMachine::new(
            &settings.supported_versions,
            settings.use_version_bitmap,
            xids.clone(),
        );
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        Ok(Arc::new(Self {
            id,
            transport,
            pending: PendingRequestTable::new(settings.request_timeout),
            settings,
            services,
            runtime,
            xids,
            handshake: Mutex::new(handshake),
            state: Mutex::new(ConnectionState::Handshaking),
            session: OnceLock::new(),
            flows: DeviceFlowRegistry::new(),
            groups: DeviceGroupRegistry::new(),
            meters: DeviceMeterRegistry::new(),
            ports: PortStatusRegistry::new(),
            early_ports: Mutex::new(Vec::new()),
            notifications,
            role_generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }))
    }

    /// Manager-assigned id, stable for the life of the transport.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address as reported by the transport.
    pub fn peer(&self) -> &str {
        self.transport.peer()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.handshake.lock().state()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Known once activated.
    pub fn datapath_id(&self) -> Option<DatapathId> {
        self.session.get().map(|s| s.outcome.datapath_id)
    }

    /// Negotiated OpenFlow version, once activated.
    pub fn version(&self) -> Option<OfVersion> {
        self.session.get().map(|s| s.outcome.version)
    }

    pub fn features(&self) -> Option<&SwitchFeatures> {
        self.session.get().map(|s| &s.outcome.features)
    }

    /// Current role; `Unknown` until activated.
    pub fn role(&self) -> RoleState {
        self.session
            .get()
            .map_or(RoleState::Unknown, |s| s.role.state())
    }

    pub fn role_context(&self) -> Option<&Arc<RoleContext>> {
        self.session.get().map(|s| &s.role)
    }

    /// Flows believed installed on the switch.
    ///
    /// Read freely from any task. Mutating it directly bypasses the switch
    /// and the operational mirror.
    pub fn flow_registry(&self) -> &DeviceFlowRegistry {
        &self.flows
    }

    pub fn group_registry(&self) -> &DeviceGroupRegistry {
        &self.groups
    }

    pub fn meter_registry(&self) -> &DeviceMeterRegistry {
        &self.meters
    }

    pub fn port_registry(&self) -> &PortStatusRegistry {
        &self.ports
    }

    /// Recent flow/group changes for this datapath, shared with earlier
    /// connections of the same device.
    pub fn history(&self) -> Option<&Arc<FlowGroupHistory>> {
        self.session.get().map(|s| &s.history)
    }

    pub fn pending_requests(&self) -> &PendingRequestTable {
        &self.pending
    }

    /// Packet-in and experimenter messages, published while master.
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<DeviceNotification> {
        self.notifications.subscribe()
    }

    /// Time out overdue requests. Called by the manager's sweeper.
    pub fn expire_requests(&self, now: Instant) -> usize {
        let expired = self.pending.expire(now);
        if !expired.is_empty() {
            debug!(
                "{} request(s) to {} timed out: {:?}",
                expired.len(),
                self.describe(),
                expired
            );
        }
        expired.len()
    }

    fn describe(&self) -> String {
        match self.datapath_id() {
            Some(datapath_id) => format!("{} ({})", datapath_id, self.peer()),
            None => self.peer().to_string(),
        }
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Send the controller hello.
    pub fn start(&self) {
        let actions = self.handshake.lock().start();
        self.apply_handshake_actions(actions);
    }

    /// Process one inbound message.
    ///
    /// Returns the handshake outcome when this message completed or failed
    /// it; the manager decides what happens next.
    pub fn handle_message(&self, msg: OfMessage) -> Option<SessionEvent> {
        self.services.spy.record_inbound(msg.kind());
        match self.state() {
            ConnectionState::Handshaking => self.on_handshake_message(msg),
            ConnectionState::Working => {
                if let Some(session) = self.session.get() {
                    self.on_session_message(session, msg);
                }
                None
            }
            ConnectionState::Closed => {
                self.services.spy.record_dropped();
                None
            }
        }
    }

    fn on_handshake_message(&self, msg: OfMessage) -> Option<SessionEvent> {
        match msg.body {
            MessageBody::EchoRequest { ref data } => {
                self.reply_echo(&msg, data);
                return None;
            }
            MessageBody::PortStatus { reason, ref desc }
                if self.handshake_state() == HandshakeState::FeaturesRequesting =>
            {
                debug!(
                    "Buffering port {} status from {} until activation",
                    desc.port_no,
                    self.peer()
                );
                self.early_ports.lock().push((reason, desc.clone()));
                return None;
            }
            _ => {}
        }

        let actions = self.handshake.lock().handle(&msg);
        self.apply_handshake_actions(actions)
    }

    fn apply_handshake_actions(&self, actions: Vec<HandshakeAction>) -> Option<SessionEvent> {
        let mut event = None;
        for action in actions {
            match action {
                HandshakeAction::Send(msg) => self.send_now(msg),
                HandshakeAction::Established(outcome) => {
                    event = Some(SessionEvent::Established(outcome));
                }
                HandshakeAction::Failed(err) => {
                    event = Some(SessionEvent::Failed(err));
                }
            }
        }
        event
    }

    fn on_session_message(&self, session: &Session, msg: OfMessage) {
        let kind = msg.kind();
        let Some(route) = self.services.dispatch.route(msg.version, kind) else {
            debug!(
                "No route for {:?} (OpenFlow {}) from {}",
                kind,
                msg.version,
                session.outcome.datapath_id
            );
            self.services.spy.record_dropped();
            return;
        };

        match route {
            InboundRoute::Handshake => {
                debug!(
                    "Ignoring {:?} from {} after negotiation",
                    kind, session.outcome.datapath_id
                );
            }
            InboundRoute::Echo => {
                if let MessageBody::EchoRequest { ref data } = msg.body {
                    self.reply_echo(&msg, data);
                }
            }
            InboundRoute::Reply => {
                self.pending.complete(msg.xid, Ok(Reply::Message(msg)));
            }
            InboundRoute::MultipartFragment => {
                let is_last = !msg.has_more();
                self.pending.complete_fragment(msg.xid, msg, is_last);
            }
            InboundRoute::DeviceError => {
                if let MessageBody::Error { err_type, code, .. } = msg.body {
                    let outcome = self
                        .pending
                        .complete(msg.xid, Err(RequestError::Rejected { err_type, code }));
                    if outcome == crate::pending::CompletionOutcome::UnknownTransaction {
                        warn!(
                            "Device {} reported error (type {}, code {}) for xid {}",
                            session.outcome.datapath_id, err_type, code, msg.xid
                        );
                    }
                }
            }
            InboundRoute::PortStatus => {
                if let MessageBody::PortStatus { reason, desc } = msg.body {
                    self.on_port_status(session, reason, desc);
                }
            }
            InboundRoute::FlowRemoved => {
                if let MessageBody::FlowRemoved {
                    table_id,
                    priority,
                    ref flow_match,
                    ..
                } = msg.body
                {
                    let key = FlowRegistryKey::new(table_id, priority, flow_match);
                    self.on_flow_removed(session, key);
                }
            }
            InboundRoute::PacketIn | InboundRoute::Experimenter => self.publish(session, msg),
        }
    }

    fn reply_echo(&self, request: &OfMessage, data: &[u8]) {
        self.send_now(OfMessage::new(
            request.version,
            request.xid,
            MessageBody::EchoReply {
                data: data.to_vec(),
            },
        ));
    }

    fn on_port_status(&self, session: &Session, reason: PortReason, desc: PortDesc) {
        let change = self.ports.apply(reason, desc);
        debug!("Port change on {}: {:?}", session.outcome.datapath_id, change);
        if !session.role.is_master() {
            return;
        }
        let mut tx = session.mirror.begin();
        match &change {
            PortChange::Updated(desc) => tx.write_port(desc),
            PortChange::Removed(port_no) => tx.delete_port(*port_no),
            PortChange::Ignored(_) => {}
        }
        if !tx.is_empty() {
            self.runtime.spawn(tx.submit());
        }
    }

    fn on_flow_removed(&self, session: &Session, key: FlowRegistryKey) {
        if !session.role.is_master() {
            debug!(
                "Flow removed on {} ignored: not master",
                session.outcome.datapath_id
            );
            self.services.spy.record_dropped();
            return;
        }

        // A flow already marked by a delete was recorded then.
        let descriptor = self.flows.retrieve_descriptor(&key);
        self.flows.remove(&key);

        match descriptor {
            Some(descriptor) => {
                debug!(
                    "Flow {} removed from {} table {}",
                    descriptor.flow_id, session.outcome.datapath_id, key.table_id
                );
                session.history.record_flow(
                    key.table_id,
                    descriptor.flow_id.to_string(),
                    EntryStatus::Removed,
                );
                let mut tx = session.mirror.begin();
                tx.delete_flow(&descriptor);
                self.runtime.spawn(tx.submit());
            }
            None => debug!(
                "Flow removed on {} for unknown flow {:?}",
                session.outcome.datapath_id, key
            ),
        }
    }

    fn publish(&self, session: &Session, message: OfMessage) {
        if !session.role.is_master() {
            debug!(
                "Dropping {:?} from {}: not master",
                message.kind(),
                session.outcome.datapath_id
            );
            self.services.spy.record_dropped();
            return;
        }
        // No subscriber is not an error.
        let _ = self.notifications.send(DeviceNotification {
            datapath_id: session.outcome.datapath_id,
            message,
        });
    }

    // ------------------------------------------------------------------
    // Activation and role
    // ------------------------------------------------------------------

    /// Switch to WORKING after an accepted handshake and start role tracking.
    ///
    /// Returns `false` if the context was closed or already activated.
    pub fn activate(
        self: &Arc<Self>,
        outcome: HandshakeOutcome,
        history: Arc<FlowGroupHistory>,
    ) -> bool {
        if self.is_closed() {
            return false;
        }

        let datapath_id = outcome.datapath_id;
        let role = RoleContext::new(EntityId::for_device(datapath_id));
        let session = Session {
            outcome,
            role: role.clone(),
            mirror: DeviceMirror::new(self.services.store.clone(), datapath_id),
            history,
        };
        if self.session.set(session).is_err() {
            warn!("Device context {} activated twice", self.id);
            return false;
        }

        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Closed {
                return false;
            }
            *state = ConnectionState::Working;
        }

        let early = std::mem::take(&mut *self.early_ports.lock());
        for (reason, desc) in early {
            self.ports.apply(reason, desc);
        }

        let changes = role.subscribe();
        self.runtime
            .spawn(self.clone().watch_role(role.clone(), changes));

        let ownership = self.services.ownership.clone();
        let policy = self.settings.ownership_retry;
        self.runtime.spawn(async move {
            // Failures are logged by the role context; the role watcher
            // falls back to SLAVE.
            let _ = role.register(ownership, policy).await;
        });

        info!(
            "Device {} activated on {} (connection {})",
            datapath_id,
            self.peer(),
            self.id
        );
        true
    }

    async fn watch_role(
        self: Arc<Self>,
        role: Arc<RoleContext>,
        mut changes: watch::Receiver<RoleState>,
    ) {
        let wait = tokio::time::sleep(self.settings.role_wait_timeout);
        tokio::pin!(wait);
        let mut waiting = true;
        let mut last = RoleState::Unknown;

        loop {
            let current = *changes.borrow_and_update();
            if current != last {
                self.on_role_state(last, current);
                last = current;
            }
            match current {
                RoleState::Closed => break,
                RoleState::Master | RoleState::Slave => waiting = false,
                _ => {}
            }

            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = &mut wait, if waiting => {
                    waiting = false;
                    if role.fallback_to_slave().is_some() {
                        warn!(
                            "No ownership decision for {} within {:?}, continuing as SLAVE",
                            role.entity(),
                            self.settings.role_wait_timeout
                        );
                    }
                }
            }
        }
        debug!("Role watcher for {} stopped", role.entity());
    }

    fn on_role_state(self: &Arc<Self>, from: RoleState, to: RoleState) {
        match to {
            RoleState::Master => {
                let ctx = self.clone();
                self.runtime.spawn(async move { ctx.on_master().await });
            }
            RoleState::Slave => {
                let ctx = self.clone();
                let generation = self.role_generation.load(Ordering::SeqCst);
                self.runtime.spawn(async move {
                    ctx.request_role(ControllerRole::Slave, generation).await;
                });
                if from == RoleState::Master {
                    info!("{} demoted, control-plane writes stopped", self.describe());
                }
            }
            _ => {}
        }
    }

    async fn on_master(self: Arc<Self>) {
        let generation = self.role_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.request_role(ControllerRole::Master, generation).await;

        match self.reconcile().await {
            Ok(summary) => info!(
                "Reconciled {}: {} flows, {} groups, {} meters ({} stale removed)",
                self.describe(),
                summary.flows,
                summary.groups,
                summary.meters,
                summary.removed
            ),
            Err(RequestError::NotMaster) => {
                debug!("Reconciliation of {} stopped: no longer master", self.describe())
            }
            Err(e) => warn!("Reconciliation of {} failed: {}", self.describe(), e),
        }
    }

    async fn request_role(&self, role: ControllerRole, generation_id: u64) {
        let Some(version) = self.version() else {
            return;
        };
        if !self
            .services
            .dispatch
            .can_send(version, MessageKind::RoleRequest)
        {
            debug!("OpenFlow {} has no role request, skipping", version);
            return;
        }
        match self
            .send_request(MessageBody::RoleRequest {
                role,
                generation_id,
            })
            .await
        {
            Ok(_) => debug!(
                "{} acknowledged role {:?} (generation {})",
                self.describe(),
                role,
                generation_id
            ),
            Err(e) => warn!(
                "Role request {:?} to {} failed: {}",
                role,
                self.describe(),
                e
            ),
        }
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    /// Send a request and wait for its (possibly multipart) reply.
    ///
    /// Flow, group and meter modifications fail with `NotMaster` unless
    /// this controller is master for the device. Nothing is sent then.
    pub async fn send_request(&self, body: MessageBody) -> RequestResult {
        let handle = self.submit(body).await?;
        handle.await
    }

    /// Register and queue a request, returning its handle.
    ///
    /// # Errors
    ///
    /// - `NotEstablished` before activation
    /// - `Unsupported` if the negotiated version has no such message
    /// - `NotMaster` for a control write while not master
    /// - `Cancelled` if the transport is already gone
    pub async fn submit(&self, body: MessageBody) -> Result<RequestHandle, RequestError> {
        let session = self.session.get().ok_or(RequestError::NotEstablished)?;
        let version = session.outcome.version;
        let kind = body.kind();
        if !self.services.dispatch.can_send(version, kind) {
            return Err(RequestError::Unsupported { kind, version });
        }
        if kind.is_control_write() {
            session.role.check_master()?;
        }

        let handle = self.pending.register_next(&self.xids)?;
        let msg = OfMessage::new(version, handle.xid(), body);
        if let Err(e) = self.transport.send(msg).await {
            debug!("Cannot send {:?} to {}: {}", kind, self.describe(), e);
            let cause = self
                .pending
                .closed_cause()
                .unwrap_or(CancelCause::DeviceDisconnected);
            // Dropping the handle withdraws the entry.
            return Err(RequestError::Cancelled(cause));
        }
        self.services.spy.record_outbound(kind);
        Ok(handle)
    }

    fn send_now(&self, msg: OfMessage) {
        let kind = msg.kind();
        match self.transport.try_send(msg) {
            Ok(()) => self.services.spy.record_outbound(kind),
            Err(e) => warn!("Dropping {:?} to {}: {}", kind, self.peer(), e),
        }
    }

    /// Send a modification followed by a barrier.
    ///
    /// The barrier reply confirms the modification; an error correlated to
    /// it resolves it as `Rejected` first.
    async fn send_modification(&self, body: MessageBody) -> Result<&Session, RequestError> {
        let session = self.session.get().ok_or(RequestError::NotEstablished)?;
        session.role.check_master()?;

        let modification = self.submit(body).await?;
        let mod_xid = modification.xid();
        let barrier = self.submit(MessageBody::BarrierRequest).await?;
        barrier.await?;

        if self.pending.contains(mod_xid) {
            self.pending.complete(mod_xid, Ok(Reply::Acknowledged));
        }
        modification.await?;
        Ok(session)
    }

    // ------------------------------------------------------------------
    // Control plane
    // ------------------------------------------------------------------

    /// Install a flow. Without `flow_id` the flow gets a generated id.
    pub async fn add_flow(
        &self,
        flow: FlowMod,
        flow_id: Option<FlowId>,
    ) -> Result<FlowDescriptor, RequestError> {
        let key = FlowRegistryKey::from_flow_mod(&flow);
        let session = self
            .send_modification(MessageBody::FlowMod(FlowMod {
                command: ModCommand::Add,
                ..flow
            }))
            .await?;

        let descriptor = match flow_id {
            Some(flow_id) => {
                let descriptor = FlowDescriptor::new(key.table_id, flow_id);
                self.flows.store_descriptor(key.clone(), descriptor.clone());
                descriptor
            }
            None => self.flows.store(key.clone()),
        };
        session.history.record_flow(
            key.table_id,
            descriptor.flow_id.to_string(),
            EntryStatus::Added,
        );

        if session.role.is_master() {
            let mut tx = session.mirror.begin();
            tx.write_flow(&key, &descriptor);
            tx.submit().await;
        } else {
            debug!("Demoted during flow add on {}, mirror untouched", self.describe());
        }
        Ok(descriptor)
    }

    /// Delete a flow. Once the switch confirms, the registry entry is gone
    /// and a later add of the same match is visible again.
    pub async fn remove_flow(&self, flow: FlowMod) -> Result<(), RequestError> {
        let key = self.delete_flow(flow).await?;
        self.flows.remove(&key);
        Ok(())
    }

    /// Delete several flows. Confirmed deletes are marked and swept
    /// together at the end.
    pub async fn remove_flows(&self, flows: Vec<FlowMod>) -> Vec<Result<(), RequestError>> {
        let mut results = Vec::with_capacity(flows.len());
        for flow in flows {
            results.push(self.delete_flow(flow).await.map(|_| ()));
        }
        let swept = self.flows.process_marks();
        debug!("Swept {} flow(s) from {}", swept.len(), self.describe());
        results
    }

    /// Send the delete, mark the entry and record it. Returns the key.
    async fn delete_flow(&self, flow: FlowMod) -> Result<FlowRegistryKey, RequestError> {
        let key = FlowRegistryKey::from_flow_mod(&flow);
        let session = self
            .send_modification(MessageBody::FlowMod(FlowMod {
                command: ModCommand::Delete,
                ..flow
            }))
            .await?;

        let descriptor = self.flows.retrieve_descriptor(&key);
        self.flows.add_mark(key.clone());

        if let Some(descriptor) = descriptor {
            session.history.record_flow(
                key.table_id,
                descriptor.flow_id.to_string(),
                EntryStatus::Removed,
            );
            if session.role.is_master() {
                let mut tx = session.mirror.begin();
                tx.delete_flow(&descriptor);
                tx.submit().await;
            }
        }
        Ok(key)
    }

    /// Replace `original` by `updated`, keeping the original flow id.
    pub async fn update_flow(
        &self,
        original: FlowMod,
        updated: FlowMod,
    ) -> Result<FlowDescriptor, RequestError> {
        let original_key = FlowRegistryKey::from_flow_mod(&original);
        let updated_key = FlowRegistryKey::from_flow_mod(&updated);
        let session = self
            .send_modification(MessageBody::FlowMod(FlowMod {
                command: ModCommand::Modify,
                ..updated
            }))
            .await?;

        let previous = self.flows.retrieve_descriptor(&original_key);
        if original_key != updated_key {
            self.flows.remove(&original_key);
        }
        let descriptor = match &previous {
            Some(previous) => {
                let descriptor =
                    FlowDescriptor::new(updated_key.table_id, previous.flow_id.clone());
                self.flows
                    .store_descriptor(updated_key.clone(), descriptor.clone());
                descriptor
            }
            None => self.flows.store(updated_key.clone()),
        };
        session.history.record_flow(
            updated_key.table_id,
            descriptor.flow_id.to_string(),
            EntryStatus::Modified,
        );

        if session.role.is_master() {
            let mut tx = session.mirror.begin();
            if let Some(previous) = previous.filter(|p| p.table_id != descriptor.table_id) {
                tx.delete_flow(&previous);
            }
            tx.write_flow(&updated_key, &descriptor);
            tx.submit().await;
        }
        Ok(descriptor)
    }

    /// Install a group (OpenFlow 1.3 and later).
    pub async fn add_group(&self, group: GroupMod) -> Result<(), RequestError> {
        let group_id = group.group_id;
        let session = self
            .send_modification(MessageBody::GroupMod(GroupMod {
                command: ModCommand::Add,
                ..group
            }))
            .await?;

        self.groups.store(group_id);
        session.history.record_group(group_id, EntryStatus::Added);
        if session.role.is_master() {
            let mut tx = session.mirror.begin();
            tx.write_group(group_id);
            tx.submit().await;
        }
        Ok(())
    }

    /// Delete a group; the registry entry goes once the switch confirms.
    pub async fn remove_group(&self, group: GroupMod) -> Result<(), RequestError> {
        let group_id = group.group_id;
        let session = self
            .send_modification(MessageBody::GroupMod(GroupMod {
                command: ModCommand::Delete,
                ..group
            }))
            .await?;

        self.groups.remove(&group_id);
        session.history.record_group(group_id, EntryStatus::Removed);
        if session.role.is_master() {
            let mut tx = session.mirror.begin();
            tx.delete_group(group_id);
            tx.submit().await;
        }
        Ok(())
    }

    /// Install a meter. Meters are not recorded in the history.
    pub async fn add_meter(&self, meter: MeterMod) -> Result<(), RequestError> {
        let meter_id = meter.meter_id;
        let session = self
            .send_modification(MessageBody::MeterMod(MeterMod {
                command: ModCommand::Add,
                ..meter
            }))
            .await?;

        self.meters.store(meter_id);
        if session.role.is_master() {
            let mut tx = session.mirror.begin();
            tx.write_meter(meter_id);
            tx.submit().await;
        }
        Ok(())
    }

    pub async fn remove_meter(&self, meter: MeterMod) -> Result<(), RequestError> {
        let meter_id = meter.meter_id;
        let session = self
            .send_modification(MessageBody::MeterMod(MeterMod {
                command: ModCommand::Delete,
                ..meter
            }))
            .await?;

        self.meters.remove(&meter_id);
        if session.role.is_master() {
            let mut tx = session.mirror.begin();
            tx.delete_meter(meter_id);
            tx.submit().await;
        }
        Ok(())
    }

    /// Sweep marked entries of every registry. Returns how many were removed.
    ///
    /// Reconciliation and [`remove_flows`](Self::remove_flows) sweep on
    /// their own; this is for callers that mark entries themselves.
    pub fn process_marks(&self) -> usize {
        self.flows.process_marks().len()
            + self.groups.process_marks().len()
            + self.meters.process_marks().len()
    }

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    /// Resynchronize registries and the operational mirror with what the
    /// device reports. Stops with `NotMaster` as soon as the role is lost.
    pub async fn reconcile(&self) -> Result<ReconcileSummary, RequestError> {
        let session = self.session.get().ok_or(RequestError::NotEstablished)?;
        let mut summary = ReconcileSummary::default();
        let mut tx = session.mirror.begin();
        tx.write_node(&session.outcome);
        for port in self.ports.ports() {
            tx.write_port(&port);
        }

        if session.outcome.version.has_groups_and_meters() {
            session.role.check_master()?;
            let reply = self
                .send_request(MessageBody::MultipartRequest {
                    kind: MultipartKind::GroupDesc,
                })
                .await?;
            let reported: HashSet<GroupId> = multipart_entries(&reply, |body| match body {
                MultipartBody::Groups(groups) => groups.iter().map(|g| g.group_id).collect(),
                _ => Vec::new(),
            });
            tx.delete_all_groups();
            let removed = resync(&self.groups, &reported);
            for group_id in &removed {
                session.history.record_group(*group_id, EntryStatus::Removed);
            }
            self.groups.for_each(|group_id, _| tx.write_group(*group_id));
            summary.groups = self.groups.size();
            summary.removed += removed.len();

            session.role.check_master()?;
            let reply = self
                .send_request(MessageBody::MultipartRequest {
                    kind: MultipartKind::MeterConfig,
                })
                .await?;
            let reported: HashSet<MeterId> = multipart_entries(&reply, |body| match body {
                MultipartBody::Meters(meters) => meters.iter().map(|m| m.meter_id).collect(),
                _ => Vec::new(),
            });
            tx.delete_all_meters();
            let removed = resync(&self.meters, &reported);
            self.meters.for_each(|meter_id, _| tx.write_meter(*meter_id));
            summary.meters = self.meters.size();
            summary.removed += removed.len();
        }

        session.role.check_master()?;
        let reply = self
            .send_request(MessageBody::MultipartRequest {
                kind: MultipartKind::Flow,
            })
            .await?;
        let reported: HashSet<FlowRegistryKey> = multipart_entries(&reply, |body| match body {
            MultipartBody::Flows(stats) => stats.iter().map(FlowRegistryKey::from_stats).collect(),
            _ => Vec::new(),
        });

        tx.delete_all_flows();
        self.flows.process_marks();
        let known: HashMap<FlowRegistryKey, FlowDescriptor> =
            self.flows.snapshot().into_iter().collect();
        for key in known.keys() {
            if !reported.contains(key) {
                self.flows.add_mark(key.clone());
            }
        }
        for key in reported {
            self.flows.store(key);
        }
        let removed = self.flows.process_marks();
        for key in &removed {
            if let Some(descriptor) = known.get(key) {
                session.history.record_flow(
                    key.table_id,
                    descriptor.flow_id.to_string(),
                    EntryStatus::Removed,
                );
            }
        }
        self.flows
            .for_each(|key, descriptor| tx.write_flow(key, descriptor));
        summary.flows = self.flows.size();
        summary.removed += removed.len();

        // Nothing is written once demoted.
        session.role.check_master()?;
        tx.submit().await;
        Ok(summary)
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Tear the context down. Only the first call has an effect.
    pub fn shutdown(&self, cause: CancelCause) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        *self.state.lock() = ConnectionState::Closed;

        let cancelled = self.pending.cancel_all(cause);
        self.early_ports.lock().clear();
        self.flows.close();
        self.groups.close();
        self.meters.close();
        self.ports.close();

        if let Some(session) = self.session.get() {
            let ownership = self.services.ownership.as_ref();
            session.role.close(ownership);
            // A superseding connection for the same device takes the node over.
            if cause != CancelCause::Superseded && !ownership.has_owner(session.role.entity()) {
                let mut tx = session.mirror.begin();
                tx.delete_node();
                self.runtime.spawn(tx.submit());
            }
        }

        self.transport.close();
        info!(
            "Connection {} to {} closed ({}), {} pending request(s) cancelled",
            self.id,
            self.describe(),
            cause,
            cancelled
        );
        true
    }
}

/// Collect the entries of every multipart fragment.
fn multipart_entries<T, F>(reply: &Reply, extract: F) -> HashSet<T>
where
    T: Eq + Hash,
    F: Fn(&MultipartBody) -> Vec<T>,
{
    reply
        .messages()
        .iter()
        .filter_map(|msg| match &msg.body {
            MessageBody::MultipartReply { body, .. } => Some(extract(body)),
            _ => None,
        })
        .flatten()
        .collect()
}

/// Mark what the device no longer reports, store what it does, sweep.
///
/// Leftover marks are swept first so they cannot remove a key the device
/// still reports. Returns only the keys this pass removed.
fn resync<K>(registry: &CommonDeviceRegistry<K>, reported: &HashSet<K>) -> Vec<K>
where
    K: Eq + Hash + Clone,
{
    registry.process_marks();
    for (key, ()) in registry.snapshot() {
        if !reported.contains(&key) {
            registry.add_mark(key);
        }
    }
    for key in reported {
        registry.store(key.clone());
    }
    registry.process_marks()
}
