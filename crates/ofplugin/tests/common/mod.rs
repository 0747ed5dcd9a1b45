// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Scripted switch used by the integration tests.

#![allow(dead_code)]

use ofplugin::protocol::{
    FlowStats, GroupDesc, MeterConfig, ModCommand, MultipartBody, MultipartKind, SwitchFeatures,
    VersionBitmap,
};
use ofplugin::{
    ConnectionId, ConnectionManager, DeviceConnectionContext, InMemoryStore, MessageBody,
    MessageKind, MockOwnershipService, OfMessage, OfVersion, PluginConfig, TransportHandle,
};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// OFPET_FLOW_MOD_FAILED
pub const FLOW_MOD_FAILED: u16 = 5;

/// What the fake switch reports and how it behaves.
pub struct SwitchState {
    pub datapath_id: u64,
    pub versions: Vec<OfVersion>,
    pub answer_features: bool,
    pub flows: Mutex<Vec<FlowStats>>,
    pub groups: Mutex<Vec<GroupDesc>>,
    pub meters: Mutex<Vec<MeterConfig>>,
    pub received: Mutex<Vec<OfMessage>>,
    pub reject_flow_mods: AtomicBool,
    holding: AtomicBool,
    held: Mutex<Vec<OfMessage>>,
}

impl SwitchState {
    pub fn new(datapath_id: u64, versions: &[OfVersion]) -> Arc<Self> {
        Self::build(datapath_id, versions, true)
    }

    /// A switch that never answers the features request.
    pub fn silent_after_hello(datapath_id: u64, versions: &[OfVersion]) -> Arc<Self> {
        Self::build(datapath_id, versions, false)
    }

    fn build(datapath_id: u64, versions: &[OfVersion], answer_features: bool) -> Arc<Self> {
        Arc::new(Self {
            datapath_id,
            versions: versions.to_vec(),
            answer_features,
            flows: Mutex::new(Vec::new()),
            groups: Mutex::new(Vec::new()),
            meters: Mutex::new(Vec::new()),
            received: Mutex::new(Vec::new()),
            reject_flow_mods: AtomicBool::new(false),
            holding: AtomicBool::new(false),
            held: Mutex::new(Vec::new()),
        })
    }

    fn version(&self) -> OfVersion {
        self.versions
            .iter()
            .copied()
            .max()
            .unwrap_or(OfVersion::V1_3)
    }

    pub fn received_kinds(&self) -> Vec<MessageKind> {
        self.received.lock().iter().map(|m| m.kind()).collect()
    }

    pub fn held_kinds(&self) -> Vec<MessageKind> {
        self.held.lock().iter().map(|m| m.kind()).collect()
    }

    /// Answers for one controller message.
    pub fn respond(&self, msg: &OfMessage) -> Vec<OfMessage> {
        let version = msg.version;
        let reply = |body| vec![OfMessage::new(version, msg.xid, body)];
        match &msg.body {
            MessageBody::Hello { .. } => vec![OfMessage::hello(
                self.version(),
                1,
                Some(VersionBitmap::from_versions(&self.versions)),
            )],
            MessageBody::FeaturesRequest if self.answer_features => {
                reply(MessageBody::FeaturesReply(SwitchFeatures {
                    datapath_id: self.datapath_id,
                    n_buffers: 256,
                    n_tables: 254,
                    auxiliary_id: 0,
                    capabilities: 0,
                }))
            }
            MessageBody::RoleRequest {
                role,
                generation_id,
            } => reply(MessageBody::RoleReply {
                role: *role,
                generation_id: *generation_id,
            }),
            MessageBody::MultipartRequest { kind } => {
                let body = match kind {
                    MultipartKind::Flow => MultipartBody::Flows(self.flows.lock().clone()),
                    MultipartKind::GroupDesc => MultipartBody::Groups(self.groups.lock().clone()),
                    MultipartKind::MeterConfig => {
                        MultipartBody::Meters(self.meters.lock().clone())
                    }
                    MultipartKind::PortDesc => MultipartBody::Ports(Vec::new()),
                };
                reply(MessageBody::MultipartReply { more: false, body })
            }
            MessageBody::BarrierRequest => reply(MessageBody::BarrierReply),
            MessageBody::FlowMod(flow) => {
                if self.reject_flow_mods.load(Ordering::SeqCst) {
                    return reply(MessageBody::Error {
                        err_type: FLOW_MOD_FAILED,
                        code: 0,
                        data: Vec::new(),
                    });
                }
                let stats = FlowStats {
                    table_id: flow.table_id,
                    priority: flow.priority,
                    flow_match: flow.flow_match.clone(),
                    cookie: flow.cookie,
                };
                let mut flows = self.flows.lock();
                flows.retain(|f| {
                    !(f.table_id == stats.table_id
                        && f.priority == stats.priority
                        && f.flow_match == stats.flow_match)
                });
                if flow.command != ModCommand::Delete {
                    flows.push(stats);
                }
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    /// Queue controller messages instead of answering them.
    pub fn hold(&self) {
        self.holding.store(true, Ordering::SeqCst);
    }

    /// Stop holding; returns the answers for everything held so far.
    pub fn release(&self) -> Vec<OfMessage> {
        self.holding.store(false, Ordering::SeqCst);
        let held = std::mem::take(&mut *self.held.lock());
        held.iter().flat_map(|m| self.respond(m)).collect()
    }

    /// Record `msg`; `None` while holding.
    fn accept(&self, msg: OfMessage) -> Option<Vec<OfMessage>> {
        self.received.lock().push(msg.clone());
        if self.holding.load(Ordering::SeqCst) {
            self.held.lock().push(msg);
            return None;
        }
        Some(self.respond(&msg))
    }
}

/// A switch attached to a manager through an in-memory transport.
pub struct FakeSwitch {
    pub id: ConnectionId,
    pub ctx: Arc<DeviceConnectionContext>,
    pub state: Arc<SwitchState>,
    manager: Arc<ConnectionManager>,
    task: JoinHandle<()>,
}

impl FakeSwitch {
    pub fn connect(manager: &Arc<ConnectionManager>, state: Arc<SwitchState>) -> Self {
        let (transport, mut end) =
            TransportHandle::channel(format!("fake-{}", state.datapath_id), 256);
        let ctx = manager
            .on_new_connection(transport)
            .expect("connection accepted");
        let id = ctx.id();

        let task = {
            let manager = manager.clone();
            let state = state.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        msg = end.outbound.recv() => {
                            let Some(msg) = msg else { break };
                            let Some(answers) = state.accept(msg) else { continue };
                            for answer in answers {
                                if manager.on_message(id, answer).is_err() {
                                    return;
                                }
                            }
                        }
                        _ = end.close.changed() => break,
                    }
                }
            })
        };

        Self {
            id,
            ctx,
            state,
            manager: manager.clone(),
            task,
        }
    }

    /// Deliver an unsolicited switch message.
    pub fn inject(&self, body: MessageBody) {
        let msg = OfMessage::new(self.ctx.version().unwrap_or(OfVersion::V1_3), 0, body);
        let _ = self.manager.on_message(self.id, msg);
    }

    /// Stop holding and feed the held answers to the controller.
    pub fn release(&self) {
        for answer in self.state.release() {
            let _ = self.manager.on_message(self.id, answer);
        }
    }

    pub fn disconnect(self) {
        self.manager.on_disconnect(self.id);
        self.task.abort();
    }
}

pub struct Fixture {
    pub manager: Arc<ConnectionManager>,
    pub ownership: Arc<MockOwnershipService>,
    pub store: InMemoryStore,
}

pub fn fixture(config: PluginConfig) -> Fixture {
    let ownership = Arc::new(MockOwnershipService::new());
    let store = InMemoryStore::new();
    let manager = ConnectionManager::new(&config, ownership.clone(), Arc::new(store.clone()));
    Fixture {
        manager,
        ownership,
        store,
    }
}

pub fn config_1_3() -> PluginConfig {
    PluginConfig {
        supported_versions: vec![OfVersion::V1_3],
        ..PluginConfig::default()
    }
}

/// Poll `condition` for up to two seconds.
pub async fn wait_for<F: Fn() -> bool>(condition: F) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

/// Await `future` with a two second limit.
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(2), future)
        .await
        .expect("timed out")
}
