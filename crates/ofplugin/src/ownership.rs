// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cluster entity-ownership capability.
//!
//! The controller registers as a candidate owner for every device it is
//! connected to; the ownership service decides which cluster member is
//! master and reports role changes through [`RoleChangeListener`].

use crate::protocol::DatapathId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Cluster entity for one device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(String);

impl EntityId {
    pub fn for_device(datapath_id: DatapathId) -> Self {
        Self(datapath_id.node_id())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Role reported by the ownership service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// No decision yet (or the owner went away).
    Unknown,
    Master,
    Slave,
}

/// Receives role changes for one entity.
pub trait RoleChangeListener: Send + Sync {
    fn on_role_changed(&self, old: Role, new: Role);
}

/// Handle returned by a candidate registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub id: u64,
    pub entity: EntityId,
}

/// Ownership service errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OwnershipError {
    #[error("ownership service unavailable: {0}")]
    Unavailable(String),

    #[error("candidate already registered for {0}")]
    AlreadyRegistered(EntityId),
}

/// Ownership capability.
pub trait OwnershipService: Send + Sync {
    /// Register as candidate owner of `entity`.
    ///
    /// Role changes are delivered to `listener`, possibly before this call
    /// returns.
    fn register_candidate(
        &self,
        entity: &EntityId,
        listener: Arc<dyn RoleChangeListener>,
    ) -> Result<Subscription, OwnershipError>;

    /// Withdraw a candidate registration. Unknown subscriptions are ignored.
    fn unregister(&self, subscription: &Subscription);

    /// Whether any cluster member currently owns `entity`.
    fn has_owner(&self, entity: &EntityId) -> bool;
}

struct Candidate {
    id: u64,
    listener: Arc<dyn RoleChangeListener>,
}

/// Single-node ownership: the first candidate for an entity is master, the
/// next one in line takes over when it leaves.
#[derive(Default)]
pub struct LocalOwnershipService {
    candidates: Mutex<HashMap<EntityId, Vec<Candidate>>>,
    next_id: AtomicU64,
}

impl LocalOwnershipService {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OwnershipService for LocalOwnershipService {
    fn register_candidate(
        &self,
        entity: &EntityId,
        listener: Arc<dyn RoleChangeListener>,
    ) -> Result<Subscription, OwnershipError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let role = {
            let mut candidates = self.candidates.lock();
            let list = candidates.entry(entity.clone()).or_default();
            list.push(Candidate {
                id,
                listener: listener.clone(),
            });
            if list.len() == 1 {
                Role::Master
            } else {
                Role::Slave
            }
        };

        // Outside the lock: the listener may call back into us.
        listener.on_role_changed(Role::Unknown, role);

        Ok(Subscription {
            id,
            entity: entity.clone(),
        })
    }

    fn unregister(&self, subscription: &Subscription) {
        let promoted = {
            let mut candidates = self.candidates.lock();
            let Some(list) = candidates.get_mut(&subscription.entity) else {
                return;
            };
            let Some(pos) = list.iter().position(|c| c.id == subscription.id) else {
                return;
            };
            list.remove(pos);
            let promoted = if pos == 0 {
                list.first().map(|c| c.listener.clone())
            } else {
                None
            };
            if list.is_empty() {
                candidates.remove(&subscription.entity);
            }
            promoted
        };

        if let Some(listener) = promoted {
            listener.on_role_changed(Role::Slave, Role::Master);
        }
    }

    fn has_owner(&self, entity: &EntityId) -> bool {
        self.candidates.lock().contains_key(entity)
    }
}

/// Ownership service driven by hand, for tests and embedding.
///
/// Registrations never deliver a role on their own; call [`set_role`]
/// to push one.
///
/// [`set_role`]: MockOwnershipService::set_role
#[derive(Default)]
pub struct MockOwnershipService {
    listeners: Mutex<HashMap<EntityId, (Subscription, Arc<dyn RoleChangeListener>, Role)>>,
    owned: Mutex<HashMap<EntityId, bool>>,
    failures: AtomicUsize,
    registrations: AtomicUsize,
    unregistrations: AtomicUsize,
    next_id: AtomicU64,
}

impl MockOwnershipService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` registrations fail with `Unavailable`.
    pub fn fail_next_registrations(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Deliver a role change to the candidate for `entity`.
    ///
    /// Returns `false` when nobody is registered.
    pub fn set_role(&self, entity: &EntityId, role: Role) -> bool {
        let target = {
            let mut listeners = self.listeners.lock();
            match listeners.get_mut(entity) {
                Some((_, listener, current)) => {
                    let old = *current;
                    *current = role;
                    Some((listener.clone(), old))
                }
                None => None,
            }
        };
        match target {
            Some((listener, old)) => {
                listener.on_role_changed(old, role);
                true
            }
            None => false,
        }
    }

    /// Answer for [`OwnershipService::has_owner`].
    pub fn set_has_owner(&self, entity: &EntityId, owned: bool) {
        self.owned.lock().insert(entity.clone(), owned);
    }

    pub fn is_registered(&self, entity: &EntityId) -> bool {
        self.listeners.lock().contains_key(entity)
    }

    pub fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }

    pub fn unregistrations(&self) -> usize {
        self.unregistrations.load(Ordering::SeqCst)
    }
}

impl OwnershipService for MockOwnershipService {
    fn register_candidate(
        &self,
        entity: &EntityId,
        listener: Arc<dyn RoleChangeListener>,
    ) -> Result<Subscription, OwnershipError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(OwnershipError::Unavailable("injected failure".into()));
        }

        let subscription = Subscription {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            entity: entity.clone(),
        };
        self.listeners.lock().insert(
            entity.clone(),
            (subscription.clone(), listener, Role::Unknown),
        );
        self.registrations.fetch_add(1, Ordering::SeqCst);
        Ok(subscription)
    }

    fn unregister(&self, subscription: &Subscription) {
        let mut listeners = self.listeners.lock();
        let matches = listeners
            .get(&subscription.entity)
            .map(|(sub, _, _)| sub.id == subscription.id)
            .unwrap_or(false);
        if matches {
            listeners.remove(&subscription.entity);
            self.unregistrations.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn has_owner(&self, entity: &EntityId) -> bool {
        self.owned.lock().get(entity).copied().unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        changes: Mutex<Vec<(Role, Role)>>,
    }

    impl RoleChangeListener for Recorder {
        fn on_role_changed(&self, old: Role, new: Role) {
            self.changes.lock().push((old, new));
        }
    }

    #[test]
    fn test_local_first_candidate_is_master() {
        let service = LocalOwnershipService::new();
        let entity = EntityId::for_device(DatapathId(1));
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());

        let sub1 = service.register_candidate(&entity, first.clone()).unwrap();
        let _sub2 = service.register_candidate(&entity, second.clone()).unwrap();
        assert_eq!(*first.changes.lock(), vec![(Role::Unknown, Role::Master)]);
        assert_eq!(*second.changes.lock(), vec![(Role::Unknown, Role::Slave)]);

        service.unregister(&sub1);
        assert_eq!(second.changes.lock().last(), Some(&(Role::Slave, Role::Master)));
        assert!(service.has_owner(&entity));
    }

    #[test]
    fn test_local_unregister_last_clears_owner() {
        let service = LocalOwnershipService::new();
        let entity = EntityId::for_device(DatapathId(2));
        let sub = service
            .register_candidate(&entity, Arc::new(Recorder::default()))
            .unwrap();
        service.unregister(&sub);
        service.unregister(&sub);
        assert!(!service.has_owner(&entity));
    }

    #[test]
    fn test_mock_failures_and_roles() {
        let service = MockOwnershipService::new();
        let entity = EntityId::for_device(DatapathId(3));
        let recorder = Arc::new(Recorder::default());

        service.fail_next_registrations(1);
        assert!(service.register_candidate(&entity, recorder.clone()).is_err());
        let sub = service.register_candidate(&entity, recorder.clone()).unwrap();

        assert!(service.set_role(&entity, Role::Master));
        assert!(service.set_role(&entity, Role::Slave));
        assert_eq!(
            *recorder.changes.lock(),
            vec![(Role::Unknown, Role::Master), (Role::Master, Role::Slave)]
        );

        service.unregister(&sub);
        assert!(!service.is_registered(&entity));
        assert!(!service.set_role(&entity, Role::Master));
        assert_eq!(service.registrations(), 1);
        assert_eq!(service.unregistrations(), 1);
    }
}
