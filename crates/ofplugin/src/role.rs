// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-device mastership tracking.
//!
//! `RoleContext` only gates and notifies. Reacting to a promotion
//! (reconciliation, role request to the switch) is the device context's job;
//! it watches the channel returned by [`RoleContext::subscribe`].

use crate::error::RequestError;
use crate::ownership::{
    EntityId, OwnershipError, OwnershipService, Role, RoleChangeListener, Subscription,
};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoleState {
    Unknown,
    CandidateRegistered,
    Master,
    Slave,
    Closed,
}

impl fmt::Display for RoleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "UNKNOWN",
            Self::CandidateRegistered => "CANDIDATE_REGISTERED",
            Self::Master => "MASTER",
            Self::Slave => "SLAVE",
            Self::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// A role change that the device context has to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleTransition {
    pub from: RoleState,
    pub to: RoleState,
}

impl RoleTransition {
    pub fn is_promotion(&self) -> bool {
        self.to == RoleState::Master && self.from != RoleState::Master
    }

    pub fn is_demotion(&self) -> bool {
        self.from == RoleState::Master && self.to != RoleState::Master
    }
}

/// Backoff schedule for candidate registration.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub attempts: u32,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(5),
            attempts: 10,
        }
    }
}

/// Role state for one device.
pub struct RoleContext {
    entity: EntityId,
    state: Mutex<RoleState>,
    subscription: Mutex<Option<Subscription>>,
    changes: watch::Sender<RoleState>,
}

impl RoleContext {
    pub fn new(entity: EntityId) -> Arc<Self> {
        let (changes, _) = watch::channel(RoleState::Unknown);
        Arc::new(Self {
            entity,
            state: Mutex::new(RoleState::Unknown),
            subscription: Mutex::new(None),
            changes,
        })
    }

    pub fn entity(&self) -> &EntityId {
        &self.entity
    }

    pub fn state(&self) -> RoleState {
        *self.state.lock()
    }

    pub fn is_master(&self) -> bool {
        self.state() == RoleState::Master
    }

    pub fn is_closed(&self) -> bool {
        self.state() == RoleState::Closed
    }

    /// `Ok` only while master.
    pub fn check_master(&self) -> Result<(), RequestError> {
        if self.is_master() {
            Ok(())
        } else {
            Err(RequestError::NotMaster)
        }
    }

    /// Watch role changes.
    pub fn subscribe(&self) -> watch::Receiver<RoleState> {
        self.changes.subscribe()
    }

    /// Register as ownership candidate, retrying with backoff.
    ///
    /// Gives up silently (with a warning) once the policy is exhausted or the
    /// context is closed.
    pub async fn register(
        self: &Arc<Self>,
        ownership: Arc<dyn OwnershipService>,
        policy: RetryPolicy,
    ) -> Result<(), OwnershipError> {
        let mut last_error = OwnershipError::Unavailable("no attempt made".into());
        for attempt in 0..policy.attempts.max(1) {
            if self.is_closed() {
                return Ok(());
            }

            let listener: Arc<dyn RoleChangeListener> = self.clone();
            match ownership.register_candidate(&self.entity, listener) {
                Ok(subscription) => {
                    self.on_registered(ownership.as_ref(), subscription);
                    return Ok(());
                }
                Err(e) => {
                    let delay = policy.delay(attempt);
                    debug!(
                        "Candidate registration for {} failed (attempt {}): {}, retrying in {:?}",
                        self.entity,
                        attempt + 1,
                        e,
                        delay
                    );
                    last_error = e;
                    tokio::time::sleep(delay).await;
                }
            }
        }

        warn!(
            "Giving up candidate registration for {}: {}",
            self.entity, last_error
        );
        Err(last_error)
    }

    fn on_registered(&self, ownership: &dyn OwnershipService, subscription: Subscription) {
        let mut state = self.state.lock();
        if *state == RoleState::Closed {
            drop(state);
            // Closed while registering: withdraw right away.
            ownership.unregister(&subscription);
            return;
        }
        // A role callback may already have beaten the registration result.
        if *state == RoleState::Unknown {
            *state = RoleState::CandidateRegistered;
            self.changes.send_replace(RoleState::CandidateRegistered);
        }
        *self.subscription.lock() = Some(subscription);
    }

    /// Apply a role decision. Duplicate decisions and anything after close
    /// return `None`.
    pub fn apply(&self, role: Role) -> Option<RoleTransition> {
        let to = match role {
            Role::Master => RoleState::Master,
            Role::Slave => RoleState::Slave,
            // The owner vanished; we are not master until told otherwise.
            Role::Unknown => RoleState::Slave,
        };
        self.transition(|from| (from != RoleState::Closed && from != to).then_some(to))
    }

    /// Become SLAVE if no role decision has arrived yet.
    pub fn fallback_to_slave(&self) -> Option<RoleTransition> {
        self.transition(|from| match from {
            RoleState::Unknown | RoleState::CandidateRegistered => Some(RoleState::Slave),
            _ => None,
        })
    }

    fn transition<F>(&self, decide: F) -> Option<RoleTransition>
    where
        F: FnOnce(RoleState) -> Option<RoleState>,
    {
        let mut state = self.state.lock();
        let from = *state;
        let to = decide(from)?;
        *state = to;
        self.changes.send_replace(to);
        Some(RoleTransition { from, to })
    }

    /// Withdraw ownership interest. Closing twice is a no-op.
    pub fn close(&self, ownership: &dyn OwnershipService) -> bool {
        let subscription = {
            let mut state = self.state.lock();
            if *state == RoleState::Closed {
                return false;
            }
            *state = RoleState::Closed;
            self.changes.send_replace(RoleState::Closed);
            self.subscription.lock().take()
        };
        if let Some(subscription) = subscription {
            ownership.unregister(&subscription);
        }
        debug!("Role context for {} closed", self.entity);
        true
    }
}

impl RoleChangeListener for RoleContext {
    fn on_role_changed(&self, old: Role, new: Role) {
        match self.apply(new) {
            Some(transition) => info!(
                "Role of {} changed {} -> {} (ownership reported {:?} -> {:?})",
                self.entity, transition.from, transition.to, old, new
            ),
            None => debug!(
                "Ignoring role notification {:?} -> {:?} for {} in state {}",
                old,
                new,
                self.entity,
                self.state()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ownership::{LocalOwnershipService, MockOwnershipService};
    use crate::protocol::DatapathId;

    fn entity() -> EntityId {
        EntityId::for_device(DatapathId(1))
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(4),
            attempts: 5,
        }
    }

    #[test]
    fn test_unknown_is_not_master() {
        let role = RoleContext::new(entity());
        assert_eq!(role.state(), RoleState::Unknown);
        assert_eq!(role.check_master(), Err(RequestError::NotMaster));
    }

    #[tokio::test]
    async fn test_register_then_master() {
        let ownership = Arc::new(MockOwnershipService::new());
        let role = RoleContext::new(entity());
        role.register(ownership.clone(), fast_policy()).await.unwrap();
        assert_eq!(role.state(), RoleState::CandidateRegistered);

        ownership.set_role(&entity(), Role::Master);
        assert!(role.is_master());
        assert!(role.check_master().is_ok());
    }

    #[tokio::test]
    async fn test_local_ownership_callback_before_return() {
        let ownership = Arc::new(LocalOwnershipService::new());
        let role = RoleContext::new(entity());
        role.register(ownership, fast_policy()).await.unwrap();
        // The master callback arrived inside register_candidate and must
        // not be overwritten by CANDIDATE_REGISTERED.
        assert_eq!(role.state(), RoleState::Master);
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_retries_with_backoff() {
        let ownership = Arc::new(MockOwnershipService::new());
        ownership.fail_next_registrations(3);
        let role = RoleContext::new(entity());
        role.register(ownership.clone(), fast_policy()).await.unwrap();
        assert_eq!(ownership.registrations(), 1);
        assert_eq!(role.state(), RoleState::CandidateRegistered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_gives_up() {
        let ownership = Arc::new(MockOwnershipService::new());
        ownership.fail_next_registrations(100);
        let role = RoleContext::new(entity());
        assert!(role.register(ownership, fast_policy()).await.is_err());
        assert_eq!(role.state(), RoleState::Unknown);
    }

    #[test]
    fn test_duplicate_role_is_noop() {
        let role = RoleContext::new(entity());
        let first = role.apply(Role::Master).unwrap();
        assert!(first.is_promotion());
        assert!(role.apply(Role::Master).is_none());

        let demotion = role.apply(Role::Slave).unwrap();
        assert!(demotion.is_demotion());
    }

    #[tokio::test]
    async fn test_close_idempotent_and_final() {
        let ownership = Arc::new(MockOwnershipService::new());
        let role = RoleContext::new(entity());
        role.register(ownership.clone(), fast_policy()).await.unwrap();

        assert!(role.close(ownership.as_ref()));
        assert!(!role.close(ownership.as_ref()));
        assert_eq!(ownership.unregistrations(), 1);
        assert!(role.apply(Role::Master).is_none());
        assert_eq!(role.state(), RoleState::Closed);
    }

    #[tokio::test]
    async fn test_register_after_close_withdraws() {
        let ownership = Arc::new(LocalOwnershipService::new());
        let role = RoleContext::new(entity());
        role.close(ownership.as_ref());
        role.register(ownership.clone(), fast_policy()).await.unwrap();
        assert!(!ownership.has_owner(&entity()));
    }

    #[test]
    fn test_fallback_only_without_decision() {
        let role = RoleContext::new(entity());
        assert_eq!(
            role.fallback_to_slave(),
            Some(RoleTransition {
                from: RoleState::Unknown,
                to: RoleState::Slave
            })
        );
        let role = RoleContext::new(entity());
        role.apply(Role::Master);
        assert!(role.fallback_to_slave().is_none());
    }

    #[tokio::test]
    async fn test_watch_sees_changes() {
        let role = RoleContext::new(entity());
        let mut rx = role.subscribe();
        role.apply(Role::Master);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), RoleState::Master);
    }

    #[test]
    fn test_retry_delay_capped() {
        let policy = RetryPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(1000),
            attempts: 10,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(9), Duration::from_millis(1000));
    }
}
