// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Device-local registries.
//!
//! A registry tracks what the controller believes is programmed on one
//! switch. Removal is two-phase: keys are marked, then `process_marks`
//! purges every marked key in one critical section.
//!
//! Writers are the device's own event stream, but monitoring code reads
//! from other threads, so every operation goes through one
//! `parking_lot::Mutex`.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;

pub mod flow;
pub mod history;
pub mod port;

pub use flow::{DeviceFlowRegistry, FlowDescriptor, FlowId, FlowRegistryKey};
pub use history::{EntryStatus, FlowGroupHistory, HistoryEntry, HistoryKind};
pub use port::{PortChange, PortStatusRegistry};

pub type GroupId = u32;
pub type MeterId = u32;

/// Group registry: group id only.
pub type DeviceGroupRegistry = CommonDeviceRegistry<GroupId>;

/// Meter registry: meter id only.
pub type DeviceMeterRegistry = CommonDeviceRegistry<MeterId>;

struct RegistryState<K, V> {
    current: HashMap<K, V>,
    marked: HashSet<K>,
}

/// Key to descriptor map with mark-and-sweep removal.
pub struct CommonDeviceRegistry<K, V = ()> {
    state: Mutex<RegistryState<K, V>>,
}

impl<K, V> CommonDeviceRegistry<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                current: HashMap::new(),
                marked: HashSet::new(),
            }),
        }
    }

    /// Insert or overwrite. Returns the previous descriptor.
    ///
    /// A pending mark on `key` is kept: the next sweep still removes it.
    pub fn store_value(&self, key: K, value: V) -> Option<V> {
        self.state.lock().current.insert(key, value)
    }

    /// Insert a descriptor computed from the stored one (marked or not).
    ///
    /// Lookup and insert happen under one lock acquisition.
    pub fn store_with<F>(&self, key: K, make: F) -> V
    where
        F: FnOnce(Option<&V>) -> V,
    {
        let mut state = self.state.lock();
        let value = make(state.current.get(&key));
        state.current.insert(key, value.clone());
        value
    }

    /// Flag `key` for removal. The key does not have to be stored.
    pub fn add_mark(&self, key: K) {
        self.state.lock().marked.insert(key);
    }

    pub fn has_mark(&self, key: &K) -> bool {
        self.state.lock().marked.contains(key)
    }

    /// Remove every marked key and clear the mark set.
    ///
    /// Returns the keys that were actually removed from the current set.
    pub fn process_marks(&self) -> Vec<K> {
        let mut state = self.state.lock();
        let marked = std::mem::take(&mut state.marked);
        marked
            .into_iter()
            .filter(|key| state.current.remove(key).is_some())
            .collect()
    }

    /// Drop `key` and any mark on it right away, leaving other marks for
    /// the next sweep. Returns the descriptor, marked or not.
    pub fn remove(&self, key: &K) -> Option<V> {
        let mut state = self.state.lock();
        state.marked.remove(key);
        state.current.remove(key)
    }

    /// Descriptor for `key`, hidden while the key is marked.
    pub fn get(&self, key: &K) -> Option<V> {
        let state = self.state.lock();
        if state.marked.contains(key) {
            return None;
        }
        state.current.get(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        let state = self.state.lock();
        !state.marked.contains(key) && state.current.contains_key(key)
    }

    /// Copy of the current (unmarked) entries.
    pub fn snapshot(&self) -> Vec<(K, V)> {
        let state = self.state.lock();
        state
            .current
            .iter()
            .filter(|(key, _)| !state.marked.contains(*key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Visit a snapshot of the current entries.
    ///
    /// The visitor runs without the lock held, so it may call back into the
    /// registry.
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&K, &V),
    {
        for (key, value) in self.snapshot() {
            visitor(&key, &value);
        }
    }

    /// Number of current (unmarked) entries.
    pub fn size(&self) -> usize {
        let state = self.state.lock();
        let hidden = state
            .marked
            .iter()
            .filter(|key| state.current.contains_key(*key))
            .count();
        state.current.len() - hidden
    }

    /// Number of marks waiting for the next sweep.
    pub fn pending_marks(&self) -> usize {
        self.state.lock().marked.len()
    }

    /// Drop everything. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.current.clear();
        state.marked.clear();
    }
}

impl<K, V> CommonDeviceRegistry<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Default,
{
    /// Insert `key` with a default descriptor.
    pub fn store(&self, key: K) {
        self.store_value(key, V::default());
    }
}

impl<K, V> Default for CommonDeviceRegistry<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    #[test]
    fn test_store_mark_sweep() {
        let registry = DeviceGroupRegistry::new();
        registry.store(1);
        registry.store(2);
        registry.add_mark(1);

        assert!(registry.has_mark(&1));
        assert!(!registry.contains(&1));
        assert_eq!(registry.size(), 1);

        assert_eq!(registry.process_marks(), vec![1]);
        assert!(!registry.has_mark(&1));
        assert_eq!(registry.pending_marks(), 0);
        assert_eq!(registry.size(), 1);
        assert!(registry.contains(&2));
    }

    #[test]
    fn test_mark_unknown_key() {
        let registry = DeviceMeterRegistry::new();
        registry.add_mark(5);
        assert!(registry.has_mark(&5));
        assert!(registry.process_marks().is_empty());
        assert_eq!(registry.pending_marks(), 0);
    }

    #[test]
    fn test_store_after_mark_still_swept() {
        let registry = DeviceGroupRegistry::new();
        registry.add_mark(3);
        registry.store(3);
        assert_eq!(registry.process_marks(), vec![3]);
        assert_eq!(registry.size(), 0);

        // A store after the sweep is a fresh entry.
        registry.store(3);
        assert!(registry.contains(&3));
    }

    #[test]
    fn test_remove_keeps_other_marks() {
        let registry = DeviceGroupRegistry::new();
        registry.store(1);
        registry.store(2);
        registry.add_mark(1);
        registry.add_mark(2);

        assert_eq!(registry.remove(&1), Some(()));
        assert!(!registry.has_mark(&1));
        assert!(registry.has_mark(&2));
        assert_eq!(registry.pending_marks(), 1);
        assert_eq!(registry.remove(&1), None);

        assert_eq!(registry.process_marks(), vec![2]);
        assert_eq!(registry.size(), 0);
    }

    #[test]
    fn test_last_store_wins() {
        let registry: CommonDeviceRegistry<u32, String> = CommonDeviceRegistry::new();
        assert_eq!(registry.store_value(1, "a".into()), None);
        assert_eq!(registry.store_value(1, "b".into()), Some("a".into()));
        assert_eq!(registry.get(&1), Some("b".into()));
        assert_eq!(registry.size(), 1);
    }

    #[test]
    fn test_close_idempotent() {
        let registry = DeviceGroupRegistry::new();
        registry.store(1);
        registry.add_mark(2);
        registry.close();
        registry.close();
        assert_eq!(registry.size(), 0);
        assert_eq!(registry.pending_marks(), 0);
    }

    #[test]
    fn test_for_each_may_reenter() {
        let registry = DeviceGroupRegistry::new();
        for id in 0..10 {
            registry.store(id);
        }
        let mut seen = 0;
        registry.for_each(|id, _| {
            // Re-entrant mutation must not deadlock or invalidate the walk.
            registry.add_mark(*id);
            registry.store(id + 100);
            seen += 1;
        });
        assert_eq!(seen, 10);
        assert_eq!(registry.process_marks().len(), 10);
        assert_eq!(registry.size(), 10);
    }

    #[test]
    fn test_sweep_matches_set_difference() {
        // Small LCG so the sequence is reproducible.
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next = move || {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
            (seed >> 33) as u32
        };

        let registry = DeviceGroupRegistry::new();
        let mut model: BTreeSet<u32> = BTreeSet::new();
        let mut marks: BTreeSet<u32> = BTreeSet::new();

        for _ in 0..5000 {
            let key = next() % 64;
            match next() % 3 {
                0 => {
                    registry.store(key);
                    model.insert(key);
                }
                1 => {
                    registry.add_mark(key);
                    marks.insert(key);
                }
                _ => {
                    registry.process_marks();
                    for key in std::mem::take(&mut marks) {
                        model.remove(&key);
                    }
                    assert_eq!(registry.pending_marks(), 0);
                    let current: BTreeSet<u32> =
                        registry.snapshot().into_iter().map(|(k, _)| k).collect();
                    assert_eq!(current, model);
                }
            }
        }
    }

    #[test]
    fn test_concurrent_store_then_sweep() {
        let registry = Arc::new(DeviceGroupRegistry::new());
        let threads: Vec<_> = (0..100u32)
            .map(|id| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.store(id))
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert!(registry.process_marks().is_empty());
        assert_eq!(registry.size(), 100);
    }
}
