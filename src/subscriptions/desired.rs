//! The desired subscription set: what the application asked for.

use super::types::DeliveryTarget;
use crate::types::{ChannelKey, SubscriptionMode};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One desired subscription and its delivery target.
///
/// Entries are shared with the dispatcher through `Arc`. Removing an entry
/// retires it and then takes its delivery gate, which waits out any delivery
/// already in progress. After that, nothing is delivered to the target.
///
/// Gates are only ever held by the session's dispatch thread, so retiring
/// from any other thread cannot wait on a second gate.
pub struct DesiredEntry {
    key: ChannelKey,
    target: DeliveryTarget,
    retired: AtomicBool,
    /// Held for the duration of each delivery. Reentrant so a callback can
    /// unsubscribe its own key.
    gate: ReentrantMutex<()>,
}

impl DesiredEntry {
    fn new(key: ChannelKey, target: DeliveryTarget) -> Self {
        Self {
            key,
            target,
            retired: AtomicBool::new(false),
            gate: ReentrantMutex::new(()),
        }
    }

    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    pub fn target(&self) -> &DeliveryTarget {
        &self.target
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub(crate) fn enter(&self) -> ReentrantMutexGuard<'_, ()> {
        self.gate.lock()
    }

    /// Stop deliveries to this entry and wait for an in-progress one to end.
    ///
    /// Must not be called while holding session locks.
    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::Release);
        drop(self.gate.lock());
    }
}

/// Authoritative set of desired subscriptions, keyed by [`ChannelKey`].
///
/// Survives reconnects; only explicit subscribe/unsubscribe calls mutate it.
#[derive(Default)]
pub struct DesiredSet {
    entries: HashMap<ChannelKey, Arc<DesiredEntry>>,
}

impl DesiredSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `key`. Returns the replaced entry,
    /// which the caller must retire outside any lock.
    pub fn insert(&mut self, key: ChannelKey, target: DeliveryTarget) -> Option<Arc<DesiredEntry>> {
        let entry = Arc::new(DesiredEntry::new(key.clone(), target));
        self.entries.insert(key, entry)
    }

    /// Remove the entry for `key`, if present.
    pub fn remove(&mut self, key: &ChannelKey) -> Option<Arc<DesiredEntry>> {
        self.entries.remove(key)
    }

    /// Remove every entry of `mode`.
    pub fn remove_mode(&mut self, mode: SubscriptionMode) -> Vec<Arc<DesiredEntry>> {
        let keys: Vec<ChannelKey> = self
            .entries
            .keys()
            .filter(|k| k.mode == mode)
            .cloned()
            .collect();
        keys.iter().filter_map(|k| self.entries.remove(k)).collect()
    }

    /// Remove everything.
    pub fn drain(&mut self) -> Vec<Arc<DesiredEntry>> {
        self.entries.drain().map(|(_, e)| e).collect()
    }

    pub fn get(&self, key: &ChannelKey) -> Option<Arc<DesiredEntry>> {
        self.entries.get(key).cloned()
    }

    pub fn contains(&self, key: &ChannelKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Read-only view of the desired keys.
    pub fn snapshot(&self) -> BTreeSet<ChannelKey> {
        self.entries.keys().cloned().collect()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ChannelKey> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
