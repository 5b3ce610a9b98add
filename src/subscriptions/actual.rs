//! Tracks what the server has acknowledged on the current connection.

use crate::types::{ChannelKey, ConnectionId};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Acknowledged subscriptions plus in-flight command bookkeeping.
///
/// Everything except the failure record is scoped to one connection and is
/// discarded by [`ActualTracker::reset`].
#[derive(Debug, Default)]
pub struct ActualTracker {
    connection: Option<ConnectionId>,
    acknowledged: HashSet<ChannelKey>,
    pending_subscribe: HashSet<ChannelKey>,
    pending_unsubscribe: HashSet<ChannelKey>,
    /// Last rejection per key. Cleared when the key is acknowledged or no
    /// longer desired.
    failed: HashMap<ChannelKey, String>,
}

impl ActualTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything tied to the previous connection.
    pub fn reset(&mut self, connection: Option<ConnectionId>) {
        self.connection = connection;
        self.acknowledged.clear();
        self.pending_subscribe.clear();
        self.pending_unsubscribe.clear();
    }

    pub fn connection(&self) -> Option<ConnectionId> {
        self.connection
    }

    pub fn is_current(&self, connection: ConnectionId) -> bool {
        self.connection == Some(connection)
    }

    pub fn contains(&self, key: &ChannelKey) -> bool {
        self.acknowledged.contains(key)
    }

    pub fn is_subscribe_pending(&self, key: &ChannelKey) -> bool {
        self.pending_subscribe.contains(key)
    }

    pub fn is_unsubscribe_pending(&self, key: &ChannelKey) -> bool {
        self.pending_unsubscribe.contains(key)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending_subscribe.is_empty() || !self.pending_unsubscribe.is_empty()
    }

    pub fn acknowledged(&self) -> impl Iterator<Item = &ChannelKey> {
        self.acknowledged.iter()
    }

    pub fn pending_subscribes(&self) -> impl Iterator<Item = &ChannelKey> {
        self.pending_subscribe.iter()
    }

    pub fn mark_subscribe_sent(&mut self, key: ChannelKey) {
        self.pending_subscribe.insert(key);
    }

    pub fn mark_unsubscribe_sent(&mut self, key: ChannelKey) {
        self.pending_unsubscribe.insert(key);
    }

    /// Undo in-flight marks for commands that never left the client.
    pub fn clear_pending(&mut self, key: &ChannelKey) {
        self.pending_subscribe.remove(key);
        self.pending_unsubscribe.remove(key);
    }

    /// Server acknowledged a subscribe. Returns true if the key is new.
    pub fn on_subscribed(&mut self, key: &ChannelKey) -> bool {
        self.pending_subscribe.remove(key);
        self.failed.remove(key);
        self.acknowledged.insert(key.clone())
    }

    /// Server acknowledged (or initiated) an unsubscribe. Returns true if the
    /// key was acknowledged before.
    pub fn on_unsubscribed(&mut self, key: &ChannelKey) -> bool {
        self.pending_unsubscribe.remove(key);
        self.acknowledged.remove(key)
    }

    /// Server rejected a command for `key`.
    pub fn on_rejected(&mut self, key: &ChannelKey, subscribe: bool, reason: &str) {
        if subscribe {
            self.pending_subscribe.remove(key);
            self.failed.insert(key.clone(), reason.to_string());
        } else {
            self.pending_unsubscribe.remove(key);
        }
    }

    pub fn failure(&self, key: &ChannelKey) -> Option<&str> {
        self.failed.get(key).map(String::as_str)
    }

    pub fn is_failed(&self, key: &ChannelKey) -> bool {
        self.failed.contains_key(key)
    }

    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }

    pub fn forget_failure(&mut self, key: &ChannelKey) {
        self.failed.remove(key);
    }

    pub fn snapshot(&self) -> BTreeSet<ChannelKey> {
        self.acknowledged.iter().cloned().collect()
    }

    pub fn pending_snapshot(&self) -> BTreeSet<ChannelKey> {
        self.pending_subscribe
            .iter()
            .chain(self.pending_unsubscribe.iter())
            .cloned()
            .collect()
    }

    pub fn failed_snapshot(&self) -> BTreeMap<ChannelKey, String> {
        self.failed
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
