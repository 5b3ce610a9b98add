//! Reconciliation: diff desired against actual and emit the commands that
//! close the gap.

use super::actual::ActualTracker;
use super::desired::DesiredSet;
use crate::types::{ChannelKey, Command, SubscriptionMode, Verb};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Per-session reconciliation state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// No connection.
    Disconnected,
    /// Connected, commands in flight or keys missing.
    Reconciling,
    /// Connected and every desired key is acknowledged or recorded as failed.
    Synced,
}

/// Commands produced by one reconciliation pass, in emission order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub commands: Vec<Command>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Total keys addressed by the plan.
    pub fn key_count(&self) -> usize {
        self.commands.iter().map(|c| c.names.len()).sum()
    }
}

/// Compute the commands needed to converge `actual` on `desired` and mark
/// them in flight.
///
/// Subscribes are batched into one command per mode, followed by one
/// unsubscribe per mode. Keys already in flight are skipped. A key whose
/// unsubscribe is still in flight but which is desired again is subscribed
/// anew; the server processes the two in order.
pub fn plan(desired: &DesiredSet, actual: &mut ActualTracker) -> ReconcilePlan {
    let mut subscribe: BTreeMap<SubscriptionMode, BTreeSet<String>> = BTreeMap::new();
    let mut unsubscribe: BTreeMap<SubscriptionMode, BTreeSet<String>> = BTreeMap::new();

    for key in desired.keys() {
        let missing = !actual.contains(key) || actual.is_unsubscribe_pending(key);
        if missing && !actual.is_subscribe_pending(key) {
            subscribe
                .entry(key.mode)
                .or_default()
                .insert(key.name.clone());
        }
    }

    let orphans: Vec<ChannelKey> = actual
        .acknowledged()
        .chain(actual.pending_subscribes())
        .filter(|k| !desired.contains(k) && !actual.is_unsubscribe_pending(k))
        .cloned()
        .collect();
    for key in orphans {
        unsubscribe.entry(key.mode).or_default().insert(key.name);
    }

    let mut commands = Vec::new();
    for (mode, names) in subscribe {
        let command = Command::new(Verb::subscribe(mode), names.into_iter().collect());
        for key in command.keys() {
            actual.mark_subscribe_sent(key);
        }
        commands.push(command);
    }
    for (mode, names) in unsubscribe {
        let command = Command::new(Verb::unsubscribe(mode), names.into_iter().collect());
        for key in command.keys() {
            actual.forget_failure(&key);
            actual.mark_unsubscribe_sent(key);
        }
        commands.push(command);
    }

    ReconcilePlan { commands }
}

/// Evaluate the state machine position from current bookkeeping.
pub fn evaluate(desired: &DesiredSet, actual: &ActualTracker) -> SyncState {
    if actual.connection().is_none() {
        return SyncState::Disconnected;
    }
    if actual.has_pending() {
        return SyncState::Reconciling;
    }
    let all_desired_settled = desired
        .keys()
        .all(|k| actual.contains(k) || actual.is_failed(k));
    let no_orphans = actual.acknowledged().all(|k| desired.contains(k));
    if all_desired_settled && no_orphans {
        SyncState::Synced
    } else {
        SyncState::Reconciling
    }
}
