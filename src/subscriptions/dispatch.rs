//! Message dispatch to delivery targets.

use super::desired::DesiredEntry;
use super::types::TargetKind;
use crate::types::{PublishedFrame, PublishedMessage};
use crossbeam_channel::{SendTimeoutError, Sender};
use serde::Serialize;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{trace, warn};

/// What happened to one inbound message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handed to the target.
    Delivered,
    /// No desired entry for the frame's key.
    NoSubscription,
    /// The entry was removed before or during delivery.
    Retired,
    /// The callback panicked. Dispatch continues with the next frame.
    HandlerPanicked,
    /// The application dropped the queue receiver.
    ReceiverGone,
}

/// Dispatch counters.
#[derive(Debug, Default)]
pub struct DispatchStats {
    delivered: AtomicU64,
    dropped_unknown: AtomicU64,
    dropped_retired: AtomicU64,
    handler_failures: AtomicU64,
    queue_closed: AtomicU64,
}

/// Point-in-time copy of [`DispatchStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DispatchCounts {
    pub delivered: u64,
    pub dropped_unknown: u64,
    pub dropped_retired: u64,
    pub handler_failures: u64,
    pub queue_closed: u64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchCounts {
        DispatchCounts {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped_unknown: self.dropped_unknown.load(Ordering::Relaxed),
            dropped_retired: self.dropped_retired.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            queue_closed: self.queue_closed.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: DispatchOutcome) {
        let counter = match outcome {
            DispatchOutcome::Delivered => &self.delivered,
            DispatchOutcome::NoSubscription => &self.dropped_unknown,
            DispatchOutcome::Retired => &self.dropped_retired,
            DispatchOutcome::HandlerPanicked => &self.handler_failures,
            DispatchOutcome::ReceiverGone => &self.queue_closed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Routes published frames to their delivery targets.
///
/// Targets are served on the calling thread. The session calls it from a
/// single dispatch thread, so a slow callback or a full queue delays later
/// messages but never acknowledgements or disconnect detection.
pub struct Dispatcher {
    stats: DispatchStats,
    /// How often a delivery blocked on a full queue re-checks retirement.
    backpressure_poll: Duration,
}

impl Dispatcher {
    pub fn new(backpressure_poll: Duration) -> Self {
        Self {
            stats: DispatchStats::default(),
            backpressure_poll,
        }
    }

    pub fn stats(&self) -> DispatchCounts {
        self.stats.snapshot()
    }

    /// Count a frame that matched no desired entry.
    pub fn drop_unmatched(&self, frame: &PublishedFrame) -> DispatchOutcome {
        trace!(
            channel = %frame.channel,
            mode = ?frame.mode,
            "dropping message with no subscription"
        );
        self.stats.record(DispatchOutcome::NoSubscription);
        DispatchOutcome::NoSubscription
    }

    /// Deliver `frame` to `entry`, isolating handler failures.
    ///
    /// The payload is moved into the message, never copied.
    pub fn deliver(&self, entry: &DesiredEntry, frame: PublishedFrame) -> DispatchOutcome {
        let _gate = entry.enter();
        let outcome = if entry.is_retired() {
            DispatchOutcome::Retired
        } else {
            let message = frame.into_message();
            match entry.target().kind() {
                TargetKind::Callback(callback) => {
                    match catch_unwind(AssertUnwindSafe(|| callback(message))) {
                        Ok(()) => DispatchOutcome::Delivered,
                        Err(panic) => {
                            warn!(
                                key = %entry.key(),
                                reason = %panic_message(&*panic),
                                "subscription callback panicked"
                            );
                            DispatchOutcome::HandlerPanicked
                        }
                    }
                }
                TargetKind::Queue(sender) => self.enqueue(entry, sender, message),
            }
        };
        self.stats.record(outcome);
        outcome
    }

    fn enqueue(
        &self,
        entry: &DesiredEntry,
        sender: &Sender<PublishedMessage>,
        mut message: PublishedMessage,
    ) -> DispatchOutcome {
        loop {
            match sender.send_timeout(message, self.backpressure_poll) {
                Ok(()) => return DispatchOutcome::Delivered,
                Err(SendTimeoutError::Timeout(returned)) => {
                    if entry.is_retired() {
                        return DispatchOutcome::Retired;
                    }
                    trace!(key = %entry.key(), "queue full, waiting for consumer");
                    message = returned;
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    trace!(key = %entry.key(), "queue receiver dropped");
                    return DispatchOutcome::ReceiverGone;
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
