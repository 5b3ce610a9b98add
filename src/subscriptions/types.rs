//! Delivery targets for published messages.

use crate::types::PublishedMessage;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::fmt;
use std::time::Duration;

type Callback = Box<dyn Fn(PublishedMessage) + Send + Sync>;

/// Where messages for a subscription go.
///
/// A callback runs on the dispatcher thread, once per message. A queue
/// buffers messages for the application to drain through a
/// [`MessageReceiver`].
pub struct DeliveryTarget {
    kind: TargetKind,
}

pub(crate) enum TargetKind {
    Callback(Callback),
    Queue(Sender<PublishedMessage>),
}

impl DeliveryTarget {
    /// Invoke `f` for every message.
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(PublishedMessage) + Send + Sync + 'static,
    {
        Self {
            kind: TargetKind::Callback(Box::new(f)),
        }
    }

    /// Invoke `f` for every message, passing `context` back unmodified.
    pub fn callback_with_context<C, F>(context: C, f: F) -> Self
    where
        C: Send + Sync + 'static,
        F: Fn(PublishedMessage, &C) + Send + Sync + 'static,
    {
        Self::callback(move |msg| f(msg, &context))
    }

    /// Queue messages for the application.
    ///
    /// `capacity` bounds the queue; `None` makes it unbounded. When a bounded
    /// queue is full the dispatcher waits for room rather than dropping.
    pub fn queue(capacity: Option<usize>) -> (Self, MessageReceiver) {
        let (sender, receiver) = match capacity {
            Some(cap) => bounded(cap),
            None => unbounded(),
        };
        let target = Self {
            kind: TargetKind::Queue(sender),
        };
        (target, MessageReceiver { receiver })
    }

    pub(crate) fn kind(&self) -> &TargetKind {
        &self.kind
    }
}

impl fmt::Debug for DeliveryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            TargetKind::Callback(_) => f.write_str("DeliveryTarget::Callback"),
            TargetKind::Queue(sender) => f
                .debug_struct("DeliveryTarget::Queue")
                .field("capacity", &sender.capacity())
                .field("len", &sender.len())
                .finish(),
        }
    }
}

/// Application side of a queue target.
///
/// Messages arrive in wire order. Once the session drops the target (on
/// unsubscribe or close) and the buffer drains, receives return `None`.
#[derive(Debug)]
pub struct MessageReceiver {
    receiver: Receiver<PublishedMessage>,
}

impl MessageReceiver {
    /// Wait for the next message.
    ///
    /// A zero `timeout` blocks until a message arrives or the target is
    /// dropped; it never times out.
    pub fn wait_for_message(&self, timeout: Duration) -> Option<PublishedMessage> {
        if timeout.is_zero() {
            self.receiver.recv().ok()
        } else {
            self.receiver.recv_timeout(timeout).ok()
        }
    }

    /// Take the next message if one is buffered.
    pub fn try_next(&self) -> Option<PublishedMessage> {
        self.receiver.try_recv().ok()
    }

    /// Number of buffered messages.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Underlying channel, for use with `crossbeam_channel::select!`.
    pub fn receiver(&self) -> &Receiver<PublishedMessage> {
        &self.receiver
    }

    /// Blocking iterator that ends when the target is dropped.
    pub fn iter(&self) -> crossbeam_channel::Iter<'_, PublishedMessage> {
        self.receiver.iter()
    }
}

impl<'a> IntoIterator for &'a MessageReceiver {
    type Item = PublishedMessage;
    type IntoIter = crossbeam_channel::Iter<'a, PublishedMessage>;

    fn into_iter(self) -> Self::IntoIter {
        self.receiver.iter()
    }
}
