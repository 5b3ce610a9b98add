//! The subscription session tying desired state, actual state, reconciliation
//! and dispatch together.

use crate::connection::Connection;
use crate::error::{Result, SessionError};
use crate::subscriptions::{
    evaluate, plan, ActualTracker, DeliveryTarget, DesiredEntry, DesiredSet, DispatchCounts,
    DispatchOutcome, Dispatcher, MessageReceiver, SyncState,
};
use crate::types::{ChannelKey, ConnectionId, InboundFrame, PublishedFrame, SubscriptionMode};
use crossbeam_channel::{bounded, unbounded, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, trace, warn};

/// Session configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Whether the session talks to a cluster. Sharded subscriptions
    /// require it.
    pub cluster_mode: bool,

    /// Bound for queues created by [`PubSubSession::subscribe_queue`].
    /// `None` = unbounded.
    /// Default: 1024
    pub queue_capacity: Option<usize>,

    /// Period of the background reconciliation trigger (None = disabled).
    /// Default: 3000ms
    pub reconcile_interval_ms: Option<u64>,

    /// How often a delivery blocked on a full queue checks whether its
    /// subscription was removed.
    /// Default: 50ms
    pub backpressure_poll_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cluster_mode: false,
            queue_capacity: Some(1024),
            reconcile_interval_ms: Some(3000),
            backpressure_poll_ms: 50,
        }
    }
}

impl SessionConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: SessionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == Some(0) {
            return Err(SessionError::InvalidConfig(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.backpressure_poll_ms == 0 {
            return Err(SessionError::InvalidConfig(
                "backpressure_poll_ms must be positive".to_string(),
            ));
        }
        if self.reconcile_interval_ms == Some(0) {
            return Err(SessionError::InvalidConfig(
                "reconcile_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    fn reconcile_interval(&self) -> Option<Duration> {
        self.reconcile_interval_ms.map(Duration::from_millis)
    }

    fn backpressure_poll(&self) -> Duration {
        Duration::from_millis(self.backpressure_poll_ms)
    }
}

/// Desired vs. actual subscriptions at one instant.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SubscriptionState {
    /// What the application asked for.
    pub desired: BTreeSet<ChannelKey>,
    /// What the server acknowledged on the current connection.
    pub actual: BTreeSet<ChannelKey>,
    /// Keys with a command in flight.
    pub pending: BTreeSet<ChannelKey>,
    /// Keys whose last subscribe was rejected; retried on the next trigger.
    pub failed: Vec<FailedSubscription>,
}

impl SubscriptionState {
    /// True when actual matches desired exactly.
    pub fn is_synchronized(&self) -> bool {
        self.desired == self.actual
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FailedSubscription {
    pub key: ChannelKey,
    pub reason: String,
}

/// Session counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub dispatch: DispatchCounts,
    /// Reconciliation passes that emitted commands.
    pub reconciliations: u64,
    pub commands_sent: u64,
    pub rejections: u64,
    /// Connections seen via `connection_available`.
    pub connections: u64,
    /// When the session last became synced (ms since Unix epoch).
    pub last_synced_ms: Option<u64>,
}

#[derive(Default)]
struct Counters {
    reconciliations: AtomicU64,
    commands_sent: AtomicU64,
    rejections: AtomicU64,
    connections: AtomicU64,
}

/// State guarded by the session's single lock.
struct Inner {
    desired: DesiredSet,
    actual: ActualTracker,
    connection: Option<Arc<dyn Connection>>,
    state: SyncState,
    last_synced_ms: Option<u64>,
    closed: bool,
}

enum WaitOutcome {
    Done,
    Rejected(String, Option<Arc<DesiredEntry>>),
    Cancelled,
    Closed,
}

/// A published frame resolved to its target on the read path.
struct DispatchJob {
    entry: Option<Arc<DesiredEntry>>,
    frame: PublishedFrame,
}

/// Client-side publish/subscribe session.
///
/// Keeps the desired subscription set converged onto whatever connection the
/// transport currently provides, and routes published messages from the
/// read path to delivery targets.
///
/// Threads: acknowledgements and rejections are applied on the caller's
/// read path. Published messages are resolved there and handed to one
/// dispatch thread per session, which runs callbacks and absorbs queue
/// backpressure in wire order.
///
/// Locking: desired and actual state share one mutex, held only for
/// bookkeeping and never across a send or a delivery. A second lock
/// serializes plan-and-send so commands reach the connection in plan order.
pub struct PubSubSession {
    config: SessionConfig,
    inner: Mutex<Inner>,
    /// Signalled on every bookkeeping change, for confirmation waits.
    changed: Condvar,
    send_lock: Mutex<()>,
    dispatcher: Arc<Dispatcher>,
    /// Dropping the sender ends the dispatch thread once it drains.
    dispatch_queue: Mutex<Option<Sender<DispatchJob>>>,
    counters: Counters,
    /// Dropping the sender stops the periodic reconciler.
    reconciler_stop: Mutex<Option<Sender<()>>>,
}

impl PubSubSession {
    /// Create a session. Starts the dispatch thread, and the periodic
    /// reconciler if configured.
    pub fn new(config: SessionConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let dispatcher = Arc::new(Dispatcher::new(config.backpressure_poll()));
        let dispatch_queue = Self::start_dispatcher(Arc::clone(&dispatcher))?;
        let session = Arc::new(Self {
            dispatcher,
            dispatch_queue: Mutex::new(Some(dispatch_queue)),
            inner: Mutex::new(Inner {
                desired: DesiredSet::new(),
                actual: ActualTracker::new(),
                connection: None,
                state: SyncState::Disconnected,
                last_synced_ms: None,
                closed: false,
            }),
            changed: Condvar::new(),
            send_lock: Mutex::new(()),
            counters: Counters::default(),
            reconciler_stop: Mutex::new(None),
            config,
        });

        if let Some(interval) = session.config.reconcile_interval() {
            let stop = Self::start_reconciler(Arc::downgrade(&session), interval)?;
            *session.reconciler_stop.lock() = Some(stop);
        }

        Ok(session)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn start_dispatcher(dispatcher: Arc<Dispatcher>) -> Result<Sender<DispatchJob>> {
        let (tx, rx) = unbounded::<DispatchJob>();
        thread::Builder::new()
            .name("pubsub-dispatch".to_string())
            .spawn(move || {
                for job in rx.iter() {
                    match job.entry {
                        Some(entry) => dispatcher.deliver(&entry, job.frame),
                        None => dispatcher.drop_unmatched(&job.frame),
                    };
                }
                trace!("dispatch thread finished");
            })?;
        Ok(tx)
    }

    fn start_reconciler(session: Weak<Self>, interval: Duration) -> Result<Sender<()>> {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        thread::Builder::new()
            .name("pubsub-reconciler".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => break,
                }
                let Some(strong) = session.upgrade() else {
                    break;
                };
                strong.reconcile_tick();
            })?;
        Ok(stop_tx)
    }

    // --- Application API ---

    /// Subscribe `key`, delivering to `target`.
    ///
    /// Replaces the target if `key` is already desired. Returns once the
    /// subscribe command is enqueued (or recorded, when disconnected); use
    /// [`subscribe_and_wait`](Self::subscribe_and_wait) to await the server.
    pub fn subscribe(&self, key: ChannelKey, target: DeliveryTarget) -> Result<()> {
        self.check_capability(&key)?;
        let replaced = {
            let mut guard = self.inner.lock();
            if guard.closed {
                return Err(SessionError::Closed);
            }
            guard.actual.forget_failure(&key);
            guard.desired.insert(key.clone(), target)
        };
        if let Some(old) = replaced {
            debug!(%key, "replacing delivery target");
            old.retire();
        }
        debug!(%key, "subscribe");
        self.reconcile();
        Ok(())
    }

    /// Subscribe with a queue target bounded by `queue_capacity`.
    pub fn subscribe_queue(&self, key: ChannelKey) -> Result<MessageReceiver> {
        let (target, receiver) = DeliveryTarget::queue(self.config.queue_capacity);
        self.subscribe(key, target)?;
        Ok(receiver)
    }

    /// Subscribe and wait until the server acknowledges `key`.
    ///
    /// A zero `timeout` waits indefinitely. If the server rejects the
    /// subscription the desired entry is removed and `Protocol` is returned.
    pub fn subscribe_and_wait(
        &self,
        key: ChannelKey,
        target: DeliveryTarget,
        timeout: Duration,
    ) -> Result<()> {
        self.subscribe(key.clone(), target)?;
        let outcome = self.wait_for(timeout, |inner| {
            if inner.closed {
                return Some(WaitOutcome::Closed);
            }
            if inner.actual.contains(&key) {
                return Some(WaitOutcome::Done);
            }
            if !inner.desired.contains(&key) {
                return Some(WaitOutcome::Cancelled);
            }
            let reason = inner.actual.failure(&key)?.to_string();
            inner.actual.forget_failure(&key);
            Some(WaitOutcome::Rejected(reason, inner.desired.remove(&key)))
        })?;
        self.finish_wait(key, outcome)
    }

    /// Remove `key` from the desired set. No-op if it is not desired.
    ///
    /// Once this returns, the removed target receives no further messages.
    pub fn unsubscribe(&self, key: &ChannelKey) -> Result<()> {
        let removed = {
            let mut guard = self.inner.lock();
            if guard.closed {
                return Err(SessionError::Closed);
            }
            guard.actual.forget_failure(key);
            guard.desired.remove(key)
        };
        if let Some(entry) = removed {
            debug!(%key, "unsubscribe");
            entry.retire();
            self.reconcile();
        }
        Ok(())
    }

    /// Unsubscribe and wait until the server no longer holds `key`.
    pub fn unsubscribe_and_wait(&self, key: &ChannelKey, timeout: Duration) -> Result<()> {
        self.unsubscribe(key)?;
        let outcome = self.wait_for(timeout, |inner| {
            if inner.closed {
                return Some(WaitOutcome::Closed);
            }
            let gone = !inner.actual.contains(key) && !inner.actual.is_unsubscribe_pending(key);
            gone.then_some(WaitOutcome::Done)
        })?;
        self.finish_wait(key.clone(), outcome)
    }

    /// Remove every desired key of `mode`.
    pub fn unsubscribe_mode(&self, mode: SubscriptionMode) -> Result<()> {
        let removed = {
            let mut guard = self.inner.lock();
            if guard.closed {
                return Err(SessionError::Closed);
            }
            guard.desired.remove_mode(mode)
        };
        if removed.is_empty() {
            return Ok(());
        }
        debug!(?mode, count = removed.len(), "unsubscribe mode");
        for entry in &removed {
            entry.retire();
        }
        {
            let mut guard = self.inner.lock();
            for entry in &removed {
                guard.actual.forget_failure(entry.key());
            }
        }
        self.reconcile();
        Ok(())
    }

    /// Desired and actual subscriptions.
    pub fn current_subscriptions(&self) -> SubscriptionState {
        let guard = self.inner.lock();
        SubscriptionState {
            desired: guard.desired.snapshot(),
            actual: guard.actual.snapshot(),
            pending: guard.actual.pending_snapshot(),
            failed: guard
                .actual
                .failed_snapshot()
                .into_iter()
                .map(|(key, reason)| FailedSubscription { key, reason })
                .collect(),
        }
    }

    pub fn sync_state(&self) -> SyncState {
        self.inner.lock().state
    }

    /// True when actual matches desired exactly.
    pub fn is_synchronized(&self) -> bool {
        let guard = self.inner.lock();
        guard.desired.len() == guard.actual.snapshot().len()
            && guard.desired.keys().all(|k| guard.actual.contains(k))
    }

    /// Block until actual matches desired, or `timeout` elapses.
    pub fn wait_synchronized(&self, timeout: Duration) -> Result<()> {
        let outcome = self.wait_for(timeout, |inner| {
            if inner.closed {
                return Some(WaitOutcome::Closed);
            }
            let synced = inner.desired.len() == inner.actual.snapshot().len()
                && inner.desired.keys().all(|k| inner.actual.contains(k));
            synced.then_some(WaitOutcome::Done)
        })?;
        match outcome {
            WaitOutcome::Closed => Err(SessionError::Closed),
            _ => Ok(()),
        }
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            dispatch: self.dispatcher.stats(),
            reconciliations: self.counters.reconciliations.load(Ordering::Relaxed),
            commands_sent: self.counters.commands_sent.load(Ordering::Relaxed),
            rejections: self.counters.rejections.load(Ordering::Relaxed),
            connections: self.counters.connections.load(Ordering::Relaxed),
            last_synced_ms: self.inner.lock().last_synced_ms,
        }
    }

    /// Close the session.
    ///
    /// Detaches the dispatcher and discards the desired set. Queue targets
    /// are dropped without flushing; their receivers drain what is buffered
    /// and then end. Subsequent calls return `Closed`.
    pub fn close(&self) {
        let entries = {
            let mut guard = self.inner.lock();
            if guard.closed {
                return;
            }
            guard.closed = true;
            guard.connection = None;
            guard.actual.reset(None);
            guard.state = SyncState::Disconnected;
            self.changed.notify_all();
            guard.desired.drain()
        };
        self.reconciler_stop.lock().take();
        self.dispatch_queue.lock().take();
        for entry in &entries {
            entry.retire();
        }
        info!(dropped = entries.len(), "session closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    // --- Connection lifecycle ---

    /// A new physical connection is ready. Actual state restarts empty.
    pub fn connection_available(&self, connection: Arc<dyn Connection>) {
        let id = connection.id();
        let desired = {
            let mut guard = self.inner.lock();
            if guard.closed {
                return;
            }
            guard.actual.reset(Some(id));
            guard.connection = Some(connection);
            self.refresh_state(&mut guard);
            guard.desired.len()
        };
        self.counters.connections.fetch_add(1, Ordering::Relaxed);
        info!(connection = %id, desired, "connection available");
        self.reconcile();
    }

    /// The current connection is gone. Clears actual state and any
    /// in-flight bookkeeping.
    pub fn connection_lost(&self) {
        let mut guard = self.inner.lock();
        let Some(connection) = guard.connection.take() else {
            return;
        };
        guard.actual.reset(None);
        self.refresh_state(&mut guard);
        info!(connection = %connection.id(), "connection lost");
    }

    pub fn current_connection(&self) -> Option<ConnectionId> {
        self.inner.lock().actual.connection()
    }

    // --- Read path ---

    /// Handle one frame from the read path of `connection`.
    ///
    /// Never blocks on delivery: published messages are queued for the
    /// dispatch thread. They are delivered even if they arrive on a
    /// connection that is no longer current; acknowledgements from such a
    /// connection are ignored.
    pub fn handle_frame(&self, connection: ConnectionId, frame: InboundFrame) {
        match frame {
            InboundFrame::Published(frame) => {
                let job = DispatchJob {
                    entry: self.route(&frame),
                    frame,
                };
                let rejected = match self.dispatch_queue.lock().as_ref() {
                    Some(queue) => queue.send(job).err().map(|e| e.into_inner()),
                    None => Some(job),
                };
                if let Some(job) = rejected {
                    self.dispatcher.drop_unmatched(&job.frame);
                }
            }
            InboundFrame::SubscribeAck(key) => self.on_subscribe_ack(connection, key),
            InboundFrame::UnsubscribeAck(key) => self.on_unsubscribe_ack(connection, key),
            InboundFrame::Rejected { command, reason } => {
                let mut guard = self.inner.lock();
                if !guard.actual.is_current(connection) {
                    trace!(%connection, %command, "ignoring rejection from stale connection");
                    return;
                }
                self.counters.rejections.fetch_add(1, Ordering::Relaxed);
                let subscribe = command.verb.is_subscribe();
                for key in command.keys() {
                    guard.actual.on_rejected(&key, subscribe, &reason);
                }
                self.refresh_state(&mut guard);
                warn!(%command, %reason, "server rejected command");
            }
        }
    }

    /// Deliver one published frame on the calling thread.
    ///
    /// Blocks while the target's queue is full. The read path uses
    /// [`handle_frame`](Self::handle_frame) instead.
    pub fn dispatch(&self, frame: PublishedFrame) -> DispatchOutcome {
        match self.route(&frame) {
            Some(entry) => self.dispatcher.deliver(&entry, frame),
            None => self.dispatcher.drop_unmatched(&frame),
        }
    }

    fn route(&self, frame: &PublishedFrame) -> Option<Arc<DesiredEntry>> {
        let key = frame.subscription_key()?;
        let guard = self.inner.lock();
        if guard.closed {
            None
        } else {
            guard.desired.get(&key)
        }
    }

    fn on_subscribe_ack(&self, connection: ConnectionId, key: ChannelKey) {
        let orphan = {
            let mut guard = self.inner.lock();
            if !guard.actual.is_current(connection) {
                trace!(%connection, %key, "ignoring ack from stale connection");
                return;
            }
            guard.actual.on_subscribed(&key);
            let orphan =
                !guard.desired.contains(&key) && !guard.actual.is_unsubscribe_pending(&key);
            self.refresh_state(&mut guard);
            orphan
        };
        trace!(%key, "subscribed");
        if orphan {
            debug!(%key, "acknowledged key no longer desired");
            self.reconcile();
        }
    }

    fn on_unsubscribe_ack(&self, connection: ConnectionId, key: ChannelKey) {
        let resubscribe = {
            let mut guard = self.inner.lock();
            if !guard.actual.is_current(connection) {
                trace!(%connection, %key, "ignoring ack from stale connection");
                return;
            }
            let requested = guard.actual.is_unsubscribe_pending(&key);
            guard.actual.on_unsubscribed(&key);
            let resubscribe =
                guard.desired.contains(&key) && !guard.actual.is_subscribe_pending(&key);
            if resubscribe && !requested {
                info!(%key, "server dropped a desired subscription, resubscribing");
            }
            self.refresh_state(&mut guard);
            resubscribe
        };
        if resubscribe {
            self.reconcile();
        }
    }

    // --- Reconciliation ---

    /// Issue whatever commands close the gap between desired and actual.
    ///
    /// Returns the number of keys addressed. Does nothing when disconnected.
    pub fn reconcile(&self) -> usize {
        let _send = self.send_lock.lock();
        let (plan, connection) = {
            let mut guard = self.inner.lock();
            if guard.closed {
                return 0;
            }
            let Some(connection) = guard.connection.clone() else {
                return 0;
            };
            let inner = &mut *guard;
            let plan = plan(&inner.desired, &mut inner.actual);
            if plan.is_empty() {
                self.refresh_state(&mut guard);
                return 0;
            }
            (plan, connection)
        };

        self.counters.reconciliations.fetch_add(1, Ordering::Relaxed);
        let keys = plan.key_count();
        debug!(
            connection = %connection.id(),
            commands = plan.commands.len(),
            keys,
            "reconciling"
        );

        let mut unsent = Vec::new();
        for command in plan.commands {
            let addressed: Vec<ChannelKey> = command.keys().collect();
            trace!(%command, "sending");
            match connection.send_command(command) {
                Ok(()) => {
                    self.counters.commands_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    // The transport reports the loss separately; leave the
                    // keys unmarked so the next trigger resends them.
                    warn!(connection = %connection.id(), error = %e, "failed to send command");
                    unsent.extend(addressed);
                }
            }
        }

        let mut guard = self.inner.lock();
        if guard.actual.is_current(connection.id()) {
            for key in &unsent {
                guard.actual.clear_pending(key);
            }
        }
        self.refresh_state(&mut guard);
        keys
    }

    /// Periodic trigger: retry while out of sync or holding failures.
    fn reconcile_tick(&self) {
        let due = {
            let guard = self.inner.lock();
            !guard.closed
                && guard.connection.is_some()
                && (guard.state != SyncState::Synced || guard.actual.has_failures())
        };
        if due {
            trace!("periodic reconciliation");
            self.reconcile();
        }
    }

    // --- Helpers ---

    fn check_capability(&self, key: &ChannelKey) -> Result<()> {
        if key.mode == SubscriptionMode::Sharded && !self.config.cluster_mode {
            return Err(SessionError::Capability(format!(
                "sharded subscription to '{}' requires a cluster-mode session",
                key.name
            )));
        }
        Ok(())
    }

    fn refresh_state(&self, inner: &mut Inner) {
        let next = evaluate(&inner.desired, &inner.actual);
        if next != inner.state {
            debug!(from = ?inner.state, to = ?next, "sync state changed");
            if next == SyncState::Synced {
                inner.last_synced_ms = Some(now_ms());
            }
            inner.state = next;
        }
        self.changed.notify_all();
    }

    fn wait_for<F>(&self, timeout: Duration, mut check: F) -> Result<WaitOutcome>
    where
        F: FnMut(&mut Inner) -> Option<WaitOutcome>,
    {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        let mut guard = self.inner.lock();
        loop {
            if let Some(outcome) = check(&mut *guard) {
                return Ok(outcome);
            }
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut guard, deadline).timed_out() {
                        return match check(&mut *guard) {
                            Some(outcome) => Ok(outcome),
                            None => Err(SessionError::Timeout(timeout)),
                        };
                    }
                }
                None => self.changed.wait(&mut guard),
            }
        }
    }

    fn finish_wait(&self, key: ChannelKey, outcome: WaitOutcome) -> Result<()> {
        match outcome {
            WaitOutcome::Done => Ok(()),
            WaitOutcome::Closed => Err(SessionError::Closed),
            WaitOutcome::Cancelled => Err(SessionError::Cancelled(key)),
            WaitOutcome::Rejected(reason, removed) => {
                if let Some(entry) = removed {
                    entry.retire();
                }
                Err(SessionError::Protocol { key, reason })
            }
        }
    }
}

impl Drop for PubSubSession {
    fn drop(&mut self) {
        self.reconciler_stop.get_mut().take();
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::types::{Command, Verb};
    use std::sync::atomic::AtomicUsize;

    /// Connection that records commands without answering.
    struct Recorder {
        id: ConnectionId,
        sent: Mutex<Vec<Command>>,
        fail: bool,
    }

    impl Recorder {
        fn new(id: u64) -> Arc<Self> {
            Arc::new(Self {
                id: ConnectionId(id),
                sent: Mutex::new(Vec::new()),
                fail: false,
            })
        }

        fn failing(id: u64) -> Arc<Self> {
            Arc::new(Self {
                id: ConnectionId(id),
                sent: Mutex::new(Vec::new()),
                fail: true,
            })
        }

        fn take(&self) -> Vec<Command> {
            std::mem::take(&mut *self.sent.lock())
        }
    }

    impl Connection for Recorder {
        fn id(&self) -> ConnectionId {
            self.id
        }

        fn send_command(&self, command: Command) -> std::result::Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::Closed);
            }
            self.sent.lock().push(command);
            Ok(())
        }
    }

    fn session() -> Arc<PubSubSession> {
        PubSubSession::new(SessionConfig {
            reconcile_interval_ms: None,
            ..Default::default()
        })
        .unwrap()
    }

    fn ack_all(session: &PubSubSession, conn: &Recorder) {
        for command in conn.take() {
            for key in command.keys() {
                let frame = if command.verb.is_subscribe() {
                    InboundFrame::SubscribeAck(key)
                } else {
                    InboundFrame::UnsubscribeAck(key)
                };
                session.handle_frame(conn.id, frame);
            }
        }
    }

    #[test]
    fn test_subscribe_while_disconnected_is_recorded() {
        let session = session();
        session
            .subscribe(ChannelKey::exact("a"), DeliveryTarget::callback(|_| {}))
            .unwrap();

        let state = session.current_subscriptions();
        assert_eq!(state.desired.len(), 1);
        assert!(state.actual.is_empty());
        assert_eq!(session.sync_state(), SyncState::Disconnected);
    }

    #[test]
    fn test_connect_subscribes_missing_keys_in_batches() {
        let session = session();
        session.subscribe(ChannelKey::exact("b"), DeliveryTarget::callback(|_| {})).unwrap();
        session.subscribe(ChannelKey::exact("a"), DeliveryTarget::callback(|_| {})).unwrap();
        session.subscribe(ChannelKey::pattern("p*"), DeliveryTarget::callback(|_| {})).unwrap();

        let conn = Recorder::new(1);
        session.connection_available(conn.clone());
        let sent = conn.take();
        assert_eq!(
            sent,
            vec![
                Command::new(Verb::Subscribe, vec!["a".into(), "b".into()]),
                Command::new(Verb::PSubscribe, vec!["p*".into()]),
            ]
        );
        assert_eq!(session.sync_state(), SyncState::Reconciling);

        for command in sent {
            for key in command.keys() {
                session.handle_frame(conn.id, InboundFrame::SubscribeAck(key));
            }
        }
        assert_eq!(session.sync_state(), SyncState::Synced);
        assert!(session.is_synchronized());
        assert!(session.stats().last_synced_ms.is_some());
    }

    #[test]
    fn test_connection_lost_clears_actual_and_reconnect_resubscribes() {
        let session = session();
        let conn = Recorder::new(1);
        session.connection_available(conn.clone());
        session.subscribe(ChannelKey::exact("a"), DeliveryTarget::callback(|_| {})).unwrap();
        ack_all(&session, &conn);
        assert!(session.is_synchronized());

        session.connection_lost();
        assert!(session.current_subscriptions().actual.is_empty());
        assert_eq!(session.sync_state(), SyncState::Disconnected);

        let conn2 = Recorder::new(2);
        session.connection_available(conn2.clone());
        assert_eq!(
            conn2.take(),
            vec![Command::new(Verb::Subscribe, vec!["a".into()])]
        );
    }

    #[test]
    fn test_stale_ack_is_ignored() {
        let session = session();
        let conn = Recorder::new(1);
        session.connection_available(conn.clone());
        session.subscribe(ChannelKey::exact("a"), DeliveryTarget::callback(|_| {})).unwrap();
        session.connection_lost();
        session.connection_available(Recorder::new(2));

        session.handle_frame(ConnectionId(1), InboundFrame::SubscribeAck(ChannelKey::exact("a")));
        assert!(session.current_subscriptions().actual.is_empty());
    }

    #[test]
    fn test_unsubscribe_emits_command_and_ack_removes() {
        let session = session();
        let conn = Recorder::new(1);
        session.connection_available(conn.clone());
        let key = ChannelKey::pattern("news.*");
        session.subscribe(key.clone(), DeliveryTarget::callback(|_| {})).unwrap();
        ack_all(&session, &conn);

        session.unsubscribe(&key).unwrap();
        let sent = conn.take();
        assert_eq!(
            sent,
            vec![Command::new(Verb::PUnsubscribe, vec!["news.*".into()])]
        );
        // Lagging acknowledgement: still in actual until the server confirms.
        assert!(session.current_subscriptions().actual.contains(&key));

        session.handle_frame(conn.id, InboundFrame::UnsubscribeAck(key.clone()));
        let state = session.current_subscriptions();
        assert!(state.actual.is_empty());
        assert!(state.desired.is_empty());
    }

    #[test]
    fn test_unsubscribe_unknown_key_is_noop() {
        let session = session();
        let conn = Recorder::new(1);
        session.connection_available(conn.clone());
        session.unsubscribe(&ChannelKey::exact("never")).unwrap();
        assert!(conn.take().is_empty());
    }

    #[test]
    fn test_sharded_rejected_on_standalone() {
        let session = session();
        let result = session.subscribe(ChannelKey::sharded("s"), DeliveryTarget::callback(|_| {}));
        assert!(matches!(result, Err(SessionError::Capability(_))));
        assert!(session.current_subscriptions().desired.is_empty());
    }

    #[test]
    fn test_rejection_recorded_and_retried_on_next_trigger() {
        let session = session();
        let conn = Recorder::new(1);
        session.connection_available(conn.clone());
        let key = ChannelKey::exact("secret");
        session.subscribe(key.clone(), DeliveryTarget::callback(|_| {})).unwrap();
        let command = conn.take().remove(0);

        session.handle_frame(
            conn.id,
            InboundFrame::Rejected {
                command,
                reason: "NOPERM".to_string(),
            },
        );
        let state = session.current_subscriptions();
        assert_eq!(state.failed.len(), 1);
        assert_eq!(state.failed[0].reason, "NOPERM");
        assert_eq!(session.stats().rejections, 1);
        // No immediate retry.
        assert!(conn.take().is_empty());

        // Another desired mutation is a trigger.
        session.subscribe(ChannelKey::exact("other"), DeliveryTarget::callback(|_| {})).unwrap();
        let sent = conn.take();
        assert_eq!(
            sent,
            vec![Command::new(Verb::Subscribe, vec!["other".into(), "secret".into()])]
        );
    }

    #[test]
    fn test_send_failure_leaves_keys_for_next_trigger() {
        let session = session();
        session.connection_available(Recorder::failing(1));
        session.subscribe(ChannelKey::exact("a"), DeliveryTarget::callback(|_| {})).unwrap();
        assert!(session.current_subscriptions().pending.is_empty());

        session.connection_lost();
        let conn = Recorder::new(2);
        session.connection_available(conn.clone());
        assert_eq!(conn.take().len(), 1);
    }

    #[test]
    fn test_server_initiated_unsubscribe_resubscribes() {
        let session = PubSubSession::new(SessionConfig {
            cluster_mode: true,
            reconcile_interval_ms: None,
            ..Default::default()
        })
        .unwrap();
        let conn = Recorder::new(1);
        session.connection_available(conn.clone());
        let key = ChannelKey::sharded("orders");
        session.subscribe(key.clone(), DeliveryTarget::callback(|_| {})).unwrap();
        ack_all(&session, &conn);

        session.handle_frame(conn.id, InboundFrame::UnsubscribeAck(key.clone()));
        assert_eq!(
            conn.take(),
            vec![Command::new(Verb::SSubscribe, vec!["orders".into()])]
        );
    }

    #[test]
    fn test_orphan_ack_triggers_unsubscribe() {
        let session = session();
        let conn = Recorder::new(1);
        session.connection_available(conn.clone());
        let key = ChannelKey::exact("brief");
        session.subscribe(key.clone(), DeliveryTarget::callback(|_| {})).unwrap();
        session.unsubscribe(&key).unwrap();
        let sent = conn.take();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].verb == Verb::Unsubscribe);

        // Acks arrive in wire order.
        session.handle_frame(conn.id, InboundFrame::SubscribeAck(key.clone()));
        assert!(conn.take().is_empty());
        session.handle_frame(conn.id, InboundFrame::UnsubscribeAck(key));
        assert!(session.is_synchronized());
    }

    #[test]
    fn test_full_queue_does_not_block_read_path() {
        let session = PubSubSession::new(SessionConfig {
            queue_capacity: Some(1),
            reconcile_interval_ms: None,
            ..Default::default()
        })
        .unwrap();
        let conn = Recorder::new(1);
        session.connection_available(conn.clone());
        let _undrained = session.subscribe_queue(ChannelKey::exact("full")).unwrap();
        session
            .subscribe(ChannelKey::exact("next"), DeliveryTarget::callback(|_| {}))
            .unwrap();

        for _ in 0..4 {
            session.handle_frame(
                conn.id,
                InboundFrame::Published(PublishedFrame::exact("full", b"x".to_vec())),
            );
        }
        ack_all(&session, &conn);
        assert!(session.is_synchronized());
    }

    #[test]
    fn test_cross_unsubscribing_callbacks_on_two_read_paths() {
        let session = session();
        let calls = Arc::new(AtomicUsize::new(0));
        for (own, other) in [("a", "b"), ("b", "a")] {
            let weak = Arc::downgrade(&session);
            let calls = Arc::clone(&calls);
            let other = ChannelKey::exact(other);
            session
                .subscribe(
                    ChannelKey::exact(own),
                    DeliveryTarget::callback(move |_| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(20));
                        if let Some(session) = weak.upgrade() {
                            session.unsubscribe(&other).unwrap();
                        }
                    }),
                )
                .unwrap();
        }
        session.connection_available(Recorder::new(1));
        session.connection_lost();
        session.connection_available(Recorder::new(2));

        // The stale connection's reader and the current one run concurrently
        let readers: Vec<_> = [(1, "a"), (2, "b")]
            .into_iter()
            .map(|(id, channel)| {
                let session = Arc::clone(&session);
                thread::spawn(move || {
                    session.handle_frame(
                        ConnectionId(id),
                        InboundFrame::Published(PublishedFrame::exact(channel, b"x".to_vec())),
                    )
                })
            })
            .collect();
        for reader in readers {
            reader.join().unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        let settled = |s: DispatchCounts| s.delivered + s.dropped_retired + s.dropped_unknown;
        while settled(session.stats().dispatch) < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let stats = session.stats().dispatch;
        assert_eq!(settled(stats), 2);
        assert_eq!(stats.delivered, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.current_subscriptions().desired.len(), 1);
    }

    #[test]
    fn test_subscribe_and_wait_times_out_when_disconnected() {
        let session = session();
        let result = session.subscribe_and_wait(
            ChannelKey::exact("a"),
            DeliveryTarget::callback(|_| {}),
            Duration::from_millis(30),
        );
        assert!(matches!(result, Err(SessionError::Timeout(_))));
        // Intent is kept; it will be reconciled on connect.
        assert_eq!(session.current_subscriptions().desired.len(), 1);
    }

    #[test]
    fn test_close_discards_desired_and_rejects_calls() {
        let session = session();
        let rx = session.subscribe_queue(ChannelKey::exact("a")).unwrap();
        session.close();

        assert!(session.is_closed());
        assert!(session.current_subscriptions().desired.is_empty());
        assert!(rx.wait_for_message(Duration::ZERO).is_none());
        assert!(matches!(
            session.subscribe(ChannelKey::exact("b"), DeliveryTarget::callback(|_| {})),
            Err(SessionError::Closed)
        ));
    }

    #[test]
    fn test_config_from_json() {
        let config = SessionConfig::from_json(r#"{"cluster_mode": true, "queue_capacity": null}"#)
            .unwrap();
        assert!(config.cluster_mode);
        assert_eq!(config.queue_capacity, None);
        assert_eq!(config.backpressure_poll_ms, 50);

        let invalid = SessionConfig::from_json(r#"{"queue_capacity": 0}"#);
        assert!(matches!(invalid, Err(SessionError::InvalidConfig(_))));
        let malformed = SessionConfig::from_json("{");
        assert!(matches!(malformed, Err(SessionError::InvalidConfig(_))));
    }
}
