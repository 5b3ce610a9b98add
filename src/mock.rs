//! In-process server simulation for tests, benches and demos.
//!
//! [`MockServer`] keeps a per-connection subscription registry and answers
//! commands the way a key-value server's pubsub layer does: one ack frame per
//! key, in order, on the connection's frame channel. [`MockDriver`] plays the
//! transport, reconnecting whenever the server kills its connection.

use crate::connection::{run_read_loop, Connection};
use crate::error::{Result, TransportError};
use crate::session::PubSubSession;
use crate::types::{ChannelKey, Command, ConnectionId, InboundFrame, PublishedFrame, SubscriptionMode};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace};

struct Client {
    frames: Sender<InboundFrame>,
    subscriptions: HashSet<ChannelKey>,
}

impl Client {
    fn push(&self, frame: InboundFrame) {
        // The reader may already be gone; the connection is being torn down.
        let _ = self.frames.send(frame);
    }
}

#[derive(Default)]
struct ServerState {
    clients: HashMap<ConnectionId, Client>,
    /// Names whose subscribe is refused with NOPERM.
    denied: HashSet<String>,
    /// When set, every command fails to reach the server.
    broken_writes: bool,
    next_id: u64,
}

/// Simulated pubsub server.
pub struct MockServer {
    cluster: bool,
    state: Mutex<ServerState>,
}

impl MockServer {
    pub fn standalone() -> Arc<Self> {
        Self::new(false)
    }

    pub fn cluster() -> Arc<Self> {
        Self::new(true)
    }

    fn new(cluster: bool) -> Arc<Self> {
        Arc::new(Self {
            cluster,
            state: Mutex::new(ServerState::default()),
        })
    }

    /// Accept a new connection. The receiver yields every frame the server
    /// pushes and disconnects when the connection is killed.
    pub fn open_connection(self: &Arc<Self>) -> (Arc<MockConnection>, Receiver<InboundFrame>) {
        let (tx, rx) = unbounded();
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = ConnectionId(state.next_id);
        state.clients.insert(
            id,
            Client {
                frames: tx,
                subscriptions: HashSet::new(),
            },
        );
        debug!(connection = %id, "mock connection opened");
        let connection = Arc::new(MockConnection {
            id,
            server: Arc::clone(self),
        });
        (connection, rx)
    }

    fn execute(&self, id: ConnectionId, command: Command) -> std::result::Result<(), TransportError> {
        let mut state = self.state.lock();
        let state = &mut *state;
        let client = state.clients.get_mut(&id).ok_or(TransportError::Closed)?;
        if state.broken_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "simulated write failure").into());
        }
        trace!(connection = %id, %command, "mock executing");

        let mode = command.verb.mode();
        if mode == SubscriptionMode::Sharded && !self.cluster {
            let reason = format!("ERR unknown command '{}'", command.verb);
            client.push(InboundFrame::Rejected { command, reason });
            return Ok(());
        }

        if command.verb.is_subscribe() {
            for key in command.keys() {
                if state.denied.contains(&key.name) {
                    client.push(InboundFrame::Rejected {
                        command: Command::new(command.verb, vec![key.name.clone()]),
                        reason: format!(
                            "NOPERM User has no permissions to access the '{}' channel",
                            key.name
                        ),
                    });
                    continue;
                }
                client.subscriptions.insert(key.clone());
                client.push(InboundFrame::SubscribeAck(key));
            }
        } else {
            for key in command.keys() {
                client.subscriptions.remove(&key);
                client.push(InboundFrame::UnsubscribeAck(key));
            }
        }
        Ok(())
    }

    /// PUBLISH. Returns the number of subscriptions that received it.
    pub fn publish(&self, channel: &str, payload: &[u8]) -> usize {
        let state = self.state.lock();
        let exact = ChannelKey::exact(channel);
        let mut receivers = 0;
        for client in state.clients.values() {
            if client.subscriptions.contains(&exact) {
                client.push(InboundFrame::Published(PublishedFrame::exact(
                    channel,
                    payload.to_vec(),
                )));
                receivers += 1;
            }
            for key in &client.subscriptions {
                if key.mode == SubscriptionMode::Pattern && glob_matches(&key.name, channel) {
                    client.push(InboundFrame::Published(PublishedFrame::pattern(
                        key.name.clone(),
                        channel,
                        payload.to_vec(),
                    )));
                    receivers += 1;
                }
            }
        }
        receivers
    }

    /// SPUBLISH. Returns the number of sharded subscribers that received it.
    pub fn spublish(&self, channel: &str, payload: &[u8]) -> usize {
        let state = self.state.lock();
        let key = ChannelKey::sharded(channel);
        let mut receivers = 0;
        for client in state.clients.values() {
            if client.subscriptions.contains(&key) {
                client.push(InboundFrame::Published(PublishedFrame::sharded(
                    channel,
                    payload.to_vec(),
                )));
                receivers += 1;
            }
        }
        receivers
    }

    /// Drop a connection. Its frame channel disconnects.
    pub fn kill_connection(&self, id: ConnectionId) -> bool {
        let killed = self.state.lock().clients.remove(&id).is_some();
        if killed {
            debug!(connection = %id, "mock connection killed");
        }
        killed
    }

    pub fn kill_all(&self) -> usize {
        let mut state = self.state.lock();
        let count = state.clients.len();
        state.clients.clear();
        count
    }

    /// Unsubscribe `key` on the server's initiative, as a cluster does when
    /// a slot migrates.
    pub fn drop_subscription(&self, id: ConnectionId, key: &ChannelKey) -> bool {
        let mut state = self.state.lock();
        let Some(client) = state.clients.get_mut(&id) else {
            return false;
        };
        if !client.subscriptions.remove(key) {
            return false;
        }
        client.push(InboundFrame::UnsubscribeAck(key.clone()));
        true
    }

    /// Make every command fail at the write, as a half-closed socket does.
    pub fn break_writes(&self, broken: bool) {
        self.state.lock().broken_writes = broken;
    }

    /// Refuse future subscriptions to `name`.
    pub fn deny(&self, name: &str) {
        self.state.lock().denied.insert(name.to_string());
    }

    pub fn allow(&self, name: &str) {
        self.state.lock().denied.remove(name);
    }

    /// PUBSUB CHANNELS: exact channels with at least one subscriber.
    pub fn channels(&self) -> BTreeSet<String> {
        self.names_of(SubscriptionMode::Exact)
    }

    /// PUBSUB SHARDCHANNELS.
    pub fn shard_channels(&self) -> BTreeSet<String> {
        self.names_of(SubscriptionMode::Sharded)
    }

    /// PUBSUB NUMPAT: distinct patterns across all connections.
    pub fn numpat(&self) -> usize {
        self.names_of(SubscriptionMode::Pattern).len()
    }

    pub fn subscriptions_of(&self, id: ConnectionId) -> BTreeSet<ChannelKey> {
        self.state
            .lock()
            .clients
            .get(&id)
            .map(|c| c.subscriptions.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.state.lock().clients.keys().copied().collect();
        ids.sort_by_key(|id| id.0);
        ids
    }

    fn names_of(&self, mode: SubscriptionMode) -> BTreeSet<String> {
        self.state
            .lock()
            .clients
            .values()
            .flat_map(|c| c.subscriptions.iter())
            .filter(|k| k.mode == mode)
            .map(|k| k.name.clone())
            .collect()
    }
}

fn glob_matches(pattern: &str, channel: &str) -> bool {
    glob::Pattern::new(pattern)
        .map(|p| p.matches(channel))
        .unwrap_or(false)
}

/// Client end of a [`MockServer`] connection.
pub struct MockConnection {
    id: ConnectionId,
    server: Arc<MockServer>,
}

impl Connection for MockConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send_command(&self, command: Command) -> std::result::Result<(), TransportError> {
        self.server.execute(self.id, command)
    }
}

/// Connection layer for a session against a [`MockServer`].
///
/// Connects, reports the connection, runs the read loop until the server
/// kills the connection, reports the loss, and reconnects after
/// `reconnect_delay`. Stops on [`stop`](Self::stop) or drop.
pub struct MockDriver {
    server: Arc<MockServer>,
    stopping: Arc<AtomicBool>,
    current: Arc<Mutex<Option<ConnectionId>>>,
    handle: Option<JoinHandle<()>>,
}

impl MockDriver {
    pub fn start(
        server: Arc<MockServer>,
        session: Arc<PubSubSession>,
        reconnect_delay: Duration,
    ) -> Result<Self> {
        let stopping = Arc::new(AtomicBool::new(false));
        let current = Arc::new(Mutex::new(None));

        let handle = {
            let server = Arc::clone(&server);
            let stopping = Arc::clone(&stopping);
            let current = Arc::clone(&current);
            thread::Builder::new()
                .name("mock-driver".to_string())
                .spawn(move || loop {
                    let (connection, frames) = server.open_connection();
                    let id = connection.id();
                    *current.lock() = Some(id);
                    if stopping.load(Ordering::SeqCst) {
                        server.kill_connection(id);
                        break;
                    }

                    session.connection_available(connection);
                    run_read_loop(&session, id, frames);
                    session.connection_lost();

                    if stopping.load(Ordering::SeqCst) {
                        break;
                    }
                    thread::sleep(reconnect_delay);
                })?
        };

        Ok(Self {
            server,
            stopping,
            current,
            handle: Some(handle),
        })
    }

    /// Connection the driver is currently reading from.
    pub fn current_connection(&self) -> Option<ConnectionId> {
        *self.current.lock()
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.stopping.store(true, Ordering::SeqCst);
        if let Some(id) = *self.current.lock() {
            self.server.kill_connection(id);
        }
        let _ = handle.join();
    }
}

impl Drop for MockDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &Receiver<InboundFrame>) -> Vec<InboundFrame> {
        rx.try_iter().collect()
    }

    #[test]
    fn test_subscribe_acks_each_key_in_order() {
        let server = MockServer::standalone();
        let (conn, rx) = server.open_connection();
        conn.send_command(Command::new(
            crate::types::Verb::Subscribe,
            vec!["a".into(), "b".into()],
        ))
        .unwrap();

        assert_eq!(
            drain(&rx),
            vec![
                InboundFrame::SubscribeAck(ChannelKey::exact("a")),
                InboundFrame::SubscribeAck(ChannelKey::exact("b")),
            ]
        );
        assert_eq!(server.channels().len(), 2);
    }

    #[test]
    fn test_pattern_publish_uses_glob_matching() {
        let server = MockServer::standalone();
        let (conn, rx) = server.open_connection();
        conn.send_command(Command::new(crate::types::Verb::PSubscribe, vec!["news.*".into()]))
            .unwrap();
        drain(&rx);

        assert_eq!(server.publish("news.sports", b"goal"), 1);
        assert_eq!(server.publish("weather", b"rain"), 0);
        assert_eq!(
            drain(&rx),
            vec![InboundFrame::Published(PublishedFrame::pattern(
                "news.*",
                "news.sports",
                b"goal".to_vec()
            ))]
        );
        assert_eq!(server.numpat(), 1);
    }

    #[test]
    fn test_denied_names_are_rejected() {
        let server = MockServer::standalone();
        server.deny("secret");
        let (conn, rx) = server.open_connection();
        conn.send_command(Command::new(
            crate::types::Verb::Subscribe,
            vec!["open".into(), "secret".into()],
        ))
        .unwrap();

        let frames = drain(&rx);
        assert_eq!(frames[0], InboundFrame::SubscribeAck(ChannelKey::exact("open")));
        assert!(matches!(&frames[1], InboundFrame::Rejected { reason, .. } if reason.starts_with("NOPERM")));
    }

    #[test]
    fn test_sharded_rejected_on_standalone() {
        let server = MockServer::standalone();
        let (conn, rx) = server.open_connection();
        conn.send_command(Command::new(crate::types::Verb::SSubscribe, vec!["s".into()]))
            .unwrap();
        assert!(matches!(drain(&rx)[0], InboundFrame::Rejected { .. }));
    }

    #[test]
    fn test_killed_connection_refuses_commands() {
        let server = MockServer::standalone();
        let (conn, rx) = server.open_connection();
        assert!(server.kill_connection(conn.id()));

        let result = conn.send_command(Command::new(crate::types::Verb::Subscribe, vec!["a".into()]));
        assert!(matches!(result, Err(TransportError::Closed)));
        assert!(rx.recv().is_err());
    }

    #[test]
    fn test_broken_writes_fail_with_io_error() {
        let server = MockServer::standalone();
        let (conn, rx) = server.open_connection();
        server.break_writes(true);

        let result = conn.send_command(Command::new(crate::types::Verb::Subscribe, vec!["a".into()]));
        assert!(matches!(result, Err(TransportError::Io(_))));
        assert!(drain(&rx).is_empty());
        assert!(server.channels().is_empty());
    }
}
