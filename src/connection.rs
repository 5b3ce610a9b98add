//! The seam to the transport layer.
//!
//! Connection establishment, TLS, authentication and cluster routing live
//! outside this crate. A transport exposes each physical connection as a
//! [`Connection`] and reports lifecycle events to the session:
//!
//! 1. [`PubSubSession::connection_available`] once per successful (re)connect
//! 2. [`PubSubSession::handle_frame`] for every inbound frame, in wire order
//!    (or [`run_read_loop`] over a frame channel)
//! 3. [`PubSubSession::connection_lost`] once per detected disconnect, before
//!    reconnecting

use crate::error::TransportError;
use crate::session::PubSubSession;
use crate::types::{Command, ConnectionId, InboundFrame};
use crossbeam_channel::Receiver;
use tracing::debug;

/// One physical connection to the server.
///
/// `send_command` only enqueues; acknowledgements and rejections come back on
/// the read path as [`InboundFrame`]s. It must not call back into the session.
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    fn send_command(&self, command: Command) -> Result<(), TransportError>;
}

/// Drain `frames` into the session on the calling thread.
///
/// Returns when the channel disconnects, which signals the connection closed.
/// Returns the number of frames handled.
pub fn run_read_loop(
    session: &PubSubSession,
    connection: ConnectionId,
    frames: Receiver<InboundFrame>,
) -> u64 {
    let mut handled = 0;
    for frame in frames.iter() {
        session.handle_frame(connection, frame);
        handled += 1;
    }
    debug!(%connection, handled, "read loop finished");
    handled
}
