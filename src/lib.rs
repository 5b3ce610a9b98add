//! # PubSub Sync
//!
//! Client-side publish/subscribe session management that keeps subscriptions
//! alive across reconnects.
//!
//! ## Core Concepts
//!
//! - **Desired state**: the subscriptions the application asked for
//! - **Actual state**: what the server acknowledged on the current connection
//! - **Reconciliation**: batched commands that close the gap between the two
//! - **Delivery targets**: a callback or a bounded queue per subscription
//!
//! ## Example
//!
//! ```ignore
//! use pubsub_sync::{ChannelKey, DeliveryTarget, PubSubSession, SessionConfig};
//!
//! let session = PubSubSession::new(SessionConfig::default())?;
//!
//! // Callback target
//! session.subscribe(
//!     ChannelKey::exact("orders"),
//!     DeliveryTarget::callback(|msg| println!("{}: {:?}", msg.channel, msg.payload_str())),
//! )?;
//!
//! // Queue target
//! let news = session.subscribe_queue(ChannelKey::pattern("news.*"))?;
//!
//! // The transport reports connections and feeds frames in
//! session.connection_available(connection);
//! run_read_loop(&session, connection_id, frames);
//! ```

pub mod connection;
pub mod error;
#[cfg(feature = "mock")]
pub mod mock;
pub mod session;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use connection::{run_read_loop, Connection};
pub use error::{Result, SessionError, TransportError};
pub use session::{
    FailedSubscription, PubSubSession, SessionConfig, SessionStats, SubscriptionState,
};
pub use subscriptions::{
    DeliveryTarget, DispatchCounts, DispatchOutcome, MessageReceiver, ReconcilePlan, SyncState,
};
pub use types::*;
