//! Subscription bookkeeping and message routing.
//!
//! This module holds the pieces the session composes:
//! - [`DesiredSet`]: what the application asked for, with delivery targets
//! - [`ActualTracker`]: what the server acknowledged on the current connection
//! - [`plan`] / [`evaluate`]: the diff between the two and the resulting state
//! - [`Dispatcher`]: routing of published messages to targets
//!
//! # Example
//!
//! ```ignore
//! let mut desired = DesiredSet::new();
//! let (target, receiver) = DeliveryTarget::queue(Some(64));
//! desired.insert(ChannelKey::pattern("news.*"), target);
//!
//! let mut actual = ActualTracker::new();
//! actual.reset(Some(ConnectionId(1)));
//!
//! // PSUBSCRIBE news.*
//! for command in plan(&desired, &mut actual).commands {
//!     connection.send_command(command)?;
//! }
//! ```

mod actual;
mod desired;
mod dispatch;
mod reconcile;
mod types;

pub use actual::ActualTracker;
pub use desired::{DesiredEntry, DesiredSet};
pub use dispatch::{DispatchCounts, DispatchOutcome, DispatchStats, Dispatcher};
pub use reconcile::{evaluate, plan, ReconcilePlan, SyncState};
pub use types::{DeliveryTarget, MessageReceiver};
