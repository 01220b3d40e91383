//! Live order status fan-out.
//!
//! [`StatusBroadcastHub`] keeps, per order, the set of live subscribers and
//! the last known status. Subscribers joining late receive the cached status
//! before anything else.

mod hub;

pub use hub::{DEFAULT_BUFFER, StatusBroadcastHub, StatusMessage, SubscriberId, Subscription};
