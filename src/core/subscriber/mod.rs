//! Subscriptions and their delivery loop.
//!
//! One [`Subscription`] exists per (client, queue) pair. Its worker task pulls
//! from the queue competitively with every other subscription on that queue,
//! pushes each message through the client's outbound channel and, when asked
//! to, waits for the client's confirmation before taking the next one.

pub mod subscription;
pub(crate) mod worker;

pub use subscription::{ClusterStrategy, Subscription, SubscriptionOptions, WorkerState};
