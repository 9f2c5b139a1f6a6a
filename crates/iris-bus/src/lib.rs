//! In-process typed event bus for the Iris gateway.
//!
//! Two delivery surfaces share one publication stream:
//!
//! - [`Subscriber`]: a push channel with a bounded per-subscriber ring
//!   buffer (socket observers). Slow subscribers lose oldest events rather
//!   than blocking publishers; losses are counted.
//! - [`SnapshotCell`]: the coalesced current value (`/state`,
//!   `/frame/latest`) plus bounded thought/action/chat histories.

pub mod bus;
pub mod state;

pub use bus::{EventBus, Subscriber, DEFAULT_SUBSCRIBER_CAPACITY};
pub use state::{ActivityEntry, SnapshotCell};
