//! switchboard-scheduler - Priority delivery for routed messages
//!
//! Routed messages are bucketed into high/normal/low FIFO queues and drained
//! by a single timer-driven loop. Delivery is at-most-once per
//! (message id, receiver id) pair with no retry.

pub mod queue;
pub mod runner;

pub use queue::{Envelope, PriorityQueue, QueueDepth};
pub use runner::{DeliveryScheduler, DeliveryStats, SchedulerConfig};
