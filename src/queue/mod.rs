//! Priority queue for pending download items (§4.3).
//!
//! A max-heap keyed by composite priority, with capacity-bounded overflow
//! eviction. Not internally synchronized; [`crate::scheduler::Scheduler`]
//! shares one instance behind a lock across producers and a single
//! consumer loop per worker.

mod error;
mod heap;
mod item;

pub use error::QueueError;
pub use heap::{Evicted, PriorityQueue};
pub use item::{composite_priority, QueueEntry};
