//! Errors surfaced by the priority queue.

use thiserror::Error;

use crate::model::ItemId;

/// Failures from [`crate::queue::PriorityQueue`] operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("item {0} is not present in the queue")]
    NotFound(ItemId),

    #[error("queue is at capacity ({capacity}) and no lower-priority item could be evicted")]
    Full { capacity: usize },
}
