//! Tombstone-based max-heap priority queue (§4.3).
//!
//! `std::collections::BinaryHeap` has no arbitrary-position removal or
//! key update, so entries are logically deleted with a generation
//! tombstone and popped lazily; the heap is allowed `O(n)` for `Remove`
//! by its own contract, so the occasional stale-entry skip on pop is
//! within budget.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::SystemTime;

use crate::model::ItemId;
use crate::queue::error::QueueError;
use crate::queue::item::QueueEntry;

/// A heap-ordered entry. Ties on `composite_priority` favor the older
/// `enqueued_at`, i.e. ascending age order among equal priorities.
struct HeapEntry {
    item_id: ItemId,
    composite_priority: i64,
    enqueued_at: SystemTime,
    /// Matched against the live generation in `PriorityQueue::generations`;
    /// a mismatch means this slot was removed or superseded by a reprioritize.
    generation: u64,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.composite_priority == other.composite_priority && self.enqueued_at == other.enqueued_at
    }
}
impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.composite_priority
            .cmp(&other.composite_priority)
            .then_with(|| other.enqueued_at.cmp(&self.enqueued_at))
    }
}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A capacity-bounded, thread-safe-by-caller max-heap over [`QueueEntry`]s.
///
/// Not internally synchronized; callers share it behind a `Mutex` or
/// similar, matching the "single consumer loop per worker" contract (§4.3).
pub struct PriorityQueue {
    capacity: usize,
    heap: BinaryHeap<HeapEntry>,
    /// Current generation per live item id; bumped on reprioritize, removed
    /// on pop/remove. A popped `HeapEntry` whose generation doesn't match is
    /// a tombstone and is discarded rather than returned.
    generations: HashMap<ItemId, (u64, i64, SystemTime)>,
}

/// Outcome of a [`PriorityQueue::push`] that overflowed capacity.
#[derive(Debug, PartialEq, Eq)]
pub struct Evicted {
    pub item_id: ItemId,
}

impl PriorityQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            heap: BinaryHeap::new(),
            generations: HashMap::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.generations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.generations.is_empty()
    }

    /// Inserts `entry`. If the queue is already at capacity, the
    /// lowest-priority live entry (which may be `entry` itself) is evicted
    /// and returned.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Full`] only in the degenerate case where
    /// capacity is zero, so nothing can ever be admitted.
    pub fn push(&mut self, entry: QueueEntry) -> Result<Option<Evicted>, QueueError> {
        if self.capacity == 0 {
            return Err(QueueError::Full { capacity: 0 });
        }

        let generation = self
            .generations
            .get(&entry.item_id)
            .map_or(0, |(g, _, _)| g + 1);
        self.generations.insert(
            entry.item_id,
            (generation, entry.composite_priority, entry.enqueued_at),
        );
        self.heap.push(HeapEntry {
            item_id: entry.item_id,
            composite_priority: entry.composite_priority,
            enqueued_at: entry.enqueued_at,
            generation,
        });

        if self.generations.len() > self.capacity {
            return Ok(self.evict_lowest_priority());
        }
        Ok(None)
    }

    /// Scans all live entries for the minimum priority (ties broken by
    /// newest `enqueued_at`, the opposite of pop order) and removes it.
    /// `O(n)`; only reached on overflow, an infrequent path by design.
    fn evict_lowest_priority(&mut self) -> Option<Evicted> {
        let victim = self
            .generations
            .iter()
            .min_by(|a, b| {
                let (_, pa, ta) = a.1;
                let (_, pb, tb) = b.1;
                pa.cmp(pb).then_with(|| ta.cmp(tb))
            })
            .map(|(id, _)| *id)?;

        self.generations.remove(&victim);
        Some(Evicted { item_id: victim })
    }

    /// Removes and returns the highest-priority live entry.
    pub fn pop(&mut self) -> Option<QueueEntry> {
        while let Some(top) = self.heap.pop() {
            match self.generations.get(&top.item_id) {
                Some(&(g, _, _)) if g == top.generation => {
                    self.generations.remove(&top.item_id);
                    return Some(QueueEntry {
                        item_id: top.item_id,
                        composite_priority: top.composite_priority,
                        enqueued_at: top.enqueued_at,
                        estimated_seconds: None,
                    });
                }
                _ => continue,
            }
        }
        None
    }

    /// Returns the highest-priority live entry without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<ItemId> {
        self.heap
            .iter()
            .filter(|e| {
                self.generations
                    .get(&e.item_id)
                    .is_some_and(|&(g, _, _)| g == e.generation)
            })
            .max()
            .map(|e| e.item_id)
    }

    /// Logically removes `id`. `O(n)` worst case per the queue's own
    /// contract: the tombstoned entry is skipped lazily on its eventual pop
    /// rather than excised from the heap's backing vector immediately.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NotFound`] if `id` is not currently queued.
    pub fn remove(&mut self, id: ItemId) -> Result<(), QueueError> {
        if self.generations.remove(&id).is_none() {
            return Err(QueueError::NotFound(id));
        }
        Ok(())
    }

    /// Updates the composite priority of a live entry by bumping its
    /// generation and pushing a fresh heap entry; the old one tombstones.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NotFound`] if `id` is not currently queued.
    pub fn reprioritize(&mut self, id: ItemId, new_priority: i64) -> Result<(), QueueError> {
        let Some(&(generation, _, enqueued_at)) = self.generations.get(&id) else {
            return Err(QueueError::NotFound(id));
        };
        let next_generation = generation + 1;
        self.generations.insert(id, (next_generation, new_priority, enqueued_at));
        self.heap.push(HeapEntry {
            item_id: id,
            composite_priority: new_priority,
            enqueued_at,
            generation: next_generation,
        });
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, id: ItemId) -> bool {
        self.generations.contains_key(&id)
    }
}
