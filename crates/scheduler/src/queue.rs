//! Multi-bucket blocking queue
//!
//! One FIFO bucket per [`Priority`], guarded by a single mutex/condvar pair. A
//! dequeue always takes the head of the most urgent non-empty bucket.

use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex, PoisonError},
};

use crate::{Priority, error::QueueClosed, utils::lock};

/// Items stored in a [`PriorityQueue`]
pub trait QueueItem {
    /// Items that always complete within their own dequeue step are excluded
    /// from [`PriorityQueue::has_async_commands`].
    fn is_sync(&self) -> bool {
        false
    }
}

struct Buckets<T> {
    buckets: [VecDeque<T>; Priority::COUNT],
    closed: bool,
    async_commands: usize,
}

impl<T: QueueItem> Buckets<T> {
    fn pop_most_urgent(&mut self) -> Option<T> {
        let item = self.buckets.iter_mut().find_map(VecDeque::pop_front)?;
        if !item.is_sync() {
            self.async_commands = self.async_commands.saturating_sub(1);
        }
        Some(item)
    }

    fn track(&mut self, item: &T) {
        if !item.is_sync() {
            self.async_commands += 1;
        }
    }
}

/// Priority ordered, closeable blocking queue
pub struct PriorityQueue<T> {
    state: Mutex<Buckets<T>>,
    available: Condvar,
}

impl<T: QueueItem> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: QueueItem> PriorityQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Buckets {
                buckets: std::array::from_fn(|_| VecDeque::new()),
                closed: false,
                async_commands: 0,
            }),
            available: Condvar::new(),
        }
    }

    /// Append `item` to the tail of its bucket
    ///
    /// A closed queue rejects the item and hands it back, so the caller can cancel it.
    pub fn put(&self, item: T, priority: Priority) -> Result<(), T> {
        self.insert(item, priority, false)
    }

    /// Insert `item` at the head of its bucket, ahead of queued work of the same priority
    pub fn push_back(&self, item: T, priority: Priority) -> Result<(), T> {
        self.insert(item, priority, true)
    }

    fn insert(&self, item: T, priority: Priority, front: bool) -> Result<(), T> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(item);
        }
        state.track(&item);
        let bucket = &mut state.buckets[priority.ordinal()];
        if front {
            bucket.push_front(item);
        } else {
            bucket.push_back(item);
        }
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Block until an item is available or the queue is closed
    ///
    /// A closed queue never yields items from here, even when some are left;
    /// those are only reachable through [`PriorityQueue::clear_queue`].
    pub fn get(&self) -> Result<T, QueueClosed> {
        let mut state = lock(&self.state);
        loop {
            if state.closed {
                return Err(QueueClosed);
            }
            if let Some(item) = state.pop_most_urgent() {
                return Ok(item);
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Close the queue and wake every waiter. Idempotent.
    pub fn close(&self) {
        let mut state = lock(&self.state);
        if !state.closed {
            tracing::debug!("closing command queue");
            state.closed = true;
        }
        drop(state);
        self.available.notify_all();
    }

    /// Re-open a closed queue, for restarting a scheduler
    pub fn reopen(&self) {
        lock(&self.state).closed = false;
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Remove and return every queued item, most urgent bucket first
    pub fn clear_queue(&self) -> Vec<T> {
        let mut state = lock(&self.state);
        state.async_commands = 0;
        state
            .buckets
            .iter_mut()
            .flat_map(|bucket| bucket.drain(..))
            .collect()
    }

    /// Whether any queued item may outlive its own dequeue step
    pub fn has_async_commands(&self) -> bool {
        lock(&self.state).async_commands > 0
    }

    pub fn len(&self) -> usize {
        lock(&self.state).buckets.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
