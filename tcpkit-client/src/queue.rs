//! # Entry Queue
//!
//! Purpose: A double-ended queue safe to share between callers and the pool's
//! sweep task.
//!
//! Every operation takes the lock exactly once, so a pop never observes a
//! half-applied push.

use std::collections::VecDeque;

use parking_lot::RwLock;

/// Thread-safe FIFO/LIFO queue used by [`crate::Pool`].
#[derive(Debug)]
pub struct EntryQueue<T> {
    items: RwLock<VecDeque<T>>,
}

impl<T> Default for EntryQueue<T> {
    fn default() -> Self {
        EntryQueue::new()
    }
}

impl<T> EntryQueue<T> {
    /// Empty queue.
    pub fn new() -> Self {
        EntryQueue {
            items: RwLock::new(VecDeque::new()),
        }
    }

    /// Inserts at the head.
    pub fn push_front(&self, item: T) {
        self.items.write().push_front(item);
    }

    /// Appends at the tail.
    pub fn push_back(&self, item: T) {
        self.items.write().push_back(item);
    }

    /// Removes the head item.
    pub fn pop_front(&self) -> Option<T> {
        self.items.write().pop_front()
    }

    /// Removes the tail item.
    pub fn pop_back(&self) -> Option<T> {
        self.items.write().pop_back()
    }

    /// Removes and returns every item, head first.
    pub fn remove_all(&self) -> Vec<T> {
        self.items.write().drain(..).collect()
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }
}
