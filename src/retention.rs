//! Bounded retention buffer with oldest-first eviction.

use std::collections::VecDeque;

/// Default retention capacity.
pub const DEFAULT_RETENTION_MAX: usize = 32;

/// Bounded FIFO history of recently pushed items.
#[derive(Clone, Debug)]
pub struct RetentionBuffer<T> {
    items: VecDeque<T>,
    max: usize,
}

impl<T> RetentionBuffer<T> {
    /// Create an empty buffer holding at most `max` items.
    pub fn new(max: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(max.min(DEFAULT_RETENTION_MAX)),
            max,
        }
    }

    /// Append an item, returning the evicted oldest item if over capacity.
    pub fn push(&mut self, item: T) -> Option<T> {
        self.items.push_back(item);
        if self.items.len() > self.max {
            self.items.pop_front()
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max
    }

    /// Drop all retained items.
    pub fn clear(&mut self) {
        self.items.clear();
        self.items.shrink_to_fit();
    }
}

impl<T: Clone> RetentionBuffer<T> {
    /// Copy of the retained items, oldest first.
    pub fn snapshot(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

impl<T> Default for RetentionBuffer<T> {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION_MAX)
    }
}
