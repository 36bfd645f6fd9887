//! Bounded recency window for dropping re-delivered events.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

/// Default number of keys remembered.
pub const DEFAULT_DEDUP_WINDOW: usize = 10_000;

/// Remembers the last `capacity` distinct keys in insertion order.
///
/// A key seen again while still in the window is reported as a duplicate
/// and does not refresh its position.
#[derive(Debug)]
pub struct RecencyWindow<K> {
    capacity: usize,
    order: VecDeque<K>,
    seen: HashSet<K>,
}

impl<K: Eq + Hash + Clone> RecencyWindow<K> {
    /// Creates a window holding at most `capacity` keys.
    ///
    /// A capacity of zero disables deduplication.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity.min(DEFAULT_DEDUP_WINDOW)),
            seen: HashSet::with_capacity(capacity.min(DEFAULT_DEDUP_WINDOW)),
        }
    }

    /// Records `key`, returning `true` if it was not already in the window.
    pub fn insert(&mut self, key: K) -> bool {
        if self.capacity == 0 {
            return true;
        }
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        true
    }

    /// Returns true if `key` is currently in the window.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.seen.contains(key)
    }

    /// Number of keys currently remembered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns true if no keys are remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Maximum number of keys remembered.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}
