//! Bounded event history.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// FIFO log that keeps only the most recent `capacity` entries
///
/// Used for decision logs, ledgers and finished-span lists, which would otherwise grow
/// for the life of the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundedLog<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedLog<T> {
    /// Empty log holding at most `capacity` entries (minimum 1)
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an entry, returning the evicted oldest entry if the log was full
    pub fn push(&mut self, entry: T) -> Option<T> {
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    /// Entries oldest first
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + '_ {
        self.entries.iter()
    }

    /// Up to `n` entries, newest first
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<T>
    where
        T: Clone,
    {
        self.entries.iter().rev().take(n).cloned().collect()
    }

    /// Newest entry
    #[must_use]
    pub fn last(&self) -> Option<&T> {
        self.entries.back()
    }

    /// Number of entries held
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of entries held
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_oldest_when_full() {
        let mut log = BoundedLog::new(3);
        assert_eq!(log.push(1), None);
        assert_eq!(log.push(2), None);
        assert_eq!(log.push(3), None);
        assert_eq!(log.push(4), Some(1));

        assert_eq!(log.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_recent_is_newest_first() {
        let mut log = BoundedLog::new(10);
        for i in 0..5 {
            log.push(i);
        }
        assert_eq!(log.recent(2), vec![4, 3]);
        assert_eq!(log.last(), Some(&4));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut log = BoundedLog::new(0);
        log.push("a");
        log.push("b");
        assert_eq!(log.capacity(), 1);
        assert_eq!(log.recent(5), vec!["b"]);
    }
}
