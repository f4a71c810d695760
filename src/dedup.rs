//! Bounded, insertion-order-evictable id set.
//!
//! Used anywhere the design calls for "a bounded set of seen/processed
//! ids" with LRU-style eviction: the router's global per-kind dedup
//! (capacity ≥ 8192), the Counts Aggregator's processed-event set, and
//! the Notifications Aggregator's seen-notification set.

use std::collections::{HashSet, VecDeque};

/// A `HashSet` for O(1) membership plus a `VecDeque` recording insertion
/// order so eviction is oldest-first once `capacity` is exceeded.
pub struct DedupSet {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl DedupSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns `true` if `id` was not already present (i.e. this call is
    /// the one that should proceed with whatever "first time seen" work
    /// is gated on dedup).
    pub fn insert(&mut self, id: impl Into<String>) -> bool {
        let id = id.into();
        if self.seen.contains(&id) {
            return false;
        }
        self.seen.insert(id.clone());
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Drop every member not in `keep`, used by C7's seen-set trim to the
    /// intersection with currently-known notification ids.
    pub fn retain_intersection(&mut self, keep: &HashSet<String>) {
        self.order.retain(|id| keep.contains(id));
        self.seen.retain(|id| keep.contains(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_insert_reports_new() {
        let mut d = DedupSet::new(4);
        assert!(d.insert("a"));
        assert!(!d.insert("a"));
    }

    #[test]
    fn evicts_oldest_past_capacity() {
        let mut d = DedupSet::new(2);
        d.insert("a");
        d.insert("b");
        d.insert("c");
        assert!(!d.contains("a"));
        assert!(d.contains("b"));
        assert!(d.contains("c"));
        assert_eq!(d.len(), 2);
    }

    #[test]
    fn retain_intersection_drops_unkept() {
        let mut d = DedupSet::new(8);
        d.insert("a");
        d.insert("b");
        let keep: HashSet<String> = ["b".to_string()].into_iter().collect();
        d.retain_intersection(&keep);
        assert!(!d.contains("a"));
        assert!(d.contains("b"));
    }
}
