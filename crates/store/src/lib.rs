//! Keel store: versioned desired state, the observed-state mirror and its
//! watchers, plus a keyed coalescing queue.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::hash::Hash;

use rustc_hash::FxHashMap;

pub mod desired;
pub mod observed;

pub use desired::{DesiredHandle, DesiredStateStore, StoreError};
pub use observed::{watch_kind, KindEvent, ObservedChange, ObservedHandle, ObservedMirror, ObservedStateWatcher, WatcherConfig};

/// Coalescing queue keyed by `K` with FIFO order and fixed capacity.
/// Pushing an existing key replaces its value in place; overflow drops the oldest key.
pub struct Coalescer<K, V> {
    map: FxHashMap<K, V>,
    order: VecDeque<K>,
    cap: usize,
    dropped: u64,
}

impl<K: Hash + Eq + Clone, V> Coalescer<K, V> {
    pub fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new(), cap: cap.max(1), dropped: 0 }
    }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
    pub fn dropped(&self) -> u64 { self.dropped }

    pub fn push(&mut self, key: K, value: V) {
        if !self.map.contains_key(&key) {
            if self.order.len() >= self.cap {
                if let Some(old) = self.order.pop_front() {
                    self.map.remove(&old);
                    self.dropped += 1;
                }
            }
            self.order.push_back(key.clone());
        }
        self.map.insert(key, value);
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let v = self.map.remove(key)?;
        self.order.retain(|k| k != key);
        Some(v)
    }

    /// Drain all currently coalesced values in first-push order.
    pub fn drain_ready(&mut self) -> Vec<V> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(k) = self.order.pop_front() {
            if let Some(v) = self.map.remove(&k) {
                out.push(v);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalescer_keeps_latest_value_in_first_seen_order() {
        let mut c = Coalescer::with_capacity(8);
        c.push("a", 1);
        c.push("b", 2);
        c.push("a", 3);
        assert_eq!(c.len(), 2);
        assert_eq!(c.drain_ready(), vec![3, 2]);
        assert!(c.is_empty());
    }

    #[test]
    fn coalescer_drops_oldest_on_overflow() {
        let mut c = Coalescer::with_capacity(2);
        c.push(1, "x");
        c.push(2, "y");
        c.push(3, "z");
        assert_eq!(c.dropped(), 1);
        assert_eq!(c.drain_ready(), vec!["y", "z"]);
    }

    #[test]
    fn coalescer_remove_forgets_key() {
        let mut c = Coalescer::with_capacity(4);
        c.push("a", 1);
        c.push("b", 2);
        assert_eq!(c.remove(&"a"), Some(1));
        assert_eq!(c.remove(&"a"), None);
        assert_eq!(c.drain_ready(), vec![2]);
    }
}
