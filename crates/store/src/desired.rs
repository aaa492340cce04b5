//! Versioned cache of the desired state dictated by the control plane.
//!
//! The store is the only writer; readers get immutable snapshots through
//! [`DesiredHandle`] and never observe a partially applied update.

use std::sync::Arc;

use arc_swap::ArcSwap;
use keel_core::{DesiredDelta, DesiredStateSnapshot};
use metrics::{counter, gauge};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The update does not build on the store's generation; a full resync is needed.
    #[error("stale generation: store is at {current}, update based on {base}")]
    StaleGeneration { current: u64, base: u64 },
}

pub struct DesiredStateStore {
    snap: Arc<ArcSwap<DesiredStateSnapshot>>,
    gen_tx: watch::Sender<u64>,
    primed: bool,
}

/// Cloneable read side of the store.
#[derive(Clone)]
pub struct DesiredHandle {
    snap: Arc<ArcSwap<DesiredStateSnapshot>>,
    gen_rx: watch::Receiver<u64>,
}

impl DesiredHandle {
    pub fn current(&self) -> Arc<DesiredStateSnapshot> { self.snap.load_full() }
    pub fn generation(&self) -> u64 { self.snap.load().generation }
    pub fn subscribe_generation(&self) -> watch::Receiver<u64> { self.gen_rx.clone() }
}

impl DesiredStateStore {
    pub fn new() -> (Self, DesiredHandle) {
        let snap = Arc::new(ArcSwap::from_pointee(DesiredStateSnapshot::default()));
        let (gen_tx, gen_rx) = watch::channel(0u64);
        let handle = DesiredHandle { snap: Arc::clone(&snap), gen_rx };
        (Self { snap, gen_tx, primed: false }, handle)
    }

    pub fn generation(&self) -> u64 { self.snap.load().generation }
    pub fn current(&self) -> Arc<DesiredStateSnapshot> { self.snap.load_full() }

    /// True once a full snapshot has been applied.
    pub fn is_primed(&self) -> bool { self.primed }

    /// Replace the whole desired state. A snapshot older than the current
    /// generation is rejected; the same generation replaces idempotently.
    pub fn apply_full(&mut self, snapshot: DesiredStateSnapshot) -> Result<u64, StoreError> {
        let current = self.generation();
        if self.primed && snapshot.generation < current {
            counter!("desired_stale_total", 1u64);
            warn!(current, got = snapshot.generation, "rejecting full snapshot older than store");
            return Err(StoreError::StaleGeneration { current, base: snapshot.generation });
        }
        let generation = snapshot.generation;
        let count = snapshot.len();
        self.publish(snapshot);
        self.primed = true;
        info!(generation, resources = count, "desired state replaced");
        Ok(generation)
    }

    /// Apply an incremental change. Nothing is merged unless
    /// `delta.base_generation` equals the store's generation.
    pub fn apply_delta(&mut self, delta: DesiredDelta) -> Result<u64, StoreError> {
        let current = self.generation();
        if delta.base_generation != current || delta.generation <= delta.base_generation {
            counter!("desired_stale_total", 1u64);
            warn!(current, base = delta.base_generation, generation = delta.generation, "rejecting delta");
            return Err(StoreError::StaleGeneration { current, base: delta.base_generation });
        }
        let mut next = (*self.snap.load_full()).clone();
        for d in &delta.removals {
            next.resources.remove(d);
        }
        let (upserts, removals) = (delta.upserts.len(), delta.removals.len());
        for (d, spec) in delta.upserts {
            next.resources.insert(d, spec);
        }
        next.generation = delta.generation;
        self.publish(next);
        debug!(generation = delta.generation, upserts, removals, "desired delta applied");
        Ok(delta.generation)
    }

    fn publish(&self, snapshot: DesiredStateSnapshot) {
        let generation = snapshot.generation;
        gauge!("desired_generation", generation as f64);
        gauge!("desired_resources", snapshot.len() as f64);
        self.snap.store(Arc::new(snapshot));
        let _ = self.gen_tx.send(generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{DesiredSpec, ResourceDescriptor};

    fn d(name: &str) -> ResourceDescriptor { ResourceDescriptor::namespaced("v1/ConfigMap", "default", name) }
    fn spec(gen: u64) -> DesiredSpec { DesiredSpec::new(gen, serde_json::json!({"data": {"gen": gen.to_string()}})) }

    #[test]
    fn full_then_delta_advances_generation() {
        let (mut store, handle) = DesiredStateStore::new();
        store.apply_full(DesiredStateSnapshot::new(3).with(d("a"), spec(3)).with(d("b"), spec(2))).unwrap();
        assert!(store.is_primed());
        let delta = DesiredDelta { base_generation: 3, generation: 4, upserts: vec![(d("c"), spec(4))], removals: vec![d("b")] };
        assert_eq!(store.apply_delta(delta).unwrap(), 4);
        let snap = handle.current();
        assert_eq!(snap.generation, 4);
        assert!(snap.contains(&d("a")) && snap.contains(&d("c")) && !snap.contains(&d("b")));
        assert_eq!(*handle.subscribe_generation().borrow(), 4);
    }

    #[test]
    fn out_of_order_delta_is_rejected_without_partial_merge() {
        let (mut store, handle) = DesiredStateStore::new();
        store.apply_full(DesiredStateSnapshot::new(5).with(d("a"), spec(5))).unwrap();
        let before = handle.current();
        let delta = DesiredDelta { base_generation: 4, generation: 6, upserts: vec![(d("x"), spec(6))], removals: vec![d("a")] };
        assert_eq!(store.apply_delta(delta), Err(StoreError::StaleGeneration { current: 5, base: 4 }));
        let after = handle.current();
        assert_eq!(*before, *after);
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn delta_must_move_generation_forward() {
        let (mut store, _) = DesiredStateStore::new();
        store.apply_full(DesiredStateSnapshot::new(2)).unwrap();
        let delta = DesiredDelta { base_generation: 2, generation: 2, ..Default::default() };
        assert!(store.apply_delta(delta).is_err());
    }

    #[test]
    fn older_full_snapshot_is_rejected_and_equal_one_replaces() {
        let (mut store, handle) = DesiredStateStore::new();
        store.apply_full(DesiredStateSnapshot::new(7).with(d("a"), spec(7))).unwrap();
        assert!(store.apply_full(DesiredStateSnapshot::new(6)).is_err());
        store.apply_full(DesiredStateSnapshot::new(7).with(d("b"), spec(7))).unwrap();
        let snap = handle.current();
        assert!(snap.contains(&d("b")) && !snap.contains(&d("a")));
    }

    #[test]
    fn readers_keep_their_snapshot_across_writes() {
        let (mut store, handle) = DesiredStateStore::new();
        store.apply_full(DesiredStateSnapshot::new(1).with(d("a"), spec(1))).unwrap();
        let held = handle.current();
        store.apply_full(DesiredStateSnapshot::new(2)).unwrap();
        assert_eq!(held.generation, 1);
        assert!(held.contains(&d("a")));
        assert!(handle.current().is_empty());
    }
}
