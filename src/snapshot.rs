//! Prevents eviction from punching extents a live [`crate::reader::Reader`]
//! can still see. See spec.md §4.5 and §9 ("a mapping from extent to
//! reference count").

use dashmap::DashMap;

use crate::locator::Extent;

/// A registered set of pinned extents, returned by `register` and consumed
/// by `release` once the owning reader ends.
#[derive(Debug, Default)]
pub struct Snapshot {
    extents: Vec<Extent>,
}

impl Snapshot {
    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }
}

#[derive(Default)]
pub struct SnapshotManager {
    /// Extents pinned by at least one live snapshot, with their refcount.
    pins: DashMap<Extent, u32>,
    /// Extents freed from the manifest while still pinned; punched once
    /// their last pin is released, or by an explicit `sweep_orphaned`.
    orphaned: DashMap<Extent, ()>,
}

impl SnapshotManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, extents: Vec<Extent>) -> Snapshot {
        for &e in &extents {
            *self.pins.entry(e).or_insert(0) += 1;
        }
        Snapshot { extents }
    }

    pub fn is_pinned(&self, extent: &Extent) -> bool {
        self.pins.get(extent).map(|c| *c > 0).unwrap_or(false)
    }

    /// Called once a manifest transaction has deleted the row that owned
    /// `extent`. Returns `true` when it's safe to hole-punch immediately;
    /// `false` means a live snapshot still pins it, and it has been
    /// recorded as orphaned for later reclamation.
    pub fn mark_freed(&self, extent: Extent) -> bool {
        if self.is_pinned(&extent) {
            self.orphaned.insert(extent, ());
            false
        } else {
            true
        }
    }

    /// Decrements the refcount of every extent in `snapshot`. Returns the
    /// extents that just became punch-eligible (were orphaned and reached
    /// zero references).
    pub fn release(&self, snapshot: Snapshot) -> Vec<Extent> {
        let mut ready = Vec::new();
        for extent in snapshot.extents {
            let hit_zero = match self.pins.get_mut(&extent) {
                Some(mut count) => {
                    *count = count.saturating_sub(1);
                    *count == 0
                }
                None => false,
            };
            if hit_zero {
                self.pins.remove(&extent);
                if self.orphaned.remove(&extent).is_some() {
                    ready.push(extent);
                }
            }
        }
        ready
    }

    /// Explicit sweep for orphaned extents that are no longer pinned by
    /// anything. Used by `cleanup_snapshots`.
    pub fn sweep_orphaned(&self) -> Vec<Extent> {
        let mut ready = Vec::new();
        self.orphaned.retain(|extent, _| {
            if self.is_pinned(extent) {
                true
            } else {
                ready.push(*extent);
                false
            }
        });
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ext(offset: u64) -> Extent {
        Extent { file_id: 1, offset, length: 4 }
    }

    #[test]
    fn freed_unpinned_extent_punches_immediately() {
        let mgr = SnapshotManager::new();
        assert!(mgr.mark_freed(ext(0)));
    }

    #[test]
    fn freed_pinned_extent_waits_for_release() {
        let mgr = SnapshotManager::new();
        let snap = mgr.register(vec![ext(0)]);
        assert!(!mgr.mark_freed(ext(0)));
        let ready = mgr.release(snap);
        assert_eq!(ready, vec![ext(0)]);
    }

    #[test]
    fn multiple_pins_require_every_release() {
        let mgr = SnapshotManager::new();
        let s1 = mgr.register(vec![ext(0)]);
        let s2 = mgr.register(vec![ext(0)]);
        assert!(!mgr.mark_freed(ext(0)));
        assert!(mgr.release(s1).is_empty());
        assert_eq!(mgr.release(s2), vec![ext(0)]);
    }

    #[test]
    fn sweep_only_returns_unpinned_orphans() {
        let mgr = SnapshotManager::new();
        let snap = mgr.register(vec![ext(0)]);
        mgr.mark_freed(ext(0));
        assert!(mgr.sweep_orphaned().is_empty());
        mgr.release(snap);
        // release() already drained it via the ready path in this case,
        // so a second freed-while-unpinned extent exercises the sweep.
        mgr.mark_freed(ext(8));
        let snap2 = mgr.register(vec![ext(8)]);
        mgr.release(snap2);
        assert!(mgr.sweep_orphaned().is_empty());
    }
}
