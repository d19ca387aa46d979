//! The lifecycle root: owns the manifest, value pool, and snapshot
//! registry for one storage directory, and serialises instance-wide
//! operations across it. See spec.md §4.3.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::batch::BatchWriter;
use crate::error::{Error, Result};
use crate::item::{Item, Stat};
use crate::limits::Limits;
use crate::locator::Locator;
use crate::manifest::Manifest;
use crate::pool::ValueFilePool;
use crate::reader::Reader;
use crate::snapshot::{Snapshot, SnapshotManager};

/// Shared state behind every [`Handle`], [`BatchWriter`], [`Reader`], and
/// [`crate::reader::Value`] issued from it. Kept alive by whichever of
/// those objects has the longest lifetime (spec.md §9: "a weak
/// back-reference is insufficient because committing a Writer requires
/// mutating the Handle").
pub struct Inner {
    pub(crate) manifest: Manifest,
    pub(crate) pool: ValueFilePool,
    pub(crate) snapshots: SnapshotManager,
    pub(crate) limits: RwLock<Limits>,
    /// Serialises the two instance-wide operations, `set_limits` and
    /// `cleanup_snapshots`, against each other (both take the write side).
    /// Ordinary commits and reads don't contend on this lock at all; the
    /// manifest already gives them their own transaction isolation.
    instance_lock: RwLock<()>,
    hole_punch_supported: bool,
}

impl Inner {
    /// Hole-punches every `(key, locator)` pair freed by a commit or
    /// eviction, unless a live snapshot still pins the extent (in which
    /// case it's recorded as orphaned for `cleanup_snapshots` or the
    /// snapshot's own release to reclaim later).
    pub(crate) fn reclaim(&self, freed: Vec<(Vec<u8>, Locator)>) {
        let disable = self.limits.read().unwrap().disable_hole_punching;
        for (key, locator) in freed {
            let extent = locator.extent();
            if disable {
                continue;
            }
            if self.snapshots.mark_freed(extent) {
                if let Err(e) = self.pool.punch_extent(&extent) {
                    warn!(key = %String::from_utf8_lossy(&key), error = %e, "failed to hole-punch freed extent");
                }
            }
        }
    }

    pub(crate) fn reclaim_snapshot(&self, snapshot: Snapshot) {
        let disable = self.limits.read().unwrap().disable_hole_punching;
        let ready = self.snapshots.release(snapshot);
        if disable {
            return;
        }
        for extent in ready {
            if let Err(e) = self.pool.punch_extent(&extent) {
                warn!(error = %e, "failed to hole-punch extent released by reader_end");
            }
        }
    }

    fn run_eviction(&self) -> Result<()> {
        let max = self.limits.read().unwrap().max_value_length_sum;
        let freed = self
            .manifest
            .with_transaction(|tx| crate::eviction::evict_to_fit(tx, max))?;
        self.reclaim(freed);
        Ok(())
    }
}

/// A process-local owner of a storage directory: the entry point for every
/// operation in the store.
///
/// Shared-ownership: cloning a `Handle` is cheap and every clone refers to
/// the same underlying store. The last clone to drop closes the manifest
/// connection and releases every cached value-file descriptor — there is
/// no explicit `close`, unlike the C ABI this engine's contract describes.
#[derive(Clone)]
pub struct Handle(pub(crate) Arc<Inner>);

impl Handle {
    /// Opens (creating if necessary) the store directory at `path`.
    ///
    /// Verifies hole-punch capability unless `disable_hole_punching` is
    /// set later via [`Handle::set_limits`] before the first eviction.
    /// Cleans up any scratch files orphaned by a prior crashed run.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        fs::create_dir_all(path)?;
        let manifest = Manifest::open(path)?;
        let pool = ValueFilePool::open(path)?;
        let hole_punch_supported = pool.probe_hole_punch_support()?;
        let limits = Limits::default();
        if !limits.disable_hole_punching && !hole_punch_supported {
            return Err(Error::UnsupportedFilesystem);
        }
        debug!(path = %path.display(), hole_punch_supported, "opened possum store");
        Ok(Handle(Arc::new(Inner {
            manifest,
            pool,
            snapshots: SnapshotManager::new(),
            limits: RwLock::new(limits),
            instance_lock: RwLock::new(()),
            hole_punch_supported,
        })))
    }

    /// Allowed at any time. Lowering `max_value_length_sum` triggers
    /// eviction immediately, not just on the next mutating commit.
    pub fn set_limits(&self, limits: Limits) -> Result<()> {
        let _guard = self.0.instance_lock.write().unwrap();
        if !limits.disable_hole_punching && !self.0.hole_punch_supported {
            return Err(Error::UnsupportedFilesystem);
        }
        *self.0.limits.write().unwrap() = limits;
        drop(_guard);
        self.0.run_eviction()
    }

    /// Opens a new batch writer for staging atomic multi-value commits.
    pub fn new_writer(&self) -> BatchWriter {
        BatchWriter::new(Arc::clone(&self.0))
    }

    /// Opens a new reader for taking a consistent multi-key snapshot.
    pub fn new_reader(&self) -> Reader {
        Reader::new(Arc::clone(&self.0))
    }

    /// Implemented as a single-value `BatchWriter` commit, to share the
    /// same atomicity and eviction path as batched writes (spec.md §4.3).
    pub fn single_write(&self, key: &[u8], value: &[u8]) -> Result<u64> {
        use std::io::Write;
        let mut writer = self.new_writer();
        let mut value_writer = writer.start_new_value()?;
        value_writer.write_all(value)?;
        writer.stage(key.to_vec(), value_writer);
        writer.commit()?;
        Ok(value.len() as u64)
    }

    /// Cheap: does not touch the value file.
    pub fn single_stat(&self, key: &[u8]) -> Result<Option<Stat>> {
        Ok(self.0.manifest.get(key)?.map(|l| Stat {
            last_used: l.last_used,
            size: l.length,
        }))
    }

    /// Implemented as a minimal single-key `Reader`, so the extent being
    /// read is pinned against a concurrent delete's or eviction's
    /// hole-punch for as long as the read is in flight (spec.md §4.3, §5).
    /// Updates `last_used` on success, per invariant 5.
    pub fn single_read_at(&self, key: &[u8], buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut reader = self.new_reader();
        let value = reader.add(key.to_vec());
        reader.begin()?;
        value.read_at(buf, offset)
    }

    /// Returns `NoSuchKey` if the key is absent; otherwise the stat of the
    /// deleted entry.
    ///
    /// Resolves and pins the key through a minimal single-key `Reader`
    /// first, the same way `single_read_at` does, so the freed extent
    /// can't be punched out from under a reader that began concurrently
    /// but before this call's own manifest delete lands.
    pub fn single_delete(&self, key: &[u8]) -> Result<Stat> {
        let mut reader = self.new_reader();
        reader.add(key.to_vec());
        reader.begin()?;
        let locator = self.0.manifest.delete(key)?;
        let stat = Stat {
            last_used: locator.last_used,
            size: locator.length,
        };
        self.0.reclaim(vec![(key.to_vec(), locator)]);
        Ok(stat)
    }

    /// Lexicographically-ordered `(key, stat)` pairs whose key starts with `prefix`.
    pub fn list_items(&self, prefix: &[u8]) -> Result<Vec<Item>> {
        self.0.manifest.list(prefix)
    }

    /// Atomically rewrites every key starting with `from` to instead start
    /// with `to`. Pure metadata: no value bytes move.
    pub fn move_prefix(&self, from: &[u8], to: &[u8]) -> Result<()> {
        self.0.manifest.move_prefix(from, to)
    }

    /// Deletes every key starting with `prefix`, hole-punching their
    /// extents (subject to snapshot pinning). Returns the number deleted.
    pub fn delete_prefix(&self, prefix: &[u8]) -> Result<u64> {
        let freed = self.0.manifest.delete_prefix(prefix)?;
        let count = freed.len() as u64;
        self.0.reclaim(
            freed
                .into_iter()
                .map(|locator| (Vec::new(), locator))
                .collect(),
        );
        Ok(count)
    }

    /// Explicit sweep: punches orphaned extents no longer pinned by any
    /// live snapshot.
    pub fn cleanup_snapshots(&self) -> Result<()> {
        let _guard = self.0.instance_lock.write().unwrap();
        for extent in self.0.snapshots.sweep_orphaned() {
            self.0.pool.punch(&extent)?;
        }
        Ok(())
    }

    /// The directory this handle was opened against.
    pub fn store_path(&self) -> PathBuf {
        // Recoverable from either store component; the pool's values
        // directory is the more stable anchor since the manifest db's
        // connection doesn't retain its own path publicly.
        self.0.pool.store_dir()
    }
}
