//! A container of `key -> pinned Value` bindings, usable only after
//! `reader_begin` takes a snapshot. See spec.md §4.6.

use std::sync::{Arc, OnceLock};

use anyhow::anyhow;

use crate::error::{Error, Result};
use crate::handle::Inner;
use crate::item::{Item, Stat};
use crate::locator::Locator;
use crate::manifest::ReadSnapshot;
use crate::snapshot::Snapshot;
use crate::timestamp::Timestamp;

/// A value obtained from a [`Reader`], before or after the snapshot occurs.
///
/// Registering interest with `reader_add` returns a `Value` in an
/// unresolved state; it becomes readable only once `reader_begin` succeeds.
/// Valid between `reader_begin` and `reader_end`.
pub struct Value {
    key: Vec<u8>,
    locator: OnceLock<Locator>,
    handle: Arc<Inner>,
}

impl Value {
    /// The key this value was added under.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub(crate) fn handle(&self) -> &Arc<Inner> {
        &self.handle
    }

    pub(crate) fn locator(&self) -> Result<&Locator> {
        self.locator.get().ok_or_else(|| {
            Error::Any(anyhow!(
                "value is not yet resolved; reader_begin has not completed"
            ))
        })
    }

    /// Cheap: does not touch disk.
    pub fn stat(&self) -> Result<Stat> {
        let l = self.locator()?;
        Ok(Stat {
            last_used: l.last_used,
            size: l.length,
        })
    }

    /// Positional read. Short reads at end-of-value return fewer bytes than
    /// requested, never an error; reading past the end returns zero bytes.
    ///
    /// Updates `last_used`, per invariant 5.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let l = *self.locator()?;
        let n = self.handle.pool.read_at(&l, buf, offset)?;
        self.handle.manifest.touch(&self.key, Timestamp::now())?;
        Ok(n)
    }
}

/// Accumulates keys of interest, then resolves them all under one snapshot.
///
/// Not thread-safe to mutate concurrently, but the [`Value`]s it issues may
/// be read from multiple threads as long as the `Reader` outlives them.
pub struct Reader {
    handle: Arc<Inner>,
    values: Vec<Arc<Value>>,
    snapshot: Option<(Snapshot, ReadSnapshot)>,
}

impl Reader {
    pub(crate) fn new(handle: Arc<Inner>) -> Self {
        Reader {
            handle,
            values: Vec::new(),
            snapshot: None,
        }
    }

    /// Registers interest in `key`. The returned `Value` is not readable
    /// until `reader_begin` succeeds.
    pub fn add(&mut self, key: impl Into<Vec<u8>>) -> Arc<Value> {
        let value = Arc::new(Value {
            key: key.into(),
            locator: OnceLock::new(),
            handle: Arc::clone(&self.handle),
        });
        self.values.push(Arc::clone(&value));
        value
    }

    /// Takes a snapshot and resolves every key added so far. All keys are
    /// resolved atomically against one consistent manifest state; a key
    /// that cannot be resolved fails the whole call with `NoSuchKey`
    /// (spec.md §9's recommended resolution of the reader_begin Open
    /// Question — a missing key is a hard error, not a silently-absent
    /// slot, so callers can't mistake an unresolved `Value` for one that
    /// legitimately doesn't exist).
    pub fn begin(&mut self) -> Result<()> {
        let read_snapshot = self.handle.manifest.open_read_snapshot()?;
        let mut extents = Vec::with_capacity(self.values.len());
        let mut resolved = Vec::with_capacity(self.values.len());
        for value in &self.values {
            let locator = read_snapshot
                .get(&value.key)?
                .ok_or(Error::NoSuchKey)?;
            extents.push(locator.extent());
            resolved.push((Arc::clone(value), locator));
        }
        let snapshot = self.handle.snapshots.register(extents);
        for (value, locator) in resolved {
            // Every Value here was freshly allocated by `add` and never
            // resolved before, so this always succeeds.
            let _ = value.locator.set(locator);
        }
        self.snapshot = Some((snapshot, read_snapshot));
        Ok(())
    }

    /// Enumerates keys under `prefix` as seen by this reader's snapshot, or
    /// by a fresh manifest read if `begin` has not been called yet.
    pub fn list_items(&self, prefix: &[u8]) -> Result<Vec<Item>> {
        match &self.snapshot {
            Some((_, read_snapshot)) => read_snapshot.list(prefix),
            None => self.handle.manifest.list(prefix),
        }
    }

    /// Consumes the reader. Every `Value` it issued becomes invalid;
    /// reading from one afterward is a contract violation this crate does
    /// not attempt to detect at runtime (matching spec.md §4.6). Equivalent
    /// to simply dropping the `Reader` — this method exists so callers can
    /// spell the lifecycle step spec.md names explicitly.
    pub fn end(self) {
        drop(self)
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        if let Some((snapshot, _read_snapshot)) = self.snapshot.take() {
            self.handle.reclaim_snapshot(snapshot);
        }
    }
}
