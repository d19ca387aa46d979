//! Atomic multi-value ingestion. See spec.md §4.4 for the state machine.

use std::collections::HashMap;
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::sync::Arc;

use anyhow::anyhow;

use crate::error::{Error, Result};
use crate::handle::Inner;
use crate::locator::Locator;
use crate::pool::{Placement, ScratchFile};
use crate::reader::Value;
use crate::timestamp::Timestamp;

/// The platform's native file descriptor type, as returned by [`ValueWriter::fd`].
#[cfg(unix)]
pub type RawFileHandle = std::os::unix::io::RawFd;

/// A scratch-file write session, exposing the raw fd the caller fills with
/// value bytes by whatever means it likes (positional writes, sendfile,
/// mmap). possum never buffers on the caller's behalf.
pub struct ValueWriter {
    scratch: ScratchFile,
}

impl ValueWriter {
    /// The raw file descriptor backing this value. Valid until the writer
    /// is staged or dropped.
    pub fn fd(&self) -> RawFileHandle {
        self.scratch.file().as_raw_fd()
    }
}

impl Write for ValueWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        // Appends at the file's current length: every ValueWriter starts
        // empty and this is the only writer of it, so tracking an offset
        // separately would just duplicate what the filesystem already knows.
        let mut offset = self.scratch.file().metadata()?.len();
        let mut written = 0;
        while written < buf.len() {
            let n = self.scratch.file().write_at(&buf[written..], offset)?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write_at wrote 0 bytes"));
            }
            written += n;
            offset += n as u64;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.scratch.file().sync_data()
    }
}

enum PendingValue {
    /// A scratch file filled via `start_new_value`/`writer_fd`, promoted
    /// into the pool as a standalone value file at commit time.
    Fresh(ScratchFile),
    /// The payload of an already-committed value, reflink-cloned into a
    /// fresh, disjoint extent at commit time (spec.md §4.2, §4.4).
    ClonedFrom(Locator),
}

enum StagedEntry {
    Set(PendingValue),
    /// A key to be removed as a side effect of `rename`'s source key.
    /// Tolerant of the key already being gone (a concurrent delete raced
    /// it) since the primary effect of `rename` is the new key landing.
    Remove,
}

/// Accumulates staged `(key, value)` pairs for one atomic commit.
///
/// Not thread-safe: one thread owns a `BatchWriter` at a time. Distinct
/// `BatchWriter`s on the same [`crate::Handle`] may proceed concurrently.
pub struct BatchWriter {
    handle: Arc<Inner>,
    staged: HashMap<Vec<u8>, StagedEntry>,
}

impl BatchWriter {
    pub(crate) fn new(handle: Arc<Inner>) -> Self {
        BatchWriter {
            handle,
            staged: HashMap::new(),
        }
    }

    /// Creates a scratch file in the store directory and returns a writer
    /// exposing its raw fd.
    pub fn start_new_value(&self) -> Result<ValueWriter> {
        let scratch = self.handle.pool.create_scratch_file()?;
        Ok(ValueWriter { scratch })
    }

    /// Stages `key` to take on `value_writer`'s bytes at commit. Replacing
    /// an already-staged key in the same batch drops the earlier
    /// `ValueWriter`, which deletes its scratch file.
    pub fn stage(&mut self, key: impl Into<Vec<u8>>, value_writer: ValueWriter) {
        self.staged.insert(
            key.into(),
            StagedEntry::Set(PendingValue::Fresh(value_writer.scratch)),
        );
    }

    /// Stages `new_key` to point, at commit, to a fresh clone of
    /// `existing_value`'s bytes, and stages removal of the key
    /// `existing_value` was read under. `existing_value` must come from a
    /// [`crate::reader::Reader`] on this same `Handle`.
    pub fn rename(&mut self, existing_value: &Value, new_key: impl Into<Vec<u8>>) -> Result<()> {
        if !Arc::ptr_eq(existing_value.handle(), &self.handle) {
            return Err(Error::Any(anyhow!(
                "rename across different Handles is not supported"
            )));
        }
        let source_locator = *existing_value.locator()?;
        let source_key = existing_value.key().to_vec();
        let new_key = new_key.into();
        self.staged.insert(
            new_key,
            StagedEntry::Set(PendingValue::ClonedFrom(source_locator)),
        );
        self.staged.insert(source_key, StagedEntry::Remove);
        Ok(())
    }

    /// Opens one manifest transaction: materialises every staged value,
    /// replaces manifest entries (capturing replaced locators), enforces
    /// `max_value_length_sum` by evicting least-recently-used entries, and
    /// hole-punches replaced/evicted locators after the transaction
    /// commits (subject to snapshot pinning).
    pub fn commit(self) -> Result<()> {
        enum Action {
            Insert(Placement),
            Remove,
        }

        let mut actions = Vec::with_capacity(self.staged.len());
        for (key, entry) in self.staged {
            let action = match entry {
                StagedEntry::Set(PendingValue::Fresh(scratch)) => {
                    Action::Insert(self.handle.pool.promote_scratch(scratch)?)
                }
                StagedEntry::Set(PendingValue::ClonedFrom(src)) => {
                    Action::Insert(self.handle.pool.clone_extent(&src)?)
                }
                StagedEntry::Remove => Action::Remove,
            };
            actions.push((key, action));
        }

        let now = Timestamp::now();
        let max = self.handle.limits.read().unwrap().max_value_length_sum;
        let freed = self.handle.manifest.with_transaction(|tx| {
            let mut freed = Vec::new();
            for (key, action) in &actions {
                match action {
                    Action::Insert(placement) => {
                        let locator = Locator {
                            file_id: placement.file_id,
                            offset: placement.offset,
                            length: placement.length,
                            last_used: now,
                        };
                        if let Some(prev) = crate::manifest::insert_or_replace_in_tx(
                            tx, key, locator,
                        )? {
                            freed.push((key.clone(), prev));
                        }
                    }
                    Action::Remove => {
                        if let Some(prev) = crate::manifest::get_in_tx(tx, key)? {
                            crate::manifest::delete_in_tx(tx, key)?;
                            freed.push((key.clone(), prev));
                        }
                    }
                }
            }
            freed.extend(crate::eviction::evict_to_fit(tx, max)?);
            Ok(freed)
        })?;

        self.handle.reclaim(freed);
        Ok(())
    }
}
