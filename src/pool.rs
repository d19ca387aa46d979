//! Allocates value files, promotes scratch files into the pool, and serves
//! positional reads. See spec.md §4.2.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use rand::Rng;

use crate::error::{Error, Result};
use crate::fs_util;
use crate::locator::Locator;

/// A value file is rotated once appending to it would cross this size,
/// mirroring the teacher's `COMPACTION_THRESHOLD` log-rotation trigger
/// (`examples/Azathoth1729-rskv/src/engines/bitcask.rs`), scaled up from
/// that log's small serialized commands to whole value payloads.
const VALUE_FILE_TARGET_SIZE: u64 = 64 * 1024 * 1024;

/// Where a value's bytes live, without the manifest's stat information.
#[derive(Debug, Clone, Copy)]
pub struct Placement {
    pub file_id: u64,
    pub offset: u64,
    pub length: u64,
}

/// A scratch file backing an in-progress [`crate::batch::ValueWriter`].
///
/// Exposes the raw fd so callers can write with whatever I/O pattern they
/// like; the pool never buffers on their behalf.
pub struct ScratchFile {
    path: PathBuf,
    file: File,
}

impl ScratchFile {
    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// The value file currently accepting appends, and how far it's filled.
struct CurrentFile {
    file_id: u64,
    file: Arc<File>,
    end_offset: u64,
}

pub struct ValueFilePool {
    values_dir: PathBuf,
    scratch_dir: PathBuf,
    next_file_id: AtomicU64,
    open_files: RwLock<HashMap<u64, Arc<File>>>,
    current: Mutex<CurrentFile>,
}

impl ValueFilePool {
    pub fn open(store_dir: &Path) -> Result<Self> {
        let values_dir = store_dir.join("values");
        let scratch_dir = store_dir.join("scratch");
        fs::create_dir_all(&values_dir)?;
        fs::create_dir_all(&scratch_dir)?;

        // Any scratch file left behind is from a writer that never
        // committed before the process ended; invariant 6 says it must
        // leave no trace.
        for entry in fs::read_dir(&scratch_dir)? {
            let entry = entry?;
            let _ = fs::remove_file(entry.path());
        }

        let mut max_id = 0u64;
        for entry in fs::read_dir(&values_dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(id) = u64::from_str_radix(name, 16) {
                    max_id = max_id.max(id);
                }
            }
        }

        // Start every run with a fresh value file to append into, the way
        // the teacher's Bitcask::open always begins writing at
        // `(max existing fid) + 1` rather than reopening the last log file
        // from a prior run.
        let mut open_files = HashMap::new();
        let current_file_id = max_id + 1;
        let current_path = values_dir.join(format!("{:x}", current_file_id));
        let current_file = Arc::new(
            OpenOptions::new()
                .create_new(true)
                .read(true)
                .write(true)
                .open(&current_path)?,
        );
        open_files.insert(current_file_id, Arc::clone(&current_file));

        Ok(ValueFilePool {
            values_dir,
            scratch_dir,
            next_file_id: AtomicU64::new(current_file_id + 1),
            open_files: RwLock::new(open_files),
            current: Mutex::new(CurrentFile {
                file_id: current_file_id,
                file: current_file,
                end_offset: 0,
            }),
        })
    }

    pub fn create_scratch_file(&self) -> Result<ScratchFile> {
        let mut rng = rand::thread_rng();
        loop {
            let name = format!("{:032x}", rng.gen::<u128>());
            let path = self.scratch_dir.join(name);
            match OpenOptions::new()
                .create_new(true)
                .read(true)
                .write(true)
                .open(&path)
            {
                Ok(file) => return Ok(ScratchFile { path, file }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    /// Reflink-clones (or, failing that, copies) a scratch file's bytes
    /// into the value file currently accepting appends, rotating to a new
    /// one first if there isn't room. The scratch file is removed once its
    /// bytes have landed (`ScratchFile::drop`).
    pub fn promote_scratch(&self, scratch: ScratchFile) -> Result<Placement> {
        let length = scratch.len()?;
        let (file_id, dest_file, offset) = self.reserve(length)?;
        fs_util::clone_range(scratch.file(), 0, length, &dest_file, offset)?;
        Ok(Placement {
            file_id,
            offset,
            length,
        })
    }

    /// Reflink-clones (or, failing that, copies) the bytes of `src` into
    /// the value file currently accepting appends, producing an extent
    /// disjoint from every existing live entry (invariant 2).
    pub fn clone_extent(&self, src: &Locator) -> Result<Placement> {
        let src_file = self.get_file(src.file_id)?;
        let (file_id, dest_file, offset) = self.reserve(src.length)?;
        fs_util::clone_range(&src_file, src.offset, src.length, &dest_file, offset)?;
        Ok(Placement {
            file_id,
            offset,
            length: src.length,
        })
    }

    /// Reserves `length` bytes at the end of the current value file,
    /// rotating to a freshly allocated one first if appending would cross
    /// [`VALUE_FILE_TARGET_SIZE`]. A file that's still empty always takes
    /// the write regardless of `length`, so a single oversized value never
    /// gets stuck unable to find a home.
    fn reserve(&self, length: u64) -> Result<(u64, Arc<File>, u64)> {
        let mut current = self.current.lock().unwrap();
        if current.end_offset > 0 && current.end_offset + length > VALUE_FILE_TARGET_SIZE {
            self.rotate(&mut current)?;
        }
        let offset = current.end_offset;
        current.end_offset += length;
        current.file.set_len(current.end_offset)?;
        Ok((current.file_id, Arc::clone(&current.file), offset))
    }

    fn rotate(&self, current: &mut CurrentFile) -> Result<()> {
        let file_id = self.next_file_id.fetch_add(1, Ordering::SeqCst);
        let path = self.file_path(file_id);
        let file = Arc::new(
            OpenOptions::new()
                .create_new(true)
                .read(true)
                .write(true)
                .open(&path)?,
        );
        self.open_files
            .write()
            .unwrap()
            .insert(file_id, Arc::clone(&file));
        *current = CurrentFile {
            file_id,
            file,
            end_offset: 0,
        };
        Ok(())
    }

    pub fn read_at(&self, loc: &Locator, buf: &mut [u8], rel_offset: u64) -> Result<usize> {
        if rel_offset >= loc.length {
            return Ok(0);
        }
        let want = buf.len().min((loc.length - rel_offset) as usize);
        let file = self.get_file(loc.file_id)?;
        let n = fs_util::read_at(&file, &mut buf[..want], loc.offset + rel_offset)?;
        Ok(n)
    }

    /// Punches a hole over `loc`'s bytes. The caller (eviction) is
    /// responsible for checking the extent isn't snapshot-pinned first.
    pub fn punch(&self, loc: &Locator) -> Result<()> {
        let file = self.get_file(loc.file_id)?;
        fs_util::punch_hole(&file, loc.offset, loc.length)?;
        Ok(())
    }

    /// Same as [`Self::punch`], for callers that only have the bare extent
    /// (eviction's reclaim path, which discards `last_used` once freed).
    pub fn punch_extent(&self, extent: &crate::locator::Extent) -> Result<()> {
        let file = self.get_file(extent.file_id)?;
        fs_util::punch_hole(&file, extent.offset, extent.length)?;
        Ok(())
    }

    pub fn probe_hole_punch_support(&self) -> Result<bool> {
        Ok(fs_util::probe_hole_punch_support(&self.values_dir)?)
    }

    /// The store directory this pool was opened against (parent of
    /// `values/` and `scratch/`).
    pub fn store_dir(&self) -> PathBuf {
        self.values_dir
            .parent()
            .expect("values_dir always has a parent")
            .to_path_buf()
    }

    fn get_file(&self, file_id: u64) -> Result<Arc<File>> {
        if let Some(f) = self.open_files.read().unwrap().get(&file_id) {
            return Ok(Arc::clone(f));
        }
        let mut files = self.open_files.write().unwrap();
        if let Some(f) = files.get(&file_id) {
            return Ok(Arc::clone(f));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.file_path(file_id))?;
        let file = Arc::new(file);
        files.insert(file_id, Arc::clone(&file));
        Ok(file)
    }

    fn file_path(&self, file_id: u64) -> PathBuf {
        self.values_dir.join(format!("{:x}", file_id))
    }
}
