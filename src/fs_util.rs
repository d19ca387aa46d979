//! Thin wrappers around the filesystem primitives the value pool needs:
//! positional IO, hole punching, and reflink cloning. Kept separate from
//! [`crate::pool`] so the pool's bookkeeping stays readable.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, AsRawFd};
use std::path::Path;

use nix::fcntl::{fallocate, FallocateFlags};
use nix::sys::uio::pread;

/// Deallocates blocks in `[offset, offset + length)`, leaving that range
/// reading as zeros. A no-op for `length == 0`.
pub fn punch_hole(file: &File, offset: u64, length: u64) -> io::Result<()> {
    if length == 0 {
        return Ok(());
    }
    fallocate_punch_hole(file, offset, length)
}

fn fallocate_punch_hole(file: &File, offset: u64, length: u64) -> io::Result<()> {
    let flags = FallocateFlags::FALLOC_FL_PUNCH_HOLE | FallocateFlags::FALLOC_FL_KEEP_SIZE;
    fallocate(file.as_fd(), flags, offset as i64, length as i64)
        .map_err(|errno| io::Error::from_raw_os_error(errno as i32))
}

/// Positional read. Returns the number of bytes actually read, which may be
/// less than `buf.len()` at end-of-file — callers translate that into the
/// "short reads at end-of-value are allowed" contract.
pub fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    pread(file.as_fd(), buf, offset as i64).map_err(|errno| io::Error::from_raw_os_error(errno as i32))
}

/// Clones `length` bytes starting at `src_offset` in `src` into `dst` at
/// `dst_offset`, sharing the underlying blocks copy-on-write where the
/// filesystem supports it (`FICLONERANGE` on Linux). Falls back to an
/// ordinary positional copy when the filesystem doesn't support reflink
/// (cross-filesystem, tmpfs, or a btrfs/xfs feature not enabled) — the
/// caller can't tell the difference from the bytes alone, only from disk
/// usage, which possum doesn't promise to minimize when cloning is
/// unavailable.
pub fn clone_range(src: &File, src_offset: u64, length: u64, dst: &File, dst_offset: u64) -> io::Result<()> {
    match ficlonerange(src, src_offset, length, dst, dst_offset) {
        Ok(()) => Ok(()),
        Err(_) => copy_range(src, src_offset, length, dst, dst_offset),
    }
}

fn copy_range(src: &File, mut src_offset: u64, mut length: u64, dst: &File, mut dst_offset: u64) -> io::Result<()> {
    let mut buf = vec![0u8; 64 * 1024];
    while length > 0 {
        let chunk = buf.len().min(length as usize);
        let n = read_at(src, &mut buf[..chunk], src_offset)?;
        if n == 0 {
            break;
        }
        write_at(dst, &buf[..n], dst_offset)?;
        src_offset += n as u64;
        dst_offset += n as u64;
        length -= n as u64;
    }
    Ok(())
}

fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use nix::sys::uio::pwrite;
    let mut written = 0;
    while written < buf.len() {
        let n = pwrite(file, &buf[written..], (offset + written as u64) as i64)
            .map_err(|errno| io::Error::from_raw_os_error(errno as i32))?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "pwrite wrote 0 bytes"));
        }
        written += n;
    }
    Ok(())
}

#[repr(C)]
struct FileCloneRange {
    src_fd: i64,
    src_offset: u64,
    src_length: u64,
    dest_offset: u64,
}

nix::ioctl_write_ptr!(ficlonerange_ioctl, 0x94, 13, FileCloneRange);

fn ficlonerange(src: &File, src_offset: u64, length: u64, dst: &File, dst_offset: u64) -> io::Result<()> {
    let arg = FileCloneRange {
        src_fd: src.as_raw_fd() as i64,
        src_offset,
        src_length: length,
        dest_offset: dst_offset,
    };
    unsafe { ficlonerange_ioctl(dst.as_raw_fd(), &arg) }
        .map(|_| ())
        .map_err(|errno| io::Error::from_raw_os_error(errno as i32))
}

/// Size of the throwaway region punched by [`probe_hole_punch_support`].
/// Needs to be a real, non-zero extent: a zero-length punch is accepted by
/// filesystems that don't implement `FALLOC_FL_PUNCH_HOLE` at all (nothing
/// to reject), so it can't tell capable filesystems from incapable ones.
const PROBE_LEN: u64 = 4096;

/// Probes whether `dir`'s filesystem supports hole punching by punching a
/// real `PROBE_LEN`-byte hole in a throwaway file.
pub fn probe_hole_punch_support(dir: &Path) -> io::Result<bool> {
    let probe_path = dir.join(format!(".hole-punch-probe-{}", std::process::id()));
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(true)
        .open(&probe_path)?;
    file.set_len(PROBE_LEN)?;
    let result = fallocate_punch_hole(&file, 0, PROBE_LEN);
    drop(file);
    let _ = std::fs::remove_file(&probe_path);
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.raw_os_error() == Some(libc::EOPNOTSUPP) => Ok(false),
        Err(e) => Err(e),
    }
}
