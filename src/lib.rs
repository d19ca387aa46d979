#![warn(missing_docs)]
//! An embeddable key/value store for large, opaque values.
//!
//! Keys and values are arbitrary byte strings. Values are stored as
//! contiguous byte ranges ("extents") in a small number of on-disk value
//! files, while a SQLite-backed manifest tracks which extent each key
//! currently points to. Writes go through a [`BatchWriter`] so that many
//! keys can be staged and then committed atomically; reads that need a
//! consistent multi-key view go through a [`Reader`], which pins its
//! extents against eviction until dropped.
//!
//! ```no_run
//! use possum::Handle;
//!
//! # fn main() -> possum::Result<()> {
//! let handle = Handle::open("/tmp/my-store")?;
//! handle.single_write(b"hello", b"world")?;
//! let mut buf = [0u8; 5];
//! handle.single_read_at(b"hello", &mut buf, 0)?;
//! assert_eq!(&buf, b"world");
//! # Ok(())
//! # }
//! ```

mod batch;
mod eviction;
mod error;
mod fs_util;
mod handle;
mod item;
mod limits;
mod locator;
mod manifest;
mod pool;
mod reader;
mod snapshot;
mod timestamp;

pub use batch::{BatchWriter, RawFileHandle, ValueWriter};
pub use error::{Error, Result};
pub use handle::Handle;
pub use item::{Item, Stat};
pub use limits::Limits;
pub use reader::{Reader, Value};
pub use timestamp::Timestamp;
