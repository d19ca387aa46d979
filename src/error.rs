use thiserror::Error;

/// Error kinds surfaced at every boundary call.
///
/// Each variant corresponds to one of the error kinds in the store's
/// contract: a caller never needs to match on more than this set to decide
/// how to react to a failed operation.
#[derive(Error, Debug)]
pub enum Error {
    /// The referenced key is absent.
    #[error("no such key")]
    NoSuchKey,
    /// The metadata store rejected a statement or its transaction could not commit.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    /// The filesystem returned an error on open/write/read/punch/clone.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Hole punching is required but unsupported by the store's filesystem,
    /// and `disable_hole_punching` was not set.
    #[error("filesystem does not support hole punching")]
    UnsupportedFilesystem,
    /// Catch-all for violated preconditions and otherwise unclassified faults.
    #[error(transparent)]
    Any(#[from] anyhow::Error),
}

/// Result type used throughout possum.
pub type Result<T> = std::result::Result<T, Error>;
