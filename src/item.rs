use crate::timestamp::Timestamp;

/// Cheap metadata about a manifest entry: does not touch the value file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    /// When the entry was last read or written.
    pub last_used: Timestamp,
    /// Length of the value in bytes.
    pub size: u64,
}

/// A `(key, stat)` pair as returned by listing operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// The key, as stored.
    pub key: Vec<u8>,
    /// Its stat at the time of listing.
    pub stat: Stat,
}
