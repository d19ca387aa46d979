use std::time::{SystemTime, UNIX_EPOCH};

/// A point in time with second and nanosecond precision.
///
/// Mirrors the `secs`/`nanos` pair the store's boundary contract uses so
/// that manifest rows round-trip through SQLite (which has no native
/// timestamp type) without losing precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    /// Seconds since the Unix epoch.
    pub secs: i64,
    /// Nanoseconds within the second, in `[0, 1_000_000_000)`.
    pub nanos: u32,
}

impl Timestamp {
    /// The current wall-clock time.
    pub fn now() -> Self {
        let dur = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp {
            secs: dur.as_secs() as i64,
            nanos: dur.subsec_nanos(),
        }
    }

    /// Packs the timestamp into a single monotonically-comparable integer
    /// for storage as a SQLite `INTEGER` column.
    pub(crate) fn to_nanos_since_epoch(self) -> i64 {
        self.secs * 1_000_000_000 + self.nanos as i64
    }

    pub(crate) fn from_nanos_since_epoch(v: i64) -> Self {
        Timestamp {
            secs: v.div_euclid(1_000_000_000),
            nanos: v.rem_euclid(1_000_000_000) as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_nanos() {
        let t = Timestamp { secs: 1_700_000_000, nanos: 123_456_789 };
        let packed = t.to_nanos_since_epoch();
        assert_eq!(Timestamp::from_nanos_since_epoch(packed), t);
    }

    #[test]
    fn orders_by_time() {
        let a = Timestamp { secs: 10, nanos: 0 };
        let b = Timestamp { secs: 10, nanos: 1 };
        assert!(a < b);
    }
}
