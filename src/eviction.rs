//! The eviction algorithm from spec.md §4.7. Runs inside the same SQLite
//! transaction as the mutation that triggered it, so a commit that cannot
//! make room is rejected atomically rather than leaving a partially-evicted
//! manifest.

use std::io;

use rusqlite::params;

use crate::error::{Error, Result};
use crate::locator::Locator;
use crate::timestamp::Timestamp;

/// Deletes least-recently-used live entries (ties broken by key bytes
/// ascending) until the live length sum is `<= max_value_length_sum`.
/// Returns the freed `(key, locator)` pairs so the caller can hole-punch
/// them once the transaction commits, subject to snapshot pinning.
///
/// Errors if the manifest is exhausted before the quota is met; the
/// transaction is left for the caller to roll back.
pub fn evict_to_fit(
    tx: &rusqlite::Transaction,
    max_value_length_sum: u64,
) -> Result<Vec<(Vec<u8>, Locator)>> {
    let live_sum: i64 = tx.query_row("SELECT COALESCE(SUM(length), 0) FROM manifest", [], |r| {
        r.get(0)
    })?;
    let live_sum = live_sum as u64;
    if live_sum <= max_value_length_sum {
        return Ok(Vec::new());
    }
    let excess = live_sum - max_value_length_sum;

    let mut freed = Vec::new();
    let mut freed_len = 0u64;
    {
        let mut stmt = tx.prepare(
            "SELECT key, file_id, offset, length, last_used FROM manifest \
             ORDER BY last_used ASC, key ASC",
        )?;
        let mut rows = stmt.query([])?;
        while freed_len < excess {
            let Some(row) = rows.next()? else { break };
            let key: Vec<u8> = row.get(0)?;
            let locator = Locator {
                file_id: row.get(1)?,
                offset: row.get(2)?,
                length: row.get(3)?,
                last_used: Timestamp::from_nanos_since_epoch(row.get(4)?),
            };
            freed_len += locator.length;
            freed.push((key, locator));
        }
    }

    if freed_len < excess {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::Other,
            "cannot evict enough live entries to satisfy max_value_length_sum",
        )));
    }

    for (key, _) in &freed {
        tx.execute("DELETE FROM manifest WHERE key = ?1", params![key])?;
    }

    Ok(freed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;

    fn insert(m: &Manifest, key: &str, length: u64, secs: i64) {
        m.insert_or_replace(
            key.as_bytes(),
            Locator {
                file_id: 0,
                offset: 0,
                length,
                last_used: Timestamp { secs, nanos: 0 },
            },
        )
        .unwrap();
    }

    #[test]
    fn evicts_oldest_first_until_quota_met() {
        let dir = tempfile::tempdir().unwrap();
        let m = Manifest::open(dir.path()).unwrap();
        insert(&m, "a", 4, 1);
        insert(&m, "b", 4, 2);
        insert(&m, "c", 4, 3);

        let freed = m
            .with_transaction(|tx| evict_to_fit(tx, 10))
            .unwrap();
        assert_eq!(freed.len(), 1);
        assert_eq!(freed[0].0, b"a");
        assert_eq!(m.live_length_sum().unwrap(), 8);
    }

    #[test]
    fn aborts_when_quota_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let m = Manifest::open(dir.path()).unwrap();
        insert(&m, "a", 4, 1);
        let res = m.with_transaction(|tx| evict_to_fit(tx, 1));
        assert!(matches!(res, Err(Error::Io(_))));
        // the failed transaction must not have deleted anything.
        assert_eq!(m.live_length_sum().unwrap(), 4);
    }
}
