//! A dedicated connection holding one read transaction open, giving a
//! [`crate::reader::Reader`] a consistent point-in-time view of the
//! manifest across `reader_add`/`reader_begin`/`reader_list_items` calls.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::item::{Item, Stat};
use crate::locator::Locator;
use crate::timestamp::Timestamp;

use super::prefix_bounds;

pub struct ReadSnapshot {
    conn: Connection,
}

impl ReadSnapshot {
    pub(super) fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        // DEFERRED: the snapshot is acquired by the first statement that
        // actually touches the database, not by this BEGIN itself.
        conn.execute_batch("BEGIN DEFERRED")?;
        Ok(ReadSnapshot { conn })
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Locator>> {
        self.conn
            .query_row(
                "SELECT file_id, offset, length, last_used FROM manifest WHERE key = ?1",
                params![key],
                |row| {
                    Ok(Locator {
                        file_id: row.get(0)?,
                        offset: row.get(1)?,
                        length: row.get(2)?,
                        last_used: Timestamp::from_nanos_since_epoch(row.get(3)?),
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn list(&self, prefix: &[u8]) -> Result<Vec<Item>> {
        let (lower, upper) = prefix_bounds(prefix);
        let mut stmt = match &upper {
            Some(_) => self.conn.prepare(
                "SELECT key, length, last_used FROM manifest \
                 WHERE key >= ?1 AND key < ?2 ORDER BY key ASC",
            )?,
            None => self.conn.prepare(
                "SELECT key, length, last_used FROM manifest \
                 WHERE key >= ?1 ORDER BY key ASC",
            )?,
        };
        let mut items = Vec::new();
        let mut rows = match &upper {
            Some(upper) => stmt.query(params![lower, upper])?,
            None => stmt.query(params![lower])?,
        };
        while let Some(row) = rows.next()? {
            items.push(Item {
                key: row.get(0)?,
                stat: Stat {
                    size: row.get::<_, i64>(1)? as u64,
                    last_used: Timestamp::from_nanos_since_epoch(row.get(2)?),
                },
            });
        }
        Ok(items)
    }
}

impl Drop for ReadSnapshot {
    fn drop(&mut self) {
        let _ = self.conn.execute_batch("COMMIT");
    }
}
