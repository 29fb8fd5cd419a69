//! Ingestion cursor
//!
//! Single row recording the highest fully-processed block and its hash.
//! The hash is what lets the ingestor detect a reorg at the cursor height.
//! Advancing the cursor must happen in the same transaction as the event
//! inserts it covers.

use rusqlite::{params, Connection};
use serde::Serialize;

use crate::db::now_rfc3339;
use crate::error::LedgerError;

/// Cursor state
#[derive(Debug, Clone, Serialize)]
pub struct Cursor {
    pub processed_block: u64,
    pub block_hash: Option<String>,
}

/// Read the cursor, initializing it at `start_block` on first use
pub fn get_or_init(conn: &Connection, start_block: u64) -> Result<Cursor, LedgerError> {
    conn.execute(
        "INSERT OR IGNORE INTO ingestion_cursor (id, processed_block, updated_at)
         VALUES (1, ?1, ?2)",
        params![start_block as i64, now_rfc3339()],
    )?;

    conn.query_row(
        "SELECT processed_block, block_hash FROM ingestion_cursor WHERE id = 1",
        [],
        |row| {
            Ok(Cursor {
                processed_block: row.get::<_, i64>(0)? as u64,
                block_hash: row.get(1)?,
            })
        },
    )
    .map_err(Into::into)
}

/// Advance (or roll back) the cursor. Caller is responsible for running
/// this inside the same transaction as the rows it accounts for.
pub fn set(conn: &Connection, block: u64, block_hash: Option<&str>) -> Result<(), LedgerError> {
    conn.execute(
        "UPDATE ingestion_cursor SET processed_block = ?1, block_hash = ?2, updated_at = ?3
         WHERE id = 1",
        params![block as i64, block_hash, now_rfc3339()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::LedgerDb;

    #[test]
    fn init_once_then_persist() {
        let db = LedgerDb::open_in_memory().unwrap();

        let c = db.with_conn(|conn| get_or_init(conn, 10)).unwrap();
        assert_eq!(c.processed_block, 10);
        assert!(c.block_hash.is_none());

        db.with_conn(|conn| set(conn, 42, Some("0xhash"))).unwrap();

        // start_block is ignored once initialized
        let c = db.with_conn(|conn| get_or_init(conn, 10)).unwrap();
        assert_eq!(c.processed_block, 42);
        assert_eq!(c.block_hash.as_deref(), Some("0xhash"));
    }
}
