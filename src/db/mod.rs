//! SQLite ledger store
//!
//! Durable relational storage for campaigns, donations, withdrawals,
//! commands, the audit log, and the ingestion cursor. All other components
//! hold only transient references and re-read from here before acting.
//!
//! ## Tables
//!
//! - `campaigns` - Campaign metadata and on-chain linkage
//! - `donations` - Chain-observed donations, unique on (tx_hash, log_index)
//! - `withdrawals` - Withdrawals, requested locally or observed on-chain
//! - `commands` - Durable on-chain write intents
//! - `audit_log` - Append-only record of every command transition
//! - `ingestion_cursor` - Single-row processed-block cursor

pub mod schema;
pub mod campaigns;
pub mod donations;
pub mod withdrawals;
pub mod commands;
pub mod audit;
pub mod cursor;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::LedgerError;

/// SQLite ledger database
pub struct LedgerDb {
    conn: Mutex<Connection>,
}

impl LedgerDb {
    /// Open or create the ledger database
    pub fn open(data_dir: &Path) -> Result<Self, LedgerError> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("ledger.db");
        info!("Opening SQLite ledger at {:?}", db_path);

        let conn = Connection::open(&db_path)
            .map_err(|e| LedgerError::Database(format!("Failed to open SQLite: {}", e)))?;

        // WAL mode for concurrent stats reads during ingestion
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| LedgerError::Database(format!("Failed to set PRAGMA: {}", e)))?;

        let db = Self {
            conn: Mutex::new(conn),
        };

        db.init_schema()?;

        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        debug!("Opening in-memory SQLite ledger");

        let conn = Connection::open_in_memory()
            .map_err(|e| LedgerError::Database(format!("Failed to open in-memory SQLite: {}", e)))?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| LedgerError::Database(format!("Failed to set PRAGMA: {}", e)))?;

        let db = Self {
            conn: Mutex::new(conn),
        };

        db.init_schema()?;

        Ok(db)
    }

    fn init_schema(&self) -> Result<(), LedgerError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| LedgerError::Internal(format!("Lock poisoned: {}", e)))?;

        schema::init_schema(&conn)?;

        Ok(())
    }

    /// Run a read or single-statement write against the connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&Connection) -> Result<T, LedgerError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| LedgerError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Run a multi-statement transaction with exclusive access
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&mut Connection) -> Result<T, LedgerError>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| LedgerError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&mut conn)
    }
}

/// Current UTC timestamp in the format stored throughout the ledger
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
