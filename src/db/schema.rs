//! Database schema definitions

use rusqlite::Connection;
use tracing::info;

use crate::error::LedgerError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), LedgerError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new ledger schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!(
            "Migrating ledger schema from v{} to v{}",
            current_version, SCHEMA_VERSION
        );
        migrate_schema(conn, current_version)?;
    } else {
        info!("Ledger schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, LedgerError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )
    .map_err(|e| LedgerError::Database(format!("Failed to create schema_version table: {}", e)))?;

    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .unwrap_or(0);

    Ok(version)
}

/// Set schema version
fn set_schema_version(conn: &Connection, version: i32) -> Result<(), LedgerError> {
    conn.execute("DELETE FROM schema_version", [])
        .map_err(|e| LedgerError::Database(format!("Failed to clear schema_version: {}", e)))?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])
        .map_err(|e| LedgerError::Database(format!("Failed to set schema_version: {}", e)))?;
    Ok(())
}

/// Create all tables
fn create_tables(conn: &Connection) -> Result<(), LedgerError> {
    conn.execute_batch(CAMPAIGNS_SCHEMA)
        .map_err(|e| LedgerError::Database(format!("Failed to create campaigns table: {}", e)))?;

    conn.execute_batch(LEDGER_SCHEMA)
        .map_err(|e| LedgerError::Database(format!("Failed to create ledger tables: {}", e)))?;

    conn.execute_batch(INDEXES_SCHEMA)
        .map_err(|e| LedgerError::Database(format!("Failed to create indexes: {}", e)))?;

    Ok(())
}

/// Migrate schema from older version
fn migrate_schema(conn: &Connection, from_version: i32) -> Result<(), LedgerError> {
    match from_version {
        _ => {}
    }

    set_schema_version(conn, SCHEMA_VERSION)?;
    Ok(())
}

/// Campaigns table schema
const CAMPAIGNS_SCHEMA: &str = r#"
-- Campaign metadata and on-chain linkage.
-- onchain_id and status are mutated only by the transaction tracker and
-- the event ingestor, never directly by API handlers.
CREATE TABLE IF NOT EXISTS campaigns (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    onchain_id INTEGER,
    title TEXT NOT NULL,
    short_desc TEXT,
    description TEXT,
    image_url TEXT,
    beneficiary_address TEXT,
    target_amount REAL NOT NULL DEFAULT 0.0,
    currency TEXT NOT NULL DEFAULT 'ETH',
    deadline TEXT,
    status TEXT NOT NULL DEFAULT 'draft',
    auto_disburse INTEGER NOT NULL DEFAULT 0,
    disburse_threshold REAL NOT NULL DEFAULT 0.8,
    contract_tx_hash TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// Donations, withdrawals, commands, audit log, ingestion cursor
const LEDGER_SCHEMA: &str = r#"
-- Chain-observed donations. (tx_hash, log_index) is the idempotency key:
-- replayed ingestion of the same event is a no-op.
CREATE TABLE IF NOT EXISTS donations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    campaign_id INTEGER NOT NULL REFERENCES campaigns(id),
    onchain_campaign_id INTEGER NOT NULL,
    donor_address TEXT NOT NULL,
    amount REAL NOT NULL,
    amount_wei TEXT NOT NULL,
    tx_hash TEXT NOT NULL,
    log_index INTEGER NOT NULL,
    block_number INTEGER NOT NULL,
    timestamp TEXT NOT NULL
);

-- Withdrawals: created as 'requested' by the dispatcher, or inserted
-- directly as 'confirmed' when observed on-chain without a local command.
CREATE TABLE IF NOT EXISTS withdrawals (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    campaign_id INTEGER NOT NULL REFERENCES campaigns(id),
    owner_address TEXT,
    amount REAL NOT NULL,
    amount_wei TEXT,
    tx_hash TEXT,
    log_index INTEGER,
    block_number INTEGER,
    status TEXT NOT NULL DEFAULT 'requested',
    requested_by TEXT NOT NULL,
    requested_at TEXT NOT NULL,
    confirmed_at TEXT
);

-- Durable on-chain write intents. lease_until is a claim lease for the
-- submit worker pool so two workers never submit the same command.
CREATE TABLE IF NOT EXISTS commands (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    campaign_id INTEGER NOT NULL REFERENCES campaigns(id),
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    tx_hash TEXT,
    withdrawal_id INTEGER REFERENCES withdrawals(id),
    requested_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    submitted_at TEXT,
    resolved_at TEXT,
    lease_until TEXT,
    last_error TEXT
);

-- Append-only. No update or delete is ever issued against this table.
CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    action TEXT NOT NULL,
    actor TEXT NOT NULL,
    campaign_id INTEGER,
    tx_hash TEXT,
    details TEXT NOT NULL,
    timestamp TEXT NOT NULL
);

-- Single row (id = 1). Advanced atomically with event inserts.
CREATE TABLE IF NOT EXISTS ingestion_cursor (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    processed_block INTEGER NOT NULL,
    block_hash TEXT,
    updated_at TEXT NOT NULL
);
"#;

/// Indexes and uniqueness constraints
const INDEXES_SCHEMA: &str = r#"
-- Idempotency key for event ingestion
CREATE UNIQUE INDEX IF NOT EXISTS idx_donations_event
    ON donations(tx_hash, log_index);

CREATE INDEX IF NOT EXISTS idx_donations_campaign ON donations(campaign_id);

-- Chain-observed withdrawals are idempotent on their tx hash
CREATE UNIQUE INDEX IF NOT EXISTS idx_withdrawals_tx_hash
    ON withdrawals(tx_hash) WHERE tx_hash IS NOT NULL;

CREATE INDEX IF NOT EXISTS idx_withdrawals_campaign ON withdrawals(campaign_id);

-- At most one in-flight command per (campaign, kind). This is what makes
-- concurrent dispatch and auto-disburse races safe.
CREATE UNIQUE INDEX IF NOT EXISTS idx_commands_inflight
    ON commands(campaign_id, kind) WHERE status IN ('pending', 'submitted');

CREATE INDEX IF NOT EXISTS idx_commands_status ON commands(status);

CREATE UNIQUE INDEX IF NOT EXISTS idx_campaigns_onchain
    ON campaigns(onchain_id) WHERE onchain_id IS NOT NULL;

CREATE INDEX IF NOT EXISTS idx_audit_action ON audit_log(action);
CREATE INDEX IF NOT EXISTS idx_audit_actor ON audit_log(actor);
"#;
