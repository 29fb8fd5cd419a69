//! Error types for campaign-ledger

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    /// RPC endpoint unreachable or timed out. Always retryable.
    #[error("Transient chain error: {0}")]
    TransientChain(String),

    /// The chain accepted the transaction but the contract reverted it.
    #[error("Transaction reverted on-chain: {0}")]
    ChainRevert(String),

    /// A command violated a ledger-snapshot precondition. Rejected
    /// synchronously, no state change.
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// A pending or submitted command for the same (campaign, kind)
    /// already exists.
    #[error("Operation already in progress for campaign {campaign_id} ({kind})")]
    CommandInFlight { campaign_id: i64, kind: String },

    #[error("Not found: {0}")]
    NotFound(String),

    /// Ledger and chain disagree (reorg below confirmation depth).
    /// Flagged for manual review, never auto-resolved.
    #[error("Reconciliation conflict: {0}")]
    ReconciliationConflict(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    /// True for failures that should be retried with backoff rather than
    /// surfaced as command or ingestion failures.
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::TransientChain(_))
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        LedgerError::Database(e.to_string())
    }
}
