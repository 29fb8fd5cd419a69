//! Configuration for campaign-ledger

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::LedgerError;

/// Default data directory
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("campaign-ledger")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the SQLite ledger
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// HTTP API port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Blockchain JSON-RPC endpoint
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,

    /// Remote signer endpoint (key-holding collaborator). Empty disables
    /// command submission.
    #[serde(default)]
    pub signer_url: String,

    /// Donation contract address (0x-hex)
    #[serde(default)]
    pub contract_address: String,

    /// Chain ID (default Sepolia)
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,

    /// Blocks behind head treated as final (reorg safety margin)
    #[serde(default = "default_confirmation_depth")]
    pub confirmation_depth: u64,

    /// First block to scan on a fresh ledger (the contract deploy block)
    #[serde(default)]
    pub start_block: u64,

    /// Ingestion timer interval in seconds. 0 = on-demand only
    /// (the sync-donations endpoint still works).
    #[serde(default = "default_ingest_interval")]
    pub ingest_interval_secs: u64,

    /// Initial ingestion retry backoff in seconds
    #[serde(default = "default_ingest_backoff")]
    pub ingest_backoff_secs: u64,

    /// Ingestion retry backoff cap in seconds
    #[serde(default = "default_ingest_backoff_max")]
    pub ingest_backoff_max_secs: u64,

    /// Receipt polling interval for submitted commands, in seconds
    #[serde(default = "default_receipt_poll_interval")]
    pub receipt_poll_interval_secs: u64,

    /// How long a submitted command waits for a receipt before being
    /// parked as unknown, in seconds
    #[serde(default = "default_receipt_wait_window")]
    pub receipt_wait_window_secs: u64,

    /// Re-poll interval for unknown commands, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Hard cutoff after which an unknown command is marked failed,
    /// in seconds. 0 = sweep forever.
    #[serde(default)]
    pub sweep_hard_cutoff_secs: u64,

    /// Maximum concurrent command submissions
    #[serde(default = "default_submit_workers")]
    pub submit_workers: usize,

    /// Lease duration for claimed pending commands, in seconds
    #[serde(default = "default_submit_lease")]
    pub submit_lease_secs: u64,

    /// Minimum available balance (ETH) worth auto-disbursing
    #[serde(default = "default_min_disburse")]
    pub min_disburse_amount: f64,

    /// Gas limit for submitted transactions
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
}

fn default_http_port() -> u16 {
    8095
}

fn default_rpc_url() -> String {
    "http://localhost:8545".to_string()
}

fn default_chain_id() -> u64 {
    11155111
}

fn default_confirmation_depth() -> u64 {
    6
}

fn default_ingest_interval() -> u64 {
    30
}

fn default_ingest_backoff() -> u64 {
    2
}

fn default_ingest_backoff_max() -> u64 {
    60
}

fn default_receipt_poll_interval() -> u64 {
    5
}

fn default_receipt_wait_window() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_submit_workers() -> usize {
    4
}

fn default_submit_lease() -> u64 {
    30
}

fn default_min_disburse() -> f64 {
    0.01
}

fn default_gas_limit() -> u64 {
    300_000
}

impl Default for Config {
    fn default() -> Self {
        toml::from_str("").expect("empty config must deserialize via defaults")
    }
}

impl Config {
    /// Load config from a TOML file
    pub fn load(path: &Path) -> Result<Self, LedgerError> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| LedgerError::Config(format!("{}: {}", path.display(), e)))
    }
}
