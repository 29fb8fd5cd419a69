//! Campaign Ledger - off-chain reconciliation engine for donation campaigns
//!
//! Keeps a SQLite ledger in sync with a donation-campaign contract and
//! executes administrative writes against it.
//!
//! ## Architecture
//!
//! - **Ledger store** (`db`): campaigns, donations, withdrawals, commands,
//!   audit log, ingestion cursor. Every other component re-reads from here
//!   before acting.
//! - **Event ingestor** (`ingest`): advances a persisted block cursor,
//!   pulling contract events through the chain gateway and upserting them
//!   idempotently.
//! - **Command dispatcher** (`dispatch`): validates administrative write
//!   intents and persists them as durable commands.
//! - **Transaction tracker** (`tracker`): signs, submits, and tracks
//!   commands to a confirmed / failed / unknown outcome.
//! - **Auto-disburse** (`disburse`): enqueues a full-balance withdrawal when
//!   a campaign crosses its funding threshold.
//! - **HTTP API** (`http`): administrative REST surface.
//!
//! The chain is the source of truth for money movement; the ledger is the
//! source of truth for metadata and command intent.

pub mod chain;
pub mod config;
pub mod db;
pub mod disburse;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod ingest;
pub mod stats;
pub mod tracker;

pub use config::Config;
pub use db::LedgerDb;
pub use dispatch::CommandDispatcher;
pub use error::LedgerError;
pub use http::HttpServer;
pub use ingest::{EventIngestor, IngestorConfig};
pub use tracker::{TrackerConfig, TransactionTracker};
