//! Campaign Ledger Daemon
//!
//! Reconciles an off-chain SQLite ledger with a donation-campaign contract
//! and serves an administrative HTTP API.
//!
//! ## Usage
//!
//! ```bash
//! # Start with defaults
//! campaign-ledger
//!
//! # Start with custom config
//! campaign-ledger --config /path/to/config.toml
//!
//! # Point at a specific chain and contract
//! campaign-ledger --rpc-url https://sepolia.example/rpc \
//!                 --contract-address 0xabc... \
//!                 --signer-url http://localhost:7000
//! ```

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use campaign_ledger::chain::rpc::EthRpcGateway;
use campaign_ledger::chain::signer::RemoteSigner;
use campaign_ledger::{
    CommandDispatcher, Config, EventIngestor, HttpServer, IngestorConfig, LedgerDb, TrackerConfig,
    TransactionTracker,
};

#[derive(Parser, Debug)]
#[command(name = "campaign-ledger")]
#[command(about = "Off-chain reconciliation engine for donation campaigns")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory holding the SQLite ledger
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// HTTP API port
    #[arg(long)]
    http_port: Option<u16>,

    /// Blockchain JSON-RPC endpoint
    #[arg(long, env = "LEDGER_RPC_URL")]
    rpc_url: Option<String>,

    /// Remote signer endpoint; empty disables command submission
    #[arg(long, env = "LEDGER_SIGNER_URL")]
    signer_url: Option<String>,

    /// Donation contract address (0x-hex)
    #[arg(long, env = "LEDGER_CONTRACT_ADDRESS")]
    contract_address: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("campaign_ledger=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut config = if let Some(config_path) = &args.config {
        Config::load(config_path)?
    } else {
        Config::default()
    };

    // Apply CLI overrides
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    if let Some(port) = args.http_port {
        config.http_port = port;
    }
    if let Some(url) = args.rpc_url {
        config.rpc_url = url;
    }
    if let Some(url) = args.signer_url {
        config.signer_url = url;
    }
    if let Some(address) = args.contract_address {
        config.contract_address = address;
    }

    info!(
        data_dir = %config.data_dir.display(),
        http_port = config.http_port,
        rpc_url = %config.rpc_url,
        "Starting campaign-ledger"
    );

    let db = Arc::new(LedgerDb::open(&config.data_dir)?);
    let dispatcher = Arc::new(CommandDispatcher::new(db.clone()));
    let gateway = Arc::new(EthRpcGateway::new(&config.rpc_url, &config.contract_address)?);

    let ingestor = Arc::new(EventIngestor::new(
        db.clone(),
        gateway.clone(),
        dispatcher.clone(),
        IngestorConfig {
            confirmation_depth: config.confirmation_depth,
            start_block: config.start_block,
            min_disburse_amount: config.min_disburse_amount,
        },
    ));

    if config.ingest_interval_secs > 0 {
        tokio::spawn(Arc::clone(&ingestor).run_loop(
            config.ingest_interval_secs,
            config.ingest_backoff_secs,
            config.ingest_backoff_max_secs,
        ));
    } else {
        info!("Timer ingestion disabled; sync-donations endpoint only");
    }

    if config.signer_url.is_empty() {
        warn!("No signer_url configured; command submission is disabled");
    } else {
        let signer = Arc::new(RemoteSigner::new(
            &config.signer_url,
            config.chain_id,
            config.gas_limit,
        )?);
        let tracker = Arc::new(TransactionTracker::new(
            db.clone(),
            gateway.clone(),
            signer,
            TrackerConfig {
                submit_workers: config.submit_workers,
                submit_lease_secs: config.submit_lease_secs,
                receipt_poll_interval_secs: config.receipt_poll_interval_secs,
                receipt_wait_window_secs: config.receipt_wait_window_secs,
                sweep_interval_secs: config.sweep_interval_secs,
                sweep_hard_cutoff_secs: config.sweep_hard_cutoff_secs,
            },
        ));
        tokio::spawn(Arc::clone(&tracker).run_submit_loop());
        tokio::spawn(Arc::clone(&tracker).run_confirm_loop());
        tokio::spawn(Arc::clone(&tracker).run_sweep_loop());
    }

    let http_addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;
    let server = Arc::new(HttpServer::new(db, dispatcher, ingestor, http_addr));
    info!("HTTP API available at http://{}", http_addr);

    server.run().await?;
    Ok(())
}
