//! Event ingestor
//!
//! Advances the persisted block cursor, pulls contract events through the
//! chain gateway, and idempotently upserts them into the ledger. Event
//! inserts and the cursor advance commit in one transaction: a crash
//! between them replays the same range on restart and every replayed event
//! is absorbed by the (tx_hash, log_index) key.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::chain::{wei_to_eth, ChainEvent, ChainGateway};
use crate::db::donations::NewDonation;
use crate::db::{audit, campaigns, cursor, donations, now_rfc3339, withdrawals, LedgerDb};
use crate::dispatch::CommandDispatcher;
use crate::disburse;
use crate::error::LedgerError;

/// Outcome of one ingestion batch
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestResult {
    pub donations_added: u64,
    pub withdrawals_added: u64,
    /// Events absorbed by the idempotency key
    pub duplicates: u64,
    /// Events referencing campaigns this ledger does not know
    pub skipped: u64,
    pub new_cursor: u64,
    pub reorg_detected: bool,
}

/// Ingestor configuration subset
#[derive(Debug, Clone)]
pub struct IngestorConfig {
    pub confirmation_depth: u64,
    pub start_block: u64,
    pub min_disburse_amount: f64,
}

/// Event ingestor. Single writer per chain: run one ingestion task (or one
/// manual sync at a time); the db-level transaction keeps overlapping runs
/// correct, merely wasteful.
pub struct EventIngestor {
    db: Arc<LedgerDb>,
    gateway: Arc<dyn ChainGateway>,
    dispatcher: Arc<CommandDispatcher>,
    config: IngestorConfig,
}

impl EventIngestor {
    pub fn new(
        db: Arc<LedgerDb>,
        gateway: Arc<dyn ChainGateway>,
        dispatcher: Arc<CommandDispatcher>,
        config: IngestorConfig,
    ) -> Self {
        Self {
            db,
            gateway,
            dispatcher,
            config,
        }
    }

    /// Run one ingestion batch: everything after the cursor up to the chain
    /// head minus the confirmation-depth margin.
    pub async fn ingest_once(&self) -> Result<IngestResult, LedgerError> {
        let head = self.gateway.get_block_number().await?;
        let cur = self
            .db
            .with_conn(|conn| cursor::get_or_init(conn, self.config.start_block))?;

        let safe_head = head.saturating_sub(self.config.confirmation_depth);
        if safe_head <= cur.processed_block {
            debug!(head, cursor = cur.processed_block, "Nothing final to ingest");
            return Ok(IngestResult {
                new_cursor: cur.processed_block,
                ..Default::default()
            });
        }

        // Reorg check: the block we last processed must still be canonical.
        if let Some(ref last_hash) = cur.block_hash {
            let canonical = self.gateway.get_block_hash(cur.processed_block).await?;
            if canonical.as_deref() != Some(last_hash.as_str()) {
                return self.handle_reorg(&cur, canonical.as_deref(), safe_head);
            }
        }

        let from = cur.processed_block + 1;
        let to = safe_head;
        let events = self.gateway.get_events(from, to).await?;
        let to_hash = self.gateway.get_block_hash(to).await?;

        let (result, affected) = self.apply_batch(&events, to, to_hash.as_deref())?;

        info!(
            from,
            to,
            donations = result.donations_added,
            withdrawals = result.withdrawals_added,
            duplicates = result.duplicates,
            skipped = result.skipped,
            "Ingestion batch applied"
        );

        if !affected.is_empty() {
            disburse::evaluate(
                &self.db,
                &self.dispatcher,
                &affected,
                self.config.min_disburse_amount,
            )?;
        }

        Ok(result)
    }

    /// Apply one batch of events and the cursor advance atomically.
    /// Returns the batch result and the campaigns that received donations.
    fn apply_batch(
        &self,
        events: &[ChainEvent],
        to: u64,
        to_hash: Option<&str>,
    ) -> Result<(IngestResult, Vec<i64>), LedgerError> {
        let mut result = IngestResult {
            new_cursor: to,
            ..Default::default()
        };
        let mut affected: Vec<i64> = Vec::new();

        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            for event in events {
                match event {
                    ChainEvent::Donation {
                        onchain_campaign_id,
                        donor,
                        amount_wei,
                        tx_hash,
                        log_index,
                        block_number,
                    } => {
                        let campaign =
                            campaigns::get_campaign_by_onchain_id(&tx, *onchain_campaign_id)?;
                        let Some(campaign) = campaign else {
                            warn!(
                                onchain_campaign_id,
                                tx_hash = %tx_hash,
                                "Donation for unknown campaign, skipping"
                            );
                            result.skipped += 1;
                            continue;
                        };

                        let added = donations::insert_if_absent(
                            &tx,
                            &NewDonation {
                                campaign_id: campaign.id,
                                onchain_campaign_id: *onchain_campaign_id,
                                donor_address: donor.clone(),
                                amount: wei_to_eth(*amount_wei),
                                amount_wei: amount_wei.to_string(),
                                tx_hash: tx_hash.clone(),
                                log_index: *log_index,
                                block_number: *block_number as i64,
                                timestamp: now_rfc3339(),
                            },
                        )?;
                        if added {
                            result.donations_added += 1;
                            if !affected.contains(&campaign.id) {
                                affected.push(campaign.id);
                            }
                        } else {
                            result.duplicates += 1;
                        }
                    }
                    ChainEvent::Withdrawal {
                        onchain_campaign_id,
                        owner,
                        amount_wei,
                        tx_hash,
                        log_index,
                        block_number,
                    } => {
                        let campaign =
                            campaigns::get_campaign_by_onchain_id(&tx, *onchain_campaign_id)?;
                        let Some(campaign) = campaign else {
                            warn!(
                                onchain_campaign_id,
                                tx_hash = %tx_hash,
                                "Withdrawal for unknown campaign, skipping"
                            );
                            result.skipped += 1;
                            continue;
                        };

                        let changed = withdrawals::upsert_observed(
                            &tx,
                            campaign.id,
                            owner,
                            wei_to_eth(*amount_wei),
                            &amount_wei.to_string(),
                            tx_hash,
                            *log_index,
                            *block_number as i64,
                        )?;
                        if changed {
                            result.withdrawals_added += 1;
                        } else {
                            result.duplicates += 1;
                        }
                    }
                    ChainEvent::CampaignCreated {
                        onchain_campaign_id,
                        tx_hash,
                        ..
                    } => {
                        // The receipt path owns campaign linkage; the log is
                        // only interesting when we have never seen the id.
                        debug!(onchain_campaign_id, tx_hash = %tx_hash, "Observed CampaignCreated");
                    }
                }
            }

            cursor::set(&tx, to, to_hash)?;
            tx.commit()?;
            Ok(())
        })?;

        Ok((result, affected))
    }

    /// A block we considered final is no longer canonical. Roll the cursor
    /// back below the conflict and flag it for manual review; rows from
    /// orphaned blocks are kept.
    fn handle_reorg(
        &self,
        cur: &cursor::Cursor,
        canonical: Option<&str>,
        safe_head: u64,
    ) -> Result<IngestResult, LedgerError> {
        let rollback_to = cur
            .processed_block
            .saturating_sub(self.config.confirmation_depth)
            .min(safe_head);

        error!(
            cursor = cur.processed_block,
            expected = ?cur.block_hash,
            found = ?canonical,
            rollback_to,
            "Reorg below confirmation depth detected"
        );

        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            cursor::set(&tx, rollback_to, None)?;
            audit::append(
                &tx,
                "reconciliation_conflict",
                "system:ingestor",
                None,
                None,
                &format!(
                    "reorg at block {}: expected hash {:?}, chain reports {:?}; cursor rolled back to {}",
                    cur.processed_block, cur.block_hash, canonical, rollback_to
                ),
            )?;
            tx.commit()?;
            Ok(())
        })?;

        Ok(IngestResult {
            new_cursor: rollback_to,
            reorg_detected: true,
            ..Default::default()
        })
    }

    /// Scheduled ingestion with bounded exponential backoff on transient
    /// chain errors. Never advances the cursor on failure.
    pub async fn run_loop(self: Arc<Self>, interval_secs: u64, backoff_secs: u64, backoff_max_secs: u64) {
        let interval = Duration::from_secs(interval_secs.max(1));
        let base_backoff = Duration::from_secs(backoff_secs.max(1));
        let max_backoff = Duration::from_secs(backoff_max_secs.max(backoff_secs).max(1));
        let mut delay = interval;

        info!(interval_secs, "Ingestion loop started");
        loop {
            tokio::time::sleep(delay).await;

            match self.ingest_once().await {
                Ok(result) => {
                    if result.reorg_detected {
                        warn!(cursor = result.new_cursor, "Reorg handled, resuming ingestion");
                    }
                    delay = interval;
                }
                Err(e) if e.is_transient() => {
                    let next = if delay >= interval {
                        base_backoff
                    } else {
                        (delay * 2).min(max_backoff)
                    };
                    warn!(error = %e, retry_secs = next.as_secs(), "Chain unreachable, backing off");
                    delay = next;
                }
                Err(e) => {
                    error!(error = %e, "Ingestion batch failed");
                    delay = interval;
                }
            }
        }
    }
}
