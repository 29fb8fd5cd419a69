//! Transaction tracker
//!
//! Turns pending commands into on-chain transactions and tracks them to a
//! settled state. Three loops:
//!
//! - submit: claim pending commands, sign, send, mark submitted
//! - confirm: poll receipts for submitted commands within the wait window
//! - sweep: keep re-polling commands parked as unknown
//!
//! The three-way outcome is the contract: `confirmed` and `failed` mean the
//! chain said so; `unknown` only ever means "no receipt yet". The tracker
//! never conflates giving up waiting with an on-chain rejection.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::chain::{eth_to_wei, ChainGateway, Receipt, TransactionSigner, TxRequest};
use crate::db::campaigns::{self, CampaignStatus};
use crate::db::commands::{self, CommandKind, CommandRow, CommandStatus};
use crate::db::withdrawals::{self, WithdrawalStatus};
use crate::db::{audit, LedgerDb};
use crate::error::LedgerError;

/// Actor recorded on tracker-driven audit entries
const TRACKER_ACTOR: &str = "system:tracker";

/// Tracker configuration subset
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub submit_workers: usize,
    pub submit_lease_secs: u64,
    pub receipt_poll_interval_secs: u64,
    pub receipt_wait_window_secs: u64,
    pub sweep_interval_secs: u64,
    /// 0 = sweep forever
    pub sweep_hard_cutoff_secs: u64,
}

/// Background tracker for on-chain command execution
pub struct TransactionTracker {
    db: Arc<LedgerDb>,
    gateway: Arc<dyn ChainGateway>,
    signer: Arc<dyn TransactionSigner>,
    config: TrackerConfig,
    submit_slots: Arc<Semaphore>,
    worker_id: String,
}

impl TransactionTracker {
    pub fn new(
        db: Arc<LedgerDb>,
        gateway: Arc<dyn ChainGateway>,
        signer: Arc<dyn TransactionSigner>,
        config: TrackerConfig,
    ) -> Self {
        let submit_slots = Arc::new(Semaphore::new(config.submit_workers.max(1)));
        Self {
            db,
            gateway,
            signer,
            config,
            submit_slots,
            worker_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Claim and submit one round of pending commands. Returns how many
    /// were handed to the chain.
    pub async fn submit_once(self: &Arc<Self>) -> Result<usize, LedgerError> {
        let claimed = self.db.with_conn(|conn| {
            commands::claim_pending(conn, self.config.submit_workers.max(1), self.config.submit_lease_secs)
        })?;

        if claimed.is_empty() {
            return Ok(0);
        }
        debug!(count = claimed.len(), worker = %self.worker_id, "Claimed pending commands");

        let mut handles = Vec::new();
        for command in claimed {
            let tracker = Arc::clone(self);
            let permit = Arc::clone(&self.submit_slots).acquire_owned().await
                .map_err(|e| LedgerError::Internal(format!("semaphore closed: {}", e)))?;
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                tracker.submit_command(command).await
            }));
        }

        let mut submitted = 0;
        for handle in handles {
            match handle.await {
                Ok(Ok(true)) => submitted += 1,
                Ok(Ok(false)) => {}
                Ok(Err(e)) => warn!(error = %e, "Command submission errored"),
                Err(e) => error!(error = %e, "Submission task panicked"),
            }
        }
        Ok(submitted)
    }

    /// Submit a single claimed command. Returns true when it reached the
    /// chain, false when the claim was released for retry.
    async fn submit_command(&self, command: CommandRow) -> Result<bool, LedgerError> {
        let request = match self.build_request(&command) {
            Ok(request) => request,
            Err(e) => {
                // Unbuildable commands cannot succeed later
                self.fail_before_submit(&command, &e)?;
                return Err(e);
            }
        };

        let signed = match self.signer.sign(&request).await {
            Ok(signed) => signed,
            Err(e) if e.is_transient() => {
                self.release(&command, &e)?;
                return Ok(false);
            }
            Err(e) => {
                self.fail_before_submit(&command, &e)?;
                return Err(e);
            }
        };

        let tx_hash = match self.gateway.send_transaction(&signed).await {
            Ok(tx_hash) => tx_hash,
            Err(e) if e.is_transient() => {
                self.release(&command, &e)?;
                return Ok(false);
            }
            Err(e) => {
                self.fail_before_submit(&command, &e)?;
                return Err(e);
            }
        };

        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            commands::mark_submitted(&tx, command.id, &tx_hash)?;
            if let Some(withdrawal_id) = command.withdrawal_id {
                withdrawals::mark_submitted(&tx, withdrawal_id, &tx_hash)?;
            }
            audit::append(
                &tx,
                "command_submitted",
                TRACKER_ACTOR,
                Some(command.campaign_id),
                Some(&tx_hash),
                &format!("command {} ({})", command.id, command.kind.as_str()),
            )?;
            tx.commit()?;
            Ok(())
        })?;

        info!(
            command_id = command.id,
            kind = command.kind.as_str(),
            tx_hash = %tx_hash,
            "Command submitted"
        );
        Ok(true)
    }

    /// Build the transaction request for a command from its payload and the
    /// owning campaign's current state.
    fn build_request(&self, command: &CommandRow) -> Result<TxRequest, LedgerError> {
        match command.kind {
            CommandKind::CreateCampaign => {
                let payload = command.create_payload()?;
                Ok(TxRequest::CreateCampaign {
                    title: payload.title,
                    description: payload.description,
                    goal_wei: eth_to_wei(payload.goal_eth),
                })
            }
            CommandKind::Withdraw => {
                let payload = command.withdraw_payload()?;
                let onchain_id = self.onchain_id(command.campaign_id)?;
                Ok(TxRequest::Withdraw {
                    onchain_campaign_id: onchain_id,
                    amount_wei: eth_to_wei(payload.amount),
                })
            }
            CommandKind::SetActive => {
                let payload = command.set_active_payload()?;
                let onchain_id = self.onchain_id(command.campaign_id)?;
                Ok(TxRequest::SetActive {
                    onchain_campaign_id: onchain_id,
                    active: payload.active,
                })
            }
        }
    }

    fn onchain_id(&self, campaign_id: i64) -> Result<i64, LedgerError> {
        let campaign = self
            .db
            .with_conn(|conn| campaigns::get_campaign(conn, campaign_id))?
            .ok_or_else(|| LedgerError::NotFound(format!("campaign {}", campaign_id)))?;
        campaign
            .onchain_id
            .ok_or_else(|| LedgerError::InvalidCommand("campaign lost its on-chain id".into()))
    }

    fn release(&self, command: &CommandRow, error: &LedgerError) -> Result<(), LedgerError> {
        warn!(command_id = command.id, error = %error, "Transient failure, releasing claim");
        self.db
            .with_conn(|conn| commands::release_claim(conn, command.id, &error.to_string()))
    }

    /// A command that failed before ever reaching the chain: no transaction
    /// exists, so `failed` is accurate (not `unknown`).
    fn fail_before_submit(&self, command: &CommandRow, error: &LedgerError) -> Result<(), LedgerError> {
        error!(command_id = command.id, error = %error, "Command failed before submission");
        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            commands::resolve(&tx, command.id, CommandStatus::Failed, Some(&error.to_string()))?;
            if let Some(withdrawal_id) = command.withdrawal_id {
                withdrawals::set_status(&tx, withdrawal_id, WithdrawalStatus::Failed)?;
            }
            if command.kind == CommandKind::CreateCampaign {
                campaigns::set_status(&tx, command.campaign_id, CampaignStatus::FailedOnchain)?;
            }
            audit::append(
                &tx,
                "command_failed",
                TRACKER_ACTOR,
                Some(command.campaign_id),
                None,
                &format!("command {} failed before submit: {}", command.id, error),
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    // =========================================================================
    // Confirmation
    // =========================================================================

    /// Poll receipts for all submitted commands once. Commands past the
    /// wait window without a receipt are parked as unknown.
    pub async fn poll_submitted_once(&self) -> Result<(), LedgerError> {
        let submitted = self.db.with_conn(commands::list_submitted)?;

        for command in submitted {
            let Some(ref tx_hash) = command.tx_hash else {
                // cannot happen through mark_submitted; quarantine it
                self.park_unknown(&command, "submitted without tx hash")?;
                continue;
            };

            match self.gateway.get_receipt(tx_hash).await {
                Ok(Some(receipt)) => self.apply_receipt(&command, &receipt)?,
                Ok(None) => {
                    if self.wait_window_expired(&command)? {
                        self.park_unknown(&command, "wait window expired without receipt")?;
                    }
                }
                Err(e) if e.is_transient() => {
                    warn!(command_id = command.id, error = %e, "Receipt poll failed, will retry");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Re-poll unknown commands once. A receipt settles them like any
    /// other; without one they stay unknown unless the hard cutoff passed.
    pub async fn sweep_unknown_once(&self) -> Result<(), LedgerError> {
        let unknown = self.db.with_conn(commands::list_unknown)?;

        for command in unknown {
            let Some(ref tx_hash) = command.tx_hash else {
                continue;
            };

            match self.gateway.get_receipt(tx_hash).await {
                Ok(Some(receipt)) => {
                    info!(command_id = command.id, tx_hash = %tx_hash, "Late receipt for unknown command");
                    self.apply_receipt(&command, &receipt)?;
                }
                Ok(None) => {
                    if self.hard_cutoff_expired(&command)? {
                        warn!(command_id = command.id, "Unknown command passed hard cutoff");
                        self.db.with_conn_mut(|conn| {
                            let tx = conn.transaction()?;
                            commands::resolve(
                                &tx,
                                command.id,
                                CommandStatus::Failed,
                                Some("no receipt before hard cutoff"),
                            )?;
                            if let Some(withdrawal_id) = command.withdrawal_id {
                                withdrawals::set_status(&tx, withdrawal_id, WithdrawalStatus::Failed)?;
                            }
                            audit::append(
                                &tx,
                                "sweep_cutoff",
                                TRACKER_ACTOR,
                                Some(command.campaign_id),
                                command.tx_hash.as_deref(),
                                &format!("command {} abandoned after hard cutoff", command.id),
                            )?;
                            tx.commit()?;
                            Ok(())
                        })?;
                    }
                }
                Err(e) if e.is_transient() => {
                    warn!(command_id = command.id, error = %e, "Sweep poll failed, will retry");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Settle a command from its receipt and propagate into the owning
    /// entity, all in one transaction.
    fn apply_receipt(&self, command: &CommandRow, receipt: &Receipt) -> Result<(), LedgerError> {
        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            if receipt.success {
                commands::resolve(&tx, command.id, CommandStatus::Confirmed, None)?;

                match command.kind {
                    CommandKind::CreateCampaign => match receipt.onchain_campaign_id {
                        Some(onchain_id) => {
                            campaigns::set_onchain_info(
                                &tx,
                                command.campaign_id,
                                onchain_id,
                                &receipt.tx_hash,
                                CampaignStatus::Active,
                            )?;
                        }
                        None => {
                            // confirmed but unlinkable; needs an operator
                            audit::append(
                                &tx,
                                "reconciliation_conflict",
                                TRACKER_ACTOR,
                                Some(command.campaign_id),
                                Some(&receipt.tx_hash),
                                &format!(
                                    "create command {} confirmed but receipt has no CampaignCreated log",
                                    command.id
                                ),
                            )?;
                        }
                    },
                    CommandKind::Withdraw => {
                        if let Some(withdrawal_id) = command.withdrawal_id {
                            withdrawals::set_status(&tx, withdrawal_id, WithdrawalStatus::Confirmed)?;
                        }
                    }
                    CommandKind::SetActive => {
                        let payload = command.set_active_payload()?;
                        let status = if payload.active {
                            CampaignStatus::Active
                        } else {
                            CampaignStatus::Closed
                        };
                        campaigns::set_status(&tx, command.campaign_id, status)?;
                    }
                }

                audit::append(
                    &tx,
                    "command_confirmed",
                    TRACKER_ACTOR,
                    Some(command.campaign_id),
                    Some(&receipt.tx_hash),
                    &format!("command {} ({})", command.id, command.kind.as_str()),
                )?;
            } else {
                let reason = receipt.revert_reason.as_deref().unwrap_or("reverted");
                commands::resolve(&tx, command.id, CommandStatus::Failed, Some(reason))?;

                match command.kind {
                    CommandKind::CreateCampaign => {
                        campaigns::set_status(&tx, command.campaign_id, CampaignStatus::FailedOnchain)?;
                    }
                    CommandKind::Withdraw => {
                        if let Some(withdrawal_id) = command.withdrawal_id {
                            withdrawals::set_status(&tx, withdrawal_id, WithdrawalStatus::Failed)?;
                        }
                    }
                    CommandKind::SetActive => {}
                }

                audit::append(
                    &tx,
                    "command_failed",
                    TRACKER_ACTOR,
                    Some(command.campaign_id),
                    Some(&receipt.tx_hash),
                    &format!("command {} reverted: {}", command.id, reason),
                )?;
            }

            tx.commit()?;
            Ok(())
        })?;

        info!(
            command_id = command.id,
            success = receipt.success,
            tx_hash = %receipt.tx_hash,
            "Command settled"
        );
        Ok(())
    }

    fn park_unknown(&self, command: &CommandRow, reason: &str) -> Result<(), LedgerError> {
        warn!(command_id = command.id, reason, "Parking command as unknown");
        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            commands::resolve(&tx, command.id, CommandStatus::Unknown, Some(reason))?;
            if let Some(withdrawal_id) = command.withdrawal_id {
                withdrawals::set_status(&tx, withdrawal_id, WithdrawalStatus::Unknown)?;
            }
            audit::append(
                &tx,
                "command_unknown",
                TRACKER_ACTOR,
                Some(command.campaign_id),
                command.tx_hash.as_deref(),
                &format!("command {}: {}", command.id, reason),
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    fn wait_window_expired(&self, command: &CommandRow) -> Result<bool, LedgerError> {
        let Some(ref submitted_at) = command.submitted_at else {
            return Ok(false);
        };
        let submitted = chrono::DateTime::parse_from_rfc3339(submitted_at)
            .map_err(|e| LedgerError::Parse(format!("submitted_at: {}", e)))?;
        let age = chrono::Utc::now().signed_duration_since(submitted);
        Ok(age.num_seconds() >= self.config.receipt_wait_window_secs as i64)
    }

    fn hard_cutoff_expired(&self, command: &CommandRow) -> Result<bool, LedgerError> {
        if self.config.sweep_hard_cutoff_secs == 0 {
            return Ok(false);
        }
        let created = chrono::DateTime::parse_from_rfc3339(&command.created_at)
            .map_err(|e| LedgerError::Parse(format!("created_at: {}", e)))?;
        let age = chrono::Utc::now().signed_duration_since(created);
        Ok(age.num_seconds() >= self.config.sweep_hard_cutoff_secs as i64)
    }

    // =========================================================================
    // Loops
    // =========================================================================

    /// Submission loop
    pub async fn run_submit_loop(self: Arc<Self>) {
        info!(workers = self.config.submit_workers, "Submit loop started");
        loop {
            if let Err(e) = self.submit_once().await {
                error!(error = %e, "Submit round failed");
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    /// Confirmation polling loop
    pub async fn run_confirm_loop(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.receipt_poll_interval_secs.max(1));
        info!(interval_secs = interval.as_secs(), "Confirm loop started");
        loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = self.poll_submitted_once().await {
                error!(error = %e, "Confirmation round failed");
            }
        }
    }

    /// Unknown-command sweep loop
    pub async fn run_sweep_loop(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        info!(interval_secs = interval.as_secs(), "Sweep loop started");
        loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = self.sweep_unknown_once().await {
                error!(error = %e, "Sweep round failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::{MockChain, MockSigner};
    use crate::db::campaigns::CreateCampaignInput;
    use crate::dispatch::CommandDispatcher;

    fn config() -> TrackerConfig {
        TrackerConfig {
            submit_workers: 2,
            submit_lease_secs: 30,
            receipt_poll_interval_secs: 1,
            receipt_wait_window_secs: 60,
            sweep_interval_secs: 1,
            sweep_hard_cutoff_secs: 0,
        }
    }

    fn zero_wait_config() -> TrackerConfig {
        TrackerConfig {
            receipt_wait_window_secs: 0,
            ..config()
        }
    }

    fn setup(cfg: TrackerConfig) -> (Arc<LedgerDb>, Arc<MockChain>, Arc<TransactionTracker>, CommandDispatcher) {
        let db = Arc::new(LedgerDb::open_in_memory().unwrap());
        let chain = Arc::new(MockChain::new());
        let tracker = Arc::new(TransactionTracker::new(
            db.clone(),
            chain.clone(),
            Arc::new(MockSigner),
            cfg,
        ));
        let dispatcher = CommandDispatcher::new(db.clone());
        (db, chain, tracker, dispatcher)
    }

    fn input(create_onchain: bool) -> CreateCampaignInput {
        CreateCampaignInput {
            title: "t".into(),
            short_desc: None,
            description: Some("d".into()),
            image_url: None,
            beneficiary_address: None,
            target_amount: 10.0,
            currency: "ETH".into(),
            deadline: None,
            auto_disburse: false,
            disburse_threshold: 0.8,
            create_onchain,
        }
    }

    #[tokio::test]
    async fn create_command_confirms_and_links_campaign() {
        let (db, chain, tracker, dispatcher) = setup(config());
        chain.set_auto_receipt(true);

        let created = dispatcher.create_campaign(&input(true), "admin").unwrap();
        let campaign_id = created.campaign.id;

        assert_eq!(tracker.submit_once().await.unwrap(), 1);
        tracker.poll_submitted_once().await.unwrap();

        let campaign = db
            .with_conn(|conn| campaigns::get_campaign(conn, campaign_id))
            .unwrap()
            .unwrap();
        assert_eq!(campaign.status, CampaignStatus::Active);
        assert_eq!(campaign.onchain_id, Some(1));
        assert!(campaign.contract_tx_hash.is_some());

        let command = db
            .with_conn(|conn| commands::get_command(conn, created.command_id.unwrap()))
            .unwrap()
            .unwrap();
        assert_eq!(command.status, CommandStatus::Confirmed);
    }

    #[tokio::test]
    async fn reverted_create_marks_campaign_failed_onchain() {
        let (db, chain, tracker, dispatcher) = setup(config());

        let created = dispatcher.create_campaign(&input(true), "admin").unwrap();
        tracker.submit_once().await.unwrap();

        let (tx_hash, _) = chain.submitted().pop().unwrap();
        chain.deliver_receipt(&tx_hash, false, None);
        tracker.poll_submitted_once().await.unwrap();

        let campaign = db
            .with_conn(|conn| campaigns::get_campaign(conn, created.campaign.id))
            .unwrap()
            .unwrap();
        assert_eq!(campaign.status, CampaignStatus::FailedOnchain);

        let command = db
            .with_conn(|conn| commands::get_command(conn, created.command_id.unwrap()))
            .unwrap()
            .unwrap();
        assert_eq!(command.status, CommandStatus::Failed);
        assert!(command.last_error.is_some());
    }

    #[tokio::test]
    async fn missing_receipt_parks_unknown_then_sweep_confirms() {
        let (db, chain, tracker, dispatcher) = setup(zero_wait_config());

        let created = dispatcher.create_campaign(&input(true), "admin").unwrap();
        let command_id = created.command_id.unwrap();
        tracker.submit_once().await.unwrap();

        // no receipt and a zero wait window: parked as unknown, not failed
        tracker.poll_submitted_once().await.unwrap();
        let command = db
            .with_conn(|conn| commands::get_command(conn, command_id))
            .unwrap()
            .unwrap();
        assert_eq!(command.status, CommandStatus::Unknown);

        // the receipt eventually appears; the sweep settles it
        let (tx_hash, _) = chain.submitted().pop().unwrap();
        chain.deliver_receipt(&tx_hash, true, Some(5));
        tracker.sweep_unknown_once().await.unwrap();

        let command = db
            .with_conn(|conn| commands::get_command(conn, command_id))
            .unwrap()
            .unwrap();
        assert_eq!(command.status, CommandStatus::Confirmed);

        let campaign = db
            .with_conn(|conn| campaigns::get_campaign(conn, created.campaign.id))
            .unwrap()
            .unwrap();
        assert_eq!(campaign.onchain_id, Some(5));
        assert_eq!(campaign.status, CampaignStatus::Active);
    }

    #[tokio::test]
    async fn transient_rpc_failure_releases_claim_for_retry() {
        let (db, chain, tracker, dispatcher) = setup(config());

        let created = dispatcher.create_campaign(&input(true), "admin").unwrap();
        let command_id = created.command_id.unwrap();

        chain.set_rpc_down(true);
        assert_eq!(tracker.submit_once().await.unwrap(), 0);

        let command = db
            .with_conn(|conn| commands::get_command(conn, command_id))
            .unwrap()
            .unwrap();
        assert_eq!(command.status, CommandStatus::Pending);
        assert!(command.last_error.is_some());

        chain.set_rpc_down(false);
        chain.set_auto_receipt(true);
        assert_eq!(tracker.submit_once().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn withdraw_confirmation_propagates_to_withdrawal_row() {
        let (db, chain, tracker, dispatcher) = setup(config());
        chain.set_auto_receipt(true);

        let created = dispatcher.create_campaign(&input(false), "admin").unwrap();
        let campaign_id = created.campaign.id;
        db.with_conn(|conn| {
            campaigns::set_onchain_info(conn, campaign_id, 1, "0xc", CampaignStatus::Active)
        })
        .unwrap();
        db.with_conn(|conn| {
            crate::db::donations::insert_if_absent(
                conn,
                &crate::db::donations::NewDonation {
                    campaign_id,
                    onchain_campaign_id: 1,
                    donor_address: "0xd".into(),
                    amount: 5.0,
                    amount_wei: "0".into(),
                    tx_hash: "0xfund".into(),
                    log_index: 0,
                    block_number: 1,
                    timestamp: "2026-01-01T00:00:00Z".into(),
                },
            )
        })
        .unwrap();

        dispatcher.submit_withdraw(campaign_id, 3.0, "admin").unwrap();
        tracker.submit_once().await.unwrap();
        tracker.poll_submitted_once().await.unwrap();

        let rows = db
            .with_conn(|conn| withdrawals::list_for_campaign(conn, campaign_id))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, WithdrawalStatus::Confirmed);
        assert!(rows[0].confirmed_at.is_some());

        // the submitted request carried the on-chain id and wei amount
        let (_, request) = chain.submitted().pop().unwrap();
        assert_eq!(
            request,
            TxRequest::Withdraw {
                onchain_campaign_id: 1,
                amount_wei: 3_000_000_000_000_000_000,
            }
        );
    }
}
