//! Command dispatcher - validated, durable on-chain write intents
//!
//! Accepts administrator write intents, validates them against the current
//! ledger snapshot, and persists them as pending commands. The call returns
//! immediately; actual blockchain submission is the transaction tracker's
//! job. Validation and insert happen in one transaction so the
//! one-in-flight-per-(campaign, kind) invariant cannot be raced past.

use std::sync::Arc;

use tracing::info;

use crate::db::audit;
use crate::db::campaigns::{self, CampaignRow, CampaignStatus, CreateCampaignInput};
use crate::db::commands::{
    self, CommandKind, CreateCampaignPayload, SetActivePayload, WithdrawPayload,
};
use crate::db::{donations, withdrawals, LedgerDb};
use crate::error::LedgerError;

/// Command dispatcher
pub struct CommandDispatcher {
    db: Arc<LedgerDb>,
}

/// Result of creating a campaign through the dispatcher
#[derive(Debug, Clone, serde::Serialize)]
pub struct CreatedCampaign {
    pub campaign: CampaignRow,
    /// Present when a create command was dispatched alongside the row
    pub command_id: Option<i64>,
}

impl CommandDispatcher {
    pub fn new(db: Arc<LedgerDb>) -> Self {
        Self { db }
    }

    /// Create a campaign ledger row, optionally dispatching the on-chain
    /// create command in the same transaction.
    pub fn create_campaign(
        &self,
        input: &CreateCampaignInput,
        requested_by: &str,
    ) -> Result<CreatedCampaign, LedgerError> {
        if input.target_amount <= 0.0 {
            return Err(LedgerError::InvalidCommand("target_amount must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&input.disburse_threshold) {
            return Err(LedgerError::InvalidCommand(
                "disburse_threshold must be within 0.0..=1.0".into(),
            ));
        }

        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let status = if input.create_onchain {
                CampaignStatus::PendingOnchain
            } else {
                CampaignStatus::Draft
            };
            let campaign = campaigns::create_campaign(&tx, input, status)?;

            let command_id = if input.create_onchain {
                let payload = serde_json::to_value(CreateCampaignPayload {
                    title: campaign.title.clone(),
                    description: campaign.description.clone().unwrap_or_default(),
                    goal_eth: campaign.target_amount,
                })?;
                let id = commands::insert_pending(
                    &tx,
                    campaign.id,
                    CommandKind::CreateCampaign,
                    &payload,
                    None,
                    requested_by,
                )?;
                audit::append(
                    &tx,
                    "command_accepted",
                    requested_by,
                    Some(campaign.id),
                    None,
                    &format!("create_campaign command {}", id),
                )?;
                Some(id)
            } else {
                None
            };

            audit::append(
                &tx,
                "campaign_created",
                requested_by,
                Some(campaign.id),
                None,
                &format!("title={:?} target={}", campaign.title, campaign.target_amount),
            )?;

            tx.commit()?;
            info!(campaign_id = campaign.id, onchain = input.create_onchain, "Campaign created");
            Ok(CreatedCampaign { campaign, command_id })
        })
    }

    /// Dispatch an on-chain create for an existing draft campaign
    pub fn submit_create(&self, campaign_id: i64, requested_by: &str) -> Result<i64, LedgerError> {
        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let campaign = campaigns::get_campaign(&tx, campaign_id)?
                .ok_or_else(|| LedgerError::NotFound(format!("campaign {}", campaign_id)))?;
            if campaign.onchain_id.is_some() {
                return Err(LedgerError::InvalidCommand(
                    "campaign already exists on-chain".into(),
                ));
            }

            let payload = serde_json::to_value(CreateCampaignPayload {
                title: campaign.title.clone(),
                description: campaign.description.clone().unwrap_or_default(),
                goal_eth: campaign.target_amount,
            })?;
            let id = commands::insert_pending(
                &tx,
                campaign_id,
                CommandKind::CreateCampaign,
                &payload,
                None,
                requested_by,
            )?;
            campaigns::set_status(&tx, campaign_id, CampaignStatus::PendingOnchain)?;
            audit::append(
                &tx,
                "command_accepted",
                requested_by,
                Some(campaign_id),
                None,
                &format!("create_campaign command {}", id),
            )?;

            tx.commit()?;
            Ok(id)
        })
    }

    /// Dispatch a withdrawal. Rejected when the amount exceeds the
    /// campaign's available balance (raised minus confirmed withdrawals).
    pub fn submit_withdraw(
        &self,
        campaign_id: i64,
        amount: f64,
        requested_by: &str,
    ) -> Result<i64, LedgerError> {
        if amount <= 0.0 {
            return Err(LedgerError::InvalidCommand("withdraw amount must be > 0".into()));
        }

        let command_id = self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let campaign = campaigns::get_campaign(&tx, campaign_id)?
                .ok_or_else(|| LedgerError::NotFound(format!("campaign {}", campaign_id)))?;
            if campaign.onchain_id.is_none() {
                return Err(LedgerError::InvalidCommand(
                    "campaign has no on-chain counterpart yet".into(),
                ));
            }

            let raised = donations::total_raised(&tx, campaign_id)?;
            let withdrawn = withdrawals::total_withdrawn(&tx, campaign_id)?;
            let available = raised - withdrawn;
            if amount > available {
                return Err(LedgerError::InvalidCommand(format!(
                    "withdraw amount {} exceeds available balance {}",
                    amount, available
                )));
            }

            let withdrawal_id = withdrawals::insert_requested(&tx, campaign_id, amount, requested_by)?;
            let payload = serde_json::to_value(WithdrawPayload { amount })?;
            let id = commands::insert_pending(
                &tx,
                campaign_id,
                CommandKind::Withdraw,
                &payload,
                Some(withdrawal_id),
                requested_by,
            )?;
            audit::append(
                &tx,
                "command_accepted",
                requested_by,
                Some(campaign_id),
                None,
                &format!("withdraw command {} amount={}", id, amount),
            )?;

            tx.commit()?;
            Ok(id)
        })?;

        info!(campaign_id, amount, requested_by, command_id, "Withdraw command accepted");
        Ok(command_id)
    }

    /// Dispatch an active/inactive toggle
    pub fn submit_set_active(
        &self,
        campaign_id: i64,
        active: bool,
        requested_by: &str,
    ) -> Result<i64, LedgerError> {
        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let campaign = campaigns::get_campaign(&tx, campaign_id)?
                .ok_or_else(|| LedgerError::NotFound(format!("campaign {}", campaign_id)))?;
            if campaign.onchain_id.is_none() {
                return Err(LedgerError::InvalidCommand(
                    "campaign has no on-chain counterpart yet".into(),
                ));
            }

            let payload = serde_json::to_value(SetActivePayload { active })?;
            let id = commands::insert_pending(
                &tx,
                campaign_id,
                CommandKind::SetActive,
                &payload,
                None,
                requested_by,
            )?;
            audit::append(
                &tx,
                "command_accepted",
                requested_by,
                Some(campaign_id),
                None,
                &format!("set_active command {} active={}", id, active),
            )?;

            tx.commit()?;
            Ok(id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::donations::{insert_if_absent, NewDonation};

    fn input(create_onchain: bool) -> CreateCampaignInput {
        CreateCampaignInput {
            title: "t".into(),
            short_desc: None,
            description: None,
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

    fn setup() -> (Arc<LedgerDb>, CommandDispatcher) {
        let db = Arc::new(LedgerDb::open_in_memory().unwrap());
        let dispatcher = CommandDispatcher::new(db.clone());
        (db, dispatcher)
    }

    fn fund(db: &LedgerDb, campaign_id: i64, amount: f64) {
        db.with_conn(|conn| {
            insert_if_absent(
                conn,
                &NewDonation {
                    campaign_id,
                    onchain_campaign_id: 1,
                    donor_address: "0xd".into(),
                    amount,
                    amount_wei: "0".into(),
                    tx_hash: format!("0xfund{}", amount),
                    log_index: 0,
                    block_number: 1,
                    timestamp: "2026-01-01T00:00:00Z".into(),
                },
            )
        })
        .unwrap();
    }

    #[test]
    fn create_onchain_dispatches_command_and_sets_pending() {
        let (_db, dispatcher) = setup();

        let created = dispatcher.create_campaign(&input(true), "admin").unwrap();
        assert!(created.command_id.is_some());
        assert_eq!(created.campaign.status, CampaignStatus::PendingOnchain);
    }

    #[test]
    fn withdraw_rejected_without_onchain_identity() {
        let (_db, dispatcher) = setup();
        let created = dispatcher.create_campaign(&input(false), "admin").unwrap();

        let err = dispatcher.submit_withdraw(created.campaign.id, 1.0, "admin").unwrap_err();
        assert!(matches!(err, LedgerError::InvalidCommand(_)));
    }

    #[test]
    fn withdraw_exceeding_balance_persists_nothing() {
        let (db, dispatcher) = setup();
        let created = dispatcher.create_campaign(&input(false), "admin").unwrap();
        let id = created.campaign.id;
        db.with_conn(|conn| {
            campaigns::set_onchain_info(conn, id, 1, "0xc", CampaignStatus::Active)
        })
        .unwrap();
        fund(&db, id, 2.0);

        let err = dispatcher.submit_withdraw(id, 5.0, "admin").unwrap_err();
        assert!(matches!(err, LedgerError::InvalidCommand(_)));

        // no command, no withdrawal row
        let cmds = db.with_conn(|conn| commands::claim_pending(conn, 10, 1)).unwrap();
        assert!(cmds.is_empty());
        let rows = db.with_conn(|conn| withdrawals::list_for_campaign(conn, id)).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn second_withdraw_while_first_in_flight_is_rejected() {
        let (db, dispatcher) = setup();
        let created = dispatcher.create_campaign(&input(false), "admin").unwrap();
        let id = created.campaign.id;
        db.with_conn(|conn| {
            campaigns::set_onchain_info(conn, id, 1, "0xc", CampaignStatus::Active)
        })
        .unwrap();
        fund(&db, id, 10.0);

        dispatcher.submit_withdraw(id, 1.0, "admin").unwrap();
        let err = dispatcher.submit_withdraw(id, 1.0, "admin").unwrap_err();
        assert!(matches!(err, LedgerError::CommandInFlight { .. }));
    }

    #[test]
    fn set_active_requires_onchain_identity() {
        let (db, dispatcher) = setup();
        let created = dispatcher.create_campaign(&input(false), "admin").unwrap();
        let id = created.campaign.id;

        assert!(matches!(
            dispatcher.submit_set_active(id, false, "admin"),
            Err(LedgerError::InvalidCommand(_))
        ));

        db.with_conn(|conn| {
            campaigns::set_onchain_info(conn, id, 1, "0xc", CampaignStatus::Active)
        })
        .unwrap();
        dispatcher.submit_set_active(id, false, "admin").unwrap();
    }

    #[test]
    fn duplicate_create_rejected_once_onchain() {
        let (db, dispatcher) = setup();
        let created = dispatcher.create_campaign(&input(false), "admin").unwrap();
        let id = created.campaign.id;
        db.with_conn(|conn| {
            campaigns::set_onchain_info(conn, id, 1, "0xc", CampaignStatus::Active)
        })
        .unwrap();

        let err = dispatcher.submit_create(id, "admin").unwrap_err();
        assert!(matches!(err, LedgerError::InvalidCommand(_)));
    }
}
