//! Auto-disburse trigger
//!
//! Runs at the end of each ingestion batch, once per campaign that received
//! donations. When a campaign with auto_disburse enabled crosses its funding
//! threshold, a withdraw command for the full available balance is enqueued
//! under the system actor. Two batches racing on the same campaign resolve
//! through the dispatcher's one-in-flight invariant: exactly one command is
//! accepted, the loser's CommandInFlight is absorbed here.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::db::{campaigns, donations, withdrawals, LedgerDb};
use crate::dispatch::CommandDispatcher;
use crate::error::LedgerError;

/// Actor recorded on auto-disburse withdrawals and their audit entries
pub const AUTO_DISBURSE_ACTOR: &str = "system:auto_disburse";

/// Evaluate auto-disburse for the given campaigns. Returns the ids of
/// campaigns for which a withdraw command was enqueued.
pub fn evaluate(
    db: &Arc<LedgerDb>,
    dispatcher: &CommandDispatcher,
    campaign_ids: &[i64],
    min_disburse_amount: f64,
) -> Result<Vec<i64>, LedgerError> {
    let candidates = db.with_conn(|conn| campaigns::list_auto_disburse_candidates(conn, campaign_ids))?;

    let mut triggered = Vec::new();
    for campaign in candidates {
        let (raised, withdrawn, in_flight) = db.with_conn(|conn| {
            Ok((
                donations::total_raised(conn, campaign.id)?,
                withdrawals::total_withdrawn(conn, campaign.id)?,
                withdrawals::total_in_flight(conn, campaign.id)?,
            ))
        })?;

        if campaign.target_amount <= 0.0 {
            continue;
        }
        let ratio = raised / campaign.target_amount;
        if ratio < campaign.disburse_threshold {
            debug!(
                campaign_id = campaign.id,
                raised,
                threshold = campaign.disburse_threshold,
                ratio,
                "Below disburse threshold"
            );
            continue;
        }

        let available = raised - withdrawn - in_flight;
        if available < min_disburse_amount {
            debug!(campaign_id = campaign.id, available, "Nothing worth disbursing");
            continue;
        }

        match dispatcher.submit_withdraw(campaign.id, available, AUTO_DISBURSE_ACTOR) {
            Ok(command_id) => {
                info!(
                    campaign_id = campaign.id,
                    raised,
                    available,
                    command_id,
                    "Auto-disburse triggered"
                );
                triggered.push(campaign.id);
            }
            Err(LedgerError::CommandInFlight { .. }) => {
                debug!(campaign_id = campaign.id, "Withdraw already in flight, skipping");
            }
            Err(e) => {
                warn!(campaign_id = campaign.id, error = %e, "Auto-disburse submit failed");
            }
        }
    }

    Ok(triggered)
}
