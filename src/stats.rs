//! Stats aggregator - pure read path over the ledger store
//!
//! Reads only committed rows, so a concurrent ingestion batch is either
//! fully visible or not at all.

use rusqlite::Connection;
use serde::Serialize;

use crate::db::campaigns::{self, CampaignRow};
use crate::db::{donations, withdrawals};
use crate::error::LedgerError;

/// Derived metrics for one campaign
#[derive(Debug, Clone, Serialize)]
pub struct CampaignStats {
    pub campaign_id: i64,
    pub total_raised: f64,
    pub donor_count: i64,
    pub donation_count: i64,
    pub total_withdrawn: f64,
    /// raised minus confirmed withdrawals
    pub available: f64,
    /// raised / target, 0.0 when the target is zero
    pub progress: f64,
}

/// Compute stats for a campaign
pub fn campaign_stats(conn: &Connection, campaign_id: i64) -> Result<CampaignStats, LedgerError> {
    let campaign = campaigns::get_campaign(conn, campaign_id)?
        .ok_or_else(|| LedgerError::NotFound(format!("campaign {}", campaign_id)))?;

    let total_raised = donations::total_raised(conn, campaign_id)?;
    let (donation_count, donor_count) = donations::donation_counts(conn, campaign_id)?;
    let total_withdrawn = withdrawals::total_withdrawn(conn, campaign_id)?;

    let progress = if campaign.target_amount > 0.0 {
        total_raised / campaign.target_amount
    } else {
        0.0
    };

    Ok(CampaignStats {
        campaign_id,
        total_raised,
        donor_count,
        donation_count,
        total_withdrawn,
        available: total_raised - total_withdrawn,
        progress,
    })
}

/// One campaign with its stats, for the admin report
#[derive(Debug, Clone, Serialize)]
pub struct CampaignReport {
    pub campaign: CampaignRow,
    pub stats: CampaignStats,
}

/// Global roll-up across all campaigns
#[derive(Debug, Clone, Serialize)]
pub struct AdminReport {
    pub campaign_count: usize,
    pub total_raised: f64,
    pub total_withdrawn: f64,
    pub donation_count: i64,
    pub campaigns: Vec<CampaignReport>,
}

/// Build the admin report
pub fn admin_report(conn: &Connection) -> Result<AdminReport, LedgerError> {
    let all = campaigns::list_campaigns(conn)?;

    let mut report = AdminReport {
        campaign_count: all.len(),
        total_raised: 0.0,
        total_withdrawn: 0.0,
        donation_count: 0,
        campaigns: Vec::with_capacity(all.len()),
    };

    for campaign in all {
        let stats = campaign_stats(conn, campaign.id)?;
        report.total_raised += stats.total_raised;
        report.total_withdrawn += stats.total_withdrawn;
        report.donation_count += stats.donation_count;
        report.campaigns.push(CampaignReport { campaign, stats });
    }

    Ok(report)
}
