//! Donation rows
//!
//! Created only by the event ingestor, never updated or deleted.
//! (tx_hash, log_index) is globally unique; replayed ingestion is a no-op.

use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

/// Donation row from database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DonationRow {
    pub id: i64,
    pub campaign_id: i64,
    pub onchain_campaign_id: i64,
    pub donor_address: String,
    pub amount: f64,
    pub amount_wei: String,
    pub tx_hash: String,
    pub log_index: i64,
    pub block_number: i64,
    pub timestamp: String,
}

impl DonationRow {
    fn from_row(row: &Row) -> Result<Self, LedgerError> {
        Ok(Self {
            id: row.get("id")?,
            campaign_id: row.get("campaign_id")?,
            onchain_campaign_id: row.get("onchain_campaign_id")?,
            donor_address: row.get("donor_address")?,
            amount: row.get("amount")?,
            amount_wei: row.get("amount_wei")?,
            tx_hash: row.get("tx_hash")?,
            log_index: row.get("log_index")?,
            block_number: row.get("block_number")?,
            timestamp: row.get("timestamp")?,
        })
    }
}

/// Input for inserting a donation
#[derive(Debug, Clone)]
pub struct NewDonation {
    pub campaign_id: i64,
    pub onchain_campaign_id: i64,
    pub donor_address: String,
    pub amount: f64,
    pub amount_wei: String,
    pub tx_hash: String,
    pub log_index: i64,
    pub block_number: i64,
    pub timestamp: String,
}

/// Insert a donation if absent. Returns true when a row was added,
/// false when the (tx_hash, log_index) pair was already present.
pub fn insert_if_absent(conn: &Connection, donation: &NewDonation) -> Result<bool, LedgerError> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO donations
            (campaign_id, onchain_campaign_id, donor_address, amount,
             amount_wei, tx_hash, log_index, block_number, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            donation.campaign_id,
            donation.onchain_campaign_id,
            donation.donor_address,
            donation.amount,
            donation.amount_wei,
            donation.tx_hash,
            donation.log_index,
            donation.block_number,
            donation.timestamp,
        ],
    )?;
    Ok(changed > 0)
}

/// List donations for a campaign, newest first
pub fn list_for_campaign(conn: &Connection, campaign_id: i64) -> Result<Vec<DonationRow>, LedgerError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM donations WHERE campaign_id = ? ORDER BY block_number DESC, log_index DESC",
    )?;
    let rows = stmt.query_and_then(params![campaign_id], |row| DonationRow::from_row(row))?;
    rows.collect()
}

/// Sum of all donations for a campaign
pub fn total_raised(conn: &Connection, campaign_id: i64) -> Result<f64, LedgerError> {
    let total: f64 = conn.query_row(
        "SELECT COALESCE(SUM(amount), 0.0) FROM donations WHERE campaign_id = ?",
        params![campaign_id],
        |row| row.get(0),
    )?;
    Ok(total)
}

/// Count of donations and distinct donors for a campaign
pub fn donation_counts(conn: &Connection, campaign_id: i64) -> Result<(i64, i64), LedgerError> {
    conn.query_row(
        "SELECT COUNT(*), COUNT(DISTINCT donor_address) FROM donations WHERE campaign_id = ?",
        params![campaign_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .map_err(Into::into)
}
