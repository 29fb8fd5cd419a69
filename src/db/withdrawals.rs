//! Withdrawal rows
//!
//! Created as `requested` by the command dispatcher and advanced by the
//! transaction tracker, or inserted directly as `confirmed` when the event
//! ingestor observes a withdrawal with no local command.

use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use crate::db::now_rfc3339;
use crate::error::LedgerError;

/// Withdrawal lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    Requested,
    Submitted,
    Confirmed,
    Failed,
    /// Wait window expired without a receipt; outcome still undetermined
    Unknown,
}

impl WithdrawalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalStatus::Requested => "requested",
            WithdrawalStatus::Submitted => "submitted",
            WithdrawalStatus::Confirmed => "confirmed",
            WithdrawalStatus::Failed => "failed",
            WithdrawalStatus::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Result<Self, LedgerError> {
        match s {
            "requested" => Ok(WithdrawalStatus::Requested),
            "submitted" => Ok(WithdrawalStatus::Submitted),
            "confirmed" => Ok(WithdrawalStatus::Confirmed),
            "failed" => Ok(WithdrawalStatus::Failed),
            "unknown" => Ok(WithdrawalStatus::Unknown),
            other => Err(LedgerError::Parse(format!("unknown withdrawal status: {}", other))),
        }
    }
}

/// Withdrawal row from database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalRow {
    pub id: i64,
    pub campaign_id: i64,
    pub owner_address: Option<String>,
    pub amount: f64,
    pub amount_wei: Option<String>,
    pub tx_hash: Option<String>,
    pub log_index: Option<i64>,
    pub block_number: Option<i64>,
    pub status: WithdrawalStatus,
    pub requested_by: String,
    pub requested_at: String,
    pub confirmed_at: Option<String>,
}

impl WithdrawalRow {
    fn from_row(row: &Row) -> Result<Self, LedgerError> {
        let status: String = row.get("status")?;
        Ok(Self {
            id: row.get("id")?,
            campaign_id: row.get("campaign_id")?,
            owner_address: row.get("owner_address")?,
            amount: row.get("amount")?,
            amount_wei: row.get("amount_wei")?,
            tx_hash: row.get("tx_hash")?,
            log_index: row.get("log_index")?,
            block_number: row.get("block_number")?,
            status: WithdrawalStatus::parse(&status)?,
            requested_by: row.get("requested_by")?,
            requested_at: row.get("requested_at")?,
            confirmed_at: row.get("confirmed_at")?,
        })
    }
}

/// Insert a `requested` withdrawal, returning its id
pub fn insert_requested(
    conn: &Connection,
    campaign_id: i64,
    amount: f64,
    requested_by: &str,
) -> Result<i64, LedgerError> {
    conn.execute(
        "INSERT INTO withdrawals (campaign_id, amount, status, requested_by, requested_at)
         VALUES (?1, ?2, 'requested', ?3, ?4)",
        params![campaign_id, amount, requested_by, now_rfc3339()],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Insert a chain-observed withdrawal if its tx hash is new. If a submitted
/// row already carries the hash it is promoted to confirmed instead.
/// Returns true when anything changed.
pub fn upsert_observed(
    conn: &Connection,
    campaign_id: i64,
    owner_address: &str,
    amount: f64,
    amount_wei: &str,
    tx_hash: &str,
    log_index: i64,
    block_number: i64,
) -> Result<bool, LedgerError> {
    let now = now_rfc3339();

    let existing: Option<(i64, String)> = conn
        .query_row(
            "SELECT id, status FROM withdrawals WHERE tx_hash = ?",
            params![tx_hash],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;

    match existing {
        Some((id, status)) if status != "confirmed" => {
            conn.execute(
                "UPDATE withdrawals SET status = 'confirmed', owner_address = ?1,
                    amount_wei = ?2, log_index = ?3, block_number = ?4, confirmed_at = ?5
                 WHERE id = ?6",
                params![owner_address, amount_wei, log_index, block_number, now, id],
            )?;
            Ok(true)
        }
        Some(_) => Ok(false),
        None => {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO withdrawals
                    (campaign_id, owner_address, amount, amount_wei, tx_hash,
                     log_index, block_number, status, requested_by, requested_at, confirmed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'confirmed', 'chain:observed', ?8, ?8)",
                params![
                    campaign_id,
                    owner_address,
                    amount,
                    amount_wei,
                    tx_hash,
                    log_index,
                    block_number,
                    now
                ],
            )?;
            Ok(changed > 0)
        }
    }
}

/// Record the tx hash once the owning command is submitted
pub fn mark_submitted(conn: &Connection, id: i64, tx_hash: &str) -> Result<(), LedgerError> {
    conn.execute(
        "UPDATE withdrawals SET status = 'submitted', tx_hash = ?1 WHERE id = ?2",
        params![tx_hash, id],
    )?;
    Ok(())
}

/// Move a withdrawal to a terminal or parked state
pub fn set_status(conn: &Connection, id: i64, status: WithdrawalStatus) -> Result<(), LedgerError> {
    if status == WithdrawalStatus::Confirmed {
        conn.execute(
            "UPDATE withdrawals SET status = 'confirmed', confirmed_at = ?1 WHERE id = ?2",
            params![now_rfc3339(), id],
        )?;
    } else {
        conn.execute(
            "UPDATE withdrawals SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
    }
    Ok(())
}

/// List withdrawals for a campaign, newest first
pub fn list_for_campaign(conn: &Connection, campaign_id: i64) -> Result<Vec<WithdrawalRow>, LedgerError> {
    let mut stmt =
        conn.prepare("SELECT * FROM withdrawals WHERE campaign_id = ? ORDER BY id DESC")?;
    let rows = stmt.query_and_then(params![campaign_id], |row| WithdrawalRow::from_row(row))?;
    rows.collect()
}

/// Sum of confirmed withdrawals for a campaign
pub fn total_withdrawn(conn: &Connection, campaign_id: i64) -> Result<f64, LedgerError> {
    let total: f64 = conn.query_row(
        "SELECT COALESCE(SUM(amount), 0.0) FROM withdrawals
         WHERE campaign_id = ? AND status = 'confirmed'",
        params![campaign_id],
        |row| row.get(0),
    )?;
    Ok(total)
}

/// Sum of withdrawals still in flight (requested or submitted)
pub fn total_in_flight(conn: &Connection, campaign_id: i64) -> Result<f64, LedgerError> {
    let total: f64 = conn.query_row(
        "SELECT COALESCE(SUM(amount), 0.0) FROM withdrawals
         WHERE campaign_id = ? AND status IN ('requested', 'submitted')",
        params![campaign_id],
        |row| row.get(0),
    )?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::campaigns::{create_campaign, CampaignStatus, CreateCampaignInput};
    use crate::db::LedgerDb;

    fn setup() -> (LedgerDb, i64) {
        let db = LedgerDb::open_in_memory().unwrap();
        let input = CreateCampaignInput {
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
            create_onchain: false,
        };
        let id = db
            .with_conn(|conn| create_campaign(conn, &input, CampaignStatus::Active))
            .unwrap()
            .id;
        (db, id)
    }

    #[test]
    fn observed_withdrawal_promotes_submitted_row() {
        let (db, id) = setup();

        let wid = db
            .with_conn(|conn| insert_requested(conn, id, 2.0, "admin"))
            .unwrap();
        db.with_conn(|conn| mark_submitted(conn, wid, "0xw1")).unwrap();

        // ingestor later sees the same tx on-chain
        let changed = db
            .with_conn(|conn| upsert_observed(conn, id, "0xowner", 2.0, "2000", "0xw1", 0, 50))
            .unwrap();
        assert!(changed);

        let rows = db.with_conn(|conn| list_for_campaign(conn, id)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, WithdrawalStatus::Confirmed);
        assert_eq!(db.with_conn(|conn| total_withdrawn(conn, id)).unwrap(), 2.0);
    }

    #[test]
    fn observed_withdrawal_replay_is_a_noop() {
        let (db, id) = setup();

        let first = db
            .with_conn(|conn| upsert_observed(conn, id, "0xo", 1.0, "1000", "0xw2", 0, 51))
            .unwrap();
        let second = db
            .with_conn(|conn| upsert_observed(conn, id, "0xo", 1.0, "1000", "0xw2", 0, 51))
            .unwrap();

        assert!(first);
        assert!(!second);
        assert_eq!(db.with_conn(|conn| total_withdrawn(conn, id)).unwrap(), 1.0);
    }
}
