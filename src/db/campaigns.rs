//! Campaign rows and CRUD operations

use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use crate::db::now_rfc3339;
use crate::error::LedgerError;

/// Campaign lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    /// Ledger row exists, no on-chain counterpart requested
    Draft,
    /// A create command is in flight
    PendingOnchain,
    Active,
    Closed,
    /// The create command reverted on-chain
    FailedOnchain,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::PendingOnchain => "pending_onchain",
            CampaignStatus::Active => "active",
            CampaignStatus::Closed => "closed",
            CampaignStatus::FailedOnchain => "failed_onchain",
        }
    }

    pub fn parse(s: &str) -> Result<Self, LedgerError> {
        match s {
            "draft" => Ok(CampaignStatus::Draft),
            "pending_onchain" => Ok(CampaignStatus::PendingOnchain),
            "active" => Ok(CampaignStatus::Active),
            "closed" => Ok(CampaignStatus::Closed),
            "failed_onchain" => Ok(CampaignStatus::FailedOnchain),
            other => Err(LedgerError::Parse(format!("unknown campaign status: {}", other))),
        }
    }
}

/// Campaign row from database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignRow {
    pub id: i64,
    pub onchain_id: Option<i64>,
    pub title: String,
    pub short_desc: Option<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub beneficiary_address: Option<String>,
    pub target_amount: f64,
    pub currency: String,
    pub deadline: Option<String>,
    pub status: CampaignStatus,
    pub auto_disburse: bool,
    pub disburse_threshold: f64,
    pub contract_tx_hash: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl CampaignRow {
    fn from_row(row: &Row) -> Result<Self, LedgerError> {
        let status: String = row.get("status")?;
        Ok(Self {
            id: row.get("id")?,
            onchain_id: row.get("onchain_id")?,
            title: row.get("title")?,
            short_desc: row.get("short_desc")?,
            description: row.get("description")?,
            image_url: row.get("image_url")?,
            beneficiary_address: row.get("beneficiary_address")?,
            target_amount: row.get("target_amount")?,
            currency: row.get("currency")?,
            deadline: row.get("deadline")?,
            status: CampaignStatus::parse(&status)?,
            auto_disburse: row.get("auto_disburse")?,
            disburse_threshold: row.get("disburse_threshold")?,
            contract_tx_hash: row.get("contract_tx_hash")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Input for creating a campaign
#[derive(Debug, Clone, Deserialize)]
pub struct CreateCampaignInput {
    pub title: String,
    #[serde(default)]
    pub short_desc: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub beneficiary_address: Option<String>,
    pub target_amount: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub deadline: Option<String>,
    #[serde(default)]
    pub auto_disburse: bool,
    #[serde(default = "default_threshold")]
    pub disburse_threshold: f64,
    /// When true, a create command is dispatched alongside the ledger row
    #[serde(default)]
    pub create_onchain: bool,
}

fn default_currency() -> String {
    "ETH".to_string()
}

fn default_threshold() -> f64 {
    0.8
}

/// Metadata-only update. Never touches on-chain linkage or status.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateCampaignInput {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub short_desc: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
}

/// Insert a new campaign, returning its row
pub fn create_campaign(
    conn: &Connection,
    input: &CreateCampaignInput,
    status: CampaignStatus,
) -> Result<CampaignRow, LedgerError> {
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO campaigns
            (title, short_desc, description, image_url, beneficiary_address,
             target_amount, currency, deadline, status, auto_disburse,
             disburse_threshold, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
        params![
            input.title,
            input.short_desc,
            input.description,
            input.image_url,
            input.beneficiary_address,
            input.target_amount,
            input.currency,
            input.deadline,
            status.as_str(),
            input.auto_disburse,
            input.disburse_threshold,
            now,
        ],
    )?;

    let id = conn.last_insert_rowid();
    get_campaign(conn, id)?.ok_or_else(|| LedgerError::Internal("campaign vanished after insert".into()))
}

/// Get campaign by ledger id
pub fn get_campaign(conn: &Connection, id: i64) -> Result<Option<CampaignRow>, LedgerError> {
    let mut stmt = conn.prepare("SELECT * FROM campaigns WHERE id = ?")?;
    let mut rows = stmt.query(params![id])?;

    match rows.next()? {
        Some(row) => Ok(Some(CampaignRow::from_row(row)?)),
        None => Ok(None),
    }
}

/// Get campaign by its on-chain id
pub fn get_campaign_by_onchain_id(
    conn: &Connection,
    onchain_id: i64,
) -> Result<Option<CampaignRow>, LedgerError> {
    let mut stmt = conn.prepare("SELECT * FROM campaigns WHERE onchain_id = ?")?;
    let mut rows = stmt.query(params![onchain_id])?;

    match rows.next()? {
        Some(row) => Ok(Some(CampaignRow::from_row(row)?)),
        None => Ok(None),
    }
}

/// List campaigns, newest first
pub fn list_campaigns(conn: &Connection) -> Result<Vec<CampaignRow>, LedgerError> {
    let mut stmt = conn.prepare("SELECT * FROM campaigns ORDER BY id DESC")?;
    let rows = stmt.query_and_then([], |row| CampaignRow::from_row(row))?;
    rows.collect()
}

/// Apply a metadata-only edit, returning the updated row
pub fn update_metadata(
    conn: &Connection,
    id: i64,
    input: &UpdateCampaignInput,
) -> Result<CampaignRow, LedgerError> {
    let existing = get_campaign(conn, id)?
        .ok_or_else(|| LedgerError::NotFound(format!("campaign {}", id)))?;

    conn.execute(
        "UPDATE campaigns SET title = ?1, short_desc = ?2, description = ?3,
            image_url = ?4, updated_at = ?5 WHERE id = ?6",
        params![
            input.title.as_deref().unwrap_or(&existing.title),
            input.short_desc.as_deref().or(existing.short_desc.as_deref()),
            input.description.as_deref().or(existing.description.as_deref()),
            input.image_url.as_deref().or(existing.image_url.as_deref()),
            now_rfc3339(),
            id,
        ],
    )?;

    get_campaign(conn, id)?.ok_or_else(|| LedgerError::NotFound(format!("campaign {}", id)))
}

/// Set campaign status
pub fn set_status(conn: &Connection, id: i64, status: CampaignStatus) -> Result<(), LedgerError> {
    let changed = conn.execute(
        "UPDATE campaigns SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![status.as_str(), now_rfc3339(), id],
    )?;
    if changed == 0 {
        return Err(LedgerError::NotFound(format!("campaign {}", id)));
    }
    Ok(())
}

/// Record the confirmed on-chain identity of a campaign
pub fn set_onchain_info(
    conn: &Connection,
    id: i64,
    onchain_id: i64,
    tx_hash: &str,
    status: CampaignStatus,
) -> Result<(), LedgerError> {
    let changed = conn.execute(
        "UPDATE campaigns SET onchain_id = ?1, contract_tx_hash = ?2,
            status = ?3, updated_at = ?4 WHERE id = ?5",
        params![onchain_id, tx_hash, status.as_str(), now_rfc3339(), id],
    )?;
    if changed == 0 {
        return Err(LedgerError::NotFound(format!("campaign {}", id)));
    }
    Ok(())
}

/// Campaigns eligible for auto-disburse evaluation
pub fn list_auto_disburse_candidates(
    conn: &Connection,
    ids: &[i64],
) -> Result<Vec<CampaignRow>, LedgerError> {
    let mut out = Vec::new();
    for id in ids {
        if let Some(c) = get_campaign(conn, *id)? {
            if c.auto_disburse && c.onchain_id.is_some() && c.status == CampaignStatus::Active {
                out.push(c);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::LedgerDb;

    fn sample_input() -> CreateCampaignInput {
        CreateCampaignInput {
            title: "Flood Relief Central Region".into(),
            short_desc: None,
            description: Some("Support families affected by flooding".into()),
            image_url: None,
            beneficiary_address: Some("0xabc".into()),
            target_amount: 10.0,
            currency: "ETH".into(),
            deadline: None,
            auto_disburse: false,
            disburse_threshold: 0.8,
            create_onchain: false,
        }
    }

    #[test]
    fn create_and_fetch_campaign() {
        let db = LedgerDb::open_in_memory().unwrap();
        let row = db
            .with_conn(|conn| create_campaign(conn, &sample_input(), CampaignStatus::Draft))
            .unwrap();

        assert_eq!(row.status, CampaignStatus::Draft);
        assert!(row.onchain_id.is_none());

        let fetched = db.with_conn(|conn| get_campaign(conn, row.id)).unwrap().unwrap();
        assert_eq!(fetched.title, "Flood Relief Central Region");
    }

    #[test]
    fn onchain_info_updates_status_and_linkage() {
        let db = LedgerDb::open_in_memory().unwrap();
        let row = db
            .with_conn(|conn| create_campaign(conn, &sample_input(), CampaignStatus::PendingOnchain))
            .unwrap();

        db.with_conn(|conn| set_onchain_info(conn, row.id, 7, "0xdead", CampaignStatus::Active))
            .unwrap();

        let fetched = db
            .with_conn(|conn| get_campaign_by_onchain_id(conn, 7))
            .unwrap()
            .unwrap();
        assert_eq!(fetched.id, row.id);
        assert_eq!(fetched.status, CampaignStatus::Active);
        assert_eq!(fetched.contract_tx_hash.as_deref(), Some("0xdead"));
    }

    #[test]
    fn metadata_update_preserves_onchain_fields() {
        let db = LedgerDb::open_in_memory().unwrap();
        let row = db
            .with_conn(|conn| create_campaign(conn, &sample_input(), CampaignStatus::Draft))
            .unwrap();
        db.with_conn(|conn| set_onchain_info(conn, row.id, 3, "0x1", CampaignStatus::Active))
            .unwrap();

        let updated = db
            .with_conn(|conn| {
                update_metadata(
                    conn,
                    row.id,
                    &UpdateCampaignInput {
                        title: Some("New title".into()),
                        ..Default::default()
                    },
                )
            })
            .unwrap();

        assert_eq!(updated.title, "New title");
        assert_eq!(updated.onchain_id, Some(3));
        assert_eq!(updated.status, CampaignStatus::Active);
    }
}
