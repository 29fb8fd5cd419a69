//! Command envelope
//!
//! A command is a durable record of an intended on-chain write, tracked
//! through submission and confirmation. At most one pending-or-submitted
//! command may exist per (campaign, kind); the partial unique index
//! enforces this even across multiple engine instances.

use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use crate::db::now_rfc3339;
use crate::error::LedgerError;

/// Kind of on-chain write a command performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    CreateCampaign,
    Withdraw,
    SetActive,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::CreateCampaign => "create_campaign",
            CommandKind::Withdraw => "withdraw",
            CommandKind::SetActive => "set_active",
        }
    }

    pub fn parse(s: &str) -> Result<Self, LedgerError> {
        match s {
            "create_campaign" => Ok(CommandKind::CreateCampaign),
            "withdraw" => Ok(CommandKind::Withdraw),
            "set_active" => Ok(CommandKind::SetActive),
            other => Err(LedgerError::Parse(format!("unknown command kind: {}", other))),
        }
    }
}

/// Command lifecycle status.
///
/// `Unknown` means the wait window expired without a receipt. It is
/// deliberately distinct from `Failed`: the transaction may still be mined,
/// so the sweep loop keeps re-polling until a receipt settles it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Submitted,
    Confirmed,
    Failed,
    Unknown,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Submitted => "submitted",
            CommandStatus::Confirmed => "confirmed",
            CommandStatus::Failed => "failed",
            CommandStatus::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Result<Self, LedgerError> {
        match s {
            "pending" => Ok(CommandStatus::Pending),
            "submitted" => Ok(CommandStatus::Submitted),
            "confirmed" => Ok(CommandStatus::Confirmed),
            "failed" => Ok(CommandStatus::Failed),
            "unknown" => Ok(CommandStatus::Unknown),
            other => Err(LedgerError::Parse(format!("unknown command status: {}", other))),
        }
    }
}

/// Typed command payloads, stored as JSON in the `payload` column
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCampaignPayload {
    pub title: String,
    pub description: String,
    pub goal_eth: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawPayload {
    pub amount: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetActivePayload {
    pub active: bool,
}

/// Command row from database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRow {
    pub id: i64,
    pub campaign_id: i64,
    pub kind: CommandKind,
    pub payload: serde_json::Value,
    pub status: CommandStatus,
    pub tx_hash: Option<String>,
    pub withdrawal_id: Option<i64>,
    pub requested_by: String,
    pub created_at: String,
    pub submitted_at: Option<String>,
    pub resolved_at: Option<String>,
    pub last_error: Option<String>,
}

impl CommandRow {
    fn from_row(row: &Row) -> Result<Self, LedgerError> {
        let kind: String = row.get("kind")?;
        let status: String = row.get("status")?;
        let payload: String = row.get("payload")?;
        Ok(Self {
            id: row.get("id")?,
            campaign_id: row.get("campaign_id")?,
            kind: CommandKind::parse(&kind)?,
            payload: serde_json::from_str(&payload)?,
            status: CommandStatus::parse(&status)?,
            tx_hash: row.get("tx_hash")?,
            withdrawal_id: row.get("withdrawal_id")?,
            requested_by: row.get("requested_by")?,
            created_at: row.get("created_at")?,
            submitted_at: row.get("submitted_at")?,
            resolved_at: row.get("resolved_at")?,
            last_error: row.get("last_error")?,
        })
    }

    pub fn withdraw_payload(&self) -> Result<WithdrawPayload, LedgerError> {
        serde_json::from_value(self.payload.clone()).map_err(Into::into)
    }

    pub fn create_payload(&self) -> Result<CreateCampaignPayload, LedgerError> {
        serde_json::from_value(self.payload.clone()).map_err(Into::into)
    }

    pub fn set_active_payload(&self) -> Result<SetActivePayload, LedgerError> {
        serde_json::from_value(self.payload.clone()).map_err(Into::into)
    }
}

/// Insert a pending command. A unique-constraint hit on the in-flight index
/// is surfaced as `CommandInFlight`.
pub fn insert_pending(
    conn: &Connection,
    campaign_id: i64,
    kind: CommandKind,
    payload: &serde_json::Value,
    withdrawal_id: Option<i64>,
    requested_by: &str,
) -> Result<i64, LedgerError> {
    let result = conn.execute(
        "INSERT INTO commands (campaign_id, kind, payload, status, withdrawal_id, requested_by, created_at)
         VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6)",
        params![
            campaign_id,
            kind.as_str(),
            serde_json::to_string(payload)?,
            withdrawal_id,
            requested_by,
            now_rfc3339(),
        ],
    );

    match result {
        Ok(_) => Ok(conn.last_insert_rowid()),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(LedgerError::CommandInFlight {
                campaign_id,
                kind: kind.as_str().to_string(),
            })
        }
        Err(e) => Err(e.into()),
    }
}

/// Get command by id
pub fn get_command(conn: &Connection, id: i64) -> Result<Option<CommandRow>, LedgerError> {
    let mut stmt = conn.prepare("SELECT * FROM commands WHERE id = ?")?;
    let mut rows = stmt.query(params![id])?;
    match rows.next()? {
        Some(row) => Ok(Some(CommandRow::from_row(row)?)),
        None => Ok(None),
    }
}

/// Claim up to `limit` pending commands for submission by taking a lease.
/// A crashed worker's claims become reclaimable once the lease expires.
pub fn claim_pending(
    conn: &Connection,
    limit: usize,
    lease_secs: u64,
) -> Result<Vec<CommandRow>, LedgerError> {
    let now = chrono::Utc::now();
    let lease_until = (now + chrono::Duration::seconds(lease_secs as i64)).to_rfc3339();
    let now = now.to_rfc3339();

    let mut stmt = conn.prepare(
        "SELECT id FROM commands
         WHERE status = 'pending' AND (lease_until IS NULL OR lease_until < ?1)
         ORDER BY id LIMIT ?2",
    )?;
    let ids: Vec<i64> = stmt
        .query_map(params![now, limit as i64], |row| row.get(0))?
        .collect::<Result<_, _>>()?;

    let mut claimed = Vec::new();
    for id in ids {
        let changed = conn.execute(
            "UPDATE commands SET lease_until = ?1
             WHERE id = ?2 AND status = 'pending' AND (lease_until IS NULL OR lease_until < ?3)",
            params![lease_until, id, now],
        )?;
        if changed == 1 {
            if let Some(cmd) = get_command(conn, id)? {
                claimed.push(cmd);
            }
        }
    }
    Ok(claimed)
}

/// Release a claim after a transient submission failure
pub fn release_claim(conn: &Connection, id: i64, error: &str) -> Result<(), LedgerError> {
    conn.execute(
        "UPDATE commands SET lease_until = NULL, last_error = ?1 WHERE id = ?2 AND status = 'pending'",
        params![error, id],
    )?;
    Ok(())
}

/// Transition pending -> submitted with the resulting tx hash
pub fn mark_submitted(conn: &Connection, id: i64, tx_hash: &str) -> Result<(), LedgerError> {
    let changed = conn.execute(
        "UPDATE commands SET status = 'submitted', tx_hash = ?1, submitted_at = ?2, lease_until = NULL
         WHERE id = ?3 AND status = 'pending'",
        params![tx_hash, now_rfc3339(), id],
    )?;
    if changed == 0 {
        return Err(LedgerError::Internal(format!("command {} not pending at submit", id)));
    }
    Ok(())
}

/// Settle a command (confirmed or failed), or park it as unknown
pub fn resolve(
    conn: &Connection,
    id: i64,
    status: CommandStatus,
    error: Option<&str>,
) -> Result<(), LedgerError> {
    conn.execute(
        "UPDATE commands SET status = ?1, resolved_at = ?2, last_error = ?3 WHERE id = ?4",
        params![status.as_str(), now_rfc3339(), error, id],
    )?;
    Ok(())
}

/// All submitted commands (for the confirmation poll loop)
pub fn list_submitted(conn: &Connection) -> Result<Vec<CommandRow>, LedgerError> {
    list_by_status(conn, CommandStatus::Submitted)
}

/// All unknown commands (for the sweep loop)
pub fn list_unknown(conn: &Connection) -> Result<Vec<CommandRow>, LedgerError> {
    list_by_status(conn, CommandStatus::Unknown)
}

fn list_by_status(conn: &Connection, status: CommandStatus) -> Result<Vec<CommandRow>, LedgerError> {
    let mut stmt = conn.prepare("SELECT * FROM commands WHERE status = ? ORDER BY id")?;
    let rows = stmt.query_and_then(params![status.as_str()], |row| CommandRow::from_row(row))?;
    rows.collect()
}
