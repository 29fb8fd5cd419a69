//! Append-only audit log
//!
//! One entry per command state transition plus one per manual
//! administrative action. No update or delete is ever exposed.

use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use crate::db::now_rfc3339;
use crate::error::LedgerError;

/// Audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub action: String,
    pub actor: String,
    pub campaign_id: Option<i64>,
    pub tx_hash: Option<String>,
    pub details: String,
    pub timestamp: String,
}

impl AuditEntry {
    fn from_row(row: &Row) -> Result<Self, LedgerError> {
        Ok(Self {
            id: row.get("id")?,
            action: row.get("action")?,
            actor: row.get("actor")?,
            campaign_id: row.get("campaign_id")?,
            tx_hash: row.get("tx_hash")?,
            details: row.get("details")?,
            timestamp: row.get("timestamp")?,
        })
    }
}

/// Append an entry
pub fn append(
    conn: &Connection,
    action: &str,
    actor: &str,
    campaign_id: Option<i64>,
    tx_hash: Option<&str>,
    details: &str,
) -> Result<(), LedgerError> {
    conn.execute(
        "INSERT INTO audit_log (action, actor, campaign_id, tx_hash, details, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![action, actor, campaign_id, tx_hash, details, now_rfc3339()],
    )?;
    Ok(())
}

/// Query filters for listing audit entries
#[derive(Debug, Clone, Deserialize)]
pub struct AuditQuery {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

impl Default for AuditQuery {
    fn default() -> Self {
        Self {
            action: None,
            actor: None,
            limit: default_limit(),
        }
    }
}

fn default_limit() -> u32 {
    100
}

/// List entries, newest first
pub fn list(conn: &Connection, query: &AuditQuery) -> Result<Vec<AuditEntry>, LedgerError> {
    let mut sql = String::from("SELECT * FROM audit_log");
    let mut clauses: Vec<&str> = Vec::new();
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(action) = &query.action {
        clauses.push("action = ?");
        params.push(Box::new(action.clone()));
    }
    if let Some(actor) = &query.actor {
        clauses.push("actor = ?");
        params.push(Box::new(actor.clone()));
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY id DESC LIMIT ?");
    params.push(Box::new(query.limit));

    let mut stmt = conn.prepare(&sql)?;
    let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let rows = stmt.query_and_then(param_refs.as_slice(), |row| AuditEntry::from_row(row))?;
    rows.collect()
}
