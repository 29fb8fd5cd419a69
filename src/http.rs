//! HTTP API for the reconciliation engine
//!
//! REST endpoints for an administrative front end:
//!
//! ## Campaigns
//! - `POST /campaigns` - Create a campaign (optionally on-chain)
//! - `GET  /campaigns` - List campaigns
//! - `GET  /campaigns/{id}` - Fetch one campaign
//! - `PUT  /campaigns/{id}` - Edit metadata (title, descriptions, image)
//!
//! ## Campaign operations
//! - `POST /campaigns/{id}/withdraw` - Dispatch a withdraw command
//! - `POST /campaigns/{id}/set-active` - Dispatch an active toggle
//! - `POST /campaigns/{id}/sync-donations` - Run one ingestion batch now
//! - `GET  /campaigns/{id}/stats` - Derived metrics
//! - `GET  /campaigns/{id}/donations` - Donation rows
//! - `GET  /campaigns/{id}/withdraws` - Withdrawal rows
//!
//! ## Commands and admin
//! - `GET  /commands/{id}` - Poll a dispatched command
//! - `GET  /admin/audit-logs?action=&actor=&limit=` - Audit trail
//! - `GET  /admin/reports` - Global roll-up
//! - `GET  /health`
//!
//! Writes carry the requesting identity in an `x-actor` header; a missing
//! header is recorded as `anonymous`. Authentication is a front-proxy
//! concern, not handled here.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::db::campaigns::{self, CreateCampaignInput, UpdateCampaignInput};
use crate::db::commands;
use crate::db::{audit, donations, withdrawals, LedgerDb};
use crate::dispatch::CommandDispatcher;
use crate::error::LedgerError;
use crate::ingest::EventIngestor;
use crate::stats;

/// HTTP server state
pub struct HttpServer {
    db: Arc<LedgerDb>,
    dispatcher: Arc<CommandDispatcher>,
    ingestor: Arc<EventIngestor>,
    bind_addr: SocketAddr,
}

#[derive(Serialize)]
struct CommandAccepted {
    command_id: i64,
}

impl HttpServer {
    pub fn new(
        db: Arc<LedgerDb>,
        dispatcher: Arc<CommandDispatcher>,
        ingestor: Arc<EventIngestor>,
        bind_addr: SocketAddr,
    ) -> Self {
        Self {
            db,
            dispatcher,
            ingestor,
            bind_addr,
        }
    }

    /// Run the HTTP server
    pub async fn run(self: Arc<Self>) -> Result<(), LedgerError> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "HTTP server listening");

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let server = self.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move { server.handle_request(req).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    warn!(addr = %remote_addr, error = %err, "Connection error");
                }
            });
        }
    }

    /// Route requests to handlers
    async fn handle_request(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, hyper::Error> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();
        let actor = actor_of(&req);

        debug!(method = %method, path = %path, actor = %actor, "Incoming request");

        let result = match (method, path.as_str()) {
            (Method::GET, "/health") => self.handle_health(),

            (Method::POST, "/campaigns") => self.handle_create_campaign(req, &actor).await,
            (Method::GET, "/campaigns") => self.handle_list_campaigns(),

            (Method::POST, p) if p.starts_with("/campaigns/") => {
                match split_campaign_op(p) {
                    Some((id, "withdraw")) => self.handle_withdraw(req, id, &actor).await,
                    Some((id, "set-active")) => self.handle_set_active(req, id, &actor).await,
                    Some((id, "sync-donations")) => self.handle_sync_donations(id).await,
                    Some((id, "submit")) => self.handle_submit_create(id, &actor),
                    _ => not_found(),
                }
            }
            (Method::GET, p) if p.starts_with("/campaigns/") => {
                match split_campaign_op(p) {
                    Some((id, "stats")) => self.handle_stats(id),
                    Some((id, "donations")) => self.handle_donations(id),
                    Some((id, "withdraws")) => self.handle_withdraws(id),
                    None => match parse_id(p.strip_prefix("/campaigns/").unwrap_or("")) {
                        Some(id) => self.handle_get_campaign(id),
                        None => not_found(),
                    },
                    _ => not_found(),
                }
            }
            (Method::PUT, p) if p.starts_with("/campaigns/") => {
                match parse_id(p.strip_prefix("/campaigns/").unwrap_or("")) {
                    Some(id) => self.handle_update_campaign(req, id, &actor).await,
                    None => not_found(),
                }
            }

            (Method::GET, p) if p.starts_with("/commands/") => {
                match parse_id(p.strip_prefix("/commands/").unwrap_or("")) {
                    Some(id) => self.handle_get_command(id),
                    None => not_found(),
                }
            }

            (Method::GET, "/admin/audit-logs") => self.handle_audit_logs(req.uri().query()),
            (Method::GET, "/admin/reports") => self.handle_admin_report(),

            _ => not_found(),
        };

        match result {
            Ok(response) => Ok(response),
            Err(e) => Ok(error_response(&e)),
        }
    }

    fn handle_health(&self) -> Result<Response<Full<Bytes>>, LedgerError> {
        let campaign_count = self.db.with_conn(|conn| {
            Ok(campaigns::list_campaigns(conn)?.len())
        })?;
        json_response(
            StatusCode::OK,
            &serde_json::json!({ "status": "ok", "campaigns": campaign_count }),
        )
    }

    async fn handle_create_campaign(
        &self,
        req: Request<Incoming>,
        actor: &str,
    ) -> Result<Response<Full<Bytes>>, LedgerError> {
        let input: CreateCampaignInput = read_json(req).await?;
        let created = self.dispatcher.create_campaign(&input, actor)?;
        json_response(StatusCode::CREATED, &created)
    }

    fn handle_list_campaigns(&self) -> Result<Response<Full<Bytes>>, LedgerError> {
        let rows = self.db.with_conn(campaigns::list_campaigns)?;
        json_response(StatusCode::OK, &rows)
    }

    fn handle_get_campaign(&self, id: i64) -> Result<Response<Full<Bytes>>, LedgerError> {
        let row = self
            .db
            .with_conn(|conn| campaigns::get_campaign(conn, id))?
            .ok_or_else(|| LedgerError::NotFound(format!("campaign {}", id)))?;
        json_response(StatusCode::OK, &row)
    }

    /// Metadata-only edit; on-chain linkage and status are untouchable here
    async fn handle_update_campaign(
        &self,
        req: Request<Incoming>,
        id: i64,
        actor: &str,
    ) -> Result<Response<Full<Bytes>>, LedgerError> {
        let input: UpdateCampaignInput = read_json(req).await?;
        let actor = actor.to_string();
        let row = self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let row = campaigns::update_metadata(&tx, id, &input)?;
            audit::append(&tx, "campaign_updated", &actor, Some(id), None, "metadata edit")?;
            tx.commit()?;
            Ok(row)
        })?;
        json_response(StatusCode::OK, &row)
    }

    async fn handle_withdraw(
        &self,
        req: Request<Incoming>,
        id: i64,
        actor: &str,
    ) -> Result<Response<Full<Bytes>>, LedgerError> {
        #[derive(serde::Deserialize)]
        struct Body {
            amount: f64,
        }
        let body: Body = read_json(req).await?;
        let command_id = self.dispatcher.submit_withdraw(id, body.amount, actor)?;
        json_response(StatusCode::ACCEPTED, &CommandAccepted { command_id })
    }

    async fn handle_set_active(
        &self,
        req: Request<Incoming>,
        id: i64,
        actor: &str,
    ) -> Result<Response<Full<Bytes>>, LedgerError> {
        #[derive(serde::Deserialize)]
        struct Body {
            active: bool,
        }
        let body: Body = read_json(req).await?;
        let command_id = self.dispatcher.submit_set_active(id, body.active, actor)?;
        json_response(StatusCode::ACCEPTED, &CommandAccepted { command_id })
    }

    /// Dispatch the on-chain create for a draft campaign
    fn handle_submit_create(&self, id: i64, actor: &str) -> Result<Response<Full<Bytes>>, LedgerError> {
        let command_id = self.dispatcher.submit_create(id, actor)?;
        json_response(StatusCode::ACCEPTED, &CommandAccepted { command_id })
    }

    async fn handle_sync_donations(&self, id: i64) -> Result<Response<Full<Bytes>>, LedgerError> {
        // the campaign must exist; the batch itself is chain-wide
        self.db
            .with_conn(|conn| campaigns::get_campaign(conn, id))?
            .ok_or_else(|| LedgerError::NotFound(format!("campaign {}", id)))?;

        let result = self.ingestor.ingest_once().await?;
        json_response(StatusCode::OK, &result)
    }

    fn handle_stats(&self, id: i64) -> Result<Response<Full<Bytes>>, LedgerError> {
        let stats = self.db.with_conn(|conn| stats::campaign_stats(conn, id))?;
        json_response(StatusCode::OK, &stats)
    }

    fn handle_donations(&self, id: i64) -> Result<Response<Full<Bytes>>, LedgerError> {
        let rows = self.db.with_conn(|conn| donations::list_for_campaign(conn, id))?;
        json_response(StatusCode::OK, &rows)
    }

    fn handle_withdraws(&self, id: i64) -> Result<Response<Full<Bytes>>, LedgerError> {
        let rows = self.db.with_conn(|conn| withdrawals::list_for_campaign(conn, id))?;
        json_response(StatusCode::OK, &rows)
    }

    fn handle_get_command(&self, id: i64) -> Result<Response<Full<Bytes>>, LedgerError> {
        let row = self
            .db
            .with_conn(|conn| commands::get_command(conn, id))?
            .ok_or_else(|| LedgerError::NotFound(format!("command {}", id)))?;
        json_response(StatusCode::OK, &row)
    }

    fn handle_audit_logs(&self, query: Option<&str>) -> Result<Response<Full<Bytes>>, LedgerError> {
        let query: audit::AuditQuery = serde_urlencoded::from_str(query.unwrap_or(""))
            .map_err(|e| LedgerError::Parse(format!("query string: {}", e)))?;
        let rows = self.db.with_conn(|conn| audit::list(conn, &query))?;
        json_response(StatusCode::OK, &rows)
    }

    fn handle_admin_report(&self) -> Result<Response<Full<Bytes>>, LedgerError> {
        let report = self.db.with_conn(stats::admin_report)?;
        json_response(StatusCode::OK, &report)
    }
}

/// Requesting identity from the `x-actor` header
fn actor_of(req: &Request<Incoming>) -> String {
    req.headers()
        .get("x-actor")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .unwrap_or("anonymous")
        .to_string()
}

/// `/campaigns/{id}/{op}` -> (id, op)
fn split_campaign_op(path: &str) -> Option<(i64, &str)> {
    let rest = path.strip_prefix("/campaigns/")?;
    let (id, op) = rest.split_once('/')?;
    Some((parse_id(id)?, op))
}

fn parse_id(s: &str) -> Option<i64> {
    s.parse().ok()
}

async fn read_json<T: serde::de::DeserializeOwned>(req: Request<Incoming>) -> Result<T, LedgerError> {
    let body = req
        .collect()
        .await
        .map_err(|e| LedgerError::Internal(format!("failed to read body: {}", e)))?;
    serde_json::from_slice(&body.to_bytes())
        .map_err(|e| LedgerError::Parse(format!("request body: {}", e)))
}

fn json_response<T: Serialize>(
    status: StatusCode,
    value: &T,
) -> Result<Response<Full<Bytes>>, LedgerError> {
    let body = serde_json::to_vec(value)?;
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .map_err(|e| LedgerError::Internal(format!("response build: {}", e)))
}

fn not_found() -> Result<Response<Full<Bytes>>, LedgerError> {
    Err(LedgerError::NotFound("no such route".into()))
}

fn error_response(error: &LedgerError) -> Response<Full<Bytes>> {
    let status = match error {
        LedgerError::InvalidCommand(_) => StatusCode::UNPROCESSABLE_ENTITY,
        LedgerError::Parse(_) | LedgerError::Json(_) => StatusCode::BAD_REQUEST,
        LedgerError::CommandInFlight { .. } => StatusCode::CONFLICT,
        LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
        LedgerError::TransientChain(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        warn!(error = %error, "Request failed");
    }
    let body = serde_json::json!({ "error": error.to_string() }).to_string();
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn campaign_op_paths_parse() {
        assert_eq!(split_campaign_op("/campaigns/3/withdraw"), Some((3, "withdraw")));
        assert_eq!(split_campaign_op("/campaigns/12/sync-donations"), Some((12, "sync-donations")));
        assert_eq!(split_campaign_op("/campaigns/3"), None);
        assert_eq!(split_campaign_op("/campaigns/x/stats"), None);
    }

    #[test]
    fn error_mapping_matches_contract() {
        let cases = [
            (LedgerError::InvalidCommand("x".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (
                LedgerError::CommandInFlight { campaign_id: 1, kind: "withdraw".into() },
                StatusCode::CONFLICT,
            ),
            (LedgerError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (LedgerError::TransientChain("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (LedgerError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, status) in cases {
            assert_eq!(error_response(&error).status(), status);
        }
    }
}
