//! Ethereum JSON-RPC gateway
//!
//! Implements [`ChainGateway`] over a plain JSON-RPC HTTP endpoint with
//! reqwest. Contract events are matched by topic0 against the event
//! signatures of the donation contract and decoded by hand: topic layout is
//! `(campaignId indexed, address indexed)` with the uint256 amount in the
//! data word.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::{event_topic, ChainEvent, ChainGateway, Receipt};
use crate::error::LedgerError;

const EVENT_CAMPAIGN_CREATED: &str = "CampaignCreated(uint256,string,uint256)";
const EVENT_DONATION_RECEIVED: &str = "DonationReceived(uint256,address,uint256)";
const EVENT_FUNDS_WITHDRAWN: &str = "FundsWithdrawn(uint256,address,uint256)";

/// JSON-RPC request
#[derive(Debug, Serialize)]
struct JsonRpcRequest {
    jsonrpc: &'static str,
    id: u64,
    method: &'static str,
    params: Vec<serde_json::Value>,
}

/// JSON-RPC response with an untyped result
#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[allow(dead_code)]
    jsonrpc: Option<String>,
    #[allow(dead_code)]
    id: Option<u64>,
    result: Option<serde_json::Value>,
    error: Option<JsonRpcError>,
}

/// JSON-RPC error object
#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// Raw log entry from eth_getLogs / receipt logs
#[derive(Debug, Clone, Deserialize)]
struct RawLog {
    topics: Vec<String>,
    data: String,
    #[serde(rename = "transactionHash")]
    transaction_hash: String,
    #[serde(rename = "logIndex")]
    log_index: String,
    #[serde(rename = "blockNumber")]
    block_number: String,
    #[serde(default)]
    removed: bool,
}

/// Raw transaction receipt
#[derive(Debug, Deserialize)]
struct RawReceipt {
    status: String,
    #[serde(rename = "blockNumber")]
    block_number: String,
    #[serde(default)]
    logs: Vec<RawLog>,
}

/// Gateway over an Ethereum-compatible JSON-RPC endpoint
pub struct EthRpcGateway {
    client: Client,
    rpc_url: String,
    contract_address: String,
    topic_campaign_created: String,
    topic_donation: String,
    topic_withdrawal: String,
}

impl EthRpcGateway {
    pub fn new(rpc_url: &str, contract_address: &str) -> Result<Self, LedgerError> {
        let rpc_url = url::Url::parse(rpc_url)
            .map_err(|e| LedgerError::Config(format!("rpc_url {:?}: {}", rpc_url, e)))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| LedgerError::Config(format!("reqwest client: {}", e)))?;

        Ok(Self {
            client,
            rpc_url: rpc_url.to_string(),
            contract_address: contract_address.to_lowercase(),
            topic_campaign_created: event_topic(EVENT_CAMPAIGN_CREATED),
            topic_donation: event_topic(EVENT_DONATION_RECEIVED),
            topic_withdrawal: event_topic(EVENT_FUNDS_WITHDRAWN),
        })
    }

    async fn call(&self, method: &'static str, params: Vec<serde_json::Value>) -> Result<serde_json::Value, LedgerError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method,
            params,
        };

        let response = self
            .client
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| LedgerError::TransientChain(format!("{}: {}", method, e)))?;

        let body: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| LedgerError::TransientChain(format!("{} response: {}", method, e)))?;

        if let Some(err) = body.error {
            return Err(LedgerError::TransientChain(format!(
                "{} error {}: {}",
                method, err.code, err.message
            )));
        }

        body.result
            .ok_or_else(|| LedgerError::Parse(format!("{}: missing result", method)))
    }

    fn decode_log(&self, log: &RawLog) -> Result<Option<ChainEvent>, LedgerError> {
        if log.removed || log.topics.is_empty() {
            return Ok(None);
        }

        let topic0 = log.topics[0].to_lowercase();
        let tx_hash = log.transaction_hash.clone();
        let log_index = parse_hex_u64(&log.log_index)? as i64;
        let block_number = parse_hex_u64(&log.block_number)?;

        let event = if topic0 == self.topic_campaign_created {
            ChainEvent::CampaignCreated {
                onchain_campaign_id: topic_u64(&log.topics, 1)? as i64,
                tx_hash,
                log_index,
                block_number,
            }
        } else if topic0 == self.topic_donation {
            ChainEvent::Donation {
                onchain_campaign_id: topic_u64(&log.topics, 1)? as i64,
                donor: topic_address(&log.topics, 2)?,
                amount_wei: parse_hex_u256(&log.data)?,
                tx_hash,
                log_index,
                block_number,
            }
        } else if topic0 == self.topic_withdrawal {
            ChainEvent::Withdrawal {
                onchain_campaign_id: topic_u64(&log.topics, 1)? as i64,
                owner: topic_address(&log.topics, 2)?,
                amount_wei: parse_hex_u256(&log.data)?,
                tx_hash,
                log_index,
                block_number,
            }
        } else {
            debug!(topic0 = %topic0, "Ignoring unrecognized contract event");
            return Ok(None);
        };

        Ok(Some(event))
    }
}

#[async_trait]
impl ChainGateway for EthRpcGateway {
    async fn get_block_number(&self) -> Result<u64, LedgerError> {
        let result = self.call("eth_blockNumber", vec![]).await?;
        let hex = result
            .as_str()
            .ok_or_else(|| LedgerError::Parse("eth_blockNumber: non-string result".into()))?;
        parse_hex_u64(hex)
    }

    async fn get_block_hash(&self, height: u64) -> Result<Option<String>, LedgerError> {
        let result = self
            .call(
                "eth_getBlockByNumber",
                vec![
                    serde_json::json!(format!("0x{:x}", height)),
                    serde_json::json!(false),
                ],
            )
            .await?;

        if result.is_null() {
            return Ok(None);
        }
        Ok(result
            .get("hash")
            .and_then(|h| h.as_str())
            .map(|h| h.to_lowercase()))
    }

    async fn get_events(&self, from_block: u64, to_block: u64) -> Result<Vec<ChainEvent>, LedgerError> {
        let filter = serde_json::json!({
            "address": self.contract_address,
            "fromBlock": format!("0x{:x}", from_block),
            "toBlock": format!("0x{:x}", to_block),
        });

        let result = self.call("eth_getLogs", vec![filter]).await?;
        let logs: Vec<RawLog> = serde_json::from_value(result)?;

        let mut events = Vec::new();
        for log in &logs {
            match self.decode_log(log) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(e) => {
                    warn!(tx_hash = %log.transaction_hash, error = %e, "Skipping undecodable log");
                }
            }
        }
        Ok(events)
    }

    async fn send_transaction(&self, signed_payload: &[u8]) -> Result<String, LedgerError> {
        let raw = format!("0x{}", hex::encode(signed_payload));
        let result = self
            .call("eth_sendRawTransaction", vec![serde_json::json!(raw)])
            .await?;
        result
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| LedgerError::Parse("eth_sendRawTransaction: non-string result".into()))
    }

    async fn get_receipt(&self, tx_hash: &str) -> Result<Option<Receipt>, LedgerError> {
        let result = self
            .call("eth_getTransactionReceipt", vec![serde_json::json!(tx_hash)])
            .await?;

        if result.is_null() {
            return Ok(None);
        }

        let raw: RawReceipt = serde_json::from_value(result)?;
        let success = parse_hex_u64(&raw.status)? == 1;

        // Recover the on-chain campaign id from a CampaignCreated log
        let mut onchain_campaign_id = None;
        for log in &raw.logs {
            if let Ok(Some(ChainEvent::CampaignCreated {
                onchain_campaign_id: id, ..
            })) = self.decode_log(log)
            {
                onchain_campaign_id = Some(id);
                break;
            }
        }

        Ok(Some(Receipt {
            tx_hash: tx_hash.to_string(),
            success,
            block_number: parse_hex_u64(&raw.block_number)?,
            revert_reason: if success { None } else { Some("execution reverted".into()) },
            onchain_campaign_id,
        }))
    }
}

fn parse_hex_u64(s: &str) -> Result<u64, LedgerError> {
    let trimmed = s.trim_start_matches("0x");
    u64::from_str_radix(trimmed, 16).map_err(|e| LedgerError::Parse(format!("hex u64 {:?}: {}", s, e)))
}

fn parse_hex_u256(s: &str) -> Result<u128, LedgerError> {
    let trimmed = s.trim_start_matches("0x");
    // amounts fit comfortably in u128; a 32-byte word with a larger value
    // would be a corrupt log for this contract
    let significant = trimmed.trim_start_matches('0');
    if significant.len() > 32 {
        return Err(LedgerError::Parse(format!("uint256 overflows u128: {:?}", s)));
    }
    if significant.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(significant, 16)
        .map_err(|e| LedgerError::Parse(format!("hex u256 {:?}: {}", s, e)))
}

fn topic_u64(topics: &[String], index: usize) -> Result<u64, LedgerError> {
    let topic = topics
        .get(index)
        .ok_or_else(|| LedgerError::Parse(format!("missing topic {}", index)))?;
    parse_hex_u64(topic)
}

fn topic_address(topics: &[String], index: usize) -> Result<String, LedgerError> {
    let topic = topics
        .get(index)
        .ok_or_else(|| LedgerError::Parse(format!("missing topic {}", index)))?;
    let trimmed = topic.trim_start_matches("0x");
    if trimmed.len() < 40 {
        return Err(LedgerError::Parse(format!("topic too short for address: {:?}", topic)));
    }
    Ok(format!("0x{}", &trimmed[trimmed.len() - 40..]))
}
