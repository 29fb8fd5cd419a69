//! Chain gateway
//!
//! Narrow interface over a blockchain RPC endpoint: read event logs, submit
//! signed transactions, fetch receipts. Signing is delegated to a
//! key-holding collaborator behind [`TransactionSigner`]; the engine never
//! holds private keys.

pub mod mock;
pub mod rpc;
pub mod signer;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

/// One wei-denominated ether
pub const WEI_PER_ETH: f64 = 1e18;

/// Convert a wei amount to ETH for ledger math
pub fn wei_to_eth(wei: u128) -> f64 {
    wei as f64 / WEI_PER_ETH
}

/// Convert an ETH amount to wei for transaction building
pub fn eth_to_wei(eth: f64) -> u128 {
    (eth * WEI_PER_ETH) as u128
}

/// Event observed in a contract log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChainEvent {
    CampaignCreated {
        onchain_campaign_id: i64,
        tx_hash: String,
        log_index: i64,
        block_number: u64,
    },
    Donation {
        onchain_campaign_id: i64,
        donor: String,
        amount_wei: u128,
        tx_hash: String,
        log_index: i64,
        block_number: u64,
    },
    Withdrawal {
        onchain_campaign_id: i64,
        owner: String,
        amount_wei: u128,
        tx_hash: String,
        log_index: i64,
        block_number: u64,
    },
}

/// Transaction receipt as the tracker consumes it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: String,
    pub success: bool,
    pub block_number: u64,
    /// Revert reason when the gateway can recover one
    pub revert_reason: Option<String>,
    /// On-chain campaign id decoded from a CampaignCreated log, if present
    pub onchain_campaign_id: Option<i64>,
}

/// On-chain write the tracker asks the signer to build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TxRequest {
    CreateCampaign {
        title: String,
        description: String,
        goal_wei: u128,
    },
    Withdraw {
        onchain_campaign_id: i64,
        amount_wei: u128,
    },
    SetActive {
        onchain_campaign_id: i64,
        active: bool,
    },
}

/// Blockchain RPC operations the engine depends on
#[async_trait]
pub trait ChainGateway: Send + Sync {
    /// Current chain head height
    async fn get_block_number(&self) -> Result<u64, LedgerError>;

    /// Canonical block hash at a height, None when the height is unknown
    async fn get_block_hash(&self, height: u64) -> Result<Option<String>, LedgerError>;

    /// Contract events in the inclusive block range
    async fn get_events(&self, from_block: u64, to_block: u64) -> Result<Vec<ChainEvent>, LedgerError>;

    /// Submit a signed transaction, returning its hash
    async fn send_transaction(&self, signed_payload: &[u8]) -> Result<String, LedgerError>;

    /// Receipt for a transaction, None while unmined
    async fn get_receipt(&self, tx_hash: &str) -> Result<Option<Receipt>, LedgerError>;
}

/// Key-holding collaborator that turns a [`TxRequest`] into a signed
/// raw transaction
#[async_trait]
pub trait TransactionSigner: Send + Sync {
    async fn sign(&self, request: &TxRequest) -> Result<Vec<u8>, LedgerError>;
}

/// Keccak-256 topic hash for an event signature, 0x-prefixed
pub fn event_topic(signature: &str) -> String {
    use sha3::{Digest, Keccak256};
    let mut hasher = Keccak256::new();
    hasher.update(signature.as_bytes());
    format!("0x{}", hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wei_eth_round_trip() {
        assert_eq!(wei_to_eth(1_500_000_000_000_000_000), 1.5);
        assert_eq!(eth_to_wei(2.0), 2_000_000_000_000_000_000);
    }

    #[test]
    fn topic_hash_matches_known_value() {
        // keccak256("Transfer(address,address,uint256)") is a fixed point
        // every Ethereum tool agrees on
        assert_eq!(
            event_topic("Transfer(address,address,uint256)"),
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
    }
}
