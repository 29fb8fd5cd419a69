//! Remote transaction signer
//!
//! The engine never manages private keys. A key-holding signer service
//! receives the transaction intent and returns the signed raw transaction
//! ready for eth_sendRawTransaction.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use super::{TransactionSigner, TxRequest};
use crate::error::LedgerError;

/// Signer response: signed raw transaction as 0x-hex
#[derive(Debug, Deserialize)]
struct SignResponse {
    signed_tx: String,
}

/// HTTP client for a remote signer service
pub struct RemoteSigner {
    client: Client,
    signer_url: String,
    chain_id: u64,
    gas_limit: u64,
}

impl RemoteSigner {
    pub fn new(signer_url: &str, chain_id: u64, gas_limit: u64) -> Result<Self, LedgerError> {
        url::Url::parse(signer_url)
            .map_err(|e| LedgerError::Config(format!("signer_url {:?}: {}", signer_url, e)))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| LedgerError::Config(format!("reqwest client: {}", e)))?;

        Ok(Self {
            client,
            signer_url: signer_url.to_string(),
            chain_id,
            gas_limit,
        })
    }
}

#[async_trait]
impl TransactionSigner for RemoteSigner {
    async fn sign(&self, request: &TxRequest) -> Result<Vec<u8>, LedgerError> {
        let body = serde_json::json!({
            "chain_id": self.chain_id,
            "gas_limit": self.gas_limit,
            "tx": request,
        });

        let response = self
            .client
            .post(format!("{}/sign", self.signer_url.trim_end_matches('/')))
            .json(&body)
            .send()
            .await
            .map_err(|e| LedgerError::TransientChain(format!("signer: {}", e)))?;

        if !response.status().is_success() {
            return Err(LedgerError::TransientChain(format!(
                "signer returned {}",
                response.status()
            )));
        }

        let parsed: SignResponse = response
            .json()
            .await
            .map_err(|e| LedgerError::Parse(format!("signer response: {}", e)))?;

        hex::decode(parsed.signed_tx.trim_start_matches("0x"))
            .map_err(|e| LedgerError::Parse(format!("signed_tx hex: {}", e)))
    }
}
