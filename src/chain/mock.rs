//! In-memory chain for tests and local development
//!
//! Behaves like a tiny single-node chain: tests control the head height,
//! block hashes, contract events, and when receipts appear. The paired
//! [`MockSigner`] encodes the [`TxRequest`] as JSON so the gateway can
//! record exactly what was submitted.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{ChainEvent, ChainGateway, Receipt, TransactionSigner, TxRequest};
use crate::error::LedgerError;

#[derive(Default)]
struct Inner {
    head: u64,
    block_hashes: HashMap<u64, String>,
    events: Vec<ChainEvent>,
    receipts: HashMap<String, Receipt>,
    submitted: Vec<(String, TxRequest)>,
    next_tx: u64,
    next_onchain_id: i64,
    auto_receipt: bool,
    rpc_down: bool,
}

/// Scriptable in-memory chain
pub struct MockChain {
    inner: Mutex<Inner>,
}

impl Default for MockChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChain {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_onchain_id: 1,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("mock chain lock")
    }

    pub fn set_head(&self, head: u64) {
        self.lock().head = head;
    }

    pub fn set_block_hash(&self, height: u64, hash: &str) {
        self.lock().block_hashes.insert(height, hash.to_string());
    }

    pub fn push_event(&self, event: ChainEvent) {
        self.lock().events.push(event);
    }

    pub fn push_donation(
        &self,
        onchain_campaign_id: i64,
        donor: &str,
        amount_wei: u128,
        tx_hash: &str,
        log_index: i64,
        block_number: u64,
    ) {
        self.push_event(ChainEvent::Donation {
            onchain_campaign_id,
            donor: donor.to_string(),
            amount_wei,
            tx_hash: tx_hash.to_string(),
            log_index,
            block_number,
        });
    }

    /// Simulate the RPC endpoint going away (every call errors)
    pub fn set_rpc_down(&self, down: bool) {
        self.lock().rpc_down = down;
    }

    /// When enabled, every submitted transaction gets an immediate success
    /// receipt; create requests are allocated the next on-chain id.
    pub fn set_auto_receipt(&self, enabled: bool) {
        self.lock().auto_receipt = enabled;
    }

    /// Deliver a receipt for a previously submitted transaction
    pub fn deliver_receipt(&self, tx_hash: &str, success: bool, onchain_campaign_id: Option<i64>) {
        let mut inner = self.lock();
        let block_number = inner.head;
        inner.receipts.insert(
            tx_hash.to_string(),
            Receipt {
                tx_hash: tx_hash.to_string(),
                success,
                block_number,
                revert_reason: if success { None } else { Some("execution reverted".into()) },
                onchain_campaign_id,
            },
        );
    }

    /// Everything submitted so far, in order
    pub fn submitted(&self) -> Vec<(String, TxRequest)> {
        self.lock().submitted.clone()
    }

    fn check_up(&self) -> Result<(), LedgerError> {
        if self.lock().rpc_down {
            return Err(LedgerError::TransientChain("mock rpc down".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainGateway for MockChain {
    async fn get_block_number(&self) -> Result<u64, LedgerError> {
        self.check_up()?;
        Ok(self.lock().head)
    }

    async fn get_block_hash(&self, height: u64) -> Result<Option<String>, LedgerError> {
        self.check_up()?;
        let inner = self.lock();
        Ok(inner
            .block_hashes
            .get(&height)
            .cloned()
            .or_else(|| Some(format!("0xblock{}", height))))
    }

    async fn get_events(&self, from_block: u64, to_block: u64) -> Result<Vec<ChainEvent>, LedgerError> {
        self.check_up()?;
        let inner = self.lock();
        Ok(inner
            .events
            .iter()
            .filter(|e| {
                let block = match e {
                    ChainEvent::CampaignCreated { block_number, .. } => *block_number,
                    ChainEvent::Donation { block_number, .. } => *block_number,
                    ChainEvent::Withdrawal { block_number, .. } => *block_number,
                };
                block >= from_block && block <= to_block
            })
            .cloned()
            .collect())
    }

    async fn send_transaction(&self, signed_payload: &[u8]) -> Result<String, LedgerError> {
        self.check_up()?;
        let request: TxRequest = serde_json::from_slice(signed_payload)
            .map_err(|e| LedgerError::Parse(format!("mock signed payload: {}", e)))?;

        let mut inner = self.lock();
        inner.next_tx += 1;
        let tx_hash = format!("0xmocktx{}", inner.next_tx);
        inner.submitted.push((tx_hash.clone(), request.clone()));

        if inner.auto_receipt {
            let onchain_campaign_id = match &request {
                TxRequest::CreateCampaign { .. } => {
                    let id = inner.next_onchain_id;
                    inner.next_onchain_id += 1;
                    Some(id)
                }
                _ => None,
            };
            let block_number = inner.head;
            inner.receipts.insert(
                tx_hash.clone(),
                Receipt {
                    tx_hash: tx_hash.clone(),
                    success: true,
                    block_number,
                    revert_reason: None,
                    onchain_campaign_id,
                },
            );
        }

        Ok(tx_hash)
    }

    async fn get_receipt(&self, tx_hash: &str) -> Result<Option<Receipt>, LedgerError> {
        self.check_up()?;
        Ok(self.lock().receipts.get(tx_hash).cloned())
    }
}

/// Signer that serializes the request as JSON. Only meaningful together
/// with [`MockChain`].
pub struct MockSigner;

#[async_trait]
impl TransactionSigner for MockSigner {
    async fn sign(&self, request: &TxRequest) -> Result<Vec<u8>, LedgerError> {
        serde_json::to_vec(request).map_err(Into::into)
    }
}
