//! Chain client interface for the hashlocked token escrow program.
//!
//! Escrow accounts are program-derived from the payment hash, so every
//! operation is addressed by `payment_hash_hex`.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A built, ready-to-send transaction. Opaque to the core: the chain
/// client that built it knows how to send or simulate it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainTx(pub Value);

#[derive(Debug, Clone)]
pub struct EscrowInitParams {
    pub payment_hash_hex: String,
    pub mint: String,
    pub amount: u64,
    pub recipient: String,
    pub refund: String,
    pub refund_after_unix: u64,
    pub trade_fee_collector: String,
    pub cu_limit: Option<u32>,
    pub cu_price_microunits: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ClaimParams {
    pub payment_hash_hex: String,
    pub recipient_token_account: String,
    pub preimage_hex: String,
    pub trade_fee_collector: String,
    pub cu_limit: Option<u32>,
    pub cu_price_microunits: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RefundParams {
    pub payment_hash_hex: String,
    pub refund_token_account: String,
    pub cu_limit: Option<u32>,
    pub cu_price_microunits: Option<u64>,
}

/// On-chain escrow account state, read back by payment hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowState {
    pub escrow_pda: String,
    pub vault_ata: String,
    pub net_amount: u64,
    pub fee_amount: u64,
    pub refund_after_unix: u64,
}

#[derive(Debug, Clone)]
pub struct SimulateResult {
    pub ok: bool,
    pub logs: Vec<String>,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Base58 public key of the local chain signer.
    async fn signer_pubkey(&self) -> Result<String>;

    async fn build_escrow_init_tx(&self, params: &EscrowInitParams) -> Result<ChainTx>;
    async fn build_claim_tx(&self, params: &ClaimParams) -> Result<ChainTx>;
    async fn build_refund_tx(&self, params: &RefundParams) -> Result<ChainTx>;

    /// Sends and waits for confirmation; returns the transaction signature.
    async fn send_and_confirm(&self, tx: &ChainTx) -> Result<String>;
    async fn simulate(&self, tx: &ChainTx) -> Result<SimulateResult>;

    /// `None` once the escrow is claimed, refunded, or never existed.
    async fn read_escrow_state(&self, payment_hash_hex: &str) -> Result<Option<EscrowState>>;
}
