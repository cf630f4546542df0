//! Lightning node interface.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest as _, Sha256};

#[derive(Debug, Clone)]
pub struct CreatedInvoice {
    pub bolt11: String,
    pub payment_hash_hex: String,
}

#[derive(Debug, Clone)]
pub struct PaidInvoice {
    pub preimage_hex: String,
    pub fee_sat: u64,
}

#[derive(Debug, Clone)]
pub struct DecodedInvoice {
    pub destination: String,
    pub amount_sat: Option<u64>,
    pub payment_hash_hex: String,
}

#[async_trait]
pub trait LnClient: Send + Sync {
    async fn create_invoice(
        &self,
        sats: u64,
        label: &str,
        description: &str,
    ) -> Result<CreatedInvoice>;

    /// Pays a bolt11 invoice. Fails with `no_route`, `timeout`, or
    /// `insufficient_balance` style errors from the node.
    async fn pay(&self, bolt11: &str, fee_limit_sat: u64, timeout: Duration)
    -> Result<PaidInvoice>;

    async fn decode(&self, bolt11: &str) -> Result<DecodedInvoice>;
}

/// SHA-256 of a preimage: the hashlock shared by the invoice and escrow.
pub fn sha256_preimage(preimage: &[u8; 32]) -> [u8; 32] {
    let digest = Sha256::digest(preimage);
    digest.into()
}

/// Checks that a revealed preimage hashes to the expected payment hash.
pub fn preimage_matches(preimage_hex: &str, payment_hash_hex: &str) -> Result<bool> {
    let bytes = hex::decode(preimage_hex)
        .map_err(|e| anyhow::anyhow!("decode preimage hex: {e}"))?;
    let preimage: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("preimage must be 32 bytes"))?;
    Ok(hex::encode(sha256_preimage(&preimage)) == payment_hash_hex.to_ascii_lowercase())
}
