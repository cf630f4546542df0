//! Recovery sweeper.
//!
//! Runs on its own cadence over the durable receipts, independent of the
//! driver's in-memory caches: it finishes pending claims and time-unlocked
//! refunds using only persisted identifiers, so it works after a crash.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use serde_json::json;
use tokio::task::JoinHandle;

use crate::chain::{ChainClient, ClaimParams, RefundParams};
use crate::clock::now_unix;
use crate::receipts::{Patch, SqliteReceiptsStore, TradePatch, TradeReceipt, TradeState};

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub interval_ms: u64,
    pub batch_limit: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            batch_limit: 50,
        }
    }
}

pub struct RecoverySweeper {
    cfg: SweeperConfig,
    store: Arc<Mutex<SqliteReceiptsStore>>,
    chain: Arc<dyn ChainClient>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RecoverySweeper {
    pub fn new(
        cfg: SweeperConfig,
        store: Arc<Mutex<SqliteReceiptsStore>>,
        chain: Arc<dyn ChainClient>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            store,
            chain,
            handle: Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock().expect("sweeper handle mutex poisoned");
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let sweeper = self.clone();
        *handle = Some(tokio::spawn(async move {
            loop {
                if let Err(err) = sweeper.run_once().await {
                    tracing::warn!(error = %format!("{err:#}"), "recovery sweep failed");
                }
                tokio::time::sleep(Duration::from_millis(sweeper.cfg.interval_ms)).await;
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(handle) = self
            .handle
            .lock()
            .expect("sweeper handle mutex poisoned")
            .take()
        {
            handle.abort();
        }
    }

    /// One full pass: pending claims first, then unlocked refunds.
    pub async fn run_once(&self) -> Result<()> {
        let claims = {
            let store = self.store.lock().expect("receipts store mutex poisoned");
            store
                .list_open_claims(self.cfg.batch_limit, 0)
                .context("list open claims")?
        };
        for receipt in claims {
            if let Err(err) = self.sweep_claim(&receipt).await {
                tracing::warn!(trade_id = %receipt.trade_id, error = %format!("{err:#}"), "claim sweep failed");
                self.record_error(&receipt.trade_id, &format!("claim sweep: {err:#}"));
            }
        }

        let refunds = {
            let store = self.store.lock().expect("receipts store mutex poisoned");
            store
                .list_open_refunds(now_unix(), self.cfg.batch_limit, 0)
                .context("list open refunds")?
        };
        for receipt in refunds {
            if let Err(err) = self.sweep_refund(&receipt).await {
                tracing::warn!(trade_id = %receipt.trade_id, error = %format!("{err:#}"), "refund sweep failed");
                self.record_error(&receipt.trade_id, &format!("refund sweep: {err:#}"));
            }
        }

        Ok(())
    }

    /// Re-issues the claim while the escrow still exists; once it is gone
    /// the claim already landed and the receipt just catches up.
    async fn sweep_claim(&self, receipt: &TradeReceipt) -> Result<()> {
        let payment_hash = receipt
            .ln_payment_hash_hex
            .as_deref()
            .context("receipt has no payment hash")?;
        let preimage_hex = receipt
            .ln_preimage_hex
            .clone()
            .context("receipt has no preimage")?;
        let recipient = receipt
            .sol_recipient
            .clone()
            .context("receipt has no recipient account")?;

        let escrow = self
            .chain
            .read_escrow_state(payment_hash)
            .await
            .context("read escrow state")?;

        let tx_sig = match escrow {
            Some(_) => {
                let params = ClaimParams {
                    payment_hash_hex: payment_hash.to_string(),
                    recipient_token_account: recipient,
                    preimage_hex,
                    trade_fee_collector: receipt.trade_fee_collector.clone().unwrap_or_default(),
                    cu_limit: None,
                    cu_price_microunits: None,
                };
                let tx = self
                    .chain
                    .build_claim_tx(&params)
                    .await
                    .context("build claim tx")?;
                let sig = self
                    .chain
                    .send_and_confirm(&tx)
                    .await
                    .context("confirm claim tx")?;
                tracing::info!(trade_id = %receipt.trade_id, tx_sig = %sig, "swept pending claim");
                Some(sig)
            }
            None => None,
        };

        let mut store = self.store.lock().expect("receipts store mutex poisoned");
        store
            .upsert_trade(
                &receipt.trade_id,
                TradePatch {
                    state: Some(TradeState::Claimed),
                    last_error: Patch::Clear,
                    ..TradePatch::default()
                },
            )
            .context("mark trade claimed")?;
        store
            .append_event(
                &receipt.trade_id,
                "sweep_claim",
                &json!({"tx_sig": tx_sig}),
                None,
            )
            .context("append sweep event")?;
        Ok(())
    }

    /// Re-issues the refund once the window has passed; only a confirmed
    /// refund transaction transitions the receipt.
    async fn sweep_refund(&self, receipt: &TradeReceipt) -> Result<()> {
        let payment_hash = receipt
            .ln_payment_hash_hex
            .as_deref()
            .context("receipt has no payment hash")?;
        let refund_account = receipt
            .sol_refund
            .clone()
            .context("receipt has no refund account")?;

        let escrow = self
            .chain
            .read_escrow_state(payment_hash)
            .await
            .context("read escrow state")?;
        anyhow::ensure!(escrow.is_some(), "escrow already settled on chain");

        let params = RefundParams {
            payment_hash_hex: payment_hash.to_string(),
            refund_token_account: refund_account,
            cu_limit: None,
            cu_price_microunits: None,
        };
        let tx = self
            .chain
            .build_refund_tx(&params)
            .await
            .context("build refund tx")?;
        let tx_sig = self
            .chain
            .send_and_confirm(&tx)
            .await
            .context("confirm refund tx")?;
        tracing::info!(trade_id = %receipt.trade_id, tx_sig = %tx_sig, "swept time-unlocked refund");

        let mut store = self.store.lock().expect("receipts store mutex poisoned");
        store
            .upsert_trade(
                &receipt.trade_id,
                TradePatch {
                    state: Some(TradeState::Refunded),
                    last_error: Patch::Clear,
                    ..TradePatch::default()
                },
            )
            .context("mark trade refunded")?;
        store
            .append_event(
                &receipt.trade_id,
                "sweep_refund",
                &json!({"tx_sig": tx_sig}),
                None,
            )
            .context("append sweep event")?;
        Ok(())
    }

    fn record_error(&self, trade_id: &str, message: &str) {
        let mut store = self.store.lock().expect("receipts store mutex poisoned");
        if let Err(err) = store.upsert_trade(
            trade_id,
            TradePatch {
                last_error: Patch::Set(message.to_string()),
                ..TradePatch::default()
            },
        ) {
            tracing::warn!(trade_id, error = %format!("{err:#}"), "record sweep error failed");
        }
    }
}
