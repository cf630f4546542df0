#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde_json::json;

use ln_sol_swap::bus::{BusClient, BusEvent, BusInfo, LogTail};
use ln_sol_swap::chain::{
    ChainClient, ChainTx, ClaimParams, EscrowInitParams, EscrowState, RefundParams, SimulateResult,
};
use ln_sol_swap::clock::now_ms;
use ln_sol_swap::envelope::Envelope;
use ln_sol_swap::lightning::{CreatedInvoice, DecodedInvoice, LnClient, PaidInvoice, sha256_preimage};

/// Append-only event log shared by every peer's bus client.
pub struct SharedBusLog {
    events: Mutex<Vec<BusEvent>>,
}

impl SharedBusLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn append(&self, channel: &str, envelope: &Envelope) {
        let mut events = self.events.lock().expect("bus log mutex poisoned");
        let seq = events.len() as u64 + 1;
        events.push(BusEvent {
            seq,
            ts: now_ms(),
            channel: channel.to_string(),
            kind: envelope.kind.as_str().to_string(),
            trade_id: envelope.trade_id.clone(),
            message: envelope.to_value().expect("serialize envelope"),
        });
    }

    pub fn events(&self) -> Vec<BusEvent> {
        self.events.lock().expect("bus log mutex poisoned").clone()
    }

    /// Count of events of one envelope kind on one channel.
    pub fn count_kind(&self, channel: &str, kind: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| e.channel == channel && e.kind == kind)
            .count()
    }

    pub fn count_kind_anywhere(&self, kind: &str) -> usize {
        self.events().iter().filter(|e| e.kind == kind).count()
    }
}

/// One peer's view of the shared bus.
pub struct FakeBusClient {
    log: Arc<SharedBusLog>,
    peer: String,
    pub subscribed: Mutex<HashSet<String>>,
    pub joined: Mutex<HashSet<String>>,
}

impl FakeBusClient {
    pub fn new(log: Arc<SharedBusLog>, peer: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            log,
            peer: peer.into(),
            subscribed: Mutex::new(HashSet::new()),
            joined: Mutex::new(HashSet::new()),
        })
    }
}

#[async_trait]
impl BusClient for FakeBusClient {
    async fn subscribe(&self, channels: &[String]) -> Result<()> {
        let mut subscribed = self.subscribed.lock().expect("subscribed mutex poisoned");
        subscribed.extend(channels.iter().cloned());
        Ok(())
    }

    async fn publish(&self, channel: &str, envelope: &Envelope) -> Result<()> {
        self.log.append(channel, envelope);
        Ok(())
    }

    async fn log_read(&self, since_seq: u64, limit: usize) -> Result<LogTail> {
        let events: Vec<BusEvent> = self
            .log
            .events()
            .into_iter()
            .filter(|e| e.seq > since_seq)
            .take(limit)
            .collect();
        // Cursor semantics: the caller resumes from the last delivered seq.
        let latest_seq = events.last().map(|e| e.seq).unwrap_or(since_seq);
        Ok(LogTail { events, latest_seq })
    }

    async fn info(&self) -> Result<BusInfo> {
        Ok(BusInfo {
            peer: self.peer.clone(),
        })
    }

    async fn join(&self, channel: &str) -> Result<()> {
        self.joined
            .lock()
            .expect("joined mutex poisoned")
            .insert(channel.to_string());
        Ok(())
    }

    async fn leave(&self, channel: &str) -> Result<()> {
        self.joined
            .lock()
            .expect("joined mutex poisoned")
            .remove(channel);
        Ok(())
    }
}

struct FakeInvoice {
    sats: u64,
    payment_hash_hex: String,
}

/// Deterministic in-memory Lightning node shared by both swap parties.
pub struct FakeLn {
    invoices: Mutex<HashMap<String, FakeInvoice>>,
    preimages: Mutex<HashMap<String, String>>,
    counter: AtomicU64,
    pub pay_calls: AtomicU64,
    pub fail_pay: AtomicBool,
}

impl FakeLn {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            invoices: Mutex::new(HashMap::new()),
            preimages: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(1),
            pay_calls: AtomicU64::new(0),
            fail_pay: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl LnClient for FakeLn {
    async fn create_invoice(
        &self,
        sats: u64,
        _label: &str,
        _description: &str,
    ) -> Result<CreatedInvoice> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let mut preimage = [0u8; 32];
        preimage[..8].copy_from_slice(&n.to_be_bytes());
        preimage[8] = 0x5a;
        let payment_hash_hex = hex::encode(sha256_preimage(&preimage));
        let bolt11 = format!("lnfake1{}{n}", &payment_hash_hex[..16]);

        self.invoices.lock().expect("invoices mutex poisoned").insert(
            bolt11.clone(),
            FakeInvoice {
                sats,
                payment_hash_hex: payment_hash_hex.clone(),
            },
        );
        self.preimages
            .lock()
            .expect("preimages mutex poisoned")
            .insert(payment_hash_hex.clone(), hex::encode(preimage));

        Ok(CreatedInvoice {
            bolt11,
            payment_hash_hex,
        })
    }

    async fn pay(
        &self,
        bolt11: &str,
        _fee_limit_sat: u64,
        _timeout: Duration,
    ) -> Result<PaidInvoice> {
        self.pay_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_pay.load(Ordering::SeqCst) {
            anyhow::bail!("no_route");
        }
        let payment_hash_hex = {
            let invoices = self.invoices.lock().expect("invoices mutex poisoned");
            invoices
                .get(bolt11)
                .context("unknown invoice")?
                .payment_hash_hex
                .clone()
        };
        let preimage_hex = self
            .preimages
            .lock()
            .expect("preimages mutex poisoned")
            .get(&payment_hash_hex)
            .context("no preimage for invoice")?
            .clone();
        Ok(PaidInvoice {
            preimage_hex,
            fee_sat: 1,
        })
    }

    async fn decode(&self, bolt11: &str) -> Result<DecodedInvoice> {
        let invoices = self.invoices.lock().expect("invoices mutex poisoned");
        let invoice = invoices.get(bolt11).context("unknown invoice")?;
        Ok(DecodedInvoice {
            destination: "fake-node".to_string(),
            amount_sat: Some(invoice.sats),
            payment_hash_hex: invoice.payment_hash_hex.clone(),
        })
    }
}

/// Escrow accounts shared by every peer's chain client.
pub struct SharedChainState {
    escrows: Mutex<HashMap<String, EscrowState>>,
    tx_counter: AtomicU64,
}

impl SharedChainState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            escrows: Mutex::new(HashMap::new()),
            tx_counter: AtomicU64::new(1),
        })
    }

    pub fn escrow(&self, payment_hash_hex: &str) -> Option<EscrowState> {
        self.escrows
            .lock()
            .expect("escrows mutex poisoned")
            .get(payment_hash_hex)
            .cloned()
    }

    pub fn insert_escrow(&self, payment_hash_hex: &str, state: EscrowState) {
        self.escrows
            .lock()
            .expect("escrows mutex poisoned")
            .insert(payment_hash_hex.to_string(), state);
    }
}

/// One signer's chain client over the shared escrow program state.
pub struct FakeChain {
    state: Arc<SharedChainState>,
    signer: String,
}

impl FakeChain {
    pub fn new(state: Arc<SharedChainState>, signer: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            state,
            signer: signer.into(),
        })
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    async fn signer_pubkey(&self) -> Result<String> {
        Ok(self.signer.clone())
    }

    async fn build_escrow_init_tx(&self, params: &EscrowInitParams) -> Result<ChainTx> {
        Ok(ChainTx(json!({
            "op": "escrow_init",
            "payment_hash_hex": params.payment_hash_hex,
            "mint": params.mint,
            "amount": params.amount,
            "recipient": params.recipient,
            "refund": params.refund,
            "refund_after_unix": params.refund_after_unix,
        })))
    }

    async fn build_claim_tx(&self, params: &ClaimParams) -> Result<ChainTx> {
        Ok(ChainTx(json!({
            "op": "claim",
            "payment_hash_hex": params.payment_hash_hex,
            "preimage_hex": params.preimage_hex,
            "recipient_token_account": params.recipient_token_account,
        })))
    }

    async fn build_refund_tx(&self, params: &RefundParams) -> Result<ChainTx> {
        Ok(ChainTx(json!({
            "op": "refund",
            "payment_hash_hex": params.payment_hash_hex,
            "refund_token_account": params.refund_token_account,
        })))
    }

    async fn send_and_confirm(&self, tx: &ChainTx) -> Result<String> {
        let op = tx.0["op"].as_str().context("tx has no op")?;
        let payment_hash = tx.0["payment_hash_hex"]
            .as_str()
            .context("tx has no payment hash")?
            .to_string();
        let n = self.state.tx_counter.fetch_add(1, Ordering::SeqCst);

        let mut escrows = self.state.escrows.lock().expect("escrows mutex poisoned");
        match op {
            "escrow_init" => {
                anyhow::ensure!(
                    !escrows.contains_key(&payment_hash),
                    "escrow already exists"
                );
                let amount = tx.0["amount"].as_u64().context("tx has no amount")?;
                let refund_after_unix = tx.0["refund_after_unix"]
                    .as_u64()
                    .context("tx has no refund_after_unix")?;
                escrows.insert(
                    payment_hash.clone(),
                    EscrowState {
                        escrow_pda: format!("pda-{}", &payment_hash[..8.min(payment_hash.len())]),
                        vault_ata: format!("vault-{}", &payment_hash[..8.min(payment_hash.len())]),
                        net_amount: amount,
                        fee_amount: 0,
                        refund_after_unix,
                    },
                );
            }
            "claim" => {
                anyhow::ensure!(escrows.contains_key(&payment_hash), "escrow not found");
                let preimage_hex = tx.0["preimage_hex"]
                    .as_str()
                    .context("tx has no preimage")?;
                let preimage: [u8; 32] = hex::decode(preimage_hex)
                    .context("decode preimage")?
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("preimage must be 32 bytes"))?;
                anyhow::ensure!(
                    hex::encode(sha256_preimage(&preimage)) == payment_hash,
                    "preimage does not open hashlock"
                );
                escrows.remove(&payment_hash);
            }
            "refund" => {
                anyhow::ensure!(escrows.contains_key(&payment_hash), "escrow not found");
                escrows.remove(&payment_hash);
            }
            other => anyhow::bail!("unknown tx op {other}"),
        }

        Ok(format!("sig-{op}-{n}"))
    }

    async fn simulate(&self, _tx: &ChainTx) -> Result<SimulateResult> {
        Ok(SimulateResult {
            ok: true,
            logs: Vec::new(),
        })
    }

    async fn read_escrow_state(&self, payment_hash_hex: &str) -> Result<Option<EscrowState>> {
        Ok(self.state.escrow(payment_hash_hex))
    }
}

/// Polls `f` until it yields a value or the timeout elapses.
pub async fn wait_for<T, F, Fut>(description: &str, timeout: Duration, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = Instant::now() + timeout;
    let mut sleep_for = Duration::from_millis(50);

    loop {
        if Instant::now() >= deadline {
            anyhow::bail!("timeout waiting for {description}");
        }

        if let Some(value) = f().await.with_context(|| format!("poll {description}"))? {
            return Ok(value);
        }

        tokio::time::sleep(sleep_for).await;
        sleep_for = (sleep_for * 2).min(Duration::from_millis(500));
    }
}
