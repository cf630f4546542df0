//! Automated settlement driver.
//!
//! One timer-driven loop per peer. Each tick reads the log tail, folds it
//! into contexts, and drives at most a budgeted number of external effects
//! across five pipelines: quote-from-offer, accept-quote,
//! invite-from-accept, join-invite, and the settlement state machine.
//! Ticks are fenced so they never overlap; every external call runs under
//! a wall-clock timeout.

pub mod cache;
mod negotiate;
mod settle;

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::bus::{BusClient, BusEvent};
use crate::chain::ChainClient;
use crate::clock::now_ms;
use crate::context::{Contexts, build_contexts};
use crate::envelope::Envelope;
use crate::envelope::sign::{Keypair, sign_envelope};
use crate::envelope::validate::validate_envelope;
use crate::lightning::LnClient;
use crate::receipts::SqliteReceiptsStore;
use self::cache::{AgedMap, AgedSet};

/// Identity RPCs get a shorter leash than tool calls.
const IDENTITY_TIMEOUT_MS: u64 = 8_000;
const SUBSCRIBE_TIMEOUT_MS: u64 = 10_000;
const TRACE_CAPACITY: usize = 200;

pub(crate) const STAGE_COOLDOWN_MS: u64 = 10_000;
pub(crate) const CLAIM_COOLDOWN_MS: u64 = 15_000;
pub(crate) const EVENT_RETRY_COOLDOWN_MS: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct AutoTraderConfig {
    /// RFQ/offer channels this driver watches and publishes on.
    pub channels: Vec<String>,
    pub interval_ms: u64,
    pub event_max_age_ms: u64,
    pub tool_timeout_ms: u64,
    /// External side-effect budget per tick.
    pub actions_per_tick: u32,
    pub max_trades: usize,
    pub tail_limit: usize,
    pub keepalive_interval_ms: u64,
    pub dedupe_max: usize,
    pub stage_max: usize,
    pub preimage_max: usize,
    pub quote_ttl_sec: u64,
    pub terms_ttl_sec: u64,
    /// Maker economics used when quoting from an offer line.
    pub platform_fee_bps: u32,
    pub trade_fee_bps: u32,
    pub trade_fee_collector: String,
    pub sol_mint: String,
    /// Maker token account refunds return to.
    pub sol_refund: String,
    /// Taker-side fee ceiling for LN payments.
    pub ln_fee_limit_sat: u64,
}

impl Default for AutoTraderConfig {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            interval_ms: 1_000,
            event_max_age_ms: 600_000,
            tool_timeout_ms: 25_000,
            actions_per_tick: 12,
            max_trades: 64,
            tail_limit: 500,
            keepalive_interval_ms: 30_000,
            dedupe_max: 2_048,
            stage_max: 4_096,
            preimage_max: 512,
            quote_ttl_sec: 600,
            terms_ttl_sec: 900,
            platform_fee_bps: 10,
            trade_fee_bps: 10,
            trade_fee_collector: String::new(),
            sol_mint: String::new(),
            sol_refund: String::new(),
            ln_fee_limit_sat: 50,
        }
    }
}

impl AutoTraderConfig {
    fn clamped(mut self) -> Self {
        self.interval_ms = self.interval_ms.clamp(250, 10_000);
        self.tool_timeout_ms = self.tool_timeout_ms.clamp(250, 120_000);
        self.actions_per_tick = self.actions_per_tick.max(1);
        self.max_trades = self.max_trades.max(1);
        self.tail_limit = self.tail_limit.max(1);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct TraderStats {
    pub ticks: u64,
    pub actions: u64,
    pub last_tick_at: Option<u64>,
    pub last_error: Option<String>,
    pub started_at: u64,
}

/// One structured trace entry. Signatures appear only as short prefixes;
/// preimages and secret keys never appear.
#[derive(Debug, Clone)]
pub struct TraceEvent {
    pub ts: u64,
    pub scope: &'static str,
    pub trade_id: String,
    pub detail: String,
}

pub(crate) struct Caches {
    pub quoted_rfq_sig: AgedSet,
    pub accepted_quote_sig: AgedSet,
    pub invited_accept_sig: AgedSet,
    pub joined_invite_sig: AgedSet,
    /// trade_id -> locked_at_ms; one accepted quote per RFQ.
    pub accepted_trade_lock: AgedMap<u64>,
    /// "(trade_id):(stage)" -> done_at_ms.
    pub stage_done: AgedMap<u64>,
    pub stage_in_flight: AgedSet,
    /// "(trade_id):(stage)" -> earliest retry ms.
    pub stage_retry_after: AgedMap<u64>,
    /// Envelope signature -> earliest retry ms, for failed pipeline events.
    pub event_retry_after: AgedMap<u64>,
    /// trade_id -> preimage hex, cached after a successful LN pay.
    pub trade_preimage: AgedMap<String>,
}

impl Caches {
    fn new(cfg: &AutoTraderConfig) -> Self {
        Self {
            quoted_rfq_sig: AgedSet::new(cfg.dedupe_max),
            accepted_quote_sig: AgedSet::new(cfg.dedupe_max),
            invited_accept_sig: AgedSet::new(cfg.dedupe_max),
            joined_invite_sig: AgedSet::new(cfg.dedupe_max),
            accepted_trade_lock: AgedMap::new(cfg.dedupe_max),
            stage_done: AgedMap::new(cfg.stage_max),
            stage_in_flight: AgedSet::new(cfg.stage_max),
            stage_retry_after: AgedMap::new(cfg.stage_max),
            event_retry_after: AgedMap::new(cfg.dedupe_max),
            trade_preimage: AgedMap::new(cfg.preimage_max),
        }
    }

    fn clear(&mut self) {
        self.quoted_rfq_sig.clear();
        self.accepted_quote_sig.clear();
        self.invited_accept_sig.clear();
        self.joined_invite_sig.clear();
        self.accepted_trade_lock.clear();
        self.stage_done.clear();
        self.stage_in_flight.clear();
        self.stage_retry_after.clear();
        self.event_retry_after.clear();
        self.trade_preimage.clear();
    }

    fn prune(&mut self, now_ms: u64, max_age_ms: u64) {
        self.quoted_rfq_sig.prune(now_ms, max_age_ms);
        self.accepted_quote_sig.prune(now_ms, max_age_ms);
        self.invited_accept_sig.prune(now_ms, max_age_ms);
        self.joined_invite_sig.prune(now_ms, max_age_ms);
        self.accepted_trade_lock.prune(now_ms, max_age_ms);
        self.stage_done.prune(now_ms, max_age_ms);
        self.stage_in_flight.prune(now_ms, max_age_ms);
        self.stage_retry_after.prune(now_ms, max_age_ms);
        self.event_retry_after.prune(now_ms, max_age_ms);
        // Preimages are the key to funds: keep them as long as the map
        // allows and rely on receipts as the durable copy.
        self.trade_preimage.prune(now_ms, max_age_ms.saturating_mul(6));
    }

    pub(crate) fn stage_ready(&self, key: &str, now_ms: u64) -> bool {
        !self.stage_done.contains(key)
            && !self.stage_in_flight.contains(key)
            && self.stage_retry_after.get(key).is_none_or(|&t| t <= now_ms)
    }

    pub(crate) fn stage_begin(&mut self, key: &str, now_ms: u64) {
        self.stage_in_flight.insert(key, now_ms);
    }

    pub(crate) fn stage_success(&mut self, key: &str, now_ms: u64) {
        self.stage_in_flight.remove(key);
        self.stage_done.insert(key, now_ms, now_ms);
        self.stage_retry_after.remove(key);
    }

    pub(crate) fn stage_failure(&mut self, key: &str, now_ms: u64, cooldown_ms: u64) {
        self.stage_in_flight.remove(key);
        self.stage_retry_after
            .insert(key, now_ms + cooldown_ms, now_ms);
    }

    pub(crate) fn event_ready(&self, sig: &str, now_ms: u64) -> bool {
        self.event_retry_after.get(sig).is_none_or(|&t| t <= now_ms)
    }

    pub(crate) fn event_failure(&mut self, sig: &str, now_ms: u64) {
        self.event_retry_after
            .insert(sig, now_ms + EVENT_RETRY_COOLDOWN_MS, now_ms);
    }

    pub(crate) fn forget_trade(&mut self, trade_id: &str) {
        self.trade_preimage.remove(trade_id);
        self.accepted_trade_lock.remove(trade_id);
    }
}

pub(crate) fn stage_key(trade_id: &str, stage: &str) -> String {
    format!("{trade_id}:{stage}")
}

pub(crate) fn sig_prefix(sig: &str) -> &str {
    &sig[..sig.len().min(12)]
}

pub(crate) struct DriverState {
    pub window: Vec<BusEvent>,
    pub last_seq: u64,
    pub last_keepalive_ms: u64,
    pub chain_signer: Option<String>,
    /// Swap channels this driver created or joined.
    pub swap_channels: HashSet<String>,
    pub caches: Caches,
}

pub struct AutoTrader {
    pub(crate) cfg: AutoTraderConfig,
    pub(crate) bus: Arc<dyn BusClient>,
    pub(crate) ln: Arc<dyn LnClient>,
    pub(crate) chain: Arc<dyn ChainClient>,
    pub(crate) store: Arc<StdMutex<SqliteReceiptsStore>>,
    keypair: Keypair,
    local_peer: String,
    state: AsyncMutex<DriverState>,
    tick_in_flight: AtomicBool,
    stats: StdMutex<TraderStats>,
    trace: StdMutex<VecDeque<TraceEvent>>,
    handle: StdMutex<Option<JoinHandle<()>>>,
}

impl AutoTrader {
    pub fn new(
        cfg: AutoTraderConfig,
        bus: Arc<dyn BusClient>,
        ln: Arc<dyn LnClient>,
        chain: Arc<dyn ChainClient>,
        store: Arc<StdMutex<SqliteReceiptsStore>>,
        keypair: Keypair,
    ) -> Arc<Self> {
        let cfg = cfg.clamped();
        let caches = Caches::new(&cfg);
        let local_peer = keypair.public_key_hex();
        Arc::new(Self {
            cfg,
            bus,
            ln,
            chain,
            store,
            keypair,
            local_peer,
            state: AsyncMutex::new(DriverState {
                window: Vec::new(),
                last_seq: 0,
                last_keepalive_ms: 0,
                chain_signer: None,
                swap_channels: HashSet::new(),
                caches,
            }),
            tick_in_flight: AtomicBool::new(false),
            stats: StdMutex::new(TraderStats {
                started_at: now_ms(),
                ..TraderStats::default()
            }),
            trace: StdMutex::new(VecDeque::with_capacity(TRACE_CAPACITY)),
            handle: StdMutex::new(None),
        })
    }

    /// Hex32 public key this driver signs envelopes with.
    pub fn local_peer(&self) -> &str {
        &self.local_peer
    }

    /// Spawns the tick loop. Idempotent while a loop is already running.
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock().expect("trader handle mutex poisoned");
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let trader = self.clone();
        *handle = Some(tokio::spawn(async move {
            loop {
                if let Err(err) = trader.tick().await {
                    tracing::warn!(error = %format!("{err:#}"), "auto-trader tick failed");
                }
                tokio::time::sleep(Duration::from_millis(trader.cfg.interval_ms)).await;
            }
        }));
    }

    /// Stops the loop, clears the reentrancy flag and every in-memory
    /// cache. Durable receipts are untouched.
    pub async fn stop(&self, reason: &str) {
        if let Some(handle) = self
            .handle
            .lock()
            .expect("trader handle mutex poisoned")
            .take()
        {
            handle.abort();
        }
        self.tick_in_flight.store(false, Ordering::SeqCst);

        let mut state = self.state.lock().await;
        state.caches.clear();
        state.window.clear();
        state.last_keepalive_ms = 0;
        drop(state);

        self.trace("driver", "", format!("stopped: {reason}"));
        tracing::info!(reason, "auto-trader stopped");
    }

    /// One fenced tick. Overlapping calls return immediately.
    pub async fn tick(&self) -> Result<()> {
        if self.tick_in_flight.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let outcome = self.tick_inner().await;
        self.tick_in_flight.store(false, Ordering::SeqCst);

        let mut stats = self.stats.lock().expect("trader stats mutex poisoned");
        stats.ticks += 1;
        stats.last_tick_at = Some(now_ms());
        match &outcome {
            Ok(actions) => {
                stats.actions += u64::from(*actions);
                stats.last_error = None;
            }
            Err(err) => stats.last_error = Some(format!("{err:#}")),
        }
        outcome.map(|_| ())
    }

    async fn tick_inner(&self) -> Result<u32> {
        let now = now_ms();
        let mut state = self.state.lock().await;

        // Keep-alive: resubscribe on a cadence, never fatal to the tick.
        if state.last_keepalive_ms == 0
            || now.saturating_sub(state.last_keepalive_ms) >= self.cfg.keepalive_interval_ms
        {
            let mut channels = self.cfg.channels.clone();
            channels.extend(state.swap_channels.iter().cloned());
            let timeout_ms = SUBSCRIBE_TIMEOUT_MS.min(self.cfg.tool_timeout_ms);
            match bounded(timeout_ms, self.bus.subscribe(&channels)).await {
                Ok(()) => state.last_keepalive_ms = now,
                Err(err) => {
                    self.trace("keepalive", "", format!("resubscribe failed: {err:#}"));
                }
            }
        }

        // Log tail: the only failure that aborts a tick.
        let tail = self
            .rpc(self.bus.log_read(state.last_seq, self.cfg.tail_limit))
            .await
            .context("tail event log")?;
        state.last_seq = state.last_seq.max(tail.latest_seq);
        state.window.extend(tail.events);
        let cutoff = now.saturating_sub(self.cfg.event_max_age_ms);
        state.window.retain(|e| e.ts >= cutoff);

        // Identity: local bus peer and chain signer.
        let info = bounded(IDENTITY_TIMEOUT_MS, self.bus.info())
            .await
            .context("resolve bus identity")?;
        anyhow::ensure!(
            info.peer == self.local_peer,
            "bus peer {} does not match signing key {}",
            info.peer,
            self.local_peer
        );
        if state.chain_signer.is_none() {
            let signer = bounded(IDENTITY_TIMEOUT_MS, self.chain.signer_pubkey())
                .await
                .context("resolve chain signer")?;
            state.chain_signer = Some(signer);
        }
        let chain_signer = state
            .chain_signer
            .clone()
            .expect("chain signer resolved above");

        let ctx = build_contexts(&state.window, &self.local_peer);
        for trade in ctx.trades.values() {
            if trade.is_terminal() {
                state.caches.forget_trade(&trade.trade_id);
            }
        }

        let mut actions_left = self.cfg.actions_per_tick;
        self.quote_from_offer(&mut state, &ctx, &mut actions_left)
            .await;
        self.accept_quote(&mut state, &ctx, &chain_signer, &mut actions_left)
            .await;
        self.invite_from_accept(&mut state, &ctx, &mut actions_left)
            .await;
        self.join_invite(&mut state, &ctx, &mut actions_left).await;
        self.settle_trades(&mut state, &ctx, &chain_signer, &mut actions_left)
            .await;

        state.caches.prune(now, self.cfg.event_max_age_ms);

        Ok(self.cfg.actions_per_tick - actions_left)
    }

    pub fn stats(&self) -> TraderStats {
        self.stats
            .lock()
            .expect("trader stats mutex poisoned")
            .clone()
    }

    pub fn trace_events(&self) -> Vec<TraceEvent> {
        self.trace
            .lock()
            .expect("trader trace mutex poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub(crate) fn trace(&self, scope: &'static str, trade_id: &str, detail: String) {
        let mut trace = self.trace.lock().expect("trader trace mutex poisoned");
        if trace.len() >= TRACE_CAPACITY {
            trace.pop_front();
        }
        trace.push_back(TraceEvent {
            ts: now_ms(),
            scope,
            trade_id: trade_id.to_string(),
            detail,
        });
    }

    /// Runs an external call under the configured tool timeout.
    pub(crate) async fn rpc<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        bounded(self.cfg.tool_timeout_ms, fut).await
    }

    /// Validates, signs, and publishes one envelope. Validation failures
    /// are surfaced without publishing.
    pub(crate) async fn publish_signed(
        &self,
        channel: &str,
        envelope: Envelope,
    ) -> Result<Envelope> {
        validate_envelope(&envelope)
            .map_err(|e| anyhow::anyhow!("refuse to publish invalid {}: {e}", envelope.kind))?;
        let signed = sign_envelope(&envelope, &self.keypair)
            .map_err(|e| anyhow::anyhow!("sign {} envelope: {e}", envelope.kind))?;
        self.rpc(self.bus.publish(channel, &signed))
            .await
            .with_context(|| format!("publish {} on {channel}", signed.kind))?;
        Ok(signed)
    }

    /// Exposes the folded contexts of the current window; test hook.
    pub async fn contexts(&self) -> Contexts {
        let state = self.state.lock().await;
        build_contexts(&state.window, &self.local_peer)
    }
}

async fn bounded<T>(timeout_ms: u64, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await {
        Ok(result) => result,
        Err(_) => anyhow::bail!("rpc timed out after {timeout_ms}ms"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_clamps_to_documented_bounds() {
        let cfg = AutoTraderConfig {
            interval_ms: 1,
            tool_timeout_ms: 10,
            actions_per_tick: 0,
            ..AutoTraderConfig::default()
        }
        .clamped();
        assert_eq!(cfg.interval_ms, 250);
        assert_eq!(cfg.tool_timeout_ms, 250);
        assert_eq!(cfg.actions_per_tick, 1);

        let cfg = AutoTraderConfig {
            interval_ms: 60_000,
            tool_timeout_ms: 600_000,
            ..AutoTraderConfig::default()
        }
        .clamped();
        assert_eq!(cfg.interval_ms, 10_000);
        assert_eq!(cfg.tool_timeout_ms, 120_000);
    }

    #[test]
    fn stage_keys_and_sig_prefix() {
        assert_eq!(stage_key("t-1", "ln_pay"), "t-1:ln_pay");
        assert_eq!(sig_prefix("abcdef0123456789"), "abcdef012345");
        assert_eq!(sig_prefix("short"), "short");
    }

    #[test]
    fn stage_lifecycle_gates_reentry() {
        let cfg = AutoTraderConfig::default();
        let mut caches = Caches::new(&cfg);
        let key = stage_key("t-1", "terms_post");

        assert!(caches.stage_ready(&key, 1_000));
        caches.stage_begin(&key, 1_000);
        assert!(!caches.stage_ready(&key, 1_000));

        caches.stage_failure(&key, 1_000, STAGE_COOLDOWN_MS);
        assert!(!caches.stage_ready(&key, 1_000));
        assert!(!caches.stage_ready(&key, 10_999));
        assert!(caches.stage_ready(&key, 11_000));

        caches.stage_begin(&key, 11_000);
        caches.stage_success(&key, 11_000);
        assert!(!caches.stage_ready(&key, 500_000));
    }
}
