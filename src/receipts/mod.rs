//! Durable per-trade receipts and listing locks.

pub mod store;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use store::SqliteReceiptsStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Maker,
    Taker,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Maker => "maker",
            Role::Taker => "taker",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeState {
    Init,
    Negotiating,
    Terms,
    Accepted,
    Invoice,
    Escrow,
    LnPaid,
    Claimed,
    Refunded,
    Canceled,
    Error,
}

impl TradeState {
    pub fn as_str(self) -> &'static str {
        match self {
            TradeState::Init => "init",
            TradeState::Negotiating => "negotiating",
            TradeState::Terms => "terms",
            TradeState::Accepted => "accepted",
            TradeState::Invoice => "invoice",
            TradeState::Escrow => "escrow",
            TradeState::LnPaid => "ln_paid",
            TradeState::Claimed => "claimed",
            TradeState::Refunded => "refunded",
            TradeState::Canceled => "canceled",
            TradeState::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TradeState::Claimed | TradeState::Refunded | TradeState::Canceled | TradeState::Error
        )
    }
}

/// One durable trade receipt row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeReceipt {
    pub trade_id: String,
    pub role: Option<Role>,
    pub rfq_channel: Option<String>,
    pub swap_channel: Option<String>,
    pub maker_peer: Option<String>,
    pub taker_peer: Option<String>,

    pub btc_sats: Option<u64>,
    pub usdt_amount: Option<String>,
    pub sol_mint: Option<String>,
    pub sol_recipient: Option<String>,
    pub sol_refund: Option<String>,
    pub platform_fee_bps: Option<u32>,
    pub trade_fee_bps: Option<u32>,
    pub trade_fee_collector: Option<String>,

    pub sol_escrow_pda: Option<String>,
    pub sol_vault_ata: Option<String>,
    pub sol_refund_after_unix: Option<u64>,

    pub ln_invoice_bolt11: Option<String>,
    pub ln_payment_hash_hex: Option<String>,
    pub ln_preimage_hex: Option<String>,

    pub state: TradeState,
    pub created_at: u64,
    pub updated_at: u64,
    pub last_error: Option<String>,
}

/// Three-state field patch: absent fields never clear, explicit `Clear`
/// writes NULL, `Set` overwrites.
#[derive(Debug, Clone)]
pub enum Patch<T> {
    Keep,
    Clear,
    Set(T),
}

impl<T> Default for Patch<T> {
    fn default() -> Self {
        Patch::Keep
    }
}

impl<T> Patch<T> {
    pub fn apply(self, slot: &mut Option<T>) {
        match self {
            Patch::Keep => {}
            Patch::Clear => *slot = None,
            Patch::Set(value) => *slot = Some(value),
        }
    }
}

impl<T> From<T> for Patch<T> {
    fn from(value: T) -> Self {
        Patch::Set(value)
    }
}

/// Partial update merged into a trade receipt by
/// [`SqliteReceiptsStore::upsert_trade`].
#[derive(Debug, Clone, Default)]
pub struct TradePatch {
    pub role: Option<Role>,
    pub state: Option<TradeState>,
    pub rfq_channel: Patch<String>,
    pub swap_channel: Patch<String>,
    pub maker_peer: Patch<String>,
    pub taker_peer: Patch<String>,
    pub btc_sats: Patch<u64>,
    pub usdt_amount: Patch<String>,
    pub sol_mint: Patch<String>,
    pub sol_recipient: Patch<String>,
    pub sol_refund: Patch<String>,
    pub platform_fee_bps: Patch<u32>,
    pub trade_fee_bps: Patch<u32>,
    pub trade_fee_collector: Patch<String>,
    pub sol_escrow_pda: Patch<String>,
    pub sol_vault_ata: Patch<String>,
    pub sol_refund_after_unix: Patch<u64>,
    pub ln_invoice_bolt11: Patch<String>,
    pub ln_payment_hash_hex: Patch<String>,
    pub ln_preimage_hex: Patch<String>,
    pub last_error: Patch<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingState {
    InFlight,
    Filled,
}

impl ListingState {
    pub fn as_str(self) -> &'static str {
        match self {
            ListingState::InFlight => "in_flight",
            ListingState::Filled => "filled",
        }
    }
}

/// Lock row preventing one offer line or RFQ from starting two trades.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingLock {
    pub listing_key: String,
    pub listing_type: String,
    pub listing_id: String,
    pub trade_id: String,
    pub state: ListingState,
    pub note: Option<String>,
    pub meta_json: Option<Value>,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ListingLockPatch {
    pub listing_type: Option<String>,
    pub listing_id: Option<String>,
    pub trade_id: Option<String>,
    pub state: Option<ListingState>,
    pub note: Patch<String>,
    pub meta_json: Patch<Value>,
}

/// Append-only per-trade event row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEvent {
    pub trade_id: String,
    pub ts: u64,
    pub kind: String,
    pub payload: Value,
}
