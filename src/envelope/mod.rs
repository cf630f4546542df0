//! Signed-envelope protocol messages.
//!
//! Every protocol message is an [`Envelope`]: a versioned, kind-tagged,
//! trade-scoped record with a kind-specific body. The envelope ID is the
//! BLAKE2b-256 digest of the canonical serialization of the *unsigned*
//! envelope; the same bytes are what [`sign`](crate::envelope::sign) signs.

pub mod canonical;
pub mod sign;
pub mod validate;

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::now_ms;

/// Wire protocol version carried in `v`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Envelope kinds, in negotiation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Rfq,
    Quote,
    QuoteAccept,
    SvcAnnounce,
    SwapInvite,
    Terms,
    Accept,
    LnInvoice,
    SolEscrowCreated,
    LnPaid,
    SolClaimed,
    SolRefunded,
    Cancel,
}

impl Kind {
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Rfq => "rfq",
            Kind::Quote => "quote",
            Kind::QuoteAccept => "quote_accept",
            Kind::SvcAnnounce => "svc_announce",
            Kind::SwapInvite => "swap_invite",
            Kind::Terms => "terms",
            Kind::Accept => "accept",
            Kind::LnInvoice => "ln_invoice",
            Kind::SolEscrowCreated => "sol_escrow_created",
            Kind::LnPaid => "ln_paid",
            Kind::SolClaimed => "sol_claimed",
            Kind::SolRefunded => "sol_refunded",
            Kind::Cancel => "cancel",
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request-for-quote published by a taker on an RFQ channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RfqBody {
    pub pair: String,
    pub direction: String,
    pub app_hash: String,
    pub btc_sats: u64,
    /// Token amount in base units, as a base-10 digit string.
    pub usdt_amount: String,
    pub max_platform_fee_bps: u32,
    pub max_trade_fee_bps: u32,
    pub max_total_fee_bps: u32,
    pub min_sol_refund_window_sec: u64,
    pub max_sol_refund_window_sec: u64,
    /// Taker's chain signer, so the maker can address the escrow to it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sol_recipient: Option<String>,
    pub valid_until_unix: u64,
}

/// Maker's quote for an RFQ, optionally tied to an advertised offer line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuoteBody {
    pub rfq_id: String,
    pub pair: String,
    pub direction: String,
    pub app_hash: String,
    pub btc_sats: u64,
    pub usdt_amount: String,
    pub platform_fee_bps: u32,
    pub trade_fee_bps: u32,
    pub trade_fee_collector: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer_line_index: Option<u32>,
    pub sol_refund_window_sec: u64,
    pub valid_until_unix: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuoteAcceptBody {
    pub rfq_id: String,
    pub quote_id: String,
    /// Taker's chain signer if not already carried on the RFQ.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sol_recipient: Option<String>,
}

/// One advertised price point inside an offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OfferLine {
    pub btc_sats: u64,
    pub usdt_amount: String,
    pub max_platform_fee_bps: u32,
    pub max_trade_fee_bps: u32,
    pub max_total_fee_bps: u32,
    pub min_sol_refund_window_sec: u64,
    pub max_sol_refund_window_sec: u64,
}

/// Maker service announcement (offer listing).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SvcAnnounceBody {
    pub name: String,
    pub pairs: Vec<String>,
    pub rfq_channels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub offers: Vec<OfferLine>,
    pub valid_until_unix: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SwapInviteBody {
    pub rfq_id: String,
    pub quote_id: String,
    pub swap_channel: String,
    pub owner_pubkey: String,
    pub invite_b64: String,
}

/// Final economic terms posted by the maker on the swap channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TermsBody {
    pub btc_sats: u64,
    pub usdt_amount: String,
    pub sol_mint: String,
    pub sol_recipient: String,
    pub sol_refund: String,
    pub sol_refund_after_unix: u64,
    pub ln_receiver_peer: String,
    pub ln_payer_peer: String,
    pub trade_fee_collector: String,
    pub platform_fee_bps: u32,
    pub trade_fee_bps: u32,
    pub terms_valid_until_unix: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AcceptBody {
    pub terms_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LnInvoiceBody {
    pub bolt11: String,
    pub payment_hash_hex: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SolEscrowCreatedBody {
    pub escrow_pda: String,
    pub vault_ata: String,
    pub payment_hash_hex: String,
    pub net_amount: u64,
    pub fee_amount: u64,
    pub refund_after_unix: u64,
    pub tx_sig: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LnPaidBody {
    pub payment_hash_hex: String,
    pub preimage_hex: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SolClaimedBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_hash_hex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_sig: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SolRefundedBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_hash_hex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_sig: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CancelBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Kind-specific envelope body.
///
/// Serialization is untagged; the envelope's `kind` field carries the
/// discriminant, and deserialization dispatches on it explicitly.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Body {
    Rfq(RfqBody),
    Quote(QuoteBody),
    QuoteAccept(QuoteAcceptBody),
    SvcAnnounce(SvcAnnounceBody),
    SwapInvite(SwapInviteBody),
    Terms(TermsBody),
    Accept(AcceptBody),
    LnInvoice(LnInvoiceBody),
    SolEscrowCreated(SolEscrowCreatedBody),
    LnPaid(LnPaidBody),
    SolClaimed(SolClaimedBody),
    SolRefunded(SolRefundedBody),
    Cancel(CancelBody),
}

impl Body {
    pub fn kind(&self) -> Kind {
        match self {
            Body::Rfq(_) => Kind::Rfq,
            Body::Quote(_) => Kind::Quote,
            Body::QuoteAccept(_) => Kind::QuoteAccept,
            Body::SvcAnnounce(_) => Kind::SvcAnnounce,
            Body::SwapInvite(_) => Kind::SwapInvite,
            Body::Terms(_) => Kind::Terms,
            Body::Accept(_) => Kind::Accept,
            Body::LnInvoice(_) => Kind::LnInvoice,
            Body::SolEscrowCreated(_) => Kind::SolEscrowCreated,
            Body::LnPaid(_) => Kind::LnPaid,
            Body::SolClaimed(_) => Kind::SolClaimed,
            Body::SolRefunded(_) => Kind::SolRefunded,
            Body::Cancel(_) => Kind::Cancel,
        }
    }

    fn from_value(kind: Kind, value: Value) -> serde_json::Result<Self> {
        Ok(match kind {
            Kind::Rfq => Body::Rfq(serde_json::from_value(value)?),
            Kind::Quote => Body::Quote(serde_json::from_value(value)?),
            Kind::QuoteAccept => Body::QuoteAccept(serde_json::from_value(value)?),
            Kind::SvcAnnounce => Body::SvcAnnounce(serde_json::from_value(value)?),
            Kind::SwapInvite => Body::SwapInvite(serde_json::from_value(value)?),
            Kind::Terms => Body::Terms(serde_json::from_value(value)?),
            Kind::Accept => Body::Accept(serde_json::from_value(value)?),
            Kind::LnInvoice => Body::LnInvoice(serde_json::from_value(value)?),
            Kind::SolEscrowCreated => Body::SolEscrowCreated(serde_json::from_value(value)?),
            Kind::LnPaid => Body::LnPaid(serde_json::from_value(value)?),
            Kind::SolClaimed => Body::SolClaimed(serde_json::from_value(value)?),
            Kind::SolRefunded => Body::SolRefunded(serde_json::from_value(value)?),
            Kind::Cancel => Body::Cancel(serde_json::from_value(value)?),
        })
    }
}

/// One protocol message.
///
/// `(signer, nonce, trade_id)` uniquely identifies an envelope; `ts` is
/// advisory only. `signer`/`sig` are absent until [`sign`] attaches them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub v: u32,
    pub kind: Kind,
    pub trade_id: String,
    pub body: Body,
    pub ts: u64,
    pub nonce: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEnvelope {
    v: u32,
    kind: Kind,
    trade_id: String,
    body: Value,
    ts: u64,
    nonce: String,
    #[serde(default)]
    signer: Option<String>,
    #[serde(default)]
    sig: Option<String>,
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawEnvelope::deserialize(deserializer)?;
        let body = Body::from_value(raw.kind, raw.body).map_err(serde::de::Error::custom)?;
        Ok(Envelope {
            v: raw.v,
            kind: raw.kind,
            trade_id: raw.trade_id,
            body,
            ts: raw.ts,
            nonce: raw.nonce,
            signer: raw.signer,
            sig: raw.sig,
        })
    }
}

impl Envelope {
    /// Builds a fresh unsigned envelope with the current timestamp and a
    /// random nonce.
    pub fn unsigned(trade_id: impl Into<String>, body: Body) -> Self {
        Envelope {
            v: PROTOCOL_VERSION,
            kind: body.kind(),
            trade_id: trade_id.into(),
            body,
            ts: now_ms(),
            nonce: short_nonce(),
            signer: None,
            sig: None,
        }
    }

    /// JSON value of the envelope exactly as serialized.
    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).context("serialize envelope")
    }

    /// JSON value of the envelope with `sig` and `signer` removed.
    pub fn unsigned_value(&self) -> Result<Value> {
        let mut value = self.to_value()?;
        if let Value::Object(map) = &mut value {
            map.remove("sig");
            map.remove("signer");
        }
        Ok(value)
    }

    /// Canonical bytes of the unsigned projection (the signing payload).
    pub fn unsigned_canonical_bytes(&self) -> Result<Vec<u8>> {
        Ok(canonical::canonical_bytes(&self.unsigned_value()?))
    }

    /// Content-derived envelope ID: BLAKE2b-256 of the unsigned canonical
    /// form, as lowercase hex. Used as `rfq_id`, `quote_id`, `terms_hash`.
    pub fn envelope_id(&self) -> Result<String> {
        Ok(canonical::canonical_digest_hex(&self.unsigned_value()?))
    }
}

fn short_nonce() -> String {
    let simple = uuid::Uuid::new_v4().simple().to_string();
    simple[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rfq() -> Envelope {
        Envelope::unsigned(
            "trade-1",
            Body::Rfq(RfqBody {
                pair: "BTC/USDT".to_string(),
                direction: "btc_to_token".to_string(),
                app_hash: "app-1".to_string(),
                btc_sats: 1000,
                usdt_amount: "670000".to_string(),
                max_platform_fee_bps: 500,
                max_trade_fee_bps: 1000,
                max_total_fee_bps: 1500,
                min_sol_refund_window_sec: 3600,
                max_sol_refund_window_sec: 604800,
                sol_recipient: None,
                valid_until_unix: 2_000_000_000,
            }),
        )
    }

    #[test]
    fn kind_round_trips_through_serde() {
        for kind in [
            Kind::Rfq,
            Kind::QuoteAccept,
            Kind::SvcAnnounce,
            Kind::SolEscrowCreated,
            Kind::LnPaid,
            Kind::Cancel,
        ] {
            let s = serde_json::to_string(&kind).expect("serialize kind");
            assert_eq!(s, format!("\"{}\"", kind.as_str()));
            let back: Kind = serde_json::from_str(&s).expect("parse kind");
            assert_eq!(back, kind);
        }
    }

    #[test]
    fn envelope_parses_back_to_same_value() {
        let env = sample_rfq();
        let bytes = env.unsigned_canonical_bytes().expect("canonical bytes");
        let parsed: Envelope = serde_json::from_slice(&bytes).expect("parse envelope");
        assert_eq!(parsed, env);
        assert_eq!(
            parsed.unsigned_canonical_bytes().expect("reparse bytes"),
            bytes
        );
    }

    #[test]
    fn body_dispatch_rejects_mismatched_kind() {
        let env = sample_rfq();
        let mut value = env.to_value().expect("to value");
        value["kind"] = serde_json::json!("accept");
        let parsed: Result<Envelope, _> = serde_json::from_value(value);
        assert!(parsed.is_err());
    }

    #[test]
    fn unknown_body_fields_are_rejected() {
        let env = sample_rfq();
        let mut value = env.to_value().expect("to value");
        value["body"]["surprise"] = serde_json::json!(1);
        let parsed: Result<Envelope, _> = serde_json::from_value(value);
        assert!(parsed.is_err());
    }

    #[test]
    fn envelope_id_ignores_signature_fields() {
        let mut env = sample_rfq();
        let id = env.envelope_id().expect("id");
        env.signer = Some("ab".repeat(32));
        env.sig = Some("cd".repeat(64));
        assert_eq!(env.envelope_id().expect("id with sig"), id);
    }

    #[test]
    fn nonce_is_short_and_fresh() {
        let a = sample_rfq();
        let b = sample_rfq();
        assert_eq!(a.nonce.len(), 16);
        assert_ne!(a.nonce, b.nonce);
    }
}
