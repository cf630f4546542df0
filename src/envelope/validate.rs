//! Schema validation for the envelope taxonomy.
//!
//! Pure checks only: field presence and shape per kind, numeric ranges,
//! and cross-envelope consistency between a quote and the RFQ (or terms
//! and the quote) it references. Nothing here touches the network or the
//! store.

use super::{
    Body, Envelope, LnInvoiceBody, LnPaidBody, OfferLine, QuoteBody, RfqBody,
    SolEscrowCreatedBody, SvcAnnounceBody, SwapInviteBody, TermsBody,
};
use crate::bus::{SWAP_CHANNEL_PREFIX, is_valid_channel_name};

pub const MAX_PLATFORM_FEE_BPS: u32 = 500;
pub const MAX_TRADE_FEE_BPS: u32 = 1000;
pub const MAX_TOTAL_FEE_BPS: u32 = 1500;
/// Refund window bounds: one hour to seven days.
pub const MIN_REFUND_WINDOW_SEC: u64 = 3600;
pub const MAX_REFUND_WINDOW_SEC: u64 = 604_800;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidateError {
    #[error("missing or empty field: {0}")]
    Missing(&'static str),
    #[error("{field} out of range: {detail}")]
    Range { field: &'static str, detail: String },
    #[error("{field} must be lowercase 32-byte hex")]
    BadHex32 { field: &'static str },
    #[error("{field} must be a base-10 digit string")]
    BadDecimal { field: &'static str },
    #[error("invalid channel name: {0}")]
    BadChannel(String),
    #[error("{field} does not match the referenced envelope")]
    Mismatch { field: &'static str },
    #[error("fee ceiling exceeded: {0}")]
    FeeCeiling(&'static str),
    #[error("refund window outside the allowed overlap")]
    RefundWindow,
}

/// Validates one envelope against its kind's schema.
pub fn validate_envelope(envelope: &Envelope) -> Result<(), ValidateError> {
    // Listings are not trade-scoped; every other kind is.
    if envelope.trade_id.is_empty() && envelope.kind != super::Kind::SvcAnnounce {
        return Err(ValidateError::Missing("trade_id"));
    }
    if envelope.nonce.is_empty() {
        return Err(ValidateError::Missing("nonce"));
    }

    match &envelope.body {
        Body::Rfq(b) => validate_rfq(b),
        Body::Quote(b) => validate_quote(b),
        Body::QuoteAccept(b) => {
            require_id("rfq_id", &b.rfq_id)?;
            require_id("quote_id", &b.quote_id)
        }
        Body::SvcAnnounce(b) => validate_svc_announce(b),
        Body::SwapInvite(b) => validate_swap_invite(b),
        Body::Terms(b) => validate_terms(b),
        Body::Accept(b) => require_hex32("terms_hash", &b.terms_hash),
        Body::LnInvoice(b) => validate_ln_invoice(b),
        Body::SolEscrowCreated(b) => validate_escrow_created(b),
        Body::LnPaid(b) => validate_ln_paid(b),
        Body::SolClaimed(_) | Body::SolRefunded(_) | Body::Cancel(_) => Ok(()),
    }
}

fn validate_rfq(b: &RfqBody) -> Result<(), ValidateError> {
    require_id("pair", &b.pair)?;
    require_id("direction", &b.direction)?;
    require_id("app_hash", &b.app_hash)?;
    require_positive_sats(b.btc_sats)?;
    require_decimal("usdt_amount", &b.usdt_amount)?;
    require_fee_ceilings(
        b.max_platform_fee_bps,
        b.max_trade_fee_bps,
        b.max_total_fee_bps,
    )?;
    require_window_range(b.min_sol_refund_window_sec, b.max_sol_refund_window_sec)?;
    require_nonzero("valid_until_unix", b.valid_until_unix)
}

fn validate_quote(b: &QuoteBody) -> Result<(), ValidateError> {
    require_hex32("rfq_id", &b.rfq_id)?;
    require_id("pair", &b.pair)?;
    require_id("direction", &b.direction)?;
    require_id("app_hash", &b.app_hash)?;
    require_positive_sats(b.btc_sats)?;
    require_decimal("usdt_amount", &b.usdt_amount)?;
    require_fee_sum(b.platform_fee_bps, b.trade_fee_bps)?;
    require_id("trade_fee_collector", &b.trade_fee_collector)?;
    require_window("sol_refund_window_sec", b.sol_refund_window_sec)?;
    require_nonzero("valid_until_unix", b.valid_until_unix)
}

fn validate_svc_announce(b: &SvcAnnounceBody) -> Result<(), ValidateError> {
    require_id("name", &b.name)?;
    if b.pairs.is_empty() {
        return Err(ValidateError::Missing("pairs"));
    }
    if b.rfq_channels.is_empty() {
        return Err(ValidateError::Missing("rfq_channels"));
    }
    for channel in &b.rfq_channels {
        if !is_valid_channel_name(channel) {
            return Err(ValidateError::BadChannel(channel.clone()));
        }
    }
    if b.offers.is_empty() {
        return Err(ValidateError::Missing("offers"));
    }
    for line in &b.offers {
        validate_offer_line(line)?;
    }
    require_nonzero("valid_until_unix", b.valid_until_unix)
}

fn validate_offer_line(line: &OfferLine) -> Result<(), ValidateError> {
    require_positive_sats(line.btc_sats)?;
    require_decimal("usdt_amount", &line.usdt_amount)?;
    require_fee_ceilings(
        line.max_platform_fee_bps,
        line.max_trade_fee_bps,
        line.max_total_fee_bps,
    )?;
    require_window_range(
        line.min_sol_refund_window_sec,
        line.max_sol_refund_window_sec,
    )
}

fn validate_swap_invite(b: &SwapInviteBody) -> Result<(), ValidateError> {
    require_hex32("rfq_id", &b.rfq_id)?;
    require_hex32("quote_id", &b.quote_id)?;
    if !is_valid_channel_name(&b.swap_channel) || !b.swap_channel.starts_with(SWAP_CHANNEL_PREFIX)
    {
        return Err(ValidateError::BadChannel(b.swap_channel.clone()));
    }
    require_hex32("owner_pubkey", &b.owner_pubkey)?;
    require_id("invite_b64", &b.invite_b64)
}

fn validate_terms(b: &TermsBody) -> Result<(), ValidateError> {
    require_positive_sats(b.btc_sats)?;
    require_decimal("usdt_amount", &b.usdt_amount)?;
    require_id("sol_mint", &b.sol_mint)?;
    require_id("sol_recipient", &b.sol_recipient)?;
    require_id("sol_refund", &b.sol_refund)?;
    require_nonzero("sol_refund_after_unix", b.sol_refund_after_unix)?;
    require_hex32("ln_receiver_peer", &b.ln_receiver_peer)?;
    require_hex32("ln_payer_peer", &b.ln_payer_peer)?;
    require_id("trade_fee_collector", &b.trade_fee_collector)?;
    require_fee_sum(b.platform_fee_bps, b.trade_fee_bps)?;
    require_nonzero("terms_valid_until_unix", b.terms_valid_until_unix)
}

fn validate_ln_invoice(b: &LnInvoiceBody) -> Result<(), ValidateError> {
    require_id("bolt11", &b.bolt11)?;
    require_hex32("payment_hash_hex", &b.payment_hash_hex)
}

fn validate_escrow_created(b: &SolEscrowCreatedBody) -> Result<(), ValidateError> {
    require_id("escrow_pda", &b.escrow_pda)?;
    require_id("vault_ata", &b.vault_ata)?;
    require_hex32("payment_hash_hex", &b.payment_hash_hex)?;
    require_nonzero("net_amount", b.net_amount)?;
    require_nonzero("refund_after_unix", b.refund_after_unix)?;
    require_id("tx_sig", &b.tx_sig)
}

fn validate_ln_paid(b: &LnPaidBody) -> Result<(), ValidateError> {
    require_hex32("payment_hash_hex", &b.payment_hash_hex)?;
    require_hex32("preimage_hex", &b.preimage_hex)
}

/// Cross-envelope consistency: a quote must restate the RFQ economics and
/// respect its ceilings and window.
pub fn validate_quote_against_rfq(quote: &QuoteBody, rfq: &RfqBody) -> Result<(), ValidateError> {
    if quote.pair != rfq.pair {
        return Err(ValidateError::Mismatch { field: "pair" });
    }
    if quote.direction != rfq.direction {
        return Err(ValidateError::Mismatch { field: "direction" });
    }
    if quote.app_hash != rfq.app_hash {
        return Err(ValidateError::Mismatch { field: "app_hash" });
    }
    if quote.btc_sats != rfq.btc_sats {
        return Err(ValidateError::Mismatch { field: "btc_sats" });
    }
    if quote.usdt_amount != rfq.usdt_amount {
        return Err(ValidateError::Mismatch {
            field: "usdt_amount",
        });
    }
    if quote.platform_fee_bps > rfq.max_platform_fee_bps {
        return Err(ValidateError::FeeCeiling("platform_fee_bps"));
    }
    if quote.trade_fee_bps > rfq.max_trade_fee_bps {
        return Err(ValidateError::FeeCeiling("trade_fee_bps"));
    }
    if quote.platform_fee_bps + quote.trade_fee_bps > rfq.max_total_fee_bps {
        return Err(ValidateError::FeeCeiling("total_fee_bps"));
    }
    if quote.sol_refund_window_sec < rfq.min_sol_refund_window_sec
        || quote.sol_refund_window_sec > rfq.max_sol_refund_window_sec
    {
        return Err(ValidateError::RefundWindow);
    }
    Ok(())
}

/// Cross-envelope consistency: terms must restate the accepted quote.
pub fn validate_terms_against_quote(
    terms: &TermsBody,
    quote: &QuoteBody,
) -> Result<(), ValidateError> {
    if terms.btc_sats != quote.btc_sats {
        return Err(ValidateError::Mismatch { field: "btc_sats" });
    }
    if terms.usdt_amount != quote.usdt_amount {
        return Err(ValidateError::Mismatch {
            field: "usdt_amount",
        });
    }
    if terms.platform_fee_bps != quote.platform_fee_bps {
        return Err(ValidateError::Mismatch {
            field: "platform_fee_bps",
        });
    }
    if terms.trade_fee_bps != quote.trade_fee_bps {
        return Err(ValidateError::Mismatch {
            field: "trade_fee_bps",
        });
    }
    if terms.trade_fee_collector != quote.trade_fee_collector {
        return Err(ValidateError::Mismatch {
            field: "trade_fee_collector",
        });
    }
    Ok(())
}

pub fn is_hex32(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn require_id(field: &'static str, value: &str) -> Result<(), ValidateError> {
    if value.is_empty() {
        return Err(ValidateError::Missing(field));
    }
    Ok(())
}

fn require_hex32(field: &'static str, value: &str) -> Result<(), ValidateError> {
    if !is_hex32(value) {
        return Err(ValidateError::BadHex32 { field });
    }
    Ok(())
}

fn require_decimal(field: &'static str, value: &str) -> Result<(), ValidateError> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ValidateError::BadDecimal { field });
    }
    Ok(())
}

fn require_positive_sats(sats: u64) -> Result<(), ValidateError> {
    if sats == 0 {
        return Err(ValidateError::Range {
            field: "btc_sats",
            detail: "must be >= 1".to_string(),
        });
    }
    Ok(())
}

fn require_nonzero(field: &'static str, value: u64) -> Result<(), ValidateError> {
    if value == 0 {
        return Err(ValidateError::Missing(field));
    }
    Ok(())
}

fn require_window(field: &'static str, window_sec: u64) -> Result<(), ValidateError> {
    if !(MIN_REFUND_WINDOW_SEC..=MAX_REFUND_WINDOW_SEC).contains(&window_sec) {
        return Err(ValidateError::Range {
            field,
            detail: format!(
                "must be within [{MIN_REFUND_WINDOW_SEC}, {MAX_REFUND_WINDOW_SEC}], got {window_sec}"
            ),
        });
    }
    Ok(())
}

fn require_window_range(min_sec: u64, max_sec: u64) -> Result<(), ValidateError> {
    require_window("min_sol_refund_window_sec", min_sec)?;
    require_window("max_sol_refund_window_sec", max_sec)?;
    if min_sec > max_sec {
        return Err(ValidateError::Range {
            field: "min_sol_refund_window_sec",
            detail: format!("min {min_sec} exceeds max {max_sec}"),
        });
    }
    Ok(())
}

fn require_fee_ceilings(
    platform_bps: u32,
    trade_bps: u32,
    total_bps: u32,
) -> Result<(), ValidateError> {
    if platform_bps > MAX_PLATFORM_FEE_BPS {
        return Err(ValidateError::Range {
            field: "max_platform_fee_bps",
            detail: format!("must be <= {MAX_PLATFORM_FEE_BPS}, got {platform_bps}"),
        });
    }
    if trade_bps > MAX_TRADE_FEE_BPS {
        return Err(ValidateError::Range {
            field: "max_trade_fee_bps",
            detail: format!("must be <= {MAX_TRADE_FEE_BPS}, got {trade_bps}"),
        });
    }
    if total_bps > MAX_TOTAL_FEE_BPS {
        return Err(ValidateError::Range {
            field: "max_total_fee_bps",
            detail: format!("must be <= {MAX_TOTAL_FEE_BPS}, got {total_bps}"),
        });
    }
    Ok(())
}

fn require_fee_sum(platform_bps: u32, trade_bps: u32) -> Result<(), ValidateError> {
    if platform_bps + trade_bps > MAX_TOTAL_FEE_BPS {
        return Err(ValidateError::FeeCeiling("total_fee_bps"));
    }
    Ok(())
}
