//! Folds the sidechannel log tail into per-trade contexts.
//!
//! The fold is pure: given the same window of events and the same local
//! peer key it always produces the same contexts, which is what makes
//! restart recovery a re-read of the tail. Only envelopes that parse and
//! verify participate; everything else is counted and skipped.

use std::collections::{HashMap, HashSet};

use crate::bus::{BusEvent, SWAP_CHANNEL_PREFIX};
use crate::envelope::sign::verify_envelope;
use crate::envelope::{Envelope, Kind};

/// One verified envelope as observed on the log, with its content ID.
#[derive(Debug, Clone)]
pub struct SeenEnvelope {
    pub seq: u64,
    pub ts: u64,
    pub channel: String,
    pub envelope_id: String,
    /// Signed by the local peer.
    pub local: bool,
    pub envelope: Envelope,
}

impl SeenEnvelope {
    pub fn signer(&self) -> &str {
        self.envelope.signer.as_deref().unwrap_or_default()
    }

    pub fn sig(&self) -> &str {
        self.envelope.sig.as_deref().unwrap_or_default()
    }
}

/// First-seen negotiation envelopes for one trade, on the RFQ channel.
#[derive(Debug, Clone, Default)]
pub struct Negotiation {
    pub trade_id: String,
    pub rfq: Option<SeenEnvelope>,
    pub quote: Option<SeenEnvelope>,
    pub quote_accept: Option<SeenEnvelope>,
    pub swap_invite: Option<SeenEnvelope>,
    pub swap_channel: Option<String>,
}

/// First-seen settlement envelopes on one `swap:` channel.
#[derive(Debug, Clone, Default)]
pub struct TradeContext {
    pub trade_id: String,
    pub channel: String,
    pub terms: Option<SeenEnvelope>,
    pub accept: Option<SeenEnvelope>,
    pub invoice: Option<SeenEnvelope>,
    pub escrow: Option<SeenEnvelope>,
    pub ln_paid: Option<SeenEnvelope>,
    pub claimed: Option<SeenEnvelope>,
    pub refunded: Option<SeenEnvelope>,
    pub canceled: Option<SeenEnvelope>,
    pub last_ts: u64,
}

impl TradeContext {
    /// Terminal trades are excluded from further driver work.
    pub fn is_terminal(&self) -> bool {
        self.claimed.is_some() || self.refunded.is_some() || self.canceled.is_some()
    }
}

#[derive(Debug, Default)]
pub struct Contexts {
    /// Trades whose RFQ this peer published.
    pub my_rfq_trade_ids: HashSet<String>,
    /// Local quotes keyed by envelope ID.
    pub my_quote_by_id: HashMap<String, SeenEnvelope>,
    /// Non-local quotes.
    pub quote_events: Vec<SeenEnvelope>,
    /// Non-local RFQs.
    pub rfq_events: Vec<SeenEnvelope>,
    /// All offer announcements, local and remote.
    pub offers: Vec<SeenEnvelope>,
    /// Non-local quote accepts.
    pub accepts: Vec<SeenEnvelope>,
    /// Non-local swap invites.
    pub invites: Vec<SeenEnvelope>,
    pub negotiations: HashMap<String, Negotiation>,
    /// Settlement contexts keyed by swap channel name.
    pub trades: HashMap<String, TradeContext>,
    /// Events dropped for parse or signature failures.
    pub skipped: usize,
}

impl Contexts {
    pub fn negotiation(&self, trade_id: &str) -> Option<&Negotiation> {
        self.negotiations.get(trade_id)
    }

    pub fn trade_by_id(&self, trade_id: &str) -> Option<&TradeContext> {
        self.trades.values().find(|t| t.trade_id == trade_id)
    }
}

/// Builds contexts from a window of bus events.
pub fn build_contexts(events: &[BusEvent], local_peer: &str) -> Contexts {
    let mut ctx = Contexts::default();

    let mut ordered: Vec<&BusEvent> = events.iter().collect();
    ordered.sort_by_key(|e| e.seq);

    for event in ordered {
        let envelope: Envelope = match serde_json::from_value(event.message.clone()) {
            Ok(env) => env,
            Err(err) => {
                tracing::debug!(seq = event.seq, error = %err, "skip unparseable bus event");
                ctx.skipped += 1;
                continue;
            }
        };
        if let Err(err) = verify_envelope(&envelope) {
            tracing::debug!(seq = event.seq, error = %err, "skip unverifiable envelope");
            ctx.skipped += 1;
            continue;
        }
        let envelope_id = match envelope.envelope_id() {
            Ok(id) => id,
            Err(err) => {
                tracing::debug!(seq = event.seq, error = %err, "skip unhashable envelope");
                ctx.skipped += 1;
                continue;
            }
        };

        let local = envelope.signer.as_deref() == Some(local_peer);
        let seen = SeenEnvelope {
            seq: event.seq,
            ts: event.ts,
            channel: event.channel.clone(),
            envelope_id,
            local,
            envelope,
        };

        match seen.envelope.kind {
            Kind::Rfq => {
                if local {
                    ctx.my_rfq_trade_ids
                        .insert(seen.envelope.trade_id.clone());
                } else {
                    ctx.rfq_events.push(seen.clone());
                }
                negotiation_slot(&mut ctx, &seen.envelope.trade_id).rfq.get_or_insert(seen);
            }
            Kind::Quote => {
                if local {
                    ctx.my_quote_by_id
                        .insert(seen.envelope_id.clone(), seen.clone());
                } else {
                    ctx.quote_events.push(seen.clone());
                }
                negotiation_slot(&mut ctx, &seen.envelope.trade_id)
                    .quote
                    .get_or_insert(seen);
            }
            Kind::QuoteAccept => {
                if !local {
                    ctx.accepts.push(seen.clone());
                }
                negotiation_slot(&mut ctx, &seen.envelope.trade_id)
                    .quote_accept
                    .get_or_insert(seen);
            }
            Kind::SvcAnnounce => {
                ctx.offers.push(seen);
            }
            Kind::SwapInvite => {
                if !local {
                    ctx.invites.push(seen.clone());
                }
                let negotiation = negotiation_slot(&mut ctx, &seen.envelope.trade_id);
                if negotiation.swap_invite.is_none() {
                    if let crate::envelope::Body::SwapInvite(body) = &seen.envelope.body {
                        negotiation.swap_channel = Some(body.swap_channel.clone());
                    }
                    negotiation.swap_invite = Some(seen);
                }
            }
            Kind::Terms
            | Kind::Accept
            | Kind::LnInvoice
            | Kind::SolEscrowCreated
            | Kind::LnPaid
            | Kind::SolClaimed
            | Kind::SolRefunded
            | Kind::Cancel => {
                if !seen.channel.starts_with(SWAP_CHANNEL_PREFIX) {
                    continue;
                }
                let trade = ctx
                    .trades
                    .entry(seen.channel.clone())
                    .or_insert_with(|| TradeContext {
                        trade_id: seen.envelope.trade_id.clone(),
                        channel: seen.channel.clone(),
                        ..TradeContext::default()
                    });
                trade.last_ts = trade.last_ts.max(seen.ts);
                let slot = match seen.envelope.kind {
                    Kind::Terms => &mut trade.terms,
                    Kind::Accept => &mut trade.accept,
                    Kind::LnInvoice => &mut trade.invoice,
                    Kind::SolEscrowCreated => &mut trade.escrow,
                    Kind::LnPaid => &mut trade.ln_paid,
                    Kind::SolClaimed => &mut trade.claimed,
                    Kind::SolRefunded => &mut trade.refunded,
                    Kind::Cancel => &mut trade.canceled,
                    _ => unreachable!("settlement kinds handled above"),
                };
                slot.get_or_insert(seen);
            }
        }
    }

    ctx
}

fn negotiation_slot<'a>(ctx: &'a mut Contexts, trade_id: &str) -> &'a mut Negotiation {
    ctx.negotiations
        .entry(trade_id.to_string())
        .or_insert_with(|| Negotiation {
            trade_id: trade_id.to_string(),
            ..Negotiation::default()
        })
}
