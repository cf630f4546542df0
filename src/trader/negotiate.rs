//! Negotiation pipelines: quote-from-offer, accept-quote,
//! invite-from-accept, and join-invite.
//!
//! Each pipeline keeps its own signature dedupe set and event retry map.
//! Beyond the in-memory sets, every pipeline first checks the observable
//! log state (an existing quote, accept, or invite), so replays after a
//! restart never publish twice.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::json;
use uuid::Uuid;

use super::{AutoTrader, DriverState};
use crate::clock::{now_ms, now_unix};
use crate::context::{Contexts, SeenEnvelope};
use crate::envelope::validate::validate_quote_against_rfq;
use crate::envelope::{Body, Envelope, OfferLine, QuoteAcceptBody, QuoteBody, RfqBody};
use crate::receipts::{ListingLockPatch, ListingState, Patch, Role, SqliteReceiptsStore, TradePatch, TradeState};

/// Default escrow refund window quoted when the overlap allows it: 72h.
const PREFERRED_REFUND_WINDOW_SEC: u64 = 259_200;

struct OfferMatch<'a> {
    offer: &'a SeenEnvelope,
    line_index: u32,
    refund_window_sec: u64,
}

impl AutoTrader {
    /// Maker: quote every fresh, matching, unlocked RFQ.
    pub(crate) async fn quote_from_offer(
        &self,
        state: &mut DriverState,
        ctx: &Contexts,
        actions_left: &mut u32,
    ) {
        let now = now_ms();
        let now_sec = now_unix();

        for rfq_ev in &ctx.rfq_events {
            if *actions_left == 0 {
                return;
            }
            let sig = rfq_ev.sig().to_string();
            if sig.is_empty()
                || state.caches.quoted_rfq_sig.contains(&sig)
                || !state.caches.event_ready(&sig, now)
            {
                continue;
            }
            let Body::Rfq(rfq) = &rfq_ev.envelope.body else {
                continue;
            };
            if rfq.valid_until_unix <= now_sec {
                continue;
            }
            let trade_id = rfq_ev.envelope.trade_id.clone();
            if ctx
                .negotiation(&trade_id)
                .is_some_and(|n| n.quote.is_some())
            {
                // Someone (possibly us, before a restart) already quoted.
                state.caches.quoted_rfq_sig.insert(&sig, now);
                continue;
            }
            if self.cfg.platform_fee_bps > rfq.max_platform_fee_bps
                || self.cfg.trade_fee_bps > rfq.max_trade_fee_bps
                || self.cfg.platform_fee_bps + self.cfg.trade_fee_bps > rfq.max_total_fee_bps
            {
                continue;
            }
            let Some(matched) = match_offer_for_rfq(ctx, rfq, now_sec) else {
                continue;
            };

            let listing_key = format!("offer:{}:{}", matched.offer.envelope_id, matched.line_index);
            if self.listing_locked(&listing_key) {
                continue;
            }

            *actions_left -= 1;
            let quote = QuoteBody {
                rfq_id: rfq_ev.envelope_id.clone(),
                pair: rfq.pair.clone(),
                direction: rfq.direction.clone(),
                app_hash: rfq.app_hash.clone(),
                btc_sats: rfq.btc_sats,
                usdt_amount: rfq.usdt_amount.clone(),
                platform_fee_bps: self.cfg.platform_fee_bps,
                trade_fee_bps: self.cfg.trade_fee_bps,
                trade_fee_collector: self.cfg.trade_fee_collector.clone(),
                offer_id: Some(matched.offer.envelope_id.clone()),
                offer_line_index: Some(matched.line_index),
                sol_refund_window_sec: matched.refund_window_sec,
                valid_until_unix: now_sec + self.cfg.quote_ttl_sec,
            };
            let envelope = Envelope::unsigned(trade_id.clone(), Body::Quote(quote));

            match self.publish_signed(&rfq_ev.channel, envelope).await {
                Ok(signed) => {
                    state.caches.quoted_rfq_sig.insert(&sig, now);
                    let quote_id = signed.envelope_id().unwrap_or_default();
                    self.store_write(|store| {
                        store.upsert_listing_lock(
                            &listing_key,
                            ListingLockPatch {
                                listing_type: Some("offer".to_string()),
                                listing_id: Some(matched.offer.envelope_id.clone()),
                                trade_id: Some(trade_id.clone()),
                                state: Some(ListingState::InFlight),
                                ..ListingLockPatch::default()
                            },
                        )?;
                        store.upsert_trade(
                            &trade_id,
                            TradePatch {
                                role: Some(Role::Maker),
                                state: Some(TradeState::Negotiating),
                                rfq_channel: Patch::Set(rfq_ev.channel.clone()),
                                taker_peer: Patch::Set(rfq_ev.signer().to_string()),
                                btc_sats: Patch::Set(rfq.btc_sats),
                                usdt_amount: Patch::Set(rfq.usdt_amount.clone()),
                                platform_fee_bps: Patch::Set(self.cfg.platform_fee_bps),
                                trade_fee_bps: Patch::Set(self.cfg.trade_fee_bps),
                                trade_fee_collector: Patch::Set(
                                    self.cfg.trade_fee_collector.clone(),
                                ),
                                ..TradePatch::default()
                            },
                        )?;
                        store.append_event(
                            &trade_id,
                            "auto_quote",
                            &json!({"rfq_id": rfq_ev.envelope_id, "quote_id": quote_id}),
                            None,
                        )
                    });
                    self.trace(
                        "quote_from_offer",
                        &trade_id,
                        format!("quoted rfq sig={}", super::sig_prefix(&sig)),
                    );
                }
                Err(err) => {
                    state.caches.event_failure(&sig, now);
                    self.trace(
                        "quote_from_offer",
                        &trade_id,
                        format!("quote failed: {err:#}"),
                    );
                }
            }
        }
    }

    /// Taker: accept exactly one quote per own RFQ.
    pub(crate) async fn accept_quote(
        &self,
        state: &mut DriverState,
        ctx: &Contexts,
        chain_signer: &str,
        actions_left: &mut u32,
    ) {
        let now = now_ms();
        let now_sec = now_unix();

        for quote_ev in &ctx.quote_events {
            if *actions_left == 0 {
                return;
            }
            let trade_id = quote_ev.envelope.trade_id.clone();
            if !ctx.my_rfq_trade_ids.contains(&trade_id) {
                continue;
            }
            let sig = quote_ev.sig().to_string();
            if sig.is_empty() || state.caches.accepted_quote_sig.contains(&sig) {
                continue;
            }
            if state.caches.accepted_trade_lock.contains(&trade_id) {
                // A quote for this RFQ was already accepted this session.
                state.caches.accepted_quote_sig.insert(&sig, now);
                continue;
            }
            if !state.caches.event_ready(&sig, now) {
                continue;
            }
            let negotiation = ctx.negotiation(&trade_id);
            if negotiation.is_some_and(|n| n.quote_accept.is_some()) {
                state.caches.accepted_quote_sig.insert(&sig, now);
                state.caches.accepted_trade_lock.insert(&trade_id, now, now);
                continue;
            }
            if self.trade_is_terminal(&trade_id) {
                continue;
            }
            let Body::Quote(quote) = &quote_ev.envelope.body else {
                continue;
            };
            if quote.valid_until_unix <= now_sec {
                continue;
            }
            let Some(Body::Rfq(rfq)) = negotiation
                .and_then(|n| n.rfq.as_ref())
                .map(|r| &r.envelope.body)
            else {
                continue;
            };
            if rfq.valid_until_unix <= now_sec {
                continue;
            }
            if let Err(err) = validate_quote_against_rfq(quote, rfq) {
                // A nonconforming quote is never accepted; remember it.
                state.caches.accepted_quote_sig.insert(&sig, now);
                self.trace(
                    "accept_quote",
                    &trade_id,
                    format!("rejected quote sig={}: {err}", super::sig_prefix(&sig)),
                );
                continue;
            }

            *actions_left -= 1;
            let accept = QuoteAcceptBody {
                rfq_id: quote.rfq_id.clone(),
                quote_id: quote_ev.envelope_id.clone(),
                sol_recipient: Some(chain_signer.to_string()),
            };
            let envelope = Envelope::unsigned(trade_id.clone(), Body::QuoteAccept(accept));

            match self.publish_signed(&quote_ev.channel, envelope).await {
                Ok(_) => {
                    state.caches.accepted_quote_sig.insert(&sig, now);
                    state.caches.accepted_trade_lock.insert(&trade_id, now, now);
                    let listing_key = format!("rfq:{}", quote.rfq_id);
                    self.store_write(|store| {
                        store.upsert_listing_lock(
                            &listing_key,
                            ListingLockPatch {
                                listing_type: Some("rfq".to_string()),
                                listing_id: Some(quote.rfq_id.clone()),
                                trade_id: Some(trade_id.clone()),
                                state: Some(ListingState::InFlight),
                                ..ListingLockPatch::default()
                            },
                        )?;
                        store.upsert_trade(
                            &trade_id,
                            TradePatch {
                                role: Some(Role::Taker),
                                state: Some(TradeState::Negotiating),
                                rfq_channel: Patch::Set(quote_ev.channel.clone()),
                                maker_peer: Patch::Set(quote_ev.signer().to_string()),
                                btc_sats: Patch::Set(quote.btc_sats),
                                usdt_amount: Patch::Set(quote.usdt_amount.clone()),
                                platform_fee_bps: Patch::Set(quote.platform_fee_bps),
                                trade_fee_bps: Patch::Set(quote.trade_fee_bps),
                                trade_fee_collector: Patch::Set(quote.trade_fee_collector.clone()),
                                sol_recipient: Patch::Set(chain_signer.to_string()),
                                ..TradePatch::default()
                            },
                        )?;
                        store.append_event(
                            &trade_id,
                            "auto_accept_quote",
                            &json!({"quote_id": quote_ev.envelope_id}),
                            None,
                        )
                    });
                    self.trace(
                        "accept_quote",
                        &trade_id,
                        format!("accepted quote sig={}", super::sig_prefix(&sig)),
                    );
                }
                Err(err) => {
                    state.caches.event_failure(&sig, now);
                    self.trace("accept_quote", &trade_id, format!("accept failed: {err:#}"));
                }
            }
        }
    }

    /// Maker: open a swap channel for every accept of a local quote.
    pub(crate) async fn invite_from_accept(
        &self,
        state: &mut DriverState,
        ctx: &Contexts,
        actions_left: &mut u32,
    ) {
        let now = now_ms();

        for accept_ev in &ctx.accepts {
            if *actions_left == 0 {
                return;
            }
            let Body::QuoteAccept(accept) = &accept_ev.envelope.body else {
                continue;
            };
            if !ctx.my_quote_by_id.contains_key(&accept.quote_id) {
                continue;
            }
            let sig = accept_ev.sig().to_string();
            if sig.is_empty()
                || state.caches.invited_accept_sig.contains(&sig)
                || !state.caches.event_ready(&sig, now)
            {
                continue;
            }
            let trade_id = accept_ev.envelope.trade_id.clone();
            if ctx
                .negotiation(&trade_id)
                .is_some_and(|n| n.swap_invite.is_some())
            {
                state.caches.invited_accept_sig.insert(&sig, now);
                continue;
            }

            *actions_left -= 1;
            let swap_channel = format!("swap:{}", Uuid::new_v4().simple());
            if let Err(err) = self
                .rpc(self.bus.subscribe(std::slice::from_ref(&swap_channel)))
                .await
            {
                state.caches.event_failure(&sig, now);
                self.trace(
                    "invite_from_accept",
                    &trade_id,
                    format!("subscribe {swap_channel} failed: {err:#}"),
                );
                continue;
            }

            let invite = Body::SwapInvite(crate::envelope::SwapInviteBody {
                rfq_id: accept.rfq_id.clone(),
                quote_id: accept.quote_id.clone(),
                swap_channel: swap_channel.clone(),
                owner_pubkey: self.local_peer().to_string(),
                invite_b64: BASE64.encode(swap_channel.as_bytes()),
            });
            let envelope = Envelope::unsigned(trade_id.clone(), invite);

            match self.publish_signed(&accept_ev.channel, envelope).await {
                Ok(_) => {
                    state.caches.invited_accept_sig.insert(&sig, now);
                    state.swap_channels.insert(swap_channel.clone());
                    self.store_write(|store| {
                        store.upsert_trade(
                            &trade_id,
                            TradePatch {
                                swap_channel: Patch::Set(swap_channel.clone()),
                                ..TradePatch::default()
                            },
                        )?;
                        store.append_event(
                            &trade_id,
                            "auto_invite",
                            &json!({"swap_channel": swap_channel}),
                            None,
                        )
                    });
                    self.trace(
                        "invite_from_accept",
                        &trade_id,
                        format!("invited into {swap_channel}"),
                    );
                }
                Err(err) => {
                    state.caches.event_failure(&sig, now);
                    self.trace(
                        "invite_from_accept",
                        &trade_id,
                        format!("invite failed: {err:#}"),
                    );
                }
            }
        }
    }

    /// Taker: join the swap channel for invites addressed to own RFQs.
    pub(crate) async fn join_invite(
        &self,
        state: &mut DriverState,
        ctx: &Contexts,
        actions_left: &mut u32,
    ) {
        let now = now_ms();

        for invite_ev in &ctx.invites {
            if *actions_left == 0 {
                return;
            }
            let trade_id = invite_ev.envelope.trade_id.clone();
            if !ctx.my_rfq_trade_ids.contains(&trade_id) {
                continue;
            }
            let Body::SwapInvite(invite) = &invite_ev.envelope.body else {
                continue;
            };
            let sig = invite_ev.sig().to_string();
            if sig.is_empty()
                || state.caches.joined_invite_sig.contains(&sig)
                || !state.caches.event_ready(&sig, now)
            {
                continue;
            }
            if state.swap_channels.contains(&invite.swap_channel) {
                state.caches.joined_invite_sig.insert(&sig, now);
                continue;
            }
            // The invite blob must name the same channel it was sent for.
            let blob_matches = BASE64
                .decode(invite.invite_b64.as_bytes())
                .is_ok_and(|bytes| bytes == invite.swap_channel.as_bytes());
            if !blob_matches {
                state.caches.joined_invite_sig.insert(&sig, now);
                self.trace(
                    "join_invite",
                    &trade_id,
                    format!(
                        "invite blob does not match channel, sig={}",
                        super::sig_prefix(&sig)
                    ),
                );
                continue;
            }

            *actions_left -= 1;
            let joined = async {
                self.rpc(self.bus.join(&invite.swap_channel)).await?;
                self.rpc(self.bus.subscribe(std::slice::from_ref(&invite.swap_channel)))
                    .await
            }
            .await;

            match joined {
                Ok(()) => {
                    state.caches.joined_invite_sig.insert(&sig, now);
                    state.swap_channels.insert(invite.swap_channel.clone());
                    self.store_write(|store| {
                        store.upsert_trade(
                            &trade_id,
                            TradePatch {
                                swap_channel: Patch::Set(invite.swap_channel.clone()),
                                ..TradePatch::default()
                            },
                        )?;
                        store.append_event(
                            &trade_id,
                            "auto_join",
                            &json!({"swap_channel": invite.swap_channel}),
                            None,
                        )
                    });
                    self.trace(
                        "join_invite",
                        &trade_id,
                        format!("joined {}", invite.swap_channel),
                    );
                }
                Err(err) => {
                    state.caches.event_failure(&sig, now);
                    self.trace("join_invite", &trade_id, format!("join failed: {err:#}"));
                }
            }
        }
    }

    fn listing_locked(&self, listing_key: &str) -> bool {
        let store = self.store.lock().expect("receipts store mutex poisoned");
        match store.get_listing_lock(listing_key) {
            Ok(lock) => lock.is_some(),
            Err(err) => {
                tracing::warn!(listing_key, error = %format!("{err:#}"), "listing lock read failed");
                true
            }
        }
    }

    pub(crate) fn trade_is_terminal(&self, trade_id: &str) -> bool {
        let store = self.store.lock().expect("receipts store mutex poisoned");
        match store.get_trade(trade_id) {
            Ok(Some(receipt)) => receipt.state.is_terminal(),
            Ok(None) => false,
            Err(err) => {
                tracing::warn!(trade_id, error = %format!("{err:#}"), "receipt read failed");
                false
            }
        }
    }

    /// Durable-store writes are process-fatal on failure.
    pub(crate) fn store_write<R>(&self, f: impl FnOnce(&mut SqliteReceiptsStore) -> anyhow::Result<R>) -> R {
        let mut store = self.store.lock().expect("receipts store mutex poisoned");
        f(&mut store).expect("durable receipts write failed")
    }
}

/// Finds a local offer line matching the RFQ: equal price point, ceilings
/// within the RFQ's, and an overlapping refund window. The quoted window
/// is 72h clamped into the overlap.
fn match_offer_for_rfq<'a>(
    ctx: &'a Contexts,
    rfq: &RfqBody,
    now_sec: u64,
) -> Option<OfferMatch<'a>> {
    for offer_ev in ctx.offers.iter().filter(|o| o.local) {
        let Body::SvcAnnounce(offer) = &offer_ev.envelope.body else {
            continue;
        };
        if offer.valid_until_unix <= now_sec {
            continue;
        }
        for (idx, line) in offer.offers.iter().enumerate() {
            if !line_matches_rfq(line, rfq) {
                continue;
            }
            let overlap_min = line.min_sol_refund_window_sec.max(rfq.min_sol_refund_window_sec);
            let overlap_max = line.max_sol_refund_window_sec.min(rfq.max_sol_refund_window_sec);
            if overlap_min > overlap_max {
                continue;
            }
            return Some(OfferMatch {
                offer: offer_ev,
                line_index: idx as u32,
                refund_window_sec: PREFERRED_REFUND_WINDOW_SEC.clamp(overlap_min, overlap_max),
            });
        }
    }
    None
}

fn line_matches_rfq(line: &OfferLine, rfq: &RfqBody) -> bool {
    line.btc_sats == rfq.btc_sats
        && line.usdt_amount == rfq.usdt_amount
        && line.max_platform_fee_bps <= rfq.max_platform_fee_bps
        && line.max_trade_fee_bps <= rfq.max_trade_fee_bps
        && line.max_total_fee_bps <= rfq.max_total_fee_bps
}
