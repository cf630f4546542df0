//! Per-trade settlement state machine.
//!
//! Role is derived from envelope signers, never configured. Each stage has
//! a `(trade_id, stage)` key with its own in-flight/done/retry-after
//! entry; one stage fires per trade per tick, and a stage only re-enters
//! after cache expiry or explicit recovery. Binding checks gate every
//! taker-side stage that moves funds.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context as _, Result};
use serde_json::json;

use super::{AutoTrader, Caches, CLAIM_COOLDOWN_MS, DriverState, STAGE_COOLDOWN_MS, stage_key};
use crate::bus::SWAP_CHANNEL_PREFIX;
use crate::chain::{ClaimParams, EscrowInitParams};
use crate::clock::{now_ms, now_unix};
use crate::context::{Contexts, Negotiation, TradeContext};
use crate::envelope::validate::{is_hex32, validate_terms_against_quote};
use crate::envelope::{
    Body, Envelope, LnInvoiceBody, LnPaidBody, SolClaimedBody, SolEscrowCreatedBody, TermsBody,
};
use crate::lightning::preimage_matches;
use crate::receipts::{ListingLockPatch, ListingState, Patch, Role, TradePatch, TradeState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    TermsPost,
    TermsAccept,
    LnInvoice,
    SolEscrow,
    LnPay,
    SolClaim,
}

impl Stage {
    fn name(self) -> &'static str {
        match self {
            Stage::TermsPost => "terms_post",
            Stage::TermsAccept => "terms_accept",
            Stage::LnInvoice => "ln_invoice",
            Stage::SolEscrow => "sol_escrow",
            Stage::LnPay => "ln_pay",
            Stage::SolClaim => "sol_claim",
        }
    }

    fn cooldown_ms(self) -> u64 {
        match self {
            Stage::SolClaim => CLAIM_COOLDOWN_MS,
            _ => STAGE_COOLDOWN_MS,
        }
    }
}

impl AutoTrader {
    /// Drives the settlement state machine for every live swap channel.
    pub(crate) async fn settle_trades(
        &self,
        state: &mut DriverState,
        ctx: &Contexts,
        chain_signer: &str,
        actions_left: &mut u32,
    ) {
        let now = now_ms();

        // Swap-channel contexts plus negotiations whose invite names a
        // channel nothing has been published on yet.
        let mut targets: Vec<(String, String)> = Vec::new();
        let mut seen = HashSet::new();
        for trade in ctx.trades.values() {
            seen.insert(trade.channel.clone());
            targets.push((trade.trade_id.clone(), trade.channel.clone()));
        }
        for negotiation in ctx.negotiations.values() {
            if let Some(channel) = &negotiation.swap_channel
                && !seen.contains(channel)
            {
                targets.push((negotiation.trade_id.clone(), channel.clone()));
            }
        }
        targets.sort();
        targets.truncate(self.cfg.max_trades);

        for (trade_id, channel) in targets {
            if *actions_left == 0 {
                return;
            }
            if !channel.starts_with(SWAP_CHANNEL_PREFIX) {
                continue;
            }
            let trade = ctx.trades.get(&channel);
            let negotiation = ctx.negotiation(&trade_id);

            if let Some(trade) = trade
                && trade.is_terminal()
            {
                self.absorb_terminal(trade);
                continue;
            }
            if self.trade_is_terminal(&trade_id) {
                continue;
            }

            let me = self.local_peer();
            let terms = trade.and_then(|t| t.terms.as_ref());
            let accept = trade.and_then(|t| t.accept.as_ref());
            let invoice = trade.and_then(|t| t.invoice.as_ref());
            let escrow = trade.and_then(|t| t.escrow.as_ref());
            let ln_paid = trade.and_then(|t| t.ln_paid.as_ref());
            let quote = negotiation.and_then(|n| n.quote.as_ref());
            let quote_accept = negotiation.and_then(|n| n.quote_accept.as_ref());
            let rfq = negotiation.and_then(|n| n.rfq.as_ref());

            let i_am_maker = terms.is_some_and(|t| t.signer() == me)
                || quote.is_some_and(|q| q.signer() == me);
            let i_am_taker = accept.is_some_and(|a| a.signer() == me)
                || quote_accept.is_some_and(|qa| qa.signer() == me)
                || ctx.my_rfq_trade_ids.contains(&trade_id);
            if !i_am_maker && !i_am_taker {
                continue;
            }

            let stage = if terms.is_none() {
                if i_am_maker && quote.is_some() && rfq.is_some() && quote_accept.is_some() {
                    Some(Stage::TermsPost)
                } else {
                    None
                }
            } else if accept.is_none() && i_am_taker {
                Some(Stage::TermsAccept)
            } else if accept.is_some() && invoice.is_none() && i_am_maker {
                Some(Stage::LnInvoice)
            } else if invoice.is_some() && escrow.is_none() && i_am_maker {
                Some(Stage::SolEscrow)
            } else if invoice.is_some() && escrow.is_some() && ln_paid.is_none() && i_am_taker {
                Some(Stage::LnPay)
            } else if ln_paid.is_some() && i_am_taker {
                Some(Stage::SolClaim)
            } else {
                None
            };
            let Some(stage) = stage else {
                continue;
            };

            let key = stage_key(&trade_id, stage.name());
            if !state.caches.stage_ready(&key, now) {
                continue;
            }
            *actions_left -= 1;
            state.caches.stage_begin(&key, now);

            let result = match stage {
                Stage::TermsPost => {
                    self.stage_terms_post(&trade_id, &channel, negotiation).await
                }
                Stage::TermsAccept => {
                    self.stage_terms_accept(&trade_id, &channel, negotiation, trade, chain_signer)
                        .await
                }
                Stage::LnInvoice => self.stage_ln_invoice(&trade_id, &channel, trade).await,
                Stage::SolEscrow => self.stage_sol_escrow(&trade_id, &channel, trade).await,
                Stage::LnPay => {
                    self.stage_ln_pay(&mut state.caches, &trade_id, &channel, trade, chain_signer)
                        .await
                }
                Stage::SolClaim => {
                    self.stage_sol_claim(
                        &mut state.caches,
                        &trade_id,
                        &channel,
                        trade,
                        chain_signer,
                    )
                    .await
                }
            };

            match result {
                Ok(()) => {
                    state.caches.stage_success(&key, now);
                    self.trace(stage.name(), &trade_id, "done".to_string());
                }
                Err(err) => {
                    state.caches.stage_failure(&key, now, stage.cooldown_ms());
                    self.store_write(|store| {
                        store.upsert_trade(
                            &trade_id,
                            TradePatch {
                                last_error: Patch::Set(format!("{}: {err:#}", stage.name())),
                                ..TradePatch::default()
                            },
                        )
                    });
                    self.trace(stage.name(), &trade_id, format!("failed: {err:#}"));
                }
            }
        }
    }

    /// Maker: compute the refund deadline and publish signed terms.
    async fn stage_terms_post(
        &self,
        trade_id: &str,
        channel: &str,
        negotiation: Option<&Negotiation>,
    ) -> Result<()> {
        let negotiation = negotiation.context("negotiation context missing")?;
        let quote_seen = negotiation.quote.as_ref().context("quote missing")?;
        let Body::Quote(quote) = &quote_seen.envelope.body else {
            anyhow::bail!("quote envelope has wrong body");
        };
        let accept_seen = negotiation
            .quote_accept
            .as_ref()
            .context("quote_accept missing")?;
        let Body::QuoteAccept(quote_accept) = &accept_seen.envelope.body else {
            anyhow::bail!("quote_accept envelope has wrong body");
        };
        let rfq_recipient = negotiation.rfq.as_ref().and_then(|r| match &r.envelope.body {
            Body::Rfq(rfq) => rfq.sol_recipient.clone(),
            _ => None,
        });
        let sol_recipient = quote_accept
            .sol_recipient
            .clone()
            .or(rfq_recipient)
            .context("taker chain address not yet known")?;

        anyhow::ensure!(!self.cfg.sol_mint.is_empty(), "sol_mint is not configured");
        anyhow::ensure!(
            !self.cfg.sol_refund.is_empty(),
            "sol_refund account is not configured"
        );

        let terms = TermsBody {
            btc_sats: quote.btc_sats,
            usdt_amount: quote.usdt_amount.clone(),
            sol_mint: self.cfg.sol_mint.clone(),
            sol_recipient,
            sol_refund: self.cfg.sol_refund.clone(),
            sol_refund_after_unix: now_unix() + quote.sol_refund_window_sec,
            ln_receiver_peer: self.local_peer().to_string(),
            ln_payer_peer: accept_seen.signer().to_string(),
            trade_fee_collector: quote.trade_fee_collector.clone(),
            platform_fee_bps: quote.platform_fee_bps,
            trade_fee_bps: quote.trade_fee_bps,
            terms_valid_until_unix: now_unix() + self.cfg.terms_ttl_sec,
        };
        let envelope = Envelope::unsigned(trade_id.to_string(), Body::Terms(terms.clone()));
        self.publish_signed(channel, envelope).await?;

        self.store_write(|store| {
            store.upsert_trade(
                trade_id,
                TradePatch {
                    role: Some(Role::Maker),
                    state: Some(TradeState::Terms),
                    swap_channel: Patch::Set(channel.to_string()),
                    sol_mint: Patch::Set(terms.sol_mint.clone()),
                    sol_recipient: Patch::Set(terms.sol_recipient.clone()),
                    sol_refund: Patch::Set(terms.sol_refund.clone()),
                    sol_refund_after_unix: Patch::Set(terms.sol_refund_after_unix),
                    ..TradePatch::default()
                },
            )?;
            store.append_event(
                trade_id,
                "terms_post",
                &json!({"sol_refund_after_unix": terms.sol_refund_after_unix}),
                None,
            )
        });
        Ok(())
    }

    /// Taker: binding checks, consistency against the quote, then accept.
    async fn stage_terms_accept(
        &self,
        trade_id: &str,
        channel: &str,
        negotiation: Option<&Negotiation>,
        trade: Option<&TradeContext>,
        chain_signer: &str,
    ) -> Result<()> {
        let terms_seen = trade
            .and_then(|t| t.terms.as_ref())
            .context("terms missing")?;
        let Body::Terms(terms) = &terms_seen.envelope.body else {
            anyhow::bail!("terms envelope has wrong body");
        };
        self.binding_checks(terms, chain_signer)?;

        if let Some(Body::Quote(quote)) = negotiation
            .and_then(|n| n.quote.as_ref())
            .map(|q| &q.envelope.body)
            && let Err(err) = validate_terms_against_quote(terms, quote)
        {
            // Terms provably inconsistent with what was quoted: stop
            // driving this trade entirely.
            self.store_write(|store| {
                store.upsert_trade(
                    trade_id,
                    TradePatch {
                        state: Some(TradeState::Error),
                        last_error: Patch::Set(format!("terms inconsistent with quote: {err}")),
                        ..TradePatch::default()
                    },
                )?;
                store.append_event(trade_id, "terms_rejected", &json!({"reason": err.to_string()}), None)
            });
            anyhow::bail!("terms inconsistent with quote: {err}");
        }

        let envelope = Envelope::unsigned(
            trade_id.to_string(),
            Body::Accept(crate::envelope::AcceptBody {
                terms_hash: terms_seen.envelope_id.clone(),
            }),
        );
        self.publish_signed(channel, envelope).await?;

        self.store_write(|store| {
            store.upsert_trade(
                trade_id,
                TradePatch {
                    role: Some(Role::Taker),
                    state: Some(TradeState::Accepted),
                    swap_channel: Patch::Set(channel.to_string()),
                    sol_mint: Patch::Set(terms.sol_mint.clone()),
                    sol_recipient: Patch::Set(terms.sol_recipient.clone()),
                    sol_refund: Patch::Set(terms.sol_refund.clone()),
                    sol_refund_after_unix: Patch::Set(terms.sol_refund_after_unix),
                    btc_sats: Patch::Set(terms.btc_sats),
                    usdt_amount: Patch::Set(terms.usdt_amount.clone()),
                    ..TradePatch::default()
                },
            )?;
            store.append_event(
                trade_id,
                "terms_accept",
                &json!({"terms_hash": terms_seen.envelope_id}),
                None,
            )
        });
        Ok(())
    }

    /// Maker: create the Lightning invoice for the agreed sats.
    async fn stage_ln_invoice(
        &self,
        trade_id: &str,
        channel: &str,
        trade: Option<&TradeContext>,
    ) -> Result<()> {
        let terms_seen = trade
            .and_then(|t| t.terms.as_ref())
            .context("terms missing")?;
        let Body::Terms(terms) = &terms_seen.envelope.body else {
            anyhow::bail!("terms envelope has wrong body");
        };

        let created = self
            .rpc(self.ln.create_invoice(
                terms.btc_sats,
                &format!("swap:{trade_id}"),
                &format!("atomic swap {trade_id}"),
            ))
            .await
            .context("create invoice")?;
        let payment_hash_hex = created.payment_hash_hex.to_ascii_lowercase();
        anyhow::ensure!(
            is_hex32(&payment_hash_hex),
            "lightning node returned malformed payment hash"
        );

        let envelope = Envelope::unsigned(
            trade_id.to_string(),
            Body::LnInvoice(LnInvoiceBody {
                bolt11: created.bolt11.clone(),
                payment_hash_hex: payment_hash_hex.clone(),
            }),
        );
        self.publish_signed(channel, envelope).await?;

        self.store_write(|store| {
            store.upsert_trade(
                trade_id,
                TradePatch {
                    state: Some(TradeState::Invoice),
                    ln_invoice_bolt11: Patch::Set(created.bolt11.clone()),
                    ln_payment_hash_hex: Patch::Set(payment_hash_hex.clone()),
                    ..TradePatch::default()
                },
            )?;
            store.append_event(
                trade_id,
                "ln_invoice",
                &json!({"payment_hash_hex": payment_hash_hex}),
                None,
            )
        });
        Ok(())
    }

    /// Maker: initialize the hashlocked escrow on chain and announce it.
    async fn stage_sol_escrow(
        &self,
        trade_id: &str,
        channel: &str,
        trade: Option<&TradeContext>,
    ) -> Result<()> {
        let terms_seen = trade
            .and_then(|t| t.terms.as_ref())
            .context("terms missing")?;
        let Body::Terms(terms) = &terms_seen.envelope.body else {
            anyhow::bail!("terms envelope has wrong body");
        };
        let invoice_seen = trade
            .and_then(|t| t.invoice.as_ref())
            .context("invoice missing")?;
        let Body::LnInvoice(invoice) = &invoice_seen.envelope.body else {
            anyhow::bail!("invoice envelope has wrong body");
        };

        let amount: u64 = terms
            .usdt_amount
            .parse()
            .context("parse usdt_amount as base units")?;
        let total_bps = u64::from(terms.platform_fee_bps + terms.trade_fee_bps);
        let fee_amount = (u128::from(amount) * u128::from(total_bps) / 10_000) as u64;
        let net_amount = amount
            .checked_sub(fee_amount)
            .context("fee exceeds escrow amount")?;

        // An escrow from an earlier attempt (announcement lost) is reused
        // instead of re-initialized.
        let existing = self
            .rpc(self.chain.read_escrow_state(&invoice.payment_hash_hex))
            .await
            .context("read escrow state")?;
        let (escrow, tx_sig) = match existing {
            Some(escrow) => (escrow, "recovered".to_string()),
            None => {
                let params = EscrowInitParams {
                    payment_hash_hex: invoice.payment_hash_hex.clone(),
                    mint: terms.sol_mint.clone(),
                    amount,
                    recipient: terms.sol_recipient.clone(),
                    refund: terms.sol_refund.clone(),
                    refund_after_unix: terms.sol_refund_after_unix,
                    trade_fee_collector: terms.trade_fee_collector.clone(),
                    cu_limit: None,
                    cu_price_microunits: None,
                };
                let tx = self
                    .rpc(self.chain.build_escrow_init_tx(&params))
                    .await
                    .context("build escrow init tx")?;
                let tx_sig = self
                    .rpc(self.chain.send_and_confirm(&tx))
                    .await
                    .context("confirm escrow init tx")?;
                let escrow = self
                    .rpc(self.chain.read_escrow_state(&invoice.payment_hash_hex))
                    .await
                    .context("read escrow state")?
                    .context("escrow account missing after confirmation")?;
                (escrow, tx_sig)
            }
        };

        let envelope = Envelope::unsigned(
            trade_id.to_string(),
            Body::SolEscrowCreated(SolEscrowCreatedBody {
                escrow_pda: escrow.escrow_pda.clone(),
                vault_ata: escrow.vault_ata.clone(),
                payment_hash_hex: invoice.payment_hash_hex.clone(),
                net_amount,
                fee_amount,
                refund_after_unix: terms.sol_refund_after_unix,
                tx_sig: tx_sig.clone(),
            }),
        );
        self.publish_signed(channel, envelope).await?;

        self.store_write(|store| {
            store.upsert_trade(
                trade_id,
                TradePatch {
                    state: Some(TradeState::Escrow),
                    sol_escrow_pda: Patch::Set(escrow.escrow_pda.clone()),
                    sol_vault_ata: Patch::Set(escrow.vault_ata.clone()),
                    sol_refund_after_unix: Patch::Set(terms.sol_refund_after_unix),
                    ln_payment_hash_hex: Patch::Set(invoice.payment_hash_hex.clone()),
                    ..TradePatch::default()
                },
            )?;
            store.append_event(trade_id, "sol_escrow", &json!({"tx_sig": tx_sig}), None)
        });
        Ok(())
    }

    /// Taker: pay the invoice once its hash matches the escrow hashlock.
    async fn stage_ln_pay(
        &self,
        caches: &mut Caches,
        trade_id: &str,
        channel: &str,
        trade: Option<&TradeContext>,
        chain_signer: &str,
    ) -> Result<()> {
        let terms_seen = trade
            .and_then(|t| t.terms.as_ref())
            .context("terms missing")?;
        let Body::Terms(terms) = &terms_seen.envelope.body else {
            anyhow::bail!("terms envelope has wrong body");
        };
        self.binding_checks(terms, chain_signer)?;

        let invoice_seen = trade
            .and_then(|t| t.invoice.as_ref())
            .context("invoice missing")?;
        let Body::LnInvoice(invoice) = &invoice_seen.envelope.body else {
            anyhow::bail!("invoice envelope has wrong body");
        };
        let escrow_seen = trade
            .and_then(|t| t.escrow.as_ref())
            .context("escrow missing")?;
        let Body::SolEscrowCreated(escrow) = &escrow_seen.envelope.body else {
            anyhow::bail!("escrow envelope has wrong body");
        };
        anyhow::ensure!(
            invoice.payment_hash_hex == escrow.payment_hash_hex,
            "invoice hash does not match escrow hashlock"
        );

        // A receipt already holding the matching preimage means the pay
        // succeeded before and only the announcement was lost.
        let stored_preimage = {
            let store = self.store.lock().expect("receipts store mutex poisoned");
            store
                .get_trade(trade_id)
                .context("read trade receipt")?
                .and_then(|r| r.ln_preimage_hex)
                .filter(|hex| {
                    preimage_matches(hex, &invoice.payment_hash_hex).unwrap_or(false)
                })
        };

        let (preimage_hex, fee_sat) = match stored_preimage {
            Some(hex) => (hex, 0),
            None => {
                let decoded = self
                    .rpc(self.ln.decode(&invoice.bolt11))
                    .await
                    .context("decode invoice")?;
                anyhow::ensure!(
                    decoded.payment_hash_hex.to_ascii_lowercase() == invoice.payment_hash_hex,
                    "bolt11 decodes to a different payment hash"
                );
                if let Some(amount_sat) = decoded.amount_sat {
                    anyhow::ensure!(
                        amount_sat == terms.btc_sats,
                        "bolt11 amount {amount_sat} differs from agreed {}",
                        terms.btc_sats
                    );
                }

                let paid = self
                    .rpc(self.ln.pay(
                        &invoice.bolt11,
                        self.cfg.ln_fee_limit_sat,
                        Duration::from_millis(self.cfg.tool_timeout_ms),
                    ))
                    .await
                    .context("pay invoice")?;
                let preimage_hex = paid.preimage_hex.to_ascii_lowercase();
                anyhow::ensure!(
                    preimage_matches(&preimage_hex, &invoice.payment_hash_hex)
                        .context("check preimage")?,
                    "preimage hash mismatch"
                );
                (preimage_hex, paid.fee_sat)
            }
        };

        // Durability before announcement: the preimage is the claim key.
        caches
            .trade_preimage
            .insert(trade_id, preimage_hex.clone(), now_ms());
        self.store_write(|store| {
            store.upsert_trade(
                trade_id,
                TradePatch {
                    state: Some(TradeState::LnPaid),
                    ln_invoice_bolt11: Patch::Set(invoice.bolt11.clone()),
                    ln_payment_hash_hex: Patch::Set(invoice.payment_hash_hex.clone()),
                    ln_preimage_hex: Patch::Set(preimage_hex.clone()),
                    ..TradePatch::default()
                },
            )?;
            store.append_event(
                trade_id,
                "ln_paid",
                &json!({"payment_hash_hex": invoice.payment_hash_hex, "fee_sat": fee_sat}),
                None,
            )
        });

        let envelope = Envelope::unsigned(
            trade_id.to_string(),
            Body::LnPaid(LnPaidBody {
                payment_hash_hex: invoice.payment_hash_hex.clone(),
                preimage_hex,
            }),
        );
        self.publish_signed(channel, envelope).await?;
        Ok(())
    }

    /// Taker: claim the escrow with the revealed preimage.
    async fn stage_sol_claim(
        &self,
        caches: &mut Caches,
        trade_id: &str,
        channel: &str,
        trade: Option<&TradeContext>,
        chain_signer: &str,
    ) -> Result<()> {
        let terms_seen = trade
            .and_then(|t| t.terms.as_ref())
            .context("terms missing")?;
        let Body::Terms(terms) = &terms_seen.envelope.body else {
            anyhow::bail!("terms envelope has wrong body");
        };
        self.binding_checks(terms, chain_signer)?;

        let ln_paid_seen = trade
            .and_then(|t| t.ln_paid.as_ref())
            .context("ln_paid missing")?;
        let Body::LnPaid(ln_paid) = &ln_paid_seen.envelope.body else {
            anyhow::bail!("ln_paid envelope has wrong body");
        };

        let preimage_hex = match caches.trade_preimage.get(trade_id) {
            Some(hex) => hex.clone(),
            None => {
                let store = self.store.lock().expect("receipts store mutex poisoned");
                store
                    .get_trade(trade_id)
                    .context("read trade receipt")?
                    .and_then(|r| r.ln_preimage_hex)
                    .context("preimage unavailable in cache and receipts")?
            }
        };
        anyhow::ensure!(
            preimage_matches(&preimage_hex, &ln_paid.payment_hash_hex)
                .context("check preimage")?,
            "stored preimage does not match hashlock"
        );

        // An escrow that is already gone was claimed by a previous attempt
        // whose announcement never landed; only the envelope is replayed.
        let escrow = self
            .rpc(self.chain.read_escrow_state(&ln_paid.payment_hash_hex))
            .await
            .context("read escrow state")?;
        let tx_sig = match escrow {
            Some(_) => {
                let params = ClaimParams {
                    payment_hash_hex: ln_paid.payment_hash_hex.clone(),
                    recipient_token_account: terms.sol_recipient.clone(),
                    preimage_hex,
                    trade_fee_collector: terms.trade_fee_collector.clone(),
                    cu_limit: None,
                    cu_price_microunits: None,
                };
                let tx = self
                    .rpc(self.chain.build_claim_tx(&params))
                    .await
                    .context("build claim tx")?;
                Some(
                    self.rpc(self.chain.send_and_confirm(&tx))
                        .await
                        .context("confirm claim tx")?,
                )
            }
            None => None,
        };

        let envelope = Envelope::unsigned(
            trade_id.to_string(),
            Body::SolClaimed(SolClaimedBody {
                payment_hash_hex: Some(ln_paid.payment_hash_hex.clone()),
                tx_sig: tx_sig.clone(),
            }),
        );
        self.publish_signed(channel, envelope).await?;

        self.store_write(|store| {
            store.upsert_trade(
                trade_id,
                TradePatch {
                    state: Some(TradeState::Claimed),
                    ..TradePatch::default()
                },
            )?;
            for lock in store.list_listing_locks_by_trade(trade_id)? {
                store.upsert_listing_lock(
                    &lock.listing_key,
                    ListingLockPatch {
                        state: Some(ListingState::Filled),
                        ..ListingLockPatch::default()
                    },
                )?;
            }
            store.append_event(trade_id, "sol_claim", &json!({"tx_sig": tx_sig}), None)
        });
        Ok(())
    }

    /// A failed binding check cools down and retries; it never proceeds.
    fn binding_checks(&self, terms: &TermsBody, chain_signer: &str) -> Result<()> {
        anyhow::ensure!(
            terms.ln_payer_peer == self.local_peer(),
            "binding check failed: terms name a different ln payer"
        );
        anyhow::ensure!(
            terms.sol_recipient == chain_signer,
            "binding check failed: terms pay out to a different chain signer"
        );
        Ok(())
    }

    /// Folds an observed terminal envelope into receipts and releases the
    /// listing locks held by the trade.
    fn absorb_terminal(&self, trade: &TradeContext) {
        let new_state = if trade.claimed.is_some() {
            TradeState::Claimed
        } else if trade.refunded.is_some() {
            TradeState::Refunded
        } else {
            TradeState::Canceled
        };

        let already = {
            let store = self.store.lock().expect("receipts store mutex poisoned");
            store
                .get_trade(&trade.trade_id)
                .ok()
                .flatten()
                .is_some_and(|r| r.state == new_state)
        };
        if already {
            return;
        }

        self.store_write(|store| {
            store.upsert_trade(
                &trade.trade_id,
                TradePatch {
                    state: Some(new_state),
                    ..TradePatch::default()
                },
            )?;
            for lock in store.list_listing_locks_by_trade(&trade.trade_id)? {
                store.upsert_listing_lock(
                    &lock.listing_key,
                    ListingLockPatch {
                        state: Some(ListingState::Filled),
                        ..ListingLockPatch::default()
                    },
                )?;
            }
            store.append_event(
                &trade.trade_id,
                "terminal_observed",
                &json!({"state": new_state.as_str()}),
                None,
            )
        });
        self.trace(
            "settle",
            &trade.trade_id,
            format!("terminal: {}", new_state.as_str()),
        );
    }
}
