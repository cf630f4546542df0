use anyhow::{Context as _, Result};
use serde_json::json;

use ln_sol_swap::receipts::{
    ListingLockPatch, ListingState, Patch, Role, SqliteReceiptsStore, TradePatch, TradeState,
};

fn open_store() -> Result<(tempfile::TempDir, SqliteReceiptsStore)> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let path = dir.path().join("receipts.sqlite3");
    let store = SqliteReceiptsStore::open(path).context("open receipts store")?;
    Ok((dir, store))
}

#[test]
fn upsert_merges_and_empty_patch_changes_nothing() -> Result<()> {
    let (_dir, mut store) = open_store()?;

    let created = store
        .upsert_trade(
            "trade-a",
            TradePatch {
                role: Some(Role::Taker),
                state: Some(TradeState::LnPaid),
                btc_sats: Patch::Set(1000),
                ln_payment_hash_hex: Patch::Set("AB".repeat(32)),
                ln_preimage_hex: Patch::Set("cd".repeat(32)),
                ..TradePatch::default()
            },
        )
        .context("create trade-a")?;
    assert_eq!(created.state, TradeState::LnPaid);
    // Hex is re-coerced to lowercase.
    assert_eq!(created.ln_payment_hash_hex.as_deref(), Some("ab".repeat(32).as_str()));

    let unchanged = store
        .upsert_trade("trade-a", TradePatch::default())
        .context("empty patch")?;
    assert_eq!(unchanged.state, TradeState::LnPaid);
    assert_eq!(unchanged.ln_preimage_hex.as_deref(), Some("cd".repeat(32).as_str()));
    assert_eq!(unchanged.btc_sats, Some(1000));
    assert_eq!(unchanged.created_at, created.created_at);

    // Explicit clear writes NULL; everything else stays.
    let cleared = store
        .upsert_trade(
            "trade-a",
            TradePatch {
                last_error: Patch::Clear,
                usdt_amount: Patch::Set("670000".to_string()),
                ..TradePatch::default()
            },
        )
        .context("clear patch")?;
    assert_eq!(cleared.last_error, None);
    assert_eq!(cleared.usdt_amount.as_deref(), Some("670000"));
    assert_eq!(cleared.ln_preimage_hex.as_deref(), Some("cd".repeat(32).as_str()));
    Ok(())
}

#[test]
fn malformed_hex_is_rejected() -> Result<()> {
    let (_dir, mut store) = open_store()?;
    let err = store
        .upsert_trade(
            "trade-bad",
            TradePatch {
                ln_payment_hash_hex: Patch::Set("not-hex".to_string()),
                ..TradePatch::default()
            },
        )
        .unwrap_err();
    assert!(err.to_string().contains("ln_payment_hash_hex"));
    Ok(())
}

#[test]
fn payment_hash_lookup_uses_normalized_hex() -> Result<()> {
    let (_dir, mut store) = open_store()?;
    store.upsert_trade(
        "trade-h",
        TradePatch {
            ln_payment_hash_hex: Patch::Set("EF".repeat(32)),
            ..TradePatch::default()
        },
    )?;

    let found = store
        .get_trade_by_payment_hash(&"ef".repeat(32))?
        .context("lookup lowercase")?;
    assert_eq!(found.trade_id, "trade-h");

    let found = store
        .get_trade_by_payment_hash(&"EF".repeat(32))?
        .context("lookup uppercase")?;
    assert_eq!(found.trade_id, "trade-h");
    Ok(())
}

#[test]
fn paging_orders_by_most_recent_update() -> Result<()> {
    let (_dir, mut store) = open_store()?;
    store.upsert_trade("trade-1", TradePatch::default())?;
    store.upsert_trade("trade-2", TradePatch::default())?;
    // Touch trade-1 so it becomes the most recent.
    store.upsert_trade(
        "trade-1",
        TradePatch {
            state: Some(TradeState::Negotiating),
            ..TradePatch::default()
        },
    )?;

    let page = store.list_trades_paged(10, 0)?;
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].trade_id, "trade-1");

    let second = store.list_trades_paged(1, 1)?;
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].trade_id, "trade-2");
    Ok(())
}

#[test]
fn open_claims_require_state_and_preimage() -> Result<()> {
    let (_dir, mut store) = open_store()?;
    store.upsert_trade(
        "trade-claimable",
        TradePatch {
            state: Some(TradeState::LnPaid),
            ln_preimage_hex: Patch::Set("aa".repeat(32)),
            ..TradePatch::default()
        },
    )?;
    store.upsert_trade(
        "trade-no-preimage",
        TradePatch {
            state: Some(TradeState::LnPaid),
            ..TradePatch::default()
        },
    )?;
    store.upsert_trade(
        "trade-other-state",
        TradePatch {
            state: Some(TradeState::Escrow),
            ln_preimage_hex: Patch::Set("bb".repeat(32)),
            ..TradePatch::default()
        },
    )?;

    let claims = store.list_open_claims(10, 0)?;
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].trade_id, "trade-claimable");
    Ok(())
}

#[test]
fn open_refunds_gate_on_the_unlock_time() -> Result<()> {
    let (_dir, mut store) = open_store()?;
    store.upsert_trade(
        "trade-unlocked",
        TradePatch {
            state: Some(TradeState::Escrow),
            sol_refund_after_unix: Patch::Set(1_000),
            ..TradePatch::default()
        },
    )?;
    store.upsert_trade(
        "trade-still-locked",
        TradePatch {
            state: Some(TradeState::Escrow),
            sol_refund_after_unix: Patch::Set(5_000),
            ..TradePatch::default()
        },
    )?;

    let refunds = store.list_open_refunds(2_000, 10, 0)?;
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].trade_id, "trade-unlocked");

    let refunds = store.list_open_refunds(6_000, 10, 0)?;
    assert_eq!(refunds.len(), 2);
    Ok(())
}

#[test]
fn events_append_in_order() -> Result<()> {
    let (_dir, mut store) = open_store()?;
    store.append_event("trade-e", "auto_quote", &json!({"quote_id": "q1"}), Some(10))?;
    store.append_event("trade-e", "ln_paid", &json!({"fee_sat": 1}), Some(20))?;
    store.append_event("trade-other", "auto_quote", &json!({}), Some(15))?;

    let events = store.list_events("trade-e")?;
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind, "auto_quote");
    assert_eq!(events[1].kind, "ln_paid");
    assert_eq!(events[1].payload["fee_sat"], 1);
    Ok(())
}

#[test]
fn listing_locks_keep_created_at_and_validate_state() -> Result<()> {
    let (_dir, mut store) = open_store()?;
    let created = store.upsert_listing_lock(
        "offer:abc:0",
        ListingLockPatch {
            listing_type: Some("offer".to_string()),
            listing_id: Some("abc".to_string()),
            trade_id: Some("trade-l".to_string()),
            state: Some(ListingState::InFlight),
            ..ListingLockPatch::default()
        },
    )?;

    let updated = store.upsert_listing_lock(
        "offer:abc:0",
        ListingLockPatch {
            state: Some(ListingState::Filled),
            note: Patch::Set("settled".to_string()),
            meta_json: Patch::Set(json!({"tx": "sig-1"})),
            ..ListingLockPatch::default()
        },
    )?;
    assert_eq!(updated.created_at, created.created_at);
    assert_eq!(updated.state, ListingState::Filled);
    assert_eq!(updated.note.as_deref(), Some("settled"));
    assert_eq!(updated.meta_json, Some(json!({"tx": "sig-1"})));

    let by_trade = store.list_listing_locks_by_trade("trade-l")?;
    assert_eq!(by_trade.len(), 1);
    assert_eq!(by_trade[0].listing_key, "offer:abc:0");

    assert!(store.delete_listing_lock("offer:abc:0")?);
    assert!(!store.delete_listing_lock("offer:abc:0")?);
    Ok(())
}

#[test]
fn reopening_preserves_rows_and_schema_version() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let path = dir.path().join("receipts.sqlite3");

    {
        let mut store = SqliteReceiptsStore::open(path.clone())?;
        store.upsert_trade(
            "trade-r",
            TradePatch {
                state: Some(TradeState::Escrow),
                sol_refund_after_unix: Patch::Set(123),
                ..TradePatch::default()
            },
        )?;
    }

    let store = SqliteReceiptsStore::open(path)?;
    assert_eq!(store.schema_version()?, 2);
    let trade = store.get_trade("trade-r")?.context("trade-r missing")?;
    assert_eq!(trade.state, TradeState::Escrow);
    assert_eq!(trade.sol_refund_after_unix, Some(123));
    Ok(())
}
