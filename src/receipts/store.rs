//! Sqlite-backed receipts store.
//!
//! Single writer; WAL journaling with `synchronous=NORMAL`. Schema changes
//! go through ordered migrations gated on a `meta(schema_version)` row,
//! with additive `ALTER TABLE` steps so older databases read forward.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, Result};
use rusqlite::{Connection, OptionalExtension as _, params};
use serde_json::Value;

use super::{
    ListingLock, ListingLockPatch, ListingState, Role, TradeEvent, TradePatch, TradeReceipt,
    TradeState,
};
use crate::clock::now_ms;
use crate::envelope::validate::is_hex32;

const SCHEMA_VERSION: i64 = 2;

#[derive(Debug)]
pub struct SqliteReceiptsStore {
    conn: Connection,
    path: PathBuf,
}

impl SqliteReceiptsStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create receipts dir {}", dir.display()))?;
        }

        let conn =
            Connection::open(&path).with_context(|| format!("open sqlite {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("set sqlite busy_timeout")?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL; PRAGMA foreign_keys = ON;",
        )
        .context("configure sqlite pragmas")?;

        migrate(&conn).context("migrate receipts schema")?;

        Ok(Self { conn, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema_version(&self) -> Result<i64> {
        read_schema_version(&self.conn)
    }

    /// Merges `patch` into the row for `trade_id`, creating it if absent.
    /// `Keep` fields never clear; `Clear` writes NULL; hex fields are
    /// re-coerced to lowercase 32-byte hex. Returns the merged row.
    pub fn upsert_trade(&mut self, trade_id: &str, patch: TradePatch) -> Result<TradeReceipt> {
        anyhow::ensure!(!trade_id.is_empty(), "trade_id must not be empty");
        let now = now_ms();

        let mut row = self
            .get_trade(trade_id)
            .with_context(|| format!("read trade {trade_id}"))?
            .unwrap_or_else(|| TradeReceipt {
                trade_id: trade_id.to_string(),
                role: None,
                rfq_channel: None,
                swap_channel: None,
                maker_peer: None,
                taker_peer: None,
                btc_sats: None,
                usdt_amount: None,
                sol_mint: None,
                sol_recipient: None,
                sol_refund: None,
                platform_fee_bps: None,
                trade_fee_bps: None,
                trade_fee_collector: None,
                sol_escrow_pda: None,
                sol_vault_ata: None,
                sol_refund_after_unix: None,
                ln_invoice_bolt11: None,
                ln_payment_hash_hex: None,
                ln_preimage_hex: None,
                state: TradeState::Init,
                created_at: now,
                updated_at: now,
                last_error: None,
            });

        if let Some(role) = patch.role {
            row.role = Some(role);
        }
        if let Some(state) = patch.state {
            row.state = state;
        }
        patch.rfq_channel.apply(&mut row.rfq_channel);
        patch.swap_channel.apply(&mut row.swap_channel);
        patch.maker_peer.apply(&mut row.maker_peer);
        patch.taker_peer.apply(&mut row.taker_peer);
        patch.btc_sats.apply(&mut row.btc_sats);
        patch.usdt_amount.apply(&mut row.usdt_amount);
        patch.sol_mint.apply(&mut row.sol_mint);
        patch.sol_recipient.apply(&mut row.sol_recipient);
        patch.sol_refund.apply(&mut row.sol_refund);
        patch.platform_fee_bps.apply(&mut row.platform_fee_bps);
        patch.trade_fee_bps.apply(&mut row.trade_fee_bps);
        patch.trade_fee_collector.apply(&mut row.trade_fee_collector);
        patch.sol_escrow_pda.apply(&mut row.sol_escrow_pda);
        patch.sol_vault_ata.apply(&mut row.sol_vault_ata);
        patch
            .sol_refund_after_unix
            .apply(&mut row.sol_refund_after_unix);
        patch.ln_invoice_bolt11.apply(&mut row.ln_invoice_bolt11);
        patch
            .ln_payment_hash_hex
            .apply(&mut row.ln_payment_hash_hex);
        patch.ln_preimage_hex.apply(&mut row.ln_preimage_hex);
        patch.last_error.apply(&mut row.last_error);

        row.ln_payment_hash_hex = normalize_hex32("ln_payment_hash_hex", row.ln_payment_hash_hex)?;
        row.ln_preimage_hex = normalize_hex32("ln_preimage_hex", row.ln_preimage_hex)?;
        row.updated_at = now;

        self.conn
            .execute(
                r#"
INSERT OR REPLACE INTO trades (
  trade_id, role, rfq_channel, swap_channel, maker_peer, taker_peer,
  btc_sats, usdt_amount, sol_mint, sol_recipient, sol_refund,
  platform_fee_bps, trade_fee_bps, trade_fee_collector,
  sol_escrow_pda, sol_vault_ata, sol_refund_after_unix,
  ln_invoice_bolt11, ln_payment_hash_hex, ln_preimage_hex,
  state, created_at, updated_at, last_error
) VALUES (
  ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
  ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24
)
"#,
                params![
                    &row.trade_id,
                    row.role.map(Role::as_str),
                    row.rfq_channel.as_deref(),
                    row.swap_channel.as_deref(),
                    row.maker_peer.as_deref(),
                    row.taker_peer.as_deref(),
                    row.btc_sats.map(|v| v as i64),
                    row.usdt_amount.as_deref(),
                    row.sol_mint.as_deref(),
                    row.sol_recipient.as_deref(),
                    row.sol_refund.as_deref(),
                    row.platform_fee_bps.map(i64::from),
                    row.trade_fee_bps.map(i64::from),
                    row.trade_fee_collector.as_deref(),
                    row.sol_escrow_pda.as_deref(),
                    row.sol_vault_ata.as_deref(),
                    row.sol_refund_after_unix.map(|v| v as i64),
                    row.ln_invoice_bolt11.as_deref(),
                    row.ln_payment_hash_hex.as_deref(),
                    row.ln_preimage_hex.as_deref(),
                    row.state.as_str(),
                    row.created_at as i64,
                    row.updated_at as i64,
                    row.last_error.as_deref(),
                ],
            )
            .with_context(|| format!("upsert trade {trade_id}"))?;

        Ok(row)
    }

    pub fn get_trade(&self, trade_id: &str) -> Result<Option<TradeReceipt>> {
        self.conn
            .query_row(
                &format!("SELECT {TRADE_COLUMNS} FROM trades WHERE trade_id = ?1"),
                params![trade_id],
                row_to_trade,
            )
            .optional()
            .with_context(|| format!("get trade {trade_id}"))
    }

    pub fn get_trade_by_payment_hash(&self, payment_hash_hex: &str) -> Result<Option<TradeReceipt>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {TRADE_COLUMNS} FROM trades WHERE ln_payment_hash_hex = ?1 \
                     ORDER BY updated_at DESC LIMIT 1"
                ),
                params![payment_hash_hex.to_ascii_lowercase()],
                row_to_trade,
            )
            .optional()
            .with_context(|| format!("get trade by payment hash {payment_hash_hex}"))
    }

    pub fn list_trades_paged(&self, limit: usize, offset: usize) -> Result<Vec<TradeReceipt>> {
        self.query_trades(
            &format!(
                "SELECT {TRADE_COLUMNS} FROM trades ORDER BY updated_at DESC \
                 LIMIT ?1 OFFSET ?2"
            ),
            params![limit as i64, offset as i64],
        )
    }

    /// Trades paid over LN but not yet claimed on chain: state `ln_paid`
    /// with a persisted preimage.
    pub fn list_open_claims(&self, limit: usize, offset: usize) -> Result<Vec<TradeReceipt>> {
        self.query_trades(
            &format!(
                "SELECT {TRADE_COLUMNS} FROM trades \
                 WHERE state = 'ln_paid' AND ln_preimage_hex IS NOT NULL \
                 ORDER BY updated_at DESC LIMIT ?1 OFFSET ?2"
            ),
            params![limit as i64, offset as i64],
        )
    }

    /// Escrowed trades whose refund window has passed.
    pub fn list_open_refunds(
        &self,
        now_unix: u64,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TradeReceipt>> {
        self.query_trades(
            &format!(
                "SELECT {TRADE_COLUMNS} FROM trades \
                 WHERE state = 'escrow' AND sol_refund_after_unix IS NOT NULL \
                   AND sol_refund_after_unix <= ?1 \
                 ORDER BY updated_at DESC LIMIT ?2 OFFSET ?3"
            ),
            params![now_unix as i64, limit as i64, offset as i64],
        )
    }

    pub fn append_event(
        &mut self,
        trade_id: &str,
        kind: &str,
        payload: &Value,
        ts: Option<u64>,
    ) -> Result<()> {
        let ts = ts.unwrap_or_else(now_ms);
        self.conn
            .execute(
                "INSERT INTO events (trade_id, ts, kind, payload) VALUES (?1, ?2, ?3, ?4)",
                params![trade_id, ts as i64, kind, payload.to_string()],
            )
            .with_context(|| format!("append event {kind} for trade {trade_id}"))?;
        Ok(())
    }

    pub fn list_events(&self, trade_id: &str) -> Result<Vec<TradeEvent>> {
        let mut stmt = self
            .conn
            .prepare("SELECT trade_id, ts, kind, payload FROM events WHERE trade_id = ?1 ORDER BY ts")
            .context("prepare list events")?;
        let rows = stmt
            .query_map(params![trade_id], |row| {
                let ts: i64 = row.get(1)?;
                let payload: String = row.get(3)?;
                Ok((row.get::<_, String>(0)?, ts, row.get::<_, String>(2)?, payload))
            })
            .context("query list events")?;

        let mut out = Vec::new();
        for row in rows {
            let (trade_id, ts, kind, payload) = row.context("read event row")?;
            out.push(TradeEvent {
                trade_id,
                ts: ts as u64,
                kind,
                payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
            });
        }
        Ok(out)
    }

    /// Merges a listing-lock patch; `created_at` never changes on update.
    pub fn upsert_listing_lock(
        &mut self,
        listing_key: &str,
        patch: ListingLockPatch,
    ) -> Result<ListingLock> {
        anyhow::ensure!(!listing_key.is_empty(), "listing_key must not be empty");
        let now = now_ms();

        let mut row = self
            .get_listing_lock(listing_key)
            .with_context(|| format!("read listing lock {listing_key}"))?
            .unwrap_or_else(|| ListingLock {
                listing_key: listing_key.to_string(),
                listing_type: String::new(),
                listing_id: String::new(),
                trade_id: String::new(),
                state: ListingState::InFlight,
                note: None,
                meta_json: None,
                created_at: now,
                updated_at: now,
            });

        if let Some(listing_type) = patch.listing_type {
            row.listing_type = listing_type;
        }
        if let Some(listing_id) = patch.listing_id {
            row.listing_id = listing_id;
        }
        if let Some(trade_id) = patch.trade_id {
            row.trade_id = trade_id;
        }
        if let Some(state) = patch.state {
            row.state = state;
        }
        patch.note.apply(&mut row.note);
        patch.meta_json.apply(&mut row.meta_json);
        row.updated_at = now;

        self.conn
            .execute(
                r#"
INSERT OR REPLACE INTO listing_locks (
  listing_key, listing_type, listing_id, trade_id, state, note, meta_json,
  created_at, updated_at
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
"#,
                params![
                    &row.listing_key,
                    &row.listing_type,
                    &row.listing_id,
                    &row.trade_id,
                    row.state.as_str(),
                    row.note.as_deref(),
                    row.meta_json.as_ref().map(|v| v.to_string()),
                    row.created_at as i64,
                    row.updated_at as i64,
                ],
            )
            .with_context(|| format!("upsert listing lock {listing_key}"))?;

        Ok(row)
    }

    pub fn get_listing_lock(&self, listing_key: &str) -> Result<Option<ListingLock>> {
        self.conn
            .query_row(
                &format!("SELECT {LOCK_COLUMNS} FROM listing_locks WHERE listing_key = ?1"),
                params![listing_key],
                row_to_lock,
            )
            .optional()
            .with_context(|| format!("get listing lock {listing_key}"))
    }

    pub fn list_listing_locks_by_trade(&self, trade_id: &str) -> Result<Vec<ListingLock>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {LOCK_COLUMNS} FROM listing_locks WHERE trade_id = ?1 \
                 ORDER BY updated_at DESC"
            ))
            .context("prepare list listing locks")?;
        let rows = stmt
            .query_map(params![trade_id], row_to_lock)
            .context("query listing locks")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("read listing lock row")?);
        }
        Ok(out)
    }

    pub fn delete_listing_lock(&mut self, listing_key: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "DELETE FROM listing_locks WHERE listing_key = ?1",
                params![listing_key],
            )
            .with_context(|| format!("delete listing lock {listing_key}"))?;
        Ok(rows > 0)
    }

    fn query_trades(
        &self,
        sql: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<TradeReceipt>> {
        let mut stmt = self.conn.prepare(sql).context("prepare trades query")?;
        let rows = stmt.query_map(args, row_to_trade).context("query trades")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("read trade row")?);
        }
        Ok(out)
    }
}

const TRADE_COLUMNS: &str = "trade_id, role, rfq_channel, swap_channel, maker_peer, taker_peer, \
    btc_sats, usdt_amount, sol_mint, sol_recipient, sol_refund, \
    platform_fee_bps, trade_fee_bps, trade_fee_collector, \
    sol_escrow_pda, sol_vault_ata, sol_refund_after_unix, \
    ln_invoice_bolt11, ln_payment_hash_hex, ln_preimage_hex, \
    state, created_at, updated_at, last_error";

const LOCK_COLUMNS: &str = "listing_key, listing_type, listing_id, trade_id, state, note, \
    meta_json, created_at, updated_at";

fn normalize_hex32(field: &'static str, value: Option<String>) -> Result<Option<String>> {
    let Some(value) = value else {
        return Ok(None);
    };
    let lower = value.to_ascii_lowercase();
    anyhow::ensure!(is_hex32(&lower), "{field} must be 32-byte hex, got {value:?}");
    Ok(Some(lower))
}

fn row_to_trade(row: &rusqlite::Row<'_>) -> rusqlite::Result<TradeReceipt> {
    let role: Option<String> = row.get(1)?;
    let role = role.map(|s| role_from_str(&s, 1)).transpose()?;
    let state: String = row.get(20)?;
    let state = state_from_str(&state, 20)?;

    Ok(TradeReceipt {
        trade_id: row.get(0)?,
        role,
        rfq_channel: row.get(2)?,
        swap_channel: row.get(3)?,
        maker_peer: row.get(4)?,
        taker_peer: row.get(5)?,
        btc_sats: get_opt_u64(row, 6)?,
        usdt_amount: row.get(7)?,
        sol_mint: row.get(8)?,
        sol_recipient: row.get(9)?,
        sol_refund: row.get(10)?,
        platform_fee_bps: get_opt_u32(row, 11)?,
        trade_fee_bps: get_opt_u32(row, 12)?,
        trade_fee_collector: row.get(13)?,
        sol_escrow_pda: row.get(14)?,
        sol_vault_ata: row.get(15)?,
        sol_refund_after_unix: get_opt_u64(row, 16)?,
        ln_invoice_bolt11: row.get(17)?,
        ln_payment_hash_hex: row.get(18)?,
        ln_preimage_hex: row.get(19)?,
        state,
        created_at: get_u64(row, 21)?,
        updated_at: get_u64(row, 22)?,
        last_error: row.get(23)?,
    })
}

fn row_to_lock(row: &rusqlite::Row<'_>) -> rusqlite::Result<ListingLock> {
    let state: String = row.get(4)?;
    let state = match state.as_str() {
        "in_flight" => ListingState::InFlight,
        "filled" => ListingState::Filled,
        other => {
            return Err(rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                format!("unknown listing state: {other}").into(),
            ));
        }
    };
    let meta_json: Option<String> = row.get(6)?;

    Ok(ListingLock {
        listing_key: row.get(0)?,
        listing_type: row.get(1)?,
        listing_id: row.get(2)?,
        trade_id: row.get(3)?,
        state,
        note: row.get(5)?,
        meta_json: meta_json.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: get_u64(row, 7)?,
        updated_at: get_u64(row, 8)?,
    })
}

fn role_from_str(s: &str, col: usize) -> rusqlite::Result<Role> {
    match s {
        "maker" => Ok(Role::Maker),
        "taker" => Ok(Role::Taker),
        other => Err(rusqlite::Error::FromSqlConversionFailure(
            col,
            rusqlite::types::Type::Text,
            format!("unknown role: {other}").into(),
        )),
    }
}

fn state_from_str(s: &str, col: usize) -> rusqlite::Result<TradeState> {
    match s {
        "init" => Ok(TradeState::Init),
        "negotiating" => Ok(TradeState::Negotiating),
        "terms" => Ok(TradeState::Terms),
        "accepted" => Ok(TradeState::Accepted),
        "invoice" => Ok(TradeState::Invoice),
        "escrow" => Ok(TradeState::Escrow),
        "ln_paid" => Ok(TradeState::LnPaid),
        "claimed" => Ok(TradeState::Claimed),
        "refunded" => Ok(TradeState::Refunded),
        "canceled" => Ok(TradeState::Canceled),
        "error" => Ok(TradeState::Error),
        other => Err(rusqlite::Error::FromSqlConversionFailure(
            col,
            rusqlite::types::Type::Text,
            format!("unknown trade state: {other}").into(),
        )),
    }
}

fn get_u64(row: &rusqlite::Row<'_>, col: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(col)?;
    u64::try_from(value).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            col,
            rusqlite::types::Type::Integer,
            format!("negative value {value}").into(),
        )
    })
}

fn get_opt_u64(row: &rusqlite::Row<'_>, col: usize) -> rusqlite::Result<Option<u64>> {
    let value: Option<i64> = row.get(col)?;
    value
        .map(|v| {
            u64::try_from(v).map_err(|_| {
                rusqlite::Error::FromSqlConversionFailure(
                    col,
                    rusqlite::types::Type::Integer,
                    format!("negative value {v}").into(),
                )
            })
        })
        .transpose()
}

fn get_opt_u32(row: &rusqlite::Row<'_>, col: usize) -> rusqlite::Result<Option<u32>> {
    let value: Option<i64> = row.get(col)?;
    value
        .map(|v| {
            u32::try_from(v).map_err(|_| {
                rusqlite::Error::FromSqlConversionFailure(
                    col,
                    rusqlite::types::Type::Integer,
                    format!("value {v} out of u32 range").into(),
                )
            })
        })
        .transpose()
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        [],
    )
    .context("create meta table")?;

    let mut version = read_schema_version(conn)?;
    anyhow::ensure!(
        version <= SCHEMA_VERSION,
        "database schema version {version} is newer than supported {SCHEMA_VERSION}"
    );

    if version < 1 {
        migrate_v1(conn).context("apply migration 1")?;
        version = 1;
        write_schema_version(conn, version)?;
    }
    if version < 2 {
        migrate_v2(conn).context("apply migration 2")?;
        version = 2;
        write_schema_version(conn, version)?;
    }

    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS trades (
  trade_id TEXT PRIMARY KEY,
  role TEXT,
  rfq_channel TEXT,
  swap_channel TEXT,
  maker_peer TEXT,
  taker_peer TEXT,
  btc_sats INTEGER,
  usdt_amount TEXT,
  sol_mint TEXT,
  sol_recipient TEXT,
  sol_refund TEXT,
  platform_fee_bps INTEGER,
  trade_fee_bps INTEGER,
  trade_fee_collector TEXT,
  sol_escrow_pda TEXT,
  sol_vault_ata TEXT,
  sol_refund_after_unix INTEGER,
  ln_invoice_bolt11 TEXT,
  ln_payment_hash_hex TEXT,
  ln_preimage_hex TEXT,
  state TEXT NOT NULL,
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL,
  last_error TEXT
);
CREATE INDEX IF NOT EXISTS trades_payment_hash_idx ON trades(ln_payment_hash_hex);
CREATE INDEX IF NOT EXISTS trades_state_idx ON trades(state, updated_at DESC);

CREATE TABLE IF NOT EXISTS events (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  trade_id TEXT NOT NULL,
  ts INTEGER NOT NULL,
  kind TEXT NOT NULL,
  payload TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS events_trade_ts_idx ON events(trade_id, ts);

CREATE TABLE IF NOT EXISTS listing_locks (
  listing_key TEXT PRIMARY KEY,
  listing_type TEXT NOT NULL,
  listing_id TEXT NOT NULL,
  trade_id TEXT NOT NULL,
  state TEXT NOT NULL,
  note TEXT,
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS listing_locks_trade_idx ON listing_locks(trade_id, updated_at DESC);
CREATE INDEX IF NOT EXISTS listing_locks_state_idx ON listing_locks(state, updated_at DESC);
"#,
    )
    .context("create base tables")
}

fn migrate_v2(conn: &Connection) -> Result<()> {
    let columns = table_columns(conn, "listing_locks").context("read listing_locks columns")?;
    ensure_column(conn, "listing_locks", &columns, "meta_json", "TEXT")
}

fn table_columns(conn: &Connection, table: &str) -> Result<HashSet<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("prepare PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([]).context("query PRAGMA table_info")?;

    let mut out = HashSet::new();
    while let Some(row) = rows.next().context("read PRAGMA row")? {
        let name: String = row.get(1)?;
        out.insert(name);
    }
    Ok(out)
}

fn ensure_column(
    conn: &Connection,
    table: &str,
    columns: &HashSet<String>,
    name: &str,
    decl: &str,
) -> Result<()> {
    if columns.contains(name) {
        return Ok(());
    }
    conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {name} {decl}"), [])
        .with_context(|| format!("add column {table}.{name}"))?;
    Ok(())
}

fn read_schema_version(conn: &Connection) -> Result<i64> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()
        .context("read schema_version")?;
    Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
}

fn write_schema_version(conn: &Connection, version: i64) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', ?1)",
        params![version.to_string()],
    )
    .context("write schema_version")?;
    Ok(())
}
