//! Durable state for the engine: positions, the trade ledger, cooldowns,
//! risk metrics and the candle cache, all in one SQLite database.
//!
//! The store exclusively owns position rows; every mutation flows through it.
//! Writes commit before the calling operation reports success, and the unique
//! partial index on `(profile_id, pos_key)` makes a second open row for one
//! slot impossible even across crashed half-writes.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::info;
use vigil_core::{
    Environment, ExitReason, MarginMode, OrderKind, PosKey, Position, PositionStatus, Profile,
    ProfileId, Side, Timeframe, TradeRecord,
};

const SCHEMA: &str = include_str!("schema.sql");

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another PENDING/ACTIVE row already occupies the slot.
    #[error("an open position already exists for {0}")]
    ConflictActiveExists(PosKey),
    #[error("position {0} not found")]
    NotFound(i64),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// One cached OHLCV bar.
#[derive(Clone, Debug, PartialEq)]
pub struct CachedCandle {
    pub ts: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// SQLite-backed store. The connection sits behind a mutex; every statement
/// is short, so contention from async callers stays negligible.
pub struct PositionStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl PositionStore {
    /// Open (or create) the database for `env` under `data_dir`.
    pub fn open(data_dir: &Path, env: Environment) -> StoreResult<Self> {
        std::fs::create_dir_all(data_dir).map_err(|err| {
            rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CANTOPEN),
                Some(err.to_string()),
            )
        })?;
        let path = data_dir.join(format!("vigil_{}.db", env.store_suffix()));
        let conn = Connection::open(&path)?;
        Self::init(conn, path)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, PathBuf::from(":memory:"))
    }

    fn init(conn: Connection, path: PathBuf) -> StoreResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        info!(path = %path.display(), "position store ready");
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("store connection poisoned")
    }

    // ------------------------------------------------------------------
    // Profiles
    // ------------------------------------------------------------------

    /// Insert a profile or return the id of the existing row with that name.
    pub fn add_profile(&self, profile: &Profile) -> StoreResult<ProfileId> {
        let conn = self.lock();
        if let Some(id) = conn
            .query_row(
                "SELECT id FROM profiles WHERE name = ?1",
                params![profile.name],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
        {
            return Ok(id);
        }
        conn.execute(
            "INSERT INTO profiles (name, environment, exchange, api_key, api_secret, is_active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                profile.name,
                environment_str(profile.environment),
                profile.exchange,
                profile.api_key,
                profile.api_secret,
                profile.active as i64,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// All active profiles.
    pub fn list_profiles(&self) -> StoreResult<Vec<Profile>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, environment, exchange, api_key, api_secret, is_active
             FROM profiles WHERE is_active = 1",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Profile {
                id: row.get(0)?,
                name: row.get(1)?,
                environment: parse_at(row, 2, environment_from_str)?,
                exchange: row.get(3)?,
                api_key: row.get(4)?,
                api_secret: row.get(5)?,
                active: row.get::<_, i64>(6)? != 0,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    // ------------------------------------------------------------------
    // Positions
    // ------------------------------------------------------------------

    /// Insert or update an open position. Fails with
    /// [`StoreError::ConflictActiveExists`] when a different open row already
    /// occupies the slot. On insert the assigned row id is written back into
    /// `position.id` and returned.
    pub fn upsert_active(&self, position: &mut Position) -> StoreResult<i64> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM positions
                 WHERE profile_id = ?1 AND pos_key = ?2 AND status IN ('PENDING','ACTIVE')",
                params![position.profile_id, position.pos_key.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(open_id) = existing {
            if position.id != open_id {
                return Err(StoreError::ConflictActiveExists(position.pos_key.clone()));
            }
        }
        let id = if position.id == 0 {
            let result = tx.execute(
                "INSERT INTO positions (
                    profile_id, pos_key, symbol, side, qty, entry_price, sl_price, tp_price,
                    leverage, margin_mode, timeframe, status, order_kind, entry_order_id,
                    sl_order_id, tp_order_id, entry_time, entry_confidence, feature_snapshot,
                    config_version, profit_locked, tp_extended, sl_tightened
                 ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23)",
                params![
                    position.profile_id,
                    position.pos_key.as_str(),
                    position.symbol,
                    position.side.to_string(),
                    position.qty.to_string(),
                    position.entry_price.to_string(),
                    position.sl_price.to_string(),
                    position.tp_price.to_string(),
                    position.leverage,
                    position.margin_mode.to_string(),
                    position.timeframe.to_string(),
                    position.status.to_string(),
                    order_kind_str(position.order_kind),
                    position.entry_order_id,
                    position.sl_order_id,
                    position.tp_order_id,
                    position.entry_time.timestamp_millis(),
                    position.entry_confidence,
                    snapshot_text(&position.feature_snapshot),
                    position.config_version,
                    position.profit_locked as i64,
                    position.tp_extended as i64,
                    position.sl_tightened as i64,
                ],
            );
            match result {
                Ok(_) => tx.last_insert_rowid(),
                Err(err) if is_unique_violation(&err) => {
                    return Err(StoreError::ConflictActiveExists(position.pos_key.clone()))
                }
                Err(err) => return Err(err.into()),
            }
        } else {
            let changed = tx.execute(
                "UPDATE positions SET
                    profile_id=?1, pos_key=?2, symbol=?3, side=?4, qty=?5, entry_price=?6,
                    sl_price=?7, tp_price=?8, leverage=?9, margin_mode=?10, timeframe=?11,
                    status=?12, order_kind=?13, entry_order_id=?14, sl_order_id=?15,
                    tp_order_id=?16, entry_time=?17, entry_confidence=?18, feature_snapshot=?19,
                    config_version=?20, profit_locked=?21, tp_extended=?22, sl_tightened=?23,
                    updated_at=strftime('%s','now')
                 WHERE id=?24",
                params![
                    position.profile_id,
                    position.pos_key.as_str(),
                    position.symbol,
                    position.side.to_string(),
                    position.qty.to_string(),
                    position.entry_price.to_string(),
                    position.sl_price.to_string(),
                    position.tp_price.to_string(),
                    position.leverage,
                    position.margin_mode.to_string(),
                    position.timeframe.to_string(),
                    position.status.to_string(),
                    order_kind_str(position.order_kind),
                    position.entry_order_id,
                    position.sl_order_id,
                    position.tp_order_id,
                    position.entry_time.timestamp_millis(),
                    position.entry_confidence,
                    snapshot_text(&position.feature_snapshot),
                    position.config_version,
                    position.profit_locked as i64,
                    position.tp_extended as i64,
                    position.sl_tightened as i64,
                    position.id,
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(position.id));
            }
            position.id
        };
        tx.commit()?;
        position.id = id;
        Ok(id)
    }

    /// The open position for a slot, if any.
    pub fn get_active(&self, profile_id: ProfileId, pos_key: &PosKey) -> StoreResult<Option<Position>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{POSITION_SELECT} WHERE profile_id = ?1 AND pos_key = ?2
             AND status IN ('PENDING','ACTIVE')"
        ))?;
        Ok(stmt
            .query_row(params![profile_id, pos_key.as_str()], position_from_row)
            .optional()?)
    }

    /// Fetch a position by row id regardless of status.
    pub fn get(&self, id: i64) -> StoreResult<Position> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!("{POSITION_SELECT} WHERE id = ?1"))?;
        stmt.query_row(params![id], position_from_row)
            .optional()?
            .ok_or(StoreError::NotFound(id))
    }

    /// Open positions on a symbol for a profile, across all timeframes.
    pub fn list_open_by_symbol(
        &self,
        profile_id: ProfileId,
        symbol: &str,
    ) -> StoreResult<Vec<Position>> {
        self.query_positions(
            &format!(
                "{POSITION_SELECT} WHERE profile_id = ?1 AND symbol = ?2
                 AND status IN ('PENDING','ACTIVE')"
            ),
            params![profile_id, symbol],
        )
    }

    /// All PENDING/ACTIVE positions for a profile.
    pub fn list_open(&self, profile_id: ProfileId) -> StoreResult<Vec<Position>> {
        self.query_positions(
            &format!(
                "{POSITION_SELECT} WHERE profile_id = ?1 AND status IN ('PENDING','ACTIVE')"
            ),
            params![profile_id],
        )
    }

    /// All PENDING/ACTIVE positions across every profile.
    pub fn list_all_open(&self) -> StoreResult<Vec<Position>> {
        self.query_positions(
            &format!("{POSITION_SELECT} WHERE status IN ('PENDING','ACTIVE')"),
            params![],
        )
    }

    /// Positions parked in WAITING_SYNC for a profile.
    pub fn list_waiting_sync(&self, profile_id: ProfileId) -> StoreResult<Vec<Position>> {
        self.query_positions(
            &format!("{POSITION_SELECT} WHERE profile_id = ?1 AND status = 'WAITING_SYNC'"),
            params![profile_id],
        )
    }

    fn query_positions(
        &self,
        sql: &str,
        args: impl rusqlite::Params,
    ) -> StoreResult<Vec<Position>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(args, position_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Close or cancel a position and, for closures, append the trade row in
    /// one transaction, so a crash can never leave a closed position without
    /// its ledger entry or vice versa.
    pub fn finalize(
        &self,
        position_id: i64,
        status: PositionStatus,
        trade: Option<&TradeRecord>,
    ) -> StoreResult<()> {
        debug_assert!(matches!(
            status,
            PositionStatus::Closed | PositionStatus::Cancelled
        ));
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let profile_id: i64 = tx
            .query_row(
                "SELECT profile_id FROM positions WHERE id = ?1",
                params![position_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(StoreError::NotFound(position_id))?;
        tx.execute(
            "UPDATE positions SET status = ?1, sync_reason = NULL,
             updated_at = strftime('%s','now') WHERE id = ?2",
            params![status.to_string(), position_id],
        )?;
        if let Some(trade) = trade {
            tx.execute(
                "INSERT INTO trades (
                    profile_id, pos_key, symbol, side, qty, entry_price, exit_price, pnl, fees,
                    leverage, exit_reason, entry_time, exit_time, feature_snapshot
                 ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
                params![
                    profile_id,
                    trade.pos_key.as_str(),
                    trade.symbol,
                    trade.side.to_string(),
                    trade.qty.to_string(),
                    trade.entry_price.to_string(),
                    trade.exit_price.to_string(),
                    trade.pnl.to_string(),
                    trade.fees.to_string(),
                    trade.leverage,
                    trade.exit_reason.to_string(),
                    trade.entry_time.timestamp_millis(),
                    trade.exit_time.timestamp_millis(),
                    snapshot_text(&trade.feature_snapshot),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Park a position that disappeared from the venue until trade history
    /// confirms what happened to it.
    pub fn mark_waiting_sync(&self, position_id: i64, reason: &str) -> StoreResult<()> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE positions SET status = 'WAITING_SYNC', sync_reason = ?1,
             updated_at = strftime('%s','now') WHERE id = ?2",
            params![reason, position_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(position_id));
        }
        Ok(())
    }

    /// Return a WAITING_SYNC position to ACTIVE (the venue reported it again).
    pub fn clear_waiting_sync(&self, position_id: i64) -> StoreResult<()> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE positions SET status = 'ACTIVE', sync_reason = NULL,
             updated_at = strftime('%s','now') WHERE id = ?1 AND status = 'WAITING_SYNC'",
            params![position_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(position_id));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Trades
    // ------------------------------------------------------------------

    /// Most recent finalized trades for a profile, newest first.
    pub fn list_trades(&self, profile_id: ProfileId, limit: u32) -> StoreResult<Vec<TradeRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT pos_key, symbol, side, qty, entry_price, exit_price, pnl, fees, leverage,
                    exit_reason, entry_time, exit_time, feature_snapshot
             FROM trades WHERE profile_id = ?1 ORDER BY exit_time DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![profile_id, limit], |row| {
            Ok(TradeRecord {
                pos_key: PosKey::from(row.get::<_, String>(0)?),
                symbol: row.get(1)?,
                side: parse_at(row, 2, |s| Side::from_str(s).map_err(box_err))?,
                qty: decimal_at(row, 3)?,
                entry_price: decimal_at(row, 4)?,
                exit_price: decimal_at(row, 5)?,
                pnl: decimal_at(row, 6)?,
                fees: decimal_at(row, 7)?,
                leverage: row.get(8)?,
                exit_reason: parse_at(row, 9, |s| ExitReason::from_str(s).map_err(box_err))?,
                entry_time: millis_at(row, 10)?,
                exit_time: millis_at(row, 11)?,
                feature_snapshot: snapshot_at(row, 12)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Sum of realized PnL across the profile's ledger. Dry runs derive
    /// their synthetic equity from this.
    pub fn total_realized_pnl(&self, profile_id: ProfileId) -> StoreResult<Decimal> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT pnl FROM trades WHERE profile_id = ?1")?;
        let rows = stmt.query_map(params![profile_id], |row| row.get::<_, String>(0))?;
        let mut total = Decimal::ZERO;
        for row in rows {
            total += row?.parse::<Decimal>().unwrap_or(Decimal::ZERO);
        }
        Ok(total)
    }

    /// Direction of the most recent trade on `symbol`, used by the starter
    /// reversal logic to know which way the book just leaned.
    pub fn last_trade_side(
        &self,
        profile_id: ProfileId,
        symbol: &str,
    ) -> StoreResult<Option<Side>> {
        let conn = self.lock();
        let side: Option<String> = conn
            .query_row(
                "SELECT side FROM trades WHERE profile_id = ?1 AND symbol = ?2
                 ORDER BY exit_time DESC LIMIT 1",
                params![profile_id, symbol],
                |row| row.get(0),
            )
            .optional()?;
        Ok(side.and_then(|s| match s.as_str() {
            "LONG" => Some(Side::Long),
            "SHORT" => Some(Side::Short),
            _ => None,
        }))
    }

    // ------------------------------------------------------------------
    // Cooldowns
    // ------------------------------------------------------------------

    pub fn set_cooldown(
        &self,
        profile_id: ProfileId,
        symbol: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO cooldowns (profile_id, symbol, expires_at)
             VALUES (?1, ?2, ?3)",
            params![profile_id, symbol, expires_at.timestamp()],
        )?;
        Ok(())
    }

    /// Expiry of the cooldown on `symbol`, when one is still in the future.
    pub fn cooldown_until(
        &self,
        profile_id: ProfileId,
        symbol: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let conn = self.lock();
        let expires: Option<i64> = conn
            .query_row(
                "SELECT expires_at FROM cooldowns WHERE profile_id = ?1 AND symbol = ?2",
                params![profile_id, symbol],
                |row| row.get(0),
            )
            .optional()?;
        Ok(expires
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .filter(|expiry| *expiry > now))
    }

    pub fn purge_expired_cooldowns(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let conn = self.lock();
        Ok(conn.execute(
            "DELETE FROM cooldowns WHERE expires_at <= ?1",
            params![now.timestamp()],
        )?)
    }

    // ------------------------------------------------------------------
    // Risk metrics
    // ------------------------------------------------------------------

    pub fn risk_metric(
        &self,
        profile_id: ProfileId,
        env: Environment,
        metric: &str,
    ) -> StoreResult<Option<Decimal>> {
        let conn = self.lock();
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM risk_metrics
                 WHERE profile_id = ?1 AND environment = ?2 AND metric = ?3",
                params![profile_id, environment_str(env), metric],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.and_then(|v| v.parse().ok()))
    }

    pub fn set_risk_metric(
        &self,
        profile_id: ProfileId,
        env: Environment,
        metric: &str,
        value: Decimal,
    ) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO risk_metrics (profile_id, environment, metric, value, updated_at)
             VALUES (?1, ?2, ?3, ?4, strftime('%s','now'))",
            params![profile_id, environment_str(env), metric, value.to_string()],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Candle cache
    // ------------------------------------------------------------------

    pub fn upsert_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        candles: &[CachedCandle],
    ) -> StoreResult<()> {
        if candles.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO ohlcv_cache
                 (symbol, timeframe, ts, open, high, low, close, volume, last_used_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, strftime('%s','now'))",
            )?;
            for candle in candles {
                stmt.execute(params![
                    symbol,
                    timeframe.to_string(),
                    candle.ts,
                    candle.open.to_string(),
                    candle.high.to_string(),
                    candle.low.to_string(),
                    candle.close.to_string(),
                    candle.volume.to_string(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: u32,
    ) -> StoreResult<Vec<CachedCandle>> {
        let conn = self.lock();
        conn.execute(
            "UPDATE ohlcv_cache SET last_used_at = strftime('%s','now')
             WHERE symbol = ?1 AND timeframe = ?2",
            params![symbol, timeframe.to_string()],
        )?;
        let mut stmt = conn.prepare(
            "SELECT ts, open, high, low, close, volume FROM ohlcv_cache
             WHERE symbol = ?1 AND timeframe = ?2 ORDER BY ts DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![symbol, timeframe.to_string(), limit], |row| {
            Ok(CachedCandle {
                ts: row.get(0)?,
                open: decimal_at(row, 1)?,
                high: decimal_at(row, 2)?,
                low: decimal_at(row, 3)?,
                close: decimal_at(row, 4)?,
                volume: decimal_at(row, 5)?,
            })
        })?;
        let mut candles: Vec<CachedCandle> = rows.collect::<Result<_, _>>()?;
        candles.reverse();
        Ok(candles)
    }

    pub fn purge_stale_candles(&self, older_than: DateTime<Utc>) -> StoreResult<usize> {
        let conn = self.lock();
        Ok(conn.execute(
            "DELETE FROM ohlcv_cache WHERE last_used_at < ?1",
            params![older_than.timestamp()],
        )?)
    }
}

const POSITION_SELECT: &str = "SELECT id, profile_id, pos_key, symbol, side, qty, entry_price,
    sl_price, tp_price, leverage, margin_mode, timeframe, status, order_kind, entry_order_id,
    sl_order_id, tp_order_id, entry_time, entry_confidence, feature_snapshot, config_version,
    profit_locked, tp_extended, sl_tightened FROM positions";

fn position_from_row(row: &Row<'_>) -> rusqlite::Result<Position> {
    Ok(Position {
        id: row.get(0)?,
        profile_id: row.get(1)?,
        pos_key: PosKey::from(row.get::<_, String>(2)?),
        symbol: row.get(3)?,
        side: parse_at(row, 4, |s| Side::from_str(s).map_err(box_err))?,
        qty: decimal_at(row, 5)?,
        entry_price: decimal_at(row, 6)?,
        sl_price: decimal_at(row, 7)?,
        tp_price: decimal_at(row, 8)?,
        leverage: row.get(9)?,
        margin_mode: MarginMode::Isolated,
        timeframe: parse_at(row, 11, |s| Timeframe::from_str(s).map_err(box_err))?,
        status: parse_at(row, 12, |s| PositionStatus::from_str(s).map_err(box_err))?,
        order_kind: parse_at(row, 13, |s| match s {
            "MARKET" => Ok(OrderKind::Market),
            "LIMIT" => Ok(OrderKind::Limit),
            other => Err(box_msg(format!("unknown order kind '{other}'"))),
        })?,
        entry_order_id: row.get(14)?,
        sl_order_id: row.get(15)?,
        tp_order_id: row.get(16)?,
        entry_time: millis_at(row, 17)?,
        entry_confidence: row.get(18)?,
        feature_snapshot: snapshot_at(row, 19)?,
        config_version: row.get(20)?,
        profit_locked: row.get::<_, i64>(21)? != 0,
        tp_extended: row.get::<_, i64>(22)? != 0,
        sl_tightened: row.get::<_, i64>(23)? != 0,
    })
}

type BoxedErr = Box<dyn std::error::Error + Send + Sync>;

fn box_err<E: std::error::Error + Send + Sync + 'static>(err: E) -> BoxedErr {
    Box::new(err)
}

fn box_msg(msg: String) -> BoxedErr {
    msg.into()
}

fn parse_at<T>(
    row: &Row<'_>,
    idx: usize,
    parse: impl FnOnce(&str) -> Result<T, BoxedErr>,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err))
}

fn decimal_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    parse_at(row, idx, |s| s.parse::<Decimal>().map_err(box_err))
}

fn millis_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    Utc.timestamp_millis_opt(ms).single().ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            box_msg(format!("bad epoch millis {ms}")),
        )
    })
}

fn snapshot_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<serde_json::Value> {
    let raw: Option<String> = row.get(idx)?;
    Ok(raw
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or(serde_json::Value::Null))
}

fn snapshot_text(value: &serde_json::Value) -> Option<String> {
    if value.is_null() {
        None
    } else {
        Some(value.to_string())
    }
}

fn order_kind_str(kind: OrderKind) -> &'static str {
    match kind {
        OrderKind::Market => "MARKET",
        OrderKind::Limit => "LIMIT",
    }
}

fn environment_str(env: Environment) -> &'static str {
    match env {
        Environment::Live => "LIVE",
        Environment::Test => "TEST",
    }
}

fn environment_from_str(s: &str) -> Result<Environment, BoxedErr> {
    match s {
        "LIVE" => Ok(Environment::Live),
        "TEST" => Ok(Environment::Test),
        other => Err(box_msg(format!("unknown environment '{other}'"))),
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn store_with_profile() -> (PositionStore, ProfileId) {
        let store = PositionStore::open_in_memory().expect("open store");
        let id = store
            .add_profile(&Profile {
                id: 0,
                name: "main".into(),
                environment: Environment::Test,
                exchange: "BYBIT".into(),
                api_key: None,
                api_secret: None,
                active: true,
            })
            .expect("profile");
        (store, id)
    }

    fn sample_position(profile_id: ProfileId, timeframe: Timeframe) -> Position {
        let pos_key = PosKey::new(profile_id, "BYBIT", "BTC", "USDT", timeframe);
        Position {
            id: 0,
            profile_id,
            pos_key,
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            qty: dec!(0.2),
            entry_price: dec!(100),
            sl_price: dec!(97),
            tp_price: dec!(104),
            leverage: 5,
            margin_mode: MarginMode::Isolated,
            timeframe,
            status: PositionStatus::Active,
            order_kind: OrderKind::Market,
            entry_order_id: Some("entry-1".into()),
            sl_order_id: Some("sl-1".into()),
            tp_order_id: Some("tp-1".into()),
            entry_time: Utc::now(),
            entry_confidence: 0.7,
            feature_snapshot: serde_json::json!({"rsi": 31.5}),
            config_version: 3,
            profit_locked: false,
            tp_extended: false,
            sl_tightened: false,
        }
    }

    #[test]
    fn upsert_round_trips_every_field() {
        let (store, profile_id) = store_with_profile();
        let mut position = sample_position(profile_id, Timeframe::H1);
        let id = store.upsert_active(&mut position).unwrap();
        assert!(id > 0);

        let loaded = store
            .get_active(profile_id, &position.pos_key)
            .unwrap()
            .expect("stored row");
        assert_eq!(loaded.qty, dec!(0.2));
        assert_eq!(loaded.sl_order_id.as_deref(), Some("sl-1"));
        assert_eq!(loaded.timeframe, Timeframe::H1);
        assert_eq!(loaded.feature_snapshot["rsi"], serde_json::json!(31.5));
        assert_eq!(loaded.config_version, 3);
    }

    #[test]
    fn second_open_row_for_slot_is_rejected() {
        let (store, profile_id) = store_with_profile();
        let mut first = sample_position(profile_id, Timeframe::H1);
        store.upsert_active(&mut first).unwrap();

        let mut second = sample_position(profile_id, Timeframe::H1);
        let err = store.upsert_active(&mut second).unwrap_err();
        assert!(matches!(err, StoreError::ConflictActiveExists(_)));

        // The same row may be updated in place.
        first.sl_order_id = Some("sl-2".into());
        store.upsert_active(&mut first).unwrap();
        let loaded = store.get(first.id).unwrap();
        assert_eq!(loaded.sl_order_id.as_deref(), Some("sl-2"));
    }

    #[test]
    fn different_timeframes_occupy_different_slots() {
        let (store, profile_id) = store_with_profile();
        let mut h1 = sample_position(profile_id, Timeframe::H1);
        let mut h4 = sample_position(profile_id, Timeframe::H4);
        store.upsert_active(&mut h1).unwrap();
        store.upsert_active(&mut h4).unwrap();
        assert_eq!(store.list_open(profile_id).unwrap().len(), 2);
        assert_eq!(
            store.list_open_by_symbol(profile_id, "BTCUSDT").unwrap().len(),
            2
        );
    }

    #[test]
    fn finalize_closes_and_appends_trade_atomically() {
        let (store, profile_id) = store_with_profile();
        let mut position = sample_position(profile_id, Timeframe::H1);
        store.upsert_active(&mut position).unwrap();

        let trade = TradeRecord {
            pos_key: position.pos_key.clone(),
            symbol: position.symbol.clone(),
            side: position.side,
            qty: position.qty,
            entry_price: position.entry_price,
            exit_price: dec!(104),
            pnl: dec!(0.8),
            fees: dec!(0.01),
            leverage: position.leverage,
            exit_reason: ExitReason::Tp,
            entry_time: position.entry_time,
            exit_time: Utc::now(),
            feature_snapshot: serde_json::Value::Null,
        };
        store
            .finalize(position.id, PositionStatus::Closed, Some(&trade))
            .unwrap();

        assert!(store.get_active(profile_id, &position.pos_key).unwrap().is_none());
        let trades = store.list_trades(profile_id, 10).unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exit_reason, ExitReason::Tp);
        assert_eq!(trades[0].pnl, dec!(0.8));
        assert_eq!(store.last_trade_side(profile_id, "BTCUSDT").unwrap(), Some(Side::Long));

        // The slot is free again.
        let mut replacement = sample_position(profile_id, Timeframe::H1);
        store.upsert_active(&mut replacement).unwrap();
    }

    #[test]
    fn waiting_sync_round_trip() {
        let (store, profile_id) = store_with_profile();
        let mut position = sample_position(profile_id, Timeframe::H1);
        store.upsert_active(&mut position).unwrap();

        store
            .mark_waiting_sync(position.id, "vanished from venue")
            .unwrap();
        assert!(store.get_active(profile_id, &position.pos_key).unwrap().is_none());
        assert_eq!(store.list_waiting_sync(profile_id).unwrap().len(), 1);

        store.clear_waiting_sync(position.id).unwrap();
        assert!(store.get_active(profile_id, &position.pos_key).unwrap().is_some());
    }

    #[test]
    fn cooldowns_expire() {
        let (store, profile_id) = store_with_profile();
        let now = Utc::now();
        store
            .set_cooldown(profile_id, "SOLUSDT", now + chrono::Duration::hours(2))
            .unwrap();
        assert!(store
            .cooldown_until(profile_id, "SOLUSDT", now)
            .unwrap()
            .is_some());
        assert!(store
            .cooldown_until(profile_id, "SOLUSDT", now + chrono::Duration::hours(3))
            .unwrap()
            .is_none());
        let purged = store
            .purge_expired_cooldowns(now + chrono::Duration::hours(3))
            .unwrap();
        assert_eq!(purged, 1);
    }

    #[test]
    fn risk_metrics_upsert() {
        let (store, profile_id) = store_with_profile();
        store
            .set_risk_metric(profile_id, Environment::Test, "peak_balance", dec!(1250.5))
            .unwrap();
        store
            .set_risk_metric(profile_id, Environment::Test, "peak_balance", dec!(1300))
            .unwrap();
        assert_eq!(
            store
                .risk_metric(profile_id, Environment::Test, "peak_balance")
                .unwrap(),
            Some(dec!(1300))
        );
        assert_eq!(
            store
                .risk_metric(profile_id, Environment::Live, "peak_balance")
                .unwrap(),
            None
        );
    }

    #[test]
    fn candle_cache_round_trip() {
        let (store, _) = store_with_profile();
        let candles = vec![
            CachedCandle {
                ts: 1_000,
                open: dec!(1),
                high: dec!(2),
                low: dec!(0.5),
                close: dec!(1.5),
                volume: dec!(100),
            },
            CachedCandle {
                ts: 2_000,
                open: dec!(1.5),
                high: dec!(2.5),
                low: dec!(1),
                close: dec!(2),
                volume: dec!(80),
            },
        ];
        store
            .upsert_candles("BTCUSDT", Timeframe::H1, &candles)
            .unwrap();
        let loaded = store.get_candles("BTCUSDT", Timeframe::H1, 10).unwrap();
        assert_eq!(loaded, candles);
    }

    #[test]
    fn survives_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let profile = Profile {
            id: 0,
            name: "main".into(),
            environment: Environment::Test,
            exchange: "BYBIT".into(),
            api_key: None,
            api_secret: None,
            active: true,
        };
        let pos_key;
        {
            let store = PositionStore::open(dir.path(), Environment::Test).unwrap();
            let profile_id = store.add_profile(&profile).unwrap();
            let mut position = sample_position(profile_id, Timeframe::H1);
            pos_key = position.pos_key.clone();
            store.upsert_active(&mut position).unwrap();
        }
        let store = PositionStore::open(dir.path(), Environment::Test).unwrap();
        let profile_id = store.add_profile(&profile).unwrap();
        assert!(store.get_active(profile_id, &pos_key).unwrap().is_some());
    }
}
