//! Fundamental data types shared across the entire workspace.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Alias for price precision.
pub type Price = Decimal;
/// Alias for quantity precision.
pub type Qty = Decimal;
/// Canonical market symbol without venue decoration (e.g., `BTCUSDT`).
pub type Symbol = String;
/// Identifier assigned to orders by the venue.
pub type OrderId = String;
/// Row identifier of a trading profile.
pub type ProfileId = i64;

/// Execution environment of a profile. `Test` profiles never touch a live venue.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Environment {
    Live,
    Test,
}

impl Environment {
    /// Prefix stamped onto every client order id created in this environment.
    #[must_use]
    pub fn client_id_prefix(self) -> &'static str {
        match self {
            Self::Live => "bot_",
            Self::Test => "dry_",
        }
    }

    /// Suffix appended to state files so live and test runs never share a store.
    #[must_use]
    pub fn store_suffix(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Test => "test",
        }
    }
}

/// Direction of a position.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Returns the opposite direction.
    #[must_use]
    pub fn inverse(self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }

    /// Order side used to open a position in this direction.
    #[must_use]
    pub fn entry_order_side(self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Buy,
            Self::Short => OrderSide::Sell,
        }
    }

    /// Order side used to reduce or close a position in this direction.
    #[must_use]
    pub fn exit_order_side(self) -> OrderSide {
        self.entry_order_side().inverse()
    }

    /// Price movement from entry to `price`, signed so profit is positive.
    #[must_use]
    pub fn signed_delta(self, entry: Price, price: Price) -> Decimal {
        match self {
            Self::Long => price - entry,
            Self::Short => entry - price,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

impl FromStr for Side {
    type Err = CoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "LONG" => Ok(Self::Long),
            "SHORT" => Ok(Self::Short),
            other => Err(CoreError::Parse(format!("unknown side '{other}'"))),
        }
    }
}

/// Side of an individual order as the venue sees it.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    #[must_use]
    pub fn inverse(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Directional component of an ingested signal.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalSide {
    Buy,
    Sell,
    None,
}

impl SignalSide {
    /// Position direction this signal argues for, when it argues for one.
    #[must_use]
    pub fn position_side(self) -> Option<Side> {
        match self {
            Self::Buy => Some(Side::Long),
            Self::Sell => Some(Side::Short),
            Self::None => None,
        }
    }

    /// True when the signal points against an open position on `side`.
    #[must_use]
    pub fn opposes(self, side: Side) -> bool {
        self.position_side() == Some(side.inverse())
    }
}

/// Entry order execution style.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderKind {
    Market,
    Limit,
}

/// The two protective order roles attached to every active position.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ProtectiveKind {
    StopLoss,
    TakeProfit,
}

/// Which venue queue a cancellation should target.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CancelHint {
    /// The regular order queue.
    Standard,
    /// The conditional / algo queue where stop orders live on some venues.
    Conditional,
    /// Try standard first, fall back to conditional on "not found".
    Auto,
}

/// Margin accounting mode. Only isolated margin is supported.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarginMode {
    Isolated,
}

impl fmt::Display for MarginMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ISOLATED")
    }
}

/// Lifecycle state of a managed position.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    /// Entry order resting on the venue, not yet filled.
    Pending,
    /// Entry filled; the position is live.
    Active,
    Closed,
    Cancelled,
    /// Vanished from the venue; awaiting trade-history confirmation.
    WaitingSync,
}

impl PositionStatus {
    /// True for the states counted by the single-active-per-slot invariant.
    #[must_use]
    pub fn is_open(self) -> bool {
        matches!(self, Self::Pending | Self::Active)
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "PENDING",
            Self::Active => "ACTIVE",
            Self::Closed => "CLOSED",
            Self::Cancelled => "CANCELLED",
            Self::WaitingSync => "WAITING_SYNC",
        };
        write!(f, "{label}")
    }
}

impl FromStr for PositionStatus {
    type Err = CoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "PENDING" => Ok(Self::Pending),
            "ACTIVE" => Ok(Self::Active),
            "CLOSED" => Ok(Self::Closed),
            "CANCELLED" => Ok(Self::Cancelled),
            "WAITING_SYNC" => Ok(Self::WaitingSync),
            other => Err(CoreError::Parse(format!("unknown status '{other}'"))),
        }
    }
}

/// Why a finalized trade left the book.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    Tp,
    Sl,
    Manual,
    SignalFlip,
    AdoptedExit,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Tp => "TP",
            Self::Sl => "SL",
            Self::Manual => "MANUAL",
            Self::SignalFlip => "SIGNAL_FLIP",
            Self::AdoptedExit => "ADOPTED_EXIT",
        };
        write!(f, "{label}")
    }
}

impl FromStr for ExitReason {
    type Err = CoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "TP" => Ok(Self::Tp),
            "SL" => Ok(Self::Sl),
            "MANUAL" => Ok(Self::Manual),
            "SIGNAL_FLIP" => Ok(Self::SignalFlip),
            "ADOPTED_EXIT" => Ok(Self::AdoptedExit),
            other => Err(CoreError::Parse(format!("unknown exit reason '{other}'"))),
        }
    }
}

/// Candle timeframe a slot trades on.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum Timeframe {
    M15,
    M30,
    H1,
    H2,
    H4,
    H8,
    D1,
    /// Marker used for positions adopted from the venue rather than opened here.
    Adopted,
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H2 => "2h",
            Self::H4 => "4h",
            Self::H8 => "8h",
            Self::D1 => "1d",
            Self::Adopted => "ADOPTED",
        };
        write!(f, "{label}")
    }
}

impl FromStr for Timeframe {
    type Err = CoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "15m" => Ok(Self::M15),
            "30m" => Ok(Self::M30),
            "1h" | "60m" => Ok(Self::H1),
            "2h" => Ok(Self::H2),
            "4h" => Ok(Self::H4),
            "8h" => Ok(Self::H8),
            "1d" | "d" => Ok(Self::D1),
            "ADOPTED" => Ok(Self::Adopted),
            other => Err(CoreError::Parse(format!("unsupported timeframe '{other}'"))),
        }
    }
}

/// Errors raised when parsing core value types.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid position: {0}")]
    InvalidPosition(String),
}

/// Stable business key of a trading slot: one `(profile, exchange, market,
/// timeframe)` lane holding at most one open position.
///
/// Rendered as `P{profile_id}_{EXCHANGE}_{BASE}_{QUOTE}_{TIMEFRAME}`.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct PosKey(String);

impl PosKey {
    #[must_use]
    pub fn new(
        profile_id: ProfileId,
        exchange: &str,
        base: &str,
        quote: &str,
        timeframe: Timeframe,
    ) -> Self {
        Self(format!(
            "P{profile_id}_{}_{}_{}_{timeframe}",
            exchange.to_uppercase(),
            base.to_uppercase(),
            quote.to_uppercase()
        ))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Timeframe component, when the key is well-formed.
    #[must_use]
    pub fn timeframe(&self) -> Option<Timeframe> {
        self.0.rsplit('_').next().and_then(|tf| tf.parse().ok())
    }
}

impl fmt::Display for PosKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for PosKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identity of a trading lane, resolved against a profile's universe.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct SlotId {
    pub profile_id: ProfileId,
    pub exchange: String,
    pub base: String,
    pub quote: String,
    pub timeframe: Timeframe,
}

impl SlotId {
    /// Canonical symbol traded by this slot.
    #[must_use]
    pub fn symbol(&self) -> Symbol {
        format!("{}{}", self.base, self.quote)
    }

    #[must_use]
    pub fn pos_key(&self) -> PosKey {
        PosKey::new(
            self.profile_id,
            &self.exchange,
            &self.base,
            &self.quote,
            self.timeframe,
        )
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} {} {}",
            self.exchange,
            self.profile_id,
            self.symbol(),
            self.timeframe
        )
    }
}

/// A trading profile: one set of venue credentials and its universe.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Profile {
    pub id: ProfileId,
    pub name: String,
    pub environment: Environment,
    pub exchange: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_secret: Option<String>,
    pub active: bool,
}

/// The central record: a managed position keyed by its slot.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Position {
    /// Store row id; zero until first persisted.
    pub id: i64,
    pub profile_id: ProfileId,
    pub pos_key: PosKey,
    pub symbol: Symbol,
    pub side: Side,
    pub qty: Qty,
    pub entry_price: Price,
    pub sl_price: Price,
    pub tp_price: Price,
    pub leverage: u32,
    pub margin_mode: MarginMode,
    pub timeframe: Timeframe,
    pub status: PositionStatus,
    pub order_kind: OrderKind,
    pub entry_order_id: Option<OrderId>,
    pub sl_order_id: Option<OrderId>,
    pub tp_order_id: Option<OrderId>,
    pub entry_time: DateTime<Utc>,
    pub entry_confidence: f64,
    /// Opaque feature blob captured at entry; never interpreted by the engine.
    pub feature_snapshot: serde_json::Value,
    pub config_version: u32,
    /// One-shot flags for the in-trade SL/TP transitions.
    pub profit_locked: bool,
    pub tp_extended: bool,
    pub sl_tightened: bool,
}

impl Position {
    /// Check the structural invariants every stored position must satisfy.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.qty <= Decimal::ZERO {
            return Err(CoreError::InvalidPosition(format!(
                "qty must be positive, got {}",
                self.qty
            )));
        }
        if self.entry_price <= Decimal::ZERO {
            return Err(CoreError::InvalidPosition(format!(
                "entry price must be positive, got {}",
                self.entry_price
            )));
        }
        let ordered = match self.side {
            Side::Long => self.sl_price < self.entry_price && self.entry_price < self.tp_price,
            Side::Short => self.tp_price < self.entry_price && self.entry_price < self.sl_price,
        };
        if !ordered {
            return Err(CoreError::InvalidPosition(format!(
                "{} protection out of order: sl={} entry={} tp={}",
                self.side, self.sl_price, self.entry_price, self.tp_price
            )));
        }
        Ok(())
    }

    /// Notional value at entry.
    #[must_use]
    pub fn notional(&self) -> Decimal {
        self.qty * self.entry_price
    }

    /// Fraction of the entry→TP path already travelled at `price`, in the
    /// profit direction. Negative while under water.
    #[must_use]
    pub fn tp_travel_fraction(&self, price: Price) -> Decimal {
        let target = self.side.signed_delta(self.entry_price, self.tp_price);
        if target <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        self.side.signed_delta(self.entry_price, price) / target
    }
}

/// Finalized, write-once ledger row derived from a closed or cancelled position.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TradeRecord {
    pub pos_key: PosKey,
    pub symbol: Symbol,
    pub side: Side,
    pub qty: Qty,
    pub entry_price: Price,
    pub exit_price: Price,
    pub pnl: Decimal,
    pub fees: Decimal,
    pub leverage: u32,
    pub exit_reason: ExitReason,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub feature_snapshot: serde_json::Value,
}

/// One evaluation of the external scoring collaborator for a slot.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SignalSnapshot {
    pub timestamp: DateTime<Utc>,
    pub side: SignalSide,
    /// Monotone quality measure in `[0, 1]`.
    pub confidence: f64,
    pub score: f64,
    #[serde(default)]
    pub features: serde_json::Value,
}

impl SignalSnapshot {
    /// A snapshot that argues for nothing. Used when the feed has no opinion.
    #[must_use]
    pub fn flat(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            side: SignalSide::None,
            confidence: 0.0,
            score: 0.0,
            features: serde_json::Value::Null,
        }
    }
}

/// A position as reported by the venue, normalized by the adapter.
/// `qty` is always the absolute contract count; direction lives in `side`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ExchangePosition {
    pub symbol: Symbol,
    pub side: Side,
    pub qty: Qty,
    pub entry_price: Price,
    pub leverage: u32,
    pub unrealized_pnl: Decimal,
}

/// An order resting on the venue, merged across standard and conditional queues.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OpenOrder {
    pub order_id: OrderId,
    pub client_order_id: Option<String>,
    pub symbol: Symbol,
    pub side: OrderSide,
    pub qty: Qty,
    pub price: Option<Price>,
    pub trigger_price: Option<Price>,
    pub reduce_only: bool,
    /// True when the order came from the conditional / algo queue.
    pub conditional: bool,
    pub created_at: DateTime<Utc>,
}

/// A single execution from the venue's trade history.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct VenueFill {
    pub order_id: OrderId,
    pub symbol: Symbol,
    pub side: OrderSide,
    pub price: Price,
    pub qty: Qty,
    pub fee: Decimal,
    pub reduce_only: bool,
    pub timestamp: DateTime<Utc>,
}

/// Venue acknowledgement of a placement request.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OrderAck {
    pub order_id: OrderId,
    pub status: AckStatus,
}

/// Coarse placement outcome reported in an [`OrderAck`].
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum AckStatus {
    /// Resting on the book (limit) or queued conditional.
    Open,
    /// Executed immediately (market).
    Filled,
}

/// Account balance in the settlement currency.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AccountBalance {
    pub currency: String,
    pub total: Decimal,
    pub available: Decimal,
    pub updated_at: DateTime<Utc>,
}

/// Build the client order id stamped onto every order the engine places:
/// `{env_prefix}{VENUE}_{SYMBOL}_{SIDE}_{timestamp_ms}`.
#[must_use]
pub fn client_order_id(
    env: Environment,
    venue: &str,
    symbol: &str,
    side: OrderSide,
    ts_ms: i64,
) -> String {
    format!(
        "{}{}_{}_{}_{ts_ms}",
        env.client_id_prefix(),
        venue.to_uppercase(),
        symbol.to_uppercase(),
        side
    )
}

/// Components recovered from a client order id the engine created.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ParsedClientId {
    pub environment: Environment,
    pub venue: String,
    pub symbol: Symbol,
    pub side: OrderSide,
    pub ts_ms: i64,
}

/// Parse a client order id. Returns `None` for ids this engine did not create,
/// which is how the orphan reaper tells foreign orders from its own.
#[must_use]
pub fn parse_client_order_id(id: &str) -> Option<ParsedClientId> {
    let (environment, rest) = if let Some(rest) = id.strip_prefix("bot_") {
        (Environment::Live, rest)
    } else if let Some(rest) = id.strip_prefix("dry_") {
        (Environment::Test, rest)
    } else {
        return None;
    };
    let mut parts = rest.split('_');
    let venue = parts.next()?.to_string();
    let symbol = parts.next()?.to_string();
    let side = match parts.next()? {
        "BUY" => OrderSide::Buy,
        "SELL" => OrderSide::Sell,
        _ => return None,
    };
    let ts_ms = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(ParsedClientId {
        environment,
        venue,
        symbol,
        side,
        ts_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_position(side: Side, sl: Price, tp: Price) -> Position {
        Position {
            id: 0,
            profile_id: 1,
            pos_key: PosKey::new(1, "BYBIT", "BTC", "USDT", Timeframe::H1),
            symbol: "BTCUSDT".into(),
            side,
            qty: dec!(0.2),
            entry_price: dec!(100),
            sl_price: sl,
            tp_price: tp,
            leverage: 5,
            margin_mode: MarginMode::Isolated,
            timeframe: Timeframe::H1,
            status: PositionStatus::Active,
            order_kind: OrderKind::Market,
            entry_order_id: Some("e1".into()),
            sl_order_id: None,
            tp_order_id: None,
            entry_time: Utc::now(),
            entry_confidence: 0.8,
            feature_snapshot: serde_json::Value::Null,
            config_version: 1,
            profit_locked: false,
            tp_extended: false,
            sl_tightened: false,
        }
    }

    #[test]
    fn pos_key_round_trips_timeframe() {
        let key = PosKey::new(3, "bybit", "eth", "usdt", Timeframe::M15);
        assert_eq!(key.as_str(), "P3_BYBIT_ETH_USDT_15m");
        assert_eq!(key.timeframe(), Some(Timeframe::M15));
    }

    #[test]
    fn slot_id_builds_symbol_and_key() {
        let slot = SlotId {
            profile_id: 2,
            exchange: "BINANCE".into(),
            base: "SOL".into(),
            quote: "USDT".into(),
            timeframe: Timeframe::H4,
        };
        assert_eq!(slot.symbol(), "SOLUSDT");
        assert_eq!(slot.pos_key().as_str(), "P2_BINANCE_SOL_USDT_4h");
    }

    #[test]
    fn long_protection_must_bracket_entry() {
        assert!(sample_position(Side::Long, dec!(97), dec!(104))
            .validate()
            .is_ok());
        assert!(sample_position(Side::Long, dec!(104), dec!(97))
            .validate()
            .is_err());
        assert!(sample_position(Side::Short, dec!(103), dec!(96))
            .validate()
            .is_ok());
        assert!(sample_position(Side::Short, dec!(96), dec!(103))
            .validate()
            .is_err());
    }

    #[test]
    fn tp_travel_fraction_is_signed() {
        let pos = sample_position(Side::Long, dec!(97), dec!(105));
        assert_eq!(pos.tp_travel_fraction(dec!(104)), dec!(0.8));
        assert!(pos.tp_travel_fraction(dec!(99)) < Decimal::ZERO);

        let short = sample_position(Side::Short, dec!(103), dec!(95));
        assert_eq!(short.tp_travel_fraction(dec!(96)), dec!(0.8));
    }

    #[test]
    fn client_order_id_round_trip() {
        let id = client_order_id(Environment::Live, "bybit", "BTCUSDT", OrderSide::Buy, 1700);
        assert_eq!(id, "bot_BYBIT_BTCUSDT_BUY_1700");
        let parsed = parse_client_order_id(&id).expect("engine id");
        assert_eq!(parsed.environment, Environment::Live);
        assert_eq!(parsed.venue, "BYBIT");
        assert_eq!(parsed.symbol, "BTCUSDT");
        assert_eq!(parsed.side, OrderSide::Buy);
        assert_eq!(parsed.ts_ms, 1700);
    }

    #[test]
    fn foreign_client_ids_do_not_parse() {
        assert!(parse_client_order_id("x-gateway-12345").is_none());
        assert!(parse_client_order_id("bot_BYBIT_BTCUSDT").is_none());
        assert!(parse_client_order_id("bot_BYBIT_BTCUSDT_HOLD_1").is_none());
    }

    #[test]
    fn signal_side_opposition() {
        assert!(SignalSide::Sell.opposes(Side::Long));
        assert!(!SignalSide::Sell.opposes(Side::Short));
        assert!(!SignalSide::None.opposes(Side::Long));
    }
}
