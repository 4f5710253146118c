//! Exchange-agnostic traits used by the rest of the engine.
//!
//! Every venue quirk is normalized behind [`ExchangeAdapter`]: sign
//! conventions, protective-order queues, symbol formats, precision. Nothing
//! downstream of this crate ever inspects raw venue payloads.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use vigil_core::{
    AccountBalance, CancelHint, ExchangePosition, MarginMode, OpenOrder, OrderAck, OrderSide,
    Price, Qty, Symbol, VenueFill,
};

pub mod limiter;
mod registry;
pub mod retry;

pub use governor::Quota;
pub use limiter::RateLimiter;
pub use registry::{get_adapter_factory, register_adapter_factory, registered_adapters, AdapterFactory};

/// Convenience alias for adapter results.
pub type AdapterResult<T> = Result<T, AdapterError>;

/// Error taxonomy every adapter maps venue responses into.
///
/// The engine branches on these variants, so connectors must classify
/// faithfully: a mis-labelled `InvalidParam` would be retried forever, a
/// mis-labelled `TransientNetwork` would abort a recoverable operation.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Network-level failure (connect, timeout, 5xx). Safe to retry.
    #[error("transient network error: {0}")]
    TransientNetwork(String),
    /// Venue asked us to slow down.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<std::time::Duration> },
    /// The referenced order or position does not exist in the queried queue.
    #[error("not found: {0}")]
    NotFound(String),
    /// Request was structurally rejected. Not retryable.
    #[error("invalid parameter: {0}")]
    InvalidParam(String),
    /// Margin balance cannot cover the order. Not retryable.
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    /// Credentials rejected. Disables the owning profile for the run.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// Venue reports itself degraded or in maintenance.
    #[error("venue unavailable: {0}")]
    VenueDown(String),
    /// Local clock too far from venue clock; resync and retry once.
    #[error("timestamp rejected: {0}")]
    TimestampDrift(String),
    /// Payload could not be decoded into the expected shape.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl AdapterError {
    /// Whether [`retry::with_backoff`] may re-issue the failed call.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientNetwork(_)
                | Self::RateLimited { .. }
                | Self::VenueDown(_)
                | Self::TimestampDrift(_)
        )
    }
}

/// Parameters for an entry order.
#[derive(Clone, Debug)]
pub struct EntryRequest {
    pub symbol: Symbol,
    pub side: OrderSide,
    pub qty: Qty,
    /// Limit price; `None` places a market order.
    pub price: Option<Price>,
    pub leverage: u32,
    pub margin_mode: MarginMode,
    /// Protective levels to attach atomically when the venue supports
    /// parent-child orders. Ignored by venues that do not; the caller then
    /// places them via [`ExchangeAdapter::place_reduce_only`].
    pub attached_sl: Option<Price>,
    pub attached_tp: Option<Price>,
    pub client_order_id: String,
}

/// Parameters for a reduce-only protective or closing order.
#[derive(Clone, Debug)]
pub struct ProtectiveRequest {
    pub symbol: Symbol,
    /// Side that reduces the position (opposite of the entry side).
    pub side: OrderSide,
    pub qty: Qty,
    /// Trigger price; `None` fires a plain reduce-only market order.
    pub trigger_price: Option<Price>,
    pub kind: ProtectiveRole,
    pub client_order_id: String,
}

/// Role of a reduce-only order; venues encode trigger direction from it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProtectiveRole {
    StopLoss,
    TakeProfit,
    /// Immediate market close (signal flip, force close).
    Close,
}

/// Uniform capability set implemented once per venue.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Short venue name used in logs, client ids and the registry.
    fn name(&self) -> &str;

    /// Whether SL/TP can ride on the entry order and are auto-cancelled with it.
    fn supports_attached_protection(&self) -> bool;

    async fn place_entry(&self, req: EntryRequest) -> AdapterResult<OrderAck>;

    async fn place_reduce_only(&self, req: ProtectiveRequest) -> AdapterResult<OrderAck>;

    /// Cancel an order. With [`CancelHint::Auto`] the adapter retries the
    /// other queue when the first attempt reports the order missing.
    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
        hint: CancelHint,
    ) -> AdapterResult<()>;

    /// All open positions, sign-normalized (SHORT is `qty > 0` + side).
    async fn fetch_positions(&self) -> AdapterResult<Vec<ExchangePosition>>;

    /// All resting orders, merged across standard and conditional queues.
    async fn fetch_open_orders(&self, symbol: Option<&str>) -> AdapterResult<Vec<OpenOrder>>;

    /// Executions since `since`, used as the authority for realized PnL.
    async fn fetch_my_trades(
        &self,
        symbol: &str,
        since: DateTime<Utc>,
    ) -> AdapterResult<Vec<VenueFill>>;

    async fn fetch_balance(&self) -> AdapterResult<AccountBalance>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> AdapterResult<()>;

    async fn set_margin_mode(&self, symbol: &str, mode: MarginMode) -> AdapterResult<()>;

    /// Venue clock in epoch milliseconds.
    async fn server_time(&self) -> AdapterResult<i64>;

    /// Map venue-native symbol spellings to the canonical form.
    fn normalize_symbol(&self, raw: &str) -> Symbol;

    /// Map a canonical symbol to the venue-native spelling.
    fn to_venue_symbol(&self, symbol: &str) -> String;

    /// Round a quantity down to the venue step size.
    fn amount_to_precision(&self, symbol: &str, qty: Qty) -> Qty;

    /// Round a price to the venue tick size.
    fn price_to_precision(&self, symbol: &str, price: Price) -> Price;

    /// Smallest notional the venue accepts for `symbol`.
    fn min_notional(&self, symbol: &str) -> Decimal;
}

/// Clock-drift bookkeeping shared by REST connectors.
///
/// Stores `server - local` in milliseconds and applies a safety buffer so a
/// slightly-fast local clock never produces a timestamp the venue rejects.
#[derive(Debug, Default)]
pub struct ClockDrift {
    offset_ms: std::sync::atomic::AtomicI64,
}

/// Signed timestamps are backdated by this much to absorb clock jitter.
pub const DRIFT_SAFETY_MS: i64 = 5_000;

impl ClockDrift {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fresh venue timestamp against the local clock.
    pub fn sync(&self, server_ms: i64) {
        let local_ms = Utc::now().timestamp_millis();
        self.offset_ms
            .store(server_ms - local_ms, std::sync::atomic::Ordering::Relaxed);
    }

    /// Timestamp to sign outgoing requests with.
    #[must_use]
    pub fn signed_timestamp(&self) -> i64 {
        let offset = self.offset_ms.load(std::sync::atomic::Ordering::Relaxed);
        Utc::now().timestamp_millis() + offset - DRIFT_SAFETY_MS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(AdapterError::TransientNetwork("io".into()).is_retryable());
        assert!(AdapterError::RateLimited { retry_after: None }.is_retryable());
        assert!(AdapterError::TimestampDrift("1021".into()).is_retryable());
        assert!(!AdapterError::InvalidParam("bad qty".into()).is_retryable());
        assert!(!AdapterError::InsufficientFunds("margin".into()).is_retryable());
        assert!(!AdapterError::NotFound("gone".into()).is_retryable());
        assert!(!AdapterError::Auth("denied".into()).is_retryable());
    }

    #[test]
    fn drift_backdates_timestamps() {
        let drift = ClockDrift::new();
        let now = Utc::now().timestamp_millis();
        let signed = drift.signed_timestamp();
        assert!(signed <= now - DRIFT_SAFETY_MS + 50);

        drift.sync(now + 10_000);
        let adjusted = drift.signed_timestamp();
        assert!(adjusted > now);
    }
}
