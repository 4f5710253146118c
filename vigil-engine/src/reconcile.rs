//! Deep synchronization between the store and venue reality.
//!
//! Runs as a fast pass at the top of every heartbeat and as a periodic full
//! scan. Handles the three ways local and remote state drift apart: positions
//! that vanished (phantom closures), venue positions nobody opened here
//! (adoption), and orders belonging to neither (the orphan reaper).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use vigil_core::{
    ExchangePosition, OrderKind, PosKey, Position, PositionStatus, Side, Timeframe, VenueFill,
};
use vigil_store::StoreError;

use crate::trader::Trader;
use crate::{EngineResult, ProfileRuntime};

/// Pause before querying trade history; venue indices lag fills briefly.
const INDEXING_LAG: Duration = Duration::from_millis(500);
/// Attempts to find a closing fill before parking a row in WAITING_SYNC.
const PHANTOM_FILL_ATTEMPTS: u32 = 3;
const PHANTOM_RETRY_SPACING: Duration = Duration::from_secs(1);

/// Reconciles one profile's store against its venue.
pub struct Reconciler {
    trader: Arc<Trader>,
}

impl Reconciler {
    #[must_use]
    pub fn new(trader: Arc<Trader>) -> Self {
        Self { trader }
    }

    fn ctx(&self) -> &Arc<ProfileRuntime> {
        self.trader.ctx()
    }

    /// One full reconciliation pass. `include_reaper` distinguishes the slow
    /// scan (which also sweeps orphan orders) from the per-heartbeat fast
    /// sync. Idempotent: running it again on a steady state changes nothing.
    pub async fn deep_sync(&self, include_reaper: bool) -> EngineResult<()> {
        let ctx = self.ctx();
        // Dry-run state is simulated locally; there is nothing to square.
        if ctx.is_dry_run() || self.trader.is_disabled() {
            return Ok(());
        }
        let venue_positions = ctx.adapter.fetch_positions().await?;
        let by_symbol: HashMap<&str, &ExchangePosition> = venue_positions
            .iter()
            .map(|p| (p.symbol.as_str(), p))
            .collect();

        for position in ctx.store.list_open(ctx.profile.id)? {
            if position.status != PositionStatus::Active {
                continue; // pending entries belong to the fill monitor
            }
            if let Err(err) = self.sync_one(position, &by_symbol).await {
                warn!(error = %err, "position sync failed");
            }
        }

        for position in ctx.store.list_waiting_sync(ctx.profile.id)? {
            if let Err(err) = self.resolve_waiting(position, &by_symbol).await {
                warn!(error = %err, "waiting-sync resolution failed");
            }
        }

        self.adopt_strays(&venue_positions).await?;

        if include_reaper {
            self.trader.reap_orphans().await?;
        }
        Ok(())
    }

    async fn sync_one(
        &self,
        position: Position,
        venue: &HashMap<&str, &ExchangePosition>,
    ) -> EngineResult<()> {
        let ctx = self.ctx();
        let guard = self
            .trader
            .locks()
            .guard(position.profile_id, &position.symbol);
        let _held = guard.lock().await;
        // Re-read under the lock; the trader may have closed it meanwhile.
        let Some(mut position) = ctx.store.get_active(position.profile_id, &position.pos_key)?
        else {
            return Ok(());
        };
        if position.status != PositionStatus::Active {
            return Ok(());
        }

        match venue.get(position.symbol.as_str()) {
            Some(remote) if remote.qty > Decimal::ZERO && remote.side == position.side => {
                if remote.qty != position.qty {
                    debug!(
                        symbol = %position.symbol,
                        local = %position.qty,
                        remote = %remote.qty,
                        "venue quantity drifted, adopting remote"
                    );
                    position.qty = remote.qty;
                    ctx.store.upsert_active(&mut position)?;
                }
                self.trader.ensure_protection(&mut position).await
            }
            _ => self.handle_phantom(position).await,
        }
    }

    /// Phantom Closure Protocol: the position is gone from the venue. Only
    /// trade history may tell us how it ended; price inference never writes
    /// a result.
    async fn handle_phantom(&self, position: Position) -> EngineResult<()> {
        warn!(
            symbol = %position.symbol,
            pos_key = %position.pos_key,
            "position missing from venue, verifying against trade history"
        );
        tokio::time::sleep(INDEXING_LAG).await;
        if self.try_confirm_closure(&position).await? {
            return Ok(());
        }
        info!(
            symbol = %position.symbol,
            "no closing fill found yet, parking position for sync"
        );
        self.ctx()
            .store
            .mark_waiting_sync(position.id, "vanished from venue, no fill found")?;
        Ok(())
    }

    /// Look for closing fills; on success finalize with the attested result.
    async fn try_confirm_closure(&self, position: &Position) -> EngineResult<bool> {
        let ctx = self.ctx();
        for attempt in 0..PHANTOM_FILL_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(PHANTOM_RETRY_SPACING).await;
            }
            let fills = match ctx
                .adapter
                .fetch_my_trades(&position.symbol, position.entry_time)
                .await
            {
                Ok(fills) => fills,
                Err(err) => {
                    warn!(attempt, error = %err, "trade history fetch failed");
                    continue;
                }
            };
            let closing: Vec<&VenueFill> = fills
                .iter()
                .filter(|f| f.side == position.side.exit_order_side())
                .collect();
            let closed_qty: Decimal = closing.iter().map(|f| f.qty).sum();
            // Accept once the closing quantity covers the position (small
            // tolerance for step-size rounding).
            if closed_qty >= position.qty * Decimal::new(99, 2) && !closing.is_empty() {
                let notional: Decimal = closing.iter().map(|f| f.price * f.qty).sum();
                let fees: Decimal = closing.iter().map(|f| f.fee).sum();
                let exit_price = notional / closed_qty;
                let exit_reason = self.trader.classify_exit(position, exit_price);
                let pnl = position
                    .side
                    .signed_delta(position.entry_price, exit_price)
                    * closed_qty
                    - fees;
                info!(
                    symbol = %position.symbol,
                    %exit_price,
                    %pnl,
                    reason = %exit_reason,
                    "phantom closure confirmed by trade history"
                );
                let trade = self
                    .trader
                    .build_trade(position, exit_price, pnl, fees, exit_reason);
                self.trader.finalize_closed(position, trade).await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Retry verification for rows parked in WAITING_SYNC. A position that
    /// reappears on the venue was a reporting glitch and goes back to ACTIVE.
    async fn resolve_waiting(
        &self,
        position: Position,
        venue: &HashMap<&str, &ExchangePosition>,
    ) -> EngineResult<()> {
        let ctx = self.ctx();
        let guard = self
            .trader
            .locks()
            .guard(position.profile_id, &position.symbol);
        let _held = guard.lock().await;
        if venue
            .get(position.symbol.as_str())
            .is_some_and(|remote| remote.qty > Decimal::ZERO && remote.side == position.side)
        {
            info!(symbol = %position.symbol, "parked position reappeared on venue, reactivating");
            ctx.store.clear_waiting_sync(position.id)?;
            return Ok(());
        }
        if !self.try_confirm_closure(&position).await? {
            debug!(symbol = %position.symbol, "closure still unconfirmed, will retry next cycle");
        }
        Ok(())
    }

    /// Adoption Protocol: bring venue positions the engine does not know
    /// about under management. Idempotent per symbol: an existing open row
    /// (adopted or not) suppresses adoption.
    async fn adopt_strays(&self, venue_positions: &[ExchangePosition]) -> EngineResult<()> {
        let ctx = self.ctx();
        for remote in venue_positions {
            if remote.qty <= Decimal::ZERO {
                continue;
            }
            if !ctx
                .store
                .list_open_by_symbol(ctx.profile.id, &remote.symbol)?
                .is_empty()
            {
                continue;
            }
            let guard = self.trader.locks().guard(ctx.profile.id, &remote.symbol);
            let _held = guard.lock().await;
            // Double-check under the lock.
            if !ctx
                .store
                .list_open_by_symbol(ctx.profile.id, &remote.symbol)?
                .is_empty()
            {
                continue;
            }
            match self.adopt_one(remote).await {
                Ok(position) => {
                    info!(
                        symbol = %remote.symbol,
                        side = %remote.side,
                        qty = %remote.qty,
                        "adopted stray venue position"
                    );
                    ctx.notifier
                        .send(vigil_notify::format_position_adopted(&position, ctx.venue()));
                }
                Err(crate::EngineError::Store(StoreError::ConflictActiveExists(key))) => {
                    debug!(%key, "adoption raced an open row, skipping");
                }
                Err(err) => warn!(symbol = %remote.symbol, error = %err, "adoption failed"),
            }
        }
        Ok(())
    }

    async fn adopt_one(&self, remote: &ExchangePosition) -> EngineResult<Position> {
        let ctx = self.ctx();
        let strategy = ctx.strategy.current();
        let (base, quote) = split_canonical(&remote.symbol);
        let pos_key = PosKey::new(
            ctx.profile.id,
            ctx.venue(),
            &base,
            &quote,
            Timeframe::Adopted,
        );

        // Prefer protective levels already resting on the venue; otherwise
        // synthesize them at the configured default distances.
        let orders = ctx
            .adapter
            .fetch_open_orders(Some(&remote.symbol))
            .await
            .unwrap_or_default();
        let close_side = remote.side.exit_order_side();
        let mut sl = None;
        let mut tp = None;
        for order in &orders {
            if !order.reduce_only || order.side != close_side {
                continue;
            }
            let Some(trigger) = order.trigger_price else {
                continue;
            };
            let in_profit = remote.side.signed_delta(remote.entry_price, trigger) > Decimal::ZERO;
            if in_profit {
                tp = tp.or(Some((trigger, order.order_id.clone())));
            } else {
                sl = sl.or(Some((trigger, order.order_id.clone())));
            }
        }
        let (sl_price, sl_order_id) = match sl {
            Some((price, id)) => (price, Some(id)),
            None => (
                match remote.side {
                    Side::Long => remote.entry_price * (Decimal::ONE - strategy.sl_pct),
                    Side::Short => remote.entry_price * (Decimal::ONE + strategy.sl_pct),
                },
                None,
            ),
        };
        let (tp_price, tp_order_id) = match tp {
            Some((price, id)) => (price, Some(id)),
            None => (
                match remote.side {
                    Side::Long => remote.entry_price * (Decimal::ONE + strategy.tp_pct),
                    Side::Short => remote.entry_price * (Decimal::ONE - strategy.tp_pct),
                },
                None,
            ),
        };

        let mut position = Position {
            id: 0,
            profile_id: ctx.profile.id,
            pos_key,
            symbol: remote.symbol.clone(),
            side: remote.side,
            qty: remote.qty,
            entry_price: remote.entry_price,
            sl_price: ctx.adapter.price_to_precision(&remote.symbol, sl_price),
            tp_price: ctx.adapter.price_to_precision(&remote.symbol, tp_price),
            leverage: remote.leverage.max(1),
            margin_mode: vigil_core::MarginMode::Isolated,
            timeframe: Timeframe::Adopted,
            status: PositionStatus::Active,
            order_kind: OrderKind::Market,
            entry_order_id: None,
            sl_order_id,
            tp_order_id,
            entry_time: Utc::now(),
            entry_confidence: 0.0,
            feature_snapshot: serde_json::Value::Null,
            config_version: strategy.version,
            profit_locked: false,
            tp_extended: false,
            sl_tightened: false,
        };
        position
            .validate()
            .map_err(|err| crate::EngineError::Invalid(err.to_string()))?;
        ctx.store.upsert_active(&mut position)?;
        // Missing protective orders are placed by the normal repair path.
        self.trader.ensure_protection(&mut position).await?;
        Ok(position)
    }
}

/// Split a canonical symbol into base and quote. Quote currencies the engine
/// settles in are suffix-matched; everything else falls back to USDT pairs.
fn split_canonical(symbol: &str) -> (String, String) {
    for quote in ["USDT", "USDC", "USD"] {
        if let Some(base) = symbol.strip_suffix(quote) {
            if !base.is_empty() {
                return (base.to_string(), quote.to_string());
            }
        }
    }
    (symbol.to_string(), "USDT".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_split_handles_known_quotes() {
        assert_eq!(split_canonical("BTCUSDT"), ("BTC".into(), "USDT".into()));
        assert_eq!(split_canonical("ETHUSDC"), ("ETH".into(), "USDC".into()));
        assert_eq!(split_canonical("WEIRD"), ("WEIRD".into(), "USDT".into()));
    }
}
