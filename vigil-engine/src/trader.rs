//! Order placement, fill monitoring and in-trade position management.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use vigil_broker::{
    retry, AdapterError, EntryRequest, ProtectiveRequest, ProtectiveRole,
};
use vigil_config::StrategyDoc;
use vigil_core::{
    client_order_id, parse_client_order_id, AckStatus, CancelHint, Environment, ExitReason,
    OpenOrder, OrderKind, OrderSide, PosKey, Position, PositionStatus, Price, ProtectiveKind,
    Side, SignalSnapshot, SlotId, TradeRecord,
};
use vigil_store::StoreError;

use crate::risk::{RiskGate, RiskVeto, StarterScaling};
use crate::{EngineError, EngineResult, ProfileRuntime, SymbolLocks};

/// Relative tolerance when matching an exit price against SL/TP levels and
/// when adopting an existing protective order by trigger price.
const EXIT_MATCH_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 3); // 0.001
/// Retries when confirming a closure against trade history.
const CLOSE_CONFIRM_ATTEMPTS: u32 = 3;
/// Freshly placed orders are never reaped; their store row may still be in
/// flight on another task.
const REAPER_GRACE_MS: i64 = 120_000;

/// Places, monitors and manages orders for one profile.
pub struct Trader {
    ctx: Arc<ProfileRuntime>,
    risk: Arc<RiskGate>,
    locks: Arc<SymbolLocks>,
    /// Last protective-order placement attempt per position id; enforces the
    /// per-position creation cooldown.
    protection_attempts: Mutex<HashMap<i64, Instant>>,
    disabled: AtomicBool,
}

impl Trader {
    #[must_use]
    pub fn new(ctx: Arc<ProfileRuntime>, risk: Arc<RiskGate>, locks: Arc<SymbolLocks>) -> Self {
        Self {
            ctx,
            risk,
            locks,
            protection_attempts: Mutex::new(HashMap::new()),
            disabled: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn ctx(&self) -> &Arc<ProfileRuntime> {
        &self.ctx
    }

    #[must_use]
    pub fn risk(&self) -> &Arc<RiskGate> {
        &self.risk
    }

    #[must_use]
    pub(crate) fn locks(&self) -> &Arc<SymbolLocks> {
        &self.locks
    }

    /// Whether this profile has been disabled for the rest of the run.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    fn live(&self) -> bool {
        !self.ctx.is_dry_run()
    }

    /// Venue mutations are a logic error in dry-run. Returns false (and
    /// trips a debug assertion) when the caller must skip the call.
    fn mutation_allowed(&self, op: &str) -> bool {
        if self.live() {
            return true;
        }
        debug_assert!(false, "venue mutation '{op}' attempted in dry-run");
        error!(op, "venue mutation attempted in dry-run, skipping");
        false
    }

    /// Auth failures disable the whole profile; everything else just logs.
    fn note_adapter_error(&self, err: &AdapterError) {
        if matches!(err, AdapterError::Auth(_)) && !self.disabled.swap(true, Ordering::SeqCst) {
            error!(profile = %self.ctx.profile.name, error = %err, "authentication failed, disabling profile");
            self.ctx.notifier.send(format!(
                "AUTH ERROR | {} | profile {} disabled for this run",
                self.ctx.venue().to_uppercase(),
                self.ctx.profile.name
            ));
        }
    }

    fn client_id(&self, symbol: &str, side: OrderSide, bump_ms: i64) -> String {
        client_order_id(
            self.ctx.profile.environment,
            self.ctx.venue(),
            symbol,
            side,
            Utc::now().timestamp_millis() + bump_ms,
        )
    }

    fn strategy(&self) -> Arc<StrategyDoc> {
        self.ctx.strategy.current()
    }

    // ------------------------------------------------------------------
    // Opening
    // ------------------------------------------------------------------

    /// Open a position for a slot, subject to the full precondition chain.
    /// Returns `None` when a precondition (not an error) stopped the entry.
    pub async fn open(
        &self,
        slot: &SlotId,
        signal: &SignalSnapshot,
    ) -> EngineResult<Option<Position>> {
        if self.is_disabled() {
            return Err(EngineError::ProfileDisabled(self.ctx.profile.name.clone()));
        }
        let Some(side) = signal.side.position_side() else {
            return Ok(None);
        };
        let symbol = slot.symbol();
        let guard = self.locks.guard(slot.profile_id, &symbol);
        let _held = guard.lock().await;

        if let Some(reason) = self.risk.frozen_reason() {
            debug!(%symbol, %reason, "entry blocked by risk gate");
            return Err(EngineError::Vetoed(RiskVeto::AccountFrozen(reason)));
        }
        let now = Utc::now();
        if let Some(until) = self.risk.cooldown(&symbol, now)? {
            debug!(%symbol, %until, "entry blocked by cooldown");
            return Err(EngineError::Vetoed(RiskVeto::Cooldown(until)));
        }
        // Slot vacancy plus the global one-position-per-symbol guard.
        if self
            .ctx
            .store
            .get_active(slot.profile_id, &slot.pos_key())?
            .is_some()
        {
            return Ok(None);
        }
        if !self
            .ctx
            .store
            .list_open_by_symbol(slot.profile_id, &symbol)?
            .is_empty()
        {
            debug!(%symbol, "another timeframe already holds this symbol");
            return Ok(None);
        }
        // Pre-trade venue check: a position or order we do not know about
        // means local state is stale. Skip and let reconciliation adopt it.
        if self.live() {
            let venue_positions = self.ctx.adapter.fetch_positions().await.map_err(|err| {
                self.note_adapter_error(&err);
                err
            })?;
            if venue_positions.iter().any(|p| p.symbol == symbol) {
                warn!(%symbol, "venue already holds a position for this symbol, skipping entry");
                return Ok(None);
            }
        }

        let Some(price) = self.ctx.market.last_price(&symbol).await else {
            debug!(%symbol, "no market price, skipping entry");
            return Ok(None);
        };

        let strategy = self.strategy();
        // A flip of the previous trade's direction on this symbol enters
        // cautiously: less leverage, half the margin, tighter stop.
        let is_reversal = self
            .ctx
            .store
            .last_trade_side(slot.profile_id, &symbol)?
            .is_some_and(|last| last != side);
        let starter = is_reversal.then(|| StarterScaling {
            leverage_factor: self.ctx.engine_cfg.starter_leverage_factor,
            margin_factor: self.ctx.engine_cfg.starter_margin_factor,
        });

        let adapter = self.ctx.adapter.as_ref();
        let sized = match self.risk.size_entry(
            &strategy,
            signal.score,
            price,
            adapter,
            &symbol,
            starter,
        ) {
            Ok(sized) => sized,
            Err(veto) => {
                debug!(%symbol, %veto, "entry vetoed by sizing");
                return Err(EngineError::Vetoed(veto));
            }
        };

        // Limit entries rest below (long) or above (short) the market; SL/TP
        // always derive from the actual entry price, never the market print.
        let use_limit = self.ctx.engine_cfg.use_limit_orders;
        let entry_price = if use_limit {
            let patience = self.ctx.engine_cfg.patience_entry_pct;
            let raw = match side {
                Side::Long => price * (Decimal::ONE - patience),
                Side::Short => price * (Decimal::ONE + patience),
            };
            adapter.price_to_precision(&symbol, raw)
        } else {
            price
        };
        let sl_scale = if is_reversal {
            self.ctx.engine_cfg.starter_sl_factor
        } else {
            Decimal::ONE
        };
        let sl_pct = strategy.sl_pct * sl_scale;
        let (sl_price, tp_price) = match side {
            Side::Long => (
                entry_price * (Decimal::ONE - sl_pct),
                entry_price * (Decimal::ONE + strategy.tp_pct),
            ),
            Side::Short => (
                entry_price * (Decimal::ONE + sl_pct),
                entry_price * (Decimal::ONE - strategy.tp_pct),
            ),
        };
        let sl_price = adapter.price_to_precision(&symbol, sl_price);
        let tp_price = adapter.price_to_precision(&symbol, tp_price);

        let mut position = Position {
            id: 0,
            profile_id: slot.profile_id,
            pos_key: slot.pos_key(),
            symbol: symbol.clone(),
            side,
            qty: sized.qty,
            entry_price,
            sl_price,
            tp_price,
            leverage: sized.leverage,
            margin_mode: vigil_core::MarginMode::Isolated,
            timeframe: slot.timeframe,
            status: if use_limit {
                PositionStatus::Pending
            } else {
                PositionStatus::Active
            },
            order_kind: if use_limit {
                OrderKind::Limit
            } else {
                OrderKind::Market
            },
            entry_order_id: None,
            sl_order_id: None,
            tp_order_id: None,
            entry_time: now,
            entry_confidence: signal.confidence,
            feature_snapshot: signal.features.clone(),
            config_version: strategy.version,
            profit_locked: false,
            tp_extended: false,
            sl_tightened: false,
        };
        position.validate().map_err(|err| EngineError::Invalid(err.to_string()))?;

        if self.live() {
            self.place_live_entry(&mut position).await?;
        } else {
            // Dry-run: no venue round-trips; market entries fill instantly,
            // limit entries wait for the monitor to observe a cross.
            position.entry_order_id = Some(self.client_id(&symbol, side.entry_order_side(), 0));
            if position.status == PositionStatus::Active {
                position.sl_order_id = Some(self.client_id(&symbol, side.exit_order_side(), 1));
                position.tp_order_id = Some(self.client_id(&symbol, side.exit_order_side(), 2));
            }
        }

        match self.ctx.store.upsert_active(&mut position) {
            Ok(_) => {}
            Err(StoreError::ConflictActiveExists(key)) => {
                // Lost a race despite the guards; roll the venue back.
                warn!(%key, "slot filled concurrently, cancelling fresh entry");
                if self.live() {
                    if let Some(entry_id) = &position.entry_order_id {
                        let _ = self
                            .ctx
                            .adapter
                            .cancel_order(&symbol, entry_id, CancelHint::Auto)
                            .await;
                    }
                }
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        }

        if is_reversal {
            info!(%symbol, %side, leverage = position.leverage, "starter reversal entry");
        }
        info!(
            %symbol,
            %side,
            status = %position.status,
            entry = %position.entry_price,
            sl = %position.sl_price,
            tp = %position.tp_price,
            qty = %position.qty,
            "entry submitted"
        );
        self.ctx.notifier.send(vigil_notify::format_order_placed(
            &position,
            self.ctx.venue(),
            self.ctx.is_dry_run(),
        ));
        Ok(Some(position))
    }

    async fn place_live_entry(&self, position: &mut Position) -> EngineResult<()> {
        let adapter = &self.ctx.adapter;
        let symbol = position.symbol.clone();
        let leverage = position.leverage;
        let margin_mode = position.margin_mode;
        retry::with_backoff("set_leverage", retry::DEFAULT_MAX_ATTEMPTS, || {
            adapter.set_leverage(&symbol, leverage)
        })
        .await
        .map_err(|err| {
            self.note_adapter_error(&err);
            err
        })?;
        retry::with_backoff("set_margin_mode", retry::DEFAULT_MAX_ATTEMPTS, || {
            adapter.set_margin_mode(&symbol, margin_mode)
        })
        .await
        .map_err(|err| {
            self.note_adapter_error(&err);
            err
        })?;

        let attach = adapter.supports_attached_protection();
        let request = EntryRequest {
            symbol: symbol.clone(),
            side: position.side.entry_order_side(),
            qty: position.qty,
            price: (position.order_kind == OrderKind::Limit).then_some(position.entry_price),
            leverage: position.leverage,
            margin_mode: position.margin_mode,
            attached_sl: attach.then_some(position.sl_price),
            attached_tp: attach.then_some(position.tp_price),
            client_order_id: self.client_id(&symbol, position.side.entry_order_side(), 0),
        };
        let ack = adapter.place_entry(request).await.map_err(|err| {
            self.note_adapter_error(&err);
            err
        })?;
        position.entry_order_id = Some(ack.order_id);
        if ack.status == AckStatus::Filled {
            position.status = PositionStatus::Active;
            if !attach {
                self.place_separate_protection(position).await;
            }
        }
        Ok(())
    }

    /// Place SL and TP as standalone reduce-only orders. Failures are logged
    /// and left for the repair path rather than failing the entry.
    async fn place_separate_protection(&self, position: &mut Position) {
        let close_side = position.side.exit_order_side();
        for (kind, trigger, bump) in [
            (ProtectiveRole::StopLoss, position.sl_price, 1),
            (ProtectiveRole::TakeProfit, position.tp_price, 2),
        ] {
            let request = ProtectiveRequest {
                symbol: position.symbol.clone(),
                side: close_side,
                qty: position.qty,
                trigger_price: Some(trigger),
                kind,
                client_order_id: self.client_id(&position.symbol, close_side, bump),
            };
            match self.ctx.adapter.place_reduce_only(request).await {
                Ok(ack) => match kind {
                    ProtectiveRole::StopLoss => position.sl_order_id = Some(ack.order_id),
                    ProtectiveRole::TakeProfit => position.tp_order_id = Some(ack.order_id),
                    ProtectiveRole::Close => {}
                },
                Err(err) => {
                    self.note_adapter_error(&err);
                    warn!(
                        symbol = %position.symbol,
                        ?kind,
                        error = %err,
                        "failed to place protective order, repair will retry"
                    );
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Pending entries
    // ------------------------------------------------------------------

    /// Signal-driven review of a pending entry. Strong reversals cancel
    /// immediately; weak opposition and signal decay only cancel once the
    /// order has rested for `min_pending_secs`, to avoid churn.
    pub async fn review_pending(
        &self,
        slot: &SlotId,
        signal: &SignalSnapshot,
    ) -> EngineResult<()> {
        let Some(position) = self
            .ctx
            .store
            .get_active(slot.profile_id, &slot.pos_key())?
        else {
            return Ok(());
        };
        if position.status != PositionStatus::Pending {
            return Ok(());
        }
        let strong_reversal = signal.side.opposes(position.side)
            && signal.confidence > self.ctx.engine_cfg.strong_reversal_threshold;
        let age_secs = (Utc::now() - position.entry_time).num_seconds().max(0) as u64;
        let rested = age_secs >= self.ctx.engine_cfg.min_pending_secs;
        let weak_opposition = signal.side.opposes(position.side);
        let invalidated = signal.side == vigil_core::SignalSide::None
            || signal.confidence < self.ctx.engine_cfg.invalidation_threshold;

        let reason = if strong_reversal {
            Some(format!("strong reversal signal ({:.2})", signal.confidence))
        } else if rested && weak_opposition {
            Some("opposite signal after rest period".to_string())
        } else if rested && invalidated {
            Some(format!("signal invalidated ({:.2})", signal.confidence))
        } else {
            None
        };
        if let Some(reason) = reason {
            self.cancel_pending(position, &reason).await?;
        }
        Ok(())
    }

    /// One pass of the pending-fill monitor over every pending entry of this
    /// profile: detect fills, external cancellations and hard timeouts.
    pub async fn poll_pending(&self) -> EngineResult<()> {
        let pending: Vec<Position> = self
            .ctx
            .store
            .list_open(self.ctx.profile.id)?
            .into_iter()
            .filter(|p| p.status == PositionStatus::Pending)
            .collect();
        for position in pending {
            if let Err(err) = self.poll_one_pending(position).await {
                warn!(error = %err, "pending monitor pass failed");
            }
        }
        Ok(())
    }

    async fn poll_one_pending(&self, mut position: Position) -> EngineResult<()> {
        let guard = self.locks.guard(position.profile_id, &position.symbol);
        let _held = guard.lock().await;
        // Re-read under the lock; the slot loop may have cancelled it.
        let Some(current) = self
            .ctx
            .store
            .get_active(position.profile_id, &position.pos_key)?
        else {
            return Ok(());
        };
        if current.status != PositionStatus::Pending {
            return Ok(());
        }
        position = current;

        if !self.live() {
            // Simulated fill: the mark crossing the limit fills at the limit.
            let Some(price) = self.ctx.market.last_price(&position.symbol).await else {
                return Ok(());
            };
            let crossed = match position.side {
                Side::Long => price <= position.entry_price,
                Side::Short => price >= position.entry_price,
            };
            if crossed {
                position.status = PositionStatus::Active;
                position.sl_order_id =
                    Some(self.client_id(&position.symbol, position.side.exit_order_side(), 1));
                position.tp_order_id =
                    Some(self.client_id(&position.symbol, position.side.exit_order_side(), 2));
                self.ctx.store.upsert_active(&mut position)?;
                self.notify_filled(&position);
                return Ok(());
            }
            return self.check_pending_timeout(position).await;
        }

        let orders = self
            .ctx
            .adapter
            .fetch_open_orders(Some(&position.symbol))
            .await
            .map_err(|err| {
                self.note_adapter_error(&err);
                err
            })?;
        let entry_id = position.entry_order_id.clone().unwrap_or_default();
        let entry_resting = orders.iter().any(|o| o.order_id == entry_id);
        if entry_resting {
            return self.check_pending_timeout(position).await;
        }

        // Entry left the book: either it filled into a position or it was
        // cancelled externally.
        let venue_positions = self.ctx.adapter.fetch_positions().await.map_err(|err| {
            self.note_adapter_error(&err);
            err
        })?;
        let filled = venue_positions
            .iter()
            .find(|p| p.symbol == position.symbol && p.side == position.side);
        if let Some(venue_pos) = filled {
            position.status = PositionStatus::Active;
            // Resize to what actually filled; partial fills shrink the
            // protective orders with the position.
            position.qty = venue_pos.qty;
            if venue_pos.entry_price > Decimal::ZERO {
                position.entry_price = venue_pos.entry_price;
            }
            if !self.ctx.adapter.supports_attached_protection() {
                self.place_separate_protection(&mut position).await;
            }
            self.ctx.store.upsert_active(&mut position)?;
            self.notify_filled(&position);
        } else {
            info!(symbol = %position.symbol, "pending entry disappeared without fill, finalizing as cancelled");
            self.cleanup_protection(&position).await;
            self.ctx
                .store
                .finalize(position.id, PositionStatus::Cancelled, None)?;
        }
        Ok(())
    }

    async fn check_pending_timeout(&self, position: Position) -> EngineResult<()> {
        let age_secs = (Utc::now() - position.entry_time).num_seconds().max(0) as u64;
        if age_secs >= self.ctx.engine_cfg.limit_order_timeout_secs {
            self.cancel_pending(position, "limit order timeout").await?;
        }
        Ok(())
    }

    fn notify_filled(&self, position: &Position) {
        info!(
            symbol = %position.symbol,
            entry = %position.entry_price,
            qty = %position.qty,
            "pending entry filled"
        );
        self.ctx.notifier.send(vigil_notify::format_position_filled(
            position,
            self.ctx.venue(),
            self.ctx.is_dry_run(),
        ));
    }

    /// Cancel a pending entry and its protective remnants, then finalize.
    pub async fn cancel_pending(&self, position: Position, reason: &str) -> EngineResult<()> {
        info!(symbol = %position.symbol, %reason, "cancelling pending entry");
        if self.live() {
            if let Some(entry_id) = &position.entry_order_id {
                match self
                    .ctx
                    .adapter
                    .cancel_order(&position.symbol, entry_id, CancelHint::Auto)
                    .await
                {
                    Ok(()) => {}
                    // Already gone on the venue; local cleanup proceeds.
                    Err(AdapterError::NotFound(_)) => {}
                    Err(err) => {
                        self.note_adapter_error(&err);
                        return Err(err.into());
                    }
                }
            }
            self.cleanup_protection(&position).await;
        }
        self.ctx
            .store
            .finalize(position.id, PositionStatus::Cancelled, None)?;
        self.ctx.notifier.send(vigil_notify::format_order_cancelled(
            &position,
            self.ctx.venue(),
            reason,
            self.ctx.is_dry_run(),
        ));
        Ok(())
    }

    /// Cancel protective order ids that may still rest on the venue. Parent-
    /// child venues auto-clean attached orders, so "not found" is expected.
    async fn cleanup_protection(&self, position: &Position) {
        if !self.mutation_allowed("cleanup_protection") {
            return;
        }
        for id in [&position.sl_order_id, &position.tp_order_id]
            .into_iter()
            .flatten()
        {
            match self
                .ctx
                .adapter
                .cancel_order(&position.symbol, id, CancelHint::Auto)
                .await
            {
                Ok(()) | Err(AdapterError::NotFound(_)) => {}
                Err(err) => {
                    self.note_adapter_error(&err);
                    warn!(order_id = %id, error = %err, "failed to clean protective order");
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Active position management
    // ------------------------------------------------------------------

    /// Per-tick management of an active position: signal-flip exit first,
    /// then protection repair and the one-shot SL/TP transitions.
    pub async fn manage_active(
        &self,
        slot: &SlotId,
        signal: &SignalSnapshot,
    ) -> EngineResult<()> {
        let Some(position) = self
            .ctx
            .store
            .get_active(slot.profile_id, &slot.pos_key())?
        else {
            return Ok(());
        };
        if position.status != PositionStatus::Active {
            return Ok(());
        }

        let strategy = self.strategy();
        if signal.side.opposes(position.side) && signal.score >= strategy.exit_score_threshold {
            info!(
                symbol = %position.symbol,
                score = signal.score,
                "signal flipped against position, force closing"
            );
            let closed = self
                .force_close(&position.pos_key, ExitReason::SignalFlip)
                .await?;
            if closed && signal.score >= strategy.entry_score_threshold {
                // Strong flip: re-enter the other way as a starter position.
                self.ctx.notifier.send(vigil_notify::format_starter_reversal(
                    &position.symbol,
                    position.side,
                    position.side.inverse(),
                    &ExitReason::SignalFlip,
                ));
                match self.open(slot, signal).await {
                    Ok(_) => {}
                    Err(EngineError::Vetoed(veto)) => {
                        debug!(symbol = %position.symbol, %veto, "starter re-entry vetoed");
                    }
                    Err(err) => return Err(err),
                }
            }
            return Ok(());
        }

        let Some(price) = self.ctx.market.last_price(&position.symbol).await else {
            return Ok(());
        };

        if !self.live() {
            return self.simulate_protective_exit(position, price).await;
        }

        let guard = self.locks.guard(position.profile_id, &position.symbol);
        let _held = guard.lock().await;
        let Some(mut position) = self
            .ctx
            .store
            .get_active(slot.profile_id, &slot.pos_key())?
        else {
            return Ok(());
        };
        self.ensure_protection(&mut position).await?;
        self.apply_profit_lock(&mut position, price).await?;
        self.apply_tp_extension(&mut position, slot).await?;
        self.apply_emergency_tighten(&mut position, signal).await?;
        Ok(())
    }

    /// Dry-run exits: price crossing a protective level realizes the trade.
    async fn simulate_protective_exit(
        &self,
        position: Position,
        price: Price,
    ) -> EngineResult<()> {
        let (sl_hit, tp_hit) = match position.side {
            Side::Long => (price <= position.sl_price, price >= position.tp_price),
            Side::Short => (price >= position.sl_price, price <= position.tp_price),
        };
        if !sl_hit && !tp_hit {
            return Ok(());
        }
        let (exit_price, reason) = if sl_hit {
            (position.sl_price, self.classify_exit(&position, position.sl_price))
        } else {
            (position.tp_price, ExitReason::Tp)
        };
        let pnl = position.side.signed_delta(position.entry_price, exit_price) * position.qty;
        let trade = self.build_trade(&position, exit_price, pnl, Decimal::ZERO, reason);
        self.finalize_closed(&position, trade).await?;
        Ok(())
    }

    /// Classify an exit by proximity to the stored protective levels. A stop
    /// that was moved into profit counts as a take-profit-side realization:
    /// the cooldown exists for theses that failed, not for locked-in wins.
    #[must_use]
    pub fn classify_exit(&self, position: &Position, exit_price: Price) -> ExitReason {
        let near = |level: Price| {
            if level <= Decimal::ZERO {
                return false;
            }
            ((exit_price - level) / level).abs() <= EXIT_MATCH_TOLERANCE
        };
        if near(position.tp_price) {
            return ExitReason::Tp;
        }
        if near(position.sl_price) {
            let in_profit = position
                .side
                .signed_delta(position.entry_price, exit_price)
                > Decimal::ZERO;
            return if in_profit { ExitReason::Tp } else { ExitReason::Sl };
        }
        ExitReason::Manual
    }

    pub(crate) fn build_trade(
        &self,
        position: &Position,
        exit_price: Price,
        pnl: Decimal,
        fees: Decimal,
        exit_reason: ExitReason,
    ) -> TradeRecord {
        TradeRecord {
            pos_key: position.pos_key.clone(),
            symbol: position.symbol.clone(),
            side: position.side,
            qty: position.qty,
            entry_price: position.entry_price,
            exit_price,
            pnl,
            fees,
            leverage: position.leverage,
            exit_reason,
            entry_time: position.entry_time,
            exit_time: Utc::now(),
            feature_snapshot: position.feature_snapshot.clone(),
        }
    }

    /// Finalize a closed position: ledger row, daily-loss accounting, the
    /// SL cooldown when the thesis failed, and the notification.
    pub async fn finalize_closed(
        &self,
        position: &Position,
        trade: TradeRecord,
    ) -> EngineResult<()> {
        self.ctx
            .store
            .finalize(position.id, PositionStatus::Closed, Some(&trade))?;
        self.risk.record_closed_trade(&trade)?;
        if trade.exit_reason == ExitReason::Sl {
            let until = self.risk.start_cooldown(&position.symbol, Utc::now())?;
            info!(symbol = %position.symbol, %until, "stop loss realized, cooldown started");
        }
        info!(
            symbol = %position.symbol,
            reason = %trade.exit_reason,
            pnl = %trade.pnl,
            "position closed"
        );
        self.ctx.notifier.send(vigil_notify::format_position_closed(
            &trade,
            self.ctx.venue(),
            self.ctx.is_dry_run(),
        ));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Protection lifecycle
    // ------------------------------------------------------------------

    /// Make sure both protective orders exist on the venue, adopting ids the
    /// venue created (attached protection) and recreating missing ones. New
    /// placements honor the per-position creation cooldown so a flapping
    /// order fetch cannot spam the venue.
    pub async fn ensure_protection(&self, position: &mut Position) -> EngineResult<()> {
        if position.status != PositionStatus::Active || !self.live() {
            return Ok(());
        }
        let orders = self
            .ctx
            .adapter
            .fetch_open_orders(Some(&position.symbol))
            .await
            .map_err(|err| {
                self.note_adapter_error(&err);
                err
            })?;
        let mut changed = false;
        for kind in [ProtectiveKind::StopLoss, ProtectiveKind::TakeProfit] {
            let level = match kind {
                ProtectiveKind::StopLoss => position.sl_price,
                ProtectiveKind::TakeProfit => position.tp_price,
            };
            let existing_id = match kind {
                ProtectiveKind::StopLoss => position.sl_order_id.clone(),
                ProtectiveKind::TakeProfit => position.tp_order_id.clone(),
            };
            if existing_id.is_some_and(|id| orders.iter().any(|o| o.order_id == id)) {
                continue;
            }
            // Prefer adopting an existing reduce-only trigger at this level;
            // parent-child venues create these without telling us the id.
            if let Some(found) = find_protective_order(&orders, position, level) {
                let order_id = found.order_id.clone();
                match kind {
                    ProtectiveKind::StopLoss => position.sl_order_id = Some(order_id),
                    ProtectiveKind::TakeProfit => position.tp_order_id = Some(order_id),
                }
                changed = true;
                continue;
            }
            if !self.protection_cooldown_elapsed(position.id) {
                debug!(
                    symbol = %position.symbol,
                    ?kind,
                    "protective order missing but creation cooldown active"
                );
                continue;
            }
            self.stamp_protection_attempt(position.id);
            warn!(symbol = %position.symbol, ?kind, "protective order missing, recreating");
            let close_side = position.side.exit_order_side();
            let request = ProtectiveRequest {
                symbol: position.symbol.clone(),
                side: close_side,
                qty: position.qty,
                trigger_price: Some(level),
                kind: match kind {
                    ProtectiveKind::StopLoss => ProtectiveRole::StopLoss,
                    ProtectiveKind::TakeProfit => ProtectiveRole::TakeProfit,
                },
                client_order_id: self.client_id(&position.symbol, close_side, 0),
            };
            match self.ctx.adapter.place_reduce_only(request).await {
                Ok(ack) => {
                    match kind {
                        ProtectiveKind::StopLoss => position.sl_order_id = Some(ack.order_id),
                        ProtectiveKind::TakeProfit => position.tp_order_id = Some(ack.order_id),
                    }
                    changed = true;
                }
                Err(err) => {
                    self.note_adapter_error(&err);
                    warn!(symbol = %position.symbol, ?kind, error = %err, "protective recreation failed");
                }
            }
        }
        if changed {
            self.ctx.store.upsert_active(position)?;
        }
        Ok(())
    }

    fn protection_cooldown_elapsed(&self, position_id: i64) -> bool {
        let attempts = self
            .protection_attempts
            .lock()
            .expect("protection attempts poisoned");
        attempts.get(&position_id).is_none_or(|last| {
            last.elapsed().as_secs() >= self.ctx.engine_cfg.protection_cooldown_secs
        })
    }

    fn stamp_protection_attempt(&self, position_id: i64) {
        self.protection_attempts
            .lock()
            .expect("protection attempts poisoned")
            .insert(position_id, Instant::now());
    }

    /// Cancel-and-replace one protective order at a new trigger, resized to
    /// the current position quantity. The store row is updated in the same
    /// write as the new order id.
    async fn replace_protective(
        &self,
        position: &mut Position,
        kind: ProtectiveKind,
        new_level: Price,
    ) -> EngineResult<()> {
        let new_level = self
            .ctx
            .adapter
            .price_to_precision(&position.symbol, new_level);
        if self.live() {
            let old_id = match kind {
                ProtectiveKind::StopLoss => position.sl_order_id.clone(),
                ProtectiveKind::TakeProfit => position.tp_order_id.clone(),
            };
            if let Some(old_id) = old_id {
                match self
                    .ctx
                    .adapter
                    .cancel_order(&position.symbol, &old_id, CancelHint::Auto)
                    .await
                {
                    Ok(()) | Err(AdapterError::NotFound(_)) => {}
                    Err(err) => {
                        self.note_adapter_error(&err);
                        return Err(err.into());
                    }
                }
            }
            let close_side = position.side.exit_order_side();
            let ack = self
                .ctx
                .adapter
                .place_reduce_only(ProtectiveRequest {
                    symbol: position.symbol.clone(),
                    side: close_side,
                    qty: position.qty,
                    trigger_price: Some(new_level),
                    kind: match kind {
                        ProtectiveKind::StopLoss => ProtectiveRole::StopLoss,
                        ProtectiveKind::TakeProfit => ProtectiveRole::TakeProfit,
                    },
                    client_order_id: self.client_id(&position.symbol, close_side, 0),
                })
                .await
                .map_err(|err| {
                    self.note_adapter_error(&err);
                    err
                })?;
            match kind {
                ProtectiveKind::StopLoss => position.sl_order_id = Some(ack.order_id),
                ProtectiveKind::TakeProfit => position.tp_order_id = Some(ack.order_id),
            }
        }
        match kind {
            ProtectiveKind::StopLoss => position.sl_price = new_level,
            ProtectiveKind::TakeProfit => position.tp_price = new_level,
        }
        self.ctx.store.upsert_active(position)?;
        Ok(())
    }

    /// One-shot: once price has travelled 80% of the way to TP, move the
    /// stop into profit so the trade can no longer round-trip to a loss.
    async fn apply_profit_lock(&self, position: &mut Position, price: Price) -> EngineResult<()> {
        if !self.ctx.engine_cfg.enable_profit_lock || position.profit_locked {
            return Ok(());
        }
        if position.tp_travel_fraction(price) < self.ctx.engine_cfg.profit_lock_threshold {
            return Ok(());
        }
        let target = position
            .side
            .signed_delta(position.entry_price, position.tp_price);
        let lock_offset = target * self.ctx.engine_cfg.profit_lock_level;
        let new_sl = match position.side {
            Side::Long => position.entry_price + lock_offset,
            Side::Short => position.entry_price - lock_offset,
        };
        info!(
            symbol = %position.symbol,
            old_sl = %position.sl_price,
            new_sl = %new_sl,
            "profit lock engaged"
        );
        position.profit_locked = true;
        self.replace_protective(position, ProtectiveKind::StopLoss, new_sl)
            .await
    }

    /// One-shot: extend TP toward a structural level in the profit
    /// direction, capped at 1.5x the original distance.
    async fn apply_tp_extension(&self, position: &mut Position, slot: &SlotId) -> EngineResult<()> {
        if position.tp_extended {
            return Ok(());
        }
        let Some(levels) = self.ctx.market.structural_levels(slot).await else {
            return Ok(());
        };
        let structural = match position.side {
            Side::Long => levels.resistance,
            Side::Short => levels.support,
        };
        let atr_candidate = levels.atr.map(|atr| {
            let offset = atr * self.ctx.engine_cfg.atr_extension_multiplier;
            match position.side {
                Side::Long => position.tp_price + offset,
                Side::Short => position.tp_price - offset,
            }
        });
        let Some(candidate) = structural.or(atr_candidate) else {
            return Ok(());
        };
        // Only extensions, never retractions.
        let beyond = position
            .side
            .signed_delta(position.tp_price, candidate)
            > Decimal::ZERO;
        if !beyond {
            return Ok(());
        }
        let original = position
            .side
            .signed_delta(position.entry_price, position.tp_price);
        let cap_distance = original * self.ctx.engine_cfg.tp_extension_cap;
        let candidate_distance = position
            .side
            .signed_delta(position.entry_price, candidate)
            .min(cap_distance);
        let new_tp = match position.side {
            Side::Long => position.entry_price + candidate_distance,
            Side::Short => position.entry_price - candidate_distance,
        };
        info!(
            symbol = %position.symbol,
            old_tp = %position.tp_price,
            new_tp = %new_tp,
            "extending take profit toward structure"
        );
        position.tp_extended = true;
        self.replace_protective(position, ProtectiveKind::TakeProfit, new_tp)
            .await
    }

    /// One-shot: when conviction halves, pull the stop halfway to entry.
    /// Skipped once the stop sits in profit; the lock already won.
    async fn apply_emergency_tighten(
        &self,
        position: &mut Position,
        signal: &SignalSnapshot,
    ) -> EngineResult<()> {
        if position.sl_tightened || position.entry_confidence <= 0.0 {
            return Ok(());
        }
        if signal.confidence >= position.entry_confidence * 0.5 {
            return Ok(());
        }
        let sl_in_loss = position
            .side
            .signed_delta(position.entry_price, position.sl_price)
            < Decimal::ZERO;
        if !sl_in_loss {
            return Ok(());
        }
        let new_sl = (position.sl_price + position.entry_price) / Decimal::from(2u8);
        info!(
            symbol = %position.symbol,
            confidence = signal.confidence,
            entry_confidence = position.entry_confidence,
            new_sl = %new_sl,
            "confidence collapsed, tightening stop"
        );
        position.sl_tightened = true;
        self.replace_protective(position, ProtectiveKind::StopLoss, new_sl)
            .await
    }

    // ------------------------------------------------------------------
    // Closing
    // ------------------------------------------------------------------

    /// Force-close an active position at market. Live closes are confirmed
    /// against trade history so the ledger never records an unattested win;
    /// when confirmation lags, the row parks in WAITING_SYNC for the
    /// reconciler to finish.
    pub async fn force_close(&self, pos_key: &PosKey, reason: ExitReason) -> EngineResult<bool> {
        let Some(position) = self.ctx.store.get_active(self.ctx.profile.id, pos_key)? else {
            return Ok(false);
        };
        if position.status != PositionStatus::Active {
            return Ok(false);
        }
        let guard = self.locks.guard(position.profile_id, &position.symbol);
        let _held = guard.lock().await;
        let Some(position) = self.ctx.store.get_active(self.ctx.profile.id, pos_key)? else {
            return Ok(false);
        };

        if !self.live() {
            let Some(price) = self.ctx.market.last_price(&position.symbol).await else {
                return Ok(false);
            };
            let pnl = position.side.signed_delta(position.entry_price, price) * position.qty;
            let trade = self.build_trade(&position, price, pnl, Decimal::ZERO, reason);
            self.finalize_closed(&position, trade).await?;
            return Ok(true);
        }

        self.cleanup_protection(&position).await;
        let close_side = position.side.exit_order_side();
        let ack = self
            .ctx
            .adapter
            .place_reduce_only(ProtectiveRequest {
                symbol: position.symbol.clone(),
                side: close_side,
                qty: position.qty,
                trigger_price: None,
                kind: ProtectiveRole::Close,
                client_order_id: self.client_id(&position.symbol, close_side, 0),
            })
            .await
            .map_err(|err| {
                self.note_adapter_error(&err);
                err
            })?;

        // The authority on the realized result is trade history, not the
        // price we happened to see.
        for attempt in 0..CLOSE_CONFIRM_ATTEMPTS {
            match self
                .ctx
                .adapter
                .fetch_my_trades(&position.symbol, position.entry_time)
                .await
            {
                Ok(fills) => {
                    let closing: Vec<_> = fills
                        .iter()
                        .filter(|f| f.order_id == ack.order_id)
                        .collect();
                    if !closing.is_empty() {
                        let qty: Decimal = closing.iter().map(|f| f.qty).sum();
                        let notional: Decimal =
                            closing.iter().map(|f| f.price * f.qty).sum();
                        let fees: Decimal = closing.iter().map(|f| f.fee).sum();
                        let exit_price = notional / qty;
                        let pnl = position
                            .side
                            .signed_delta(position.entry_price, exit_price)
                            * qty
                            - fees;
                        let trade =
                            self.build_trade(&position, exit_price, pnl, fees, reason);
                        self.finalize_closed(&position, trade).await?;
                        return Ok(true);
                    }
                }
                Err(err) => {
                    self.note_adapter_error(&err);
                    warn!(attempt, error = %err, "close confirmation fetch failed");
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        }
        warn!(
            symbol = %position.symbol,
            order_id = %ack.order_id,
            "close submitted but not yet visible in trade history, parking for sync"
        );
        self.ctx
            .store
            .mark_waiting_sync(position.id, "close submitted, awaiting fill confirmation")?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Orphan reaper
    // ------------------------------------------------------------------

    /// Cancel resting orders that correspond to no managed position: stale
    /// engine orders anywhere, and unmanaged orders outside the profile's
    /// universe. Batch-limited and paced to stay clear of rate limits.
    pub async fn reap_orphans(&self) -> EngineResult<usize> {
        if !self.live() {
            return Ok(0);
        }
        let orders = self
            .ctx
            .adapter
            .fetch_open_orders(None)
            .await
            .map_err(|err| {
                self.note_adapter_error(&err);
                err
            })?;
        let open_positions = self.ctx.store.list_open(self.ctx.profile.id)?;
        let now_ms = Utc::now().timestamp_millis();

        let mut cancelled = 0usize;
        for order in orders {
            if cancelled >= self.ctx.engine_cfg.reaper_batch_limit {
                debug!("reaper batch limit reached, deferring remainder to next sweep");
                break;
            }
            if !self.is_orphan(&order, &open_positions, now_ms) {
                continue;
            }
            let guard = self.locks.guard(self.ctx.profile.id, &order.symbol);
            let _held = guard.lock().await;
            info!(
                symbol = %order.symbol,
                order_id = %order.order_id,
                client_id = ?order.client_order_id,
                "reaping orphan order"
            );
            match self
                .ctx
                .adapter
                .cancel_order(&order.symbol, &order.order_id, CancelHint::Auto)
                .await
            {
                Ok(()) | Err(AdapterError::NotFound(_)) => cancelled += 1,
                Err(err) => {
                    self.note_adapter_error(&err);
                    warn!(order_id = %order.order_id, error = %err, "orphan cancel failed");
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(
                self.ctx.engine_cfg.reaper_spacing_ms,
            ))
            .await;
        }
        Ok(cancelled)
    }

    fn is_orphan(&self, order: &OpenOrder, open_positions: &[Position], now_ms: i64) -> bool {
        // Anything referenced by an open row is managed.
        let managed = open_positions.iter().any(|p| {
            [&p.entry_order_id, &p.sl_order_id, &p.tp_order_id]
                .into_iter()
                .flatten()
                .any(|id| *id == order.order_id)
                || order
                    .client_order_id
                    .as_deref()
                    .is_some_and(|cid| {
                        [&p.entry_order_id, &p.sl_order_id, &p.tp_order_id]
                            .into_iter()
                            .flatten()
                            .any(|id| *id == cid)
                    })
        });
        if managed {
            return false;
        }
        match order.client_order_id.as_deref().and_then(parse_client_order_id) {
            Some(parsed) => {
                // One of ours with no backing row. Give in-flight placements
                // a grace window before declaring it orphaned.
                parsed.environment == Environment::Live
                    && now_ms - parsed.ts_ms > REAPER_GRACE_MS
            }
            None => {
                // Foreign order: only touch it outside the traded universe.
                !self.ctx.universe.contains(&order.symbol)
            }
        }
    }
}

/// Find a resting reduce-only trigger order matching a protective level.
fn find_protective_order<'a>(
    orders: &'a [OpenOrder],
    position: &Position,
    level: Price,
) -> Option<&'a OpenOrder> {
    let close_side = position.side.exit_order_side();
    orders.iter().find(|order| {
        order.reduce_only
            && order.side == close_side
            && order.symbol == position.symbol
            && order.trigger_price.is_some_and(|trigger| {
                level > Decimal::ZERO && ((trigger - level) / level).abs() <= EXIT_MATCH_TOLERANCE
            })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use vigil_core::Timeframe;

    fn position(side: Side, sl: Price, tp: Price) -> Position {
        Position {
            id: 7,
            profile_id: 1,
            pos_key: PosKey::new(1, "PAPER", "BTC", "USDT", Timeframe::H1),
            symbol: "BTCUSDT".into(),
            side,
            qty: dec!(0.2),
            entry_price: dec!(100),
            sl_price: sl,
            tp_price: tp,
            leverage: 5,
            margin_mode: vigil_core::MarginMode::Isolated,
            timeframe: Timeframe::H1,
            status: PositionStatus::Active,
            order_kind: OrderKind::Market,
            entry_order_id: Some("e".into()),
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
    fn protective_order_matching_uses_relative_tolerance() {
        let pos = position(Side::Long, dec!(97), dec!(104));
        let orders = vec![OpenOrder {
            order_id: "sl-1".into(),
            client_order_id: None,
            symbol: "BTCUSDT".into(),
            side: OrderSide::Sell,
            qty: dec!(0.2),
            price: None,
            trigger_price: Some(dec!(97.05)),
            reduce_only: true,
            conditional: true,
            created_at: Utc::now(),
        }];
        assert!(find_protective_order(&orders, &pos, dec!(97)).is_some());
        assert!(find_protective_order(&orders, &pos, dec!(104)).is_none());
    }

    #[test]
    fn exit_match_tolerance_is_one_tenth_percent() {
        assert_eq!(EXIT_MATCH_TOLERANCE, dec!(0.001));
    }
}
