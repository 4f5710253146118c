//! Deterministic in-memory venue used by dry-run sessions and tests.
//!
//! The venue holds positions, a working-order book split into standard and
//! conditional queues, and a fill history that `fetch_my_trades` reports,
//! so the whole reconciliation path can be exercised without a network. Fills
//! are driven explicitly through [`PaperVenue::set_mark_price`]. Failures can
//! be scripted per operation to exercise retry and failover paths.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;
use uuid::Uuid;

use vigil_broker::{
    AdapterError, AdapterResult, EntryRequest, ExchangeAdapter, ProtectiveRequest, ProtectiveRole,
};
use vigil_core::{
    AccountBalance, AckStatus, CancelHint, ExchangePosition, MarginMode, OpenOrder, OrderAck,
    OrderSide, Price, Qty, Side, Symbol, VenueFill,
};

#[derive(Clone, Debug)]
struct WorkingOrder {
    order_id: String,
    client_order_id: String,
    symbol: Symbol,
    side: OrderSide,
    qty: Qty,
    price: Option<Price>,
    trigger_price: Option<Price>,
    role: Option<ProtectiveRole>,
    reduce_only: bool,
    conditional: bool,
    /// Entry order id this protective order is attached to, when the venue
    /// is configured as parent-child.
    parent_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl WorkingOrder {
    fn to_open_order(&self) -> OpenOrder {
        OpenOrder {
            order_id: self.order_id.clone(),
            client_order_id: Some(self.client_order_id.clone()),
            symbol: self.symbol.clone(),
            side: self.side,
            qty: self.qty,
            price: self.price,
            trigger_price: self.trigger_price,
            reduce_only: self.reduce_only,
            conditional: self.conditional,
            created_at: self.created_at,
        }
    }
}

#[derive(Default)]
struct VenueState {
    marks: HashMap<Symbol, Price>,
    positions: HashMap<Symbol, ExchangePosition>,
    orders: Vec<WorkingOrder>,
    fills: Vec<VenueFill>,
    balance: Decimal,
    leverage_calls: Vec<(Symbol, u32)>,
    margin_calls: Vec<Symbol>,
    mutations: Vec<String>,
    failures: VecDeque<(String, AdapterError)>,
}

/// In-memory exchange double.
pub struct PaperVenue {
    name: String,
    attached_protection: bool,
    min_notional: Decimal,
    state: Mutex<VenueState>,
}

impl PaperVenue {
    /// A paper venue that behaves like a parent-child exchange (attached
    /// SL/TP cancelled with the entry).
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attached_protection: true,
            min_notional: Decimal::from(5u8),
            state: Mutex::new(VenueState {
                balance: Decimal::from(10_000),
                ..VenueState::default()
            }),
        }
    }

    /// Switch the venue to algo-separate behavior: no attached protection,
    /// conditional orders invisible to standard cancels.
    #[must_use]
    pub fn without_attached_protection(mut self) -> Self {
        self.attached_protection = false;
        self
    }

    #[must_use]
    pub fn with_min_notional(mut self, value: Decimal) -> Self {
        self.min_notional = value;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VenueState> {
        self.state.lock().expect("paper venue poisoned")
    }

    /// Script the next failure for `op` (adapter method name).
    pub fn fail_next(&self, op: &str, err: AdapterError) {
        self.lock().failures.push_back((op.to_string(), err));
    }

    fn take_failure(&self, op: &str) -> AdapterResult<()> {
        let mut state = self.lock();
        if let Some(index) = state.failures.iter().position(|(name, _)| name == op) {
            let (_, err) = state.failures.remove(index).expect("index in range");
            return Err(err);
        }
        Ok(())
    }

    /// Move the mark price and settle whatever it touches: resting limits
    /// fill into positions, protective triggers close them.
    pub fn set_mark_price(&self, symbol: &str, price: Price) {
        let mut state = self.lock();
        state.marks.insert(symbol.to_string(), price);

        // 1. Fill resting limit entries the price has crossed.
        let mut filled_entries = Vec::new();
        state.orders.retain(|order| {
            if order.reduce_only || order.conditional {
                return true;
            }
            let crossed = match (order.side, order.price) {
                (OrderSide::Buy, Some(limit)) => price <= limit,
                (OrderSide::Sell, Some(limit)) => price >= limit,
                _ => false,
            };
            if crossed && order.symbol == symbol {
                filled_entries.push(order.clone());
                false
            } else {
                true
            }
        });
        for order in filled_entries {
            let fill_price = order.price.unwrap_or(price);
            Self::apply_entry_fill(&mut state, &order, fill_price);
        }

        // 2. Fire protective triggers.
        let mut fired = Vec::new();
        state.orders.retain(|order| {
            if !order.conditional || order.symbol != symbol {
                return true;
            }
            let Some(trigger) = order.trigger_price else {
                return true;
            };
            let hit = match (order.role, order.side) {
                (Some(ProtectiveRole::StopLoss), OrderSide::Sell) => price <= trigger,
                (Some(ProtectiveRole::TakeProfit), OrderSide::Sell) => price >= trigger,
                (Some(ProtectiveRole::StopLoss), OrderSide::Buy) => price >= trigger,
                (Some(ProtectiveRole::TakeProfit), OrderSide::Buy) => price <= trigger,
                _ => false,
            };
            if hit {
                fired.push(order.clone());
                false
            } else {
                true
            }
        });
        for order in fired {
            let fill_price = order.trigger_price.unwrap_or(price);
            Self::apply_reduce_fill(&mut state, &order, fill_price);
        }
    }

    fn apply_entry_fill(state: &mut VenueState, order: &WorkingOrder, fill_price: Price) {
        let side = match order.side {
            OrderSide::Buy => Side::Long,
            OrderSide::Sell => Side::Short,
        };
        state.positions.insert(
            order.symbol.clone(),
            ExchangePosition {
                symbol: order.symbol.clone(),
                side,
                qty: order.qty,
                entry_price: fill_price,
                leverage: 1,
                unrealized_pnl: Decimal::ZERO,
            },
        );
        state.fills.push(VenueFill {
            order_id: order.order_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            price: fill_price,
            qty: order.qty,
            fee: Decimal::ZERO,
            reduce_only: false,
            timestamp: Utc::now(),
        });
    }

    fn apply_reduce_fill(state: &mut VenueState, order: &WorkingOrder, fill_price: Price) {
        state.positions.remove(&order.symbol);
        state.fills.push(VenueFill {
            order_id: order.order_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            price: fill_price,
            qty: order.qty,
            fee: Decimal::ZERO,
            reduce_only: true,
            timestamp: Utc::now(),
        });
        // A flat position invalidates its remaining protective orders.
        let symbol = order.symbol.clone();
        state
            .orders
            .retain(|o| !(o.symbol == symbol && o.reduce_only));
    }

    /// Make a position vanish without any fill, as a phantom closure would.
    pub fn drop_position_silently(&self, symbol: &str) {
        self.lock().positions.remove(symbol);
    }

    /// Seed a position as if it had been opened outside the engine.
    pub fn seed_position(&self, position: ExchangePosition) {
        let mut state = self.lock();
        state.marks.insert(position.symbol.clone(), position.entry_price);
        state.positions.insert(position.symbol.clone(), position);
    }

    /// Seed a resting order, standard or conditional, e.g. a foreign order
    /// for reaper tests.
    pub fn seed_order(&self, order: OpenOrder) {
        self.lock().orders.push(WorkingOrder {
            order_id: order.order_id,
            client_order_id: order.client_order_id.unwrap_or_default(),
            symbol: order.symbol,
            side: order.side,
            qty: order.qty,
            price: order.price,
            trigger_price: order.trigger_price,
            role: None,
            reduce_only: order.reduce_only,
            conditional: order.conditional,
            parent_id: None,
            created_at: order.created_at,
        });
    }

    /// Append a fill to the history without touching positions. Used to
    /// model trade history arriving late (phantom closure verification).
    pub fn push_fill(&self, fill: VenueFill) {
        self.lock().fills.push(fill);
    }

    /// Mutating adapter calls recorded so far, in order.
    #[must_use]
    pub fn mutations(&self) -> Vec<String> {
        self.lock().mutations.clone()
    }

    #[must_use]
    pub fn open_order_ids(&self) -> Vec<String> {
        self.lock()
            .orders
            .iter()
            .map(|o| o.order_id.clone())
            .collect()
    }

    #[must_use]
    pub fn mark(&self, symbol: &str) -> Option<Price> {
        self.lock().marks.get(symbol).copied()
    }

    pub fn set_balance(&self, total: Decimal) {
        self.lock().balance = total;
    }

    fn record(state: &mut VenueState, event: String) {
        debug!(event = %event, "paper venue mutation");
        state.mutations.push(event);
    }
}

#[async_trait]
impl ExchangeAdapter for PaperVenue {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_attached_protection(&self) -> bool {
        self.attached_protection
    }

    async fn place_entry(&self, req: EntryRequest) -> AdapterResult<OrderAck> {
        self.take_failure("place_entry")?;
        let mut state = self.lock();
        let order_id = Uuid::new_v4().to_string();
        Self::record(
            &mut state,
            format!("place_entry {} {:?} {}", req.symbol, req.side, req.qty),
        );
        let is_limit = req.price.is_some();
        if is_limit {
            state.orders.push(WorkingOrder {
                order_id: order_id.clone(),
                client_order_id: req.client_order_id.clone(),
                symbol: req.symbol.clone(),
                side: req.side,
                qty: req.qty,
                price: req.price,
                trigger_price: None,
                role: None,
                reduce_only: false,
                conditional: false,
                parent_id: None,
                created_at: Utc::now(),
            });
        } else {
            let mark = state
                .marks
                .get(&req.symbol)
                .copied()
                .ok_or_else(|| AdapterError::InvalidParam(format!("no mark for {}", req.symbol)))?;
            let order = WorkingOrder {
                order_id: order_id.clone(),
                client_order_id: req.client_order_id.clone(),
                symbol: req.symbol.clone(),
                side: req.side,
                qty: req.qty,
                price: None,
                trigger_price: None,
                role: None,
                reduce_only: false,
                conditional: false,
                parent_id: None,
                created_at: Utc::now(),
            };
            Self::apply_entry_fill(&mut state, &order, mark);
        }
        if self.attached_protection {
            let close_side = req.side.inverse();
            for (role, trigger) in [
                (ProtectiveRole::StopLoss, req.attached_sl),
                (ProtectiveRole::TakeProfit, req.attached_tp),
            ] {
                if let Some(trigger) = trigger {
                    state.orders.push(WorkingOrder {
                        order_id: Uuid::new_v4().to_string(),
                        client_order_id: format!("{}-{:?}", req.client_order_id, role),
                        symbol: req.symbol.clone(),
                        side: close_side,
                        qty: req.qty,
                        price: None,
                        trigger_price: Some(trigger),
                        role: Some(role),
                        reduce_only: true,
                        conditional: true,
                        parent_id: is_limit.then(|| order_id.clone()),
                        created_at: Utc::now(),
                    });
                }
            }
        }
        Ok(OrderAck {
            order_id,
            status: if is_limit {
                AckStatus::Open
            } else {
                AckStatus::Filled
            },
        })
    }

    async fn place_reduce_only(&self, req: ProtectiveRequest) -> AdapterResult<OrderAck> {
        self.take_failure("place_reduce_only")?;
        let mut state = self.lock();
        let order_id = Uuid::new_v4().to_string();
        Self::record(
            &mut state,
            format!("place_reduce_only {} {:?} {:?}", req.symbol, req.kind, req.trigger_price),
        );
        if let Some(trigger) = req.trigger_price {
            state.orders.push(WorkingOrder {
                order_id: order_id.clone(),
                client_order_id: req.client_order_id.clone(),
                symbol: req.symbol.clone(),
                side: req.side,
                qty: req.qty,
                price: None,
                trigger_price: Some(trigger),
                role: Some(req.kind),
                reduce_only: true,
                conditional: true,
                parent_id: None,
                created_at: Utc::now(),
            });
            return Ok(OrderAck {
                order_id,
                status: AckStatus::Open,
            });
        }
        // Immediate reduce-only market close.
        let mark = state
            .marks
            .get(&req.symbol)
            .copied()
            .ok_or_else(|| AdapterError::InvalidParam(format!("no mark for {}", req.symbol)))?;
        let order = WorkingOrder {
            order_id: order_id.clone(),
            client_order_id: req.client_order_id.clone(),
            symbol: req.symbol.clone(),
            side: req.side,
            qty: req.qty,
            price: None,
            trigger_price: None,
            role: Some(ProtectiveRole::Close),
            reduce_only: true,
            conditional: false,
            parent_id: None,
            created_at: Utc::now(),
        };
        Self::apply_reduce_fill(&mut state, &order, mark);
        Ok(OrderAck {
            order_id,
            status: AckStatus::Filled,
        })
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
        hint: CancelHint,
    ) -> AdapterResult<()> {
        self.take_failure("cancel_order")?;
        let mut state = self.lock();
        let Some(index) = state
            .orders
            .iter()
            .position(|o| o.order_id == order_id && o.symbol == symbol)
        else {
            return Err(AdapterError::NotFound(format!("order {order_id}")));
        };
        // Standard cancels cannot see the conditional queue, mirroring the
        // algo-separate venues the Auto hint exists for.
        if state.orders[index].conditional && hint == CancelHint::Standard {
            return Err(AdapterError::NotFound(format!(
                "order {order_id} not in standard queue"
            )));
        }
        let removed = state.orders.remove(index);
        Self::record(&mut state, format!("cancel_order {symbol} {order_id}"));
        if self.attached_protection && !removed.reduce_only {
            // Parent gone: venue cleans up attached children.
            state
                .orders
                .retain(|o| o.parent_id.as_deref() != Some(order_id));
        }
        Ok(())
    }

    async fn fetch_positions(&self) -> AdapterResult<Vec<ExchangePosition>> {
        self.take_failure("fetch_positions")?;
        Ok(self.lock().positions.values().cloned().collect())
    }

    async fn fetch_open_orders(&self, symbol: Option<&str>) -> AdapterResult<Vec<OpenOrder>> {
        self.take_failure("fetch_open_orders")?;
        Ok(self
            .lock()
            .orders
            .iter()
            .filter(|o| symbol.is_none_or(|sym| o.symbol == sym))
            .map(WorkingOrder::to_open_order)
            .collect())
    }

    async fn fetch_my_trades(
        &self,
        symbol: &str,
        since: DateTime<Utc>,
    ) -> AdapterResult<Vec<VenueFill>> {
        self.take_failure("fetch_my_trades")?;
        Ok(self
            .lock()
            .fills
            .iter()
            .filter(|fill| fill.symbol == symbol && fill.timestamp >= since)
            .cloned()
            .collect())
    }

    async fn fetch_balance(&self) -> AdapterResult<AccountBalance> {
        self.take_failure("fetch_balance")?;
        let state = self.lock();
        Ok(AccountBalance {
            currency: "USDT".into(),
            total: state.balance,
            available: state.balance,
            updated_at: Utc::now(),
        })
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> AdapterResult<()> {
        self.take_failure("set_leverage")?;
        let mut state = self.lock();
        state.leverage_calls.push((symbol.to_string(), leverage));
        Ok(())
    }

    async fn set_margin_mode(&self, symbol: &str, _mode: MarginMode) -> AdapterResult<()> {
        self.take_failure("set_margin_mode")?;
        let mut state = self.lock();
        state.margin_calls.push(symbol.to_string());
        Ok(())
    }

    async fn server_time(&self) -> AdapterResult<i64> {
        Ok(Utc::now().timestamp_millis())
    }

    fn normalize_symbol(&self, raw: &str) -> Symbol {
        raw.replace('/', "").replace(":USDT", "").to_uppercase()
    }

    fn to_venue_symbol(&self, symbol: &str) -> String {
        symbol.to_uppercase()
    }

    fn amount_to_precision(&self, _symbol: &str, qty: Qty) -> Qty {
        qty.round_dp(3)
    }

    fn price_to_precision(&self, _symbol: &str, price: Price) -> Price {
        price.round_dp(4)
    }

    fn min_notional(&self, _symbol: &str) -> Decimal {
        self.min_notional
    }
}
