//! Entry gating: circuit breaker, daily loss cap, cooldowns, tiered sizing.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;

use chrono::{DateTime, Datelike, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{info, warn};
use vigil_broker::ExchangeAdapter;
use vigil_config::{RiskConfig, StrategyDoc};
use vigil_core::{Environment, ProfileId, Qty, TradeRecord};
use vigil_store::{PositionStore, StoreResult};

const METRIC_PEAK: &str = "peak_balance";
const METRIC_DAILY_LOSS: &str = "daily_loss";
const METRIC_RESET_DATE: &str = "daily_reset_date";
const METRIC_STARTING: &str = "starting_balance";
const METRIC_BREAKER: &str = "breaker_tripped";

/// Reasons the gate refuses an entry.
#[derive(Clone, Debug)]
pub enum RiskVeto {
    /// Drawdown breaker latched or daily loss cap active.
    AccountFrozen(String),
    /// Symbol is cooling down after a realized stop loss.
    Cooldown(DateTime<Utc>),
    /// The score clears no sizing tier.
    BelowTier(f64),
    /// Rounded size would violate the venue minimum.
    MinNotional { notional: Decimal, min: Decimal },
    /// The strategy document is disabled.
    StrategyDisabled,
}

impl fmt::Display for RiskVeto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AccountFrozen(reason) => write!(f, "account frozen: {reason}"),
            Self::Cooldown(until) => write!(f, "cooldown until {until}"),
            Self::BelowTier(score) => write!(f, "score {score:.2} below lowest tier"),
            Self::MinNotional { notional, min } => {
                write!(f, "notional {notional} below venue minimum {min}")
            }
            Self::StrategyDisabled => write!(f, "strategy disabled"),
        }
    }
}

/// Sizing produced for an approved entry.
#[derive(Clone, Copy, Debug)]
pub struct SizedEntry {
    pub leverage: u32,
    pub margin: Decimal,
    pub qty: Qty,
}

/// Scaling applied to a starter (post-flip) entry.
#[derive(Clone, Copy, Debug)]
pub struct StarterScaling {
    pub leverage_factor: Decimal,
    pub margin_factor: Decimal,
}

/// Per-profile risk gate. Account state lives in the store's risk metrics so
/// it survives restarts; the latched veto is cached in memory and refreshed
/// by the scheduler every heartbeat.
pub struct RiskGate {
    store: Arc<PositionStore>,
    cfg: RiskConfig,
    profile_id: ProfileId,
    env: Environment,
    blocked: Mutex<Option<String>>,
}

impl RiskGate {
    #[must_use]
    pub fn new(
        store: Arc<PositionStore>,
        cfg: RiskConfig,
        profile_id: ProfileId,
        env: Environment,
    ) -> Self {
        Self {
            store,
            cfg,
            profile_id,
            env,
            blocked: Mutex::new(None),
        }
    }

    fn metric(&self, name: &str) -> StoreResult<Option<Decimal>> {
        self.store.risk_metric(self.profile_id, self.env, name)
    }

    fn set_metric(&self, name: &str, value: Decimal) -> StoreResult<()> {
        self.store
            .set_risk_metric(self.profile_id, self.env, name, value)
    }

    /// Fold a fresh balance observation into the account metrics and return
    /// the active veto, if any. Rolls the daily window exactly once per
    /// calendar day (UTC). Breaker trips are monotone within a day: once
    /// latched, only [`RiskGate::resume`] clears them.
    pub fn evaluate_account(
        &self,
        balance: Decimal,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<String>> {
        if balance <= Decimal::ZERO {
            // No usable balance reading; keep the previous verdict.
            return Ok(self.blocked.lock().expect("risk gate poisoned").clone());
        }
        let today = Decimal::from(now.date_naive().num_days_from_ce());
        if self.metric(METRIC_RESET_DATE)? != Some(today) {
            self.set_metric(METRIC_RESET_DATE, today)?;
            self.set_metric(METRIC_DAILY_LOSS, Decimal::ZERO)?;
            self.set_metric(METRIC_STARTING, balance)?;
            info!(profile = self.profile_id, "daily risk window rolled");
        }
        let starting = match self.metric(METRIC_STARTING)? {
            Some(value) if value > Decimal::ZERO => value,
            _ => {
                self.set_metric(METRIC_STARTING, balance)?;
                balance
            }
        };
        let peak = match self.metric(METRIC_PEAK)? {
            Some(peak) if peak >= balance => peak,
            _ => {
                self.set_metric(METRIC_PEAK, balance)?;
                balance
            }
        };

        let verdict = if self.metric(METRIC_BREAKER)? == Some(Decimal::ONE) {
            Some("circuit breaker latched".to_string())
        } else {
            let drawdown = (peak - balance) / peak;
            let daily_loss = self.metric(METRIC_DAILY_LOSS)?.unwrap_or(Decimal::ZERO);
            if drawdown >= self.cfg.max_drawdown_pct {
                let reason = format!("max drawdown hit: {:.2}%", drawdown * Decimal::from(100));
                warn!(profile = self.profile_id, %reason, "tripping circuit breaker");
                self.set_metric(METRIC_BREAKER, Decimal::ONE)?;
                Some(reason)
            } else if daily_loss / starting >= self.cfg.daily_loss_limit_pct {
                Some(format!(
                    "daily loss limit hit: {:.2}%",
                    daily_loss / starting * Decimal::from(100)
                ))
            } else {
                None
            }
        };
        *self.blocked.lock().expect("risk gate poisoned") = verdict.clone();
        Ok(verdict)
    }

    /// The cached veto from the last account evaluation.
    #[must_use]
    pub fn frozen_reason(&self) -> Option<String> {
        self.blocked.lock().expect("risk gate poisoned").clone()
    }

    /// Operator acknowledgement: unlatch the breaker and rebase the peak on
    /// the current balance so the same drawdown does not re-trip instantly.
    pub fn resume(&self, current_balance: Decimal) -> StoreResult<()> {
        self.set_metric(METRIC_BREAKER, Decimal::ZERO)?;
        if current_balance > Decimal::ZERO {
            self.set_metric(METRIC_PEAK, current_balance)?;
        }
        *self.blocked.lock().expect("risk gate poisoned") = None;
        info!(profile = self.profile_id, "circuit breaker cleared by operator");
        Ok(())
    }

    /// Accumulate a realized result into the daily loss window. Profits
    /// offset losses; the cap compares the running net loss.
    pub fn record_closed_trade(&self, trade: &TradeRecord) -> StoreResult<()> {
        let current = self.metric(METRIC_DAILY_LOSS)?.unwrap_or(Decimal::ZERO);
        self.set_metric(METRIC_DAILY_LOSS, current - trade.pnl)?;
        Ok(())
    }

    /// Active stop-loss cooldown for a symbol, if one is running.
    pub fn cooldown(&self, symbol: &str, now: DateTime<Utc>) -> StoreResult<Option<DateTime<Utc>>> {
        self.store.cooldown_until(self.profile_id, symbol, now)
    }

    /// Start the post-SL cooldown for a symbol.
    pub fn start_cooldown(&self, symbol: &str, now: DateTime<Utc>) -> StoreResult<DateTime<Utc>> {
        let until = now + chrono::Duration::seconds(self.cfg.sl_cooldown_secs as i64);
        self.store.set_cooldown(self.profile_id, symbol, until)?;
        Ok(until)
    }

    /// Pick a sizing tier for the score and turn it into a rounded quantity.
    /// Starter entries get their leverage and margin scaled down first; when
    /// the scaled order would fall under the venue floor that the full-size
    /// order cleared, the margin is bumped back up to just clear it.
    pub fn size_entry(
        &self,
        strategy: &StrategyDoc,
        score: f64,
        entry_price: Decimal,
        adapter: &dyn ExchangeAdapter,
        symbol: &str,
        starter: Option<StarterScaling>,
    ) -> Result<SizedEntry, RiskVeto> {
        if !strategy.enabled {
            return Err(RiskVeto::StrategyDisabled);
        }
        let tier = strategy.tier_for(score).ok_or(RiskVeto::BelowTier(score))?;
        let mut leverage = tier.leverage.min(self.cfg.max_leverage);
        let mut margin = tier.margin_usdt;
        let min_notional = adapter.min_notional(symbol);

        if let Some(scaling) = starter {
            let scaled = (Decimal::from(leverage) * scaling.leverage_factor).floor();
            leverage = scaled.to_u32().unwrap_or(1).max(1);
            let full_notional = margin * Decimal::from(tier.leverage.min(self.cfg.max_leverage));
            margin *= scaling.margin_factor;
            let scaled_notional = margin * Decimal::from(leverage);
            if scaled_notional < min_notional && full_notional >= min_notional {
                margin = min_notional * Decimal::new(105, 2) / Decimal::from(leverage);
            }
        }

        let raw_qty = margin * Decimal::from(leverage) / entry_price;
        let qty = adapter.amount_to_precision(symbol, raw_qty);
        let notional = qty * entry_price;
        // 1% tolerance absorbs rounding right at the floor.
        if qty <= Decimal::ZERO || notional < min_notional * Decimal::new(99, 2) {
            return Err(RiskVeto::MinNotional {
                notional,
                min: min_notional,
            });
        }
        Ok(SizedEntry {
            leverage,
            margin,
            qty,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use vigil_core::{ExitReason, PosKey, Side, Timeframe};

    fn gate() -> (RiskGate, Arc<PositionStore>) {
        let store = Arc::new(PositionStore::open_in_memory().unwrap());
        let gate = RiskGate::new(
            store.clone(),
            RiskConfig::default(),
            1,
            Environment::Test,
        );
        (gate, store)
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, hour, 0, 0).unwrap()
    }

    #[test]
    fn drawdown_trips_and_stays_tripped() {
        let (gate, _store) = gate();
        assert!(gate.evaluate_account(dec!(1000), at(1, 9)).unwrap().is_none());
        // 10% under the peak trips the breaker.
        let reason = gate.evaluate_account(dec!(900), at(1, 10)).unwrap();
        assert!(reason.unwrap().contains("drawdown"));
        // Recovery alone does not clear it.
        let still = gate.evaluate_account(dec!(990), at(1, 11)).unwrap();
        assert_eq!(still.unwrap(), "circuit breaker latched");
        // Operator resume rebases the peak.
        gate.resume(dec!(990)).unwrap();
        assert!(gate.evaluate_account(dec!(985), at(1, 12)).unwrap().is_none());
    }

    #[test]
    fn daily_loss_freezes_until_rollover() {
        let (gate, _store) = gate();
        assert!(gate.evaluate_account(dec!(1000), at(1, 9)).unwrap().is_none());
        let trade = TradeRecord {
            pos_key: PosKey::new(1, "BYBIT", "BTC", "USDT", Timeframe::H1),
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            qty: dec!(1),
            entry_price: dec!(100),
            exit_price: dec!(60),
            pnl: dec!(-40),
            fees: Decimal::ZERO,
            leverage: 3,
            exit_reason: ExitReason::Sl,
            entry_time: at(1, 9),
            exit_time: at(1, 10),
            feature_snapshot: serde_json::Value::Null,
        };
        gate.record_closed_trade(&trade).unwrap();
        // 40/1000 = 4% > 3% cap. Balance itself is still above the
        // drawdown limit, so only the daily window is frozen.
        let reason = gate.evaluate_account(dec!(960), at(1, 11)).unwrap();
        assert!(reason.unwrap().contains("daily loss"));
        // Next calendar day the window rolls and the freeze clears.
        assert!(gate.evaluate_account(dec!(960), at(2, 0)).unwrap().is_none());
    }

    #[test]
    fn wins_offset_daily_losses() {
        let (gate, _store) = gate();
        gate.evaluate_account(dec!(1000), at(1, 9)).unwrap();
        let mut trade = TradeRecord {
            pos_key: PosKey::new(1, "BYBIT", "BTC", "USDT", Timeframe::H1),
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            qty: dec!(1),
            entry_price: dec!(100),
            exit_price: dec!(60),
            pnl: dec!(-40),
            fees: Decimal::ZERO,
            leverage: 3,
            exit_reason: ExitReason::Sl,
            entry_time: at(1, 9),
            exit_time: at(1, 10),
            feature_snapshot: serde_json::Value::Null,
        };
        gate.record_closed_trade(&trade).unwrap();
        trade.pnl = dec!(25);
        trade.exit_reason = ExitReason::Tp;
        gate.record_closed_trade(&trade).unwrap();
        // Net -15 on 1000 = 1.5%, under the cap.
        assert!(gate.evaluate_account(dec!(985), at(1, 11)).unwrap().is_none());
    }

    #[test]
    fn cooldown_round_trip() {
        let (gate, _store) = gate();
        let now = at(1, 11);
        let until = gate.start_cooldown("SOLUSDT", now).unwrap();
        assert_eq!(until, now + chrono::Duration::hours(2));
        assert_eq!(gate.cooldown("SOLUSDT", now).unwrap(), Some(until));
        assert!(gate
            .cooldown("SOLUSDT", until + chrono::Duration::seconds(1))
            .unwrap()
            .is_none());
    }
}
