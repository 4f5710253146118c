//! Task fan-out: per-profile heartbeats, background loops, shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use futures::future::join_all;
use rust_decimal::Decimal;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use vigil_core::{ExitReason, PosKey, Position, PositionStatus};

use crate::reconcile::Reconciler;
use crate::risk::RiskGate;
use crate::slot::SlotLoop;
use crate::trader::Trader;
use crate::{EngineResult, ProfileRuntime, SymbolLocks};

/// Synthetic equity baseline for dry runs, adjusted by realized PnL.
const DRY_RUN_STARTING_EQUITY: Decimal = Decimal::from_parts(1_000, 0, 0, false, 0);
const STATUS_REPORT_INTERVAL: Duration = Duration::from_secs(2 * 3_600);
const CANDLE_RETENTION_DAYS: i64 = 30;

/// Cooperative shutdown token observed at every suspension point.
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownSignal {
    /// A token wired to ctrl-c.
    #[must_use]
    pub fn new() -> Self {
        let signal = Self::manual();
        let flag = signal.flag.clone();
        let notify = signal.notify.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                flag.store(true, Ordering::SeqCst);
                notify.notify_waiters();
            }
        });
        signal
    }

    /// A token only [`ShutdownSignal::trigger`] can fire. For tests and
    /// embedded use.
    #[must_use]
    pub fn manual() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        if self.triggered() {
            return;
        }
        self.notify.notified().await;
    }

    /// Sleep that wakes early on shutdown. Returns false when shutting down.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.triggered() {
            return false;
        }
        tokio::select! {
            () = tokio::time::sleep(duration) => true,
            () = self.notify.notified() => false,
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for ShutdownSignal {
    fn clone(&self) -> Self {
        Self {
            flag: self.flag.clone(),
            notify: self.notify.clone(),
        }
    }
}

/// Everything one profile runs with.
pub struct ProfileHandles {
    pub runtime: Arc<ProfileRuntime>,
    pub trader: Arc<Trader>,
    pub reconciler: Arc<Reconciler>,
    pub risk: Arc<RiskGate>,
}

impl ProfileHandles {
    fn build(runtime: Arc<ProfileRuntime>) -> Arc<Self> {
        let risk = Arc::new(RiskGate::new(
            runtime.store.clone(),
            runtime.risk_cfg.clone(),
            runtime.profile.id,
            runtime.profile.environment,
        ));
        let locks = Arc::new(SymbolLocks::new());
        let trader = Arc::new(Trader::new(runtime.clone(), risk.clone(), locks));
        let reconciler = Arc::new(Reconciler::new(trader.clone()));
        Arc::new(Self {
            runtime,
            trader,
            reconciler,
            risk,
        })
    }

    /// Current account equity: venue balance when live, a synthetic ledger-
    /// derived figure in dry runs.
    async fn equity(&self) -> Decimal {
        if self.runtime.is_dry_run() {
            let realized = self
                .runtime
                .store
                .total_realized_pnl(self.runtime.profile.id)
                .unwrap_or(Decimal::ZERO);
            return DRY_RUN_STARTING_EQUITY + realized;
        }
        match self.runtime.adapter.fetch_balance().await {
            Ok(balance) => {
                if balance.total > Decimal::ZERO {
                    balance.total
                } else {
                    balance.available
                }
            }
            Err(err) => {
                warn!(profile = %self.runtime.profile.name, error = %err, "balance fetch failed");
                Decimal::ZERO
            }
        }
    }
}

/// Builds and runs the full task tree for a set of profiles.
pub struct Scheduler {
    profiles: Vec<Arc<ProfileHandles>>,
    shutdown: ShutdownSignal,
}

impl Scheduler {
    #[must_use]
    pub fn new(runtimes: Vec<Arc<ProfileRuntime>>, shutdown: ShutdownSignal) -> Self {
        let profiles = runtimes.into_iter().map(ProfileHandles::build).collect();
        Self { profiles, shutdown }
    }

    /// Admin-facing handle into the running engine.
    #[must_use]
    pub fn handle(&self) -> EngineHandle {
        let by_name = self
            .profiles
            .iter()
            .map(|p| (p.runtime.profile.name.clone(), p.clone()))
            .collect();
        EngineHandle {
            profiles: Arc::new(by_name),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Spawn every task and run until shutdown. In-flight work gets a
    /// bounded grace period, then the remainder is abandoned.
    pub async fn run(self, grace: Duration) -> Result<()> {
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        for handles in &self.profiles {
            tasks.push(spawn_profile_heartbeat(handles.clone(), self.shutdown.clone()));
            tasks.push(spawn_pending_monitor(handles.clone(), self.shutdown.clone()));
            tasks.push(spawn_full_scan(handles.clone(), self.shutdown.clone()));
            tasks.push(spawn_reaper(handles.clone(), self.shutdown.clone()));
            tasks.push(spawn_strategy_reload(handles.clone(), self.shutdown.clone()));
            tasks.push(spawn_status_report(handles.clone(), self.shutdown.clone()));
        }
        info!(
            profiles = self.profiles.len(),
            tasks = tasks.len(),
            "scheduler running"
        );
        self.shutdown.wait().await;
        info!("shutdown requested, draining tasks");
        let drain = async {
            for task in tasks.iter_mut() {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!("grace period elapsed, aborting remaining tasks");
        }
        for task in &tasks {
            task.abort();
        }
        info!("scheduler stopped");
        Ok(())
    }
}

/// Per-heartbeat work for one profile, in the order the engine's guarantees
/// require: deep-sync first so slot loops never act on stale state, then the
/// risk verdict, then every slot's tick.
fn spawn_profile_heartbeat(
    handles: Arc<ProfileHandles>,
    shutdown: ShutdownSignal,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let heartbeat = Duration::from_secs(handles.runtime.engine_cfg.heartbeat_secs.max(1));
        let slots: Vec<SlotLoop> = handles
            .runtime
            .slots
            .iter()
            .cloned()
            .map(|slot| SlotLoop::new(slot, handles.trader.clone()))
            .collect();
        let mut was_frozen = false;
        loop {
            if let Err(err) = handles.reconciler.deep_sync(false).await {
                warn!(profile = %handles.runtime.profile.name, error = %err, "fast deep-sync failed");
            }

            let equity = handles.equity().await;
            match handles.risk.evaluate_account(equity, Utc::now()) {
                Ok(Some(reason)) => {
                    if !was_frozen {
                        warn!(profile = %handles.runtime.profile.name, %reason, "entries frozen");
                        handles.runtime.notifier.send(vigil_notify::format_circuit_breaker(
                            handles.runtime.venue(),
                            &reason,
                        ));
                    }
                    was_frozen = true;
                }
                Ok(None) => was_frozen = false,
                Err(err) => {
                    warn!(profile = %handles.runtime.profile.name, error = %err, "risk evaluation failed");
                }
            }

            let ticks = slots.iter().map(SlotLoop::tick);
            for (slot, result) in slots.iter().zip(join_all(ticks).await) {
                if let Err(err) = result {
                    warn!(slot = %slot.slot(), error = %err, "slot tick failed");
                }
            }

            if !shutdown.sleep(heartbeat).await {
                break;
            }
        }
    })
}

fn spawn_pending_monitor(handles: Arc<ProfileHandles>, shutdown: ShutdownSignal) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_secs(handles.runtime.engine_cfg.pending_poll_secs.max(1));
        while shutdown.sleep(interval).await {
            if let Err(err) = handles.trader.poll_pending().await {
                warn!(profile = %handles.runtime.profile.name, error = %err, "pending monitor failed");
            }
        }
    })
}

fn spawn_full_scan(handles: Arc<ProfileHandles>, shutdown: ShutdownSignal) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_secs(handles.runtime.engine_cfg.reconcile_interval_secs.max(1));
        while shutdown.sleep(interval).await {
            if let Err(err) = handles.reconciler.deep_sync(true).await {
                warn!(profile = %handles.runtime.profile.name, error = %err, "full reconcile failed");
            }
            let now = Utc::now();
            if let Err(err) = handles.runtime.store.purge_expired_cooldowns(now) {
                warn!(error = %err, "cooldown purge failed");
            }
            let cutoff = now - chrono::Duration::days(CANDLE_RETENTION_DAYS);
            if let Err(err) = handles.runtime.store.purge_stale_candles(cutoff) {
                warn!(error = %err, "candle purge failed");
            }
        }
    })
}

fn spawn_reaper(handles: Arc<ProfileHandles>, shutdown: ShutdownSignal) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_secs(handles.runtime.engine_cfg.reaper_interval_secs.max(1));
        while shutdown.sleep(interval).await {
            match handles.trader.reap_orphans().await {
                Ok(0) => {}
                Ok(count) => info!(profile = %handles.runtime.profile.name, count, "reaped orphan orders"),
                Err(err) => {
                    warn!(profile = %handles.runtime.profile.name, error = %err, "orphan sweep failed");
                }
            }
        }
    })
}

fn spawn_strategy_reload(handles: Arc<ProfileHandles>, shutdown: ShutdownSignal) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_secs(handles.runtime.engine_cfg.strategy_reload_secs.max(1));
        while shutdown.sleep(interval).await {
            handles.runtime.strategy.maybe_reload();
        }
    })
}

fn spawn_status_report(handles: Arc<ProfileHandles>, shutdown: ShutdownSignal) -> JoinHandle<()> {
    tokio::spawn(async move {
        while shutdown.sleep(STATUS_REPORT_INTERVAL).await {
            let open = match handles.runtime.store.list_open(handles.runtime.profile.id) {
                Ok(open) => open,
                Err(err) => {
                    warn!(error = %err, "status report query failed");
                    continue;
                }
            };
            let mut active = Vec::new();
            let mut pending = Vec::new();
            for position in open {
                match position.status {
                    PositionStatus::Active => {
                        let pnl = match handles.runtime.market.last_price(&position.symbol).await {
                            Some(price) => {
                                position.side.signed_delta(position.entry_price, price)
                                    * position.qty
                            }
                            None => Decimal::ZERO,
                        };
                        active.push((position, pnl));
                    }
                    PositionStatus::Pending => pending.push(position),
                    _ => {}
                }
            }
            if let Some(report) = vigil_notify::format_status_report(
                handles.runtime.venue(),
                &active,
                &pending,
            ) {
                handles.runtime.notifier.send(report);
            }
        }
    })
}

/// The admin surface exposed to the control plane: everything an operator
/// may do to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    profiles: Arc<HashMap<String, Arc<ProfileHandles>>>,
    shutdown: ShutdownSignal,
}

impl EngineHandle {
    /// Open and parked positions, optionally restricted to one profile.
    pub fn list_positions(&self, profile: Option<&str>) -> EngineResult<Vec<Position>> {
        let mut out = Vec::new();
        for handles in self.profiles.values() {
            if profile.is_some_and(|name| name != handles.runtime.profile.name) {
                continue;
            }
            let id = handles.runtime.profile.id;
            out.extend(handles.runtime.store.list_open(id)?);
            out.extend(handles.runtime.store.list_waiting_sync(id)?);
        }
        Ok(out)
    }

    /// Force-close the position occupying `pos_key`, wherever it lives.
    pub async fn force_close(&self, pos_key: &str) -> EngineResult<bool> {
        let key = PosKey::from(pos_key.to_string());
        for handles in self.profiles.values() {
            if handles
                .trader
                .force_close(&key, ExitReason::Manual)
                .await?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Operator acknowledgement after a circuit-breaker trip.
    pub async fn resume_after_circuit_breaker(&self, profile: &str) -> EngineResult<bool> {
        let Some(handles) = self.profiles.get(profile) else {
            return Ok(false);
        };
        let equity = handles.equity().await;
        handles.risk.resume(equity)?;
        Ok(true)
    }

    /// Force a strategy-document reload check on every profile.
    pub fn reload_config(&self) -> bool {
        let mut reloaded = false;
        for handles in self.profiles.values() {
            reloaded |= handles.runtime.strategy.maybe_reload();
        }
        reloaded
    }

    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    #[must_use]
    pub fn profile_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.profiles.keys().cloned().collect();
        names.sort();
        names
    }
}
