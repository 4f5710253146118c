//! Execution and reconciliation core.
//!
//! The engine owns position state end to end: the [`Trader`] places and
//! manages orders, the [`Reconciler`] squares the store against venue
//! reality, the [`RiskGate`] vetoes entries, and the [`Scheduler`] fans the
//! per-slot loops and background tasks out over the runtime.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;
use vigil_broker::{AdapterError, ExchangeAdapter};
use vigil_config::{EngineConfig, RiskConfig, StrategyWatcher};
use vigil_core::{Environment, Price, Profile, SignalSnapshot, SlotId, Symbol};
use vigil_notify::Notifier;
use vigil_store::{PositionStore, StoreError};

mod locks;
pub mod reconcile;
pub mod risk;
pub mod scheduler;
pub mod slot;
pub mod trader;

pub use locks::SymbolLocks;
pub use reconcile::Reconciler;
pub use risk::{RiskGate, RiskVeto};
pub use scheduler::{EngineHandle, Scheduler, ShutdownSignal};
pub use slot::SlotLoop;
pub use trader::Trader;

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("entry vetoed: {0}")]
    Vetoed(RiskVeto),
    #[error("profile disabled: {0}")]
    ProfileDisabled(String),
    #[error("{0}")]
    Invalid(String),
}

/// Latest market observations the engine needs for a slot. Indicator
/// computation happens outside the core; this trait is the seam it plugs
/// into.
#[async_trait]
pub trait MarketData: Send + Sync {
    /// Last traded/marked price for a symbol.
    async fn last_price(&self, symbol: &str) -> Option<Price>;

    /// Structural levels for TP extension, when the collaborator has them.
    async fn structural_levels(&self, slot: &SlotId) -> Option<StructuralLevels>;
}

/// Support/resistance and volatility context used by the TP extension rule.
#[derive(Clone, Copy, Debug, Default)]
pub struct StructuralLevels {
    pub support: Option<Price>,
    pub resistance: Option<Price>,
    pub atr: Option<Decimal>,
}

/// Source of per-slot signals from the external scoring collaborator.
#[async_trait]
pub trait SignalFeed: Send + Sync {
    /// The freshest snapshot for a slot, if the collaborator has produced one.
    async fn latest(&self, slot: &SlotId) -> Option<SignalSnapshot>;
}

/// Everything one profile's tasks share: its adapter, store handle, configs
/// and collaborators. Built once at startup, then read-only.
pub struct ProfileRuntime {
    pub profile: Profile,
    pub adapter: Arc<dyn ExchangeAdapter>,
    pub store: Arc<PositionStore>,
    pub strategy: Arc<StrategyWatcher>,
    pub engine_cfg: EngineConfig,
    pub risk_cfg: RiskConfig,
    pub notifier: Notifier,
    pub market: Arc<dyn MarketData>,
    pub signals: Arc<dyn SignalFeed>,
    /// Canonical symbols this profile is allowed to trade.
    pub universe: Vec<Symbol>,
    /// The trading lanes fanned out for this profile.
    pub slots: Vec<SlotId>,
}

impl ProfileRuntime {
    /// True when this profile must never mutate a real venue.
    #[must_use]
    pub fn is_dry_run(&self) -> bool {
        self.profile.environment == Environment::Test
    }

    #[must_use]
    pub fn venue(&self) -> &str {
        self.adapter.name()
    }
}
