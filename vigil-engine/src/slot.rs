//! The per-slot heartbeat: one signal evaluation per tick.

use std::sync::Arc;

use tracing::{debug, warn};
use vigil_core::{PositionStatus, SignalSide, SlotId};

use crate::trader::Trader;
use crate::{EngineError, EngineResult};

/// Evaluates one trading lane. Holds no state of its own; positions live in
/// the store and the trader owns all mutation.
pub struct SlotLoop {
    slot: SlotId,
    trader: Arc<Trader>,
}

impl SlotLoop {
    #[must_use]
    pub fn new(slot: SlotId, trader: Arc<Trader>) -> Self {
        Self { slot, trader }
    }

    #[must_use]
    pub fn slot(&self) -> &SlotId {
        &self.slot
    }

    /// One heartbeat: consume the latest signal and route it to whatever the
    /// slot currently holds: an active position (flip/lifecycle), a pending
    /// entry (cancel review), or nothing (entry attempt).
    pub async fn tick(&self) -> EngineResult<()> {
        if self.trader.is_disabled() {
            return Ok(());
        }
        let ctx = self.trader.ctx();
        let Some(signal) = ctx.signals.latest(&self.slot).await else {
            return Ok(());
        };

        let current = ctx
            .store
            .get_active(self.slot.profile_id, &self.slot.pos_key())?;
        match current.map(|p| p.status) {
            Some(PositionStatus::Active) => self.trader.manage_active(&self.slot, &signal).await,
            Some(PositionStatus::Pending) => self.trader.review_pending(&self.slot, &signal).await,
            _ => self.try_enter(&signal).await,
        }
    }

    async fn try_enter(&self, signal: &vigil_core::SignalSnapshot) -> EngineResult<()> {
        if signal.side == SignalSide::None {
            return Ok(());
        }
        let strategy = self.trader.ctx().strategy.current();
        if !strategy.enabled {
            return Ok(());
        }
        if signal.score < strategy.entry_score_threshold
            || signal.confidence < strategy.min_confidence
        {
            return Ok(());
        }
        match self.trader.open(&self.slot, signal).await {
            Ok(Some(_)) | Ok(None) => Ok(()),
            // Vetoes are routine; the next tick tries again.
            Err(EngineError::Vetoed(veto)) => {
                debug!(slot = %self.slot, %veto, "entry vetoed");
                Ok(())
            }
            Err(EngineError::Adapter(err)) => {
                warn!(slot = %self.slot, error = %err, "entry failed, tolerating until next tick");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}
