//! Collaborator seams: where signals and market observations come from.
//!
//! The scoring process drops one JSON snapshot per slot into the signal
//! directory; a separate fetcher keeps the candle cache warm. Both run
//! outside this binary.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tracing::debug;
use vigil_core::{Price, SignalSnapshot, SlotId, Timeframe};
use vigil_engine::{MarketData, SignalFeed, StructuralLevels};
use vigil_store::PositionStore;

/// Reads `{signal_dir}/{pos_key}.json`, rejecting snapshots older than the
/// staleness window so a dead collaborator cannot keep a stale bias alive.
pub struct FileSignalFeed {
    dir: PathBuf,
    max_age_secs: i64,
}

impl FileSignalFeed {
    #[must_use]
    pub fn new(dir: PathBuf, max_age_secs: i64) -> Self {
        Self { dir, max_age_secs }
    }
}

#[async_trait]
impl SignalFeed for FileSignalFeed {
    async fn latest(&self, slot: &SlotId) -> Option<SignalSnapshot> {
        let path = self.dir.join(format!("{}.json", slot.pos_key()));
        let raw = tokio::fs::read(&path).await.ok()?;
        let snapshot: SignalSnapshot = match serde_json::from_slice(&raw) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                debug!(path = %path.display(), error = %err, "unreadable signal snapshot");
                return None;
            }
        };
        if Utc::now() - snapshot.timestamp > Duration::seconds(self.max_age_secs) {
            debug!(slot = %slot, "signal snapshot stale, ignoring");
            return None;
        }
        Some(snapshot)
    }
}

/// Market data served from the candle cache the external fetcher maintains.
pub struct CandleMarketData {
    store: Arc<PositionStore>,
    /// Finest cached timeframe; its close is the freshest price available.
    price_timeframe: Timeframe,
}

impl CandleMarketData {
    #[must_use]
    pub fn new(store: Arc<PositionStore>, price_timeframe: Timeframe) -> Self {
        Self {
            store,
            price_timeframe,
        }
    }
}

#[async_trait]
impl MarketData for CandleMarketData {
    async fn last_price(&self, symbol: &str) -> Option<Price> {
        self.store
            .get_candles(symbol, self.price_timeframe, 1)
            .ok()?
            .last()
            .map(|candle| candle.close)
    }

    async fn structural_levels(&self, _slot: &SlotId) -> Option<StructuralLevels> {
        // Structure detection lives with the indicator collaborator; absent
        // levels simply disable the TP extension.
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::SignalSide;

    fn slot() -> SlotId {
        SlotId {
            profile_id: 1,
            exchange: "BYBIT".into(),
            base: "BTC".into(),
            quote: "USDT".into(),
            timeframe: Timeframe::H1,
        }
    }

    #[tokio::test]
    async fn missing_or_stale_snapshots_yield_none() {
        let dir = tempfile::tempdir().unwrap();
        let feed = FileSignalFeed::new(dir.path().to_path_buf(), 60);
        assert!(feed.latest(&slot()).await.is_none());

        let stale = SignalSnapshot {
            timestamp: Utc::now() - Duration::seconds(120),
            side: SignalSide::Buy,
            confidence: 0.8,
            score: 5.0,
            features: serde_json::Value::Null,
        };
        let path = dir.path().join(format!("{}.json", slot().pos_key()));
        std::fs::write(&path, serde_json::to_vec(&stale).unwrap()).unwrap();
        assert!(feed.latest(&slot()).await.is_none());
    }

    #[tokio::test]
    async fn fresh_snapshot_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let feed = FileSignalFeed::new(dir.path().to_path_buf(), 60);
        let fresh = SignalSnapshot {
            timestamp: Utc::now(),
            side: SignalSide::Sell,
            confidence: 0.7,
            score: 4.2,
            features: serde_json::json!({"rsi": 72}),
        };
        let path = dir.path().join(format!("{}.json", slot().pos_key()));
        std::fs::write(&path, serde_json::to_vec(&fresh).unwrap()).unwrap();

        let loaded = feed.latest(&slot()).await.expect("fresh snapshot");
        assert_eq!(loaded.side, SignalSide::Sell);
        assert_eq!(loaded.score, 4.2);
    }
}
