//! Shared harness: a live-mode profile wired to the in-memory paper venue.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use vigil_config::{EngineConfig, RiskConfig, StrategyWatcher};
use vigil_core::{
    Environment, Price, Profile, SignalSide, SignalSnapshot, SlotId, Symbol, Timeframe,
};
use vigil_engine::{
    MarketData, ProfileRuntime, Reconciler, RiskGate, SignalFeed, StructuralLevels, SymbolLocks,
    Trader,
};
use vigil_notify::Notifier;
use vigil_paper::PaperVenue;
use vigil_store::PositionStore;

/// Market data that mirrors the paper venue's mark prices.
pub struct VenueMarketData {
    venue: Arc<PaperVenue>,
    levels: Mutex<HashMap<Symbol, StructuralLevels>>,
}

impl VenueMarketData {
    pub fn new(venue: Arc<PaperVenue>) -> Self {
        Self {
            venue,
            levels: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_levels(&self, symbol: &str, levels: StructuralLevels) {
        self.levels
            .lock()
            .unwrap()
            .insert(symbol.to_string(), levels);
    }
}

#[async_trait]
impl MarketData for VenueMarketData {
    async fn last_price(&self, symbol: &str) -> Option<Price> {
        self.venue.mark(symbol)
    }

    async fn structural_levels(&self, slot: &SlotId) -> Option<StructuralLevels> {
        self.levels.lock().unwrap().get(&slot.symbol()).copied()
    }
}

/// Signal feed driven explicitly by tests.
#[derive(Default)]
pub struct ScriptedFeed {
    latest: Mutex<HashMap<SlotId, SignalSnapshot>>,
}

impl ScriptedFeed {
    pub fn set(&self, slot: &SlotId, snapshot: SignalSnapshot) {
        self.latest.lock().unwrap().insert(slot.clone(), snapshot);
    }
}

#[async_trait]
impl SignalFeed for ScriptedFeed {
    async fn latest(&self, slot: &SlotId) -> Option<SignalSnapshot> {
        self.latest.lock().unwrap().get(slot).cloned()
    }
}

pub struct Harness {
    pub venue: Arc<PaperVenue>,
    pub market: Arc<VenueMarketData>,
    pub feed: Arc<ScriptedFeed>,
    pub store: Arc<PositionStore>,
    pub runtime: Arc<ProfileRuntime>,
    pub trader: Arc<Trader>,
    pub reconciler: Arc<Reconciler>,
    pub risk: Arc<RiskGate>,
}

impl Harness {
    /// Live-mode harness against a parent-child paper venue.
    pub fn live(venue: PaperVenue, mutate_cfg: impl FnOnce(&mut EngineConfig)) -> Self {
        Self::build(venue, Environment::Live, mutate_cfg)
    }

    /// Dry-run harness; the venue must never see a mutation.
    pub fn dry_run(venue: PaperVenue, mutate_cfg: impl FnOnce(&mut EngineConfig)) -> Self {
        Self::build(venue, Environment::Test, mutate_cfg)
    }

    fn build(
        venue: PaperVenue,
        environment: Environment,
        mutate_cfg: impl FnOnce(&mut EngineConfig),
    ) -> Self {
        let venue = Arc::new(venue);
        let store = Arc::new(PositionStore::open_in_memory().expect("store"));
        let profile = Profile {
            id: 0,
            name: "test".into(),
            environment,
            exchange: "paper".into(),
            api_key: None,
            api_secret: None,
            active: true,
        };
        let profile_id = store.add_profile(&profile).expect("profile row");
        let profile = Profile {
            id: profile_id,
            ..profile
        };

        let mut engine_cfg = EngineConfig::default();
        engine_cfg.use_limit_orders = false;
        mutate_cfg(&mut engine_cfg);

        let market = Arc::new(VenueMarketData::new(venue.clone()));
        let feed = Arc::new(ScriptedFeed::default());
        let universe = vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()];
        let slots = vec![
            slot_for(profile_id, "BTC", Timeframe::H1),
            slot_for(profile_id, "ETH", Timeframe::H1),
        ];
        let runtime = Arc::new(ProfileRuntime {
            profile,
            adapter: venue.clone(),
            store: store.clone(),
            strategy: Arc::new(StrategyWatcher::load(Path::new("/nonexistent/strategy.toml"))),
            engine_cfg,
            risk_cfg: RiskConfig::default(),
            notifier: Notifier::disabled(),
            market: market.clone(),
            signals: feed.clone(),
            universe,
            slots,
        });
        let risk = Arc::new(RiskGate::new(
            store.clone(),
            runtime.risk_cfg.clone(),
            profile_id,
            environment,
        ));
        let trader = Arc::new(Trader::new(
            runtime.clone(),
            risk.clone(),
            Arc::new(SymbolLocks::new()),
        ));
        let reconciler = Arc::new(Reconciler::new(trader.clone()));
        // Seed the gate so entries are not blocked by a missing balance.
        risk.evaluate_account(Decimal::from(10_000), Utc::now())
            .expect("risk seed");
        Self {
            venue,
            market,
            feed,
            store,
            runtime,
            trader,
            reconciler,
            risk,
        }
    }

    pub fn profile_id(&self) -> i64 {
        self.runtime.profile.id
    }

    pub fn btc_slot(&self) -> SlotId {
        slot_for(self.profile_id(), "BTC", Timeframe::H1)
    }
}

pub fn slot_for(profile_id: i64, base: &str, timeframe: Timeframe) -> SlotId {
    SlotId {
        profile_id,
        exchange: "PAPER".into(),
        base: base.into(),
        quote: "USDT".into(),
        timeframe,
    }
}

pub fn signal(side: SignalSide, confidence: f64, score: f64) -> SignalSnapshot {
    SignalSnapshot {
        timestamp: Utc::now(),
        side,
        confidence,
        score,
        features: serde_json::json!({"source": "test"}),
    }
}
