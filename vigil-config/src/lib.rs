//! Layered configuration loading and the hot-reloadable strategy document.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use anyhow::{Context, Result};
use config::{Config, Environment as EnvSource, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};
use vigil_core::Environment;

/// Root application configuration deserialized from layered sources.
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,
    #[serde(default = "default_strategy_path")]
    pub strategy_path: PathBuf,
    #[serde(default = "default_control_addr")]
    pub control_addr: String,
    #[serde(default)]
    pub exchange: HashMap<String, ExchangeConfig>,
    #[serde(default)]
    pub profiles: Vec<ProfileConfig>,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
}

/// Per-venue connection settings. Extra keys flow through `params` to the
/// adapter factory untouched.
#[derive(Clone, Debug, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default)]
    pub rest_url: Option<String>,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default = "default_driver")]
    pub driver: String,
    #[serde(default, flatten)]
    pub params: Value,
}

/// One trading profile: an environment, a venue, and its universe.
#[derive(Clone, Debug, Deserialize)]
pub struct ProfileConfig {
    pub name: String,
    pub exchange: String,
    pub environment: Environment,
    /// Markets as `BASE/QUOTE` pairs, e.g. `"BTC/USDT"`.
    pub symbols: Vec<String>,
    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<String>,
}

impl ProfileConfig {
    /// Split a configured `BASE/QUOTE` pair.
    pub fn split_symbol(symbol: &str) -> Option<(String, String)> {
        let (base, quote) = symbol.split_once('/')?;
        Some((base.to_uppercase(), quote.to_uppercase()))
    }

    /// Canonical symbols of this profile's universe.
    #[must_use]
    pub fn universe(&self) -> Vec<String> {
        self.symbols
            .iter()
            .filter_map(|s| Self::split_symbol(s))
            .map(|(base, quote)| format!("{base}{quote}"))
            .collect()
    }
}

/// Trader behavior knobs.
#[derive(Clone, Debug, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_true")]
    pub use_limit_orders: bool,
    #[serde(default = "default_patience_pct")]
    pub patience_entry_pct: Decimal,
    #[serde(default = "default_limit_timeout_secs")]
    pub limit_order_timeout_secs: u64,
    #[serde(default = "default_min_pending_secs")]
    pub min_pending_secs: u64,
    #[serde(default = "default_pending_poll_secs")]
    pub pending_poll_secs: u64,
    #[serde(default = "default_strong_reversal")]
    pub strong_reversal_threshold: f64,
    #[serde(default = "default_invalidation")]
    pub invalidation_threshold: f64,
    #[serde(default = "default_true")]
    pub enable_profit_lock: bool,
    #[serde(default = "default_profit_lock_threshold")]
    pub profit_lock_threshold: Decimal,
    #[serde(default = "default_profit_lock_level")]
    pub profit_lock_level: Decimal,
    #[serde(default = "default_tp_extension_cap")]
    pub tp_extension_cap: Decimal,
    #[serde(default = "default_atr_extension_multiplier")]
    pub atr_extension_multiplier: Decimal,
    #[serde(default = "default_protection_cooldown_secs")]
    pub protection_cooldown_secs: u64,
    #[serde(default = "default_starter_leverage_factor")]
    pub starter_leverage_factor: Decimal,
    #[serde(default = "default_starter_margin_factor")]
    pub starter_margin_factor: Decimal,
    #[serde(default = "default_starter_sl_factor")]
    pub starter_sl_factor: Decimal,
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
    #[serde(default = "default_reaper_batch_limit")]
    pub reaper_batch_limit: usize,
    #[serde(default = "default_reaper_spacing_ms")]
    pub reaper_spacing_ms: u64,
    #[serde(default = "default_strategy_reload_secs")]
    pub strategy_reload_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat_secs(),
            use_limit_orders: true,
            patience_entry_pct: default_patience_pct(),
            limit_order_timeout_secs: default_limit_timeout_secs(),
            min_pending_secs: default_min_pending_secs(),
            pending_poll_secs: default_pending_poll_secs(),
            strong_reversal_threshold: default_strong_reversal(),
            invalidation_threshold: default_invalidation(),
            enable_profit_lock: true,
            profit_lock_threshold: default_profit_lock_threshold(),
            profit_lock_level: default_profit_lock_level(),
            tp_extension_cap: default_tp_extension_cap(),
            atr_extension_multiplier: default_atr_extension_multiplier(),
            protection_cooldown_secs: default_protection_cooldown_secs(),
            starter_leverage_factor: default_starter_leverage_factor(),
            starter_margin_factor: default_starter_margin_factor(),
            starter_sl_factor: default_starter_sl_factor(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            reaper_interval_secs: default_reaper_interval_secs(),
            reaper_batch_limit: default_reaper_batch_limit(),
            reaper_spacing_ms: default_reaper_spacing_ms(),
            strategy_reload_secs: default_strategy_reload_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

/// Risk gate limits.
#[derive(Clone, Debug, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_max_leverage")]
    pub max_leverage: u32,
    #[serde(default = "default_max_drawdown_pct")]
    pub max_drawdown_pct: Decimal,
    #[serde(default = "default_daily_loss_pct")]
    pub daily_loss_limit_pct: Decimal,
    #[serde(default = "default_sl_cooldown_secs")]
    pub sl_cooldown_secs: u64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_leverage: default_max_leverage(),
            max_drawdown_pct: default_max_drawdown_pct(),
            daily_loss_limit_pct: default_daily_loss_pct(),
            sl_cooldown_secs: default_sl_cooldown_secs(),
        }
    }
}

/// Telegram delivery settings.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub chat_id: String,
}

fn default_data_path() -> PathBuf {
    PathBuf::from("./data")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_path() -> PathBuf {
    PathBuf::from("./logs/vigil.json")
}

fn default_strategy_path() -> PathBuf {
    PathBuf::from("config/strategy.toml")
}

fn default_control_addr() -> String {
    "127.0.0.1:7077".into()
}

fn default_driver() -> String {
    "bybit".to_string()
}

fn default_timeframes() -> Vec<String> {
    vec!["1h".into()]
}

fn default_heartbeat_secs() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_patience_pct() -> Decimal {
    Decimal::new(15, 3) // 1.5%
}

fn default_limit_timeout_secs() -> u64 {
    300
}

fn default_min_pending_secs() -> u64 {
    120
}

fn default_pending_poll_secs() -> u64 {
    2
}

fn default_strong_reversal() -> f64 {
    0.4
}

fn default_invalidation() -> f64 {
    0.2
}

fn default_profit_lock_threshold() -> Decimal {
    Decimal::new(8, 1) // 80% of the way to TP
}

fn default_profit_lock_level() -> Decimal {
    Decimal::new(1, 1) // lock 10% of the target distance
}

fn default_tp_extension_cap() -> Decimal {
    Decimal::new(15, 1) // 1.5x the original distance
}

fn default_atr_extension_multiplier() -> Decimal {
    Decimal::new(15, 1)
}

fn default_protection_cooldown_secs() -> u64 {
    20
}

fn default_starter_leverage_factor() -> Decimal {
    Decimal::new(6, 1)
}

fn default_starter_margin_factor() -> Decimal {
    Decimal::new(5, 1)
}

fn default_starter_sl_factor() -> Decimal {
    Decimal::new(6, 1)
}

fn default_reconcile_interval_secs() -> u64 {
    600
}

fn default_reaper_interval_secs() -> u64 {
    300
}

fn default_reaper_batch_limit() -> usize {
    20
}

fn default_reaper_spacing_ms() -> u64 {
    500
}

fn default_strategy_reload_secs() -> u64 {
    60
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

fn default_max_leverage() -> u32 {
    12
}

fn default_max_drawdown_pct() -> Decimal {
    Decimal::new(10, 2)
}

fn default_daily_loss_pct() -> Decimal {
    Decimal::new(3, 2)
}

fn default_sl_cooldown_secs() -> u64 {
    7_200
}

/// Loads configuration by merging files and environment variables.
///
/// Sources (lowest to highest precedence):
/// 1. `config/default.toml`
/// 2. `config/{environment}.toml` (if `environment` is Some)
/// 3. `config/local.toml` (optional, ignored in git)
/// 4. Environment variables prefixed with `VIGIL__`
pub fn load_config(env: Option<&str>) -> Result<AppConfig> {
    let base_path = Path::new("config");
    let mut builder =
        Config::builder().add_source(File::from(base_path.join("default.toml")).required(true));
    if let Some(env_name) = env {
        builder = builder
            .add_source(File::from(base_path.join(format!("{env_name}.toml"))).required(false));
    }
    builder = builder.add_source(File::from(base_path.join("local.toml")).required(false));
    builder = builder.add_source(
        EnvSource::with_prefix("VIGIL")
            .separator("__")
            .ignore_empty(true),
    );
    let config = builder.build()?;
    config
        .try_deserialize()
        .context("failed to deserialize configuration")
}

/// One sizing tier: signals scoring at least `min_score` trade with this
/// leverage and margin.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct SizingTier {
    pub min_score: f64,
    pub leverage: u32,
    pub margin_usdt: Decimal,
}

/// The hot-reloadable strategy document. New opens pick up the latest
/// version; running positions keep the version they captured.
#[derive(Clone, Debug, Deserialize)]
pub struct StrategyDoc {
    #[serde(default = "default_strategy_version")]
    pub version: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_sl_pct")]
    pub sl_pct: Decimal,
    #[serde(default = "default_tp_pct")]
    pub tp_pct: Decimal,
    #[serde(default = "default_entry_score")]
    pub entry_score_threshold: f64,
    #[serde(default = "default_exit_score")]
    pub exit_score_threshold: f64,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_tiers")]
    pub tiers: Vec<SizingTier>,
}

impl Default for StrategyDoc {
    fn default() -> Self {
        Self {
            version: default_strategy_version(),
            enabled: true,
            sl_pct: default_sl_pct(),
            tp_pct: default_tp_pct(),
            entry_score_threshold: default_entry_score(),
            exit_score_threshold: default_exit_score(),
            min_confidence: default_min_confidence(),
            tiers: default_tiers(),
        }
    }
}

impl StrategyDoc {
    /// Best tier whose floor the score clears, highest floor first.
    #[must_use]
    pub fn tier_for(&self, score: f64) -> Option<&SizingTier> {
        self.tiers
            .iter()
            .filter(|tier| score >= tier.min_score)
            .max_by(|a, b| a.min_score.total_cmp(&b.min_score))
    }
}

fn default_strategy_version() -> u32 {
    1
}

fn default_sl_pct() -> Decimal {
    Decimal::new(15, 3) // 1.5%
}

fn default_tp_pct() -> Decimal {
    Decimal::new(3, 2) // 3%
}

fn default_entry_score() -> f64 {
    3.0
}

fn default_exit_score() -> f64 {
    2.5
}

fn default_min_confidence() -> f64 {
    0.3
}

fn default_tiers() -> Vec<SizingTier> {
    vec![
        SizingTier {
            min_score: 7.0,
            leverage: 5,
            margin_usdt: Decimal::from(5u8),
        },
        SizingTier {
            min_score: 5.0,
            leverage: 4,
            margin_usdt: Decimal::from(4u8),
        },
        SizingTier {
            min_score: 3.0,
            leverage: 3,
            margin_usdt: Decimal::from(3u8),
        },
    ]
}

/// Watches the strategy document and swaps in new versions when the file's
/// modification time changes. Polling cadence is owned by the scheduler.
pub struct StrategyWatcher {
    path: PathBuf,
    current: RwLock<Arc<StrategyDoc>>,
    last_modified: RwLock<Option<SystemTime>>,
}

impl StrategyWatcher {
    /// Load the document once; fall back to defaults when the file is absent.
    pub fn load(path: &Path) -> Self {
        let (doc, modified) = match Self::read(path) {
            Ok(loaded) => loaded,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "strategy document unavailable, using defaults");
                (StrategyDoc::default(), None)
            }
        };
        info!(
            version = doc.version,
            tiers = doc.tiers.len(),
            "strategy document loaded"
        );
        Self {
            path: path.to_path_buf(),
            current: RwLock::new(Arc::new(doc)),
            last_modified: RwLock::new(modified),
        }
    }

    fn read(path: &Path) -> Result<(StrategyDoc, Option<SystemTime>)> {
        let modified = std::fs::metadata(path).and_then(|meta| meta.modified()).ok();
        let doc = Config::builder()
            .add_source(File::from(path))
            .build()?
            .try_deserialize()
            .context("failed to deserialize strategy document")?;
        Ok((doc, modified))
    }

    /// The active document.
    #[must_use]
    pub fn current(&self) -> Arc<StrategyDoc> {
        self.current.read().expect("strategy lock poisoned").clone()
    }

    /// Reload when the file changed on disk. Returns true when a new
    /// document was swapped in.
    pub fn maybe_reload(&self) -> bool {
        let modified = std::fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .ok();
        let changed = {
            let last = self.last_modified.read().expect("strategy lock poisoned");
            modified.is_some() && *last != modified
        };
        if !changed {
            return false;
        }
        match Self::read(&self.path) {
            Ok((doc, stamp)) => {
                info!(version = doc.version, "strategy document reloaded");
                *self.current.write().expect("strategy lock poisoned") = Arc::new(doc);
                *self.last_modified.write().expect("strategy lock poisoned") = stamp;
                true
            }
            Err(err) => {
                warn!(error = %err, "strategy reload failed, keeping previous document");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::io::Write;

    #[test]
    fn tier_selection_prefers_highest_cleared_floor() {
        let doc = StrategyDoc::default();
        assert_eq!(doc.tier_for(7.5).unwrap().leverage, 5);
        assert_eq!(doc.tier_for(5.1).unwrap().leverage, 4);
        assert_eq!(doc.tier_for(3.0).unwrap().leverage, 3);
        assert!(doc.tier_for(2.9).is_none());
    }

    #[test]
    fn profile_universe_canonicalizes_pairs() {
        let profile = ProfileConfig {
            name: "main".into(),
            exchange: "bybit".into(),
            environment: Environment::Test,
            symbols: vec!["BTC/USDT".into(), "eth/usdt".into()],
            timeframes: vec!["1h".into()],
        };
        assert_eq!(profile.universe(), vec!["BTCUSDT", "ETHUSDT"]);
    }

    #[test]
    fn watcher_reloads_on_mtime_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strategy.toml");
        std::fs::write(&path, "version = 1\nsl_pct = 0.02\n").unwrap();

        let watcher = StrategyWatcher::load(&path);
        assert_eq!(watcher.current().version, 1);
        assert_eq!(watcher.current().sl_pct, dec!(0.02));

        // Content and mtime both move.
        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "version = 2").unwrap();
        file.sync_all().unwrap();
        drop(file);
        filetime_bump(&path);

        assert!(watcher.maybe_reload());
        assert_eq!(watcher.current().version, 2);
        assert!(!watcher.maybe_reload());
    }

    fn filetime_bump(path: &Path) {
        // Some filesystems have coarse mtime granularity; rewrite until the
        // stamp visibly moves.
        let original = std::fs::metadata(path).unwrap().modified().unwrap();
        for _ in 0..50 {
            if std::fs::metadata(path).unwrap().modified().unwrap() != original {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
            let content = std::fs::read(path).unwrap();
            std::fs::write(path, content).unwrap();
        }
    }
}
