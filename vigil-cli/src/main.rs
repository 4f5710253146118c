//! Launcher: configuration, adapter construction, task fan-out, shutdown.

mod control;
mod feeds;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vigil_broker::{get_adapter_factory, registered_adapters, ExchangeAdapter};
use vigil_config::{load_config, AppConfig, ProfileConfig, StrategyWatcher};
use vigil_core::{Environment, Profile, SlotId, Timeframe};
use vigil_engine::{ProfileRuntime, Scheduler, ShutdownSignal};
use vigil_notify::Notifier;
use vigil_paper::PaperVenue;
use vigil_store::PositionStore;

use feeds::{CandleMarketData, FileSignalFeed};

#[derive(Debug, Parser)]
#[command(name = "vigil", about = "Perpetual-futures execution engine")]
struct Args {
    /// Named config layer merged over config/default.toml.
    #[arg(long)]
    env: Option<String>,
    /// Force every profile into dry-run regardless of configuration.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.env.as_deref()).context("failed to load configuration")?;
    init_tracing(&config)?;
    info!(env = ?args.env, dry_run = args.dry_run, "vigil starting");

    vigil_bybit::register_factory();
    vigil_binance::register_factory();
    info!(adapters = ?registered_adapters(), "adapter registry ready");

    let shutdown = ShutdownSignal::new();
    let (notifier, notifier_task) = Notifier::spawn(config.telegram.clone());
    let runtimes = build_runtimes(&config, args.dry_run, &notifier).await?;
    if runtimes.is_empty() {
        bail!("no active profiles configured");
    }

    let scheduler = Scheduler::new(runtimes, shutdown.clone());
    let handle = scheduler.handle();
    let control_addr = config
        .control_addr
        .parse()
        .with_context(|| format!("bad control_addr '{}'", config.control_addr))?;
    let control_task = control::spawn_control_plane(control_addr, handle, shutdown.clone());

    let grace = std::time::Duration::from_secs(config.engine.shutdown_grace_secs);
    scheduler.run(grace).await?;

    control_task.abort();
    if let Some(task) = notifier_task {
        task.abort();
    }
    info!("vigil stopped");
    Ok(())
}

fn init_tracing(config: &AppConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    let log_dir = config
        .log_path
        .parent()
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("cannot create log directory {}", log_dir.display()))?;
    let file_name = config
        .log_path
        .file_name()
        .ok_or_else(|| anyhow!("log_path has no file name"))?;
    let file_appender = tracing_appender::rolling::daily(log_dir, file_name);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(file_appender),
        )
        .init();
    Ok(())
}

async fn build_runtimes(
    config: &AppConfig,
    force_dry_run: bool,
    notifier: &Notifier,
) -> Result<Vec<Arc<ProfileRuntime>>> {
    let strategy = Arc::new(StrategyWatcher::load(&config.strategy_path));
    let mut stores: HashMap<Environment, Arc<PositionStore>> = HashMap::new();
    let mut runtimes = Vec::new();

    for profile_cfg in &config.profiles {
        let environment = if force_dry_run {
            Environment::Test
        } else {
            profile_cfg.environment
        };
        let store = match stores.get(&environment) {
            Some(store) => store.clone(),
            None => {
                let store = Arc::new(
                    PositionStore::open(&config.data_path, environment)
                        .context("failed to open position store")?,
                );
                stores.insert(environment, store.clone());
                store
            }
        };

        let exchange_cfg = config
            .exchange
            .get(&profile_cfg.exchange)
            .ok_or_else(|| anyhow!("profile '{}' references unknown exchange '{}'", profile_cfg.name, profile_cfg.exchange))?;

        let mut profile = Profile {
            id: 0,
            name: profile_cfg.name.clone(),
            environment,
            exchange: profile_cfg.exchange.clone(),
            api_key: (!exchange_cfg.api_key.is_empty()).then(|| exchange_cfg.api_key.clone()),
            api_secret: (!exchange_cfg.api_secret.is_empty())
                .then(|| exchange_cfg.api_secret.clone()),
            active: true,
        };
        profile.id = store.add_profile(&profile)?;

        let adapter: Arc<dyn ExchangeAdapter> = if environment == Environment::Test {
            // Dry runs never reach a real venue; the trader simulates fills
            // and the paper venue just satisfies the adapter seam.
            Arc::new(PaperVenue::new(format!("paper-{}", exchange_cfg.driver)))
        } else {
            let factory = get_adapter_factory(&exchange_cfg.driver).ok_or_else(|| {
                anyhow!("driver '{}' is not registered", exchange_cfg.driver)
            })?;
            let mut params = exchange_cfg.params.clone();
            if !params.is_object() {
                params = serde_json::json!({});
            }
            if let (Some(url), Some(obj)) = (&exchange_cfg.rest_url, params.as_object_mut()) {
                obj.insert("rest_url".into(), serde_json::Value::String(url.clone()));
            }
            factory
                .build(&profile, &params)
                .await
                .with_context(|| format!("failed to build adapter for '{}'", profile.name))?
        };

        let (universe, slots) = resolve_universe(&profile, profile_cfg)?;
        info!(
            profile = %profile.name,
            env = ?environment,
            venue = adapter.name(),
            slots = slots.len(),
            "profile ready"
        );

        runtimes.push(Arc::new(ProfileRuntime {
            profile,
            adapter,
            store: store.clone(),
            strategy: strategy.clone(),
            engine_cfg: config.engine.clone(),
            risk_cfg: config.risk.clone(),
            notifier: notifier.clone(),
            market: Arc::new(CandleMarketData::new(store.clone(), Timeframe::M15)),
            signals: Arc::new(FileSignalFeed::new(
                config.data_path.join("signals"),
                (config.engine.heartbeat_secs * 12) as i64,
            )),
            universe,
            slots,
        }));
    }
    Ok(runtimes)
}

fn resolve_universe(
    profile: &Profile,
    cfg: &ProfileConfig,
) -> Result<(Vec<String>, Vec<SlotId>)> {
    let mut universe = Vec::new();
    let mut slots = Vec::new();
    for pair in &cfg.symbols {
        let Some((base, quote)) = ProfileConfig::split_symbol(pair) else {
            warn!(%pair, "skipping malformed symbol (expected BASE/QUOTE)");
            continue;
        };
        universe.push(format!("{base}{quote}"));
        for tf in &cfg.timeframes {
            let timeframe: Timeframe = tf
                .parse()
                .map_err(|err| anyhow!("profile '{}': {err}", cfg.name))?;
            slots.push(SlotId {
                profile_id: profile.id,
                exchange: profile.exchange.clone(),
                base: base.clone(),
                quote: quote.clone(),
                timeframe,
            });
        }
    }
    Ok((universe, slots))
}
