// =============================================================================
// Meridian Suite — Main Entry Point
// =============================================================================
//
// The supervisor: loads configuration, assembles the dependency graph, and
// spawns every long-running loop (harvesters, playbook observer, signal
// router, autopilot, config watcher).  The engine starts with trading
// disabled and paper mode on; operators enable live flow through the
// persisted config.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod analyzers;
mod app_state;
mod autopilot;
mod broker;
mod bus;
mod config;
mod ems;
mod gate;
mod harvester;
mod indicators;
mod kill_switch;
mod ledger;
mod market_data;
mod playbook;
mod regime;
mod risk;
mod signal;
mod swarm;
mod types;

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::analyzers::crypto_vision::CryptoVisionAnalyzer;
use crate::analyzers::geopolitical::GeoPulseAnalyzer;
use crate::analyzers::rates::RatesAnalyzer;
use crate::analyzers::social::SocialAnalyzer;
use crate::analyzers::weather::WeatherAnalyzer;
use crate::analyzers::Analyzer;
use crate::app_state::AppState;
use crate::autopilot::Autopilot;
use crate::config::RuntimeConfig;
use crate::ems::SignalRouter;
use crate::harvester::Harvester;
use crate::market_data::SeriesKey;
use crate::playbook::PlaybookObserver;

const CONFIG_PATH: &str = "meridian_config.json";
const LEDGER_PATH: &str = "data/trade_ledger.csv";
const ARCHIVE_ROOT: &str = "data/playbook";

/// Seconds between config-file reload checks.
const CONFIG_WATCH_INTERVAL_SECS: u64 = 30;
/// Seconds between portfolio-heat publications.
const HEAT_INTERVAL_SECS: u64 = 120;
/// Seconds between analyst-swarm passes over the watchlist.
const SWARM_INTERVAL_SECS: u64 = 600;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║            Meridian Suite — Starting Up                 ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        RuntimeConfig::default()
    });

    // SAFETY: trading always starts disabled; operators re-enable explicitly.
    config.trading_enabled = false;
    config.paper_mode = true;

    info!(
        environment = %config.environment,
        active_broker = %config.active_broker,
        watchlist = config.watchlist.len(),
        "engine starting in SAFE mode (paper + disabled)"
    );

    // ── 2. Build shared state ────────────────────────────────────────────
    let state = AppState::build(config, LEDGER_PATH).await?;

    // ── 3. Harvesters ────────────────────────────────────────────────────
    let harvester = Arc::new(Harvester::new(state.bus.clone(), state.ticks.clone()));

    let equity_symbols: Vec<String> = {
        let watchlist = state.config.read().watchlist.clone();
        let mut symbols: BTreeSet<String> = watchlist.into_iter().collect();
        for macro_symbol in ["SPY", "JNK", "TLT", "^IRX", "^TNX", "^VIX"] {
            symbols.insert(macro_symbol.to_string());
        }
        symbols.into_iter().collect()
    };
    tokio::spawn(harvester.clone().run_equity_loop(equity_symbols));
    tokio::spawn(harvester.clone().run_crypto_loop(vec!["BTC-USD".to_string()]));
    tokio::spawn(harvester.clone().run_macro_loop());
    tokio::spawn(harvester.clone().run_book_loop(
        state.prediction_venue.clone(),
        state.book_mirror.clone(),
        vec![
            "KXHIGHMIA".to_string(),
            "KXHIGHNYC".to_string(),
            "KXHIGHCHI".to_string(),
        ],
    ));
    info!("harvesters launched");

    // ── 4. Playbook observer ─────────────────────────────────────────────
    let observer = Arc::new(PlaybookObserver::new(
        state.bus.clone(),
        state.ticks.clone(),
        state.ledger.clone(),
        state.kill_switch.clone(),
        state.config.clone(),
        ARCHIVE_ROOT,
    ));
    tokio::spawn(observer.run());

    // ── 5. Signal router (EMS) ───────────────────────────────────────────
    let router = Arc::new(SignalRouter::new(
        state.bus.clone(),
        state.brokers.clone(),
        state.ledger.clone(),
        state.kill_switch.clone(),
        state.config.clone(),
    ));
    tokio::spawn(router.run());

    // ── 6. Autopilot with its analyzer fleet ─────────────────────────────
    let analyzers: Vec<Arc<dyn Analyzer>> = vec![
        Arc::new(CryptoVisionAnalyzer::new(
            state.bus.clone(),
            state.ticks.clone(),
            "BTC-USD",
            "5m",
        )),
        Arc::new(RatesAnalyzer::new(state.bus.clone(), state.ticks.clone())),
        Arc::new(SocialAnalyzer::new(
            state.bus.clone(),
            std::env::var("X_BEARER_TOKEN").ok(),
            state.config.read().x_api_budget_limit,
            state.config.read().social_scan_frequency_mins,
        )),
        Arc::new(WeatherAnalyzer::new(
            state.bus.clone(),
            state.prediction_venue.clone(),
            state.config.read().weather_variance_threshold,
        )),
        Arc::new(GeoPulseAnalyzer::new(
            state.bus.clone(),
            std::env::var("GEO_EVENT_FEED_URL").ok(),
        )),
    ];

    let pilot = Arc::new(Autopilot::new(
        state.bus.clone(),
        state.config.clone(),
        state.brokers.clone(),
        state.prediction_venue.clone(),
        state.ledger.clone(),
        state.risk.clone(),
        state.kill_switch.clone(),
        analyzers,
    ));
    tokio::spawn(pilot.run());

    // ── 7. Config hot-reload watcher ─────────────────────────────────────
    let watch_config = state.config.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(CONFIG_WATCH_INTERVAL_SECS));
        loop {
            interval.tick().await;
            match RuntimeConfig::load(CONFIG_PATH) {
                Ok(fresh) => watch_config.write().apply_hot_reload(&fresh),
                Err(e) => tracing::debug!(error = %e, "config reload skipped"),
            }
        }
    });

    // ── 8. Portfolio heat publisher ──────────────────────────────────────
    let heat_state = state.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(HEAT_INTERVAL_SECS));
        loop {
            interval.tick().await;
            let exposure: f64 = heat_state
                .brokers
                .aggregate_positions()
                .await
                .iter()
                .map(|p| p.market_value.abs())
                .sum();
            let budget = heat_state.config.read().max_budget.max(1.0);
            let heat = (exposure / budget).clamp(0.0, 1.0);
            heat_state
                .bus
                .publish(
                    bus::keys::PORTFOLIO_HEAT,
                    serde_json::json!(heat),
                    "portfolio_monitor",
                    1.0,
                )
                .await;
        }
    });

    // ── 9. Analyst swarm pipeline ────────────────────────────────────────
    let swarm_state = state.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(SWARM_INTERVAL_SECS));
        loop {
            interval.tick().await;

            let regime = swarm_state
                .bus
                .read(bus::keys::PLAYBOOK_SNAPSHOT)
                .await
                .and_then(|p| {
                    p.value
                        .pointer("/regime/regime")
                        .and_then(|v| serde_json::from_value::<regime::Regime>(v.clone()).ok())
                });

            let watchlist = swarm_state.config.read().watchlist.clone();
            for symbol in watchlist {
                let bars = swarm_state.ticks.bars(&SeriesKey::daily(&symbol), 120);
                if bars.len() < 30 {
                    continue;
                }
                swarm::evaluate_and_publish(&swarm_state.bus, &symbol, &bars, regime).await;
            }
        }
    });

    info!("all subsystems running — Ctrl+C to stop");

    // ── 10. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    if let Err(e) = state.config.read().save(CONFIG_PATH) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("meridian suite shut down complete");
    Ok(())
}
