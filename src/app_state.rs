// =============================================================================
// Central Application State — Meridian Suite
// =============================================================================
//
// The wiring hub for every subsystem.  All components receive their
// dependencies here at construction — no module-level singletons.  The
// supervisor in main.rs builds one AppState, wraps it in Arc, and hands
// clones to each spawned loop.
//
// Thread safety:
//   - parking_lot::RwLock around the hot-reloadable config.
//   - Arc wrappers for subsystems that manage their own interior
//     mutability.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::broker::alpaca::AlpacaAdapter;
use crate::broker::coinbase::CoinbaseAdapter;
use crate::broker::kalshi::KalshiAdapter;
use crate::broker::BrokerRouter;
use crate::bus::IntelBus;
use crate::config::RuntimeConfig;
use crate::kill_switch::KillSwitch;
use crate::ledger::Ledger;
use crate::market_data::{OrderBookMirror, TickStore};
use crate::risk::RiskEngine;
use crate::types::Environment;

/// Bars retained per harvested series.
const TICK_STORE_DEPTH: usize = 500;
/// Daily loss cap as a fraction of the configured bankroll.
const DAILY_LOSS_CAP_FRAC: f64 = 0.03;

pub struct AppState {
    pub config: Arc<RwLock<RuntimeConfig>>,
    pub bus: Arc<IntelBus>,
    pub ticks: Arc<TickStore>,
    pub book_mirror: Arc<OrderBookMirror>,
    pub ledger: Arc<Ledger>,
    pub risk: Arc<RiskEngine>,
    pub kill_switch: Arc<KillSwitch>,
    pub brokers: Arc<BrokerRouter>,
    pub prediction_venue: Arc<KalshiAdapter>,
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Construct the full dependency graph from config + environment.
    pub async fn build(config: RuntimeConfig, ledger_path: &str) -> Result<Arc<Self>> {
        let config = Arc::new(RwLock::new(config));

        // ── Bus ──────────────────────────────────────────────────────────
        let redis_url = std::env::var("MERIDIAN_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let bus = Arc::new(IntelBus::connect(&redis_url).await);

        // ── Ledger + risk guards ─────────────────────────────────────────
        let ledger =
            Arc::new(Ledger::open(ledger_path).context("failed to open the trade ledger")?);
        let (wash_sale_enabled, daily_loss_limit) = {
            let cfg = config.read();
            (
                cfg.wash_sale_guard_enabled,
                cfg.max_budget * DAILY_LOSS_CAP_FRAC,
            )
        };
        let risk = Arc::new(RiskEngine::new(
            ledger.clone(),
            wash_sale_enabled,
            daily_loss_limit,
        ));

        // ── Kill switch ──────────────────────────────────────────────────
        let kill_switch = Arc::new(KillSwitch::new(bus.clone()));

        // ── Venue adapters ───────────────────────────────────────────────
        let paper = config.read().environment == Environment::Paper;

        let alpaca = Arc::new(AlpacaAdapter::new(
            std::env::var("ALPACA_API_KEY").unwrap_or_default(),
            std::env::var("ALPACA_API_SECRET").unwrap_or_default(),
            paper,
        ));
        let coinbase = Arc::new(CoinbaseAdapter::new(
            std::env::var("COINBASE_API_KEY").unwrap_or_default(),
            std::env::var("COINBASE_API_SECRET").unwrap_or_default(),
        ));
        let prediction_venue = match std::env::var("KALSHI_PRIVATE_KEY_PATH") {
            Ok(path) => Arc::new(KalshiAdapter::from_key_file(
                std::env::var("KALSHI_API_KEY").unwrap_or_default(),
                &path,
                paper,
            )),
            Err(_) => {
                warn!("KALSHI_PRIVATE_KEY_PATH not set — prediction venue degraded");
                Arc::new(KalshiAdapter::new(
                    std::env::var("KALSHI_API_KEY").unwrap_or_default(),
                    None,
                    paper,
                ))
            }
        };

        let (routing_enabled, active_broker) = {
            let cfg = config.read();
            (cfg.routing_enabled, cfg.active_broker.clone())
        };
        let mut brokers = BrokerRouter::new(routing_enabled, &active_broker);
        brokers.register(alpaca);
        brokers.register(coinbase);
        brokers.register(prediction_venue.clone());
        let brokers = Arc::new(brokers);

        info!(
            bus_enabled = bus.is_enabled(),
            routing_enabled, active_broker, "application state assembled"
        );

        Ok(Arc::new(Self {
            config,
            bus,
            ticks: Arc::new(TickStore::new(TICK_STORE_DEPTH)),
            book_mirror: Arc::new(OrderBookMirror::new()),
            ledger,
            risk,
            kill_switch,
            brokers,
            prediction_venue,
            start_time: std::time::Instant::now(),
        }))
    }
}
