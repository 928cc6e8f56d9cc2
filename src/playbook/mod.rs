// =============================================================================
// Playbook Observer — the observation-only context loop
// =============================================================================
//
// Every 300 seconds: classify the macro regime, scan the watchlist for
// tactical setups, compute a risk snapshot (CVaR over recent closed-trade
// returns, Kelly baseline, drawdown), run the kill-switch health checks,
// and record everything to the JSONL archive and the bus key
// `intel:playbook_snapshot`.
//
// This service never places orders.  While the kill switch is latched the
// scan cycle suspends and only the latch state is recorded.
// =============================================================================

pub mod archive;
pub mod catalog;

pub use archive::PlaybookArchive;
pub use catalog::{scan_symbol, PatternSignal};

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{error, info};

use crate::bus::{keys, IntelBus};
use crate::config::RuntimeConfig;
use crate::kill_switch::KillSwitch;
use crate::ledger::{Ledger, PerformanceStats};
use crate::market_data::{SeriesKey, TickStore};
use crate::regime::{classify_regime, RegimeState};
use crate::risk::{CVaRCalculator, DrawdownMonitor, KellyAllocator};

const SOURCE: &str = "playbook";
/// Seconds between observation cycles.
const CYCLE_INTERVAL_SECS: u64 = 300;
/// Sleep while the kill switch is latched.
const HALTED_NAP_SECS: u64 = 60;
/// Bars fetched per watchlist symbol (enough for every detector).
const SCAN_BARS: usize = 260;
/// Minimum closed-trade sample before CVaR is meaningful.
const MIN_RETURNS_FOR_CVAR: usize = 10;

/// Risk metrics recorded each cycle.
#[derive(Debug, Clone, Serialize)]
pub struct RiskSnapshot {
    pub cvar_99: f64,
    pub kelly_baseline: f64,
    pub portfolio_drawdown: f64,
    pub sample_size: usize,
}

/// Kelly sizing seeded from realized performance, falling back to the
/// break-even prior when the sample is thin.
pub fn kelly_baseline(stats: &PerformanceStats, allocator: &KellyAllocator) -> f64 {
    if stats.total_sells >= MIN_RETURNS_FOR_CVAR {
        allocator.fraction_from_stats(stats.win_rate, 1.0, 1.0)
    } else {
        allocator.fraction_from_stats(0.50, 1.0, 1.0)
    }
}

pub struct PlaybookObserver {
    bus: Arc<IntelBus>,
    ticks: Arc<TickStore>,
    ledger: Arc<Ledger>,
    kill_switch: Arc<KillSwitch>,
    config: Arc<RwLock<RuntimeConfig>>,
    archive: PlaybookArchive,
    cvar: CVaRCalculator,
    drawdown: DrawdownMonitor,
    allocator: KellyAllocator,
}

impl PlaybookObserver {
    pub fn new(
        bus: Arc<IntelBus>,
        ticks: Arc<TickStore>,
        ledger: Arc<Ledger>,
        kill_switch: Arc<KillSwitch>,
        config: Arc<RwLock<RuntimeConfig>>,
        archive_root: &str,
    ) -> Self {
        let kelly_fraction = config.read().risk_level.kelly_fraction();
        let max_position_frac = config.read().max_position_size / 100.0;
        Self {
            bus,
            ticks,
            ledger,
            kill_switch,
            config,
            archive: PlaybookArchive::new(archive_root),
            cvar: CVaRCalculator::new(0.99),
            drawdown: DrawdownMonitor::default(),
            allocator: KellyAllocator::new(kelly_fraction, max_position_frac),
        }
    }

    pub async fn run(self: Arc<Self>) {
        info!("playbook observer starting");
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(CYCLE_INTERVAL_SECS));
        loop {
            interval.tick().await;

            if self.kill_switch.is_triggered() {
                self.archive.write(
                    "kill_switch",
                    None,
                    serde_json::to_value(self.kill_switch.state_snapshot()).unwrap_or_default(),
                );
                error!("kill switch latched — playbook scans suspended");
                tokio::time::sleep(std::time::Duration::from_secs(HALTED_NAP_SECS)).await;
                continue;
            }

            self.run_cycle().await;
        }
    }

    /// One full observation cycle. Errors inside a cycle are recorded and
    /// never fatal.
    pub async fn run_cycle(&self) {
        let cycle_start = std::time::Instant::now();

        // ── 1. Macro regime ──────────────────────────────────────────────
        let spy = self.ticks.closes(&SeriesKey::daily("SPY"), 70);
        let jnk = self.ticks.closes(&SeriesKey::daily("JNK"), 70);
        let tlt = self.ticks.closes(&SeriesKey::daily("TLT"), 70);
        let regime_state = classify_regime(
            &spy,
            (!jnk.is_empty()).then_some(jnk.as_slice()),
            (!tlt.is_empty()).then_some(tlt.as_slice()),
        );
        info!(regime = %regime_state.regime, reason = %regime_state.reason, "cycle regime");
        self.archive.write(
            "regime",
            Some(regime_state.regime.to_string()),
            serde_json::to_value(&regime_state).unwrap_or_default(),
        );

        // Publish the SPY trend read alongside the snapshot.
        let spy_trend = match regime_state.regime {
            crate::regime::Regime::Green => "bullish",
            crate::regime::Regime::Yellow => "neutral",
            crate::regime::Regime::Red => "bearish",
        };
        self.bus
            .publish(
                keys::SPY_TREND,
                serde_json::json!(spy_trend),
                SOURCE,
                regime_state.confidence,
            )
            .await;

        // ── 2. Watchlist signal scan ─────────────────────────────────────
        let watchlist = self.config.read().watchlist.clone();
        let mut signals_found: Vec<PatternSignal> = Vec::new();
        for symbol in &watchlist {
            let bars = self.ticks.bars(&SeriesKey::daily(symbol), SCAN_BARS);
            if bars.is_empty() {
                continue;
            }
            for signal in scan_symbol(&bars, symbol) {
                info!(
                    pattern = %signal.pattern,
                    symbol = %symbol,
                    confidence = signal.confidence,
                    entry = signal.entry_price,
                    stop = signal.stop_price,
                    "tactical signal"
                );
                self.archive.write(
                    "signal",
                    Some(regime_state.regime.to_string()),
                    serde_json::to_value(&signal).unwrap_or_default(),
                );
                signals_found.push(signal);
            }
        }
        if signals_found.is_empty() {
            info!("no tactical signals this cycle");
        }

        // ── 3. Risk snapshot ─────────────────────────────────────────────
        let risk = self.build_risk_snapshot();
        self.archive.write(
            "risk",
            Some(regime_state.regime.to_string()),
            serde_json::to_value(&risk).unwrap_or_default(),
        );

        // ── 4. Kill-switch health checks ─────────────────────────────────
        let nav = self.config.read().max_budget;
        if self.kill_switch.run_all_checks(nav).await.is_some() {
            self.archive.write(
                "kill_switch",
                Some(regime_state.regime.to_string()),
                serde_json::to_value(self.kill_switch.state_snapshot()).unwrap_or_default(),
            );
        }

        // ── 5. Strategy mode coaching ────────────────────────────────────
        self.publish_strategy_mode().await;

        // ── 6. Bus snapshot ──────────────────────────────────────────────
        self.publish_snapshot(&regime_state, &signals_found, &risk)
            .await;

        info!(
            elapsed_s = cycle_start.elapsed().as_secs_f64(),
            signals = signals_found.len(),
            "playbook cycle complete"
        );
    }

    fn build_risk_snapshot(&self) -> RiskSnapshot {
        let returns = self.ledger.closed_trade_returns().unwrap_or_default();
        let cvar_99 = if returns.len() >= MIN_RETURNS_FOR_CVAR {
            self.cvar.calculate(&returns)
        } else {
            0.0
        };

        let stats = self
            .ledger
            .performance_stats(200)
            .unwrap_or(PerformanceStats {
                total_sells: 0,
                win_rate: 0.0,
                realized_pnl: 0.0,
            });
        let kelly = kelly_baseline(&stats, &self.allocator);

        let equity = self.config.read().max_budget + stats.realized_pnl;
        self.drawdown.update("portfolio", equity);
        let portfolio_drawdown = self
            .drawdown
            .snapshot()
            .get("portfolio")
            .map(|d| d.drawdown)
            .unwrap_or(0.0);

        RiskSnapshot {
            cvar_99,
            kelly_baseline: kelly,
            portfolio_drawdown,
            sample_size: returns.len(),
        }
    }

    /// Derive the suite-wide strategy mode: market panic forces sniper
    /// selectivity; otherwise recent win rate picks conservative vs
    /// aggressive.
    async fn publish_strategy_mode(&self) {
        let fear_greed = self
            .bus
            .read(keys::FEAR_GREED)
            .await
            .and_then(|p| p.as_f64());

        let mode = if fear_greed.map(|f| f < 25.0).unwrap_or(false) {
            "sniper"
        } else {
            match self.ledger.performance_stats(50) {
                Ok(stats) if stats.total_sells >= 5 && stats.win_rate < 0.45 => "conservative",
                Ok(stats) if stats.total_sells >= 5 => "aggressive",
                _ => "conservative",
            }
        };

        self.bus
            .publish(keys::STRATEGY_MODE, serde_json::json!(mode), SOURCE, 1.0)
            .await;
    }

    async fn publish_snapshot(
        &self,
        regime: &RegimeState,
        signals: &[PatternSignal],
        risk: &RiskSnapshot,
    ) {
        let payload = serde_json::json!({
            "regime": regime,
            "signals": signals,
            "risk": risk,
        });
        self.bus
            .publish(keys::PLAYBOOK_SNAPSHOT, payload, SOURCE, regime.confidence)
            .await;
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::Candle;

    fn observer() -> PlaybookObserver {
        let bus = Arc::new(IntelBus::disabled());
        let ledger = Arc::new(
            Ledger::open(
                std::env::temp_dir().join(format!("playbook-{}.csv", uuid::Uuid::new_v4())),
            )
            .unwrap(),
        );
        let archive_root = std::env::temp_dir()
            .join(format!("playbook-archive-{}", uuid::Uuid::new_v4()))
            .to_string_lossy()
            .into_owned();
        PlaybookObserver::new(
            bus.clone(),
            Arc::new(TickStore::new(300)),
            ledger,
            Arc::new(KillSwitch::new(bus)),
            Arc::new(RwLock::new(RuntimeConfig::default())),
            &archive_root,
        )
    }

    #[test]
    fn kelly_baseline_uses_history_when_available() {
        let allocator = KellyAllocator::new(0.25, 0.10);
        let thin = PerformanceStats {
            total_sells: 3,
            win_rate: 0.9,
            realized_pnl: 0.0,
        };
        // Thin sample: break-even prior (f* = 0).
        assert!((kelly_baseline(&thin, &allocator) - 0.0).abs() < 1e-12);

        let seasoned = PerformanceStats {
            total_sells: 40,
            win_rate: 0.60,
            realized_pnl: 120.0,
        };
        // p=0.6, w=l=1: f* = 0.2, quarter-Kelly = 0.05.
        assert!((kelly_baseline(&seasoned, &allocator) - 0.05).abs() < 1e-12);
    }

    #[tokio::test]
    async fn empty_substrate_cycle_records_defensive_regime() {
        let obs = observer();
        // No harvested bars at all: the cycle must complete without error
        // and classify RED on insufficient data.
        obs.run_cycle().await;

        let spy = obs.ticks.closes(&SeriesKey::daily("SPY"), 70);
        assert!(spy.is_empty());
    }

    #[tokio::test]
    async fn seeded_substrate_classifies_green() {
        let obs = observer();
        for i in 0..60 {
            obs.ticks.append(
                SeriesKey::daily("SPY"),
                Candle {
                    timestamp: i,
                    open: 100.0 + i as f64,
                    high: 101.0 + i as f64,
                    low: 99.0 + i as f64,
                    close: 100.0 + i as f64,
                    volume: 1.0,
                },
            );
        }
        obs.run_cycle().await;
        let spy = obs.ticks.closes(&SeriesKey::daily("SPY"), 70);
        let state = classify_regime(&spy, None, None);
        assert_eq!(state.regime, crate::regime::Regime::Green);
    }
}
