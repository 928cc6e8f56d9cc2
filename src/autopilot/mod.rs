// =============================================================================
// Autopilot — the periodic scan-and-execute daemon
// =============================================================================
//
// One iteration every ~30 seconds:
//   1. Reload settings; idle when trading is disabled or paused.
//   2. Read the bus: portfolio heat (hard stop above 0.8), BTC sentiment,
//      SPY trend.
//   3. Manage exits on live positions.
//   4. Invoke every registered analyzer in parallel.
//   5. Build the opportunity list (per-module thresholds, macro penalty),
//      rank by score, take the best.
//   6. Gates in order: blacklist cooldown, already-held, trade-id
//      idempotency, global minimum score.
//   7. Size via fractional Kelly and execute (or record-only in paper mode).
//
// Restart safety: the executed-trades and blacklist maps are persisted to
// the bus and restored on boot, and current venue positions seed the memory
// so a restart never duplicates an open trade.
// =============================================================================

pub mod exits;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::analyzers::{Analyzer, AnalyzerOutcome};
use crate::broker::kalshi::KalshiAdapter;
use crate::broker::{submit_smart_order, BrokerAdapter, BrokerRouter, OrderSide, OrderType};
use crate::bus::{channels, keys, IntelBus, CANCEL_ALL};
use crate::config::RuntimeConfig;
use crate::kill_switch::KillSwitch;
use crate::ledger::{Ledger, LedgerAction, LedgerEntry};
use crate::risk::{KellyAllocator, RiskEngine};

/// Seconds between scan cycles.
const SCAN_INTERVAL_SECS: u64 = 30;
/// Sleep when trading is disabled.
const DISABLED_NAP_SECS: u64 = 60;
/// Portfolio heat above which no new trades are considered.
pub const HEAT_HARD_STOP: f64 = 0.8;
/// Score multiplier applied to BTC when macro and sentiment are both bearish.
const MACRO_PENALTY: f64 = 0.85;
/// Blacklist cooldown after any exit.
pub const BLACKLIST_COOLDOWN_SECS: f64 = 4.0 * 3600.0;

// ---------------------------------------------------------------------------
// Opportunity
// ---------------------------------------------------------------------------

/// A candidate trade produced by one analyzer in one cycle.
#[derive(Debug, Clone)]
pub struct Opportunity {
    pub module: String,
    pub signal: String,
    pub score: f64,
    pub odds: f64,
    pub extras: serde_json::Value,
}

impl Opportunity {
    /// Venue ticker, when the analyzer resolved one.
    pub fn ticker(&self) -> Option<&str> {
        self.extras.get("ticker").and_then(|v| v.as_str())
    }

    /// City tag for weather opportunities.
    pub fn city(&self) -> Option<&str> {
        self.extras.get("city").and_then(|v| v.as_str())
    }
}

/// Skip the whole cycle when cross-system heat is critical.
pub fn heat_hard_stop(heat: Option<f64>) -> bool {
    heat.map(|h| h > HEAT_HARD_STOP).unwrap_or(false)
}

/// Dollar stake for a scored opportunity under the configured sizing method.
pub fn stake_for(config: &RuntimeConfig, score: f64, odds: f64) -> f64 {
    let cap_frac = config.max_position_size / 100.0;
    match config.bet_sizing_method {
        crate::types::SizingMethod::Kelly => {
            KellyAllocator::new(config.risk_level.kelly_fraction(), cap_frac)
                .position_size(config.max_budget, score, odds)
        }
        // Flat: a fixed 1% of bankroll per entry, still under the cap.
        crate::types::SizingMethod::Flat => config.max_budget * cap_frac.min(0.01),
        // Percentage: the full per-position cap every time.
        crate::types::SizingMethod::Percentage => config.max_budget * cap_frac,
    }
}

/// Assemble the ranked opportunity list from analyzer outcomes.
///
/// Per-module entry thresholds apply before ranking; the macro penalty
/// scales the BTC score by 0.85 when the bus reports a bearish SPY trend
/// alongside negative BTC sentiment.
pub fn build_opportunities(
    outcomes: &[(String, AnalyzerOutcome)],
    config: &RuntimeConfig,
    spy_trend: &str,
    btc_sentiment: Option<f64>,
) -> Vec<Opportunity> {
    let macro_bearish =
        spy_trend.eq_ignore_ascii_case("bearish") && btc_sentiment.map(|s| s < 0.0).unwrap_or(false);

    let mut opportunities = Vec::new();
    for (module, outcome) in outcomes {
        let Some(assessment) = outcome.success() else {
            if let AnalyzerOutcome::Error(kind) = outcome {
                debug!(module = %module, error = %kind, "analyzer error — ignored for ranking");
            }
            continue;
        };

        let mut score = assessment.score;
        if module == "BTC" && macro_bearish {
            score = (score * MACRO_PENALTY).floor();
            debug!(module = %module, score, "macro penalty applied");
        }

        let threshold = match module.as_str() {
            "BTC" => config.btc_threshold as f64,
            "SOCIAL" => config.social_threshold * 100.0,
            _ => config.global_min_score as f64,
        };
        if score < threshold {
            continue;
        }

        opportunities.push(Opportunity {
            module: module.clone(),
            signal: assessment.signal.clone(),
            score,
            odds: assessment.odds,
            extras: assessment.extras.clone(),
        });
    }

    opportunities.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    opportunities
}

// ---------------------------------------------------------------------------
// Trade memory — idempotency map + blacklist
// ---------------------------------------------------------------------------

/// Restart-safe execution memory: synthetic trade ids and raw ticker tags
/// map to execution timestamps; the blacklist maps tickers to cooldown
/// expiry.  Owned by the autopilot, persisted to the bus, never mutated by
/// other components.
#[derive(Debug, Default)]
pub struct TradeMemory {
    pub executed: HashMap<String, f64>,
    pub blacklist: HashMap<String, f64>,
}

impl TradeMemory {
    pub fn trade_id(signal: &str) -> String {
        format!("{signal}_{}", Utc::now().format("%Y-%m-%d"))
    }

    pub fn ticker_tag(ticker: &str) -> String {
        format!("TICKER_{ticker}")
    }

    pub fn record_execution(&mut self, signal: &str, now: f64) {
        self.executed.insert(Self::trade_id(signal), now);
    }

    pub fn record_ticker(&mut self, ticker: &str, now: f64) {
        self.executed.insert(Self::ticker_tag(ticker), now);
    }

    pub fn already_executed(&self, signal: &str) -> bool {
        self.executed.contains_key(&Self::trade_id(signal))
    }

    pub fn holds_ticker(&self, ticker: &str) -> bool {
        self.executed.contains_key(&Self::ticker_tag(ticker))
    }

    /// Seconds-since-epoch when `ticker` was entered, if tracked.
    pub fn entry_time(&self, ticker: &str) -> Option<f64> {
        self.executed.get(&Self::ticker_tag(ticker)).copied()
    }

    pub fn blacklist_until(&mut self, ticker: &str, expiry: f64) {
        self.blacklist.insert(ticker.to_string(), expiry);
    }

    /// Expired entries are cleared lazily on read.
    pub fn is_blacklisted(&mut self, ticker: &str, now: f64) -> bool {
        self.blacklist.retain(|_, expiry| *expiry > now);
        self.blacklist
            .iter()
            .any(|(t, _)| ticker.contains(t.as_str()) || t.contains(ticker))
    }
}

// ---------------------------------------------------------------------------
// Autopilot
// ---------------------------------------------------------------------------

pub struct Autopilot {
    bus: Arc<IntelBus>,
    config: Arc<RwLock<RuntimeConfig>>,
    brokers: Arc<BrokerRouter>,
    prediction_venue: Arc<KalshiAdapter>,
    ledger: Arc<Ledger>,
    risk: Arc<RiskEngine>,
    kill_switch: Arc<KillSwitch>,
    analyzers: Vec<Arc<dyn Analyzer>>,
    memory: RwLock<TradeMemory>,
}

impl Autopilot {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: Arc<IntelBus>,
        config: Arc<RwLock<RuntimeConfig>>,
        brokers: Arc<BrokerRouter>,
        prediction_venue: Arc<KalshiAdapter>,
        ledger: Arc<Ledger>,
        risk: Arc<RiskEngine>,
        kill_switch: Arc<KillSwitch>,
        analyzers: Vec<Arc<dyn Analyzer>>,
    ) -> Self {
        Self {
            bus,
            config,
            brokers,
            prediction_venue,
            ledger,
            risk,
            kill_switch,
            analyzers,
            memory: RwLock::new(TradeMemory::default()),
        }
    }

    // -------------------------------------------------------------------------
    // State persistence
    // -------------------------------------------------------------------------

    /// Restore the execution memory from the bus so a restart never
    /// re-fires trades.
    pub async fn restore_state(&self) {
        if let Some(value) = self.bus.read_durable(keys::EXECUTED_TRADES).await {
            if let Ok(map) = serde_json::from_value::<HashMap<String, f64>>(value) {
                info!(count = map.len(), "restored executed trades from bus");
                self.memory.write().executed = map;
            }
        }
        if let Some(value) = self.bus.read_durable(keys::BLACKLIST).await {
            if let Ok(map) = serde_json::from_value::<HashMap<String, f64>>(value) {
                info!(count = map.len(), "restored blacklist from bus");
                self.memory.write().blacklist = map;
            }
        }
    }

    fn record_execution(&self, signal: &str, now: f64, ticker: Option<&str>) {
        let mut memory = self.memory.write();
        memory.record_execution(signal, now);
        if let Some(t) = ticker {
            memory.record_ticker(t, now);
        }
    }

    async fn persist_state(&self) {
        let (executed, blacklist) = {
            let memory = self.memory.read();
            (
                serde_json::to_value(&memory.executed).unwrap_or_default(),
                serde_json::to_value(&memory.blacklist).unwrap_or_default(),
            )
        };
        self.bus.publish_durable(keys::EXECUTED_TRADES, executed).await;
        self.bus.publish_durable(keys::BLACKLIST, blacklist).await;
    }

    /// Tag every live venue position so the gates treat it as held.
    pub async fn seed_from_venue_positions(&self) {
        let now = crate::bus::epoch_now();
        match self.prediction_venue.get_positions().await {
            Ok(positions) => {
                let mut memory = self.memory.write();
                for position in positions {
                    info!(ticker = %position.symbol, "tracking existing position");
                    memory.record_ticker(&position.symbol, now);
                }
            }
            Err(e) => warn!(error = %e, "could not seed from venue positions"),
        }
    }

    // -------------------------------------------------------------------------
    // Main loop
    // -------------------------------------------------------------------------

    pub async fn run(self: Arc<Self>) {
        info!("autopilot engaged — scanning markets");
        self.restore_state().await;
        self.seed_from_venue_positions().await;

        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(SCAN_INTERVAL_SECS));
        loop {
            interval.tick().await;
            debug!(at = %Utc::now().format("%H:%M:%S"), "autopilot heartbeat");

            let config = self.config.read().clone();
            if !config.trading_enabled || config.bot_paused {
                tokio::time::sleep(std::time::Duration::from_secs(DISABLED_NAP_SECS)).await;
                continue;
            }
            if self.kill_switch.is_triggered() {
                warn!("kill switch latched — autopilot idling");
                tokio::time::sleep(std::time::Duration::from_secs(DISABLED_NAP_SECS)).await;
                continue;
            }

            // ── Bus reads ────────────────────────────────────────────────
            let heat = self
                .bus
                .read(keys::PORTFOLIO_HEAT)
                .await
                .and_then(|p| p.as_f64());
            let btc_sentiment = self
                .bus
                .read(keys::BTC_SENTIMENT)
                .await
                .and_then(|p| p.as_f64());
            let spy_trend = self
                .bus
                .read(keys::SPY_TREND)
                .await
                .and_then(|p| p.as_str().map(|s| s.to_string()))
                .unwrap_or_else(|| "neutral".to_string());

            // ── Exit management before new entries ───────────────────────
            self.manage_active_exits().await;

            // Heat hard stop: existing positions stay managed, but no
            // analyzers run and no new trades are considered.
            if heat_hard_stop(heat) {
                info!(heat = heat.unwrap_or(0.0), "portfolio heat hard stop — no new trades");
                continue;
            }

            // ── Parallel analyzer sweep ──────────────────────────────────
            let scans = self.analyzers.iter().map(|a| {
                let analyzer = a.clone();
                async move { (analyzer.name().to_string(), analyzer.analyze().await) }
            });
            let outcomes: Vec<(String, AnalyzerOutcome)> = join_all(scans).await;

            let opportunities =
                build_opportunities(&outcomes, &config, &spy_trend, btc_sentiment);
            let Some(best) = opportunities.first().cloned() else {
                continue;
            };
            info!(
                module = %best.module,
                signal = %best.signal,
                score = best.score,
                "best opportunity this cycle"
            );

            // ── Gate chain ───────────────────────────────────────────────
            let now = crate::bus::epoch_now();
            let gate_symbol = best
                .ticker()
                .or(best.city())
                .unwrap_or(&best.signal)
                .to_string();
            {
                let mut memory = self.memory.write();
                if memory.is_blacklisted(&gate_symbol, now) {
                    info!(symbol = %gate_symbol, "on cooldown — skipping");
                    continue;
                }
            }

            let live_positions = self.brokers.aggregate_positions().await;
            let already_held = live_positions.iter().any(|p| {
                best.ticker().map(|t| p.symbol.contains(t)).unwrap_or(false)
                    || best
                        .city()
                        .map(|c| p.symbol.contains(&format!("KXHIGH{c}")))
                        .unwrap_or(false)
                    || p.symbol.contains(&best.signal)
            });
            if already_held {
                info!(signal = %best.signal, "already holding — skipping");
                continue;
            }

            if self.memory.read().already_executed(&best.signal) {
                continue;
            }
            if best.score < config.global_min_score as f64 {
                continue;
            }
            if self.risk.daily_cap_breached() {
                warn!("daily loss cap active — entries suppressed");
                continue;
            }

            // ── Sizing ───────────────────────────────────────────────────
            let size = stake_for(&config, best.score, best.odds);
            if size <= 0.0 {
                continue;
            }

            let mode = if config.paper_mode { "[PAPER]" } else { "[LIVE]" };
            info!(mode, signal = %best.signal, size, "executing best opportunity");

            if config.paper_mode {
                self.record_execution(&best.signal, now, None);
                self.persist_state().await;
                continue;
            }

            match self.execute_opportunity(&best, size, &config).await {
                Ok(ticker) => {
                    self.record_execution(&best.signal, now, ticker.as_deref());
                    self.persist_state().await;
                }
                Err(e) => warn!(signal = %best.signal, error = %e, "execution failed"),
            }
        }
    }

    // -------------------------------------------------------------------------
    // Execution
    // -------------------------------------------------------------------------

    /// Route the opportunity to its venue. Returns the executed ticker when
    /// one was resolved.
    async fn execute_opportunity(
        &self,
        opportunity: &Opportunity,
        size: f64,
        config: &RuntimeConfig,
    ) -> Result<Option<String>, String> {
        self.kill_switch.record_order_message();

        // Prediction-market opportunities carry (or resolve to) a venue ticker.
        let prediction_ticker = match opportunity.ticker() {
            Some(t) => Some(t.to_string()),
            None => match opportunity.city() {
                Some(city) => self.resolve_city_market(city).await,
                None => None,
            },
        };

        if let Some(ticker) = prediction_ticker {
            if self.memory.read().holds_ticker(&ticker) {
                return Err(format!("already traded {ticker} today"));
            }
            let ack = self
                .prediction_venue
                .submit_order(&ticker, size, OrderSide::Buy, OrderType::Market, None)
                .await
                .map_err(|e| e.to_string())?;

            let price = self
                .prediction_venue
                .get_latest_price(&ticker)
                .await
                .unwrap_or(0.50);
            let entry = LedgerEntry::now(
                LedgerAction::Buy,
                &ticker,
                price,
                (size / price.max(0.01)).floor(),
                &format!("{} (score {:.0})", opportunity.signal, opportunity.score),
                0.0,
                self.prediction_venue.name(),
            );
            self.ledger.append(&entry).map_err(|e| e.to_string())?;
            info!(ticker = %ticker, order_id = %ack.id, "prediction order live");
            return Ok(Some(ticker));
        }

        // Crypto conviction routes to the crypto venue as a smart limit.
        if opportunity.module == "BTC" {
            let symbol = "BTC-USD";
            if self.risk.wash_sale_blocked(symbol) {
                return Err(format!("wash-sale guard blocks {symbol}"));
            }
            let adapter = self
                .brokers
                .route(symbol, Utc::now())
                .ok_or_else(|| "no venue for crypto".to_string())?;
            let (ack, quote) = submit_smart_order(
                adapter.as_ref(),
                symbol,
                OrderSide::Buy,
                size,
                config.max_slippage_pct,
            )
            .await
            .map_err(|e| e.to_string())?;

            let entry = LedgerEntry::now(
                LedgerAction::Buy,
                symbol,
                quote,
                size / quote,
                &format!("{} (score {:.0})", opportunity.signal, opportunity.score),
                0.0,
                adapter.name(),
            );
            self.ledger.append(&entry).map_err(|e| e.to_string())?;
            info!(symbol, order_id = %ack.id, "crypto order live");
            return Ok(Some(symbol.to_string()));
        }

        Err(format!(
            "no venue resolution for module {}",
            opportunity.module
        ))
    }

    /// First open high-temperature market for a city series.
    async fn resolve_city_market(&self, city: &str) -> Option<String> {
        match self
            .prediction_venue
            .list_open_markets(&format!("KXHIGH{city}"))
            .await
        {
            Ok(markets) => markets.first().map(|m| m.ticker.clone()),
            Err(e) => {
                warn!(city, error = %e, "city market lookup failed");
                None
            }
        }
    }

    /// Broadcast the emergency stop after a daily-cap breach.
    pub(crate) async fn broadcast_daily_cap_breach(&self) {
        self.bus
            .publish_channel(channels::EMERGENCY_STOP, CANCEL_ALL)
            .await;
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzers::Assessment;

    fn success(score: f64, signal: &str, odds: f64) -> AnalyzerOutcome {
        AnalyzerOutcome::Success(Assessment {
            score,
            signal: signal.to_string(),
            reason: String::new(),
            odds,
            extras: serde_json::Value::Null,
        })
    }

    #[test]
    fn heat_gate_trips_above_point_eight() {
        assert!(heat_hard_stop(Some(0.85)));
        assert!(!heat_hard_stop(Some(0.8))); // strict: > 0.8
        assert!(!heat_hard_stop(Some(0.2)));
        assert!(!heat_hard_stop(None)); // absent key = no signal = permissive
    }

    #[test]
    fn opportunities_rank_by_score_descending() {
        let config = RuntimeConfig::default();
        let outcomes = vec![
            ("BTC".to_string(), success(72.0, "BTC BULLISH", 1.95)),
            ("POWELL".to_string(), success(85.0, "Recession Hedge", 3.50)),
            ("GEO".to_string(), AnalyzerOutcome::NoSignal("calm".to_string())),
        ];
        let opportunities = build_opportunities(&outcomes, &config, "neutral", None);
        assert_eq!(opportunities.len(), 2);
        assert_eq!(opportunities[0].module, "POWELL");
        assert_eq!(opportunities[1].module, "BTC");
    }

    #[test]
    fn per_module_thresholds_filter() {
        let config = RuntimeConfig::default(); // btc_threshold 65
        let outcomes = vec![("BTC".to_string(), success(60.0, "BTC NEUTRAL", 1.95))];
        assert!(build_opportunities(&outcomes, &config, "neutral", None).is_empty());
    }

    #[test]
    fn macro_penalty_applies_only_when_both_bearish() {
        let config = RuntimeConfig::default();
        let outcomes = vec![("BTC".to_string(), success(80.0, "BTC BULLISH", 1.95))];

        // Bearish SPY + negative BTC sentiment: 80 × 0.85 = 68.
        let penalised = build_opportunities(&outcomes, &config, "bearish", Some(-0.4));
        assert!((penalised[0].score - 68.0).abs() < 1e-9);

        // Bearish SPY alone: untouched.
        let untouched = build_opportunities(&outcomes, &config, "bearish", Some(0.2));
        assert!((untouched[0].score - 80.0).abs() < 1e-9);

        // Negative sentiment alone: untouched.
        let untouched = build_opportunities(&outcomes, &config, "bullish", Some(-0.4));
        assert!((untouched[0].score - 80.0).abs() < 1e-9);
    }

    #[test]
    fn penalty_can_push_below_threshold() {
        let mut config = RuntimeConfig::default();
        config.btc_threshold = 70;
        let outcomes = vec![("BTC".to_string(), success(80.0, "BTC BULLISH", 1.95))];
        // 80 × 0.85 = 68 < 70: filtered out entirely.
        assert!(build_opportunities(&outcomes, &config, "bearish", Some(-0.4)).is_empty());
    }

    #[test]
    fn errors_never_rank() {
        let config = RuntimeConfig::default();
        let outcomes = vec![(
            "SOCIAL".to_string(),
            AnalyzerOutcome::Error("HTTP 500".to_string()),
        )];
        assert!(build_opportunities(&outcomes, &config, "neutral", None).is_empty());
    }

    #[test]
    fn kelly_stake_for_strong_buy() {
        // Conservative quarter-Kelly, $1000 bankroll, 10% cap, score 80 at
        // odds 1.95: raw Kelly ≈ 0.589, × 0.25 ≈ 0.147, capped at 0.10 → $100.
        let config = RuntimeConfig::default();
        let size = stake_for(&config, 80.0, 1.95);
        assert!((size - 100.0).abs() < 1e-9);
    }

    #[test]
    fn alternative_sizing_methods() {
        let mut config = RuntimeConfig::default();
        config.bet_sizing_method = crate::types::SizingMethod::Percentage;
        assert!((stake_for(&config, 80.0, 1.95) - 100.0).abs() < 1e-9);

        config.bet_sizing_method = crate::types::SizingMethod::Flat;
        assert!((stake_for(&config, 80.0, 1.95) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn trade_memory_idempotency() {
        let mut memory = TradeMemory::default();
        assert!(!memory.already_executed("BTC BULLISH"));
        memory.record_execution("BTC BULLISH", 1_000.0);
        assert!(memory.already_executed("BTC BULLISH"));
        // A different signal on the same day is free to fire.
        assert!(!memory.already_executed("Recession Hedge"));
    }

    #[test]
    fn blacklist_expires_lazily() {
        let mut memory = TradeMemory::default();
        memory.blacklist_until("KXHIGHMIA-B90", 1_000.0);

        assert!(memory.is_blacklisted("KXHIGHMIA-B90", 999.0));
        // Substring matching covers city-series lookups.
        assert!(memory.is_blacklisted("MIA", 999.0));

        // Past expiry the entry is removed on read.
        assert!(!memory.is_blacklisted("KXHIGHMIA-B90", 1_001.0));
        assert!(memory.blacklist.is_empty());
    }

    #[test]
    fn ticker_tags_track_holdings() {
        let mut memory = TradeMemory::default();
        memory.record_ticker("KXHIGHNYC-B92", 500.0);
        assert!(memory.holds_ticker("KXHIGHNYC-B92"));
        assert!((memory.entry_time("KXHIGHNYC-B92").unwrap() - 500.0).abs() < 1e-9);
        assert!(!memory.holds_ticker("KXHIGHMIA-B90"));
    }
}
