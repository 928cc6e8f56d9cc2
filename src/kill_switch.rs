// =============================================================================
// Kill Switch — circuit breaker for the whole suite
// =============================================================================
//
// Monitors:
//   PnL velocity     rate-of-loss per minute over a 60-second window
//   Order rate       order messages per 10-second window
//   Connectivity     venue API latency
//   Price deviation  execution price vs fair value
//
// On any trigger the switch broadcasts CANCEL_ALL on the emergency channel
// and latches.  `trigger` is idempotent — a latched switch never
// re-publishes.  Individual strategies can be quarantined without a full
// halt; the signal router consults the quarantine set before dispatch.
// =============================================================================

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::bus::{channels, IntelBus, CANCEL_ALL};

/// Window over which the PnL rate is computed, seconds.
const PNL_VELOCITY_WINDOW_SECS: f64 = 60.0;
/// Rate-of-loss per minute (fraction of NAV) that trips the breaker.
const PNL_VELOCITY_THRESHOLD: f64 = -0.01;
/// Window for the order-rate anomaly check, seconds.
const ORDER_RATE_WINDOW_SECS: f64 = 10.0;
/// Orders per window beyond which the flow is anomalous.
const ORDER_RATE_MAX: usize = 100;
/// Acceptable venue API latency, milliseconds.
const LATENCY_THRESHOLD_MS: f64 = 500.0;
/// Acceptable execution-price deviation from fair value.
const PRICE_DEVIATION_MAX: f64 = 0.02;

#[derive(Debug, Clone, Serialize)]
pub struct KillSwitchState {
    pub triggered: bool,
    pub trigger_reason: String,
    pub halted_strategies: Vec<String>,
}

struct Inner {
    triggered: bool,
    trigger_reason: String,
    halted_strategies: HashSet<String>,
    /// (observed_at, pnl_value) ring for velocity computation.
    pnl_log: VecDeque<(Instant, f64)>,
    /// Timestamps of recent order messages.
    order_log: VecDeque<Instant>,
}

pub struct KillSwitch {
    state: RwLock<Inner>,
    bus: Arc<IntelBus>,
    pnl_vel_threshold: f64,
    order_rate_max: usize,
    latency_threshold_ms: f64,
    price_dev_max: f64,
}

impl KillSwitch {
    pub fn new(bus: Arc<IntelBus>) -> Self {
        Self {
            state: RwLock::new(Inner {
                triggered: false,
                trigger_reason: String::new(),
                halted_strategies: HashSet::new(),
                pnl_log: VecDeque::with_capacity(1024),
                order_log: VecDeque::with_capacity(4096),
            }),
            bus,
            pnl_vel_threshold: PNL_VELOCITY_THRESHOLD,
            order_rate_max: ORDER_RATE_MAX,
            latency_threshold_ms: LATENCY_THRESHOLD_MS,
            price_dev_max: PRICE_DEVIATION_MAX,
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.state.read().triggered
    }

    // -------------------------------------------------------------------------
    // Observations
    // -------------------------------------------------------------------------

    /// Record a PnL snapshot (dollars, or a NAV fraction with nav = 1).
    pub fn record_pnl(&self, pnl_value: f64) {
        let mut s = self.state.write();
        s.pnl_log.push_back((Instant::now(), pnl_value));
        while s.pnl_log.len() > 1000 {
            s.pnl_log.pop_front();
        }
    }

    /// Record one order message in or out.
    pub fn record_order_message(&self) {
        let mut s = self.state.write();
        s.order_log.push_back(Instant::now());
        while s.order_log.len() > 5000 {
            s.order_log.pop_front();
        }
    }

    // -------------------------------------------------------------------------
    // Checks — each returns a halt reason or None
    // -------------------------------------------------------------------------

    /// PnL rate over the trailing window, as NAV fraction per minute.
    pub fn check_pnl_velocity(&self, nav: f64) -> Option<String> {
        let s = self.state.read();
        let now = Instant::now();
        let window: Vec<&(Instant, f64)> = s
            .pnl_log
            .iter()
            .filter(|(ts, _)| now.duration_since(*ts).as_secs_f64() <= PNL_VELOCITY_WINDOW_SECS)
            .collect();
        if window.len() < 2 || nav <= 0.0 {
            return None;
        }

        let (oldest_ts, oldest_pnl) = **window.first().expect("len checked");
        let (newest_ts, newest_pnl) = **window.last().expect("len checked");
        let elapsed = newest_ts.duration_since(oldest_ts).as_secs_f64().max(1.0);
        let velocity_per_min = ((newest_pnl - oldest_pnl) / nav) / (elapsed / 60.0);

        if velocity_per_min < self.pnl_vel_threshold {
            let reason = format!(
                "PnL velocity {velocity_per_min:.4} NAV/min < threshold {:.4}",
                self.pnl_vel_threshold
            );
            warn!("{}", reason);
            return Some(reason);
        }
        None
    }

    /// Order messages in the trailing window.
    pub fn check_order_rate(&self) -> Option<String> {
        let s = self.state.read();
        let now = Instant::now();
        let count = s
            .order_log
            .iter()
            .filter(|ts| now.duration_since(**ts).as_secs_f64() <= ORDER_RATE_WINDOW_SECS)
            .count();
        if count > self.order_rate_max {
            let reason = format!(
                "order rate anomaly: {count} messages in {ORDER_RATE_WINDOW_SECS:.0}s \
                 (limit {})",
                self.order_rate_max
            );
            warn!("{}", reason);
            return Some(reason);
        }
        None
    }

    pub fn check_connectivity(&self, latency_ms: f64) -> Option<String> {
        if latency_ms > self.latency_threshold_ms {
            let reason = format!(
                "API latency {latency_ms:.1} ms > threshold {:.0} ms",
                self.latency_threshold_ms
            );
            warn!("{}", reason);
            return Some(reason);
        }
        None
    }

    pub fn check_price_deviation(&self, exec_price: f64, fair_value: f64) -> Option<String> {
        if fair_value <= 0.0 {
            return None;
        }
        let deviation = (exec_price - fair_value).abs() / fair_value;
        if deviation > self.price_dev_max {
            let reason = format!(
                "price deviation {:.2}% (exec={exec_price:.4}, fair={fair_value:.4}) > max {:.2}%",
                deviation * 100.0,
                self.price_dev_max * 100.0
            );
            warn!("{}", reason);
            return Some(reason);
        }
        None
    }

    /// Run the rolling-window checks; trigger on the first failure.
    pub async fn run_all_checks(&self, nav: f64) -> Option<String> {
        if let Some(reason) = self.check_pnl_velocity(nav) {
            self.trigger(&reason).await;
            return Some(reason);
        }
        if let Some(reason) = self.check_order_rate() {
            self.trigger(&reason).await;
            return Some(reason);
        }
        None
    }

    // -------------------------------------------------------------------------
    // Master kill
    // -------------------------------------------------------------------------

    /// Latch the switch and broadcast CANCEL_ALL.
    ///
    /// Idempotent: once latched, further calls neither re-publish nor
    /// overwrite the original reason.
    pub async fn trigger(&self, reason: &str) {
        {
            let mut s = self.state.write();
            if s.triggered {
                return;
            }
            s.triggered = true;
            s.trigger_reason = reason.to_string();
        }
        warn!(reason, "MASTER KILL TRIGGERED");
        self.bus
            .publish_channel(channels::EMERGENCY_STOP, CANCEL_ALL)
            .await;
    }

    /// Manual re-arm after operator review.
    pub fn reset(&self) {
        let mut s = self.state.write();
        s.triggered = false;
        s.trigger_reason.clear();
        info!("kill switch manually reset");
    }

    // -------------------------------------------------------------------------
    // Strategy quarantine
    // -------------------------------------------------------------------------

    /// Quarantine one strategy without halting the system.
    pub fn halt_strategy(&self, strategy: &str, reason: &str) {
        let mut s = self.state.write();
        s.halted_strategies.insert(strategy.to_string());
        warn!(strategy, reason, "strategy quarantined");
    }

    pub fn is_strategy_halted(&self, strategy: &str) -> bool {
        self.state.read().halted_strategies.contains(strategy)
    }

    pub fn resume_strategy(&self, strategy: &str) {
        let mut s = self.state.write();
        s.halted_strategies.remove(strategy);
        info!(strategy, "strategy manually resumed");
    }

    /// Serialisable state for the playbook archive.
    pub fn state_snapshot(&self) -> KillSwitchState {
        let s = self.state.read();
        let mut halted: Vec<String> = s.halted_strategies.iter().cloned().collect();
        halted.sort();
        KillSwitchState {
            triggered: s.triggered,
            trigger_reason: s.trigger_reason.clone(),
            halted_strategies: halted,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn switch() -> KillSwitch {
        KillSwitch::new(Arc::new(IntelBus::disabled()))
    }

    #[tokio::test]
    async fn trigger_latches_and_is_idempotent() {
        let ks = switch();
        assert!(!ks.is_triggered());

        ks.trigger("first reason").await;
        assert!(ks.is_triggered());
        assert_eq!(ks.state_snapshot().trigger_reason, "first reason");

        // Second trigger must not overwrite the original reason.
        ks.trigger("second reason").await;
        assert_eq!(ks.state_snapshot().trigger_reason, "first reason");
    }

    #[tokio::test]
    async fn reset_rearms() {
        let ks = switch();
        ks.trigger("halt").await;
        ks.reset();
        assert!(!ks.is_triggered());
        ks.trigger("again").await;
        assert_eq!(ks.state_snapshot().trigger_reason, "again");
    }

    #[test]
    fn order_rate_anomaly_detected() {
        let ks = switch();
        for _ in 0..150 {
            ks.record_order_message();
        }
        assert!(ks.check_order_rate().is_some());
    }

    #[test]
    fn normal_order_rate_passes() {
        let ks = switch();
        for _ in 0..50 {
            ks.record_order_message();
        }
        assert!(ks.check_order_rate().is_none());
    }

    #[test]
    fn latency_threshold() {
        let ks = switch();
        assert!(ks.check_connectivity(200.0).is_none());
        assert!(ks.check_connectivity(750.0).is_some());
    }

    #[test]
    fn price_deviation_threshold() {
        let ks = switch();
        assert!(ks.check_price_deviation(100.5, 100.0).is_none());
        assert!(ks.check_price_deviation(103.0, 100.0).is_some());
        // Degenerate fair value never trips.
        assert!(ks.check_price_deviation(103.0, 0.0).is_none());
    }

    #[test]
    fn pnl_velocity_needs_two_samples() {
        let ks = switch();
        ks.record_pnl(0.0);
        assert!(ks.check_pnl_velocity(1.0).is_none());
    }

    #[test]
    fn strategy_quarantine_roundtrip() {
        let ks = switch();
        assert!(!ks.is_strategy_halted("swarm"));
        ks.halt_strategy("swarm", "drawdown");
        assert!(ks.is_strategy_halted("swarm"));
        assert_eq!(ks.state_snapshot().halted_strategies, vec!["swarm"]);
        ks.resume_strategy("swarm");
        assert!(!ks.is_strategy_halted("swarm"));
    }
}
