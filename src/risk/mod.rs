// =============================================================================
// Risk Engine — sizing maths plus the hard guards protecting capital
// =============================================================================
//
// Guards:
//   * Wash-sale: blocks re-entry into a ticker sold at a stop loss within
//     the trailing 30 days.
//   * Daily loss cap: once cumulative realized losses for the calendar day
//     reach the limit, new entries are suppressed and an emergency stop is
//     warranted.  Counters reset automatically when the date rolls over.
//
// The sizing maths (Kelly, CVaR, drawdown) live in their own submodules and
// are pure; this facade owns the stateful guards.
// =============================================================================

pub mod cvar;
pub mod drawdown;
pub mod kelly;

pub use cvar::CVaRCalculator;
pub use drawdown::DrawdownMonitor;
pub use kelly::KellyAllocator;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::ledger::Ledger;

/// Days a loss-labelled sale poisons re-entry.
pub const WASH_SALE_WINDOW_DAYS: i64 = 30;

#[derive(Debug, Clone, Serialize)]
pub struct DailyLossState {
    pub date: String,
    pub realized_loss: f64,
    pub limit: f64,
    pub breached: bool,
}

struct DailyLossTracker {
    date: String,
    realized_loss: f64,
}

/// Stateful risk guards shared by the autopilot and the signal router.
pub struct RiskEngine {
    ledger: Arc<Ledger>,
    wash_sale_enabled: bool,
    daily_loss_limit: f64,
    daily: RwLock<DailyLossTracker>,
}

impl RiskEngine {
    pub fn new(ledger: Arc<Ledger>, wash_sale_enabled: bool, daily_loss_limit: f64) -> Self {
        info!(
            wash_sale_enabled,
            daily_loss_limit, "risk engine initialised"
        );
        Self {
            ledger,
            wash_sale_enabled,
            daily_loss_limit,
            daily: RwLock::new(DailyLossTracker {
                date: Utc::now().format("%Y-%m-%d").to_string(),
                realized_loss: 0.0,
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Wash-sale guard
    // -------------------------------------------------------------------------

    /// True when a buy of `ticker` must be blocked right now.
    pub fn wash_sale_blocked(&self, ticker: &str) -> bool {
        self.wash_sale_blocked_at(ticker, Utc::now())
    }

    /// The window is strict: a buy exactly 30 days + 1 second after the
    /// loss-labelled sale is permitted.
    pub fn wash_sale_blocked_at(&self, ticker: &str, now: DateTime<Utc>) -> bool {
        if !self.wash_sale_enabled {
            return false;
        }
        let Some(sold_at) = self.ledger.last_loss_sale(ticker) else {
            return false;
        };
        let blocked = now - sold_at <= Duration::days(WASH_SALE_WINDOW_DAYS);
        if blocked {
            warn!(
                ticker,
                sold_at = %sold_at,
                "wash-sale guard: loss sale within {WASH_SALE_WINDOW_DAYS} days — buy blocked"
            );
        }
        blocked
    }

    // -------------------------------------------------------------------------
    // Daily loss cap
    // -------------------------------------------------------------------------

    /// Record the realized PnL of a closed trade.
    ///
    /// Returns true when this result breached the daily cap (the caller
    /// broadcasts the emergency stop exactly once, on the breach edge).
    pub fn record_realized(&self, pnl: f64) -> bool {
        self.maybe_reset_daily();
        let mut daily = self.daily.write();
        let was_breached = daily.realized_loss >= self.daily_loss_limit;
        if pnl < 0.0 {
            daily.realized_loss += -pnl;
        }
        let now_breached = daily.realized_loss >= self.daily_loss_limit;
        if now_breached && !was_breached {
            warn!(
                realized_loss = daily.realized_loss,
                limit = self.daily_loss_limit,
                "daily loss cap breached — new entries suppressed"
            );
        }
        now_breached && !was_breached
    }

    /// True while today's cumulative realized losses sit at or above the cap.
    pub fn daily_cap_breached(&self) -> bool {
        self.maybe_reset_daily();
        self.daily.read().realized_loss >= self.daily_loss_limit
    }

    pub fn daily_loss_state(&self) -> DailyLossState {
        self.maybe_reset_daily();
        let daily = self.daily.read();
        DailyLossState {
            date: daily.date.clone(),
            realized_loss: daily.realized_loss,
            limit: self.daily_loss_limit,
            breached: daily.realized_loss >= self.daily_loss_limit,
        }
    }

    fn maybe_reset_daily(&self) {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        {
            let daily = self.daily.read();
            if daily.date == today {
                return;
            }
        }
        let mut daily = self.daily.write();
        if daily.date != today {
            info!(old = %daily.date, new = %today, "date rolled — daily loss counter reset");
            daily.date = today;
            daily.realized_loss = 0.0;
        }
    }
}

impl std::fmt::Debug for RiskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskEngine")
            .field("wash_sale_enabled", &self.wash_sale_enabled)
            .field("daily_loss_limit", &self.daily_loss_limit)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{LedgerAction, LedgerEntry};

    fn temp_ledger() -> Arc<Ledger> {
        let path = std::env::temp_dir().join(format!("risk-{}.csv", uuid::Uuid::new_v4()));
        Arc::new(Ledger::open(path).unwrap())
    }

    fn dated_entry(
        action: LedgerAction,
        ticker: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> LedgerEntry {
        LedgerEntry {
            date: at.format("%Y-%m-%d %H:%M:%S").to_string(),
            action,
            ticker: ticker.to_string(),
            price: 10.0,
            quantity: 1.0,
            reason: reason.to_string(),
            est_tax_impact: 0.0,
            broker: "paper".to_string(),
        }
    }

    #[test]
    fn wash_sale_blocks_within_window() {
        let ledger = temp_ledger();
        let now = Utc::now();
        let sold_at = now - Duration::days(10);
        ledger
            .append(&dated_entry(LedgerAction::Buy, "TSLA", "entry", sold_at))
            .unwrap();
        ledger
            .append(&dated_entry(LedgerAction::Sell, "TSLA", "Stop Loss", sold_at))
            .unwrap();

        let engine = RiskEngine::new(ledger, true, 100.0);
        assert!(engine.wash_sale_blocked_at("TSLA", now));
        assert!(!engine.wash_sale_blocked_at("AAPL", now));
    }

    #[test]
    fn wash_sale_boundary_is_thirty_days_plus_one_second() {
        let ledger = temp_ledger();
        let sold_at = Utc::now() - Duration::days(5);
        ledger
            .append(&dated_entry(LedgerAction::Buy, "NVDA", "entry", sold_at))
            .unwrap();
        ledger
            .append(&dated_entry(LedgerAction::Sell, "NVDA", "Stop Loss", sold_at))
            .unwrap();

        let engine = RiskEngine::new(ledger, true, 100.0);
        // Exactly 30 days later: still blocked.
        assert!(engine.wash_sale_blocked_at("NVDA", sold_at + Duration::days(30)));
        // 30 days + 1 second: permitted.
        assert!(!engine.wash_sale_blocked_at(
            "NVDA",
            sold_at + Duration::days(30) + Duration::seconds(1)
        ));
    }

    #[test]
    fn wash_sale_disabled_never_blocks() {
        let ledger = temp_ledger();
        let now = Utc::now();
        ledger
            .append(&dated_entry(LedgerAction::Buy, "TSLA", "entry", now))
            .unwrap();
        ledger
            .append(&dated_entry(LedgerAction::Sell, "TSLA", "Stop Loss", now))
            .unwrap();

        let engine = RiskEngine::new(ledger, false, 100.0);
        assert!(!engine.wash_sale_blocked_at("TSLA", now));
    }

    #[test]
    fn take_profit_sales_do_not_trigger_guard() {
        let ledger = temp_ledger();
        let now = Utc::now();
        ledger
            .append(&dated_entry(LedgerAction::Buy, "AMD", "entry", now))
            .unwrap();
        ledger
            .append(&dated_entry(LedgerAction::Sell, "AMD", "Take Profit", now))
            .unwrap();

        let engine = RiskEngine::new(ledger, true, 100.0);
        assert!(!engine.wash_sale_blocked_at("AMD", now));
    }

    #[test]
    fn daily_loss_cap_breaches_once() {
        let engine = RiskEngine::new(temp_ledger(), true, 50.0);
        assert!(!engine.record_realized(-30.0));
        assert!(!engine.daily_cap_breached());
        // This loss crosses the cap: breach edge reported exactly once.
        assert!(engine.record_realized(-25.0));
        assert!(engine.daily_cap_breached());
        assert!(!engine.record_realized(-10.0));
        assert!(engine.daily_cap_breached());
    }

    #[test]
    fn profits_do_not_offset_the_cap() {
        let engine = RiskEngine::new(temp_ledger(), true, 50.0);
        engine.record_realized(-40.0);
        engine.record_realized(100.0);
        // Cumulative loss counter only accumulates losses.
        assert!(!engine.daily_cap_breached());
        assert!(engine.record_realized(-10.0));
    }
}
