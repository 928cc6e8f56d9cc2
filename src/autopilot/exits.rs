// =============================================================================
// Exit Engine — take-profit / stop-loss review of live positions
// =============================================================================
//
// Runs at the top of every autopilot cycle, before any new entry:
//
//   * Positions held under the minimum hold (300 s) are left alone — no
//     instant reversals without significant news.
//   * Prediction contracts: bid >= 90c takes profit; a resilient bid at or
//     below 10c (but still quoted) cuts the loss.
//   * Equities/crypto: configured take-profit and stop-loss percentages
//     against the FIFO average cost.
//
// Every close blacklists its ticker for four hours and feeds the realized
// PnL into the daily loss cap; a cap breach broadcasts the emergency stop.
// =============================================================================

use chrono::Utc;
use tracing::{info, warn};

use crate::autopilot::{Autopilot, BLACKLIST_COOLDOWN_SECS};
use crate::broker::{submit_smart_order, BrokerAdapter, OrderSide, OrderType};
use crate::bus::epoch_now;
use crate::ledger::{LedgerAction, LedgerEntry};

/// Minimum seconds a position must be held before exit rules apply.
pub const MIN_HOLD_SECS: f64 = 300.0;

/// Prediction-market take-profit bid, cents.
const PREDICTION_TP_CENTS: u32 = 90;
/// Prediction-market stop-loss bid, cents.
const PREDICTION_SL_CENTS: u32 = 10;

/// Exit verdict for a prediction contract quoted at `bid_cents`.
pub fn prediction_exit(bid_cents: u32) -> Option<&'static str> {
    if bid_cents >= PREDICTION_TP_CENTS {
        Some("Take Profit")
    } else if bid_cents > 0 && bid_cents <= PREDICTION_SL_CENTS {
        Some("Stop Loss")
    } else {
        None
    }
}

/// Exit verdict for an equity/crypto position against its average cost.
pub fn equity_exit(
    price: f64,
    avg_cost: f64,
    take_profit_pct: f64,
    stop_loss_pct: f64,
) -> Option<&'static str> {
    if avg_cost <= 0.0 || price <= 0.0 {
        return None;
    }
    let move_pct = (price - avg_cost) / avg_cost * 100.0;
    if move_pct >= take_profit_pct {
        Some("Take Profit")
    } else if move_pct <= -stop_loss_pct {
        Some("Stop Loss")
    } else {
        None
    }
}

impl Autopilot {
    /// Review every live position and close the ones whose exit rule fired.
    pub async fn manage_active_exits(&self) {
        self.manage_prediction_exits().await;
        self.manage_equity_exits().await;
    }

    async fn manage_prediction_exits(&self) {
        let positions = match self.prediction_venue.get_positions().await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "exit engine: prediction positions unavailable");
                return;
            }
        };

        let now = epoch_now();
        for position in positions {
            if position.quantity == 0.0 {
                continue;
            }
            let entered = self.memory.read().entry_time(&position.symbol).unwrap_or(0.0);
            if now - entered < MIN_HOLD_SECS {
                continue;
            }

            let market = match self.prediction_venue.get_market(&position.symbol).await {
                Ok(m) => m,
                Err(e) => {
                    warn!(ticker = %position.symbol, error = %e, "exit quote unavailable");
                    continue;
                }
            };

            let Some(reason) = prediction_exit(market.yes_bid) else {
                continue;
            };
            info!(
                ticker = %position.symbol,
                bid = market.yes_bid,
                reason,
                "closing prediction position"
            );
            self.close_prediction(&position.symbol, position.quantity.abs(), market.yes_bid, reason)
                .await;
        }
    }

    async fn close_prediction(&self, ticker: &str, quantity: f64, bid_cents: u32, reason: &str) {
        self.kill_switch.record_order_message();
        let submitted = self
            .prediction_venue
            .submit_order_by_quantity(ticker, quantity, OrderSide::Sell, OrderType::Market, None)
            .await;
        if let Err(e) = submitted {
            warn!(ticker, error = %e, "prediction exit failed");
            return;
        }

        let exit_price = bid_cents as f64 / 100.0;
        let avg_cost = self.ledger.average_buy_price(ticker).unwrap_or(exit_price);
        let realized = (exit_price - avg_cost) * quantity;

        let held = self.ledger.quantity_held(ticker);
        let close_qty = if held > 0.0 { quantity.min(held) } else { 0.0 };
        if close_qty > 0.0 {
            let entry = LedgerEntry::now(
                LedgerAction::Sell,
                ticker,
                exit_price,
                close_qty,
                reason,
                0.0,
                self.prediction_venue.name(),
            );
            if let Err(e) = self.ledger.append(&entry) {
                warn!(ticker, error = %e, "exit ledger append failed");
            }
        }

        self.finish_close(ticker, realized).await;
    }

    async fn manage_equity_exits(&self) {
        let Some(primary) = self.brokers.primary() else {
            return;
        };
        let positions = match primary.get_positions().await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "exit engine: equity positions unavailable");
                return;
            }
        };

        let (take_profit_pct, stop_loss_pct, max_slippage_pct) = {
            let cfg = self.config.read();
            (cfg.take_profit_pct, cfg.stop_loss_pct, cfg.max_slippage_pct)
        };

        let now = epoch_now();
        for position in positions {
            if position.quantity <= 0.0 {
                continue;
            }
            let entered = self.memory.read().entry_time(&position.symbol).unwrap_or(0.0);
            if now - entered < MIN_HOLD_SECS {
                continue;
            }

            let Some(adapter) = self.brokers.route(&position.symbol, Utc::now()) else {
                continue;
            };
            let price = match adapter.get_latest_price(&position.symbol).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(symbol = %position.symbol, error = %e, "exit quote unavailable");
                    continue;
                }
            };

            let avg_cost = if position.average_buy_price > 0.0 {
                position.average_buy_price
            } else {
                self.ledger
                    .average_buy_price(&position.symbol)
                    .unwrap_or(0.0)
            };
            let Some(reason) = equity_exit(price, avg_cost, take_profit_pct, stop_loss_pct) else {
                continue;
            };

            info!(
                symbol = %position.symbol,
                price,
                avg_cost,
                reason,
                "closing equity position"
            );

            self.kill_switch.record_order_message();
            let submitted = submit_smart_order(
                adapter.as_ref(),
                &position.symbol,
                OrderSide::Sell,
                position.quantity * price,
                max_slippage_pct,
            )
            .await;
            if let Err(e) = submitted {
                warn!(symbol = %position.symbol, error = %e, "equity exit failed");
                continue;
            }

            let realized = (price - avg_cost) * position.quantity;
            let held = self.ledger.quantity_held(&position.symbol);
            let close_qty = position.quantity.min(held);
            if close_qty > 0.0 {
                let entry = LedgerEntry::now(
                    LedgerAction::Sell,
                    &position.symbol,
                    price,
                    close_qty,
                    reason,
                    0.0,
                    adapter.name(),
                );
                if let Err(e) = self.ledger.append(&entry) {
                    warn!(symbol = %position.symbol, error = %e, "exit ledger append failed");
                }
            }

            self.finish_close(&position.symbol, realized).await;
        }
    }

    /// Shared post-close bookkeeping: cooldown, loss cap, persistence.
    async fn finish_close(&self, ticker: &str, realized: f64) {
        let now = epoch_now();
        {
            let mut memory = self.memory.write();
            memory.blacklist_until(ticker, now + BLACKLIST_COOLDOWN_SECS);
            memory.executed.remove(&super::TradeMemory::ticker_tag(ticker));
        }
        info!(ticker, realized, "position closed — 4h cooldown applied");

        if self.risk.record_realized(realized) {
            warn!("daily loss cap breached by this close — broadcasting emergency stop");
            self.broadcast_daily_cap_breach().await;
        }

        self.persist_state().await;
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prediction_take_profit_at_ninety() {
        assert_eq!(prediction_exit(95), Some("Take Profit"));
        assert_eq!(prediction_exit(90), Some("Take Profit"));
        assert_eq!(prediction_exit(89), None);
    }

    #[test]
    fn prediction_stop_loss_at_ten_but_not_zero() {
        assert_eq!(prediction_exit(10), Some("Stop Loss"));
        assert_eq!(prediction_exit(5), Some("Stop Loss"));
        // An unquoted bid (0) is no basis for an exit.
        assert_eq!(prediction_exit(0), None);
        assert_eq!(prediction_exit(50), None);
    }

    #[test]
    fn equity_exit_thresholds() {
        // +10% take profit, −5% stop loss.
        assert_eq!(equity_exit(110.0, 100.0, 10.0, 5.0), Some("Take Profit"));
        assert_eq!(equity_exit(95.0, 100.0, 10.0, 5.0), Some("Stop Loss"));
        assert_eq!(equity_exit(104.0, 100.0, 10.0, 5.0), None);
        assert_eq!(equity_exit(96.0, 100.0, 10.0, 5.0), None);
    }

    #[test]
    fn equity_exit_ignores_degenerate_inputs() {
        assert_eq!(equity_exit(100.0, 0.0, 10.0, 5.0), None);
        assert_eq!(equity_exit(0.0, 100.0, 10.0, 5.0), None);
    }

    #[test]
    fn minimum_hold_is_five_minutes() {
        assert!((MIN_HOLD_SECS - 300.0).abs() < f64::EPSILON);
    }
}
