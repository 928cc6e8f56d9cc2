// =============================================================================
// Signal Router (EMS) — trade_signals subscriber dispatching to venue adapters
// =============================================================================
//
// Consumes the `trade_signals` channel.  Every message is deserialised and
// validated against the trade-signal contract; contract violations are
// dropped at this boundary and never reach a venue.  Valid signals route to
// the adapter registered for their target brokerage, execute as smart-limit
// (equity/crypto) or venue-market (prediction) orders, and land in the
// ledger.
//
// A single message on `emergency_stop` halts all further dispatch until an
// operator clears the latch.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use parking_lot::RwLock;
use tracing::{error, info, warn};

use crate::broker::{submit_smart_order, BrokerAdapter, BrokerRouter, OrderSide, OrderType};
use crate::bus::{channels, IntelBus};
use crate::config::RuntimeConfig;
use crate::kill_switch::KillSwitch;
use crate::ledger::{Ledger, LedgerAction, LedgerEntry};
use crate::signal::{AssetClass, SignalEnvelope, TradeAction};

/// Outcome of one dispatch attempt, recorded for diagnostics.
#[derive(Debug)]
pub enum DispatchResult {
    Executed { order_id: String },
    Paper,
    Rejected(String),
    Halted,
}

pub struct SignalRouter {
    bus: Arc<IntelBus>,
    brokers: Arc<BrokerRouter>,
    ledger: Arc<Ledger>,
    kill_switch: Arc<KillSwitch>,
    config: Arc<RwLock<RuntimeConfig>>,
    halted: AtomicBool,
}

impl SignalRouter {
    pub fn new(
        bus: Arc<IntelBus>,
        brokers: Arc<BrokerRouter>,
        ledger: Arc<Ledger>,
        kill_switch: Arc<KillSwitch>,
        config: Arc<RwLock<RuntimeConfig>>,
    ) -> Self {
        Self {
            bus,
            brokers,
            ledger,
            kill_switch,
            config,
            halted: AtomicBool::new(false),
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Operator re-arm after an emergency stop.
    pub fn clear_halt(&self) {
        self.halted.store(false, Ordering::SeqCst);
        info!("signal router halt cleared");
    }

    // -------------------------------------------------------------------------
    // Message validation
    // -------------------------------------------------------------------------

    /// Parse and contract-check one channel payload.
    pub fn parse_envelope(payload: &str) -> Result<SignalEnvelope, String> {
        let envelope: SignalEnvelope =
            serde_json::from_str(payload).map_err(|e| format!("undecodable payload: {e}"))?;
        envelope
            .signal
            .validate()
            .map_err(|e| format!("contract violation: {e}"))?;
        Ok(envelope)
    }

    /// Router-level gates applied before any venue call.
    fn admission_reason(&self, envelope: &SignalEnvelope) -> Option<String> {
        if self.is_halted() {
            return Some("router halted by emergency stop".to_string());
        }
        if self.kill_switch.is_strategy_halted(&envelope.strategy) {
            return Some(format!("strategy '{}' is quarantined", envelope.strategy));
        }
        let traders = self.config.read().traders.clone();
        if !traders.is_empty() && !traders.contains(&envelope.strategy) {
            return Some(format!(
                "strategy '{}' is not on the trader roster",
                envelope.strategy
            ));
        }
        if envelope.signal.action == TradeAction::Hold {
            return Some("hold signals are not dispatchable".to_string());
        }
        None
    }

    // -------------------------------------------------------------------------
    // Dispatch
    // -------------------------------------------------------------------------

    pub async fn dispatch(&self, payload: &str) -> DispatchResult {
        let envelope = match Self::parse_envelope(payload) {
            Ok(e) => e,
            Err(reason) => {
                warn!(reason = %reason, "trade signal rejected");
                return DispatchResult::Rejected(reason);
            }
        };

        if let Some(reason) = self.admission_reason(&envelope) {
            if self.is_halted() {
                warn!("dispatch refused — emergency halt active");
                return DispatchResult::Halted;
            }
            warn!(reason = %reason, "trade signal refused");
            return DispatchResult::Rejected(reason);
        }

        let signal = &envelope.signal;
        let venue_name = signal.target_brokerage.to_string();
        let Some(adapter) = self.brokers.get(&venue_name) else {
            let reason = format!("no adapter registered for {venue_name}");
            warn!(reason = %reason, "trade signal refused");
            return DispatchResult::Rejected(reason);
        };

        let side = match signal.action {
            TradeAction::Buy => OrderSide::Buy,
            TradeAction::Sell | TradeAction::Short | TradeAction::Cover => OrderSide::Sell,
            TradeAction::Hold => unreachable!("hold refused at admission"),
        };

        let buying_power = match adapter.get_buying_power().await {
            Ok(bp) => bp,
            Err(e) => {
                let reason = format!("buying power unavailable on {venue_name}: {e}");
                warn!(reason = %reason, "trade signal refused");
                return DispatchResult::Rejected(reason);
            }
        };
        let amount = buying_power * signal.proposed_allocation_pct;
        if amount <= 0.0 {
            return DispatchResult::Rejected("zero-sized allocation".to_string());
        }

        let (paper_mode, max_slippage_pct) = {
            let cfg = self.config.read();
            (cfg.paper_mode, cfg.max_slippage_pct)
        };

        self.kill_switch.record_order_message();

        let ledger_action = match side {
            OrderSide::Buy => LedgerAction::Buy,
            OrderSide::Sell => LedgerAction::Sell,
        };
        let reason_tag = format!("{} {}", envelope.strategy, signal.agent_reasoning);

        if paper_mode {
            let price = adapter
                .get_latest_price(&signal.ticker_or_event)
                .await
                .unwrap_or(0.0);
            if price > 0.0 {
                let entry = LedgerEntry::now(
                    ledger_action,
                    &signal.ticker_or_event,
                    price,
                    amount / price,
                    &format!("{reason_tag} (PAPER)"),
                    0.0,
                    adapter.name(),
                );
                if let Err(e) = self.ledger.append(&entry) {
                    error!(error = %e, "paper ledger append failed");
                }
            }
            info!(
                ticker = %signal.ticker_or_event,
                venue = %venue_name,
                amount,
                "paper dispatch recorded"
            );
            return DispatchResult::Paper;
        }

        // Prediction contracts take venue market orders.  Equity buys use a
        // native bracket when the venue offers one (entry plus paired TP/SL
        // from the configured percentages); everything else goes out as a
        // smart limit through the live quote.
        let (take_profit_pct, stop_loss_pct) = {
            let cfg = self.config.read();
            (cfg.take_profit_pct, cfg.stop_loss_pct)
        };
        let use_bracket = signal.asset_class == AssetClass::Equity
            && side == OrderSide::Buy
            && adapter.supports_brackets();

        let result = if signal.asset_class == AssetClass::PredictionMarket {
            adapter
                .submit_order(
                    &signal.ticker_or_event,
                    amount,
                    side,
                    OrderType::Market,
                    None,
                )
                .await
                .map(|ack| (ack, 0.0))
        } else if use_bracket {
            match adapter.get_latest_price(&signal.ticker_or_event).await {
                Ok(quote) if quote > 0.0 => {
                    let (tp, sl) =
                        crate::broker::bracket_prices(quote, take_profit_pct, stop_loss_pct);
                    adapter
                        .submit_bracket_order(&signal.ticker_or_event, amount, side, tp, sl)
                        .await
                        .map(|ack| (ack, quote))
                }
                Ok(_) => Err(crate::broker::BrokerError::InvalidQuote(
                    signal.ticker_or_event.clone(),
                )),
                Err(e) => Err(e),
            }
        } else {
            submit_smart_order(
                adapter.as_ref(),
                &signal.ticker_or_event,
                side,
                amount,
                max_slippage_pct,
            )
            .await
        };

        match result {
            Ok((ack, quote)) => {
                let price = if quote > 0.0 { quote } else { amount };
                let quantity = if quote > 0.0 { amount / quote } else { 1.0 };
                let entry = LedgerEntry::now(
                    ledger_action,
                    &signal.ticker_or_event,
                    price,
                    quantity,
                    &reason_tag,
                    0.0,
                    adapter.name(),
                );
                if let Err(e) = self.ledger.append(&entry) {
                    error!(error = %e, "ledger append failed after execution");
                }
                info!(
                    ticker = %signal.ticker_or_event,
                    venue = %venue_name,
                    order_id = %ack.id,
                    "trade signal executed"
                );
                DispatchResult::Executed { order_id: ack.id }
            }
            Err(e) => {
                let reason = format!("execution failed on {venue_name}: {e}");
                error!(reason = %reason, ticker = %signal.ticker_or_event, "dispatch failed");
                DispatchResult::Rejected(reason)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Subscription loops
    // -------------------------------------------------------------------------

    /// Run both channel subscriptions until shutdown. Reconnects with a
    /// fixed backoff when the bus drops.
    pub async fn run(self: Arc<Self>) {
        let signals = {
            let router = self.clone();
            tokio::spawn(async move { router.signal_loop().await })
        };
        let emergencies = {
            let router = self.clone();
            tokio::spawn(async move { router.emergency_loop().await })
        };
        let _ = tokio::join!(signals, emergencies);
    }

    async fn signal_loop(&self) {
        loop {
            let Some(mut pubsub) = self.bus.subscribe(channels::TRADE_SIGNALS).await else {
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                continue;
            };
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                if let Ok(payload) = msg.get_payload::<String>() {
                    let _ = self.dispatch(&payload).await;
                }
            }
            warn!("trade_signals subscription ended — resubscribing in 5s");
            drop(stream);
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        }
    }

    async fn emergency_loop(&self) {
        loop {
            let Some(mut pubsub) = self.bus.subscribe(channels::EMERGENCY_STOP).await else {
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                continue;
            };
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload = msg.get_payload::<String>().unwrap_or_default();
                error!(payload = %payload, "EMERGENCY STOP received — halting all dispatch");
                self.halted.store(true, Ordering::SeqCst);
            }
            warn!("emergency_stop subscription ended — resubscribing in 5s");
            drop(stream);
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{Brokerage, TargetSystem, TradeSignal};

    fn envelope_json(action: TradeAction, allocation: f64) -> String {
        serde_json::to_string(&SignalEnvelope {
            signal: TradeSignal {
                target_system: TargetSystem::EquityEngine,
                target_brokerage: Brokerage::Alpaca,
                asset_class: AssetClass::Equity,
                ticker_or_event: "AAPL".to_string(),
                action,
                confidence_score: 0.8,
                proposed_allocation_pct: allocation,
                strike_price: None,
                expiration_date: None,
                agent_reasoning: "test".to_string(),
            },
            strategy: "analyst_swarm".to_string(),
            reasoning: None,
        })
        .unwrap()
    }

    fn router() -> SignalRouter {
        let bus = Arc::new(IntelBus::disabled());
        let ledger = Arc::new(
            Ledger::open(std::env::temp_dir().join(format!("ems-{}.csv", uuid::Uuid::new_v4())))
                .unwrap(),
        );
        SignalRouter::new(
            bus.clone(),
            Arc::new(BrokerRouter::new(true, "alpaca")),
            ledger,
            Arc::new(KillSwitch::new(bus)),
            Arc::new(RwLock::new(RuntimeConfig::default())),
        )
    }

    #[test]
    fn valid_payload_parses() {
        let envelope = SignalRouter::parse_envelope(&envelope_json(TradeAction::Buy, 0.05));
        assert!(envelope.is_ok());
    }

    #[test]
    fn oversized_allocation_is_a_contract_violation() {
        let err = SignalRouter::parse_envelope(&envelope_json(TradeAction::Buy, 0.20));
        assert!(err.unwrap_err().contains("contract violation"));
    }

    #[test]
    fn garbage_payload_is_rejected() {
        assert!(SignalRouter::parse_envelope("{not json").is_err());
    }

    #[tokio::test]
    async fn unregistered_brokerage_is_rejected() {
        let r = router();
        let result = r.dispatch(&envelope_json(TradeAction::Buy, 0.05)).await;
        assert!(matches!(result, DispatchResult::Rejected(reason)
            if reason.contains("no adapter registered")));
    }

    #[tokio::test]
    async fn emergency_halt_blocks_dispatch() {
        let r = router();
        r.halted.store(true, Ordering::SeqCst);
        let result = r.dispatch(&envelope_json(TradeAction::Buy, 0.05)).await;
        assert!(matches!(result, DispatchResult::Halted));

        r.clear_halt();
        // After clearing, dispatch proceeds to the (missing-adapter) gate.
        let result = r.dispatch(&envelope_json(TradeAction::Buy, 0.05)).await;
        assert!(matches!(result, DispatchResult::Rejected(_)));
    }

    #[tokio::test]
    async fn quarantined_strategy_is_refused() {
        let r = router();
        r.kill_switch.halt_strategy("analyst_swarm", "drawdown");
        let result = r.dispatch(&envelope_json(TradeAction::Buy, 0.05)).await;
        assert!(matches!(result, DispatchResult::Rejected(reason)
            if reason.contains("quarantined")));
    }

    #[tokio::test]
    async fn roster_excludes_unknown_strategies() {
        let r = router();
        r.config.write().traders = vec!["other_desk".to_string()];
        let result = r.dispatch(&envelope_json(TradeAction::Buy, 0.05)).await;
        assert!(matches!(result, DispatchResult::Rejected(reason)
            if reason.contains("roster")));
    }

    #[tokio::test]
    async fn hold_signals_never_dispatch() {
        let r = router();
        let result = r.dispatch(&envelope_json(TradeAction::Hold, 0.05)).await;
        assert!(matches!(result, DispatchResult::Rejected(reason)
            if reason.contains("hold")));
    }
}
