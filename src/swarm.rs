// =============================================================================
// Analyst Swarm — per-symbol scoring debate feeding the trade-signal channel
// =============================================================================
//
// Three stateless scorers (technical, fundamental, sentiment) each emit a
// BULLISH / BEARISH / NEUTRAL verdict.  The CIO consensus averages their
// numeric scores (1.0 / 0.0 / 0.5):
//
//   avg > 0.7  -> BUY,  confidence = avg,      EXECUTE
//   avg < 0.3  -> SELL, confidence = 1 − avg,  EXECUTE
//   otherwise  -> HOLD,                        PASS
//
// EXECUTE decisions pass through the regime gate before being published to
// the `trade_signals` channel as validated Trade Signals.  Gate-blocked
// consensus is logged and dropped — the router never sees it.
// =============================================================================

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::bus::{channels, IntelBus};
use crate::gate;
use crate::indicators::{calculate_ema, latest_rsi};
use crate::market_data::Candle;
use crate::regime::Regime;
use crate::signal::{
    AssetClass, Brokerage, SignalEnvelope, TargetSystem, TradeAction, TradeSignal,
};

pub const STRATEGY_NAME: &str = "analyst_swarm";

/// Unit-bankroll sizing ceiling, percent.
const MAX_SIZE_PCT: f64 = 4.99;

// ---------------------------------------------------------------------------
// Verdicts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Verdict {
    Bullish,
    Bearish,
    Neutral,
}

impl Verdict {
    pub fn score(self) -> f64 {
        match self {
            Self::Bullish => 1.0,
            Self::Bearish => 0.0,
            Self::Neutral => 0.5,
        }
    }
}

// ---------------------------------------------------------------------------
// Scorers
// ---------------------------------------------------------------------------

/// Momentum + mean-reversion blend over daily bars.
pub fn technical_verdict(bars: &[Candle]) -> Verdict {
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let Some(rsi) = latest_rsi(&closes, 14) else {
        return Verdict::Neutral;
    };
    let Some(&ema21) = calculate_ema(&closes, 21).last() else {
        return Verdict::Neutral;
    };
    let price = closes[closes.len() - 1];

    if price > ema21 && rsi < 70.0 {
        Verdict::Bullish
    } else if price < ema21 && rsi > 30.0 {
        Verdict::Bearish
    } else {
        Verdict::Neutral
    }
}

/// Macro posture from the rates analyzer's bus output.
pub fn fundamental_verdict(fed_bias: Option<&str>, ten_year_yield: Option<f64>) -> Verdict {
    match fed_bias {
        Some("dovish") => Verdict::Bullish,
        Some("hawkish") => Verdict::Bearish,
        _ => match ten_year_yield {
            Some(y) if y > 5.0 => Verdict::Bearish,
            _ => Verdict::Neutral,
        },
    }
}

/// Crowd positioning from the social analyzer's bus output.
pub fn sentiment_verdict(social_score: Option<f64>) -> Verdict {
    match social_score {
        Some(s) if s >= 0.7 => Verdict::Bullish,
        Some(s) if s <= 0.3 => Verdict::Bearish,
        _ => Verdict::Neutral,
    }
}

// ---------------------------------------------------------------------------
// CIO consensus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ConsensusDecision {
    pub action: TradeAction,
    pub confidence: f64,
    pub execute: bool,
    /// Percent of a unit bankroll, in [0, 4.99].
    pub position_size_pct: f64,
    pub reasoning: String,
}

/// Average the three verdicts and apply the decision bands.
pub fn cio_consensus(
    symbol: &str,
    technical: Verdict,
    fundamental: Verdict,
    sentiment: Verdict,
) -> ConsensusDecision {
    let tech = technical.score();
    let fund = fundamental.score();
    let sent = sentiment.score();
    let avg = (tech + fund + sent) / 3.0;

    let (action, confidence, execute) = if avg > 0.7 {
        (TradeAction::Buy, avg, true)
    } else if avg < 0.3 {
        (TradeAction::Sell, 1.0 - avg, true)
    } else {
        (TradeAction::Hold, 0.5, false)
    };

    let kelly_factor = (2.0 * confidence - 1.0).max(0.0);
    let position_size_pct = (MAX_SIZE_PCT * kelly_factor).min(MAX_SIZE_PCT);

    ConsensusDecision {
        action,
        confidence: (confidence * 100.0).round() / 100.0,
        execute,
        position_size_pct: (position_size_pct * 100.0).round() / 100.0,
        reasoning: format!(
            "Score-weighted consensus for {symbol}: tech={tech:.1}, fund={fund:.1}, \
             sent={sent:.1} -> avg={avg:.2} -> {action}"
        ),
    }
}

// ---------------------------------------------------------------------------
// Signal construction
// ---------------------------------------------------------------------------

fn classify_symbol(symbol: &str) -> (AssetClass, Brokerage, TargetSystem) {
    if symbol.to_uppercase().ends_with("-USD") {
        (
            AssetClass::Crypto,
            Brokerage::Coinbase,
            TargetSystem::EquityEngine,
        )
    } else {
        (
            AssetClass::Equity,
            Brokerage::Alpaca,
            TargetSystem::EquityEngine,
        )
    }
}

/// Turn an EXECUTE consensus into a validated Trade Signal, applying the
/// regime gate.  Returns None when the gate blocks or validation fails.
pub fn build_signal(
    symbol: &str,
    decision: &ConsensusDecision,
    regime: Option<Regime>,
) -> Option<SignalEnvelope> {
    if !decision.execute {
        return None;
    }

    let gate_decision = gate::evaluate(decision.action, decision.confidence, regime, "");
    if gate_decision.blocked {
        info!(symbol, reason = %gate_decision.reason, "consensus blocked by regime gate");
        return None;
    }

    let (asset_class, target_brokerage, target_system) = classify_symbol(symbol);
    let signal = TradeSignal {
        target_system,
        target_brokerage,
        asset_class,
        ticker_or_event: symbol.to_string(),
        action: decision.action,
        confidence_score: decision.confidence,
        proposed_allocation_pct: decision.position_size_pct / 100.0,
        strike_price: None,
        expiration_date: None,
        agent_reasoning: decision.reasoning.clone(),
    };

    if let Err(e) = signal.validate() {
        warn!(symbol, error = %e, "swarm produced an invalid signal — dropped");
        return None;
    }

    Some(SignalEnvelope {
        signal,
        strategy: STRATEGY_NAME.to_string(),
        reasoning: None,
    })
}

// ---------------------------------------------------------------------------
// Pipeline entry point
// ---------------------------------------------------------------------------

/// One full swarm pass over a symbol: score, debate, gate, publish.
pub async fn evaluate_and_publish(
    bus: &Arc<IntelBus>,
    symbol: &str,
    bars: &[Candle],
    regime: Option<Regime>,
) -> Option<ConsensusDecision> {
    let technical = technical_verdict(bars);

    let fed_bias_payload = bus.read(crate::bus::keys::FED_BIAS).await;
    let fed_bias = fed_bias_payload
        .as_ref()
        .and_then(|p| p.value.get("bias"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let ten_year = bus
        .read(crate::bus::keys::TEN_Y_YIELD)
        .await
        .and_then(|p| p.as_f64());
    let fundamental = fundamental_verdict(fed_bias.as_deref(), ten_year);

    let social = bus
        .read(crate::bus::keys::SOCIAL_SCORE)
        .await
        .and_then(|p| p.value.get("score").and_then(|v| v.as_f64()));
    let sentiment = sentiment_verdict(social);

    let decision = cio_consensus(symbol, technical, fundamental, sentiment);
    debug!(
        symbol,
        action = %decision.action,
        confidence = decision.confidence,
        execute = decision.execute,
        "CIO consensus"
    );

    if let Some(envelope) = build_signal(symbol, &decision, regime) {
        match serde_json::to_string(&envelope) {
            Ok(payload) => {
                bus.publish_channel(channels::TRADE_SIGNALS, &payload).await;
                info!(symbol, action = %decision.action, "trade signal published");
            }
            Err(e) => warn!(symbol, error = %e, "signal serialisation failed"),
        }
    }

    Some(decision)
}
