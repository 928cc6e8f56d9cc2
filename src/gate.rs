// =============================================================================
// Regime Gate — dynamic confidence thresholds between consensus and execution
// =============================================================================
//
// Instead of going blind in YELLOW/RED, the system gets pickier: BUY
// confidence requirements rise with regime severity while SELL/SHORT
// requirements fall (reducing exposure should stay easy).
//
// EpisodicPivot and InsideBar212 earn a +0.10 catalyst bonus in YELLOW/RED —
// they represent new-information events that can override the macro
// environment.  Trend-continuation patterns get no bonus.
//
// Pure module: no I/O, no bus, no clocks.  A signal at exactly the
// threshold passes (>= comparison).
// =============================================================================

use serde::Serialize;

use crate::regime::Regime;
use crate::signal::TradeAction;

pub const CATALYST_BONUS: f64 = 0.10;

/// Patterns that earn the catalyst bonus in YELLOW/RED.
pub const CATALYST_PATTERNS: [&str; 2] = ["EpisodicPivot", "InsideBar212"];

/// Gate verdict handed back to the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct GateDecision {
    pub blocked: bool,
    pub effective_confidence: f64,
    /// Empty when the signal passes.
    pub reason: String,
}

/// Confidence required for `action` in `regime`.
///
/// HOLD/COVER use the BUY column — they are entries from the gate's point
/// of view.
pub fn threshold(regime: Regime, action: TradeAction) -> f64 {
    match (regime, action) {
        (Regime::Green, _) => 0.55,
        (Regime::Yellow, TradeAction::Sell | TradeAction::Short) => 0.50,
        (Regime::Yellow, _) => 0.75,
        (Regime::Red, TradeAction::Sell | TradeAction::Short) => 0.45,
        (Regime::Red, _) => 0.85,
    }
}

/// Apply the gate.
///
/// `regime = None` (no playbook snapshot on the bus) falls back to GREEN —
/// the permissive default.  `pattern` is the tactical setup name, if the
/// signal originated from one.
pub fn evaluate(
    action: TradeAction,
    confidence: f64,
    regime: Option<Regime>,
    pattern: &str,
) -> GateDecision {
    let resolved = regime.unwrap_or(Regime::Green);
    let required = threshold(resolved, action);

    let mut effective = confidence;
    let mut bonus_note = String::new();
    if matches!(resolved, Regime::Yellow | Regime::Red)
        && CATALYST_PATTERNS.contains(&pattern)
    {
        effective = (confidence + CATALYST_BONUS).min(1.0);
        bonus_note = format!(" +{CATALYST_BONUS:.2} {pattern} catalyst -> {effective:.2}");
    }

    if effective < required {
        return GateDecision {
            blocked: true,
            effective_confidence: effective,
            reason: format!(
                "Signal below regime threshold: confidence={confidence:.2}{bonus_note}, \
                 required={required:.2}, regime={resolved}"
            ),
        };
    }

    GateDecision {
        blocked: false,
        effective_confidence: effective,
        reason: String::new(),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_table_matches_design() {
        assert!((threshold(Regime::Green, TradeAction::Buy) - 0.55).abs() < 1e-12);
        assert!((threshold(Regime::Green, TradeAction::Sell) - 0.55).abs() < 1e-12);
        assert!((threshold(Regime::Green, TradeAction::Short) - 0.55).abs() < 1e-12);
        assert!((threshold(Regime::Yellow, TradeAction::Buy) - 0.75).abs() < 1e-12);
        assert!((threshold(Regime::Yellow, TradeAction::Sell) - 0.50).abs() < 1e-12);
        assert!((threshold(Regime::Yellow, TradeAction::Short) - 0.50).abs() < 1e-12);
        assert!((threshold(Regime::Red, TradeAction::Buy) - 0.85).abs() < 1e-12);
        assert!((threshold(Regime::Red, TradeAction::Sell) - 0.45).abs() < 1e-12);
        assert!((threshold(Regime::Red, TradeAction::Short) - 0.45).abs() < 1e-12);
    }

    #[test]
    fn yellow_blocks_mid_confidence_buy() {
        let decision = evaluate(TradeAction::Buy, 0.72, Some(Regime::Yellow), "MomentumBurst");
        assert!(decision.blocked);
        assert!((decision.effective_confidence - 0.72).abs() < 1e-12);
        assert!(decision.reason.contains("YELLOW"));
        assert!(decision.reason.contains("0.75"));
    }

    #[test]
    fn yellow_passes_episodic_pivot_with_bonus() {
        let decision = evaluate(TradeAction::Buy, 0.68, Some(Regime::Yellow), "EpisodicPivot");
        assert!(!decision.blocked);
        assert!((decision.effective_confidence - 0.78).abs() < 1e-12);
        assert!(decision.reason.is_empty());
    }

    #[test]
    fn confidence_exactly_at_threshold_passes() {
        let decision = evaluate(TradeAction::Buy, 0.55, Some(Regime::Green), "");
        assert!(!decision.blocked);

        let decision = evaluate(TradeAction::Buy, 0.75, Some(Regime::Yellow), "");
        assert!(!decision.blocked);
    }

    #[test]
    fn missing_regime_falls_back_to_green() {
        let decision = evaluate(TradeAction::Buy, 0.56, None, "");
        assert!(!decision.blocked);
        let decision = evaluate(TradeAction::Buy, 0.54, None, "");
        assert!(decision.blocked);
        assert!(decision.reason.contains("GREEN"));
    }

    #[test]
    fn no_bonus_in_green() {
        // 0.50 + bonus would pass 0.55, but GREEN grants no bonus.
        let decision = evaluate(TradeAction::Buy, 0.50, Some(Regime::Green), "EpisodicPivot");
        assert!(decision.blocked);
        assert!((decision.effective_confidence - 0.50).abs() < 1e-12);
    }

    #[test]
    fn no_bonus_for_trend_continuation_patterns() {
        for pattern in ["MomentumBurst", "ElephantBar", "VCP", "HighTightFlag"] {
            let decision = evaluate(TradeAction::Buy, 0.80, Some(Regime::Red), pattern);
            assert!(decision.blocked, "{pattern} must not earn the bonus");
        }
        // The catalyst pattern at the same confidence clears RED's 0.85 bar.
        let decision = evaluate(TradeAction::Buy, 0.80, Some(Regime::Red), "InsideBar212");
        assert!(!decision.blocked);
    }

    #[test]
    fn bonus_caps_at_one() {
        let decision = evaluate(TradeAction::Buy, 0.95, Some(Regime::Red), "EpisodicPivot");
        assert!(!decision.blocked);
        assert!((decision.effective_confidence - 1.0).abs() < 1e-12);
    }

    #[test]
    fn red_eases_exits() {
        let decision = evaluate(TradeAction::Sell, 0.45, Some(Regime::Red), "");
        assert!(!decision.blocked);
        let decision = evaluate(TradeAction::Short, 0.44, Some(Regime::Red), "");
        assert!(decision.blocked);
    }
}
