// =============================================================================
// Macro Regime Classifier — traffic-light market state from SPY structure
// =============================================================================
//
// Regimes:
//   GREEN  — SPY above a rising 21-day EMA: full strategy activation.
//   YELLOW — SPY below the 21 EMA but above the 50 SMA: defensive.
//   RED    — SPY below the 50 SMA: survival mode.
//
// Credit cross-validation: when SPY sits in breakout territory but JNK is
// underperforming TLT over 5 days, credit markets are not confirming the
// move — the confidence is cut and a warning appended to the reason.
//
// Fewer than 50 bars of history classifies as RED with confidence 0.1: an
// engine that cannot see the market stays defensive.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bus::epoch_now;
use crate::indicators::{calculate_ema, ema_rising, latest_sma};

const EMA_FAST: usize = 21;
const SMA_SLOW: usize = 50;
const EMA_RISING_LOOKBACK: usize = 3;
const CREDIT_LOOKBACK: usize = 5;

const CREDIT_CONFIDENCE_HAIRCUT: f64 = 0.15;
const CREDIT_CONFIDENCE_FLOOR: f64 = 0.45;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Regime {
    Green,
    Yellow,
    Red,
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Green => write!(f, "GREEN"),
            Self::Yellow => write!(f, "YELLOW"),
            Self::Red => write!(f, "RED"),
        }
    }
}

/// Snapshot of the classified macro regime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeState {
    pub regime: Regime,
    pub spy_price: f64,
    pub ema21: f64,
    pub sma50: f64,
    /// True when credit markets are NOT confirming an equity breakout.
    pub credit_divergence: bool,
    pub confidence: f64,
    /// Unix epoch seconds of classification.
    pub timestamp: f64,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Classify the macro regime from closing-price series (oldest first).
///
/// `spy` needs at least 50 bars; `jnk`/`tlt` are optional and only used for
/// the credit cross-check.
pub fn classify_regime(spy: &[f64], jnk: Option<&[f64]>, tlt: Option<&[f64]>) -> RegimeState {
    if spy.len() < SMA_SLOW {
        return RegimeState {
            regime: Regime::Red,
            spy_price: 0.0,
            ema21: 0.0,
            sma50: 0.0,
            credit_divergence: false,
            confidence: 0.1,
            timestamp: epoch_now(),
            reason: "Insufficient SPY data — defensive default".to_string(),
        };
    }

    let spy_price = spy[spy.len() - 1];
    let ema21 = calculate_ema(spy, EMA_FAST)
        .last()
        .copied()
        .unwrap_or(spy_price);
    let sma50 = latest_sma(spy, SMA_SLOW).unwrap_or(spy_price);
    let ema21_up = ema_rising(spy, EMA_FAST, EMA_RISING_LOOKBACK);

    // Credit check only matters in equity breakout territory.
    let credit_divergence = if spy_price > ema21 {
        match (jnk, tlt) {
            (Some(jnk), Some(tlt)) => jnk_tlt_divergence(jnk, tlt, CREDIT_LOOKBACK),
            _ => false,
        }
    } else {
        false
    };

    let (regime, mut confidence, mut reason) = if spy_price > ema21 && ema21_up {
        (
            Regime::Green,
            0.85,
            format!("SPY {spy_price:.2} > EMA21 {ema21:.2} (rising)"),
        )
    } else if spy_price > sma50 {
        (
            Regime::Yellow,
            0.70,
            format!("SPY {spy_price:.2} < EMA21 {ema21:.2} but > SMA50 {sma50:.2}"),
        )
    } else {
        (
            Regime::Red,
            0.80,
            format!("SPY {spy_price:.2} < SMA50 {sma50:.2}"),
        )
    };

    if credit_divergence {
        confidence = (confidence - CREDIT_CONFIDENCE_HAIRCUT).max(CREDIT_CONFIDENCE_FLOOR);
        reason.push_str(" | WARN: JNK underperforming TLT — failed breakout risk");
    }

    debug!(
        regime = %regime,
        spy_price,
        ema21,
        sma50,
        credit_divergence,
        confidence,
        "regime classified"
    );

    RegimeState {
        regime,
        spy_price,
        ema21,
        sma50,
        credit_divergence,
        confidence,
        timestamp: epoch_now(),
        reason,
    }
}

/// True when JNK's 5-day return trails TLT's.
fn jnk_tlt_divergence(jnk: &[f64], tlt: &[f64], lookback: usize) -> bool {
    if jnk.len() < lookback + 1 || tlt.len() < lookback + 1 {
        return false;
    }
    let ret = |series: &[f64]| {
        let last = series[series.len() - 1];
        let base = series[series.len() - 1 - lookback];
        (last - base) / base
    };
    ret(jnk) < ret(tlt)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn rising(n: usize) -> Vec<f64> {
        (0..n).map(|i| 100.0 + i as f64).collect()
    }

    #[test]
    fn insufficient_data_defaults_to_red() {
        let state = classify_regime(&rising(49), None, None);
        assert_eq!(state.regime, Regime::Red);
        assert!(state.confidence <= 0.3);
        assert!(state.reason.contains("Insufficient"));
    }

    #[test]
    fn steady_uptrend_is_green() {
        let state = classify_regime(&rising(60), None, None);
        assert_eq!(state.regime, Regime::Green);
        assert!((state.confidence - 0.85).abs() < 1e-9);
        assert!(state.spy_price > state.ema21);
    }

    #[test]
    fn pullback_above_sma50_is_yellow() {
        // Long rise to 155, then a sharp two-bar drop to 140: below the EMA21
        // but still above the 50-bar mean.
        let mut closes: Vec<f64> = (0..56).map(|i| 100.0 + i as f64).collect();
        closes.push(140.0);
        closes.push(140.0);
        let state = classify_regime(&closes, None, None);
        assert_eq!(state.regime, Regime::Yellow);
        assert!((state.confidence - 0.70).abs() < 1e-9);
        assert!(state.spy_price < state.ema21);
        assert!(state.spy_price > state.sma50);
    }

    #[test]
    fn downtrend_is_red() {
        let closes: Vec<f64> = (0..60).map(|i| 200.0 - i as f64).collect();
        let state = classify_regime(&closes, None, None);
        assert_eq!(state.regime, Regime::Red);
        assert!((state.confidence - 0.80).abs() < 1e-9);
    }

    #[test]
    fn credit_divergence_cuts_confidence() {
        let spy = rising(60);
        // JNK flat-to-down, TLT up: credit not confirming.
        let jnk: Vec<f64> = (0..60).map(|i| 100.0 - 0.2 * i as f64).collect();
        let tlt: Vec<f64> = (0..60).map(|i| 100.0 + 0.5 * i as f64).collect();
        let state = classify_regime(&spy, Some(&jnk), Some(&tlt));
        assert_eq!(state.regime, Regime::Green);
        assert!(state.credit_divergence);
        assert!((state.confidence - 0.70).abs() < 1e-9);
        assert!(state.reason.contains("JNK"));
    }

    #[test]
    fn no_credit_check_below_ema() {
        // RED series with divergent credit: flag must stay false.
        let spy: Vec<f64> = (0..60).map(|i| 200.0 - i as f64).collect();
        let jnk: Vec<f64> = (0..60).map(|i| 100.0 - 0.2 * i as f64).collect();
        let tlt: Vec<f64> = (0..60).map(|i| 100.0 + 0.5 * i as f64).collect();
        let state = classify_regime(&spy, Some(&jnk), Some(&tlt));
        assert!(!state.credit_divergence);
        assert!((state.confidence - 0.80).abs() < 1e-9);
    }

    #[test]
    fn confidence_floor_holds() {
        // Haircut from 0.70 (yellow) would be 0.55 — still above floor, so
        // exercise the floor arithmetic directly.
        assert!((0.5_f64 - CREDIT_CONFIDENCE_HAIRCUT).max(CREDIT_CONFIDENCE_FLOOR) >= 0.45);
    }

    #[test]
    fn regime_serde_uppercase() {
        assert_eq!(serde_json::to_string(&Regime::Green).unwrap(), "\"GREEN\"");
        let r: Regime = serde_json::from_str("\"RED\"").unwrap();
        assert_eq!(r, Regime::Red);
    }
}
