// =============================================================================
// Signal Catalog — registry of discrete tactical setups over OHLCV bars
// =============================================================================
//
// Each setup scans a bar slice (oldest first) and returns a PatternSignal
// with a suggested entry, a hard stop, and a fixed confidence, or None.
// Detectors are read-only — no orders originate here.
//
// Input contract: bars carry Open/High/Low/Close/Volume; minimum length
// varies per detector and is checked up front.
// =============================================================================

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::market_data::Candle;

/// A detected tactical setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternSignal {
    pub pattern: String,
    pub symbol: String,
    pub confidence: f64,
    pub entry_price: f64,
    pub stop_price: f64,
    /// ISO-8601 UTC detection time.
    pub detected_at: String,
    pub metadata: serde_json::Value,
}

fn make_signal(
    pattern: &str,
    symbol: &str,
    confidence: f64,
    entry_price: f64,
    stop_price: f64,
    metadata: serde_json::Value,
) -> PatternSignal {
    PatternSignal {
        pattern: pattern.to_string(),
        symbol: symbol.to_string(),
        confidence,
        entry_price: (entry_price * 10_000.0).round() / 10_000.0,
        stop_price: (stop_price * 10_000.0).round() / 10_000.0,
        detected_at: Utc::now().to_rfc3339(),
        metadata,
    }
}

/// A tactical pattern detector.
pub trait Setup: Send + Sync {
    fn name(&self) -> &'static str;
    fn detect(&self, bars: &[Candle], symbol: &str) -> Option<PatternSignal>;
}

// ---------------------------------------------------------------------------
// EpisodicPivot — gap-up on the highest volume of the year
// ---------------------------------------------------------------------------

/// Gap up > 4 % vs the prior close with today's volume the highest of the
/// trailing 252 bars.  Entry above the session high, stop at the session
/// low.
pub struct EpisodicPivot;

impl EpisodicPivot {
    const GAP_MIN: f64 = 0.04;
    const MIN_ROWS: usize = 30;
    const VOLUME_LOOKBACK: usize = 252;
}

impl Setup for EpisodicPivot {
    fn name(&self) -> &'static str {
        "EpisodicPivot"
    }

    fn detect(&self, bars: &[Candle], symbol: &str) -> Option<PatternSignal> {
        if bars.len() < Self::MIN_ROWS {
            return None;
        }
        let today = &bars[bars.len() - 1];
        let prev = &bars[bars.len() - 2];

        let gap_pct = (today.open - prev.close) / prev.close;
        if gap_pct < Self::GAP_MIN {
            return None;
        }

        let lookback_start = bars.len().saturating_sub(Self::VOLUME_LOOKBACK);
        let max_volume = bars[lookback_start..]
            .iter()
            .map(|b| b.volume)
            .fold(f64::MIN, f64::max);
        if today.volume < max_volume {
            return None;
        }

        Some(make_signal(
            self.name(),
            symbol,
            0.80,
            today.high,
            today.low,
            serde_json::json!({ "gap_pct": (gap_pct * 10_000.0).round() / 10_000.0,
                                "volume": today.volume }),
        ))
    }
}

// ---------------------------------------------------------------------------
// MomentumBurst — tight low-volume consolidation after a thrust, breaking out
// ---------------------------------------------------------------------------

/// 20-bar return > 5 % into a 3-bar consolidation (each bar range < 2 % of
/// close on below-average volume), with today closing above the
/// consolidation high on above-average volume.
pub struct MomentumBurst;

impl MomentumBurst {
    const TREND_MIN: f64 = 0.05;
    const CONSOL_BARS: usize = 3;
    const RANGE_MAX: f64 = 0.02;
    const MIN_ROWS: usize = 28;
}

impl Setup for MomentumBurst {
    fn name(&self) -> &'static str {
        "MomentumBurst"
    }

    fn detect(&self, bars: &[Candle], symbol: &str) -> Option<PatternSignal> {
        if bars.len() < Self::MIN_ROWS {
            return None;
        }
        let n = bars.len();
        let today = &bars[n - 1];
        let consol = &bars[n - 1 - Self::CONSOL_BARS..n - 1];

        // Thrust measured into the start of the consolidation.
        let trend_end = bars[n - 2 - Self::CONSOL_BARS].close;
        let trend_start = bars[n - 22 - Self::CONSOL_BARS].close;
        let trend_ret = (trend_end - trend_start) / trend_start;
        if trend_ret < Self::TREND_MIN {
            return None;
        }

        let avg_volume = {
            let window = &bars[n - 21 - Self::CONSOL_BARS..n - 1 - Self::CONSOL_BARS];
            window.iter().map(|b| b.volume).sum::<f64>() / window.len() as f64
        };

        for bar in consol {
            if bar.close <= 0.0 || (bar.high - bar.low) / bar.close >= Self::RANGE_MAX {
                return None;
            }
            if bar.volume >= avg_volume {
                return None;
            }
        }

        let consol_high = consol.iter().map(|b| b.high).fold(f64::MIN, f64::max);
        let consol_low = consol.iter().map(|b| b.low).fold(f64::MAX, f64::min);
        if today.close <= consol_high || today.volume <= avg_volume {
            return None;
        }

        Some(make_signal(
            self.name(),
            symbol,
            0.72,
            today.high * 1.001,
            consol_low,
            serde_json::json!({ "trend_ret": (trend_ret * 10_000.0).round() / 10_000.0,
                                "consol_high": consol_high }),
        ))
    }
}

// ---------------------------------------------------------------------------
// ElephantBar — massive green candle off the 20-day mean
// ---------------------------------------------------------------------------

/// Green candle whose range is more than twice the average of the prior 20
/// ranges, with its low within 3 % of the 20-SMA.
pub struct ElephantBar;

impl ElephantBar {
    const SIZE_MULT: f64 = 2.0;
    const MA_PROXIMITY: f64 = 0.03;
    const MIN_ROWS: usize = 22;
}

impl Setup for ElephantBar {
    fn name(&self) -> &'static str {
        "ElephantBar"
    }

    fn detect(&self, bars: &[Candle], symbol: &str) -> Option<PatternSignal> {
        if bars.len() < Self::MIN_ROWS {
            return None;
        }
        let n = bars.len();
        let today = &bars[n - 1];
        let prior = &bars[n - 21..n - 1];

        if today.close <= today.open {
            return None;
        }

        let today_range = today.high - today.low;
        let avg_prior_range =
            prior.iter().map(|b| b.high - b.low).sum::<f64>() / prior.len() as f64;
        if avg_prior_range <= 0.0 || today_range < Self::SIZE_MULT * avg_prior_range {
            return None;
        }

        let sma20 = prior.iter().map(|b| b.close).sum::<f64>() / prior.len() as f64;
        if (today.low - sma20).abs() / sma20 > Self::MA_PROXIMITY {
            return None;
        }

        Some(make_signal(
            self.name(),
            symbol,
            0.75,
            today.high * 1.001,
            today.low,
            serde_json::json!({ "today_range": today_range,
                                "avg_prior_range": avg_prior_range,
                                "sma20": sma20 }),
        ))
    }
}

// ---------------------------------------------------------------------------
// VCP — volatility contraction: tightening pullback waves
// ---------------------------------------------------------------------------

/// At least three pullback waves in the last 60 bars, each wave's drawdown
/// no more than 70 % of the previous, with price within 3 % of the tightest
/// pivot high.
pub struct Vcp;

impl Vcp {
    const MIN_WAVES: usize = 3;
    const CONTRACTION_RATIO: f64 = 0.70;
    const PIVOT_PROXIMITY: f64 = 0.03;
    const LOOKBACK: usize = 60;
    const MIN_ROWS: usize = 65;

    /// Local maxima/minima sweep: a wave is recorded whenever a new high
    /// confirms a completed pullback, as `(peak, trough, drawdown_frac)`.
    fn find_waves(closes: &[f64]) -> Vec<(f64, f64, f64)> {
        let mut waves = Vec::new();
        if closes.is_empty() {
            return waves;
        }
        let mut peak = closes[0];
        let mut trough = closes[0];
        let mut in_drawdown = false;

        for &price in &closes[1..] {
            if price > peak {
                if in_drawdown && peak > 0.0 && trough < peak {
                    waves.push((peak, trough, (peak - trough) / peak));
                }
                peak = price;
                trough = price;
                in_drawdown = false;
            } else if price < trough {
                trough = price;
                in_drawdown = true;
            }
        }
        waves
    }
}

impl Setup for Vcp {
    fn name(&self) -> &'static str {
        "VCP"
    }

    fn detect(&self, bars: &[Candle], symbol: &str) -> Option<PatternSignal> {
        if bars.len() < Self::MIN_ROWS {
            return None;
        }
        let window: Vec<f64> = bars[bars.len() - Self::LOOKBACK..]
            .iter()
            .map(|b| b.close)
            .collect();
        let waves = Self::find_waves(&window);
        if waves.len() < Self::MIN_WAVES {
            return None;
        }

        for pair in waves.windows(2) {
            if pair[1].2 > pair[0].2 * Self::CONTRACTION_RATIO {
                return None; // wave expanded — not a contraction pattern
            }
        }

        let (pivot_high, pivot_trough, _) = *waves.last().expect("non-empty");
        let current = bars[bars.len() - 1].close;
        if (current - pivot_high).abs() / pivot_high > Self::PIVOT_PROXIMITY {
            return None;
        }

        Some(make_signal(
            self.name(),
            symbol,
            0.78,
            pivot_high * 1.001,
            pivot_trough,
            serde_json::json!({
                "num_waves": waves.len(),
                "wave_depths": waves.iter().rev().take(3).rev()
                    .map(|w| (w.2 * 10_000.0).round() / 10_000.0)
                    .collect::<Vec<_>>(),
                "pivot_high": pivot_high,
            }),
        ))
    }
}

// ---------------------------------------------------------------------------
// HighTightFlag — doubled in under eight weeks, then a flat flag
// ---------------------------------------------------------------------------

/// A ≥ 100 % move in the 40 bars before the flag, a 3–5 bar flag retracing
/// no more than 20 % of the prior leg, and today breaking above the flag
/// high on at least 3× the 20-bar average volume.
pub struct HighTightFlag;

impl HighTightFlag {
    const DOUBLE_BARS: usize = 40;
    const FLAG_BARS: usize = 5;
    const RETRACE_MAX: f64 = 0.20;
    const VOLUME_MULT: f64 = 3.0;
    const MIN_ROWS: usize = 46;
}

impl Setup for HighTightFlag {
    fn name(&self) -> &'static str {
        "HighTightFlag"
    }

    fn detect(&self, bars: &[Candle], symbol: &str) -> Option<PatternSignal> {
        if bars.len() < Self::MIN_ROWS {
            return None;
        }
        let n = bars.len();
        let today = &bars[n - 1];
        let flag = &bars[n - 1 - Self::FLAG_BARS..n - 1];
        let base = &bars[n - 1 - Self::FLAG_BARS - Self::DOUBLE_BARS..n - 1 - Self::FLAG_BARS];

        let base_low = base.iter().map(|b| b.close).fold(f64::MAX, f64::min);
        let flag_high = flag.iter().map(|b| b.high).fold(f64::MIN, f64::max);
        let flag_low = flag.iter().map(|b| b.low).fold(f64::MAX, f64::min);
        if base_low <= 0.0 {
            return None;
        }

        // Must have at least doubled from base low to flag high.
        if (flag_high - base_low) / base_low < 1.0 {
            return None;
        }

        let prior_leg = flag_high - base_low;
        let retrace = (flag_high - flag_low) / prior_leg;
        if retrace > Self::RETRACE_MAX {
            return None;
        }

        let avg_volume = {
            let window = &bars[n - 21..n - 1];
            window.iter().map(|b| b.volume).sum::<f64>() / window.len() as f64
        };
        if today.close <= flag_high {
            return None;
        }
        if avg_volume > 0.0 && today.volume < Self::VOLUME_MULT * avg_volume {
            return None;
        }

        Some(make_signal(
            self.name(),
            symbol,
            0.82,
            flag_high * 1.001,
            flag_low,
            serde_json::json!({ "base_low": base_low,
                                "flag_high": flag_high,
                                "retrace_pct": (retrace * 10_000.0).round() / 10_000.0 }),
        ))
    }
}

// ---------------------------------------------------------------------------
// InsideBar212 — directional bar followed by an inside bar
// ---------------------------------------------------------------------------

/// Bar N−1 closed up more than 1 % from both its open and the prior close;
/// today is contained entirely inside bar N−1's range.
pub struct InsideBar212;

impl InsideBar212 {
    const DIRECTIONAL_MOVE: f64 = 0.01;
    const MIN_ROWS: usize = 3;
}

impl Setup for InsideBar212 {
    fn name(&self) -> &'static str {
        "InsideBar212"
    }

    fn detect(&self, bars: &[Candle], symbol: &str) -> Option<PatternSignal> {
        if bars.len() < Self::MIN_ROWS {
            return None;
        }
        let n = bars.len();
        let two_ago = &bars[n - 3];
        let directional = &bars[n - 2];
        let inside = &bars[n - 1];

        let move_from_open = (directional.close - directional.open) / directional.open;
        let move_from_prev = (directional.close - two_ago.close) / two_ago.close;
        if move_from_open < Self::DIRECTIONAL_MOVE || move_from_prev < Self::DIRECTIONAL_MOVE {
            return None;
        }

        if inside.high >= directional.high || inside.low <= directional.low {
            return None;
        }

        Some(make_signal(
            self.name(),
            symbol,
            0.68,
            inside.high * 1.001,
            inside.low * 0.999,
            serde_json::json!({ "directional_move_pct":
                                    (move_from_open * 10_000.0).round() / 10_000.0,
                                "inside_bar_range": inside.high - inside.low }),
        ))
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// All registered detectors, instantiated once.
pub fn registry() -> Vec<Box<dyn Setup>> {
    vec![
        Box::new(EpisodicPivot),
        Box::new(MomentumBurst),
        Box::new(ElephantBar),
        Box::new(Vcp),
        Box::new(HighTightFlag),
        Box::new(InsideBar212),
    ]
}

/// Run every detector against `bars` and collect all matches.
pub fn scan_symbol(bars: &[Candle], symbol: &str) -> Vec<PatternSignal> {
    let mut signals = Vec::new();
    for detector in registry() {
        if let Some(signal) = detector.detect(bars, symbol) {
            debug!(
                pattern = %signal.pattern,
                symbol,
                confidence = signal.confidence,
                entry = signal.entry_price,
                stop = signal.stop_price,
                "pattern detected"
            );
            signals.push(signal);
        }
    }
    signals
}
