// =============================================================================
// Fractional Kelly — position sizing with bounded ruin risk
// =============================================================================
//
// Raw Kelly maximises log growth but produces violent swings; every size
// this module emits is the Kelly optimum scaled by a fraction < 1 and capped
// at a maximum share of bankroll.
//
// Two variants:
//   * win/loss statistics:  f* = (p·w − (1−p)·l) / w
//   * discrete decimal odds: f* = (p·(o−1) − (1−p)) / (o−1)
// =============================================================================

use serde::Serialize;

/// Confidence floor below which no stake is placed.
const MIN_CONFIDENCE: f64 = 0.60;

/// Sizing engine configured once per autopilot cycle.
#[derive(Debug, Clone, Serialize)]
pub struct KellyAllocator {
    /// Fractional multiplier applied to the raw Kelly optimum (0.25 / 0.40 /
    /// 0.50 by risk level).
    pub fraction: f64,
    /// Hard ceiling as a fraction of bankroll (e.g. 0.10).
    pub max_position_frac: f64,
}

impl KellyAllocator {
    pub fn new(fraction: f64, max_position_frac: f64) -> Self {
        Self {
            fraction,
            max_position_frac,
        }
    }

    /// Bankroll fraction from historical win/loss statistics.
    pub fn fraction_from_stats(&self, win_rate: f64, avg_win: f64, avg_loss: f64) -> f64 {
        if avg_win <= 0.0 {
            return 0.0;
        }
        let raw = (win_rate * avg_win - (1.0 - win_rate) * avg_loss) / avg_win;
        self.clamp(raw)
    }

    /// Bankroll fraction for a binary-outcome venue quoted in decimal odds.
    pub fn fraction_from_odds(&self, confidence: f64, decimal_odds: f64) -> f64 {
        if confidence < MIN_CONFIDENCE {
            return 0.0;
        }
        let b = decimal_odds - 1.0;
        if b <= 0.0 {
            return 0.0;
        }
        let p = confidence.clamp(0.0, 1.0);
        let raw = (b * p - (1.0 - p)) / b;
        self.clamp(raw)
    }

    /// Dollar stake for a scored opportunity (score in [0, 100]).
    pub fn position_size(&self, bankroll: f64, score: f64, decimal_odds: f64) -> f64 {
        let frac = self.fraction_from_odds(score / 100.0, decimal_odds);
        (bankroll * frac * 100.0).round() / 100.0
    }

    fn clamp(&self, raw_kelly: f64) -> f64 {
        (raw_kelly.max(0.0) * self.fraction).min(self.max_position_frac)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conservative_sizing_caps_at_max_position() {
        // score 80, odds 1.95, conservative quarter-Kelly, 10% cap, $1000.
        // f* = (0.95·0.80 − 0.20) / 0.95 ≈ 0.589; × 0.25 = 0.147 → capped 0.10.
        let allocator = KellyAllocator::new(0.25, 0.10);
        let size = allocator.position_size(1000.0, 80.0, 1.95);
        assert!((size - 100.0).abs() < 1e-9);
    }

    #[test]
    fn below_confidence_floor_sizes_zero() {
        let allocator = KellyAllocator::new(0.25, 0.10);
        assert!((allocator.position_size(1000.0, 55.0, 2.0) - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn negative_edge_clamps_to_zero() {
        let allocator = KellyAllocator::new(0.25, 0.10);
        // 60% confidence at very short odds has negative expectation.
        assert!((allocator.fraction_from_odds(0.60, 1.10) - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn stats_variant_matches_formula() {
        let allocator = KellyAllocator::new(1.0, 1.0);
        // p=0.55, w=1.0, l=1.0 → f* = 0.55 − 0.45 = 0.10.
        let f = allocator.fraction_from_stats(0.55, 1.0, 1.0);
        assert!((f - 0.10).abs() < 1e-12);
    }

    #[test]
    fn stats_variant_zero_on_bad_inputs() {
        let allocator = KellyAllocator::new(0.25, 0.10);
        assert!((allocator.fraction_from_stats(0.55, 0.0, 1.0) - 0.0).abs() < f64::EPSILON);
        // Losing system clamps at zero.
        assert!((allocator.fraction_from_stats(0.30, 1.0, 2.0) - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn fraction_scales_with_risk_level() {
        let conservative = KellyAllocator::new(0.25, 1.0);
        let aggressive = KellyAllocator::new(0.50, 1.0);
        let c = conservative.fraction_from_odds(0.80, 1.95);
        let a = aggressive.fraction_from_odds(0.80, 1.95);
        assert!((a - 2.0 * c).abs() < 1e-12);
    }
}
