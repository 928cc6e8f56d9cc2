// =============================================================================
// CVaR — Conditional Value-at-Risk (Expected Shortfall)
// =============================================================================
//
// CVaR at confidence c is the mean of the returns at or below the
// (1 − c) quantile: the average of the worst tail, not just its edge.
// More conservative than plain VaR, which ignores how bad the tail gets.
// =============================================================================

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct CVaRCalculator {
    /// e.g. 0.99 for CVaR₉₉.
    pub confidence: f64,
}

impl CVaRCalculator {
    pub fn new(confidence: f64) -> Self {
        Self { confidence }
    }

    /// Expected shortfall of `returns` (fractional returns, any order).
    ///
    /// Returns 0.0 when the sample is empty.  The result is negative for a
    /// loss-making tail.
    pub fn calculate(&self, returns: &[f64]) -> f64 {
        if returns.is_empty() {
            return 0.0;
        }

        let mut sorted: Vec<f64> = returns.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let tail_frac = (1.0 - self.confidence).clamp(0.0, 1.0);
        let cutoff_idx = ((sorted.len() as f64) * tail_frac).ceil() as usize;
        let cutoff_idx = cutoff_idx.clamp(1, sorted.len());

        let tail = &sorted[..cutoff_idx];
        tail.iter().sum::<f64>() / tail.len() as f64
    }

    /// True when the expected shortfall in dollars exceeds `limit_pct` of
    /// NAV.
    pub fn exceeds_limit(&self, returns: &[f64], nav: f64, limit_pct: f64) -> bool {
        if nav <= 0.0 {
            return false;
        }
        let cvar = self.calculate(returns);
        (-cvar) * nav > limit_pct * nav
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_sample_is_zero() {
        let calc = CVaRCalculator::new(0.99);
        assert!((calc.calculate(&[]) - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn single_worst_return_dominates_small_samples() {
        let calc = CVaRCalculator::new(0.99);
        // 100 returns: 99 at +1%, one at −20%. The 1% tail is that one loss.
        let mut returns = vec![0.01; 99];
        returns.push(-0.20);
        let cvar = calc.calculate(&returns);
        assert!((cvar - (-0.20)).abs() < 1e-12);
    }

    #[test]
    fn wider_tail_at_lower_confidence() {
        let returns: Vec<f64> = (0..100).map(|i| -0.01 * i as f64 / 100.0).collect();
        let tight = CVaRCalculator::new(0.99).calculate(&returns);
        let wide = CVaRCalculator::new(0.90).calculate(&returns);
        // The 10% tail averages less-extreme losses than the 1% tail.
        assert!(tight <= wide);
    }

    #[test]
    fn limit_check() {
        let calc = CVaRCalculator::new(0.99);
        let mut returns = vec![0.005; 99];
        returns.push(-0.08);
        // Tail loss 8% > 5% limit.
        assert!(calc.exceeds_limit(&returns, 10_000.0, 0.05));
        // But within a 10% limit.
        assert!(!calc.exceeds_limit(&returns, 10_000.0, 0.10));
        // Degenerate NAV never trips.
        assert!(!calc.exceeds_limit(&returns, 0.0, 0.01));
    }
}
