// =============================================================================
// Rates Analyzer — yield-curve structure and policy bias
// =============================================================================
//
// Reads harvested Treasury yields (13-week bill and 10-year note) from the
// tick substrate, adjusts baseline policy probabilities with the curve and
// the bus's volatility read, and publishes `intel:fed_bias`.
//
// An inverted curve (short rate above long) is the recession-hedge signal
// the autopilot ranks; a normal curve is NoSignal.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::analyzers::{Analyzer, AnalyzerOutcome, Assessment};
use crate::bus::{keys, IntelBus};
use crate::market_data::{SeriesKey, TickStore};

const SOURCE: &str = "rates";

/// Decimal odds on the recession-hedge contract.
const HEDGE_ODDS: f64 = 3.50;
const HEDGE_SCORE: f64 = 85.0;

/// Strong-inversion threshold, percentage points.
const INVERSION_STRONG: f64 = 0.5;
/// Volatility regime threshold on the VIX.
const VIX_HIGH: f64 = 25.0;

pub struct RatesAnalyzer {
    bus: Arc<IntelBus>,
    ticks: Arc<TickStore>,
    short_series: SeriesKey,
    long_series: SeriesKey,
}

/// Policy-outcome probabilities after curve and volatility adjustments.
///
/// BTreeMap keeps the iteration order stable for logging and tests.
fn adjusted_probabilities(inversion: f64, vix_high: bool) -> BTreeMap<&'static str, f64> {
    let mut probs = BTreeMap::from([("PAUSE", 0.70), ("HIKE_25", 0.05), ("CUT_25", 0.25)]);

    if inversion > INVERSION_STRONG {
        *probs.get_mut("CUT_25").expect("key") += 0.15;
        *probs.get_mut("PAUSE").expect("key") -= 0.10;
        *probs.get_mut("HIKE_25").expect("key") -= 0.05;
    }
    if vix_high {
        *probs.get_mut("PAUSE").expect("key") += 0.10;
        *probs.get_mut("CUT_25").expect("key") += 0.05;
        *probs.get_mut("HIKE_25").expect("key") -= 0.15;
    }

    for v in probs.values_mut() {
        *v = f64::max(*v, 0.0);
    }
    let total: f64 = probs.values().sum();
    for v in probs.values_mut() {
        *v = (*v / total * 100.0).round() / 100.0;
    }
    probs
}

fn dominant_bias(probs: &BTreeMap<&'static str, f64>) -> (&'static str, f64) {
    let (bracket, p) = probs
        .iter()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .expect("non-empty");
    let bias = match *bracket {
        "CUT_25" => "dovish",
        "HIKE_25" => "hawkish",
        _ => "neutral",
    };
    (bias, *p)
}

impl RatesAnalyzer {
    pub fn new(bus: Arc<IntelBus>, ticks: Arc<TickStore>) -> Self {
        Self {
            bus,
            ticks,
            short_series: SeriesKey::daily("^IRX"),
            long_series: SeriesKey::daily("^TNX"),
        }
    }
}

#[async_trait]
impl Analyzer for RatesAnalyzer {
    fn name(&self) -> &'static str {
        "POWELL"
    }

    async fn analyze(&self) -> AnalyzerOutcome {
        let (Some(short_rate), Some(long_rate)) = (
            self.ticks.latest_close(&self.short_series),
            self.ticks.latest_close(&self.long_series),
        ) else {
            return AnalyzerOutcome::NoSignal("treasury yields not harvested yet".to_string());
        };

        let inversion = short_rate - long_rate;
        let vix_high = self
            .bus
            .read(keys::VIX_LEVEL)
            .await
            .and_then(|p| p.as_f64())
            .map(|v| v > VIX_HIGH)
            .unwrap_or(false);

        let probs = adjusted_probabilities(inversion, vix_high);
        let (bias, confidence) = dominant_bias(&probs);

        self.bus
            .publish(
                keys::FED_BIAS,
                serde_json::json!({ "bias": bias, "confidence": confidence }),
                SOURCE,
                confidence,
            )
            .await;

        debug!(
            short_rate,
            long_rate, inversion, vix_high, bias, "rates scan complete"
        );

        if inversion > 0.0 {
            AnalyzerOutcome::Success(Assessment {
                score: HEDGE_SCORE,
                signal: "Recession Hedge".to_string(),
                reason: format!(
                    "Yield curve INVERTED: 13w {short_rate:.2}% > 10y {long_rate:.2}% \
                     (spread {inversion:.2})"
                ),
                odds: HEDGE_ODDS,
                extras: serde_json::json!({
                    "inversion": inversion,
                    "consensus": probs,
                }),
            })
        } else {
            AnalyzerOutcome::NoSignal(format!(
                "curve normal (spread {inversion:.2}) — no hedge edge"
            ))
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::Candle;

    fn seed(ticks: &TickStore, symbol: &str, value: f64) {
        ticks.append(
            SeriesKey::daily(symbol),
            Candle {
                timestamp: 1,
                open: value,
                high: value,
                low: value,
                close: value,
                volume: 0.0,
            },
        );
    }

    #[test]
    fn baseline_probabilities_sum_to_one() {
        let probs = adjusted_probabilities(0.0, false);
        let total: f64 = probs.values().sum();
        assert!((total - 1.0).abs() < 0.02);
        assert!((probs["PAUSE"] - 0.70).abs() < 1e-9);
    }

    #[test]
    fn strong_inversion_shifts_toward_cuts() {
        let base = adjusted_probabilities(0.0, false);
        let inverted = adjusted_probabilities(0.8, false);
        assert!(inverted["CUT_25"] > base["CUT_25"]);
        assert!(inverted["PAUSE"] < base["PAUSE"]);
    }

    #[test]
    fn high_volatility_suppresses_hikes() {
        let calm = adjusted_probabilities(0.0, false);
        let stressed = adjusted_probabilities(0.0, true);
        assert!(stressed["HIKE_25"] < calm["HIKE_25"]);
        assert!(stressed["PAUSE"] >= calm["PAUSE"]);
    }

    #[test]
    fn dominant_bias_mapping() {
        let mut probs = BTreeMap::from([("PAUSE", 0.2), ("HIKE_25", 0.1), ("CUT_25", 0.7)]);
        assert_eq!(dominant_bias(&probs).0, "dovish");
        probs = BTreeMap::from([("PAUSE", 0.6), ("HIKE_25", 0.3), ("CUT_25", 0.1)]);
        assert_eq!(dominant_bias(&probs).0, "neutral");
    }

    #[tokio::test]
    async fn missing_yields_is_no_signal() {
        let analyzer = RatesAnalyzer::new(
            Arc::new(IntelBus::disabled()),
            Arc::new(TickStore::new(10)),
        );
        assert!(matches!(
            analyzer.analyze().await,
            AnalyzerOutcome::NoSignal(_)
        ));
    }

    #[tokio::test]
    async fn inverted_curve_emits_hedge() {
        let ticks = Arc::new(TickStore::new(10));
        seed(&ticks, "^IRX", 5.2);
        seed(&ticks, "^TNX", 4.4);
        let analyzer = RatesAnalyzer::new(Arc::new(IntelBus::disabled()), ticks);
        let outcome = analyzer.analyze().await;
        let assessment = outcome.success().expect("success");
        assert_eq!(assessment.signal, "Recession Hedge");
        assert!((assessment.score - 85.0).abs() < 1e-9);
        assert!((assessment.odds - 3.50).abs() < 1e-9);
    }

    #[tokio::test]
    async fn normal_curve_is_no_signal() {
        let ticks = Arc::new(TickStore::new(10));
        seed(&ticks, "^IRX", 4.0);
        seed(&ticks, "^TNX", 4.5);
        let analyzer = RatesAnalyzer::new(Arc::new(IntelBus::disabled()), ticks);
        assert!(matches!(
            analyzer.analyze().await,
            AnalyzerOutcome::NoSignal(_)
        ));
    }
}
