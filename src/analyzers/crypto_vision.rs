// =============================================================================
// Crypto Vision — multi-indicator confluence scoring for BTC
// =============================================================================
//
// Reads harvested BTC bars from the tick substrate, scores a confluence of
// RSI, EMA structure, and volume, and publishes the resulting sentiment to
// the bus (`intel:btc_sentiment` in [−1, 1], plus a volume-spike flag).
//
// Insufficient history is a NoSignal, never a guess.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::analyzers::{Analyzer, AnalyzerOutcome, Assessment};
use crate::bus::{keys, IntelBus};
use crate::indicators::{calculate_atr, calculate_ema, latest_rsi};
use crate::market_data::{Candle, SeriesKey, TickStore};

const SOURCE: &str = "crypto_vision";
const MIN_BARS: usize = 60;
const VOLUME_SPIKE_MULT: f64 = 3.0;

/// Decimal odds quoted on the crypto venue's short-horizon contracts.
const CRYPTO_ODDS: f64 = 1.95;

pub struct CryptoVisionAnalyzer {
    bus: Arc<IntelBus>,
    ticks: Arc<TickStore>,
    series: SeriesKey,
}

/// Confluence score over the most recent bars, with supporting notes.
fn score_confluence(bars: &[Candle]) -> (f64, Vec<String>) {
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let price = closes[closes.len() - 1];
    let mut score: f64 = 0.0;
    let mut notes = Vec::new();

    if let Some(rsi) = latest_rsi(&closes, 14) {
        if rsi < 30.0 {
            score += 30.0;
            notes.push(format!("Oversold (RSI {rsi:.1})"));
        } else if rsi > 70.0 {
            score -= 20.0;
            notes.push(format!("Overbought (RSI {rsi:.1})"));
        }
    }

    if let Some(&ema21) = calculate_ema(&closes, 21).last() {
        if price > ema21 {
            score += 25.0;
            notes.push("Price above EMA21".to_string());
        }
    }
    if let Some(&ema55) = calculate_ema(&closes, 55).last() {
        if price > ema55 {
            score += 25.0;
            notes.push("Structure above EMA55".to_string());
        }
    }

    // Volume expansion on the most recent bar.
    let n = bars.len();
    let avg_volume: f64 =
        bars[n - 21..n - 1].iter().map(|b| b.volume).sum::<f64>() / 20.0;
    if avg_volume > 0.0 && bars[n - 1].volume > 2.0 * avg_volume {
        score += 20.0;
        notes.push("Volume expansion".to_string());
    }

    (score.clamp(0.0, 100.0), notes)
}

fn sentiment_label(score: f64) -> &'static str {
    if score >= 65.0 {
        "BULLISH"
    } else if score <= 25.0 {
        "BEARISH"
    } else {
        "NEUTRAL"
    }
}

impl CryptoVisionAnalyzer {
    pub fn new(bus: Arc<IntelBus>, ticks: Arc<TickStore>, symbol: &str, interval: &str) -> Self {
        Self {
            bus,
            ticks,
            series: SeriesKey::new(symbol, interval),
        }
    }
}

#[async_trait]
impl Analyzer for CryptoVisionAnalyzer {
    fn name(&self) -> &'static str {
        "BTC"
    }

    async fn analyze(&self) -> AnalyzerOutcome {
        let bars = self.ticks.bars(&self.series, 200);
        if bars.len() < MIN_BARS {
            return AnalyzerOutcome::NoSignal(format!(
                "insufficient bars for {} ({} < {MIN_BARS})",
                self.series,
                bars.len()
            ));
        }

        let (score, notes) = score_confluence(&bars);
        let label = sentiment_label(score);
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let atr = calculate_atr(&bars, 14).unwrap_or(0.0);
        let price = closes[closes.len() - 1];

        // Bus enrichment: sentiment in [−1, 1] and the volume-spike flag.
        let sentiment = (score - 50.0) / 50.0;
        self.bus
            .publish(
                keys::BTC_SENTIMENT,
                serde_json::json!(sentiment),
                SOURCE,
                score / 100.0,
            )
            .await;

        let n = bars.len();
        let avg_volume: f64 =
            bars[n - 21..n - 1].iter().map(|b| b.volume).sum::<f64>() / 20.0;
        let multiplier = if avg_volume > 0.0 {
            bars[n - 1].volume / avg_volume
        } else {
            0.0
        };
        self.bus
            .publish(
                keys::BTC_VOLUME_SPIKE,
                serde_json::json!({
                    "detected": multiplier >= VOLUME_SPIKE_MULT,
                    "multiplier": (multiplier * 100.0).round() / 100.0,
                }),
                SOURCE,
                1.0,
            )
            .await;

        debug!(score, label, price, atr, "crypto vision scan complete");

        AnalyzerOutcome::Success(Assessment {
            score,
            signal: format!("BTC {label}"),
            reason: if notes.is_empty() {
                "No confluence".to_string()
            } else {
                notes.join("; ")
            },
            odds: CRYPTO_ODDS,
            extras: serde_json::json!({
                "price": price,
                "atr": atr,
                "stop_loss": price - 2.0 * atr,
                "take_profit": price + 3.0 * atr,
            }),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bars_rising(n: usize, volume_last: f64) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let c = 50_000.0 + 10.0 * i as f64;
                Candle {
                    timestamp: i as i64 * 300,
                    open: c - 5.0,
                    high: c + 10.0,
                    low: c - 10.0,
                    close: c,
                    volume: if i == n - 1 { volume_last } else { 100.0 },
                }
            })
            .collect()
    }

    #[test]
    fn uptrend_scores_structure_points() {
        let (score, notes) = score_confluence(&bars_rising(100, 100.0));
        // Above both EMAs (+50), overbought RSI (−20): net 30.
        assert!((score - 30.0).abs() < 1e-9);
        assert!(notes.iter().any(|n| n.contains("EMA21")));
        assert!(notes.iter().any(|n| n.contains("Overbought")));
    }

    #[test]
    fn volume_expansion_adds_points() {
        let (base, _) = score_confluence(&bars_rising(100, 100.0));
        let (spiked, notes) = score_confluence(&bars_rising(100, 500.0));
        assert!((spiked - base - 20.0).abs() < 1e-9);
        assert!(notes.iter().any(|n| n.contains("Volume")));
    }

    #[test]
    fn score_is_clamped() {
        let falling: Vec<Candle> = (0..100)
            .map(|i| {
                let c = 60_000.0 - 20.0 * i as f64;
                Candle {
                    timestamp: i * 300,
                    open: c + 5.0,
                    high: c + 10.0,
                    low: c - 10.0,
                    close: c,
                    volume: 100.0,
                }
            })
            .collect();
        let (score, _) = score_confluence(&falling);
        assert!((0.0..=100.0).contains(&score));
    }

    #[test]
    fn sentiment_labels() {
        assert_eq!(sentiment_label(80.0), "BULLISH");
        assert_eq!(sentiment_label(50.0), "NEUTRAL");
        assert_eq!(sentiment_label(10.0), "BEARISH");
    }

    #[tokio::test]
    async fn short_history_is_no_signal() {
        let bus = Arc::new(IntelBus::disabled());
        let ticks = Arc::new(TickStore::new(300));
        let analyzer = CryptoVisionAnalyzer::new(bus, ticks, "BTC-USD", "5m");
        let outcome = analyzer.analyze().await;
        assert!(matches!(outcome, AnalyzerOutcome::NoSignal(_)));
    }

    #[tokio::test]
    async fn full_history_is_success() {
        let bus = Arc::new(IntelBus::disabled());
        let ticks = Arc::new(TickStore::new(300));
        for bar in bars_rising(100, 100.0) {
            ticks.append(SeriesKey::new("BTC-USD", "5m"), bar);
        }
        let analyzer = CryptoVisionAnalyzer::new(bus, ticks, "BTC-USD", "5m");
        let outcome = analyzer.analyze().await;
        let assessment = outcome.success().expect("success");
        assert!(assessment.signal.starts_with("BTC "));
        assert!((assessment.odds - 1.95).abs() < 1e-12);
    }
}
