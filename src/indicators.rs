// =============================================================================
// Technical Indicators — pure helpers shared by the regime classifier,
// the signal catalog, and the crypto analyzer
// =============================================================================
//
// Side-effect-free.  Series functions return empty vectors on insufficient
// data; scalar functions return `Option` so callers must handle the gap.
// =============================================================================

use crate::market_data::Candle;

// ---------------------------------------------------------------------------
// Simple Moving Average
// ---------------------------------------------------------------------------

/// Most recent SMA over the trailing `period` values.
pub fn latest_sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let sum: f64 = values[values.len() - period..].iter().sum();
    let sma = sum / period as f64;
    sma.is_finite().then_some(sma)
}

// ---------------------------------------------------------------------------
// Exponential Moving Average
// ---------------------------------------------------------------------------

/// Full EMA series for `closes` with look-back `period`.
///
/// The first output value is the SMA seed over the first `period` closes;
/// each subsequent element applies
/// `EMA_t = close_t × k + EMA_{t-1} × (1 − k)` with `k = 2 / (period + 1)`.
/// Returns an empty vector on insufficient data, and truncates at the first
/// non-finite intermediate.
pub fn calculate_ema(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let seed: f64 = closes[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(closes.len() - period + 1);
    result.push(seed);

    let mut prev = seed;
    for &close in &closes[period..] {
        let ema = close * multiplier + prev * (1.0 - multiplier);
        if !ema.is_finite() {
            break;
        }
        result.push(ema);
        prev = ema;
    }
    result
}

/// True when the EMA of `closes` trended upward over the last `lookback`
/// series steps (current EMA above the EMA `lookback` steps ago).
pub fn ema_rising(closes: &[f64], period: usize, lookback: usize) -> bool {
    let series = calculate_ema(closes, period);
    if series.len() <= lookback {
        return false;
    }
    series[series.len() - 1] > series[series.len() - 1 - lookback]
}

// ---------------------------------------------------------------------------
// Relative Strength Index (Wilder's smoothing)
// ---------------------------------------------------------------------------

/// Most recent RSI value for `closes` with look-back `period`.
///
/// Seeds average gain/loss with the SMA of the first `period` deltas, then
/// applies Wilder's smoothing.  Flat markets read 50, all-gain markets 100,
/// all-loss markets 0.
pub fn latest_rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();

    let (sum_gain, sum_loss) = deltas[..period]
        .iter()
        .fold((0.0_f64, 0.0_f64), |(g, l), &d| {
            if d > 0.0 {
                (g + d, l)
            } else {
                (g, l + d.abs())
            }
        });

    let period_f = period as f64;
    let mut avg_gain = sum_gain / period_f;
    let mut avg_loss = sum_loss / period_f;

    for &delta in &deltas[period..] {
        let gain = if delta > 0.0 { delta } else { 0.0 };
        let loss = if delta < 0.0 { delta.abs() } else { 0.0 };
        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;
    }

    let rsi = if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    };
    rsi.is_finite().then_some(rsi)
}

// ---------------------------------------------------------------------------
// Average True Range (Wilder's smoothing)
// ---------------------------------------------------------------------------

/// Most recent ATR value from OHLCV candles (oldest first).
///
/// `TR = max(H − L, |H − prevClose|, |L − prevClose|)`, seeded with the SMA
/// of the first `period` true ranges and smoothed with Wilder's method.
pub fn calculate_atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    let mut tr_values: Vec<f64> = Vec::with_capacity(candles.len() - 1);
    for pair in candles.windows(2) {
        let prev_close = pair[0].close;
        let bar = &pair[1];
        let tr = (bar.high - bar.low)
            .max((bar.high - prev_close).abs())
            .max((bar.low - prev_close).abs());
        tr_values.push(tr);
    }

    let mut atr: f64 = tr_values[..period].iter().sum::<f64>() / period as f64;
    let period_f = period as f64;
    for &tr in &tr_values[period..] {
        atr = (atr * (period_f - 1.0) + tr) / period_f;
    }
    atr.is_finite().then_some(atr)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(high: f64, low: f64, close: f64) -> Candle {
        Candle {
            timestamp: 0,
            open: close,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn sma_basic() {
        let v = [1.0, 2.0, 3.0, 4.0];
        assert!((latest_sma(&v, 2).unwrap() - 3.5).abs() < 1e-12);
        assert!(latest_sma(&v, 5).is_none());
        assert!(latest_sma(&v, 0).is_none());
    }

    #[test]
    fn ema_seed_is_sma() {
        let closes = [2.0, 4.0, 6.0];
        let series = calculate_ema(&closes, 3);
        assert_eq!(series.len(), 1);
        assert!((series[0] - 4.0).abs() < 1e-12);
    }

    #[test]
    fn ema_rising_on_uptrend() {
        let closes: Vec<f64> = (1..=40).map(|x| x as f64).collect();
        assert!(ema_rising(&closes, 5, 3));

        let falling: Vec<f64> = (1..=40).rev().map(|x| x as f64).collect();
        assert!(!ema_rising(&falling, 5, 3));
    }

    #[test]
    fn ema_rising_insufficient_data_is_false() {
        assert!(!ema_rising(&[1.0, 2.0], 5, 3));
    }

    #[test]
    fn rsi_extremes() {
        let up: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        assert!((latest_rsi(&up, 14).unwrap() - 100.0).abs() < 1e-9);

        let down: Vec<f64> = (1..=30).rev().map(|x| x as f64).collect();
        assert!(latest_rsi(&down, 14).unwrap().abs() < 1e-9);

        let flat = vec![100.0; 30];
        assert!((latest_rsi(&flat, 14).unwrap() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn rsi_stays_in_range() {
        let closes = [
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08,
            45.89, 46.03, 44.18, 44.22, 44.57, 43.42, 42.66, 43.13,
        ];
        let v = latest_rsi(&closes, 14).unwrap();
        assert!((0.0..=100.0).contains(&v));
    }

    #[test]
    fn atr_constant_range() {
        // Every bar spans exactly 2.0 with no gaps: ATR must be 2.0.
        let candles: Vec<Candle> = (0..20).map(|_| candle(11.0, 9.0, 10.0)).collect();
        let atr = calculate_atr(&candles, 14).unwrap();
        assert!((atr - 2.0).abs() < 1e-9);
    }

    #[test]
    fn atr_insufficient_data() {
        let candles: Vec<Candle> = (0..10).map(|_| candle(11.0, 9.0, 10.0)).collect();
        assert!(calculate_atr(&candles, 14).is_none());
    }
}
