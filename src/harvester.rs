// =============================================================================
// Harvester — polling ingestors feeding the tick substrate and the bus
// =============================================================================
//
// One polling loop per external source:
//   * Daily equity bars (watchlist + SPY/JNK/TLT + Treasury yields), polled
//     only around US market hours, 13-second spacing between symbols to
//     respect the source's 5-calls-per-minute budget.
//   * Crypto bars, polled continuously.
//   * Macro gauges (fear & greed, 10-year yield) published straight to the
//     bus.
//   * Prediction-venue order books, mirrored locally with snapshot seeding.
//
// A harvester that outruns its consumers overwrites the latest bar — stale
// data is preferable to queue growth.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Datelike, Timelike, Utc, Weekday};
use tracing::{debug, info, warn};

use crate::broker::kalshi::KalshiAdapter;
use crate::broker::router::us_eastern_offset;
use crate::bus::{keys, IntelBus};
use crate::market_data::{Candle, OrderBookMirror, SeriesKey, TickStore};

const SOURCE: &str = "harvester";

/// 5 calls/minute budget -> 13-second spacing.
const EQUITY_CALL_SPACING_SECS: u64 = 13;
/// Seconds between full equity sweeps.
const EQUITY_SWEEP_INTERVAL_SECS: u64 = 900;
/// Seconds between crypto polls.
const CRYPTO_POLL_INTERVAL_SECS: u64 = 60;
/// Seconds between macro gauge polls.
const MACRO_POLL_INTERVAL_SECS: u64 = 600;
/// Seconds between order-book mirror refreshes.
const BOOK_POLL_INTERVAL_SECS: u64 = 30;

// ---------------------------------------------------------------------------
// Parsers (pure)
// ---------------------------------------------------------------------------

/// Parse a daily-history CSV (`Date,Open,High,Low,Close,Volume`) into bars,
/// oldest first. Unparsable rows are skipped.
pub fn parse_history_csv(raw: &str) -> Vec<Candle> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(raw.as_bytes());

    let mut bars = Vec::new();
    for record in rdr.records().flatten() {
        let parse = |i: usize| record.get(i).and_then(|s| s.parse::<f64>().ok());
        let date = record
            .get(0)
            .and_then(|s| chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").ok());
        let (Some(date), Some(open), Some(high), Some(low), Some(close)) =
            (date, parse(1), parse(2), parse(3), parse(4))
        else {
            continue;
        };
        bars.push(Candle {
            timestamp: date.and_hms_opt(0, 0, 0).map(|t| t.and_utc().timestamp()).unwrap_or(0),
            open,
            high,
            low,
            close,
            volume: parse(5).unwrap_or(0.0),
        });
    }
    bars
}

/// Parse the crypto venue's candle arrays `[time, low, high, open, close,
/// volume]` (newest first on the wire) into oldest-first bars.
pub fn parse_crypto_candles(raw: &serde_json::Value) -> Vec<Candle> {
    let Some(rows) = raw.as_array() else {
        return Vec::new();
    };
    let mut bars: Vec<Candle> = rows
        .iter()
        .filter_map(|row| {
            let cells = row.as_array()?;
            Some(Candle {
                timestamp: cells.first()?.as_f64()? as i64,
                low: cells.get(1)?.as_f64()?,
                high: cells.get(2)?.as_f64()?,
                open: cells.get(3)?.as_f64()?,
                close: cells.get(4)?.as_f64()?,
                volume: cells.get(5)?.as_f64()?,
            })
        })
        .collect();
    bars.sort_by_key(|b| b.timestamp);
    bars
}

/// Resting depth at which a refresh counts as a liquidity spike (3x the
/// prior sweep).
pub fn liquidity_spike_floor(previous_depth: u64) -> u64 {
    previous_depth.saturating_mul(3)
}

/// True on US weekdays within the extended trading window [04:00, 20:00) ET.
pub fn within_polling_hours(now: chrono::DateTime<Utc>) -> bool {
    let eastern = now.with_timezone(&us_eastern_offset(now.date_naive()));
    if matches!(eastern.weekday(), Weekday::Sat | Weekday::Sun) {
        return false;
    }
    (4..20).contains(&eastern.hour())
}

/// The source's code for a symbol: indices keep their mapped codes, plain
/// tickers gain the `.us` suffix.
pub fn history_source_code(symbol: &str) -> String {
    match symbol {
        "^IRX" => "3musy.b".to_string(),
        "^TNX" => "10usy.b".to_string(),
        "^VIX" => "vix".to_string(),
        _ => format!("{}.us", symbol.to_lowercase()),
    }
}

// ---------------------------------------------------------------------------
// Harvester
// ---------------------------------------------------------------------------

pub struct Harvester {
    bus: Arc<IntelBus>,
    ticks: Arc<TickStore>,
    client: reqwest::Client,
}

impl Harvester {
    pub fn new(bus: Arc<IntelBus>, ticks: Arc<TickStore>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .expect("failed to build reqwest client");
        Self { bus, ticks, client }
    }

    // -------------------------------------------------------------------------
    // Equity / macro-series loop
    // -------------------------------------------------------------------------

    /// Poll daily bars for `symbols` forever, respecting market hours and
    /// the per-source call budget.
    pub async fn run_equity_loop(self: Arc<Self>, symbols: Vec<String>) {
        info!(count = symbols.len(), "equity harvester starting");
        loop {
            if !within_polling_hours(Utc::now()) {
                debug!("outside polling hours — equity harvester sleeping");
                tokio::time::sleep(std::time::Duration::from_secs(EQUITY_SWEEP_INTERVAL_SECS))
                    .await;
                continue;
            }

            for symbol in &symbols {
                if let Err(e) = self.harvest_daily(symbol).await {
                    warn!(symbol = %symbol, error = %e, "daily harvest failed");
                }
                tokio::time::sleep(std::time::Duration::from_secs(EQUITY_CALL_SPACING_SECS))
                    .await;
            }
            tokio::time::sleep(std::time::Duration::from_secs(EQUITY_SWEEP_INTERVAL_SECS)).await;
        }
    }

    async fn harvest_daily(&self, symbol: &str) -> Result<()> {
        let code = history_source_code(symbol);
        let url = format!("https://stooq.com/q/d/l/?s={code}&i=d");
        let raw = self
            .client
            .get(&url)
            .send()
            .await
            .context("history request failed")?
            .text()
            .await
            .context("history body unreadable")?;

        let bars = parse_history_csv(&raw);
        if bars.is_empty() {
            anyhow::bail!("no bars parsed for {symbol}");
        }

        let key = SeriesKey::daily(symbol);
        let count = bars.len();
        for bar in bars {
            self.ticks.append(key.clone(), bar);
        }
        debug!(symbol, bars = count, "daily series harvested");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Crypto loop
    // -------------------------------------------------------------------------

    /// Poll 5-minute crypto bars continuously.
    pub async fn run_crypto_loop(self: Arc<Self>, products: Vec<String>) {
        info!(count = products.len(), "crypto harvester starting");
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(CRYPTO_POLL_INTERVAL_SECS));
        loop {
            interval.tick().await;
            for product in &products {
                if let Err(e) = self.harvest_crypto(product).await {
                    warn!(product = %product, error = %e, "crypto harvest failed");
                }
            }
        }
    }

    async fn harvest_crypto(&self, product: &str) -> Result<()> {
        let url = format!(
            "https://api.exchange.coinbase.com/products/{product}/candles?granularity=300"
        );
        let raw: serde_json::Value = self
            .client
            .get(&url)
            .header("User-Agent", "meridian")
            .send()
            .await
            .context("candle request failed")?
            .json()
            .await
            .context("candle body unreadable")?;

        let bars = parse_crypto_candles(&raw);
        if bars.is_empty() {
            anyhow::bail!("no candles parsed for {product}");
        }

        let key = SeriesKey::new(product, "5m");
        for bar in bars {
            self.ticks.append(key.clone(), bar);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Macro gauges
    // -------------------------------------------------------------------------

    /// Publish fear & greed and the 10-year yield to the bus on a slow loop.
    pub async fn run_macro_loop(self: Arc<Self>) {
        info!("macro harvester starting");
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(MACRO_POLL_INTERVAL_SECS));
        loop {
            interval.tick().await;

            match self.fetch_fear_greed().await {
                Ok(value) => {
                    self.bus
                        .publish(keys::FEAR_GREED, serde_json::json!(value), SOURCE, 1.0)
                        .await;
                }
                Err(e) => debug!(error = %e, "fear & greed unavailable"),
            }

            if let Some(yield_10y) = self.ticks.latest_close(&SeriesKey::daily("^TNX")) {
                self.bus
                    .publish(keys::TEN_Y_YIELD, serde_json::json!(yield_10y), SOURCE, 1.0)
                    .await;
            }

            if let Some(vix) = self.ticks.latest_close(&SeriesKey::daily("^VIX")) {
                self.bus
                    .publish(keys::VIX_LEVEL, serde_json::json!(vix), SOURCE, 1.0)
                    .await;
            }
        }
    }

    async fn fetch_fear_greed(&self) -> Result<f64> {
        let raw: serde_json::Value = self
            .client
            .get("https://api.alternative.me/fng/?limit=1")
            .send()
            .await
            .context("fng request failed")?
            .json()
            .await
            .context("fng body unreadable")?;
        raw.pointer("/data/0/value")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<f64>().ok())
            .context("fng value missing")
    }

    // -------------------------------------------------------------------------
    // Prediction-venue order books
    // -------------------------------------------------------------------------

    /// Mirror the venue books for `series` tickers and publish top-of-book
    /// summaries.  REST snapshots reseed the mirror each pass, so a delta
    /// gap detected elsewhere heals on the next refresh.
    pub async fn run_book_loop(
        self: Arc<Self>,
        venue: Arc<KalshiAdapter>,
        mirror: Arc<OrderBookMirror>,
        series: Vec<String>,
    ) {
        info!(count = series.len(), "order-book harvester starting");
        let mut sweep: u64 = 0;
        let mut last_depths: std::collections::HashMap<String, u64> =
            std::collections::HashMap::new();
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(BOOK_POLL_INTERVAL_SECS));
        loop {
            interval.tick().await;
            sweep += 1;

            let mut oi_map: std::collections::HashMap<String, u64> =
                std::collections::HashMap::new();

            for series_ticker in &series {
                let markets = match venue.list_open_markets(series_ticker).await {
                    Ok(m) => m,
                    Err(e) => {
                        debug!(series = %series_ticker, error = %e, "market list failed");
                        continue;
                    }
                };
                for market in markets.iter().take(3) {
                    oi_map.insert(market.ticker.clone(), market.open_interest);
                    match venue.get_orderbook(&market.ticker).await {
                        Ok((yes, no)) => {
                            mirror.apply_snapshot(&market.ticker, sweep, &yes, &no);
                            let Some(summary) = mirror.summary(&market.ticker) else {
                                continue;
                            };
                            let depth = summary.yes_depth + summary.no_depth;
                            let previous =
                                last_depths.insert(market.ticker.clone(), depth).unwrap_or(0);
                            if previous > 0 && depth >= liquidity_spike_floor(previous) {
                                self.bus
                                    .publish(
                                        keys::PREDICTION_LIQUIDITY_SPIKE,
                                        serde_json::json!({
                                            "ticker": summary.ticker,
                                            "depth": depth,
                                            "previous": previous,
                                        }),
                                        SOURCE,
                                        1.0,
                                    )
                                    .await;
                            }
                            self.bus
                                .publish(
                                    keys::PREDICTION_BOOK_SUMMARY,
                                    serde_json::to_value(&summary).unwrap_or_default(),
                                    SOURCE,
                                    1.0,
                                )
                                .await;
                        }
                        Err(e) => {
                            debug!(ticker = %market.ticker, error = %e, "book fetch failed")
                        }
                    }
                }
            }

            if !oi_map.is_empty() {
                self.bus
                    .publish(
                        keys::PREDICTION_OI,
                        serde_json::to_value(&oi_map).unwrap_or_default(),
                        SOURCE,
                        1.0,
                    )
                    .await;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn history_csv_parses_and_skips_bad_rows() {
        let raw = "Date,Open,High,Low,Close,Volume\n\
                   2026-07-30,100.0,101.5,99.5,101.0,1200000\n\
                   2026-07-31,101.0,102.0,100.0,101.5,900000\n\
                   not,a,real,row,at,all\n";
        let bars = parse_history_csv(raw);
        assert_eq!(bars.len(), 2);
        assert!((bars[0].close - 101.0).abs() < 1e-9);
        assert!((bars[1].volume - 900_000.0).abs() < 1e-9);
        assert!(bars[0].timestamp < bars[1].timestamp);
    }

    #[test]
    fn crypto_candles_parse_oldest_first() {
        // Wire order is newest first: [time, low, high, open, close, volume].
        let raw = serde_json::json!([
            [1_754_000_600, 49_900.0, 50_200.0, 50_000.0, 50_100.0, 12.5],
            [1_754_000_300, 49_800.0, 50_100.0, 49_900.0, 50_000.0, 8.0],
        ]);
        let bars = parse_crypto_candles(&raw);
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].timestamp, 1_754_000_300);
        assert!((bars[0].close - 50_000.0).abs() < 1e-9);
        assert!((bars[1].high - 50_200.0).abs() < 1e-9);
    }

    #[test]
    fn polling_hours_follow_the_eastern_session() {
        // Wednesday 2026-07-29, 12:00 ET (16:00 UTC in DST): inside.
        let midday = Utc.with_ymd_and_hms(2026, 7, 29, 16, 0, 0).unwrap();
        assert!(within_polling_hours(midday));
        // 02:00 ET: outside.
        let night = Utc.with_ymd_and_hms(2026, 7, 29, 6, 0, 0).unwrap();
        assert!(!within_polling_hours(night));
        // Saturday midday: outside.
        let weekend = Utc.with_ymd_and_hms(2026, 8, 1, 16, 0, 0).unwrap();
        assert!(!within_polling_hours(weekend));
    }

    #[test]
    fn liquidity_spike_is_three_times_prior_depth() {
        assert_eq!(liquidity_spike_floor(100), 300);
        assert!(299 < liquidity_spike_floor(100));
        assert_eq!(liquidity_spike_floor(u64::MAX), u64::MAX);
    }

    #[test]
    fn source_codes() {
        assert_eq!(history_source_code("SPY"), "spy.us");
        assert_eq!(history_source_code("^TNX"), "10usy.b");
        assert_eq!(history_source_code("^IRX"), "3musy.b");
        assert_eq!(history_source_code("^VIX"), "vix");
    }
}
