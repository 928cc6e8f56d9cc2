// =============================================================================
// Market Data — shared OHLCV types and the tick substrate
// =============================================================================
//
// Harvesters poll external sources and append bars here; analyzers and the
// playbook observer read bounded windows back out.  Writes are latest-wins:
// a bar with the same timestamp as the current tail replaces it, so a
// harvester that outruns its consumers simply overwrites the freshest data
// instead of growing a queue.
// =============================================================================

pub mod orderbook;

pub use orderbook::{BookSide, BookSummary, OrderBookMirror};

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A single OHLCV bar. Oldest-first ordering is assumed everywhere bars
/// travel in slices.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    /// Bar open time, Unix epoch seconds.
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Identifies one bar series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SeriesKey {
    pub symbol: String,
    pub interval: String,
}

impl SeriesKey {
    pub fn new(symbol: &str, interval: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            interval: interval.to_string(),
        }
    }

    pub fn daily(symbol: &str) -> Self {
        Self::new(symbol, "1d")
    }
}

impl std::fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

// ---------------------------------------------------------------------------
// TickStore — bounded per-series ring buffer
// ---------------------------------------------------------------------------

/// Thread-safe bar store that retains the most recent `max_bars` bars per
/// series key.
pub struct TickStore {
    series: RwLock<HashMap<SeriesKey, VecDeque<Candle>>>,
    max_bars: usize,
}

impl TickStore {
    pub fn new(max_bars: usize) -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            max_bars,
        }
    }

    /// Insert `candle` at the tail of the series.
    ///
    /// If the tail bar carries the same timestamp the new bar replaces it
    /// (in-progress update from a re-poll); otherwise it is appended and the
    /// ring trimmed to `max_bars`.
    pub fn append(&self, key: SeriesKey, candle: Candle) {
        let mut map = self.series.write();
        let ring = map
            .entry(key)
            .or_insert_with(|| VecDeque::with_capacity(self.max_bars + 1));

        if let Some(last) = ring.back() {
            if last.timestamp == candle.timestamp {
                ring.pop_back();
            }
        }
        ring.push_back(candle);
        while ring.len() > self.max_bars {
            ring.pop_front();
        }
    }

    /// The most recent `count` bars for `key`, oldest first.
    pub fn bars(&self, key: &SeriesKey, count: usize) -> Vec<Candle> {
        let map = self.series.read();
        match map.get(key) {
            Some(ring) => {
                let skip = ring.len().saturating_sub(count);
                ring.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Closing prices for `key`, oldest first.
    pub fn closes(&self, key: &SeriesKey, count: usize) -> Vec<f64> {
        self.bars(key, count).iter().map(|c| c.close).collect()
    }

    /// Latest close for `key`, if any bar exists.
    pub fn latest_close(&self, key: &SeriesKey) -> Option<f64> {
        self.series
            .read()
            .get(key)
            .and_then(|ring| ring.back())
            .map(|c| c.close)
    }

    /// Every series key currently tracked.
    pub fn tracked(&self) -> Vec<SeriesKey> {
        self.series.read().keys().cloned().collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bar(ts: i64, close: f64) -> Candle {
        Candle {
            timestamp: ts,
            open: close,
            high: close,
            low: close,
            close,
            volume: 0.0,
        }
    }

    #[test]
    fn append_and_window() {
        let store = TickStore::new(5);
        let key = SeriesKey::daily("SPY");
        for i in 0..8 {
            store.append(key.clone(), bar(i, 100.0 + i as f64));
        }
        // Ring is capped at 5.
        let bars = store.bars(&key, 10);
        assert_eq!(bars.len(), 5);
        assert_eq!(bars[0].timestamp, 3);
        assert!((store.latest_close(&key).unwrap() - 107.0).abs() < 1e-12);
    }

    #[test]
    fn same_timestamp_overwrites_tail() {
        let store = TickStore::new(10);
        let key = SeriesKey::new("BTC-USD", "1m");
        store.append(key.clone(), bar(60, 50_000.0));
        store.append(key.clone(), bar(60, 50_100.0));
        let bars = store.bars(&key, 10);
        assert_eq!(bars.len(), 1);
        assert!((bars[0].close - 50_100.0).abs() < 1e-9);
    }

    #[test]
    fn missing_series_reads_empty() {
        let store = TickStore::new(10);
        let key = SeriesKey::daily("QQQ");
        assert!(store.bars(&key, 5).is_empty());
        assert!(store.latest_close(&key).is_none());
    }
}
