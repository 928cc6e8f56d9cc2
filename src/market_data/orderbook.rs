// =============================================================================
// Order Book Mirror — local reconstruction of prediction-market books
// =============================================================================
//
// Protocol:
//   1. Subscribe with an initial snapshot request.
//   2. Snapshot initialises the local yes/no sides and the expected seq.
//   3. Deltas apply sequentially; each advances the expected seq by one.
//   4. A seq gap invalidates local state — apply_delta returns false and the
//      caller must re-subscribe for a fresh snapshot.
//
// Prices are integer cents in [1, 99].  Best bid is the top of the yes side;
// best ask is 100 minus the top of the no side (prediction-market
// convention).
// =============================================================================

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookSide {
    Yes,
    No,
}

/// Top-of-book summary, cached on every mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BookSummary {
    pub ticker: String,
    /// Highest yes price level, cents.
    pub best_bid: Option<u32>,
    /// 100 − highest no price level, cents.
    pub best_ask: Option<u32>,
    pub yes_depth: u64,
    pub no_depth: u64,
    pub last_seq: u64,
}

#[derive(Default)]
struct BookState {
    /// price_cents → quantity, one entry per price level.
    yes: BTreeMap<u32, u32>,
    no: BTreeMap<u32, u32>,
    /// Next delta seq we will accept; `None` until a snapshot arrives.
    expected_seq: Option<u64>,
    last_seq: u64,
}

impl BookState {
    fn side_mut(&mut self, side: BookSide) -> &mut BTreeMap<u32, u32> {
        match side {
            BookSide::Yes => &mut self.yes,
            BookSide::No => &mut self.no,
        }
    }
}

/// Maintains local mirrors of venue order books for multiple tickers.
pub struct OrderBookMirror {
    books: RwLock<HashMap<String, BookState>>,
}

impl OrderBookMirror {
    pub fn new() -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Snapshot
    // -------------------------------------------------------------------------

    /// Replace the book for `ticker` with a full snapshot at `seq`.
    ///
    /// Levels are `(price_cents, quantity)` pairs; zero-quantity levels are
    /// ignored. The next accepted delta seq becomes `seq + 1`.
    pub fn apply_snapshot(
        &self,
        ticker: &str,
        seq: u64,
        yes_levels: &[(u32, u32)],
        no_levels: &[(u32, u32)],
    ) {
        let mut books = self.books.write();
        let state = books.entry(ticker.to_string()).or_default();

        state.yes = yes_levels
            .iter()
            .filter(|(_, q)| *q > 0)
            .copied()
            .collect();
        state.no = no_levels.iter().filter(|(_, q)| *q > 0).copied().collect();
        state.expected_seq = Some(seq + 1);
        state.last_seq = seq;

        debug!(
            ticker,
            seq,
            yes_levels = state.yes.len(),
            no_levels = state.no.len(),
            "orderbook snapshot applied"
        );
    }

    // -------------------------------------------------------------------------
    // Delta
    // -------------------------------------------------------------------------

    /// Apply one incremental update.
    ///
    /// Returns `false` on a sequence gap (or when no snapshot has been
    /// received): local state is invalidated and the caller must
    /// re-subscribe for a fresh snapshot before trusting this book again.
    pub fn apply_delta(
        &self,
        ticker: &str,
        seq: u64,
        side: BookSide,
        price_cents: u32,
        delta: i64,
    ) -> bool {
        let mut books = self.books.write();
        let Some(state) = books.get_mut(ticker) else {
            warn!(ticker, seq, "delta before snapshot — re-snapshot needed");
            return false;
        };

        match state.expected_seq {
            Some(expected) if seq == expected => {}
            Some(expected) => {
                warn!(
                    ticker,
                    expected, got = seq, "orderbook seq gap — re-snapshot needed"
                );
                // Discard stale expectation so the next snapshot reinitialises.
                state.expected_seq = None;
                return false;
            }
            None => {
                warn!(ticker, seq, "delta with invalidated book — re-snapshot needed");
                return false;
            }
        }

        let book = state.side_mut(side);
        let current = *book.get(&price_cents).unwrap_or(&0) as i64;
        let updated = current + delta;
        if updated > 0 {
            book.insert(price_cents, updated as u32);
        } else {
            book.remove(&price_cents);
        }

        state.expected_seq = Some(seq + 1);
        state.last_seq = seq;
        true
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Highest yes level = best bid, cents.
    pub fn best_bid(&self, ticker: &str) -> Option<u32> {
        self.books
            .read()
            .get(ticker)?
            .yes
            .keys()
            .next_back()
            .copied()
    }

    /// 100 − highest no level = best ask, cents.
    pub fn best_ask(&self, ticker: &str) -> Option<u32> {
        let books = self.books.read();
        let top_no = books.get(ticker)?.no.keys().next_back().copied()?;
        Some(100 - top_no)
    }

    /// Total contracts resting across every level of one side.
    pub fn total_depth(&self, ticker: &str, side: BookSide) -> u64 {
        let books = self.books.read();
        let Some(state) = books.get(ticker) else {
            return 0;
        };
        let book = match side {
            BookSide::Yes => &state.yes,
            BookSide::No => &state.no,
        };
        book.values().map(|q| *q as u64).sum()
    }

    /// Whether this book is currently in sync (snapshot received, no gap).
    pub fn is_synced(&self, ticker: &str) -> bool {
        self.books
            .read()
            .get(ticker)
            .map(|s| s.expected_seq.is_some())
            .unwrap_or(false)
    }

    /// Serialisable top-of-book summary for the bus.
    pub fn summary(&self, ticker: &str) -> Option<BookSummary> {
        let books = self.books.read();
        let state = books.get(ticker)?;
        Some(BookSummary {
            ticker: ticker.to_string(),
            best_bid: state.yes.keys().next_back().copied(),
            best_ask: state.no.keys().next_back().map(|n| 100 - n),
            yes_depth: state.yes.values().map(|q| *q as u64).sum(),
            no_depth: state.no.values().map(|q| *q as u64).sum(),
            last_seq: state.last_seq,
        })
    }
}

impl Default for OrderBookMirror {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_sets_bbo_by_convention() {
        let mirror = OrderBookMirror::new();
        mirror.apply_snapshot("KXTEST-26", 100, &[(45, 100), (44, 50)], &[(52, 80)]);

        // Best bid = top yes level; best ask = 100 − top no level.
        assert_eq!(mirror.best_bid("KXTEST-26"), Some(45));
        assert_eq!(mirror.best_ask("KXTEST-26"), Some(48));
        assert_eq!(mirror.total_depth("KXTEST-26", BookSide::Yes), 150);
        assert_eq!(mirror.total_depth("KXTEST-26", BookSide::No), 80);
    }

    #[test]
    fn sequential_deltas_apply() {
        let mirror = OrderBookMirror::new();
        mirror.apply_snapshot("T", 10, &[(40, 10)], &[]);

        assert!(mirror.apply_delta("T", 11, BookSide::Yes, 41, 25));
        assert!(mirror.apply_delta("T", 12, BookSide::Yes, 40, -10));

        assert_eq!(mirror.best_bid("T"), Some(41));
        assert_eq!(mirror.total_depth("T", BookSide::Yes), 25);
    }

    #[test]
    fn seq_gap_invalidates_state() {
        let mirror = OrderBookMirror::new();
        mirror.apply_snapshot("T", 100, &[(45, 100)], &[]);

        // Expected 101, got 102 — gap.
        assert!(!mirror.apply_delta("T", 102, BookSide::Yes, 45, 10));
        assert!(!mirror.is_synced("T"));

        // Even the previously-expected seq is refused now.
        assert!(!mirror.apply_delta("T", 101, BookSide::Yes, 45, 10));

        // A fresh snapshot resynchronises.
        mirror.apply_snapshot("T", 200, &[(46, 30)], &[]);
        assert!(mirror.is_synced("T"));
        assert!(mirror.apply_delta("T", 201, BookSide::Yes, 46, 5));
    }

    #[test]
    fn snapshot_plus_deltas_equals_fresh_snapshot() {
        let with_deltas = OrderBookMirror::new();
        with_deltas.apply_snapshot("T", 1, &[(40, 10), (42, 5)], &[(55, 7)]);
        assert!(with_deltas.apply_delta("T", 2, BookSide::Yes, 42, -5));
        assert!(with_deltas.apply_delta("T", 3, BookSide::No, 55, 3));
        assert!(with_deltas.apply_delta("T", 4, BookSide::Yes, 44, 20));

        let fresh = OrderBookMirror::new();
        fresh.apply_snapshot("T", 4, &[(40, 10), (44, 20)], &[(55, 10)]);

        let a = with_deltas.summary("T").unwrap();
        let b = fresh.summary("T").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn delta_to_zero_removes_level() {
        let mirror = OrderBookMirror::new();
        mirror.apply_snapshot("T", 1, &[(40, 10)], &[]);
        assert!(mirror.apply_delta("T", 2, BookSide::Yes, 40, -10));
        assert_eq!(mirror.best_bid("T"), None);
    }

    #[test]
    fn delta_before_snapshot_is_refused() {
        let mirror = OrderBookMirror::new();
        assert!(!mirror.apply_delta("T", 1, BookSide::Yes, 40, 10));
    }
}
