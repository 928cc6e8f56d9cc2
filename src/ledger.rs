// =============================================================================
// Ledger — append-only trade record with FIFO position reconstruction
// =============================================================================
//
// Storage is a headered CSV file (Date, Action, Ticker, Price, Quantity,
// Reason, Est_Tax_Impact, Broker).  Rows are only ever appended; the open
// position for a ticker is the residual of all BUY lots after matching SELL
// quantity against the oldest lots first.
//
// Appends are serialised behind a mutex — the ledger is single-writer per
// process.  A full replay from an empty state reproduces the position map
// exactly.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Quantities below this are floating-point ghosts, not positions.
pub const DUST_EPSILON: f64 = 1e-6;

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

// ---------------------------------------------------------------------------
// Row model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerAction {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl std::fmt::Display for LedgerAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// One executed trade, as persisted to the CSV.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    #[serde(rename = "Date")]
    pub date: String,
    #[serde(rename = "Action")]
    pub action: LedgerAction,
    #[serde(rename = "Ticker")]
    pub ticker: String,
    #[serde(rename = "Price")]
    pub price: f64,
    #[serde(rename = "Quantity")]
    pub quantity: f64,
    #[serde(rename = "Reason")]
    pub reason: String,
    #[serde(rename = "Est_Tax_Impact")]
    pub est_tax_impact: f64,
    #[serde(rename = "Broker")]
    pub broker: String,
}

impl LedgerEntry {
    /// Build an entry stamped with the current UTC time.
    pub fn now(
        action: LedgerAction,
        ticker: &str,
        price: f64,
        quantity: f64,
        reason: &str,
        est_tax_impact: f64,
        broker: &str,
    ) -> Self {
        Self {
            date: Utc::now().format(DATE_FORMAT).to_string(),
            action,
            ticker: ticker.to_string(),
            price,
            quantity,
            reason: reason.to_string(),
            est_tax_impact,
            broker: broker.to_string(),
        }
    }

    /// Parse the row's timestamp. Rows written by this process always parse;
    /// hand-edited rows that do not are treated as very old.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        NaiveDateTime::parse_from_str(&self.date, DATE_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }
}

/// FIFO-derived view of one ticker's holdings.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OpenPosition {
    pub shares_held: f64,
    pub cost_basis: f64,
    pub avg_price: f64,
}

/// Aggregate performance over recent closed trades.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceStats {
    pub total_sells: usize,
    pub win_rate: f64,
    pub realized_pnl: f64,
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

pub struct Ledger {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl Ledger {
    /// Open (creating with headers if necessary) the ledger at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("failed to create ledger directory {}", parent.display())
                    })?;
                }
            }
            let file = std::fs::File::create(&path)
                .with_context(|| format!("failed to create ledger at {}", path.display()))?;
            let mut wtr = csv::Writer::from_writer(file);
            wtr.write_record([
                "Date",
                "Action",
                "Ticker",
                "Price",
                "Quantity",
                "Reason",
                "Est_Tax_Impact",
                "Broker",
            ])
            .context("failed to write ledger header")?;
            wtr.flush()?;
            info!(path = %path.display(), "created new ledger");
        }

        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    // -------------------------------------------------------------------------
    // Append
    // -------------------------------------------------------------------------

    /// Append one entry.
    ///
    /// Rejects negative quantities and SELLs that exceed the currently held
    /// FIFO residual for the ticker.
    pub fn append(&self, entry: &LedgerEntry) -> Result<()> {
        if entry.quantity < 0.0 || entry.price < 0.0 {
            bail!("ledger rejects negative quantity/price for {}", entry.ticker);
        }

        let _guard = self.write_lock.lock();

        if entry.action == LedgerAction::Sell {
            let held = self
                .open_positions()?
                .get(&entry.ticker)
                .map(|p| p.shares_held)
                .unwrap_or(0.0);
            if entry.quantity > held + DUST_EPSILON {
                bail!(
                    "SELL {} of {} exceeds held quantity {:.6}",
                    entry.quantity,
                    entry.ticker,
                    held
                );
            }
        }

        let file = std::fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open ledger {}", self.path.display()))?;
        let mut wtr = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        wtr.serialize(entry).context("failed to append ledger row")?;
        wtr.flush()?;

        info!(
            action = %entry.action,
            ticker = %entry.ticker,
            price = entry.price,
            quantity = entry.quantity,
            broker = %entry.broker,
            "ledger updated"
        );
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// All rows, oldest first.
    pub fn entries(&self) -> Result<Vec<LedgerEntry>> {
        let mut rdr = csv::Reader::from_path(&self.path)
            .with_context(|| format!("failed to read ledger {}", self.path.display()))?;
        let mut out = Vec::new();
        for row in rdr.deserialize::<LedgerEntry>() {
            out.push(row.context("malformed ledger row")?);
        }
        Ok(out)
    }

    /// FIFO reconstruction of every open position.
    pub fn open_positions(&self) -> Result<HashMap<String, OpenPosition>> {
        Ok(reconstruct(&self.entries()?).positions)
    }

    pub fn has_position(&self, ticker: &str) -> bool {
        self.open_positions()
            .map(|p| p.contains_key(ticker))
            .unwrap_or(false)
    }

    pub fn average_buy_price(&self, ticker: &str) -> Option<f64> {
        self.open_positions().ok()?.get(ticker).map(|p| p.avg_price)
    }

    pub fn quantity_held(&self, ticker: &str) -> f64 {
        self.open_positions()
            .ok()
            .and_then(|p| p.get(ticker).map(|p| p.shares_held))
            .unwrap_or(0.0)
    }

    /// The most recent `limit` trades, newest first.
    pub fn trade_history(&self, limit: usize) -> Result<Vec<LedgerEntry>> {
        let mut entries = self.entries()?;
        let start = entries.len().saturating_sub(limit);
        let mut recent: Vec<LedgerEntry> = entries.drain(start..).collect();
        recent.reverse();
        Ok(recent)
    }

    /// Total realized PnL across the full ledger (FIFO matching).
    pub fn realized_pnl(&self) -> Result<f64> {
        Ok(reconstruct(&self.entries()?).realized_pnl)
    }

    /// Timestamp of the most recent loss-labelled SELL of `ticker`, if any.
    ///
    /// Used by the wash-sale guard: a "loss-labelled" row is a SELL whose
    /// reason names a stop loss.
    pub fn last_loss_sale(&self, ticker: &str) -> Option<DateTime<Utc>> {
        let entries = self.entries().ok()?;
        entries
            .iter()
            .rev()
            .find(|e| {
                e.action == LedgerAction::Sell
                    && e.ticker == ticker
                    && e.reason.to_lowercase().contains("stop loss")
            })
            .and_then(|e| e.timestamp())
    }

    /// Fractional returns of each SELL vs its FIFO cost, newest last.
    /// Feeds the playbook's CVaR snapshot.
    pub fn closed_trade_returns(&self) -> Result<Vec<f64>> {
        Ok(reconstruct(&self.entries()?).sell_returns)
    }

    /// Win rate and realized PnL over the most recent `limit` SELLs.
    pub fn performance_stats(&self, limit: usize) -> Result<PerformanceStats> {
        let replay = reconstruct(&self.entries()?);
        let recent: Vec<f64> = replay
            .sell_returns
            .iter()
            .rev()
            .take(limit)
            .copied()
            .collect();
        let total_sells = recent.len();
        let wins = recent.iter().filter(|r| **r > 0.0).count();
        Ok(PerformanceStats {
            total_sells,
            win_rate: if total_sells > 0 {
                wins as f64 / total_sells as f64
            } else {
                0.0
            },
            realized_pnl: replay.realized_pnl,
        })
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger").field("path", &self.path).finish()
    }
}

// ---------------------------------------------------------------------------
// FIFO replay
// ---------------------------------------------------------------------------

struct Replay {
    positions: HashMap<String, OpenPosition>,
    realized_pnl: f64,
    /// (sell_price / lot_cost − 1) per SELL, chronological.
    sell_returns: Vec<f64>,
}

/// Replay `entries` chronologically, matching SELLs against the oldest BUY
/// lots and splitting the last consumed lot when partially filled.
fn reconstruct(entries: &[LedgerEntry]) -> Replay {
    use std::collections::VecDeque;

    let mut lots: HashMap<String, VecDeque<(f64, f64)>> = HashMap::new();
    let mut realized_pnl = 0.0;
    let mut sell_returns = Vec::new();

    for entry in entries {
        let queue = lots.entry(entry.ticker.clone()).or_default();
        match entry.action {
            LedgerAction::Buy => queue.push_back((entry.quantity, entry.price)),
            LedgerAction::Sell => {
                let mut remaining = entry.quantity;
                let mut consumed_cost = 0.0;
                let mut consumed_qty = 0.0;
                while remaining > DUST_EPSILON {
                    let Some(front) = queue.front_mut() else {
                        break; // oversell: ignore the unmatched remainder
                    };
                    let take = front.0.min(remaining);
                    realized_pnl += (entry.price - front.1) * take;
                    consumed_cost += front.1 * take;
                    consumed_qty += take;
                    front.0 -= take;
                    remaining -= take;
                    if front.0 <= DUST_EPSILON {
                        queue.pop_front();
                    }
                }
                if consumed_qty > DUST_EPSILON && consumed_cost > 0.0 {
                    let avg_cost = consumed_cost / consumed_qty;
                    sell_returns.push(entry.price / avg_cost - 1.0);
                }
            }
        }
    }

    let mut positions = HashMap::new();
    for (ticker, queue) in lots {
        let shares_held: f64 = queue.iter().map(|(q, _)| q).sum();
        if shares_held > DUST_EPSILON {
            let cost_basis: f64 = queue.iter().map(|(q, p)| q * p).sum();
            positions.insert(
                ticker,
                OpenPosition {
                    shares_held,
                    cost_basis,
                    avg_price: cost_basis / shares_held,
                },
            );
        }
    }

    Replay {
        positions,
        realized_pnl,
        sell_returns,
    }
}
