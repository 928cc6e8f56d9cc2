// =============================================================================
// Broker Layer — uniform venue interface, smart-limit orders, routing
// =============================================================================
//
// Every venue adapter implements `BrokerAdapter`.  Adapters are stateful
// (session tokens, signing keys) and single-threaded internally; the router
// holds one instance per venue.
// =============================================================================

pub mod alpaca;
pub mod coinbase;
pub mod kalshi;
pub mod router;

pub use router::BrokerRouter;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::VenuePosition;

/// Seconds waited before the single rate-limit retry.
const RATE_LIMIT_RETRY_DELAY_SECS: u64 = 5;

// ---------------------------------------------------------------------------
// Order primitives
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

/// Venue acknowledgement of a submitted order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub id: String,
    pub status: String,
}

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("rate limited (HTTP 429)")]
    RateLimited,
    #[error("venue returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid quote for {0}")]
    InvalidQuote(String),
    #[error("bracket orders unsupported by {0}")]
    BracketsUnsupported(String),
}

impl From<reqwest::Error> for BrokerError {
    fn from(e: reqwest::Error) -> Self {
        if e.status().map(|s| s.as_u16()) == Some(429) {
            Self::RateLimited
        } else {
            Self::Transport(e.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Adapter contract
// ---------------------------------------------------------------------------

/// Uniform interface across venues: auth, quotes, positions, submission.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    /// Stable adapter name used by the router and the ledger's Broker column.
    fn name(&self) -> &'static str;

    /// Idempotent; may cache a session.
    async fn authenticate(&self) -> Result<(), BrokerError>;

    async fn get_buying_power(&self) -> Result<f64, BrokerError>;

    async fn get_positions(&self) -> Result<Vec<VenuePosition>, BrokerError>;

    async fn get_latest_price(&self, symbol: &str) -> Result<f64, BrokerError>;

    /// Submit by notional dollar amount.
    async fn submit_order(
        &self,
        symbol: &str,
        amount: f64,
        side: OrderSide,
        order_type: OrderType,
        limit_price: Option<f64>,
    ) -> Result<OrderAck, BrokerError>;

    /// Submit by unit quantity (shares / contracts).
    async fn submit_order_by_quantity(
        &self,
        symbol: &str,
        qty: f64,
        side: OrderSide,
        order_type: OrderType,
        limit_price: Option<f64>,
    ) -> Result<OrderAck, BrokerError>;

    async fn cancel_all_orders(&self) -> Result<(), BrokerError>;

    /// Venues with native OCO/bracket support override both of these.
    fn supports_brackets(&self) -> bool {
        false
    }

    async fn submit_bracket_order(
        &self,
        _symbol: &str,
        _amount: f64,
        _side: OrderSide,
        _take_profit: f64,
        _stop_loss: f64,
    ) -> Result<OrderAck, BrokerError> {
        Err(BrokerError::BracketsUnsupported(self.name().to_string()))
    }
}

// ---------------------------------------------------------------------------
// Smart-limit construction
// ---------------------------------------------------------------------------

/// Marketable-limit price: slightly through the current quote so the order
/// fills like a market order but with bounded slippage.
pub fn smart_limit_price(current_price: f64, side: OrderSide, max_slippage_pct: f64) -> f64 {
    let slip = max_slippage_pct / 100.0;
    let raw = match side {
        OrderSide::Buy => current_price * (1.0 + slip),
        OrderSide::Sell => current_price * (1.0 - slip),
    };
    (raw * 1000.0).round() / 1000.0
}

/// Translate percentage TP/SL rules into absolute bracket prices at entry.
pub fn bracket_prices(entry_price: f64, take_profit_pct: f64, stop_loss_pct: f64) -> (f64, f64) {
    let tp = entry_price * (1.0 + take_profit_pct / 100.0);
    let sl = entry_price * (1.0 - stop_loss_pct / 100.0);
    (tp, sl)
}

/// Submit a smart-limit order through `adapter`.
///
/// Fetches the live quote, prices the limit through it by
/// `max_slippage_pct`, and submits.  A rate-limit rejection is retried
/// exactly once after a 5-second delay; any further failure surfaces to the
/// caller.  Returns the ack together with the quote used for pricing.
pub async fn submit_smart_order(
    adapter: &dyn BrokerAdapter,
    symbol: &str,
    side: OrderSide,
    amount: f64,
    max_slippage_pct: f64,
) -> Result<(OrderAck, f64), BrokerError> {
    let current_price = adapter.get_latest_price(symbol).await?;
    if current_price <= 0.0 {
        return Err(BrokerError::InvalidQuote(symbol.to_string()));
    }

    let limit_price = smart_limit_price(current_price, side, max_slippage_pct);
    info!(
        symbol,
        side = %side,
        current_price,
        limit_price,
        "smart limit order"
    );

    let first = adapter
        .submit_order(symbol, amount, side, OrderType::Limit, Some(limit_price))
        .await;

    match first {
        Err(BrokerError::RateLimited) => {
            warn!(symbol, "venue rate limit hit — retrying once in {RATE_LIMIT_RETRY_DELAY_SECS}s");
            tokio::time::sleep(std::time::Duration::from_secs(RATE_LIMIT_RETRY_DELAY_SECS)).await;
            let ack = adapter
                .submit_order(symbol, amount, side, OrderType::Limit, Some(limit_price))
                .await?;
            Ok((ack, current_price))
        }
        Err(e) => Err(e),
        Ok(ack) => Ok((ack, current_price)),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn smart_limit_prices_through_the_quote() {
        // 0.5% default slippage.
        assert!((smart_limit_price(100.0, OrderSide::Buy, 0.5) - 100.5).abs() < 1e-9);
        assert!((smart_limit_price(100.0, OrderSide::Sell, 0.5) - 99.5).abs() < 1e-9);
        // Rounded to 3 decimal places.
        assert!((smart_limit_price(33.333, OrderSide::Buy, 0.5) - 33.5).abs() < 1e-3);
    }

    #[test]
    fn bracket_translation() {
        let (tp, sl) = bracket_prices(200.0, 10.0, 5.0);
        assert!((tp - 220.0).abs() < 1e-9);
        assert!((sl - 190.0).abs() < 1e-9);
    }

    /// Adapter that rate-limits the first N submissions.
    struct FlakyAdapter {
        failures_left: AtomicU32,
        submissions: AtomicU32,
    }

    #[async_trait]
    impl BrokerAdapter for FlakyAdapter {
        fn name(&self) -> &'static str {
            "flaky"
        }
        async fn authenticate(&self) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn get_buying_power(&self) -> Result<f64, BrokerError> {
            Ok(1000.0)
        }
        async fn get_positions(&self) -> Result<Vec<VenuePosition>, BrokerError> {
            Ok(Vec::new())
        }
        async fn get_latest_price(&self, _symbol: &str) -> Result<f64, BrokerError> {
            Ok(50.0)
        }
        async fn submit_order(
            &self,
            _symbol: &str,
            _amount: f64,
            _side: OrderSide,
            _order_type: OrderType,
            _limit_price: Option<f64>,
        ) -> Result<OrderAck, BrokerError> {
            self.submissions.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(BrokerError::RateLimited);
            }
            Ok(OrderAck {
                id: "1".to_string(),
                status: "accepted".to_string(),
            })
        }
        async fn submit_order_by_quantity(
            &self,
            symbol: &str,
            qty: f64,
            side: OrderSide,
            order_type: OrderType,
            limit_price: Option<f64>,
        ) -> Result<OrderAck, BrokerError> {
            self.submit_order(symbol, qty, side, order_type, limit_price)
                .await
        }
        async fn cancel_all_orders(&self) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_retries_exactly_once() {
        let adapter = FlakyAdapter {
            failures_left: AtomicU32::new(1),
            submissions: AtomicU32::new(0),
        };
        let res = submit_smart_order(&adapter, "AAPL", OrderSide::Buy, 100.0, 0.5).await;
        assert!(res.is_ok());
        assert_eq!(adapter.submissions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn second_rate_limit_surfaces() {
        let adapter = FlakyAdapter {
            failures_left: AtomicU32::new(2),
            submissions: AtomicU32::new(0),
        };
        let res = submit_smart_order(&adapter, "AAPL", OrderSide::Buy, 100.0, 0.5).await;
        assert!(matches!(res, Err(BrokerError::RateLimited)));
        assert_eq!(adapter.submissions.load(Ordering::SeqCst), 2);
    }
}
