// =============================================================================
// Kalshi Adapter — RSA-PSS signed REST client for the prediction venue
// =============================================================================
//
// Every authenticated request signs `timestamp || method || path || body`
// with RSA-PSS (SHA-256 digest, salt length = digest length) and sends the
// base64 signature in the KALSHI-ACCESS-SIGNATURE header.
//
// Prices on this venue are integer cents in [1, 99]; this adapter exposes
// them as dollars in [0.01, 0.99] to match the rest of the engine.  Market
// orders use the price-99 sentinel the venue expects.
//
// SECURITY: the private key is loaded once at construction and never logged.
// =============================================================================

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::pss::Pss;
use rsa::RsaPrivateKey;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use async_trait::async_trait;

use crate::broker::{BrokerAdapter, BrokerError, OrderAck, OrderSide, OrderType};
use crate::types::VenuePosition;

/// Contracts are priced in cents; a mid-book fill assumption of 50c per
/// contract converts notional dollars to contract counts.
const ASSUMED_CONTRACT_COST: f64 = 0.50;

/// Price sentinel the venue uses for market orders.
const MARKET_ORDER_PRICE_CENTS: u32 = 99;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Venue market metadata, subset the engine cares about.
#[derive(Debug, Clone, Deserialize)]
pub struct KalshiMarket {
    pub ticker: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub yes_bid: u32,
    #[serde(default)]
    pub yes_ask: u32,
    #[serde(default)]
    pub open_interest: u64,
    #[serde(default)]
    pub status: String,
}

impl KalshiMarket {
    /// Best yes bid as dollars in [0, 0.99].
    pub fn yes_bid_dollars(&self) -> f64 {
        self.yes_bid as f64 / 100.0
    }
}

#[derive(Debug, Deserialize)]
struct MarketsResponse {
    #[serde(default)]
    markets: Vec<KalshiMarket>,
}

#[derive(Debug, Deserialize)]
struct MarketResponse {
    market: KalshiMarket,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    /// Account balance in cents.
    #[serde(default)]
    balance: i64,
}

#[derive(Debug, Deserialize)]
struct PositionsResponse {
    #[serde(default)]
    market_positions: Vec<MarketPosition>,
}

#[derive(Debug, Deserialize)]
struct MarketPosition {
    ticker: String,
    #[serde(default)]
    position: i64,
    #[serde(default)]
    market_exposure: i64,
}

#[derive(Debug, Deserialize)]
struct OrderbookResponse {
    orderbook: OrderbookLevels,
}

#[derive(Debug, Default, Deserialize)]
struct OrderbookLevels {
    #[serde(default)]
    yes: Vec<(u32, u32)>,
    #[serde(default)]
    no: Vec<(u32, u32)>,
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

pub struct KalshiAdapter {
    key_id: String,
    private_key: Option<RsaPrivateKey>,
    base_url: String,
    client: reqwest::Client,
}

impl KalshiAdapter {
    /// Build the adapter. A missing or unparsable key leaves the adapter in
    /// a degraded state where every authenticated call returns an Auth
    /// error; construction itself never fails so the supervisor can always
    /// wire the registry.
    pub fn new(key_id: impl Into<String>, private_key_pem: Option<&str>, demo: bool) -> Self {
        let private_key = private_key_pem.and_then(|pem| {
            RsaPrivateKey::from_pkcs8_pem(pem)
                .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
                .map_err(|e| warn!(error = %e, "kalshi private key unreadable"))
                .ok()
        });

        let base_url = if demo {
            "https://demo-api.kalshi.co/trade-api/v2".to_string()
        } else {
            "https://api.elections.kalshi.com/trade-api/v2".to_string()
        };

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            key_id: key_id.into(),
            private_key,
            base_url,
            client,
        }
    }

    /// Load the signing key from a PEM file on disk.
    pub fn from_key_file(key_id: impl Into<String>, path: &str, demo: bool) -> Self {
        let pem = std::fs::read_to_string(path)
            .map_err(|e| warn!(path, error = %e, "kalshi key file unreadable"))
            .ok();
        Self::new(key_id, pem.as_deref(), demo)
    }

    // -------------------------------------------------------------------------
    // Signing
    // -------------------------------------------------------------------------

    /// The exact preimage the venue verifies: timestamp, method, and the
    /// request path (including the API prefix), then the body for POSTs.
    fn sign_message(timestamp_ms: u64, method: &str, path: &str, body: &str) -> String {
        format!("{timestamp_ms}{method}{path}{body}")
    }

    fn auth_headers(
        &self,
        method: &str,
        path: &str,
        body: &str,
    ) -> Result<Vec<(&'static str, String)>, BrokerError> {
        let key = self
            .private_key
            .as_ref()
            .ok_or_else(|| BrokerError::Auth("kalshi private key not loaded".to_string()))?;

        let timestamp_ms = chrono::Utc::now().timestamp_millis() as u64;
        let msg = Self::sign_message(timestamp_ms, method, path, body);
        let digest = Sha256::digest(msg.as_bytes());

        let signature = key
            .sign_with_rng(&mut rand::thread_rng(), Pss::new::<Sha256>(), &digest)
            .map_err(|e| BrokerError::Auth(format!("RSA-PSS signing failed: {e}")))?;

        Ok(vec![
            ("KALSHI-ACCESS-KEY", self.key_id.clone()),
            ("KALSHI-ACCESS-SIGNATURE", BASE64.encode(signature)),
            ("KALSHI-ACCESS-TIMESTAMP", timestamp_ms.to_string()),
        ])
    }

    async fn signed_get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, BrokerError> {
        let headers = self.auth_headers("GET", &format!("/trade-api/v2{path}"), "")?;
        let mut req = self.client.get(format!("{}{}", self.base_url, path));
        for (k, v) in headers {
            req = req.header(k, v);
        }
        let resp = req.send().await?;
        Self::parse(resp).await
    }

    async fn signed_post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        payload: &serde_json::Value,
    ) -> Result<T, BrokerError> {
        // The signature covers the exact bytes sent as the body.
        let body = payload.to_string();
        let headers = self.auth_headers("POST", &format!("/trade-api/v2{path}"), &body)?;
        let mut req = self.client.post(format!("{}{}", self.base_url, path));
        for (k, v) in headers {
            req = req.header(k, v);
        }
        let resp = req
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await?;
        Self::parse(resp).await
    }

    async fn parse<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<T, BrokerError> {
        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(BrokerError::RateLimited);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BrokerError::Http {
                status: status.as_u16(),
                body,
            });
        }
        resp.json::<T>()
            .await
            .map_err(|e| BrokerError::Transport(format!("malformed venue response: {e}")))
    }

    // -------------------------------------------------------------------------
    // Market data (public + signed)
    // -------------------------------------------------------------------------

    /// Fetch one market's metadata (yes bid/ask in cents).
    pub async fn get_market(&self, ticker: &str) -> Result<KalshiMarket, BrokerError> {
        let resp: MarketResponse = self.signed_get(&format!("/markets/{ticker}")).await?;
        Ok(resp.market)
    }

    /// Open markets for a series (e.g. a weather-station high-temperature
    /// series).
    pub async fn list_open_markets(&self, series: &str) -> Result<Vec<KalshiMarket>, BrokerError> {
        let resp: MarketsResponse = self
            .signed_get(&format!("/markets?series_ticker={series}&status=open"))
            .await?;
        Ok(resp.markets)
    }

    /// Full order book for `ticker` as (yes, no) level lists in cents.
    pub async fn get_orderbook(
        &self,
        ticker: &str,
    ) -> Result<(Vec<(u32, u32)>, Vec<(u32, u32)>), BrokerError> {
        let resp: OrderbookResponse = self
            .signed_get(&format!("/markets/{ticker}/orderbook"))
            .await?;
        Ok((resp.orderbook.yes, resp.orderbook.no))
    }

    fn contracts_for(amount: f64) -> u32 {
        ((amount / ASSUMED_CONTRACT_COST) as u32).max(1)
    }

    async fn place(
        &self,
        ticker: &str,
        side: OrderSide,
        count: u32,
    ) -> Result<OrderAck, BrokerError> {
        let action = match side {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        };
        let payload = serde_json::json!({
            "ticker": ticker,
            "action": action,
            "type": "market",
            "count": count,
            "side": "yes",
            "yes_price": MARKET_ORDER_PRICE_CENTS,
        });

        #[derive(Deserialize)]
        struct OrderResponse {
            order: OrderBody,
        }
        #[derive(Deserialize)]
        struct OrderBody {
            order_id: String,
            #[serde(default)]
            status: String,
        }

        let resp: OrderResponse = self.signed_post("/portfolio/orders", &payload).await?;
        debug!(ticker, action, count, order_id = %resp.order.order_id, "kalshi order placed");
        Ok(OrderAck {
            id: resp.order.order_id,
            status: resp.order.status,
        })
    }
}

#[async_trait]
impl BrokerAdapter for KalshiAdapter {
    fn name(&self) -> &'static str {
        "kalshi"
    }

    async fn authenticate(&self) -> Result<(), BrokerError> {
        // A signed balance read both proves the key works and warms DNS.
        self.get_buying_power().await.map(|_| ())
    }

    async fn get_buying_power(&self) -> Result<f64, BrokerError> {
        let resp: BalanceResponse = self.signed_get("/portfolio/balance").await?;
        Ok(resp.balance as f64 / 100.0)
    }

    async fn get_positions(&self) -> Result<Vec<VenuePosition>, BrokerError> {
        let resp: PositionsResponse = self.signed_get("/portfolio/positions").await?;
        Ok(resp
            .market_positions
            .into_iter()
            .filter(|p| p.position != 0)
            .map(|p| VenuePosition {
                symbol: p.ticker,
                quantity: p.position as f64,
                market_value: p.market_exposure as f64 / 100.0,
                average_buy_price: 0.0,
            })
            .collect())
    }

    async fn get_latest_price(&self, symbol: &str) -> Result<f64, BrokerError> {
        let market = self.get_market(symbol).await?;
        Ok(market.yes_bid_dollars())
    }

    async fn submit_order(
        &self,
        symbol: &str,
        amount: f64,
        side: OrderSide,
        _order_type: OrderType,
        _limit_price: Option<f64>,
    ) -> Result<OrderAck, BrokerError> {
        self.place(symbol, side, Self::contracts_for(amount)).await
    }

    async fn submit_order_by_quantity(
        &self,
        symbol: &str,
        qty: f64,
        side: OrderSide,
        _order_type: OrderType,
        _limit_price: Option<f64>,
    ) -> Result<OrderAck, BrokerError> {
        self.place(symbol, side, (qty as u32).max(1)).await
    }

    async fn cancel_all_orders(&self) -> Result<(), BrokerError> {
        #[derive(Deserialize)]
        struct OrdersResponse {
            #[serde(default)]
            orders: Vec<RestingOrder>,
        }
        #[derive(Deserialize)]
        struct RestingOrder {
            order_id: String,
        }

        let resting: OrdersResponse = self.signed_get("/portfolio/orders?status=resting").await?;
        for order in resting.orders {
            let path = format!("/portfolio/orders/{}", order.order_id);
            let headers = self.auth_headers("DELETE", &format!("/trade-api/v2{path}"), "")?;
            let mut req = self.client.delete(format!("{}{}", self.base_url, path));
            for (k, v) in headers {
                req = req.header(k, v);
            }
            if let Err(e) = req.send().await {
                warn!(order_id = %order.order_id, error = %e, "cancel failed");
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for KalshiAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KalshiAdapter")
            .field("key_id", &self.key_id)
            .field("base_url", &self.base_url)
            .field("key_loaded", &self.private_key.is_some())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_message_concatenation_order() {
        let msg = KalshiAdapter::sign_message(
            1_740_000_000_123,
            "POST",
            "/trade-api/v2/portfolio/orders",
            "",
        );
        assert_eq!(msg, "1740000000123POST/trade-api/v2/portfolio/orders");
    }

    #[test]
    fn notional_to_contracts() {
        assert_eq!(KalshiAdapter::contracts_for(10.0), 20);
        assert_eq!(KalshiAdapter::contracts_for(0.10), 1); // floor of 1 contract
        assert_eq!(KalshiAdapter::contracts_for(0.75), 1);
    }

    #[test]
    fn yes_bid_converts_to_dollars() {
        let m = KalshiMarket {
            ticker: "KXTEST".to_string(),
            title: String::new(),
            yes_bid: 91,
            yes_ask: 93,
            open_interest: 0,
            status: "open".to_string(),
        };
        assert!((m.yes_bid_dollars() - 0.91).abs() < 1e-12);
    }

    #[test]
    fn adapter_without_key_reports_auth_error() {
        let adapter = KalshiAdapter::new("key-id", None, true);
        let err = adapter.auth_headers("GET", "/trade-api/v2/portfolio/balance", "");
        assert!(matches!(err, Err(BrokerError::Auth(_))));
    }

    #[test]
    fn markets_response_parses_with_missing_fields() {
        let raw = r#"{"markets": [{"ticker": "KXHIGHMIA-26AUG01", "yes_bid": 45}]}"#;
        let parsed: MarketsResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.markets.len(), 1);
        assert_eq!(parsed.markets[0].yes_bid, 45);
        assert_eq!(parsed.markets[0].yes_ask, 0);
    }
}
