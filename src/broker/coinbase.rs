// =============================================================================
// Coinbase Adapter — HMAC-SHA256 signed REST client for the crypto venue
// =============================================================================
//
// Signed requests carry CB-ACCESS-KEY, CB-ACCESS-SIGN, and
// CB-ACCESS-TIMESTAMP headers.  The signature is an HMAC-SHA256 hex digest
// of `timestamp + method + request_path + body`.
//
// SECURITY: the secret key is used exclusively for signing and never logged.
// =============================================================================

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::debug;

use async_trait::async_trait;

use crate::broker::{BrokerAdapter, BrokerError, OrderAck, OrderSide, OrderType};
use crate::types::VenuePosition;

type HmacSha256 = Hmac<Sha256>;

pub struct CoinbaseAdapter {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AccountsResponse {
    #[serde(default)]
    accounts: Vec<Account>,
}

#[derive(Debug, Deserialize)]
struct Account {
    currency: String,
    available_balance: Balance,
}

#[derive(Debug, Deserialize)]
struct Balance {
    value: String,
}

#[derive(Debug, Deserialize)]
struct ProductResponse {
    price: String,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    order_id: String,
}

impl CoinbaseAdapter {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            base_url: "https://api.coinbase.com".to_string(),
            client,
        }
    }

    /// HMAC-SHA256 hex signature over `timestamp + method + path + body`.
    fn sign(&self, timestamp: i64, method: &str, path: &str, body: &str) -> String {
        let msg = format!("{timestamp}{method}{path}{body}");
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(msg.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn signed_request<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T, BrokerError> {
        let timestamp = chrono::Utc::now().timestamp();
        let body_str = body.as_ref().map(|b| b.to_string()).unwrap_or_default();
        let signature = self.sign(timestamp, method.as_str(), path, &body_str);

        let mut req = self
            .client
            .request(method, format!("{}{}", self.base_url, path))
            .header("CB-ACCESS-KEY", &self.api_key)
            .header("CB-ACCESS-SIGN", signature)
            .header("CB-ACCESS-TIMESTAMP", timestamp.to_string());
        if !body_str.is_empty() {
            req = req
                .header("Content-Type", "application/json")
                .body(body_str);
        }

        let resp = req.send().await?;
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

    async fn place(
        &self,
        symbol: &str,
        side: OrderSide,
        configuration: serde_json::Value,
    ) -> Result<OrderAck, BrokerError> {
        let payload = serde_json::json!({
            "client_order_id": uuid::Uuid::new_v4().to_string(),
            "product_id": symbol,
            "side": match side { OrderSide::Buy => "BUY", OrderSide::Sell => "SELL" },
            "order_configuration": configuration,
        });

        let resp: OrderResponse = self
            .signed_request(reqwest::Method::POST, "/api/v3/brokerage/orders", Some(payload))
            .await?;

        debug!(symbol, side = %side, order_id = %resp.order_id, "coinbase order placed");
        Ok(OrderAck {
            id: resp.order_id,
            status: if resp.success { "accepted" } else { "rejected" }.to_string(),
        })
    }
}

#[async_trait]
impl BrokerAdapter for CoinbaseAdapter {
    fn name(&self) -> &'static str {
        "coinbase"
    }

    async fn authenticate(&self) -> Result<(), BrokerError> {
        if self.api_key.is_empty() || self.secret.is_empty() {
            return Err(BrokerError::Auth("coinbase credentials missing".to_string()));
        }
        self.get_buying_power().await.map(|_| ())
    }

    async fn get_buying_power(&self) -> Result<f64, BrokerError> {
        let resp: AccountsResponse = self
            .signed_request(reqwest::Method::GET, "/api/v3/brokerage/accounts", None)
            .await?;
        let usd: f64 = resp
            .accounts
            .iter()
            .filter(|a| a.currency == "USD" || a.currency == "USDC")
            .filter_map(|a| a.available_balance.value.parse::<f64>().ok())
            .sum();
        Ok(usd)
    }

    async fn get_positions(&self) -> Result<Vec<VenuePosition>, BrokerError> {
        let resp: AccountsResponse = self
            .signed_request(reqwest::Method::GET, "/api/v3/brokerage/accounts", None)
            .await?;
        Ok(resp
            .accounts
            .into_iter()
            .filter(|a| a.currency != "USD" && a.currency != "USDC")
            .filter_map(|a| {
                let qty: f64 = a.available_balance.value.parse().ok()?;
                (qty > 0.0).then(|| VenuePosition {
                    symbol: format!("{}-USD", a.currency),
                    quantity: qty,
                    market_value: 0.0,
                    average_buy_price: 0.0,
                })
            })
            .collect())
    }

    async fn get_latest_price(&self, symbol: &str) -> Result<f64, BrokerError> {
        let resp: ProductResponse = self
            .signed_request(
                reqwest::Method::GET,
                &format!("/api/v3/brokerage/products/{symbol}"),
                None,
            )
            .await?;
        resp.price
            .parse::<f64>()
            .map_err(|_| BrokerError::InvalidQuote(symbol.to_string()))
    }

    async fn submit_order(
        &self,
        symbol: &str,
        amount: f64,
        side: OrderSide,
        order_type: OrderType,
        limit_price: Option<f64>,
    ) -> Result<OrderAck, BrokerError> {
        let configuration = match (order_type, limit_price) {
            (OrderType::Limit, Some(limit)) => {
                let base_size = amount / limit;
                serde_json::json!({
                    "limit_limit_gtc": {
                        "base_size": format!("{base_size:.8}"),
                        "limit_price": format!("{limit:.2}"),
                    }
                })
            }
            _ => serde_json::json!({
                "market_market_ioc": { "quote_size": format!("{amount:.2}") }
            }),
        };
        self.place(symbol, side, configuration).await
    }

    async fn submit_order_by_quantity(
        &self,
        symbol: &str,
        qty: f64,
        side: OrderSide,
        order_type: OrderType,
        limit_price: Option<f64>,
    ) -> Result<OrderAck, BrokerError> {
        let configuration = match (order_type, limit_price) {
            (OrderType::Limit, Some(limit)) => serde_json::json!({
                "limit_limit_gtc": {
                    "base_size": format!("{qty:.8}"),
                    "limit_price": format!("{limit:.2}"),
                }
            }),
            _ => serde_json::json!({
                "market_market_ioc": { "base_size": format!("{qty:.8}") }
            }),
        };
        self.place(symbol, side, configuration).await
    }

    async fn cancel_all_orders(&self) -> Result<(), BrokerError> {
        #[derive(Deserialize)]
        struct OpenOrders {
            #[serde(default)]
            orders: Vec<OpenOrder>,
        }
        #[derive(Deserialize)]
        struct OpenOrder {
            order_id: String,
        }

        let open: OpenOrders = self
            .signed_request(
                reqwest::Method::GET,
                "/api/v3/brokerage/orders/historical/batch?order_status=OPEN",
                None,
            )
            .await?;

        if open.orders.is_empty() {
            return Ok(());
        }
        let ids: Vec<String> = open.orders.into_iter().map(|o| o.order_id).collect();
        let _: serde_json::Value = self
            .signed_request(
                reqwest::Method::POST,
                "/api/v3/brokerage/orders/batch_cancel",
                Some(serde_json::json!({ "order_ids": ids })),
            )
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for CoinbaseAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoinbaseAdapter")
            .field("base_url", &self.base_url)
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
    fn signature_is_stable_hex() {
        let adapter = CoinbaseAdapter::new("key", "secret");
        let a = adapter.sign(1_740_000_000, "GET", "/api/v3/brokerage/accounts", "");
        let b = adapter.sign(1_740_000_000, "GET", "/api/v3/brokerage/accounts", "");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn signature_covers_body() {
        let adapter = CoinbaseAdapter::new("key", "secret");
        let without = adapter.sign(1, "POST", "/api/v3/brokerage/orders", "");
        let with = adapter.sign(1, "POST", "/api/v3/brokerage/orders", "{\"a\":1}");
        assert_ne!(without, with);
    }

    #[test]
    fn accounts_parse_and_sum_usd() {
        let raw = r#"{"accounts": [
            {"currency": "USD",  "available_balance": {"value": "120.50"}},
            {"currency": "USDC", "available_balance": {"value": "10.00"}},
            {"currency": "BTC",  "available_balance": {"value": "0.05"}}
        ]}"#;
        let parsed: AccountsResponse = serde_json::from_str(raw).unwrap();
        let usd: f64 = parsed
            .accounts
            .iter()
            .filter(|a| a.currency == "USD" || a.currency == "USDC")
            .filter_map(|a| a.available_balance.value.parse::<f64>().ok())
            .sum();
        assert!((usd - 130.50).abs() < 1e-9);
    }
}
