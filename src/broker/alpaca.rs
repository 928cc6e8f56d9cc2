// =============================================================================
// Alpaca Adapter — primary equity venue with native bracket orders
// =============================================================================
//
// Auth is header-based (APCA-API-KEY-ID / APCA-API-SECRET-KEY).  Trading
// endpoints live on the trading host, quotes on the data host.  Extended
// hours are allowed on limit orders so the router can send pre/post-market
// flow here when no dedicated extended-hours venue is configured.
// =============================================================================

use serde::Deserialize;
use tracing::debug;

use async_trait::async_trait;

use crate::broker::{BrokerAdapter, BrokerError, OrderAck, OrderSide, OrderType};
use crate::types::VenuePosition;

pub struct AlpacaAdapter {
    api_key: String,
    secret: String,
    trading_url: String,
    data_url: String,
    client: reqwest::Client,
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AccountResponse {
    buying_power: String,
}

#[derive(Debug, Deserialize)]
struct PositionRow {
    symbol: String,
    qty: String,
    #[serde(default)]
    market_value: String,
    #[serde(default)]
    avg_entry_price: String,
}

#[derive(Debug, Deserialize)]
struct LatestTradeResponse {
    trade: LatestTrade,
}

#[derive(Debug, Deserialize)]
struct LatestTrade {
    #[serde(rename = "p")]
    price: f64,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    id: String,
    status: String,
}

impl AlpacaAdapter {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, paper: bool) -> Self {
        let trading_url = if paper {
            "https://paper-api.alpaca.markets".to_string()
        } else {
            "https://api.alpaca.markets".to_string()
        };

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            trading_url,
            data_url: "https://data.alpaca.markets".to_string(),
            client,
        }
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("APCA-API-KEY-ID", &self.api_key)
            .header("APCA-API-SECRET-KEY", &self.secret)
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

    async fn post_order(&self, payload: serde_json::Value) -> Result<OrderAck, BrokerError> {
        let resp = self
            .authed(self.client.post(format!("{}/v2/orders", self.trading_url)))
            .json(&payload)
            .send()
            .await?;
        let order: OrderResponse = Self::parse(resp).await?;
        debug!(order_id = %order.id, status = %order.status, "alpaca order placed");
        Ok(OrderAck {
            id: order.id,
            status: order.status,
        })
    }
}

#[async_trait]
impl BrokerAdapter for AlpacaAdapter {
    fn name(&self) -> &'static str {
        "alpaca"
    }

    async fn authenticate(&self) -> Result<(), BrokerError> {
        if self.api_key.is_empty() || self.secret.is_empty() {
            return Err(BrokerError::Auth("alpaca credentials missing".to_string()));
        }
        self.get_buying_power().await.map(|_| ())
    }

    async fn get_buying_power(&self) -> Result<f64, BrokerError> {
        let resp = self
            .authed(self.client.get(format!("{}/v2/account", self.trading_url)))
            .send()
            .await?;
        let account: AccountResponse = Self::parse(resp).await?;
        account
            .buying_power
            .parse::<f64>()
            .map_err(|_| BrokerError::Transport("unparsable buying_power".to_string()))
    }

    async fn get_positions(&self) -> Result<Vec<VenuePosition>, BrokerError> {
        let resp = self
            .authed(self.client.get(format!("{}/v2/positions", self.trading_url)))
            .send()
            .await?;
        let rows: Vec<PositionRow> = Self::parse(resp).await?;
        Ok(rows
            .into_iter()
            .filter_map(|r| {
                let quantity: f64 = r.qty.parse().ok()?;
                Some(VenuePosition {
                    symbol: r.symbol,
                    quantity,
                    market_value: r.market_value.parse().unwrap_or(0.0),
                    average_buy_price: r.avg_entry_price.parse().unwrap_or(0.0),
                })
            })
            .collect())
    }

    async fn get_latest_price(&self, symbol: &str) -> Result<f64, BrokerError> {
        let resp = self
            .authed(self.client.get(format!(
                "{}/v2/stocks/{symbol}/trades/latest",
                self.data_url
            )))
            .send()
            .await?;
        let latest: LatestTradeResponse = Self::parse(resp).await?;
        Ok(latest.trade.price)
    }

    async fn submit_order(
        &self,
        symbol: &str,
        amount: f64,
        side: OrderSide,
        order_type: OrderType,
        limit_price: Option<f64>,
    ) -> Result<OrderAck, BrokerError> {
        let mut payload = serde_json::json!({
            "symbol": symbol,
            "notional": format!("{amount:.2}"),
            "side": side.to_string(),
            "time_in_force": "day",
        });
        match (order_type, limit_price) {
            (OrderType::Limit, Some(limit)) => {
                payload["type"] = "limit".into();
                payload["limit_price"] = format!("{limit:.2}").into();
                payload["extended_hours"] = true.into();
            }
            _ => payload["type"] = "market".into(),
        }
        self.post_order(payload).await
    }

    async fn submit_order_by_quantity(
        &self,
        symbol: &str,
        qty: f64,
        side: OrderSide,
        order_type: OrderType,
        limit_price: Option<f64>,
    ) -> Result<OrderAck, BrokerError> {
        let mut payload = serde_json::json!({
            "symbol": symbol,
            "qty": format!("{qty}"),
            "side": side.to_string(),
            "time_in_force": "day",
        });
        match (order_type, limit_price) {
            (OrderType::Limit, Some(limit)) => {
                payload["type"] = "limit".into();
                payload["limit_price"] = format!("{limit:.2}").into();
                payload["extended_hours"] = true.into();
            }
            _ => payload["type"] = "market".into(),
        }
        self.post_order(payload).await
    }

    async fn cancel_all_orders(&self) -> Result<(), BrokerError> {
        let resp = self
            .authed(self.client.delete(format!("{}/v2/orders", self.trading_url)))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() && status.as_u16() != 207 {
            let body = resp.text().await.unwrap_or_default();
            return Err(BrokerError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    fn supports_brackets(&self) -> bool {
        true
    }

    async fn submit_bracket_order(
        &self,
        symbol: &str,
        amount: f64,
        side: OrderSide,
        take_profit: f64,
        stop_loss: f64,
    ) -> Result<OrderAck, BrokerError> {
        // Bracket legs require whole-share quantities on this venue.
        let price = self.get_latest_price(symbol).await?;
        if price <= 0.0 {
            return Err(BrokerError::InvalidQuote(symbol.to_string()));
        }
        let qty = (amount / price).floor().max(1.0);

        let payload = serde_json::json!({
            "symbol": symbol,
            "qty": format!("{qty}"),
            "side": side.to_string(),
            "type": "market",
            "time_in_force": "day",
            "order_class": "bracket",
            "take_profit": { "limit_price": format!("{take_profit:.2}") },
            "stop_loss": { "stop_price": format!("{stop_loss:.2}") },
        });
        self.post_order(payload).await
    }
}

impl std::fmt::Debug for AlpacaAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlpacaAdapter")
            .field("trading_url", &self.trading_url)
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
    fn position_rows_parse() {
        let raw = r#"[{"symbol": "AAPL", "qty": "10", "market_value": "2200.00", "avg_entry_price": "210.55"}]"#;
        let rows: Vec<PositionRow> = serde_json::from_str(raw).unwrap();
        assert_eq!(rows[0].symbol, "AAPL");
        assert_eq!(rows[0].qty, "10");
    }

    #[test]
    fn latest_trade_parses_short_field_names() {
        let raw = r#"{"trade": {"p": 212.34, "s": 100}}"#;
        let parsed: LatestTradeResponse = serde_json::from_str(raw).unwrap();
        assert!((parsed.trade.price - 212.34).abs() < 1e-9);
    }

    #[test]
    fn paper_flag_selects_paper_host() {
        let paper = AlpacaAdapter::new("k", "s", true);
        assert!(paper.trading_url.contains("paper-api"));
        let live = AlpacaAdapter::new("k", "s", false);
        assert!(!live.trading_url.contains("paper-api"));
    }
}
