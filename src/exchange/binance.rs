//! Binance spot REST client
//!
//! Signed endpoints follow the exchange's HMAC scheme:
//! 1. Build the query string (params + timestamp + recvWindow)
//! 2. HMAC-SHA256 the query string with the API secret
//! 3. Append the hex digest as `signature`, send the key in `X-MBX-APIKEY`

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use super::{ExchangeClient, ExchangeError};
use crate::types::Balances;

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_BASE_URL: &str = "https://api.binance.com";
const RECV_WINDOW_MS: u64 = 5000;

/// Error body returned by the REST API on non-2xx responses
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderAck {
    order_id: i64,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccountInfo {
    balances: Vec<AssetBalance>,
}

#[derive(Debug, Deserialize)]
struct AssetBalance {
    asset: String,
    free: String,
}

pub struct BinanceClient {
    api_key: String,
    api_secret: Vec<u8>,
    base_url: Url,
    client: Client,
    quantity_precision: usize,
}

impl BinanceClient {
    pub fn new(
        api_key: String,
        api_secret: String,
        base_url: Url,
        timeout: Duration,
        quantity_precision: usize,
    ) -> Result<Self, ExchangeError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExchangeError::Network(format!("HTTP client setup failed: {}", e)))?;
        Ok(Self {
            api_key,
            api_secret: api_secret.into_bytes(),
            base_url,
            client,
            quantity_precision,
        })
    }

    /// Hex HMAC-SHA256 of the query string
    fn sign(&self, query: &str) -> Result<String, ExchangeError> {
        let mut mac = HmacSha256::new_from_slice(&self.api_secret)
            .map_err(|e| ExchangeError::Auth(format!("Invalid API secret: {}", e)))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn endpoint(&self, path: &str) -> Result<Url, ExchangeError> {
        self.base_url
            .join(path)
            .map_err(|e| ExchangeError::Network(format!("Invalid endpoint {}: {}", path, e)))
    }

    fn format_quantity(&self, quantity: f64) -> Result<String, ExchangeError> {
        let formatted = format!("{:.*}", self.quantity_precision, quantity);
        match formatted.parse::<f64>() {
            Ok(q) if q > 0.0 => Ok(formatted),
            _ => Err(ExchangeError::RejectedOrder(format!(
                "quantity {} rounds to zero at precision {}",
                quantity, self.quantity_precision
            ))),
        }
    }

    async fn public_get(&self, path: &str, query: &str) -> Result<Value, ExchangeError> {
        let mut url = self.endpoint(path)?;
        url.set_query(Some(query));

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(transport_error)?;

        parse_response(response).await
    }

    async fn signed_request(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<Value, ExchangeError> {
        let timestamp = chrono::Utc::now().timestamp_millis();

        let mut query: Vec<String> = params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        query.push(format!("recvWindow={}", RECV_WINDOW_MS));
        query.push(format!("timestamp={}", timestamp));
        let mut query = query.join("&");

        let signature = self.sign(&query)?;
        query.push_str(&format!("&signature={}", signature));

        let mut url = self.endpoint(path)?;
        url.set_query(Some(&query));

        let response = self
            .client
            .request(method, url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(transport_error)?;

        parse_response(response).await
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: &str,
        quantity: f64,
    ) -> Result<String, ExchangeError> {
        let quantity = self.format_quantity(quantity)?;
        let client_order_id = Uuid::new_v4().simple().to_string();

        debug!("Placing MARKET {} {} {} ({})", side, quantity, symbol, client_order_id);

        let body = self
            .signed_request(
                Method::POST,
                "/api/v3/order",
                &[
                    ("symbol", symbol.to_string()),
                    ("side", side.to_string()),
                    ("type", "MARKET".to_string()),
                    ("quantity", quantity),
                    ("newClientOrderId", client_order_id),
                ],
            )
            .await?;

        let ack: OrderAck = serde_json::from_value(body)
            .map_err(|e| ExchangeError::Network(format!("Malformed order response: {}", e)))?;

        let status = ack.status.unwrap_or_default();
        match status.as_str() {
            "REJECTED" | "EXPIRED" => Err(ExchangeError::RejectedOrder(format!(
                "order {} ended with status {}",
                ack.order_id, status
            ))),
            _ => Ok(ack.order_id.to_string()),
        }
    }
}

fn transport_error(e: reqwest::Error) -> ExchangeError {
    if e.is_timeout() {
        ExchangeError::Network(format!("Request timed out: {}", e))
    } else {
        ExchangeError::Network(format!("Request failed: {}", e))
    }
}

async fn parse_response(response: Response) -> Result<Value, ExchangeError> {
    let status = response.status();
    let body = response.text().await.map_err(transport_error)?;

    if status.is_success() {
        return serde_json::from_str(&body)
            .map_err(|e| ExchangeError::Network(format!("Malformed response: {}", e)));
    }

    let api_error = serde_json::from_str::<ApiErrorBody>(&body).ok();
    let error = classify_error(status, api_error.as_ref());
    warn!("Exchange returned {}: {}", status, body);
    Err(error)
}

fn classify_error(status: StatusCode, api_error: Option<&ApiErrorBody>) -> ExchangeError {
    let message = match api_error {
        Some(e) => format!("{} (code {})", e.msg, e.code),
        None => format!("HTTP {}", status),
    };

    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.as_u16() == 418
        || status.is_server_error()
    {
        return ExchangeError::Network(message);
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return ExchangeError::Auth(message);
    }

    match api_error {
        // invalid signature / key format / key or IP not permitted
        Some(e) if matches!(e.code, -1022 | -2014 | -2015) => ExchangeError::Auth(message),
        // timestamp outside recvWindow
        Some(e) if e.code == -1021 => ExchangeError::Network(message),
        Some(e) if e.code == -2010 && e.msg.to_lowercase().contains("insufficient balance") => {
            ExchangeError::InsufficientFunds(message)
        }
        _ => ExchangeError::RejectedOrder(message),
    }
}

#[async_trait]
impl ExchangeClient for BinanceClient {
    async fn get_quote(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let body = self
            .public_get("/api/v3/ticker/price", &format!("symbol={}", symbol))
            .await?;

        let ticker: TickerPrice = serde_json::from_value(body)
            .map_err(|e| ExchangeError::Network(format!("Malformed ticker: {}", e)))?;

        match ticker.price.parse::<f64>() {
            Ok(p) if p.is_finite() && p > 0.0 => Ok(p),
            _ => Err(ExchangeError::Network(format!("Invalid ticker price '{}'", ticker.price))),
        }
    }

    async fn place_market_buy(&self, symbol: &str, quantity: f64) -> Result<String, ExchangeError> {
        self.place_market_order(symbol, "BUY", quantity).await
    }

    async fn place_market_sell(
        &self,
        symbol: &str,
        quantity: f64,
    ) -> Result<String, ExchangeError> {
        self.place_market_order(symbol, "SELL", quantity).await
    }

    async fn get_balances(
        &self,
        base_asset: &str,
        quote_asset: &str,
    ) -> Result<Balances, ExchangeError> {
        let body = self.signed_request(Method::GET, "/api/v3/account", &[]).await?;

        let account: AccountInfo = serde_json::from_value(body)
            .map_err(|e| ExchangeError::Network(format!("Malformed account response: {}", e)))?;

        let free = |asset: &str| {
            account
                .balances
                .iter()
                .find(|b| b.asset.eq_ignore_ascii_case(asset))
                .and_then(|b| b.free.parse::<f64>().ok())
                .unwrap_or(0.0)
        };

        Ok(Balances {
            base: free(base_asset),
            quote: free(quote_asset),
        })
    }

    fn name(&self) -> &str {
        "binance"
    }
}
