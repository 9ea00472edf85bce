//! Signed REST client for the USDT-margined futures venue.

use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::models::PositionSide;

use super::types::*;

const FUTURES_BASE: &str = "https://fapi.binance.com";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const RECV_WINDOW_MS: u64 = 5_000;

type HmacSha256 = Hmac<Sha256>;

/// Gateway errors. Exchange-reported `{code, msg}` bodies stay typed so
/// callers can branch on specific codes (leverage negotiation needs
/// `-4028` and `-4048`).
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("exchange error {code}: {msg}")]
    Exchange { code: i64, msg: String },
    #[error("request failed with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl GatewayError {
    pub fn exchange_code(&self) -> Option<i64> {
        match self {
            GatewayError::Exchange { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: i64,
    msg: String,
}

/// Order types accepted by the order endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuturesOrderType {
    Limit,
    Market,
    StopMarket,
    TakeProfitMarket,
}

impl FuturesOrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FuturesOrderType::Limit => "LIMIT",
            FuturesOrderType::Market => "MARKET",
            FuturesOrderType::StopMarket => "STOP_MARKET",
            FuturesOrderType::TakeProfitMarket => "TAKE_PROFIT_MARKET",
        }
    }
}

/// Parameters for order placement. Quantities and prices must already be
/// rounded to the instrument's step/tick scale.
#[derive(Debug, Clone)]
pub struct NewOrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub position_side: PositionSide,
    pub order_type: FuturesOrderType,
    pub quantity: Option<Decimal>,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub close_position: bool,
    pub working_type_mark_price: bool,
    pub price_protect: bool,
}

impl NewOrderRequest {
    pub fn limit_entry(
        symbol: &str,
        side: OrderSide,
        position_side: PositionSide,
        quantity: Decimal,
        price: Decimal,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            position_side,
            order_type: FuturesOrderType::Limit,
            quantity: Some(quantity),
            price: Some(price),
            stop_price: None,
            close_position: false,
            working_type_mark_price: false,
            price_protect: false,
        }
    }

    pub fn market_entry(
        symbol: &str,
        side: OrderSide,
        position_side: PositionSide,
        quantity: Decimal,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            position_side,
            order_type: FuturesOrderType::Market,
            quantity: Some(quantity),
            price: None,
            stop_price: None,
            close_position: false,
            working_type_mark_price: false,
            price_protect: false,
        }
    }

    /// Protective close-position trigger order (stop or take-profit).
    pub fn closing_trigger(
        symbol: &str,
        position_side: PositionSide,
        order_type: FuturesOrderType,
        stop_price: Decimal,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: OrderSide::closing(position_side),
            position_side,
            order_type,
            quantity: None,
            price: None,
            stop_price: Some(stop_price),
            close_position: true,
            working_type_mark_price: true,
            price_protect: true,
        }
    }

    fn into_params(self) -> Vec<(&'static str, String)> {
        let mut params: Vec<(&'static str, String)> = vec![
            ("symbol", self.symbol),
            ("side", self.side.as_str().to_string()),
            ("positionSide", self.position_side.as_str().to_string()),
            ("type", self.order_type.as_str().to_string()),
        ];
        if let Some(qty) = self.quantity {
            params.push(("quantity", qty.to_string()));
        }
        if let Some(price) = self.price {
            params.push(("price", price.to_string()));
            params.push(("timeInForce", "GTC".to_string()));
        }
        if let Some(stop) = self.stop_price {
            params.push(("stopPrice", stop.to_string()));
        }
        if self.close_position {
            params.push(("closePosition", "true".to_string()));
        }
        if self.working_type_mark_price {
            params.push(("workingType", "MARK_PRICE".to_string()));
        }
        if self.price_protect {
            params.push(("priceProtect", "true".to_string()));
        }
        params
    }
}

/// Signed REST client. All private endpoints sign the query string with
/// HMAC-SHA256 and send the API key header.
pub struct FuturesClient {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

impl FuturesClient {
    pub fn new(api_key: String, api_secret: String) -> Result<Self, GatewayError> {
        let client = Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: FUTURES_BASE.to_string(),
            api_key,
            api_secret,
        })
    }

    /// Create with custom base URL (for testing).
    pub fn with_base_url(
        base_url: String,
        api_key: String,
        api_secret: String,
    ) -> Result<Self, GatewayError> {
        let client = Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url,
            api_key,
            api_secret,
        })
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC can take a key of any size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn encode_query(params: &[(&str, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&")
    }

    async fn send_public<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, GatewayError> {
        let mut url = format!("{}{}", self.base_url, path);
        if !params.is_empty() {
            url = format!("{}?{}", url, Self::encode_query(params));
        }
        debug!(url = %url, "public request");
        let response = self.client.get(&url).send().await?;
        Self::decode(response).await
    }

    async fn send_signed<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(&'static str, String)>,
    ) -> Result<T, GatewayError> {
        let timestamp = chrono::Utc::now().timestamp_millis();
        params.push(("recvWindow", RECV_WINDOW_MS.to_string()));
        params.push(("timestamp", timestamp.to_string()));
        let query = Self::encode_query(&params);
        let signature = self.sign(&query);
        let url = format!(
            "{}{}?{}&signature={}",
            self.base_url, path, query, signature
        );
        debug!(method = %method, path = %path, "signed request");
        let response = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, GatewayError> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            if let Ok(err) = serde_json::from_str::<ErrorBody>(&body) {
                return Err(GatewayError::Exchange {
                    code: err.code,
                    msg: err.msg,
                });
            }
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(serde_json::from_str(&body)?)
    }

    /// Account snapshot: available balance and open positions.
    pub async fn account(&self) -> Result<AccountInfo, GatewayError> {
        self.send_signed(Method::GET, "/fapi/v2/account", vec![])
            .await
    }

    /// Set initial leverage for a symbol. `-4048` ("No need to change")
    /// is surfaced as an error here; the negotiator treats it as success.
    pub async fn change_leverage(&self, symbol: &str, leverage: u32) -> Result<(), GatewayError> {
        let _: serde_json::Value = self
            .send_signed(
                Method::POST,
                "/fapi/v1/leverage",
                vec![
                    ("symbol", symbol.to_string()),
                    ("leverage", leverage.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    /// Leverage brackets for one symbol.
    pub async fn leverage_brackets(
        &self,
        symbol: &str,
    ) -> Result<Vec<SymbolBrackets>, GatewayError> {
        self.send_signed(
            Method::GET,
            "/fapi/v1/leverageBracket",
            vec![("symbol", symbol.to_string())],
        )
        .await
    }

    /// Exchange-wide symbol metadata and trading rule filters.
    pub async fn exchange_info(&self) -> Result<ExchangeInfo, GatewayError> {
        self.send_public("/fapi/v1/exchangeInfo", &[]).await
    }

    /// Latest traded price for a symbol.
    pub async fn ticker_price(&self, symbol: &str) -> Result<TickerPrice, GatewayError> {
        self.send_public("/fapi/v1/ticker/price", &[("symbol", symbol.to_string())])
            .await
    }

    /// Recent candles. Rows come back as heterogeneous JSON arrays with
    /// string-encoded prices at fixed indices.
    pub async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, GatewayError> {
        let rows: Vec<Vec<serde_json::Value>> = self
            .send_public(
                "/fapi/v1/klines",
                &[
                    ("symbol", symbol.to_string()),
                    ("interval", interval.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            let field = |idx: usize| -> Option<Decimal> {
                row.get(idx)
                    .and_then(|v| v.as_str())
                    .and_then(|s| Decimal::from_str(s).ok())
            };
            match (field(1), field(2), field(3), field(4)) {
                (Some(open), Some(high), Some(low), Some(close)) => candles.push(Candle {
                    open,
                    high,
                    low,
                    close,
                }),
                _ => {
                    return Err(GatewayError::Status {
                        status: 200,
                        body: format!("malformed kline row for {}", symbol),
                    })
                }
            }
        }
        Ok(candles)
    }

    /// Place an order.
    pub async fn new_order(&self, request: NewOrderRequest) -> Result<OrderAck, GatewayError> {
        self.send_signed(Method::POST, "/fapi/v1/order", request.into_params())
            .await
    }

    /// Query one order by id.
    pub async fn query_order(
        &self,
        symbol: &str,
        order_id: i64,
    ) -> Result<RemoteOrder, GatewayError> {
        self.send_signed(
            Method::GET,
            "/fapi/v1/order",
            vec![
                ("symbol", symbol.to_string()),
                ("orderId", order_id.to_string()),
            ],
        )
        .await
    }

    /// Cancel one order by id.
    pub async fn cancel_order(
        &self,
        symbol: &str,
        order_id: i64,
    ) -> Result<RemoteOrder, GatewayError> {
        self.send_signed(
            Method::DELETE,
            "/fapi/v1/order",
            vec![
                ("symbol", symbol.to_string()),
                ("orderId", order_id.to_string()),
            ],
        )
        .await
    }

    /// Open orders for one symbol.
    pub async fn open_orders(&self, symbol: &str) -> Result<Vec<RemoteOrder>, GatewayError> {
        self.send_signed(
            Method::GET,
            "/fapi/v1/openOrders",
            vec![("symbol", symbol.to_string())],
        )
        .await
    }

    /// Open orders across all symbols (single heavy call).
    pub async fn all_open_orders(&self) -> Result<Vec<RemoteOrder>, GatewayError> {
        self.send_signed(Method::GET, "/fapi/v1/openOrders", vec![])
            .await
    }

    /// Income records (realized PnL, commission, funding) in a time window.
    pub async fn income_history(
        &self,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<IncomeRecord>, GatewayError> {
        self.send_signed(
            Method::GET,
            "/fapi/v1/income",
            vec![
                ("startTime", start_ms.to_string()),
                ("endTime", end_ms.to_string()),
                ("limit", "1000".to_string()),
            ],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_matches_known_vector() {
        let client = FuturesClient::with_base_url(
            "http://localhost".to_string(),
            "key".to_string(),
            "secret".to_string(),
        )
        .unwrap();
        // hmac_sha256("secret", "a=1&b=2")
        assert_eq!(
            client.sign("a=1&b=2"),
            "604fe97c66c6393ff22e3cae366eee1131e351ebc736bf12f5d62e1755b7a233"
        );
    }

    #[test]
    fn closing_trigger_carries_protective_params() {
        let request = NewOrderRequest::closing_trigger(
            "BTCUSDT",
            PositionSide::Long,
            FuturesOrderType::StopMarket,
            rust_decimal_macros::dec!(59000),
        );
        let params = request.into_params();
        let get = |key: &str| {
            params
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("side"), Some("SELL"));
        assert_eq!(get("closePosition"), Some("true"));
        assert_eq!(get("workingType"), Some("MARK_PRICE"));
        assert_eq!(get("priceProtect"), Some("true"));
        assert_eq!(get("quantity"), None);
    }

    #[test]
    fn exchange_error_body_is_typed() {
        let err: ErrorBody = serde_json::from_str(r#"{"code":-4028,"msg":"bad leverage"}"#).unwrap();
        assert_eq!(err.code, -4028);
    }
}
