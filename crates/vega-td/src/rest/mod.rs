//! HTTP brokerage session.
//!
//! # REST endpoints
//!
//! | Operation        | Method  | Path                                        |
//! |------------------|---------|---------------------------------------------|
//! | Create session   | POST    | `/session/token`                            |
//! | Place order      | POST    | `/orders/{variety}`                         |
//! | Modify order     | PUT     | `/orders/{variety}/{order_id}`              |
//! | Cancel order     | DELETE  | `/orders/{variety}/{order_id}`              |
//! | Historical       | GET     | `/instruments/historical/{token}/{interval}`|
//!
//! Responses are wrapped in `{"status": "success"|"error", "data": ...,
//! "message": ...}`. HTTP statuses are mapped onto the error taxonomy so
//! the executor can tell retryable failures from rejections.

pub mod auth;

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};
use vega_core::config::{AccountConfig, BrokerEndpoints};
use vega_core::types::{AccountId, Candle, Direction, HistoricalRequest, OrderAck, OrderParams};
use vega_core::{Result, VegaError};

use crate::BrokerSession;

const API_VERSION: &str = "3";
const HISTORICAL_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    status: Option<String>,
    data: Option<T>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionData {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct CandleData {
    candles: Vec<Vec<serde_json::Value>>,
}

/// Map a non-success HTTP status to the error taxonomy.
pub fn classify_status(status: u16, message: String) -> VegaError {
    match status {
        429 => VegaError::RateLimited {
            category: format!("broker: {message}"),
        },
        408 | 500..=599 => VegaError::Transport(format!("HTTP {status}: {message}")),
        _ => VegaError::Rejected { status, message },
    }
}

/// Form fields of a place or modify request.
fn order_form(params: &OrderParams) -> Vec<(&'static str, String)> {
    let mut form = Vec::new();
    let mut push = |k: &'static str, v: Option<String>| {
        if let Some(v) = v.filter(|v| !v.is_empty()) {
            form.push((k, v));
        }
    };
    push("exchange", Some(params.exchange.clone()));
    push("tradingsymbol", Some(params.trading_symbol.clone()));
    push(
        "transaction_type",
        params.transaction_type.map(|d| match d {
            Direction::Buy => "BUY".to_string(),
            Direction::Sell => "SELL".to_string(),
        }),
    );
    push("quantity", params.quantity.map(|q| q.to_string()));
    push("order_type", params.order_type.map(|t| t.as_str().to_string()));
    push("product", params.product.clone());
    push("price", params.price.map(|p| p.to_string()));
    push("trigger_price", params.trigger_price.map(|p| p.to_string()));
    push("validity", params.validity.clone());
    push("tag", params.tag.clone());
    form
}

fn number(row: &[serde_json::Value], i: usize) -> Result<f64> {
    row.get(i)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| VegaError::Parse(format!("candle field {i} is not a number")))
}

/// Decode `[timestamp, open, high, low, close, volume, oi?]` rows.
pub fn parse_candles(rows: &[Vec<serde_json::Value>]) -> Result<Vec<Candle>> {
    rows.iter()
        .map(|row| {
            let timestamp = row
                .first()
                .and_then(|v| v.as_str())
                .ok_or_else(|| VegaError::Parse("candle without timestamp".into()))?
                .to_string();
            Ok(Candle {
                timestamp,
                open: number(row, 1)?,
                high: number(row, 2)?,
                low: number(row, 3)?,
                close: number(row, 4)?,
                volume: row.get(5).and_then(|v| v.as_u64()).unwrap_or_default(),
                oi: row.get(6).and_then(|v| v.as_u64()),
            })
        })
        .collect()
}

/// Authenticated REST session of one account.
pub struct RestSession {
    http: reqwest::Client,
    account_id: AccountId,
    api_key: String,
    access_token: String,
    base_url: String,
    timeout: Duration,
}

impl RestSession {
    pub fn new(
        account_id: AccountId,
        api_key: String,
        access_token: String,
        endpoints: &BrokerEndpoints,
    ) -> Result<Self> {
        let timeout = Duration::from_millis(endpoints.http_timeout_ms);
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VegaError::Config(format!("http client: {e}")))?;
        Ok(Self {
            http,
            account_id,
            api_key,
            access_token,
            base_url: endpoints.rest_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    /// Build a session from configured credentials, exchanging the request
    /// token for an access token when none is configured.
    pub async fn connect(account: &AccountConfig, endpoints: &BrokerEndpoints) -> Result<Self> {
        let creds = &account.credentials;
        if let Some(token) = creds.access_token.clone() {
            return Self::new(account.account_id.clone(), creds.api_key.clone(), token, endpoints);
        }
        let (Some(request_token), Some(secret)) = (&creds.request_token, &creds.api_secret) else {
            return Err(VegaError::Config(format!(
                "account {} has neither access_token nor request_token + api_secret",
                account.account_id
            )));
        };

        let mut session = Self::new(
            account.account_id.clone(),
            creds.api_key.clone(),
            String::new(),
            endpoints,
        )?;
        let checksum = auth::session_checksum(&creds.api_key, request_token, secret);
        let form = [
            ("api_key", creds.api_key.as_str()),
            ("request_token", request_token.as_str()),
            ("checksum", checksum.as_str()),
        ];
        let req = session
            .http
            .post(format!("{}/session/token", session.base_url))
            .header("X-Kite-Version", API_VERSION)
            .form(&form);
        let data: SessionData = session.send(req, "create session").await?;
        session.access_token = data.access_token;
        info!("[rest-{}] session created", session.account_id);
        Ok(session)
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Token the streaming socket authenticates with.
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("X-Kite-Version", API_VERSION).header(
            "Authorization",
            auth::authorization_header(&self.api_key, &self.access_token),
        )
    }

    fn transport_error(&self, what: &str, e: reqwest::Error) -> VegaError {
        if e.is_timeout() {
            VegaError::timeout(what, self.timeout)
        } else {
            VegaError::Transport(format!("{what}: {e}"))
        }
    }

    async fn send<T: DeserializeOwned>(&self, req: reqwest::RequestBuilder, what: &str) -> Result<T> {
        let resp = req.send().await.map_err(|e| self.transport_error(what, e))?;
        let status = resp.status();
        let body = resp.text().await.map_err(|e| self.transport_error(what, e))?;

        if !status.is_success() {
            let message = serde_json::from_str::<Envelope<serde_json::Value>>(&body)
                .ok()
                .and_then(|env| env.message)
                .unwrap_or_else(|| body.chars().take(200).collect());
            debug!("[rest-{}] {what} -> HTTP {status}: {message}", self.account_id);
            return Err(classify_status(status.as_u16(), message));
        }

        let env: Envelope<T> = serde_json::from_str(&body)
            .map_err(|e| VegaError::Parse(format!("{what} response: {e}")))?;
        if env.status.as_deref() == Some("error") {
            return Err(VegaError::Rejected {
                status: status.as_u16(),
                message: env.message.unwrap_or_default(),
            });
        }
        env.data
            .ok_or_else(|| VegaError::Parse(format!("{what} response has no data")))
    }

    fn order_url(&self, params: &OrderParams) -> Result<String> {
        let order_id = params
            .order_id
            .as_deref()
            .ok_or_else(|| VegaError::Validation("order_id is required".into()))?;
        Ok(format!("{}/orders/{}/{}", self.base_url, params.variety, order_id))
    }
}

#[async_trait]
impl BrokerSession for RestSession {
    fn account_id(&self) -> &str {
        &self.account_id
    }

    async fn place_order(&self, params: &OrderParams) -> Result<OrderAck> {
        let url = format!("{}/orders/{}", self.base_url, params.variety);
        let req = self.authed(self.http.post(url)).form(&order_form(params));
        self.send(req, "place order").await
    }

    async fn modify_order(&self, params: &OrderParams) -> Result<OrderAck> {
        let url = self.order_url(params)?;
        let req = self.authed(self.http.put(url)).form(&order_form(params));
        self.send(req, "modify order").await
    }

    async fn cancel_order(&self, params: &OrderParams) -> Result<OrderAck> {
        let url = self.order_url(params)?;
        let req = self.authed(self.http.delete(url));
        self.send(req, "cancel order").await
    }

    async fn fetch_historical(&self, request: &HistoricalRequest) -> Result<Vec<Candle>> {
        let url = format!(
            "{}/instruments/historical/{}/{}",
            self.base_url, request.instrument_token, request.interval
        );
        let flag = |b: bool| if b { "1" } else { "0" };
        let query = [
            ("from", request.from.format(HISTORICAL_TIME_FORMAT).to_string()),
            ("to", request.to.format(HISTORICAL_TIME_FORMAT).to_string()),
            ("continuous", flag(request.continuous).to_string()),
            ("oi", flag(request.oi).to_string()),
        ];
        let req = self.authed(self.http.get(url)).query(&query);
        let data: CandleData = self.send(req, "historical").await?;
        parse_candles(&data.candles)
    }
}

#[cfg(test)]
mod tests {
    use vega_core::ErrorKind;
    use vega_core::config::Credentials;
    use vega_core::types::OrderType;

    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(classify_status(429, "slow down".into()).kind(), ErrorKind::Transient);
        assert_eq!(classify_status(503, "maintenance".into()).kind(), ErrorKind::Transient);
        let e = classify_status(400, "Invalid quantity".into());
        assert!(matches!(e, VegaError::Rejected { status: 400, .. }));
        assert!(!e.is_retryable());
        assert_eq!(classify_status(403, "TokenException".into()).kind(), ErrorKind::Validation);
    }

    #[test]
    fn order_form_skips_absent_fields() {
        let params = OrderParams {
            exchange: "NFO".into(),
            trading_symbol: "NIFTY24DEC24000CE".into(),
            transaction_type: Some(Direction::Sell),
            quantity: Some(75),
            order_type: Some(OrderType::StopLossMarket),
            trigger_price: Some(101.5),
            ..Default::default()
        };
        let form = order_form(&params);
        assert!(form.contains(&("transaction_type", "SELL".to_string())));
        assert!(form.contains(&("order_type", "SL-M".to_string())));
        assert!(form.contains(&("trigger_price", "101.5".to_string())));
        assert!(!form.iter().any(|(k, _)| *k == "price" || *k == "product"));
    }

    #[test]
    fn envelope_and_candles() {
        let env: Envelope<OrderAck> =
            serde_json::from_str(r#"{"status":"success","data":{"order_id":"151220000000000"}}"#)
                .unwrap();
        assert_eq!(env.data.unwrap().order_id, "151220000000000");

        let data: CandleData = serde_json::from_str(
            r#"{"candles":[["2024-06-03T09:15:00+0530",100,101.5,99,100.5,1200,5000],
                           ["2024-06-03T09:16:00+0530",100.5,102,100,101,800]]}"#,
        )
        .unwrap();
        let candles = parse_candles(&data.candles).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].high, 101.5);
        assert_eq!(candles[0].oi, Some(5000));
        assert_eq!(candles[1].oi, None);

        let bad = vec![vec![serde_json::json!("t"), serde_json::json!("x")]];
        assert!(parse_candles(&bad).is_err());
    }

    #[tokio::test]
    async fn connect_without_token_material_is_a_config_error() {
        let account = AccountConfig {
            account_id: "acc1".into(),
            credentials: Credentials {
                api_key: "k".into(),
                ..Default::default()
            },
            max_connections: 1,
            max_instruments_per_connection: 1,
        };
        let err = RestSession::connect(&account, &BrokerEndpoints::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, VegaError::Config(_)));
    }

    #[test]
    fn modify_needs_order_id() {
        let s = RestSession::new("acc1".into(), "k".into(), "t".into(), &BrokerEndpoints::default())
            .unwrap();
        assert!(s.order_url(&OrderParams::default()).is_err());
        let url = s
            .order_url(&OrderParams {
                variety: "regular".into(),
                order_id: Some("42".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(url, "https://api.kite.trade/orders/regular/42");
    }
}
