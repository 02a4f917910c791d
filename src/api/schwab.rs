use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{Quota, RateLimiter};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

use crate::broker::{BracketAck, BracketRequest, BrokerGateway};
use crate::config::BrokerConfig;
use crate::error::GatewayError;
use crate::models::{OrderId, OrderStatus, Side, Tick};

type SchwabRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// App credentials, read from the environment only
#[derive(Clone)]
pub struct SchwabCredentials {
    pub app_key: String,
    pub app_secret: String,
    pub refresh_token: String,
}

impl SchwabCredentials {
    pub fn from_env() -> anyhow::Result<Self> {
        let var = |name: &str| {
            std::env::var(name).map_err(|_| anyhow::anyhow!("{} not found in environment", name))
        };
        Ok(Self {
            app_key: var("SCHWAB_APP_KEY")?,
            app_secret: var("SCHWAB_APP_SECRET")?,
            refresh_token: var("SCHWAB_REFRESH_TOKEN")?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountNumber {
    #[allow(dead_code)]
    account_number: String,
    hash_value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderEntity {
    status: String,
    #[serde(default)]
    child_order_strategies: Vec<ChildOrder>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChildOrder {
    order_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct QuoteEntry {
    quote: QuoteData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteData {
    last_price: f64,
    bid_price: Option<f64>,
    ask_price: Option<f64>,
    total_volume: Option<f64>,
    /// Milliseconds since the epoch
    quote_time: Option<i64>,
}

/// Schwab Trader and Market Data API client
///
/// The account hash is resolved once in [`SchwabClient::connect`] and reused
/// for every order call. All requests share one rate limiter, and concurrent
/// re-authentications share one token refresh.
pub struct SchwabClient {
    http: Client,
    base_url: String,
    app_key: String,
    app_secret: String,
    refresh_token: RwLock<String>,
    access_token: RwLock<String>,
    /// Bumped on every successful token refresh
    token_generation: AtomicU64,
    refresh_lock: Mutex<()>,
    account_hash: String,
    rate_limiter: Arc<SchwabRateLimiter>,
}

impl SchwabClient {
    /// Exchange the refresh token and resolve the account hash
    pub async fn connect(
        config: &BrokerConfig,
        credentials: SchwabCredentials,
    ) -> Result<Self, GatewayError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| GatewayError::Transport(format!("failed to build HTTP client: {}", e)))?;

        let rpm = NonZeroU32::new(config.requests_per_minute).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_minute(rpm)));

        let mut client = Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            app_key: credentials.app_key,
            app_secret: credentials.app_secret,
            refresh_token: RwLock::new(credentials.refresh_token),
            access_token: RwLock::new(String::new()),
            token_generation: AtomicU64::new(0),
            refresh_lock: Mutex::new(()),
            account_hash: String::new(),
            rate_limiter,
        };

        client.refresh_access_token().await?;
        client.account_hash = client.fetch_account_hash().await?;
        tracing::info!("Connected to Schwab, account hash resolved");

        Ok(client)
    }

    pub fn account_hash(&self) -> &str {
        &self.account_hash
    }

    fn orders_url(&self) -> String {
        format!(
            "{}/trader/v1/accounts/{}/orders",
            self.base_url, self.account_hash
        )
    }

    async fn refresh_access_token(&self) -> Result<(), GatewayError> {
        self.rate_limiter.until_ready().await;

        let refresh_token = self.refresh_token.read().await.clone();
        let response = self
            .http
            .post(format!("{}/v1/oauth/token", self.base_url))
            .basic_auth(&self.app_key, Some(&self.app_secret))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
            ])
            .send()
            .await?;

        let response = check_status(response).await?;
        let token: TokenResponse = response.json().await?;

        *self.access_token.write().await = token.access_token;
        if let Some(rotated) = token.refresh_token {
            *self.refresh_token.write().await = rotated;
        }
        self.token_generation.fetch_add(1, Ordering::AcqRel);
        tracing::debug!("Access token refreshed");
        Ok(())
    }

    async fn fetch_account_hash(&self) -> Result<String, GatewayError> {
        let url = format!("{}/trader/v1/accounts/accountNumbers", self.base_url);
        let accounts: Vec<AccountNumber> = self.send(self.http.get(url)).await?.json().await?;

        accounts
            .into_iter()
            .next()
            .map(|a| a.hash_value)
            .ok_or_else(|| GatewayError::malformed("no linked accounts"))
    }

    /// Rate-limited, authenticated request with status mapping
    async fn send(&self, request: RequestBuilder) -> Result<Response, GatewayError> {
        self.rate_limiter.until_ready().await;

        let token = self.access_token.read().await.clone();
        let response = request.bearer_auth(token).send().await?;
        check_status(response).await
    }

    async fn get_order(&self, order_id: OrderId) -> Result<OrderEntity, GatewayError> {
        let url = format!("{}/{}", self.orders_url(), order_id);
        Ok(self.send(self.http.get(url)).await?.json().await?)
    }

    async fn place_order(&self, payload: &Value) -> Result<OrderId, GatewayError> {
        let response = self
            .send(self.http.post(self.orders_url()).json(payload))
            .await?;
        order_id_from_location(&response)
    }

    /// Latest quote for `symbol`
    pub async fn fetch_quote(&self, symbol: &str) -> Result<Tick, GatewayError> {
        let url = format!("{}/marketdata/v1/quotes", self.base_url);
        let quotes: HashMap<String, QuoteEntry> = self
            .send(
                self.http
                    .get(url)
                    .query(&[("symbols", symbol), ("fields", "quote")]),
            )
            .await?
            .json()
            .await?;

        let entry = quotes
            .get(symbol)
            .ok_or_else(|| GatewayError::malformed(format!("no quote for {}", symbol)))?;
        Ok(tick_from_quote(symbol, &entry.quote))
    }
}

#[async_trait]
impl BrokerGateway for SchwabClient {
    async fn submit_bracket_order(
        &self,
        request: &BracketRequest,
    ) -> Result<BracketAck, GatewayError> {
        let parent_id = self.place_order(&bracket_payload(request)).await?;

        // The buy is live from here on; any later failure must carry its id
        let accepted = |message: String| GatewayError::Malformed {
            message,
            order_id: Some(parent_id),
        };
        let parent = self
            .get_order(parent_id)
            .await
            .map_err(|e| accepted(format!("bracket accepted but lookup failed: {}", e)))?;
        let child_id = parent
            .child_order_strategies
            .first()
            .and_then(|c| c.order_id)
            .map(OrderId)
            .ok_or_else(|| accepted("bracket accepted without a child order id".to_string()))?;

        Ok(BracketAck {
            parent_id,
            child_id,
        })
    }

    async fn cancel_order(&self, order_id: OrderId) -> Result<(), GatewayError> {
        let url = format!("{}/{}", self.orders_url(), order_id);
        self.send(self.http.delete(url)).await?;
        Ok(())
    }

    async fn submit_market_order(
        &self,
        ticker: &str,
        quantity: u32,
        side: Side,
    ) -> Result<OrderId, GatewayError> {
        self.place_order(&market_order_payload(ticker, quantity, side))
            .await
    }

    async fn get_order_status(&self, order_id: OrderId) -> Result<OrderStatus, GatewayError> {
        let order = self.get_order(order_id).await?;
        map_order_status(&order.status)
    }

    async fn reauthenticate(&self) -> Result<(), GatewayError> {
        let seen = self.token_generation.load(Ordering::Acquire);
        let _refresh = self.refresh_lock.lock().await;
        if self.token_generation.load(Ordering::Acquire) != seen {
            tracing::debug!("Token already refreshed by another caller");
            return Ok(());
        }

        self.refresh_access_token().await.map_err(|e| match e {
            // A rejected refresh means the refresh token itself is no good
            GatewayError::Rejected { status, message } => {
                GatewayError::Auth(format!("token refresh rejected ({}): {}", status, message))
            }
            other => other,
        })
    }
}

async fn check_status(response: Response) -> Result<Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::UNAUTHORIZED {
        Err(GatewayError::Auth(body))
    } else {
        Err(GatewayError::Rejected {
            status: status.as_u16(),
            message: body,
        })
    }
}

fn order_id_from_location(response: &Response) -> Result<OrderId, GatewayError> {
    let location = response
        .headers()
        .get(reqwest::header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| GatewayError::malformed("order accepted without a Location header"))?;

    location
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .and_then(|id| id.parse().ok())
        .map(OrderId)
        .ok_or_else(|| GatewayError::malformed(format!("bad Location header: {}", location)))
}

fn tick_from_quote(symbol: &str, quote: &QuoteData) -> Tick {
    let timestamp = quote
        .quote_time
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or_else(Utc::now);

    Tick {
        symbol: symbol.to_string(),
        last_price: quote.last_price,
        bid: quote.bid_price,
        ask: quote.ask_price,
        volume: quote.total_volume,
        timestamp,
    }
}

fn equity_leg(ticker: &str, quantity: u32, side: Side) -> Value {
    json!({
        "orderLegType": "EQUITY",
        "instruction": side.instruction(),
        "quantity": quantity,
        "instrument": { "symbol": ticker, "assetType": "EQUITY" }
    })
}

/// Market buy that triggers a trailing-stop sell
pub fn bracket_payload(request: &BracketRequest) -> Value {
    json!({
        "session": "NORMAL",
        "duration": "DAY",
        "orderType": "MARKET",
        "orderStrategyType": "TRIGGER",
        "orderLegCollection": [equity_leg(&request.ticker, request.quantity, Side::Buy)],
        "childOrderStrategies": [{
            "session": "NORMAL",
            "duration": "DAY",
            "orderType": "TRAILING_STOP",
            "orderStrategyType": "SINGLE",
            "stopPriceLinkType": request.stop_link_type,
            "stopPriceOffset": request.stop_offset,
            "stopPriceLinkBasis": request.stop_link_basis,
            "orderLegCollection": [equity_leg(&request.ticker, request.quantity, Side::Sell)]
        }]
    })
}

pub fn market_order_payload(ticker: &str, quantity: u32, side: Side) -> Value {
    json!({
        "session": "NORMAL",
        "duration": "DAY",
        "orderType": "MARKET",
        "orderStrategyType": "SINGLE",
        "orderLegCollection": [equity_leg(ticker, quantity, side)]
    })
}

/// Map a broker order status onto ours
pub fn map_order_status(status: &str) -> Result<OrderStatus, GatewayError> {
    match status {
        "FILLED" => Ok(OrderStatus::Filled),
        "CANCELED" | "REPLACED" | "EXPIRED" => Ok(OrderStatus::Canceled),
        "REJECTED" => Ok(OrderStatus::Rejected),
        "WORKING" | "QUEUED" | "ACCEPTED" | "PENDING_ACTIVATION" | "AWAITING_STOP_CONDITION"
        | "PENDING_CANCEL" | "PENDING_REPLACE" => Ok(OrderStatus::Active),
        "NEW" | "AWAITING_PARENT_ORDER" | "AWAITING_CONDITION" | "AWAITING_MANUAL_REVIEW"
        | "AWAITING_UR_OUT" | "AWAITING_RELEASE_TIME" | "PENDING_ACKNOWLEDGEMENT"
        | "PENDING_RECALL" => Ok(OrderStatus::Pending),
        other => Err(GatewayError::malformed(format!(
            "unknown order status {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OrderConfig, StopLinkBasis, StopLinkType};
    use mockito::{Matcher, Mock, Server, ServerGuard};

    const ACCOUNT_HASH: &str = "E5B3F1A0";

    fn credentials() -> SchwabCredentials {
        SchwabCredentials {
            app_key: "key".into(),
            app_secret: "secret".into(),
            refresh_token: "refresh-1".into(),
        }
    }

    fn broker_config(server: &ServerGuard) -> BrokerConfig {
        BrokerConfig {
            base_url: server.url(),
            ..Default::default()
        }
    }

    /// Connected client plus the mocks it needs; mocks are removed on drop
    async fn connected(server: &mut ServerGuard) -> (SchwabClient, Vec<Mock>) {
        let token = server
            .mock("POST", "/v1/oauth/token")
            .match_body(Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"token-1","expires_in":1800}"#)
            .create_async()
            .await;
        let accounts = server
            .mock("GET", "/trader/v1/accounts/accountNumbers")
            .match_header("authorization", "Bearer token-1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(format!(
                r#"[{{"accountNumber":"12345678","hashValue":"{}"}}]"#,
                ACCOUNT_HASH
            ))
            .create_async()
            .await;

        let client = SchwabClient::connect(&broker_config(server), credentials())
            .await
            .unwrap();
        (client, vec![token, accounts])
    }

    fn orders_path() -> String {
        format!("/trader/v1/accounts/{}/orders", ACCOUNT_HASH)
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(map_order_status("FILLED").unwrap(), OrderStatus::Filled);
        assert_eq!(map_order_status("EXPIRED").unwrap(), OrderStatus::Canceled);
        assert_eq!(map_order_status("REPLACED").unwrap(), OrderStatus::Canceled);
        assert_eq!(map_order_status("REJECTED").unwrap(), OrderStatus::Rejected);
        assert_eq!(map_order_status("WORKING").unwrap(), OrderStatus::Active);
        assert_eq!(
            map_order_status("AWAITING_STOP_CONDITION").unwrap(),
            OrderStatus::Active
        );
        assert_eq!(
            map_order_status("AWAITING_PARENT_ORDER").unwrap(),
            OrderStatus::Pending
        );
        assert!(matches!(
            map_order_status("SOMETHING_ELSE"),
            Err(GatewayError::Malformed { .. })
        ));
    }

    #[test]
    fn test_bracket_payload_shape() {
        let order = OrderConfig {
            quantity: 3,
            stop_offset: 0.25,
            stop_link_type: StopLinkType::Value,
            stop_link_basis: StopLinkBasis::Bid,
        };
        let payload = bracket_payload(&BracketRequest::from_config("SQQQ", &order));

        assert_eq!(payload["orderStrategyType"], "TRIGGER");
        assert_eq!(payload["orderLegCollection"][0]["instruction"], "BUY");
        let child = &payload["childOrderStrategies"][0];
        assert_eq!(child["orderType"], "TRAILING_STOP");
        assert_eq!(child["stopPriceLinkType"], "VALUE");
        assert_eq!(child["stopPriceLinkBasis"], "BID");
        assert_eq!(child["stopPriceOffset"], 0.25);
        assert_eq!(child["orderLegCollection"][0]["instruction"], "SELL");
        assert_eq!(child["orderLegCollection"][0]["quantity"], 3);
    }

    #[tokio::test]
    async fn test_connect_resolves_account_hash() {
        let mut server = Server::new_async().await;
        let (client, _session) = connected(&mut server).await;
        assert_eq!(client.account_hash(), ACCOUNT_HASH);
    }

    #[tokio::test]
    async fn test_bracket_reads_child_id_from_parent() {
        let mut server = Server::new_async().await;
        let (client, _session) = connected(&mut server).await;

        let _place = server
            .mock("POST", orders_path().as_str())
            .with_status(201)
            .with_header(
                "location",
                &format!("{}{}/1001", server.url(), orders_path()),
            )
            .create_async()
            .await;
        let _lookup = server
            .mock("GET", format!("{}/1001", orders_path()).as_str())
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status":"FILLED","childOrderStrategies":[{"orderId":2047,"status":"WORKING"}]}"#)
            .create_async()
            .await;

        let ack = client
            .submit_bracket_order(&BracketRequest::from_config("SQQQ", &OrderConfig::default()))
            .await
            .unwrap();

        // Child id comes from the response, not parent + 1
        assert_eq!(ack.parent_id, OrderId(1001));
        assert_eq!(ack.child_id, OrderId(2047));
    }

    #[tokio::test]
    async fn test_bracket_without_child_keeps_parent_id() {
        let mut server = Server::new_async().await;
        let (client, _session) = connected(&mut server).await;

        let _place = server
            .mock("POST", orders_path().as_str())
            .with_status(201)
            .with_header("location", &format!("{}/1001", orders_path()))
            .create_async()
            .await;
        let _lookup = server
            .mock("GET", format!("{}/1001", orders_path()).as_str())
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status":"WORKING"}"#)
            .create_async()
            .await;

        let err = client
            .submit_bracket_order(&BracketRequest::from_config("SQQQ", &OrderConfig::default()))
            .await
            .unwrap_err();
        assert_eq!(err.accepted_order_id(), Some(OrderId(1001)));
    }

    #[tokio::test]
    async fn test_http_errors_are_classified() {
        let mut server = Server::new_async().await;
        let (client, _session) = connected(&mut server).await;

        let _expired = server
            .mock("DELETE", format!("{}/7", orders_path()).as_str())
            .with_status(401)
            .create_async()
            .await;
        let _refused = server
            .mock("DELETE", format!("{}/8", orders_path()).as_str())
            .with_status(400)
            .with_body("order is not cancelable")
            .create_async()
            .await;
        let _canceled = server
            .mock("DELETE", format!("{}/9", orders_path()).as_str())
            .with_status(200)
            .create_async()
            .await;

        assert!(matches!(
            client.cancel_order(OrderId(7)).await,
            Err(GatewayError::Auth(_))
        ));
        let err = client.cancel_order(OrderId(8)).await.unwrap_err();
        assert_eq!(
            err,
            GatewayError::Rejected {
                status: 400,
                message: "order is not cancelable".into()
            }
        );
        tokio_test::assert_ok!(client.cancel_order(OrderId(9)).await);
    }

    #[tokio::test]
    async fn test_market_order_without_location_is_malformed() {
        let mut server = Server::new_async().await;
        let (client, _session) = connected(&mut server).await;

        let _place = server
            .mock("POST", orders_path().as_str())
            .with_status(201)
            .create_async()
            .await;

        let err = tokio_test::assert_err!(client.submit_market_order("SQQQ", 1, Side::Sell).await);
        assert!(matches!(err, GatewayError::Malformed { order_id: None, .. }));
    }

    #[tokio::test]
    async fn test_order_status_unknown_value_is_malformed() {
        let mut server = Server::new_async().await;
        let (client, _session) = connected(&mut server).await;

        let _working = server
            .mock("GET", format!("{}/5", orders_path()).as_str())
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status":"WORKING"}"#)
            .create_async()
            .await;
        let _unknown = server
            .mock("GET", format!("{}/6", orders_path()).as_str())
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status":"TELEPORTED"}"#)
            .create_async()
            .await;

        assert_eq!(
            client.get_order_status(OrderId(5)).await.unwrap(),
            OrderStatus::Active
        );
        assert!(matches!(
            client.get_order_status(OrderId(6)).await,
            Err(GatewayError::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn test_reauthenticate_swaps_token() {
        let mut server = Server::new_async().await;
        let (client, _session) = connected(&mut server).await;

        let _refresh = server
            .mock("POST", "/v1/oauth/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"token-2","refresh_token":"refresh-2"}"#)
            .create_async()
            .await;
        let status = server
            .mock("GET", format!("{}/5", orders_path()).as_str())
            .match_header("authorization", "Bearer token-2")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status":"FILLED"}"#)
            .expect(1)
            .create_async()
            .await;

        client.reauthenticate().await.unwrap();
        assert_eq!(
            client.get_order_status(OrderId(5)).await.unwrap(),
            OrderStatus::Filled
        );
        status.assert_async().await;
        assert_eq!(*client.refresh_token.read().await, "refresh-2");
    }

    #[tokio::test]
    async fn test_concurrent_reauthentication_refreshes_once() {
        let mut server = Server::new_async().await;
        let (client, _session) = connected(&mut server).await;
        assert_eq!(client.token_generation.load(Ordering::Acquire), 1);

        let refresh = server
            .mock("POST", "/v1/oauth/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"token-2"}"#)
            .expect(1)
            .create_async()
            .await;

        let (ingestion, engine, poller) = tokio::join!(
            client.reauthenticate(),
            client.reauthenticate(),
            client.reauthenticate()
        );
        tokio_test::assert_ok!(ingestion);
        tokio_test::assert_ok!(engine);
        tokio_test::assert_ok!(poller);

        refresh.assert_async().await;
        assert_eq!(client.token_generation.load(Ordering::Acquire), 2);
        assert_eq!(*client.access_token.read().await, "token-2");
    }

    #[tokio::test]
    async fn test_fetch_quote() {
        let mut server = Server::new_async().await;
        let (client, _session) = connected(&mut server).await;

        let _quotes = server
            .mock("GET", "/marketdata/v1/quotes")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("symbols".into(), "SQQQ".into()),
                Matcher::UrlEncoded("fields".into(), "quote".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"SQQQ":{"symbol":"SQQQ","quote":{"lastPrice":8.42,"bidPrice":8.41,"askPrice":8.43,"totalVolume":1200000,"quoteTime":1700000000000}}}"#,
            )
            .create_async()
            .await;

        let tick = client.fetch_quote("SQQQ").await.unwrap();
        assert_eq!(tick.symbol, "SQQQ");
        assert_eq!(tick.last_price, 8.42);
        assert_eq!(tick.bid, Some(8.41));
        assert_eq!(tick.volume, Some(1_200_000.0));
        assert_eq!(tick.timestamp.timestamp_millis(), 1_700_000_000_000);
    }
}
