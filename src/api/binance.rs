use super::ExchangeAdapter;
use crate::config::{ExchangeConfig, Secret};
use crate::error::Error;
use crate::models::{
    IntentReason, Order, OrderKind, OrderSpec, OrderState, Side, SymbolRules, Tick, TimeRange,
};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::sync::RwLock;

pub const BINANCE_API_BASE: &str = "https://api.binance.com";
const RECV_WINDOW_MS: u64 = 5_000;
const KLINE_LIMIT: usize = 1_000;
const KLINE_INTERVAL: &str = "1m";

// Binance error codes that mean "try again later"
const CODE_DISCONNECTED: i64 = -1001;
const CODE_TOO_MANY_REQUESTS: i64 = -1003;
const CODE_TIMEOUT: i64 = -1007;
const CODE_TOO_MANY_ORDERS: i64 = -1015;
const CODE_NEW_ORDER_REJECTED: i64 = -2010;
const CODE_CANCEL_REJECTED: i64 = -2011;

type BinanceRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

type HmacSha256 = Hmac<Sha256>;

// ============== Response Types ==============

#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker24h {
    last_price: String,
    volume: String,
    close_time: i64,
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

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderAck {
    order_id: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelAck {
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderReport {
    symbol: String,
    order_id: u64,
    client_order_id: String,
    price: String,
    orig_qty: String,
    executed_qty: String,
    cummulative_quote_qty: String,
    status: String,
    #[serde(rename = "type")]
    order_type: String,
    side: String,
    time: i64,
    update_time: i64,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    symbol: String,
    filters: Vec<serde_json::Value>,
}

/// Binance spot adapter.
///
/// Cloneable; clones share the HTTP client, the rate limiter and the symbol
/// rules cache.
#[derive(Clone)]
pub struct BinanceAdapter {
    name: String,
    client: Client,
    base_url: String,
    api_key: Secret,
    api_secret: Secret,
    rules_cache: Arc<RwLock<HashMap<String, SymbolRules>>>,
    rate_limiter: Arc<BinanceRateLimiter>,
}

impl BinanceAdapter {
    pub fn new(
        name: &str,
        base_url: Option<&str>,
        api_key: Secret,
        api_secret: Secret,
        requests_per_minute: u32,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;

        let rpm = NonZeroU32::new(requests_per_minute).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_minute(rpm)));

        Ok(Self {
            name: name.to_string(),
            client,
            base_url: base_url
                .unwrap_or(BINANCE_API_BASE)
                .trim_end_matches('/')
                .to_string(),
            api_key,
            api_secret,
            rules_cache: Arc::new(RwLock::new(HashMap::new())),
            rate_limiter,
        })
    }

    pub fn from_config(config: &ExchangeConfig) -> Result<Self> {
        Self::new(
            &config.name,
            config.base_url.as_deref(),
            config.api_key.clone(),
            config.api_secret.clone(),
            config.requests_per_minute,
        )
    }

    /// Send a request and hand back status and body. Only transport failures error here.
    async fn send(
        &self,
        method: Method,
        path: &str,
        params: Vec<(&str, String)>,
        signed: bool,
    ) -> Result<(StatusCode, String)> {
        self.rate_limiter.until_ready().await;

        let mut query = query_string(&params);
        if signed {
            if !query.is_empty() {
                query.push('&');
            }
            query.push_str(&format!(
                "recvWindow={}&timestamp={}",
                RECV_WINDOW_MS,
                Utc::now().timestamp_millis()
            ));
            let signature = sign(self.api_secret.expose(), &query)?;
            query.push_str(&format!("&signature={}", signature));
        }

        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };

        let mut request = self.client.request(method.clone(), &url);
        if signed {
            request = request.header("X-MBX-APIKEY", self.api_key.expose());
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            tracing::debug!("Binance {} {} -> {}: {}", method, path, status, body);
        }
        Ok((status, body))
    }

    async fn get_public<T: DeserializeOwned>(
        &self,
        path: &str,
        params: Vec<(&str, String)>,
    ) -> Result<T> {
        let (status, body) = self.send(Method::GET, path, params, false).await?;
        decode(status, &body)
    }

    async fn lookup_by_client_id(&self, symbol: &str, client_order_id: &str) -> Result<OrderReport> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("origClientOrderId", client_order_id.to_string()),
        ];
        let (status, body) = self
            .send(Method::GET, "/api/v3/order", params, true)
            .await?;
        decode(status, &body)
    }

    fn to_order(&self, report: OrderReport) -> Result<Order> {
        let quantity = parse_decimal(&report.orig_qty)?;
        let filled = parse_decimal(&report.executed_qty)?;
        let quote = parse_decimal(&report.cummulative_quote_qty)?;
        let side = match report.side.as_str() {
            "BUY" => Side::Buy,
            "SELL" => Side::Sell,
            other => return Err(Error::Permanent(format!("unknown side {}", other))),
        };
        let kind = match report.order_type.as_str() {
            "MARKET" => OrderKind::Market,
            _ => OrderKind::Limit {
                price: parse_decimal(&report.price)?,
            },
        };

        Ok(Order {
            order_id: report.order_id.to_string(),
            client_order_id: report.client_order_id,
            exchange: self.name.clone(),
            symbol: report.symbol,
            side,
            quantity,
            kind,
            state: map_status(&report.status)?,
            filled_quantity: filled,
            average_fill_price: (filled > 0.0).then(|| quote / filled),
            reason: IntentReason::Strategy("exchange report".to_string()),
            created_at: from_millis(report.time),
            last_update: from_millis(report.update_time),
        })
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    /// Endpoint: GET /api/v3/ticker/24hr?symbol={symbol}
    async fn fetch_price(&self, symbol: &str) -> Result<Tick> {
        let ticker: Ticker24h = self
            .get_public("/api/v3/ticker/24hr", vec![("symbol", symbol.to_string())])
            .await?;

        Ok(Tick {
            exchange: self.name.clone(),
            symbol: symbol.to_string(),
            price: parse_decimal(&ticker.last_price)?,
            volume: parse_decimal(&ticker.volume)?,
            timestamp: from_millis(ticker.close_time),
        })
    }

    /// Free balance of `asset`; zero if the account does not hold it
    async fn fetch_balance(&self, asset: &str) -> Result<f64> {
        let (status, body) = self
            .send(Method::GET, "/api/v3/account", Vec::new(), true)
            .await?;
        let account: AccountInfo = decode(status, &body)?;

        account
            .balances
            .iter()
            .find(|b| b.asset == asset)
            .map(|b| parse_decimal(&b.free))
            .unwrap_or(Ok(0.0))
    }

    async fn place_order(&self, spec: &OrderSpec) -> Result<String> {
        let mut params = vec![
            ("symbol", spec.symbol.clone()),
            ("side", spec.side.to_string()),
            ("quantity", format_decimal(spec.quantity)),
            ("newClientOrderId", spec.client_order_id.clone()),
            ("newOrderRespType", "ACK".to_string()),
        ];
        match spec.kind {
            OrderKind::Market => params.push(("type", "MARKET".to_string())),
            OrderKind::Limit { price } => {
                params.push(("type", "LIMIT".to_string()));
                params.push(("timeInForce", "GTC".to_string()));
                params.push(("price", format_decimal(price)));
            }
        }

        let (status, body) = self
            .send(Method::POST, "/api/v3/order", params, true)
            .await?;

        if let Some(api) = api_error(&body) {
            if api.code == CODE_NEW_ORDER_REJECTED && api.msg.contains("Duplicate") {
                // resubmission of an order that already reached the exchange
                let existing = self
                    .lookup_by_client_id(&spec.symbol, &spec.client_order_id)
                    .await?;
                tracing::info!(
                    "Order {} already placed as {}",
                    spec.client_order_id,
                    existing.order_id
                );
                return Ok(existing.order_id.to_string());
            }
        }

        let ack: OrderAck = decode(status, &body)?;
        Ok(ack.order_id.to_string())
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<bool> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
        ];
        let (status, body) = self
            .send(Method::DELETE, "/api/v3/order", params, true)
            .await?;

        if let Some(api) = api_error(&body) {
            if api.code == CODE_CANCEL_REJECTED {
                // already filled, cancelled or expired
                return Ok(false);
            }
        }

        let ack: CancelAck = decode(status, &body)?;
        Ok(ack.status == "CANCELED")
    }

    async fn fetch_order_status(&self, symbol: &str, order_id: &str) -> Result<Order> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
        ];
        let (status, body) = self
            .send(Method::GET, "/api/v3/order", params, true)
            .await?;
        let report: OrderReport = decode(status, &body)?;
        self.to_order(report)
    }

    /// One tick per one-minute kline close, paging through the range
    async fn fetch_history(&self, symbol: &str, range: &TimeRange) -> Result<Vec<Tick>> {
        let end_ms = range.end.timestamp_millis();
        let mut start_ms = range.start.timestamp_millis();
        let mut ticks = Vec::new();

        while start_ms <= end_ms {
            let params = vec![
                ("symbol", symbol.to_string()),
                ("interval", KLINE_INTERVAL.to_string()),
                ("startTime", start_ms.to_string()),
                ("endTime", end_ms.to_string()),
                ("limit", KLINE_LIMIT.to_string()),
            ];
            let klines: Vec<Vec<serde_json::Value>> =
                self.get_public("/api/v3/klines", params).await?;
            let page_len = klines.len();

            let mut last_open = None;
            for kline in klines {
                let open_time = kline_int(&kline, 0)?;
                let close = kline_decimal(&kline, 4)?;
                let volume = kline_decimal(&kline, 5)?;
                let close_time = kline_int(&kline, 6)?;
                last_open = Some(open_time);

                let timestamp = from_millis(close_time);
                if range.contains(timestamp) {
                    ticks.push(Tick {
                        exchange: self.name.clone(),
                        symbol: symbol.to_string(),
                        price: close,
                        volume,
                        timestamp,
                    });
                }
            }

            match last_open {
                Some(open) if page_len >= KLINE_LIMIT => start_ms = open + 1,
                _ => break,
            }
        }

        tracing::debug!("Fetched {} historical ticks for {}", ticks.len(), symbol);
        Ok(ticks)
    }

    async fn symbol_rules(&self, symbol: &str) -> Result<SymbolRules> {
        if let Some(rules) = self.rules_cache.read().await.get(symbol) {
            return Ok(*rules);
        }

        let info: ExchangeInfo = self
            .get_public("/api/v3/exchangeInfo", vec![("symbol", symbol.to_string())])
            .await?;
        let entry = info
            .symbols
            .into_iter()
            .find(|s| s.symbol == symbol)
            .ok_or_else(|| Error::Permanent(format!("unknown symbol {}", symbol)))?;

        let mut rules = SymbolRules::unrestricted();
        for filter in &entry.filters {
            match filter.get("filterType").and_then(|v| v.as_str()) {
                Some("LOT_SIZE") => {
                    rules.min_qty = filter_decimal(filter, "minQty")?;
                    rules.max_qty = filter_decimal(filter, "maxQty")?;
                    rules.step_size = filter_decimal(filter, "stepSize")?;
                }
                Some("PRICE_FILTER") => {
                    rules.tick_size = filter_decimal(filter, "tickSize")?;
                }
                _ => {}
            }
        }

        self.rules_cache
            .write()
            .await
            .insert(symbol.to_string(), rules);
        Ok(rules)
    }
}

// ============== Helpers ==============

/// HMAC-SHA256 of the query string, hex encoded
pub fn sign(secret: &str, query: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::Config(format!("invalid api secret: {}", e)))?;
    mac.update(query.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

// Values are symbols, numbers and generated ids, none of which need escaping.
fn query_string(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

fn api_error(body: &str) -> Option<ApiError> {
    serde_json::from_str(body).ok()
}

/// Normalize a Binance failure into `Transient` or `Permanent`
fn classify(status: StatusCode, code: Option<i64>, msg: &str) -> Error {
    let transient_status = status == StatusCode::TOO_MANY_REQUESTS
        || status.as_u16() == 418
        || status.is_server_error();
    let transient_code = matches!(
        code,
        Some(CODE_DISCONNECTED | CODE_TOO_MANY_REQUESTS | CODE_TIMEOUT | CODE_TOO_MANY_ORDERS)
    );

    let detail = match code {
        Some(code) => format!("binance {} ({}): {}", status.as_u16(), code, msg),
        None => format!("binance {}: {}", status.as_u16(), msg),
    };

    if transient_status || transient_code {
        Error::Transient(detail)
    } else {
        Error::Permanent(detail)
    }
}

fn decode<T: DeserializeOwned>(status: StatusCode, body: &str) -> Result<T> {
    if !status.is_success() {
        return Err(match api_error(body) {
            Some(api) => classify(status, Some(api.code), &api.msg),
            None => classify(status, None, body),
        });
    }
    Ok(serde_json::from_str(body)?)
}

fn map_status(status: &str) -> Result<OrderState> {
    match status {
        "NEW" | "PENDING_NEW" | "PENDING_CANCEL" => Ok(OrderState::Submitted),
        "PARTIALLY_FILLED" => Ok(OrderState::PartiallyFilled),
        "FILLED" => Ok(OrderState::Filled),
        "CANCELED" => Ok(OrderState::Cancelled),
        "REJECTED" => Ok(OrderState::Rejected),
        "EXPIRED" | "EXPIRED_IN_MATCH" => Ok(OrderState::Expired),
        other => Err(Error::Permanent(format!("unknown order status {}", other))),
    }
}

fn parse_decimal(value: &str) -> Result<f64> {
    value
        .parse::<f64>()
        .map_err(|_| Error::Permanent(format!("malformed decimal {:?}", value)))
}

/// Plain decimal with at most 8 places and no trailing zeros
pub fn format_decimal(value: f64) -> String {
    let formatted = format!("{:.8}", value);
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    trimmed.to_string()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn kline_int(kline: &[serde_json::Value], index: usize) -> Result<i64> {
    kline
        .get(index)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| Error::Permanent(format!("malformed kline field {}", index)))
}

fn kline_decimal(kline: &[serde_json::Value], index: usize) -> Result<f64> {
    let raw = kline
        .get(index)
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Permanent(format!("malformed kline field {}", index)))?;
    parse_decimal(raw)
}

fn filter_decimal(filter: &serde_json::Value, field: &str) -> Result<f64> {
    let raw = filter
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Permanent(format!("missing filter field {}", field)))?;
    parse_decimal(raw)
}
