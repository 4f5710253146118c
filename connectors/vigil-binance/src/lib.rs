//! Binance USDT-M futures REST adapter.
//!
//! Binance is an "algo-separate" venue: protective stop orders live in a
//! queue the standard `openOrders` endpoint does not report. Open-order
//! fetches therefore union both endpoints, and cancels fail over to the algo
//! endpoint when the standard queue reports the order unknown. Protective
//! orders cannot ride on the entry, so the engine places STOP_MARKET /
//! TAKE_PROFIT_MARKET reduce-only orders itself after the fill.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, warn};

use vigil_broker::{
    register_adapter_factory, AdapterError, AdapterFactory, AdapterResult, ClockDrift,
    EntryRequest, ExchangeAdapter, ProtectiveRequest, ProtectiveRole, RateLimiter,
};
use vigil_core::{
    AccountBalance, AckStatus, CancelHint, ExchangePosition, MarginMode, OpenOrder, OrderAck,
    OrderSide, Price, Profile, Qty, Side, Symbol, VenueFill,
};

type HmacSha256 = Hmac<Sha256>;

/// API credentials for private endpoints.
#[derive(Clone)]
pub struct BinanceCredentials {
    pub api_key: String,
    pub api_secret: String,
}

/// Configuration for the Binance futures REST adapter.
#[derive(Clone)]
pub struct BinanceConfig {
    pub base_url: String,
    pub recv_window: u64,
    pub requests_per_second: u32,
}

impl Default for BinanceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://fapi.binance.com".into(),
            recv_window: 10_000,
            requests_per_second: 10,
        }
    }
}

#[derive(Clone, Debug)]
struct InstrumentSpec {
    tick_size: Price,
    step_size: Qty,
    min_notional: Decimal,
}

/// Adapter over the Binance USDT-M futures REST API.
pub struct BinanceAdapter {
    http: Client,
    config: BinanceConfig,
    credentials: Option<BinanceCredentials>,
    drift: ClockDrift,
    limiter: RateLimiter,
    instruments: RwLock<HashMap<Symbol, InstrumentSpec>>,
}

impl BinanceAdapter {
    /// Build the adapter, sync the venue clock and preload exchange filters.
    pub async fn connect(
        config: BinanceConfig,
        credentials: Option<BinanceCredentials>,
    ) -> AdapterResult<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|err| AdapterError::TransientNetwork(err.to_string()))?;
        let limiter = RateLimiter::per_second(config.requests_per_second);
        let adapter = Self {
            http,
            config,
            credentials,
            drift: ClockDrift::new(),
            limiter,
            instruments: RwLock::new(HashMap::new()),
        };
        let server_ms = adapter.server_time().await?;
        adapter.drift.sync(server_ms);
        adapter.load_instruments().await?;
        Ok(adapter)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url, path.trim_start_matches('/'))
    }

    fn creds(&self) -> AdapterResult<&BinanceCredentials> {
        self.credentials
            .as_ref()
            .ok_or_else(|| AdapterError::Auth("missing Binance credentials".into()))
    }

    async fn load_instruments(&self) -> AdapterResult<()> {
        self.limiter.acquire().await;
        let response = self
            .http
            .get(self.url("/fapi/v1/exchangeInfo"))
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let info: ExchangeInfo = decode_response(response).await?;
        let mut specs = HashMap::new();
        for symbol in info.symbols {
            let mut tick_size = Decimal::ZERO;
            let mut step_size = Decimal::ZERO;
            let mut min_notional = Decimal::from(5u8);
            for filter in &symbol.filters {
                match filter.filter_type.as_str() {
                    "PRICE_FILTER" => {
                        if let Some(tick) = filter.tick_size.as_deref().and_then(|v| v.parse().ok())
                        {
                            tick_size = tick;
                        }
                    }
                    "LOT_SIZE" => {
                        if let Some(step) = filter.step_size.as_deref().and_then(|v| v.parse().ok())
                        {
                            step_size = step;
                        }
                    }
                    "MIN_NOTIONAL" => {
                        if let Some(notional) =
                            filter.notional.as_deref().and_then(|v| v.parse().ok())
                        {
                            min_notional = notional;
                        }
                    }
                    _ => {}
                }
            }
            specs.insert(
                symbol.symbol,
                InstrumentSpec {
                    tick_size,
                    step_size,
                    min_notional,
                },
            );
        }
        debug!(count = specs.len(), "loaded Binance exchange filters");
        *self.instruments.write().expect("instrument cache poisoned") = specs;
        Ok(())
    }

    fn spec(&self, symbol: &str) -> Option<InstrumentSpec> {
        self.instruments
            .read()
            .expect("instrument cache poisoned")
            .get(symbol)
            .cloned()
    }

    /// Issue a signed request. Binance signs the url-encoded query string and
    /// passes the signature as a final query parameter.
    async fn signed_request<T>(
        &self,
        method: Method,
        path: &str,
        params: Vec<(String, String)>,
    ) -> AdapterResult<T>
    where
        T: DeserializeOwned,
    {
        let creds = self.creds()?;
        for attempt in 0..2 {
            self.limiter.acquire().await;
            let mut signed = params.clone();
            signed.push(("recvWindow".into(), self.config.recv_window.to_string()));
            signed.push(("timestamp".into(), self.drift.signed_timestamp().to_string()));
            let query = serde_urlencoded::to_string(&signed)
                .map_err(|err| AdapterError::Serialization(err.to_string()))?;
            let mut mac = HmacSha256::new_from_slice(creds.api_secret.as_bytes())
                .map_err(|err| AdapterError::Auth(format!("failed to create signing key: {err}")))?;
            mac.update(query.as_bytes());
            let signature = hex::encode(mac.finalize().into_bytes());
            let url = format!("{}?{query}&signature={signature}", self.url(path));
            let response = self
                .http
                .request(method.clone(), url)
                .header("X-MBX-APIKEY", &creds.api_key)
                .send()
                .await
                .map_err(map_reqwest_error)?;
            match decode_response(response).await {
                Err(AdapterError::TimestampDrift(msg)) if attempt == 0 => {
                    warn!(error = %msg, "Binance rejected timestamp, resyncing clock");
                    let server_ms = self.server_time().await?;
                    self.drift.sync(server_ms);
                }
                other => return other,
            }
        }
        unreachable!("signed_request loop always returns by the second attempt")
    }

    async fn fetch_standard_orders(&self, symbol: Option<&str>) -> AdapterResult<Vec<OpenOrder>> {
        let mut params = Vec::new();
        if let Some(sym) = symbol {
            params.push(("symbol".to_string(), self.to_venue_symbol(sym)));
        }
        let raw: Vec<OpenOrderItem> = self
            .signed_request(Method::GET, "/fapi/v1/openOrders", params)
            .await?;
        raw.into_iter()
            .map(|item| self.open_order_from(item, false))
            .collect()
    }

    async fn fetch_algo_orders(&self, symbol: Option<&str>) -> AdapterResult<Vec<OpenOrder>> {
        let mut params = Vec::new();
        if let Some(sym) = symbol {
            params.push(("symbol".to_string(), self.to_venue_symbol(sym)));
        }
        let raw: Vec<OpenOrderItem> = self
            .signed_request(Method::GET, "/fapi/v1/openAlgoOrders", params)
            .await?;
        raw.into_iter()
            .map(|item| self.open_order_from(item, true))
            .collect()
    }

    fn open_order_from(&self, item: OpenOrderItem, conditional: bool) -> AdapterResult<OpenOrder> {
        Ok(OpenOrder {
            order_id: item.order_id.to_string(),
            client_order_id: item.client_order_id.filter(|id| !id.is_empty()),
            symbol: self.normalize_symbol(&item.symbol),
            side: map_order_side(&item.side)?,
            qty: parse_decimal(&item.orig_qty)?,
            price: item.price.as_deref().and_then(nonzero_decimal),
            trigger_price: item.stop_price.as_deref().and_then(nonzero_decimal),
            reduce_only: item.reduce_only,
            conditional: conditional || item.order_type.contains("STOP")
                || item.order_type.contains("TAKE_PROFIT"),
            created_at: item
                .time
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .unwrap_or_else(Utc::now),
        })
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn name(&self) -> &str {
        "binance"
    }

    fn supports_attached_protection(&self) -> bool {
        false
    }

    async fn place_entry(&self, req: EntryRequest) -> AdapterResult<OrderAck> {
        let is_limit = req.price.is_some();
        let mut params = vec![
            ("symbol".to_string(), self.to_venue_symbol(&req.symbol)),
            ("side".to_string(), venue_side(req.side).into()),
            (
                "type".to_string(),
                if is_limit { "LIMIT" } else { "MARKET" }.into(),
            ),
            ("quantity".to_string(), req.qty.to_string()),
            ("newClientOrderId".to_string(), req.client_order_id.clone()),
        ];
        if let Some(price) = req.price {
            params.push(("price".to_string(), price.to_string()));
            params.push(("timeInForce".to_string(), "GTC".into()));
        }
        let ack: NewOrderResponse = self
            .signed_request(Method::POST, "/fapi/v1/order", params)
            .await?;
        Ok(OrderAck {
            order_id: ack.order_id.to_string(),
            status: if ack.status == "FILLED" {
                AckStatus::Filled
            } else {
                AckStatus::Open
            },
        })
    }

    async fn place_reduce_only(&self, req: ProtectiveRequest) -> AdapterResult<OrderAck> {
        let order_type = match (req.kind, req.trigger_price) {
            (ProtectiveRole::StopLoss, Some(_)) => "STOP_MARKET",
            (ProtectiveRole::TakeProfit, Some(_)) => "TAKE_PROFIT_MARKET",
            _ => "MARKET",
        };
        let mut params = vec![
            ("symbol".to_string(), self.to_venue_symbol(&req.symbol)),
            ("side".to_string(), venue_side(req.side).into()),
            ("type".to_string(), order_type.into()),
            ("quantity".to_string(), req.qty.to_string()),
            ("reduceOnly".to_string(), "true".into()),
            ("newClientOrderId".to_string(), req.client_order_id.clone()),
        ];
        if let Some(trigger) = req.trigger_price {
            params.push(("stopPrice".to_string(), trigger.to_string()));
            params.push(("workingType".to_string(), "MARK_PRICE".into()));
        }
        let ack: NewOrderResponse = self
            .signed_request(Method::POST, "/fapi/v1/order", params)
            .await?;
        Ok(OrderAck {
            order_id: ack.order_id.to_string(),
            status: if req.trigger_price.is_some() {
                AckStatus::Open
            } else {
                AckStatus::Filled
            },
        })
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
        hint: CancelHint,
    ) -> AdapterResult<()> {
        let params = vec![
            ("symbol".to_string(), self.to_venue_symbol(symbol)),
            ("orderId".to_string(), order_id.to_string()),
        ];
        let (try_algo_first, fall_back) = match hint {
            CancelHint::Standard => (false, false),
            CancelHint::Conditional => (true, false),
            CancelHint::Auto => (false, true),
        };
        let path = if try_algo_first {
            "/fapi/v1/algoOrder"
        } else {
            "/fapi/v1/order"
        };
        let result: AdapterResult<Value> = self
            .signed_request(Method::DELETE, path, params.clone())
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(AdapterError::NotFound(_)) if fall_back => {
                debug!(order_id, "order unknown to standard queue, retrying algo cancel");
                self.signed_request::<Value>(Method::DELETE, "/fapi/v1/algoOrder", params)
                    .await
                    .map(|_| ())
            }
            Err(err) => Err(err),
        }
    }

    async fn fetch_positions(&self) -> AdapterResult<Vec<ExchangePosition>> {
        let raw: Vec<PositionRiskItem> = self
            .signed_request(Method::GET, "/fapi/v2/positionRisk", Vec::new())
            .await?;
        let mut positions = Vec::new();
        for item in raw {
            let signed_qty: Decimal = item.position_amt.parse().unwrap_or(Decimal::ZERO);
            if signed_qty.is_zero() {
                continue;
            }
            // Sign convention: Binance reports signed contracts.
            let side = if signed_qty > Decimal::ZERO {
                Side::Long
            } else {
                Side::Short
            };
            positions.push(ExchangePosition {
                symbol: self.normalize_symbol(&item.symbol),
                side,
                qty: signed_qty.abs(),
                entry_price: parse_decimal(&item.entry_price)?,
                leverage: item.leverage.parse::<f64>().unwrap_or(1.0) as u32,
                unrealized_pnl: item.un_realized_profit.parse().unwrap_or(Decimal::ZERO),
            });
        }
        Ok(positions)
    }

    async fn fetch_open_orders(&self, symbol: Option<&str>) -> AdapterResult<Vec<OpenOrder>> {
        let mut orders = self.fetch_standard_orders(symbol).await?;
        match self.fetch_algo_orders(symbol).await {
            Ok(algo) => {
                // The algo queue can shadow standard rows on some account
                // configurations; dedupe by venue order id.
                for order in algo {
                    if !orders.iter().any(|o| o.order_id == order.order_id) {
                        orders.push(order);
                    }
                }
            }
            Err(err) => warn!(error = %err, "failed to fetch algo orders, returning standard only"),
        }
        Ok(orders)
    }

    async fn fetch_my_trades(
        &self,
        symbol: &str,
        since: DateTime<Utc>,
    ) -> AdapterResult<Vec<VenueFill>> {
        let params = vec![
            ("symbol".to_string(), self.to_venue_symbol(symbol)),
            ("startTime".to_string(), since.timestamp_millis().to_string()),
            ("limit".to_string(), "200".into()),
        ];
        let raw: Vec<UserTradeItem> = self
            .signed_request(Method::GET, "/fapi/v1/userTrades", params)
            .await?;
        let mut fills = Vec::new();
        for item in raw {
            fills.push(VenueFill {
                order_id: item.order_id.to_string(),
                symbol: self.normalize_symbol(&item.symbol),
                side: map_order_side(&item.side)?,
                price: parse_decimal(&item.price)?,
                qty: parse_decimal(&item.qty)?,
                fee: item.commission.parse().unwrap_or(Decimal::ZERO),
                reduce_only: item.realized_pnl.parse::<Decimal>().map(|p| !p.is_zero()).unwrap_or(false),
                timestamp: Utc
                    .timestamp_millis_opt(item.time)
                    .single()
                    .unwrap_or_else(Utc::now),
            });
        }
        Ok(fills)
    }

    async fn fetch_balance(&self) -> AdapterResult<AccountBalance> {
        let raw: Vec<BalanceItem> = self
            .signed_request(Method::GET, "/fapi/v2/balance", Vec::new())
            .await?;
        for item in raw {
            if item.asset == "USDT" {
                return Ok(AccountBalance {
                    currency: item.asset,
                    total: item.balance.parse().unwrap_or(Decimal::ZERO),
                    available: item.available_balance.parse().unwrap_or(Decimal::ZERO),
                    updated_at: Utc::now(),
                });
            }
        }
        Ok(AccountBalance {
            currency: "USDT".into(),
            total: Decimal::ZERO,
            available: Decimal::ZERO,
            updated_at: Utc::now(),
        })
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> AdapterResult<()> {
        let params = vec![
            ("symbol".to_string(), self.to_venue_symbol(symbol)),
            ("leverage".to_string(), leverage.to_string()),
        ];
        self.signed_request::<Value>(Method::POST, "/fapi/v1/leverage", params)
            .await
            .map(|_| ())
    }

    async fn set_margin_mode(&self, symbol: &str, _mode: MarginMode) -> AdapterResult<()> {
        let params = vec![
            ("symbol".to_string(), self.to_venue_symbol(symbol)),
            ("marginType".to_string(), "ISOLATED".into()),
        ];
        match self
            .signed_request::<Value>(Method::POST, "/fapi/v1/marginType", params)
            .await
        {
            Ok(_) => Ok(()),
            // -4046: "No need to change margin type."
            Err(AdapterError::InvalidParam(msg)) if msg.contains("-4046") => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn server_time(&self) -> AdapterResult<i64> {
        self.limiter.acquire().await;
        let response = self
            .http
            .get(self.url("/fapi/v1/time"))
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let parsed: ServerTimeResponse = decode_response(response).await?;
        Ok(parsed.server_time)
    }

    fn normalize_symbol(&self, raw: &str) -> Symbol {
        raw.replace('/', "").replace(":USDT", "").to_uppercase()
    }

    fn to_venue_symbol(&self, symbol: &str) -> String {
        symbol.to_uppercase()
    }

    fn amount_to_precision(&self, symbol: &str, qty: Qty) -> Qty {
        match self.spec(symbol) {
            Some(spec) if spec.step_size > Decimal::ZERO => {
                (qty / spec.step_size).floor() * spec.step_size
            }
            _ => qty.round_dp(3),
        }
    }

    fn price_to_precision(&self, symbol: &str, price: Price) -> Price {
        match self.spec(symbol) {
            Some(spec) if spec.tick_size > Decimal::ZERO => {
                (price / spec.tick_size).round() * spec.tick_size
            }
            _ => price.round_dp(4),
        }
    }

    fn min_notional(&self, symbol: &str) -> Decimal {
        self.spec(symbol)
            .map(|spec| spec.min_notional)
            .unwrap_or_else(|| Decimal::from(5u8))
    }
}

/// Registry factory for the Binance adapter.
#[derive(Default)]
pub struct BinanceFactory;

#[async_trait]
impl AdapterFactory for BinanceFactory {
    fn name(&self) -> &str {
        "binance"
    }

    async fn build(
        &self,
        profile: &Profile,
        params: &Value,
    ) -> AdapterResult<Arc<dyn ExchangeAdapter>> {
        let mut config = BinanceConfig::default();
        if let Some(url) = params.get("rest_url").and_then(Value::as_str) {
            config.base_url = url.to_string();
        }
        if let Some(window) = params.get("recv_window").and_then(Value::as_u64) {
            config.recv_window = window;
        }
        if let Some(rps) = params.get("requests_per_second").and_then(Value::as_u64) {
            config.requests_per_second = rps as u32;
        }
        let credentials = match (&profile.api_key, &profile.api_secret) {
            (Some(key), Some(secret)) => Some(BinanceCredentials {
                api_key: key.clone(),
                api_secret: secret.clone(),
            }),
            _ => None,
        };
        let adapter = BinanceAdapter::connect(config, credentials).await?;
        Ok(Arc::new(adapter))
    }
}

/// Register the factory with the global adapter registry.
pub fn register_factory() {
    register_adapter_factory(Arc::new(BinanceFactory));
}

fn venue_side(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "BUY",
        OrderSide::Sell => "SELL",
    }
}

fn map_order_side(value: &str) -> AdapterResult<OrderSide> {
    match value {
        "BUY" => Ok(OrderSide::Buy),
        "SELL" => Ok(OrderSide::Sell),
        other => Err(AdapterError::Serialization(format!(
            "unknown order side '{other}'"
        ))),
    }
}

fn map_reqwest_error(err: reqwest::Error) -> AdapterError {
    if err.is_timeout() || err.is_connect() {
        AdapterError::TransientNetwork(err.to_string())
    } else {
        AdapterError::TransientNetwork(format!("http error: {err}"))
    }
}

async fn decode_response<T>(response: reqwest::Response) -> AdapterResult<T>
where
    T: DeserializeOwned,
{
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        return Err(AdapterError::RateLimited { retry_after });
    }
    if status.is_server_error() {
        return Err(AdapterError::VenueDown(format!("http {status}")));
    }
    let body = response
        .bytes()
        .await
        .map_err(|err| AdapterError::TransientNetwork(err.to_string()))?;
    if !status.is_success() {
        let detail: BinanceErrorBody = serde_json::from_slice(&body).unwrap_or(BinanceErrorBody {
            code: 0,
            msg: String::from_utf8_lossy(&body).into_owned(),
        });
        return Err(map_error_code(detail.code, &detail.msg));
    }
    serde_json::from_slice(&body).map_err(|err| AdapterError::Serialization(err.to_string()))
}

/// Classify Binance futures error codes into the shared taxonomy.
fn map_error_code(code: i64, msg: &str) -> AdapterError {
    let detail = format!("{msg} (code {code})");
    match code {
        -1021 => AdapterError::TimestampDrift(detail),
        -1003 => AdapterError::RateLimited { retry_after: None },
        -2011 | -2013 => AdapterError::NotFound(detail),
        -2018 | -2019 | -4131 => AdapterError::InsufficientFunds(detail),
        -2014 | -2015 | -1022 => AdapterError::Auth(detail),
        -1001 | -1007 => AdapterError::VenueDown(detail),
        _ => AdapterError::InvalidParam(detail),
    }
}

fn parse_decimal(value: &str) -> AdapterResult<Decimal> {
    value
        .parse()
        .map_err(|_| AdapterError::Serialization(format!("bad decimal '{value}'")))
}

fn nonzero_decimal(value: &str) -> Option<Decimal> {
    let parsed: Decimal = value.parse().ok()?;
    (!parsed.is_zero()).then_some(parsed)
}

#[derive(Deserialize)]
struct BinanceErrorBody {
    code: i64,
    msg: String,
}

#[derive(Deserialize)]
struct ServerTimeResponse {
    #[serde(rename = "serverTime")]
    server_time: i64,
}

#[derive(Deserialize)]
struct NewOrderResponse {
    #[serde(rename = "orderId")]
    order_id: i64,
    status: String,
}

#[derive(Deserialize)]
struct OpenOrderItem {
    #[serde(rename = "orderId")]
    order_id: i64,
    #[serde(rename = "clientOrderId")]
    client_order_id: Option<String>,
    symbol: String,
    side: String,
    #[serde(rename = "type")]
    order_type: String,
    #[serde(rename = "origQty")]
    orig_qty: String,
    price: Option<String>,
    #[serde(rename = "stopPrice")]
    stop_price: Option<String>,
    #[serde(rename = "reduceOnly", default)]
    reduce_only: bool,
    time: Option<i64>,
}

#[derive(Deserialize)]
struct PositionRiskItem {
    symbol: String,
    #[serde(rename = "positionAmt")]
    position_amt: String,
    #[serde(rename = "entryPrice")]
    entry_price: String,
    leverage: String,
    #[serde(rename = "unRealizedProfit")]
    un_realized_profit: String,
}

#[derive(Deserialize)]
struct UserTradeItem {
    #[serde(rename = "orderId")]
    order_id: i64,
    symbol: String,
    side: String,
    price: String,
    qty: String,
    commission: String,
    #[serde(rename = "realizedPnl")]
    realized_pnl: String,
    time: i64,
}

#[derive(Deserialize)]
struct BalanceItem {
    asset: String,
    balance: String,
    #[serde(rename = "availableBalance")]
    available_balance: String,
}

#[derive(Deserialize)]
struct ExchangeInfo {
    symbols: Vec<ExchangeSymbol>,
}

#[derive(Deserialize)]
struct ExchangeSymbol {
    symbol: String,
    filters: Vec<SymbolFilter>,
}

#[derive(Deserialize)]
struct SymbolFilter {
    #[serde(rename = "filterType")]
    filter_type: String,
    #[serde(rename = "tickSize")]
    tick_size: Option<String>,
    #[serde(rename = "stepSize")]
    step_size: Option<String>,
    notional: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn bare_adapter() -> BinanceAdapter {
        BinanceAdapter {
            http: Client::new(),
            config: BinanceConfig::default(),
            credentials: None,
            drift: ClockDrift::new(),
            limiter: RateLimiter::per_second(10),
            instruments: RwLock::new(HashMap::from([(
                "ETHUSDT".to_string(),
                InstrumentSpec {
                    tick_size: dec!(0.01),
                    step_size: dec!(0.001),
                    min_notional: dec!(20),
                },
            )])),
        }
    }

    #[test]
    fn signature_matches_docs_example() {
        // Example from the Binance signed-endpoint documentation.
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("init mac");
        mac.update(query.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());
        assert_eq!(
            signature,
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn signed_position_amt_normalizes_to_side_plus_abs() {
        let item = PositionRiskItem {
            symbol: "ETHUSDT".into(),
            position_amt: "-1.5".into(),
            entry_price: "2000".into(),
            leverage: "5".into(),
            un_realized_profit: "12.5".into(),
        };
        let signed: Decimal = item.position_amt.parse().unwrap();
        assert!(signed < Decimal::ZERO);
        assert_eq!(signed.abs(), dec!(1.5));
    }

    #[test]
    fn error_codes_map_to_taxonomy() {
        assert!(matches!(
            map_error_code(-1021, "Timestamp for this request is outside of the recvWindow."),
            AdapterError::TimestampDrift(_)
        ));
        assert!(matches!(
            map_error_code(-2011, "Unknown order sent."),
            AdapterError::NotFound(_)
        ));
        assert!(matches!(
            map_error_code(-2019, "Margin is insufficient."),
            AdapterError::InsufficientFunds(_)
        ));
        assert!(matches!(
            map_error_code(-2015, "Invalid API-key."),
            AdapterError::Auth(_)
        ));
    }

    #[test]
    fn precision_helpers_round_to_filters() {
        let adapter = bare_adapter();
        assert_eq!(
            adapter.amount_to_precision("ETHUSDT", dec!(1.23456)),
            dec!(1.234)
        );
        assert_eq!(
            adapter.price_to_precision("ETHUSDT", dec!(2000.018)),
            dec!(2000.02)
        );
        assert_eq!(adapter.min_notional("ETHUSDT"), dec!(20));
    }
}
