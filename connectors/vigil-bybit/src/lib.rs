//! Bybit REST adapter targeting the v5 API (linear USDT perpetuals).
//!
//! Bybit is a "parent-child" venue: stop-loss and take-profit ride on the
//! entry order (`tpslMode=Full`) and are cancelled automatically with the
//! parent. Stop orders placed separately live in a conditional queue that is
//! invisible to the plain orders endpoint, so open-order fetches union both
//! `orderFilter` views and cancels fall back to the conditional queue on
//! "order not found".

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
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
pub struct BybitCredentials {
    pub api_key: String,
    pub api_secret: String,
}

/// Configuration for the Bybit REST adapter.
#[derive(Clone)]
pub struct BybitConfig {
    pub base_url: String,
    pub category: String,
    pub recv_window: u64,
    pub requests_per_second: u32,
}

impl Default for BybitConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.bybit.com".into(),
            category: "linear".into(),
            recv_window: 5_000,
            requests_per_second: 10,
        }
    }
}

/// Tick/step/min-notional metadata for one instrument, loaded at connect time.
#[derive(Clone, Debug)]
struct InstrumentSpec {
    tick_size: Price,
    qty_step: Qty,
    min_notional: Decimal,
}

/// Adapter over the Bybit v5 REST API.
pub struct BybitAdapter {
    http: Client,
    config: BybitConfig,
    credentials: Option<BybitCredentials>,
    drift: ClockDrift,
    limiter: RateLimiter,
    instruments: RwLock<HashMap<Symbol, InstrumentSpec>>,
}

impl BybitAdapter {
    /// Build the adapter, sync the venue clock and preload instrument
    /// precision metadata.
    pub async fn connect(
        config: BybitConfig,
        credentials: Option<BybitCredentials>,
    ) -> AdapterResult<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
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

    fn creds(&self) -> AdapterResult<&BybitCredentials> {
        self.credentials
            .as_ref()
            .ok_or_else(|| AdapterError::Auth("missing Bybit credentials".into()))
    }

    async fn load_instruments(&self) -> AdapterResult<()> {
        let query = vec![
            ("category".to_string(), self.config.category.clone()),
            ("limit".to_string(), "1000".into()),
        ];
        let resp: ApiResponse<InstrumentsResult> =
            self.public_get("/v5/market/instruments-info", Some(query)).await?;
        let mut specs = HashMap::new();
        for item in resp.result.list {
            let spec = InstrumentSpec {
                tick_size: parse_decimal(&item.price_filter.tick_size)?,
                qty_step: parse_decimal(&item.lot_size_filter.qty_step)?,
                min_notional: item
                    .lot_size_filter
                    .min_notional_value
                    .as_deref()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(|| Decimal::from(5u8)),
            };
            specs.insert(item.symbol, spec);
        }
        debug!(count = specs.len(), "loaded Bybit instrument metadata");
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

    async fn public_get<T>(
        &self,
        path: &str,
        query: Option<Vec<(String, String)>>,
    ) -> AdapterResult<ApiResponse<T>>
    where
        T: DeserializeOwned,
    {
        self.limiter.acquire().await;
        let mut request = self.http.get(self.url(path));
        if let Some(pairs) = query {
            request = request.query(&pairs);
        }
        let response = request.send().await.map_err(map_reqwest_error)?;
        decode_response(response).await
    }

    async fn signed_request<T>(
        &self,
        method: Method,
        path: &str,
        body: Value,
        query: Option<Vec<(String, String)>>,
    ) -> AdapterResult<ApiResponse<T>>
    where
        T: DeserializeOwned,
    {
        let creds = self.creds()?;
        let query_string = query
            .as_ref()
            .map(|pairs| serde_urlencoded::to_string(pairs).unwrap_or_default())
            .unwrap_or_default();
        let url = if query_string.is_empty() {
            self.url(path)
        } else {
            format!("{}?{query_string}", self.url(path))
        };

        // Timestamp rejections get one transparent retry after a clock
        // resync; everything else surfaces to the caller unchanged.
        for attempt in 0..2 {
            self.limiter.acquire().await;
            let timestamp = self.drift.signed_timestamp();
            let payload = if method == Method::GET {
                format!(
                    "{timestamp}{}{}{query_string}",
                    creds.api_key, self.config.recv_window
                )
            } else {
                format!(
                    "{timestamp}{}{}{}",
                    creds.api_key,
                    self.config.recv_window,
                    body.to_string()
                )
            };
            let mut mac = HmacSha256::new_from_slice(creds.api_secret.as_bytes())
                .map_err(|err| AdapterError::Auth(format!("failed to create signing key: {err}")))?;
            mac.update(payload.as_bytes());
            let signature = hex::encode(mac.finalize().into_bytes());

            let mut request = self
                .http
                .request(method.clone(), url.clone())
                .header("X-BAPI-API-KEY", &creds.api_key)
                .header("X-BAPI-TIMESTAMP", timestamp.to_string())
                .header("X-BAPI-SIGN", signature)
                .header("X-BAPI-RECV-WINDOW", self.config.recv_window.to_string())
                .header("Content-Type", "application/json");
            if method != Method::GET {
                request = request.json(&body);
            }
            let response = request.send().await.map_err(map_reqwest_error)?;
            match decode_response(response).await {
                Err(AdapterError::TimestampDrift(msg)) if attempt == 0 => {
                    warn!(error = %msg, "Bybit rejected timestamp, resyncing clock");
                    let server_ms = self.server_time().await?;
                    self.drift.sync(server_ms);
                }
                other => return other,
            }
        }
        unreachable!("signed_request loop always returns by the second attempt")
    }

    async fn fetch_orders_queue(
        &self,
        symbol: Option<&str>,
        conditional: bool,
    ) -> AdapterResult<Vec<OpenOrder>> {
        let mut query = vec![
            ("category".to_string(), self.config.category.clone()),
            ("openOnly".to_string(), "0".into()),
            (
                "orderFilter".to_string(),
                if conditional { "StopOrder" } else { "Order" }.into(),
            ),
            ("limit".to_string(), "50".into()),
        ];
        match symbol {
            Some(sym) => query.push(("symbol".to_string(), self.to_venue_symbol(sym))),
            // Without a symbol, v5 requires settleCoin to scope the scan.
            None => query.push(("settleCoin".to_string(), "USDT".into())),
        }
        let resp: ApiResponse<OrderListResult> = self
            .signed_request(Method::GET, "/v5/order/realtime", Value::Null, Some(query))
            .await?;
        let orders = resp
            .result
            .list
            .into_iter()
            .filter(|item| {
                matches!(
                    item.order_status.as_str(),
                    "New" | "PartiallyFilled" | "Untriggered" | "Created"
                )
            })
            .map(|item| self.open_order_from(item, conditional))
            .collect::<AdapterResult<Vec<_>>>()?;
        Ok(orders)
    }

    fn open_order_from(&self, item: OrderItem, conditional: bool) -> AdapterResult<OpenOrder> {
        Ok(OpenOrder {
            order_id: item.order_id,
            client_order_id: (!item.order_link_id.is_empty()).then_some(item.order_link_id),
            symbol: self.normalize_symbol(&item.symbol),
            side: map_order_side(&item.side)?,
            qty: parse_decimal(&item.qty)?,
            price: parse_optional_decimal(&item.price),
            trigger_price: item
                .trigger_price
                .as_deref()
                .and_then(|value| value.parse().ok()),
            reduce_only: item.reduce_only,
            conditional,
            created_at: millis_to_datetime(&item.created_time),
        })
    }

    fn cancel_payload(&self, symbol: &str, order_id: &str, conditional: bool) -> Value {
        json!({
            "category": self.config.category,
            "symbol": self.to_venue_symbol(symbol),
            "orderId": order_id,
            "orderFilter": if conditional { "StopOrder" } else { "Order" },
        })
    }
}

#[async_trait]
impl ExchangeAdapter for BybitAdapter {
    fn name(&self) -> &str {
        "bybit"
    }

    fn supports_attached_protection(&self) -> bool {
        true
    }

    async fn place_entry(&self, req: EntryRequest) -> AdapterResult<OrderAck> {
        let is_limit = req.price.is_some();
        let mut payload = json!({
            "category": self.config.category,
            "symbol": self.to_venue_symbol(&req.symbol),
            "side": venue_side(req.side),
            "orderType": if is_limit { "Limit" } else { "Market" },
            "qty": req.qty.to_string(),
            "timeInForce": "GTC",
            "positionIdx": 0,
            "orderLinkId": req.client_order_id,
        });
        if let Some(price) = req.price {
            payload["price"] = json!(price.to_string());
        }
        if req.attached_sl.is_some() || req.attached_tp.is_some() {
            payload["tpslMode"] = json!("Full");
            if let Some(sl) = req.attached_sl {
                payload["stopLoss"] = json!(sl.to_string());
                payload["slTriggerBy"] = json!("MarkPrice");
            }
            if let Some(tp) = req.attached_tp {
                payload["takeProfit"] = json!(tp.to_string());
                payload["tpTriggerBy"] = json!("MarkPrice");
            }
        }
        let resp: ApiResponse<CreateOrderResult> = self
            .signed_request(Method::POST, "/v5/order/create", payload, None)
            .await?;
        Ok(OrderAck {
            order_id: resp.result.order_id,
            status: if is_limit {
                AckStatus::Open
            } else {
                AckStatus::Filled
            },
        })
    }

    async fn place_reduce_only(&self, req: ProtectiveRequest) -> AdapterResult<OrderAck> {
        let mut payload = json!({
            "category": self.config.category,
            "symbol": self.to_venue_symbol(&req.symbol),
            "side": venue_side(req.side),
            "orderType": "Market",
            "qty": req.qty.to_string(),
            "reduceOnly": true,
            "positionIdx": 0,
            "orderLinkId": req.client_order_id,
        });
        if let Some(trigger) = req.trigger_price {
            payload["triggerPrice"] = json!(trigger.to_string());
            payload["triggerBy"] = json!("MarkPrice");
            payload["triggerDirection"] = json!(trigger_direction(req.side, req.kind));
        }
        let resp: ApiResponse<CreateOrderResult> = self
            .signed_request(Method::POST, "/v5/order/create", payload, None)
            .await?;
        Ok(OrderAck {
            order_id: resp.result.order_id,
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
        let (first_conditional, fall_back) = match hint {
            CancelHint::Standard => (false, false),
            CancelHint::Conditional => (true, false),
            CancelHint::Auto => (false, true),
        };
        let result: AdapterResult<ApiResponse<Value>> = self
            .signed_request(
                Method::POST,
                "/v5/order/cancel",
                self.cancel_payload(symbol, order_id, first_conditional),
                None,
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(AdapterError::NotFound(_)) if fall_back => {
                debug!(order_id, "order missing from standard queue, retrying conditional cancel");
                self.signed_request::<Value>(
                    Method::POST,
                    "/v5/order/cancel",
                    self.cancel_payload(symbol, order_id, true),
                    None,
                )
                .await
                .map(|_| ())
            }
            Err(err) => Err(err),
        }
    }

    async fn fetch_positions(&self) -> AdapterResult<Vec<ExchangePosition>> {
        let query = vec![
            ("category".to_string(), self.config.category.clone()),
            ("settleCoin".to_string(), "USDT".into()),
        ];
        let resp: ApiResponse<PositionListResult> = self
            .signed_request(Method::GET, "/v5/position/list", Value::Null, Some(query))
            .await?;
        let mut positions = Vec::new();
        for item in resp.result.list {
            let qty = parse_decimal(&item.size)?;
            if qty <= Decimal::ZERO {
                continue;
            }
            let side = match item.side.as_str() {
                "Buy" => Side::Long,
                "Sell" => Side::Short,
                other => {
                    warn!(side = other, symbol = %item.symbol, "skipping position with flat side");
                    continue;
                }
            };
            positions.push(ExchangePosition {
                symbol: self.normalize_symbol(&item.symbol),
                side,
                qty,
                entry_price: parse_decimal(&item.avg_price)?,
                leverage: item.leverage.parse::<f64>().unwrap_or(1.0) as u32,
                unrealized_pnl: item.unrealised_pnl.parse().unwrap_or(Decimal::ZERO),
            });
        }
        Ok(positions)
    }

    async fn fetch_open_orders(&self, symbol: Option<&str>) -> AdapterResult<Vec<OpenOrder>> {
        let mut orders = self.fetch_orders_queue(symbol, false).await?;
        orders.extend(self.fetch_orders_queue(symbol, true).await?);
        Ok(orders)
    }

    async fn fetch_my_trades(
        &self,
        symbol: &str,
        since: DateTime<Utc>,
    ) -> AdapterResult<Vec<VenueFill>> {
        let query = vec![
            ("category".to_string(), self.config.category.clone()),
            ("symbol".to_string(), self.to_venue_symbol(symbol)),
            ("startTime".to_string(), since.timestamp_millis().to_string()),
            ("limit".to_string(), "100".into()),
        ];
        let resp: ApiResponse<ExecutionListResult> = self
            .signed_request(Method::GET, "/v5/execution/list", Value::Null, Some(query))
            .await?;
        let mut fills = Vec::new();
        for item in resp.result.list {
            fills.push(VenueFill {
                order_id: item.order_id,
                symbol: self.normalize_symbol(&item.symbol),
                side: map_order_side(&item.side)?,
                price: parse_decimal(&item.exec_price)?,
                qty: parse_decimal(&item.exec_qty)?,
                fee: item.exec_fee.parse().unwrap_or(Decimal::ZERO),
                reduce_only: item.closed_size.as_deref().is_some_and(|v| v != "0" && !v.is_empty()),
                timestamp: millis_to_datetime(&item.exec_time),
            });
        }
        Ok(fills)
    }

    async fn fetch_balance(&self) -> AdapterResult<AccountBalance> {
        let query = vec![("accountType".to_string(), "UNIFIED".into())];
        let resp: ApiResponse<WalletBalanceResult> = self
            .signed_request(
                Method::GET,
                "/v5/account/wallet-balance",
                Value::Null,
                Some(query),
            )
            .await?;
        for account in resp.result.list {
            for coin in account.coin {
                if coin.coin == "USDT" {
                    return Ok(AccountBalance {
                        currency: coin.coin,
                        total: coin.wallet_balance.parse().unwrap_or(Decimal::ZERO),
                        available: coin
                            .available_to_withdraw
                            .as_deref()
                            .unwrap_or("0")
                            .parse()
                            .unwrap_or(Decimal::ZERO),
                        updated_at: Utc::now(),
                    });
                }
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
        let payload = json!({
            "category": self.config.category,
            "symbol": self.to_venue_symbol(symbol),
            "buyLeverage": leverage.to_string(),
            "sellLeverage": leverage.to_string(),
        });
        match self
            .signed_request::<Value>(Method::POST, "/v5/position/set-leverage", payload, None)
            .await
        {
            Ok(_) => Ok(()),
            // 110043: leverage not modified. Already at the target value.
            Err(AdapterError::InvalidParam(msg)) if msg.contains("110043") => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn set_margin_mode(&self, symbol: &str, _mode: MarginMode) -> AdapterResult<()> {
        let payload = json!({
            "category": self.config.category,
            "symbol": self.to_venue_symbol(symbol),
            "tradeMode": 1,
        });
        match self
            .signed_request::<Value>(Method::POST, "/v5/position/switch-isolated", payload, None)
            .await
        {
            Ok(_) => Ok(()),
            // 110026/110028: margin mode already isolated.
            Err(AdapterError::InvalidParam(msg))
                if msg.contains("110026") || msg.contains("110028") =>
            {
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn server_time(&self) -> AdapterResult<i64> {
        let resp: ApiResponse<ServerTimeResult> = self.public_get("/v5/market/time", None).await?;
        resp.result
            .time_second
            .parse::<i64>()
            .map(|secs| secs * 1_000)
            .map_err(|err| AdapterError::Serialization(err.to_string()))
    }

    fn normalize_symbol(&self, raw: &str) -> Symbol {
        raw.replace('/', "").replace(":USDT", "").to_uppercase()
    }

    fn to_venue_symbol(&self, symbol: &str) -> String {
        symbol.to_uppercase()
    }

    fn amount_to_precision(&self, symbol: &str, qty: Qty) -> Qty {
        match self.spec(symbol) {
            Some(spec) if spec.qty_step > Decimal::ZERO => {
                (qty / spec.qty_step).floor() * spec.qty_step
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

/// Registry factory for the Bybit adapter.
#[derive(Default)]
pub struct BybitFactory;

#[async_trait]
impl AdapterFactory for BybitFactory {
    fn name(&self) -> &str {
        "bybit"
    }

    async fn build(
        &self,
        profile: &Profile,
        params: &Value,
    ) -> AdapterResult<Arc<dyn ExchangeAdapter>> {
        let mut config = BybitConfig::default();
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
            (Some(key), Some(secret)) => Some(BybitCredentials {
                api_key: key.clone(),
                api_secret: secret.clone(),
            }),
            _ => None,
        };
        let adapter = BybitAdapter::connect(config, credentials).await?;
        Ok(Arc::new(adapter))
    }
}

/// Register the factory with the global adapter registry.
pub fn register_factory() {
    register_adapter_factory(Arc::new(BybitFactory));
}

fn venue_side(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "Buy",
        OrderSide::Sell => "Sell",
    }
}

fn map_order_side(value: &str) -> AdapterResult<OrderSide> {
    match value {
        "Buy" => Ok(OrderSide::Buy),
        "Sell" => Ok(OrderSide::Sell),
        other => Err(AdapterError::Serialization(format!(
            "unknown order side '{other}'"
        ))),
    }
}

/// v5 `triggerDirection`: 1 fires when price rises to the trigger, 2 when it
/// falls. The protective role plus the closing side determine which leg of
/// the market the trigger sits on.
fn trigger_direction(close_side: OrderSide, role: ProtectiveRole) -> u8 {
    match (role, close_side) {
        // Long SL: sell when price falls; Long TP: sell when price rises.
        (ProtectiveRole::StopLoss, OrderSide::Sell) => 2,
        (ProtectiveRole::TakeProfit, OrderSide::Sell) => 1,
        // Short SL: buy when price rises; Short TP: buy when price falls.
        (ProtectiveRole::StopLoss, OrderSide::Buy) => 1,
        (ProtectiveRole::TakeProfit, OrderSide::Buy) => 2,
        (ProtectiveRole::Close, OrderSide::Buy) => 1,
        (ProtectiveRole::Close, OrderSide::Sell) => 2,
    }
}

fn map_reqwest_error(err: reqwest::Error) -> AdapterError {
    if err.is_timeout() || err.is_connect() {
        AdapterError::TransientNetwork(err.to_string())
    } else {
        AdapterError::TransientNetwork(format!("http error: {err}"))
    }
}

async fn decode_response<T>(response: reqwest::Response) -> AdapterResult<ApiResponse<T>>
where
    T: DeserializeOwned,
{
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::FORBIDDEN {
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
    let parsed: ApiResponse<T> = response
        .json()
        .await
        .map_err(|err| AdapterError::Serialization(err.to_string()))?;
    if parsed.ret_code == 0 {
        Ok(parsed)
    } else {
        Err(map_ret_code(parsed.ret_code, &parsed.ret_msg))
    }
}

/// Classify Bybit v5 business codes into the shared error taxonomy.
fn map_ret_code(code: i64, msg: &str) -> AdapterError {
    let detail = format!("{msg} (code {code})");
    match code {
        10002 => AdapterError::TimestampDrift(detail),
        10003 | 10004 | 10005 | 33004 => AdapterError::Auth(detail),
        10006 | 10018 => AdapterError::RateLimited { retry_after: None },
        10016 => AdapterError::VenueDown(detail),
        110001 | 110025 | 170213 => AdapterError::NotFound(detail),
        110004 | 110007 | 110012 | 110045 => AdapterError::InsufficientFunds(detail),
        _ => AdapterError::InvalidParam(detail),
    }
}

fn parse_decimal(value: &str) -> AdapterResult<Decimal> {
    value
        .parse()
        .map_err(|_| AdapterError::Serialization(format!("bad decimal '{value}'")))
}

fn parse_optional_decimal(value: &str) -> Option<Decimal> {
    if value.is_empty() || value == "0" {
        None
    } else {
        value.parse().ok()
    }
}

fn millis_to_datetime(value: &str) -> DateTime<Utc> {
    value
        .parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now)
}

#[derive(Deserialize)]
struct ApiResponse<T> {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg")]
    ret_msg: String,
    result: T,
}

#[derive(Deserialize)]
struct ServerTimeResult {
    #[serde(rename = "timeSecond")]
    time_second: String,
}

#[derive(Deserialize)]
struct CreateOrderResult {
    #[serde(rename = "orderId")]
    order_id: String,
}

#[derive(Deserialize)]
struct OrderListResult {
    list: Vec<OrderItem>,
}

#[derive(Deserialize)]
struct OrderItem {
    #[serde(rename = "orderId")]
    order_id: String,
    #[serde(rename = "orderLinkId")]
    order_link_id: String,
    symbol: String,
    side: String,
    qty: String,
    price: String,
    #[serde(rename = "triggerPrice")]
    trigger_price: Option<String>,
    #[serde(rename = "orderStatus")]
    order_status: String,
    #[serde(rename = "reduceOnly", default)]
    reduce_only: bool,
    #[serde(rename = "createdTime")]
    created_time: String,
}

#[derive(Deserialize)]
struct PositionListResult {
    list: Vec<PositionItem>,
}

#[derive(Deserialize)]
struct PositionItem {
    symbol: String,
    side: String,
    size: String,
    #[serde(rename = "avgPrice")]
    avg_price: String,
    leverage: String,
    #[serde(rename = "unrealisedPnl")]
    unrealised_pnl: String,
}

#[derive(Deserialize)]
struct ExecutionListResult {
    list: Vec<ExecutionItem>,
}

#[derive(Deserialize)]
struct ExecutionItem {
    #[serde(rename = "orderId")]
    order_id: String,
    symbol: String,
    side: String,
    #[serde(rename = "execPrice")]
    exec_price: String,
    #[serde(rename = "execQty")]
    exec_qty: String,
    #[serde(rename = "execFee")]
    exec_fee: String,
    #[serde(rename = "closedSize")]
    closed_size: Option<String>,
    #[serde(rename = "execTime")]
    exec_time: String,
}

#[derive(Deserialize)]
struct WalletBalanceResult {
    list: Vec<AccountEntry>,
}

#[derive(Deserialize)]
struct AccountEntry {
    coin: Vec<CoinBalance>,
}

#[derive(Deserialize)]
struct CoinBalance {
    coin: String,
    #[serde(rename = "walletBalance")]
    wallet_balance: String,
    #[serde(rename = "availableToWithdraw")]
    available_to_withdraw: Option<String>,
}

#[derive(Deserialize)]
struct InstrumentsResult {
    list: Vec<InstrumentItem>,
}

#[derive(Deserialize)]
struct InstrumentItem {
    symbol: String,
    #[serde(rename = "priceFilter")]
    price_filter: PriceFilter,
    #[serde(rename = "lotSizeFilter")]
    lot_size_filter: LotSizeFilter,
}

#[derive(Deserialize)]
struct PriceFilter {
    #[serde(rename = "tickSize")]
    tick_size: String,
}

#[derive(Deserialize)]
struct LotSizeFilter {
    #[serde(rename = "qtyStep")]
    qty_step: String,
    #[serde(rename = "minNotionalValue")]
    min_notional_value: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn bare_adapter() -> BybitAdapter {
        BybitAdapter {
            http: Client::new(),
            config: BybitConfig::default(),
            credentials: None,
            drift: ClockDrift::new(),
            limiter: RateLimiter::per_second(10),
            instruments: RwLock::new(HashMap::from([(
                "BTCUSDT".to_string(),
                InstrumentSpec {
                    tick_size: dec!(0.1),
                    qty_step: dec!(0.001),
                    min_notional: dec!(5),
                },
            )])),
        }
    }

    #[test]
    fn signature_is_hex_encoded_sha256() {
        let secret = "sec".repeat(10);
        let payload = format!("{}{}{}{}", 1_658_385_579_423i64, "XXXXXXXXXX", 5_000, "{}");
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("init mac");
        mac.update(payload.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());
        assert_eq!(signature.len(), 64);
    }

    #[test]
    fn symbol_normalization_strips_decorations() {
        let adapter = bare_adapter();
        assert_eq!(adapter.normalize_symbol("BTC/USDT:USDT"), "BTCUSDT");
        assert_eq!(adapter.normalize_symbol("ethusdt"), "ETHUSDT");
    }

    #[test]
    fn trigger_direction_per_role_and_side() {
        assert_eq!(trigger_direction(OrderSide::Sell, ProtectiveRole::StopLoss), 2);
        assert_eq!(trigger_direction(OrderSide::Sell, ProtectiveRole::TakeProfit), 1);
        assert_eq!(trigger_direction(OrderSide::Buy, ProtectiveRole::StopLoss), 1);
        assert_eq!(trigger_direction(OrderSide::Buy, ProtectiveRole::TakeProfit), 2);
    }

    #[test]
    fn ret_codes_map_to_taxonomy() {
        assert!(matches!(
            map_ret_code(110001, "order not exists"),
            AdapterError::NotFound(_)
        ));
        assert!(matches!(
            map_ret_code(10002, "invalid request timestamp"),
            AdapterError::TimestampDrift(_)
        ));
        assert!(matches!(
            map_ret_code(110007, "ab not enough"),
            AdapterError::InsufficientFunds(_)
        ));
        assert!(matches!(
            map_ret_code(10006, "too many visits"),
            AdapterError::RateLimited { .. }
        ));
    }

    #[test]
    fn precision_helpers_round_to_venue_steps() {
        let adapter = bare_adapter();
        assert_eq!(
            adapter.amount_to_precision("BTCUSDT", dec!(0.123456)),
            dec!(0.123)
        );
        assert_eq!(
            adapter.price_to_precision("BTCUSDT", dec!(64000.17)),
            dec!(64000.2)
        );
        assert_eq!(adapter.min_notional("BTCUSDT"), dec!(5));
    }
}
