//! REST implementation of [`ExchangeClient`].
//!
//! Wire DTOs are kept separate from domain types and converted through the
//! helpers at the bottom. Order status and side arrive as integer codes;
//! fill figures are extracted through a fallback chain because the venue
//! reports them inconsistently across endpoints (dedicated fields first,
//! then the trade list, then filled value divided by price).

use crate::config::{AppConfig, ExchangeConfig};
use crate::exchange::ExchangeClient;
use crate::types::{
    Fill, MarketInfo, OrbitError, OrderSide, OrderSnapshot, OrderStatus, OrderbookSnapshot,
    PriceLevel,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration as StdDuration;

const ORDER_STATUS_PENDING: i64 = 0;
const ORDER_STATUS_PARTIAL: i64 = 1;
const ORDER_STATUS_FINISHED: i64 = 2;
const ORDER_STATUS_CANCELLED: i64 = 3;
const ORDER_STATUS_EXPIRED: i64 = 4;

const SIDE_BUY: i64 = 1;
const SIDE_SELL: i64 = 2;

pub struct RestExchange {
    client: reqwest::Client,
    base_url: String,
    api_key: SecretString,
}

impl RestExchange {
    pub fn new(cfg: &ExchangeConfig) -> anyhow::Result<Self> {
        let api_key = AppConfig::resolve_env(&cfg.api_key)?;
        let client = reqwest::Client::builder()
            .timeout(StdDuration::from_secs(cfg.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: SecretString::new(api_key),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, OrbitError> {
        let resp = self
            .client
            .get(self.url(path))
            .header("X-API-Key", self.api_key.expose_secret())
            .query(query)
            .send()
            .await
            .map_err(classify_reqwest)?;
        read_json(resp).await
    }
}

#[async_trait]
impl ExchangeClient for RestExchange {
    fn name(&self) -> &str {
        "rest"
    }

    async fn place_order(
        &self,
        market_id: &str,
        token_id: &str,
        side: OrderSide,
        price: Decimal,
        size: Decimal,
    ) -> Result<String, OrbitError> {
        let body = serde_json::json!({
            "market_id": market_id,
            "token_id": token_id,
            "side": side_code(side),
            "price": price,
            "size": size,
            "client_order_id": uuid::Uuid::new_v4().to_string(),
        });
        let resp = self
            .client
            .post(self.url("/api/v1/orders"))
            .header("X-API-Key", self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(classify_reqwest)?;
        let dto: PlaceOrderDto = read_json(resp).await?;
        Ok(dto.order_id)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), OrbitError> {
        let resp = self
            .client
            .delete(self.url(&format!("/api/v1/orders/{order_id}")))
            .header("X-API-Key", self.api_key.expose_secret())
            .send()
            .await
            .map_err(classify_reqwest)?;
        let status = resp.status();
        // Cancelling an already-gone order is a no-op, not a failure.
        if status.is_success() || status.as_u16() == 404 {
            return Ok(());
        }
        Err(error_from_response(status, resp.text().await.unwrap_or_default()))
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderSnapshot, OrbitError> {
        let dto: OrderDto = self
            .get_json(&format!("/api/v1/orders/{order_id}"), &[])
            .await?;
        convert_order(dto)
    }

    async fn get_open_orders(&self, market_id: &str) -> Result<Vec<OrderSnapshot>, OrbitError> {
        let dto: OrderListDto = self
            .get_json(
                "/api/v1/orders",
                &[
                    ("market_id", market_id.to_string()),
                    ("status", "open".to_string()),
                ],
            )
            .await?;
        dto.orders.into_iter().map(convert_order).collect()
    }

    async fn get_orderbook(&self, token_id: &str) -> Result<OrderbookSnapshot, OrbitError> {
        let dto: OrderbookDto = self
            .get_json("/api/v1/orderbook", &[("token_id", token_id.to_string())])
            .await?;
        Ok(convert_book(dto))
    }

    async fn get_balance(&self) -> Result<Decimal, OrbitError> {
        let dto: BalanceDto = self.get_json("/api/v1/balance", &[]).await?;
        Ok(dto.available)
    }

    async fn get_holdings(&self, token_id: &str) -> Result<Decimal, OrbitError> {
        let dto: PositionDto = self
            .get_json(&format!("/api/v1/positions/{token_id}"), &[])
            .await?;
        Ok(dto.shares)
    }

    async fn get_trade_history(
        &self,
        market_id: &str,
        side: OrderSide,
        window: Duration,
    ) -> Result<Vec<Fill>, OrbitError> {
        let since = (Utc::now() - window).timestamp();
        let dto: TradeListDto = self
            .get_json(
                "/api/v1/trades",
                &[
                    ("market_id", market_id.to_string()),
                    ("side", side_code(side).to_string()),
                    ("since", since.to_string()),
                ],
            )
            .await?;
        Ok(dto.trades.into_iter().map(convert_fill).collect())
    }

    async fn list_markets(&self, limit: usize) -> Result<Vec<MarketInfo>, OrbitError> {
        let dto: MarketListDto = self
            .get_json(
                "/api/v1/markets",
                &[
                    ("active", "true".to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        Ok(dto.markets.into_iter().map(convert_market).collect())
    }

    async fn get_market(&self, market_id: &str) -> Result<MarketInfo, OrbitError> {
        let resp = self
            .client
            .get(self.url(&format!("/api/v1/markets/{market_id}")))
            .header("X-API-Key", self.api_key.expose_secret())
            .send()
            .await
            .map_err(classify_reqwest)?;
        if resp.status().as_u16() == 404 {
            return Err(OrbitError::MarketNotFound(market_id.to_string()));
        }
        let dto: MarketDto = read_json(resp).await?;
        Ok(convert_market(dto))
    }
}

// ---------------------------------------------------------------------------
// Wire DTOs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PlaceOrderDto {
    order_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[allow(dead_code)]
struct OrderDto {
    #[serde(default)]
    order_id: String,
    #[serde(default)]
    side: i64,
    #[serde(default)]
    price: Decimal,
    #[serde(default, rename = "amount")]
    size: Decimal,
    #[serde(default, rename = "filled_amount")]
    filled_size: Decimal,
    #[serde(default)]
    filled_value: Decimal,
    #[serde(default)]
    avg_price: Decimal,
    #[serde(default)]
    status: i64,
    #[serde(default)]
    trades: Vec<OrderTradeDto>,
    #[serde(default)]
    created_at: i64,
}

#[derive(Debug, Default, Deserialize)]
struct OrderTradeDto {
    #[serde(default)]
    price: Decimal,
    #[serde(default, rename = "amount")]
    size: Decimal,
}

#[derive(Debug, Deserialize)]
struct OrderListDto {
    #[serde(default)]
    orders: Vec<OrderDto>,
}

#[derive(Debug, Default, Deserialize)]
struct LevelDto {
    #[serde(default)]
    price: Decimal,
    #[serde(default, rename = "amount")]
    size: Decimal,
}

#[derive(Debug, Default, Deserialize)]
struct OrderbookDto {
    #[serde(default)]
    bids: Vec<LevelDto>,
    #[serde(default)]
    asks: Vec<LevelDto>,
}

#[derive(Debug, Deserialize)]
struct BalanceDto {
    #[serde(default)]
    available: Decimal,
}

#[derive(Debug, Deserialize)]
struct PositionDto {
    #[serde(default)]
    shares: Decimal,
}

#[derive(Debug, Default, Deserialize)]
struct TradeDto {
    #[serde(default)]
    order_id: String,
    #[serde(default)]
    side: i64,
    #[serde(default)]
    price: Decimal,
    #[serde(default, rename = "amount")]
    size: Decimal,
    #[serde(default)]
    executed_at: i64,
}

#[derive(Debug, Deserialize)]
struct TradeListDto {
    #[serde(default)]
    trades: Vec<TradeDto>,
}

#[derive(Debug, Default, Deserialize)]
#[allow(dead_code)]
struct MarketDto {
    #[serde(default)]
    market_id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    yes_token_id: Option<String>,
    #[serde(default)]
    no_token_id: Option<String>,
    #[serde(default)]
    close_time: Option<i64>,
    #[serde(default)]
    active: bool,
}

#[derive(Debug, Deserialize)]
struct MarketListDto {
    #[serde(default)]
    markets: Vec<MarketDto>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiErrorDto {
    #[serde(default)]
    msg: String,
}

// ---------------------------------------------------------------------------
// Conversion helpers
// ---------------------------------------------------------------------------

fn side_code(side: OrderSide) -> i64 {
    match side {
        OrderSide::Buy => SIDE_BUY,
        OrderSide::Sell => SIDE_SELL,
    }
}

fn parse_side(code: i64) -> OrderSide {
    if code == SIDE_SELL {
        OrderSide::Sell
    } else {
        OrderSide::Buy
    }
}

fn parse_status(code: i64) -> OrderStatus {
    match code {
        ORDER_STATUS_PENDING => OrderStatus::Pending,
        ORDER_STATUS_PARTIAL => OrderStatus::PartiallyFilled,
        ORDER_STATUS_FINISHED => OrderStatus::Filled,
        ORDER_STATUS_CANCELLED => OrderStatus::Cancelled,
        ORDER_STATUS_EXPIRED => OrderStatus::Expired,
        _ => OrderStatus::Pending,
    }
}

/// Fill extraction fallback chain: dedicated fields, then the order's
/// trade list, then filled value divided by limit price.
fn convert_order(dto: OrderDto) -> Result<OrderSnapshot, OrbitError> {
    if dto.order_id.is_empty() {
        return Err(OrbitError::StateDesync(
            "order response without an order_id".to_string(),
        ));
    }

    let mut filled_size = dto.filled_size;
    let mut avg_fill_price = if dto.avg_price > Decimal::ZERO {
        Some(dto.avg_price)
    } else {
        None
    };

    if filled_size <= Decimal::ZERO && !dto.trades.is_empty() {
        let total_size: Decimal = dto.trades.iter().map(|t| t.size).sum();
        if total_size > Decimal::ZERO {
            let total_value: Decimal = dto.trades.iter().map(|t| t.price * t.size).sum();
            filled_size = total_size;
            avg_fill_price = Some(total_value / total_size);
        }
    }

    if filled_size <= Decimal::ZERO && dto.filled_value > Decimal::ZERO && dto.price > Decimal::ZERO
    {
        filled_size = dto.filled_value / dto.price;
        avg_fill_price = Some(dto.price);
    }

    Ok(OrderSnapshot {
        order_id: dto.order_id,
        side: parse_side(dto.side),
        price: dto.price,
        size: dto.size,
        filled_size,
        avg_fill_price,
        status: parse_status(dto.status),
    })
}

fn convert_book(dto: OrderbookDto) -> OrderbookSnapshot {
    let levels = |side: Vec<LevelDto>| {
        side.into_iter()
            .map(|l| PriceLevel::new(l.price, l.size))
            .collect()
    };
    OrderbookSnapshot::new(levels(dto.bids), levels(dto.asks))
}

fn convert_fill(dto: TradeDto) -> Fill {
    Fill {
        order_id: dto.order_id,
        side: parse_side(dto.side),
        price: dto.price,
        size: dto.size,
        executed_at: DateTime::from_timestamp(dto.executed_at, 0).unwrap_or_else(Utc::now),
    }
}

fn convert_market(dto: MarketDto) -> MarketInfo {
    MarketInfo {
        market_id: dto.market_id,
        title: dto.title,
        yes_token_id: dto.yes_token_id,
        no_token_id: dto.no_token_id,
        closes_at: dto.close_time.and_then(|t| DateTime::from_timestamp(t, 0)),
        is_active: dto.active,
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn classify_reqwest(e: reqwest::Error) -> OrbitError {
    OrbitError::Transient(format!("http: {e}"))
}

async fn read_json<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
) -> Result<T, OrbitError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(error_from_response(status, body));
    }
    resp.json::<T>()
        .await
        .map_err(|e| OrbitError::Transient(format!("decode: {e}")))
}

fn error_from_response(status: reqwest::StatusCode, body: String) -> OrbitError {
    let msg = serde_json::from_str::<ApiErrorDto>(&body)
        .map(|e| e.msg)
        .ok()
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| body.chars().take(200).collect());

    if status.as_u16() == 404 {
        OrbitError::StateDesync(format!("not found: {msg}"))
    } else if status.is_server_error() || status.as_u16() == 429 {
        OrbitError::Transient(format!("{status}: {msg}"))
    } else {
        OrbitError::OrderRejected(format!("{status}: {msg}"))
    }
}
