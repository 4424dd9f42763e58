//! Exchange access.
//!
//! [`ExchangeClient`] is the seam between the cycle engine and the venue.
//! Everything the engine knows about the outside world goes through this
//! trait, so tests can drive the full state machine against an in-memory
//! implementation. The REST client in [`rest`] is the production one.

pub mod rest;

use crate::types::{Fill, MarketInfo, OrbitError, OrderSide, OrderSnapshot, OrderbookSnapshot};
use async_trait::async_trait;
use chrono::Duration;
use rust_decimal::Decimal;
use std::future::Future;
use tracing::warn;

/// Retry budget for transient failures on a single call site.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

const RETRY_BASE_DELAY_MS: u64 = 500;

/// Venue operations used by the trading cycle. Implementations must be
/// safe to call from the single engine task and return typed errors so the
/// controller can match on the taxonomy.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Venue name for logs.
    fn name(&self) -> &str;

    /// Places a limit order and returns the venue's order id.
    async fn place_order(
        &self,
        market_id: &str,
        token_id: &str,
        side: OrderSide,
        price: Decimal,
        size: Decimal,
    ) -> Result<String, OrbitError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), OrbitError>;

    async fn get_order(&self, order_id: &str) -> Result<OrderSnapshot, OrbitError>;

    /// Resting (unfilled or partially filled) orders on one market.
    async fn get_open_orders(&self, market_id: &str) -> Result<Vec<OrderSnapshot>, OrbitError>;

    /// Current book for one outcome token.
    async fn get_orderbook(&self, token_id: &str) -> Result<OrderbookSnapshot, OrbitError>;

    /// Free quote-currency balance. Read fresh each tick, never cached.
    async fn get_balance(&self) -> Result<Decimal, OrbitError>;

    /// Shares held of one outcome token.
    async fn get_holdings(&self, token_id: &str) -> Result<Decimal, OrbitError>;

    /// Executed fills on one market within the lookback window.
    async fn get_trade_history(
        &self,
        market_id: &str,
        side: OrderSide,
        window: Duration,
    ) -> Result<Vec<Fill>, OrbitError>;

    async fn list_markets(&self, limit: usize) -> Result<Vec<MarketInfo>, OrbitError>;

    async fn get_market(&self, market_id: &str) -> Result<MarketInfo, OrbitError>;
}

/// Runs `op` with bounded retry and exponential backoff. Only transient
/// errors are retried; anything else returns immediately. Exhausting the
/// budget returns the last transient error so the caller can treat the
/// tick as skipped.
pub async fn with_retry<T, Fut, F>(op_name: &str, attempts: u32, mut op: F) -> Result<T, OrbitError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, OrbitError>>,
{
    let mut delay_ms = RETRY_BASE_DELAY_MS;
    let mut last: Option<OrbitError> = None;
    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < attempts => {
                warn!(
                    op = op_name,
                    attempt,
                    error = %e,
                    "Transient exchange error, backing off"
                );
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                delay_ms *= 2;
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last.unwrap_or_else(|| OrbitError::Transient(format!("{op_name}: no attempts made"))))
}
