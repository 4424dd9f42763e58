//! Deterministic in-memory exchange for end-to-end tests.
//!
//! Orders rest until the test explicitly executes them with
//! [`MockExchange::fill_order`], so every scenario controls exactly when
//! and at what price liquidity arrives. Balances and holdings move with
//! each fill the way a real venue's would.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;

use orbit::exchange::ExchangeClient;
use orbit::types::{
    Fill, MarketInfo, OrbitError, OrderSide, OrderSnapshot, OrderStatus, OrderbookSnapshot,
};

struct RestingOrder {
    market_id: String,
    token_id: String,
    snapshot: OrderSnapshot,
}

#[derive(Default)]
struct Inner {
    markets: Vec<MarketInfo>,
    books: HashMap<String, OrderbookSnapshot>,
    orders: HashMap<String, RestingOrder>,
    fills: Vec<(String, Fill)>,
    balance: Decimal,
    holdings: HashMap<String, Decimal>,
    next_order: u64,
    force_error: Option<String>,
}

/// Shared-state mock venue. Clones share the same order book, balance,
/// and order list, so a test keeps one handle to drive the market while
/// the controller owns another.
#[derive(Clone)]
pub struct MockExchange {
    inner: Arc<Mutex<Inner>>,
}

impl MockExchange {
    pub fn new(balance: Decimal) -> Self {
        let inner = Inner {
            balance,
            ..Inner::default()
        };
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub fn add_market(&self, market: MarketInfo) {
        self.inner.lock().unwrap().markets.push(market);
    }

    /// Replace the live orderbook for a token. Subsequent polls all see
    /// this book until it is replaced again.
    pub fn set_book(&self, token_id: &str, book: OrderbookSnapshot) {
        self.inner
            .lock()
            .unwrap()
            .books
            .insert(token_id.to_string(), book);
    }

    /// Every venue call fails with a transient error until cleared.
    pub fn set_error(&self, msg: &str) {
        self.inner.lock().unwrap().force_error = Some(msg.to_string());
    }

    pub fn clear_error(&self) {
        self.inner.lock().unwrap().force_error = None;
    }

    /// Execute `amount` shares of a resting order at `price`, moving
    /// balance and holdings and appending to the trade history.
    pub fn fill_order(&self, order_id: &str, amount: Decimal, price: Decimal) {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .orders
            .get_mut(order_id)
            .unwrap_or_else(|| panic!("fill_order: unknown order {order_id}"));
        let snap = &mut record.snapshot;
        assert!(
            !snap.status.is_terminal(),
            "fill_order: order {order_id} is already {:?}",
            snap.status
        );

        let prior_notional =
            snap.avg_fill_price.unwrap_or(Decimal::ZERO) * snap.filled_size;
        snap.filled_size += amount;
        snap.avg_fill_price = Some((prior_notional + amount * price) / snap.filled_size);
        snap.status = if snap.filled_size >= snap.size {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };

        let side = snap.side;
        let market_id = record.market_id.clone();
        let token_id = record.token_id.clone();
        let fill = Fill {
            order_id: order_id.to_string(),
            side,
            price,
            size: amount,
            executed_at: Utc::now(),
        };

        let notional = amount * price;
        match side {
            OrderSide::Buy => {
                inner.balance -= notional;
                *inner.holdings.entry(token_id).or_default() += amount;
            }
            OrderSide::Sell => {
                inner.balance += notional;
                *inner.holdings.entry(token_id).or_default() -= amount;
            }
        }
        inner.fills.push((market_id, fill));
    }

    /// Execute whatever is left of a resting order at `price`.
    pub fn fill_remaining(&self, order_id: &str, price: Decimal) {
        let remaining = {
            let inner = self.inner.lock().unwrap();
            inner
                .orders
                .get(order_id)
                .unwrap_or_else(|| panic!("fill_remaining: unknown order {order_id}"))
                .snapshot
                .remaining()
        };
        self.fill_order(order_id, remaining, price);
    }

    /// The venue expires a resting order without filling it further.
    pub fn expire_order(&self, order_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .orders
            .get_mut(order_id)
            .unwrap_or_else(|| panic!("expire_order: unknown order {order_id}"));
        record.snapshot.status = OrderStatus::Expired;
    }

    pub fn balance(&self) -> Decimal {
        self.inner.lock().unwrap().balance
    }

    pub fn holdings(&self, token_id: &str) -> Decimal {
        self.inner
            .lock()
            .unwrap()
            .holdings
            .get(token_id)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub fn order(&self, order_id: &str) -> OrderSnapshot {
        self.inner
            .lock()
            .unwrap()
            .orders
            .get(order_id)
            .unwrap_or_else(|| panic!("order: unknown order {order_id}"))
            .snapshot
            .clone()
    }

    pub fn open_order_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .orders
            .values()
            .filter(|r| !r.snapshot.status.is_terminal())
            .count()
    }

    fn check_error(inner: &Inner) -> Result<(), OrbitError> {
        match &inner.force_error {
            Some(msg) => Err(OrbitError::Transient(msg.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ExchangeClient for MockExchange {
    fn name(&self) -> &str {
        "mock"
    }

    async fn place_order(
        &self,
        market_id: &str,
        token_id: &str,
        side: OrderSide,
        price: Decimal,
        size: Decimal,
    ) -> Result<String, OrbitError> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_error(&inner)?;
        inner.next_order += 1;
        let order_id = format!("mock-{}", inner.next_order);
        inner.orders.insert(
            order_id.clone(),
            RestingOrder {
                market_id: market_id.to_string(),
                token_id: token_id.to_string(),
                snapshot: OrderSnapshot {
                    order_id: order_id.clone(),
                    side,
                    price,
                    size,
                    filled_size: Decimal::ZERO,
                    avg_fill_price: None,
                    status: OrderStatus::Pending,
                },
            },
        );
        Ok(order_id)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), OrbitError> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_error(&inner)?;
        // Cancelling an already-terminal or unknown order is a no-op,
        // matching venue idempotency.
        if let Some(record) = inner.orders.get_mut(order_id) {
            if !record.snapshot.status.is_terminal() {
                record.snapshot.status = OrderStatus::Cancelled;
            }
        }
        Ok(())
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderSnapshot, OrbitError> {
        let inner = self.inner.lock().unwrap();
        Self::check_error(&inner)?;
        inner
            .orders
            .get(order_id)
            .map(|r| r.snapshot.clone())
            .ok_or_else(|| OrbitError::StateDesync(format!("unknown order: {order_id}")))
    }

    async fn get_open_orders(&self, market_id: &str) -> Result<Vec<OrderSnapshot>, OrbitError> {
        let inner = self.inner.lock().unwrap();
        Self::check_error(&inner)?;
        Ok(inner
            .orders
            .values()
            .filter(|r| r.market_id == market_id && !r.snapshot.status.is_terminal())
            .map(|r| r.snapshot.clone())
            .collect())
    }

    async fn get_orderbook(&self, token_id: &str) -> Result<OrderbookSnapshot, OrbitError> {
        let inner = self.inner.lock().unwrap();
        Self::check_error(&inner)?;
        inner
            .books
            .get(token_id)
            .cloned()
            .ok_or_else(|| OrbitError::MarketNotFound(token_id.to_string()))
    }

    async fn get_balance(&self) -> Result<Decimal, OrbitError> {
        let inner = self.inner.lock().unwrap();
        Self::check_error(&inner)?;
        Ok(inner.balance)
    }

    async fn get_holdings(&self, token_id: &str) -> Result<Decimal, OrbitError> {
        let inner = self.inner.lock().unwrap();
        Self::check_error(&inner)?;
        Ok(inner
            .holdings
            .get(token_id)
            .copied()
            .unwrap_or(Decimal::ZERO))
    }

    async fn get_trade_history(
        &self,
        market_id: &str,
        side: OrderSide,
        window: chrono::Duration,
    ) -> Result<Vec<Fill>, OrbitError> {
        let inner = self.inner.lock().unwrap();
        Self::check_error(&inner)?;
        let cutoff = Utc::now() - window;
        Ok(inner
            .fills
            .iter()
            .filter(|(m, f)| m == market_id && f.side == side && f.executed_at >= cutoff)
            .map(|(_, f)| f.clone())
            .collect())
    }

    async fn list_markets(&self, limit: usize) -> Result<Vec<MarketInfo>, OrbitError> {
        let inner = self.inner.lock().unwrap();
        Self::check_error(&inner)?;
        Ok(inner.markets.iter().take(limit).cloned().collect())
    }

    async fn get_market(&self, market_id: &str) -> Result<MarketInfo, OrbitError> {
        let inner = self.inner.lock().unwrap();
        Self::check_error(&inner)?;
        inner
            .markets
            .iter()
            .find(|m| m.market_id == market_id)
            .cloned()
            .ok_or_else(|| OrbitError::MarketNotFound(market_id.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Self-tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn fills_move_balance_and_holdings() {
        let mock = MockExchange::new(dec!(500));
        let id = mock
            .place_order("m1", "tok-1", OrderSide::Buy, dec!(0.40), dec!(250))
            .await
            .unwrap();
        assert_eq!(id, "mock-1");

        mock.fill_order(&id, dec!(100), dec!(0.40));
        let snap = mock.order(&id);
        assert_eq!(snap.status, OrderStatus::PartiallyFilled);
        assert_eq!(snap.filled_size, dec!(100));
        assert_eq!(mock.balance(), dec!(460));
        assert_eq!(mock.holdings("tok-1"), dec!(100));

        mock.fill_remaining(&id, dec!(0.40));
        assert_eq!(mock.order(&id).status, OrderStatus::Filled);
        assert_eq!(mock.balance(), dec!(400));
        assert_eq!(mock.holdings("tok-1"), dec!(250));
        assert_eq!(mock.open_order_count(), 0);
    }

    #[tokio::test]
    async fn sell_fills_credit_the_balance() {
        let mock = MockExchange::new(dec!(0));
        let id = mock
            .place_order("m1", "tok-1", OrderSide::Sell, dec!(0.45), dec!(250))
            .await
            .unwrap();
        mock.fill_remaining(&id, dec!(0.45));
        assert_eq!(mock.balance(), dec!(112.50));
        assert_eq!(mock.holdings("tok-1"), dec!(-250));

        let history = mock
            .get_trade_history("m1", OrderSide::Sell, chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].size, dec!(250));
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_tolerates_unknown_ids() {
        let mock = MockExchange::new(dec!(100));
        let id = mock
            .place_order("m1", "tok-1", OrderSide::Buy, dec!(0.40), dec!(10))
            .await
            .unwrap();
        mock.cancel_order(&id).await.unwrap();
        mock.cancel_order(&id).await.unwrap();
        mock.cancel_order("never-placed").await.unwrap();
        assert_eq!(mock.order(&id).status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn forced_errors_poison_every_call_until_cleared() {
        let mock = MockExchange::new(dec!(100));
        mock.set_error("venue 503");
        let err = mock.get_balance().await.unwrap_err();
        assert!(matches!(err, OrbitError::Transient(_)));
        mock.clear_error();
        assert_eq!(mock.get_balance().await.unwrap(), dec!(100));
    }
}
