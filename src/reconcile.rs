//! Position reconciliation.
//!
//! Saved state and exchange truth drift apart whenever the process dies
//! between a side effect and the save that records it, or when a human
//! touches the account. The reconciler repairs the gaps it can (lost order
//! ids, missing token ids, missing fill data, stale share counts) and
//! classifies the ones it cannot so the controller can close the cycle
//! cleanly instead of trading on fiction.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{info, warn};

use crate::config::DustConfig;
use crate::exchange::ExchangeClient;
use crate::types::{OrbitError, OrderSide, Stage, TradingCycleState};

/// Resting orders worth less than this are ignored during order-id
/// recovery; they are leftovers, not the order we lost.
const MIN_RECOVERABLE_ORDER_VALUE: Decimal = dec!(0.10);

/// How far back to search trade history when a position has vanished.
const MANUAL_SALE_LOOKBACK_HOURS: i64 = 24;

/// Outcome of verifying recorded fill data against exchange holdings.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionCheck {
    /// Holdings back the recorded position (possibly after adoption).
    Confirmed,
    /// Holdings exist but are too small to sell.
    Dust { shares: Decimal },
    /// The position is gone; it was sold outside the agent. Proceeds are
    /// present when trade history still covers the sale.
    ManualSale { proceeds: Option<Decimal> },
}

pub struct PositionReconciler {
    dust: DustConfig,
}

impl PositionReconciler {
    pub fn new(dust: DustConfig) -> Self {
        Self { dust }
    }

    /// Share count the venue will actually accept for a sell: one decimal
    /// place, rounded down.
    pub fn sellable_size(&self, shares: Decimal) -> Decimal {
        (shares * dec!(10)).floor() / dec!(10)
    }

    /// A position is dust when it is under the minimum sellable share
    /// count, or its sellable portion is worth less than the venue's
    /// minimum order value.
    pub fn is_dust(&self, shares: Decimal, price: Decimal) -> bool {
        if shares < self.dust.min_sellable_shares {
            return true;
        }
        self.sellable_size(shares) * price < self.dust.min_order_value
    }

    /// Find a resting order the state lost track of. Only orders on the
    /// expected side with a meaningful remaining value qualify.
    pub async fn recover_order_id(
        &self,
        exchange: &dyn ExchangeClient,
        state: &mut TradingCycleState,
    ) -> Result<Option<String>, OrbitError> {
        let Some(market_id) = state.market_id.clone() else {
            return Ok(None);
        };
        let expected_side = match state.stage {
            Stage::BuyPlaced | Stage::BuyMonitoring => OrderSide::Buy,
            Stage::SellPlaced | Stage::SellMonitoring => OrderSide::Sell,
            _ => return Ok(None),
        };

        let open = exchange.get_open_orders(&market_id).await?;
        let recovered = open.into_iter().find(|o| {
            o.side == expected_side && o.remaining() * o.price >= MIN_RECOVERABLE_ORDER_VALUE
        });

        if let Some(order) = &recovered {
            info!(
                order_id = %order.order_id,
                side = %order.side,
                price = %order.price,
                "Recovered lost order id from open orders"
            );
            state.order_id = Some(order.order_id.clone());
        }
        Ok(recovered.map(|o| o.order_id))
    }

    /// Re-derive the outcome token id from the market catalogue.
    pub async fn recover_token_id(
        &self,
        exchange: &dyn ExchangeClient,
        state: &mut TradingCycleState,
    ) -> Result<Option<String>, OrbitError> {
        if state.token_id.is_some() {
            return Ok(state.token_id.clone());
        }
        let (Some(market_id), Some(side)) = (state.market_id.clone(), state.outcome_side) else {
            return Ok(None);
        };

        let market = exchange.get_market(&market_id).await?;
        if let Some(token_id) = market.token_for(side) {
            info!(%market_id, %side, %token_id, "Recovered token id");
            state.token_id = Some(token_id.clone());
            return Ok(Some(token_id));
        }
        Ok(None)
    }

    /// Rebuild fill data from holdings after a crash that lost the BUY
    /// fill. The entry price falls back to the recorded limit price.
    pub async fn recover_fill_data(
        &self,
        exchange: &dyn ExchangeClient,
        state: &mut TradingCycleState,
    ) -> Result<(), OrbitError> {
        let Some(token_id) = state.token_id.clone() else {
            return Err(OrbitError::StateDesync(
                "cannot recover fill data without a token id".to_string(),
            ));
        };
        let holdings = exchange.get_holdings(&token_id).await?;
        let avg = state
            .avg_fill_price
            .or(state.buy_price)
            .unwrap_or(dec!(0.01));

        state.filled_amount = holdings;
        state.avg_fill_price = Some(avg);
        state.capital_committed = holdings * avg;
        info!(
            holdings = %holdings,
            avg_price = %avg,
            "Rebuilt fill data from exchange holdings"
        );
        Ok(())
    }

    /// Verify the recorded position against exchange holdings before a
    /// sell is placed.
    pub async fn confirm_position(
        &self,
        exchange: &dyn ExchangeClient,
        state: &mut TradingCycleState,
    ) -> Result<PositionCheck, OrbitError> {
        let Some(token_id) = state.token_id.clone() else {
            return Err(OrbitError::StateDesync(
                "cannot confirm a position without a token id".to_string(),
            ));
        };
        let holdings = exchange.get_holdings(&token_id).await?;
        let expected = state.filled_amount;

        if expected > Decimal::ZERO {
            let shortfall_pct = (expected - holdings).max(Decimal::ZERO) / expected * dec!(100);
            if shortfall_pct > self.dust.manual_sale_threshold_pct {
                warn!(
                    expected = %expected,
                    holdings = %holdings,
                    shortfall_pct = %shortfall_pct,
                    "Position gone from exchange, assuming manual sale"
                );
                let proceeds = self.recover_manual_sale_proceeds(exchange, state).await;
                return Ok(PositionCheck::ManualSale { proceeds });
            }

            let mismatch_pct = (expected - holdings).abs() / expected * dec!(100);
            if mismatch_pct > dec!(5.0) {
                warn!(
                    expected = %expected,
                    holdings = %holdings,
                    mismatch_pct = %mismatch_pct,
                    "Holdings disagree with recorded fill, adopting exchange value"
                );
                state.filled_amount = holdings;
                // Once a sell has been placed, holdings shrink through our
                // own partial sales; the buy cost basis must not follow.
                if state.sell_placed_at.is_none() {
                    if let Some(avg) = state.avg_fill_price {
                        state.capital_committed = holdings * avg;
                    }
                }
            }
        } else {
            state.filled_amount = holdings;
        }

        let price = state
            .avg_fill_price
            .or(state.buy_price)
            .unwrap_or(dec!(0.01));
        if self.is_dust(state.filled_amount, price) {
            return Ok(PositionCheck::Dust {
                shares: state.filled_amount,
            });
        }
        Ok(PositionCheck::Confirmed)
    }

    /// Sum of SELL fills in the recent trade history, if any survive.
    async fn recover_manual_sale_proceeds(
        &self,
        exchange: &dyn ExchangeClient,
        state: &TradingCycleState,
    ) -> Option<Decimal> {
        let market_id = state.market_id.as_deref()?;
        let window = chrono::Duration::hours(MANUAL_SALE_LOOKBACK_HOURS);
        match exchange
            .get_trade_history(market_id, OrderSide::Sell, window)
            .await
        {
            Ok(fills) if !fills.is_empty() => {
                Some(fills.iter().map(|f| f.notional()).sum())
            }
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "Trade history lookup failed during manual-sale recovery");
                None
            }
        }
    }

    /// Catch an orphaned position before a new cycle starts. When the
    /// agent is flat but the exchange still holds sellable shares for the
    /// recorded token, the state is promoted back to BUY_FILLED so the
    /// position gets listed instead of being forgotten. Orphaned resting
    /// orders in the market are cancelled.
    pub async fn preflight_rescue(
        &self,
        exchange: &dyn ExchangeClient,
        state: &mut TradingCycleState,
    ) -> Result<bool, OrbitError> {
        if !matches!(state.stage, Stage::Idle | Stage::Scanning) {
            return Ok(false);
        }
        let (Some(market_id), Some(token_id)) = (state.market_id.clone(), state.token_id.clone())
        else {
            return Ok(false);
        };

        for order in exchange.get_open_orders(&market_id).await? {
            warn!(
                order_id = %order.order_id,
                side = %order.side,
                "Cancelling orphaned resting order before rescue"
            );
            exchange.cancel_order(&order.order_id).await?;
        }
        state.order_id = None;

        let holdings = exchange.get_holdings(&token_id).await?;
        if holdings < self.dust.min_sellable_shares {
            return Ok(false);
        }

        warn!(
            %market_id,
            holdings = %holdings,
            "Found orphaned position while flat, promoting to BUY_FILLED"
        );
        self.recover_fill_data(exchange, state).await?;
        state.transition(Stage::BuyFilled)?;
        Ok(true)
    }

    /// Used when a BUY order id is unknown and no resting order was
    /// found: holdings mean the order filled before it was lost.
    pub async fn check_if_already_filled(
        &self,
        exchange: &dyn ExchangeClient,
        state: &TradingCycleState,
    ) -> Result<bool, OrbitError> {
        let Some(token_id) = state.token_id.clone() else {
            return Ok(false);
        };
        let holdings = exchange.get_holdings(&token_id).await?;
        Ok(holdings >= Decimal::ONE)
    }
}
