//! Maker price selection for both legs.
//!
//! Prices are quoted on the 0 to 1 outcome-share scale with a 0.001 tick.
//! The BUY improves the best bid by a spread-dependent step without ever
//! crossing the ask; the SELL undercuts the best ask while staying above
//! the best bid. Sell pricing is total: a book missing one or both sides
//! falls back to synthetic quotes near the price ceiling so an open
//! position can always be listed.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

use crate::types::{OrbitError, OrderbookSnapshot, PRICE_TICK};

const PRICE_DECIMALS: u32 = 3;

/// Synthetic best ask used when the ask side is empty.
const FALLBACK_ASK: Decimal = dec!(0.96);
/// Synthetic best bid used when both sides are empty.
const FALLBACK_BID: Decimal = dec!(0.95);

pub struct PricingEngine;

impl PricingEngine {
    /// Maker BUY price: join the queue on tight spreads, improve the bid
    /// by a fixed step on wider ones, and always stay a tick under the
    /// ask. Books that cannot support a maker buy are rejected.
    pub fn buy_price(book: &OrderbookSnapshot) -> Result<Decimal, OrbitError> {
        let (Some(bid), Some(ask)) = (book.best_bid(), book.best_ask()) else {
            return Err(OrbitError::OrderRejected(
                "book is missing a side, cannot price a buy".to_string(),
            ));
        };
        if bid >= ask {
            return Err(OrbitError::OrderRejected(format!(
                "crossed book (bid {bid} >= ask {ask})"
            )));
        }

        let spread = ask - bid;
        let step = if spread <= dec!(0.02) {
            Decimal::ZERO
        } else if spread <= dec!(0.05) {
            dec!(0.01)
        } else if spread <= dec!(0.10) {
            dec!(0.02)
        } else {
            dec!(0.03)
        };

        let price = (bid + step)
            .min(ask - PRICE_TICK)
            .round_dp_with_strategy(PRICE_DECIMALS, RoundingStrategy::ToNegativeInfinity)
            .max(PRICE_TICK);
        Ok(price)
    }

    /// Maker SELL price: one tick under the best ask, clamped above the
    /// best bid.
    pub fn sell_price(book: &OrderbookSnapshot) -> Decimal {
        let ask = book.best_ask().unwrap_or(FALLBACK_ASK);
        let bid = book
            .best_bid()
            .unwrap_or_else(|| (ask - PRICE_TICK * dec!(2)).min(FALLBACK_BID));

        (ask - PRICE_TICK)
            .max(bid + PRICE_TICK)
            .min(ask)
            .round_dp(PRICE_DECIMALS)
    }
}
