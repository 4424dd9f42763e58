//! BUY order fill monitoring.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

use crate::config::{BuyConfig, LiquidityConfig};
use crate::liquidity;
use crate::monitor::BuyVerdict;
use crate::types::{OrderSnapshot, OrderbookSnapshot, PRICE_TICK};

/// Watches a resting BUY until it fills, times out, or the market turns.
///
/// The fill check runs before every cancellation-triggering check, so a
/// filled order can never be cancelled by a stale liquidity or timeout
/// verdict on the same tick.
pub struct BuyFillMonitor {
    cfg: BuyConfig,
    liquidity_cfg: LiquidityConfig,
    placed_at: DateTime<Utc>,
    tick_count: u64,
}

impl BuyFillMonitor {
    pub fn new(cfg: BuyConfig, liquidity_cfg: LiquidityConfig, placed_at: DateTime<Utc>) -> Self {
        Self {
            cfg,
            liquidity_cfg,
            placed_at,
            tick_count: 0,
        }
    }

    pub fn assess(
        &mut self,
        order: &OrderSnapshot,
        current_book: &OrderbookSnapshot,
        initial_book: Option<&OrderbookSnapshot>,
        now: DateTime<Utc>,
    ) -> BuyVerdict {
        self.tick_count += 1;

        if order.is_fully_filled() {
            let amount = if order.filled_size > Decimal::ZERO {
                order.filled_size
            } else {
                order.size
            };
            return BuyVerdict::Filled {
                amount,
                avg_price: order.effective_fill_price(),
            };
        }

        if order.status.is_gone() {
            return BuyVerdict::OrderGone {
                status: order.status,
            };
        }

        if now - self.placed_at >= hours_to_duration(self.cfg.order_timeout_hours) {
            return BuyVerdict::TimedOut {
                partial: order.filled_size,
            };
        }

        if self.cfg.cancel_on_liquidity && self.liquidity_check_due() {
            if let Some(initial) = initial_book {
                let verdict = liquidity::assess(initial, current_book, &self.liquidity_cfg);
                debug!(tick = self.tick_count, %verdict, "Buy-side liquidity check");
                if verdict.deteriorated {
                    return BuyVerdict::CancelledForLiquidity { verdict };
                }
            }
        }

        if self.cfg.cancel_on_competition {
            if let Some(best_bid) = current_book.best_bid() {
                if best_bid >= order.price + PRICE_TICK {
                    return BuyVerdict::CancelledForCompetition;
                }
            }
        }

        BuyVerdict::Pending
    }

    fn liquidity_check_due(&self) -> bool {
        let every = self.cfg.liquidity_check_every_n_ticks.max(1);
        self.tick_count % every == 0
    }
}

pub(crate) fn hours_to_duration(hours: Decimal) -> Duration {
    let secs = (hours * dec!(3600)).to_i64().unwrap_or(0);
    Duration::seconds(secs.max(0))
}
