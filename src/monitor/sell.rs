//! SELL order fill monitoring.
//!
//! A position can be sold across several replacement orders: each reprice
//! cancels a partially filled order and places a new one for the
//! remainder. The monitor keeps the running share and proceeds totals so a
//! final `Filled` verdict always describes the whole position. After a
//! restart the totals are rebuilt from venue trade history before the
//! monitor resumes.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

use crate::config::{LiquidityConfig, SellConfig};
use crate::liquidity::{self, LiquidityVerdict};
use crate::monitor::buy::hours_to_duration;
use crate::monitor::SellVerdict;
use crate::risk::{RepriceAction, RiskManager};
use crate::types::{OrderSnapshot, OrderbookSnapshot, TradingCycleState};

pub struct SellFillMonitor {
    cfg: SellConfig,
    liquidity_cfg: LiquidityConfig,
    placed_at: DateTime<Utc>,
    tick_count: u64,
    /// One competitive timeout extension per position, kept across
    /// replacement orders.
    timeout_extended: bool,
    sold_shares: Decimal,
    proceeds: Decimal,
}

impl SellFillMonitor {
    pub fn new(cfg: SellConfig, liquidity_cfg: LiquidityConfig, placed_at: DateTime<Utc>) -> Self {
        Self {
            cfg,
            liquidity_cfg,
            placed_at,
            tick_count: 0,
            timeout_extended: false,
            sold_shares: Decimal::ZERO,
            proceeds: Decimal::ZERO,
        }
    }

    /// Seed the running totals with sales recovered from trade history.
    pub fn with_prior_sales(mut self, sold: Decimal, proceeds: Decimal) -> Self {
        self.sold_shares = sold;
        self.proceeds = proceeds;
        self
    }

    /// Shares already sold on earlier replacement orders.
    pub fn sold_shares(&self) -> Decimal {
        self.sold_shares
    }

    pub fn proceeds(&self) -> Decimal {
        self.proceeds
    }

    /// Fold a cancelled order's partial fill into the running totals and
    /// restart the clock for its replacement.
    pub fn note_replacement(&mut self, cancelled: &OrderSnapshot, placed_at: DateTime<Utc>) {
        if cancelled.filled_size > Decimal::ZERO {
            self.sold_shares += cancelled.filled_size;
            self.proceeds += cancelled.filled_size * cancelled.effective_fill_price();
        }
        self.placed_at = placed_at;
        self.tick_count = 0;
    }

    pub fn assess(
        &mut self,
        order: &OrderSnapshot,
        current_book: &OrderbookSnapshot,
        initial_book: Option<&OrderbookSnapshot>,
        state: &TradingCycleState,
        risk: &RiskManager,
        now: DateTime<Utc>,
    ) -> SellVerdict {
        self.tick_count += 1;

        if order.is_fully_filled() {
            let sold_now = if order.filled_size > Decimal::ZERO {
                order.filled_size
            } else {
                order.size
            };
            return SellVerdict::Filled {
                sold: self.sold_shares + sold_now,
                proceeds: self.proceeds + sold_now * order.effective_fill_price(),
            };
        }

        if order.status.is_gone() {
            return SellVerdict::OrderGone {
                status: order.status,
            };
        }

        if risk.remainder_is_dust(order) {
            return SellVerdict::FilledWithDustRemainder {
                sold: self.sold_shares + order.filled_size,
                proceeds: self.proceeds + order.filled_size * order.effective_fill_price(),
                remainder: order.remaining(),
            };
        }

        let verdict = match initial_book {
            Some(initial) => liquidity::assess(initial, current_book, &self.liquidity_cfg),
            None => LiquidityVerdict::neutral(),
        };

        let stop = if self.tick_count % risk.stop_loss_cadence() == 0 {
            risk.evaluate_stop_loss(state, current_book)
        } else {
            None
        };
        let reprice = if self.reprice_check_due() {
            let decision = risk.evaluate_reprice(state, order, current_book, &verdict);
            debug!(tick = self.tick_count, %decision, "Reprice check");
            (!matches!(decision.action, RepriceAction::None)).then_some(decision)
        } else {
            None
        };

        if risk.stop_loss_priority() {
            if let Some(order) = stop {
                return SellVerdict::StopLoss { order };
            }
            if let Some(decision) = reprice {
                return SellVerdict::Reprice { decision };
            }
        } else {
            if let Some(decision) = reprice {
                return SellVerdict::Reprice { decision };
            }
            if let Some(order) = stop {
                return SellVerdict::StopLoss { order };
            }
        }

        if self.liquidity_check_due() && verdict.deteriorated {
            return SellVerdict::Deteriorated { verdict };
        }

        if now - self.placed_at >= hours_to_duration(self.cfg.order_timeout_hours) {
            if !self.timeout_extended && self.is_competitive(order, current_book) {
                self.timeout_extended = true;
                self.placed_at = now;
                debug!(
                    price = %order.price,
                    "Sell timed out at a competitive price, extending once"
                );
                return SellVerdict::Pending;
            }
            return SellVerdict::TimedOut;
        }

        SellVerdict::Pending
    }

    fn reprice_check_due(&self) -> bool {
        let every = self.cfg.reprice_check_every_n_ticks.max(1);
        self.tick_count % every == 0
    }

    fn liquidity_check_due(&self) -> bool {
        let every = self.cfg.liquidity_check_every_n_ticks.max(1);
        self.tick_count % every == 0
    }

    /// Near the front of the ask queue: the order is about to fill, so a
    /// timeout cancel would throw that priority away.
    fn is_competitive(&self, order: &OrderSnapshot, book: &OrderbookSnapshot) -> bool {
        let Some(best_ask) = book.best_ask() else {
            return false;
        };
        if best_ask <= Decimal::ZERO {
            return false;
        }
        let distance_pct = ((order.price - best_ask).abs() / best_ask) * dec!(100);
        distance_pct <= self.cfg.timeout_competitive_pct
    }
}
