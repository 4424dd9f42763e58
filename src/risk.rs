//! Stop-loss enforcement and sell-order repricing.
//!
//! The manager is consulted by the sell monitor each tick. It never touches
//! the exchange itself: it reads the cycle state plus fresh snapshots and
//! returns what should happen to the resting SELL. The controller executes
//! the side effects and persists.

use crate::config::{DustConfig, RepriceMode, RiskConfig, SellConfig};
use crate::liquidity::LiquidityVerdict;
use crate::types::{OrderSnapshot, OrderbookSnapshot, TradingCycleState, PRICE_TICK};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use std::fmt;
use tracing::debug;

const PRICE_DECIMALS: u32 = 3;

/// What the resting SELL order should do this tick.
#[derive(Debug, Clone, PartialEq)]
pub enum RepriceAction {
    /// Keep the order as it is.
    None,
    /// Cancel without replacing; the unfilled remainder is dust.
    Cancel,
    /// Cancel and re-place at the new price.
    Reprice(Decimal),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RepricingDecision {
    pub action: RepriceAction,
    pub reason: String,
}

impl RepricingDecision {
    fn hold(reason: impl Into<String>) -> Self {
        Self {
            action: RepriceAction::None,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for RepricingDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.action {
            RepriceAction::None => write!(f, "hold ({})", self.reason),
            RepriceAction::Cancel => write!(f, "cancel ({})", self.reason),
            RepriceAction::Reprice(p) => write!(f, "reprice to {} ({})", p, self.reason),
        }
    }
}

/// Forced exit produced by a stop-loss trigger.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopLossOrder {
    pub exit_price: Decimal,
    pub unrealized_pnl_pct: Decimal,
}

pub struct RiskManager {
    risk: RiskConfig,
    sell: SellConfig,
    dust: DustConfig,
}

impl RiskManager {
    pub fn new(risk: RiskConfig, sell: SellConfig, dust: DustConfig) -> Self {
        Self { risk, sell, dust }
    }

    /// Stop-loss wins over a same-tick reprice when true.
    pub fn stop_loss_priority(&self) -> bool {
        self.risk.stop_loss_priority
    }

    /// Ticks between stop-loss evaluations, never zero.
    pub fn stop_loss_cadence(&self) -> u64 {
        self.risk.stop_loss_check_every_n_ticks.max(1)
    }

    /// One-shot stop-loss check. Fires at or below the configured
    /// unrealized-loss threshold and never again for the same cycle; the
    /// exit price undercuts the best bid and is floored to the tick so it
    /// always rests at or below the bid.
    pub fn evaluate_stop_loss(
        &self,
        state: &TradingCycleState,
        book: &OrderbookSnapshot,
    ) -> Option<StopLossOrder> {
        if !self.risk.enable_stop_loss || state.stop_loss_triggered {
            return None;
        }
        let bid = book.best_bid()?;
        let pnl = state.unrealized_pnl_pct(bid)?;
        if pnl > self.risk.stop_loss_trigger_pct {
            return None;
        }
        let exit_price = (bid * (Decimal::ONE - self.risk.stop_loss_aggressive_offset))
            .round_dp_with_strategy(PRICE_DECIMALS, RoundingStrategy::ToNegativeInfinity);
        debug!(
            unrealized_pnl_pct = %pnl,
            exit_price = %exit_price,
            "Stop-loss threshold crossed"
        );
        Some(StopLossOrder {
            exit_price,
            unrealized_pnl_pct: pnl,
        })
    }

    /// True when a partially filled order's unfilled remainder is too
    /// small to re-place: under the minimum sellable share count or under
    /// the venue's minimum order value.
    pub fn remainder_is_dust(&self, order: &OrderSnapshot) -> bool {
        let remaining = order.remaining();
        if order.filled_size <= Decimal::ZERO || remaining <= Decimal::ZERO {
            return false;
        }
        remaining < self.dust.min_sellable_shares
            || remaining * order.price < self.dust.min_order_value
    }

    /// Repricing decision for the resting SELL. Checked in order: dust
    /// remainder, upward recovery, then the liquidity-drop reprice with
    /// floor clamp and churn guard.
    pub fn evaluate_reprice(
        &self,
        state: &TradingCycleState,
        order: &OrderSnapshot,
        book: &OrderbookSnapshot,
        liquidity: &LiquidityVerdict,
    ) -> RepricingDecision {
        if self.remainder_is_dust(order) {
            let remaining = order.remaining();
            return RepricingDecision {
                action: RepriceAction::Cancel,
                reason: format!(
                    "unfilled remainder {remaining} (${:.2}) is dust",
                    remaining * order.price
                ),
            };
        }

        if let Some(decision) = self.evaluate_recovery(state, order, book, liquidity) {
            return decision;
        }

        if liquidity.bid_drop_pct < self.sell.reprice_liquidity_threshold_pct {
            return RepricingDecision::hold(format!(
                "bid drop {:.2}% below reprice threshold",
                liquidity.bid_drop_pct
            ));
        }

        let Some(best_bid) = book.best_bid() else {
            return RepricingDecision::hold("no bids to reprice against");
        };

        let candidate = match self.sell.reprice_mode {
            RepriceMode::Best => best_bid + PRICE_TICK,
            RepriceMode::SecondBest => book.second_best_bid().unwrap_or(best_bid + PRICE_TICK),
            RepriceMode::LiquidityPercent => self
                .liquidity_percent_price(book)
                .unwrap_or(best_bid + PRICE_TICK),
        };
        let mut candidate = candidate.round_dp(PRICE_DECIMALS);

        if !self.sell.allow_below_buy_price {
            if let Some(avg) = state.avg_fill_price {
                let floor = (avg
                    * (Decimal::ONE - self.sell.max_price_reduction_pct / dec!(100)))
                .round_dp(PRICE_DECIMALS);
                if let Some(best_ask) = book.best_ask() {
                    if floor > best_ask {
                        return RepricingDecision::hold(format!(
                            "price floor {floor} sits above best ask {best_ask}"
                        ));
                    }
                }
                candidate = candidate.max(floor);
            }
        }

        if !self.change_is_significant(order.price, candidate) {
            return RepricingDecision::hold(format!(
                "candidate {candidate} within churn threshold of {}",
                order.price
            ));
        }

        RepricingDecision {
            action: RepriceAction::Reprice(candidate),
            reason: format!(
                "bid drop {:.2}% >= {:.2}% threshold ({:?} mode)",
                liquidity.bid_drop_pct, self.sell.reprice_liquidity_threshold_pct,
                self.sell.reprice_mode
            ),
        }
    }

    /// Upward re-price once the book has recovered. Moves toward, never
    /// above, the cycle's original sell target, and never across the ask.
    fn evaluate_recovery(
        &self,
        state: &TradingCycleState,
        order: &OrderSnapshot,
        book: &OrderbookSnapshot,
        liquidity: &LiquidityVerdict,
    ) -> Option<RepricingDecision> {
        if !self.sell.dynamic_price_adjustment {
            return None;
        }
        if liquidity.bid_drop_pct >= self.sell.reprice_liquidity_return_pct {
            return None;
        }
        let target = state.target_sell_price?;
        if order.price >= target {
            return None;
        }
        let best_ask = book.best_ask()?;
        let candidate = target.min(best_ask).round_dp(PRICE_DECIMALS);
        if candidate <= order.price || !self.change_is_significant(order.price, candidate) {
            return None;
        }
        Some(RepricingDecision {
            action: RepriceAction::Reprice(candidate),
            reason: format!(
                "liquidity recovered (bid drop {:.2}%), moving back toward target {target}",
                liquidity.bid_drop_pct
            ),
        })
    }

    /// Price at which cumulative bid depth reaches the configured percent
    /// of total depth, walking the ladder best-first.
    fn liquidity_percent_price(&self, book: &OrderbookSnapshot) -> Option<Decimal> {
        let ladder = book.sorted_bids();
        let total: Decimal = ladder.iter().map(|l| l.size).sum();
        if total <= Decimal::ZERO {
            return None;
        }
        let target = total * self.sell.reprice_liquidity_target_pct / dec!(100);
        let mut cumulative = Decimal::ZERO;
        for level in &ladder {
            cumulative += level.size;
            if cumulative >= target {
                return Some(level.price);
            }
        }
        ladder.last().map(|l| l.price)
    }

    fn change_is_significant(&self, current: Decimal, candidate: Decimal) -> bool {
        if current <= Decimal::ZERO {
            return candidate != current;
        }
        let change_pct = ((candidate - current).abs() / current) * dec!(100);
        change_pct >= self.sell.min_reprice_change_pct
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderSide, OrderStatus, PriceLevel};

    fn make_manager() -> RiskManager {
        RiskManager::new(
            RiskConfig::default(),
            SellConfig::default(),
            DustConfig::default(),
        )
    }

    fn make_manager_with_sell(sell: SellConfig) -> RiskManager {
        RiskManager::new(RiskConfig::default(), sell, DustConfig::default())
    }

    fn make_book(bid: Decimal, ask: Decimal) -> OrderbookSnapshot {
        OrderbookSnapshot::new(
            vec![PriceLevel::new(bid, dec!(100.0))],
            vec![PriceLevel::new(ask, dec!(100.0))],
        )
    }

    fn make_sell_order(price: Decimal) -> OrderSnapshot {
        OrderSnapshot {
            order_id: "sell-1".to_string(),
            side: OrderSide::Sell,
            price,
            size: dec!(250.0),
            filled_size: Decimal::ZERO,
            avg_fill_price: None,
            status: OrderStatus::Pending,
        }
    }

    fn drop_of(pct: Decimal) -> LiquidityVerdict {
        LiquidityVerdict {
            bid_drop_pct: pct,
            spread_pct: dec!(2.0),
            deteriorated: false,
        }
    }

    // -- Stop-loss tests --

    #[test]
    fn test_stop_loss_fires_at_threshold() {
        let manager = make_manager();
        let state = TradingCycleState::sample_buy_filled();
        // 250 * 0.352 = 88.0 against 100.0 committed: -12%.
        let book = make_book(dec!(0.352), dec!(0.40));

        let stop = manager.evaluate_stop_loss(&state, &book).unwrap();
        assert_eq!(stop.unrealized_pnl_pct, dec!(-12.0));
        // 0.352 * 0.999 = 0.351648, floored to the tick.
        assert_eq!(stop.exit_price, dec!(0.351));
    }

    #[test]
    fn test_stop_loss_is_one_shot() {
        let manager = make_manager();
        let mut state = TradingCycleState::sample_buy_filled();
        state.stop_loss_triggered = true;
        let book = make_book(dec!(0.352), dec!(0.40));

        assert!(
            manager.evaluate_stop_loss(&state, &book).is_none(),
            "an identical later tick must not re-trigger"
        );
    }

    #[test]
    fn test_stop_loss_respects_trigger_boundary() {
        let manager = make_manager();
        let state = TradingCycleState::sample_buy_filled();

        // -9.975%: above the -10% trigger.
        let book = make_book(dec!(0.3601), dec!(0.40));
        assert!(manager.evaluate_stop_loss(&state, &book).is_none());

        // Exactly -10% fires.
        let book = make_book(dec!(0.36), dec!(0.40));
        assert!(manager.evaluate_stop_loss(&state, &book).is_some());
    }

    #[test]
    fn test_stop_loss_disabled() {
        let manager = RiskManager::new(
            RiskConfig {
                enable_stop_loss: false,
                ..RiskConfig::default()
            },
            SellConfig::default(),
            DustConfig::default(),
        );
        let state = TradingCycleState::sample_buy_filled();
        let book = make_book(dec!(0.30), dec!(0.35));
        assert!(manager.evaluate_stop_loss(&state, &book).is_none());
    }

    // -- Reprice trigger tests --

    #[test]
    fn test_reprice_gated_by_threshold() {
        let manager = make_manager();
        let state = TradingCycleState::sample_buy_filled();
        let order = make_sell_order(dec!(0.45));
        let book = make_book(dec!(0.40), dec!(0.46));

        let held = manager.evaluate_reprice(&state, &order, &book, &drop_of(dec!(49.9)));
        assert_eq!(held.action, RepriceAction::None);

        let fired = manager.evaluate_reprice(&state, &order, &book, &drop_of(dec!(50.0)));
        assert!(matches!(fired.action, RepriceAction::Reprice(_)));
    }

    #[test]
    fn test_best_mode_prices_one_tick_above_bid() {
        let mut state = TradingCycleState::sample_buy_filled();
        state.avg_fill_price = Some(dec!(0.40));
        let manager = make_manager();
        let order = make_sell_order(dec!(0.45));
        let book = make_book(dec!(0.42), dec!(0.46));

        let decision = manager.evaluate_reprice(&state, &order, &book, &drop_of(dec!(55.0)));
        assert_eq!(decision.action, RepriceAction::Reprice(dec!(0.421)));
    }

    #[test]
    fn test_second_best_mode_uses_second_level() {
        let sell = SellConfig {
            reprice_mode: RepriceMode::SecondBest,
            ..SellConfig::default()
        };
        let manager = make_manager_with_sell(sell);
        let mut state = TradingCycleState::sample_buy_filled();
        state.avg_fill_price = Some(dec!(0.40));
        let order = make_sell_order(dec!(0.45));
        let book = OrderbookSnapshot::new(
            vec![
                PriceLevel::new(dec!(0.42), dec!(50.0)),
                PriceLevel::new(dec!(0.41), dec!(80.0)),
            ],
            vec![PriceLevel::new(dec!(0.46), dec!(40.0))],
        );

        let decision = manager.evaluate_reprice(&state, &order, &book, &drop_of(dec!(60.0)));
        assert_eq!(decision.action, RepriceAction::Reprice(dec!(0.41)));
    }

    #[test]
    fn test_liquidity_percent_mode_walks_depth() {
        let sell = SellConfig {
            reprice_mode: RepriceMode::LiquidityPercent,
            reprice_liquidity_target_pct: dec!(30.0),
            ..SellConfig::default()
        };
        let manager = make_manager_with_sell(sell);
        let mut state = TradingCycleState::sample_buy_filled();
        state.avg_fill_price = Some(dec!(0.40));
        let order = make_sell_order(dec!(0.45));
        // Total depth 400; 30% target = 120. Cumulative hits 200 at 0.39.
        let book = OrderbookSnapshot::new(
            vec![
                PriceLevel::new(dec!(0.40), dec!(100.0)),
                PriceLevel::new(dec!(0.39), dec!(100.0)),
                PriceLevel::new(dec!(0.38), dec!(200.0)),
            ],
            vec![PriceLevel::new(dec!(0.46), dec!(40.0))],
        );

        let decision = manager.evaluate_reprice(&state, &order, &book, &drop_of(dec!(60.0)));
        assert_eq!(decision.action, RepriceAction::Reprice(dec!(0.39)));
    }

    // -- Floor tests --

    #[test]
    fn test_floor_clamps_candidate() {
        let manager = make_manager();
        let mut state = TradingCycleState::sample_buy_filled();
        state.avg_fill_price = Some(dec!(0.50));
        let order = make_sell_order(dec!(0.52));
        // Best mode candidate would be 0.401; floor is 0.50 * 0.95 = 0.475.
        let book = make_book(dec!(0.40), dec!(0.48));

        let decision = manager.evaluate_reprice(&state, &order, &book, &drop_of(dec!(60.0)));
        assert_eq!(decision.action, RepriceAction::Reprice(dec!(0.475)));
    }

    #[test]
    fn test_floor_above_ask_rejects_reprice() {
        let manager = make_manager();
        let mut state = TradingCycleState::sample_buy_filled();
        state.avg_fill_price = Some(dec!(0.50));
        // Floor 0.475 sits above the 0.47 ask: keep the existing order.
        let order = make_sell_order(dec!(0.52));
        let book = make_book(dec!(0.40), dec!(0.47));

        let decision = manager.evaluate_reprice(&state, &order, &book, &drop_of(dec!(60.0)));
        assert_eq!(decision.action, RepriceAction::None);
        assert!(decision.reason.contains("floor"));
    }

    #[test]
    fn test_allow_below_buy_price_skips_floor() {
        let sell = SellConfig {
            allow_below_buy_price: true,
            ..SellConfig::default()
        };
        let manager = make_manager_with_sell(sell);
        let mut state = TradingCycleState::sample_buy_filled();
        state.avg_fill_price = Some(dec!(0.50));
        let order = make_sell_order(dec!(0.52));
        let book = make_book(dec!(0.40), dec!(0.47));

        let decision = manager.evaluate_reprice(&state, &order, &book, &drop_of(dec!(60.0)));
        assert_eq!(decision.action, RepriceAction::Reprice(dec!(0.401)));
    }

    // -- Churn and dust tests --

    #[test]
    fn test_churn_guard_suppresses_tiny_moves() {
        let manager = make_manager();
        let mut state = TradingCycleState::sample_buy_filled();
        state.avg_fill_price = Some(dec!(0.40));
        // Candidate 0.421 vs resting 0.420: 0.24% change, under 0.5%.
        let order = make_sell_order(dec!(0.420));
        let book = make_book(dec!(0.42), dec!(0.46));

        let decision = manager.evaluate_reprice(&state, &order, &book, &drop_of(dec!(60.0)));
        assert_eq!(decision.action, RepriceAction::None);
        assert!(decision.reason.contains("churn"));
    }

    #[test]
    fn test_dust_remainder_cancels() {
        let manager = make_manager();
        let state = TradingCycleState::sample_buy_filled();
        let mut order = make_sell_order(dec!(0.45));
        order.filled_size = dec!(246.0);
        order.status = OrderStatus::PartiallyFilled;
        // Remainder 4.0 shares < 5.0 minimum.
        let book = make_book(dec!(0.44), dec!(0.46));

        let decision = manager.evaluate_reprice(&state, &order, &book, &drop_of(dec!(0.0)));
        assert_eq!(decision.action, RepriceAction::Cancel);
    }

    // -- Recovery tests --

    #[test]
    fn test_recovery_moves_back_toward_target() {
        let manager = make_manager();
        let mut state = TradingCycleState::sample_buy_filled();
        state.avg_fill_price = Some(dec!(0.40));
        state.target_sell_price = Some(dec!(0.45));
        let order = make_sell_order(dec!(0.42));
        let book = make_book(dec!(0.44), dec!(0.46));

        let decision = manager.evaluate_reprice(&state, &order, &book, &drop_of(dec!(10.0)));
        assert_eq!(decision.action, RepriceAction::Reprice(dec!(0.45)));
        assert!(decision.reason.contains("recovered"));
    }

    #[test]
    fn test_recovery_never_exceeds_target_or_ask() {
        let manager = make_manager();
        let mut state = TradingCycleState::sample_buy_filled();
        state.avg_fill_price = Some(dec!(0.40));
        state.target_sell_price = Some(dec!(0.45));
        let order = make_sell_order(dec!(0.42));
        // Ask below target caps the recovery price.
        let book = make_book(dec!(0.43), dec!(0.44));

        let decision = manager.evaluate_reprice(&state, &order, &book, &drop_of(dec!(10.0)));
        assert_eq!(decision.action, RepriceAction::Reprice(dec!(0.44)));
    }

    #[test]
    fn test_recovery_idle_at_target() {
        let manager = make_manager();
        let mut state = TradingCycleState::sample_buy_filled();
        state.target_sell_price = Some(dec!(0.45));
        let order = make_sell_order(dec!(0.45));
        let book = make_book(dec!(0.44), dec!(0.46));

        let decision = manager.evaluate_reprice(&state, &order, &book, &drop_of(dec!(5.0)));
        assert_eq!(decision.action, RepriceAction::None);
    }

    #[test]
    fn test_recovery_disabled_by_config() {
        let sell = SellConfig {
            dynamic_price_adjustment: false,
            ..SellConfig::default()
        };
        let manager = make_manager_with_sell(sell);
        let mut state = TradingCycleState::sample_buy_filled();
        state.target_sell_price = Some(dec!(0.45));
        let order = make_sell_order(dec!(0.42));
        let book = make_book(dec!(0.44), dec!(0.46));

        let decision = manager.evaluate_reprice(&state, &order, &book, &drop_of(dec!(10.0)));
        assert_eq!(decision.action, RepriceAction::None);
    }
}
