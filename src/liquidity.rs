//! Orderbook deterioration metrics.
//!
//! The guard compares the current book against the baseline captured when
//! the BUY was placed and reduces the difference to two numbers: how far
//! the best bid has fallen and how wide the spread has become. It performs
//! no I/O and holds no state; the monitors decide what to do with the
//! verdict.

use crate::config::LiquidityConfig;
use crate::types::OrderbookSnapshot;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::fmt;

/// Outcome of one guard evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiquidityVerdict {
    /// Percent fall of the best bid vs the baseline, clamped at zero.
    pub bid_drop_pct: Decimal,
    /// Current spread as a percent of the best bid.
    pub spread_pct: Decimal,
    pub deteriorated: bool,
}

impl LiquidityVerdict {
    /// Verdict used when the book cannot be judged. A transient glitch in
    /// the feed must never cancel a live order.
    pub fn neutral() -> Self {
        Self {
            bid_drop_pct: Decimal::ZERO,
            spread_pct: Decimal::ZERO,
            deteriorated: false,
        }
    }
}

impl fmt::Display for LiquidityVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bid drop {:.2}%, spread {:.2}%{}",
            self.bid_drop_pct,
            self.spread_pct,
            if self.deteriorated {
                " (deteriorated)"
            } else {
                ""
            }
        )
    }
}

/// Compares `current` against `initial`. Missing ladders or non-positive
/// best prices yield [`LiquidityVerdict::neutral`]. Deterioration requires
/// strictly exceeding a threshold; sitting exactly on one does not count.
pub fn assess(
    initial: &OrderbookSnapshot,
    current: &OrderbookSnapshot,
    cfg: &LiquidityConfig,
) -> LiquidityVerdict {
    let (Some(initial_bid), Some(current_bid), Some(current_ask)) =
        (initial.best_bid(), current.best_bid(), current.best_ask())
    else {
        return LiquidityVerdict::neutral();
    };
    if initial_bid <= Decimal::ZERO || current_bid <= Decimal::ZERO {
        return LiquidityVerdict::neutral();
    }

    let bid_drop_pct =
        ((initial_bid - current_bid) / initial_bid * dec!(100)).max(Decimal::ZERO);
    let spread_pct = (current_ask - current_bid) / current_bid * dec!(100);
    let deteriorated =
        bid_drop_pct > cfg.bid_drop_threshold_pct || spread_pct > cfg.spread_threshold_pct;

    LiquidityVerdict {
        bid_drop_pct,
        spread_pct,
        deteriorated,
    }
}
