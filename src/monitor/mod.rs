//! Per-tick monitoring of resting orders.
//!
//! Monitors hold no connection of their own. Each polling tick the
//! controller fetches a fresh order snapshot and orderbook, hands them in,
//! and receives a verdict describing what (if anything) must happen to the
//! order. All cancellations, replacements, and persistence stay with the
//! controller, so a crash between tick and side effect loses nothing.

pub mod buy;
pub mod sell;

pub use buy::BuyFillMonitor;
pub use sell::SellFillMonitor;

use crate::liquidity::LiquidityVerdict;
use crate::risk::{RepricingDecision, StopLossOrder};
use crate::types::OrderStatus;
use rust_decimal::Decimal;

/// Outcome of one BUY monitoring tick.
#[derive(Debug, Clone, PartialEq)]
pub enum BuyVerdict {
    /// Order still resting; check again next tick.
    Pending,
    /// Fully filled.
    Filled { amount: Decimal, avg_price: Decimal },
    /// Timeout window elapsed; `partial` shares may already be filled.
    TimedOut { partial: Decimal },
    /// Liquidity deteriorated against the placement-time baseline.
    CancelledForLiquidity { verdict: LiquidityVerdict },
    /// Another bid moved above ours and took queue priority.
    CancelledForCompetition,
    /// The venue reports the order cancelled or expired.
    OrderGone { status: OrderStatus },
}

/// Outcome of one SELL monitoring tick.
#[derive(Debug, Clone, PartialEq)]
pub enum SellVerdict {
    /// Order still resting; check again next tick.
    Pending,
    /// Fully sold. `sold` and `proceeds` cover every replacement order of
    /// this position, not just the current one.
    Filled { sold: Decimal, proceeds: Decimal },
    /// Partially sold with an unsellable remainder; cancel and account for
    /// the sold portion only.
    FilledWithDustRemainder {
        sold: Decimal,
        proceeds: Decimal,
        remainder: Decimal,
    },
    /// Timeout window elapsed without a competitive extension.
    TimedOut,
    /// Liquidity deteriorated against the baseline; abandon the order.
    Deteriorated { verdict: LiquidityVerdict },
    /// Unrealized loss crossed the stop threshold; force an exit.
    StopLoss { order: StopLossOrder },
    /// The resting price no longer matches the book; cancel and re-place.
    Reprice { decision: RepricingDecision },
    /// The venue reports the order cancelled or expired.
    OrderGone { status: OrderStatus },
}
