//! Core domain types shared across the agent.
//!
//! Everything that crosses a component boundary lives here: the cycle stage
//! machine, order and orderbook snapshots, the persisted cycle record, and
//! the error taxonomy. Money is always `Decimal`; `f64` never carries a
//! price, a size, or a P&L figure.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Schema version written into every persisted cycle record.
pub const STATE_VERSION: u32 = 1;

/// Smallest price increment quoted on the exchange.
pub const PRICE_TICK: Decimal = dec!(0.001);

/// Tolerance for the `capital_committed == filled_amount * avg_fill_price`
/// invariant once a BUY has filled.
pub const CAPITAL_TOLERANCE: Decimal = dec!(0.01);

// ---------------------------------------------------------------------------
// Cycle stages
// ---------------------------------------------------------------------------

/// Stages of the single-position trading cycle.
///
/// The cycle only ever advances along the edges in [`Stage::can_transition_to`];
/// recovery edges lead back to `Scanning` (or to `BuyFilled` when a held
/// position must be re-listed). Anything else is a desync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Idle,
    Scanning,
    BuyPlaced,
    BuyMonitoring,
    BuyFilled,
    SellPlaced,
    SellMonitoring,
    Completed,
}

impl Stage {
    /// Forward and recovery edges of the cycle graph.
    pub fn can_transition_to(self, next: Stage) -> bool {
        use Stage::*;
        matches!(
            (self, next),
            (Idle, Scanning)
                | (Scanning, BuyPlaced)
                | (Scanning, BuyFilled)
                | (Scanning, Idle)
                | (BuyPlaced, BuyMonitoring)
                | (BuyPlaced, Scanning)
                | (BuyMonitoring, BuyFilled)
                | (BuyMonitoring, Scanning)
                | (BuyFilled, SellPlaced)
                | (BuyFilled, Completed)
                | (BuyFilled, Scanning)
                | (SellPlaced, SellMonitoring)
                | (SellPlaced, Scanning)
                | (SellMonitoring, Completed)
                | (SellMonitoring, BuyFilled)
                | (SellMonitoring, Scanning)
                | (Completed, Idle)
        )
    }

    /// True while a resting order is being polled.
    pub fn is_monitoring(self) -> bool {
        matches!(self, Stage::BuyMonitoring | Stage::SellMonitoring)
    }

    /// True when the cycle should hold no position and no resting order.
    pub fn is_flat(self) -> bool {
        matches!(self, Stage::Idle | Stage::Scanning | Stage::Completed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Idle => "IDLE",
            Stage::Scanning => "SCANNING",
            Stage::BuyPlaced => "BUY_PLACED",
            Stage::BuyMonitoring => "BUY_MONITORING",
            Stage::BuyFilled => "BUY_FILLED",
            Stage::SellPlaced => "SELL_PLACED",
            Stage::SellMonitoring => "SELL_MONITORING",
            Stage::Completed => "COMPLETED",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Order primitives
// ---------------------------------------------------------------------------

/// Which outcome token of a binary market a position is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeSide {
    Yes,
    No,
}

impl OutcomeSide {
    pub fn opposite(self) -> Self {
        match self {
            OutcomeSide::Yes => OutcomeSide::No,
            OutcomeSide::No => OutcomeSide::Yes,
        }
    }
}

impl fmt::Display for OutcomeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeSide::Yes => write!(f, "YES"),
            OutcomeSide::No => write!(f, "NO"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    PartiallyFilled,
    Filled,
    Cancelled,
    Expired,
}

impl OrderStatus {
    /// The order will never fill further.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Expired
        )
    }

    /// The order disappeared without filling completely.
    pub fn is_gone(self) -> bool {
        matches!(self, OrderStatus::Cancelled | OrderStatus::Expired)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::Pending => "pending",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Expired => "expired",
        };
        write!(f, "{s}")
    }
}

/// Point-in-time view of a resting order. Read-only to the monitors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub order_id: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub size: Decimal,
    pub filled_size: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub status: OrderStatus,
}

impl OrderSnapshot {
    pub fn remaining(&self) -> Decimal {
        (self.size - self.filled_size).max(Decimal::ZERO)
    }

    /// Average fill price, falling back to the limit price when the venue
    /// does not report one.
    pub fn effective_fill_price(&self) -> Decimal {
        match self.avg_fill_price {
            Some(p) if p > Decimal::ZERO => p,
            _ => self.price,
        }
    }

    pub fn is_fully_filled(&self) -> bool {
        self.status == OrderStatus::Filled
            || (self.size > Decimal::ZERO && self.filled_size >= self.size)
    }

    #[cfg(test)]
    pub fn sample(side: OrderSide) -> Self {
        Self {
            order_id: "ord-1001".to_string(),
            side,
            price: dec!(0.40),
            size: dec!(250.0),
            filled_size: Decimal::ZERO,
            avg_fill_price: None,
            status: OrderStatus::Pending,
        }
    }
}

/// One executed trade from the venue's history endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub size: Decimal,
    pub executed_at: DateTime<Utc>,
}

impl Fill {
    pub fn notional(&self) -> Decimal {
        self.price * self.size
    }
}

// ---------------------------------------------------------------------------
// Orderbook
// ---------------------------------------------------------------------------

/// One price level of an orderbook ladder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub size: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }

    pub fn notional(&self) -> Decimal {
        self.price * self.size
    }
}

/// Immutable point-in-time capture of a market's book. Ladders may arrive
/// unsorted from the venue, so best prices are computed, not indexed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderbookSnapshot {
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub captured_at: DateTime<Utc>,
}

impl OrderbookSnapshot {
    pub fn new(bids: Vec<PriceLevel>, asks: Vec<PriceLevel>) -> Self {
        Self {
            bids,
            asks,
            captured_at: Utc::now(),
        }
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids
            .iter()
            .filter(|l| l.price > Decimal::ZERO)
            .map(|l| l.price)
            .max()
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks
            .iter()
            .filter(|l| l.price > Decimal::ZERO)
            .map(|l| l.price)
            .min()
    }

    /// Bid ladder sorted best-first, zero levels dropped.
    pub fn sorted_bids(&self) -> Vec<PriceLevel> {
        let mut bids: Vec<PriceLevel> = self
            .bids
            .iter()
            .copied()
            .filter(|l| l.price > Decimal::ZERO && l.size > Decimal::ZERO)
            .collect();
        bids.sort_by(|a, b| b.price.cmp(&a.price));
        bids
    }

    pub fn second_best_bid(&self) -> Option<Decimal> {
        self.sorted_bids().get(1).map(|l| l.price)
    }

    pub fn total_bid_depth(&self) -> Decimal {
        self.bids.iter().map(|l| l.size).sum()
    }

    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / dec!(2)),
            _ => None,
        }
    }

    pub fn is_crossed(&self) -> bool {
        matches!(
            (self.best_bid(), self.best_ask()),
            (Some(bid), Some(ask)) if bid >= ask
        )
    }

    #[cfg(test)]
    pub fn sample() -> Self {
        Self {
            bids: vec![
                PriceLevel::new(dec!(0.60), dec!(100.0)),
                PriceLevel::new(dec!(0.59), dec!(150.0)),
                PriceLevel::new(dec!(0.58), dec!(200.0)),
            ],
            asks: vec![
                PriceLevel::new(dec!(0.62), dec!(80.0)),
                PriceLevel::new(dec!(0.63), dec!(120.0)),
            ],
            captured_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Markets
// ---------------------------------------------------------------------------

/// Venue metadata for one binary market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketInfo {
    pub market_id: String,
    pub title: String,
    pub yes_token_id: Option<String>,
    pub no_token_id: Option<String>,
    pub closes_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl MarketInfo {
    pub fn token_for(&self, side: OutcomeSide) -> Option<&str> {
        match side {
            OutcomeSide::Yes => self.yes_token_id.as_deref(),
            OutcomeSide::No => self.no_token_id.as_deref(),
        }
    }
}

/// One ranked market produced by a `MarketSelector` scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateMarket {
    pub market_id: String,
    pub title: String,
    pub outcome_side: OutcomeSide,
    pub token_id: String,
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    pub spread_pct: Decimal,
    pub score: Decimal,
}

impl fmt::Display for CandidateMarket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {} bid {} / ask {} (spread {:.2}%, score {:.2})",
            self.title,
            self.market_id,
            self.outcome_side,
            self.best_bid,
            self.best_ask,
            self.spread_pct,
            self.score
        )
    }
}

// ---------------------------------------------------------------------------
// P&L ledger
// ---------------------------------------------------------------------------

/// One completed trade, appended to the ledger that outlives cycle resets.
/// `sell_order_id` keys idempotent appends: a crash between ledger write
/// and state save must not produce a duplicate on resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PnLRecord {
    pub market_id: String,
    pub sell_order_id: Option<String>,
    pub buy_cost: Decimal,
    pub sell_proceeds: Decimal,
    pub pnl: Decimal,
    pub pnl_percent: Decimal,
    #[serde(default)]
    pub stop_loss: bool,
    pub completed_at: DateTime<Utc>,
}

impl PnLRecord {
    pub fn new(
        market_id: impl Into<String>,
        sell_order_id: Option<String>,
        buy_cost: Decimal,
        sell_proceeds: Decimal,
        stop_loss: bool,
    ) -> Self {
        let pnl = sell_proceeds - buy_cost;
        let pnl_percent = if buy_cost > Decimal::ZERO {
            pnl / buy_cost * dec!(100)
        } else {
            Decimal::ZERO
        };
        Self {
            market_id: market_id.into(),
            sell_order_id,
            buy_cost,
            sell_proceeds,
            pnl,
            pnl_percent,
            stop_loss,
            completed_at: Utc::now(),
        }
    }

    pub fn is_win(&self) -> bool {
        self.pnl > Decimal::ZERO
    }
}

impl fmt::Display for PnLRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: cost ${:.2} -> proceeds ${:.2} ({}{:.2}, {:.2}%)",
            self.market_id,
            self.buy_cost,
            self.sell_proceeds,
            if self.pnl >= Decimal::ZERO { "+" } else { "" },
            self.pnl,
            self.pnl_percent
        )
    }
}

// ---------------------------------------------------------------------------
// Trading cycle state
// ---------------------------------------------------------------------------

/// The single persisted record of the active trading cycle.
///
/// Created when a cycle enters `Scanning`, mutated at every transition, and
/// reset to the `Idle` template on completion (`cycle_number` survives the
/// reset). There is never more than one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingCycleState {
    #[serde(default = "default_state_version")]
    pub version: u32,
    pub stage: Stage,
    #[serde(default)]
    pub cycle_number: u64,
    pub market_id: Option<String>,
    #[serde(default)]
    pub market_title: String,
    pub outcome_side: Option<OutcomeSide>,
    pub token_id: Option<String>,
    /// The currently outstanding order, if any. At most one order rests at
    /// a time, so one field covers both the BUY and the SELL leg.
    pub order_id: Option<String>,
    pub buy_price: Option<Decimal>,
    pub avg_fill_price: Option<Decimal>,
    #[serde(default)]
    pub filled_amount: Decimal,
    #[serde(default)]
    pub capital_committed: Decimal,
    /// Price of the currently resting SELL order.
    pub sell_price: Option<Decimal>,
    /// First SELL price of the cycle; ceiling for dynamic repricing recovery.
    pub target_sell_price: Option<Decimal>,
    /// Book captured when the BUY was placed; baseline for deterioration.
    pub initial_orderbook: Option<OrderbookSnapshot>,
    #[serde(default)]
    pub repricing_count: u32,
    #[serde(default)]
    pub stop_loss_triggered: bool,
    pub cycle_started_at: DateTime<Utc>,
    pub buy_placed_at: Option<DateTime<Utc>>,
    pub sell_placed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

fn default_state_version() -> u32 {
    STATE_VERSION
}

impl TradingCycleState {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION,
            stage: Stage::Idle,
            cycle_number: 1,
            market_id: None,
            market_title: String::new(),
            outcome_side: None,
            token_id: None,
            order_id: None,
            buy_price: None,
            avg_fill_price: None,
            filled_amount: Decimal::ZERO,
            capital_committed: Decimal::ZERO,
            sell_price: None,
            target_sell_price: None,
            initial_orderbook: None,
            repricing_count: 0,
            stop_loss_triggered: false,
            cycle_started_at: now,
            buy_placed_at: None,
            sell_placed_at: None,
            updated_at: now,
        }
    }

    /// Moves to `next`, enforcing the cycle graph.
    pub fn transition(&mut self, next: Stage) -> Result<(), OrbitError> {
        if !self.stage.can_transition_to(next) {
            return Err(OrbitError::StateDesync(format!(
                "illegal stage transition {} -> {}",
                self.stage, next
            )));
        }
        self.stage = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Clears the position for the next cycle. The cycle counter advances;
    /// statistics live in the separate ledger and are untouched.
    pub fn reset_for_next_cycle(&mut self) {
        let next_cycle = self.cycle_number + 1;
        *self = Self::new();
        self.cycle_number = next_cycle;
    }

    /// `capital_committed == filled_amount * avg_fill_price` within
    /// rounding tolerance, once fill data exists.
    pub fn capital_consistent(&self) -> bool {
        match self.avg_fill_price {
            Some(avg) if self.filled_amount > Decimal::ZERO => {
                let implied = self.filled_amount * avg;
                (implied - self.capital_committed).abs() <= CAPITAL_TOLERANCE
            }
            _ => true,
        }
    }

    /// Unrealized P&L percent against the current best bid. `None` until
    /// a position exists.
    pub fn unrealized_pnl_pct(&self, best_bid: Decimal) -> Option<Decimal> {
        if self.filled_amount <= Decimal::ZERO || self.capital_committed <= Decimal::ZERO {
            return None;
        }
        let value = best_bid * self.filled_amount;
        Some((value - self.capital_committed) / self.capital_committed * dec!(100))
    }

    pub fn buy_elapsed(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.buy_placed_at.map(|t| now - t)
    }

    pub fn sell_elapsed(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.sell_placed_at.map(|t| now - t)
    }

    /// Stage-vs-field consistency check used when restoring saved state.
    /// Recoverable gaps (a missing order_id mid-monitoring) pass; only
    /// combinations the reconciler cannot repair fail.
    pub fn validate(&self) -> Result<(), String> {
        match self.stage {
            Stage::BuyPlaced | Stage::BuyMonitoring => {
                if self.market_id.is_none() {
                    return Err(format!("{} without a market_id", self.stage));
                }
            }
            Stage::BuyFilled => {
                if self.market_id.is_none() {
                    return Err("BUY_FILLED without a market_id".to_string());
                }
                if self.filled_amount <= Decimal::ZERO {
                    return Err("BUY_FILLED with no filled amount".to_string());
                }
                if !self.capital_consistent() {
                    return Err(format!(
                        "BUY_FILLED capital {} inconsistent with {} @ {:?}",
                        self.capital_committed, self.filled_amount, self.avg_fill_price
                    ));
                }
            }
            Stage::SellPlaced | Stage::SellMonitoring => {
                if self.market_id.is_none() {
                    return Err(format!("{} without a market_id", self.stage));
                }
                if self.filled_amount <= Decimal::ZERO {
                    return Err(format!("{} with no held position", self.stage));
                }
            }
            Stage::Idle | Stage::Scanning | Stage::Completed => {}
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn sample_buy_filled() -> Self {
        let mut state = Self::new();
        state.stage = Stage::BuyFilled;
        state.market_id = Some("mkt-42".to_string());
        state.market_title = "Sample market".to_string();
        state.outcome_side = Some(OutcomeSide::Yes);
        state.token_id = Some("tok-yes-42".to_string());
        state.buy_price = Some(dec!(0.40));
        state.avg_fill_price = Some(dec!(0.40));
        state.filled_amount = dec!(250.0);
        state.capital_committed = dec!(100.0);
        state.buy_placed_at = Some(Utc::now());
        state
    }
}

impl Default for TradingCycleState {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Domain errors. The controller matches on these to decide whether to
/// retry, back off, re-scan, or route through the reconciler.
#[derive(Debug, Error)]
pub enum OrbitError {
    /// Network/5xx/timeout class failures. Retried with backoff; after the
    /// retry budget the tick is skipped rather than the cycle aborted.
    #[error("Transient exchange error: {0}")]
    Transient(String),

    #[error("Insufficient balance: need ${needed:.2}, have ${available:.2}")]
    InsufficientBalance { needed: Decimal, available: Decimal },

    #[error("Order rejected: {0}")]
    OrderRejected(String),

    /// Local state contradicts the exchange. Always routed through the
    /// reconciler before trading resumes.
    #[error("State desync: {0}")]
    StateDesync(String),

    #[error("Market not found: {0}")]
    MarketNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl OrbitError {
    pub fn is_transient(&self) -> bool {
        matches!(self, OrbitError::Transient(_))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
