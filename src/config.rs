//! Configuration for the ORBIT agent.
//!
//! Loaded from a TOML file into nested sections. Secrets are referenced by
//! `env:VAR` indirection and resolved at startup so they never sit in the
//! config file. Sections with sensible operational defaults may be omitted
//! entirely; `[agent]`, `[exchange]`, `[capital]` and `[selector]` are
//! required. A config that fails [`AppConfig::validate`] halts the process
//! before any cycle starts.

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::fs;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub exchange: ExchangeConfig,
    pub capital: CapitalConfig,
    pub selector: SelectorConfig,
    #[serde(default)]
    pub buy: BuyConfig,
    #[serde(default)]
    pub sell: SellConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub liquidity: LiquidityConfig,
    #[serde(default)]
    pub dust: DustConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    /// Pause between scan attempts and after completed cycles.
    pub cycle_delay_secs: u64,
    /// Cadence of fill polling while an order rests.
    pub fill_check_interval_secs: u64,
    /// Start the next cycle after COMPLETED instead of halting.
    pub reinvest_profits: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    pub base_url: String,
    /// Literal key or `env:VAR` indirection.
    pub api_key: String,
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_http_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapitalMode {
    Fixed,
    Percentage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CapitalConfig {
    pub mode: CapitalMode,
    /// Stake per cycle in quote currency when mode = "fixed".
    #[serde(default)]
    pub amount: Decimal,
    /// Stake as a percent of the fresh balance when mode = "percentage".
    #[serde(default)]
    pub percentage: Decimal,
    /// Below this balance the agent refuses to start a new cycle.
    pub min_balance: Decimal,
    /// Smallest position the venue will accept.
    pub min_position: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelectorConfig {
    /// Cap on candidates returned per scan.
    #[serde(default = "default_selector_max_results")]
    pub max_results: usize,
    pub min_spread_pct: Decimal,
    pub max_spread_pct: Decimal,
    /// Minimum resting orders required on each side of the book.
    #[serde(default = "default_min_book_orders")]
    pub min_book_orders: usize,
    /// Acceptable midpoint range, in percent of full price.
    #[serde(default = "default_balance_range")]
    pub balance_range_pct: (Decimal, Decimal),
    pub min_hours_to_close: i64,
    pub max_hours_to_close: i64,
    /// Markets whose score is boosted by `bonus_multiplier`.
    #[serde(default)]
    pub bonus_markets: Vec<String>,
    #[serde(default = "default_bonus_multiplier")]
    pub bonus_multiplier: Decimal,
}

fn default_selector_max_results() -> usize {
    10
}

fn default_min_book_orders() -> usize {
    2
}

fn default_balance_range() -> (Decimal, Decimal) {
    (dec!(40.0), dec!(60.0))
}

fn default_bonus_multiplier() -> Decimal {
    dec!(2.0)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BuyConfig {
    pub order_timeout_hours: Decimal,
    pub cancel_on_liquidity: bool,
    /// Cancel when the best bid moves a tick or more above our resting
    /// price (queue priority lost).
    pub cancel_on_competition: bool,
    pub liquidity_check_every_n_ticks: u64,
}

impl Default for BuyConfig {
    fn default() -> Self {
        Self {
            order_timeout_hours: dec!(8.0),
            cancel_on_liquidity: true,
            cancel_on_competition: false,
            liquidity_check_every_n_ticks: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepriceMode {
    Best,
    SecondBest,
    LiquidityPercent,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SellConfig {
    pub order_timeout_hours: Decimal,
    /// Bid-drop percent at which repricing engages.
    pub reprice_liquidity_threshold_pct: Decimal,
    pub reprice_mode: RepriceMode,
    /// Depth percent targeted by the liquidity_percent mode.
    pub reprice_liquidity_target_pct: Decimal,
    /// Bid-drop percent below which dynamic recovery re-prices upward.
    pub reprice_liquidity_return_pct: Decimal,
    pub allow_below_buy_price: bool,
    /// Cap on how far below the entry price a reprice may go, in percent.
    pub max_price_reduction_pct: Decimal,
    /// Suppress reprices that move the price by less than this fraction.
    pub min_reprice_change_pct: Decimal,
    pub dynamic_price_adjustment: bool,
    pub reprice_check_every_n_ticks: u64,
    pub liquidity_check_every_n_ticks: u64,
    /// On timeout, extend once if our price is within this percent of the
    /// best ask (the order is about to fill).
    pub timeout_competitive_pct: Decimal,
}

impl Default for SellConfig {
    fn default() -> Self {
        Self {
            order_timeout_hours: dec!(8.0),
            reprice_liquidity_threshold_pct: dec!(50.0),
            reprice_mode: RepriceMode::Best,
            reprice_liquidity_target_pct: dec!(30.0),
            reprice_liquidity_return_pct: dec!(20.0),
            allow_below_buy_price: false,
            max_price_reduction_pct: dec!(5.0),
            min_reprice_change_pct: dec!(0.5),
            dynamic_price_adjustment: true,
            reprice_check_every_n_ticks: 3,
            liquidity_check_every_n_ticks: 5,
            timeout_competitive_pct: dec!(0.1),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub enable_stop_loss: bool,
    /// Unrealized P&L percent at or below which the stop-loss fires.
    pub stop_loss_trigger_pct: Decimal,
    /// Fractional undercut below the best bid for the forced exit.
    pub stop_loss_aggressive_offset: Decimal,
    pub stop_loss_check_every_n_ticks: u64,
    /// Stop-loss wins when it and a reprice fire on the same tick.
    pub stop_loss_priority: bool,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            enable_stop_loss: true,
            stop_loss_trigger_pct: dec!(-10.0),
            stop_loss_aggressive_offset: dec!(0.001),
            stop_loss_check_every_n_ticks: 3,
            stop_loss_priority: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LiquidityConfig {
    pub bid_drop_threshold_pct: Decimal,
    pub spread_threshold_pct: Decimal,
}

impl Default for LiquidityConfig {
    fn default() -> Self {
        Self {
            bid_drop_threshold_pct: dec!(25.0),
            spread_threshold_pct: dec!(15.0),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DustConfig {
    /// Positions under this share count cannot be sold.
    pub min_sellable_shares: Decimal,
    /// Venue minimum order value in quote currency.
    pub min_order_value: Decimal,
    /// Holdings shortfall percent beyond which a manual sale is assumed.
    pub manual_sale_threshold_pct: Decimal,
}

impl Default for DustConfig {
    fn default() -> Self {
        Self {
            min_sellable_shares: dec!(5.0),
            min_order_value: dec!(1.30),
            manual_sale_threshold_pct: dec!(95.0),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    /// Overrides the default state file path.
    pub state_file: Option<String>,
    /// Overrides the default P&L ledger path.
    pub ledger_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub enabled: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl AppConfig {
    pub fn load(path: &str) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config: AppConfig =
            toml::from_str(&raw).with_context(|| format!("Failed to parse config file: {path}"))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configs that would trade incorrectly. Called before any
    /// cycle starts; a failure here halts the process.
    pub fn validate(&self) -> Result<()> {
        if self.agent.fill_check_interval_secs == 0 {
            bail!("agent.fill_check_interval_secs must be positive");
        }
        match self.capital.mode {
            CapitalMode::Fixed => {
                if self.capital.amount <= Decimal::ZERO {
                    bail!("capital.amount must be positive in fixed mode");
                }
            }
            CapitalMode::Percentage => {
                if self.capital.percentage <= Decimal::ZERO
                    || self.capital.percentage > dec!(100)
                {
                    bail!("capital.percentage must be in (0, 100]");
                }
            }
        }
        if self.capital.min_position <= Decimal::ZERO {
            bail!("capital.min_position must be positive");
        }
        if self.selector.min_spread_pct >= self.selector.max_spread_pct {
            bail!("selector.min_spread_pct must be below max_spread_pct");
        }
        if self.selector.min_hours_to_close >= self.selector.max_hours_to_close {
            bail!("selector.min_hours_to_close must be below max_hours_to_close");
        }
        if self.risk.stop_loss_trigger_pct >= Decimal::ZERO {
            bail!("risk.stop_loss_trigger_pct must be negative");
        }
        if self.sell.max_price_reduction_pct < Decimal::ZERO
            || self.sell.max_price_reduction_pct >= dec!(100)
        {
            bail!("sell.max_price_reduction_pct must be in [0, 100)");
        }
        if self.sell.reprice_liquidity_return_pct >= self.sell.reprice_liquidity_threshold_pct {
            bail!("sell.reprice_liquidity_return_pct must be below the reprice threshold");
        }
        if self.dust.min_sellable_shares <= Decimal::ZERO {
            bail!("dust.min_sellable_shares must be positive");
        }
        Ok(())
    }

    /// Resolves `env:VAR` indirection so secrets stay out of the file.
    pub fn resolve_env(value: &str) -> Result<String> {
        match value.strip_prefix("env:") {
            Some(var) => {
                std::env::var(var).with_context(|| format!("Environment variable not set: {var}"))
            }
            None => Ok(value.to_string()),
        }
    }
}
