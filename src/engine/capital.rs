//! Position sizing.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

use crate::config::{CapitalConfig, CapitalMode};
use crate::types::OrbitError;

pub struct CapitalManager {
    cfg: CapitalConfig,
}

impl CapitalManager {
    pub fn new(cfg: CapitalConfig) -> Self {
        Self { cfg }
    }

    /// Capital to commit to the next BUY, sized from a fresh balance
    /// reading. Refuses to trade below the configured balance floor and
    /// never sizes a position the venue would reject as too small.
    pub fn position_size(&self, balance: Decimal) -> Result<Decimal, OrbitError> {
        if balance < self.cfg.min_balance {
            return Err(OrbitError::InsufficientBalance {
                needed: self.cfg.min_balance,
                available: balance,
            });
        }

        let stake = match self.cfg.mode {
            CapitalMode::Fixed => self.cfg.amount.min(balance),
            CapitalMode::Percentage => balance * self.cfg.percentage / dec!(100),
        };

        if stake < self.cfg.min_position {
            return Err(OrbitError::InsufficientBalance {
                needed: self.cfg.min_position,
                available: stake,
            });
        }

        debug!(balance = %balance, stake = %stake, mode = ?self.cfg.mode, "Position sized");
        Ok(stake)
    }
}
