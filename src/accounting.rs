//! Trade accounting.
//!
//! Realized P&L lives in the append-only ledger; statistics are always
//! replayed from it rather than incrementally mutated, so a restart or a
//! re-read computes exactly the same numbers.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::fmt;
use tracing::info;

use crate::storage;
use crate::types::{OrbitError, PnLRecord};

pub struct Accountant {
    ledger_path: Option<String>,
}

impl Accountant {
    pub fn new(ledger_path: Option<String>) -> Self {
        Self { ledger_path }
    }

    /// Append a completed cycle to the ledger. Returns false when a record
    /// for the same sell order is already present.
    pub fn record(&self, record: &PnLRecord) -> Result<bool, OrbitError> {
        storage::append_pnl_record(record, self.ledger_path.as_deref())
            .map_err(|e| OrbitError::Storage(e.to_string()))
    }

    pub fn statistics(&self) -> Result<TradeStatistics, OrbitError> {
        let records = storage::load_pnl_records(self.ledger_path.as_deref())
            .map_err(|e| OrbitError::Storage(e.to_string()))?;
        Ok(TradeStatistics::replay(&records))
    }

    pub fn log_summary(&self) -> Result<(), OrbitError> {
        let stats = self.statistics()?;
        info!(
            trades = stats.total_trades,
            wins = stats.wins,
            losses = stats.losses,
            stop_losses = stats.stop_losses,
            win_rate = format!("{:.1}%", stats.win_rate_pct),
            total_pnl = format!("${:.2}", stats.total_pnl),
            best = format!("${:.2}", stats.best_trade),
            worst = format!("${:.2}", stats.worst_trade),
            "Trade statistics"
        );
        Ok(())
    }
}

/// Aggregate view of the ledger. Derived exclusively by [`replay`], which
/// is the sole computation path for every field.
///
/// [`replay`]: TradeStatistics::replay
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TradeStatistics {
    pub total_trades: u64,
    pub wins: u64,
    pub losses: u64,
    pub stop_losses: u64,
    /// Losing streak at the end of the ledger; a win resets it.
    pub consecutive_losses: u64,
    pub win_rate_pct: Decimal,
    pub total_pnl: Decimal,
    pub best_trade: Decimal,
    pub worst_trade: Decimal,
    pub avg_win: Decimal,
    pub avg_loss: Decimal,
}

impl TradeStatistics {
    pub fn replay(records: &[PnLRecord]) -> Self {
        if records.is_empty() {
            return Self::default();
        }

        let mut stats = Self {
            best_trade: records[0].pnl,
            worst_trade: records[0].pnl,
            ..Self::default()
        };
        let mut win_sum = Decimal::ZERO;
        let mut loss_sum = Decimal::ZERO;

        for record in records {
            stats.total_trades += 1;
            stats.total_pnl += record.pnl;
            stats.best_trade = stats.best_trade.max(record.pnl);
            stats.worst_trade = stats.worst_trade.min(record.pnl);
            if record.stop_loss {
                stats.stop_losses += 1;
            }
            if record.is_win() {
                stats.wins += 1;
                win_sum += record.pnl;
                stats.consecutive_losses = 0;
            } else {
                stats.losses += 1;
                loss_sum += record.pnl;
                stats.consecutive_losses += 1;
            }
        }

        stats.win_rate_pct =
            Decimal::from(stats.wins) / Decimal::from(stats.total_trades) * dec!(100);
        if stats.wins > 0 {
            stats.avg_win = win_sum / Decimal::from(stats.wins);
        }
        if stats.losses > 0 {
            stats.avg_loss = loss_sum / Decimal::from(stats.losses);
        }
        stats
    }
}

impl fmt::Display for TradeStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} trades, {}W/{}L ({:.1}% win rate), total P&L ${:.2}, best ${:.2}, worst ${:.2}",
            self.total_trades,
            self.wins,
            self.losses,
            self.win_rate_pct,
            self.total_pnl,
            self.best_trade,
            self.worst_trade
        )
    }
}
