//! Operator notifications.
//!
//! Lifecycle events are fanned out synchronously and best-effort: a sink
//! must never fail or block the trading loop. The provided sink writes
//! through `tracing`; disabling notifications swaps in a null sink.

use rust_decimal::Decimal;
use std::fmt;
use tracing::{info, warn};

use crate::config::NotificationConfig;
use crate::types::PnLRecord;

#[derive(Debug, Clone)]
pub enum NotifyEvent {
    BuyPlaced {
        market_title: String,
        price: Decimal,
        size: Decimal,
    },
    BuyFilled {
        market_title: String,
        amount: Decimal,
        avg_price: Decimal,
    },
    SellPlaced {
        market_title: String,
        price: Decimal,
        size: Decimal,
    },
    Repriced {
        old_price: Decimal,
        new_price: Decimal,
        reason: String,
    },
    StopLossTriggered {
        exit_price: Decimal,
        unrealized_pnl_pct: Decimal,
    },
    DustAbandoned {
        shares: Decimal,
    },
    ManualSaleDetected {
        proceeds: Option<Decimal>,
    },
    CycleCompleted {
        record: PnLRecord,
    },
    Desync {
        reason: String,
    },
}

impl fmt::Display for NotifyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotifyEvent::BuyPlaced {
                market_title,
                price,
                size,
            } => write!(f, "BUY placed: {size} @ {price} on \"{market_title}\""),
            NotifyEvent::BuyFilled {
                market_title,
                amount,
                avg_price,
            } => write!(f, "BUY filled: {amount} @ {avg_price} on \"{market_title}\""),
            NotifyEvent::SellPlaced {
                market_title,
                price,
                size,
            } => write!(f, "SELL placed: {size} @ {price} on \"{market_title}\""),
            NotifyEvent::Repriced {
                old_price,
                new_price,
                reason,
            } => write!(f, "SELL repriced {old_price} -> {new_price}: {reason}"),
            NotifyEvent::StopLossTriggered {
                exit_price,
                unrealized_pnl_pct,
            } => write!(
                f,
                "STOP-LOSS at {unrealized_pnl_pct:.2}%, exiting at {exit_price}"
            ),
            NotifyEvent::DustAbandoned { shares } => {
                write!(f, "Position abandoned as dust ({shares} shares)")
            }
            NotifyEvent::ManualSaleDetected { proceeds } => match proceeds {
                Some(p) => write!(f, "Manual sale detected, proceeds ${p:.2}"),
                None => write!(f, "Manual sale detected, proceeds unknown"),
            },
            NotifyEvent::CycleCompleted { record } => write!(f, "Cycle complete: {record}"),
            NotifyEvent::Desync { reason } => write!(f, "State desync: {reason}"),
        }
    }
}

pub trait NotifierSink: Send + Sync {
    fn notify(&self, event: &NotifyEvent);
}

/// Writes every event through `tracing`, warnings for the alarming ones.
pub struct LogNotifier;

impl NotifierSink for LogNotifier {
    fn notify(&self, event: &NotifyEvent) {
        match event {
            NotifyEvent::StopLossTriggered { .. }
            | NotifyEvent::ManualSaleDetected { .. }
            | NotifyEvent::Desync { .. } => warn!(%event, "Notification"),
            _ => info!(%event, "Notification"),
        }
    }
}

/// Swallows everything.
pub struct NullNotifier;

impl NotifierSink for NullNotifier {
    fn notify(&self, _event: &NotifyEvent) {}
}

pub fn sink_from_config(cfg: &NotificationConfig) -> Box<dyn NotifierSink> {
    if cfg.enabled {
        Box::new(LogNotifier)
    } else {
        Box::new(NullNotifier)
    }
}
