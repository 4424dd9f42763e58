//! The trading-cycle controller.
//!
//! [`CycleController::step`] runs one tick of the state machine: it reads
//! the current stage, performs that stage's work, and reports how long the
//! caller should sleep before the next tick. All venue side effects happen
//! here; the monitors and the risk manager only look at snapshots and
//! return verdicts.
//!
//! Persistence discipline: the state file is written immediately after a
//! side effect is confirmed, never before. A crash therefore replays at
//! most one step, and every replayed step starts by re-reading the venue
//! (order status, holdings, trade history) so it converges instead of
//! double-acting. The P&L ledger append is keyed by sell order id, which
//! makes the one genuinely non-idempotent step, recording a completed
//! cycle, safe to replay.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use crate::accounting::Accountant;
use crate::config::AppConfig;
use crate::exchange::{with_retry, ExchangeClient, DEFAULT_RETRY_ATTEMPTS};
use crate::monitor::{BuyFillMonitor, BuyVerdict, SellFillMonitor, SellVerdict};
use crate::notify::{NotifierSink, NotifyEvent};
use crate::reconcile::{PositionCheck, PositionReconciler};
use crate::risk::{RepriceAction, RepricingDecision, RiskManager, StopLossOrder};
use crate::selector::MarketSelector;
use crate::storage;
use crate::types::{
    CandidateMarket, OrbitError, OrderSide, OrderSnapshot, PnLRecord, Stage, TradingCycleState,
};

use super::capital::CapitalManager;
use super::pricing::PricingEngine;

/// What the main loop should do after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Sleep for `next_delay`, then call [`CycleController::step`] again.
    Continue { next_delay: Duration },
    /// The agent is done; the loop should exit.
    Halted,
}

/// Owns the cycle state and every collaborator needed to advance it.
pub struct CycleController {
    cfg: AppConfig,
    exchange: Arc<dyn ExchangeClient>,
    selector: Box<dyn MarketSelector>,
    notifier: Box<dyn NotifierSink>,
    capital: CapitalManager,
    risk: RiskManager,
    reconciler: PositionReconciler,
    accountant: Accountant,
    state: TradingCycleState,
    buy_monitor: Option<BuyFillMonitor>,
    sell_monitor: Option<SellFillMonitor>,
}

impl CycleController {
    pub fn new(
        cfg: AppConfig,
        exchange: Arc<dyn ExchangeClient>,
        selector: Box<dyn MarketSelector>,
        notifier: Box<dyn NotifierSink>,
        state: TradingCycleState,
    ) -> Self {
        let capital = CapitalManager::new(cfg.capital.clone());
        let risk = RiskManager::new(cfg.risk.clone(), cfg.sell.clone(), cfg.dust.clone());
        let reconciler = PositionReconciler::new(cfg.dust.clone());
        let accountant = Accountant::new(cfg.storage.ledger_file.clone());
        Self {
            cfg,
            exchange,
            selector,
            notifier,
            capital,
            risk,
            reconciler,
            accountant,
            state,
            buy_monitor: None,
            sell_monitor: None,
        }
    }

    pub fn state(&self) -> &TradingCycleState {
        &self.state
    }

    pub fn accountant(&self) -> &Accountant {
        &self.accountant
    }

    /// Advance the cycle by one tick.
    pub async fn step(&mut self) -> Result<StepOutcome, OrbitError> {
        debug!(
            stage = %self.state.stage,
            cycle = self.state.cycle_number,
            "Tick"
        );
        let result = match self.state.stage {
            Stage::Idle => self.handle_idle().await,
            Stage::Scanning => self.handle_scanning().await,
            Stage::BuyPlaced => self.handle_buy_placed().await,
            Stage::BuyMonitoring => self.handle_buy_monitoring().await,
            Stage::BuyFilled => self.handle_buy_filled().await,
            Stage::SellPlaced => self.handle_sell_placed().await,
            Stage::SellMonitoring => self.handle_sell_monitoring().await,
            Stage::Completed => self.handle_completed().await,
        };
        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) => self.absorb_error(e),
        }
    }

    /// Map a failed tick onto the error taxonomy. Transient failures skip
    /// the tick, balance and rejection failures demote the cycle, and only
    /// configuration or storage failures stop the agent.
    fn absorb_error(&mut self, error: OrbitError) -> Result<StepOutcome, OrbitError> {
        match error {
            OrbitError::Transient(_) => {
                warn!(
                    error = %error,
                    stage = %self.state.stage,
                    "Transient venue failure, skipping this tick"
                );
                Ok(StepOutcome::Continue {
                    next_delay: self.stage_delay(),
                })
            }
            OrbitError::InsufficientBalance { needed, available } => {
                warn!(
                    needed = %format!("${needed:.2}"),
                    available = %format!("${available:.2}"),
                    "Balance below the floor, backing off to IDLE"
                );
                if self.state.stage == Stage::Scanning {
                    self.state.transition(Stage::Idle)?;
                    self.save()?;
                }
                Ok(StepOutcome::Continue {
                    next_delay: self.cycle_delay(),
                })
            }
            OrbitError::OrderRejected(ref reason) => {
                warn!(
                    reason = %reason,
                    stage = %self.state.stage,
                    "Order rejected, abandoning this attempt"
                );
                self.abort_to_scanning()?;
                Ok(StepOutcome::Continue {
                    next_delay: self.cycle_delay(),
                })
            }
            OrbitError::MarketNotFound(ref market) => {
                warn!(
                    market = %market,
                    "Market vanished from the venue, abandoning this attempt"
                );
                self.abort_to_scanning()?;
                Ok(StepOutcome::Continue {
                    next_delay: self.cycle_delay(),
                })
            }
            OrbitError::StateDesync(ref reason) => {
                error!(
                    reason = %reason,
                    stage = %self.state.stage,
                    "State disagrees with the venue, routing through reconciliation"
                );
                self.notifier.notify(&NotifyEvent::Desync {
                    reason: reason.clone(),
                });
                self.abort_to_scanning()?;
                Ok(StepOutcome::Continue {
                    next_delay: self.cycle_delay(),
                })
            }
            OrbitError::Config(_) | OrbitError::Storage(_) => Err(error),
        }
    }

    // -- stage handlers -----------------------------------------------------

    async fn handle_idle(&mut self) -> Result<StepOutcome, OrbitError> {
        let rescued = self
            .reconciler
            .preflight_rescue(self.exchange.as_ref(), &mut self.state)
            .await?;
        if !rescued {
            self.state.transition(Stage::Scanning)?;
        }
        self.save()?;
        Ok(self.continue_now())
    }

    async fn handle_scanning(&mut self) -> Result<StepOutcome, OrbitError> {
        if self
            .reconciler
            .preflight_rescue(self.exchange.as_ref(), &mut self.state)
            .await?
        {
            self.save()?;
            info!("Rescued an orphaned position, resuming at BUY_FILLED");
            return Ok(self.continue_now());
        }

        let balance = self.exchange.get_balance().await?;
        let stake = self.capital.position_size(balance)?;

        let mut candidates = self.selector.scan().await?;
        if candidates.is_empty() {
            debug!("No eligible markets this scan");
            return Ok(StepOutcome::Continue {
                next_delay: self.cycle_delay(),
            });
        }
        let candidate = candidates.remove(0);
        info!(
            market_id = %candidate.market_id,
            side = %candidate.outcome_side,
            spread_pct = %candidate.spread_pct,
            score = %candidate.score,
            stake = %format!("${stake:.2}"),
            "Selected candidate market"
        );
        self.open_position(candidate, stake).await
    }

    async fn open_position(
        &mut self,
        candidate: CandidateMarket,
        stake: Decimal,
    ) -> Result<StepOutcome, OrbitError> {
        let book = self.exchange.get_orderbook(&candidate.token_id).await?;
        let price = PricingEngine::buy_price(&book)?;
        let size = self.reconciler.sellable_size(stake / price);
        if size < self.cfg.dust.min_sellable_shares {
            return Err(OrbitError::OrderRejected(format!(
                "stake of ${stake:.2} sizes to {size} shares at {price}, below the venue minimum"
            )));
        }

        let order_id = self
            .exchange
            .place_order(
                &candidate.market_id,
                &candidate.token_id,
                OrderSide::Buy,
                price,
                size,
            )
            .await?;

        self.state.market_id = Some(candidate.market_id);
        self.state.market_title = candidate.title;
        self.state.outcome_side = Some(candidate.outcome_side);
        self.state.token_id = Some(candidate.token_id);
        self.state.order_id = Some(order_id);
        self.state.buy_price = Some(price);
        self.state.initial_orderbook = Some(book);
        self.state.buy_placed_at = Some(Utc::now());
        self.state.transition(Stage::BuyPlaced)?;
        self.save()?;

        info!(price = %price, size = %size, "BUY order placed");
        self.notifier.notify(&NotifyEvent::BuyPlaced {
            market_title: self.state.market_title.clone(),
            price,
            size,
        });
        Ok(self.continue_now())
    }

    async fn handle_buy_placed(&mut self) -> Result<StepOutcome, OrbitError> {
        let placed_at = self.state.buy_placed_at.unwrap_or_else(Utc::now);
        self.buy_monitor = Some(BuyFillMonitor::new(
            self.cfg.buy.clone(),
            self.cfg.liquidity.clone(),
            placed_at,
        ));
        self.state.transition(Stage::BuyMonitoring)?;
        self.save()?;
        Ok(StepOutcome::Continue {
            next_delay: self.fill_interval(),
        })
    }

    async fn handle_buy_monitoring(&mut self) -> Result<StepOutcome, OrbitError> {
        let Some(order_id) = self.state.order_id.clone() else {
            return self.recover_buy_order().await;
        };
        let Some(token_id) = self.state.token_id.clone() else {
            return Err(OrbitError::StateDesync(
                "monitoring a BUY without a token id".to_string(),
            ));
        };

        let order = with_retry("get_order", DEFAULT_RETRY_ATTEMPTS, || {
            self.exchange.get_order(&order_id)
        })
        .await?;
        let book = self.exchange.get_orderbook(&token_id).await?;

        let mut monitor = self.buy_monitor.take().unwrap_or_else(|| {
            BuyFillMonitor::new(
                self.cfg.buy.clone(),
                self.cfg.liquidity.clone(),
                self.state.buy_placed_at.unwrap_or_else(Utc::now),
            )
        });
        let verdict = monitor.assess(&order, &book, self.state.initial_orderbook.as_ref(), Utc::now());
        self.buy_monitor = Some(monitor);

        match verdict {
            BuyVerdict::Pending => Ok(StepOutcome::Continue {
                next_delay: self.fill_interval(),
            }),
            BuyVerdict::Filled { amount, avg_price } => self.finish_buy(amount, avg_price).await,
            BuyVerdict::TimedOut { partial } => self.expire_buy(&order, partial).await,
            BuyVerdict::CancelledForLiquidity { verdict } => {
                warn!(%verdict, "Buy-side liquidity deteriorated, abandoning the market");
                self.cancel_and_rescan(&order_id).await
            }
            BuyVerdict::CancelledForCompetition => {
                warn!("Lost queue priority to a higher bid, abandoning the market");
                self.cancel_and_rescan(&order_id).await
            }
            BuyVerdict::OrderGone { status } => {
                warn!(%status, "BUY order disappeared from the venue");
                self.resolve_gone_buy().await
            }
        }
    }

    /// Record a completed BUY and hand over to the sell side.
    async fn finish_buy(
        &mut self,
        amount: Decimal,
        avg_price: Decimal,
    ) -> Result<StepOutcome, OrbitError> {
        self.state.filled_amount = amount;
        self.state.avg_fill_price = Some(avg_price);
        self.state.capital_committed = amount * avg_price;
        self.state.order_id = None;
        self.buy_monitor = None;
        self.state.transition(Stage::BuyFilled)?;
        self.save()?;

        info!(
            amount = %amount,
            avg_price = %avg_price,
            cost = %format!("${:.2}", self.state.capital_committed),
            "BUY filled"
        );
        self.notifier.notify(&NotifyEvent::BuyFilled {
            market_title: self.state.market_title.clone(),
            amount,
            avg_price,
        });
        Ok(self.continue_now())
    }

    /// A timed-out BUY is cancelled; a meaningful partial fill is kept as
    /// the position, a dust partial is written off.
    async fn expire_buy(
        &mut self,
        order: &OrderSnapshot,
        partial: Decimal,
    ) -> Result<StepOutcome, OrbitError> {
        with_retry("cancel_order", DEFAULT_RETRY_ATTEMPTS, || {
            self.exchange.cancel_order(&order.order_id)
        })
        .await?;

        if partial > Decimal::ZERO && !self.reconciler.is_dust(partial, order.price) {
            warn!(partial = %partial, "BUY timed out partially filled, keeping the position");
            return self.finish_buy(partial, order.effective_fill_price()).await;
        }
        if partial > Decimal::ZERO {
            warn!(partial = %partial, "BUY timed out with a dust fill, writing it off");
            self.notifier
                .notify(&NotifyEvent::DustAbandoned { shares: partial });
        } else {
            info!("BUY timed out unfilled, scanning for a fresh market");
        }
        self.abort_to_scanning()?;
        Ok(StepOutcome::Continue {
            next_delay: self.cycle_delay(),
        })
    }

    /// The BUY vanished from the venue. Holdings decide whether it filled
    /// before disappearing or was cancelled externally.
    async fn resolve_gone_buy(&mut self) -> Result<StepOutcome, OrbitError> {
        if self
            .reconciler
            .check_if_already_filled(self.exchange.as_ref(), &self.state)
            .await?
        {
            self.reconciler
                .recover_fill_data(self.exchange.as_ref(), &mut self.state)
                .await?;
            self.state.order_id = None;
            self.buy_monitor = None;
            self.state.transition(Stage::BuyFilled)?;
            self.save()?;
            info!(
                amount = %self.state.filled_amount,
                "Fill confirmed through holdings"
            );
            return Ok(self.continue_now());
        }
        self.abort_to_scanning()?;
        Ok(StepOutcome::Continue {
            next_delay: self.cycle_delay(),
        })
    }

    /// The state lost its BUY order id. Look for a resting order first;
    /// failing that, let holdings decide.
    async fn recover_buy_order(&mut self) -> Result<StepOutcome, OrbitError> {
        if self
            .reconciler
            .recover_order_id(self.exchange.as_ref(), &mut self.state)
            .await?
            .is_some()
        {
            self.save()?;
            return Ok(StepOutcome::Continue {
                next_delay: self.fill_interval(),
            });
        }
        warn!("No resting BUY on record or on the venue, checking holdings");
        self.resolve_gone_buy().await
    }

    async fn handle_buy_filled(&mut self) -> Result<StepOutcome, OrbitError> {
        if self.state.token_id.is_none() {
            self.reconciler
                .recover_token_id(self.exchange.as_ref(), &mut self.state)
                .await?;
            self.save()?;
        }

        match self
            .reconciler
            .confirm_position(self.exchange.as_ref(), &mut self.state)
            .await?
        {
            PositionCheck::Confirmed => self.save()?,
            PositionCheck::Dust { shares } => return self.abandon_dust(shares),
            PositionCheck::ManualSale { proceeds } => {
                return self.complete_manual_sale(proceeds)
            }
        }

        self.list_position().await
    }

    /// Place the SELL for the confirmed position.
    async fn list_position(&mut self) -> Result<StepOutcome, OrbitError> {
        let (market_id, token_id) = self.position_keys()?;
        let book = self.exchange.get_orderbook(&token_id).await?;
        let price = PricingEngine::sell_price(&book);
        let size = self.reconciler.sellable_size(self.state.filled_amount);
        if size <= Decimal::ZERO {
            return Err(OrbitError::StateDesync(
                "confirmed position sized to zero at listing time".to_string(),
            ));
        }

        let order_id = self
            .exchange
            .place_order(&market_id, &token_id, OrderSide::Sell, price, size)
            .await?;

        self.state.order_id = Some(order_id);
        self.state.sell_price = Some(price);
        if self.state.target_sell_price.is_none() {
            self.state.target_sell_price = Some(price);
        }
        self.state.sell_placed_at = Some(Utc::now());
        self.state.transition(Stage::SellPlaced)?;
        self.save()?;

        info!(price = %price, size = %size, "SELL order placed");
        self.notifier.notify(&NotifyEvent::SellPlaced {
            market_title: self.state.market_title.clone(),
            price,
            size,
        });
        Ok(self.continue_now())
    }

    /// Close the cycle over an unsellable position. No ledger record: a
    /// write-off has no sale to account for.
    fn abandon_dust(&mut self, shares: Decimal) -> Result<StepOutcome, OrbitError> {
        info!(shares = %shares, "Position is dust, closing the cycle without a sale");
        self.notifier.notify(&NotifyEvent::DustAbandoned { shares });
        self.state.transition(Stage::Completed)?;
        self.save()?;
        Ok(self.continue_now())
    }

    /// The position was sold outside the agent. Record it when the trade
    /// history still shows the proceeds; otherwise close without a record.
    fn complete_manual_sale(
        &mut self,
        proceeds: Option<Decimal>,
    ) -> Result<StepOutcome, OrbitError> {
        self.notifier
            .notify(&NotifyEvent::ManualSaleDetected { proceeds });
        match proceeds {
            Some(proceeds) => {
                let market_id = self.state.market_id.clone().unwrap_or_default();
                // Synthetic ledger key so a replayed step stays idempotent.
                let synthetic_id = format!("manual-{market_id}-{}", self.state.cycle_number);
                let record = PnLRecord::new(
                    market_id,
                    Some(synthetic_id),
                    self.state.capital_committed,
                    proceeds,
                    false,
                );
                if self.accountant.record(&record)? {
                    info!(%record, "Manual sale reconstructed from trade history");
                }
                self.state.order_id = None;
                self.state.transition(Stage::Completed)?;
                self.save()?;
                self.notifier.notify(&NotifyEvent::CycleCompleted { record });
            }
            None => {
                warn!("Position sold outside the agent with no recoverable fills, closing without a record");
                self.state.order_id = None;
                self.state.transition(Stage::Completed)?;
                self.save()?;
            }
        }
        Ok(self.continue_now())
    }

    async fn handle_sell_placed(&mut self) -> Result<StepOutcome, OrbitError> {
        // A monitor kept across a replacement carries its sale totals; only
        // build a fresh one (with history-recovered totals) when none exists.
        if self.sell_monitor.is_none() {
            let monitor = self.restore_sell_monitor().await;
            self.sell_monitor = Some(monitor);
        }
        self.state.transition(Stage::SellMonitoring)?;
        self.save()?;
        Ok(StepOutcome::Continue {
            next_delay: self.fill_interval(),
        })
    }

    /// Rebuild the sell monitor after a restart. When earlier replacement
    /// orders existed, their fills are recovered from the venue's trade
    /// history so the final P&L stays exact.
    async fn restore_sell_monitor(&self) -> SellFillMonitor {
        let placed_at = self.state.sell_placed_at.unwrap_or_else(Utc::now);
        let monitor = SellFillMonitor::new(
            self.cfg.sell.clone(),
            self.cfg.liquidity.clone(),
            placed_at,
        );
        if self.state.repricing_count == 0 && !self.state.stop_loss_triggered {
            return monitor;
        }
        let Some(market_id) = self.state.market_id.clone() else {
            return monitor;
        };

        let window = Utc::now().signed_duration_since(self.state.cycle_started_at)
            + chrono::Duration::hours(1);
        match self
            .exchange
            .get_trade_history(&market_id, OrderSide::Sell, window)
            .await
        {
            Ok(fills) => {
                // Fills on the currently resting order are counted live.
                let current = self.state.order_id.as_deref();
                let (sold, proceeds) = fills
                    .iter()
                    .filter(|f| Some(f.order_id.as_str()) != current)
                    .fold((Decimal::ZERO, Decimal::ZERO), |(s, p), f| {
                        (s + f.size, p + f.notional())
                    });
                if sold > Decimal::ZERO {
                    info!(
                        sold = %sold,
                        proceeds = %format!("${proceeds:.2}"),
                        "Recovered prior partial sales from trade history"
                    );
                }
                monitor.with_prior_sales(sold, proceeds)
            }
            Err(e) => {
                warn!(
                    error = %e,
                    "Trade history unavailable, sale totals resume from the resting order only"
                );
                monitor
            }
        }
    }

    async fn handle_sell_monitoring(&mut self) -> Result<StepOutcome, OrbitError> {
        let Some(order_id) = self.state.order_id.clone() else {
            return self.recover_sell_order().await;
        };
        let Some(token_id) = self.state.token_id.clone() else {
            return Err(OrbitError::StateDesync(
                "monitoring a SELL without a token id".to_string(),
            ));
        };

        let order = with_retry("get_order", DEFAULT_RETRY_ATTEMPTS, || {
            self.exchange.get_order(&order_id)
        })
        .await?;
        let book = self.exchange.get_orderbook(&token_id).await?;

        let mut monitor = match self.sell_monitor.take() {
            Some(m) => m,
            None => self.restore_sell_monitor().await,
        };
        let verdict = monitor.assess(
            &order,
            &book,
            self.state.initial_orderbook.as_ref(),
            &self.state,
            &self.risk,
            Utc::now(),
        );
        self.sell_monitor = Some(monitor);

        match verdict {
            SellVerdict::Pending => Ok(StepOutcome::Continue {
                next_delay: self.fill_interval(),
            }),
            SellVerdict::Filled { sold, proceeds } => {
                self.complete_cycle(order.order_id.clone(), sold, proceeds)
            }
            SellVerdict::FilledWithDustRemainder {
                sold,
                proceeds,
                remainder,
            } => {
                info!(remainder = %remainder, "SELL effectively filled, writing off a dust remainder");
                with_retry("cancel_order", DEFAULT_RETRY_ATTEMPTS, || {
                    self.exchange.cancel_order(&order_id)
                })
                .await?;
                self.notifier
                    .notify(&NotifyEvent::DustAbandoned { shares: remainder });
                self.complete_cycle(order.order_id.clone(), sold, proceeds)
            }
            SellVerdict::TimedOut => {
                warn!("SELL timed out, re-listing the position at a fresh price");
                self.requeue_position(&order).await
            }
            SellVerdict::Deteriorated { verdict } => {
                warn!(%verdict, "Sell-side liquidity deteriorated, re-listing the position");
                self.requeue_position(&order).await
            }
            SellVerdict::StopLoss { order: stop } => self.execute_stop_loss(&order, stop).await,
            SellVerdict::Reprice { decision } => self.execute_reprice(&order, decision).await,
            SellVerdict::OrderGone { status } => {
                warn!(%status, "SELL order disappeared from the venue");
                self.resolve_gone_sell(&order)
            }
        }
    }

    /// The state lost its SELL order id. Look for a resting order; failing
    /// that, fall back to BUY_FILLED where the position gets re-listed.
    async fn recover_sell_order(&mut self) -> Result<StepOutcome, OrbitError> {
        if self
            .reconciler
            .recover_order_id(self.exchange.as_ref(), &mut self.state)
            .await?
            .is_some()
        {
            self.save()?;
            return Ok(StepOutcome::Continue {
                next_delay: self.fill_interval(),
            });
        }
        warn!("No resting SELL found, returning to BUY_FILLED to re-list");
        self.state.transition(Stage::BuyFilled)?;
        self.save()?;
        Ok(self.continue_now())
    }

    /// Cancel the resting SELL and route the still-held position back to
    /// BUY_FILLED, where reconciliation re-prices and re-lists it.
    async fn requeue_position(&mut self, order: &OrderSnapshot) -> Result<StepOutcome, OrbitError> {
        with_retry("cancel_order", DEFAULT_RETRY_ATTEMPTS, || {
            self.exchange.cancel_order(&order.order_id)
        })
        .await?;
        let final_order = self.final_snapshot(order).await;
        self.fold_sell_fills(&final_order);

        if final_order.is_fully_filled() {
            info!("SELL filled during cancellation");
            let (sold, proceeds) = self.accumulated_totals();
            return self.complete_cycle(final_order.order_id.clone(), sold, proceeds);
        }

        self.state.order_id = None;
        self.state.transition(Stage::BuyFilled)?;
        self.save()?;
        Ok(self.continue_now())
    }

    /// An externally vanished SELL. Fold whatever it filled into the sale
    /// totals; reconciliation at BUY_FILLED decides what remains.
    fn resolve_gone_sell(&mut self, order: &OrderSnapshot) -> Result<StepOutcome, OrbitError> {
        self.fold_sell_fills(order);
        self.state.order_id = None;
        self.state.transition(Stage::BuyFilled)?;
        self.save()?;
        Ok(self.continue_now())
    }

    async fn execute_stop_loss(
        &mut self,
        order: &OrderSnapshot,
        stop: StopLossOrder,
    ) -> Result<StepOutcome, OrbitError> {
        warn!(
            pnl_pct = %stop.unrealized_pnl_pct,
            exit_price = %stop.exit_price,
            "Stop-loss triggered, exiting the position"
        );
        self.notifier.notify(&NotifyEvent::StopLossTriggered {
            exit_price: stop.exit_price,
            unrealized_pnl_pct: stop.unrealized_pnl_pct,
        });
        self.replace_sell(order, stop.exit_price, true).await
    }

    async fn execute_reprice(
        &mut self,
        order: &OrderSnapshot,
        decision: RepricingDecision,
    ) -> Result<StepOutcome, OrbitError> {
        match decision.action {
            RepriceAction::None => Ok(StepOutcome::Continue {
                next_delay: self.fill_interval(),
            }),
            RepriceAction::Cancel => {
                warn!(reason = %decision.reason, "Cancelling the SELL, remainder not worth re-listing");
                with_retry("cancel_order", DEFAULT_RETRY_ATTEMPTS, || {
                    self.exchange.cancel_order(&order.order_id)
                })
                .await?;
                let final_order = self.final_snapshot(order).await;
                self.fold_sell_fills(&final_order);
                let leftover = final_order.remaining();
                if leftover > Decimal::ZERO {
                    self.notifier
                        .notify(&NotifyEvent::DustAbandoned { shares: leftover });
                }
                let (sold, proceeds) = self.accumulated_totals();
                self.complete_cycle(final_order.order_id.clone(), sold, proceeds)
            }
            RepriceAction::Reprice(new_price) => {
                info!(
                    old_price = %order.price,
                    new_price = %new_price,
                    reason = %decision.reason,
                    "Repricing the SELL order"
                );
                let outcome = self.replace_sell(order, new_price, false).await?;
                self.notifier.notify(&NotifyEvent::Repriced {
                    old_price: order.price,
                    new_price,
                    reason: decision.reason,
                });
                Ok(outcome)
            }
        }
    }

    /// Cancel-and-replace of the resting SELL, shared by repricing and the
    /// stop-loss exit. Fills that landed before the cancel confirmed are
    /// folded into the sale totals, so the eventual P&L blends every
    /// replacement exactly.
    async fn replace_sell(
        &mut self,
        order: &OrderSnapshot,
        new_price: Decimal,
        stop_loss: bool,
    ) -> Result<StepOutcome, OrbitError> {
        with_retry("cancel_order", DEFAULT_RETRY_ATTEMPTS, || {
            self.exchange.cancel_order(&order.order_id)
        })
        .await?;
        let final_order = self.final_snapshot(order).await;
        self.fold_sell_fills(&final_order);

        if stop_loss {
            self.state.stop_loss_triggered = true;
        } else {
            self.state.repricing_count += 1;
        }
        self.state.order_id = None;
        self.save()?;

        if final_order.is_fully_filled() {
            info!("SELL filled during cancellation, no replacement needed");
            let (sold, proceeds) = self.accumulated_totals();
            return self.complete_cycle(final_order.order_id.clone(), sold, proceeds);
        }
        let leftover = final_order.remaining();
        if leftover <= Decimal::ZERO || self.reconciler.is_dust(leftover, new_price) {
            if leftover > Decimal::ZERO {
                info!(leftover = %leftover, "Remainder is dust after partial fills, writing it off");
                self.notifier
                    .notify(&NotifyEvent::DustAbandoned { shares: leftover });
            }
            let (sold, proceeds) = self.accumulated_totals();
            return self.complete_cycle(final_order.order_id.clone(), sold, proceeds);
        }

        let (market_id, token_id) = self.position_keys()?;
        let size = self.reconciler.sellable_size(leftover);
        let new_id = self
            .exchange
            .place_order(&market_id, &token_id, OrderSide::Sell, new_price, size)
            .await?;

        self.state.order_id = Some(new_id);
        self.state.sell_price = Some(new_price);
        self.state.sell_placed_at = Some(Utc::now());
        self.save()?;
        Ok(StepOutcome::Continue {
            next_delay: self.fill_interval(),
        })
    }

    /// Write the ledger record, then close out the cycle. The append is
    /// deduplicated by sell order id, so a crash between the two writes
    /// replays harmlessly.
    fn complete_cycle(
        &mut self,
        sell_order_id: String,
        sold: Decimal,
        proceeds: Decimal,
    ) -> Result<StepOutcome, OrbitError> {
        let market_id = self.state.market_id.clone().unwrap_or_default();
        let record = PnLRecord::new(
            market_id,
            Some(sell_order_id),
            self.state.capital_committed,
            proceeds,
            self.state.stop_loss_triggered,
        );
        if self.accountant.record(&record)? {
            info!(sold = %sold, %record, "Cycle complete");
        }
        self.state.order_id = None;
        self.sell_monitor = None;
        self.state.transition(Stage::Completed)?;
        self.save()?;
        self.notifier.notify(&NotifyEvent::CycleCompleted { record });
        Ok(self.continue_now())
    }

    async fn handle_completed(&mut self) -> Result<StepOutcome, OrbitError> {
        if let Err(e) = self.accountant.log_summary() {
            warn!(error = %e, "Could not read the ledger for the session summary");
        }
        if !self.cfg.agent.reinvest_profits {
            info!("Reinvestment disabled, halting after one completed cycle");
            return Ok(StepOutcome::Halted);
        }
        self.state.reset_for_next_cycle();
        self.save()?;
        info!(cycle = self.state.cycle_number, "Starting the next cycle");
        Ok(StepOutcome::Continue {
            next_delay: self.cycle_delay(),
        })
    }

    // -- shared plumbing ----------------------------------------------------

    /// Cancel a resting BUY and walk away from the market. Any partial
    /// fill left behind is picked up by the preflight rescue on the next
    /// scanning tick.
    async fn cancel_and_rescan(&mut self, order_id: &str) -> Result<StepOutcome, OrbitError> {
        with_retry("cancel_order", DEFAULT_RETRY_ATTEMPTS, || {
            self.exchange.cancel_order(order_id)
        })
        .await?;
        self.abort_to_scanning()?;
        Ok(StepOutcome::Continue {
            next_delay: self.cycle_delay(),
        })
    }

    /// Drop order tracking and demote to SCANNING. Market identifiers are
    /// kept so reconciliation can still find whatever is left behind.
    fn abort_to_scanning(&mut self) -> Result<(), OrbitError> {
        self.state.order_id = None;
        self.buy_monitor = None;
        self.sell_monitor = None;
        if self.state.stage != Stage::Scanning && self.state.stage.can_transition_to(Stage::Scanning)
        {
            self.state.transition(Stage::Scanning)?;
        }
        self.save()?;
        Ok(())
    }

    /// Re-read an order after cancelling it, falling back to the last
    /// snapshot when the venue will not answer.
    async fn final_snapshot(&self, order: &OrderSnapshot) -> OrderSnapshot {
        match self.exchange.get_order(&order.order_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Could not re-read a cancelled order, using the last snapshot");
                order.clone()
            }
        }
    }

    /// Fold a cancelled or vanished SELL's fills into the running totals.
    fn fold_sell_fills(&mut self, cancelled: &OrderSnapshot) {
        let now = Utc::now();
        let mut monitor = match self.sell_monitor.take() {
            Some(m) => m,
            None => SellFillMonitor::new(self.cfg.sell.clone(), self.cfg.liquidity.clone(), now),
        };
        monitor.note_replacement(cancelled, now);
        self.sell_monitor = Some(monitor);
    }

    fn accumulated_totals(&self) -> (Decimal, Decimal) {
        match &self.sell_monitor {
            Some(m) => (m.sold_shares(), m.proceeds()),
            None => (Decimal::ZERO, Decimal::ZERO),
        }
    }

    fn position_keys(&self) -> Result<(String, String), OrbitError> {
        match (self.state.market_id.clone(), self.state.token_id.clone()) {
            (Some(market_id), Some(token_id)) => Ok((market_id, token_id)),
            _ => Err(OrbitError::StateDesync(
                "position is missing market or token identifiers".to_string(),
            )),
        }
    }

    fn save(&mut self) -> Result<(), OrbitError> {
        self.state.updated_at = Utc::now();
        storage::save_state(&self.state, self.cfg.storage.state_file.as_deref())
            .map_err(|e| OrbitError::Storage(e.to_string()))
    }

    fn continue_now(&self) -> StepOutcome {
        StepOutcome::Continue {
            next_delay: Duration::ZERO,
        }
    }

    fn cycle_delay(&self) -> Duration {
        Duration::from_secs(self.cfg.agent.cycle_delay_secs)
    }

    fn fill_interval(&self) -> Duration {
        Duration::from_secs(self.cfg.agent.fill_check_interval_secs)
    }

    fn stage_delay(&self) -> Duration {
        if self.state.stage.is_monitoring() {
            self.fill_interval()
        } else {
            self.cycle_delay()
        }
    }
}
