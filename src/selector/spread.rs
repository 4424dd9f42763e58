//! Spread-based market scanner.
//!
//! Lists active markets, pulls the book for each outcome token, and keeps
//! the sides whose books are balanced, liquid enough, and inside the
//! configured spread and time-to-close windows. Candidates are scored by
//! spread (wider spread, larger maker edge) with a configurable boost for
//! allow-listed markets.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::SelectorConfig;
use crate::exchange::ExchangeClient;
use crate::selector::MarketSelector;
use crate::types::{CandidateMarket, MarketInfo, OrbitError, OrderbookSnapshot, OutcomeSide};

/// Markets fetched per scan before filtering.
const SCAN_FETCH_LIMIT: usize = 50;

pub struct SpreadScanner {
    exchange: Arc<dyn ExchangeClient>,
    cfg: SelectorConfig,
}

impl SpreadScanner {
    pub fn new(exchange: Arc<dyn ExchangeClient>, cfg: SelectorConfig) -> Self {
        Self { exchange, cfg }
    }

    /// Evaluate one outcome side of a market against the book filters.
    fn evaluate_side(
        &self,
        market: &MarketInfo,
        side: OutcomeSide,
        token_id: &str,
        book: &OrderbookSnapshot,
    ) -> Option<CandidateMarket> {
        if book.bids.len() < self.cfg.min_book_orders || book.asks.len() < self.cfg.min_book_orders
        {
            debug!(market_id = %market.market_id, %side, "Skipped: thin book");
            return None;
        }
        let best_bid = book.best_bid()?;
        let best_ask = book.best_ask()?;
        if best_bid <= Decimal::ZERO || best_bid >= best_ask {
            return None;
        }

        let mid = (best_bid + best_ask) / dec!(2) * dec!(100);
        let (balance_lo, balance_hi) = self.cfg.balance_range_pct;
        if mid < balance_lo || mid > balance_hi {
            debug!(
                market_id = %market.market_id,
                %side,
                midpoint_pct = %mid,
                "Skipped: price not balanced"
            );
            return None;
        }

        let spread_pct = (best_ask - best_bid) / best_bid * dec!(100);
        if spread_pct < self.cfg.min_spread_pct || spread_pct > self.cfg.max_spread_pct {
            debug!(
                market_id = %market.market_id,
                %side,
                spread_pct = %spread_pct,
                "Skipped: spread outside window"
            );
            return None;
        }

        let mut score = spread_pct;
        if self.cfg.bonus_markets.contains(&market.market_id) {
            score *= self.cfg.bonus_multiplier;
        }

        Some(CandidateMarket {
            market_id: market.market_id.clone(),
            title: market.title.clone(),
            outcome_side: side,
            token_id: token_id.to_string(),
            best_bid,
            best_ask,
            spread_pct,
            score,
        })
    }

    /// Time-window and liveness filters that need no book.
    fn market_eligible(&self, market: &MarketInfo) -> bool {
        if !market.is_active {
            return false;
        }
        let Some(closes_at) = market.closes_at else {
            return false;
        };
        let hours_to_close = (closes_at - Utc::now()).num_hours();
        hours_to_close >= self.cfg.min_hours_to_close
            && hours_to_close <= self.cfg.max_hours_to_close
    }
}

#[async_trait]
impl MarketSelector for SpreadScanner {
    fn name(&self) -> &str {
        "spread"
    }

    async fn scan(&self) -> Result<Vec<CandidateMarket>, OrbitError> {
        let markets = self.exchange.list_markets(SCAN_FETCH_LIMIT).await?;
        let fetched = markets.len();

        let mut candidates = Vec::new();
        for market in markets.iter().filter(|m| self.market_eligible(m)) {
            let sides = [
                (OutcomeSide::Yes, market.yes_token_id.as_deref()),
                (OutcomeSide::No, market.no_token_id.as_deref()),
            ];
            for (side, token_id) in sides {
                let Some(token_id) = token_id else {
                    continue;
                };
                let book = match self.exchange.get_orderbook(token_id).await {
                    Ok(book) => book,
                    Err(e) => {
                        warn!(
                            market_id = %market.market_id,
                            %side,
                            error = %e,
                            "Book fetch failed, skipping side"
                        );
                        continue;
                    }
                };
                if let Some(candidate) = self.evaluate_side(market, side, token_id, &book) {
                    candidates.push(candidate);
                }
            }
        }

        candidates.sort_by(|a, b| b.score.cmp(&a.score));
        candidates.truncate(self.cfg.max_results);

        info!(
            fetched,
            kept = candidates.len(),
            "Market scan complete"
        );
        Ok(candidates)
    }
}
