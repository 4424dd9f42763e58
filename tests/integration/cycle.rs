//! End-to-end trading cycle tests.
//!
//! Each test drives a real `CycleController` (with the production
//! scanner, pricing, risk, and reconciliation wiring) against the
//! in-memory venue, executing fills at chosen moments and asserting on
//! persisted state, the P&L ledger, and venue-side balances.

use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use orbit::config::AppConfig;
use orbit::engine::{CycleController, StepOutcome};
use orbit::exchange::ExchangeClient;
use orbit::notify::sink_from_config;
use orbit::selector::SpreadScanner;
use orbit::storage;
use orbit::types::{
    MarketInfo, OrderSide, OrderStatus, OrderbookSnapshot, PriceLevel, Stage, TradingCycleState,
};

use crate::mock_exchange::MockExchange;

const BASE_CONFIG: &str = r#"
    [agent]
    name = "orbit-e2e"
    cycle_delay_secs = 30
    fill_check_interval_secs = 5
    reinvest_profits = true

    [exchange]
    base_url = "https://venue.test"
    api_key = "test-key"

    [capital]
    mode = "fixed"
    amount = 100.0
    min_balance = 10.0
    min_position = 5.0

    [selector]
    min_spread_pct = 2.0
    max_spread_pct = 20.0
    min_hours_to_close = 12
    max_hours_to_close = 720

    [notifications]
    enabled = false
"#;

fn test_config(tag: &str) -> AppConfig {
    let mut cfg: AppConfig = toml::from_str(BASE_CONFIG).unwrap();
    let run = uuid::Uuid::new_v4();
    cfg.storage.state_file = Some(
        std::env::temp_dir()
            .join(format!("orbit-e2e-state-{tag}-{run}.json"))
            .to_string_lossy()
            .into_owned(),
    );
    cfg.storage.ledger_file = Some(
        std::env::temp_dir()
            .join(format!("orbit-e2e-ledger-{tag}-{run}.jsonl"))
            .to_string_lossy()
            .into_owned(),
    );
    cfg
}

fn cleanup(cfg: &AppConfig) {
    if let Some(path) = cfg.storage.state_file.as_deref() {
        let _ = std::fs::remove_file(path);
    }
    if let Some(path) = cfg.storage.ledger_file.as_deref() {
        let _ = std::fs::remove_file(path);
    }
}

/// An active market closing in a week, passing every scan filter when
/// paired with a book around the 0.40 mid.
fn market(id: &str) -> MarketInfo {
    MarketInfo {
        market_id: id.to_string(),
        title: format!("Test market {id}"),
        yes_token_id: Some(format!("tok-yes-{id}")),
        no_token_id: None,
        closes_at: Some(chrono::Utc::now() + chrono::Duration::hours(168)),
        is_active: true,
    }
}

fn book(bid: Decimal, ask: Decimal) -> OrderbookSnapshot {
    OrderbookSnapshot::new(
        vec![
            PriceLevel::new(bid, dec!(600)),
            PriceLevel::new(bid - dec!(0.01), dec!(900)),
        ],
        vec![
            PriceLevel::new(ask, dec!(600)),
            PriceLevel::new(ask + dec!(0.01), dec!(900)),
        ],
    )
}

fn controller_for(cfg: &AppConfig, mock: &MockExchange) -> CycleController {
    let exchange: Arc<dyn ExchangeClient> = Arc::new(mock.clone());
    let selector = SpreadScanner::new(Arc::clone(&exchange), cfg.selector.clone());
    CycleController::new(
        cfg.clone(),
        exchange,
        Box::new(selector),
        sink_from_config(&cfg.notifications),
        TradingCycleState::new(),
    )
}

async fn step(controller: &mut CycleController) -> StepOutcome {
    controller.step().await.expect("controller step failed")
}

async fn run_to_stage(controller: &mut CycleController, stage: Stage, max_steps: usize) {
    for _ in 0..max_steps {
        if controller.state().stage == stage {
            return;
        }
        step(controller).await;
    }
    panic!(
        "never reached {stage}, stuck at {} after {max_steps} steps",
        controller.state().stage
    );
}

#[tokio::test]
async fn full_cycle_records_profit_and_restarts() {
    let cfg = test_config("full");
    let mock = MockExchange::new(dec!(500));
    mock.add_market(market("m1"));
    mock.set_book("tok-yes-m1", book(dec!(0.40), dec!(0.42)));

    let mut controller = controller_for(&cfg, &mock);
    run_to_stage(&mut controller, Stage::BuyMonitoring, 5).await;

    assert_eq!(controller.state().order_id.as_deref(), Some("mock-1"));
    assert_eq!(controller.state().buy_price, Some(dec!(0.40)));
    let buy = mock.order("mock-1");
    assert_eq!(buy.price, dec!(0.40));
    assert_eq!(buy.size, dec!(250));

    mock.fill_remaining("mock-1", dec!(0.40));
    run_to_stage(&mut controller, Stage::BuyFilled, 3).await;
    assert_eq!(controller.state().filled_amount, dec!(250));
    assert_eq!(controller.state().capital_committed, dec!(100));

    // The market moves in our favour before the SELL is listed.
    mock.set_book("tok-yes-m1", book(dec!(0.44), dec!(0.46)));
    run_to_stage(&mut controller, Stage::SellMonitoring, 5).await;
    let sell = mock.order("mock-2");
    assert_eq!(sell.price, dec!(0.459));
    assert_eq!(sell.size, dec!(250));
    assert_eq!(controller.state().target_sell_price, Some(dec!(0.459)));

    mock.fill_remaining("mock-2", dec!(0.459));
    run_to_stage(&mut controller, Stage::Completed, 3).await;

    let outcome = step(&mut controller).await;
    assert!(matches!(outcome, StepOutcome::Continue { .. }));
    assert_eq!(controller.state().stage, Stage::Idle);
    assert_eq!(controller.state().cycle_number, 2);
    assert_eq!(controller.state().market_id, None);

    let records = storage::load_pnl_records(cfg.storage.ledger_file.as_deref()).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].market_id, "m1");
    assert_eq!(records[0].sell_order_id.as_deref(), Some("mock-2"));
    assert_eq!(records[0].buy_cost, dec!(100));
    assert_eq!(records[0].sell_proceeds, dec!(114.75));
    assert_eq!(records[0].pnl, dec!(14.75));
    assert_eq!(records[0].pnl_percent, dec!(14.75));
    assert!(!records[0].stop_loss);

    assert_eq!(mock.balance(), dec!(514.75));
    assert_eq!(mock.holdings("tok-yes-m1"), Decimal::ZERO);
    assert_eq!(mock.open_order_count(), 0);
    cleanup(&cfg);
}

#[tokio::test]
async fn stop_loss_replaces_the_sell_below_the_bid() {
    let cfg = test_config("stop");
    let mock = MockExchange::new(dec!(500));
    mock.add_market(market("m1"));
    mock.set_book("tok-yes-m1", book(dec!(0.40), dec!(0.42)));

    let mut controller = controller_for(&cfg, &mock);
    run_to_stage(&mut controller, Stage::BuyMonitoring, 5).await;
    mock.fill_remaining("mock-1", dec!(0.40));
    run_to_stage(&mut controller, Stage::BuyFilled, 3).await;
    mock.set_book("tok-yes-m1", book(dec!(0.44), dec!(0.46)));
    run_to_stage(&mut controller, Stage::SellMonitoring, 5).await;

    // The bid collapses to 12% below entry. The third monitoring tick
    // runs the stop-loss check and forces an exit one tick under the bid.
    mock.set_book("tok-yes-m1", book(dec!(0.352), dec!(0.40)));
    for _ in 0..3 {
        step(&mut controller).await;
    }

    assert!(controller.state().stop_loss_triggered);
    assert_eq!(controller.state().order_id.as_deref(), Some("mock-3"));
    assert_eq!(mock.order("mock-2").status, OrderStatus::Cancelled);
    let exit = mock.order("mock-3");
    assert_eq!(exit.price, dec!(0.351));
    assert_eq!(exit.size, dec!(250));

    mock.fill_remaining("mock-3", dec!(0.351));
    run_to_stage(&mut controller, Stage::Completed, 3).await;

    let records = storage::load_pnl_records(cfg.storage.ledger_file.as_deref()).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].sell_proceeds, dec!(87.75));
    assert_eq!(records[0].pnl, dec!(-12.25));
    assert_eq!(records[0].pnl_percent, dec!(-12.25));
    assert!(records[0].stop_loss);
    assert_eq!(mock.balance(), dec!(487.75));
    cleanup(&cfg);
}

#[tokio::test]
async fn liquidity_collapse_reprices_the_resting_sell() {
    let mut cfg = test_config("reprice");
    cfg.sell.allow_below_buy_price = true;
    cfg.risk.enable_stop_loss = false;

    let mock = MockExchange::new(dec!(500));
    mock.add_market(market("m1"));
    mock.set_book("tok-yes-m1", book(dec!(0.40), dec!(0.42)));

    let mut controller = controller_for(&cfg, &mock);
    run_to_stage(&mut controller, Stage::BuyMonitoring, 5).await;
    mock.fill_remaining("mock-1", dec!(0.40));
    run_to_stage(&mut controller, Stage::BuyFilled, 3).await;
    mock.set_book("tok-yes-m1", book(dec!(0.44), dec!(0.46)));
    run_to_stage(&mut controller, Stage::SellMonitoring, 5).await;

    // The bid falls 55% from the baseline captured at entry; the third
    // tick reprices down to one tick above the new best bid.
    mock.set_book("tok-yes-m1", book(dec!(0.18), dec!(0.20)));
    for _ in 0..3 {
        step(&mut controller).await;
    }

    assert_eq!(controller.state().repricing_count, 1);
    assert_eq!(controller.state().order_id.as_deref(), Some("mock-3"));
    assert_eq!(controller.state().sell_price, Some(dec!(0.181)));
    assert_eq!(controller.state().target_sell_price, Some(dec!(0.459)));
    assert_eq!(mock.order("mock-2").status, OrderStatus::Cancelled);
    assert_eq!(mock.order("mock-3").price, dec!(0.181));

    // Liquidity returns and a buyer lifts the repriced order well above
    // its limit price.
    mock.fill_remaining("mock-3", dec!(0.43));
    run_to_stage(&mut controller, Stage::Completed, 3).await;

    let records = storage::load_pnl_records(cfg.storage.ledger_file.as_deref()).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].sell_proceeds, dec!(107.5));
    assert_eq!(records[0].pnl, dec!(7.5));
    assert_eq!(records[0].pnl_percent, dec!(7.5));
    assert!(!records[0].stop_loss);
    cleanup(&cfg);
}

#[tokio::test]
async fn expired_buy_with_dust_fill_abandons_without_a_ledger_entry() {
    let cfg = test_config("dust");
    let mock = MockExchange::new(dec!(500));
    mock.add_market(market("m1"));
    mock.set_book("tok-yes-m1", book(dec!(0.40), dec!(0.42)));

    let mut controller = controller_for(&cfg, &mock);
    run_to_stage(&mut controller, Stage::BuyMonitoring, 5).await;

    // The venue expires the BUY after a 4.9-share fill, below the
    // 5-share sellable minimum.
    mock.fill_order("mock-1", dec!(4.9), dec!(0.40));
    mock.expire_order("mock-1");
    run_to_stage(&mut controller, Stage::Completed, 4).await;

    let records = storage::load_pnl_records(cfg.storage.ledger_file.as_deref()).unwrap();
    assert!(records.is_empty());
    assert_eq!(mock.holdings("tok-yes-m1"), dec!(4.9));
    assert_eq!(mock.balance(), dec!(498.04));

    step(&mut controller).await;
    assert_eq!(controller.state().stage, Stage::Idle);
    assert_eq!(controller.state().cycle_number, 2);
    cleanup(&cfg);
}

#[tokio::test]
async fn manual_sale_is_reconciled_into_the_ledger() {
    let cfg = test_config("manual");
    let mock = MockExchange::new(dec!(500));
    mock.add_market(market("m1"));
    mock.set_book("tok-yes-m1", book(dec!(0.40), dec!(0.42)));

    let mut controller = controller_for(&cfg, &mock);
    run_to_stage(&mut controller, Stage::BuyMonitoring, 5).await;
    mock.fill_remaining("mock-1", dec!(0.40));
    run_to_stage(&mut controller, Stage::BuyFilled, 3).await;

    // A human sells the whole position out from under the agent before
    // it lists its own SELL.
    let manual = mock
        .place_order("m1", "tok-yes-m1", OrderSide::Sell, dec!(0.44), dec!(250))
        .await
        .unwrap();
    mock.fill_remaining(&manual, dec!(0.44));
    assert_eq!(mock.holdings("tok-yes-m1"), Decimal::ZERO);

    step(&mut controller).await;
    assert_eq!(controller.state().stage, Stage::Completed);

    let records = storage::load_pnl_records(cfg.storage.ledger_file.as_deref()).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].sell_order_id.as_deref(), Some("manual-m1-1"));
    assert_eq!(records[0].buy_cost, dec!(100));
    assert_eq!(records[0].sell_proceeds, dec!(110));
    assert_eq!(records[0].pnl, dec!(10));
    cleanup(&cfg);
}

#[tokio::test]
async fn restart_resumes_a_listed_sell_from_saved_state() {
    let cfg = test_config("resume");
    let mock = MockExchange::new(dec!(500));
    mock.add_market(market("m1"));
    mock.set_book("tok-yes-m1", book(dec!(0.40), dec!(0.42)));

    {
        let mut first = controller_for(&cfg, &mock);
        run_to_stage(&mut first, Stage::BuyMonitoring, 5).await;
        mock.fill_remaining("mock-1", dec!(0.40));
        run_to_stage(&mut first, Stage::BuyFilled, 3).await;
        mock.set_book("tok-yes-m1", book(dec!(0.44), dec!(0.46)));
        run_to_stage(&mut first, Stage::SellPlaced, 3).await;
    }

    // Process restart: everything in memory is gone, only the state
    // file survives.
    let saved = storage::load_state(cfg.storage.state_file.as_deref())
        .unwrap()
        .expect("state file written before the restart");
    assert_eq!(saved.stage, Stage::SellPlaced);
    assert_eq!(saved.order_id.as_deref(), Some("mock-2"));

    let exchange: Arc<dyn ExchangeClient> = Arc::new(mock.clone());
    let selector = SpreadScanner::new(Arc::clone(&exchange), cfg.selector.clone());
    let mut resumed = CycleController::new(
        cfg.clone(),
        exchange,
        Box::new(selector),
        sink_from_config(&cfg.notifications),
        saved,
    );
    run_to_stage(&mut resumed, Stage::SellMonitoring, 3).await;
    mock.fill_remaining("mock-2", dec!(0.459));
    run_to_stage(&mut resumed, Stage::Completed, 3).await;

    let records = storage::load_pnl_records(cfg.storage.ledger_file.as_deref()).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].pnl, dec!(14.75));
    assert_eq!(mock.balance(), dec!(514.75));
    cleanup(&cfg);
}

#[tokio::test]
async fn transient_venue_failures_skip_the_tick() {
    let cfg = test_config("transient");
    let mock = MockExchange::new(dec!(500));
    mock.add_market(market("m1"));
    mock.set_book("tok-yes-m1", book(dec!(0.40), dec!(0.42)));

    let mut controller = controller_for(&cfg, &mock);
    step(&mut controller).await;
    assert_eq!(controller.state().stage, Stage::Scanning);

    mock.set_error("venue 503");
    for _ in 0..2 {
        step(&mut controller).await;
    }
    assert_eq!(controller.state().stage, Stage::Scanning);
    assert_eq!(mock.open_order_count(), 0);

    mock.clear_error();
    run_to_stage(&mut controller, Stage::BuyMonitoring, 5).await;
    assert_eq!(controller.state().order_id.as_deref(), Some("mock-1"));
    cleanup(&cfg);
}
