//! ORBIT — Autonomous Single-Position Trading Cycle Agent
//!
//! Entry point. Loads configuration, initialises structured logging,
//! restores the cycle state from disk (or starts fresh), and drives the
//! buy→monitor→sell→monitor state machine with graceful shutdown.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use orbit::config;
use orbit::engine::{CycleController, StepOutcome};
use orbit::exchange::rest::RestExchange;
use orbit::notify;
use orbit::selector::SpreadScanner;
use orbit::storage;
use orbit::types::TradingCycleState;

const BANNER: &str = r#"
   ___  ____  ____ ___ _____
  / _ \|  _ \| __ )_ _|_   _|
 | | | | |_) |  _ \| |  | |
 | |_| |  _ <| |_) | |  | |
  \___/|_| \_\____/___| |_|

  One Round-trip Buy-sell Income Trader
  v0.1.0 — Autonomous Agent
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    // Load and validate configuration from TOML
    let cfg = config::AppConfig::load("config.toml")?;

    // Initialise structured logging
    init_logging();

    // Print startup banner
    println!("{BANNER}");
    info!(
        agent_name = %cfg.agent.name,
        cycle_delay_secs = cfg.agent.cycle_delay_secs,
        fill_check_interval_secs = cfg.agent.fill_check_interval_secs,
        capital_mode = ?cfg.capital.mode,
        "ORBIT starting up"
    );

    // -- Restore or create state -----------------------------------------

    let state = match storage::load_state(cfg.storage.state_file.as_deref())? {
        Some(s) => {
            info!(
                stage = %s.stage,
                cycle = s.cycle_number,
                market = s.market_id.as_deref().unwrap_or("-"),
                "Resumed from saved state"
            );
            s
        }
        None => {
            let s = TradingCycleState::new();
            info!("Fresh start");
            s
        }
    };

    // -- Initialise components -------------------------------------------

    let exchange: Arc<dyn orbit::exchange::ExchangeClient> =
        Arc::new(RestExchange::new(&cfg.exchange)?);
    let selector = SpreadScanner::new(Arc::clone(&exchange), cfg.selector.clone());
    let notifier = notify::sink_from_config(&cfg.notifications);

    let mut controller = CycleController::new(
        cfg.clone(),
        exchange,
        Box::new(selector),
        notifier,
        state,
    );

    if let Err(e) = controller.accountant().log_summary() {
        warn!(error = %e, "Could not read the ledger for the session summary");
    }

    // -- Main loop -------------------------------------------------------

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!("Entering trading loop. Press Ctrl+C to stop.");

    let mut delay = Duration::ZERO;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                match controller.step().await {
                    Ok(StepOutcome::Continue { next_delay }) => delay = next_delay,
                    Ok(StepOutcome::Halted) => {
                        info!("Agent halted after a completed cycle.");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "Unrecoverable failure, shutting down");
                        return Err(e.into());
                    }
                }
            }
            _ = &mut shutdown => {
                info!(
                    stage = %controller.state().stage,
                    "Shutdown signal received. State is saved; resume to continue the cycle."
                );
                break;
            }
        }
    }

    if let Err(e) = controller.accountant().log_summary() {
        error!(error = %e, "Could not read the ledger for the final summary");
    }
    info!("ORBIT shut down cleanly.");

    Ok(())
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("orbit=info"));

    let json_logging = std::env::var("ORBIT_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt().with_env_filter(env_filter).with_target(true).init();
    }
}
