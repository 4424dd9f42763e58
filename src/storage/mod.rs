//! Persistence for the trading cycle record and the P&L ledger.
//!
//! The cycle record is a single JSON file written atomically (temp file then
//! rename) so a crash mid-write can never leave a torn state on disk. The
//! ledger is an append-only JSON-lines file with its own lifetime: cycle
//! resets never touch it. Both paths can be overridden, which the tests use.

use crate::types::{PnLRecord, Stage, TradingCycleState};
use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::{info, warn};

const DEFAULT_STATE_FILE: &str = "orbit_state.json";
const DEFAULT_LEDGER_FILE: &str = "orbit_ledger.jsonl";

// ---------------------------------------------------------------------------
// Cycle state
// ---------------------------------------------------------------------------

/// Persists the cycle record atomically.
pub fn save_state(state: &TradingCycleState, path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_STATE_FILE);
    let json = serde_json::to_string_pretty(state).context("Failed to serialize cycle state")?;
    let tmp = format!("{path}.tmp");
    fs::write(&tmp, json).with_context(|| format!("Failed to write state file: {tmp}"))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move state file into place: {path}"))?;
    Ok(())
}

/// Restores the cycle record. A missing file is a fresh start, not an
/// error. A record whose stage contradicts its fields is demoted to
/// SCANNING so the reconciler can repair it from the exchange.
pub fn load_state(path: Option<&str>) -> Result<Option<TradingCycleState>> {
    let path = path.unwrap_or(DEFAULT_STATE_FILE);
    if !Path::new(path).exists() {
        info!(path, "No saved state found, starting fresh");
        return Ok(None);
    }
    let raw =
        fs::read_to_string(path).with_context(|| format!("Failed to read state file: {path}"))?;
    let mut state: TradingCycleState =
        serde_json::from_str(&raw).with_context(|| format!("Failed to parse state file: {path}"))?;

    if let Err(reason) = state.validate() {
        warn!(
            stage = %state.stage,
            reason,
            "Restored state is inconsistent, demoting to SCANNING for reconciliation"
        );
        state.stage = Stage::Scanning;
    }
    Ok(Some(state))
}

pub fn delete_state(path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_STATE_FILE);
    if Path::new(path).exists() {
        fs::remove_file(path).with_context(|| format!("Failed to delete state file: {path}"))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// P&L ledger
// ---------------------------------------------------------------------------

/// Appends one record, one JSON line. Idempotent on `sell_order_id`: if a
/// record for the same sell order is already present the append is skipped,
/// so a crash between ledger write and state save cannot double-count.
pub fn append_pnl_record(record: &PnLRecord, path: Option<&str>) -> Result<bool> {
    let path = path.unwrap_or(DEFAULT_LEDGER_FILE);

    if let Some(linked) = record.sell_order_id.as_deref() {
        let existing = load_pnl_records(Some(path))?;
        if existing
            .iter()
            .any(|r| r.sell_order_id.as_deref() == Some(linked))
        {
            info!(
                sell_order_id = linked,
                "P&L record already in ledger, skipping duplicate append"
            );
            return Ok(false);
        }
    }

    let line = serde_json::to_string(record).context("Failed to serialize P&L record")?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open ledger file: {path}"))?;
    writeln!(file, "{line}").with_context(|| format!("Failed to append to ledger: {path}"))?;
    Ok(true)
}

/// Loads the full ledger. A missing file is an empty ledger; a torn
/// trailing line (crash mid-append) is skipped with a warning.
pub fn load_pnl_records(path: Option<&str>) -> Result<Vec<PnLRecord>> {
    let path = path.unwrap_or(DEFAULT_LEDGER_FILE);
    if !Path::new(path).exists() {
        return Ok(Vec::new());
    }
    let raw =
        fs::read_to_string(path).with_context(|| format!("Failed to read ledger file: {path}"))?;

    let mut records = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<PnLRecord>(line) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(
                    path,
                    line = idx + 1,
                    error = %e,
                    "Skipping unparseable ledger line"
                );
            }
        }
    }
    Ok(records)
}
