//! Core engine — the trading-cycle state machine and its helpers.

pub mod capital;
pub mod controller;
pub mod pricing;

pub use capital::CapitalManager;
pub use controller::{CycleController, StepOutcome};
pub use pricing::PricingEngine;
