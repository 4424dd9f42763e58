//! ORBIT — Autonomous Single-Position Trading Cycle Agent
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod accounting;
pub mod config;
pub mod engine;
pub mod exchange;
pub mod liquidity;
pub mod monitor;
pub mod notify;
pub mod reconcile;
pub mod risk;
pub mod selector;
pub mod storage;
pub mod types;
