//! Market selection.
//!
//! A selector turns the venue's market catalogue into an ordered list of
//! candidates worth opening a position in. The controller takes the
//! top-ranked candidate; an empty list simply means "keep scanning".

pub mod spread;

pub use spread::SpreadScanner;

use async_trait::async_trait;

use crate::types::{CandidateMarket, OrbitError};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketSelector: Send + Sync {
    fn name(&self) -> &str;

    /// Scan the venue and return candidates, best first.
    async fn scan(&self) -> Result<Vec<CandidateMarket>, OrbitError>;
}
