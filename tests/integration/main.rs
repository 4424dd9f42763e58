//! Integration test target: full trading cycles against an in-memory venue.

mod cycle;
mod mock_exchange;
