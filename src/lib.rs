//! Cross-venue arbitrage bot for 15-minute crypto prediction markets.
//!
//! Continuously compares equivalent binary markets on Kalshi and Polymarket,
//! detects fee-adjusted risk-free dislocations, and executes compensating
//! positions on both venues with bounded risk. Paper and live modes run
//! against the same decision pipeline.

pub mod bot;
pub mod client;
pub mod execution;
pub mod market;
pub mod monitoring;
pub mod risk;
pub mod storage;
pub mod strategy;
pub mod types;
pub mod utils;
