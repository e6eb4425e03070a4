//! Signal-driven binary-option trade execution
//!
//! A session listens for trade signals, waits for each signal's target time,
//! places the trade through a `TradingEndpoint`, polls for its settlement and
//! escalates the stake after losses (Martingale) until a profit or loss
//! boundary stops the session.

pub mod audit;
pub mod cache;
pub mod cancel;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod pipeline;
pub mod retry;
pub mod scheduler;
pub mod settlement;
pub mod signal;
pub mod source;
pub mod staking;
