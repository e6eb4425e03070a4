//! Typed failures for every stage of the signal-to-trade pipeline
//!
//! Gate failures (`TradeFailure`) are terminal for one signal only.
//! `PipelineError` covers the cases that abandon a signal outside the gates
//! or end the session.

use thiserror::Error;

/// Why the orchestrator refused or failed to place a trade
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TradeFailure {
    #[error("no connectivity to the trading endpoint: {0}")]
    NoConnectivity(String),

    #[error("insufficient balance: {balance:.2} < required {required:.2}")]
    InsufficientBalance { balance: f64, required: f64 },

    #[error("payout for {symbol} is {payout:.0}% (minimum {minimum:.0}%)")]
    PayoutBelowThreshold { symbol: String, payout: f64, minimum: f64 },

    #[error("symbol {0} is not active on the endpoint")]
    SymbolInactive(String),

    #[error("invalid trade duration: {0}")]
    InvalidDuration(String),

    #[error("submission timed out after {0}s")]
    SubmissionTimeout(u64),

    #[error("submission failed: {0}")]
    SubmissionError(String),

    /// A trade id came back but the account never showed the trade.
    /// Never resubmitted: the order may be live.
    #[error("trade {trade_id} was not confirmed by the account")]
    NotConfirmed { trade_id: String },
}

impl TradeFailure {
    /// Short code used in audit logs
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoConnectivity(_) => "no_connectivity",
            Self::InsufficientBalance { .. } => "insufficient_balance",
            Self::PayoutBelowThreshold { .. } => "payout_below_threshold",
            Self::SymbolInactive(_) => "symbol_inactive",
            Self::InvalidDuration(_) => "invalid_duration",
            Self::SubmissionTimeout(_) => "submission_timeout",
            Self::SubmissionError(_) => "submission_error",
            Self::NotConfirmed { .. } => "not_confirmed",
        }
    }
}

/// Errors surfaced by a `TradingEndpoint` implementation
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EndpointError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The endpoint failed to parse the option duration while reporting a
    /// result. Known to clear up on its own after a few polls.
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    /// Result is not available yet
    #[error("result not ready")]
    NotReady,
}

impl EndpointError {
    /// Map a raw gateway error message onto the taxonomy
    pub fn from_message(message: &str) -> Self {
        if message.contains("Failed to parse duration") {
            Self::DurationParse(message.to_string())
        } else {
            Self::Rejected(message.to_string())
        }
    }
}

/// Invalid staking or pipeline configuration
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("max_loss_count must be a whole number >= 1, got {0}")]
    MaxLossCount(f64),

    #[error("{field} must be a finite, non-negative number, got {value}")]
    Negative { field: &'static str, value: f64 },

    #[error("{field} must be greater than zero, got {value}")]
    NotPositive { field: &'static str, value: f64 },

    #[error("multiplier must be >= 1, got {0}")]
    Multiplier(f64),

    #[error("invalid utc offset: {0} minutes")]
    UtcOffset(i32),
}

/// Why a signal was refused before any trade was attempted
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SignalRejection {
    #[error("signal is missing field `{0}`")]
    MissingField(&'static str),

    #[error("target time `{0}` is not HH:MM:SS")]
    InvalidTime(String),

    #[error("direction `{0}` is neither call nor put")]
    InvalidDirection(String),

    #[error("target time is {0:.0}s away (too far in the future)")]
    TooFarInFuture(f64),

    #[error("target time passed {0:.0}s ago")]
    Expired(f64),
}

/// Failures that abandon a signal outside the gate sequence, or stop the session
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    #[error("connectivity error: {0}")]
    ConnectivityError(String),

    #[error("settlement of trade {0} could not be determined")]
    SettlementUnknown(String),

    #[error("configuration error: {0}")]
    ConfigurationError(#[from] ConfigError),

    #[error("staking policy fault: {0}")]
    Policy(String),
}
