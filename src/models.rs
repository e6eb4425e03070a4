//! Data model shared by every pipeline stage

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed table for coded option durations
pub const DURATION_TABLE: &[(&str, u32)] = &[
    ("M1", 60),
    ("M2", 120),
    ("M3", 180),
    ("M5", 300),
    ("M15", 900),
];

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Call,
    Put,
}

impl Direction {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "call" => Some(Direction::Call),
            "put" => Some(Direction::Put),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Call => "call",
            Direction::Put => "put",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested option duration, either a coded interval ("M5") or raw seconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DurationSpec {
    Coded(String),
    Seconds(u32),
}

impl DurationSpec {
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        match s.parse::<u32>() {
            Ok(secs) => DurationSpec::Seconds(secs),
            Err(_) => DurationSpec::Coded(s.to_uppercase()),
        }
    }

    /// Resolve to seconds through the duration table. Range checks are the
    /// caller's concern.
    pub fn to_seconds(&self) -> Option<u32> {
        match self {
            DurationSpec::Seconds(secs) => Some(*secs),
            DurationSpec::Coded(code) => DURATION_TABLE
                .iter()
                .find(|(c, _)| c.eq_ignore_ascii_case(code))
                .map(|(_, secs)| *secs),
        }
    }
}

impl fmt::Display for DurationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DurationSpec::Coded(code) => f.write_str(code),
            DurationSpec::Seconds(secs) => write!(f, "{}s", secs),
        }
    }
}

/// Signal as delivered by a source, before validation. Every field is
/// optional so incomplete messages can be reported rather than dropped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawSignal {
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub direction: Option<String>,
}

impl RawSignal {
    pub fn new(symbol: &str, duration: &str, time: &str, direction: &str) -> Self {
        Self {
            symbol: Some(symbol.to_string()),
            duration: Some(duration.to_string()),
            time: Some(time.to_string()),
            direction: Some(direction.to_string()),
        }
    }

    pub fn describe(&self) -> String {
        format!(
            "{} {} {} {}",
            self.symbol.as_deref().unwrap_or("?"),
            self.duration.as_deref().unwrap_or("?"),
            self.time.as_deref().unwrap_or("?"),
            self.direction.as_deref().unwrap_or("?"),
        )
    }
}

/// Validated, immutable trade signal
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub symbol: String,
    pub duration: DurationSpec,
    /// Time of day in the scheduler's reference timezone
    pub target_time: NaiveTime,
    pub direction: Direction,
}

/// Settlement outcome of a single trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Win,
    Loss,
    Tie,
    Unknown,
}

impl Outcome {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "win" => Outcome::Win,
            "loss" | "lose" => Outcome::Loss,
            "tie" | "draw" => Outcome::Tie,
            _ => Outcome::Unknown,
        }
    }

    /// Unknown settles as a loss: a win is never assumed without confirmation
    pub fn for_staking(self) -> Outcome {
        match self {
            Outcome::Unknown => Outcome::Loss,
            other => other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Win => "win",
            Outcome::Loss => "loss",
            Outcome::Tie => "tie",
            Outcome::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw result as reported by the endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementReport {
    pub trade_id: String,
    pub outcome: Outcome,
    /// Profit reported by the endpoint (negative for losses), if any
    #[serde(default)]
    pub profit: Option<f64>,
}

/// Settlement as seen by the pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct SettlementResult {
    pub trade_id: String,
    pub outcome: Outcome,
    pub profit_or_loss: f64,
}

/// One submission at one stake level
#[derive(Debug, Clone)]
pub struct TradeAttempt {
    pub signal: Signal,
    pub resolved_symbol: String,
    pub amount: f64,
    pub duration_secs: u32,
    pub direction: Direction,
    pub payout_pct: f64,
    /// Balance read by the balance gate, before the stake was debited
    pub balance_before: f64,
    /// None until the endpoint acknowledges the submission
    pub trade_id: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    ProfitTarget,
    LossLimit,
    ManualExit,
    ConnectionFailure,
    UnexpectedError,
}

impl StopReason {
    /// Process exit status: failures are non-zero, planned stops are 0
    pub fn exit_code(&self) -> i32 {
        match self {
            StopReason::ConnectionFailure | StopReason::UnexpectedError => 1,
            StopReason::ProfitTarget | StopReason::LossLimit | StopReason::ManualExit => 0,
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::ProfitTarget => "Reached Profit Limit",
            StopReason::LossLimit => "Reached Loss Limit",
            StopReason::ManualExit => "Manual Exit",
            StopReason::ConnectionFailure => "Connection Failure",
            StopReason::UnexpectedError => "Unexpected Error",
        };
        f.write_str(s)
    }
}

/// Final report of a session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub initial_balance: f64,
    pub net_profit: f64,
    pub net_loss: f64,
    pub final_balance: f64,
    pub total_trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub ties: u32,
    pub stop_reason: StopReason,
}

impl SessionSummary {
    /// Summary for a session that never reached a tradable state
    pub fn empty(stop_reason: StopReason) -> Self {
        Self {
            initial_balance: 0.0,
            net_profit: 0.0,
            net_loss: 0.0,
            final_balance: 0.0,
            total_trades: 0,
            wins: 0,
            losses: 0,
            ties: 0,
            stop_reason,
        }
    }
}

/// Account statistics shown to the operator
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub wins: u32,
    pub losses: u32,
    pub ties: u32,
    pub total_trades: u32,
    pub net_profit: f64,
    pub current_balance: f64,
}

impl StatsSnapshot {
    pub fn win_rate_pct(&self) -> f64 {
        if self.total_trades > 0 {
            self.wins as f64 / self.total_trades as f64 * 100.0
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_table() {
        assert_eq!(DurationSpec::parse("M1").to_seconds(), Some(60));
        assert_eq!(DurationSpec::parse("m5").to_seconds(), Some(300));
        assert_eq!(DurationSpec::parse("M15").to_seconds(), Some(900));
        assert_eq!(DurationSpec::parse("M4").to_seconds(), None);
        assert_eq!(DurationSpec::parse("120").to_seconds(), Some(120));
    }

    #[test]
    fn test_unknown_outcome_stakes_as_loss() {
        assert_eq!(Outcome::Unknown.for_staking(), Outcome::Loss);
        assert_eq!(Outcome::Win.for_staking(), Outcome::Win);
        assert_eq!(Outcome::parse("WIN"), Outcome::Win);
        assert_eq!(Outcome::parse("garbage"), Outcome::Unknown);
    }

    #[test]
    fn test_direction_parse() {
        assert_eq!(Direction::parse(" Call "), Some(Direction::Call));
        assert_eq!(Direction::parse("put"), Some(Direction::Put));
        assert_eq!(Direction::parse("up"), None);
    }

    #[test]
    fn test_exit_code_by_stop_reason() {
        assert_eq!(StopReason::ProfitTarget.exit_code(), 0);
        assert_eq!(StopReason::LossLimit.exit_code(), 0);
        assert_eq!(StopReason::ManualExit.exit_code(), 0);
        assert_eq!(StopReason::ConnectionFailure.exit_code(), 1);
        assert_eq!(StopReason::UnexpectedError.exit_code(), 1);
    }

    #[test]
    fn test_win_rate_with_no_trades() {
        let stats = StatsSnapshot {
            wins: 0,
            losses: 0,
            ties: 0,
            total_trades: 0,
            net_profit: 0.0,
            current_balance: 100.0,
        };
        assert_eq!(stats.win_rate_pct(), 0.0);
    }
}
