//! Audit trail and operator presentation
//!
//! Every call is fire-and-forget: a sink that fails to write logs the error
//! and returns, it never aborts the pipeline.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::models::{SessionSummary, StatsSnapshot};

const TRADE_LOG: &str = "trade_log.csv";
const SIGNAL_LOG: &str = "signals_log.csv";
const SESSION_LOG: &str = "session_log.csv";

const TRADE_HEADER: &[&str] = &["Signal ID", "Timestamp", "Symbol", "Trade Type", "Amount", "Result", "Balance"];
const SIGNAL_HEADER: &[&str] = &["Signal ID", "Timestamp", "Symbol", "Trade Time", "Direction", "Accepted", "Note"];
const SESSION_HEADER: &[&str] = &[
    "Session ID", "Start Time", "End Time", "Account Type", "Total Profit", "Total Loss",
    "Final Balance", "Total Trades", "Wins", "Losses", "Ties", "Stop Reason",
];

#[derive(Debug, Clone)]
pub struct SignalRecord {
    pub symbol: String,
    pub trade_time: String,
    pub direction: String,
    pub accepted: bool,
    /// Rejection or skip reason, empty when accepted
    pub note: String,
}

#[derive(Debug, Clone)]
pub struct TradeRecord {
    pub signal_id: String,
    pub symbol: String,
    pub direction: String,
    pub amount: f64,
    /// Outcome, or the failure code for trades that never settled
    pub result: String,
    pub balance: f64,
}

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub account_type: String,
    pub summary: SessionSummary,
}

pub trait AuditSink: Send + Sync {
    /// Record a received signal and return its id
    fn log_signal(&self, record: &SignalRecord) -> String;
    fn log_trade(&self, record: &TradeRecord);
    fn log_session(&self, record: &SessionRecord);
    fn display_stats(&self, stats: &StatsSnapshot);
}

/// Unique id: time prefix + random suffix
pub fn generate_id() -> String {
    let now = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let random: u64 = rand::random();
    format!("{:016x}-{:016x}", now as u64, random)
}

/// Appends to trade_log.csv, signals_log.csv and session_log.csv
pub struct CsvAuditSink {
    dir: PathBuf,
}

impl CsvAuditSink {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

        let sink = Self { dir: dir.to_path_buf() };
        for (file, header) in [(TRADE_LOG, TRADE_HEADER), (SIGNAL_LOG, SIGNAL_HEADER), (SESSION_LOG, SESSION_HEADER)] {
            sink.append_row(file, header, None)?;
        }
        Ok(sink)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append one row, writing the header first if the file is new or empty
    fn append_row(&self, file: &str, header: &[&str], row: Option<&[String]>) -> Result<()> {
        let path = self.dir.join(file);
        let handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let is_empty = handle.metadata()?.len() == 0;

        let mut wtr = csv::WriterBuilder::new().has_headers(false).from_writer(handle);
        if is_empty {
            wtr.write_record(header)?;
        }
        if let Some(row) = row {
            wtr.write_record(row)?;
        }
        wtr.flush()?;
        Ok(())
    }

    fn append_or_warn(&self, file: &str, header: &[&str], row: &[String]) {
        if let Err(e) = self.append_row(file, header, Some(row)) {
            warn!("Failed to write {}: {:#}", file, e);
        }
    }
}

impl AuditSink for CsvAuditSink {
    fn log_signal(&self, record: &SignalRecord) -> String {
        let id = generate_id();
        self.append_or_warn(
            SIGNAL_LOG,
            SIGNAL_HEADER,
            &[
                id.clone(),
                Utc::now().to_rfc3339(),
                record.symbol.clone(),
                record.trade_time.clone(),
                record.direction.clone(),
                record.accepted.to_string(),
                record.note.clone(),
            ],
        );
        info!("Signal logged: id={} {} {} accepted={}", id, record.symbol, record.direction, record.accepted);
        id
    }

    fn log_trade(&self, record: &TradeRecord) {
        self.append_or_warn(
            TRADE_LOG,
            TRADE_HEADER,
            &[
                record.signal_id.clone(),
                Utc::now().to_rfc3339(),
                record.symbol.clone(),
                record.direction.clone(),
                format!("{:.2}", record.amount),
                record.result.clone(),
                format!("{:.2}", record.balance),
            ],
        );
        info!(
            "Trade logged: signal={} {} {} ${:.2} result={} balance=${:.2}",
            record.signal_id, record.symbol, record.direction, record.amount, record.result, record.balance
        );
    }

    fn log_session(&self, record: &SessionRecord) {
        let s = &record.summary;
        self.append_or_warn(
            SESSION_LOG,
            SESSION_HEADER,
            &[
                generate_id(),
                record.start.to_rfc3339(),
                record.end.to_rfc3339(),
                record.account_type.clone(),
                format!("{:.2}", s.net_profit),
                format!("{:.2}", s.net_loss),
                format!("{:.2}", s.final_balance),
                s.total_trades.to_string(),
                s.wins.to_string(),
                s.losses.to_string(),
                s.ties.to_string(),
                s.stop_reason.to_string(),
            ],
        );
        info!("Session logged: trades={} reason={}", s.total_trades, s.stop_reason);
    }

    fn display_stats(&self, stats: &StatsSnapshot) {
        println!("\n📊 Account statistics");
        println!("   Wins:         {}", stats.wins);
        println!("   Net profit:   ${:.2}", stats.net_profit);
        println!("   Losses:       {}", stats.losses);
        println!("   Ties:         {}", stats.ties);
        println!("   Win rate:     {:.2}%", stats.win_rate_pct());
        println!("   Total trades: {}", stats.total_trades);
        println!("   Balance:      ${:.2}\n", stats.current_balance);
    }
}

/// Log-only sink
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn log_signal(&self, record: &SignalRecord) -> String {
        let id = generate_id();
        info!(
            signal_id = %id,
            symbol = %record.symbol,
            direction = %record.direction,
            accepted = record.accepted,
            note = %record.note,
            "signal"
        );
        id
    }

    fn log_trade(&self, record: &TradeRecord) {
        info!(
            signal_id = %record.signal_id,
            symbol = %record.symbol,
            amount = record.amount,
            result = %record.result,
            balance = record.balance,
            "trade"
        );
    }

    fn log_session(&self, record: &SessionRecord) {
        info!(
            account = %record.account_type,
            net_profit = record.summary.net_profit,
            net_loss = record.summary.net_loss,
            trades = record.summary.total_trades,
            reason = %record.summary.stop_reason,
            "session"
        );
    }

    fn display_stats(&self, stats: &StatsSnapshot) {
        info!(
            "Stats: {}W/{}L/{}T ({:.1}%) net ${:.2} balance ${:.2}",
            stats.wins, stats.losses, stats.ties, stats.win_rate_pct(), stats.net_profit, stats.current_balance
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StopReason;

    fn read_lines(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path).unwrap().lines().map(String::from).collect()
    }

    #[test]
    fn test_headers_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let _ = CsvAuditSink::new(dir.path()).unwrap();
        let sink = CsvAuditSink::new(dir.path()).unwrap();

        let id = sink.log_signal(&SignalRecord {
            symbol: "EURUSD".into(),
            trade_time: "10:00:00".into(),
            direction: "call".into(),
            accepted: true,
            note: String::new(),
        });

        let lines = read_lines(&dir.path().join(SIGNAL_LOG));
        assert_eq!(lines.len(), 2, "header + one row: {:?}", lines);
        assert!(lines[0].starts_with("Signal ID"));
        assert!(lines[1].starts_with(&id));
    }

    #[test]
    fn test_trade_and_session_rows() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvAuditSink::new(dir.path()).unwrap();

        sink.log_trade(&TradeRecord {
            signal_id: "abc".into(),
            symbol: "eurusd_otc".into(),
            direction: "put".into(),
            amount: 2.0,
            result: "loss".into(),
            balance: 98.0,
        });

        let mut summary = SessionSummary::empty(StopReason::LossLimit);
        summary.total_trades = 1;
        summary.losses = 1;
        sink.log_session(&SessionRecord {
            start: Utc::now(),
            end: Utc::now(),
            account_type: "Demo".into(),
            summary,
        });

        let trades = read_lines(&dir.path().join(TRADE_LOG));
        assert_eq!(trades.len(), 2);
        assert!(trades[1].contains("eurusd_otc,put,2.00,loss,98.00"));

        let sessions = read_lines(&dir.path().join(SESSION_LOG));
        assert!(sessions[1].ends_with("Reached Loss Limit"));
    }

    #[test]
    fn test_ids_unique() {
        assert_ne!(generate_id(), generate_id());
    }
}
