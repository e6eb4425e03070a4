//! Settlement polling and P/L reconciliation

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::SettlementConfig;
use crate::endpoint::TradingEndpoint;
use crate::error::EndpointError;
use crate::models::{Outcome, SettlementReport, SettlementResult};
use crate::retry::{retry, ErrorClass, RetryError, RetryPolicy};

pub struct SettlementWaiter {
    endpoint: Arc<dyn TradingEndpoint>,
    config: SettlementConfig,
}

/// Duration-parse errors are expected right after expiry; every other error,
/// including "not ready", spends one attempt at the normal interval.
fn classify(e: &EndpointError) -> ErrorClass {
    match e {
        EndpointError::DurationParse(_) => ErrorClass::Transient,
        _ => ErrorClass::Retryable,
    }
}

impl SettlementWaiter {
    pub fn new(endpoint: Arc<dyn TradingEndpoint>, config: SettlementConfig) -> Self {
        Self { endpoint, config }
    }

    pub fn poll_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.config.max_attempts.max(1), Duration::from_millis(self.config.poll_interval_ms))
            .with_transient_escalation(
                self.config.tolerated_duration_errors,
                Duration::from_millis(self.config.escalated_interval_ms),
            )
    }

    /// Wait out the option, then poll for its result. Never hangs: an
    /// exhausted budget yields `Outcome::Unknown`.
    pub async fn await_result(&self, trade_id: &str, duration_secs: u32) -> SettlementReport {
        let started = Instant::now();
        let wait = duration_secs.saturating_sub(self.config.safety_margin_secs);
        info!("Waiting {}s for trade {} to expire", wait, trade_id);
        tokio::time::sleep(Duration::from_secs(wait as u64)).await;

        let polled = retry(&self.poll_policy(), classify, |attempt| async move {
            match self.endpoint.check_result(trade_id).await {
                Ok(Some(report)) => Ok(report),
                Ok(None) => Err(EndpointError::NotReady),
                Err(e) => {
                    if let EndpointError::DurationParse(_) = e {
                        warn!("Ignoring duration parse error (attempt {}): {}", attempt, e);
                    }
                    Err(e)
                }
            }
        })
        .await;

        match polled {
            Ok(report) => {
                info!("Trade {} settled: {} after {:?}", trade_id, report.outcome, started.elapsed());
                report
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                error!(
                    "No result for trade {} after {} attempts (last error: {})",
                    trade_id,
                    attempts,
                    last.map(|e| e.to_string()).unwrap_or_default()
                );
                SettlementReport { trade_id: trade_id.to_string(), outcome: Outcome::Unknown, profit: None }
            }
            Err(RetryError::Fatal(e)) => {
                error!("Polling trade {} failed: {}", trade_id, e);
                SettlementReport { trade_id: trade_id.to_string(), outcome: Outcome::Unknown, profit: None }
            }
        }
    }
}

/// Trade P/L from the balance delta when its sign agrees with the outcome,
/// otherwise from the reported profit. Ties always take the delta.
pub fn reconcile(report: &SettlementReport, stake: f64, balance_before: f64, balance_after: f64) -> SettlementResult {
    let delta = balance_after - balance_before;
    let profit_or_loss = match report.outcome {
        Outcome::Tie => delta,
        Outcome::Win if delta > 0.0 => delta,
        Outcome::Loss | Outcome::Unknown if delta < 0.0 => delta,
        Outcome::Win => report.profit.unwrap_or(0.0),
        Outcome::Loss | Outcome::Unknown => report.profit.unwrap_or(-stake),
    };

    SettlementResult { trade_id: report.trade_id.clone(), outcome: report.outcome, profit_or_loss }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    /// Replies to `check_result` from a script, then "not ready" forever
    struct ScriptedResults {
        replies: Mutex<VecDeque<Result<Option<SettlementReport>, EndpointError>>>,
        calls: Mutex<Vec<Instant>>,
    }

    impl ScriptedResults {
        fn new(replies: Vec<Result<Option<SettlementReport>, EndpointError>>) -> Arc<Self> {
            Arc::new(Self { replies: Mutex::new(replies.into()), calls: Mutex::new(Vec::new()) })
        }
    }

    #[async_trait]
    impl TradingEndpoint for ScriptedResults {
        async fn balance(&self) -> Result<f64, EndpointError> {
            Ok(100.0)
        }
        async fn payout(&self) -> Result<HashMap<String, f64>, EndpointError> {
            Ok(HashMap::new())
        }
        async fn buy(&self, _: &str, _: f64, _: u32) -> Result<Option<String>, EndpointError> {
            Ok(None)
        }
        async fn sell(&self, _: &str, _: f64, _: u32) -> Result<Option<String>, EndpointError> {
            Ok(None)
        }
        async fn check_result(&self, _: &str) -> Result<Option<SettlementReport>, EndpointError> {
            self.calls.lock().unwrap().push(Instant::now());
            self.replies.lock().unwrap().pop_front().unwrap_or(Ok(None))
        }
    }

    fn win(id: &str) -> SettlementReport {
        SettlementReport { trade_id: id.to_string(), outcome: Outcome::Win, profit: Some(0.85) }
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_duration_minus_margin() {
        let endpoint = ScriptedResults::new(vec![Ok(Some(win("t1")))]);
        let waiter = SettlementWaiter::new(endpoint.clone(), SettlementConfig::default());
        let started = Instant::now();

        let report = waiter.await_result("t1", 60).await;

        assert_eq!(report.outcome, Outcome::Win);
        let calls = endpoint.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0] - started, Duration::from_secs(59));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_yields_unknown() {
        let endpoint = ScriptedResults::new(vec![]);
        let waiter = SettlementWaiter::new(endpoint.clone(), SettlementConfig::default());

        let report = waiter.await_result("t2", 1).await;

        assert_eq!(report.outcome, Outcome::Unknown);
        assert_eq!(report.outcome.for_staking(), Outcome::Loss);
        assert_eq!(endpoint.calls.lock().unwrap().len(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_parse_errors_escalate_backoff() {
        let mut replies: Vec<_> = (0..7)
            .map(|_| Err(EndpointError::DurationParse("Failed to parse duration".into())))
            .collect();
        replies.push(Ok(Some(win("t3"))));
        let endpoint = ScriptedResults::new(replies);
        let waiter = SettlementWaiter::new(endpoint.clone(), SettlementConfig::default());

        let report = waiter.await_result("t3", 0).await;
        assert_eq!(report.outcome, Outcome::Win);

        let calls = endpoint.calls.lock().unwrap();
        let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
        // Five tolerated at 0.5s, then 1.0s
        assert_eq!(gaps[..5], [Duration::from_millis(500); 5]);
        assert_eq!(gaps[5..], [Duration::from_millis(1000); 2]);
    }

    #[test]
    fn test_reconcile_prefers_agreeing_delta() {
        let report = win("a");
        let r = reconcile(&report, 1.0, 100.0, 100.9);
        assert!((r.profit_or_loss - 0.9).abs() < 1e-9);

        // Balance not yet credited: fall back to the reported profit
        let r = reconcile(&report, 1.0, 100.0, 99.0);
        assert_eq!(r.profit_or_loss, 0.85);
    }

    #[test]
    fn test_reconcile_loss_without_report() {
        let report = SettlementReport { trade_id: "b".into(), outcome: Outcome::Unknown, profit: None };
        assert_eq!(reconcile(&report, 2.0, 100.0, 100.0).profit_or_loss, -2.0);
        assert_eq!(reconcile(&report, 2.0, 100.0, 98.0).profit_or_loss, -2.0);
    }
}
