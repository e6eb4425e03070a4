//! Pre-trade gates, submission and confirmation
//!
//! Gate order: connectivity, balance, payout, duration, submit, confirm.
//! The first failing gate ends the attempt with a typed `TradeFailure`.

use chrono::Utc;
use reqwest::Client;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheKey, CacheValue, ValidityCache};
use crate::config::OrchestratorConfig;
use crate::endpoint::TradingEndpoint;
use crate::error::{EndpointError, TradeFailure};
use crate::models::{DurationSpec, Signal, TradeAttempt};
use crate::retry::{retry, ErrorClass, RetryError, RetryPolicy};
use crate::signal::{normalize_symbol, symbol_variants};

/// Why one payout query did not produce an answer
#[derive(Debug)]
enum PayoutMiss {
    Empty,
    Missing,
    Endpoint(EndpointError),
    Below { symbol: String, payout: f64 },
}

impl fmt::Display for PayoutMiss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayoutMiss::Empty => f.write_str("empty payout table"),
            PayoutMiss::Missing => f.write_str("symbol not listed"),
            PayoutMiss::Endpoint(e) => write!(f, "{}", e),
            PayoutMiss::Below { symbol, payout } => write!(f, "{} pays {}%", symbol, payout),
        }
    }
}

pub struct TradeOrchestrator {
    endpoint: Arc<dyn TradingEndpoint>,
    cache: Arc<ValidityCache>,
    config: OrchestratorConfig,
    http: Client,
}

impl TradeOrchestrator {
    pub fn new(endpoint: Arc<dyn TradingEndpoint>, cache: Arc<ValidityCache>, config: OrchestratorConfig) -> Self {
        Self { endpoint, cache, config, http: Client::new() }
    }

    fn retry_policy(&self, attempts: u32) -> RetryPolicy {
        RetryPolicy::fixed(attempts.max(1), Duration::from_millis(self.config.retry_delay_ms))
    }

    /// Place one trade for `signal` at `amount`, or explain why not
    pub async fn submit(&self, signal: &Signal, amount: f64, min_payout_pct: f64) -> Result<TradeAttempt, TradeFailure> {
        let started = Instant::now();

        // 1. Connectivity
        self.check_connectivity().await?;

        // 2. Balance
        let balance = self
            .fetch_balance()
            .await
            .map_err(|e| TradeFailure::NoConnectivity(format!("balance unavailable: {}", e)))?;
        let required = amount + self.config.minimum_trade_amount + self.config.safety_buffer;
        info!("Balance ${:.2}, stake ${:.2}, required ${:.2}", balance, amount, required);
        if balance < required {
            return Err(TradeFailure::InsufficientBalance { balance, required });
        }

        // 3. Payout
        let (resolved_symbol, payout_pct) = self.check_payout(&signal.symbol, min_payout_pct).await?;

        // 4. Duration
        let duration_secs = self.resolve_duration(&signal.duration)?;

        debug!("Gates passed in {:?}", started.elapsed());

        // 5. Submission
        let submit_started = Instant::now();
        let timeout = Duration::from_secs(self.config.submit_timeout_secs);
        let submitted = tokio::time::timeout(
            timeout,
            self.endpoint.open(signal.direction, &resolved_symbol, amount, duration_secs),
        )
        .await;

        let trade_id = match submitted {
            Err(_) => {
                error!("Submission for {} timed out after {}s", resolved_symbol, self.config.submit_timeout_secs);
                return Err(TradeFailure::SubmissionTimeout(self.config.submit_timeout_secs));
            }
            Ok(Err(e)) => return Err(TradeFailure::SubmissionError(e.to_string())),
            Ok(Ok(None)) => return Err(TradeFailure::SubmissionError("no trade id returned".to_string())),
            Ok(Ok(Some(id))) => id,
        };
        info!(
            "Submitted {} {} ${:.2} {}s -> {} ({:?})",
            signal.direction,
            resolved_symbol,
            amount,
            duration_secs,
            trade_id,
            submit_started.elapsed()
        );

        let attempt = TradeAttempt {
            signal: signal.clone(),
            resolved_symbol,
            amount,
            duration_secs,
            direction: signal.direction,
            payout_pct,
            balance_before: balance,
            trade_id: Some(trade_id.clone()),
            submitted_at: Utc::now(),
        };

        // 6. Confirmation
        if !self.confirm(&trade_id, balance).await {
            error!("Trade {} not confirmed", trade_id);
            return Err(TradeFailure::NotConfirmed { trade_id });
        }

        Ok(attempt)
    }

    /// Live when the probe URL (if any) answers 200 and the endpoint reports
    /// a valid balance. Only positive results are cached.
    pub async fn check_connectivity(&self) -> Result<(), TradeFailure> {
        let key = CacheKey::Connectivity;
        if let Some(CacheValue::Connectivity { live: true }) = self.cache.get(&key).await {
            debug!("Connectivity from cache");
            return Ok(());
        }

        let result = self.probe_connectivity().await;
        match &result {
            Ok(()) => self.cache.put(&key, CacheValue::Connectivity { live: true }).await,
            Err(reason) => {
                warn!("Connectivity check failed: {}", reason);
                self.cache.invalidate(&key).await;
            }
        }
        result.map_err(TradeFailure::NoConnectivity)
    }

    async fn probe_connectivity(&self) -> Result<(), String> {
        if let Some(url) = &self.config.connectivity_probe_url {
            let timeout = Duration::from_millis(self.config.probe_timeout_ms);
            let policy = self.retry_policy(self.config.probe_attempts);
            retry(&policy, |_| ErrorClass::Retryable, |_| async move {
                let response = self
                    .http
                    .get(url)
                    .timeout(timeout)
                    .send()
                    .await
                    .map_err(|e| e.to_string())?;
                if response.status().is_success() {
                    Ok(())
                } else {
                    Err(format!("unexpected status {}", response.status()))
                }
            })
            .await
            .map_err(|e| format!("probe {} failed: {}", url, e.last_error().map(String::as_str).unwrap_or("?")))?;
        }

        match self.endpoint.balance().await {
            Ok(b) if b.is_finite() && b >= 0.0 => Ok(()),
            Ok(b) => Err(format!("invalid balance {}", b)),
            Err(e) => Err(format!("endpoint unreachable: {}", e)),
        }
    }

    /// Balance with a small retry budget; negative or non-finite values are errors
    pub async fn fetch_balance(&self) -> Result<f64, EndpointError> {
        let policy = self.retry_policy(self.config.balance_attempts);
        retry(&policy, classify_endpoint_error, |_| async move {
            let b = self.endpoint.balance().await?;
            if b.is_finite() && b >= 0.0 {
                Ok(b)
            } else {
                Err(EndpointError::InvalidResponse(format!("balance {}", b)))
            }
        })
        .await
        .map_err(collapse)
    }

    /// Resolve the endpoint's spelling of `symbol` and its payout. A listed
    /// symbol below the minimum is rejected at once, without retry.
    pub async fn check_payout(&self, symbol: &str, min_payout_pct: f64) -> Result<(String, f64), TradeFailure> {
        let key = CacheKey::Payout(normalize_symbol(symbol));
        if let Some(CacheValue::Payout { symbol: cached, payout }) = self.cache.get(&key).await {
            if payout >= min_payout_pct {
                info!("Using cached payout for {}: {}%", cached, payout);
                return Ok((cached, payout));
            }
        }

        let variants = symbol_variants(symbol);
        let policy = self.retry_policy(self.config.payout_attempts);
        let classify = |miss: &PayoutMiss| match miss {
            PayoutMiss::Below { .. } => ErrorClass::Fatal,
            _ => ErrorClass::Retryable,
        };

        let found = retry(&policy, classify, |attempt| {
            let variants = &variants;
            async move {
                let table = self.endpoint.payout().await.map_err(PayoutMiss::Endpoint)?;
                if table.is_empty() {
                    warn!("Attempt {}: empty payout table", attempt);
                    return Err(PayoutMiss::Empty);
                }
                match match_variant(&table, variants) {
                    Some((name, pct)) if pct >= min_payout_pct => Ok((name, pct)),
                    Some((name, pct)) => Err(PayoutMiss::Below { symbol: name, payout: pct }),
                    None => {
                        warn!("Attempt {}: {} not listed", attempt, symbol);
                        Err(PayoutMiss::Missing)
                    }
                }
            }
        })
        .await;

        match found {
            Ok((name, pct)) => {
                info!("Valid symbol {}: payout {}%", name, pct);
                self.cache.put(&key, CacheValue::Payout { symbol: name.clone(), payout: pct }).await;
                Ok((name, pct))
            }
            Err(RetryError::Fatal(PayoutMiss::Below { symbol, payout })) => {
                warn!("Skipping {}: payout {}% below minimum {}%", symbol, payout, min_payout_pct);
                self.cache.invalidate(&key).await;
                Err(TradeFailure::PayoutBelowThreshold { symbol, payout, minimum: min_payout_pct })
            }
            Err(RetryError::Exhausted { last: Some(PayoutMiss::Endpoint(e)), attempts }) => {
                error!("Payout table unavailable after {} attempts: {}", attempts, e);
                Err(TradeFailure::NoConnectivity(format!("payout unavailable: {}", e)))
            }
            Err(e) => {
                error!("Payout check for {} failed: {}", symbol, e);
                Err(TradeFailure::SymbolInactive(symbol.to_string()))
            }
        }
    }

    pub fn resolve_duration(&self, spec: &DurationSpec) -> Result<u32, TradeFailure> {
        let secs = spec
            .to_seconds()
            .ok_or_else(|| TradeFailure::InvalidDuration(format!("unknown duration {}", spec)))?;
        if secs == 0 || secs > self.config.max_duration_secs {
            return Err(TradeFailure::InvalidDuration(format!(
                "{}s outside 1..={}s",
                secs, self.config.max_duration_secs
            )));
        }
        Ok(secs)
    }

    /// Poll the balance until the account reflects the trade
    async fn confirm(&self, trade_id: &str, balance_before: f64) -> bool {
        let deadline = Instant::now() + Duration::from_millis(self.config.confirm_window_ms);
        let interval = Duration::from_millis(self.config.confirm_interval_ms.max(1));

        loop {
            match self.endpoint.balance().await {
                Ok(b) if b.is_finite() && b >= 0.0 => {
                    if !self.config.require_balance_change || (b - balance_before).abs() > f64::EPSILON {
                        info!("Trade {} confirmed (balance ${:.2})", trade_id, b);
                        return true;
                    }
                }
                Ok(b) => warn!("Confirming {}: invalid balance {}", trade_id, b),
                Err(e) => warn!("Confirming {}: {}", trade_id, e),
            }

            if Instant::now() + interval > deadline {
                return false;
            }
            tokio::time::sleep(interval).await;
        }
    }
}

/// First variant present in the table, matched case-insensitively
fn match_variant(table: &HashMap<String, f64>, variants: &[String]) -> Option<(String, f64)> {
    variants.iter().find_map(|v| {
        table
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(v))
            .map(|(k, p)| (k.clone(), *p))
    })
}

pub(crate) fn classify_endpoint_error(e: &EndpointError) -> ErrorClass {
    match e {
        EndpointError::DurationParse(_) => ErrorClass::Transient,
        EndpointError::Rejected(_) => ErrorClass::Fatal,
        _ => ErrorClass::Retryable,
    }
}

pub(crate) fn collapse(e: RetryError<EndpointError>) -> EndpointError {
    match e {
        RetryError::Fatal(e) => e,
        RetryError::Exhausted { last: Some(e), .. } => e,
        RetryError::Exhausted { attempts, last: None } => {
            EndpointError::Transport(format!("no attempt made ({})", attempts))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::endpoint::PaperEndpoint;
    use crate::models::Direction;
    use chrono::NaiveTime;

    fn signal(symbol: &str, duration: &str) -> Signal {
        Signal {
            symbol: symbol.to_string(),
            duration: DurationSpec::parse(duration),
            target_time: NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
            direction: Direction::Call,
        }
    }

    fn orchestrator(paper: PaperEndpoint) -> TradeOrchestrator {
        TradeOrchestrator::new(
            Arc::new(paper),
            Arc::new(ValidityCache::new(&CacheConfig::default())),
            OrchestratorConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_happy_path() {
        let orch = orchestrator(PaperEndpoint::new(100.0));
        let attempt = orch.submit(&signal("EURUSD-OTC", "M1"), 5.0, 80.0).await.unwrap();

        assert_eq!(attempt.resolved_symbol, "EURUSD_otc");
        assert_eq!(attempt.duration_secs, 60);
        assert_eq!(attempt.payout_pct, 92.0);
        assert!(attempt.trade_id.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_insufficient_balance_includes_reserve() {
        // 8.5 needed for a 7.0 stake
        let orch = orchestrator(PaperEndpoint::new(8.4));
        let err = orch.submit(&signal("EURUSD", "M1"), 7.0, 70.0).await.unwrap_err();
        assert_eq!(err, TradeFailure::InsufficientBalance { balance: 8.4, required: 8.5 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_payout_below_threshold_is_immediate() {
        let payouts = HashMap::from([("EURUSD".to_string(), 65.0)]);
        let orch = orchestrator(PaperEndpoint::new(100.0).with_payouts(payouts));
        let started = Instant::now();

        let err = orch.check_payout("EURUSD", 70.0).await.unwrap_err();
        assert!(matches!(err, TradeFailure::PayoutBelowThreshold { payout, .. } if payout == 65.0));
        assert_eq!(started.elapsed(), Duration::ZERO, "no retry with another threshold");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlisted_symbol_is_inactive() {
        let orch = orchestrator(PaperEndpoint::new(100.0));
        let err = orch.check_payout("XAUUSD", 70.0).await.unwrap_err();
        assert_eq!(err, TradeFailure::SymbolInactive("XAUUSD".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_durations() {
        let orch = orchestrator(PaperEndpoint::new(100.0));
        assert!(orch.resolve_duration(&DurationSpec::parse("M4")).is_err());
        assert!(orch.resolve_duration(&DurationSpec::Seconds(0)).is_err());
        assert!(orch.resolve_duration(&DurationSpec::Seconds(901)).is_err());
        assert_eq!(orch.resolve_duration(&DurationSpec::Seconds(900)), Ok(900));
        assert_eq!(orch.resolve_duration(&DurationSpec::parse("M15")), Ok(900));
    }

    #[tokio::test(start_paused = true)]
    async fn test_payout_cached_after_success() {
        let orch = orchestrator(PaperEndpoint::new(100.0));
        orch.check_payout("gbpjpy", 70.0).await.unwrap();
        let cached = orch.cache.get(&CacheKey::Payout("gbpjpy".into())).await;
        assert_eq!(cached, Some(CacheValue::Payout { symbol: "GBPJPY".into(), payout: 80.0 }));
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(classify_endpoint_error(&EndpointError::DurationParse("x".into())), ErrorClass::Transient);
        assert_eq!(classify_endpoint_error(&EndpointError::Transport("x".into())), ErrorClass::Retryable);
        assert_eq!(classify_endpoint_error(&EndpointError::Rejected("x".into())), ErrorClass::Fatal);
    }
}
