//! Session driver: signal → scheduler → orchestrator → settlement → staking
//!
//! Signals are handled strictly one at a time. Anything that arrives while a
//! signal (and its loss-recovery sequence) is in flight is discarded.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::audit::{AuditSink, SessionRecord, SignalRecord, TradeRecord};
use crate::cache::ValidityCache;
use crate::cancel::CancelToken;
use crate::config::{BotConfig, StakingConfig};
use crate::endpoint::TradingEndpoint;
use crate::error::{PipelineError, SignalRejection, TradeFailure};
use crate::models::{Outcome, RawSignal, SessionSummary, Signal, StopReason};
use crate::orchestrator::{classify_endpoint_error, collapse, TradeOrchestrator};
use crate::retry::{retry, RetryPolicy};
use crate::scheduler::{SignalScheduler, WaitOutcome};
use crate::settlement::{reconcile, SettlementWaiter};
use crate::source::SignalSource;
use crate::staking::StakingPolicy;

/// Everything a session needs, constructed once by the driver
pub struct SessionContext {
    pub config: BotConfig,
    pub endpoint: Arc<dyn TradingEndpoint>,
    pub cache: Arc<ValidityCache>,
    pub audit: Arc<dyn AuditSink>,
}

/// External controls: `skip` cancels the current scheduler wait, `shutdown`
/// stops the session once the signal in flight is done.
#[derive(Debug, Clone, Default)]
pub struct SessionControls {
    pub skip: CancelToken,
    pub shutdown: CancelToken,
}

/// What became of one signal
#[derive(Debug, Clone, PartialEq)]
pub enum SignalOutcome {
    /// Policy already stopped
    Ignored,
    Rejected(SignalRejection),
    Skipped,
    /// A gate or the submission failed
    Failed(TradeFailure),
    /// Settlement was reached but the sequence could not continue safely
    Abandoned(PipelineError),
    /// The sequence ran to a win, tie, max streak or session stop
    Completed { trades: u32 },
}

pub struct PipelineCoordinator {
    orchestrator: TradeOrchestrator,
    waiter: SettlementWaiter,
    scheduler: SignalScheduler,
    policy: StakingPolicy,
    audit: Arc<dyn AuditSink>,
    skip: CancelToken,
}

impl PipelineCoordinator {
    pub fn new(
        ctx: &SessionContext,
        staking: StakingConfig,
        initial_balance: f64,
        skip: CancelToken,
    ) -> Result<Self, PipelineError> {
        let scheduler = SignalScheduler::new(ctx.config.scheduler.clone())?;
        Ok(Self {
            orchestrator: TradeOrchestrator::new(
                ctx.endpoint.clone(),
                ctx.cache.clone(),
                ctx.config.orchestrator.clone(),
            ),
            waiter: SettlementWaiter::new(ctx.endpoint.clone(), ctx.config.settlement.clone()),
            scheduler,
            policy: StakingPolicy::new(staking, initial_balance),
            audit: ctx.audit.clone(),
            skip,
        })
    }

    pub fn policy(&self) -> &StakingPolicy {
        &self.policy
    }

    pub fn stop(&mut self, reason: StopReason) {
        self.policy.stop(reason);
    }

    fn show_stats(&self) {
        self.audit.display_stats(&self.policy.stats());
        println!("🔥 Waiting for a new signal 🔥");
    }

    fn log_signal(&self, raw: &RawSignal, accepted: bool, note: &str) -> String {
        self.audit.log_signal(&SignalRecord {
            symbol: raw.symbol.clone().unwrap_or_default(),
            trade_time: raw.time.clone().unwrap_or_default(),
            direction: raw.direction.clone().unwrap_or_default(),
            accepted,
            note: note.to_string(),
        })
    }

    fn reject(&self, raw: &RawSignal, rejection: SignalRejection) -> SignalOutcome {
        warn!("Signal rejected ({}): {}", raw.describe(), rejection);
        println!("⚠️ Signal rejected: {}", rejection);
        self.log_signal(raw, false, &rejection.to_string());
        self.show_stats();
        SignalOutcome::Rejected(rejection)
    }

    /// Run one signal to completion
    pub async fn handle_signal(&mut self, raw: &RawSignal) -> SignalOutcome {
        if !self.policy.is_active() {
            info!("⚠️ Policy stopped, ignoring signal {}", raw.describe());
            return SignalOutcome::Ignored;
        }

        let signal = match self.scheduler.validate(raw) {
            Ok(signal) => signal,
            Err(rejection) => return self.reject(raw, rejection),
        };

        println!(
            "💷 {}\n💎 {}\n⌚️ {}\n{}\n💶 Amount: {:.2}\n",
            signal.symbol,
            signal.duration,
            signal.target_time,
            signal.direction,
            self.policy.next_stake()
        );

        match self.scheduler.wait(&signal, &self.skip).await {
            Err(rejection) => return self.reject(raw, rejection),
            Ok(WaitOutcome::Skipped) => {
                println!("\n✅ Trade skipped by user for {}", signal.symbol);
                self.log_signal(raw, false, "skipped by operator");
                self.show_stats();
                return SignalOutcome::Skipped;
            }
            Ok(WaitOutcome::Fired) => {}
        }

        self.run_sequence(raw, &signal).await
    }

    /// Trade the signal, escalating the stake after each loss while the
    /// policy asks for recovery
    async fn run_sequence(&mut self, raw: &RawSignal, signal: &Signal) -> SignalOutcome {
        let min_payout = self.policy.config().min_payout_pct;
        let mut trades = 0u32;

        loop {
            let amount = self.policy.next_stake();
            let level = self.policy.state().loss_streak;
            let signal_id = self.log_signal(raw, true, "");

            if level == 0 {
                println!("Started ...👍🏼");
            } else {
                println!("Started Martingale {} ...👍🏼", level);
            }

            let attempt = match self.orchestrator.submit(signal, amount, min_payout).await {
                Ok(attempt) => attempt,
                Err(failure) => return self.fail_attempt(&signal_id, signal, amount, level, failure),
            };
            let trade_id = match attempt.trade_id.as_deref() {
                Some(id) => id.to_string(),
                None => {
                    let failure = TradeFailure::SubmissionError("no trade id returned".to_string());
                    return self.fail_attempt(&signal_id, signal, amount, level, failure);
                }
            };
            trades += 1;

            let report = self.waiter.await_result(&trade_id, attempt.duration_secs).await;
            if report.outcome == Outcome::Unknown {
                warn!("{}; counting as a loss", PipelineError::SettlementUnknown(trade_id.clone()));
            }

            // Stake decisions need the post-settlement balance
            let balance_after = match self.orchestrator.fetch_balance().await {
                Ok(b) => b,
                Err(e) => {
                    let err = PipelineError::ConnectivityError(format!("balance after {}: {}", trade_id, e));
                    error!("❌ {}", err);
                    let last_known = self.policy.state().current_balance;
                    // No fresh balance: P/L comes from the report alone
                    let settled = reconcile(&report, amount, attempt.balance_before, attempt.balance_before);
                    self.audit.log_trade(&TradeRecord {
                        signal_id,
                        symbol: signal.symbol.clone(),
                        direction: signal.direction.to_string(),
                        amount,
                        result: settled.outcome.to_string(),
                        balance: last_known,
                    });
                    // The wager settled, so it still counts; recovery stops here
                    self.policy
                        .record_result(settled.outcome, amount, settled.profit_or_loss, min_payout);
                    if self.policy.is_active() {
                        self.policy.end_sequence();
                    } else if let Some(reason) = self.policy.stop_reason() {
                        println!("🛑 Bot stopped: {}", reason);
                    }
                    self.show_stats();
                    return SignalOutcome::Abandoned(err);
                }
            };
            self.policy.update_balance(balance_after);

            let settled = reconcile(&report, amount, attempt.balance_before, balance_after);
            self.audit.log_trade(&TradeRecord {
                signal_id,
                symbol: signal.symbol.clone(),
                direction: signal.direction.to_string(),
                amount,
                result: settled.outcome.to_string(),
                balance: balance_after,
            });

            let result_display = match settled.outcome {
                Outcome::Win => "WIN ✅".to_string(),
                Outcome::Tie => "DOJI ⚖".to_string(),
                _ => format!("Martingale {}", level + 1),
            };
            println!("✅ The trade was a {}", result_display);
            info!(
                "Trade {} {} ${:.2}: {} P/L {:+.2}, balance ${:.2}",
                trade_id, attempt.resolved_symbol, amount, settled.outcome, settled.profit_or_loss, balance_after
            );

            let continue_recovery =
                self.policy
                    .record_result(settled.outcome, amount, settled.profit_or_loss, min_payout);

            if continue_recovery && self.policy.is_active() {
                continue;
            }

            if self.policy.is_active() {
                if self.policy.state().loss_streak >= self.policy.config().max_loss_count {
                    println!("✖️ Loss");
                }
                self.policy.end_sequence();
            } else if let Some(reason) = self.policy.stop_reason() {
                println!("🛑 Bot stopped: {}", reason);
            }
            self.show_stats();
            return SignalOutcome::Completed { trades };
        }
    }

    fn fail_attempt(
        &mut self,
        signal_id: &str,
        signal: &Signal,
        amount: f64,
        level: u32,
        failure: TradeFailure,
    ) -> SignalOutcome {
        error!("❌ Trade failed for {}: {}", signal.symbol, failure);
        println!("❌ Trade failed for {}: {}", signal.symbol, failure);

        if let TradeFailure::NotConfirmed { trade_id } = &failure {
            // May be live on the account; never resubmitted
            warn!("Trade {} left unconfirmed; not resubmitting", trade_id);
        }

        self.audit.log_trade(&TradeRecord {
            signal_id: signal_id.to_string(),
            symbol: signal.symbol.clone(),
            direction: signal.direction.to_string(),
            amount,
            result: format!("failed:{}", failure.code()),
            balance: self.policy.state().current_balance,
        });

        if level > 0 {
            self.policy.end_sequence();
        }
        self.show_stats();
        SignalOutcome::Failed(failure)
    }
}

/// Initial balance with the session's retry budget
async fn initial_balance(ctx: &SessionContext) -> Result<f64, PipelineError> {
    let session = &ctx.config.session;
    let policy = RetryPolicy::fixed(session.balance_attempts.max(1), Duration::from_millis(session.balance_retry_ms));
    let endpoint = &ctx.endpoint;

    retry(&policy, classify_endpoint_error, |attempt| async move {
        let balance = endpoint.balance().await?;
        if balance.is_finite() && balance >= 0.0 {
            Ok(balance)
        } else {
            warn!("Attempt {}: invalid balance {}", attempt, balance);
            Err(crate::error::EndpointError::InvalidResponse(format!("balance {}", balance)))
        }
    })
    .await
    .map_err(|e| PipelineError::ConnectivityError(collapse(e).to_string()))
}

/// Run a session until a stop condition, an operator shutdown or the end of
/// the signal source. The session log is written on every exit path.
pub async fn run_session(
    ctx: &SessionContext,
    source: &mut dyn SignalSource,
    controls: SessionControls,
) -> SessionSummary {
    let started = Utc::now();

    let finish = |summary: SessionSummary| {
        ctx.audit.log_session(&SessionRecord {
            start: started,
            end: Utc::now(),
            account_type: ctx.config.session.account_type.clone(),
            summary: summary.clone(),
        });
        summary
    };

    let staking = match ctx.config.staking.validate() {
        Ok(staking) => staking,
        Err(e) => {
            error!("{}", PipelineError::from(e));
            return finish(SessionSummary::empty(StopReason::UnexpectedError));
        }
    };

    let balance = match initial_balance(ctx).await {
        Ok(balance) => balance,
        Err(e) => {
            error!("❌ Could not read initial balance: {}", e);
            return finish(SessionSummary::empty(StopReason::ConnectionFailure));
        }
    };

    let mut coordinator = match PipelineCoordinator::new(ctx, staking, balance, controls.skip.clone()) {
        Ok(c) => c,
        Err(e) => {
            error!("{}", e);
            let mut summary = SessionSummary::empty(StopReason::UnexpectedError);
            summary.initial_balance = balance;
            summary.final_balance = balance;
            return finish(summary);
        }
    };

    info!("╔════════════════════════════════════════════════════════════╗");
    info!("║  SESSION STARTED  balance ${:<12.2} account {:<12} ║", balance, ctx.config.session.account_type);
    info!("╚════════════════════════════════════════════════════════════╝");
    println!("🔥 Waiting for a new signal 🔥");

    loop {
        let raw = tokio::select! {
            biased;
            _ = controls.shutdown.cancelled() => {
                info!("Shutdown requested");
                coordinator.stop(StopReason::ManualExit);
                break;
            }
            raw = source.next_signal() => raw,
        };

        let Some(raw) = raw else {
            info!("Signal source closed");
            coordinator.stop(StopReason::ManualExit);
            break;
        };

        let outcome = coordinator.handle_signal(&raw).await;
        info!("Signal {} -> {:?}", raw.describe(), outcome);

        let dropped = source.discard_pending();
        if dropped > 0 {
            warn!("{} signal(s) arrived while busy and were not accepted", dropped);
        }

        if !coordinator.policy().is_active() {
            break;
        }
        if controls.shutdown.is_cancelled() {
            coordinator.stop(StopReason::ManualExit);
            break;
        }
    }

    let summary = coordinator.policy().summary(StopReason::ManualExit);
    info!("╔════════════════════════════════════════════════════════════╗");
    info!("║  SESSION ENDED: {:<42} ║", summary.stop_reason.to_string());
    info!(
        "║  trades {:<4} W {:<4} L {:<4} T {:<4} net {:>+10.2}          ║",
        summary.total_trades, summary.wins, summary.losses, summary.ties, summary.net_profit
    );
    info!("╚════════════════════════════════════════════════════════════╝");
    finish(summary)
}
