//! Martingale staking policy
//!
//! Single owner of the stake, the loss streak, the running P/L and the
//! active flag. `record_result` is the only mutation that moves the stake
//! after a trade, and must run after the balance has been refreshed.

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::StakingConfig;
use crate::error::PipelineError;
use crate::models::{Outcome, SessionSummary, StatsSnapshot, StopReason};

/// Allowed gap between reported and expected win profit
const PROFIT_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StakingState {
    pub initial_balance: f64,
    pub current_balance: f64,
    pub current_stake: f64,
    pub loss_streak: u32,
    pub wins: u32,
    pub losses: u32,
    pub ties: u32,
    pub total_trades: u32,
    /// Once false, stays false for the session
    pub active: bool,
    #[serde(default)]
    pub stop_reason: Option<StopReason>,
}

#[derive(Debug, Clone)]
pub struct StakingPolicy {
    config: StakingConfig,
    state: StakingState,
}

impl StakingPolicy {
    pub fn new(config: StakingConfig, initial_balance: f64) -> Self {
        let state = StakingState {
            initial_balance,
            current_balance: initial_balance,
            current_stake: config.base_amount,
            loss_streak: 0,
            wins: 0,
            losses: 0,
            ties: 0,
            total_trades: 0,
            active: true,
            stop_reason: None,
        };
        info!(
            "Staking policy ready: base ${:.2} x{} (max {} losses), stop at +${:.2} / -${:.2}",
            config.base_amount, config.multiplier, config.max_loss_count, config.profit_target, config.loss_limit
        );
        Self { config, state }
    }

    /// Resume from a saved state
    pub fn restore(config: StakingConfig, state: StakingState) -> Self {
        Self { config, state }
    }

    pub fn config(&self) -> &StakingConfig {
        &self.config
    }

    pub fn state(&self) -> &StakingState {
        &self.state
    }

    pub fn next_stake(&self) -> f64 {
        self.state.current_stake
    }

    pub fn is_active(&self) -> bool {
        self.state.active
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.state.stop_reason
    }

    pub fn update_balance(&mut self, balance: f64) {
        self.state.current_balance = balance;
    }

    pub fn net_profit(&self) -> f64 {
        self.state.current_balance - self.state.initial_balance
    }

    pub fn net_loss(&self) -> f64 {
        (self.state.initial_balance - self.state.current_balance).max(0.0)
    }

    /// Record a settled trade. Returns true when the loss-recovery sequence
    /// should continue with the (already multiplied) next stake.
    pub fn record_result(&mut self, outcome: Outcome, staked: f64, reported_pnl: f64, payout_pct: f64) -> bool {
        if !self.state.active {
            warn!("Result {} ignored: staking policy is stopped", outcome);
            return false;
        }

        let result = self.apply(outcome.for_staking(), staked, reported_pnl, payout_pct);
        info!(
            "Policy state: active={}, loss_streak={}, stake=${:.2}",
            self.state.active, self.state.loss_streak, self.state.current_stake
        );

        match result {
            Ok(continue_recovery) => continue_recovery,
            Err(e) => {
                error!("Error while updating stake: {}", e);
                self.stop(StopReason::UnexpectedError);
                false
            }
        }
    }

    fn apply(&mut self, outcome: Outcome, staked: f64, reported_pnl: f64, payout_pct: f64) -> Result<bool, PipelineError> {
        if !self.state.current_balance.is_finite() {
            return Err(PipelineError::Policy(format!("balance is {}", self.state.current_balance)));
        }
        if !staked.is_finite() || !reported_pnl.is_finite() {
            return Err(PipelineError::Policy(format!("non-finite trade values: stake {} pnl {}", staked, reported_pnl)));
        }

        self.state.total_trades += 1;

        let net_profit = self.net_profit();
        let net_loss = self.net_loss();
        if net_profit >= self.config.profit_target {
            info!("🟢 Target profit reached: {:.2} >= {:.2}", net_profit, self.config.profit_target);
            self.stop(StopReason::ProfitTarget);
            return Ok(false);
        }
        if net_loss >= self.config.loss_limit {
            info!("🔴 Loss limit reached: {:.2} >= {:.2}", net_loss, self.config.loss_limit);
            self.stop(StopReason::LossLimit);
            return Ok(false);
        }

        match outcome {
            Outcome::Win => {
                self.state.wins += 1;
                self.reset_stake();
                let expected = staked * payout_pct / 100.0;
                if (reported_pnl - expected).abs() > PROFIT_TOLERANCE {
                    warn!("Reported profit {:.2} does not match expected {:.2}", reported_pnl, expected);
                }
                info!("Win: stake reset to ${:.2}, profit {:.2}", self.state.current_stake, reported_pnl);
                Ok(false)
            }
            Outcome::Loss | Outcome::Unknown => {
                self.state.losses += 1;
                self.state.loss_streak += 1;
                if self.state.loss_streak < self.config.max_loss_count {
                    let next = self.state.current_stake * self.config.multiplier;
                    if !next.is_finite() {
                        return Err(PipelineError::Policy(format!("stake overflow: {}", next)));
                    }
                    self.state.current_stake = next;
                    info!("Loss {}: stake raised to ${:.2}", self.state.loss_streak, next);
                    Ok(true)
                } else {
                    self.state.current_stake = self.config.base_amount;
                    info!(
                        "Max loss streak ({}) reached, stake back to ${:.2}",
                        self.config.max_loss_count, self.state.current_stake
                    );
                    Ok(false)
                }
            }
            Outcome::Tie => {
                self.state.ties += 1;
                self.reset_stake();
                info!("Tie: stake reset to ${:.2}", self.state.current_stake);
                Ok(false)
            }
        }
    }

    fn reset_stake(&mut self) {
        self.state.current_stake = self.config.base_amount;
        self.state.loss_streak = 0;
    }

    /// Close the current loss-recovery sequence: after the max streak has
    /// been reported, or when a sequence is abandoned mid-way.
    pub fn end_sequence(&mut self) {
        self.reset_stake();
    }

    /// Stop the session. The first reason recorded wins.
    pub fn stop(&mut self, reason: StopReason) {
        self.state.active = false;
        if self.state.stop_reason.is_none() {
            self.state.stop_reason = Some(reason);
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            wins: self.state.wins,
            losses: self.state.losses,
            ties: self.state.ties,
            total_trades: self.state.total_trades,
            net_profit: self.net_profit(),
            current_balance: self.state.current_balance,
        }
    }

    /// `fallback` is used when the policy never stopped on its own
    pub fn summary(&self, fallback: StopReason) -> SessionSummary {
        SessionSummary {
            initial_balance: self.state.initial_balance,
            net_profit: self.net_profit(),
            net_loss: self.net_loss(),
            final_balance: self.state.current_balance,
            total_trades: self.state.total_trades,
            wins: self.state.wins,
            losses: self.state.losses,
            ties: self.state.ties,
            stop_reason: self.state.stop_reason.unwrap_or(fallback),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_loss_count: u32) -> StakingConfig {
        StakingConfig {
            base_amount: 1.0,
            multiplier: 2.0,
            profit_target: 1000.0,
            loss_limit: 1000.0,
            max_loss_count,
            min_payout_pct: 80.0,
        }
    }

    /// Feed a loss and move the balance by the stake, like a real session
    fn lose(policy: &mut StakingPolicy) -> bool {
        let stake = policy.next_stake();
        let balance = policy.state().current_balance - stake;
        policy.update_balance(balance);
        policy.record_result(Outcome::Loss, stake, -stake, 80.0)
    }

    #[test]
    fn test_martingale_escalation_and_reset() {
        let mut policy = StakingPolicy::new(config(3), 10_000.0);

        assert_eq!(policy.next_stake(), 1.0);
        assert!(lose(&mut policy));
        assert_eq!(policy.next_stake(), 2.0);
        assert!(lose(&mut policy));
        assert_eq!(policy.next_stake(), 4.0);

        // Third loss hits max_loss_count
        assert!(!lose(&mut policy));
        assert_eq!(policy.next_stake(), 1.0);
        assert_eq!(policy.state().loss_streak, 3, "left for the caller to reset");

        policy.end_sequence();
        assert_eq!(policy.state().loss_streak, 0);
        assert!(policy.is_active());
    }

    #[test]
    fn test_stake_grows_by_multiplier_below_max() {
        let mut policy = StakingPolicy::new(config(10), 100_000.0);
        let mut prev = policy.next_stake();
        for _ in 0..9 {
            assert!(lose(&mut policy));
            assert_eq!(policy.next_stake(), prev * 2.0);
            prev = policy.next_stake();
        }
    }

    #[test]
    fn test_win_and_tie_reset_streak() {
        for outcome in [Outcome::Win, Outcome::Tie] {
            let mut policy = StakingPolicy::new(config(5), 10_000.0);
            lose(&mut policy);
            lose(&mut policy);
            assert_eq!(policy.state().loss_streak, 2);

            let stake = policy.next_stake();
            assert!(!policy.record_result(outcome, stake, stake * 0.8, 80.0));
            assert_eq!(policy.state().loss_streak, 0);
            assert_eq!(policy.next_stake(), 1.0);
        }
    }

    #[test]
    fn test_unknown_counts_as_loss() {
        let mut policy = StakingPolicy::new(config(3), 10_000.0);
        assert!(policy.record_result(Outcome::Unknown, 1.0, -1.0, 80.0));
        assert_eq!(policy.state().losses, 1);
        assert_eq!(policy.next_stake(), 2.0);
    }

    #[test]
    fn test_profit_target_stops_on_crossing_trade() {
        let mut cfg = config(4);
        cfg.profit_target = 1.5;
        let mut policy = StakingPolicy::new(cfg, 100.0);

        policy.update_balance(100.8);
        assert!(!policy.record_result(Outcome::Win, 1.0, 0.8, 80.0));
        assert!(policy.is_active());

        policy.update_balance(101.6);
        assert!(!policy.record_result(Outcome::Win, 1.0, 0.8, 80.0));
        assert!(!policy.is_active(), "stops on the trade that crosses the target");
        assert_eq!(policy.stop_reason(), Some(StopReason::ProfitTarget));
    }

    #[test]
    fn test_loss_limit_overrides_recovery() {
        let mut cfg = config(4);
        cfg.loss_limit = 3.0;
        let mut policy = StakingPolicy::new(cfg, 100.0);

        assert!(lose(&mut policy)); // -1
        assert!(!lose(&mut policy), "-3 reaches the limit even though streak < max");
        assert!(!policy.is_active());
        assert_eq!(policy.stop_reason(), Some(StopReason::LossLimit));
    }

    #[test]
    fn test_stopped_is_terminal() {
        let mut cfg = config(4);
        cfg.loss_limit = 1.0;
        let mut policy = StakingPolicy::new(cfg, 100.0);
        lose(&mut policy);
        assert!(!policy.is_active());

        // Balance recovers; the policy stays stopped
        policy.update_balance(200.0);
        for outcome in [Outcome::Win, Outcome::Loss, Outcome::Tie] {
            assert!(!policy.record_result(outcome, 1.0, 0.8, 80.0));
            assert!(!policy.is_active());
        }
        assert_eq!(policy.stop_reason(), Some(StopReason::LossLimit));
    }

    #[test]
    fn test_fault_fails_closed() {
        let mut policy = StakingPolicy::new(config(4), 100.0);
        policy.update_balance(f64::NAN);
        assert!(!policy.record_result(Outcome::Loss, 1.0, -1.0, 80.0));
        assert!(!policy.is_active());
        assert_eq!(policy.stop_reason(), Some(StopReason::UnexpectedError));
    }

    #[test]
    fn test_zero_profit_target_stops_immediately() {
        let mut cfg = config(4);
        cfg.profit_target = 0.0;
        let mut policy = StakingPolicy::new(cfg, 100.0);
        assert!(!policy.record_result(Outcome::Loss, 1.0, -1.0, 80.0));
        assert!(!policy.is_active());
    }

    #[test]
    fn test_state_round_trip_reproduces_policy() {
        let mut policy = StakingPolicy::new(config(4), 1_000.0);
        lose(&mut policy);
        lose(&mut policy);

        let json = serde_json::to_string(policy.state()).unwrap();
        let restored_state: StakingState = serde_json::from_str(&json).unwrap();
        let mut restored = StakingPolicy::restore(config(4), restored_state);

        assert_eq!(restored.next_stake(), policy.next_stake());
        assert_eq!(restored.state().loss_streak, policy.state().loss_streak);
        assert_eq!(restored.is_active(), policy.is_active());

        // And the two evolve identically
        assert_eq!(lose(&mut restored), lose(&mut policy));
        assert_eq!(restored.state(), policy.state());
    }

    #[test]
    fn test_summary_uses_fallback_reason() {
        let policy = StakingPolicy::new(config(4), 50.0);
        assert_eq!(policy.summary(StopReason::ManualExit).stop_reason, StopReason::ManualExit);
    }
}
