use anyhow::{Context, Result};
use chrono::FixedOffset;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

/// Bot configuration loaded from YAML file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BotConfig {
    #[serde(default)]
    pub staking: StakingSettings,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub settlement: SettlementConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

/// Martingale settings as stored on disk. Validated once into `StakingConfig`.
#[derive(Debug, Clone, Deserialize)]
pub struct StakingSettings {
    /// Base stake
    #[serde(default = "default_amount")]
    pub amount: f64,
    /// Stake multiplier after each loss
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Stop the session once net profit reaches this
    #[serde(default)]
    pub profit: f64,
    /// Stop the session once net loss reaches this
    #[serde(default)]
    pub loss: f64,
    /// Longest loss streak before the stake resets. Read as a float so a
    /// fractional value is reported instead of silently truncated.
    #[serde(default = "default_max_loss_count")]
    pub max_loss_count: f64,
    /// Minimum acceptable payout (%)
    #[serde(default = "default_payout")]
    pub payout: f64,
}

fn default_amount() -> f64 { 1.0 }
fn default_multiplier() -> f64 { 2.0 }
fn default_max_loss_count() -> f64 { 4.0 }
fn default_payout() -> f64 { 70.0 }

impl Default for StakingSettings {
    fn default() -> Self {
        Self {
            amount: default_amount(),
            multiplier: default_multiplier(),
            profit: 0.0,
            loss: 0.0,
            max_loss_count: default_max_loss_count(),
            payout: default_payout(),
        }
    }
}

/// Validated staking configuration, immutable for a session
#[derive(Debug, Clone, PartialEq)]
pub struct StakingConfig {
    pub base_amount: f64,
    pub multiplier: f64,
    pub profit_target: f64,
    pub loss_limit: f64,
    pub max_loss_count: u32,
    pub min_payout_pct: f64,
}

impl StakingSettings {
    pub fn validate(&self) -> Result<StakingConfig, ConfigError> {
        fn non_negative(field: &'static str, value: f64) -> Result<f64, ConfigError> {
            if value.is_finite() && value >= 0.0 {
                Ok(value)
            } else {
                Err(ConfigError::Negative { field, value })
            }
        }

        if !(self.amount.is_finite() && self.amount > 0.0) {
            return Err(ConfigError::NotPositive { field: "amount", value: self.amount });
        }
        if !(self.multiplier.is_finite() && self.multiplier >= 1.0) {
            return Err(ConfigError::Multiplier(self.multiplier));
        }
        let mlc = self.max_loss_count;
        if !mlc.is_finite() || mlc.fract() != 0.0 || mlc < 1.0 || mlc > u32::MAX as f64 {
            return Err(ConfigError::MaxLossCount(mlc));
        }

        Ok(StakingConfig {
            base_amount: self.amount,
            multiplier: self.multiplier,
            profit_target: non_negative("profit", self.profit)?,
            loss_limit: non_negative("loss", self.loss)?,
            max_loss_count: mlc as u32,
            min_payout_pct: non_negative("payout", self.payout)?,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Smallest trade the endpoint accepts; kept in reserve on top of the stake
    pub minimum_trade_amount: f64,
    /// Extra reserve on top of stake + minimum
    pub safety_buffer: f64,
    /// Hard bound on the buy/sell call
    pub submit_timeout_secs: u64,
    /// How long to wait for the account to reflect a submission (ms)
    pub confirm_window_ms: u64,
    pub confirm_interval_ms: u64,
    /// Require the balance to move before a submission counts as confirmed
    pub require_balance_change: bool,
    pub max_duration_secs: u32,
    /// Live payout queries per check
    pub payout_attempts: u32,
    /// Delay between retried network calls (ms)
    pub retry_delay_ms: u64,
    /// Balance reads per gate check
    pub balance_attempts: u32,
    /// Optional HTTP URL that must answer 200 for connectivity to count as live
    pub connectivity_probe_url: Option<String>,
    pub probe_timeout_ms: u64,
    pub probe_attempts: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            minimum_trade_amount: 1.0,
            safety_buffer: 0.5,
            submit_timeout_secs: 60,
            confirm_window_ms: 3000,
            confirm_interval_ms: 500,
            require_balance_change: true,
            max_duration_secs: 900,
            payout_attempts: 3,
            retry_delay_ms: 500,
            balance_attempts: 3,
            connectivity_probe_url: None,
            probe_timeout_ms: 1000,
            probe_attempts: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    /// Start polling this many seconds before expiry
    pub safety_margin_secs: u32,
    pub max_attempts: u32,
    pub poll_interval_ms: u64,
    /// Duration-parse errors polled at the normal interval before backing off
    pub tolerated_duration_errors: u32,
    pub escalated_interval_ms: u64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            safety_margin_secs: 1,
            max_attempts: 20,
            poll_interval_ms: 500,
            tolerated_duration_errors: 5,
            escalated_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Reference timezone of signal times, as minutes east of UTC (-180 = UTC-3)
    pub utc_offset_minutes: i32,
    /// Reject signals further than this in the future
    pub max_ahead_secs: u32,
    /// Reject signals that passed more than this long ago
    pub max_behind_secs: u32,
    /// Fire this many ms before the target
    pub lead_ms: u64,
    /// Wait loop granularity (ms)
    pub tick_ms: u64,
    pub show_countdown: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: -180,
            max_ahead_secs: 600,
            max_behind_secs: 30,
            lead_ms: 500,
            tick_ms: 1,
            show_countdown: true,
        }
    }
}

impl SchedulerConfig {
    pub fn timezone(&self) -> Result<FixedOffset, ConfigError> {
        FixedOffset::east_opt(self.utc_offset_minutes * 60)
            .ok_or(ConfigError::UtcOffset(self.utc_offset_minutes))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub connectivity_ttl_secs: u64,
    pub payout_ttl_secs: u64,
    /// Shared tier; the cache runs in-process only when unset
    pub redis_url: Option<String>,
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            connectivity_ttl_secs: 30,
            payout_ttl_secs: 180,
            redis_url: None,
            key_prefix: "signal_bot:validity:".to_string(),
        }
    }
}

impl CacheConfig {
    pub fn connectivity_ttl(&self) -> Duration {
        Duration::from_secs(self.connectivity_ttl_secs)
    }

    pub fn payout_ttl(&self) -> Duration {
        Duration::from_secs(self.payout_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub keep_alive_secs: u64,
    /// Balance reads at session start
    pub balance_attempts: u32,
    pub balance_retry_ms: u64,
    /// "Demo" or "Real", recorded in the session log
    pub account_type: String,
    /// WebSocket relay delivering signals; stdin when unset
    pub relay_url: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keep_alive_secs: 15,
            balance_attempts: 3,
            balance_retry_ms: 1500,
            account_type: "Demo".to_string(),
            relay_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Broker gateway base URL
    pub url: String,
    pub request_timeout_ms: u64,
    /// Path of the file holding the opaque session token
    pub session_token_path: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8080".to_string(),
            request_timeout_ms: 10_000,
            session_token_path: "session_token.txt".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub log_dir: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { log_dir: "logs".to_string() }
    }
}

impl BotConfig {
    /// Load configuration from YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: BotConfig = serde_yaml::from_str(contents)
            .with_context(|| "Failed to parse YAML configuration")?;
        Ok(config)
    }

    /// Load with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env();
        Ok(config)
    }

    /// Override fields from environment variables. Unparseable values keep
    /// the file value.
    pub fn apply_env(&mut self) {
        fn parse_into(var: &str, target: &mut f64) {
            if let Ok(val) = std::env::var(var) {
                *target = val.parse().unwrap_or(*target);
            }
        }

        parse_into("BOT_AMOUNT", &mut self.staking.amount);
        parse_into("BOT_MULTIPLIER", &mut self.staking.multiplier);
        parse_into("BOT_PROFIT_TARGET", &mut self.staking.profit);
        parse_into("BOT_LOSS_LIMIT", &mut self.staking.loss);
        parse_into("BOT_MAX_LOSS_COUNT", &mut self.staking.max_loss_count);
        parse_into("BOT_MIN_PAYOUT", &mut self.staking.payout);

        if let Ok(val) = std::env::var("REDIS_URL") {
            self.cache.redis_url = Some(val);
        }
        if let Ok(val) = std::env::var("ENDPOINT_URL") {
            self.endpoint.url = val;
        }
        if let Ok(val) = std::env::var("SIGNAL_RELAY_URL") {
            self.session.relay_url = Some(val);
        }
        if let Ok(val) = std::env::var("BOT_ACCOUNT_TYPE") {
            self.session.account_type = val;
        }
    }
}
