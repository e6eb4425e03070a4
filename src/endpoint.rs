//! Trading endpoint: the remote broker as seen by the pipeline
//!
//! Any call may fail, hang or return stale data. Callers bound every call
//! with a timeout or a retry budget.

use anyhow::Context;
use async_trait::async_trait;
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::cancel::CancelToken;
use crate::config::EndpointConfig;
use crate::error::EndpointError;
use crate::models::{Direction, Outcome, SettlementReport};

#[async_trait]
pub trait TradingEndpoint: Send + Sync {
    async fn balance(&self) -> Result<f64, EndpointError>;

    /// Current payout percentage per symbol
    async fn payout(&self) -> Result<HashMap<String, f64>, EndpointError>;

    /// Open a call option. Returns the trade id, or None if the broker
    /// accepted the request without issuing one.
    async fn buy(&self, symbol: &str, amount: f64, duration_secs: u32) -> Result<Option<String>, EndpointError>;

    /// Open a put option
    async fn sell(&self, symbol: &str, amount: f64, duration_secs: u32) -> Result<Option<String>, EndpointError>;

    /// None while the trade is still open
    async fn check_result(&self, trade_id: &str) -> Result<Option<SettlementReport>, EndpointError>;

    async fn open(
        &self,
        direction: Direction,
        symbol: &str,
        amount: f64,
        duration_secs: u32,
    ) -> Result<Option<String>, EndpointError> {
        match direction {
            Direction::Call => self.buy(symbol, amount, duration_secs).await,
            Direction::Put => self.sell(symbol, amount, duration_secs).await,
        }
    }
}

// ============================================================================
// HTTP gateway
// ============================================================================

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    balance: f64,
}

#[derive(Debug, Deserialize)]
struct PayoutResponse {
    payouts: HashMap<String, f64>,
}

#[derive(Debug, Serialize)]
struct TradeRequest<'a> {
    symbol: &'a str,
    amount: f64,
    duration: u32,
    direction: Direction,
}

#[derive(Debug, Deserialize)]
struct TradeResponse {
    trade_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TradeStatusResponse {
    status: String,
    outcome: Option<String>,
    profit: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct GatewayErrorBody {
    error: String,
}

/// JSON client for the broker gateway. The session token is passed as an
/// opaque bearer credential.
pub struct GatewayEndpoint {
    client: Client,
    base_url: String,
    token: String,
}

impl GatewayEndpoint {
    pub fn new(base_url: &str, token: &str, timeout_ms: u64) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    /// Build from config. `SESSION_TOKEN` overrides the token file.
    pub fn from_config(config: &EndpointConfig) -> anyhow::Result<Self> {
        let token = match std::env::var("SESSION_TOKEN") {
            Ok(token) => token,
            Err(_) => std::fs::read_to_string(&config.session_token_path)
                .with_context(|| format!("Failed to read session token: {}", config.session_token_path))?,
        };
        Self::new(&config.url, token.trim(), config.request_timeout_ms)
    }

    async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T, EndpointError> {
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<GatewayErrorBody>(&text)
                .map(|b| b.error)
                .unwrap_or_else(|_| format!("{} - {}", status, text));
            return Err(EndpointError::from_message(&message));
        }

        response
            .json()
            .await
            .map_err(|e| EndpointError::InvalidResponse(e.to_string()))
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, EndpointError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| EndpointError::Transport(e.to_string()))?;
        Self::decode(response).await
    }

    async fn place(
        &self,
        direction: Direction,
        symbol: &str,
        amount: f64,
        duration_secs: u32,
    ) -> Result<Option<String>, EndpointError> {
        let url = format!("{}/trades", self.base_url);
        let body = TradeRequest { symbol, amount, duration: duration_secs, direction };
        debug!("POST {} {:?}", url, body);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| EndpointError::Transport(e.to_string()))?;

        let trade: TradeResponse = Self::decode(response).await?;
        Ok(trade.trade_id)
    }
}

#[async_trait]
impl TradingEndpoint for GatewayEndpoint {
    async fn balance(&self) -> Result<f64, EndpointError> {
        let body: BalanceResponse = self.get("/balance").await?;
        Ok(body.balance)
    }

    async fn payout(&self) -> Result<HashMap<String, f64>, EndpointError> {
        let body: PayoutResponse = self.get("/payout").await?;
        Ok(body.payouts)
    }

    async fn buy(&self, symbol: &str, amount: f64, duration_secs: u32) -> Result<Option<String>, EndpointError> {
        self.place(Direction::Call, symbol, amount, duration_secs).await
    }

    async fn sell(&self, symbol: &str, amount: f64, duration_secs: u32) -> Result<Option<String>, EndpointError> {
        self.place(Direction::Put, symbol, amount, duration_secs).await
    }

    async fn check_result(&self, trade_id: &str) -> Result<Option<SettlementReport>, EndpointError> {
        let body: TradeStatusResponse = self.get(&format!("/trades/{}", trade_id)).await?;
        if body.status != "closed" {
            return Ok(None);
        }
        let outcome = body.outcome.as_deref().map(Outcome::parse).unwrap_or(Outcome::Unknown);
        Ok(Some(SettlementReport { trade_id: trade_id.to_string(), outcome, profit: body.profit }))
    }
}

// ============================================================================
// Paper account (dry run)
// ============================================================================

#[derive(Debug, Clone)]
struct PaperTrade {
    amount: f64,
    payout_pct: f64,
    expires: Instant,
}

#[derive(Debug)]
struct PaperState {
    balance: f64,
    open: HashMap<String, PaperTrade>,
    settled: HashMap<String, SettlementReport>,
    scripted: VecDeque<Outcome>,
    next_id: u64,
}

/// Simulated account. Stakes are debited on open; a win credits
/// stake × (1 + payout), a tie returns the stake.
pub struct PaperEndpoint {
    state: Mutex<PaperState>,
    payouts: HashMap<String, f64>,
    win_probability: f64,
}

impl PaperEndpoint {
    pub fn new(balance: f64) -> Self {
        let payouts = [
            ("EURUSD_otc", 92.0),
            ("GBPUSD_otc", 90.0),
            ("USDJPY_otc", 88.0),
            ("AUDCAD_otc", 85.0),
            ("EURUSD", 82.0),
            ("GBPJPY", 80.0),
        ]
        .into_iter()
        .map(|(s, p)| (s.to_string(), p))
        .collect();

        Self {
            state: Mutex::new(PaperState {
                balance,
                open: HashMap::new(),
                settled: HashMap::new(),
                scripted: VecDeque::new(),
                next_id: 1,
            }),
            payouts,
            win_probability: 0.5,
        }
    }

    pub fn with_payouts(mut self, payouts: HashMap<String, f64>) -> Self {
        self.payouts = payouts;
        self
    }

    pub fn with_win_probability(mut self, p: f64) -> Self {
        self.win_probability = p.clamp(0.0, 1.0);
        self
    }

    /// Settle the next trades with these outcomes instead of at random
    pub fn with_outcomes(mut self, outcomes: impl IntoIterator<Item = Outcome>) -> Self {
        self.state.get_mut().scripted.extend(outcomes);
        self
    }

    async fn open_trade(&self, symbol: &str, amount: f64, duration_secs: u32) -> Result<Option<String>, EndpointError> {
        let payout_pct = self
            .payouts
            .iter()
            .find(|(s, _)| s.eq_ignore_ascii_case(symbol))
            .map(|(_, p)| *p)
            .ok_or_else(|| EndpointError::Rejected(format!("unknown symbol {}", symbol)))?;

        let mut state = self.state.lock().await;
        if amount > state.balance {
            return Err(EndpointError::Rejected("insufficient funds".to_string()));
        }
        state.balance -= amount;

        let id = format!("paper-{}", state.next_id);
        state.next_id += 1;
        state.open.insert(
            id.clone(),
            PaperTrade {
                amount,
                payout_pct,
                expires: Instant::now() + Duration::from_secs(duration_secs as u64),
            },
        );
        info!("[PAPER] Opened {} {} ${:.2} for {}s", id, symbol, amount, duration_secs);
        Ok(Some(id))
    }

    fn draw_outcome(&self, state: &mut PaperState) -> Outcome {
        if let Some(outcome) = state.scripted.pop_front() {
            return outcome;
        }
        if rand::thread_rng().gen_bool(self.win_probability) {
            Outcome::Win
        } else {
            Outcome::Loss
        }
    }
}

#[async_trait]
impl TradingEndpoint for PaperEndpoint {
    async fn balance(&self) -> Result<f64, EndpointError> {
        Ok(self.state.lock().await.balance)
    }

    async fn payout(&self) -> Result<HashMap<String, f64>, EndpointError> {
        Ok(self.payouts.clone())
    }

    async fn buy(&self, symbol: &str, amount: f64, duration_secs: u32) -> Result<Option<String>, EndpointError> {
        self.open_trade(symbol, amount, duration_secs).await
    }

    async fn sell(&self, symbol: &str, amount: f64, duration_secs: u32) -> Result<Option<String>, EndpointError> {
        self.open_trade(symbol, amount, duration_secs).await
    }

    async fn check_result(&self, trade_id: &str) -> Result<Option<SettlementReport>, EndpointError> {
        let mut state = self.state.lock().await;

        if let Some(report) = state.settled.get(trade_id) {
            return Ok(Some(report.clone()));
        }

        let trade = match state.open.get(trade_id) {
            Some(trade) if trade.expires <= Instant::now() => trade.clone(),
            Some(_) => return Ok(None),
            None => return Err(EndpointError::Rejected(format!("unknown trade {}", trade_id))),
        };
        state.open.remove(trade_id);

        let outcome = self.draw_outcome(&mut state);
        let profit = match outcome {
            Outcome::Win => {
                let profit = trade.amount * trade.payout_pct / 100.0;
                state.balance += trade.amount + profit;
                profit
            }
            Outcome::Tie => {
                state.balance += trade.amount;
                0.0
            }
            _ => -trade.amount,
        };

        let report = SettlementReport { trade_id: trade_id.to_string(), outcome, profit: Some(profit) };
        state.settled.insert(trade_id.to_string(), report.clone());
        info!("[PAPER] Settled {} {} {:+.2}", trade_id, outcome, profit);
        Ok(Some(report))
    }
}

/// Periodic payout query keeping an idle session from being dropped.
/// Failures are logged, never propagated.
pub async fn keep_alive(endpoint: Arc<dyn TradingEndpoint>, interval: Duration, shutdown: CancelToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        match endpoint.payout().await {
            Ok(payouts) => debug!("Keep-alive ok ({} symbols)", payouts.len()),
            Err(e) => error!("Keep-alive failed: {}", e),
        }
    }
    debug!("Keep-alive stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_paper_win_credits_payout() {
        let paper = PaperEndpoint::new(100.0).with_outcomes([Outcome::Win]);
        let id = paper.buy("EURUSD_otc", 10.0, 60).await.unwrap().unwrap();
        assert_eq!(paper.balance().await.unwrap(), 90.0);

        assert_eq!(paper.check_result(&id).await.unwrap(), None, "still open");

        tokio::time::advance(Duration::from_secs(60)).await;
        let report = paper.check_result(&id).await.unwrap().unwrap();
        assert_eq!(report.outcome, Outcome::Win);
        assert!((report.profit.unwrap() - 9.2).abs() < 1e-9);
        assert!((paper.balance().await.unwrap() - 109.2).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paper_tie_returns_stake() {
        let paper = PaperEndpoint::new(50.0).with_outcomes([Outcome::Tie]);
        let id = paper.sell("gbpjpy", 5.0, 60).await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;

        let report = paper.check_result(&id).await.unwrap().unwrap();
        assert_eq!(report.profit, Some(0.0));
        assert_eq!(paper.balance().await.unwrap(), 50.0);
    }

    #[tokio::test]
    async fn test_paper_rejects_overdraft_and_unknown_symbol() {
        let paper = PaperEndpoint::new(5.0);
        assert!(matches!(paper.buy("EURUSD", 10.0, 60).await, Err(EndpointError::Rejected(_))));
        assert!(matches!(paper.buy("XAUUSD", 1.0, 60).await, Err(EndpointError::Rejected(_))));
    }

    #[test]
    fn test_duration_parse_message_mapping() {
        assert!(matches!(
            EndpointError::from_message("Failed to parse duration: expected int"),
            EndpointError::DurationParse(_)
        ));
        assert!(matches!(EndpointError::from_message("market closed"), EndpointError::Rejected(_)));
    }

    struct CountingEndpoint {
        payout_calls: AtomicU32,
    }

    #[async_trait]
    impl TradingEndpoint for CountingEndpoint {
        async fn balance(&self) -> Result<f64, EndpointError> {
            Ok(0.0)
        }
        async fn payout(&self) -> Result<HashMap<String, f64>, EndpointError> {
            self.payout_calls.fetch_add(1, Ordering::SeqCst);
            Err(EndpointError::Transport("socket closed".into()))
        }
        async fn buy(&self, _: &str, _: f64, _: u32) -> Result<Option<String>, EndpointError> {
            Ok(None)
        }
        async fn sell(&self, _: &str, _: f64, _: u32) -> Result<Option<String>, EndpointError> {
            Ok(None)
        }
        async fn check_result(&self, _: &str) -> Result<Option<SettlementReport>, EndpointError> {
            Ok(None)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_survives_failures() {
        let endpoint = Arc::new(CountingEndpoint { payout_calls: AtomicU32::new(0) });
        let shutdown = CancelToken::new();
        let handle = tokio::spawn(keep_alive(endpoint.clone(), Duration::from_secs(15), shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(46)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(endpoint.payout_calls.load(Ordering::SeqCst), 3);
    }
}
