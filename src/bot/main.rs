//! Signal Trading Bot
//!
//! Listens for trade signals (stdin or a WebSocket relay), waits for each
//! signal's target time and trades it with Martingale loss recovery until a
//! profit or loss boundary is reached.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use signal_trader::audit::{AuditSink, CsvAuditSink, TracingAuditSink};
use signal_trader::cache::{RedisTier, ValidityCache};
use signal_trader::config::BotConfig;
use signal_trader::endpoint::{keep_alive, GatewayEndpoint, PaperEndpoint, TradingEndpoint};
use signal_trader::pipeline::{run_session, SessionContext, SessionControls};
use signal_trader::source::{spawn_operator_input, RelaySource, SignalSource, StdinSource};

/// Signal Trading Bot
#[derive(Parser, Debug)]
#[command(name = "signal-bot")]
#[command(about = "Executes binary-option trade signals with Martingale loss recovery")]
struct Args {
    /// Config file (default: $BOT_CONFIG_PATH or config/bot_config.yaml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Trade against a simulated paper account instead of the gateway
    #[arg(long)]
    dry_run: bool,

    /// Starting balance of the paper account
    #[arg(long, default_value = "1000.0")]
    paper_balance: f64,

    /// WebSocket relay delivering signals (overrides session.relay_url / $SIGNAL_RELAY_URL)
    #[arg(long)]
    relay: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

fn init_logging(json: bool) {
    let log_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info,signal_trader=debug,signal_bot=debug".to_string());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&log_filter))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(args: &Args) -> Result<BotConfig> {
    let config_path = args
        .config
        .clone()
        .or_else(|| std::env::var("BOT_CONFIG_PATH").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("config/bot_config.yaml"));

    if config_path.exists() {
        info!("Loading config from: {}", config_path.display());
        BotConfig::load_with_env(&config_path).context("Failed to load configuration")
    } else {
        warn!("Config file not found, using defaults: {}", config_path.display());
        let mut config = BotConfig::default();
        config.apply_env();
        Ok(config)
    }
}

async fn build_cache(config: &BotConfig) -> ValidityCache {
    let cache = ValidityCache::new(&config.cache);
    match &config.cache.redis_url {
        Some(url) => match RedisTier::connect(url, &config.cache.key_prefix).await {
            Ok(tier) => cache.with_shared(Arc::new(tier)),
            Err(e) => {
                warn!("Failed to connect to Redis: {:#}", e);
                warn!("Running with the in-process cache only");
                cache
            }
        },
        None => {
            info!("REDIS_URL not set - in-process cache only");
            cache
        }
    }
}

fn build_endpoint(args: &Args, config: &BotConfig) -> Arc<dyn TradingEndpoint> {
    if args.dry_run {
        warn!("Running in DRY-RUN mode (paper account ${:.2})", args.paper_balance);
        return Arc::new(PaperEndpoint::new(args.paper_balance));
    }

    match GatewayEndpoint::from_config(&config.endpoint) {
        Ok(gateway) => {
            info!("Trading through gateway {}", config.endpoint.url);
            Arc::new(gateway)
        }
        Err(e) => {
            warn!("Failed to initialize gateway: {:#}", e);
            warn!("Running in DRY-RUN mode (no real orders will be placed)");
            Arc::new(PaperEndpoint::new(args.paper_balance))
        }
    }
}

fn build_audit(config: &BotConfig) -> Arc<dyn AuditSink> {
    let dir = PathBuf::from(&config.audit.log_dir);
    match CsvAuditSink::new(&dir) {
        Ok(sink) => {
            info!("Audit logs in {}", dir.display());
            Arc::new(sink)
        }
        Err(e) => {
            warn!("CSV audit disabled: {:#}", e);
            Arc::new(TracingAuditSink)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    eprintln!("[signal-bot] Starting...");

    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_logging(args.json_logs);

    info!("╔══════════════════════════════════════════════════════════════╗");
    info!("║              SIGNAL TRADING BOT (MARTINGALE)                 ║");
    info!("╚══════════════════════════════════════════════════════════════╝");

    let config = load_config(&args)?;
    let staking = config.staking.validate().context("Invalid staking settings")?;
    config.scheduler.timezone().context("Invalid scheduler timezone")?;

    info!("Configuration loaded:");
    info!("  Base stake: ${:.2} x{} (max {} losses)", staking.base_amount, staking.multiplier, staking.max_loss_count);
    info!("  Stop at: +${:.2} / -${:.2}", staking.profit_target, staking.loss_limit);
    info!("  Min payout: {:.0}%", staking.min_payout_pct);
    info!("  Account: {}", config.session.account_type);

    let cache = Arc::new(build_cache(&config).await);
    let endpoint = build_endpoint(&args, &config);
    let audit = build_audit(&config);

    // Ctrl+C stops new signals and skips a pending wait; a trade in flight settles first
    let controls = SessionControls::default();
    {
        let controls = controls.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received, finishing current signal...");
            controls.shutdown.cancel();
            controls.skip.cancel();
        });
    }

    let keep_alive_task = tokio::spawn(keep_alive(
        endpoint.clone(),
        Duration::from_secs(config.session.keep_alive_secs),
        controls.shutdown.clone(),
    ));

    let relay_url = args.relay.clone().or_else(|| config.session.relay_url.clone());
    let mut source: Box<dyn SignalSource> = match relay_url {
        Some(url) => {
            info!("Signals from relay {}", url);
            spawn_operator_input(controls.skip.clone(), None);
            Box::new(RelaySource::connect(&url))
        }
        None => {
            info!("Signals from stdin (channel text or JSON, one per line)");
            Box::new(StdinSource::new(controls.skip.clone()))
        }
    };

    let ctx = SessionContext { config, endpoint, cache, audit };
    let summary = run_session(&ctx, source.as_mut(), controls.clone()).await;

    controls.shutdown.cancel();
    if let Err(e) = keep_alive_task.await {
        error!("Keep-alive task failed: {}", e);
    }

    info!("╔══════════════════════════════════════════════════════════════╗");
    info!("║  FINAL: {:<52} ║", summary.stop_reason.to_string());
    info!("║  Balance ${:<10.2} -> ${:<10.2}  net {:>+10.2}            ║",
        summary.initial_balance, summary.final_balance, summary.net_profit);
    info!("╚══════════════════════════════════════════════════════════════╝");
    println!("👋 Session ended and logged.");

    // stdin reader may still be blocked on a read
    std::process::exit(summary.stop_reason.exit_code());
}
