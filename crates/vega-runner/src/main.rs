//! # vega-runner
//!
//! Main entry point of the vega market-data and order runtime.
//!
//! Loads a JSON configuration file, opens one brokerage session and one
//! streaming connector per configured account, starts the runtime and keeps
//! it running until Ctrl+C.
//!
//! # Usage
//!
//! ```bash
//! vega-runner config.json --log-level info --json-logs
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use vega_core::bus::{BroadcastBus, MessageBus};
use vega_core::config::{AppConfig, BusConfig};
use vega_core::ports::{InstrumentRegistry, LogReporter};
use vega_core::udp::UdpBus;
use vega_md::pipeline::greeks::BlackScholes;
use vega_md::registry::StaticInstrumentRegistry;
use vega_md::ws_ticker::{WsTickerConfig, WsTickerConnector};
use vega_runner::{AccountWiring, Runtime, RuntimeDeps};
use vega_td::rest::RestSession;

/// Streaming market data and order execution runtime.
#[derive(Parser)]
#[command(name = "vega-runner", about = "Streaming market data and order execution runtime")]
struct Cli {
    /// Configuration file path (JSON).
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error). Overrides the config.
    #[arg(short, long)]
    log_level: Option<String>,

    /// Optional log directory for file output. Overrides the config.
    #[arg(long)]
    log_dir: Option<String>,

    /// Emit JSON lines on the console.
    #[arg(long)]
    json_logs: bool,
}

/// Time background tasks get to finish after Ctrl+C.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration (logging settings live in it)
    let config = vega_core::config::load_config(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    // 2. Initialize logging
    let level = cli
        .log_level
        .clone()
        .or_else(|| config.engine.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    let log_dir = cli.log_dir.clone().or_else(|| config.engine.log_path.clone());
    let json = cli.json_logs || config.engine.json_logs.unwrap_or(false);
    let _log_guard = vega_core::logging::init_logging(
        &level,
        log_dir.as_deref(),
        config.engine.module_name(),
        json,
    );

    info!("vega-runner starting, config={}, log_level={level}", cli.config.display());

    // 3. Validate before touching the network
    config.validate()?;
    info!("config loaded: {} account(s)", config.accounts.len());

    // 4. Collaborators and per-account wiring
    let deps = build_deps(&config).await?;
    let runtime = Arc::new(Runtime::new(&config, deps)?);

    // 5. Start
    runtime.start().await?;
    info!("runtime started, press Ctrl+C to stop");

    // 6. Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    runtime.shutdown(SHUTDOWN_GRACE).await;
    let state = runtime.runtime_state().await;
    match serde_json::to_string(&state.pipeline) {
        Ok(stats) => info!("final pipeline stats: {stats}"),
        Err(e) => error!("could not encode final stats: {e}"),
    }
    info!("goodbye");
    Ok(())
}

async fn build_deps(config: &AppConfig) -> Result<RuntimeDeps> {
    let registry: Arc<dyn InstrumentRegistry> = match &config.instruments_path {
        Some(path) => Arc::new(StaticInstrumentRegistry::load(path)?),
        None => {
            warn!("no instruments_path configured, every tick will be rejected as unknown");
            Arc::new(StaticInstrumentRegistry::default())
        }
    };

    let bus: Arc<dyn MessageBus> = match &config.bus {
        BusConfig::Udp { addr } => {
            info!("publishing to udp://{addr}");
            Arc::new(UdpBus::connect(*addr).await?)
        }
        BusConfig::Broadcast { capacity } => {
            info!("publishing to in-process broadcast (capacity {capacity})");
            Arc::new(BroadcastBus::new(*capacity))
        }
    };

    let mut accounts = Vec::with_capacity(config.accounts.len());
    for acc in &config.accounts {
        let session = RestSession::connect(acc, &config.broker)
            .await
            .with_context(|| format!("session for account {}", acc.account_id))?;
        let connector = WsTickerConnector::new(WsTickerConfig {
            ws_url: config.broker.ws_url.clone(),
            api_key: session.api_key().to_string(),
            access_token: session.access_token().to_string(),
            ping_interval: Some(Duration::from_millis(config.broker.ws_ping_interval_ms)),
            backoff: config.pool.reconnect.clone(),
            connect_timeout: Duration::from_millis(config.broker.http_timeout_ms),
        });
        info!("account {}: session ready", acc.account_id);
        accounts.push(AccountWiring {
            account_id: acc.account_id.clone(),
            connector: Arc::new(connector),
            session: Arc::new(session),
        });
    }

    Ok(RuntimeDeps {
        accounts,
        registry,
        calculator: Arc::new(BlackScholes::new(config.pipeline.risk_free_rate)),
        bus,
        reporter: Arc::new(LogReporter),
    })
}
