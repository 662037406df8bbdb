//! Polyfleet: multi-agent Polymarket copy trading.
//!
//! Each agent mirrors one participant's activity onto a simulated or live
//! account under its own risk limits. All agents share one rate-limited
//! connection to the upstream API.

mod agent;
mod api;
mod config;
mod db;
mod error;
mod metrics;
mod models;
mod trading;

#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::agent::{AgentSummary, AgentSupervisor};
use crate::api::{
    ActivityFeed, DataClient, HttpOrderRouter, OrderRouter, RateLimitedFeedClient, RequestGate,
};
use crate::config::EngineConfig;
use crate::db::{Database, PersistenceGateway};
use crate::metrics::PerformanceCalculator;
use crate::models::{AgentConfig, AgentFilter, AgentId, AgentMode, AgentUpdate, HistoryPeriod};
use crate::trading::CopyBehaviorFactory;

/// Polyfleet copy-trading engine CLI.
#[derive(Parser)]
#[command(name = "polyfleet")]
#[command(about = "Run a fleet of Polymarket copy-trading agents", long_about = None)]
struct Cli {
    /// Database file path
    #[arg(short, long, env = "POLYFLEET_DATABASE", default_value = "sqlite:./polyfleet.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(flatten)]
    engine: EngineConfig,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a copy agent (inactive until started)
    Create {
        /// Agent name
        name: String,

        /// Profile URL or wallet address of the participant to mirror
        profile: String,

        #[command(flatten)]
        limits: LimitArgs,

        /// Free-text notes
        #[arg(long, default_value = "")]
        notes: String,
    },

    /// Change a stopped agent's configuration
    Update {
        /// Agent id
        id: String,

        #[arg(long)]
        name: Option<String>,

        /// New profile URL or wallet address
        #[arg(long)]
        profile: Option<String>,

        /// Persisted mode (inactive, simulated, live)
        #[arg(long)]
        mode: Option<AgentMode>,

        #[command(flatten)]
        limits: LimitArgs,

        #[arg(long)]
        notes: Option<String>,
    },

    /// List agents
    List {
        /// Only agents in this persisted mode
        #[arg(short, long)]
        mode: Option<AgentMode>,

        /// Only agents whose name contains this text
        #[arg(long)]
        name: Option<String>,
    },

    /// Show an agent's configuration and performance
    Show {
        /// Agent id
        id: String,
    },

    /// Show an agent's open and recently closed trades
    Trades {
        /// Agent id
        id: String,

        /// Closed trades to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show an agent's performance snapshots
    History {
        /// Agent id
        id: String,

        /// Look-back period (24h, 1w, 1m, 3m, 1y, max)
        #[arg(short, long, default_value = "1w")]
        period: HistoryPeriod,
    },

    /// Cancel an open trade of a stopped agent
    Cancel {
        /// Agent id
        id: String,

        /// Trade id
        trade_id: String,
    },

    /// Show an agent's paper balance, or reset it with --reset
    Wallet {
        /// Agent id
        id: String,

        /// Put the balance back to its starting amount
        #[arg(long)]
        reset: bool,

        /// New starting amount in USDC (implies --reset)
        #[arg(long)]
        amount: Option<Decimal>,
    },

    /// Run agents until Ctrl+C
    Run {
        /// Agents to start; defaults to every agent persisted as active
        #[arg(short, long = "agent")]
        agents: Vec<String>,

        /// Mode for agents given with --agent
        #[arg(short, long, default_value = "simulated")]
        mode: AgentMode,

        /// Seconds between status lines
        #[arg(long, default_value = "60")]
        status_every: u64,
    },

    /// Show current configuration
    Config,
}

/// Risk limit flags shared by `create` and `update`.
#[derive(clap::Args)]
struct LimitArgs {
    /// Fraction of the source trade size to mirror
    #[arg(long)]
    copy_ratio: Option<Decimal>,

    /// Smallest mirrored trade in USDC
    #[arg(long)]
    min_trade: Option<Decimal>,

    /// Largest mirrored trade in USDC
    #[arg(long)]
    max_trade: Option<Decimal>,

    /// Adverse move (percent) that force-closes a position; 0 disables
    #[arg(long)]
    stop_loss: Option<Decimal>,

    /// Trailing 24h realized loss that pauses new opens; 0 disables
    #[arg(long)]
    max_daily_loss: Option<Decimal>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("Invalid log level")?;
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let db = Database::new(&cli.database).await?;
    let store: Arc<dyn PersistenceGateway> = Arc::new(db);
    let supervisor = build_supervisor(&cli.engine, store.clone())?;

    match cli.command {
        Commands::Create {
            name,
            profile,
            limits,
            notes,
        } => {
            let mut config = AgentConfig::copy(name, profile);
            config.notes = notes;
            let config = limits.into_update().apply(&config);

            let participant = config
                .target_participant()
                .map_err(|e| anyhow::anyhow!("Invalid profile: {}", e))?;
            let id = supervisor.create_agent(config).await?;

            println!("Created agent {}", id);
            println!("Mirroring:  {}", participant);
            println!("Start it with 'polyfleet run --agent {}'", id);
        }

        Commands::Update {
            id,
            name,
            profile,
            mode,
            limits,
            notes,
        } => {
            let mut update = limits.into_update();
            update.name = name;
            update.target_profile = profile;
            update.mode = mode;
            update.notes = notes;

            if update.is_empty() {
                println!("Nothing to update.");
                return Ok(());
            }

            let config = supervisor.update_agent(&AgentId::from(id), update).await?;
            println!("Updated agent {} ({})", config.id, config.name);
        }

        Commands::List { mode, name } => {
            let filter = AgentFilter {
                mode,
                name_contains: name,
            };
            let agents = supervisor.list_agents(&filter).await?;

            if agents.is_empty() {
                println!("No agents found. Use 'polyfleet create <name> <profile>' to add one.");
                return Ok(());
            }

            println!(
                "\n{:<18} {:<20} {:<10} {:>6} {:>12} {:>12} {:<44}",
                "ID", "NAME", "MODE", "OPEN", "P&L", "PAPER", "TARGET"
            );
            println!("{}", "-".repeat(127));

            for summary in agents {
                println!(
                    "{:<18} {:<20} {:<10} {:>6} {:>12} {:>12} {:<44}",
                    summary.config.id.as_str(),
                    truncate(&summary.config.name, 18),
                    summary.config.mode.as_str(),
                    summary.open_positions,
                    format!("${:.2}", summary.realized_pnl),
                    format!("${:.2}", summary.paper_balance),
                    truncate(summary.config.kind.target_profile(), 44),
                );
            }
        }

        Commands::Show { id } => {
            let id = AgentId::from(id);
            let summary = supervisor.status(&id).await?;
            let closed = store.get_closed_trades(&id, None).await?;
            print_summary(&summary);

            println!("\n--- Performance ---");
            println!("{}", PerformanceCalculator::calculate(&closed));
        }

        Commands::Trades { id, limit } => {
            let id = AgentId::from(id);
            supervisor.status(&id).await?;

            let open = store.get_open_trades(&id).await?;
            println!("\n--- Open Trades ({}) ---", open.len());
            for trade in &open {
                println!(
                    "  {}  {} {} ${:.2} @ {:.3}  opened {}{}",
                    trade.trade_id,
                    truncate(&trade.label, 40),
                    trade.outcome,
                    trade.amount,
                    trade.entry_price,
                    trade.opened_at.format("%Y-%m-%d %H:%M"),
                    if trade.simulated { " (sim)" } else { "" }
                );
            }

            let closed = store.get_closed_trades(&id, None).await?;
            let recent: Vec<_> = closed.iter().rev().take(limit).collect();
            println!("\n--- Closed Trades (last {} of {}) ---", recent.len(), closed.len());
            for trade in recent {
                println!(
                    "  {}  {} {} {:.3} -> {:.3}  P&L ${:.2}  {} ({})",
                    trade.position.trade_id,
                    truncate(&trade.position.label, 40),
                    trade.position.outcome,
                    trade.position.entry_price,
                    trade.exit_price,
                    trade.realized_pnl,
                    trade.status,
                    trade.reason
                );
            }
        }

        Commands::History { id, period } => {
            let id = AgentId::from(id);
            supervisor.status(&id).await?;
            let snapshots = store.get_snapshots(&id, period.since(Utc::now())).await?;

            if snapshots.is_empty() {
                println!("No snapshots in that period.");
                return Ok(());
            }

            println!(
                "\n{:<18} {:<8} {:>8} {:>8} {:>12}",
                "TAKEN", "KIND", "TRADES", "WIN%", "NET P&L"
            );
            println!("{}", "-".repeat(58));
            for snapshot in snapshots {
                println!(
                    "{:<18} {:<8} {:>8} {:>7.1}% {:>12}",
                    snapshot.taken_at.format("%Y-%m-%d %H:%M"),
                    snapshot.kind.as_str(),
                    snapshot.total_trades,
                    snapshot.win_rate,
                    format!("${:.2}", snapshot.net_pnl)
                );
            }
        }

        Commands::Cancel { id, trade_id } => {
            supervisor
                .cancel_trade(&AgentId::from(id), &trade_id)
                .await?;
            println!("Cancelled trade {}", trade_id);
        }

        Commands::Wallet { id, reset, amount } => {
            let id = AgentId::from(id);
            let wallet = if reset || amount.is_some() {
                supervisor.reset_paper_wallet(&id, amount).await?
            } else {
                store.get_agent(&id).await?;
                store.paper_wallet(&id).await?
            };

            println!("
=== Paper Wallet: {} ===", wallet.agent_id);
            println!("Starting: ${:.2}", wallet.initial);
            println!("Balance:  ${:.2}", wallet.balance);
            println!("Change:   ${:.2}", wallet.change());
            println!("All agents: ${:.2}", store.total_paper_balance().await?);
        }

        Commands::Run {
            agents,
            mode,
            status_every,
        } => {
            run(&cli.engine, &supervisor, agents, mode, status_every).await?;
        }

        Commands::Config => print_config(&cli.engine, &cli.database)?,
    }

    Ok(())
}

/// Wire the shared gate, feed, routers and store into a supervisor.
fn build_supervisor(
    engine: &EngineConfig,
    store: Arc<dyn PersistenceGateway>,
) -> Result<AgentSupervisor> {
    let gate = Arc::new(RequestGate::new(engine.gate_policy()));

    let transport = DataClient::with_base_urls(engine.data_api_url.clone(), engine.clob_api_url.clone())?;
    let feed: Arc<dyn ActivityFeed> = Arc::new(RateLimitedFeedClient::new(
        transport,
        gate.clone(),
        engine.max_feed_attempts,
        engine.activity_page_size,
    ));

    let live_router: Option<Arc<dyn OrderRouter>> = match &engine.order_api_key {
        Some(key) => Some(Arc::new(HttpOrderRouter::new(
            engine.clob_api_url.clone(),
            key.clone(),
            gate,
        )?)),
        None => None,
    };

    let factory = Arc::new(CopyBehaviorFactory::new(feed, store.clone(), live_router));
    Ok(AgentSupervisor::new(
        store,
        factory,
        engine.runner_settings(),
        engine.stop_timeout(),
    ))
}

async fn run(
    engine: &EngineConfig,
    supervisor: &AgentSupervisor,
    agents: Vec<String>,
    mode: AgentMode,
    status_every: u64,
) -> Result<()> {
    engine.validate().context("Invalid engine configuration")?;

    let targets: Vec<(AgentId, AgentMode)> = if agents.is_empty() {
        supervisor
            .list_agents(&AgentFilter::default())
            .await?
            .into_iter()
            .filter(|s| s.config.mode.is_active())
            .map(|s| (s.config.id, s.config.mode))
            .collect()
    } else {
        agents.into_iter().map(|a| (AgentId::from(a), mode)).collect()
    };

    if targets.is_empty() {
        println!("No active agents. Use 'polyfleet run --agent <id>' to start one.");
        return Ok(());
    }

    if engine.order_api_key.is_none() && targets.iter().any(|(_, m)| *m == AgentMode::Live) {
        warn!("No order API key configured; live agents will fault at start");
    }

    info!(
        agents = targets.len(),
        poll_interval = engine.poll_interval_secs,
        "Starting agents"
    );

    for (id, mode) in &targets {
        if let Err(e) = supervisor.start_agent(id, *mode).await {
            error!(agent = %id, error = %e, "Failed to start agent");
        }
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(Duration::from_secs(status_every.max(1)));

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
            _ = ticker.tick() => print_status(supervisor).await,
        }
    }

    let report = supervisor.shutdown(engine.shutdown_timeout()).await;
    println!(
        "Stopped {} agent(s){}",
        report.stopped.len(),
        if report.timed_out.is_empty() {
            String::new()
        } else {
            format!(", aborted {} that did not stop in time", report.timed_out.len())
        }
    );
    Ok(())
}

async fn print_status(supervisor: &AgentSupervisor) {
    let summaries = match supervisor.list_agents(&AgentFilter::default()).await {
        Ok(summaries) => summaries,
        Err(e) => {
            warn!(error = %e, "Failed to read agent status");
            return;
        }
    };

    for summary in summaries.iter().filter(|s| s.status.cycles > 0 || s.status.last_error.is_some()) {
        println!(
            "[{}] {:<20} {:<9} {:<9} open={:<3} pnl=${:.2}{}",
            Utc::now().format("%H:%M:%S"),
            truncate(&summary.config.name, 20),
            summary.status.state.as_str(),
            summary.status.mode.as_str(),
            summary.open_positions,
            summary.realized_pnl,
            summary
                .status
                .last_error
                .as_ref()
                .map(|e| format!("  error: {}", e))
                .unwrap_or_default()
        );
    }
}

fn print_summary(summary: &AgentSummary) {
    let config = &summary.config;
    println!("\n=== Agent: {} ===", config.name);
    println!("ID:      {}", config.id);
    println!("Kind:    {}", config.kind.name());
    println!("Target:  {}", config.kind.target_profile());
    println!("Mode:    {}", config.mode);
    if !config.notes.is_empty() {
        println!("Notes:   {}", config.notes);
    }

    println!("\n--- Risk Limits ---");
    println!("Copy Ratio:     {}", config.limits.copy_ratio);
    println!("Min Trade:      ${:.2}", config.limits.min_trade_value);
    println!("Max Trade:      ${:.2}", config.limits.max_trade_value);
    println!("Stop Loss:      {}%", config.limits.stop_loss_percentage);
    println!("Max Daily Loss: ${:.2}", config.limits.max_daily_loss);

    println!("\n--- Status ---");
    println!("State:          {}", summary.status.state);
    println!("Open Positions: {}", summary.open_positions);
    println!("Realized P&L:   ${:.2}", summary.realized_pnl);
    println!("Paper Balance:  ${:.2}", summary.paper_balance);
}

fn print_config(engine: &EngineConfig, database: &str) -> Result<()> {
    println!("\n=== Polyfleet Configuration ===");
    println!("Database: {}", database);
    println!(
        "Order API key: {}",
        if engine.order_api_key.is_some() { "configured" } else { "not set (simulated only)" }
    );
    println!("{}", serde_json::to_string_pretty(engine)?);

    if let Err(e) = engine.validate() {
        println!("\nWarning: {}", e);
    }
    Ok(())
}

impl LimitArgs {
    fn into_update(self) -> AgentUpdate {
        AgentUpdate {
            copy_ratio: self.copy_ratio,
            min_trade_value: self.min_trade,
            max_trade_value: self.max_trade,
            stop_loss_percentage: self.stop_loss,
            max_daily_loss: self.max_daily_loss,
            ..Default::default()
        }
    }
}

/// Truncate a string to max length with ellipsis.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
