use breadbot::config::AppConfig;
use breadbot::execution::Trader;
use breadbot::strategy::MovingAverageCrossover;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "breadbot", version, about = "Multi-exchange crypto trading engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Trade live (or on paper) on every configured exchange until Ctrl+C
    Run {
        /// TOML config file; defaults to breadbot.toml when present
        #[arg(short, long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_logging();

    let cli = Cli::parse();
    match cli.command {
        Command::Run { config } => run(config.as_deref()).await,
    }
}

async fn run(config_path: Option<&str>) -> anyhow::Result<()> {
    let config = AppConfig::load(config_path)?;
    if config.exchanges.is_empty() {
        anyhow::bail!("no exchanges configured");
    }

    let trader = Trader::from_config(&config, Arc::new(MovingAverageCrossover::default()))?;
    tracing::info!(
        "breadbot starting on {} exchange(s), polling every {}s",
        trader.exchanges().len(),
        config.poll_interval_secs
    );

    tokio::select! {
        _ = trader.run() => {
            tracing::warn!("All exchange tasks stopped");
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("Shutdown requested, stopping");
        }
    }

    Ok(())
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("breadbot=info")),
        )
        .init();
}
