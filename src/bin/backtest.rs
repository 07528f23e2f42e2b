use anyhow::Context;
use breadbot::api::{BinanceAdapter, ExchangeAdapter, RetryingAdapter};
use breadbot::backtest::{BacktestSimulator, MarketScenario, SyntheticTickGenerator};
use breadbot::config::AppConfig;
use breadbot::execution::MarketDataFeed;
use breadbot::models::Tick;
use breadbot::strategy::{BuyAndHold, MovingAverageCrossover};
use breadbot::StrategyEvaluator;
use clap::{ArgGroup, Parser, ValueEnum};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StrategyChoice {
    Crossover,
    BuyAndHold,
}

/// Replay ticks through the trading engine against a simulated exchange
#[derive(Parser)]
#[command(name = "backtest", version)]
#[command(group(ArgGroup::new("source").required(true).args(["ticks", "synthetic", "exchange"])))]
struct Args {
    /// JSON array of ticks
    #[arg(long)]
    ticks: Option<String>,

    /// Generate a seeded series: uptrend, downtrend, sideways, volatile or crash
    #[arg(long)]
    synthetic: Option<MarketScenario>,

    /// Fetch history from this configured exchange over the backtest date range
    #[arg(long)]
    exchange: Option<String>,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Number of synthetic ticks
    #[arg(long, default_value_t = 2_000)]
    count: usize,

    #[arg(long, default_value = "BTCUSDT")]
    symbol: String,

    #[arg(long, value_enum, default_value_t = StrategyChoice::Crossover)]
    strategy: StrategyChoice,

    /// TOML config for risk limits, engine and backtest settings
    #[arg(short, long)]
    config: Option<String>,

    /// Also write the report here as JSON
    #[arg(long)]
    out: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("breadbot=info")),
        )
        .init();

    let args = Args::parse();
    let config = AppConfig::load(args.config.as_deref())?;

    let ticks = load_ticks(&args, &config).await?;
    if ticks.is_empty() {
        anyhow::bail!("no ticks to replay");
    }

    let strategy: Arc<dyn StrategyEvaluator> = match args.strategy {
        StrategyChoice::Crossover => Arc::new(MovingAverageCrossover::default()),
        StrategyChoice::BuyAndHold => Arc::new(BuyAndHold::default()),
    };

    let report = BacktestSimulator::from_config(&config, strategy)
        .run(ticks)
        .await?;
    report.print_report();

    if let Some(path) = &args.out {
        std::fs::write(path, report.to_json()?)
            .with_context(|| format!("writing report to {}", path))?;
        tracing::info!("Report written to {}", path);
    }

    Ok(())
}

async fn load_ticks(args: &Args, config: &AppConfig) -> anyhow::Result<Vec<Tick>> {
    if let Some(path) = &args.ticks {
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
        let ticks: Vec<Tick> =
            serde_json::from_str(&raw).with_context(|| format!("parsing ticks in {}", path))?;
        tracing::info!("Loaded {} ticks from {}", ticks.len(), path);
        return Ok(ticks);
    }

    if let Some(scenario) = args.synthetic {
        tracing::info!(
            "Generating {} {} ticks (seed {})",
            args.count,
            scenario,
            args.seed
        );
        let mut generator = SyntheticTickGenerator::new(args.seed);
        return Ok(generator.generate(
            scenario,
            &config.backtest.exchange,
            &args.symbol,
            args.count,
        ));
    }

    let Some(name) = &args.exchange else {
        anyhow::bail!("one of --ticks, --synthetic or --exchange is required");
    };
    let exchange = config
        .exchanges
        .iter()
        .find(|e| &e.name == name)
        .with_context(|| format!("exchange {} is not configured", name))?;

    let range = BacktestSimulator::from_config(config, Arc::new(BuyAndHold::default()))
        .range()
        .context("--exchange needs backtest.start and backtest.end in the config")?;

    let symbols = match &config.backtest.symbol {
        Some(symbol) => vec![symbol.clone()],
        None => exchange.symbols.clone(),
    };

    let adapter: Arc<dyn ExchangeAdapter> = Arc::new(RetryingAdapter::new(
        BinanceAdapter::from_config(exchange)?,
        config.retry.clone(),
    ));
    let feed = MarketDataFeed::new().with_source(adapter, symbols);
    Ok(feed.fetch_history(&range).await?)
}
