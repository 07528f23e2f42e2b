use super::clock::{Clock, SystemClock};
use super::ledger::PositionLedger;
use super::lifecycle::{ClientIdGenerator, OrderLifecycleEngine};
use super::pipeline::{CycleDecision, DecisionPipeline};
use super::price_feed::MarketDataFeed;
use super::tick_buffer::TickBuffer;
use crate::api::{BinanceAdapter, ExchangeAdapter, PaperExchange, RetryingAdapter};
use crate::config::{AppConfig, ExchangeConfig, ExchangeKind};
use crate::models::{SymbolRules, Tick};
use crate::risk::RiskManager;
use crate::strategy::StrategyEvaluator;
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// One exchange's trading loop: reconcile, read the market, decide, execute
pub struct ExchangeCycle {
    engine: OrderLifecycleEngine,
    pipeline: DecisionPipeline,
    feed: MarketDataFeed,
    market: TickBuffer,
    rules: HashMap<String, SymbolRules>,
}

impl ExchangeCycle {
    pub fn new(
        engine: OrderLifecycleEngine,
        pipeline: DecisionPipeline,
        feed: MarketDataFeed,
        tick_window: usize,
    ) -> Self {
        Self {
            engine,
            pipeline,
            feed,
            market: TickBuffer::new(tick_window),
            rules: HashMap::new(),
        }
    }

    pub fn exchange(&self) -> &str {
        self.engine.exchange()
    }

    pub fn engine(&self) -> &OrderLifecycleEngine {
        &self.engine
    }

    pub fn market(&self) -> &TickBuffer {
        &self.market
    }

    /// Poll the feed, then process whatever arrived
    pub async fn run_cycle(&mut self) -> CycleDecision {
        let ticks = self.feed.poll().await;
        self.process(ticks).await
    }

    /// Run one cycle over ticks already in hand.
    ///
    /// Per-intent failures are logged and do not stop the rest of the cycle.
    pub async fn process(&mut self, ticks: Vec<Tick>) -> CycleDecision {
        self.engine.reconcile().await;

        for tick in ticks {
            self.market.push(tick);
        }
        self.load_rules().await;

        let snapshot = self.engine.snapshot().await;
        let decision = self.pipeline.decide(&self.market, &snapshot, &self.rules);

        for intent in &decision.approved {
            let mark = self.market.latest_price(&intent.symbol);
            let rules = self.rules.get(&intent.symbol).copied().unwrap_or_default();
            if let Err(e) = self.engine.execute(intent, mark, &rules).await {
                tracing::error!(
                    exchange = %self.engine.exchange(),
                    symbol = %intent.symbol,
                    "Failed to execute {} {:.8}: {}",
                    intent.side,
                    intent.requested_quantity,
                    e
                );
            }
        }

        if !decision.is_empty() {
            tracing::info!(
                exchange = %self.engine.exchange(),
                strategy = %self.pipeline.strategy_name(),
                "Cycle: {} approved, {} rejected",
                decision.approved.len(),
                decision.rejected.len()
            );
        }
        decision
    }

    async fn load_rules(&mut self) {
        let missing: Vec<String> = self
            .market
            .symbols()
            .filter(|s| !self.rules.contains_key(*s))
            .map(str::to_string)
            .collect();

        for symbol in missing {
            match self.engine.adapter().symbol_rules(&symbol).await {
                Ok(rules) => {
                    self.rules.insert(symbol, rules);
                }
                Err(e) => {
                    // retried next cycle
                    tracing::warn!(symbol = %symbol, "No order rules, trading unrestricted: {}", e);
                }
            }
        }
    }
}

/// Runs one `ExchangeCycle` per configured exchange, concurrently
pub struct Trader {
    cycles: Vec<ExchangeCycle>,
    poll_interval: Duration,
}

impl Trader {
    pub fn new(cycles: Vec<ExchangeCycle>, poll_interval: Duration) -> Self {
        Self {
            cycles,
            poll_interval,
        }
    }

    pub fn from_config(config: &AppConfig, strategy: Arc<dyn StrategyEvaluator>) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let ledger = PositionLedger::new(config.risk.allow_short);
        let pipeline = DecisionPipeline::new(strategy, RiskManager::new(config.risk.clone()));

        let mut cycles = Vec::new();
        for exchange in &config.exchanges {
            let adapter = build_adapter(exchange, config, clock.clone())?;
            let feed = MarketDataFeed::new().with_source(adapter.clone(), exchange.symbols.clone());
            let engine = OrderLifecycleEngine::new(
                &exchange.wallet_id,
                adapter,
                ledger.clone(),
                clock.clone(),
                config.engine.clone(),
                ClientIdGenerator::random(),
            );
            let equity = if exchange.paper_trading {
                exchange.paper_balance
            } else {
                config.risk.starting_equity
            };
            cycles.push(ExchangeCycle::new(
                engine,
                pipeline.clone().with_starting_equity(equity),
                feed,
                config.engine.tick_window,
            ));

            tracing::info!(
                exchange = %exchange.name,
                wallet = %exchange.wallet_id,
                paper = exchange.paper_trading,
                "Trading {} symbols",
                exchange.symbols.len()
            );
        }

        Ok(Self::new(
            cycles,
            Duration::from_secs(config.poll_interval_secs),
        ))
    }

    pub fn exchanges(&self) -> Vec<&str> {
        self.cycles.iter().map(|c| c.exchange()).collect()
    }

    /// One cycle on every exchange at once; results sorted by exchange name.
    /// A cycle that panics is logged and dropped from the trader.
    pub async fn run_once(&mut self) -> Vec<(String, CycleDecision)> {
        let mut tasks = JoinSet::new();
        for mut cycle in std::mem::take(&mut self.cycles) {
            tasks.spawn(async move {
                let decision = cycle.run_cycle().await;
                (cycle, decision)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((cycle, decision)) => {
                    results.push((cycle.exchange().to_string(), decision));
                    self.cycles.push(cycle);
                }
                Err(e) => tracing::error!("Exchange cycle panicked: {}", e),
            }
        }

        self.cycles.sort_by(|a, b| a.exchange().cmp(b.exchange()));
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }

    /// Run every exchange on its own interval until the future is dropped.
    /// Exchanges never wait on each other.
    pub async fn run(self) {
        let mut tasks = JoinSet::new();

        for mut cycle in self.cycles {
            let period = self.poll_interval;
            tasks.spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    cycle.run_cycle().await;
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Exchange task stopped: {}", e);
            }
        }
    }
}

fn build_adapter(
    exchange: &ExchangeConfig,
    config: &AppConfig,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn ExchangeAdapter>> {
    let live: Arc<dyn ExchangeAdapter> = match exchange.kind {
        ExchangeKind::Binance => Arc::new(RetryingAdapter::new(
            BinanceAdapter::from_config(exchange)?,
            config.retry.clone(),
        )),
    };

    if !exchange.paper_trading {
        return Ok(live);
    }

    let paper = PaperExchange::new(&exchange.name, clock)
        .with_quote_asset(&exchange.quote_asset)
        .with_short_selling(config.risk.allow_short)
        .with_price_source(live);
    paper.deposit(&exchange.quote_asset, exchange.paper_balance);
    Ok(Arc::new(paper))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::clock::SimulatedClock;
    use crate::models::TradeIntent;
    use crate::risk::RiskLimits;
    use crate::strategy::BuyAndHold;
    use chrono::{TimeZone, Utc};

    fn paper_cycle(name: &str, clock: Arc<SimulatedClock>) -> (Arc<PaperExchange>, ExchangeCycle) {
        let paper = Arc::new(PaperExchange::new(name, clock.clone()));
        paper.deposit("USD", 10_000.0);
        paper.set_mark(Tick {
            exchange: name.into(),
            symbol: "BTCUSDT".into(),
            price: 100.0,
            volume: 1.0,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        });

        let engine = OrderLifecycleEngine::new(
            "main",
            paper.clone(),
            PositionLedger::default(),
            clock,
            Default::default(),
            ClientIdGenerator::new(name),
        );
        let pipeline = DecisionPipeline::new(
            Arc::new(BuyAndHold::new(0.5)),
            RiskManager::new(RiskLimits::default()),
        );
        let feed = MarketDataFeed::new().with_source(paper.clone(), vec!["BTCUSDT".into()]);
        (paper, ExchangeCycle::new(engine, pipeline, feed, 50))
    }

    #[tokio::test]
    async fn test_cycle_buys_and_records_position() {
        let clock = Arc::new(SimulatedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let (_, mut cycle) = paper_cycle("alpha", clock);

        let decision = cycle.run_cycle().await;
        assert_eq!(decision.approved, vec![TradeIntent::buy("BTCUSDT", 0.5, "buy and hold")]);

        let snapshot = cycle.engine().snapshot().await;
        assert_eq!(snapshot.quantity("BTCUSDT"), 0.5);

        // holding now, nothing more to do
        assert!(cycle.run_cycle().await.approved.is_empty());
    }

    #[tokio::test]
    async fn test_run_once_returns_every_exchange() {
        let clock = Arc::new(SimulatedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let (_, beta) = paper_cycle("beta", clock.clone());
        let (_, alpha) = paper_cycle("alpha", clock);
        let mut trader = Trader::new(vec![beta, alpha], Duration::from_secs(1));

        let results = trader.run_once().await;
        let names: Vec<&str> = results.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);
        assert_eq!(trader.exchanges(), vec!["alpha", "beta"]);
    }
}
