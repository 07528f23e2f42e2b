use super::fill_model::{FillModel, ImmediateFillModel};
use super::report::{BacktestReport, EquityPoint};
use crate::api::PaperExchange;
use crate::config::{AppConfig, BacktestConfig, EngineConfig};
use crate::error::Error;
use crate::execution::{
    ClientIdGenerator, CycleDecision, DecisionPipeline, ExchangeCycle, MarketDataFeed,
    OrderLifecycleEngine, PositionLedger, SimulatedClock,
};
use crate::models::{SymbolRules, Tick, TimeRange};
use crate::risk::{RiskLimits, RiskManager};
use crate::strategy::StrategyEvaluator;
use crate::Result;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Replays historical ticks through the live decision path.
///
/// Each tick advances a simulated clock, moves the paper exchange's mark
/// (which matches resting orders) and runs one `ExchangeCycle`, the same
/// cycle the live trader runs. Only the adapter and the clock differ.
pub struct BacktestSimulator {
    strategy: Arc<dyn StrategyEvaluator>,
    limits: RiskLimits,
    engine: EngineConfig,
    config: BacktestConfig,
    rules: SymbolRules,
    fill_model: Arc<dyn FillModel>,
}

impl BacktestSimulator {
    pub fn new(strategy: Arc<dyn StrategyEvaluator>, limits: RiskLimits, config: BacktestConfig) -> Self {
        Self {
            strategy,
            limits,
            engine: EngineConfig::default(),
            config,
            rules: SymbolRules::unrestricted(),
            fill_model: Arc::new(ImmediateFillModel),
        }
    }

    pub fn from_config(config: &AppConfig, strategy: Arc<dyn StrategyEvaluator>) -> Self {
        Self::new(strategy, config.risk.clone(), config.backtest.clone())
            .with_engine_config(config.engine.clone())
    }

    pub fn with_engine_config(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    /// Order size rules the simulated exchange enforces for every symbol
    pub fn with_rules(mut self, rules: SymbolRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_fill_model(mut self, model: Arc<dyn FillModel>) -> Self {
        self.fill_model = model;
        self
    }

    pub async fn run(&self, ticks: Vec<Tick>) -> Result<BacktestReport> {
        Ok(self.run_recorded(ticks).await?.0)
    }

    /// Like `run`, also returning each cycle's decisions in tick order
    pub async fn run_recorded(&self, ticks: Vec<Tick>) -> Result<(BacktestReport, Vec<CycleDecision>)> {
        let ticks = self.prepare(ticks)?;
        let first = ticks
            .first()
            .map(|t| t.timestamp)
            .ok_or_else(|| Error::Backtest("no ticks in the configured range".to_string()))?;

        tracing::info!(
            strategy = %self.strategy.name(),
            exchange = %self.config.exchange,
            "Starting backtest over {} ticks from {}",
            ticks.len(),
            first
        );

        let clock = Arc::new(SimulatedClock::new(first));
        let paper = Arc::new(
            PaperExchange::new(&self.config.exchange, clock.clone())
                .with_fee_pct(self.config.fee_pct)
                .with_fill_model(self.fill_model.clone())
                .with_default_rules(self.rules)
                .with_short_selling(self.limits.allow_short),
        );
        paper.deposit(paper.quote_asset(), self.config.initial_cash);

        let ledger = PositionLedger::new(self.limits.allow_short);
        let engine = OrderLifecycleEngine::new(
            &self.config.wallet_id,
            paper.clone(),
            ledger,
            clock.clone(),
            self.engine.clone(),
            ClientIdGenerator::new("bt"),
        );
        let pipeline = DecisionPipeline::new(self.strategy.clone(), RiskManager::new(self.limits.clone()))
            .with_starting_equity(self.config.initial_cash);
        let mut cycle = ExchangeCycle::new(engine, pipeline, MarketDataFeed::new(), self.engine.tick_window);

        let mut curve = Vec::with_capacity(ticks.len());
        let mut decisions = Vec::with_capacity(ticks.len());
        let mut last_prices: BTreeMap<String, f64> = BTreeMap::new();
        let mut rejected = 0;

        for tick in ticks {
            clock.set(tick.timestamp);
            paper.set_mark(tick.clone());
            last_prices.insert(tick.symbol.clone(), tick.price);
            let timestamp = tick.timestamp;

            let decision = cycle.process(vec![tick]).await;
            rejected += decision.rejected.len();
            decisions.push(decision);

            let snapshot = cycle.engine().snapshot().await;
            let holdings: f64 = snapshot
                .positions
                .values()
                .map(|p| p.quantity * last_prices.get(&p.symbol).copied().unwrap_or(0.0))
                .sum();
            curve.push(EquityPoint {
                timestamp,
                equity: paper.balance(paper.quote_asset()) + holdings,
            });
        }

        // settle anything that filled on the final mark
        cycle.engine().reconcile().await;

        let report = BacktestReport::compile(
            self.strategy.name(),
            self.config.initial_cash,
            &curve,
            cycle.engine().order_history().await,
            paper.fees_paid(),
            rejected,
        );

        tracing::info!(
            strategy = %report.strategy,
            "Backtest finished: {:+.2}% return, {} filled orders, {:.2}% max drawdown",
            report.total_return,
            report.trade_count,
            report.max_drawdown
        );

        Ok((report, decisions))
    }

    /// Restrict to the configured range, relabel onto the simulated
    /// exchange and order strictly by time
    fn prepare(&self, ticks: Vec<Tick>) -> Result<Vec<Tick>> {
        if ticks.is_empty() {
            return Err(Error::Backtest("no ticks to replay".to_string()));
        }

        let range = match (self.config.start, self.config.end) {
            (Some(start), Some(end)) if end < start => {
                return Err(Error::Backtest(format!(
                    "backtest end {} is before start {}",
                    end, start
                )))
            }
            (start, end) => (start, end),
        };

        let mut ticks: Vec<Tick> = ticks
            .into_iter()
            .filter(|t| range.0.map_or(true, |s| t.timestamp >= s))
            .filter(|t| range.1.map_or(true, |e| t.timestamp <= e))
            .map(|t| Tick {
                exchange: self.config.exchange.clone(),
                ..t
            })
            .collect();

        ticks.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.symbol.cmp(&b.symbol))
        });
        let before = ticks.len();
        ticks.dedup_by(|next, prev| next.timestamp == prev.timestamp && next.symbol == prev.symbol);
        if ticks.len() < before {
            tracing::debug!("Dropped {} duplicate ticks", before - ticks.len());
        }

        Ok(ticks)
    }

    /// The configured date range, when both ends are set
    pub fn range(&self) -> Option<TimeRange> {
        match (self.config.start, self.config.end) {
            (Some(start), Some(end)) => Some(TimeRange::new(start, end)),
            _ => None,
        }
    }
}
