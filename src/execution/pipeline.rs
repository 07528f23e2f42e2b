use super::ledger::PositionSnapshot;
use super::tick_buffer::TickBuffer;
use crate::models::{OpenExposure, SymbolRules, TradeIntent};
use crate::risk::{DrawdownGuard, PriceWatermarks, RiskDecision, RiskManager};
use crate::strategy::StrategyEvaluator;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Everything one cycle decided, in the order it was decided
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleDecision {
    pub approved: Vec<TradeIntent>,
    pub rejected: Vec<(TradeIntent, String)>,
}

impl CycleDecision {
    pub fn is_empty(&self) -> bool {
        self.approved.is_empty() && self.rejected.is_empty()
    }
}

/// Strategy evaluation followed by risk review.
///
/// Shared unchanged by live trading and backtests, so both make the same
/// decisions from the same ticks and positions. Each pipeline keeps its own
/// trailing-stop watermarks and equity peak, so one is needed per
/// wallet/exchange pair.
#[derive(Clone)]
pub struct DecisionPipeline {
    strategy: Arc<dyn StrategyEvaluator>,
    risk: RiskManager,
    watermarks: PriceWatermarks,
    starting_equity: f64,
    drawdown: DrawdownGuard,
}

impl DecisionPipeline {
    pub fn new(strategy: Arc<dyn StrategyEvaluator>, risk: RiskManager) -> Self {
        let starting_equity = risk.limits().starting_equity;
        Self {
            drawdown: DrawdownGuard::new(risk.limits().max_drawdown_pct, starting_equity),
            strategy,
            risk,
            watermarks: PriceWatermarks::new(),
            starting_equity,
        }
    }

    /// Measure drawdown from this much quote capital instead of the configured default
    pub fn with_starting_equity(mut self, equity: f64) -> Self {
        self.starting_equity = equity;
        self.drawdown = DrawdownGuard::new(self.risk.limits().max_drawdown_pct, equity);
        self
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    pub fn risk(&self) -> &RiskManager {
        &self.risk
    }

    pub fn drawdown(&self) -> &DrawdownGuard {
        &self.drawdown
    }

    /// Starting capital plus realized and unrealized P&L, marked at the latest prices
    pub fn equity(&self, market: &TickBuffer, snapshot: &PositionSnapshot) -> f64 {
        let pnl: f64 = snapshot
            .positions
            .values()
            .map(|p| {
                let price = market.latest_price(&p.symbol).unwrap_or(p.average_cost);
                p.realized_pnl + p.unrealized_pnl(price)
            })
            .sum();
        self.starting_equity + pnl
    }

    pub fn decide(
        &mut self,
        market: &TickBuffer,
        snapshot: &PositionSnapshot,
        rules: &HashMap<String, SymbolRules>,
    ) -> CycleDecision {
        let mut decision = CycleDecision::default();
        let rules_for = |symbol: &str| rules.get(symbol).copied().unwrap_or_default();

        self.watermarks
            .retain(|symbol| snapshot.positions.get(symbol).is_some_and(|p| !p.is_flat()));
        let equity = self.equity(market, snapshot);
        let halted = self.drawdown.update(equity);

        // risk exits first, on every held symbol, whether or not the strategy speaks
        let mut exiting = BTreeSet::new();
        for position in snapshot.held_symbols() {
            let Some(price) = market.latest_price(&position.symbol) else {
                continue;
            };
            let watermark = self.watermarks.update(position, price);
            if let Some(exit) = self.risk.forced_exit(position, price, watermark) {
                exiting.insert(position.symbol.clone());
                match self.risk.review_exit(exit, &rules_for(&position.symbol)) {
                    RiskDecision::Approved(intent) => decision.approved.push(intent),
                    RiskDecision::Rejected { intent, reason } => {
                        decision.rejected.push((intent, reason))
                    }
                }
            }
        }

        // approvals earlier in the cycle count as resting orders for later intents
        let mut exposure: BTreeMap<String, OpenExposure> = snapshot.open_orders.clone();

        for mut intent in self.strategy.evaluate(market, snapshot) {
            if exiting.contains(&intent.symbol) {
                tracing::debug!(symbol = %intent.symbol, "Strategy intent superseded by risk exit");
                decision
                    .rejected
                    .push((intent, "superseded by risk exit".to_string()));
                continue;
            }

            let position = snapshot.position(&intent.symbol);
            if halted {
                let reducing =
                    !position.is_flat() && intent.side.sign() != position.quantity.signum();
                if !reducing {
                    let reason = format!(
                        "entries halted at {:.2}% drawdown",
                        self.drawdown.drawdown_pct(equity)
                    );
                    tracing::debug!(symbol = %intent.symbol, "{}", reason);
                    decision.rejected.push((intent, reason));
                    continue;
                }
                intent.requested_quantity = intent.requested_quantity.min(position.quantity.abs());
            }

            let open = exposure.get(&intent.symbol).copied().unwrap_or_default();
            match self
                .risk
                .review(intent, &position, &open, &rules_for(&position.symbol))
            {
                RiskDecision::Approved(intent) => {
                    exposure
                        .entry(intent.symbol.clone())
                        .or_default()
                        .add(intent.side, intent.requested_quantity);
                    decision.approved.push(intent);
                }
                RiskDecision::Rejected { intent, reason } => {
                    decision.rejected.push((intent, reason));
                }
            }
        }

        decision
    }
}
