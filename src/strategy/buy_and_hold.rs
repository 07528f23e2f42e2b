use super::StrategyEvaluator;
use crate::execution::ledger::PositionSnapshot;
use crate::execution::tick_buffer::TickBuffer;
use crate::models::{TradeIntent, QTY_EPSILON};

/// Buy-and-Hold baseline strategy
///
/// Buys `quantity` of every symbol it sees while flat, then never sells.
/// Stop-loss and take-profit exits still apply; they come from the risk layer.
/// Used as a baseline to compare against active trading strategies.
#[derive(Debug, Clone)]
pub struct BuyAndHold {
    quantity: f64,
}

impl BuyAndHold {
    pub fn new(quantity: f64) -> Self {
        Self { quantity }
    }
}

impl Default for BuyAndHold {
    fn default() -> Self {
        Self::new(0.1)
    }
}

impl StrategyEvaluator for BuyAndHold {
    fn evaluate(&self, market: &TickBuffer, positions: &PositionSnapshot) -> Vec<TradeIntent> {
        market
            .symbols()
            .filter(|symbol| {
                positions.quantity(symbol).abs() < QTY_EPSILON
                    && positions.open_order_count(symbol) == 0
            })
            .map(|symbol| TradeIntent::buy(symbol, self.quantity, "buy and hold"))
            .collect()
    }

    fn name(&self) -> &str {
        "BuyAndHold"
    }

    fn min_ticks_required(&self) -> usize {
        1 // Only needs the current tick
    }
}
