use super::StrategyEvaluator;
use crate::execution::ledger::PositionSnapshot;
use crate::execution::tick_buffer::TickBuffer;
use crate::models::{TradeIntent, QTY_EPSILON};

/// Calculate Simple Moving Average (SMA) over the last `period` prices
pub fn calculate_sma(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let sum: f64 = prices.iter().rev().take(period).sum();
    Some(sum / period as f64)
}

/// Short/long simple moving average crossover
///
/// - Short SMA crosses above long SMA while flat: buy `quantity`
/// - Short SMA crosses below long SMA while long: sell the whole position
#[derive(Debug, Clone)]
pub struct MovingAverageCrossover {
    short_period: usize,
    long_period: usize,
    quantity: f64,
}

impl MovingAverageCrossover {
    pub fn new(short_period: usize, long_period: usize, quantity: f64) -> Self {
        Self {
            short_period,
            long_period: long_period.max(short_period + 1),
            quantity,
        }
    }
}

impl Default for MovingAverageCrossover {
    fn default() -> Self {
        Self::new(5, 20, 0.1)
    }
}

#[derive(Debug, PartialEq)]
enum Cross {
    Up,
    Down,
}

impl MovingAverageCrossover {
    fn cross(&self, prices: &[f64]) -> Option<Cross> {
        let previous = &prices[..prices.len().checked_sub(1)?];

        let short = calculate_sma(prices, self.short_period)?;
        let long = calculate_sma(prices, self.long_period)?;
        let prev_short = calculate_sma(previous, self.short_period)?;
        let prev_long = calculate_sma(previous, self.long_period)?;

        if prev_short <= prev_long && short > long {
            Some(Cross::Up)
        } else if prev_short >= prev_long && short < long {
            Some(Cross::Down)
        } else {
            None
        }
    }
}

impl StrategyEvaluator for MovingAverageCrossover {
    fn evaluate(&self, market: &TickBuffer, positions: &PositionSnapshot) -> Vec<TradeIntent> {
        let mut intents = Vec::new();

        for symbol in market.symbols() {
            let prices = market.prices(symbol);
            if prices.len() < self.min_ticks_required() {
                continue;
            }

            let held = positions.quantity(symbol);
            match self.cross(&prices) {
                Some(Cross::Up) if held.abs() < QTY_EPSILON => {
                    intents.push(TradeIntent::buy(symbol, self.quantity, "sma cross up"));
                }
                Some(Cross::Down) if held > QTY_EPSILON => {
                    intents.push(TradeIntent::sell(symbol, held, "sma cross down"));
                }
                _ => {}
            }
        }

        intents
    }

    fn name(&self) -> &str {
        "MovingAverageCrossover"
    }

    fn min_ticks_required(&self) -> usize {
        // one extra sample to see the previous averages
        self.long_period + 1
    }
}
