// Trading strategy module
pub mod buy_and_hold;
pub mod crossover;

pub use buy_and_hold::BuyAndHold;
pub use crossover::MovingAverageCrossover;

use crate::execution::ledger::PositionSnapshot;
use crate::execution::tick_buffer::TickBuffer;
use crate::models::TradeIntent;

/// Base trait for all trading strategies
///
/// Implementations must be pure: the same market window and snapshot always
/// produce the same intents, so live runs and backtests agree.
pub trait StrategyEvaluator: Send + Sync {
    /// Propose zero or more trades for the symbols in `market`
    fn evaluate(&self, market: &TickBuffer, positions: &PositionSnapshot) -> Vec<TradeIntent>;

    /// Get strategy name
    fn name(&self) -> &str;

    /// Ticks per symbol needed before the strategy says anything
    fn min_ticks_required(&self) -> usize;
}
