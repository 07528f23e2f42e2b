// Order execution and data collection module
pub mod clock;
pub mod ledger;
pub mod lifecycle;
pub mod pipeline;
pub mod price_feed;
pub mod tick_buffer;
pub mod trader;

pub use clock::{Clock, SimulatedClock, SystemClock};
pub use ledger::{PositionLedger, PositionSnapshot, SymbolBook};
pub use lifecycle::{ClientIdGenerator, OrderLifecycleEngine, ReconcileSummary, ReportOutcome};
pub use pipeline::{CycleDecision, DecisionPipeline};
pub use price_feed::{merge_history, MarketDataFeed};
pub use tick_buffer::TickBuffer;
pub use trader::{ExchangeCycle, Trader};
