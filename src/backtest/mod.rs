pub mod fill_model;
pub mod report;
pub mod simulator;
pub mod synthetic;

pub use fill_model::{FillModel, ImmediateFillModel, SlippageFillModel};
pub use report::{BacktestReport, EquityPoint};
pub use simulator::BacktestSimulator;
pub use synthetic::{MarketScenario, SyntheticTickGenerator};
