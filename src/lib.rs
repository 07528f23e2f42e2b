// Core modules
pub mod api;
pub mod backtest;
pub mod config;
pub mod error;
pub mod execution;
pub mod models;
pub mod risk;
pub mod strategy;

// Re-export commonly used types
pub use api::ExchangeAdapter;
pub use error::Error;
pub use models::*;
pub use strategy::StrategyEvaluator;

// Error handling
pub type Result<T> = std::result::Result<T, Error>;
