// Risk management module
pub mod limits;
pub mod manager;
pub mod watermark;

pub use limits::RiskLimits;
pub use manager::{RiskDecision, RiskManager};
pub use watermark::{DrawdownGuard, PriceWatermarks};
