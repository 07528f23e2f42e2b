use serde::{Deserialize, Serialize};

/// Hard risk limits, read-only at runtime.
///
/// Percentages are in percent units: `stop_loss_pct = 8.0` means an 8% move
/// against the average cost.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RiskLimits {
    /// Largest absolute position, in base units
    pub max_position_size: f64,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    /// Per symbol
    pub max_open_orders: usize,
    pub allow_short: bool,
    /// Exit once price gives back this much from the best mark since entry; 0 disables
    pub trailing_stop_pct: f64,
    /// Stop opening positions once equity is this far below its peak; 0 disables
    pub max_drawdown_pct: f64,
    /// Quote capital that drawdown is measured from
    pub starting_equity: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_position_size: 1.0,
            stop_loss_pct: 8.0,
            take_profit_pct: 12.0,
            max_open_orders: 1,
            allow_short: false,
            trailing_stop_pct: 0.0,
            max_drawdown_pct: 0.0,
            starting_equity: 10_000.0,
        }
    }
}

impl RiskLimits {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.max_position_size > 0.0) {
            return Err("max_position_size must be positive".to_string());
        }
        if !(self.stop_loss_pct > 0.0 && self.stop_loss_pct < 100.0) {
            return Err("stop_loss_pct must be between 0 and 100".to_string());
        }
        if !(self.take_profit_pct > 0.0) {
            return Err("take_profit_pct must be positive".to_string());
        }
        if self.max_open_orders == 0 {
            return Err("max_open_orders must be at least 1".to_string());
        }
        if !(self.trailing_stop_pct >= 0.0 && self.trailing_stop_pct < 100.0) {
            return Err("trailing_stop_pct must be between 0 and 100".to_string());
        }
        if !(self.max_drawdown_pct >= 0.0 && self.max_drawdown_pct < 100.0) {
            return Err("max_drawdown_pct must be between 0 and 100".to_string());
        }
        if self.max_drawdown_pct > 0.0 && !(self.starting_equity > 0.0) {
            return Err("starting_equity must be positive when max_drawdown_pct is set".to_string());
        }
        Ok(())
    }
}
