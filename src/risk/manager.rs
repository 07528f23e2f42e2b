use super::RiskLimits;
use crate::error::Error;
use crate::models::{
    IntentReason, OpenExposure, Position, Side, SymbolRules, TradeIntent, QTY_EPSILON,
};
use crate::Result;
use serde::{Deserialize, Serialize};

/// Outcome of one risk review
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RiskDecision {
    Approved(TradeIntent),
    Rejected { intent: TradeIntent, reason: String },
}

impl RiskDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, RiskDecision::Approved(_))
    }

    pub fn intent(&self) -> &TradeIntent {
        match self {
            RiskDecision::Approved(intent) => intent,
            RiskDecision::Rejected { intent, .. } => intent,
        }
    }

    pub fn into_result(self) -> Result<TradeIntent> {
        match self {
            RiskDecision::Approved(intent) => Ok(intent),
            RiskDecision::Rejected { reason, .. } => Err(Error::RiskViolation(reason)),
        }
    }
}

/// Validates trade intents against `RiskLimits` and exchange order rules
#[derive(Debug, Clone)]
pub struct RiskManager {
    limits: RiskLimits,
}

impl RiskManager {
    pub fn new(limits: RiskLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    /// Closing intent if the position breached stop-loss, take-profit or the
    /// trailing stop at `price`. `watermark` is the best mark since entry.
    ///
    /// Evaluated every cycle for every held symbol, whatever the strategy says.
    pub fn forced_exit(&self, position: &Position, price: f64, watermark: Option<f64>) -> Option<TradeIntent> {
        let pnl_pct = position.unrealized_pnl_pct(price)?;

        let reason = if pnl_pct <= -self.limits.stop_loss_pct {
            IntentReason::StopLoss
        } else if pnl_pct >= self.limits.take_profit_pct {
            IntentReason::TakeProfit
        } else if self.trailing_stop_hit(position, price, watermark) {
            IntentReason::TrailingStop
        } else {
            return None;
        };

        let side = if position.quantity > 0.0 {
            Side::Sell
        } else {
            Side::Buy
        };

        tracing::warn!(
            symbol = %position.symbol,
            "{} triggered at {:.8}: {:+.2}% against cost {:.8}",
            reason,
            price,
            pnl_pct,
            position.average_cost
        );

        Some(TradeIntent::new(
            position.symbol.clone(),
            side,
            position.quantity.abs(),
            reason,
        ))
    }

    fn trailing_stop_hit(&self, position: &Position, price: f64, watermark: Option<f64>) -> bool {
        let Some(best) = watermark.filter(|b| *b > 0.0) else {
            return false;
        };
        if self.limits.trailing_stop_pct <= 0.0 {
            return false;
        }
        let given_back = (best - price) / best * 100.0 * position.quantity.signum();
        given_back >= self.limits.trailing_stop_pct
    }

    /// Review a strategy intent. Forced exits go through `review_exit` instead.
    ///
    /// In order: position size, open order count, clamping to the exchange's
    /// order size, no selling more than is held unless shorting is enabled.
    /// Unfilled orders on the intent's side count as if they had filled.
    pub fn review(
        &self,
        intent: TradeIntent,
        position: &Position,
        open: &OpenExposure,
        rules: &SymbolRules,
    ) -> RiskDecision {
        if intent.reason.is_forced_exit() {
            return self.review_exit(intent, rules);
        }

        let committed = position.quantity + intent.side.sign() * open.pending(intent.side);
        let projected = committed + intent.signed_quantity();
        if projected.abs() > self.limits.max_position_size + QTY_EPSILON {
            let reason = format!(
                "position {:.8} would exceed max_position_size {}",
                projected, self.limits.max_position_size
            );
            return reject(intent, reason);
        }

        if open.orders >= self.limits.max_open_orders {
            let reason = format!(
                "{} open orders on {} (max {})",
                open.orders, intent.symbol, self.limits.max_open_orders
            );
            return reject(intent, reason);
        }

        let mut quantity = intent.requested_quantity;
        if quantity <= 0.0 {
            return reject(intent, "non-positive quantity".to_string());
        }
        if quantity > rules.max_qty {
            quantity = rules.max_qty;
        }

        if intent.side == Side::Sell && !self.limits.allow_short {
            let held = committed.max(0.0);
            if held <= QTY_EPSILON {
                let reason = if open.sell_quantity > QTY_EPSILON {
                    format!(
                        "holding already committed to {:.8} in resting sells",
                        open.sell_quantity
                    )
                } else {
                    "nothing to sell and short selling disabled".to_string()
                };
                return reject(intent, reason);
            }
            quantity = quantity.min(held);
        }

        if quantity < rules.min_qty {
            quantity = rules.min_qty;
        }
        quantity = rules.round_quantity(quantity);
        if quantity <= QTY_EPSILON || quantity + QTY_EPSILON < rules.min_qty {
            let reason = format!(
                "quantity {:.8} below exchange minimum {}",
                intent.requested_quantity, rules.min_qty
            );
            return reject(intent, reason);
        }

        // clamping up to min_qty can push the position over the limit again
        let projected = committed + intent.side.sign() * quantity;
        if projected.abs() > self.limits.max_position_size + QTY_EPSILON {
            let reason = format!(
                "minimum order {:.8} would exceed max_position_size {}",
                quantity, self.limits.max_position_size
            );
            return reject(intent, reason);
        }
        if !self.limits.allow_short && projected < -QTY_EPSILON {
            return reject(intent, "minimum order size exceeds held quantity".to_string());
        }

        if (quantity - intent.requested_quantity).abs() > QTY_EPSILON {
            tracing::debug!(
                symbol = %intent.symbol,
                "Clamped {} {:.8} -> {:.8}",
                intent.side,
                intent.requested_quantity,
                quantity
            );
        }

        RiskDecision::Approved(TradeIntent {
            requested_quantity: quantity,
            ..intent
        })
    }

    /// Size a stop-loss or take-profit exit. Exempt from the position size
    /// and open order limits, since it only ever reduces exposure.
    pub fn review_exit(&self, intent: TradeIntent, rules: &SymbolRules) -> RiskDecision {
        let quantity = rules.round_quantity(intent.requested_quantity.min(rules.max_qty));
        if quantity <= QTY_EPSILON || quantity + QTY_EPSILON < rules.min_qty {
            let reason = format!(
                "{} exit of {:.8} is below exchange minimum {}",
                intent.reason, intent.requested_quantity, rules.min_qty
            );
            return reject(intent, reason);
        }

        RiskDecision::Approved(TradeIntent {
            requested_quantity: quantity,
            ..intent
        })
    }
}

fn reject(intent: TradeIntent, reason: String) -> RiskDecision {
    tracing::warn!(
        symbol = %intent.symbol,
        "Rejected {} {:.8}: {}",
        intent.side,
        intent.requested_quantity,
        Error::RiskViolation(reason.clone())
    );
    RiskDecision::Rejected { intent, reason }
}
