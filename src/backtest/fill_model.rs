use crate::models::{OrderKind, Side};

/// Decides whether, and at what price, a simulated order fills against a tick
pub trait FillModel: Send + Sync {
    fn fill_price(&self, side: Side, kind: &OrderKind, tick_price: f64) -> Option<f64>;
}

/// Market orders fill at the tick price; limit orders fill at their limit
/// once the tick price crosses it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateFillModel;

impl FillModel for ImmediateFillModel {
    fn fill_price(&self, side: Side, kind: &OrderKind, tick_price: f64) -> Option<f64> {
        match kind {
            OrderKind::Market => Some(tick_price),
            OrderKind::Limit { price } => crosses(side, *price, tick_price).then_some(*price),
        }
    }
}

/// Like `ImmediateFillModel`, but market orders pay a fixed slippage
#[derive(Debug, Clone, Copy)]
pub struct SlippageFillModel {
    pub slippage_bps: f64,
}

impl FillModel for SlippageFillModel {
    fn fill_price(&self, side: Side, kind: &OrderKind, tick_price: f64) -> Option<f64> {
        match kind {
            OrderKind::Market => {
                let slip = tick_price * self.slippage_bps / 10_000.0;
                Some(tick_price + side.sign() * slip)
            }
            OrderKind::Limit { price } => crosses(side, *price, tick_price).then_some(*price),
        }
    }
}

fn crosses(side: Side, limit: f64, tick_price: f64) -> bool {
    match side {
        Side::Buy => tick_price <= limit,
        Side::Sell => tick_price >= limit,
    }
}
