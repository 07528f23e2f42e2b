use crate::models::Position;
use std::collections::BTreeMap;

/// Equity high-water mark for one wallet on one exchange.
///
/// While equity sits `max_drawdown_pct` or more below the peak, new
/// entries are halted. The halt lifts once equity recovers.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawdownGuard {
    max_drawdown_pct: f64,
    peak: f64,
    halted: bool,
}

impl DrawdownGuard {
    pub fn new(max_drawdown_pct: f64, starting_equity: f64) -> Self {
        Self {
            max_drawdown_pct,
            peak: starting_equity,
            halted: false,
        }
    }

    pub fn peak(&self) -> f64 {
        self.peak
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Current drawdown from the peak, in percent
    pub fn drawdown_pct(&self, equity: f64) -> f64 {
        if self.peak <= 0.0 {
            return 0.0;
        }
        ((self.peak - equity) / self.peak * 100.0).max(0.0)
    }

    /// Record the latest equity; true while trading is halted
    pub fn update(&mut self, equity: f64) -> bool {
        if self.max_drawdown_pct <= 0.0 {
            return false;
        }
        if equity > self.peak {
            self.peak = equity;
        }

        let drawdown = self.drawdown_pct(equity);
        let halted = drawdown >= self.max_drawdown_pct;
        if halted && !self.halted {
            tracing::warn!(
                "Max drawdown reached: equity {:.2} is {:.2}% below peak {:.2}, halting new entries",
                equity,
                drawdown,
                self.peak
            );
        } else if !halted && self.halted {
            tracing::info!("Drawdown back to {:.2}%, entries resumed", drawdown);
        }
        self.halted = halted;
        halted
    }
}

/// Best mark seen per open position, for trailing stops.
///
/// Longs track the highest price, shorts the lowest. A symbol's mark resets
/// when its position goes flat or changes direction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriceWatermarks {
    marks: BTreeMap<String, (f64, f64)>,
}

impl PriceWatermarks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold `price` into the position's watermark and return it
    pub fn update(&mut self, position: &Position, price: f64) -> Option<f64> {
        if position.is_flat() {
            self.marks.remove(&position.symbol);
            return None;
        }

        let direction = position.quantity.signum();
        let entry = self
            .marks
            .entry(position.symbol.clone())
            .or_insert((direction, position.average_cost));
        if entry.0 != direction {
            *entry = (direction, position.average_cost);
        }

        entry.1 = if direction > 0.0 {
            entry.1.max(price)
        } else {
            entry.1.min(price)
        };
        Some(entry.1)
    }

    pub fn get(&self, symbol: &str) -> Option<f64> {
        self.marks.get(symbol).map(|(_, best)| *best)
    }

    /// Drop every symbol not in `held`
    pub fn retain(&mut self, held: impl Fn(&str) -> bool) {
        self.marks.retain(|symbol, _| held(symbol.as_str()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PositionKey, Side};

    fn position(side: Side, quantity: f64, cost: f64) -> Position {
        let mut position = Position::flat(&PositionKey::new("main", "paper", "BTCUSDT"));
        position.apply_fill(side, quantity, cost, true).unwrap();
        position
    }

    #[test]
    fn test_drawdown_halts_and_recovers() {
        let mut guard = DrawdownGuard::new(20.0, 10_000.0);

        assert!(!guard.update(12_000.0));
        assert_eq!(guard.peak(), 12_000.0);

        // 12000 -> 9000 is a 25% drawdown
        assert!(guard.update(9_000.0));
        assert!(guard.is_halted());
        assert!((guard.drawdown_pct(9_000.0) - 25.0).abs() < 1e-9);

        assert!(!guard.update(10_000.0));
        assert!(!guard.is_halted());
    }

    #[test]
    fn test_disabled_guard_never_halts() {
        let mut guard = DrawdownGuard::new(0.0, 10_000.0);
        assert!(!guard.update(1.0));
    }

    #[test]
    fn test_long_watermark_only_rises() {
        let mut marks = PriceWatermarks::new();
        let long = position(Side::Buy, 1.0, 100.0);

        assert_eq!(marks.update(&long, 98.0), Some(100.0));
        assert_eq!(marks.update(&long, 110.0), Some(110.0));
        assert_eq!(marks.update(&long, 104.0), Some(110.0));
    }

    #[test]
    fn test_short_watermark_tracks_the_low() {
        let mut marks = PriceWatermarks::new();
        let short = position(Side::Sell, 1.0, 100.0);

        assert_eq!(marks.update(&short, 95.0), Some(95.0));
        assert_eq!(marks.update(&short, 99.0), Some(95.0));
    }

    #[test]
    fn test_watermark_resets_when_flat() {
        let mut marks = PriceWatermarks::new();
        marks.update(&position(Side::Buy, 1.0, 100.0), 120.0);

        let flat = Position::flat(&PositionKey::new("main", "paper", "BTCUSDT"));
        assert_eq!(marks.update(&flat, 90.0), None);
        assert_eq!(marks.get("BTCUSDT"), None);

        assert_eq!(marks.update(&position(Side::Buy, 1.0, 90.0), 91.0), Some(91.0));
    }
}
