use crate::models::{Order, Position, PositionKey, QTY_EPSILON};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Account value after one replayed tick
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub equity: f64,
}

/// Outcome of one backtest run. Built once, never mutated afterwards.
///
/// Open positions are marked to the last tick price, not force-closed, so
/// `final_equity` includes their unrealized P&L.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestReport {
    pub strategy: String,
    pub ticks_processed: usize,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,

    pub initial_equity: f64,
    pub final_equity: f64,
    /// Percent
    pub total_return: f64,
    /// Largest peak-to-trough drop of the equity curve, in percent
    pub max_drawdown: f64,

    /// Percent of closing fills that realized a profit
    pub win_rate: f64,
    pub trade_count: usize,
    pub closed_trades: usize,
    pub winning_trades: usize,
    pub realized_pnl: f64,
    pub total_fees: f64,
    pub rejected_intents: usize,

    /// Orders with at least one fill, in the order they completed
    pub trade_log: Vec<Order>,
}

impl BacktestReport {
    pub fn compile(
        strategy: &str,
        initial_equity: f64,
        equity_curve: &[EquityPoint],
        orders: Vec<Order>,
        total_fees: f64,
        rejected_intents: usize,
    ) -> Self {
        let mut trade_log: Vec<Order> = orders
            .into_iter()
            .filter(|o| o.filled_quantity > QTY_EPSILON && o.average_fill_price.is_some())
            .collect();
        trade_log.sort_by(|a, b| {
            a.last_update
                .cmp(&b.last_update)
                .then_with(|| a.client_order_id.cmp(&b.client_order_id))
        });

        let (closed_trades, winning_trades, realized_pnl) = replay_fills(&trade_log);

        let final_equity = equity_curve
            .last()
            .map(|p| p.equity)
            .unwrap_or(initial_equity);
        let total_return = if initial_equity > 0.0 {
            (final_equity - initial_equity) / initial_equity * 100.0
        } else {
            0.0
        };
        let win_rate = if closed_trades > 0 {
            winning_trades as f64 / closed_trades as f64 * 100.0
        } else {
            0.0
        };

        Self {
            strategy: strategy.to_string(),
            ticks_processed: equity_curve.len(),
            start: equity_curve.first().map(|p| p.timestamp),
            end: equity_curve.last().map(|p| p.timestamp),
            initial_equity,
            final_equity,
            total_return,
            max_drawdown: max_drawdown_pct(initial_equity, equity_curve),
            win_rate,
            trade_count: trade_log.len(),
            closed_trades,
            winning_trades,
            realized_pnl,
            total_fees,
            rejected_intents,
            trade_log,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Print a formatted report to stdout
    pub fn print_report(&self) {
        println!("\n========================================================");
        println!("               BACKTEST PERFORMANCE REPORT");
        println!("========================================================\n");

        println!("Strategy:              {}", self.strategy);
        if let (Some(start), Some(end)) = (self.start, self.end) {
            println!("Period:                {} -> {}", start, end);
        }
        println!("Ticks:                 {}", self.ticks_processed);

        println!("\nP&L SUMMARY");
        println!("  Initial Equity:      ${:.2}", self.initial_equity);
        println!("  Final Equity:        ${:.2}", self.final_equity);
        println!("  Total Return:        {:+.2}%", self.total_return);
        println!("  Realized P&L:        ${:.2}", self.realized_pnl);
        println!("  Fees:                ${:.2}", self.total_fees);

        println!("\nTRADE STATISTICS");
        println!("  Filled Orders:       {}", self.trade_count);
        println!("  Closing Trades:      {}", self.closed_trades);
        println!(
            "  Winning Trades:      {} ({:.1}%)",
            self.winning_trades, self.win_rate
        );
        println!("  Rejected Intents:    {}", self.rejected_intents);

        println!("\nRISK");
        println!("  Max Drawdown:        {:.2}%", self.max_drawdown);

        if !self.trade_log.is_empty() {
            println!("\nTRADE LOG");
            for order in &self.trade_log {
                println!(
                    "  {}  {:<4} {:>12.6} {:<10} @ {:>12.4}  {}",
                    order.last_update.format("%Y-%m-%d %H:%M"),
                    order.side,
                    order.filled_quantity,
                    order.symbol,
                    order.average_fill_price.unwrap_or(0.0),
                    order.reason
                );
            }
        }

        println!("\n========================================================\n");
    }
}

/// Replay filled orders per symbol, counting fills that closed exposure.
/// Returns (closed, winning, realized P&L). Every fill in the log already
/// happened on the exchange, so none is refused.
fn replay_fills(trade_log: &[Order]) -> (usize, usize, f64) {
    let mut positions: BTreeMap<String, Position> = BTreeMap::new();
    let mut closed = 0;
    let mut winning = 0;
    let mut realized_total = 0.0;

    for order in trade_log {
        let Some(price) = order.average_fill_price else {
            continue;
        };
        let position = positions.entry(order.symbol.clone()).or_insert_with(|| {
            Position::flat(&PositionKey::new("", &order.exchange, &order.symbol))
        });

        let reduces = !position.is_flat() && position.quantity.signum() != order.side.sign();
        match position.apply_fill(order.side, order.filled_quantity, price, true) {
            Ok(realized) => {
                if reduces {
                    closed += 1;
                    if realized > 0.0 {
                        winning += 1;
                    }
                }
                realized_total += realized;
            }
            Err(e) => {
                tracing::warn!(order_id = %order.display_id(), "Skipping fill in report: {}", e);
            }
        }
    }

    (closed, winning, realized_total)
}

fn max_drawdown_pct(initial_equity: f64, curve: &[EquityPoint]) -> f64 {
    let mut peak = initial_equity;
    let mut max_dd = 0.0;

    for point in curve {
        if point.equity > peak {
            peak = point.equity;
        }
        if peak > 0.0 {
            let dd = (peak - point.equity) / peak * 100.0;
            if dd > max_dd {
                max_dd = dd;
            }
        }
    }

    max_dd
}
