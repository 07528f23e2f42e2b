use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Error;
use crate::Result;

/// Quantities closer than this are treated as equal.
pub const QTY_EPSILON: f64 = 1e-9;

/// One market data sample. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tick {
    pub exchange: String,
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn sign(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Why an intent exists. Risk exits are not strategy-gated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum IntentReason {
    Strategy(String),
    StopLoss,
    TakeProfit,
    TrailingStop,
}

impl IntentReason {
    pub fn is_forced_exit(&self) -> bool {
        matches!(
            self,
            IntentReason::StopLoss | IntentReason::TakeProfit | IntentReason::TrailingStop
        )
    }
}

impl fmt::Display for IntentReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntentReason::Strategy(why) => write!(f, "strategy: {}", why),
            IntentReason::StopLoss => write!(f, "stop-loss"),
            IntentReason::TakeProfit => write!(f, "take-profit"),
            IntentReason::TrailingStop => write!(f, "trailing-stop"),
        }
    }
}

/// A proposed trade before risk approval
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradeIntent {
    pub symbol: String,
    pub side: Side,
    pub requested_quantity: f64,
    pub reason: IntentReason,
}

impl TradeIntent {
    pub fn new(symbol: impl Into<String>, side: Side, quantity: f64, reason: IntentReason) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            requested_quantity: quantity,
            reason,
        }
    }

    pub fn buy(symbol: impl Into<String>, quantity: f64, why: &str) -> Self {
        Self::new(symbol, Side::Buy, quantity, IntentReason::Strategy(why.to_string()))
    }

    pub fn sell(symbol: impl Into<String>, quantity: f64, why: &str) -> Self {
        Self::new(symbol, Side::Sell, quantity, IntentReason::Strategy(why.to_string()))
    }

    pub fn signed_quantity(&self) -> f64 {
        self.side.sign() * self.requested_quantity
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum OrderKind {
    Market,
    Limit { price: f64 },
}

impl OrderKind {
    pub fn limit_price(&self) -> Option<f64> {
        match self {
            OrderKind::Market => None,
            OrderKind::Limit { price } => Some(*price),
        }
    }
}

/// What the engine asks an adapter to place
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderSpec {
    /// Resubmitting the same client id must never create a second order.
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub kind: OrderKind,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OrderState {
    Pending,
    Submitted,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Cancelled | OrderState::Rejected | OrderState::Expired
        )
    }

    pub fn is_open(&self) -> bool {
        matches!(self, OrderState::Submitted | OrderState::PartiallyFilled)
    }

    pub fn can_transition_to(&self, next: OrderState) -> bool {
        use OrderState::*;
        matches!(
            (self, next),
            (Pending, Submitted)
                | (Pending, Rejected)
                | (Submitted, PartiallyFilled)
                | (Submitted, Filled)
                | (Submitted, Cancelled)
                | (Submitted, Rejected)
                | (Submitted, Expired)
                | (PartiallyFilled, PartiallyFilled)
                | (PartiallyFilled, Filled)
                | (PartiallyFilled, Cancelled)
                | (PartiallyFilled, Expired)
        )
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OrderState::Pending => "Pending",
            OrderState::Submitted => "Submitted",
            OrderState::PartiallyFilled => "PartiallyFilled",
            OrderState::Filled => "Filled",
            OrderState::Cancelled => "Cancelled",
            OrderState::Rejected => "Rejected",
            OrderState::Expired => "Expired",
        };
        write!(f, "{}", name)
    }
}

/// An exchange order as tracked by the engine, or as reported by an adapter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    /// Exchange-assigned; empty until the order is Submitted.
    pub order_id: String,
    pub client_order_id: String,
    pub exchange: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub kind: OrderKind,
    pub state: OrderState,
    /// Cumulative, as reported by the exchange.
    pub filled_quantity: f64,
    pub average_fill_price: Option<f64>,
    pub reason: IntentReason,
    pub created_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl Order {
    pub fn pending(
        client_order_id: String,
        exchange: &str,
        intent: &TradeIntent,
        kind: OrderKind,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            order_id: String::new(),
            client_order_id,
            exchange: exchange.to_string(),
            symbol: intent.symbol.clone(),
            side: intent.side,
            quantity: intent.requested_quantity,
            kind,
            state: OrderState::Pending,
            filled_quantity: 0.0,
            average_fill_price: None,
            reason: intent.reason.clone(),
            created_at: now,
            last_update: now,
        }
    }

    pub fn spec(&self) -> OrderSpec {
        OrderSpec {
            client_order_id: self.client_order_id.clone(),
            symbol: self.symbol.clone(),
            side: self.side,
            quantity: self.quantity,
            kind: self.kind,
        }
    }

    pub fn remaining_quantity(&self) -> f64 {
        (self.quantity - self.filled_quantity).max(0.0)
    }

    pub fn is_fully_filled(&self) -> bool {
        self.filled_quantity + QTY_EPSILON >= self.quantity
    }

    /// Move to `next`, refusing anything the lifecycle does not allow.
    pub fn transition(&mut self, next: OrderState, at: DateTime<Utc>) -> Result<()> {
        if self.state == next && next == OrderState::PartiallyFilled {
            self.last_update = at;
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                order_id: self.display_id().to_string(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.last_update = at;
        Ok(())
    }

    pub fn display_id(&self) -> &str {
        if self.order_id.is_empty() {
            &self.client_order_id
        } else {
            &self.order_id
        }
    }
}

/// Unfilled quantity resting on one symbol, per side
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct OpenExposure {
    pub orders: usize,
    pub buy_quantity: f64,
    pub sell_quantity: f64,
}

impl OpenExposure {
    pub fn add(&mut self, side: Side, quantity: f64) {
        self.orders += 1;
        match side {
            Side::Buy => self.buy_quantity += quantity,
            Side::Sell => self.sell_quantity += quantity,
        }
    }

    pub fn pending(&self, side: Side) -> f64 {
        match side {
            Side::Buy => self.buy_quantity,
            Side::Sell => self.sell_quantity,
        }
    }
}

/// Identifies one ledger entry. Locking is per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PositionKey {
    pub wallet_id: String,
    pub exchange: String,
    pub symbol: String,
}

impl PositionKey {
    pub fn new(wallet_id: &str, exchange: &str, symbol: &str) -> Self {
        Self {
            wallet_id: wallet_id.to_string(),
            exchange: exchange.to_string(),
            symbol: symbol.to_string(),
        }
    }
}

impl fmt::Display for PositionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.wallet_id, self.exchange, self.symbol)
    }
}

/// Holdings for one wallet/exchange/symbol
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub wallet_id: String,
    pub exchange: String,
    pub symbol: String,
    /// Negative only when short selling is enabled.
    pub quantity: f64,
    pub average_cost: f64,
    pub realized_pnl: f64,
}

impl Position {
    pub fn flat(key: &PositionKey) -> Self {
        Self {
            wallet_id: key.wallet_id.clone(),
            exchange: key.exchange.clone(),
            symbol: key.symbol.clone(),
            quantity: 0.0,
            average_cost: 0.0,
            realized_pnl: 0.0,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.quantity.abs() < QTY_EPSILON
    }

    /// Apply one confirmed fill and return the P&L it realized.
    ///
    /// Quantity and average cost change together or not at all.
    pub fn apply_fill(&mut self, side: Side, quantity: f64, price: f64, allow_short: bool) -> Result<f64> {
        if quantity <= 0.0 || !quantity.is_finite() || price <= 0.0 || !price.is_finite() {
            return Err(Error::Permanent(format!(
                "invalid fill {} {} @ {}",
                side, quantity, price
            )));
        }

        let signed = side.sign() * quantity;
        let previous = self.quantity;
        let mut next = previous + signed;
        if next.abs() < QTY_EPSILON {
            next = 0.0;
        }

        if next < 0.0 && !allow_short {
            return Err(Error::RiskViolation(format!(
                "fill {} {} on {} would leave position at {:.8}; short selling disabled",
                side, quantity, self.symbol, next
            )));
        }

        let mut realized = 0.0;
        let same_direction = previous.abs() < QTY_EPSILON || previous.signum() == signed.signum();
        let next_cost = if same_direction {
            (self.average_cost * previous.abs() + price * quantity) / next.abs()
        } else {
            let closed = quantity.min(previous.abs());
            realized = (price - self.average_cost) * closed * previous.signum();
            if next == 0.0 {
                0.0
            } else if next.signum() == previous.signum() {
                self.average_cost
            } else {
                // flipped through zero, remainder opened at the fill price
                price
            }
        };

        self.quantity = next;
        self.average_cost = next_cost;
        self.realized_pnl += realized;
        Ok(realized)
    }

    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        if self.is_flat() {
            return 0.0;
        }
        (price - self.average_cost) * self.quantity
    }

    /// Unrealized gain in percent of cost; negative for a loss
    pub fn unrealized_pnl_pct(&self, price: f64) -> Option<f64> {
        if self.is_flat() || self.average_cost <= 0.0 {
            return None;
        }
        let move_pct = (price - self.average_cost) / self.average_cost * 100.0;
        Some(move_pct * self.quantity.signum())
    }
}

/// Exchange order size constraints for one symbol
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SymbolRules {
    pub min_qty: f64,
    pub max_qty: f64,
    pub step_size: f64,
    pub tick_size: f64,
}

impl SymbolRules {
    pub fn unrestricted() -> Self {
        Self {
            min_qty: 0.0,
            max_qty: f64::MAX,
            step_size: 0.0,
            tick_size: 0.0,
        }
    }

    /// Round a quantity down to the exchange's lot step
    pub fn round_quantity(&self, quantity: f64) -> f64 {
        if self.step_size <= 0.0 {
            return quantity;
        }
        let steps = (quantity / self.step_size + QTY_EPSILON).floor();
        steps * self.step_size
    }

    pub fn round_price(&self, price: f64) -> f64 {
        if self.tick_size <= 0.0 {
            return price;
        }
        (price / self.tick_size).round() * self.tick_size
    }
}

impl Default for SymbolRules {
    fn default() -> Self {
        Self::unrestricted()
    }
}

/// Inclusive time range for historical queries
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at <= self.end
    }
}
