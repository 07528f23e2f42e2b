use super::ExchangeAdapter;
use crate::backtest::fill_model::{FillModel, ImmediateFillModel};
use crate::error::Error;
use crate::execution::clock::Clock;
use crate::models::{
    IntentReason, Order, OrderSpec, OrderState, Side, SymbolRules, Tick, TimeRange, QTY_EPSILON,
};
use crate::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

/// Adapter calls that can have failures injected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaperOp {
    FetchPrice,
    FetchBalance,
    PlaceOrder,
    CancelOrder,
    FetchOrderStatus,
    FetchHistory,
}

#[derive(Default)]
struct PaperState {
    marks: HashMap<String, Tick>,
    history: HashMap<String, Vec<Tick>>,
    balances: HashMap<String, f64>,
    rules: HashMap<String, SymbolRules>,
    orders: BTreeMap<String, Order>,
    by_client_id: HashMap<String, String>,
    next_id: u64,
    faults: HashMap<PaperOp, VecDeque<Error>>,
    hold_fills: bool,
    fees_paid: f64,
}

/// In-memory exchange for paper trading, tests and backtests.
///
/// Orders match against the last mark set with `set_mark`, using a
/// `FillModel`. Base-asset holdings are kept under the symbol name, cash
/// under the quote asset. Open orders reserve the balance they would spend.
pub struct PaperExchange {
    name: String,
    quote_asset: String,
    fee_pct: f64,
    allow_short: bool,
    clock: Arc<dyn Clock>,
    fill_model: Arc<dyn FillModel>,
    default_rules: SymbolRules,
    price_source: Option<Arc<dyn ExchangeAdapter>>,
    state: Mutex<PaperState>,
}

impl PaperExchange {
    pub fn new(name: &str, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.to_string(),
            quote_asset: "USD".to_string(),
            fee_pct: 0.0,
            allow_short: false,
            clock,
            fill_model: Arc::new(ImmediateFillModel),
            default_rules: SymbolRules::unrestricted(),
            price_source: None,
            state: Mutex::new(PaperState::default()),
        }
    }

    pub fn with_fill_model(mut self, model: Arc<dyn FillModel>) -> Self {
        self.fill_model = model;
        self
    }

    /// Fee charged on notional, in percent
    pub fn with_fee_pct(mut self, fee_pct: f64) -> Self {
        self.fee_pct = fee_pct;
        self
    }

    /// Let sells take the base balance negative, as long as the short is
    /// covered by free quote cash
    pub fn with_short_selling(mut self, allow: bool) -> Self {
        self.allow_short = allow;
        self
    }

    pub fn with_quote_asset(mut self, asset: &str) -> Self {
        self.quote_asset = asset.to_string();
        self
    }

    pub fn with_default_rules(mut self, rules: SymbolRules) -> Self {
        self.default_rules = rules;
        self
    }

    /// Take prices, history and symbol rules from a real exchange; orders stay simulated
    pub fn with_price_source(mut self, source: Arc<dyn ExchangeAdapter>) -> Self {
        self.price_source = Some(source);
        self
    }

    fn state(&self) -> MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn quote_asset(&self) -> &str {
        &self.quote_asset
    }

    pub fn set_rules(&self, symbol: &str, rules: SymbolRules) {
        self.state().rules.insert(symbol.to_string(), rules);
    }

    pub fn deposit(&self, asset: &str, amount: f64) {
        *self.state().balances.entry(asset.to_string()).or_insert(0.0) += amount;
    }

    pub fn balance(&self, asset: &str) -> f64 {
        self.state().balances.get(asset).copied().unwrap_or(0.0)
    }

    pub fn fees_paid(&self) -> f64 {
        self.state().fees_paid
    }

    /// While held, resting orders never match; `force_fill` still works.
    pub fn hold_fills(&self, hold: bool) {
        self.state().hold_fills = hold;
    }

    /// The next call of `op` fails with `error`. Queued per operation.
    pub fn fail_next(&self, op: PaperOp, error: Error) {
        self.state().faults.entry(op).or_default().push_back(error);
    }

    /// Append ticks to the historical series served by `fetch_history`
    pub fn load_history(&self, mut ticks: Vec<Tick>) {
        ticks.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        let mut state = self.state();
        for tick in ticks {
            state
                .history
                .entry(tick.symbol.clone())
                .or_default()
                .push(tick);
        }
    }

    /// Publish a new mark price and match resting orders against it
    pub fn set_mark(&self, tick: Tick) {
        let mut state = self.state();
        state.marks.insert(tick.symbol.clone(), tick.clone());

        if state.hold_fills {
            return;
        }

        let resting: Vec<String> = state
            .orders
            .values()
            .filter(|o| o.symbol == tick.symbol && o.state.is_open())
            .map(|o| o.order_id.clone())
            .collect();

        for order_id in resting {
            self.try_match(&mut state, &order_id, tick.price);
        }
    }

    /// Fill part or all of an order as if the exchange matched it now
    pub fn force_fill(&self, order_id: &str, quantity: f64, price: f64) -> Result<()> {
        let mut state = self.state();
        if !state.orders.contains_key(order_id) {
            return Err(Error::Permanent(format!("unknown order {}", order_id)));
        }
        self.fill(&mut state, order_id, quantity, price);
        Ok(())
    }

    pub fn order(&self, order_id: &str) -> Option<Order> {
        self.state().orders.get(order_id).cloned()
    }

    pub fn orders(&self) -> Vec<Order> {
        self.state().orders.values().cloned().collect()
    }

    fn take_fault(&self, op: PaperOp) -> Result<()> {
        match self.state().faults.get_mut(&op).and_then(|q| q.pop_front()) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Quote cash held by open buys, and base held by open sells on `symbol`
    fn reserved(&self, state: &PaperState, symbol: &str) -> (f64, f64) {
        let fee = 1.0 + self.fee_pct / 100.0;
        let mut quote = 0.0;
        let mut base = 0.0;
        for order in state.orders.values().filter(|o| o.state.is_open()) {
            let remaining = order.remaining_quantity();
            match order.side {
                Side::Buy => {
                    let price = order
                        .kind
                        .limit_price()
                        .or_else(|| state.marks.get(&order.symbol).map(|t| t.price))
                        .unwrap_or(0.0);
                    quote += remaining * price * fee;
                }
                Side::Sell if order.symbol == symbol => base += remaining,
                Side::Sell => {}
            }
        }
        (quote, base)
    }

    fn try_match(&self, state: &mut PaperState, order_id: &str, mark: f64) {
        let Some(order) = state.orders.get(order_id) else {
            return;
        };
        if !order.state.is_open() {
            return;
        }
        if let Some(price) = self.fill_model.fill_price(order.side, &order.kind, mark) {
            let remaining = order.remaining_quantity();
            self.fill(state, order_id, remaining, price);
        }
    }

    fn fill(&self, state: &mut PaperState, order_id: &str, quantity: f64, price: f64) {
        let now = self.clock.now();
        let fee_rate = self.fee_pct / 100.0;
        let quote = self.quote_asset.clone();

        let Some(order) = state.orders.get_mut(order_id) else {
            return;
        };
        let quantity = quantity.min(order.remaining_quantity());
        if quantity <= QTY_EPSILON {
            return;
        }

        let notional = quantity * price;
        let fee = notional * fee_rate;
        let previous_notional = order.average_fill_price.unwrap_or(0.0) * order.filled_quantity;
        order.filled_quantity += quantity;
        order.average_fill_price = Some((previous_notional + notional) / order.filled_quantity);
        order.state = if order.is_fully_filled() {
            OrderState::Filled
        } else {
            OrderState::PartiallyFilled
        };
        order.last_update = now;

        let side = order.side;
        let symbol = order.symbol.clone();

        let (quote_delta, base_delta) = match side {
            Side::Buy => (-(notional + fee), quantity),
            Side::Sell => (notional - fee, -quantity),
        };
        *state.balances.entry(quote).or_insert(0.0) += quote_delta;
        *state.balances.entry(symbol).or_insert(0.0) += base_delta;
        state.fees_paid += fee;
    }
}

#[async_trait]
impl ExchangeAdapter for PaperExchange {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_price(&self, symbol: &str) -> Result<Tick> {
        self.take_fault(PaperOp::FetchPrice)?;
        if let Some(source) = &self.price_source {
            let tick = source.fetch_price(symbol).await?;
            self.set_mark(tick.clone());
            return Ok(tick);
        }
        self.state()
            .marks
            .get(symbol)
            .cloned()
            .ok_or_else(|| Error::Permanent(format!("unknown symbol {}", symbol)))
    }

    async fn fetch_balance(&self, asset: &str) -> Result<f64> {
        self.take_fault(PaperOp::FetchBalance)?;
        Ok(self.balance(asset))
    }

    async fn place_order(&self, spec: &OrderSpec) -> Result<String> {
        self.take_fault(PaperOp::PlaceOrder)?;
        let mut state = self.state();

        if let Some(existing) = state.by_client_id.get(&spec.client_order_id) {
            return Ok(existing.clone());
        }

        let rules = state
            .rules
            .get(&spec.symbol)
            .copied()
            .unwrap_or(self.default_rules);
        if spec.quantity <= 0.0 || spec.quantity + QTY_EPSILON < rules.min_qty {
            return Err(Error::Permanent(format!(
                "quantity {} below minimum {} for {}",
                spec.quantity, rules.min_qty, spec.symbol
            )));
        }
        if spec.quantity > rules.max_qty + QTY_EPSILON {
            return Err(Error::Permanent(format!(
                "quantity {} above maximum {} for {}",
                spec.quantity, rules.max_qty, spec.symbol
            )));
        }

        let mark = state
            .marks
            .get(&spec.symbol)
            .map(|t| t.price)
            .ok_or_else(|| Error::Permanent(format!("unknown symbol {}", spec.symbol)))?;

        let price = spec.kind.limit_price().unwrap_or(mark);
        let (reserved_quote, reserved_base) = self.reserved(&state, &spec.symbol);
        let cash = state.balances.get(&self.quote_asset).copied().unwrap_or(0.0) - reserved_quote;
        match spec.side {
            Side::Buy => {
                let cost = spec.quantity * price * (1.0 + self.fee_pct / 100.0);
                if cost > cash + QTY_EPSILON {
                    return Err(Error::Permanent(format!(
                        "insufficient funds: need {:.2} {}, have {:.2} free",
                        cost, self.quote_asset, cash
                    )));
                }
            }
            Side::Sell => {
                let held = state.balances.get(&spec.symbol).copied().unwrap_or(0.0);
                let available = held - reserved_base;
                let after = available - spec.quantity;
                if after < -QTY_EPSILON {
                    if !self.allow_short {
                        return Err(Error::Permanent(format!(
                            "insufficient balance: selling {} {}, have {} ({} reserved)",
                            spec.quantity, spec.symbol, held, reserved_base
                        )));
                    }
                    let margin = -after * price;
                    if margin > cash + QTY_EPSILON {
                        return Err(Error::Permanent(format!(
                            "insufficient margin: short of {:.8} {} needs {:.2} {}, have {:.2} free",
                            -after, spec.symbol, margin, self.quote_asset, cash
                        )));
                    }
                }
            }
        }

        state.next_id += 1;
        let order_id = format!("{}-{:06}", self.name, state.next_id);
        let now = self.clock.now();
        let order = Order {
            order_id: order_id.clone(),
            client_order_id: spec.client_order_id.clone(),
            exchange: self.name.clone(),
            symbol: spec.symbol.clone(),
            side: spec.side,
            quantity: spec.quantity,
            kind: spec.kind,
            state: OrderState::Submitted,
            filled_quantity: 0.0,
            average_fill_price: None,
            reason: IntentReason::Strategy("paper".to_string()),
            created_at: now,
            last_update: now,
        };
        state.orders.insert(order_id.clone(), order);
        state
            .by_client_id
            .insert(spec.client_order_id.clone(), order_id.clone());

        if !state.hold_fills {
            self.try_match(&mut state, &order_id, mark);
        }

        Ok(order_id)
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> Result<bool> {
        self.take_fault(PaperOp::CancelOrder)?;
        let now = self.clock.now();
        let mut state = self.state();
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| Error::Permanent(format!("unknown order {}", order_id)))?;

        if order.state.is_open() {
            order.state = OrderState::Cancelled;
            order.last_update = now;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn fetch_order_status(&self, _symbol: &str, order_id: &str) -> Result<Order> {
        self.take_fault(PaperOp::FetchOrderStatus)?;
        self.order(order_id)
            .ok_or_else(|| Error::Permanent(format!("unknown order {}", order_id)))
    }

    async fn fetch_history(&self, symbol: &str, range: &TimeRange) -> Result<Vec<Tick>> {
        self.take_fault(PaperOp::FetchHistory)?;
        if let Some(source) = &self.price_source {
            return source.fetch_history(symbol, range).await;
        }
        Ok(self
            .state()
            .history
            .get(symbol)
            .map(|ticks| {
                ticks
                    .iter()
                    .filter(|t| range.contains(t.timestamp))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn symbol_rules(&self, symbol: &str) -> Result<SymbolRules> {
        if let Some(source) = &self.price_source {
            let rules = source.symbol_rules(symbol).await?;
            self.set_rules(symbol, rules);
            return Ok(rules);
        }
        Ok(self
            .state()
            .rules
            .get(symbol)
            .copied()
            .unwrap_or(self.default_rules))
    }
}
