use super::clock::Clock;
use super::ledger::{PositionLedger, PositionSnapshot, SymbolBook};
use crate::api::ExchangeAdapter;
use crate::config::{EngineConfig, OrderType};
use crate::error::Error;
use crate::models::{
    Order, OrderKind, OrderState, PositionKey, SymbolRules, TradeIntent, QTY_EPSILON,
};
use crate::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Sequential client order ids under a fixed prefix
#[derive(Debug)]
pub struct ClientIdGenerator {
    prefix: String,
    next: AtomicU64,
}

impl ClientIdGenerator {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            next: AtomicU64::new(1),
        }
    }

    /// Unique per process start, for live trading
    pub fn random() -> Self {
        let session = uuid::Uuid::new_v4().simple().to_string();
        Self::new(&session[..12])
    }

    pub fn next_id(&self) -> String {
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}-{:06}", self.prefix, seq)
    }
}

/// What applying an exchange report did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// Nothing new
    Unchanged,
    /// An open order moved forward; the ledger took any new fill
    Advanced(OrderState),
    /// A closed order turned out to have filled after all
    Reconciled {
        previous: OrderState,
        current: OrderState,
    },
    /// A report for a closed order that was already fully applied
    Duplicate,
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub refreshed: usize,
    pub expired: usize,
    pub reconciled: usize,
    pub errors: usize,
}

/// Turns approved intents into exchange orders for one wallet on one
/// exchange, and keeps the ledger in step with what the exchange reports.
///
/// Every order state change and the ledger update it causes happen under
/// the ledger's per-symbol lock.
pub struct OrderLifecycleEngine {
    wallet_id: String,
    exchange: String,
    adapter: Arc<dyn ExchangeAdapter>,
    ledger: PositionLedger,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    ids: ClientIdGenerator,
}

impl OrderLifecycleEngine {
    pub fn new(
        wallet_id: &str,
        adapter: Arc<dyn ExchangeAdapter>,
        ledger: PositionLedger,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
        ids: ClientIdGenerator,
    ) -> Self {
        Self {
            wallet_id: wallet_id.to_string(),
            exchange: adapter.name().to_string(),
            adapter,
            ledger,
            clock,
            config,
            ids,
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn wallet_id(&self) -> &str {
        &self.wallet_id
    }

    pub fn adapter(&self) -> &Arc<dyn ExchangeAdapter> {
        &self.adapter
    }

    pub fn ledger(&self) -> &PositionLedger {
        &self.ledger
    }

    pub fn key(&self, symbol: &str) -> PositionKey {
        PositionKey::new(&self.wallet_id, &self.exchange, symbol)
    }

    pub async fn snapshot(&self) -> PositionSnapshot {
        self.ledger.snapshot(&self.wallet_id, &self.exchange).await
    }

    pub async fn open_orders(&self, symbol: &str) -> Vec<Order> {
        let book = self.ledger.lock(&self.key(symbol)).await;
        book.open_orders().map(|o| o.order.clone()).collect()
    }

    pub async fn order_history(&self) -> Vec<Order> {
        self.ledger
            .order_history(&self.wallet_id, &self.exchange)
            .await
    }

    /// Place an order for an approved intent, choosing market or limit from
    /// the engine config.
    ///
    /// Stop-loss and take-profit exits always go out at market, after
    /// cancelling anything else still open on the symbol. Returns `None`
    /// when there was nothing left to do.
    pub async fn execute(
        &self,
        intent: &TradeIntent,
        mark: Option<f64>,
        rules: &SymbolRules,
    ) -> Result<Option<Order>> {
        if intent.reason.is_forced_exit() {
            return self.execute_exit(intent, rules).await;
        }

        let kind = match (self.config.order_type, mark) {
            (OrderType::Limit, Some(mark)) => {
                let offset = mark * self.config.limit_offset_bps / 10_000.0;
                OrderKind::Limit {
                    price: rules.round_price(mark - intent.side.sign() * offset),
                }
            }
            _ => OrderKind::Market,
        };

        self.submit(intent, kind).await.map(Some)
    }

    async fn execute_exit(&self, intent: &TradeIntent, rules: &SymbolRules) -> Result<Option<Order>> {
        let open = self.open_orders(&intent.symbol).await;
        if open.iter().any(|o| o.reason.is_forced_exit()) {
            tracing::debug!(symbol = %intent.symbol, "Exit already working, skipping");
            return Ok(None);
        }

        for order in open {
            if let Err(e) = self.cancel(&order.symbol, &order.order_id).await {
                tracing::warn!(
                    order_id = %order.order_id,
                    "Cancel before {} failed: {}",
                    intent.reason,
                    e
                );
            }
        }

        // cancels may have revealed fills, so size off the ledger as it is now
        let held = self.ledger.position(&self.key(&intent.symbol)).await.quantity;
        let quantity = rules.round_quantity(held.abs().min(rules.max_qty));
        if quantity <= QTY_EPSILON || held.signum() != -intent.side.sign() {
            return Ok(None);
        }

        let exit = TradeIntent {
            requested_quantity: quantity,
            ..intent.clone()
        };
        self.submit(&exit, OrderKind::Market).await.map(Some)
    }

    /// Pending -> Submitted, or Pending -> Rejected on a terminal adapter failure
    pub async fn submit(&self, intent: &TradeIntent, kind: OrderKind) -> Result<Order> {
        let key = self.key(&intent.symbol);
        let mut order = Order::pending(
            self.ids.next_id(),
            &self.exchange,
            intent,
            kind,
            self.clock.now(),
        );

        match self.adapter.place_order(&order.spec()).await {
            Ok(order_id) => {
                order.order_id = order_id;
                order.transition(OrderState::Submitted, self.clock.now())?;
                tracing::info!(
                    exchange = %self.exchange,
                    symbol = %order.symbol,
                    order_id = %order.order_id,
                    "Submitted {} {:.8} ({:?}) for {}",
                    order.side,
                    order.quantity,
                    order.kind,
                    order.reason
                );

                {
                    let mut book = self.ledger.lock(&key).await;
                    book.track(order.clone(), self.clock.monotonic());
                }

                // market orders often fill on submission
                if let Err(e) = self.refresh(&order.symbol, &order.order_id).await {
                    tracing::warn!(order_id = %order.order_id, "Status check after submit failed: {}", e);
                }
                Ok(order)
            }
            Err(e) => {
                // retries already happened below us; whatever reaches here is final
                let e = e.escalate(1);
                order.transition(OrderState::Rejected, self.clock.now())?;
                tracing::error!(
                    exchange = %self.exchange,
                    symbol = %order.symbol,
                    client_order_id = %order.client_order_id,
                    "Order rejected: {}",
                    e
                );
                self.ledger.lock(&key).await.record_terminal(order);
                Err(e)
            }
        }
    }

    /// Ask the exchange to cancel, then take whatever final state it reports
    pub async fn cancel(&self, symbol: &str, order_id: &str) -> Result<ReportOutcome> {
        let confirmed = self.adapter.cancel_order(symbol, order_id).await?;

        match self.adapter.fetch_order_status(symbol, order_id).await {
            Ok(report) => self.apply_report(&report).await,
            Err(e) if confirmed => {
                tracing::warn!(
                    order_id = %order_id,
                    "Cancel confirmed but status unavailable ({}), closing locally",
                    e
                );
                let mut book = self.ledger.lock(&self.key(symbol)).await;
                match book.open_order_mut(order_id) {
                    Some(open) => {
                        open.order.transition(OrderState::Cancelled, self.clock.now())?;
                        book.retire(order_id);
                        book.watch(order_id);
                        Ok(ReportOutcome::Advanced(OrderState::Cancelled))
                    }
                    None => Ok(ReportOutcome::Unchanged),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Fetch one order's status from the exchange and apply it
    pub async fn refresh(&self, symbol: &str, order_id: &str) -> Result<ReportOutcome> {
        let report = self.adapter.fetch_order_status(symbol, order_id).await?;
        self.apply_report(&report).await
    }

    /// Apply an exchange report for one of our orders.
    ///
    /// Fill quantities in reports are cumulative, so replaying a report is a
    /// no-op. The exchange's state wins over anything decided locally.
    pub async fn apply_report(&self, report: &Order) -> Result<ReportOutcome> {
        let mut book = self.ledger.lock(&self.key(&report.symbol)).await;

        let recorded = match book.open_order(&report.order_id) {
            Some(open) => open.order.clone(),
            None => return self.apply_late_report(&mut book, report),
        };

        let delta = report.filled_quantity - recorded.filled_quantity;
        let next = resolve_state(&recorded, report);

        let mut updated = recorded.clone();
        if next != recorded.state {
            updated.transition(next, self.clock.now())?;
        }

        if delta > QTY_EPSILON {
            let price = incremental_price(&recorded, report, delta);
            self.record_confirmed_fill(&mut book, &recorded, report, delta, price)?;
            updated.filled_quantity = report.filled_quantity;
            updated.average_fill_price = report.average_fill_price.or(Some(price));
            updated.last_update = self.clock.now();
        } else if next == recorded.state {
            return Ok(ReportOutcome::Unchanged);
        }

        if let Some(open) = book.open_order_mut(&report.order_id) {
            open.order = updated;
        }

        if next.is_terminal() {
            if let Some(order) = book.retire(&report.order_id) {
                tracing::info!(
                    exchange = %order.exchange,
                    symbol = %order.symbol,
                    order_id = %order.order_id,
                    "Order {} ({:.8}/{:.8} filled)",
                    order.state,
                    order.filled_quantity,
                    order.quantity
                );
            }
        }

        Ok(ReportOutcome::Advanced(next))
    }

    /// A report for an order already handed to history: only new fills matter
    fn apply_late_report(&self, book: &mut SymbolBook, report: &Order) -> Result<ReportOutcome> {
        let Some(recorded) = book.historical(&report.order_id).cloned() else {
            tracing::warn!(
                exchange = %self.exchange,
                order_id = %report.order_id,
                "Report for unknown order ignored"
            );
            return Ok(ReportOutcome::Unknown);
        };

        if report.state.is_terminal() {
            book.unwatch(&report.order_id);
        }

        let delta = report.filled_quantity - recorded.filled_quantity;
        if delta <= QTY_EPSILON {
            return Ok(ReportOutcome::Duplicate);
        }

        let price = incremental_price(&recorded, report, delta);
        self.record_confirmed_fill(book, &recorded, report, delta, price)?;

        let current = if report.filled_quantity + QTY_EPSILON >= recorded.quantity {
            OrderState::Filled
        } else if report.state == OrderState::Rejected {
            OrderState::Cancelled
        } else if report.state.is_terminal() {
            report.state
        } else {
            recorded.state
        };

        let conflict = Error::ReconciliationConflict {
            order_id: recorded.order_id.clone(),
            recorded: recorded.state,
            reported: report.state,
        };
        tracing::warn!(
            exchange = %self.exchange,
            symbol = %recorded.symbol,
            "{}; applied late fill of {:.8} @ {:.8}, order now {}",
            conflict,
            delta,
            price,
            current
        );

        let now = self.clock.now();
        if let Some(order) = book.historical_mut(&report.order_id) {
            order.filled_quantity = report.filled_quantity;
            order.average_fill_price = report.average_fill_price.or(Some(price));
            order.state = current;
            order.last_update = now;
        }

        Ok(ReportOutcome::Reconciled {
            previous: recorded.state,
            current,
        })
    }

    /// Book a fill the exchange reports as done. The exchange wins: a fill the
    /// ledger's own limits would refuse is recorded anyway and logged as a conflict.
    fn record_confirmed_fill(
        &self,
        book: &mut SymbolBook,
        recorded: &Order,
        report: &Order,
        quantity: f64,
        price: f64,
    ) -> Result<f64> {
        match book.apply_fill(recorded.side, quantity, price) {
            Err(Error::RiskViolation(reason)) => {
                let conflict = Error::ReconciliationConflict {
                    order_id: recorded.order_id.clone(),
                    recorded: recorded.state,
                    reported: report.state,
                };
                tracing::warn!(
                    exchange = %self.exchange,
                    symbol = %recorded.symbol,
                    "{}; exchange filled past the ledger ({}), recording it anyway",
                    conflict,
                    reason
                );
                book.apply_fill_unchecked(recorded.side, quantity, price)
            }
            other => other,
        }
    }

    /// Close an order that never confirmed in time.
    ///
    /// Issues a best-effort cancel, then marks it Expired whatever the cancel
    /// did. The order keeps being polled so a late fill still lands.
    pub async fn expire(&self, symbol: &str, order_id: &str) -> Result<bool> {
        let key = self.key(symbol);
        if self.ledger.lock(&key).await.open_order(order_id).is_none() {
            return Ok(false);
        }

        match self.adapter.cancel_order(symbol, order_id).await {
            Ok(cancelled) => tracing::debug!(order_id = %order_id, "Timeout cancel sent: {}", cancelled),
            Err(e) => tracing::warn!(order_id = %order_id, "Timeout cancel failed: {}", e),
        }

        let mut book = self.ledger.lock(&key).await;
        let Some(open) = book.open_order_mut(order_id) else {
            return Ok(false);
        };
        open.order.transition(OrderState::Expired, self.clock.now())?;
        book.retire(order_id);
        book.watch(order_id);

        tracing::warn!(
            exchange = %self.exchange,
            symbol = %symbol,
            order_id = %order_id,
            "Order expired after {}s without confirmation",
            self.config.order_timeout_secs
        );
        Ok(true)
    }

    /// One reconciliation pass over every symbol this engine trades:
    /// refresh open orders, expire the ones past the timeout, and poll
    /// locally closed orders for late fills.
    pub async fn reconcile(&self) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        let timeout = Duration::from_secs(self.config.order_timeout_secs);

        for key in self.ledger.keys_for(&self.wallet_id, &self.exchange) {
            let (open, watched) = {
                let book = self.ledger.lock(&key).await;
                let open: Vec<(String, Duration)> = book
                    .open_orders()
                    .map(|o| (o.order.order_id.clone(), o.submitted_at))
                    .collect();
                (open, book.watched())
            };

            for (order_id, submitted_at) in open {
                match self.refresh(&key.symbol, &order_id).await {
                    Ok(_) => summary.refreshed += 1,
                    Err(e) => {
                        summary.errors += 1;
                        tracing::warn!(order_id = %order_id, "Status refresh failed: {}", e);
                    }
                }

                let age = self.clock.monotonic().saturating_sub(submitted_at);
                if age >= timeout {
                    match self.expire(&key.symbol, &order_id).await {
                        Ok(true) => summary.expired += 1,
                        Ok(false) => {}
                        Err(e) => {
                            summary.errors += 1;
                            tracing::error!(order_id = %order_id, "Expiring order failed: {}", e);
                        }
                    }
                }
            }

            for order_id in watched {
                let polls = self.ledger.lock(&key).await.bump_watch(&order_id);
                if polls > self.config.reconcile_polls {
                    self.ledger.lock(&key).await.unwatch(&order_id);
                    tracing::warn!(
                        exchange = %self.exchange,
                        symbol = %key.symbol,
                        order_id = %order_id,
                        "Stopped polling closed order after {} checks; later fills will not be seen",
                        polls - 1
                    );
                    continue;
                }

                match self.refresh(&key.symbol, &order_id).await {
                    Ok(ReportOutcome::Reconciled { .. }) => summary.reconciled += 1,
                    Ok(_) => {}
                    Err(e) => {
                        summary.errors += 1;
                        tracing::warn!(order_id = %order_id, "Late fill poll failed: {}", e);
                    }
                }
            }
        }

        if summary != ReconcileSummary::default() {
            tracing::debug!(exchange = %self.exchange, "Reconcile: {:?}", summary);
        }
        summary
    }
}

/// State an open order should move to given a fresh exchange report
fn resolve_state(recorded: &Order, report: &Order) -> OrderState {
    let filled = report.filled_quantity.max(recorded.filled_quantity);

    if filled + QTY_EPSILON >= recorded.quantity || report.state == OrderState::Filled {
        return OrderState::Filled;
    }
    match report.state {
        OrderState::Cancelled | OrderState::Expired => report.state,
        OrderState::Rejected if filled > QTY_EPSILON => OrderState::Cancelled,
        OrderState::Rejected => OrderState::Rejected,
        _ if filled > QTY_EPSILON => OrderState::PartiallyFilled,
        _ => recorded.state,
    }
}

/// Price of the newly reported slice of a fill
fn incremental_price(recorded: &Order, report: &Order, delta: f64) -> f64 {
    let previous = recorded.average_fill_price.unwrap_or(0.0) * recorded.filled_quantity;
    match report.average_fill_price {
        Some(average) => {
            let price = (average * report.filled_quantity - previous) / delta;
            if price.is_finite() && price > 0.0 {
                price
            } else {
                average
            }
        }
        None => recorded
            .kind
            .limit_price()
            .or(recorded.average_fill_price)
            .unwrap_or(0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{PaperExchange, PaperOp};
    use crate::execution::clock::SimulatedClock;
    use crate::models::{IntentReason, Side, Tick};
    use chrono::{DateTime, TimeZone, Utc};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    struct Harness {
        clock: Arc<SimulatedClock>,
        paper: Arc<PaperExchange>,
        engine: OrderLifecycleEngine,
    }

    fn harness() -> Harness {
        let clock = Arc::new(SimulatedClock::new(start()));
        let paper = Arc::new(PaperExchange::new("paper", clock.clone()));
        paper.deposit("USD", 100_000.0);
        paper.set_mark(Tick {
            exchange: "paper".into(),
            symbol: "BTCUSDT".into(),
            price: 100.0,
            volume: 1.0,
            timestamp: start(),
        });

        let config = EngineConfig {
            order_timeout_secs: 5,
            ..Default::default()
        };
        let engine = OrderLifecycleEngine::new(
            "main",
            paper.clone(),
            PositionLedger::default(),
            clock.clone(),
            config,
            ClientIdGenerator::new("t"),
        );
        Harness {
            clock,
            paper,
            engine,
        }
    }

    #[test]
    fn test_client_ids_are_sequential() {
        let ids = ClientIdGenerator::new("bt");
        assert_eq!(ids.next_id(), "bt-000001");
        assert_eq!(ids.next_id(), "bt-000002");
        assert_eq!(ClientIdGenerator::random().next_id().len(), 12 + 7);
    }

    #[tokio::test]
    async fn test_market_order_fills_into_ledger() {
        let h = harness();
        let order = h
            .engine
            .submit(&TradeIntent::buy("BTCUSDT", 2.0, "test"), OrderKind::Market)
            .await
            .unwrap();

        assert_eq!(order.state, OrderState::Submitted);
        let position = h.engine.ledger().position(&h.engine.key("BTCUSDT")).await;
        assert_eq!(position.quantity, 2.0);
        assert_eq!(position.average_cost, 100.0);

        let history = h.engine.order_history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].state, OrderState::Filled);
    }

    #[tokio::test]
    async fn test_permanent_failure_rejects_order() {
        let h = harness();
        h.paper
            .fail_next(PaperOp::PlaceOrder, Error::Permanent("insufficient funds".into()));

        let result = h
            .engine
            .submit(&TradeIntent::buy("BTCUSDT", 1.0, "test"), OrderKind::Market)
            .await;
        assert!(result.unwrap_err().is_permanent());

        let history = h.engine.order_history().await;
        assert_eq!(history[0].state, OrderState::Rejected);
        assert!(h.engine.snapshot().await.positions["BTCUSDT"].is_flat());
    }

    #[tokio::test]
    async fn test_partial_fills_accumulate() {
        let h = harness();
        h.paper.hold_fills(true);
        let order = h
            .engine
            .submit(&TradeIntent::buy("BTCUSDT", 1.0, "test"), OrderKind::Market)
            .await
            .unwrap();

        h.paper.force_fill(&order.order_id, 0.4, 100.0).unwrap();
        let outcome = h.engine.refresh("BTCUSDT", &order.order_id).await.unwrap();
        assert_eq!(outcome, ReportOutcome::Advanced(OrderState::PartiallyFilled));

        h.paper.force_fill(&order.order_id, 0.6, 110.0).unwrap();
        let outcome = h.engine.refresh("BTCUSDT", &order.order_id).await.unwrap();
        assert_eq!(outcome, ReportOutcome::Advanced(OrderState::Filled));

        let position = h.engine.ledger().position(&h.engine.key("BTCUSDT")).await;
        assert!((position.quantity - 1.0).abs() < 1e-9);
        assert!((position.average_cost - 106.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_replayed_report_is_a_noop() {
        let h = harness();
        let order = h
            .engine
            .submit(&TradeIntent::buy("BTCUSDT", 1.0, "test"), OrderKind::Market)
            .await
            .unwrap();
        let report = h.paper.order(&order.order_id).unwrap();

        assert_eq!(
            h.engine.apply_report(&report).await.unwrap(),
            ReportOutcome::Duplicate
        );
        let position = h.engine.ledger().position(&h.engine.key("BTCUSDT")).await;
        assert_eq!(position.quantity, 1.0);
    }

    #[tokio::test]
    async fn test_cancel_loses_to_fill() {
        let h = harness();
        h.paper.hold_fills(true);
        let order = h
            .engine
            .submit(&TradeIntent::buy("BTCUSDT", 1.0, "test"), OrderKind::Market)
            .await
            .unwrap();

        // the exchange fills before our cancel lands
        h.paper.force_fill(&order.order_id, 1.0, 100.0).unwrap();
        let outcome = h.engine.cancel("BTCUSDT", &order.order_id).await.unwrap();

        assert_eq!(outcome, ReportOutcome::Advanced(OrderState::Filled));
        assert_eq!(h.engine.order_history().await[0].state, OrderState::Filled);
    }

    #[tokio::test]
    async fn test_timeout_expires_and_late_fill_reconciles() {
        let h = harness();
        h.paper.hold_fills(true);
        let order = h
            .engine
            .submit(&TradeIntent::buy("BTCUSDT", 1.0, "test"), OrderKind::Market)
            .await
            .unwrap();

        h.clock.advance(Duration::from_secs(5));
        h.paper
            .fail_next(PaperOp::CancelOrder, Error::Transient("timeout".into()));
        let summary = h.engine.reconcile().await;
        assert_eq!(summary.expired, 1);
        assert_eq!(h.engine.order_history().await[0].state, OrderState::Expired);

        h.paper.force_fill(&order.order_id, 1.0, 101.0).unwrap();
        h.clock.advance(Duration::from_secs(1));
        let summary = h.engine.reconcile().await;
        assert_eq!(summary.reconciled, 1);

        let history = h.engine.order_history().await;
        assert_eq!(history[0].state, OrderState::Filled);
        let position = h.engine.ledger().position(&h.engine.key("BTCUSDT")).await;
        assert_eq!(position.quantity, 1.0);
    }

    #[tokio::test]
    async fn test_forced_exit_cancels_resting_orders() {
        let h = harness();
        h.engine
            .submit(&TradeIntent::buy("BTCUSDT", 1.0, "test"), OrderKind::Market)
            .await
            .unwrap();
        let resting = h
            .engine
            .submit(
                &TradeIntent::buy("BTCUSDT", 1.0, "dip"),
                OrderKind::Limit { price: 50.0 },
            )
            .await
            .unwrap();

        let exit = TradeIntent::new("BTCUSDT", Side::Sell, 1.0, IntentReason::StopLoss);
        let placed = h
            .engine
            .execute(&exit, Some(100.0), &SymbolRules::unrestricted())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(placed.kind, OrderKind::Market);
        assert_eq!(
            h.paper.order(&resting.order_id).unwrap().state,
            OrderState::Cancelled
        );
        assert!(h.engine.snapshot().await.positions["BTCUSDT"].is_flat());
    }

    #[tokio::test]
    async fn test_cancel_closes_resting_order() {
        let h = harness();
        let order = h
            .engine
            .submit(
                &TradeIntent::buy("BTCUSDT", 1.0, "dip"),
                OrderKind::Limit { price: 90.0 },
            )
            .await
            .unwrap();
        assert_eq!(h.engine.open_orders("BTCUSDT").await.len(), 1);

        let outcome = h.engine.cancel("BTCUSDT", &order.order_id).await.unwrap();
        assert_eq!(outcome, ReportOutcome::Advanced(OrderState::Cancelled));

        let history = h.engine.order_history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].order_id, order.order_id);
        assert_eq!(history[0].state, OrderState::Cancelled);
        assert!(h.engine.open_orders("BTCUSDT").await.is_empty());
        assert!(h.engine.snapshot().await.positions["BTCUSDT"].is_flat());
    }

    #[tokio::test]
    async fn test_exchange_fill_past_ledger_is_still_recorded() {
        let clock = Arc::new(SimulatedClock::new(start()));
        let paper = Arc::new(PaperExchange::new("paper", clock.clone()).with_short_selling(true));
        paper.deposit("USD", 10_000.0);
        paper.set_mark(Tick {
            exchange: "paper".into(),
            symbol: "BTCUSDT".into(),
            price: 100.0,
            volume: 1.0,
            timestamp: start(),
        });
        // the ledger itself does not allow shorts
        let engine = OrderLifecycleEngine::new(
            "main",
            paper.clone(),
            PositionLedger::default(),
            clock,
            EngineConfig::default(),
            ClientIdGenerator::new("t"),
        );

        engine
            .submit(&TradeIntent::buy("BTCUSDT", 1.0, "test"), OrderKind::Market)
            .await
            .unwrap();
        for _ in 0..2 {
            engine
                .submit(&TradeIntent::sell("BTCUSDT", 1.0, "test"), OrderKind::Market)
                .await
                .unwrap();
        }

        assert_eq!(paper.balance("BTCUSDT"), -1.0);
        assert_eq!(engine.snapshot().await.quantity("BTCUSDT"), -1.0);
        assert!(engine.open_orders("BTCUSDT").await.is_empty());
        assert!(engine
            .order_history()
            .await
            .iter()
            .all(|o| o.state == OrderState::Filled));
        assert_eq!(engine.reconcile().await.errors, 0);
    }

    #[tokio::test]
    async fn test_closed_order_polling_stops_after_limit() {
        let h = harness();
        h.paper.hold_fills(true);
        let order = h
            .engine
            .submit(&TradeIntent::buy("BTCUSDT", 1.0, "test"), OrderKind::Market)
            .await
            .unwrap();

        // the exchange never confirms the cancel, so the order stays watched
        h.clock.advance(Duration::from_secs(5));
        h.paper
            .fail_next(PaperOp::CancelOrder, Error::Transient("timeout".into()));
        assert_eq!(h.engine.reconcile().await.expired, 1);

        let key = h.engine.key("BTCUSDT");
        let polls = EngineConfig::default().reconcile_polls;
        for _ in 0..polls {
            h.engine.reconcile().await;
        }
        assert_eq!(h.engine.ledger().lock(&key).await.watched(), vec![order.order_id.clone()]);

        h.engine.reconcile().await;
        assert!(h.engine.ledger().lock(&key).await.watched().is_empty());

        // past the window a fill is no longer picked up
        h.paper.force_fill(&order.order_id, 1.0, 100.0).unwrap();
        assert_eq!(h.engine.reconcile().await.reconciled, 0);
        assert!(h.engine.snapshot().await.positions["BTCUSDT"].is_flat());
    }
}
