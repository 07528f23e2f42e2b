use breadbot::api::{ExchangeAdapter, PaperExchange, PaperOp};
use breadbot::config::{EngineConfig, OrderType};
use breadbot::execution::{
    ClientIdGenerator, DecisionPipeline, ExchangeCycle, MarketDataFeed, OrderLifecycleEngine,
    PositionLedger, PositionSnapshot, ReportOutcome, SimulatedClock, TickBuffer, Trader,
};
use breadbot::models::{
    IntentReason, OrderKind, OrderSpec, OrderState, PositionKey, Side, SymbolRules, Tick,
    TradeIntent,
};
use breadbot::risk::{RiskLimits, RiskManager};
use breadbot::strategy::BuyAndHold;
use breadbot::{Error, StrategyEvaluator};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;

const SYMBOL: &str = "BTCUSDT";

fn t(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
}

fn tick(exchange: &str, price: f64, secs: i64) -> Tick {
    Tick {
        exchange: exchange.to_string(),
        symbol: SYMBOL.to_string(),
        price,
        volume: 1.0,
        timestamp: t(secs),
    }
}

/// Wants to buy a little more every cycle
struct AlwaysBuy;

impl StrategyEvaluator for AlwaysBuy {
    fn evaluate(&self, market: &TickBuffer, _: &PositionSnapshot) -> Vec<TradeIntent> {
        market
            .symbols()
            .map(|s| TradeIntent::buy(s, 0.1, "always"))
            .collect()
    }

    fn name(&self) -> &str {
        "AlwaysBuy"
    }

    fn min_ticks_required(&self) -> usize {
        1
    }
}

/// Tries to sell the whole holding every cycle
struct AlwaysSell;

impl StrategyEvaluator for AlwaysSell {
    fn evaluate(&self, market: &TickBuffer, _: &PositionSnapshot) -> Vec<TradeIntent> {
        market
            .symbols()
            .map(|s| TradeIntent::sell(s, 1.0, "take it off"))
            .collect()
    }

    fn name(&self) -> &str {
        "AlwaysSell"
    }

    fn min_ticks_required(&self) -> usize {
        1
    }
}

struct Venue {
    clock: Arc<SimulatedClock>,
    paper: Arc<PaperExchange>,
    cycle: ExchangeCycle,
}

impl Venue {
    fn new(
        name: &str,
        ledger: PositionLedger,
        clock: Arc<SimulatedClock>,
        strategy: Arc<dyn StrategyEvaluator>,
        limits: RiskLimits,
    ) -> Self {
        let paper = Arc::new(PaperExchange::new(name, clock.clone()));
        paper.deposit("USD", 100_000.0);

        let engine = OrderLifecycleEngine::new(
            "main",
            paper.clone(),
            ledger,
            clock.clone(),
            EngineConfig::default(),
            ClientIdGenerator::new(name),
        );
        let pipeline = DecisionPipeline::new(strategy, RiskManager::new(limits));
        let feed = MarketDataFeed::new().with_source(paper.clone(), vec![SYMBOL.to_string()]);

        Self {
            clock,
            paper,
            cycle: ExchangeCycle::new(engine, pipeline, feed, 100),
        }
    }

    fn mark(&self, price: f64, secs: i64) {
        self.clock.set(t(secs));
        self.paper.set_mark(tick(self.paper.name(), price, secs));
    }
}

fn clock() -> Arc<SimulatedClock> {
    Arc::new(SimulatedClock::new(t(0)))
}

#[tokio::test]
async fn test_concurrent_fills_on_one_position_serialize() {
    let ledger = PositionLedger::default();
    let key = PositionKey::new("main", "alpha", SYMBOL);

    let mut tasks = Vec::new();
    for i in 0..50 {
        let ledger = ledger.clone();
        let key = key.clone();
        tasks.push(tokio::spawn(async move {
            let price = if i % 2 == 0 { 100.0 } else { 110.0 };
            ledger.record_fill(&key, Side::Buy, 0.1, price).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let position = ledger.position(&key).await;
    assert!((position.quantity - 5.0).abs() < 1e-9);
    assert!((position.average_cost - 105.0).abs() < 1e-9);

    // another key is untouched
    let other = ledger.position(&PositionKey::new("main", "beta", SYMBOL)).await;
    assert!(other.is_flat());
}

#[tokio::test]
async fn test_stop_loss_fires_only_once_threshold_is_crossed() {
    let mut venue = Venue::new(
        "alpha",
        PositionLedger::default(),
        clock(),
        Arc::new(BuyAndHold::new(1.0)),
        RiskLimits {
            stop_loss_pct: 8.0,
            ..RiskLimits::default()
        },
    );

    venue.mark(100.0, 0);
    let decision = venue.cycle.run_cycle().await;
    assert_eq!(decision.approved.len(), 1);
    assert_eq!(venue.cycle.engine().snapshot().await.quantity(SYMBOL), 1.0);

    venue.mark(95.0, 60);
    let decision = venue.cycle.run_cycle().await;
    assert!(decision.approved.is_empty(), "no exit at -5%: {:?}", decision);

    venue.mark(90.0, 120);
    let decision = venue.cycle.run_cycle().await;
    assert_eq!(decision.approved.len(), 1);
    let exit = &decision.approved[0];
    assert_eq!(exit.reason, IntentReason::StopLoss);
    assert_eq!(exit.side, Side::Sell);
    assert_eq!(exit.requested_quantity, 1.0);

    let snapshot = venue.cycle.engine().snapshot().await;
    let position = snapshot.position(SYMBOL);
    assert!(position.is_flat());
    assert!((position.realized_pnl + 10.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_second_order_rejected_at_max_open_orders() {
    let mut venue = Venue::new(
        "alpha",
        PositionLedger::default(),
        clock(),
        Arc::new(AlwaysBuy),
        RiskLimits {
            max_open_orders: 1,
            ..RiskLimits::default()
        },
    );
    venue.paper.hold_fills(true);

    venue.mark(100.0, 0);
    let first = venue.cycle.run_cycle().await;
    assert_eq!(first.approved.len(), 1);
    assert_eq!(venue.cycle.engine().open_orders(SYMBOL).await.len(), 1);

    venue.mark(100.5, 1);
    let second = venue.cycle.run_cycle().await;
    assert!(second.approved.is_empty());
    assert_eq!(second.rejected.len(), 1);
    assert!(second.rejected[0].1.contains("open orders"));
    assert_eq!(venue.cycle.engine().open_orders(SYMBOL).await.len(), 1);
}

#[tokio::test]
async fn test_expired_order_that_fills_later_ends_filled() {
    let clock = clock();
    let paper = Arc::new(PaperExchange::new("alpha", clock.clone()));
    paper.deposit("USD", 10_000.0);
    paper.set_mark(tick("alpha", 100.0, 0));
    paper.hold_fills(true);

    let ledger = PositionLedger::default();
    let engine = OrderLifecycleEngine::new(
        "main",
        paper.clone(),
        ledger.clone(),
        clock.clone(),
        EngineConfig {
            order_timeout_secs: 5,
            ..EngineConfig::default()
        },
        ClientIdGenerator::new("bt"),
    );

    let order = engine
        .execute(&TradeIntent::buy(SYMBOL, 1.0, "test"), Some(100.0), &SymbolRules::unrestricted())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.state, OrderState::Submitted);

    clock.set(t(4));
    assert_eq!(engine.reconcile().await.expired, 0);

    clock.set(t(5));
    assert_eq!(engine.reconcile().await.expired, 1);
    let history = engine.order_history().await;
    assert_eq!(history[0].state, OrderState::Expired);
    assert!(engine.snapshot().await.position(SYMBOL).is_flat());

    // the exchange matched it after all
    clock.set(t(6));
    paper.force_fill(&order.order_id, 1.0, 100.0).unwrap();
    assert_eq!(engine.reconcile().await.reconciled, 1);

    let history = engine.order_history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].state, OrderState::Filled);
    assert_eq!(engine.snapshot().await.quantity(SYMBOL), 1.0);

    // later polls change nothing
    engine.reconcile().await;
    assert_eq!(engine.snapshot().await.quantity(SYMBOL), 1.0);
}

#[tokio::test]
async fn test_replayed_fill_report_applies_once() {
    let clock = clock();
    let paper = Arc::new(PaperExchange::new("alpha", clock.clone()));
    paper.deposit("USD", 10_000.0);
    paper.set_mark(tick("alpha", 100.0, 0));

    let engine = OrderLifecycleEngine::new(
        "main",
        paper.clone(),
        PositionLedger::default(),
        clock,
        EngineConfig::default(),
        ClientIdGenerator::new("bt"),
    );

    let order = engine
        .submit(&TradeIntent::buy(SYMBOL, 0.5, "test"), breadbot::models::OrderKind::Market)
        .await
        .unwrap();
    let report = paper.fetch_order_status(SYMBOL, &order.order_id).await.unwrap();
    assert_eq!(report.state, OrderState::Filled);

    for _ in 0..3 {
        assert_eq!(engine.apply_report(&report).await.unwrap(), ReportOutcome::Duplicate);
    }
    assert_eq!(engine.snapshot().await.quantity(SYMBOL), 0.5);

    // same client id resolves to the same exchange order
    let again = paper.place_order(&order.spec()).await.unwrap();
    assert_eq!(again, order.order_id);
}

#[tokio::test]
async fn test_failing_exchange_does_not_affect_the_other() {
    let ledger = PositionLedger::default();
    let shared_clock = clock();
    let alpha = Venue::new(
        "alpha",
        ledger.clone(),
        shared_clock.clone(),
        Arc::new(BuyAndHold::new(1.0)),
        RiskLimits::default(),
    );
    let beta = Venue::new(
        "beta",
        ledger.clone(),
        shared_clock,
        Arc::new(BuyAndHold::new(1.0)),
        RiskLimits::default(),
    );

    alpha.mark(100.0, 0);
    beta.mark(200.0, 0);
    beta.paper
        .fail_next(PaperOp::PlaceOrder, Error::Permanent("insufficient funds".into()));

    let mut trader = Trader::new(vec![alpha.cycle, beta.cycle], std::time::Duration::from_secs(60));
    let results = trader.run_once().await;
    assert_eq!(results.len(), 2);

    let alpha_position = ledger.position(&PositionKey::new("main", "alpha", SYMBOL)).await;
    assert_eq!(alpha_position.quantity, 1.0);

    let beta_position = ledger.position(&PositionKey::new("main", "beta", SYMBOL)).await;
    assert!(beta_position.is_flat());
    let beta_history = ledger.order_history("main", "beta").await;
    assert_eq!(beta_history.len(), 1);
    assert_eq!(beta_history[0].state, OrderState::Rejected);

    // the fault was one-shot; beta trades on its next cycle
    let results = trader.run_once().await;
    assert_eq!(results.len(), 2);
    let beta_position = ledger.position(&PositionKey::new("main", "beta", SYMBOL)).await;
    assert_eq!(beta_position.quantity, 1.0);
}

#[tokio::test]
async fn test_resting_sells_never_oversell_the_holding() {
    let clock = clock();
    let paper = Arc::new(PaperExchange::new("alpha", clock.clone()));
    paper.deposit("USD", 10_000.0);
    paper.set_mark(tick("alpha", 100.0, 0));

    let config = EngineConfig {
        order_type: OrderType::Limit,
        limit_offset_bps: 100.0,
        ..EngineConfig::default()
    };
    let engine = OrderLifecycleEngine::new(
        "main",
        paper.clone(),
        PositionLedger::default(),
        clock.clone(),
        config.clone(),
        ClientIdGenerator::new("alpha"),
    );
    engine
        .submit(&TradeIntent::buy(SYMBOL, 1.0, "entry"), OrderKind::Market)
        .await
        .unwrap();

    let limits = RiskLimits {
        max_open_orders: 2,
        ..RiskLimits::default()
    };
    let pipeline = DecisionPipeline::new(Arc::new(AlwaysSell), RiskManager::new(limits));
    let feed = MarketDataFeed::new().with_source(paper.clone(), vec![SYMBOL.to_string()]);
    let mut cycle = ExchangeCycle::new(engine, pipeline, feed, config.tick_window);

    // first sell rests at 101 above the mark
    let first = cycle.run_cycle().await;
    assert_eq!(first.approved.len(), 1);
    let resting = cycle.engine().snapshot().await.open_exposure(SYMBOL);
    assert_eq!(resting.orders, 1);
    assert_eq!(resting.sell_quantity, 1.0);

    clock.set(t(1));
    paper.set_mark(tick("alpha", 100.5, 1));
    let second = cycle.run_cycle().await;
    assert!(second.approved.is_empty());
    assert!(second.rejected[0].1.contains("resting sells"));
    assert_eq!(cycle.engine().open_orders(SYMBOL).await.len(), 1);

    // the exchange refuses it too: the holding is reserved
    let oversell = OrderSpec {
        client_order_id: "manual-1".to_string(),
        symbol: SYMBOL.to_string(),
        side: Side::Sell,
        quantity: 1.0,
        kind: OrderKind::Limit { price: 101.0 },
    };
    assert!(paper.place_order(&oversell).await.unwrap_err().is_permanent());

    // crossing the limit fills the one resting sell and nothing more
    clock.set(t(2));
    paper.set_mark(tick("alpha", 102.0, 2));
    let summary = cycle.engine().reconcile().await;
    assert_eq!(summary.errors, 0);

    let filled: f64 = paper
        .orders()
        .iter()
        .map(|o| o.side.sign() * o.filled_quantity)
        .sum();
    let ledger_quantity = cycle.engine().snapshot().await.quantity(SYMBOL);
    assert_eq!(filled, 0.0);
    assert_eq!(ledger_quantity, filled);
    assert_eq!(paper.balance(SYMBOL), ledger_quantity);
}
