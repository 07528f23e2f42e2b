use crate::models::{OpenExposure, Order, Position, PositionKey, Side};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// An order the engine still owns, with its submission time on the monotonic clock
#[derive(Debug, Clone)]
pub struct OpenOrder {
    pub order: Order,
    pub submitted_at: Duration,
}

/// Everything recorded for one (wallet, exchange, symbol) key.
///
/// Open orders, the position and the terminal order history live behind the
/// same lock, so a fill and a concurrent cancel are linearized.
#[derive(Debug)]
pub struct SymbolBook {
    position: Position,
    open_orders: BTreeMap<String, OpenOrder>,
    history: Vec<Order>,
    /// Locally closed orders still polled for late fills, with poll counts
    watch: BTreeMap<String, u32>,
    allow_short: bool,
}

impl SymbolBook {
    fn new(key: &PositionKey, allow_short: bool) -> Self {
        Self {
            position: Position::flat(key),
            open_orders: BTreeMap::new(),
            history: Vec::new(),
            watch: BTreeMap::new(),
            allow_short,
        }
    }

    pub fn position(&self) -> &Position {
        &self.position
    }

    pub fn open_order_count(&self) -> usize {
        self.open_orders.len()
    }

    /// Unfilled quantity still working on each side
    pub fn open_exposure(&self) -> OpenExposure {
        let mut exposure = OpenExposure::default();
        for open in self.open_orders.values() {
            exposure.add(open.order.side, open.order.remaining_quantity());
        }
        exposure
    }

    pub fn open_orders(&self) -> impl Iterator<Item = &OpenOrder> {
        self.open_orders.values()
    }

    pub fn open_order(&self, order_id: &str) -> Option<&OpenOrder> {
        self.open_orders.get(order_id)
    }

    pub fn history(&self) -> &[Order] {
        &self.history
    }

    pub fn historical(&self, order_id: &str) -> Option<&Order> {
        self.history.iter().find(|o| o.order_id == order_id)
    }

    pub fn watched(&self) -> Vec<String> {
        self.watch.keys().cloned().collect()
    }

    /// Apply one confirmed fill to the position
    pub fn apply_fill(&mut self, side: Side, quantity: f64, price: f64) -> Result<f64> {
        let realized = self
            .position
            .apply_fill(side, quantity, price, self.allow_short)?;
        tracing::debug!(
            symbol = %self.position.symbol,
            "Fill {} {:.8} @ {:.8}, position now {:.8} @ {:.8}",
            side,
            quantity,
            price,
            self.position.quantity,
            self.position.average_cost
        );
        Ok(realized)
    }

    /// Apply a fill the exchange has already executed, past the short-selling
    /// check. Only for reconciling with exchange state.
    pub(crate) fn apply_fill_unchecked(&mut self, side: Side, quantity: f64, price: f64) -> Result<f64> {
        self.position.apply_fill(side, quantity, price, true)
    }

    pub(crate) fn track(&mut self, order: Order, submitted_at: Duration) {
        self.open_orders.insert(
            order.order_id.clone(),
            OpenOrder {
                order,
                submitted_at,
            },
        );
    }

    pub(crate) fn open_order_mut(&mut self, order_id: &str) -> Option<&mut OpenOrder> {
        self.open_orders.get_mut(order_id)
    }

    /// Hand a terminal order over to history. Ownership leaves the engine here.
    pub(crate) fn retire(&mut self, order_id: &str) -> Option<&Order> {
        let open = self.open_orders.remove(order_id)?;
        self.history.push(open.order);
        self.history.last()
    }

    pub(crate) fn record_terminal(&mut self, order: Order) {
        self.history.push(order);
    }

    pub(crate) fn historical_mut(&mut self, order_id: &str) -> Option<&mut Order> {
        self.history.iter_mut().find(|o| o.order_id == order_id)
    }

    pub(crate) fn watch(&mut self, order_id: &str) {
        self.watch.entry(order_id.to_string()).or_insert(0);
    }

    pub(crate) fn unwatch(&mut self, order_id: &str) {
        self.watch.remove(order_id);
    }

    /// Count one more poll; returns the new count
    pub(crate) fn bump_watch(&mut self, order_id: &str) -> u32 {
        let count = self.watch.entry(order_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }
}

/// Immutable view of one wallet/exchange pair, handed to strategies
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PositionSnapshot {
    pub wallet_id: String,
    pub exchange: String,
    pub positions: BTreeMap<String, Position>,
    pub open_orders: BTreeMap<String, OpenExposure>,
}

impl PositionSnapshot {
    pub fn position(&self, symbol: &str) -> Position {
        self.positions.get(symbol).cloned().unwrap_or_else(|| {
            Position::flat(&PositionKey::new(&self.wallet_id, &self.exchange, symbol))
        })
    }

    pub fn quantity(&self, symbol: &str) -> f64 {
        self.positions.get(symbol).map(|p| p.quantity).unwrap_or(0.0)
    }

    pub fn open_order_count(&self, symbol: &str) -> usize {
        self.open_exposure(symbol).orders
    }

    pub fn open_exposure(&self, symbol: &str) -> OpenExposure {
        self.open_orders.get(symbol).copied().unwrap_or_default()
    }

    pub fn held_symbols(&self) -> impl Iterator<Item = &Position> {
        self.positions.values().filter(|p| !p.is_flat())
    }
}

/// Authoritative record of holdings and orders.
///
/// Cloning yields another handle to the same ledger. Mutual exclusion is per
/// `PositionKey`: operations on different keys never wait on each other.
#[derive(Clone)]
pub struct PositionLedger {
    books: Arc<RwLock<HashMap<PositionKey, Arc<Mutex<SymbolBook>>>>>,
    allow_short: bool,
}

impl PositionLedger {
    pub fn new(allow_short: bool) -> Self {
        Self {
            books: Arc::new(RwLock::new(HashMap::new())),
            allow_short,
        }
    }

    fn entry(&self, key: &PositionKey) -> Arc<Mutex<SymbolBook>> {
        {
            let books = self.books.read().unwrap_or_else(|e| e.into_inner());
            if let Some(book) = books.get(key) {
                return book.clone();
            }
        }
        let mut books = self.books.write().unwrap_or_else(|e| e.into_inner());
        books
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(SymbolBook::new(key, self.allow_short))))
            .clone()
    }

    /// Exclusive access to one key's book, created on first use
    pub async fn lock(&self, key: &PositionKey) -> OwnedMutexGuard<SymbolBook> {
        self.entry(key).lock_owned().await
    }

    pub async fn position(&self, key: &PositionKey) -> Position {
        self.lock(key).await.position().clone()
    }

    /// Record a confirmed fill outside of any order flow
    pub async fn record_fill(
        &self,
        key: &PositionKey,
        side: Side,
        quantity: f64,
        price: f64,
    ) -> Result<Position> {
        let mut book = self.lock(key).await;
        book.apply_fill(side, quantity, price)?;
        Ok(book.position().clone())
    }

    /// All keys, sorted
    pub fn keys(&self) -> Vec<PositionKey> {
        let books = self.books.read().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<PositionKey> = books.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn keys_for(&self, wallet_id: &str, exchange: &str) -> Vec<PositionKey> {
        self.keys()
            .into_iter()
            .filter(|k| k.wallet_id == wallet_id && k.exchange == exchange)
            .collect()
    }

    /// Consistent per-key copies of every position for one wallet/exchange
    pub async fn snapshot(&self, wallet_id: &str, exchange: &str) -> PositionSnapshot {
        let mut snapshot = PositionSnapshot {
            wallet_id: wallet_id.to_string(),
            exchange: exchange.to_string(),
            ..Default::default()
        };

        for key in self.keys_for(wallet_id, exchange) {
            let book = self.lock(&key).await;
            snapshot
                .positions
                .insert(key.symbol.clone(), book.position().clone());
            snapshot
                .open_orders
                .insert(key.symbol.clone(), book.open_exposure());
        }

        snapshot
    }

    /// Terminal orders for a wallet/exchange in the order they closed
    pub async fn order_history(&self, wallet_id: &str, exchange: &str) -> Vec<Order> {
        let mut orders = Vec::new();
        for key in self.keys_for(wallet_id, exchange) {
            let book = self.lock(&key).await;
            orders.extend(book.history().iter().cloned());
        }
        orders.sort_by(|a, b| {
            a.last_update
                .cmp(&b.last_update)
                .then_with(|| a.client_order_id.cmp(&b.client_order_id))
        });
        orders
    }
}

impl Default for PositionLedger {
    fn default() -> Self {
        Self::new(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn key(symbol: &str) -> PositionKey {
        PositionKey::new("main", "paper", symbol)
    }

    #[tokio::test]
    async fn test_record_fill_updates_position() {
        let ledger = PositionLedger::default();
        let position = ledger
            .record_fill(&key("BTCUSDT"), Side::Buy, 2.0, 100.0)
            .await
            .unwrap();

        assert_eq!(position.quantity, 2.0);
        assert_eq!(position.average_cost, 100.0);
    }

    #[tokio::test]
    async fn test_short_disallowed_by_default() {
        let ledger = PositionLedger::default();
        let result = ledger
            .record_fill(&key("BTCUSDT"), Side::Sell, 1.0, 100.0)
            .await;

        assert!(matches!(result, Err(Error::RiskViolation(_))));
        assert!(ledger.position(&key("BTCUSDT")).await.is_flat());
    }

    #[tokio::test]
    async fn test_snapshot_filters_wallet_and_exchange() {
        let ledger = PositionLedger::default();
        ledger
            .record_fill(&key("BTCUSDT"), Side::Buy, 1.0, 100.0)
            .await
            .unwrap();
        ledger
            .record_fill(
                &PositionKey::new("main", "binance", "BTCUSDT"),
                Side::Buy,
                5.0,
                100.0,
            )
            .await
            .unwrap();

        let snapshot = ledger.snapshot("main", "paper").await;
        assert_eq!(snapshot.positions.len(), 1);
        assert_eq!(snapshot.quantity("BTCUSDT"), 1.0);
        assert_eq!(snapshot.quantity("ETHUSDT"), 0.0);
        assert_eq!(snapshot.open_order_count("BTCUSDT"), 0);
    }

    #[tokio::test]
    async fn test_locks_are_per_key() {
        let ledger = PositionLedger::default();
        let _held = ledger.lock(&key("BTCUSDT")).await;

        // A different key must not wait on the held guard
        let other = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            ledger.lock(&key("ETHUSDT")),
        )
        .await;
        assert!(other.is_ok());

        let same = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            ledger.lock(&key("BTCUSDT")),
        )
        .await;
        assert!(same.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_fills_sum_exactly() {
        let ledger = PositionLedger::default();
        let mut tasks = tokio::task::JoinSet::new();

        for i in 0..50 {
            let ledger = ledger.clone();
            tasks.spawn(async move {
                let quantity = 1.0 + (i % 3) as f64;
                ledger
                    .record_fill(&key("BTCUSDT"), Side::Buy, quantity, 100.0 + i as f64)
                    .await
                    .unwrap();
                quantity
            });
        }

        let mut expected = 0.0;
        while let Some(result) = tasks.join_next().await {
            expected += result.unwrap();
        }

        let position = ledger.position(&key("BTCUSDT")).await;
        assert!((position.quantity - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_snapshot_carries_unfilled_quantity_per_side() {
        use crate::models::{OrderKind, TradeIntent};
        use chrono::Utc;

        let ledger = PositionLedger::default();
        {
            let mut book = ledger.lock(&key("BTCUSDT")).await;
            for (i, intent) in [
                TradeIntent::buy("BTCUSDT", 0.5, "a"),
                TradeIntent::sell("BTCUSDT", 0.3, "b"),
                TradeIntent::sell("BTCUSDT", 0.2, "c"),
            ]
            .iter()
            .enumerate()
            {
                let mut order =
                    Order::pending(format!("t-{}", i), "paper", intent, OrderKind::Market, Utc::now());
                order.order_id = format!("o-{}", i);
                order.filled_quantity = if i == 2 { 0.05 } else { 0.0 };
                book.track(order, Duration::ZERO);
            }
        }

        let exposure = ledger.snapshot("main", "paper").await.open_exposure("BTCUSDT");
        assert_eq!(exposure.orders, 3);
        assert!((exposure.buy_quantity - 0.5).abs() < 1e-9);
        assert!((exposure.sell_quantity - 0.45).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_unchecked_fill_books_exchange_short() {
        let ledger = PositionLedger::default();
        let mut book = ledger.lock(&key("BTCUSDT")).await;

        assert!(book.apply_fill(Side::Sell, 1.0, 100.0).is_err());
        book.apply_fill_unchecked(Side::Sell, 1.0, 100.0).unwrap();
        assert_eq!(book.position().quantity, -1.0);
    }
}
