// Exchange adapters
pub mod binance;
pub mod paper;
pub mod retry;

pub use binance::BinanceAdapter;
pub use paper::{PaperExchange, PaperOp};
pub use retry::{RetryPolicy, RetryingAdapter};

use crate::models::{Order, OrderSpec, SymbolRules, Tick, TimeRange};
use crate::Result;
use async_trait::async_trait;

/// The normalized capability set every exchange implements.
///
/// Implementations own their wire protocol (auth, signing, payload shapes)
/// and must map every failure onto `Error::Transient` or `Error::Permanent`.
/// Any metadata cache (lot sizes, tick sizes) stays private to the adapter.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Exchange name as used in ticks, orders and ledger keys
    fn name(&self) -> &str;

    async fn fetch_price(&self, symbol: &str) -> Result<Tick>;

    /// Free balance of one asset
    async fn fetch_balance(&self, asset: &str) -> Result<f64>;

    /// Place an order and return the exchange-assigned order id
    async fn place_order(&self, spec: &OrderSpec) -> Result<String>;

    /// True if the exchange confirmed the cancel, false if the order was
    /// already closed on the exchange side.
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<bool>;

    async fn fetch_order_status(&self, symbol: &str, order_id: &str) -> Result<Order>;

    /// Ticks in `range`, oldest first
    async fn fetch_history(&self, symbol: &str, range: &TimeRange) -> Result<Vec<Tick>>;

    async fn symbol_rules(&self, symbol: &str) -> Result<SymbolRules>;
}
