use super::ExchangeAdapter;
use crate::models::{Order, OrderSpec, SymbolRules, Tick, TimeRange};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio::time::{sleep, Duration};

/// Capped exponential backoff for transient adapter failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that never sleeps, for tests and backtests
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    /// Backoff before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    /// Exhausted retries surface as `Error::Permanent`.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts.max(1);

        for attempt in 1..=attempts {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!("{} succeeded after {} attempts", what, attempt);
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < attempts => {
                    let backoff = self.backoff(attempt);
                    tracing::warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {}ms",
                        what,
                        attempt,
                        attempts,
                        e,
                        backoff.as_millis()
                    );
                    sleep(backoff).await;
                }
                Err(e) => return Err(e.escalate(attempt)),
            }
        }

        unreachable!("retry loop always returns")
    }
}

/// Decorator applying a `RetryPolicy` to every call of the wrapped adapter
pub struct RetryingAdapter<A> {
    inner: A,
    policy: RetryPolicy,
}

impl<A: ExchangeAdapter> RetryingAdapter<A> {
    pub fn new(inner: A, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }
}

#[async_trait]
impl<A: ExchangeAdapter> ExchangeAdapter for RetryingAdapter<A> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn fetch_price(&self, symbol: &str) -> Result<Tick> {
        self.policy
            .run("fetch_price", || self.inner.fetch_price(symbol))
            .await
    }

    async fn fetch_balance(&self, asset: &str) -> Result<f64> {
        self.policy
            .run("fetch_balance", || self.inner.fetch_balance(asset))
            .await
    }

    async fn place_order(&self, spec: &OrderSpec) -> Result<String> {
        // safe to repeat: adapters dedupe on client_order_id
        self.policy
            .run("place_order", || self.inner.place_order(spec))
            .await
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<bool> {
        self.policy
            .run("cancel_order", || self.inner.cancel_order(symbol, order_id))
            .await
    }

    async fn fetch_order_status(&self, symbol: &str, order_id: &str) -> Result<Order> {
        self.policy
            .run("fetch_order_status", || {
                self.inner.fetch_order_status(symbol, order_id)
            })
            .await
    }

    async fn fetch_history(&self, symbol: &str, range: &TimeRange) -> Result<Vec<Tick>> {
        self.policy
            .run("fetch_history", || self.inner.fetch_history(symbol, range))
            .await
    }

    async fn symbol_rules(&self, symbol: &str) -> Result<SymbolRules> {
        self.policy
            .run("symbol_rules", || self.inner.symbol_rules(symbol))
            .await
    }
}
