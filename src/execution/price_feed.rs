use crate::api::ExchangeAdapter;
use crate::models::{Tick, TimeRange};
use crate::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;

struct FeedSource {
    adapter: Arc<dyn ExchangeAdapter>,
    symbols: Vec<String>,
}

/// Normalizes ticks from one or more adapters into a single time-ordered stream
pub struct MarketDataFeed {
    sources: Vec<FeedSource>,
    last_seen: HashMap<(String, String), DateTime<Utc>>,
}

impl MarketDataFeed {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            last_seen: HashMap::new(),
        }
    }

    pub fn with_source(mut self, adapter: Arc<dyn ExchangeAdapter>, symbols: Vec<String>) -> Self {
        self.sources.push(FeedSource { adapter, symbols });
        self
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.sources
            .iter()
            .flat_map(|s| s.symbols.iter().map(String::as_str))
    }

    /// Fetch the current tick for every (adapter, symbol) concurrently.
    ///
    /// A failing symbol is logged and skipped. Ticks not newer than the last
    /// one seen for the same exchange and symbol are dropped.
    pub async fn poll(&mut self) -> Vec<Tick> {
        let mut tasks = JoinSet::new();

        for source in &self.sources {
            for symbol in &source.symbols {
                let adapter = source.adapter.clone();
                let symbol = symbol.clone();
                tasks.spawn(async move {
                    let result = adapter.fetch_price(&symbol).await;
                    (adapter.name().to_string(), symbol, result)
                });
            }
        }

        let mut ticks = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, _, Ok(tick))) => ticks.push(tick),
                Ok((exchange, symbol, Err(e))) => {
                    tracing::warn!(exchange = %exchange, symbol = %symbol, "Price fetch failed: {}", e);
                }
                Err(e) => tracing::error!("Price fetch task panicked: {}", e),
            }
        }

        self.normalize(ticks)
    }

    /// Order by (timestamp, exchange, symbol) and drop stale or repeated ticks
    pub fn normalize(&mut self, mut ticks: Vec<Tick>) -> Vec<Tick> {
        sort_ticks(&mut ticks);

        ticks
            .into_iter()
            .filter(|tick| {
                let key = (tick.exchange.clone(), tick.symbol.clone());
                match self.last_seen.get(&key) {
                    Some(seen) if tick.timestamp <= *seen => {
                        tracing::debug!(
                            exchange = %tick.exchange,
                            symbol = %tick.symbol,
                            "Dropping stale tick at {}",
                            tick.timestamp
                        );
                        false
                    }
                    _ => {
                        self.last_seen.insert(key, tick.timestamp);
                        true
                    }
                }
            })
            .collect()
    }

    /// Historical ticks for every source and symbol over `range`, merged
    pub async fn fetch_history(&self, range: &TimeRange) -> Result<Vec<Tick>> {
        let mut streams = Vec::new();
        for source in &self.sources {
            for symbol in &source.symbols {
                let ticks = source.adapter.fetch_history(symbol, range).await?;
                tracing::info!(
                    exchange = %source.adapter.name(),
                    symbol = %symbol,
                    "Loaded {} historical ticks",
                    ticks.len()
                );
                streams.push(ticks);
            }
        }
        Ok(merge_history(streams))
    }
}

impl Default for MarketDataFeed {
    fn default() -> Self {
        Self::new()
    }
}

fn sort_ticks(ticks: &mut [Tick]) {
    ticks.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.exchange.cmp(&b.exchange))
            .then_with(|| a.symbol.cmp(&b.symbol))
    });
}

/// Merge per-symbol series into one stream, dropping duplicate
/// (exchange, symbol, timestamp) samples
pub fn merge_history(streams: Vec<Vec<Tick>>) -> Vec<Tick> {
    let mut ticks: Vec<Tick> = streams.into_iter().flatten().collect();
    sort_ticks(&mut ticks);
    ticks.dedup_by(|next, prev| {
        next.timestamp == prev.timestamp
            && next.exchange == prev.exchange
            && next.symbol == prev.symbol
    });
    ticks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{PaperExchange, PaperOp};
    use crate::error::Error;
    use crate::execution::clock::SimulatedClock;
    use chrono::{Duration, TimeZone};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn tick(exchange: &str, symbol: &str, price: f64, minute: i64) -> Tick {
        Tick {
            exchange: exchange.into(),
            symbol: symbol.into(),
            price,
            volume: 1.0,
            timestamp: start() + Duration::minutes(minute),
        }
    }

    fn paper(name: &str) -> Arc<PaperExchange> {
        Arc::new(PaperExchange::new(name, Arc::new(SimulatedClock::new(start()))))
    }

    #[tokio::test]
    async fn test_poll_merges_sources_in_time_order() {
        let a = paper("alpha");
        let b = paper("beta");
        a.set_mark(tick("alpha", "BTCUSDT", 100.0, 2));
        b.set_mark(tick("beta", "BTCUSDT", 101.0, 1));
        b.set_mark(tick("beta", "ETHUSDT", 10.0, 2));

        let mut feed = MarketDataFeed::new()
            .with_source(a.clone(), vec!["BTCUSDT".into()])
            .with_source(b.clone(), vec!["BTCUSDT".into(), "ETHUSDT".into()]);

        let ticks = feed.poll().await;
        let order: Vec<(&str, &str)> = ticks
            .iter()
            .map(|t| (t.exchange.as_str(), t.symbol.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![("beta", "BTCUSDT"), ("alpha", "BTCUSDT"), ("beta", "ETHUSDT")]
        );
    }

    #[tokio::test]
    async fn test_poll_drops_repeated_ticks_and_survives_failures() {
        let a = paper("alpha");
        a.set_mark(tick("alpha", "BTCUSDT", 100.0, 0));
        let mut feed = MarketDataFeed::new().with_source(a.clone(), vec!["BTCUSDT".into()]);

        assert_eq!(feed.poll().await.len(), 1);
        // unchanged mark is not a new tick
        assert!(feed.poll().await.is_empty());

        a.fail_next(PaperOp::FetchPrice, Error::Transient("timeout".into()));
        a.set_mark(tick("alpha", "BTCUSDT", 101.0, 1));
        assert!(feed.poll().await.is_empty());
        assert_eq!(feed.poll().await.len(), 1);
    }

    #[test]
    fn test_merge_history_dedupes() {
        let merged = merge_history(vec![
            vec![tick("x", "BTC", 1.0, 0), tick("x", "BTC", 2.0, 2)],
            vec![tick("x", "ETH", 5.0, 1), tick("x", "BTC", 1.0, 0)],
        ]);
        let prices: Vec<f64> = merged.iter().map(|t| t.price).collect();
        assert_eq!(prices, vec![1.0, 5.0, 2.0]);
    }
}
