use crate::models::Tick;
use std::collections::{BTreeMap, VecDeque};

/// Rolling window of recent ticks per symbol.
///
/// This is the market view handed to strategies. Iteration is ordered by
/// symbol so strategies see the same sequence on every run.
#[derive(Debug, Clone)]
pub struct TickBuffer {
    data: BTreeMap<String, VecDeque<Tick>>,
    max_ticks: usize,
}

impl TickBuffer {
    /// # Arguments
    /// * `max_ticks` - Maximum number of ticks to keep per symbol
    pub fn new(max_ticks: usize) -> Self {
        Self {
            data: BTreeMap::new(),
            max_ticks: max_ticks.max(1),
        }
    }

    /// Add a tick, dropping the oldest once the window is full.
    ///
    /// Returns false (and keeps nothing) when the tick is not newer than the
    /// last one stored for its symbol.
    pub fn push(&mut self, tick: Tick) -> bool {
        let ticks = self.data.entry(tick.symbol.clone()).or_default();

        if let Some(last) = ticks.back() {
            if tick.timestamp <= last.timestamp {
                tracing::debug!(
                    symbol = %tick.symbol,
                    "Dropping out-of-order tick at {}",
                    tick.timestamp
                );
                return false;
            }
        }

        ticks.push_back(tick);
        while ticks.len() > self.max_ticks {
            ticks.pop_front();
        }
        true
    }

    pub fn latest(&self, symbol: &str) -> Option<&Tick> {
        self.data.get(symbol).and_then(|d| d.back())
    }

    pub fn latest_price(&self, symbol: &str) -> Option<f64> {
        self.latest(symbol).map(|t| t.price)
    }

    /// Prices for a symbol, oldest first
    pub fn prices(&self, symbol: &str) -> Vec<f64> {
        self.data
            .get(symbol)
            .map(|d| d.iter().map(|t| t.price).collect())
            .unwrap_or_default()
    }

    pub fn ticks(&self, symbol: &str) -> Vec<&Tick> {
        self.data
            .get(symbol)
            .map(|d| d.iter().collect())
            .unwrap_or_default()
    }

    pub fn tick_count(&self, symbol: &str) -> usize {
        self.data.get(symbol).map(|d| d.len()).unwrap_or(0)
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(String::as_str)
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn tick(symbol: &str, price: f64, secs: i64) -> Tick {
        Tick {
            exchange: "paper".to_string(),
            symbol: symbol.to_string(),
            price,
            volume: 1000.0,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs),
        }
    }

    #[test]
    fn test_push_and_latest() {
        let mut buffer = TickBuffer::new(10);
        buffer.push(tick("BTCUSDT", 100.0, 0));
        buffer.push(tick("BTCUSDT", 101.0, 1));

        assert_eq!(buffer.tick_count("BTCUSDT"), 2);
        assert_eq!(buffer.latest_price("BTCUSDT"), Some(101.0));
        assert_eq!(buffer.prices("BTCUSDT"), vec![100.0, 101.0]);
    }

    #[test]
    fn test_window_limit() {
        let mut buffer = TickBuffer::new(5);
        for i in 0..10 {
            buffer.push(tick("ETHUSDT", 100.0 + i as f64, i));
        }

        assert_eq!(buffer.tick_count("ETHUSDT"), 5);
        assert_eq!(buffer.prices("ETHUSDT")[0], 105.0);
    }

    #[test]
    fn test_rejects_stale_ticks() {
        let mut buffer = TickBuffer::new(5);
        assert!(buffer.push(tick("BTCUSDT", 100.0, 5)));
        assert!(!buffer.push(tick("BTCUSDT", 99.0, 5)));
        assert!(!buffer.push(tick("BTCUSDT", 98.0, 3)));
        assert_eq!(buffer.tick_count("BTCUSDT"), 1);
    }

    #[test]
    fn test_symbols_are_sorted() {
        let mut buffer = TickBuffer::new(5);
        buffer.push(tick("SOLUSDT", 1.0, 0));
        buffer.push(tick("BTCUSDT", 1.0, 0));
        buffer.push(tick("ETHUSDT", 1.0, 0));

        let symbols: Vec<&str> = buffer.symbols().collect();
        assert_eq!(symbols, vec!["BTCUSDT", "ETHUSDT", "SOLUSDT"]);
    }
}
