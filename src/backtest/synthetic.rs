use crate::error::Error;
use crate::models::Tick;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::str::FromStr;

/// Shape of a generated price series
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketScenario {
    /// Steady uptrend with noise (+2% daily average)
    Uptrend,
    /// Steady downtrend with noise (-2% daily average)
    Downtrend,
    /// Mean-reverting chop around the base price
    Sideways,
    /// Large swings, up to ±5% per tick
    Volatile,
    /// Flat, then a 30% drop over a few ticks, then a weak recovery
    Crash,
}

impl MarketScenario {
    pub const ALL: [MarketScenario; 5] = [
        MarketScenario::Uptrend,
        MarketScenario::Downtrend,
        MarketScenario::Sideways,
        MarketScenario::Volatile,
        MarketScenario::Crash,
    ];
}

impl fmt::Display for MarketScenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MarketScenario::Uptrend => "uptrend",
            MarketScenario::Downtrend => "downtrend",
            MarketScenario::Sideways => "sideways",
            MarketScenario::Volatile => "volatile",
            MarketScenario::Crash => "crash",
        };
        f.write_str(name)
    }
}

impl FromStr for MarketScenario {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MarketScenario::ALL
            .into_iter()
            .find(|scenario| scenario.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                Error::Config(format!(
                    "unknown scenario '{}' (expected uptrend, downtrend, sideways, volatile or crash)",
                    s
                ))
            })
    }
}

/// Seeded generator of synthetic tick series for backtests.
///
/// Same seed, scenario and length always give the same ticks. Series start
/// at 2024-01-01T00:00:00Z so output never depends on the wall clock.
pub struct SyntheticTickGenerator {
    rng: StdRng,
    base_price: f64,
    base_volume: f64,
    start: DateTime<Utc>,
    interval: Duration,
}

impl SyntheticTickGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            base_price: 150.0,
            base_volume: 1_000.0,
            start: Utc
                .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
                .single()
                .unwrap_or_default(),
            interval: Duration::minutes(1),
        }
    }

    pub fn with_base_price(mut self, price: f64) -> Self {
        self.base_price = price;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn generate(
        &mut self,
        scenario: MarketScenario,
        exchange: &str,
        symbol: &str,
        count: usize,
    ) -> Vec<Tick> {
        let prices = match scenario {
            MarketScenario::Uptrend => self.trend(count, 0.02),
            MarketScenario::Downtrend => self.trend(count, -0.02),
            MarketScenario::Sideways => self.sideways(count),
            MarketScenario::Volatile => self.volatile(count),
            MarketScenario::Crash => self.crash(count),
        };

        prices
            .into_iter()
            .enumerate()
            .map(|(i, price)| Tick {
                exchange: exchange.to_string(),
                symbol: symbol.to_string(),
                price,
                volume: self.base_volume * self.rng.gen_range(0.5..1.5),
                timestamp: self.start + self.interval * i as i32,
            })
            .collect()
    }

    /// `daily` drift spread over the ticks of one day, with ±0.1% noise
    fn trend(&mut self, count: usize, daily: f64) -> Vec<f64> {
        let per_day = (24 * 60 * 60) as f64 / self.interval.num_seconds().max(1) as f64;
        let drift = daily / per_day;
        let mut price = self.base_price;

        (0..count)
            .map(|_| {
                price += price * drift + price * self.rng.gen_range(-0.001..0.001);
                price
            })
            .collect()
    }

    fn sideways(&mut self, count: usize) -> Vec<f64> {
        let mean = self.base_price;
        let mut price = mean;

        (0..count)
            .map(|_| {
                let reversion = (mean - price) * 0.1;
                price += reversion + price * self.rng.gen_range(-0.01..0.01);
                price
            })
            .collect()
    }

    fn volatile(&mut self, count: usize) -> Vec<f64> {
        let floor = self.base_price * 0.5;
        let mut price = self.base_price;

        (0..count)
            .map(|_| {
                price += price * self.rng.gen_range(-0.05..0.05);
                price = price.max(floor);
                price
            })
            .collect()
    }

    fn crash(&mut self, count: usize) -> Vec<f64> {
        let crash_at = count / 3;
        let crash_len = (count / 20).max(1);
        let per_tick = 0.30 / crash_len as f64;
        let mut price = self.base_price;

        (0..count)
            .map(|i| {
                let noise = price * self.rng.gen_range(-0.002..0.002);
                if i >= crash_at && i < crash_at + crash_len {
                    price -= self.base_price * per_tick;
                } else if i >= crash_at + crash_len {
                    price += price * 0.0005;
                }
                price = (price + noise).max(0.01);
                price
            })
            .collect()
    }
}
