use chrono::{DateTime, Utc};
use std::fmt::Debug;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Time source for the engine.
///
/// `now` stamps records; `monotonic` drives timeouts and never goes backwards.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;
    fn monotonic(&self) -> Duration;
}

/// Wall clock for records, `Instant` for timeouts
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Manually driven clock for backtests and tests
#[derive(Debug)]
pub struct SimulatedClock {
    origin: DateTime<Utc>,
    current: Mutex<DateTime<Utc>>,
}

impl SimulatedClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            origin: start,
            current: Mutex::new(start),
        }
    }

    /// Move to `at`. Earlier times are ignored so the clock stays monotonic.
    pub fn set(&self, at: DateTime<Utc>) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if at > *current {
            *current = at;
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if let Ok(step) = chrono::Duration::from_std(by) {
            *current += step;
        }
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn monotonic(&self) -> Duration {
        (self.now() - self.origin).to_std().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_simulated_clock_never_goes_backwards() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = SimulatedClock::new(start);

        clock.set(start + chrono::Duration::seconds(10));
        clock.set(start + chrono::Duration::seconds(5));

        assert_eq!(clock.now(), start + chrono::Duration::seconds(10));
        assert_eq!(clock.monotonic(), Duration::from_secs(10));
    }

    #[test]
    fn test_simulated_clock_advance() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = SimulatedClock::new(start);
        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.monotonic(), Duration::from_secs(90));
    }

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.monotonic();
        let b = clock.monotonic();
        assert!(b >= a);
    }
}
