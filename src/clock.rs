use std::cell::Cell;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Monotonic time source for the cooperative scheduler.
///
/// All receivers are `&self` so the same clock can be shared between the
/// timer-driven tick path and the main polling loop without aliasing issues.
/// `delay_ms` is a suspension point: the rest of the device is unresponsive
/// while it runs, so callers keep delays short and bounded.
pub trait Clock {
    fn now_ms(&self) -> u64;

    fn delay_ms(&self, ms: u64);

    /// Unix time in seconds, if wall-clock time has been synchronized.
    /// Telemetry omits its timestamp field when this returns `None`.
    fn unix_time(&self) -> Option<i64> {
        None
    }
}

/// Host clock backed by `Instant`. Milliseconds count from construction.
#[derive(Debug)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn delay_ms(&self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }

    fn unix_time(&self) -> Option<i64> {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .ok()
            .map(|d| d.as_secs() as i64)
    }
}

/// Deterministic clock for tests and simulation. `delay_ms` advances time
/// instead of sleeping, which keeps bounded-budget loops terminating.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: Cell<u64>,
    unix_s: Cell<Option<i64>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(now_ms: u64) -> Self {
        let clock = Self::default();
        clock.now_ms.set(now_ms);
        clock
    }

    pub fn advance_ms(&self, ms: u64) {
        self.now_ms.set(self.now_ms.get().saturating_add(ms));
    }

    pub fn set_unix_time(&self, unix_s: Option<i64>) {
        self.unix_s.set(unix_s);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.get()
    }

    fn delay_ms(&self, ms: u64) {
        self.advance_ms(ms);
    }

    fn unix_time(&self) -> Option<i64> {
        self.unix_s.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_on_delay() {
        let clock = ManualClock::new();
        assert_eq!(clock.now_ms(), 0);
        clock.delay_ms(250);
        assert_eq!(clock.now_ms(), 250);
        clock.advance_ms(50);
        assert_eq!(clock.now_ms(), 300);
    }

    #[test]
    fn manual_clock_wall_time_defaults_to_unknown() {
        let clock = ManualClock::new();
        assert_eq!(clock.unix_time(), None);
        clock.set_unix_time(Some(1_700_000_000));
        assert_eq!(clock.unix_time(), Some(1_700_000_000));
    }
}
