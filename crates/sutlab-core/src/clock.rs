use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

/// Time source for every wait the controller performs.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            thread::sleep(duration);
        }
    }
}

/// Virtual clock: `sleep` returns immediately and moves time forward.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    state: Mutex<ManualClockState>,
}

#[derive(Debug, Default)]
struct ManualClockState {
    offset: Duration,
    sleeps: Vec<Duration>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            state: Mutex::new(ManualClockState::default()),
        }
    }

    pub fn advance(&self, duration: Duration) {
        if let Ok(mut state) = self.state.lock() {
            state.offset += duration;
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.state
            .lock()
            .map(|state| state.offset)
            .unwrap_or_default()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.state
            .lock()
            .map(|state| state.sleeps.clone())
            .unwrap_or_default()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        if let Ok(mut state) = self.state.lock() {
            state.offset += duration;
            state.sleeps.push(duration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_on_sleep_and_records_it() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.sleep(Duration::from_secs(180));
        clock.advance(Duration::from_secs(20));
        assert_eq!(clock.now() - start, Duration::from_secs(200));
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(180)]);
    }
}
