use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(1);
/// Longest single pause; the window is re-checked after each one.
const PAUSE_SLICE: Duration = Duration::from_millis(20);

/// Received-throughput shaper over a one-second window.
///
/// Rough global shaping, not fairness: once the byte budget for the
/// current window is spent, the reactor sleeps a slice at a time until
/// the window rolls over.
#[derive(Debug)]
pub(crate) struct Throttle {
    budget: Option<u64>,
    window_start: Instant,
    received: u64,
}

impl Throttle {
    pub(crate) fn new(budget: Option<u64>) -> Self {
        Self {
            budget,
            window_start: Instant::now(),
            received: 0,
        }
    }

    /// Account bytes read off the wire.
    pub(crate) fn on_read(&mut self, bytes: usize, now: Instant) {
        self.roll(now);
        self.received = self.received.saturating_add(bytes as u64);
    }

    /// How long to pause before reading again, if the budget is spent.
    pub(crate) fn pause(&mut self, now: Instant) -> Option<Duration> {
        let budget = self.budget?;
        self.roll(now);
        if self.received <= budget {
            return None;
        }
        let window_end = self.window_start + WINDOW;
        let remaining = window_end.saturating_duration_since(now);
        if remaining.is_zero() {
            return None;
        }
        Some(remaining.min(PAUSE_SLICE))
    }

    fn roll(&mut self, now: Instant) {
        if now.duration_since(self.window_start) >= WINDOW {
            self.window_start = now;
            self.received = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_never_pauses() {
        let mut throttle = Throttle::new(None);
        let now = Instant::now();
        throttle.on_read(usize::MAX, now);
        assert_eq!(throttle.pause(now), None);
    }

    #[test]
    fn test_pause_when_budget_spent() {
        let mut throttle = Throttle::new(Some(1000));
        let now = Instant::now();
        throttle.on_read(800, now);
        assert_eq!(throttle.pause(now), None);
        throttle.on_read(300, now);
        let pause = throttle.pause(now).unwrap();
        assert!(pause <= PAUSE_SLICE);
        assert!(!pause.is_zero());
    }

    #[test]
    fn test_window_roll_resets_budget() {
        let mut throttle = Throttle::new(Some(1000));
        let now = Instant::now();
        throttle.on_read(2000, now);
        assert!(throttle.pause(now).is_some());
        let later = now + Duration::from_millis(1100);
        assert_eq!(throttle.pause(later), None);
        throttle.on_read(100, later);
        assert_eq!(throttle.pause(later), None);
    }
}
