//! Token bucket that spaces dials to `calls_per_minute`.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub struct PacingGate {
    capacity: f64,
    tokens: f64,
    per_second: f64,
    last_refill: Instant,
}

impl PacingGate {
    /// A full bucket of `burst` tokens refilling at `calls_per_minute`
    pub fn new(calls_per_minute: u32, burst: u32, now: Instant) -> Self {
        let capacity = burst.max(1) as f64;
        Self {
            capacity,
            tokens: capacity,
            per_second: calls_per_minute.max(1) as f64 / 60.0,
            last_refill: now,
        }
    }

    /// Change the refill rate, keeping accumulated tokens
    pub fn set_rate(&mut self, calls_per_minute: u32, now: Instant) {
        self.refill(now);
        self.per_second = calls_per_minute.max(1) as f64 / 60.0;
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.per_second).min(self.capacity);
        self.last_refill = now;
    }

    /// Time until a token is available; zero if one is available now
    pub fn ready_in(&mut self, now: Instant) -> Duration {
        self.refill(now);
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.per_second)
        }
    }

    /// Take a token if one is available
    pub fn try_consume(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_call_per_interval_at_burst_one() {
        let start = Instant::now();
        let mut gate = PacingGate::new(30, 1, start);

        assert!(gate.try_consume(start));
        assert!(!gate.try_consume(start));
        assert_eq!(gate.ready_in(start), Duration::from_secs(2));

        let later = start + Duration::from_secs(2);
        assert_eq!(gate.ready_in(later), Duration::ZERO);
        assert!(gate.try_consume(later));
    }

    #[test]
    fn burst_allows_back_to_back_dials() {
        let start = Instant::now();
        let mut gate = PacingGate::new(60, 3, start);
        assert!(gate.try_consume(start));
        assert!(gate.try_consume(start));
        assert!(gate.try_consume(start));
        assert!(!gate.try_consume(start));
    }

    #[test]
    fn tokens_never_exceed_capacity() {
        let start = Instant::now();
        let mut gate = PacingGate::new(600, 2, start);
        let much_later = start + Duration::from_secs(3600);
        assert!(gate.try_consume(much_later));
        assert!(gate.try_consume(much_later));
        assert!(!gate.try_consume(much_later));
    }

    #[test]
    fn rate_change_applies_to_next_refill() {
        let start = Instant::now();
        let mut gate = PacingGate::new(60, 1, start);
        assert!(gate.try_consume(start));
        gate.set_rate(6, start);
        assert_eq!(gate.ready_in(start), Duration::from_secs(10));
    }
}
