//! Per-executor circuit breaker
//!
//! Each executor carries its own breaker so one misbehaving slot is isolated
//! while the rest of the pool keeps draining the queue.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation
    Closed,
    /// Refusing work until the cooldown elapses
    Open,
    /// Cooldown elapsed; exactly one probe is in flight
    HalfOpen,
}

/// Decision returned by [`CircuitBreaker::check`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    /// Proceed normally
    Allow,
    /// Proceed, but this invocation is the half-open probe
    Probe,
    /// Refuse work; retry after the given delay
    Refuse { retry_in: Duration },
}

/// Per-executor breaker with doubling cooldown
#[derive(Debug)]
pub struct CircuitBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    failure_threshold: u32,
    /// Current cooldown; doubles on a failed probe
    cooldown: Duration,
    base_cooldown: Duration,
    max_cooldown: Duration,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, open_cooldown: Duration, max_cooldown: Duration) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            failure_threshold,
            cooldown: open_cooldown,
            base_cooldown: open_cooldown,
            max_cooldown,
            opened_at: None,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Consult the breaker before taking work.
    ///
    /// An open breaker whose cooldown has elapsed moves to half-open and
    /// grants a single probe.
    pub fn check(&mut self) -> BreakerDecision {
        match self.state {
            BreakerState::Closed => BreakerDecision::Allow,
            BreakerState::HalfOpen => BreakerDecision::Probe,
            BreakerState::Open => {
                let elapsed = self.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.cooldown {
                    debug!("breaker cooldown elapsed, half-open probe");
                    self.state = BreakerState::HalfOpen;
                    BreakerDecision::Probe
                } else {
                    BreakerDecision::Refuse {
                        retry_in: self.cooldown - elapsed,
                    }
                }
            }
        }
    }

    /// Record a successful invocation
    pub fn on_success(&mut self) {
        match self.state {
            BreakerState::HalfOpen => {
                debug!("probe succeeded, breaker closed");
                self.state = BreakerState::Closed;
                self.consecutive_failures = 0;
                self.cooldown = self.base_cooldown;
                self.opened_at = None;
            }
            _ => {
                self.consecutive_failures = 0;
            }
        }
    }

    /// Record a transient failure
    pub fn on_failure(&mut self) {
        match self.state {
            BreakerState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.failure_threshold {
                    warn!(
                        failures = self.consecutive_failures,
                        cooldown_secs = self.cooldown.as_secs(),
                        "breaker opened"
                    );
                    self.state = BreakerState::Open;
                    self.opened_at = Some(Instant::now());
                }
            }
            BreakerState::HalfOpen => {
                self.cooldown = (self.cooldown * 2).min(self.max_cooldown);
                warn!(cooldown_secs = self.cooldown.as_secs(), "probe failed, breaker re-opened");
                self.state = BreakerState::Open;
                self.opened_at = Some(Instant::now());
            }
            BreakerState::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(5, Duration::from_millis(50), Duration::from_millis(400))
    }

    #[test]
    fn test_closed_allows() {
        let mut b = breaker();
        assert_eq!(b.check(), BreakerDecision::Allow);
    }

    #[test]
    fn test_opens_at_threshold() {
        let mut b = breaker();
        for _ in 0..4 {
            b.on_failure();
            assert_eq!(b.state(), BreakerState::Closed);
        }
        b.on_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(matches!(b.check(), BreakerDecision::Refuse { .. }));
    }

    #[test]
    fn test_success_resets_counter() {
        let mut b = breaker();
        for _ in 0..4 {
            b.on_failure();
        }
        b.on_success();
        for _ in 0..4 {
            b.on_failure();
        }
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_probe_after_cooldown() {
        let mut b = breaker();
        for _ in 0..5 {
            b.on_failure();
        }
        assert_eq!(b.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(b.check(), BreakerDecision::Probe);
        assert_eq!(b.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn test_probe_success_closes() {
        let mut b = breaker();
        for _ in 0..5 {
            b.on_failure();
        }
        std::thread::sleep(Duration::from_millis(60));
        b.check();
        b.on_success();
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.check(), BreakerDecision::Allow);
    }

    #[test]
    fn test_probe_failure_doubles_cooldown() {
        let mut b = breaker();
        for _ in 0..5 {
            b.on_failure();
        }
        std::thread::sleep(Duration::from_millis(60));
        b.check();
        b.on_failure();
        assert_eq!(b.state(), BreakerState::Open);

        // Cooldown doubled to 100ms; 60ms is not enough
        std::thread::sleep(Duration::from_millis(60));
        assert!(matches!(b.check(), BreakerDecision::Refuse { .. }));

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(b.check(), BreakerDecision::Probe);
    }

    #[test]
    fn test_cooldown_capped() {
        let mut b = CircuitBreaker::new(1, Duration::from_millis(100), Duration::from_millis(150));
        b.on_failure();
        for _ in 0..5 {
            std::thread::sleep(Duration::from_millis(160));
            assert_eq!(b.check(), BreakerDecision::Probe);
            b.on_failure();
        }
        // Doubling is capped, so the probe window still opens within the max
        std::thread::sleep(Duration::from_millis(160));
        assert_eq!(b.check(), BreakerDecision::Probe);
    }
}
