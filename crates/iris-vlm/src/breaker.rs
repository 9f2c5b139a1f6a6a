//! Failure-burst circuit breaker with an injectable time source.
//!
//! Counts failures inside a rolling window; once the threshold is reached
//! the breaker trips and refuses work for a cooldown period. Used by the
//! VLM lifecycle manager (3 crashes in 5 minutes) and by the gateway's
//! agent-worker supervision (3 crashes in 10 minutes).

use std::time::{Duration, Instant};

/// Time source seam so breaker behavior is deterministic in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall-clock time source used in production.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Rolling-window circuit breaker.
pub struct CircuitBreaker<C: Clock = SystemClock> {
    clock: C,
    /// Failures needed inside the window to trip.
    threshold: u32,
    /// Rolling window length.
    window: Duration,
    /// How long the breaker stays tripped.
    cooldown: Duration,
    failures: Vec<Instant>,
    tripped_until: Option<Instant>,
}

impl CircuitBreaker<SystemClock> {
    pub fn new(threshold: u32, window: Duration, cooldown: Duration) -> Self {
        Self::with_clock(SystemClock, threshold, window, cooldown)
    }
}

impl<C: Clock> CircuitBreaker<C> {
    pub fn with_clock(clock: C, threshold: u32, window: Duration, cooldown: Duration) -> Self {
        Self {
            clock,
            threshold,
            window,
            cooldown,
            failures: Vec::new(),
            tripped_until: None,
        }
    }

    /// Record one failure. Returns `true` if this failure tripped the breaker.
    pub fn record_failure(&mut self) -> bool {
        let now = self.clock.now();
        self.failures.push(now);
        self.prune(now);
        if self.failures.len() as u32 >= self.threshold && self.tripped_until.is_none() {
            self.tripped_until = Some(now + self.cooldown);
            return true;
        }
        false
    }

    /// Whether the breaker currently refuses work.
    pub fn is_tripped(&mut self) -> bool {
        let now = self.clock.now();
        if let Some(until) = self.tripped_until {
            if now < until {
                return true;
            }
            // Trip expired: forget the burst that caused it.
            self.tripped_until = None;
            self.failures.clear();
        }
        false
    }

    /// Failures currently inside the rolling window.
    pub fn failure_count(&mut self) -> u32 {
        let now = self.clock.now();
        self.prune(now);
        self.failures.len() as u32
    }

    /// Operator reset: clear all recorded failures and any active trip.
    pub fn reset(&mut self) {
        self.failures.clear();
        self.tripped_until = None;
    }

    fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.failures.retain(|t| now.duration_since(*t) <= window);
    }
}
