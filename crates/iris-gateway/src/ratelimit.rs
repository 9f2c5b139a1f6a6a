//! Per-client token-bucket rate limiting.
//!
//! Two budgets: a general one for most endpoints and a much tighter one for
//! lifecycle endpoints (`/agent/start|stop|restart`, `/model/switch`).
//! `/health` is exempt entirely. The clock is injectable so refill behavior
//! is deterministic under test.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use iris_vlm::{Clock, SystemClock};

/// Which budget a request draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestClass {
    General,
    Lifecycle,
}

/// Classify a request path. Lifecycle endpoints spawn or kill processes,
/// so they get the tight budget.
pub fn classify_path(path: &str) -> RequestClass {
    match path {
        "/agent/start" | "/agent/stop" | "/agent/restart" | "/model/switch" => {
            RequestClass::Lifecycle
        }
        _ => RequestClass::General,
    }
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket limiter keyed by `(client, class)`.
pub struct RateLimiter<C: Clock = SystemClock> {
    clock: C,
    general_per_minute: u32,
    lifecycle_per_minute: u32,
    buckets: Mutex<HashMap<(String, RequestClass), Bucket>>,
}

impl RateLimiter<SystemClock> {
    pub fn new(general_per_minute: u32, lifecycle_per_minute: u32) -> Self {
        Self::with_clock(SystemClock, general_per_minute, lifecycle_per_minute)
    }
}

impl<C: Clock> RateLimiter<C> {
    pub fn with_clock(clock: C, general_per_minute: u32, lifecycle_per_minute: u32) -> Self {
        Self {
            clock,
            general_per_minute,
            lifecycle_per_minute,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Try to take one token. `false` means 429.
    pub fn allow(&self, client: &str, class: RequestClass) -> bool {
        let capacity = match class {
            RequestClass::General => self.general_per_minute,
            RequestClass::Lifecycle => self.lifecycle_per_minute,
        } as f64;
        let refill_per_sec = capacity / 60.0;
        let now = self.clock.now();

        let mut buckets = match self.buckets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let bucket = buckets
            .entry((client.to_string(), class))
            .or_insert_with(|| Bucket {
                tokens: capacity,
                last_refill: now,
            });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * refill_per_sec).min(capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Clone)]
    struct MockClock {
        base: Instant,
        offset_ms: Arc<AtomicU64>,
    }

    impl MockClock {
        fn new() -> Self {
            Self {
                base: Instant::now(),
                offset_ms: Arc::new(AtomicU64::new(0)),
            }
        }

        fn advance(&self, d: Duration) {
            self.offset_ms
                .fetch_add(d.as_millis() as u64, Ordering::SeqCst);
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> Instant {
            self.base + Duration::from_millis(self.offset_ms.load(Ordering::SeqCst))
        }
    }

    #[test]
    fn lifecycle_paths_classified() {
        assert_eq!(classify_path("/agent/start"), RequestClass::Lifecycle);
        assert_eq!(classify_path("/agent/restart"), RequestClass::Lifecycle);
        assert_eq!(classify_path("/model/switch"), RequestClass::Lifecycle);
        assert_eq!(classify_path("/task"), RequestClass::General);
        assert_eq!(classify_path("/state"), RequestClass::General);
    }

    #[test]
    fn burst_up_to_capacity_then_reject() {
        let clock = MockClock::new();
        let limiter = RateLimiter::with_clock(clock, 120, 10);

        for _ in 0..10 {
            assert!(limiter.allow("client", RequestClass::Lifecycle));
        }
        assert!(!limiter.allow("client", RequestClass::Lifecycle));
    }

    #[test]
    fn tokens_refill_over_time() {
        let clock = MockClock::new();
        let limiter = RateLimiter::with_clock(clock.clone(), 120, 10);

        for _ in 0..10 {
            limiter.allow("c", RequestClass::Lifecycle);
        }
        assert!(!limiter.allow("c", RequestClass::Lifecycle));

        // 10/min = one token every 6 seconds.
        clock.advance(Duration::from_secs(6));
        assert!(limiter.allow("c", RequestClass::Lifecycle));
        assert!(!limiter.allow("c", RequestClass::Lifecycle));
    }

    #[test]
    fn clients_have_independent_buckets() {
        let clock = MockClock::new();
        let limiter = RateLimiter::with_clock(clock, 120, 10);

        for _ in 0..10 {
            assert!(limiter.allow("a", RequestClass::Lifecycle));
        }
        assert!(!limiter.allow("a", RequestClass::Lifecycle));
        assert!(limiter.allow("b", RequestClass::Lifecycle), "b unaffected");
    }

    #[test]
    fn classes_do_not_share_budgets() {
        let clock = MockClock::new();
        let limiter = RateLimiter::with_clock(clock, 120, 10);

        for _ in 0..10 {
            limiter.allow("c", RequestClass::Lifecycle);
        }
        assert!(!limiter.allow("c", RequestClass::Lifecycle));
        assert!(limiter.allow("c", RequestClass::General), "general budget intact");
    }

    #[test]
    fn refill_never_exceeds_capacity() {
        let clock = MockClock::new();
        let limiter = RateLimiter::with_clock(clock.clone(), 120, 10);

        assert!(limiter.allow("c", RequestClass::Lifecycle));
        clock.advance(Duration::from_secs(3600));
        // After an hour the bucket holds 10 again, not 600.
        for _ in 0..10 {
            assert!(limiter.allow("c", RequestClass::Lifecycle));
        }
        assert!(!limiter.allow("c", RequestClass::Lifecycle));
    }
}
