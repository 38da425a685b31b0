//! Upstream guards - rate limiting, circuit breaking, retries, ceilings
//!
//! Cross-session protection for the three capability ports. Each upstream
//! gets a token bucket, a three-state breaker (closed / open / half-open),
//! a hard per-call ceiling, and exponential-backoff retries for idempotent
//! calls. Generation connects through `run_once`: once streaming has begun,
//! retry is unsafe and the turn errors out instead.

use parking_lot::Mutex;
use std::future::Future;
use std::time::{Duration, Instant};

use crate::ports::PortError;

/// Token-bucket rate limiter. Concurrency-safe and shared across sessions.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity: capacity.max(1.0),
            refill_per_sec: refill_per_sec.max(0.001),
            state: Mutex::new(BucketState {
                tokens: capacity.max(1.0),
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Wait until a token is available.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock();
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.refill_per_sec)
            };
            tokio::time::sleep(wait).await;
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen,
}

/// Three-state circuit breaker: trips after a failure threshold, refuses
/// calls for a cooldown, then lets one probe through.
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            state: Mutex::new(BreakerState::Closed { failures: 0 }),
        }
    }

    /// Whether a call may proceed right now.
    pub fn try_call(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            BreakerState::Closed { .. } | BreakerState::HalfOpen => true,
            BreakerState::Open { since } => {
                if since.elapsed() >= self.cooldown {
                    *state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        *self.state.lock() = BreakerState::Closed { failures: 0 };
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        *state = match *state {
            BreakerState::HalfOpen => BreakerState::Open { since: Instant::now() },
            BreakerState::Closed { failures } => {
                if failures + 1 >= self.failure_threshold {
                    BreakerState::Open { since: Instant::now() }
                } else {
                    BreakerState::Closed { failures: failures + 1 }
                }
            }
            open => open,
        };
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.state.lock(), BreakerState::Open { .. })
    }
}

/// Exponential backoff schedule for idempotent upstream calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1),
    /// capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("Circuit breaker open for {0}")]
    CircuitOpen(&'static str),
    #[error(transparent)]
    Port(#[from] PortError),
}

/// One upstream's full protection stack.
pub struct UpstreamGuard {
    name: &'static str,
    bucket: TokenBucket,
    breaker: CircuitBreaker,
    call_timeout: Duration,
    retry: RetryPolicy,
}

impl UpstreamGuard {
    pub fn new(
        name: &'static str,
        bucket: TokenBucket,
        breaker: CircuitBreaker,
        call_timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            name,
            bucket,
            breaker,
            call_timeout,
            retry,
        }
    }

    /// Run an idempotent call with the full retry schedule.
    pub async fn run<T, Fut, F>(&self, op: F) -> Result<T, UpstreamError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PortError>>,
    {
        self.run_inner(op, self.retry.attempts).await
    }

    /// Run a call that must not be retried (generation after streaming may
    /// have begun).
    pub async fn run_once<T, Fut, F>(&self, op: F) -> Result<T, UpstreamError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PortError>>,
    {
        self.run_inner(op, 1).await
    }

    async fn run_inner<T, Fut, F>(&self, mut op: F, max_attempts: u32) -> Result<T, UpstreamError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PortError>>,
    {
        let mut attempt = 0;
        loop {
            if !self.breaker.try_call() {
                return Err(UpstreamError::CircuitOpen(self.name));
            }
            self.bucket.acquire().await;

            let err = match tokio::time::timeout(self.call_timeout, op()).await {
                Ok(Ok(value)) => {
                    self.breaker.record_success();
                    return Ok(value);
                }
                Ok(Err(err)) => err,
                Err(_) => PortError::Timeout(self.call_timeout.as_millis() as u64),
            };

            self.breaker.record_failure();
            attempt += 1;
            if attempt >= max_attempts || !err.retryable() {
                return Err(UpstreamError::Port(err));
            }

            let delay = self.retry.delay_for(attempt);
            log::warn!(
                "[Upstream] {} attempt {attempt} failed ({err}), retrying in {}ms",
                self.name,
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn guard(retry: RetryPolicy, threshold: u32) -> UpstreamGuard {
        UpstreamGuard::new(
            "test",
            TokenBucket::new(100.0, 100.0),
            CircuitBreaker::new(threshold, Duration::from_secs(60)),
            Duration::from_secs(5),
            retry,
        )
    }

    #[test]
    fn bucket_exhausts_and_refuses() {
        let bucket = TokenBucket::new(2.0, 0.001);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn breaker_trips_after_threshold_and_recovers() {
        let breaker = CircuitBreaker::new(2, Duration::ZERO);
        assert!(breaker.try_call());

        breaker.record_failure();
        assert!(!breaker.is_open());
        breaker.record_failure();
        assert!(breaker.is_open());

        // Cooldown of zero: next call is the half-open probe
        assert!(breaker.try_call());
        breaker.record_failure();
        assert!(breaker.is_open());

        assert!(breaker.try_call());
        breaker.record_success();
        assert!(!breaker.is_open());
        assert!(breaker.try_call());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.delay_for(1), Duration::from_secs(1));
        assert_eq!(retry.delay_for(2), Duration::from_secs(2));
        assert_eq!(retry.delay_for(3), Duration::from_secs(4));
        assert_eq!(retry.delay_for(4), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_then_succeeds() {
        let guard = guard(
            RetryPolicy {
                attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            10,
        );
        let calls = AtomicU32::new(0);

        let result: Result<u32, _> = guard
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(PortError::Transport("connection reset".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_fast() {
        let guard = guard(RetryPolicy::default(), 10);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = guard
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(PortError::Status {
                        status: 400,
                        message: "bad request".into(),
                    })
                }
            })
            .await;

        assert!(matches!(
            result,
            Err(UpstreamError::Port(PortError::Status { status: 400, .. }))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_once_never_retries() {
        let guard = guard(RetryPolicy::default(), 10);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = guard
            .run_once(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(PortError::Transport("reset".into())) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn open_breaker_refuses_without_calling() {
        let guard = guard(RetryPolicy::default(), 1);
        let _: Result<(), _> = guard
            .run_once(|| async { Err(PortError::Transport("down".into())) })
            .await;

        let calls = AtomicU32::new(0);
        let result: Result<(), _> = guard
            .run_once(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert!(matches!(result, Err(UpstreamError::CircuitOpen("test"))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
