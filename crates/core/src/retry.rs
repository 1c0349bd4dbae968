use crate::error::ServiceError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::warn;

/// Exponential backoff for transient API errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn no_delay(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Runs `operation` until it succeeds, fails with a non-transient
    /// error, or the attempt budget is spent.
    pub async fn run<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, ServiceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && attempt < attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        operation = label,
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "transient error, retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

/// Token bucket shared by every worker that calls an external API.
#[derive(Clone)]
pub struct RateLimiter {
    state: Option<Arc<Mutex<RateState>>>,
    capacity: f64,
    refill_per_sec: f64,
}

struct RateState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// `max_per_minute == 0` disables limiting.
    pub fn new(max_per_minute: u32, burst: u32) -> Self {
        if max_per_minute == 0 {
            return Self::unlimited();
        }
        let capacity = burst.max(1) as f64;
        Self {
            state: Some(Arc::new(Mutex::new(RateState {
                tokens: capacity,
                last_refill: Instant::now(),
            }))),
            capacity,
            refill_per_sec: max_per_minute as f64 / 60.0,
        }
    }

    pub fn unlimited() -> Self {
        Self {
            state: None,
            capacity: 0.0,
            refill_per_sec: 0.0,
        }
    }

    /// Waits until a request may be sent.
    pub async fn acquire(&self) {
        let Some(state) = &self.state else {
            return;
        };

        let mut guard = state.lock().await;
        loop {
            let now = Instant::now();
            let elapsed = now.duration_since(guard.last_refill).as_secs_f64();
            guard.last_refill = now;
            guard.tokens = (guard.tokens + elapsed * self.refill_per_sec).min(self.capacity);

            if guard.tokens >= 1.0 {
                guard.tokens -= 1.0;
                return;
            }

            let missing = 1.0 - guard.tokens;
            sleep(Duration::from_secs_f64(missing / self.refill_per_sec)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn throttled() -> ServiceError {
        ServiceError::BackendResponse {
            backend: "embeddings".to_string(),
            status: StatusCode::TOO_MANY_REQUESTS,
            details: "slow down".to_string(),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff(3), Duration::from_millis(2000));
        assert_eq!(policy.backoff(10), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = RetryPolicy::no_delay(3)
            .run("embed", || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(throttled())
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.expect("third attempt succeeds"), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = RetryPolicy::no_delay(3)
            .run("embed", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(throttled())
            })
            .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = RetryPolicy::no_delay(5)
            .run("upsert", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ServiceError::Request("bad payload".to_string()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_spaces_requests_after_burst() {
        let limiter = RateLimiter::new(60, 2);
        let started = Instant::now();

        for _ in 0..4 {
            limiter.acquire().await;
        }

        assert!(started.elapsed() >= Duration::from_millis(1900));
    }

    #[tokio::test]
    async fn unlimited_limiter_never_waits() {
        let limiter = RateLimiter::new(0, 0);
        for _ in 0..100 {
            limiter.acquire().await;
        }
    }
}
