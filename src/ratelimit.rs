//! C1 — per-source rate limiter: token-bucket admission plus exponential
//! backoff with jitter on top, and a decaying "backoff floor" that
//! approximates a circuit breaker for a source in sustained failure.
//!
//! Generalized from per-IP HTTP throttling to per-source-key token buckets
//! with retry execution built in.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::StageError;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_second: f64,
    pub burst: u32,
    pub min_interval: Duration,
    pub base_delay: Duration,
    pub retry_max: Duration,
    pub max_retries: u32,
    pub backoff_floor_initial: Duration,
    pub backoff_floor_max: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 5.0,
            burst: 10,
            min_interval: Duration::from_millis(50),
            base_delay: Duration::from_millis(250),
            retry_max: Duration::from_secs(10),
            max_retries: 3,
            backoff_floor_initial: Duration::from_millis(0),
            backoff_floor_max: Duration::from_secs(30),
        }
    }
}

struct Bucket {
    config: RateLimitConfig,
    tokens: f64,
    last_refill: Instant,
    backoff_floor: Duration,
    consecutive_failures: u32,
}

impl Bucket {
    fn new(config: RateLimitConfig) -> Self {
        let burst = config.burst as f64;
        Self {
            config,
            tokens: burst,
            last_refill: Instant::now(),
            backoff_floor: Duration::from_millis(0),
            consecutive_failures: 0,
        }
    }

    /// Returns how long the caller must wait before a token is available,
    /// consuming one token if the wait is zero.
    fn poll_wait(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.config.requests_per_second)
            .min(self.config.burst as f64);

        let floor = self.backoff_floor;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            floor.max(self.config.min_interval)
        } else {
            let deficit = 1.0 - self.tokens;
            let bucket_wait = Duration::from_secs_f64(deficit / self.config.requests_per_second);
            bucket_wait.max(floor)
        }
    }

    fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        let raised = self
            .config
            .base_delay
            .saturating_mul(1 << self.consecutive_failures.min(6))
            .min(self.config.backoff_floor_max);
        self.backoff_floor = raised.max(self.backoff_floor);
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        // Decay the floor by half instead of dropping it instantly, so a
        // single lucky call doesn't erase a real outage's backoff.
        self.backoff_floor = self.backoff_floor / 2;
    }

    fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.backoff_floor = Duration::from_millis(0);
    }
}

/// One independent token bucket + backoff state per source key.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
    default_config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(default_config: RateLimitConfig) -> Arc<Self> {
        Arc::new(Self {
            buckets: Mutex::new(HashMap::new()),
            default_config,
        })
    }

    pub fn configure_source(&self, source_key: &str, config: RateLimitConfig) {
        self.buckets
            .lock()
            .insert(source_key.to_string(), Bucket::new(config));
    }

    /// Health probes call this to reset a source's breaker-like backoff
    /// floor once the source is confirmed reachable again.
    pub fn reset(&self, source_key: &str) {
        if let Some(bucket) = self.buckets.lock().get_mut(source_key) {
            bucket.reset();
        }
    }

    fn with_bucket<T>(&self, source_key: &str, f: impl FnOnce(&mut Bucket) -> T) -> T {
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry(source_key.to_string())
            .or_insert_with(|| Bucket::new(self.default_config.clone()));
        f(bucket)
    }

    /// Blocks (cooperatively) the caller until the source's bucket has a
    /// token available, honoring `deadline` — if waiting would exceed the
    /// deadline this returns `Err` without consuming a token.
    async fn acquire(&self, source_key: &str, deadline: Instant) -> Result<(), StageError> {
        loop {
            let wait = self.with_bucket(source_key, |b| b.poll_wait());
            if wait.is_zero() {
                return Ok(());
            }
            if Instant::now() + wait > deadline {
                return Err(StageError::Timeout);
            }
            tokio::time::sleep(wait).await;
        }
    }

    /// Gates `op` under the source's bucket and retries failures with
    /// exponential backoff + jitter, honoring `deadline` throughout. Only
    /// retryable `StageError`s (see `StageError::is_retryable`) are
    /// retried; everything else returns immediately.
    pub async fn execute<F, Fut, T>(
        &self,
        source_key: &str,
        deadline: Instant,
        mut op: F,
    ) -> Result<T, StageError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, StageError>>,
    {
        let max_retries = self.with_bucket(source_key, |b| b.config.max_retries);
        let base_delay = self.with_bucket(source_key, |b| b.config.base_delay);
        let retry_max = self.with_bucket(source_key, |b| b.config.retry_max);

        let mut attempt: u32 = 0;
        loop {
            self.acquire(source_key, deadline).await?;

            let remaining = deadline.saturating_duration_since(Instant::now());
            let result = tokio::time::timeout(remaining, op())
                .await
                .unwrap_or(Err(StageError::Timeout));

            match result {
                Ok(value) => {
                    self.with_bucket(source_key, |b| b.record_success());
                    return Ok(value);
                }
                Err(err) if !err.is_retryable() || attempt >= max_retries => {
                    self.with_bucket(source_key, |b| b.record_failure());
                    if attempt >= max_retries {
                        warn!(source = source_key, attempts = attempt + 1, "retries exhausted");
                    }
                    return Err(err);
                }
                Err(err) => {
                    self.with_bucket(source_key, |b| b.record_failure());
                    attempt += 1;

                    let exp = base_delay.saturating_mul(1 << attempt.min(10));
                    let capped = exp.min(retry_max);
                    let jitter = rand::thread_rng().gen_range(0.5..1.5);
                    let mut sleep_for = capped.mul_f64(jitter);
                    if let Some(retry_after) = err.retry_after() {
                        sleep_for = sleep_for.max(retry_after.min(retry_max));
                    }

                    if Instant::now() + sleep_for > deadline {
                        return Err(StageError::Timeout);
                    }
                    debug!(source = source_key, attempt, error = %err, delay_ms = sleep_for.as_millis() as u64, "retrying after backoff");
                    tokio::time::sleep(sleep_for).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquires_immediately_within_burst() {
        let limiter = RateLimiter::new(RateLimitConfig {
            requests_per_second: 5.0,
            burst: 3,
            min_interval: Duration::from_millis(0),
            base_delay: Duration::from_millis(10),
            retry_max: Duration::from_millis(100),
            max_retries: 1,
            backoff_floor_initial: Duration::from_millis(0),
            backoff_floor_max: Duration::from_secs(1),
        });
        let deadline = Instant::now() + Duration::from_secs(1);
        for _ in 0..3 {
            limiter.acquire("test", deadline).await.unwrap();
        }
    }

    #[tokio::test]
    async fn non_retryable_error_returns_immediately() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        let deadline = Instant::now() + Duration::from_secs(5);
        let calls = Arc::new(Mutex::new(0u32));
        let calls2 = calls.clone();
        let result: Result<(), StageError> = limiter
            .execute("test", deadline, move || {
                let calls = calls2.clone();
                async move {
                    *calls.lock() += 1;
                    Err(StageError::ContractMismatch("bad json".into()))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(*calls.lock(), 1);
    }

    #[tokio::test]
    async fn retryable_error_retries_then_succeeds() {
        let limiter = RateLimiter::new(RateLimitConfig {
            requests_per_second: 1000.0,
            burst: 10,
            min_interval: Duration::from_millis(0),
            base_delay: Duration::from_millis(1),
            retry_max: Duration::from_millis(50),
            max_retries: 3,
            backoff_floor_initial: Duration::from_millis(0),
            backoff_floor_max: Duration::from_millis(50),
        });
        let deadline = Instant::now() + Duration::from_secs(1);
        let calls = Arc::new(Mutex::new(0u32));
        let calls2 = calls.clone();
        let result = limiter
            .execute("test", deadline, move || {
                let calls = calls2.clone();
                async move {
                    let mut n = calls.lock();
                    *n += 1;
                    if *n < 3 {
                        Err(StageError::Unavailable)
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(*calls.lock(), 3);
    }

    #[tokio::test]
    async fn backoff_floor_raises_after_repeated_failures() {
        let limiter = RateLimiter::new(RateLimitConfig {
            requests_per_second: 1000.0,
            burst: 10,
            min_interval: Duration::from_millis(0),
            base_delay: Duration::from_millis(5),
            retry_max: Duration::from_millis(200),
            max_retries: 0,
            backoff_floor_initial: Duration::from_millis(0),
            backoff_floor_max: Duration::from_millis(500),
        });
        let deadline = Instant::now() + Duration::from_secs(2);
        for _ in 0..3 {
            let _: Result<(), StageError> = limiter
                .execute("flaky", deadline, || async { Err(StageError::Unavailable) })
                .await;
        }
        let floor = limiter.with_bucket("flaky", |b| b.backoff_floor);
        assert!(floor > Duration::from_millis(0));

        limiter.reset("flaky");
        let floor = limiter.with_bucket("flaky", |b| b.backoff_floor);
        assert_eq!(floor, Duration::from_millis(0));
    }
}
