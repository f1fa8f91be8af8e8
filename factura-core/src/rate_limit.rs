//! Token bucket shared by every submitter of a deployment.
//!
//! The bucket record lives in a [`BucketStore`]. Each operation takes the store's
//! per-key lock, refills from the elapsed time, optionally takes a token and writes
//! back, all before the lock is released.
pub mod store;

use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

pub use store::{BucketGuard, BucketState, BucketStore, FileBucketStore, InMemoryBucketStore};

use crate::{
    clock::{Clock, SystemClock},
    config::{ConfigError, RateLimitConfig},
    ErrorKind,
};

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("Rate limit token not acquired after {waited:?}")]
    Timeout { waited: Duration },
    #[error("Rate limiter storage error: {0}")]
    Storage(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl RateLimitError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RateLimitError::Timeout { .. })
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RateLimitError::Timeout { .. } => ErrorKind::RateLimitTimeout,
            RateLimitError::Storage(_) => ErrorKind::Storage,
            RateLimitError::Config(_) => ErrorKind::Configuration,
        }
    }
}

/// Read-only view of the bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketSnapshot {
    pub tokens: f64,
    pub capacity: f64,
    pub refill_rate: f64,
    pub lifetime_requests: u64,
    pub last_refill: DateTime<Utc>,
    /// Percentage of capacity currently consumed.
    pub utilization: f64,
}

pub struct RateLimiter {
    store: Arc<dyn BucketStore>,
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// # Errors
    /// Returns [`RateLimitError::Config`] when the tuning is unusable.
    pub fn new(
        store: Arc<dyn BucketStore>,
        config: RateLimitConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RateLimitError> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            clock,
        })
    }

    /// An in-process limiter on the wall clock with default tuning.
    pub fn in_memory() -> Result<Self, RateLimitError> {
        Self::new(
            Arc::new(InMemoryBucketStore::new()),
            RateLimitConfig::default(),
            Arc::new(SystemClock),
        )
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Take one token if available. Never waits on tokens, only on the store lock.
    pub async fn try_acquire(&self) -> Result<bool, RateLimitError> {
        let mut guard = self.store.lock(&self.config.bucket_key).await?;
        let mut state = self.refilled(guard.load()?);
        if state.tokens < 1.0 {
            return Ok(false);
        }
        state.tokens -= 1.0;
        state.lifetime_requests += 1;
        guard.store(&state)?;
        Ok(true)
    }

    /// Wait for a token with exponential backoff, bounded by `timeout`.
    ///
    /// A zero timeout makes a single attempt.
    pub async fn acquire(&self, timeout: Duration) -> Result<(), RateLimitError> {
        let started = tokio::time::Instant::now();
        let mut backoff = self.config.initial_backoff();
        loop {
            if self.try_acquire().await? {
                return Ok(());
            }
            let waited = started.elapsed();
            let Some(remaining) = timeout.checked_sub(waited).filter(|r| !r.is_zero()) else {
                debug!(waited_ms = waited.as_millis() as u64, "rate limit wait timed out");
                return Err(RateLimitError::Timeout { waited });
            };
            tokio::time::sleep(backoff.min(remaining)).await;
            backoff = (backoff * 2).min(self.config.max_backoff());
        }
    }

    pub async fn inspect(&self) -> Result<BucketSnapshot, RateLimitError> {
        let mut guard = self.store.lock(&self.config.bucket_key).await?;
        let state = self.refilled(guard.load()?);
        let capacity = self.config.capacity;
        Ok(BucketSnapshot {
            tokens: state.tokens,
            capacity,
            refill_rate: self.config.refill_per_second,
            lifetime_requests: state.lifetime_requests,
            last_refill: state.last_refill,
            utilization: (capacity - state.tokens) / capacity * 100.0,
        })
    }

    /// Refill the bucket to capacity. The lifetime counter is kept.
    pub async fn reset(&self) -> Result<(), RateLimitError> {
        let mut guard = self.store.lock(&self.config.bucket_key).await?;
        let lifetime_requests = guard
            .load()?
            .map(|state| state.lifetime_requests)
            .unwrap_or_default();
        let mut state = BucketState::full(self.config.capacity, self.clock.now());
        state.lifetime_requests = lifetime_requests;
        guard.store(&state)?;
        info!(bucket = %self.config.bucket_key, "rate limit bucket reset");
        Ok(())
    }

    fn refilled(&self, stored: Option<BucketState>) -> BucketState {
        let now = self.clock.now();
        let capacity = self.config.capacity;
        let mut state = stored.unwrap_or_else(|| BucketState::full(capacity, now));
        let elapsed = (now - state.last_refill).num_microseconds().unwrap_or(i64::MAX);
        if elapsed > 0 {
            let added = elapsed as f64 / 1_000_000.0 * self.config.refill_per_second;
            state.tokens += added;
            state.last_refill = now;
        } else if elapsed < 0 {
            // Clock went backwards: restart the refill window, keep the tokens.
            state.last_refill = now;
        }
        state.tokens = state.tokens.clamp(0.0, capacity);
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 1, 8, 0, 0).unwrap()
    }

    fn limiter(clock: Arc<ManualClock>) -> RateLimiter {
        RateLimiter::new(
            Arc::new(InMemoryBucketStore::new()),
            RateLimitConfig::default(),
            clock,
        )
        .expect("limiter")
    }

    async fn drain(limiter: &RateLimiter) -> usize {
        let mut taken = 0;
        while limiter.try_acquire().await.expect("try") {
            taken += 1;
        }
        taken
    }

    #[tokio::test]
    async fn fresh_bucket_allows_capacity_then_refuses() {
        let clock = Arc::new(ManualClock::new(start()));
        let limiter = limiter(clock);
        assert_eq!(drain(&limiter).await, 20);
        let snapshot = limiter.inspect().await.expect("inspect");
        assert_eq!(snapshot.tokens, 0.0);
        assert_eq!(snapshot.lifetime_requests, 20);
        assert_eq!(snapshot.utilization, 100.0);
    }

    #[tokio::test]
    async fn refill_is_proportional_and_capped() {
        let clock = Arc::new(ManualClock::new(start()));
        let limiter = limiter(clock.clone());
        drain(&limiter).await;

        clock.advance(chrono::Duration::milliseconds(250));
        assert_eq!(drain(&limiter).await, 2);
        let left = limiter.inspect().await.expect("inspect").tokens;
        assert!((left - 0.5).abs() < 1e-9, "left {left}");

        clock.advance(chrono::Duration::hours(1));
        assert_eq!(limiter.inspect().await.expect("inspect").tokens, 20.0);
    }

    #[tokio::test]
    async fn clock_skew_never_removes_tokens() {
        let clock = Arc::new(ManualClock::new(start()));
        let limiter = limiter(clock.clone());
        for _ in 0..5 {
            assert!(limiter.try_acquire().await.expect("try"));
        }
        clock.advance(chrono::Duration::minutes(-10));
        assert_eq!(limiter.inspect().await.expect("inspect").tokens, 15.0);
        assert!(limiter.try_acquire().await.expect("try"));
        assert_eq!(limiter.inspect().await.expect("inspect").tokens, 14.0);
    }

    #[tokio::test]
    async fn inspect_does_not_consume() {
        let clock = Arc::new(ManualClock::new(start()));
        let limiter = limiter(clock);
        limiter.inspect().await.expect("inspect");
        limiter.inspect().await.expect("inspect");
        let snapshot = limiter.inspect().await.expect("inspect");
        assert_eq!(snapshot.tokens, 20.0);
        assert_eq!(snapshot.lifetime_requests, 0);
        assert_eq!(snapshot.utilization, 0.0);
    }

    #[tokio::test]
    async fn zero_timeout_fails_without_sleeping() {
        let clock = Arc::new(ManualClock::new(start()));
        let limiter = limiter(clock);
        drain(&limiter).await;
        let started = std::time::Instant::now();
        let err = limiter.acquire(Duration::ZERO).await.expect_err("timeout");
        assert!(matches!(err, RateLimitError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_gives_up_after_timeout() {
        let clock = Arc::new(ManualClock::new(start()));
        let limiter = limiter(clock);
        drain(&limiter).await;
        let err = limiter
            .acquire(Duration::from_secs(3))
            .await
            .expect_err("timeout");
        match err {
            RateLimitError::Timeout { waited } => assert!(waited >= Duration::from_secs(3)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn acquire_waits_for_refill() {
        let config = RateLimitConfig {
            capacity: 1.0,
            refill_per_second: 20.0,
            ..RateLimitConfig::default()
        };
        let limiter = RateLimiter::new(
            Arc::new(InMemoryBucketStore::new()),
            config,
            Arc::new(SystemClock),
        )
        .expect("limiter");
        limiter.acquire(Duration::ZERO).await.expect("first");
        limiter.acquire(Duration::from_secs(2)).await.expect("second");
        assert_eq!(limiter.inspect().await.expect("inspect").lifetime_requests, 2);
    }

    #[tokio::test]
    async fn reset_refills_and_keeps_counter() {
        let clock = Arc::new(ManualClock::new(start()));
        let limiter = limiter(clock);
        drain(&limiter).await;
        limiter.reset().await.expect("reset");
        let snapshot = limiter.inspect().await.expect("inspect");
        assert_eq!(snapshot.tokens, 20.0);
        assert_eq!(snapshot.lifetime_requests, 20);
    }

    #[tokio::test]
    async fn concurrent_callers_never_overdraw() {
        let clock = Arc::new(ManualClock::new(start()));
        let limiter = Arc::new(limiter(clock));
        let mut handles = Vec::new();
        for _ in 0..60 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.try_acquire().await.expect("try")
            }));
        }
        let mut granted = 0;
        for handle in handles {
            if handle.await.expect("join") {
                granted += 1;
            }
        }
        assert_eq!(granted, 20);
        assert!(limiter.inspect().await.expect("inspect").tokens >= 0.0);
    }

    #[tokio::test]
    async fn storage_failure_propagates() {
        let mut store = store::MockBucketStore::new();
        store
            .expect_lock()
            .returning(|_| Err(RateLimitError::Storage("disk gone".into())));
        let limiter = RateLimiter::new(
            Arc::new(store),
            RateLimitConfig::default(),
            Arc::new(SystemClock),
        )
        .expect("limiter");
        let err = limiter.try_acquire().await.expect_err("storage");
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert!(!err.is_retryable());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = RateLimitConfig {
            capacity: 0.0,
            ..RateLimitConfig::default()
        };
        let err = RateLimiter::new(
            Arc::new(InMemoryBucketStore::new()),
            config,
            Arc::new(SystemClock),
        )
        .expect_err("invalid");
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
