//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, trace, warn};

use super::policy::FailurePolicy;
use super::store::CounterStore;
use super::window::Window;
use crate::error::{RateWindowError, Result};

/// Outcome of a rate limit check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LimitStatus {
    /// Whether the estimated rate is above the limit
    pub is_limited: bool,
    /// Estimated number of events in the trailing window
    pub current_rate: f64,
    /// Suggested wait before retrying; only set when limited
    pub limit_duration: Option<Duration>,
}

/// Approximate sliding window rate limiter.
///
/// Counts are kept per fixed-size window in a [`CounterStore`]. The rate for
/// a key is estimated by linearly decaying the previous window's count as
/// the current window ages and adding the current window's count.
///
/// The limiter holds no counts itself and can be shared across tasks.
pub struct RateLimiter<S: CounterStore + ?Sized> {
    /// Backing counter store
    store: Arc<S>,
    /// Maximum events admitted per window
    requests_limit: u64,
    /// Size of each counting window
    window_size: Duration,
    /// What `admit` does when the store fails
    failure_policy: FailurePolicy,
}

impl<S: CounterStore + ?Sized> RateLimiter<S> {
    /// Create a new rate limiter over `store`.
    ///
    /// Allows at most `requests_limit` events per `window_size`.
    pub fn new(store: Arc<S>, requests_limit: u64, window_size: Duration) -> Result<Self> {
        if requests_limit == 0 {
            return Err(RateWindowError::Config(
                "requests limit must be greater than zero".to_string(),
            ));
        }
        if window_size.is_zero() {
            return Err(RateWindowError::Config(
                "window size must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            store,
            requests_limit,
            window_size,
            failure_policy: FailurePolicy::default(),
        })
    }

    /// Set the policy applied by [`admit`](Self::admit) when the store fails.
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Check the current rate for `key` without recording an event.
    pub async fn check(&self, key: &str) -> Result<LimitStatus> {
        self.check_at(key, Utc::now()).await
    }

    /// Check the rate for `key` as of `now`.
    pub async fn check_at(&self, key: &str, now: DateTime<Utc>) -> Result<LimitStatus> {
        let current = Window::containing(now, self.window_size);
        let previous = current.previous(self.window_size);
        let elapsed = current.elapsed_at(now);

        let (prev_count, curr_count) = self
            .store
            .get(key, previous, current)
            .await
            .map_err(|e| {
                warn!(key = %key, error = %e, "Failed to read counters");
                e
            })?;

        let current_rate = self.calc_rate(elapsed, prev_count, curr_count);

        trace!(
            key = %key,
            window = %current,
            prev_count,
            curr_count,
            current_rate,
            "Checked rate"
        );

        if current_rate > self.requests_limit as f64 {
            let limit_duration = self.calc_limit_duration(prev_count, curr_count, elapsed);
            debug!(
                key = %key,
                current_rate,
                limit = self.requests_limit,
                limit_duration = ?limit_duration,
                "Rate limit exceeded"
            );
            return Ok(LimitStatus {
                is_limited: true,
                current_rate,
                limit_duration: Some(limit_duration),
            });
        }

        Ok(LimitStatus {
            is_limited: false,
            current_rate,
            limit_duration: None,
        })
    }

    /// Record one event for `key` in the current window.
    ///
    /// This does not enforce the limit; call [`check`](Self::check) first.
    pub async fn inc(&self, key: &str) -> Result<()> {
        self.inc_at(key, Utc::now()).await
    }

    /// Record one event for `key` in the window containing `now`.
    pub async fn inc_at(&self, key: &str, now: DateTime<Utc>) -> Result<()> {
        let window = Window::containing(now, self.window_size);
        self.store.inc(key, window).await.map_err(|e| {
            warn!(key = %key, error = %e, "Failed to increment counter");
            e
        })
    }

    /// Get the maximum number of events admitted per window.
    pub fn requests_limit(&self) -> u64 {
        self.requests_limit
    }

    /// Get the window size.
    pub fn window_size(&self) -> Duration {
        self.window_size
    }

    /// Get the failure policy used by [`admit`](Self::admit).
    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    /// Get the backing counter store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Estimate the trailing-window rate.
    fn calc_rate(&self, elapsed: Duration, prev_count: u64, curr_count: u64) -> f64 {
        let window = self.window_size.as_nanos() as f64;
        let remaining = self.window_size.saturating_sub(elapsed).as_nanos() as f64;
        let weight = (remaining / window).clamp(0.0, 1.0);

        weight * prev_count as f64 + curr_count as f64
    }

    /// Estimate how long until the decaying rate falls back to the limit.
    fn calc_limit_duration(&self, prev_count: u64, curr_count: u64, elapsed: Duration) -> Duration {
        let window = self.window_size.as_nanos() as f64;
        let limit = self.requests_limit as f64;

        if prev_count == 0 {
            // Nothing left to decay here; the current count becomes the
            // previous one in the next window and decays from there.
            let to_next_window = self.window_size.saturating_sub(elapsed);
            if curr_count == 0 {
                return to_next_window;
            }
            let decay = window * (1.0 - limit / curr_count as f64);
            to_next_window.saturating_add(nanos_to_duration(decay))
        } else {
            let prev = prev_count as f64;
            let unblock_at = window * (prev + curr_count as f64 - limit) / prev;
            nanos_to_duration(unblock_at).saturating_sub(elapsed)
        }
    }
}

impl<S: CounterStore + ?Sized> std::fmt::Debug for RateLimiter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("requests_limit", &self.requests_limit)
            .field("window_size", &self.window_size)
            .field("failure_policy", &self.failure_policy)
            .finish()
    }
}

fn nanos_to_duration(nanos: f64) -> Duration {
    if nanos.is_finite() && nanos > 0.0 {
        Duration::from_nanos(nanos.round() as u64)
    } else {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::MemoryCounterStore;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use tokio_test::{assert_err, assert_ok};

    fn test_limiter(requests_limit: u64, window_size: Duration) -> RateLimiter<MemoryCounterStore> {
        let store = MemoryCounterStore::without_flusher(Duration::from_secs(3600)).unwrap();
        RateLimiter::new(Arc::new(store), requests_limit, window_size).unwrap()
    }

    fn assert_duration_near(actual: Duration, expected: Duration, tolerance_nanos: u128) {
        let diff = actual.as_nanos().abs_diff(expected.as_nanos());
        assert!(
            diff <= tolerance_nanos,
            "expected {:?} within {}ns of {:?}",
            actual,
            tolerance_nanos,
            expected
        );
    }

    /// Store that fails every operation.
    struct UnavailableStore;

    #[async_trait]
    impl CounterStore for UnavailableStore {
        async fn inc(&self, _key: &str, _window: Window) -> Result<()> {
            Err(RateWindowError::Store("unavailable".to_string()))
        }

        async fn get(&self, _key: &str, _previous: Window, _current: Window) -> Result<(u64, u64)> {
            Err(RateWindowError::Store("unavailable".to_string()))
        }

        async fn size(&self) -> Result<usize> {
            Err(RateWindowError::Store("unavailable".to_string()))
        }
    }

    #[test]
    fn test_limiter_rejects_invalid_parameters() {
        let store = Arc::new(MemoryCounterStore::without_flusher(Duration::from_secs(60)).unwrap());

        assert_err!(RateLimiter::new(store.clone(), 0, Duration::from_secs(1)));
        assert_err!(RateLimiter::new(store.clone(), 5, Duration::ZERO));
        assert_ok!(RateLimiter::new(store, 5, Duration::from_secs(1)));
    }

    #[test]
    fn test_calc_rate() {
        let limiter = test_limiter(5, Duration::from_secs(10));

        // Previous window counts in full at the start of the current one
        assert_eq!(limiter.calc_rate(Duration::ZERO, 5, 0), 5.0);
        // Previous window fully decayed at the end of the current one
        assert_eq!(limiter.calc_rate(Duration::from_secs(10), 5, 6), 6.0);
        // 0.9 * 5 + 6
        assert!((limiter.calc_rate(Duration::from_secs(1), 5, 6) - 10.5).abs() < 1e-9);
        assert_eq!(limiter.calc_rate(Duration::from_secs(1), 0, 6), 6.0);
    }

    #[test]
    fn test_calc_rate_clamps_weight() {
        let limiter = test_limiter(5, Duration::from_secs(10));

        assert_eq!(limiter.calc_rate(Duration::from_secs(25), 100, 3), 3.0);
    }

    #[test]
    fn test_calc_limit_duration_with_previous_count() {
        let limiter = test_limiter(5, Duration::from_secs(10));

        // 10s * (5 + 6 - 5) / 5 - 1s
        let duration = limiter.calc_limit_duration(5, 6, Duration::from_secs(1));
        assert_duration_near(duration, Duration::from_secs(11), 3);
    }

    #[test]
    fn test_calc_limit_duration_without_previous_count() {
        let limiter = test_limiter(5, Duration::from_secs(10));

        // (10s - 1s) + 10s * (1 - 5/6)
        let duration = limiter.calc_limit_duration(0, 6, Duration::from_secs(1));
        assert_duration_near(duration, Duration::from_nanos(10_666_666_666), 3);
    }

    #[tokio::test]
    async fn test_not_limited_under_threshold() {
        let limiter = test_limiter(5, Duration::from_secs(10));
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        for _ in 0..4 {
            assert_ok!(limiter.inc_at("key", now).await);
        }

        let status = limiter.check_at("key", now).await.unwrap();
        assert!(!status.is_limited);
        assert_eq!(status.current_rate, 4.0);
        assert_eq!(status.limit_duration, None);
    }

    #[tokio::test]
    async fn test_limited_over_threshold() {
        let limiter = test_limiter(5, Duration::from_secs(10));
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        for _ in 0..6 {
            assert_ok!(limiter.inc_at("key", now).await);
        }

        let status = limiter.check_at("key", now).await.unwrap();
        assert!(status.is_limited);
        assert_eq!(status.current_rate, 6.0);
        assert!(status.limit_duration.is_some());
    }

    #[tokio::test]
    async fn test_limit_is_reached_at_sixth_event() {
        let limiter = test_limiter(5, Duration::from_secs(1));
        let now = Utc.timestamp_opt(1_700_000_000, 250_000_000).unwrap();

        for _ in 0..5 {
            limiter.inc_at("k", now).await.unwrap();
        }
        let status = limiter.check_at("k", now).await.unwrap();
        assert!(!status.is_limited);

        limiter.inc_at("k", now).await.unwrap();
        let status = limiter.check_at("k", now).await.unwrap();
        assert!(status.is_limited);
        // (1s - 250ms) + 1s * (1 - 5/6)
        assert_duration_near(
            status.limit_duration.unwrap(),
            Duration::from_nanos(916_666_667),
            3,
        );
    }

    #[tokio::test]
    async fn test_previous_window_decays() {
        let window_size = Duration::from_secs(10);
        let limiter = test_limiter(5, window_size);
        let previous = Utc.timestamp_opt(1_700_000_005, 0).unwrap();
        let now = Utc.timestamp_opt(1_700_000_011, 0).unwrap();

        for _ in 0..5 {
            limiter.inc_at("key", previous).await.unwrap();
        }
        for _ in 0..6 {
            limiter.inc_at("key", now).await.unwrap();
        }

        let status = limiter.check_at("key", now).await.unwrap();
        assert!(status.is_limited);
        assert!((status.current_rate - 10.5).abs() < 1e-9);
        assert_duration_near(status.limit_duration.unwrap(), Duration::from_secs(11), 3);
    }

    #[tokio::test]
    async fn test_old_windows_do_not_count() {
        let limiter = test_limiter(5, Duration::from_secs(10));
        let long_ago = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let now = Utc.timestamp_opt(1_700_000_025, 0).unwrap();

        for _ in 0..20 {
            limiter.inc_at("key", long_ago).await.unwrap();
        }

        let status = limiter.check_at("key", now).await.unwrap();
        assert!(!status.is_limited);
        assert_eq!(status.current_rate, 0.0);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = test_limiter(2, Duration::from_secs(10));
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        for _ in 0..3 {
            limiter.inc_at("a", now).await.unwrap();
        }
        limiter.inc_at("b", now).await.unwrap();

        assert!(limiter.check_at("a", now).await.unwrap().is_limited);
        assert!(!limiter.check_at("b", now).await.unwrap().is_limited);
    }

    #[tokio::test]
    async fn test_check_does_not_increment() {
        let limiter = test_limiter(5, Duration::from_secs(10));

        for _ in 0..10 {
            limiter.check("key").await.unwrap();
        }

        assert_eq!(limiter.store().size().await.unwrap(), 0);
        assert_eq!(limiter.check("key").await.unwrap().current_rate, 0.0);
    }

    #[tokio::test]
    async fn test_wall_clock_check_and_inc() {
        let limiter = test_limiter(5, Duration::from_secs(3600));

        limiter.inc("key").await.unwrap();
        let status = limiter.check("key").await.unwrap();

        assert!(!status.is_limited);
        assert!(status.current_rate >= 1.0);
    }

    #[tokio::test]
    async fn test_store_errors_propagate() {
        let limiter =
            RateLimiter::new(Arc::new(UnavailableStore), 5, Duration::from_secs(1)).unwrap();

        let err = limiter.check("key").await.unwrap_err();
        assert!(matches!(err, RateWindowError::Store(_)));

        let err = limiter.inc("key").await.unwrap_err();
        assert!(matches!(err, RateWindowError::Store(_)));
    }

    #[tokio::test]
    async fn test_limit_duration_saturates_for_huge_window() {
        let limiter = test_limiter(1, Duration::MAX);

        limiter.inc("k").await.unwrap();
        limiter.inc("k").await.unwrap();

        let status = limiter.check("k").await.unwrap();
        assert!(status.is_limited);
        assert_eq!(status.current_rate, 2.0);
        assert_eq!(status.limit_duration, Some(Duration::MAX));
    }

    #[tokio::test]
    async fn test_limiter_over_trait_object() {
        let store: Arc<dyn CounterStore> =
            Arc::new(MemoryCounterStore::without_flusher(Duration::from_secs(60)).unwrap());
        let limiter = RateLimiter::new(store, 1, Duration::from_secs(60)).unwrap();
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        limiter.inc_at("key", now).await.unwrap();
        limiter.inc_at("key", now).await.unwrap();

        assert!(limiter.check_at("key", now).await.unwrap().is_limited);
    }

    #[test]
    fn test_limit_status_serializes() {
        let status = LimitStatus {
            is_limited: true,
            current_rate: 6.0,
            limit_duration: Some(Duration::from_millis(1500)),
        };

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["is_limited"], true);
        assert_eq!(json["current_rate"], 6.0);
        assert_eq!(json["limit_duration"]["secs"], 1);
        assert_eq!(json["limit_duration"]["nanos"], 500_000_000);
    }
}
