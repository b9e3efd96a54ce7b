// =============================================================================
// Rate Limiter — paces REST requests against Binance futures request budgets
// =============================================================================
//
// Policy:
//   - A short fixed delay between consecutive requests.
//   - After `burst_threshold` requests since the last long pause, a long pause
//     before the next one.
//   - On a 429/418 rejection, the same long pause (or Retry-After if longer).
//   - When the exchange-reported `X-MBX-USED-WEIGHT-1M` reaches the configured
//     limit, the next request takes the long pause as well.
//
// The window state sits behind a mutex so several workers may share one
// limiter; the lock is never held across an await.
// =============================================================================

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::runtime_config::RateLimitConfig;

/// Thread-safe request pacer for the backfill path.
pub struct RateLimiter {
    config: RateLimitConfig,
    /// Requests issued since the last long pause.
    window_requests: Mutex<u32>,
    used_weight_1m: AtomicU32,
    total_requests: AtomicU64,
    long_pauses: AtomicU64,
}

/// Immutable snapshot of the limiter counters (for the status log).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub window_requests: u32,
    pub used_weight_1m: u32,
    pub total_requests: u64,
    pub long_pauses: u64,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            window_requests: Mutex::new(0),
            used_weight_1m: AtomicU32::new(0),
            total_requests: AtomicU64::new(0),
            long_pauses: AtomicU64::new(0),
        }
    }

    fn long_pause(&self) -> Duration {
        Duration::from_secs(self.config.burst_pause_secs)
    }

    // -------------------------------------------------------------------------
    // Pacing
    // -------------------------------------------------------------------------

    /// Wait as long as the policy requires before issuing the next request.
    pub async fn before_request(&self) {
        let wait = self.reserve();
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    /// Account for one request and return how long the caller must wait.
    fn reserve(&self) -> Duration {
        let mut window = self.window_requests.lock();
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let weight = self.used_weight_1m.load(Ordering::Relaxed);
        if weight >= self.config.weight_limit {
            warn!(
                used_weight = weight,
                limit = self.config.weight_limit,
                pause_secs = self.config.burst_pause_secs,
                "request weight at limit — pausing"
            );
            self.used_weight_1m.store(0, Ordering::Relaxed);
            self.long_pauses.fetch_add(1, Ordering::Relaxed);
            *window = 1;
            return self.long_pause();
        }

        *window += 1;
        if *window > self.config.burst_threshold {
            info!(
                threshold = self.config.burst_threshold,
                pause_secs = self.config.burst_pause_secs,
                "request budget reached — pausing"
            );
            self.long_pauses.fetch_add(1, Ordering::Relaxed);
            *window = 1;
            return self.long_pause();
        }

        if *window == 1 {
            Duration::ZERO
        } else {
            Duration::from_millis(self.config.request_delay_ms)
        }
    }

    /// Back off after the exchange rejected a request for rate reasons.
    pub async fn on_rate_limited(&self, retry_after: Option<Duration>) {
        let pause = retry_after
            .map(|d| d.max(self.long_pause()))
            .unwrap_or_else(|| self.long_pause());
        {
            let mut window = self.window_requests.lock();
            *window = 0;
        }
        self.used_weight_1m.store(0, Ordering::Relaxed);
        self.long_pauses.fetch_add(1, Ordering::Relaxed);
        warn!(pause_secs = pause.as_secs(), "rate-limit rejection — backing off");
        tokio::time::sleep(pause).await;
    }

    // -------------------------------------------------------------------------
    // Header-based updates
    // -------------------------------------------------------------------------

    /// Record the request weight Binance reports after every response.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        let Some(weight) = headers
            .get("X-MBX-USED-WEIGHT-1M")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok())
        else {
            return;
        };

        let prev = self.used_weight_1m.swap(weight, Ordering::Relaxed);
        if weight >= self.config.weight_limit && prev < self.config.weight_limit {
            warn!(
                used_weight = weight,
                limit = self.config.weight_limit,
                "rate-limit weight crossed limit"
            );
        }
        debug!(used_weight_1m = weight, "rate-limit weight updated from header");
    }

    // -------------------------------------------------------------------------
    // Snapshot
    // -------------------------------------------------------------------------

    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            window_requests: *self.window_requests.lock(),
            used_weight_1m: self.used_weight_1m.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            long_pauses: self.long_pauses.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};
    use tokio::time::Instant;

    fn config(threshold: u32) -> RateLimitConfig {
        RateLimitConfig {
            request_delay_ms: 10,
            burst_threshold: threshold,
            burst_pause_secs: 60,
            weight_limit: 2000,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn short_delay_between_requests() {
        let limiter = RateLimiter::new(config(100));
        let start = Instant::now();
        limiter.before_request().await;
        assert!(start.elapsed() < Duration::from_millis(10));

        limiter.before_request().await;
        limiter.before_request().await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(20));
        assert!(elapsed < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn long_pause_once_threshold_exceeded() {
        let limiter = RateLimiter::new(config(3));
        for _ in 0..3 {
            limiter.before_request().await;
        }

        let before_fourth = Instant::now();
        limiter.before_request().await;
        assert!(before_fourth.elapsed() >= Duration::from_secs(60));

        // Window restarted: the fifth request only takes the short delay.
        let before_fifth = Instant::now();
        limiter.before_request().await;
        assert!(before_fifth.elapsed() < Duration::from_secs(1));
        assert_eq!(limiter.snapshot().long_pauses, 1);
        assert_eq!(limiter.snapshot().total_requests, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_rejection_uses_longer_of_pause_and_retry_after() {
        let limiter = RateLimiter::new(config(100));

        let start = Instant::now();
        limiter.on_rate_limited(None).await;
        assert!(start.elapsed() >= Duration::from_secs(60));

        let start = Instant::now();
        limiter.on_rate_limited(Some(Duration::from_secs(120))).await;
        assert!(start.elapsed() >= Duration::from_secs(120));

        // After a rejection the next request goes out immediately.
        let start = Instant::now();
        limiter.before_request().await;
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn reported_weight_at_limit_forces_pause() {
        let limiter = RateLimiter::new(config(100));
        limiter.before_request().await;

        let mut headers = HeaderMap::new();
        headers.insert("x-mbx-used-weight-1m", HeaderValue::from_static("2100"));
        limiter.update_from_headers(&headers);
        assert_eq!(limiter.snapshot().used_weight_1m, 2100);

        let start = Instant::now();
        limiter.before_request().await;
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert_eq!(limiter.snapshot().used_weight_1m, 0);
    }

    #[test]
    fn malformed_weight_header_is_ignored() {
        let limiter = RateLimiter::new(config(100));
        let mut headers = HeaderMap::new();
        headers.insert("x-mbx-used-weight-1m", HeaderValue::from_static("lots"));
        limiter.update_from_headers(&headers);
        assert_eq!(limiter.snapshot().used_weight_1m, 0);
    }
}
