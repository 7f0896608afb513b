//! Token-bucket pacing for all outbound mailerlite calls.
//!
//! The bucket refills continuously (computed on demand from the monotonic
//! clock) and exposes its state for the persisted operator snapshot: the
//! fractional token count plus a 60-second sliding window of completed
//! acquisitions. Wired into the HTTP client as a middleware so every
//! attempt, including retries, pays exactly one token.

use crate::repository::sync_state::{self, keys};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Request, Response};
use reqwest_middleware::{Middleware, Next};
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tokio::{
    sync::Mutex,
    time::{Instant, MissedTickBehavior},
};

pub const MAILERLITE_REQUESTS_PER_MINUTE: u32 = 120;

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    refilled_at: Instant,
    recent: VecDeque<Instant>,
}

#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        let capacity = f64::from(requests_per_minute.max(1));
        Self {
            capacity,
            refill_per_sec: capacity / WINDOW.as_secs_f64(),
            state: Mutex::new(BucketState {
                tokens: capacity,
                refilled_at: Instant::now(),
                recent: VecDeque::new(),
            }),
        }
    }

    /// Blocks until at least one whole token is available, then consumes it.
    /// The sliding window is a second guard: a freshly refilled bucket must
    /// not burst past the per-minute budget it just spent.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                self.refill(&mut state, now);
                Self::prune(&mut state, now);
                if state.tokens >= 1.0 && (state.recent.len() as f64) < self.capacity {
                    state.tokens -= 1.0;
                    state.recent.push_back(now);
                    return;
                }
                let token_wait = if state.tokens >= 1.0 {
                    Duration::ZERO
                } else {
                    Duration::from_secs_f64((1.0 - state.tokens) / self.refill_per_sec)
                };
                let window_wait = match state.recent.front() {
                    Some(oldest) if (state.recent.len() as f64) >= self.capacity => {
                        WINDOW.saturating_sub(now.saturating_duration_since(*oldest))
                    }
                    _ => Duration::ZERO,
                };
                token_wait.max(window_wait).max(Duration::from_millis(10))
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Fractional token count without consuming anything.
    pub async fn available(&self) -> f64 {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        self.refill(&mut state, now);
        state.tokens
    }

    pub async fn requests_in_last_minute(&self) -> usize {
        let mut state = self.state.lock().await;
        Self::prune(&mut state, Instant::now());
        state.recent.len()
    }

    pub async fn snapshot(&self) -> RateLimitStatus {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        self.refill(&mut state, now);
        Self::prune(&mut state, now);
        let requests = state.recent.len();
        RateLimitStatus {
            tokens_available: state.tokens,
            requests_in_last_minute: requests,
            utilization_percent: (requests as f64 / self.capacity * 100.0).round(),
            timestamp: Utc::now(),
        }
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.refilled_at);
        state.tokens =
            (state.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity);
        state.refilled_at = now;
    }

    fn prune(state: &mut BucketState, now: Instant) {
        while let Some(oldest) = state.recent.front() {
            if now.saturating_duration_since(*oldest) >= WINDOW {
                state.recent.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Snapshot persisted under `mailerlite_rate_limit_status` for the
/// operator dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatus {
    pub tokens_available: f64,
    pub requests_in_last_minute: usize,
    pub utilization_percent: f64,
    pub timestamp: DateTime<Utc>,
}

pub struct RateLimiterMiddleware {
    limiter: Arc<RateLimiter>,
}

impl RateLimiterMiddleware {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

#[async_trait]
impl Middleware for RateLimiterMiddleware {
    async fn handle(
        &self,
        req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        self.limiter.acquire().await;
        next.run(req, extensions).await
    }
}

/// Persists the limiter snapshot on a fixed cadence until the task is
/// aborted.
pub fn spawn_snapshot_writer(
    limiter: Arc<RateLimiter>,
    db: Arc<DatabaseConnection>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let status = limiter.snapshot().await;
            if let Err(err) =
                sync_state::set(db.as_ref(), keys::RATE_LIMIT_STATUS, &status).await
            {
                tracing::warn!(error = ?err, "failed to persist rate limit snapshot");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn starts_full() {
        let limiter = RateLimiter::new(120);
        assert!((limiter.available().await - 120.0).abs() < 1e-9);
        assert_eq!(limiter.requests_in_last_minute().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_consumes_tokens() {
        let limiter = RateLimiter::new(120);
        for _ in 0..30 {
            limiter.acquire().await;
        }
        let available = limiter.available().await;
        assert!(available <= 90.0 + 1e-6, "available = {available}");
        assert_eq!(limiter.requests_in_last_minute().await, 30);
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_limiter_blocks_until_window_frees() {
        let limiter = RateLimiter::new(120);
        for _ in 0..120 {
            limiter.acquire().await;
        }

        let before = Instant::now();
        limiter.acquire().await;
        let waited = before.elapsed();
        assert!(waited >= Duration::from_secs(59), "waited only {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn refill_rate_is_two_tokens_per_second() {
        let limiter = RateLimiter::new(120);
        for _ in 0..120 {
            limiter.acquire().await;
        }
        assert!(limiter.available().await < 1.0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        let available = limiter.available().await;
        assert!(
            (available - 20.0).abs() < 0.1,
            "available = {available}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn no_more_than_capacity_in_a_window() {
        let limiter = RateLimiter::new(120);
        for _ in 0..150 {
            limiter.acquire().await;
        }
        assert!(limiter.requests_in_last_minute().await <= 120);
    }

    #[tokio::test(start_paused = true)]
    async fn window_forgets_old_requests() {
        let limiter = RateLimiter::new(120);
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert_eq!(limiter.requests_in_last_minute().await, 5);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(limiter.requests_in_last_minute().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_reports_utilization() {
        let limiter = RateLimiter::new(120);
        for _ in 0..60 {
            limiter.acquire().await;
        }
        let status = limiter.snapshot().await;
        assert_eq!(status.requests_in_last_minute, 60);
        assert!((status.utilization_percent - 50.0).abs() < 1e-9);
    }

    #[test]
    fn snapshot_serializes_with_camel_case_keys() {
        let status = RateLimitStatus {
            tokens_available: 42.5,
            requests_in_last_minute: 77,
            utilization_percent: 64.0,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert!(json.get("tokensAvailable").is_some());
        assert!(json.get("requestsInLastMinute").is_some());
        assert!(json.get("utilizationPercent").is_some());
        assert!(json.get("timestamp").is_some());
    }
}
