//! Sliding-window per-user rate limiting.
//!
//! A fixed-window counter doubles the effective rate at window boundaries,
//! so the store keeps a log of request timestamps instead. When the backing
//! store is unreachable the limiter fails open: rate limiting is a cost
//! control, and the credit ledger plus admission guardrails remain
//! authoritative.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use storyforge_core::{Clock, UserKey};

#[derive(Debug, Clone, thiserror::Error)]
#[error("rate limit store unavailable: {0}")]
pub struct RateLimitStoreError(pub String);

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allow { remaining: u32 },
    Deny { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allow { .. })
    }
}

/// Timestamp log per user with TTL equal to the window.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Prune entries older than `window`, record `now`, and return the
    /// resulting count inside the window (including this request).
    async fn record_and_count(
        &self,
        user_key: &UserKey,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<u32, RateLimitStoreError>;
}

/// In-memory timestamp log for dev/test.
#[derive(Debug, Default)]
pub struct InMemoryRateLimitStore {
    windows: Mutex<HashMap<UserKey, VecDeque<DateTime<Utc>>>>,
}

impl InMemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn record_and_count(
        &self,
        user_key: &UserKey,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<u32, RateLimitStoreError> {
        let cutoff = now
            - chrono::Duration::from_std(window)
                .map_err(|e| RateLimitStoreError(e.to_string()))?;
        let mut windows = self.windows.lock().unwrap();
        let log = windows.entry(user_key.clone()).or_default();
        while log.front().map(|t| *t <= cutoff).unwrap_or(false) {
            log.pop_front();
        }
        log.push_back(now);
        Ok(log.len() as u32)
    }
}

/// A store that always errors; used to exercise the fail-open path.
#[derive(Debug, Default)]
pub struct UnavailableRateLimitStore;

#[async_trait]
impl RateLimitStore for UnavailableRateLimitStore {
    async fn record_and_count(
        &self,
        _user_key: &UserKey,
        _now: DateTime<Utc>,
        _window: Duration,
    ) -> Result<u32, RateLimitStoreError> {
        Err(RateLimitStoreError("store is down".to_string()))
    }
}

/// The limiter: `check` records the request and decides.
pub struct SlidingWindowLimiter {
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
    limit: u32,
    window: Duration,
}

impl SlidingWindowLimiter {
    pub fn new(
        store: Arc<dyn RateLimitStore>,
        clock: Arc<dyn Clock>,
        limit: u32,
        window: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            limit,
            window,
        }
    }

    pub async fn check(&self, user_key: &UserKey) -> RateDecision {
        let now = self.clock.now();
        match self.store.record_and_count(user_key, now, self.window).await {
            Ok(count) if count <= self.limit => RateDecision::Allow {
                remaining: self.limit - count,
            },
            Ok(_) => RateDecision::Deny {
                retry_after: self.window,
            },
            Err(e) => {
                tracing::warn!(user_key = %user_key, error = %e, "rate limit store unreachable, failing open");
                RateDecision::Allow {
                    remaining: self.limit,
                }
            }
        }
    }
}

#[cfg(feature = "redis")]
pub mod redis_store {
    //! Redis-backed timestamp log using a sorted set per user.

    use super::*;
    use redis::AsyncCommands;

    pub struct RedisRateLimitStore {
        client: redis::Client,
    }

    impl RedisRateLimitStore {
        pub fn new(url: &str) -> Result<Self, RateLimitStoreError> {
            let client =
                redis::Client::open(url).map_err(|e| RateLimitStoreError(e.to_string()))?;
            Ok(Self { client })
        }
    }

    #[async_trait]
    impl RateLimitStore for RedisRateLimitStore {
        async fn record_and_count(
            &self,
            user_key: &UserKey,
            now: DateTime<Utc>,
            window: Duration,
        ) -> Result<u32, RateLimitStoreError> {
            let mut conn = self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| RateLimitStoreError(e.to_string()))?;

            let key = format!("rate_limit:{user_key}");
            let now_ms = now.timestamp_millis();
            let window_start = now_ms - window.as_millis() as i64;

            let _: () = conn
                .zrembyscore(&key, 0, window_start)
                .await
                .map_err(|e| RateLimitStoreError(e.to_string()))?;
            let _: () = conn
                .zadd(&key, now_ms, now_ms)
                .await
                .map_err(|e| RateLimitStoreError(e.to_string()))?;
            let count: u32 = conn
                .zcard(&key)
                .await
                .map_err(|e| RateLimitStoreError(e.to_string()))?;
            let _: () = conn
                .expire(&key, window.as_secs() as i64 + 1)
                .await
                .map_err(|e| RateLimitStoreError(e.to_string()))?;

            Ok(count)
        }
    }
}
