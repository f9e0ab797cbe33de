//! Sliding-window rate limiting with optional hard blocks
//!
//! Each key owns a window of request timestamps. A request is admitted when
//! fewer than `points` timestamps fall inside the last `duration`. When a
//! `block_duration` is configured, exceeding the window blocks the key
//! outright until the block expires.

pub mod store;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::error::{PlatformError, Result};

pub use store::{MemoryStore, RateLimitStore, WindowHit, WindowState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub points: u32,
    pub duration: Duration,
    pub block_duration: Option<Duration>,
}

impl RateLimitConfig {
    pub fn new(points: u32, duration: Duration) -> Self {
        Self {
            points,
            duration,
            block_duration: None,
        }
    }

    pub fn with_block(mut self, block_duration: Duration) -> Self {
        self.block_duration = Some(block_duration);
        self
    }

    fn duration_ms(&self) -> i64 {
        self.duration.as_millis() as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatus {
    pub remaining: u32,
    pub reset_time: DateTime<Utc>,
    pub blocked: bool,
}

/// Inputs to [`RateLimiter::generate_key`]
#[derive(Debug, Clone, Default)]
pub struct KeyParts<'a> {
    pub ip: &'a str,
    pub path: &'a str,
    pub user_id: Option<&'a str>,
    pub method: Option<&'a str>,
}

pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    clock: SharedClock,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    /// Admit one request for `key` or fail with RATE_LIMIT_EXCEEDED
    pub async fn consume(&self, key: &str, config: &RateLimitConfig) -> Result<RateLimitStatus> {
        let now_ms = self.clock.now_millis();

        if let Some(until_ms) = self.store.blocked_until(key, now_ms).await? {
            debug!(key = %key, "Request rejected, key is blocked");
            return Err(blocked_error(key, until_ms).into());
        }

        let duration_ms = config.duration_ms();
        let hit = self
            .store
            .record_hit(key, now_ms, now_ms - duration_ms, config.points, duration_ms)
            .await?;

        match hit {
            WindowHit::Recorded {
                count_before,
                oldest_ms,
            } => Ok(RateLimitStatus {
                remaining: config.points.saturating_sub(count_before + 1),
                reset_time: millis(oldest_ms + duration_ms),
                blocked: false,
            }),
            WindowHit::Full { count, oldest_ms } => {
                if let Some(block) = config.block_duration {
                    let until_ms = now_ms + block.as_millis() as i64;
                    self.store.block(key, until_ms).await?;
                    warn!(key = %key, count, "Rate limit exceeded, blocking key");
                    return Err(blocked_error(key, until_ms).into());
                }

                let reset_ms = oldest_ms.unwrap_or(now_ms) + duration_ms;
                debug!(key = %key, count, "Rate limit exceeded");
                Err(PlatformError::rate_limit("Too many requests")
                    .with_context("key", key)
                    .with_context("resetTime", millis(reset_ms).to_rfc3339())
                    .into())
            }
        }
    }

    /// Current status for `key` without consuming anything
    pub async fn get_status(&self, key: &str, config: &RateLimitConfig) -> Result<RateLimitStatus> {
        let now_ms = self.clock.now_millis();

        if let Some(until_ms) = self.store.blocked_until(key, now_ms).await? {
            return Ok(RateLimitStatus {
                remaining: 0,
                reset_time: millis(until_ms),
                blocked: true,
            });
        }

        let duration_ms = config.duration_ms();
        let window = self.store.window(key, now_ms - duration_ms).await?;

        Ok(RateLimitStatus {
            remaining: config.points.saturating_sub(window.count),
            reset_time: millis(window.oldest_ms.map(|o| o + duration_ms).unwrap_or(now_ms)),
            blocked: false,
        })
    }

    /// Reset `key` to an unused state
    pub async fn clear(&self, key: &str) -> Result<()> {
        self.store.clear(key).await
    }

    /// Drop expired windows and blocks for every key
    pub async fn purge_expired(&self) -> Result<u64> {
        self.store.purge_expired(self.clock.now_millis()).await
    }

    /// `ratelimit:{user:<id>|ip:<ip>}[:<method>]:<path>` with the path sanitized
    pub fn generate_key(parts: &KeyParts<'_>) -> String {
        let mut key = String::from("ratelimit:");

        match parts.user_id {
            Some(user_id) => {
                key.push_str("user:");
                key.push_str(user_id);
            }
            None => {
                key.push_str("ip:");
                key.push_str(parts.ip);
            }
        }

        if let Some(method) = parts.method {
            key.push(':');
            key.push_str(&method.to_lowercase());
        }

        key.push(':');
        key.extend(
            parts
                .path
                .trim_start_matches('/')
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' }),
        );

        key
    }
}

fn millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn blocked_error(key: &str, until_ms: i64) -> PlatformError {
    let until = millis(until_ms);
    PlatformError::rate_limit(format!("Too many requests, blocked until {}", until.to_rfc3339()))
        .with_context("key", key)
        .with_blocked_until(until)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::db::Database;
    use crate::error::{ErrorCode, PostflowError};

    fn limiter(store: Arc<dyn RateLimitStore>) -> (RateLimiter, ManualClock) {
        let clock = ManualClock::default();
        (RateLimiter::new(store, Arc::new(clock.clone())), clock)
    }

    fn rate_limited(result: Result<RateLimitStatus>) -> PlatformError {
        match result {
            Err(PostflowError::Platform(e)) if e.code == ErrorCode::RateLimitExceeded => e,
            other => panic!("expected rate limit error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_consume_counts_down_then_rejects() {
        let (limiter, _clock) = limiter(Arc::new(MemoryStore::new()));
        let config = RateLimitConfig::new(3, Duration::from_secs(60));

        for expected in [2, 1, 0] {
            let status = limiter.consume("k", &config).await.unwrap();
            assert_eq!(status.remaining, expected);
            assert!(!status.blocked);
        }

        let err = rate_limited(limiter.consume("k", &config).await);
        assert!(err.blocked_until.is_none());
        assert!(err.context.contains_key("resetTime"));
    }

    #[tokio::test]
    async fn test_window_slides_after_duration() {
        let (limiter, clock) = limiter(Arc::new(MemoryStore::new()));
        let config = RateLimitConfig::new(2, Duration::from_secs(60));

        limiter.consume("k", &config).await.unwrap();
        limiter.consume("k", &config).await.unwrap();
        assert!(limiter.consume("k", &config).await.is_err());

        clock.advance(chrono::Duration::seconds(61));
        let status = limiter.consume("k", &config).await.unwrap();
        assert_eq!(status.remaining, 1);
    }

    #[tokio::test]
    async fn test_reset_time_tracks_oldest_entry() {
        let (limiter, clock) = limiter(Arc::new(MemoryStore::new()));
        let config = RateLimitConfig::new(5, Duration::from_secs(60));
        let start = clock.now();

        limiter.consume("k", &config).await.unwrap();
        clock.advance(chrono::Duration::seconds(10));
        let status = limiter.consume("k", &config).await.unwrap();

        assert_eq!(
            status.reset_time.timestamp_millis(),
            (start + chrono::Duration::seconds(60)).timestamp_millis()
        );
    }

    #[tokio::test]
    async fn test_block_holds_even_after_window_would_reset() {
        let (limiter, clock) = limiter(Arc::new(MemoryStore::new()));
        let config =
            RateLimitConfig::new(1, Duration::from_secs(10)).with_block(Duration::from_secs(300));

        limiter.consume("k", &config).await.unwrap();
        let err = rate_limited(limiter.consume("k", &config).await);
        let blocked_until = err.blocked_until.unwrap();
        assert_eq!(
            blocked_until.timestamp_millis(),
            (clock.now() + chrono::Duration::seconds(300)).timestamp_millis()
        );

        clock.advance(chrono::Duration::seconds(60));
        let status = limiter.get_status("k", &config).await.unwrap();
        assert!(status.blocked);
        assert_eq!(status.remaining, 0);
        assert_eq!(status.reset_time, blocked_until);

        let err = rate_limited(limiter.consume("k", &config).await);
        assert_eq!(err.blocked_until, Some(blocked_until));

        clock.advance(chrono::Duration::seconds(241));
        let status = limiter.consume("k", &config).await.unwrap();
        assert_eq!(status.remaining, 0);
    }

    #[tokio::test]
    async fn test_get_status_is_idempotent() {
        let (limiter, _clock) = limiter(Arc::new(MemoryStore::new()));
        let config = RateLimitConfig::new(10, Duration::from_secs(60));

        limiter.consume("k", &config).await.unwrap();
        let first = limiter.get_status("k", &config).await.unwrap();
        let second = limiter.get_status("k", &config).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.remaining, 9);
    }

    #[tokio::test]
    async fn test_clear_restores_baseline() {
        let db = Database::in_memory().await.unwrap();
        let (limiter, _clock) = limiter(Arc::new(db));
        let config =
            RateLimitConfig::new(1, Duration::from_secs(60)).with_block(Duration::from_secs(60));

        limiter.consume("k", &config).await.unwrap();
        assert!(limiter.consume("k", &config).await.is_err());

        limiter.clear("k").await.unwrap();
        let status = limiter.get_status("k", &config).await.unwrap();
        assert_eq!(status.remaining, 1);
        assert!(!status.blocked);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (limiter, _clock) = limiter(Arc::new(MemoryStore::new()));
        let config = RateLimitConfig::new(1, Duration::from_secs(60));

        limiter.consume("a", &config).await.unwrap();
        assert!(limiter.consume("a", &config).await.is_err());
        assert!(limiter.consume("b", &config).await.is_ok());
    }

    #[tokio::test]
    async fn test_database_backed_limiter() {
        let db = Database::in_memory().await.unwrap();
        let (limiter, clock) = limiter(Arc::new(db));
        let config = RateLimitConfig::new(2, Duration::from_secs(30));

        assert_eq!(limiter.consume("k", &config).await.unwrap().remaining, 1);
        assert_eq!(limiter.consume("k", &config).await.unwrap().remaining, 0);
        assert!(limiter.consume("k", &config).await.is_err());

        clock.advance(chrono::Duration::seconds(31));
        assert_eq!(limiter.consume("k", &config).await.unwrap().remaining, 1);
    }

    #[test]
    fn test_generate_key_prefers_user() {
        let key = RateLimiter::generate_key(&KeyParts {
            ip: "127.0.0.1",
            path: "/api/test",
            user_id: Some("user123"),
            method: Some("GET"),
        });
        assert_eq!(key, "ratelimit:user:user123:get:api_test");
    }

    #[test]
    fn test_generate_key_sanitizes_path() {
        let key = RateLimiter::generate_key(&KeyParts {
            ip: "127.0.0.1",
            path: "/api/test?query=value",
            user_id: None,
            method: Some("GET"),
        });
        assert_eq!(key, "ratelimit:ip:127.0.0.1:get:api_test_query_value");
    }

    #[test]
    fn test_generate_key_without_method() {
        let key = RateLimiter::generate_key(&KeyParts {
            ip: "10.0.0.1",
            path: "/posts",
            ..Default::default()
        });
        assert_eq!(key, "ratelimit:ip:10.0.0.1:posts");
    }
}
