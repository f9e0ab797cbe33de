//! Rate limiting and retry around platform calls
//!
//! [`ApiManager::execute`] charges the platform's quota, runs the operation
//! with bounded retries and makes sure any error that escapes names the
//! platform that produced it.
//!
//! # Examples
//!
//! ```no_run
//! use libpostflow::api_manager::{ApiManager, ExecuteOptions};
//! use libpostflow::types::{Platform, PostOptions};
//! # use libpostflow::platforms::PlatformAdapter;
//!
//! # async fn example(api: &ApiManager, adapter: &dyn PlatformAdapter) -> libpostflow::Result<()> {
//! let options = PostOptions::default();
//! let no_media: Vec<String> = Vec::new();
//! let result = api
//!     .execute(Platform::Twitter, ExecuteOptions::default(), || {
//!         adapter.create_post("Hello!", &no_media, "token", &options)
//!     })
//!     .await?;
//! println!("Posted {}", result.id);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{Config, RateLimitsConfig, RetryConfig};
use crate::error::{ErrorCode, PlatformError, PostflowError, Result};
use crate::rate_limiter::{RateLimitConfig, RateLimitStatus, RateLimiter};
use crate::types::Platform;

/// Retry settings for [`ApiManager::execute`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(1000),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: config.backoff(),
        }
    }
}

/// Per-call switches for [`ApiManager::execute`]
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub skip_rate_limit: bool,
    pub skip_retry: bool,
    /// Merged into the context of any error that escapes
    pub context: Map<String, Value>,
    /// Charge the user's own window instead of the platform-wide one
    pub user_id: Option<String>,
    /// Upper bound for each attempt
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl ExecuteOptions {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Default::default()
        }
    }

    pub fn with_context(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Published quota of each provider
pub fn default_limit(platform: Platform) -> RateLimitConfig {
    let (points, secs) = match platform {
        Platform::Twitter => (300, 15 * 60),
        Platform::Instagram => (200, 60 * 60),
        Platform::LinkedIn => (100, 24 * 60 * 60),
        Platform::YouTube => (1000, 24 * 60 * 60),
        Platform::TikTok => (300, 60 * 60),
        Platform::Threads => (200, 60 * 60),
        Platform::Bluesky => (3000, 5 * 60),
    };
    RateLimitConfig::new(points, Duration::from_secs(secs))
}

pub struct ApiManager {
    limiter: RateLimiter,
    limits: HashMap<Platform, RateLimitConfig>,
    retry: RetryPolicy,
}

impl ApiManager {
    pub fn new(limiter: RateLimiter, limits: &RateLimitsConfig, retry: RetryPolicy) -> Self {
        let limits = Platform::ALL
            .into_iter()
            .map(|platform| {
                let limit = match limits.get(platform) {
                    Some(settings) => {
                        let limit = RateLimitConfig::new(
                            settings.points,
                            Duration::from_secs(settings.duration_secs),
                        );
                        match settings.block_duration_secs {
                            Some(block) => limit.with_block(Duration::from_secs(block)),
                            None => limit,
                        }
                    }
                    None => default_limit(platform),
                };
                (platform, limit)
            })
            .collect();

        Self {
            limiter,
            limits,
            retry,
        }
    }

    pub fn from_config(limiter: RateLimiter, config: &Config) -> Self {
        Self::new(limiter, &config.rate_limits, RetryPolicy::from(&config.retry))
    }

    pub fn limit_for(&self, platform: Platform) -> RateLimitConfig {
        self.limits
            .get(&platform)
            .copied()
            .unwrap_or_else(|| default_limit(platform))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// `platform:<name>[:user:<id>]`
    pub fn rate_limit_key(platform: Platform, user_id: Option<&str>) -> String {
        match user_id {
            Some(user_id) => format!("platform:{}:user:{}", platform, user_id),
            None => format!("platform:{}", platform),
        }
    }

    /// Remaining quota without charging it
    pub async fn rate_limit_status(
        &self,
        platform: Platform,
        user_id: Option<&str>,
    ) -> Result<RateLimitStatus> {
        let key = Self::rate_limit_key(platform, user_id);
        self.limiter.get_status(&key, &self.limit_for(platform)).await
    }

    /// Run `operation` against `platform` under its rate limit and retry policy
    ///
    /// Rate-limit failures are returned immediately and never retried.
    /// Cancellation stops the in-flight attempt and any pending backoff.
    pub async fn execute<T, F, Fut>(
        &self,
        platform: Platform,
        options: ExecuteOptions,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !options.skip_rate_limit {
            let key = Self::rate_limit_key(platform, options.user_id.as_deref());
            self.limiter
                .consume(&key, &self.limit_for(platform))
                .await
                .map_err(|e| annotate(platform, e, &options.context))?;
        }

        let max_attempts = if options.skip_retry {
            1
        } else {
            self.retry.max_attempts.max(1)
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            if let Some(token) = &options.cancel {
                if token.is_cancelled() {
                    return Err(cancelled(platform));
                }
            }

            let error = match self.attempt(platform, &options, operation()).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(platform = %platform, attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if matches!(error, PostflowError::Cancelled(_)) {
                return Err(error);
            }
            if error.code() == Some(ErrorCode::RateLimitExceeded) || attempt >= max_attempts {
                return Err(annotate(platform, error, &options.context));
            }

            warn!(
                platform = %platform,
                attempt,
                max_attempts,
                error = %error,
                "Platform call failed, retrying"
            );
            self.backoff(platform, options.cancel.as_ref()).await?;
        }
    }

    async fn attempt<T, Fut>(
        &self,
        platform: Platform,
        options: &ExecuteOptions,
        future: Fut,
    ) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let bounded = async {
            match options.timeout {
                Some(limit) => match tokio::time::timeout(limit, future).await {
                    Ok(result) => result,
                    Err(_) => Err(PlatformError::network(format!(
                        "Request timed out after {} ms",
                        limit.as_millis()
                    ))
                    .with_context("timeout", true)
                    .into()),
                },
                None => future.await,
            }
        };

        match &options.cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => Err(cancelled(platform)),
                result = bounded => result,
            },
            None => bounded.await,
        }
    }

    async fn backoff(&self, platform: Platform, cancel: Option<&CancellationToken>) -> Result<()> {
        match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => Err(cancelled(platform)),
                _ = tokio::time::sleep(self.retry.backoff) => Ok(()),
            },
            None => {
                tokio::time::sleep(self.retry.backoff).await;
                Ok(())
            }
        }
    }
}

fn cancelled(platform: Platform) -> PostflowError {
    PostflowError::Cancelled(format!("{} call cancelled", platform))
}

/// Make sure the failing platform is recoverable from an escaping error
fn annotate(platform: Platform, error: PostflowError, context: &Map<String, Value>) -> PostflowError {
    let mut wrapped = match error {
        PostflowError::Platform(e) => e,
        cancelled @ PostflowError::Cancelled(_) => return cancelled,
        PostflowError::InvalidInput(message) => PlatformError::validation(message),
        other => PlatformError::api(other.message()).with_context("originalError", other.to_string()),
    };

    wrapped
        .context
        .insert("platform".to_string(), Value::String(platform.as_str().to_string()));
    for (key, value) in context {
        wrapped
            .context
            .entry(key.clone())
            .or_insert_with(|| value.clone());
    }
    wrapped.into()
}
