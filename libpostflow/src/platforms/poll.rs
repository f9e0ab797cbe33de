//! Bounded polling for asynchronous provider-side processing
//!
//! Video transcodes, Instagram containers and LinkedIn assets finish some
//! time after upload. [`poll_until`] checks a status endpoint a bounded
//! number of times and fails with a timeout-flagged PLATFORM_ERROR when the
//! resource never reaches a terminal state.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::config::HttpConfig;
use crate::error::{PlatformError, Result};
use crate::types::Platform;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay: Duration::from_secs(1),
        }
    }
}

impl From<&HttpConfig> for PollPolicy {
    fn from(config: &HttpConfig) -> Self {
        Self {
            max_attempts: config.media_poll_attempts.max(1),
            delay: Duration::from_millis(config.media_poll_delay_ms),
        }
    }
}

/// Outcome of a single status check
#[derive(Debug, Clone, PartialEq)]
pub enum PollState<T> {
    Done(T),
    /// Still processing; the string is the provider's state name
    Pending(String),
    /// Terminal failure reported by the provider
    Failed(String),
}

pub async fn poll_until<T, F, Fut>(
    platform: Platform,
    operation: &str,
    policy: PollPolicy,
    mut check: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<PollState<T>>>,
{
    let mut last_state = String::new();

    for attempt in 1..=policy.max_attempts {
        if attempt > 1 {
            tokio::time::sleep(policy.delay).await;
        }

        match check().await? {
            PollState::Done(value) => return Ok(value),
            PollState::Failed(reason) => {
                return Err(PlatformError::platform(format!(
                    "{} {} failed: {}",
                    platform, operation, reason
                ))
                .with_context("platform", platform.as_str())
                .with_context("operation", operation)
                .with_context("reason", reason)
                .into());
            }
            PollState::Pending(state) => {
                debug!(platform = %platform, operation, attempt, state = %state, "Still processing");
                last_state = state;
            }
        }
    }

    Err(PlatformError::platform(format!(
        "{} {} did not finish after {} checks (last state: {})",
        platform, operation, policy.max_attempts, last_state
    ))
    .with_context("platform", platform.as_str())
    .with_context("operation", operation)
    .with_context("timeout", true)
    .with_context("attempts", policy.max_attempts)
    .with_context("lastState", last_state)
    .into())
}
