//! Failure notifications
//!
//! Notifications are a side channel: a notifier that fails is logged and
//! otherwise ignored.

use async_trait::async_trait;
use tracing::warn;

use crate::error::Result;
use crate::monitor::FailedPost;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Tell `user_id` about their failed posts
    async fn notify(&self, user_id: &str, failures: &[FailedPost]) -> Result<()>;
}

/// Writes one warning per failed post to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, user_id: &str, failures: &[FailedPost]) -> Result<()> {
        for failure in failures {
            warn!(
                user_id = %user_id,
                post_id = %failure.post_id,
                platform = %failure.platform,
                error = %failure.error,
                "Post failed to publish"
            );
        }
        Ok(())
    }
}
