//! Scheduled post lifecycle
//!
//! Posts move PENDING → PROCESSING → COMPLETED | FAILED. The scheduler owns
//! that state machine: it validates new posts, publishes the due ones
//! through the [`ApiManager`] and records one status-log entry per outcome.

use std::sync::Arc;

use chrono::Duration;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::accounts::AccountService;
use crate::api_manager::{ApiManager, ExecuteOptions};
use crate::clock::SharedClock;
use crate::db::{Database, LogEntry, TransitionUpdate};
use crate::error::{PostflowError, Result};
use crate::media::{resolve_media, MediaFetcher};
use crate::platforms::{limits, validate_post, PlatformFactory};
use crate::types::{
    NewScheduledPost, PostOptions, PostResult, PostStatus, PostStatusLog, PostUpdate,
    ScheduledPost,
};

/// Counts from one [`Scheduler::process_due_posts`] run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessSummary {
    pub processed: usize,
    pub completed: usize,
    pub failed: usize,
    /// Claimed by another runner, or not started before cancellation
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Failed,
    Skipped,
}

pub struct Scheduler {
    db: Database,
    factory: Arc<PlatformFactory>,
    api: Arc<ApiManager>,
    accounts: Arc<AccountService>,
    media: MediaFetcher,
    clock: SharedClock,
    concurrency: usize,
    max_retries: u32,
}

fn check_content(post: &NewScheduledPost) -> Result<()> {
    let (character_limit, max_media) = limits(post.platform);
    validate_post(
        post.platform,
        character_limit,
        max_media,
        &post.content,
        &post.media_urls,
    )
}

impl Scheduler {
    pub fn new(
        db: Database,
        factory: Arc<PlatformFactory>,
        api: Arc<ApiManager>,
        accounts: Arc<AccountService>,
        media: MediaFetcher,
        clock: SharedClock,
    ) -> Self {
        Self {
            db,
            factory,
            api,
            accounts,
            media,
            clock,
            concurrency: 1,
            max_retries: 3,
        }
    }

    /// Due posts published in parallel per run
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Ceiling for [`requeue_failed_post`](Self::requeue_failed_post)
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn require_future(&self, scheduled_time: chrono::DateTime<chrono::Utc>) -> Result<()> {
        let now = self.clock.now();
        if scheduled_time <= now {
            return Err(PostflowError::InvalidInput(format!(
                "Scheduled time {} must be in the future (now: {})",
                scheduled_time.to_rfc3339(),
                now.to_rfc3339()
            )));
        }
        Ok(())
    }

    /// Store a new PENDING post; nothing is sent to the platform yet
    pub async fn schedule_post(&self, data: NewScheduledPost) -> Result<ScheduledPost> {
        self.require_future(data.scheduled_time)?;
        if data.user_id.trim().is_empty() {
            return Err(PostflowError::InvalidInput("User id cannot be empty".to_string()));
        }
        check_content(&data)?;

        let post = data.into_post(self.clock.now());
        self.db.insert_scheduled_post(&post).await?;

        info!(
            post_id = %post.id,
            platform = %post.platform,
            scheduled_time = %post.scheduled_time.to_rfc3339(),
            "Post scheduled"
        );
        Ok(post)
    }

    /// Publish every PENDING post whose time has come
    ///
    /// One post failing never stops the others; each ends up COMPLETED or
    /// FAILED with exactly one status-log entry.
    pub async fn process_due_posts(&self) -> Result<ProcessSummary> {
        self.process_due_posts_until(&CancellationToken::new()).await
    }

    /// [`process_due_posts`](Self::process_due_posts) that stops claiming posts
    /// once `cancel` fires
    pub async fn process_due_posts_until(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ProcessSummary> {
        let due = self.db.due_posts(self.clock.now()).await?;
        if due.is_empty() {
            debug!("No posts due");
            return Ok(ProcessSummary::default());
        }
        info!(count = due.len(), "Processing due posts");

        let outcomes: Vec<Outcome> = stream::iter(due)
            .map(|post| self.process_post(post, cancel))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut summary = ProcessSummary::default();
        for outcome in outcomes {
            match outcome {
                Outcome::Completed => summary.completed += 1,
                Outcome::Failed => summary.failed += 1,
                Outcome::Skipped => {
                    summary.skipped += 1;
                    continue;
                }
            }
            summary.processed += 1;
        }

        info!(
            processed = summary.processed,
            completed = summary.completed,
            failed = summary.failed,
            skipped = summary.skipped,
            "Due posts processed"
        );
        Ok(summary)
    }

    async fn process_post(&self, post: ScheduledPost, cancel: &CancellationToken) -> Outcome {
        if cancel.is_cancelled() {
            return Outcome::Skipped;
        }

        match self
            .db
            .transition_post(
                &post.id,
                PostStatus::Pending,
                PostStatus::Processing,
                TransitionUpdate::default(),
                self.clock.now(),
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(post_id = %post.id, "Post already claimed");
                return Outcome::Skipped;
            }
            Err(e) => {
                error!(post_id = %post.id, error = %e, "Failed to claim post");
                return Outcome::Skipped;
            }
        }

        let (to, update, outcome) = match self.publish(&post, cancel).await {
            Ok(result) => {
                info!(
                    post_id = %post.id,
                    platform = %post.platform,
                    platform_post_id = %result.id,
                    "Post published"
                );
                (
                    PostStatus::Completed,
                    TransitionUpdate {
                        platform_post_id: Some(result.id.clone()),
                        log: Some(LogEntry {
                            status: PostStatus::Published,
                            platform_id: Some(result.id),
                            error_message: None,
                        }),
                        ..Default::default()
                    },
                    Outcome::Completed,
                )
            }
            Err(e) => {
                let message = e.message();
                warn!(
                    post_id = %post.id,
                    platform = %post.platform,
                    error = %message,
                    "Post failed"
                );
                (
                    PostStatus::Failed,
                    TransitionUpdate {
                        error: Some(message.clone()),
                        log: Some(LogEntry {
                            status: PostStatus::Failed,
                            platform_id: None,
                            error_message: Some(message),
                        }),
                        ..Default::default()
                    },
                    Outcome::Failed,
                )
            }
        };

        match self
            .db
            .transition_post(&post.id, PostStatus::Processing, to, update, self.clock.now())
            .await
        {
            Ok(true) => outcome,
            Ok(false) => {
                warn!(post_id = %post.id, "Post left PROCESSING while publishing");
                Outcome::Skipped
            }
            Err(e) => {
                error!(post_id = %post.id, error = %e, "Failed to record publish outcome");
                Outcome::Failed
            }
        }
    }

    async fn publish(&self, post: &ScheduledPost, cancel: &CancellationToken) -> Result<PostResult> {
        let credential = self
            .accounts
            .require_credential(&post.user_id, post.platform)
            .await?;

        let adapter = self.factory.get_platform(post.platform)?;
        let options = PostOptions::default();
        let execute = ExecuteOptions::for_user(post.user_id.as_str())
            .with_context("postId", post.id.as_str())
            .with_cancel(cancel.clone());
        let media_ids = resolve_media(
            &self.media,
            &self.api,
            &*adapter,
            &post.media_urls,
            &post.content,
            &credential.access_token,
            &execute,
        )
        .await?;

        self.api
            .execute(post.platform, execute, || {
                adapter.create_post(
                    &post.content,
                    &media_ids,
                    &credential.access_token,
                    &options,
                )
            })
            .await
    }

    pub async fn get_post(&self, post_id: &str) -> Result<Option<ScheduledPost>> {
        self.db.get_scheduled_post(post_id).await
    }

    /// PENDING and PROCESSING posts of `user_id`, soonest first
    pub async fn get_user_schedule(&self, user_id: &str) -> Result<Vec<ScheduledPost>> {
        self.db
            .posts_for_user(user_id, &[PostStatus::Pending, PostStatus::Processing])
            .await
    }

    /// Posts of `user_id` in any state, soonest first
    pub async fn get_user_posts(&self, user_id: &str) -> Result<Vec<ScheduledPost>> {
        self.db
            .posts_for_user(
                user_id,
                &[
                    PostStatus::Pending,
                    PostStatus::Processing,
                    PostStatus::Completed,
                    PostStatus::Published,
                    PostStatus::Failed,
                ],
            )
            .await
    }

    /// Edit a PENDING post; a new time must still be in the future
    pub async fn update_scheduled_post(
        &self,
        post_id: &str,
        updates: PostUpdate,
    ) -> Result<ScheduledPost> {
        let post = self
            .db
            .get_scheduled_post(post_id)
            .await?
            .ok_or_else(|| PostflowError::InvalidInput(format!("Post {} not found", post_id)))?;

        if post.status != PostStatus::Pending {
            return Err(PostflowError::InvalidInput(format!(
                "Post {} is {} and can no longer be edited",
                post_id, post.status
            )));
        }
        if let Some(scheduled_time) = updates.scheduled_time {
            self.require_future(scheduled_time)?;
        }

        let edited = NewScheduledPost {
            user_id: post.user_id,
            platform: post.platform,
            content: updates.content.unwrap_or(post.content),
            media_urls: updates.media_urls.unwrap_or(post.media_urls),
            scheduled_time: updates.scheduled_time.unwrap_or(post.scheduled_time),
        };
        check_content(&edited)?;

        let updated = self
            .db
            .update_post_fields(
                post_id,
                &edited.content,
                &edited.media_urls,
                edited.scheduled_time,
                self.clock.now(),
            )
            .await?;
        if !updated {
            return Err(PostflowError::InvalidInput(format!("Post {} not found", post_id)));
        }

        debug!(post_id = %post_id, "Scheduled post updated");
        self.db
            .get_scheduled_post(post_id)
            .await?
            .ok_or_else(|| PostflowError::InvalidInput(format!("Post {} not found", post_id)))
    }

    /// Delete a post and its history, returning whether it existed
    pub async fn delete_scheduled_post(&self, post_id: &str) -> Result<bool> {
        let deleted = self.db.delete_scheduled_post(post_id).await?;
        if deleted {
            info!(post_id = %post_id, "Scheduled post deleted");
        }
        Ok(deleted)
    }

    /// Put a FAILED post back in the queue while it has retries left
    pub async fn requeue_failed_post(&self, post_id: &str) -> Result<ScheduledPost> {
        let post = self
            .db
            .get_scheduled_post(post_id)
            .await?
            .ok_or_else(|| PostflowError::InvalidInput(format!("Post {} not found", post_id)))?;

        if post.status != PostStatus::Failed {
            return Err(PostflowError::InvalidInput(format!(
                "Only failed posts can be retried, post {} is {}",
                post_id, post.status
            )));
        }
        if post.retry_count >= self.max_retries {
            return Err(PostflowError::InvalidInput(format!(
                "Post {} already failed {} times (max {})",
                post_id, post.retry_count, self.max_retries
            )));
        }

        let moved = self
            .db
            .transition_post(
                post_id,
                PostStatus::Failed,
                PostStatus::Pending,
                TransitionUpdate {
                    clear_platform_post_id: true,
                    ..Default::default()
                },
                self.clock.now(),
            )
            .await?;
        if !moved {
            return Err(PostflowError::InvalidInput(format!(
                "Post {} changed state while being requeued",
                post_id
            )));
        }

        info!(post_id = %post_id, retry_count = post.retry_count, "Post requeued");
        self.db
            .get_scheduled_post(post_id)
            .await?
            .ok_or_else(|| PostflowError::InvalidInput(format!("Post {} not found", post_id)))
    }

    /// Status-log entries of a post, oldest first
    pub async fn post_history(&self, post_id: &str) -> Result<Vec<PostStatusLog>> {
        self.db.status_logs(post_id).await
    }

    /// Delete finished posts older than `retention_days`
    pub async fn cleanup_expired(&self, retention_days: u32) -> Result<u64> {
        let cutoff = self.clock.now() - Duration::days(i64::from(retention_days));
        let deleted = self.db.delete_terminal_posts_before(cutoff).await?;
        if deleted > 0 {
            info!(deleted, retention_days, "Expired posts cleaned up");
        }
        Ok(deleted)
    }
}
