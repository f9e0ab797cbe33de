//! Post-submission tracking
//!
//! Platforms that publish asynchronously (video processing, media
//! containers) only report the final outcome later. The monitor reconciles
//! past-due posts with what the platform says, resubmits failed posts on
//! request and tells users about failures.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::accounts::AccountService;
use crate::api_manager::{ApiManager, ExecuteOptions};
use crate::clock::SharedClock;
use crate::db::{Database, LogEntry, TransitionUpdate};
use crate::error::Result;
use crate::media::{resolve_media, MediaFetcher};
use crate::notify::Notifier;
use crate::platforms::PlatformFactory;
use crate::types::{Platform, PostOptions, PostResult, PostStatus, RemotePostStatus, ScheduledPost};

/// Consecutive failed lookups before a submitted post is marked FAILED
pub const DEFAULT_MAX_CHECK_FAILURES: u32 = 10;

/// A post the platform rejected, or whose status could not be read
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedPost {
    pub post_id: String,
    pub user_id: String,
    pub platform: Platform,
    pub error: String,
}

/// Outcome of one [`PostMonitor::monitor_scheduled_posts`] scan
#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorResult {
    /// False when the scan itself could not run
    pub success: bool,
    pub failed_posts: Vec<FailedPost>,
    /// Posts still waiting on the platform
    pub retries: usize,
    pub published: usize,
    /// Posts whose status lookups keep failing, already reported
    pub unreachable: usize,
}

/// Outcome of [`PostMonitor::retry_failed_posts`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetryResult {
    /// Resubmitted posts, now PENDING again
    pub success: Vec<String>,
    /// Missing posts and posts out of retries
    pub permanent_failures: Vec<String>,
    /// Resubmissions that failed again
    pub failed: Vec<FailedPost>,
}

enum Check {
    Published,
    Failed(FailedPost),
    Pending,
    /// Lookup failed again with an error the user already heard about
    Unreachable,
}

pub struct PostMonitor {
    db: Database,
    factory: Arc<PlatformFactory>,
    api: Arc<ApiManager>,
    accounts: Arc<AccountService>,
    media: MediaFetcher,
    clock: SharedClock,
    notifier: Arc<dyn Notifier>,
    max_check_failures: u32,
}

impl PostMonitor {
    pub fn new(
        db: Database,
        factory: Arc<PlatformFactory>,
        api: Arc<ApiManager>,
        accounts: Arc<AccountService>,
        media: MediaFetcher,
        clock: SharedClock,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            db,
            factory,
            api,
            accounts,
            media,
            clock,
            notifier,
            max_check_failures: DEFAULT_MAX_CHECK_FAILURES,
        }
    }

    /// Failed status lookups in a row before a post is given up as FAILED
    pub fn with_max_check_failures(mut self, max_check_failures: u32) -> Self {
        self.max_check_failures = max_check_failures.max(1);
        self
    }

    /// Ask each platform about past-due submitted posts
    ///
    /// A post that cannot be checked (no credentials, platform down) keeps
    /// its state and is reported in `failed_posts` the first time each error
    /// shows up. After `max_check_failures` failed lookups in a row it is
    /// marked FAILED. It never aborts the scan.
    pub async fn monitor_scheduled_posts(&self) -> MonitorResult {
        let posts = match self
            .db
            .posts_due_in(&[PostStatus::Pending, PostStatus::Completed], self.clock.now())
            .await
        {
            Ok(posts) => posts,
            Err(e) => {
                warn!(error = %e, "Failed to load posts to monitor");
                return MonitorResult::default();
            }
        };

        let mut result = MonitorResult {
            success: true,
            ..Default::default()
        };
        for post in posts {
            match self.check_post(&post).await {
                Check::Published => result.published += 1,
                Check::Failed(failure) => result.failed_posts.push(failure),
                Check::Pending => result.retries += 1,
                Check::Unreachable => result.unreachable += 1,
            }
        }

        info!(
            published = result.published,
            failed = result.failed_posts.len(),
            pending = result.retries,
            unreachable = result.unreachable,
            "Post monitoring finished"
        );
        result
    }

    async fn check_post(&self, post: &ScheduledPost) -> Check {
        let Some(platform_post_id) = post.platform_post_id.as_deref() else {
            debug!(post_id = %post.id, "Post not submitted yet");
            return Check::Pending;
        };

        let status = match self.remote_status(post, platform_post_id).await {
            Ok(status) => status,
            Err(e) => {
                warn!(post_id = %post.id, platform = %post.platform, error = %e, "Status lookup failed");
                return self.lookup_failed(post, e.message()).await;
            }
        };

        match status {
            RemotePostStatus::Pending => {
                if post.error.is_some() {
                    if let Err(e) = self.db.clear_status_check_failures(&post.id, post.status).await {
                        warn!(post_id = %post.id, error = %e, "Failed to reset status lookup failures");
                    }
                }
                Check::Pending
            }
            RemotePostStatus::Published { metrics } => {
                // COMPLETED posts already carry their PUBLISHED log entry
                let log = (post.status == PostStatus::Pending).then(|| LogEntry {
                    status: PostStatus::Published,
                    platform_id: Some(platform_post_id.to_string()),
                    error_message: None,
                });
                let update = TransitionUpdate {
                    metrics,
                    log,
                    ..Default::default()
                };
                self.settle(post, PostStatus::Published, update, Check::Published).await
            }
            RemotePostStatus::Failed { reason } => {
                let check = Check::Failed(failure(post, reason.clone()));
                let update = failed_update(Some(platform_post_id), reason);
                self.settle(post, PostStatus::Failed, update, check).await
            }
        }
    }

    /// Report a lookup failure once per post and error, giving up after
    /// `max_check_failures` in a row
    async fn lookup_failed(&self, post: &ScheduledPost, message: String) -> Check {
        let failures = match self
            .db
            .record_status_check_failure(&post.id, post.status, &message)
            .await
        {
            Ok(Some(failures)) => failures,
            Ok(None) => {
                debug!(post_id = %post.id, "Post changed state during monitoring");
                return Check::Pending;
            }
            Err(e) => {
                warn!(post_id = %post.id, error = %e, "Failed to record status lookup failure");
                return Check::Failed(failure(post, message));
            }
        };

        if failures >= self.max_check_failures {
            let reason = format!(
                "Status could not be checked {} times in a row: {}",
                failures, message
            );
            let check = Check::Failed(failure(post, reason.clone()));
            let update = failed_update(post.platform_post_id.as_deref(), reason);
            return self.settle(post, PostStatus::Failed, update, check).await;
        }

        if post.error.as_deref() == Some(message.as_str()) {
            debug!(post_id = %post.id, failures, "Status lookup still failing, already reported");
            return Check::Unreachable;
        }
        Check::Failed(failure(post, message))
    }

    /// Move `post` to its reconciled state
    async fn settle(
        &self,
        post: &ScheduledPost,
        to: PostStatus,
        update: TransitionUpdate,
        check: Check,
    ) -> Check {
        match self
            .db
            .transition_post(&post.id, post.status, to, update, self.clock.now())
            .await
        {
            Ok(true) => {
                info!(post_id = %post.id, platform = %post.platform, status = %to, "Post status reconciled");
                check
            }
            Ok(false) => {
                debug!(post_id = %post.id, "Post changed state during monitoring");
                Check::Pending
            }
            Err(e) => Check::Failed(failure(post, e.to_string())),
        }
    }

    async fn remote_status(
        &self,
        post: &ScheduledPost,
        platform_post_id: &str,
    ) -> Result<RemotePostStatus> {
        let credential = self
            .accounts
            .require_credential(&post.user_id, post.platform)
            .await?;
        let adapter = self.factory.get_platform(post.platform)?;
        let options =
            ExecuteOptions::for_user(post.user_id.as_str()).with_context("postId", post.id.as_str());

        self.api
            .execute(post.platform, options, || {
                adapter.get_post_status(platform_post_id, &credential.access_token)
            })
            .await
    }

    /// Resubmit FAILED posts that still have retries left
    ///
    /// A successful resubmission puts the post back in PENDING with its new
    /// platform id so the next scan can confirm it. Posts in any other
    /// state are left alone.
    pub async fn retry_failed_posts(&self, post_ids: &[String], max_retries: u32) -> RetryResult {
        let mut result = RetryResult::default();

        for post_id in post_ids {
            let post = match self.db.get_scheduled_post(post_id).await {
                Ok(Some(post)) => post,
                Ok(None) => {
                    warn!(post_id = %post_id, "Cannot retry unknown post");
                    result.permanent_failures.push(post_id.clone());
                    continue;
                }
                Err(e) => {
                    warn!(post_id = %post_id, error = %e, "Failed to load post for retry");
                    continue;
                }
            };

            if post.status != PostStatus::Failed {
                debug!(post_id = %post.id, status = %post.status, "Post is not failed, skipping retry");
                continue;
            }
            if post.retry_count >= max_retries {
                info!(post_id = %post.id, retry_count = post.retry_count, "Post out of retries");
                result.permanent_failures.push(post.id.clone());
                continue;
            }

            match self.resubmit(&post).await {
                Ok(posted) => {
                    let moved = self
                        .db
                        .transition_post(
                            &post.id,
                            PostStatus::Failed,
                            PostStatus::Pending,
                            TransitionUpdate {
                                platform_post_id: Some(posted.id.clone()),
                                log: Some(LogEntry {
                                    status: PostStatus::Pending,
                                    platform_id: Some(posted.id.clone()),
                                    error_message: None,
                                }),
                                ..Default::default()
                            },
                            self.clock.now(),
                        )
                        .await;
                    match moved {
                        Ok(true) => {
                            info!(post_id = %post.id, platform_post_id = %posted.id, "Post resubmitted");
                            result.success.push(post.id.clone());
                        }
                        Ok(false) => {
                            warn!(post_id = %post.id, "Post changed state during retry");
                        }
                        Err(e) => {
                            result.failed.push(failure(&post, e.to_string()));
                        }
                    }
                }
                Err(e) => {
                    let message = e.message();
                    warn!(post_id = %post.id, platform = %post.platform, error = %message, "Resubmission failed");
                    if let Err(db_error) = self
                        .db
                        .record_failed_attempt(&post.id, &message, self.clock.now())
                        .await
                    {
                        warn!(post_id = %post.id, error = %db_error, "Failed to record retry attempt");
                    }
                    result.failed.push(failure(&post, message));
                }
            }
        }

        result
    }

    async fn resubmit(&self, post: &ScheduledPost) -> Result<PostResult> {
        let credential = self
            .accounts
            .require_credential(&post.user_id, post.platform)
            .await?;
        let adapter = self.factory.get_platform(post.platform)?;
        let options = PostOptions::default();
        let execute =
            ExecuteOptions::for_user(post.user_id.as_str()).with_context("postId", post.id.as_str());
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

    /// Tell each affected user about their failed posts
    ///
    /// Returns how many users were notified. Notifier errors are logged and
    /// dropped.
    pub async fn notify_failed_posts(&self, result: &MonitorResult) -> usize {
        let mut by_user: BTreeMap<&str, Vec<FailedPost>> = BTreeMap::new();
        for failure in &result.failed_posts {
            by_user
                .entry(failure.user_id.as_str())
                .or_default()
                .push(failure.clone());
        }

        let mut notified = 0;
        for (user_id, failures) in by_user {
            match self.notifier.notify(user_id, &failures).await {
                Ok(()) => notified += 1,
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "Failed to send failure notification");
                }
            }
        }
        notified
    }
}

fn failed_update(platform_post_id: Option<&str>, reason: String) -> TransitionUpdate {
    TransitionUpdate {
        error: Some(reason.clone()),
        log: Some(LogEntry {
            status: PostStatus::Failed,
            platform_id: platform_post_id.map(str::to_string),
            error_message: Some(reason),
        }),
        ..Default::default()
    }
}

fn failure(post: &ScheduledPost, error: String) -> FailedPost {
    FailedPost {
        post_id: post.id.clone(),
        user_id: post.user_id.clone(),
        platform: post.platform,
        error,
    }
}
