//! Platform adapters
//!
//! Every destination platform implements [`PlatformAdapter`], a uniform
//! contract for OAuth, user lookup, media upload and post management. The
//! wildly different provider protocols (chunked uploads, container
//! publishing, long-lived token exchange) stay behind it.
//!
//! # Examples
//!
//! ```no_run
//! use libpostflow::platforms::PlatformAdapter;
//! use libpostflow::types::PostOptions;
//!
//! # async fn example(adapter: &dyn PlatformAdapter, token: &str) -> libpostflow::Result<()> {
//! adapter.validate_content("Hello!", &[])?;
//! let result = adapter
//!     .create_post("Hello!", &[], token, &PostOptions::default())
//!     .await?;
//! println!("Posted {} to {}", result.id, adapter.platform());
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::error::{PlatformError, Result};
use crate::types::{
    AccessTokenData, AuthorizationRequest, MediaMetadata, MediaType, MediaUploadResult, Platform,
    PlatformUser, PostOptions, PostResult, RemotePostStatus, ThreadPost,
};

pub mod bluesky;
pub mod factory;
pub mod http;
pub mod instagram;
pub mod linkedin;
pub mod oauth;
pub mod poll;
pub mod threads;
pub mod tiktok;
pub mod twitter;
pub mod youtube;

// Available outside tests so integration tests can drive the pipeline
pub mod mock;

pub use factory::PlatformFactory;
pub use poll::PollPolicy;

/// Delay between consecutive posts of a thread
pub const THREAD_DELAY: Duration = Duration::from_secs(1);

#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    /// Maximum post length in characters, `None` when unlimited
    fn character_limit(&self) -> Option<usize>;

    /// Maximum media items per post
    fn max_media(&self) -> usize;

    /// Build the provider's authorization URL
    ///
    /// Side-effect free: the returned `state` and PKCE verifier must be
    /// stored by the caller until the callback arrives.
    fn get_auth_url(&self) -> Result<AuthorizationRequest>;

    /// Exchange an authorization code for tokens
    ///
    /// Fails with AUTH_ERROR when the provider rejects the code.
    async fn authorize(&self, code: &str, verifier: Option<&str>) -> Result<AccessTokenData>;

    /// Exchange a refresh token for a new access token
    async fn refresh_token(&self, refresh_token: &str) -> Result<AccessTokenData>;

    async fn get_user(&self, access_token: &str) -> Result<PlatformUser>;

    async fn upload_media(
        &self,
        data: &[u8],
        mime_type: &str,
        access_token: &str,
        metadata: Option<&MediaMetadata>,
    ) -> Result<MediaUploadResult>;

    /// Publish a post. Content is validated before any network call.
    async fn create_post(
        &self,
        content: &str,
        media_ids: &[String],
        access_token: &str,
        options: &PostOptions,
    ) -> Result<PostResult>;

    async fn delete_post(&self, post_id: &str, access_token: &str) -> Result<()>;

    /// Publication state of a submitted post, as seen by the provider
    async fn get_post_status(&self, post_id: &str, access_token: &str)
        -> Result<RemotePostStatus>;

    fn validate_content(&self, content: &str, media_ids: &[String]) -> Result<()> {
        validate_post(
            self.platform(),
            self.character_limit(),
            self.max_media(),
            content,
            media_ids,
        )
    }

    fn thread_delay(&self) -> Duration {
        THREAD_DELAY
    }

    /// Publish a reply chain in order, each post replying to the previous one
    async fn create_thread(
        &self,
        posts: &[ThreadPost],
        access_token: &str,
    ) -> Result<Vec<PostResult>> {
        let platform = self.platform();
        if !platform.supports_threads() {
            return Err(PlatformError::platform(format!("{} does not support threads", platform))
                .with_context("platform", platform.as_str())
                .with_context("reason", "unsupported")
                .into());
        }
        if posts.is_empty() {
            return Err(PlatformError::validation("A thread needs at least one post")
                .with_context("platform", platform.as_str())
                .into());
        }

        for post in posts {
            self.validate_content(&post.content, &post.media_ids)?;
        }

        let mut results: Vec<PostResult> = Vec::with_capacity(posts.len());
        for (index, post) in posts.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.thread_delay()).await;
            }

            let options = PostOptions {
                reply_to: results.last().map(|r| r.id.clone()),
                ..Default::default()
            };
            let result = self
                .create_post(&post.content, &post.media_ids, access_token, &options)
                .await?;
            debug!(platform = %platform, index, post_id = %result.id, "Thread post published");
            results.push(result);
        }

        Ok(results)
    }
}

/// Character limit and media cap of each provider
pub fn limits(platform: Platform) -> (Option<usize>, usize) {
    match platform {
        Platform::Twitter => (Some(280), 4),
        Platform::LinkedIn => (Some(3000), 9),
        Platform::Instagram => (Some(2200), 10),
        Platform::TikTok => (Some(2200), 1),
        Platform::YouTube => (Some(5000), 1),
        Platform::Bluesky => (Some(300), 4),
        Platform::Threads => (Some(500), 10),
    }
}

/// Checks shared by every adapter: non-empty content, length, media count and
/// required media
pub fn validate_post(
    platform: Platform,
    character_limit: Option<usize>,
    max_media: usize,
    content: &str,
    media_ids: &[String],
) -> Result<()> {
    let fail = |message: String| -> crate::error::PostflowError {
        PlatformError::validation(message)
            .with_context("platform", platform.as_str())
            .into()
    };

    if content.trim().is_empty() && media_ids.is_empty() {
        return Err(fail("Content cannot be empty".to_string()));
    }

    if let Some(limit) = character_limit {
        let length = content.chars().count();
        if length > limit {
            return Err(fail(format!(
                "Content exceeds {}'s {} character limit (current: {} characters)",
                platform, limit, length
            )));
        }
    }

    if platform.requires_media() && media_ids.is_empty() {
        return Err(fail(format!("{} posts require at least one media item", platform)));
    }

    if media_ids.len() > max_media {
        return Err(fail(format!(
            "{} allows at most {} media items per post (got {})",
            platform,
            max_media,
            media_ids.len()
        )));
    }

    Ok(())
}

/// Media references that are URLs rather than provider ids
pub(crate) fn is_url(reference: &str) -> bool {
    reference.starts_with("https://") || reference.starts_with("http://")
}

/// Guess the media kind of a URL from its extension
pub(crate) fn media_type_from_url(url: &str) -> MediaType {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_lowercase();
    const VIDEO_EXTENSIONS: [&str; 5] = [".mp4", ".mov", ".m4v", ".webm", ".avi"];
    if VIDEO_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
        MediaType::Video
    } else {
        MediaType::Image
    }
}

pub(crate) fn require_media_type(
    platform: Platform,
    mime_type: &str,
) -> Result<MediaType> {
    MediaType::from_mime(mime_type).ok_or_else(|| {
        PlatformError::validation(format!("Unsupported media type '{}'", mime_type))
            .with_context("platform", platform.as_str())
            .into()
    })
}

pub(crate) fn unsupported(platform: Platform, operation: &str) -> crate::error::PostflowError {
    PlatformError::platform(format!("{} does not support {}", platform, operation))
        .with_context("platform", platform.as_str())
        .with_context("operation", operation)
        .with_context("reason", "unsupported")
        .into()
}

#[cfg(test)]
mod tests {
    use super::mock::MockAdapter;
    use super::*;
    use crate::error::{ErrorCode, PostflowError};
    use std::time::Instant;

    fn code_of(result: Result<()>) -> ErrorCode {
        match result {
            Err(PostflowError::Platform(e)) => e.code,
            other => panic!("expected platform error, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_empty_content() {
        let result = validate_post(Platform::Twitter, Some(280), 4, "   ", &[]);
        assert_eq!(code_of(result), ErrorCode::ValidationError);
    }

    #[test]
    fn test_validate_counts_characters_not_bytes() {
        let content = "é".repeat(280);
        assert!(validate_post(Platform::Twitter, Some(280), 4, &content, &[]).is_ok());

        let content = "é".repeat(281);
        assert_eq!(
            code_of(validate_post(Platform::Twitter, Some(280), 4, &content, &[])),
            ErrorCode::ValidationError
        );
    }

    #[test]
    fn test_validate_required_media() {
        for platform in [Platform::Instagram, Platform::TikTok, Platform::YouTube] {
            let result = validate_post(platform, None, 10, "caption", &[]);
            assert_eq!(code_of(result), ErrorCode::ValidationError);
        }
        assert!(validate_post(Platform::LinkedIn, None, 9, "text only", &[]).is_ok());
    }

    #[test]
    fn test_validate_media_count() {
        let media: Vec<String> = (0..5).map(|i| format!("m{}", i)).collect();
        let result = validate_post(Platform::Twitter, Some(280), 4, "hi", &media);
        assert_eq!(code_of(result), ErrorCode::ValidationError);
    }

    #[test]
    fn test_media_type_from_url() {
        assert_eq!(media_type_from_url("https://cdn.x/clip.MP4?sig=1"), MediaType::Video);
        assert_eq!(media_type_from_url("https://cdn.x/photo.jpg"), MediaType::Image);
    }

    #[tokio::test(start_paused = true)]
    async fn test_thread_posts_in_order_with_delay() {
        let adapter = MockAdapter::success(Platform::Bluesky);
        let posts = vec![
            ThreadPost {
                content: "one".to_string(),
                media_ids: vec![],
            },
            ThreadPost {
                content: "two".to_string(),
                media_ids: vec![],
            },
            ThreadPost {
                content: "three".to_string(),
                media_ids: vec![],
            },
        ];

        let started = tokio::time::Instant::now();
        let results = adapter.create_thread(&posts, "token").await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(2));

        let calls = adapter.create_calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].content, "one");
        assert_eq!(calls[0].reply_to, None);
        assert_eq!(calls[1].reply_to.as_deref(), Some(results[0].id.as_str()));
        assert_eq!(calls[2].reply_to.as_deref(), Some(results[1].id.as_str()));
    }

    #[tokio::test]
    async fn test_thread_rejected_on_platform_without_reply_chains() {
        let adapter = MockAdapter::success(Platform::LinkedIn);
        let posts = vec![ThreadPost {
            content: "one".to_string(),
            media_ids: vec![],
        }];

        let err = adapter.create_thread(&posts, "token").await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::PlatformError));
        assert!(adapter.create_calls().is_empty());
    }

    #[tokio::test]
    async fn test_thread_validates_every_post_first() {
        let adapter = MockAdapter::success(Platform::Twitter);
        let posts = vec![
            ThreadPost {
                content: "fine".to_string(),
                media_ids: vec![],
            },
            ThreadPost {
                content: "x".repeat(281),
                media_ids: vec![],
            },
        ];

        let started = Instant::now();
        let err = adapter.create_thread(&posts, "token").await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::ValidationError));
        assert!(adapter.create_calls().is_empty());
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
