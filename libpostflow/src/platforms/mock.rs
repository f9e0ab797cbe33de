//! Mock platform adapter for testing
//!
//! A configurable [`PlatformAdapter`] that simulates successes, failures,
//! flaky providers and slow responses without credentials or network
//! access. Scheduler, monitor and API manager tests drive the pipeline
//! through it.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

use crate::error::{PlatformError, Result};
use crate::platforms::{limits, oauth, PlatformAdapter};
use crate::types::{
    AccessTokenData, AuthorizationRequest, MediaMetadata, MediaUploadResult, Platform,
    PlatformUser, PostOptions, PostResult, RemotePostStatus,
};

/// Arguments of one `create_post` call
#[derive(Debug, Clone, PartialEq)]
pub struct CreateCall {
    pub content: String,
    pub media_ids: Vec<String>,
    pub reply_to: Option<String>,
    pub access_token: String,
}

#[derive(Debug, Default)]
struct MockState {
    create_calls: Vec<CreateCall>,
    refresh_calls: usize,
    status_calls: usize,
    upload_calls: usize,
    deleted: Vec<String>,
}

/// Configuration for mock adapter behavior
#[derive(Debug, Clone)]
pub struct MockConfig {
    pub platform: Platform,

    /// Error returned by `authorize`
    pub auth_error: Option<PlatformError>,

    /// Error returned by `refresh_token`
    pub refresh_error: Option<PlatformError>,

    /// Error returned by `create_post`
    pub post_error: Option<PlatformError>,

    /// Number of initial `create_post` calls that fail with `post_error`
    /// before succeeding; `None` fails every call
    pub fail_times: Option<usize>,

    /// Answer of `get_post_status`
    pub status: RemotePostStatus,

    /// Error returned by `get_post_status`
    pub status_error: Option<PlatformError>,

    /// Delay before completing operations (simulates network latency)
    pub delay: Duration,

    /// Inter-post delay used by `create_thread`
    pub thread_delay: Duration,
}

impl MockConfig {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            auth_error: None,
            refresh_error: None,
            post_error: None,
            fail_times: None,
            status: RemotePostStatus::Published { metrics: None },
            status_error: None,
            delay: Duration::ZERO,
            thread_delay: crate::platforms::THREAD_DELAY,
        }
    }
}

/// Mock platform adapter for testing
pub struct MockAdapter {
    config: MockConfig,
    state: Arc<Mutex<MockState>>,
}

impl MockAdapter {
    pub fn new(config: MockConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// An adapter whose every operation succeeds
    pub fn success(platform: Platform) -> Self {
        Self::new(MockConfig::new(platform))
    }

    /// An adapter whose `create_post` always fails with `error`
    pub fn post_failure(platform: Platform, error: PlatformError) -> Self {
        Self::new(MockConfig {
            post_error: Some(error),
            ..MockConfig::new(platform)
        })
    }

    /// An adapter whose first `failures` posts fail, then succeed
    pub fn flaky(platform: Platform, failures: usize, error: PlatformError) -> Self {
        Self::new(MockConfig {
            post_error: Some(error),
            fail_times: Some(failures),
            ..MockConfig::new(platform)
        })
    }

    pub fn with_delay(platform: Platform, delay: Duration) -> Self {
        Self::new(MockConfig {
            delay,
            ..MockConfig::new(platform)
        })
    }

    /// An adapter reporting `status` for every submitted post
    pub fn with_status(platform: Platform, status: RemotePostStatus) -> Self {
        Self::new(MockConfig {
            status,
            ..MockConfig::new(platform)
        })
    }

    pub fn create_calls(&self) -> Vec<CreateCall> {
        self.lock().create_calls.clone()
    }

    pub fn create_call_count(&self) -> usize {
        self.lock().create_calls.len()
    }

    pub fn refresh_call_count(&self) -> usize {
        self.lock().refresh_calls
    }

    pub fn status_call_count(&self) -> usize {
        self.lock().status_calls
    }

    pub fn upload_call_count(&self) -> usize {
        self.lock().upload_calls
    }

    pub fn deleted_posts(&self) -> Vec<String> {
        self.lock().deleted.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn simulate_latency(&self) {
        if !self.config.delay.is_zero() {
            sleep(self.config.delay).await;
        }
    }
}

#[async_trait]
impl PlatformAdapter for MockAdapter {
    fn platform(&self) -> Platform {
        self.config.platform
    }

    fn character_limit(&self) -> Option<usize> {
        limits(self.config.platform).0
    }

    fn max_media(&self) -> usize {
        limits(self.config.platform).1
    }

    fn get_auth_url(&self) -> Result<AuthorizationRequest> {
        let state = oauth::generate_state();
        let url = oauth::authorize_url(
            self.config.platform,
            &format!("https://mock.invalid/{}/authorize", self.config.platform),
            &[("state", state.as_str())],
        )?;
        Ok(AuthorizationRequest {
            url,
            state,
            code_verifier: None,
        })
    }

    async fn authorize(&self, code: &str, _verifier: Option<&str>) -> Result<AccessTokenData> {
        self.simulate_latency().await;
        if let Some(error) = &self.config.auth_error {
            return Err(error.clone().into());
        }
        Ok(AccessTokenData {
            access_token: format!("mock-access-{}", code),
            refresh_token: Some("mock-refresh".to_string()),
            expires_at: Some(Utc::now() + ChronoDuration::hours(1)),
            token_type: Some("bearer".to_string()),
            scope: None,
        })
    }

    async fn refresh_token(&self, _refresh_token: &str) -> Result<AccessTokenData> {
        let count = {
            let mut state = self.lock();
            state.refresh_calls += 1;
            state.refresh_calls
        };
        self.simulate_latency().await;

        if let Some(error) = &self.config.refresh_error {
            return Err(error.clone().into());
        }
        Ok(AccessTokenData {
            access_token: format!("mock-access-refreshed-{}", count),
            refresh_token: None,
            expires_at: Some(Utc::now() + ChronoDuration::hours(1)),
            token_type: Some("bearer".to_string()),
            scope: None,
        })
    }

    async fn get_user(&self, _access_token: &str) -> Result<PlatformUser> {
        self.simulate_latency().await;
        Ok(PlatformUser {
            id: format!("{}-user-1", self.config.platform),
            username: "mock_user".to_string(),
            display_name: Some("Mock User".to_string()),
            profile_image: None,
            is_verified: Some(false),
        })
    }

    async fn upload_media(
        &self,
        _data: &[u8],
        mime_type: &str,
        _access_token: &str,
        _metadata: Option<&MediaMetadata>,
    ) -> Result<MediaUploadResult> {
        let media_type = crate::platforms::require_media_type(self.config.platform, mime_type)?;
        let count = {
            let mut state = self.lock();
            state.upload_calls += 1;
            state.upload_calls
        };
        self.simulate_latency().await;

        Ok(MediaUploadResult {
            media_id: format!("{}-media-{}", self.config.platform, count),
            media_type,
            url: None,
        })
    }

    async fn create_post(
        &self,
        content: &str,
        media_ids: &[String],
        access_token: &str,
        options: &PostOptions,
    ) -> Result<PostResult> {
        self.validate_content(content, media_ids)?;

        let attempt = {
            let mut state = self.lock();
            state.create_calls.push(CreateCall {
                content: content.to_string(),
                media_ids: media_ids.to_vec(),
                reply_to: options.reply_to.clone(),
                access_token: access_token.to_string(),
            });
            state.create_calls.len()
        };
        self.simulate_latency().await;

        if let Some(error) = &self.config.post_error {
            let failing = self.config.fail_times.map_or(true, |n| attempt <= n);
            if failing {
                return Err(error.clone().into());
            }
        }

        let id = format!("{}-post-{}", self.config.platform, attempt);
        let url = Some(format!("https://mock.invalid/{}/{}", self.config.platform, id));
        Ok(PostResult::new(self.config.platform, id, url))
    }

    async fn delete_post(&self, post_id: &str, _access_token: &str) -> Result<()> {
        self.simulate_latency().await;
        self.lock().deleted.push(post_id.to_string());
        Ok(())
    }

    async fn get_post_status(
        &self,
        _post_id: &str,
        _access_token: &str,
    ) -> Result<RemotePostStatus> {
        self.lock().status_calls += 1;
        self.simulate_latency().await;

        match &self.config.status_error {
            Some(error) => Err(error.clone().into()),
            None => Ok(self.config.status.clone()),
        }
    }

    fn thread_delay(&self) -> Duration {
        self.config.thread_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[tokio::test]
    async fn test_success_records_calls() {
        let adapter = MockAdapter::success(Platform::Twitter);
        let result = adapter
            .create_post("Hello", &[], "token", &PostOptions::default())
            .await
            .unwrap();

        assert_eq!(result.id, "twitter-post-1");
        assert_eq!(result.platform, Platform::Twitter);
        assert_eq!(adapter.create_call_count(), 1);
        assert_eq!(adapter.create_calls()[0].access_token, "token");
    }

    #[tokio::test]
    async fn test_flaky_adapter_recovers() {
        let adapter = MockAdapter::flaky(Platform::LinkedIn, 2, PlatformError::network("reset"));
        let options = PostOptions::default();

        assert!(adapter.create_post("a", &[], "t", &options).await.is_err());
        assert!(adapter.create_post("a", &[], "t", &options).await.is_err());
        assert!(adapter.create_post("a", &[], "t", &options).await.is_ok());
    }

    #[tokio::test]
    async fn test_validation_happens_before_recording() {
        let adapter = MockAdapter::success(Platform::Instagram);
        let err = adapter
            .create_post("caption", &[], "t", &PostOptions::default())
            .await
            .unwrap_err();

        assert_eq!(err.code(), Some(ErrorCode::ValidationError));
        assert_eq!(adapter.create_call_count(), 0);
    }

    #[tokio::test]
    async fn test_status_and_refresh_counters() {
        let adapter = MockAdapter::with_status(
            Platform::Threads,
            RemotePostStatus::Failed {
                reason: "removed".to_string(),
            },
        );

        let status = adapter.get_post_status("p1", "t").await.unwrap();
        assert!(matches!(status, RemotePostStatus::Failed { .. }));
        assert_eq!(adapter.status_call_count(), 1);

        let token = adapter.refresh_token("r").await.unwrap();
        assert_eq!(token.access_token, "mock-access-refreshed-1");
        assert_eq!(adapter.refresh_call_count(), 1);
    }
}
