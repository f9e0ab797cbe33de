//! TikTok platform implementation
//!
//! Content Posting API v2. Uploaded files go to the creator's inbox through
//! a FILE_UPLOAD session: the bytes are PUT in chunks with `Content-Range`
//! and the publish status is polled. Direct posts pull the video from a
//! public URL; publication then completes asynchronously and is reconciled
//! through `get_post_status`.

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::OAuthAppConfig;
use crate::error::{ErrorCode, PlatformError, Result};
use crate::platforms::http;
use crate::platforms::oauth;
use crate::platforms::poll::{poll_until, PollPolicy, PollState};
use crate::platforms::{is_url, limits, require_media_type, unsupported, PlatformAdapter};
use crate::types::{
    AccessTokenData, AuthorizationRequest, MediaMetadata, MediaType, MediaUploadResult, Platform,
    PlatformUser, PostOptions, PostResult, PrivacyStatus, RemotePostStatus,
};

const PLATFORM: Platform = Platform::TikTok;

/// Upload chunk size; the last chunk absorbs the remainder
pub const CHUNK_SIZE: usize = 10 * 1024 * 1024;

const DEFAULT_SCOPES: [&str; 3] = ["user.info.basic", "video.upload", "video.publish"];

pub struct TikTokAdapter {
    client: Client,
    app: OAuthAppConfig,
    auth_base: String,
    api_base: String,
    poll: PollPolicy,
}

/// Every v2 response wraps its payload next to an `error` object
#[derive(Debug, Deserialize)]
struct Envelope {
    data: Option<Value>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    token_type: Option<String>,
    scope: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserData {
    user: TikTokUser,
}

#[derive(Debug, Deserialize)]
struct TikTokUser {
    open_id: String,
    username: Option<String>,
    display_name: Option<String>,
    avatar_url: Option<String>,
    is_verified: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct InitData {
    publish_id: String,
    upload_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusData {
    status: String,
    fail_reason: Option<String>,
}

/// Chunk layout TikTok expects: whole chunks, remainder folded into the last
fn chunk_ranges(size: usize) -> Vec<(usize, usize)> {
    if size <= CHUNK_SIZE {
        return vec![(0, size)];
    }
    let count = size / CHUNK_SIZE;
    (0..count)
        .map(|i| {
            let start = i * CHUNK_SIZE;
            let end = if i + 1 == count { size } else { start + CHUNK_SIZE };
            (start, end)
        })
        .collect()
}

fn privacy_level(privacy: Option<PrivacyStatus>) -> &'static str {
    match privacy {
        Some(PrivacyStatus::Private) => "SELF_ONLY",
        Some(PrivacyStatus::Unlisted) => "MUTUAL_FOLLOW_FRIENDS",
        Some(PrivacyStatus::Public) | None => "PUBLIC_TO_EVERYONE",
    }
}

impl TikTokAdapter {
    pub fn new(app: OAuthAppConfig, client: Client) -> Self {
        Self {
            client,
            app,
            auth_base: "https://www.tiktok.com".to_string(),
            api_base: "https://open.tiktokapis.com".to_string(),
            poll: PollPolicy::default(),
        }
    }

    pub fn with_base_url(mut self, base: &str) -> Self {
        let base = base.trim_end_matches('/').to_string();
        self.auth_base = base.clone();
        self.api_base = base;
        self
    }

    pub fn with_poll_policy(mut self, policy: PollPolicy) -> Self {
        self.poll = policy;
        self
    }

    /// Unwrap the v2 envelope, classifying TikTok's error codes
    fn unwrap_envelope<T: DeserializeOwned>(operation: &str, envelope: Envelope) -> Result<T> {
        if let Some(error) = envelope.error.filter(|e| e.code != "ok") {
            let code = match error.code.as_str() {
                "access_token_invalid" | "scope_not_authorized" | "access_token_expired" => {
                    ErrorCode::AuthError
                }
                "rate_limit_exceeded" | "spam_risk_too_many_posts" => ErrorCode::RateLimitExceeded,
                "invalid_params" | "invalid_file_upload" | "url_ownership_unverified" => {
                    ErrorCode::ValidationError
                }
                _ => ErrorCode::ApiError,
            };
            return Err(PlatformError::new(
                code,
                format!("TikTok {} failed: {} ({})", operation, error.message, error.code),
            )
            .with_context("platform", PLATFORM.as_str())
            .with_context("operation", operation)
            .with_context("providerCode", error.code)
            .into());
        }

        let data = envelope.data.unwrap_or(Value::Null);
        serde_json::from_value(data).map_err(|e| {
            PlatformError::api(format!("Unexpected TikTok {} payload: {}", operation, e))
                .with_context("platform", PLATFORM.as_str())
                .with_context("operation", operation)
                .into()
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        operation: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<T> {
        let envelope: Envelope = http::send_json(PLATFORM, operation, request).await?;
        Self::unwrap_envelope(operation, envelope)
    }

    async fn token_request(&self, operation: &str, form: &[(&str, &str)]) -> Result<AccessTokenData> {
        let secret = self.app.require_secret(PLATFORM)?;
        let mut params = form.to_vec();
        params.push(("client_key", self.app.client_id.as_str()));
        params.push(("client_secret", secret));

        let body: TokenBody = http::send_json(
            PLATFORM,
            operation,
            self.client
                .post(format!("{}/v2/oauth/token/", self.api_base))
                .form(&params),
        )
        .await
        .map_err(http::into_auth_error)?;

        match (body.access_token, body.error) {
            (Some(access_token), None) => Ok(AccessTokenData::from_expires_in(
                access_token,
                body.refresh_token,
                body.expires_in,
                body.token_type,
                body.scope,
            )),
            (_, error) => Err(PlatformError::auth(format!(
                "TikTok rejected the token request: {}",
                body.error_description
                    .or(error)
                    .unwrap_or_else(|| "no access token returned".to_string())
            ))
            .with_context("platform", PLATFORM.as_str())
            .with_context("operation", operation)
            .into()),
        }
    }

    async fn fetch_status(&self, publish_id: &str, token: &str) -> Result<StatusData> {
        self.call(
            "publish_status",
            self.client
                .post(format!("{}/v2/post/publish/status/fetch/", self.api_base))
                .bearer_auth(token)
                .json(&json!({ "publish_id": publish_id })),
        )
        .await
    }
}

#[async_trait]
impl PlatformAdapter for TikTokAdapter {
    fn platform(&self) -> Platform {
        PLATFORM
    }

    fn character_limit(&self) -> Option<usize> {
        limits(PLATFORM).0
    }

    fn max_media(&self) -> usize {
        limits(PLATFORM).1
    }

    fn get_auth_url(&self) -> Result<AuthorizationRequest> {
        let state = oauth::generate_state();
        let scope = oauth::scopes_or(self.app.scopes.as_ref(), &DEFAULT_SCOPES, ",");
        let url = oauth::authorize_url(
            PLATFORM,
            &format!("{}/v2/auth/authorize/", self.auth_base),
            &[
                ("client_key", self.app.client_id.as_str()),
                ("scope", scope.as_str()),
                ("response_type", "code"),
                ("redirect_uri", self.app.redirect_uri.as_str()),
                ("state", state.as_str()),
            ],
        )?;
        Ok(AuthorizationRequest {
            url,
            state,
            code_verifier: None,
        })
    }

    async fn authorize(&self, code: &str, _verifier: Option<&str>) -> Result<AccessTokenData> {
        self.token_request(
            "authorize",
            &[
                ("code", code),
                ("grant_type", "authorization_code"),
                ("redirect_uri", self.app.redirect_uri.as_str()),
            ],
        )
        .await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<AccessTokenData> {
        self.token_request(
            "refresh_token",
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ],
        )
        .await
    }

    async fn get_user(&self, access_token: &str) -> Result<PlatformUser> {
        let data: UserData = self
            .call(
                "get_user",
                self.client
                    .get(format!("{}/v2/user/info/", self.api_base))
                    .bearer_auth(access_token)
                    .query(&[(
                        "fields",
                        "open_id,avatar_url,display_name,username,is_verified",
                    )]),
            )
            .await?;
        let user = data.user;

        Ok(PlatformUser {
            username: user
                .username
                .clone()
                .or_else(|| user.display_name.clone())
                .unwrap_or_else(|| user.open_id.clone()),
            id: user.open_id,
            display_name: user.display_name,
            profile_image: user.avatar_url,
            is_verified: user.is_verified,
        })
    }

    async fn upload_media(
        &self,
        data: &[u8],
        mime_type: &str,
        access_token: &str,
        _metadata: Option<&MediaMetadata>,
    ) -> Result<MediaUploadResult> {
        let media_type = require_media_type(PLATFORM, mime_type)?;
        if media_type != MediaType::Video {
            return Err(PlatformError::validation("TikTok only accepts video uploads")
                .with_context("platform", PLATFORM.as_str())
                .with_context("operation", "upload_media")
                .into());
        }

        let ranges = chunk_ranges(data.len());
        let chunk_size = ranges.first().map(|(s, e)| e - s).unwrap_or(0);
        let init: InitData = self
            .call(
                "upload_media_init",
                self.client
                    .post(format!("{}/v2/post/publish/inbox/video/init/", self.api_base))
                    .bearer_auth(access_token)
                    .json(&json!({
                        "source_info": {
                            "source": "FILE_UPLOAD",
                            "video_size": data.len(),
                            "chunk_size": chunk_size,
                            "total_chunk_count": ranges.len()
                        }
                    })),
            )
            .await?;

        let upload_url = init.upload_url.ok_or_else(|| {
            PlatformError::api("TikTok did not return an upload URL")
                .with_context("platform", PLATFORM.as_str())
                .with_context("operation", "upload_media_init")
        })?;

        for (start, end) in &ranges {
            http::send(
                PLATFORM,
                "upload_media_put",
                self.client
                    .put(&upload_url)
                    .header(reqwest::header::CONTENT_TYPE, mime_type)
                    .header(
                        reqwest::header::CONTENT_RANGE,
                        format!("bytes {}-{}/{}", start, end - 1, data.len()),
                    )
                    .body(data[*start..*end].to_vec()),
            )
            .await?;
        }
        debug!(publish_id = %init.publish_id, chunks = ranges.len(), "TikTok upload transferred");

        let publish_id = init.publish_id;
        let id = publish_id.as_str();
        poll_until(PLATFORM, "publish_status", self.poll, || async move {
            let status = self.fetch_status(id, access_token).await?;
            Ok(match status.status.as_str() {
                "SEND_TO_USER_INBOX" | "PUBLISH_COMPLETE" => PollState::Done(()),
                "FAILED" => PollState::Failed(
                    status.fail_reason.unwrap_or_else(|| "FAILED".to_string()),
                ),
                other => PollState::Pending(other.to_string()),
            })
        })
        .await?;

        Ok(MediaUploadResult {
            media_id: publish_id,
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
        let video_url = media_ids
            .first()
            .filter(|m| is_url(m))
            .ok_or_else(|| {
                PlatformError::validation("TikTok posts pull the video from a public URL")
                    .with_context("platform", PLATFORM.as_str())
                    .with_context("operation", "create_post")
            })?;

        let init: InitData = self
            .call(
                "create_post",
                self.client
                    .post(format!("{}/v2/post/publish/video/init/", self.api_base))
                    .bearer_auth(access_token)
                    .json(&json!({
                        "post_info": {
                            "title": content,
                            "privacy_level": privacy_level(options.privacy),
                            "disable_comment": false
                        },
                        "source_info": {
                            "source": "PULL_FROM_URL",
                            "video_url": video_url
                        }
                    })),
            )
            .await?;

        Ok(PostResult::new(PLATFORM, init.publish_id, None))
    }

    async fn delete_post(&self, _post_id: &str, _access_token: &str) -> Result<()> {
        Err(unsupported(PLATFORM, "delete_post"))
    }

    async fn get_post_status(
        &self,
        post_id: &str,
        access_token: &str,
    ) -> Result<RemotePostStatus> {
        let status = self.fetch_status(post_id, access_token).await?;
        Ok(match status.status.as_str() {
            "PUBLISH_COMPLETE" => RemotePostStatus::Published { metrics: None },
            "FAILED" => RemotePostStatus::Failed {
                reason: status.fail_reason.unwrap_or_else(|| "FAILED".to_string()),
            },
            _ => RemotePostStatus::Pending,
        })
    }
}
