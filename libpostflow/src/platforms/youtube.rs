//! YouTube platform implementation
//!
//! Videos are uploaded privately through a resumable upload session.
//! `create_post` then publishes an uploaded video by setting its snippet and
//! privacy status, optionally with a provider-side `publishAt` time.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::OAuthAppConfig;
use crate::error::{PlatformError, Result};
use crate::platforms::http::{self, into_auth_error};
use crate::platforms::oauth::{self, TokenResponse};
use crate::platforms::{is_url, limits, require_media_type, PlatformAdapter};
use crate::types::{
    AccessTokenData, AuthorizationRequest, MediaMetadata, MediaType, MediaUploadResult, Platform,
    PlatformUser, PostOptions, PostResult, PrivacyStatus, RemotePostStatus,
};

const PLATFORM: Platform = Platform::YouTube;
const MAX_TITLE_CHARS: usize = 100;
const DEFAULT_SCOPES: [&str; 2] = [
    "https://www.googleapis.com/auth/youtube.upload",
    "https://www.googleapis.com/auth/youtube.readonly",
];

pub struct YouTubeAdapter {
    client: Client,
    app: OAuthAppConfig,
    auth_base: String,
    token_base: String,
    api_base: String,
}

#[derive(Debug, Deserialize)]
struct ItemList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct Channel {
    id: String,
    snippet: ChannelSnippet,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelSnippet {
    title: String,
    custom_url: Option<String>,
    thumbnails: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct UploadedVideo {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Video {
    status: Option<VideoStatus>,
    statistics: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoStatus {
    upload_status: Option<String>,
    failure_reason: Option<String>,
    rejection_reason: Option<String>,
}

/// Title from the options, else the first line of the description
fn video_title(content: &str, options: &PostOptions) -> String {
    let title = options
        .title
        .as_deref()
        .unwrap_or_else(|| content.lines().next().unwrap_or_default());
    let title: String = title.chars().take(MAX_TITLE_CHARS).collect();
    if title.trim().is_empty() {
        "Untitled".to_string()
    } else {
        title
    }
}

fn privacy_status(options: &PostOptions) -> &'static str {
    // Scheduled publishing only works on private videos
    if options.publish_at.is_some() {
        return "private";
    }
    match options.privacy.unwrap_or(PrivacyStatus::Public) {
        PrivacyStatus::Public => "public",
        PrivacyStatus::Unlisted => "unlisted",
        PrivacyStatus::Private => "private",
    }
}

impl YouTubeAdapter {
    pub fn new(app: OAuthAppConfig, client: Client) -> Self {
        Self {
            client,
            app,
            auth_base: "https://accounts.google.com".to_string(),
            token_base: "https://oauth2.googleapis.com".to_string(),
            api_base: "https://www.googleapis.com".to_string(),
        }
    }

    pub fn with_base_url(mut self, base: &str) -> Self {
        let base = base.trim_end_matches('/').to_string();
        self.auth_base = base.clone();
        self.token_base = base.clone();
        self.api_base = base;
        self
    }

    async fn token_request(&self, operation: &str, form: &[(&str, &str)]) -> Result<AccessTokenData> {
        let secret = self.app.require_secret(PLATFORM)?;
        let mut params = form.to_vec();
        params.push(("client_id", self.app.client_id.as_str()));
        params.push(("client_secret", secret));

        let response: TokenResponse = http::send_json(
            PLATFORM,
            operation,
            self.client
                .post(format!("{}/token", self.token_base))
                .form(&params),
        )
        .await
        .map_err(into_auth_error)?;
        Ok(response.into())
    }
}

#[async_trait]
impl PlatformAdapter for YouTubeAdapter {
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
        let scope = oauth::scopes_or(self.app.scopes.as_ref(), &DEFAULT_SCOPES, " ");
        let url = oauth::authorize_url(
            PLATFORM,
            &format!("{}/o/oauth2/v2/auth", self.auth_base),
            &[
                ("client_id", self.app.client_id.as_str()),
                ("redirect_uri", self.app.redirect_uri.as_str()),
                ("response_type", "code"),
                ("scope", scope.as_str()),
                ("access_type", "offline"),
                ("prompt", "consent"),
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
        let channels: ItemList<Channel> = http::send_json(
            PLATFORM,
            "get_user",
            self.client
                .get(format!("{}/youtube/v3/channels", self.api_base))
                .bearer_auth(access_token)
                .query(&[("part", "snippet"), ("mine", "true")]),
        )
        .await?;

        let channel = channels.items.into_iter().next().ok_or_else(|| {
            PlatformError::auth("This Google account has no YouTube channel")
                .with_context("platform", PLATFORM.as_str())
                .with_context("operation", "get_user")
        })?;

        let profile_image = channel
            .snippet
            .thumbnails
            .as_ref()
            .and_then(|t| t.pointer("/default/url"))
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(PlatformUser {
            id: channel.id,
            username: channel
                .snippet
                .custom_url
                .unwrap_or_else(|| channel.snippet.title.clone()),
            display_name: Some(channel.snippet.title),
            profile_image,
            is_verified: None,
        })
    }

    async fn upload_media(
        &self,
        data: &[u8],
        mime_type: &str,
        access_token: &str,
        metadata: Option<&MediaMetadata>,
    ) -> Result<MediaUploadResult> {
        let media_type = require_media_type(PLATFORM, mime_type)?;
        if media_type != MediaType::Video {
            return Err(PlatformError::validation("YouTube only accepts video uploads")
                .with_context("platform", PLATFORM.as_str())
                .with_context("operation", "upload_media")
                .into());
        }

        let title = metadata
            .and_then(|m| m.title.as_deref())
            .unwrap_or("Untitled");
        let session = http::send(
            PLATFORM,
            "upload_media_init",
            self.client
                .post(format!("{}/upload/youtube/v3/videos", self.api_base))
                .bearer_auth(access_token)
                .query(&[("uploadType", "resumable"), ("part", "snippet,status")])
                .header("X-Upload-Content-Type", mime_type)
                .header("X-Upload-Content-Length", data.len().to_string())
                .json(&json!({
                    "snippet": { "title": title },
                    "status": { "privacyStatus": "private" }
                })),
        )
        .await?;

        let upload_url = session
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                PlatformError::api("YouTube did not return a resumable upload URL")
                    .with_context("platform", PLATFORM.as_str())
                    .with_context("operation", "upload_media_init")
            })?;

        let video: UploadedVideo = http::send_json(
            PLATFORM,
            "upload_media_put",
            self.client
                .put(&upload_url)
                .bearer_auth(access_token)
                .header(reqwest::header::CONTENT_TYPE, mime_type)
                .body(data.to_vec()),
        )
        .await?;

        debug!(video_id = %video.id, bytes = data.len(), "YouTube video uploaded");
        Ok(MediaUploadResult {
            url: Some(format!("https://www.youtube.com/watch?v={}", video.id)),
            media_id: video.id,
            media_type,
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
        let video_id = media_ids
            .first()
            .filter(|m| !is_url(m))
            .ok_or_else(|| {
                PlatformError::validation("YouTube posts need an uploaded video id")
                    .with_context("platform", PLATFORM.as_str())
                    .with_context("operation", "create_post")
            })?;

        let mut status = json!({ "privacyStatus": privacy_status(options) });
        if let Some(publish_at) = options.publish_at {
            status["publishAt"] = json!(publish_at.to_rfc3339());
        }

        let video: UploadedVideo = http::send_json(
            PLATFORM,
            "create_post",
            self.client
                .put(format!("{}/youtube/v3/videos", self.api_base))
                .bearer_auth(access_token)
                .query(&[("part", "snippet,status")])
                .json(&json!({
                    "id": video_id,
                    "snippet": {
                        "title": video_title(content, options),
                        "description": content,
                        "categoryId": "22"
                    },
                    "status": status
                })),
        )
        .await?;

        let url = format!("https://www.youtube.com/watch?v={}", video.id);
        Ok(PostResult::new(PLATFORM, video.id, Some(url)))
    }

    async fn delete_post(&self, post_id: &str, access_token: &str) -> Result<()> {
        http::send(
            PLATFORM,
            "delete_post",
            self.client
                .delete(format!("{}/youtube/v3/videos", self.api_base))
                .bearer_auth(access_token)
                .query(&[("id", post_id)]),
        )
        .await?;
        Ok(())
    }

    async fn get_post_status(
        &self,
        post_id: &str,
        access_token: &str,
    ) -> Result<RemotePostStatus> {
        let videos: ItemList<Video> = http::send_json(
            PLATFORM,
            "get_post_status",
            self.client
                .get(format!("{}/youtube/v3/videos", self.api_base))
                .bearer_auth(access_token)
                .query(&[("part", "status,statistics"), ("id", post_id)]),
        )
        .await?;

        let Some(video) = videos.items.into_iter().next() else {
            return Ok(RemotePostStatus::Failed {
                reason: "Video not found".to_string(),
            });
        };
        let status = video.status.unwrap_or(VideoStatus {
            upload_status: None,
            failure_reason: None,
            rejection_reason: None,
        });

        Ok(match status.upload_status.as_deref() {
            Some("processed") => RemotePostStatus::Published {
                metrics: video.statistics,
            },
            Some(state @ ("failed" | "rejected" | "deleted")) => RemotePostStatus::Failed {
                reason: status
                    .failure_reason
                    .or(status.rejection_reason)
                    .unwrap_or_else(|| state.to_string()),
            },
            _ => RemotePostStatus::Pending,
        })
    }
}
