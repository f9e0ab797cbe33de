//! Twitter / X platform implementation
//!
//! OAuth 2.0 with PKCE, v2 tweet endpoints and the v1.1 media upload API.
//! Images go up in one request; videos and GIFs use the chunked
//! INIT/APPEND/FINALIZE protocol followed by STATUS polling.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::OAuthAppConfig;
use crate::error::Result;
use crate::platforms::http::{self, into_auth_error};
use crate::platforms::oauth::{self, Pkce, TokenResponse};
use crate::platforms::poll::{poll_until, PollPolicy, PollState};
use crate::platforms::{limits, require_media_type, PlatformAdapter};
use crate::types::{
    AccessTokenData, AuthorizationRequest, MediaMetadata, MediaType, MediaUploadResult, Platform,
    PlatformUser, PostOptions, PostResult, RemotePostStatus,
};

const PLATFORM: Platform = Platform::Twitter;

/// APPEND segment size
pub const CHUNK_SIZE: usize = 5 * 1024 * 1024;

const DEFAULT_SCOPES: [&str; 5] = [
    "tweet.read",
    "tweet.write",
    "users.read",
    "media.write",
    "offline.access",
];

pub struct TwitterAdapter {
    client: Client,
    app: OAuthAppConfig,
    auth_base: String,
    api_base: String,
    upload_base: String,
    poll: PollPolicy,
}

#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct TwitterUser {
    id: String,
    username: String,
    name: Option<String>,
    profile_image_url: Option<String>,
    verified: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct Tweet {
    id: String,
    #[serde(default)]
    public_metrics: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct MediaResponse {
    media_id_string: String,
    #[serde(default)]
    processing_info: Option<ProcessingInfo>,
}

#[derive(Debug, Deserialize)]
struct ProcessingInfo {
    state: String,
    #[serde(default)]
    error: Option<ProcessingError>,
}

#[derive(Debug, Deserialize)]
struct ProcessingError {
    message: Option<String>,
}

impl TwitterAdapter {
    pub fn new(app: OAuthAppConfig, client: Client) -> Self {
        Self {
            client,
            app,
            auth_base: "https://twitter.com".to_string(),
            api_base: "https://api.twitter.com".to_string(),
            upload_base: "https://upload.twitter.com".to_string(),
            poll: PollPolicy::default(),
        }
    }

    /// Point every endpoint at `base` (tests use a local mock server)
    pub fn with_base_url(mut self, base: &str) -> Self {
        let base = base.trim_end_matches('/').to_string();
        self.auth_base = base.clone();
        self.api_base = base.clone();
        self.upload_base = base;
        self
    }

    pub fn with_poll_policy(mut self, policy: PollPolicy) -> Self {
        self.poll = policy;
        self
    }

    fn upload_url(&self) -> String {
        format!("{}/1.1/media/upload.json", self.upload_base)
    }

    async fn token_request(&self, operation: &str, form: &[(&str, &str)]) -> Result<AccessTokenData> {
        let mut request = self
            .client
            .post(format!("{}/2/oauth2/token", self.api_base))
            .form(form);
        if let Some(secret) = &self.app.client_secret {
            request = request.basic_auth(&self.app.client_id, Some(secret));
        }

        let response: TokenResponse = http::send_json(PLATFORM, operation, request)
            .await
            .map_err(into_auth_error)?;
        Ok(response.into())
    }

    async fn simple_upload(&self, data: &[u8], token: &str) -> Result<MediaResponse> {
        let form = Form::new().part("media", Part::bytes(data.to_vec()));
        let request = self
            .client
            .post(self.upload_url())
            .bearer_auth(token)
            .multipart(form);
        http::send_json(PLATFORM, "upload_media", request).await
    }

    async fn chunked_upload(&self, data: &[u8], mime_type: &str, token: &str) -> Result<MediaResponse> {
        let category = if mime_type.eq_ignore_ascii_case("image/gif") {
            "tweet_gif"
        } else {
            "tweet_video"
        };

        let total_bytes = data.len().to_string();
        let init: MediaResponse = http::send_json(
            PLATFORM,
            "upload_media_init",
            self.client.post(self.upload_url()).bearer_auth(token).form(&[
                ("command", "INIT"),
                ("total_bytes", total_bytes.as_str()),
                ("media_type", mime_type),
                ("media_category", category),
            ]),
        )
        .await?;
        let media_id = init.media_id_string;

        for (index, chunk) in data.chunks(CHUNK_SIZE).enumerate() {
            let form = Form::new()
                .text("command", "APPEND")
                .text("media_id", media_id.clone())
                .text("segment_index", index.to_string())
                .part("media", Part::bytes(chunk.to_vec()));
            http::send(
                PLATFORM,
                "upload_media_append",
                self.client
                    .post(self.upload_url())
                    .bearer_auth(token)
                    .multipart(form),
            )
            .await?;
            debug!(media_id = %media_id, segment = index, "Appended media segment");
        }

        http::send_json(
            PLATFORM,
            "upload_media_finalize",
            self.client
                .post(self.upload_url())
                .bearer_auth(token)
                .form(&[("command", "FINALIZE"), ("media_id", media_id.as_str())]),
        )
        .await
    }

    async fn wait_for_processing(&self, media_id: &str, token: &str) -> Result<()> {
        poll_until(PLATFORM, "media_processing", self.poll, || async move {
            let status: MediaResponse = http::send_json(
                PLATFORM,
                "media_status",
                self.client
                    .get(self.upload_url())
                    .bearer_auth(token)
                    .query(&[("command", "STATUS"), ("media_id", media_id)]),
            )
            .await?;

            Ok(match status.processing_info {
                None => PollState::Done(()),
                Some(info) => match info.state.as_str() {
                    "succeeded" => PollState::Done(()),
                    "failed" => PollState::Failed(
                        info.error
                            .and_then(|e| e.message)
                            .unwrap_or_else(|| "media processing failed".to_string()),
                    ),
                    other => PollState::Pending(other.to_string()),
                },
            })
        })
        .await
    }

    async fn set_alt_text(&self, media_id: &str, alt_text: &str, token: &str) -> Result<()> {
        http::send(
            PLATFORM,
            "media_metadata",
            self.client
                .post(format!("{}/1.1/media/metadata/create.json", self.upload_base))
                .bearer_auth(token)
                .json(&json!({ "media_id": media_id, "alt_text": { "text": alt_text } })),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl PlatformAdapter for TwitterAdapter {
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
        let pkce = Pkce::generate();
        let scope = oauth::scopes_or(self.app.scopes.as_ref(), &DEFAULT_SCOPES, " ");

        let url = oauth::authorize_url(
            PLATFORM,
            &format!("{}/i/oauth2/authorize", self.auth_base),
            &[
                ("response_type", "code"),
                ("client_id", self.app.client_id.as_str()),
                ("redirect_uri", self.app.redirect_uri.as_str()),
                ("scope", scope.as_str()),
                ("state", state.as_str()),
                ("code_challenge", pkce.challenge.as_str()),
                ("code_challenge_method", "S256"),
            ],
        )?;

        Ok(AuthorizationRequest {
            url,
            state,
            code_verifier: Some(pkce.verifier),
        })
    }

    async fn authorize(&self, code: &str, verifier: Option<&str>) -> Result<AccessTokenData> {
        let verifier = verifier.ok_or_else(|| oauth::missing_verifier(PLATFORM))?;
        self.token_request(
            "authorize",
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.app.redirect_uri.as_str()),
                ("code_verifier", verifier),
                ("client_id", self.app.client_id.as_str()),
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
                ("client_id", self.app.client_id.as_str()),
            ],
        )
        .await
    }

    async fn get_user(&self, access_token: &str) -> Result<PlatformUser> {
        let envelope: DataEnvelope<TwitterUser> = http::send_json(
            PLATFORM,
            "get_user",
            self.client
                .get(format!("{}/2/users/me", self.api_base))
                .bearer_auth(access_token)
                .query(&[("user.fields", "profile_image_url,verified")]),
        )
        .await?;

        let user = envelope.data.ok_or_else(|| {
            crate::error::PlatformError::api("Twitter returned no user data")
                .with_context("platform", PLATFORM.as_str())
                .with_context("operation", "get_user")
        })?;

        Ok(PlatformUser {
            id: user.id,
            username: user.username,
            display_name: user.name,
            profile_image: user.profile_image_url,
            is_verified: user.verified,
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
        let chunked = media_type == MediaType::Video || mime_type.eq_ignore_ascii_case("image/gif");

        let uploaded = if chunked {
            self.chunked_upload(data, mime_type, access_token).await?
        } else {
            self.simple_upload(data, access_token).await?
        };
        let media_id = uploaded.media_id_string;

        if uploaded.processing_info.is_some() {
            self.wait_for_processing(&media_id, access_token).await?;
        }

        if let Some(alt_text) = metadata.and_then(|m| m.alt_text.as_deref()) {
            self.set_alt_text(&media_id, alt_text, access_token).await?;
        }

        debug!(media_id = %media_id, chunked, "Twitter media uploaded");
        Ok(MediaUploadResult {
            media_id,
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

        let mut body = json!({ "text": content });
        if !media_ids.is_empty() {
            body["media"] = json!({ "media_ids": media_ids });
        }
        if let Some(reply_to) = &options.reply_to {
            body["reply"] = json!({ "in_reply_to_tweet_id": reply_to });
        }

        let envelope: DataEnvelope<Tweet> = http::send_json(
            PLATFORM,
            "create_post",
            self.client
                .post(format!("{}/2/tweets", self.api_base))
                .bearer_auth(access_token)
                .json(&body),
        )
        .await?;

        let tweet = envelope.data.ok_or_else(|| {
            crate::error::PlatformError::api("Twitter did not return the created tweet")
                .with_context("platform", PLATFORM.as_str())
                .with_context("operation", "create_post")
        })?;

        let url = format!("https://twitter.com/i/web/status/{}", tweet.id);
        Ok(PostResult::new(PLATFORM, tweet.id, Some(url)))
    }

    async fn delete_post(&self, post_id: &str, access_token: &str) -> Result<()> {
        http::send(
            PLATFORM,
            "delete_post",
            self.client
                .delete(format!("{}/2/tweets/{}", self.api_base, http::encode_segment(post_id)))
                .bearer_auth(access_token),
        )
        .await?;
        Ok(())
    }

    async fn get_post_status(
        &self,
        post_id: &str,
        access_token: &str,
    ) -> Result<RemotePostStatus> {
        let response = http::send_raw(
            PLATFORM,
            "get_post_status",
            self.client
                .get(format!("{}/2/tweets/{}", self.api_base, http::encode_segment(post_id)))
                .bearer_auth(access_token)
                .query(&[("tweet.fields", "public_metrics")]),
        )
        .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(RemotePostStatus::Failed {
                reason: "Tweet not found".to_string(),
            });
        }

        let response = http::ensure_success(PLATFORM, "get_post_status", response).await?;
        let envelope: DataEnvelope<Tweet> =
            http::read_json(PLATFORM, "get_post_status", response).await?;

        Ok(match envelope.data {
            Some(tweet) => RemotePostStatus::Published {
                metrics: tweet.public_metrics,
            },
            None => RemotePostStatus::Failed {
                reason: envelope
                    .errors
                    .first()
                    .and_then(|e| e.get("detail").and_then(Value::as_str))
                    .unwrap_or("Tweet not found")
                    .to_string(),
            },
        })
    }
}
