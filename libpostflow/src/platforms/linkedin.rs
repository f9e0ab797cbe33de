//! LinkedIn platform implementation
//!
//! Uses the versioned REST API (`/rest/posts`, `/rest/images`,
//! `/rest/videos`). Uploads initialize a session, PUT the bytes to the
//! returned URL and poll the asset until LinkedIn reports it `AVAILABLE`.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::OAuthAppConfig;
use crate::error::{PlatformError, Result};
use crate::platforms::http::{self, encode_segment, into_auth_error};
use crate::platforms::oauth::{self, TokenResponse};
use crate::platforms::poll::{poll_until, PollPolicy, PollState};
use crate::platforms::{is_url, limits, require_media_type, PlatformAdapter};
use crate::types::{
    AccessTokenData, AuthorizationRequest, MediaMetadata, MediaType, MediaUploadResult, Platform,
    PlatformUser, PostOptions, PostResult, RemotePostStatus,
};

const PLATFORM: Platform = Platform::LinkedIn;
const API_VERSION: &str = "202401";
const DEFAULT_SCOPES: [&str; 4] = ["openid", "profile", "email", "w_member_social"];

pub struct LinkedInAdapter {
    client: Client,
    app: OAuthAppConfig,
    auth_base: String,
    api_base: String,
    poll: PollPolicy,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    sub: String,
    name: Option<String>,
    email: Option<String>,
    picture: Option<String>,
    #[serde(default)]
    email_verified: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    value: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageUpload {
    upload_url: String,
    image: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoUpload {
    video: String,
    #[serde(default)]
    upload_token: String,
    upload_instructions: Vec<UploadInstruction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadInstruction {
    upload_url: String,
    first_byte: usize,
    last_byte: usize,
}

#[derive(Debug, Deserialize)]
struct AssetStatus {
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestPost {
    lifecycle_state: Option<String>,
}

impl LinkedInAdapter {
    pub fn new(app: OAuthAppConfig, client: Client) -> Self {
        Self {
            client,
            app,
            auth_base: "https://www.linkedin.com".to_string(),
            api_base: "https://api.linkedin.com".to_string(),
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

    /// Authenticated request against the versioned REST API
    fn rest(&self, request: RequestBuilder, token: &str) -> RequestBuilder {
        request
            .bearer_auth(token)
            .header("LinkedIn-Version", API_VERSION)
            .header("X-Restli-Protocol-Version", "2.0.0")
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
                .post(format!("{}/oauth/v2/accessToken", self.auth_base))
                .form(&params),
        )
        .await
        .map_err(into_auth_error)?;
        Ok(response.into())
    }

    async fn author_urn(&self, token: &str) -> Result<String> {
        let user = self.get_user(token).await?;
        Ok(format!("urn:li:person:{}", user.id))
    }

    async fn upload_image(&self, data: &[u8], owner: &str, token: &str) -> Result<String> {
        let init: Envelope<ImageUpload> = http::send_json(
            PLATFORM,
            "upload_media_init",
            self.rest(
                self.client
                    .post(format!("{}/rest/images", self.api_base))
                    .query(&[("action", "initializeUpload")]),
                token,
            )
            .json(&json!({ "initializeUploadRequest": { "owner": owner } })),
        )
        .await?;

        http::send(
            PLATFORM,
            "upload_media_put",
            self.client
                .put(&init.value.upload_url)
                .bearer_auth(token)
                .body(data.to_vec()),
        )
        .await?;

        Ok(init.value.image)
    }

    async fn upload_video(&self, data: &[u8], owner: &str, token: &str) -> Result<String> {
        let init: Envelope<VideoUpload> = http::send_json(
            PLATFORM,
            "upload_media_init",
            self.rest(
                self.client
                    .post(format!("{}/rest/videos", self.api_base))
                    .query(&[("action", "initializeUpload")]),
                token,
            )
            .json(&json!({
                "initializeUploadRequest": {
                    "owner": owner,
                    "fileSizeBytes": data.len(),
                    "uploadCaptions": false,
                    "uploadThumbnail": false
                }
            })),
        )
        .await?;
        let upload = init.value;

        let mut part_ids = Vec::with_capacity(upload.upload_instructions.len());
        for instruction in &upload.upload_instructions {
            let end = (instruction.last_byte + 1).min(data.len());
            let chunk = data.get(instruction.first_byte..end).ok_or_else(|| {
                PlatformError::platform("LinkedIn upload instruction is outside the file")
                    .with_context("platform", PLATFORM.as_str())
                    .with_context("operation", "upload_media_put")
            })?;

            let response = http::send(
                PLATFORM,
                "upload_media_put",
                self.client
                    .put(&instruction.upload_url)
                    .bearer_auth(token)
                    .body(chunk.to_vec()),
            )
            .await?;

            let etag = response
                .headers()
                .get(reqwest::header::ETAG)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim_matches('"').to_string())
                .unwrap_or_default();
            part_ids.push(etag);
        }

        http::send(
            PLATFORM,
            "upload_media_finalize",
            self.rest(
                self.client
                    .post(format!("{}/rest/videos", self.api_base))
                    .query(&[("action", "finalizeUpload")]),
                token,
            )
            .json(&json!({
                "finalizeUploadRequest": {
                    "video": upload.video,
                    "uploadToken": upload.upload_token,
                    "uploadedPartIds": part_ids
                }
            })),
        )
        .await?;

        Ok(upload.video)
    }

    async fn wait_until_available(&self, urn: &str, media_type: MediaType, token: &str) -> Result<()> {
        let collection = match media_type {
            MediaType::Image => "images",
            MediaType::Video => "videos",
        };
        let url = format!("{}/rest/{}/{}", self.api_base, collection, encode_segment(urn));

        poll_until(PLATFORM, "media_processing", self.poll, || {
            let request = self.rest(self.client.get(&url), token);
            async move {
                let asset: AssetStatus = http::send_json(PLATFORM, "media_status", request).await?;
                Ok(match asset.status.as_str() {
                    "AVAILABLE" => PollState::Done(()),
                    "PROCESSING_FAILED" => PollState::Failed("PROCESSING_FAILED".to_string()),
                    other => PollState::Pending(other.to_string()),
                })
            }
        })
        .await
    }
}

#[async_trait]
impl PlatformAdapter for LinkedInAdapter {
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
            &format!("{}/oauth/v2/authorization", self.auth_base),
            &[
                ("response_type", "code"),
                ("client_id", self.app.client_id.as_str()),
                ("redirect_uri", self.app.redirect_uri.as_str()),
                ("state", state.as_str()),
                ("scope", scope.as_str()),
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
                ("grant_type", "authorization_code"),
                ("code", code),
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
        let info: UserInfo = http::send_json(
            PLATFORM,
            "get_user",
            self.client
                .get(format!("{}/v2/userinfo", self.api_base))
                .bearer_auth(access_token),
        )
        .await?;

        Ok(PlatformUser {
            username: info
                .email
                .clone()
                .or_else(|| info.name.clone())
                .unwrap_or_else(|| info.sub.clone()),
            id: info.sub,
            display_name: info.name,
            profile_image: info.picture,
            is_verified: info.email_verified,
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
        let owner = self.author_urn(access_token).await?;

        let urn = match media_type {
            MediaType::Image => self.upload_image(data, &owner, access_token).await?,
            MediaType::Video => self.upload_video(data, &owner, access_token).await?,
        };
        self.wait_until_available(&urn, media_type, access_token)
            .await?;

        debug!(urn = %urn, "LinkedIn asset available");
        Ok(MediaUploadResult {
            media_id: urn,
            media_type,
            url: None,
        })
    }

    async fn create_post(
        &self,
        content: &str,
        media_ids: &[String],
        access_token: &str,
        _options: &PostOptions,
    ) -> Result<PostResult> {
        self.validate_content(content, media_ids)?;
        if let Some(url) = media_ids.iter().find(|id| is_url(id)) {
            return Err(PlatformError::validation(format!(
                "LinkedIn posts need uploaded assets, not URLs ({})",
                url
            ))
            .with_context("platform", PLATFORM.as_str())
            .into());
        }

        let author = self.author_urn(access_token).await?;
        let mut body = json!({
            "author": author,
            "commentary": content,
            "visibility": "PUBLIC",
            "distribution": {
                "feedDistribution": "MAIN_FEED",
                "targetEntities": [],
                "thirdPartyDistributionChannels": []
            },
            "lifecycleState": "PUBLISHED",
            "isReshareDisabledByAuthor": false
        });
        match media_ids {
            [] => {}
            [single] => body["content"] = json!({ "media": { "id": single } }),
            many => {
                let images: Vec<Value> = many.iter().map(|id| json!({ "id": id })).collect();
                body["content"] = json!({ "multiImage": { "images": images } });
            }
        }

        let response = http::send(
            PLATFORM,
            "create_post",
            self.rest(
                self.client.post(format!("{}/rest/posts", self.api_base)),
                access_token,
            )
            .json(&body),
        )
        .await?;

        let id = response
            .headers()
            .get("x-restli-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                PlatformError::api("LinkedIn did not return the post id")
                    .with_context("platform", PLATFORM.as_str())
                    .with_context("operation", "create_post")
            })?;

        let url = format!("https://www.linkedin.com/feed/update/{}/", id);
        Ok(PostResult::new(PLATFORM, id, Some(url)))
    }

    async fn delete_post(&self, post_id: &str, access_token: &str) -> Result<()> {
        http::send(
            PLATFORM,
            "delete_post",
            self.rest(
                self.client.delete(format!(
                    "{}/rest/posts/{}",
                    self.api_base,
                    encode_segment(post_id)
                )),
                access_token,
            ),
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
            self.rest(
                self.client.get(format!(
                    "{}/rest/posts/{}",
                    self.api_base,
                    encode_segment(post_id)
                )),
                access_token,
            ),
        )
        .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(RemotePostStatus::Failed {
                reason: "Post not found".to_string(),
            });
        }
        let response = http::ensure_success(PLATFORM, "get_post_status", response).await?;
        let post: RestPost = http::read_json(PLATFORM, "get_post_status", response).await?;

        Ok(match post.lifecycle_state.as_deref() {
            Some("PUBLISHED") => RemotePostStatus::Published { metrics: None },
            Some("PUBLISH_FAILED") => RemotePostStatus::Failed {
                reason: "PUBLISH_FAILED".to_string(),
            },
            _ => RemotePostStatus::Pending,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use std::time::Duration;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn app() -> OAuthAppConfig {
        OAuthAppConfig {
            client_id: "li-client".to_string(),
            client_secret: Some("li-secret".to_string()),
            redirect_uri: "https://app.example/callback/linkedin".to_string(),
            scopes: None,
        }
    }

    fn adapter(server: &MockServer) -> LinkedInAdapter {
        LinkedInAdapter::new(app(), Client::new())
            .with_base_url(&server.uri())
            .with_poll_policy(PollPolicy {
                max_attempts: 10,
                delay: Duration::from_millis(1),
            })
    }

    async fn mount_userinfo(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/v2/userinfo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "sub": "abc123",
                "name": "Ada Lovelace",
                "email": "ada@example.com",
                "email_verified": true
            })))
            .mount(server)
            .await;
    }

    #[test]
    fn test_auth_url() {
        let request = LinkedInAdapter::new(app(), Client::new()).get_auth_url().unwrap();
        assert!(request
            .url
            .starts_with("https://www.linkedin.com/oauth/v2/authorization?"));
        assert!(request.url.contains("w_member_social"));
        assert!(request.code_verifier.is_none());
    }

    #[tokio::test]
    async fn test_refresh_rejected_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/v2/accessToken"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_request",
                "error_description": "The provided refresh token is invalid"
            })))
            .mount(&server)
            .await;

        let err = adapter(&server).refresh_token("stale").await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::AuthError));
        assert!(err.message().contains("refresh token is invalid"));
    }

    #[tokio::test]
    async fn test_create_text_post() {
        let server = MockServer::start().await;
        mount_userinfo(&server).await;
        Mock::given(method("POST"))
            .and(path("/rest/posts"))
            .and(header("LinkedIn-Version", API_VERSION))
            .and(body_string_contains("urn:li:person:abc123"))
            .respond_with(
                ResponseTemplate::new(201).insert_header("x-restli-id", "urn:li:share:6844785523593134080"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let result = adapter(&server)
            .create_post("Hello LinkedIn", &[], "token", &PostOptions::default())
            .await
            .unwrap();
        assert_eq!(result.id, "urn:li:share:6844785523593134080");
    }

    #[tokio::test]
    async fn test_image_upload_polls_until_available() {
        let server = MockServer::start().await;
        mount_userinfo(&server).await;
        Mock::given(method("POST"))
            .and(path("/rest/images"))
            .and(query_param("action", "initializeUpload"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": {
                    "uploadUrl": format!("{}/upload/image-1", server.uri()),
                    "image": "urn:li:image:C4E10AQ"
                }
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/upload/image-1"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/images/urn%3Ali%3Aimage%3AC4E10AQ"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "AVAILABLE" })))
            .expect(1)
            .mount(&server)
            .await;

        let result = adapter(&server)
            .upload_media(b"png", "image/png", "token", None)
            .await
            .unwrap();
        assert_eq!(result.media_id, "urn:li:image:C4E10AQ");
    }

    #[tokio::test]
    async fn test_processing_failed_is_platform_error() {
        let server = MockServer::start().await;
        mount_userinfo(&server).await;
        Mock::given(method("POST"))
            .and(path("/rest/images"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": {
                    "uploadUrl": format!("{}/upload/image-2", server.uri()),
                    "image": "urn:li:image:BAD"
                }
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/upload/image-2"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/images/urn%3Ali%3Aimage%3ABAD"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "status": "PROCESSING_FAILED" })),
            )
            .mount(&server)
            .await;

        let err = adapter(&server)
            .upload_media(b"png", "image/png", "token", None)
            .await
            .unwrap_err();
        let platform_err = err.as_platform().unwrap();
        assert_eq!(platform_err.code, ErrorCode::PlatformError);
        assert!(!platform_err.is_timeout());
    }

    #[tokio::test]
    async fn test_post_status_from_lifecycle_state() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/posts/urn%3Ali%3Ashare%3A1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "lifecycleState": "PUBLISHED" })),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/posts/urn%3Ali%3Ashare%3A2"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let adapter = adapter(&server);
        assert_eq!(
            adapter.get_post_status("urn:li:share:1", "t").await.unwrap(),
            RemotePostStatus::Published { metrics: None }
        );
        assert!(matches!(
            adapter.get_post_status("urn:li:share:2", "t").await.unwrap(),
            RemotePostStatus::Failed { .. }
        ));
    }
}
