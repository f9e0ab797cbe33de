//! Threads platform implementation
//!
//! Same container model as Instagram on `graph.threads.net`: a container
//! is created (TEXT, IMAGE, VIDEO or CAROUSEL), media containers are polled
//! until `FINISHED`, and `threads_publish` makes it visible. Replies use
//! `reply_to_id`, which is what thread chains build on.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::config::OAuthAppConfig;
use crate::error::{PlatformError, Result};
use crate::platforms::http::{self, into_auth_error};
use crate::platforms::oauth::{self, TokenResponse};
use crate::platforms::poll::{poll_until, PollPolicy, PollState};
use crate::platforms::{is_url, limits, media_type_from_url, require_media_type, PlatformAdapter};
use crate::types::{
    AccessTokenData, AuthorizationRequest, MediaMetadata, MediaType, MediaUploadResult, Platform,
    PlatformUser, PostOptions, PostResult, RemotePostStatus,
};

const PLATFORM: Platform = Platform::Threads;
const API_VERSION: &str = "v1.0";
const DEFAULT_SCOPES: [&str; 2] = ["threads_basic", "threads_content_publish"];

pub struct ThreadsAdapter {
    client: Client,
    app: OAuthAppConfig,
    auth_base: String,
    graph_base: String,
    poll: PollPolicy,
}

#[derive(Debug, Deserialize)]
struct ThreadsUser {
    id: String,
    username: Option<String>,
    name: Option<String>,
    threads_profile_picture_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ContainerStatus {
    status: Option<String>,
    error_message: Option<String>,
}

impl ThreadsAdapter {
    pub fn new(app: OAuthAppConfig, client: Client) -> Self {
        Self {
            client,
            app,
            auth_base: "https://threads.net".to_string(),
            graph_base: "https://graph.threads.net".to_string(),
            poll: PollPolicy::default(),
        }
    }

    pub fn with_base_url(mut self, base: &str) -> Self {
        let base = base.trim_end_matches('/').to_string();
        self.auth_base = base.clone();
        self.graph_base = base;
        self
    }

    pub fn with_poll_policy(mut self, policy: PollPolicy) -> Self {
        self.poll = policy;
        self
    }

    fn graph(&self, path: &str) -> String {
        format!("{}/{}/{}", self.graph_base, API_VERSION, path)
    }

    fn long_lived(response: TokenResponse) -> AccessTokenData {
        let mut token: AccessTokenData = response.into();
        token.refresh_token = Some(token.access_token.clone());
        token
    }

    async fn create_container(&self, params: &[(&str, &str)], token: &str) -> Result<String> {
        let mut form = params.to_vec();
        form.push(("access_token", token));

        let container: IdResponse = http::send_json(
            PLATFORM,
            "create_container",
            self.client.post(self.graph("me/threads")).form(&form),
        )
        .await?;
        Ok(container.id)
    }

    /// Single media container from a public URL
    async fn media_container(
        &self,
        url: &str,
        media_type: MediaType,
        text: Option<&str>,
        carousel_item: bool,
        reply_to: Option<&str>,
        token: &str,
    ) -> Result<String> {
        let mut params = match media_type {
            MediaType::Image => vec![("media_type", "IMAGE"), ("image_url", url)],
            MediaType::Video => vec![("media_type", "VIDEO"), ("video_url", url)],
        };
        if carousel_item {
            params.push(("is_carousel_item", "true"));
        }
        if let Some(text) = text {
            params.push(("text", text));
        }
        if let Some(reply_to) = reply_to {
            params.push(("reply_to_id", reply_to));
        }

        let id = self.create_container(&params, token).await?;
        self.wait_for_container(&id, token).await?;
        Ok(id)
    }

    async fn wait_for_container(&self, container_id: &str, token: &str) -> Result<()> {
        let url = self.graph(container_id);
        poll_until(PLATFORM, "container_status", self.poll, || {
            let request = self
                .client
                .get(&url)
                .query(&[("fields", "status,error_message"), ("access_token", token)]);
            async move {
                let status: ContainerStatus =
                    http::send_json(PLATFORM, "container_status", request).await?;
                let state = status.status.unwrap_or_default();
                Ok(match state.as_str() {
                    "FINISHED" | "PUBLISHED" => PollState::Done(()),
                    "ERROR" | "EXPIRED" => {
                        PollState::Failed(status.error_message.unwrap_or(state.clone()))
                    }
                    _ => PollState::Pending(state.clone()),
                })
            }
        })
        .await
    }
}

#[async_trait]
impl PlatformAdapter for ThreadsAdapter {
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
            &format!("{}/oauth/authorize", self.auth_base),
            &[
                ("client_id", self.app.client_id.as_str()),
                ("redirect_uri", self.app.redirect_uri.as_str()),
                ("scope", scope.as_str()),
                ("response_type", "code"),
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
        let secret = self.app.require_secret(PLATFORM)?;
        let short_lived: TokenResponse = http::send_json(
            PLATFORM,
            "authorize",
            self.client
                .post(format!("{}/oauth/access_token", self.graph_base))
                .form(&[
                    ("client_id", self.app.client_id.as_str()),
                    ("client_secret", secret),
                    ("grant_type", "authorization_code"),
                    ("redirect_uri", self.app.redirect_uri.as_str()),
                    ("code", code),
                ]),
        )
        .await
        .map_err(into_auth_error)?;

        let long_lived: TokenResponse = http::send_json(
            PLATFORM,
            "authorize",
            self.client
                .get(format!("{}/access_token", self.graph_base))
                .query(&[
                    ("grant_type", "th_exchange_token"),
                    ("client_secret", secret),
                    ("access_token", short_lived.access_token.as_str()),
                ]),
        )
        .await
        .map_err(into_auth_error)?;

        Ok(Self::long_lived(long_lived))
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<AccessTokenData> {
        let refreshed: TokenResponse = http::send_json(
            PLATFORM,
            "refresh_token",
            self.client
                .get(format!("{}/refresh_access_token", self.graph_base))
                .query(&[
                    ("grant_type", "th_refresh_token"),
                    ("access_token", refresh_token),
                ]),
        )
        .await
        .map_err(into_auth_error)?;

        Ok(Self::long_lived(refreshed))
    }

    async fn get_user(&self, access_token: &str) -> Result<PlatformUser> {
        let user: ThreadsUser = http::send_json(
            PLATFORM,
            "get_user",
            self.client.get(self.graph("me")).query(&[
                ("fields", "id,username,name,threads_profile_picture_url"),
                ("access_token", access_token),
            ]),
        )
        .await?;

        Ok(PlatformUser {
            username: user.username.unwrap_or_else(|| user.id.clone()),
            id: user.id,
            display_name: user.name,
            profile_image: user.threads_profile_picture_url,
            is_verified: None,
        })
    }

    async fn upload_media(
        &self,
        _data: &[u8],
        mime_type: &str,
        access_token: &str,
        metadata: Option<&MediaMetadata>,
    ) -> Result<MediaUploadResult> {
        let media_type = require_media_type(PLATFORM, mime_type)?;
        let source_url = metadata
            .and_then(|m| m.source_url.as_deref())
            .ok_or_else(|| {
                PlatformError::validation("Threads uploads need a publicly reachable source URL")
                    .with_context("platform", PLATFORM.as_str())
                    .with_context("operation", "upload_media")
            })?;

        let container_id = self
            .media_container(source_url, media_type, None, true, None, access_token)
            .await?;

        Ok(MediaUploadResult {
            media_id: container_id,
            media_type,
            url: Some(source_url.to_string()),
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

        let text = (!content.is_empty()).then_some(content);
        let reply_to = options.reply_to.as_deref();

        let container_id = match media_ids {
            [] => {
                let mut params = vec![("media_type", "TEXT"), ("text", content)];
                if let Some(reply_to) = reply_to {
                    params.push(("reply_to_id", reply_to));
                }
                self.create_container(&params, access_token).await?
            }
            [single] if is_url(single) => {
                self.media_container(
                    single,
                    media_type_from_url(single),
                    text,
                    false,
                    reply_to,
                    access_token,
                )
                .await?
            }
            [_] => {
                return Err(PlatformError::validation(
                    "A single Threads post needs a media URL; uploaded containers are carousel items",
                )
                .with_context("platform", PLATFORM.as_str())
                .into());
            }
            many => {
                let mut children = Vec::with_capacity(many.len());
                for media in many {
                    if is_url(media) {
                        children.push(
                            self.media_container(
                                media,
                                media_type_from_url(media),
                                None,
                                true,
                                None,
                                access_token,
                            )
                            .await?,
                        );
                    } else {
                        children.push(media.clone());
                    }
                }

                let children = children.join(",");
                let mut params = vec![("media_type", "CAROUSEL"), ("children", children.as_str())];
                if let Some(text) = text {
                    params.push(("text", text));
                }
                if let Some(reply_to) = reply_to {
                    params.push(("reply_to_id", reply_to));
                }
                let id = self.create_container(&params, access_token).await?;
                self.wait_for_container(&id, access_token).await?;
                id
            }
        };

        let published: IdResponse = http::send_json(
            PLATFORM,
            "publish",
            self.client.post(self.graph("me/threads_publish")).form(&[
                ("creation_id", container_id.as_str()),
                ("access_token", access_token),
            ]),
        )
        .await?;

        debug!(thread_id = %published.id, reply = reply_to.is_some(), "Threads post published");
        Ok(PostResult::new(PLATFORM, published.id, None))
    }

    async fn delete_post(&self, post_id: &str, access_token: &str) -> Result<()> {
        http::send(
            PLATFORM,
            "delete_post",
            self.client
                .delete(self.graph(post_id))
                .query(&[("access_token", access_token)]),
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
            self.client.get(self.graph(post_id)).query(&[
                ("fields", "id,permalink,timestamp"),
                ("access_token", access_token),
            ]),
        )
        .await?;

        if matches!(response.status(), StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST) {
            return Ok(RemotePostStatus::Failed {
                reason: "Thread not found".to_string(),
            });
        }
        let response = http::ensure_success(PLATFORM, "get_post_status", response).await?;
        let post: Value = http::read_json(PLATFORM, "get_post_status", response).await?;

        Ok(if post.get("permalink").is_some() {
            RemotePostStatus::Published { metrics: None }
        } else {
            RemotePostStatus::Pending
        })
    }
}
