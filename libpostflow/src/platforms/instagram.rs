//! Instagram platform implementation
//!
//! Publishing goes through the Graph API content-publishing flow: create a
//! media container from a public URL, wait until its `status_code` is
//! `FINISHED`, then publish it. Carousels are built from item containers.
//! Short-lived login tokens are exchanged for long-lived ones, and the
//! long-lived token doubles as the refresh token.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::OAuthAppConfig;
use crate::error::{PlatformError, Result};
use crate::platforms::http::{self, into_auth_error};
use crate::platforms::oauth::{self, TokenResponse};
use crate::platforms::poll::{poll_until, PollPolicy, PollState};
use crate::platforms::{
    is_url, limits, media_type_from_url, require_media_type, unsupported, PlatformAdapter,
};
use crate::types::{
    AccessTokenData, AuthorizationRequest, MediaMetadata, MediaType, MediaUploadResult, Platform,
    PlatformUser, PostOptions, PostResult, RemotePostStatus,
};

const PLATFORM: Platform = Platform::Instagram;
const GRAPH_VERSION: &str = "v19.0";
const DEFAULT_SCOPES: [&str; 4] = [
    "instagram_basic",
    "instagram_content_publish",
    "pages_show_list",
    "pages_read_engagement",
];

pub struct InstagramAdapter {
    client: Client,
    app: OAuthAppConfig,
    auth_base: String,
    graph_base: String,
    poll: PollPolicy,
}

#[derive(Debug, Deserialize)]
struct Accounts {
    #[serde(default)]
    data: Vec<PageAccount>,
}

#[derive(Debug, Deserialize)]
struct PageAccount {
    instagram_business_account: Option<BusinessAccount>,
}

#[derive(Debug, Deserialize)]
struct BusinessAccount {
    id: String,
    username: Option<String>,
    name: Option<String>,
    profile_picture_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ContainerStatus {
    status_code: Option<String>,
    status: Option<String>,
}

/// What a single container is built from
enum ContainerSource<'a> {
    Media {
        url: &'a str,
        media_type: MediaType,
        carousel_item: bool,
    },
    Carousel {
        children: &'a [String],
    },
}

impl InstagramAdapter {
    pub fn new(app: OAuthAppConfig, client: Client) -> Self {
        Self {
            client,
            app,
            auth_base: "https://www.facebook.com".to_string(),
            graph_base: "https://graph.facebook.com".to_string(),
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
        format!("{}/{}/{}", self.graph_base, GRAPH_VERSION, path)
    }

    async fn exchange_long_lived(&self, operation: &str, token: &str) -> Result<AccessTokenData> {
        let secret = self.app.require_secret(PLATFORM)?;
        let response: TokenResponse = http::send_json(
            PLATFORM,
            operation,
            self.client.get(self.graph("oauth/access_token")).query(&[
                ("grant_type", "fb_exchange_token"),
                ("client_id", self.app.client_id.as_str()),
                ("client_secret", secret),
                ("fb_exchange_token", token),
            ]),
        )
        .await
        .map_err(into_auth_error)?;

        let mut long_lived: AccessTokenData = response.into();
        // The long-lived token is re-exchanged to extend it
        long_lived.refresh_token = Some(long_lived.access_token.clone());
        Ok(long_lived)
    }

    async fn business_account(&self, token: &str) -> Result<BusinessAccount> {
        let accounts: Accounts = http::send_json(
            PLATFORM,
            "get_user",
            self.client.get(self.graph("me/accounts")).query(&[
                (
                    "fields",
                    "instagram_business_account{id,username,name,profile_picture_url}",
                ),
                ("access_token", token),
            ]),
        )
        .await?;

        accounts
            .data
            .into_iter()
            .find_map(|page| page.instagram_business_account)
            .ok_or_else(|| {
                PlatformError::auth("No Instagram business account is linked to this login")
                    .with_context("platform", PLATFORM.as_str())
                    .with_context("operation", "get_user")
                    .into()
            })
    }

    async fn create_container(
        &self,
        account_id: &str,
        source: ContainerSource<'_>,
        caption: Option<&str>,
        options: &PostOptions,
        token: &str,
    ) -> Result<String> {
        let mut body = json!({ "access_token": token });
        match source {
            ContainerSource::Media {
                url,
                media_type,
                carousel_item,
            } => {
                match media_type {
                    MediaType::Image => body["image_url"] = json!(url),
                    MediaType::Video => {
                        body["video_url"] = json!(url);
                        body["media_type"] = json!(if carousel_item { "VIDEO" } else { "REELS" });
                        if let Some(share) = options.share_to_feed.filter(|_| !carousel_item) {
                            body["share_to_feed"] = json!(share);
                        }
                    }
                }
                if carousel_item {
                    body["is_carousel_item"] = json!(true);
                }
            }
            ContainerSource::Carousel { children } => {
                body["media_type"] = json!("CAROUSEL");
                body["children"] = json!(children.join(","));
            }
        }
        if let Some(caption) = caption {
            body["caption"] = json!(caption);
        }

        let container: IdResponse = http::send_json(
            PLATFORM,
            "create_container",
            self.client
                .post(self.graph(&format!("{}/media", account_id)))
                .json(&body),
        )
        .await?;
        Ok(container.id)
    }

    async fn wait_for_container(&self, container_id: &str, token: &str) -> Result<()> {
        let url = self.graph(container_id);
        poll_until(PLATFORM, "container_status", self.poll, || {
            let request = self
                .client
                .get(&url)
                .query(&[("fields", "status_code,status"), ("access_token", token)]);
            async move {
                let status: ContainerStatus =
                    http::send_json(PLATFORM, "container_status", request).await?;
                let code = status.status_code.unwrap_or_default();
                Ok(match code.as_str() {
                    "FINISHED" | "PUBLISHED" => PollState::Done(()),
                    "ERROR" | "EXPIRED" => PollState::Failed(status.status.unwrap_or(code.clone())),
                    _ => PollState::Pending(code.clone()),
                })
            }
        })
        .await
    }

    async fn publish(&self, account_id: &str, container_id: &str, token: &str) -> Result<String> {
        let published: IdResponse = http::send_json(
            PLATFORM,
            "publish",
            self.client
                .post(self.graph(&format!("{}/media_publish", account_id)))
                .json(&json!({ "creation_id": container_id, "access_token": token })),
        )
        .await?;
        Ok(published.id)
    }
}

#[async_trait]
impl PlatformAdapter for InstagramAdapter {
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
            &format!("{}/{}/dialog/oauth", self.auth_base, GRAPH_VERSION),
            &[
                ("client_id", self.app.client_id.as_str()),
                ("redirect_uri", self.app.redirect_uri.as_str()),
                ("state", state.as_str()),
                ("scope", scope.as_str()),
                ("response_type", "code"),
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
            self.client.get(self.graph("oauth/access_token")).query(&[
                ("client_id", self.app.client_id.as_str()),
                ("client_secret", secret),
                ("redirect_uri", self.app.redirect_uri.as_str()),
                ("code", code),
            ]),
        )
        .await
        .map_err(into_auth_error)?;

        self.exchange_long_lived("authorize", &short_lived.access_token)
            .await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<AccessTokenData> {
        self.exchange_long_lived("refresh_token", refresh_token)
            .await
    }

    async fn get_user(&self, access_token: &str) -> Result<PlatformUser> {
        let account = self.business_account(access_token).await?;
        Ok(PlatformUser {
            username: account.username.unwrap_or_else(|| account.id.clone()),
            id: account.id,
            display_name: account.name,
            profile_image: account.profile_picture_url,
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
                PlatformError::validation("Instagram uploads need a publicly reachable source URL")
                    .with_context("platform", PLATFORM.as_str())
                    .with_context("operation", "upload_media")
            })?;

        let account = self.business_account(access_token).await?;
        let container_id = self
            .create_container(
                &account.id,
                ContainerSource::Media {
                    url: source_url,
                    media_type,
                    carousel_item: true,
                },
                None,
                &PostOptions::default(),
                access_token,
            )
            .await?;
        self.wait_for_container(&container_id, access_token).await?;

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

        let caption = (!content.is_empty()).then_some(content);
        let account = self.business_account(access_token).await?;

        let container_id = match media_ids {
            [single] if is_url(single) => {
                self.create_container(
                    &account.id,
                    ContainerSource::Media {
                        url: single,
                        media_type: media_type_from_url(single),
                        carousel_item: false,
                    },
                    caption,
                    options,
                    access_token,
                )
                .await?
            }
            [_] => {
                return Err(PlatformError::validation(
                    "A single Instagram post needs a media URL; uploaded containers are carousel items",
                )
                .with_context("platform", PLATFORM.as_str())
                .into());
            }
            many => {
                let mut children = Vec::with_capacity(many.len());
                for media in many {
                    if is_url(media) {
                        let child = self
                            .create_container(
                                &account.id,
                                ContainerSource::Media {
                                    url: media,
                                    media_type: media_type_from_url(media),
                                    carousel_item: true,
                                },
                                None,
                                options,
                                access_token,
                            )
                            .await?;
                        self.wait_for_container(&child, access_token).await?;
                        children.push(child);
                    } else {
                        children.push(media.clone());
                    }
                }
                self.create_container(
                    &account.id,
                    ContainerSource::Carousel {
                        children: &children,
                    },
                    caption,
                    options,
                    access_token,
                )
                .await?
            }
        };

        self.wait_for_container(&container_id, access_token).await?;
        let media_id = self
            .publish(&account.id, &container_id, access_token)
            .await?;

        debug!(media_id = %media_id, container_id = %container_id, "Instagram media published");
        Ok(PostResult::new(PLATFORM, media_id, None))
    }

    async fn delete_post(&self, _post_id: &str, _access_token: &str) -> Result<()> {
        Err(unsupported(PLATFORM, "delete_post"))
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
                ("fields", "id,like_count,comments_count,permalink"),
                ("access_token", access_token),
            ]),
        )
        .await?;

        if matches!(response.status(), StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST) {
            return Ok(RemotePostStatus::Failed {
                reason: "Media not found".to_string(),
            });
        }
        let response = http::ensure_success(PLATFORM, "get_post_status", response).await?;
        let media: Value = http::read_json(PLATFORM, "get_post_status", response).await?;

        Ok(RemotePostStatus::Published {
            metrics: Some(json!({
                "likes": media.get("like_count").cloned().unwrap_or(Value::Null),
                "comments": media.get("comments_count").cloned().unwrap_or(Value::Null),
            })),
        })
    }
}
