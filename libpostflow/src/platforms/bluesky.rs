//! Bluesky platform implementation
//!
//! Bluesky speaks AT Protocol XRPC rather than OAuth 2.0. Accounts connect
//! with a handle and an app password: `authorize` takes the handle as the
//! code and the app password as the verifier, and stores the session JWTs
//! as access and refresh tokens.

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::BlueskyConfig;
use crate::error::{PlatformError, PostflowError, Result};
use crate::platforms::http::{self, into_auth_error};
use crate::platforms::oauth;
use crate::platforms::{is_url, limits, require_media_type, PlatformAdapter};
use crate::types::{
    AccessTokenData, AuthorizationRequest, MediaMetadata, MediaType, MediaUploadResult, Platform,
    PlatformUser, PostOptions, PostResult, RemotePostStatus,
};

const PLATFORM: Platform = Platform::Bluesky;
const POST_COLLECTION: &str = "app.bsky.feed.post";
const APP_PASSWORD_URL: &str = "https://bsky.app/settings/app-passwords";

pub struct BlueskyAdapter {
    client: Client,
    service: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Session {
    access_jwt: String,
    refresh_jwt: String,
}

#[derive(Debug, Deserialize)]
struct SessionInfo {
    did: String,
    handle: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Profile {
    did: String,
    handle: String,
    display_name: Option<String>,
    avatar: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BlobResponse {
    blob: Value,
}

/// Media id of an uploaded image: the blob reference plus its alt text
#[derive(Debug, Serialize, Deserialize)]
struct ImageRef {
    blob: Value,
    #[serde(default)]
    alt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct StrongRef {
    uri: String,
    cid: String,
}

#[derive(Debug, Deserialize)]
struct PostsResponse {
    #[serde(default)]
    posts: Vec<PostView>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostView {
    uri: String,
    cid: String,
    #[serde(default)]
    record: Value,
    like_count: Option<u64>,
    repost_count: Option<u64>,
    reply_count: Option<u64>,
}

/// Parts of an `at://did/collection/rkey` URI
fn parse_at_uri(uri: &str) -> Result<(&str, &str, &str)> {
    let invalid = || -> PostflowError {
        PlatformError::validation(format!("Invalid AT URI '{}'", uri))
            .with_context("platform", PLATFORM.as_str())
            .into()
    };
    let rest = uri.strip_prefix("at://").ok_or_else(invalid)?;
    let mut parts = rest.splitn(3, '/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(repo), Some(collection), Some(rkey))
            if !repo.is_empty() && !collection.is_empty() && !rkey.is_empty() =>
        {
            Ok((repo, collection, rkey))
        }
        _ => Err(invalid()),
    }
}

/// Expiry claim of a session JWT
fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Value = serde_json::from_slice(&bytes).ok()?;
    let exp = claims.get("exp")?.as_i64()?;
    Utc.timestamp_opt(exp, 0).single()
}

fn web_url(uri: &str) -> Option<String> {
    let (repo, _, rkey) = parse_at_uri(uri).ok()?;
    Some(format!("https://bsky.app/profile/{}/post/{}", repo, rkey))
}

impl From<Session> for AccessTokenData {
    fn from(session: Session) -> Self {
        AccessTokenData {
            expires_at: jwt_expiry(&session.access_jwt),
            access_token: session.access_jwt,
            refresh_token: Some(session.refresh_jwt),
            token_type: Some("Bearer".to_string()),
            scope: None,
        }
    }
}

impl BlueskyAdapter {
    pub fn new(config: BlueskyConfig, client: Client) -> Self {
        Self {
            client,
            service: config.service.trim_end_matches('/').to_string(),
        }
    }

    fn xrpc(&self, method: &str) -> String {
        format!("{}/xrpc/{}", self.service, method)
    }

    async fn session(&self, access_token: &str) -> Result<SessionInfo> {
        http::send_json(
            PLATFORM,
            "get_session",
            self.client
                .get(self.xrpc("com.atproto.server.getSession"))
                .bearer_auth(access_token),
        )
        .await
    }

    async fn fetch_post(&self, uri: &str, access_token: &str) -> Result<Option<PostView>> {
        let response: PostsResponse = http::send_json(
            PLATFORM,
            "get_posts",
            self.client
                .get(self.xrpc("app.bsky.feed.getPosts"))
                .bearer_auth(access_token)
                .query(&[("uris", uri)]),
        )
        .await?;
        Ok(response.posts.into_iter().next())
    }

    /// Root and parent references for a reply to `parent_uri`
    async fn reply_refs(&self, parent_uri: &str, access_token: &str) -> Result<Value> {
        let parent = self.fetch_post(parent_uri, access_token).await?.ok_or_else(|| {
            PlatformError::validation(format!("Reply target {} not found", parent_uri))
                .with_context("platform", PLATFORM.as_str())
                .with_context("operation", "create_post")
        })?;

        let parent_ref = StrongRef {
            uri: parent.uri,
            cid: parent.cid,
        };
        let root_ref = parent
            .record
            .pointer("/reply/root")
            .and_then(|root| serde_json::from_value::<StrongRef>(root.clone()).ok())
            .unwrap_or_else(|| parent_ref.clone());

        Ok(json!({ "root": root_ref, "parent": parent_ref }))
    }
}

#[async_trait]
impl PlatformAdapter for BlueskyAdapter {
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
        // App passwords are created by the user in Bluesky settings
        Ok(AuthorizationRequest {
            url: APP_PASSWORD_URL.to_string(),
            state: oauth::generate_state(),
            code_verifier: None,
        })
    }

    async fn authorize(&self, identifier: &str, password: Option<&str>) -> Result<AccessTokenData> {
        let password = password.ok_or_else(|| {
            PostflowError::from(
                PlatformError::validation("Bluesky login needs an app password")
                    .with_context("platform", PLATFORM.as_str())
                    .with_context("operation", "authorize"),
            )
        })?;

        let session: Session = http::send_json(
            PLATFORM,
            "authorize",
            self.client
                .post(self.xrpc("com.atproto.server.createSession"))
                .json(&json!({ "identifier": identifier, "password": password })),
        )
        .await
        .map_err(into_auth_error)?;
        Ok(session.into())
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<AccessTokenData> {
        let session: Session = http::send_json(
            PLATFORM,
            "refresh_token",
            self.client
                .post(self.xrpc("com.atproto.server.refreshSession"))
                .bearer_auth(refresh_token),
        )
        .await
        .map_err(into_auth_error)?;
        Ok(session.into())
    }

    async fn get_user(&self, access_token: &str) -> Result<PlatformUser> {
        let session = self.session(access_token).await?;
        let profile: Profile = http::send_json(
            PLATFORM,
            "get_user",
            self.client
                .get(self.xrpc("app.bsky.actor.getProfile"))
                .bearer_auth(access_token)
                .query(&[("actor", session.did.as_str())]),
        )
        .await?;

        Ok(PlatformUser {
            id: profile.did,
            username: if profile.handle.is_empty() {
                session.handle
            } else {
                profile.handle
            },
            display_name: profile.display_name,
            profile_image: profile.avatar,
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
        if media_type != MediaType::Image {
            return Err(PlatformError::validation("Bluesky only accepts image uploads")
                .with_context("platform", PLATFORM.as_str())
                .with_context("operation", "upload_media")
                .into());
        }

        let uploaded: BlobResponse = http::send_json(
            PLATFORM,
            "upload_media",
            self.client
                .post(self.xrpc("com.atproto.repo.uploadBlob"))
                .bearer_auth(access_token)
                .header(reqwest::header::CONTENT_TYPE, mime_type)
                .body(data.to_vec()),
        )
        .await?;

        let image = ImageRef {
            blob: uploaded.blob,
            alt: metadata
                .and_then(|m| m.alt_text.clone())
                .unwrap_or_default(),
        };
        let media_id = serde_json::to_string(&image).map_err(|e| {
            PlatformError::api(format!("Failed to encode blob reference: {}", e))
                .with_context("platform", PLATFORM.as_str())
        })?;

        debug!(bytes = data.len(), "Bluesky blob uploaded");
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

        let images = media_ids
            .iter()
            .map(|id| {
                if is_url(id) {
                    return Err(PostflowError::from(
                        PlatformError::validation("Bluesky media must be uploaded before posting")
                            .with_context("platform", PLATFORM.as_str())
                            .with_context("operation", "create_post"),
                    ));
                }
                let image: ImageRef = serde_json::from_str(id).map_err(|e| {
                    PlatformError::validation(format!("Invalid Bluesky media reference: {}", e))
                        .with_context("platform", PLATFORM.as_str())
                        .with_context("operation", "create_post")
                })?;
                Ok(json!({ "image": image.blob, "alt": image.alt }))
            })
            .collect::<Result<Vec<_>>>()?;

        let session = self.session(access_token).await?;

        let mut record = json!({
            "$type": POST_COLLECTION,
            "text": content,
            "createdAt": Utc::now().to_rfc3339(),
        });
        if !images.is_empty() {
            record["embed"] = json!({ "$type": "app.bsky.embed.images", "images": images });
        }
        if let Some(parent_uri) = options.reply_to.as_deref() {
            record["reply"] = self.reply_refs(parent_uri, access_token).await?;
        }

        let created: StrongRef = http::send_json(
            PLATFORM,
            "create_post",
            self.client
                .post(self.xrpc("com.atproto.repo.createRecord"))
                .bearer_auth(access_token)
                .json(&json!({
                    "repo": session.did,
                    "collection": POST_COLLECTION,
                    "record": record
                })),
        )
        .await?;

        let url = web_url(&created.uri);
        Ok(PostResult::new(PLATFORM, created.uri, url))
    }

    async fn delete_post(&self, post_id: &str, access_token: &str) -> Result<()> {
        let (repo, collection, rkey) = parse_at_uri(post_id)?;
        http::send(
            PLATFORM,
            "delete_post",
            self.client
                .post(self.xrpc("com.atproto.repo.deleteRecord"))
                .bearer_auth(access_token)
                .json(&json!({ "repo": repo, "collection": collection, "rkey": rkey })),
        )
        .await?;
        Ok(())
    }

    async fn get_post_status(
        &self,
        post_id: &str,
        access_token: &str,
    ) -> Result<RemotePostStatus> {
        Ok(match self.fetch_post(post_id, access_token).await? {
            Some(post) => RemotePostStatus::Published {
                metrics: Some(json!({
                    "likeCount": post.like_count.unwrap_or(0),
                    "repostCount": post.repost_count.unwrap_or(0),
                    "replyCount": post.reply_count.unwrap_or(0),
                })),
            },
            None => RemotePostStatus::Failed {
                reason: "Post not found".to_string(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const DID: &str = "did:plc:abc123";

    fn adapter(server: &MockServer) -> BlueskyAdapter {
        BlueskyAdapter::new(
            BlueskyConfig {
                service: server.uri(),
            },
            Client::new(),
        )
    }

    fn jwt_with_exp(exp: i64) -> String {
        let payload = URL_SAFE_NO_PAD.encode(json!({ "exp": exp }).to_string());
        format!("eyJhbGciOiJIUzI1NiJ9.{}.sig", payload)
    }

    async fn mount_session(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/xrpc/com.atproto.server.getSession"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "did": DID, "handle": "alice.bsky.social" })),
            )
            .mount(server)
            .await;
    }

    #[test]
    fn test_parse_at_uri() {
        let (repo, collection, rkey) =
            parse_at_uri("at://did:plc:abc123/app.bsky.feed.post/3k2yihcrp6f2c").unwrap();
        assert_eq!(repo, DID);
        assert_eq!(collection, POST_COLLECTION);
        assert_eq!(rkey, "3k2yihcrp6f2c");

        assert!(parse_at_uri("https://bsky.app/post/1").is_err());
        assert!(parse_at_uri("at://did:plc:abc123").is_err());
    }

    #[test]
    fn test_jwt_expiry() {
        let expiry = jwt_expiry(&jwt_with_exp(1_900_000_000)).unwrap();
        assert_eq!(expiry.timestamp(), 1_900_000_000);
        assert!(jwt_expiry("not-a-jwt").is_none());
    }

    #[tokio::test]
    async fn test_authorize_with_app_password() {
        let server = MockServer::start().await;
        let access = jwt_with_exp(1_900_000_000);
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.server.createSession"))
            .and(body_string_contains("\"identifier\":\"alice.bsky.social\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "accessJwt": access,
                "refreshJwt": "refresh-jwt",
                "did": DID,
                "handle": "alice.bsky.social"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let token = adapter(&server)
            .authorize("alice.bsky.social", Some("app-pass"))
            .await
            .unwrap();
        assert_eq!(token.refresh_token.as_deref(), Some("refresh-jwt"));
        assert_eq!(token.expires_at.unwrap().timestamp(), 1_900_000_000);
    }

    #[tokio::test]
    async fn test_authorize_rejections() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.server.createSession"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": "AuthenticationRequired",
                "message": "Invalid identifier or password"
            })))
            .mount(&server)
            .await;

        let adapter = adapter(&server);
        let err = adapter.authorize("alice", None).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::ValidationError));

        let err = adapter.authorize("alice", Some("wrong")).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::AuthError));
    }

    #[tokio::test]
    async fn test_reply_uses_parent_root() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        let parent = "at://did:plc:abc123/app.bsky.feed.post/parent";
        Mock::given(method("GET"))
            .and(path("/xrpc/app.bsky.feed.getPosts"))
            .and(query_param("uris", parent))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "posts": [{
                    "uri": parent,
                    "cid": "cid-parent",
                    "record": {
                        "text": "second",
                        "reply": {
                            "root": { "uri": "at://did:plc:abc123/app.bsky.feed.post/root", "cid": "cid-root" },
                            "parent": { "uri": "at://did:plc:abc123/app.bsky.feed.post/root", "cid": "cid-root" }
                        }
                    }
                }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.createRecord"))
            .and(header("authorization", "Bearer token"))
            .and(body_string_contains("\"cid\":\"cid-root\""))
            .and(body_string_contains("\"cid\":\"cid-parent\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uri": "at://did:plc:abc123/app.bsky.feed.post/third",
                "cid": "cid-third"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let options = PostOptions {
            reply_to: Some(parent.to_string()),
            ..Default::default()
        };
        let result = adapter(&server)
            .create_post("third", &[], "token", &options)
            .await
            .unwrap();
        assert_eq!(result.id, "at://did:plc:abc123/app.bsky.feed.post/third");
        assert_eq!(
            result.url.as_deref(),
            Some("https://bsky.app/profile/did:plc:abc123/post/third")
        );
    }

    #[tokio::test]
    async fn test_image_embed_from_uploaded_blob() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.uploadBlob"))
            .and(header("content-type", "image/png"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "blob": { "$type": "blob", "ref": { "$link": "bafkrei" }, "mimeType": "image/png", "size": 3 }
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.createRecord"))
            .and(body_string_contains("app.bsky.embed.images"))
            .and(body_string_contains("\"alt\":\"A cat\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uri": "at://did:plc:abc123/app.bsky.feed.post/pic",
                "cid": "cid-pic"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = adapter(&server);
        let metadata = MediaMetadata {
            alt_text: Some("A cat".to_string()),
            ..Default::default()
        };
        let upload = adapter
            .upload_media(b"png", "image/png", "token", Some(&metadata))
            .await
            .unwrap();
        adapter
            .create_post("look", &[upload.media_id], "token", &PostOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_url_media_rejected_before_network() {
        let server = MockServer::start().await;
        let err = adapter(&server)
            .create_post(
                "look",
                &["https://cdn.example/cat.png".to_string()],
                "token",
                &PostOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::ValidationError));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_and_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.deleteRecord"))
            .and(body_string_contains("\"rkey\":\"gone\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/xrpc/app.bsky.feed.getPosts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "posts": [] })))
            .mount(&server)
            .await;

        let adapter = adapter(&server);
        let uri = "at://did:plc:abc123/app.bsky.feed.post/gone";
        adapter.delete_post(uri, "token").await.unwrap();
        assert!(matches!(
            adapter.get_post_status(uri, "token").await.unwrap(),
            RemotePostStatus::Failed { .. }
        ));
    }
}
