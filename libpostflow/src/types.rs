//! Core types for Postflow

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PostflowError;

/// Destination platform of a scheduled post
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Twitter,
    LinkedIn,
    Instagram,
    TikTok,
    YouTube,
    Bluesky,
    Threads,
}

impl Platform {
    pub const ALL: [Platform; 7] = [
        Platform::Twitter,
        Platform::LinkedIn,
        Platform::Instagram,
        Platform::TikTok,
        Platform::YouTube,
        Platform::Bluesky,
        Platform::Threads,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Twitter => "twitter",
            Platform::LinkedIn => "linkedin",
            Platform::Instagram => "instagram",
            Platform::TikTok => "tiktok",
            Platform::YouTube => "youtube",
            Platform::Bluesky => "bluesky",
            Platform::Threads => "threads",
        }
    }

    /// Platforms that refuse posts without at least one media item
    pub fn requires_media(&self) -> bool {
        matches!(self, Platform::Instagram | Platform::TikTok | Platform::YouTube)
    }

    /// Platforms that fetch media themselves from a public URL
    ///
    /// Everywhere else a URL has to be downloaded and uploaded first.
    pub fn pulls_media_from_url(&self) -> bool {
        matches!(self, Platform::Instagram | Platform::TikTok | Platform::Threads)
    }

    /// Platforms with reply chains usable for threads
    pub fn supports_threads(&self) -> bool {
        matches!(self, Platform::Twitter | Platform::Bluesky | Platform::Threads)
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Platform {
    type Err = PostflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "twitter" | "x" => Ok(Platform::Twitter),
            "linkedin" => Ok(Platform::LinkedIn),
            "instagram" => Ok(Platform::Instagram),
            "tiktok" => Ok(Platform::TikTok),
            "youtube" => Ok(Platform::YouTube),
            "bluesky" => Ok(Platform::Bluesky),
            "threads" => Ok(Platform::Threads),
            other => Err(PostflowError::InvalidInput(format!(
                "Unknown platform '{}'. Valid options: twitter, linkedin, instagram, tiktok, youtube, bluesky, threads",
                other
            ))),
        }
    }
}

/// Lifecycle state of a scheduled post
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PostStatus {
    Pending,
    Processing,
    Completed,
    Published,
    Failed,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Pending => "pending",
            PostStatus::Processing => "processing",
            PostStatus::Completed => "completed",
            PostStatus::Published => "published",
            PostStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PostStatus::Completed | PostStatus::Published | PostStatus::Failed
        )
    }

    /// Whether a post may move from `self` to `next`
    pub fn can_transition_to(&self, next: PostStatus) -> bool {
        use PostStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Pending, Published)
                | (Pending, Failed)
                | (Completed, Published)
                // The platform rejected a submission it had accepted
                | (Completed, Failed)
                | (Failed, Pending)
        )
    }
}

impl std::fmt::Display for PostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PostStatus {
    type Err = PostflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(PostStatus::Pending),
            "processing" => Ok(PostStatus::Processing),
            "completed" => Ok(PostStatus::Completed),
            "published" => Ok(PostStatus::Published),
            "failed" => Ok(PostStatus::Failed),
            other => Err(PostflowError::InvalidInput(format!(
                "Unknown post status '{}'",
                other
            ))),
        }
    }
}

/// A unit of content destined for one platform
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledPost {
    pub id: String,
    pub user_id: String,
    pub platform: Platform,
    pub content: String,
    pub media_urls: Vec<String>,
    pub scheduled_time: DateTime<Utc>,
    pub status: PostStatus,
    pub error: Option<String>,
    /// Number of FAILED entries in the status log
    pub retry_count: u32,
    /// Identifier assigned by the destination platform
    pub platform_post_id: Option<String>,
    pub metrics: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input to `Scheduler::schedule_post`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewScheduledPost {
    pub user_id: String,
    pub platform: Platform,
    pub content: String,
    pub scheduled_time: DateTime<Utc>,
    #[serde(default)]
    pub media_urls: Vec<String>,
}

impl NewScheduledPost {
    pub fn into_post(self, now: DateTime<Utc>) -> ScheduledPost {
        ScheduledPost {
            id: Uuid::new_v4().to_string(),
            user_id: self.user_id,
            platform: self.platform,
            content: self.content,
            media_urls: self.media_urls,
            scheduled_time: self.scheduled_time,
            status: PostStatus::Pending,
            error: None,
            retry_count: 0,
            platform_post_id: None,
            metrics: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update applied by `Scheduler::update_scheduled_post`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostUpdate {
    pub content: Option<String>,
    pub media_urls: Option<Vec<String>>,
    pub scheduled_time: Option<DateTime<Utc>>,
}

/// Per-user, per-platform OAuth material
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct Credential {
    pub user_id: String,
    pub platform: Platform,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
    pub platform_user_id: Option<String>,
    pub username: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Tokens must be refreshed this long before the provider's expiry
const EXPIRY_SKEW_SECS: i64 = 60;

impl Credential {
    pub fn from_token(
        user_id: &str,
        platform: Platform,
        token: AccessTokenData,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            platform,
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at: token.expires_at,
            scope: token.scope,
            platform_user_id: None,
            username: None,
            updated_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .map(|at| at <= now + Duration::seconds(EXPIRY_SKEW_SECS))
            .unwrap_or(false)
    }

    /// Fold a refreshed token into this credential, keeping the old refresh token
    /// when the provider does not rotate it
    pub fn apply_refresh(&mut self, token: AccessTokenData, now: DateTime<Utc>) {
        self.access_token = token.access_token;
        if token.refresh_token.is_some() {
            self.refresh_token = token.refresh_token;
        }
        self.expires_at = token.expires_at;
        if token.scope.is_some() {
            self.scope = token.scope;
        }
        self.updated_at = now;
    }
}

// Tokens stay out of logs
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("user_id", &self.user_id)
            .field("platform", &self.platform)
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .field("platform_user_id", &self.platform_user_id)
            .field("username", &self.username)
            .finish()
    }
}

/// Append-only audit trail entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostStatusLog {
    pub id: i64,
    pub post_id: String,
    pub status: PostStatus,
    pub platform_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Adapter DTOs
// ============================================================================

/// Authorization URL plus the values the caller must keep until the callback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
    /// PKCE verifier, only for providers that use PKCE
    pub code_verifier: Option<String>,
}

#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct AccessTokenData {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub token_type: Option<String>,
    pub scope: Option<String>,
}

impl AccessTokenData {
    /// Build from an OAuth2 token response with `expires_in` seconds
    pub fn from_expires_in(
        access_token: String,
        refresh_token: Option<String>,
        expires_in: Option<i64>,
        token_type: Option<String>,
        scope: Option<String>,
    ) -> Self {
        Self {
            access_token,
            refresh_token,
            expires_at: expires_in.map(|secs| Utc::now() + Duration::seconds(secs)),
            token_type,
            scope,
        }
    }
}

impl std::fmt::Debug for AccessTokenData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessTokenData")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlatformUser {
    pub id: String,
    pub username: String,
    pub display_name: Option<String>,
    pub profile_image: Option<String>,
    pub is_verified: Option<bool>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
}

impl MediaType {
    pub fn from_mime(mime_type: &str) -> Option<Self> {
        let mime = mime_type.to_lowercase();
        if mime.starts_with("image/") {
            Some(MediaType::Image)
        } else if mime.starts_with("video/") {
            Some(MediaType::Video)
        } else {
            None
        }
    }
}

/// Extra inputs some upload protocols need
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaMetadata {
    /// Publicly reachable copy of the media, for container-based platforms
    pub source_url: Option<String>,
    pub title: Option<String>,
    pub alt_text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaUploadResult {
    pub media_id: String,
    pub media_type: MediaType,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PrivacyStatus {
    Public,
    Unlisted,
    Private,
}

/// Per-platform publishing options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostOptions {
    pub reply_to: Option<String>,
    pub title: Option<String>,
    pub privacy: Option<PrivacyStatus>,
    /// Provider-side scheduled publish time (YouTube)
    pub publish_at: Option<DateTime<Utc>>,
    /// Cross-post a reel to the main feed (Instagram)
    pub share_to_feed: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostResult {
    pub id: String,
    pub url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub platform: Platform,
}

impl PostResult {
    pub fn new(platform: Platform, id: String, url: Option<String>) -> Self {
        Self {
            id,
            url,
            created_at: Utc::now(),
            platform,
        }
    }
}

/// Publication state of a post as reported by the platform
#[derive(Debug, Clone, PartialEq)]
pub enum RemotePostStatus {
    Published { metrics: Option<serde_json::Value> },
    Failed { reason: String },
    Pending,
}

/// One entry of a reply-chain thread
#[derive(Debug, Clone, Default)]
pub struct ThreadPost {
    pub content: String,
    pub media_ids: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_round_trips_through_str() {
        for platform in Platform::ALL {
            let parsed: Platform = platform.as_str().parse().unwrap();
            assert_eq!(parsed, platform);
        }
        assert_eq!("X".parse::<Platform>().unwrap(), Platform::Twitter);
        assert!("myspace".parse::<Platform>().is_err());
    }

    #[test]
    fn test_platform_serializes_lowercase() {
        let json = serde_json::to_string(&Platform::LinkedIn).unwrap();
        assert_eq!(json, r#""linkedin""#);
    }

    #[test]
    fn test_platform_capabilities() {
        assert!(Platform::Instagram.requires_media());
        assert!(Platform::TikTok.requires_media());
        assert!(Platform::YouTube.requires_media());
        assert!(!Platform::Twitter.requires_media());

        assert!(Platform::Twitter.supports_threads());
        assert!(Platform::Bluesky.supports_threads());
        assert!(!Platform::LinkedIn.supports_threads());

        assert!(Platform::Instagram.pulls_media_from_url());
        assert!(!Platform::YouTube.pulls_media_from_url());
        assert!(!Platform::Bluesky.pulls_media_from_url());
    }

    #[test]
    fn test_status_transitions() {
        use PostStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Pending));
        assert!(Completed.can_transition_to(Published));
        assert!(Completed.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Processing.can_transition_to(Pending));
    }

    #[test]
    fn test_status_serializes_uppercase() {
        let json = serde_json::to_string(&PostStatus::Published).unwrap();
        assert_eq!(json, r#""PUBLISHED""#);
        assert_eq!("FAILED".parse::<PostStatus>().unwrap(), PostStatus::Failed);
    }

    #[test]
    fn test_new_post_starts_pending() {
        let now = Utc::now();
        let post = NewScheduledPost {
            user_id: "user-1".to_string(),
            platform: Platform::Twitter,
            content: "Hello".to_string(),
            scheduled_time: now + Duration::hours(1),
            media_urls: vec![],
        }
        .into_post(now);

        assert_eq!(post.status, PostStatus::Pending);
        assert_eq!(post.retry_count, 0);
        assert!(Uuid::parse_str(&post.id).is_ok());
    }

    #[test]
    fn test_credential_expiry_has_skew() {
        let now = Utc::now();
        let mut credential = Credential::from_token(
            "user-1",
            Platform::Twitter,
            AccessTokenData {
                access_token: "a".to_string(),
                refresh_token: Some("r".to_string()),
                expires_at: Some(now + Duration::seconds(30)),
                token_type: None,
                scope: None,
            },
            now,
        );
        assert!(credential.is_expired(now));

        credential.expires_at = Some(now + Duration::hours(1));
        assert!(!credential.is_expired(now));

        credential.expires_at = None;
        assert!(!credential.is_expired(now));
    }

    #[test]
    fn test_apply_refresh_keeps_unrotated_refresh_token() {
        let now = Utc::now();
        let mut credential = Credential::from_token(
            "user-1",
            Platform::LinkedIn,
            AccessTokenData {
                access_token: "old".to_string(),
                refresh_token: Some("refresh".to_string()),
                expires_at: None,
                token_type: None,
                scope: Some("w_member_social".to_string()),
            },
            now,
        );

        credential.apply_refresh(
            AccessTokenData {
                access_token: "new".to_string(),
                refresh_token: None,
                expires_at: Some(now + Duration::hours(2)),
                token_type: None,
                scope: None,
            },
            now,
        );

        assert_eq!(credential.access_token, "new");
        assert_eq!(credential.refresh_token.as_deref(), Some("refresh"));
        assert_eq!(credential.scope.as_deref(), Some("w_member_social"));
    }

    #[test]
    fn test_credential_debug_redacts_tokens() {
        let credential = Credential::from_token(
            "user-1",
            Platform::Twitter,
            AccessTokenData {
                access_token: "super-secret".to_string(),
                refresh_token: Some("also-secret".to_string()),
                expires_at: None,
                token_type: None,
                scope: None,
            },
            Utc::now(),
        );
        let debug = format!("{:?}", credential);
        assert!(!debug.contains("super-secret"));
        assert!(!debug.contains("also-secret"));
    }

    #[test]
    fn test_media_type_from_mime() {
        assert_eq!(MediaType::from_mime("image/png"), Some(MediaType::Image));
        assert_eq!(MediaType::from_mime("VIDEO/MP4"), Some(MediaType::Video));
        assert_eq!(MediaType::from_mime("application/pdf"), None);
    }
}
