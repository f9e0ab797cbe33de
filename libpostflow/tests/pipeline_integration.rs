//! Integration tests for the publishing pipeline
//!
//! Drives `PostflowService` end to end against mock adapters, a manual clock
//! and a temporary SQLite database.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use libpostflow::clock::{Clock, ManualClock};
use libpostflow::monitor::FailedPost;
use libpostflow::notify::Notifier;
use libpostflow::platforms::mock::{MockAdapter, MockConfig};
use libpostflow::platforms::PlatformFactory;
use libpostflow::types::Credential;
use libpostflow::{
    Config, Database, ErrorCode, NewScheduledPost, Platform, PlatformError, PostStatus,
    PostflowService, Result,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Default)]
struct RecordingNotifier {
    notified: Mutex<Vec<String>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, user_id: &str, _failures: &[FailedPost]) -> Result<()> {
        self.notified.lock().unwrap().push(user_id.to_string());
        Ok(())
    }
}

struct Harness {
    service: PostflowService,
    clock: ManualClock,
    notifier: Arc<RecordingNotifier>,
    _dir: TempDir,
}

/// Service over a temporary database with `adapters` registered
async fn setup(adapters: Vec<Arc<MockAdapter>>, extra_config: &str) -> Harness {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("pipeline.db");
    let config = Config::parse(&format!(
        "[database]\npath = \"{}\"\n\n[retry]\nmax_attempts = 1\nbackoff_ms = 0\n\n{}",
        db_path.display(),
        extra_config
    ))
    .unwrap();

    let db = Database::new(&config.database.path).await.unwrap();
    let factory = Arc::new(PlatformFactory::new());
    for adapter in adapters {
        factory.register_instance(adapter);
    }
    let clock = ManualClock::new(Utc::now());
    let notifier = Arc::new(RecordingNotifier::default());

    let service = PostflowService::from_parts(
        config,
        db,
        factory,
        Arc::new(clock.clone()),
        notifier.clone(),
    )
    .unwrap();
    Harness {
        service,
        clock,
        notifier,
        _dir: dir,
    }
}

async fn connect(h: &Harness, user_id: &str, platform: Platform) {
    h.service
        .database()
        .upsert_credential(&Credential {
            user_id: user_id.to_string(),
            platform,
            access_token: format!("{}-{}-token", user_id, platform),
            refresh_token: None,
            expires_at: None,
            scope: None,
            platform_user_id: None,
            username: None,
            updated_at: h.clock.now(),
        })
        .await
        .unwrap();
}

fn post_in(h: &Harness, user_id: &str, platform: Platform, minutes: i64) -> NewScheduledPost {
    NewScheduledPost {
        user_id: user_id.to_string(),
        platform,
        content: format!("Scheduled for {} minutes out", minutes),
        scheduled_time: h.clock.now() + Duration::minutes(minutes),
        media_urls: vec![],
    }
}

#[tokio::test]
async fn test_schedule_then_publish_when_due() {
    let adapter = Arc::new(MockAdapter::success(Platform::Twitter));
    let h = setup(vec![adapter.clone()], "").await;
    connect(&h, "alice", Platform::Twitter).await;

    let post = h
        .service
        .scheduler()
        .schedule_post(post_in(&h, "alice", Platform::Twitter, 30))
        .await
        .unwrap();

    // Not due yet
    let early = h.service.scheduler().process_due_posts().await.unwrap();
    assert_eq!(early.processed, 0);
    assert_eq!(adapter.create_call_count(), 0);

    h.clock.advance(Duration::minutes(31));
    let summary = h.service.scheduler().process_due_posts().await.unwrap();
    assert_eq!(summary.completed, 1);

    let stored = h.service.scheduler().get_post(&post.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PostStatus::Completed);
    assert_eq!(stored.platform_post_id.as_deref(), Some("twitter-post-1"));

    let history = h.service.scheduler().post_history(&post.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, PostStatus::Published);
    assert_eq!(history[0].platform_id.as_deref(), Some("twitter-post-1"));

    // A second run finds nothing left to do
    let again = h.service.scheduler().process_due_posts().await.unwrap();
    assert_eq!(again.processed, 0);
    assert_eq!(adapter.create_call_count(), 1);
}

#[tokio::test]
async fn test_failures_are_isolated() {
    let adapter = Arc::new(MockAdapter::success(Platform::LinkedIn));
    let h = setup(vec![adapter.clone()], "").await;
    connect(&h, "alice", Platform::LinkedIn).await;

    let ok = h
        .service
        .scheduler()
        .schedule_post(post_in(&h, "alice", Platform::LinkedIn, 5))
        .await
        .unwrap();
    let orphan = h
        .service
        .scheduler()
        .schedule_post(post_in(&h, "bob", Platform::LinkedIn, 5))
        .await
        .unwrap();

    h.clock.advance(Duration::minutes(6));
    let report = h.service.run_cycle(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.processed.completed, 1);
    assert_eq!(report.processed.failed, 1);

    let ok = h.service.scheduler().get_post(&ok.id).await.unwrap().unwrap();
    assert_eq!(ok.status, PostStatus::Published);

    let orphan = h.service.scheduler().get_post(&orphan.id).await.unwrap().unwrap();
    assert_eq!(orphan.status, PostStatus::Failed);
    assert!(orphan.error.unwrap().contains("No linkedin credentials"));
    assert_eq!(adapter.create_call_count(), 1);
}

#[tokio::test]
async fn test_rate_limit_stops_excess_posts() {
    let adapter = Arc::new(MockAdapter::success(Platform::Twitter));
    let h = setup(
        vec![adapter.clone()],
        "[rate_limits.twitter]\npoints = 1\nduration_secs = 3600\n",
    )
    .await;
    connect(&h, "alice", Platform::Twitter).await;

    for minutes in [1, 2] {
        h.service
            .scheduler()
            .schedule_post(post_in(&h, "alice", Platform::Twitter, minutes))
            .await
            .unwrap();
    }
    h.clock.advance(Duration::minutes(5));

    let summary = h.service.scheduler().process_due_posts().await.unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(adapter.create_call_count(), 1);

    let posts = h.service.scheduler().get_user_posts("alice").await.unwrap();
    let limited = posts
        .iter()
        .find(|p| p.status == PostStatus::Failed)
        .unwrap();
    assert!(limited.error.as_deref().unwrap().contains("Too many requests"));
}

#[tokio::test]
async fn test_oauth_connection_feeds_publishing() {
    let adapter = Arc::new(MockAdapter::success(Platform::Threads));
    let h = setup(vec![adapter.clone()], "").await;
    let accounts = h.service.accounts();

    let request = accounts.begin_authorization(Platform::Threads).await.unwrap();
    let credential = accounts
        .complete_authorization("carol", Platform::Threads, &request.state, "code-42")
        .await
        .unwrap();
    assert_eq!(credential.access_token, "mock-access-code-42");
    assert_eq!(credential.platform_user_id.as_deref(), Some("threads-user-1"));

    // States are single use
    let err = accounts
        .complete_authorization("carol", Platform::Threads, &request.state, "code-42")
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::AuthError));

    h.service
        .scheduler()
        .schedule_post(post_in(&h, "carol", Platform::Threads, 1))
        .await
        .unwrap();
    h.clock.advance(Duration::minutes(2));
    h.service.scheduler().process_due_posts().await.unwrap();

    let calls = adapter.create_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].access_token, "mock-access-code-42");
}

#[tokio::test]
async fn test_expired_token_refreshed_before_publishing() {
    let adapter = Arc::new(MockAdapter::success(Platform::YouTube));
    let h = setup(vec![adapter.clone()], "").await;
    h.service
        .database()
        .upsert_credential(&Credential {
            user_id: "dave".to_string(),
            platform: Platform::YouTube,
            access_token: "stale".to_string(),
            refresh_token: Some("refresh-me".to_string()),
            expires_at: Some(h.clock.now() + Duration::minutes(10)),
            scope: None,
            platform_user_id: None,
            username: None,
            updated_at: h.clock.now(),
        })
        .await
        .unwrap();

    let mut data = post_in(&h, "dave", Platform::YouTube, 30);
    data.media_urls = vec!["video-abc".to_string()];
    h.service.scheduler().schedule_post(data).await.unwrap();
    h.clock.advance(Duration::minutes(31));

    let summary = h.service.scheduler().process_due_posts().await.unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(adapter.refresh_call_count(), 1);
    assert_eq!(adapter.create_calls()[0].access_token, "mock-access-refreshed-1");

    let stored = h
        .service
        .database()
        .get_credential("dave", Platform::YouTube)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.access_token, "mock-access-refreshed-1");
    assert_eq!(stored.refresh_token.as_deref(), Some("refresh-me"));
}

#[tokio::test]
async fn test_failed_post_retried_through_monitor() {
    let adapter = Arc::new(MockAdapter::flaky(
        Platform::Bluesky,
        1,
        PlatformError::api("Service unavailable"),
    ));
    let h = setup(vec![adapter.clone()], "").await;
    connect(&h, "erin", Platform::Bluesky).await;

    let post = h
        .service
        .scheduler()
        .schedule_post(post_in(&h, "erin", Platform::Bluesky, 1))
        .await
        .unwrap();
    h.clock.advance(Duration::minutes(2));

    let report = h.service.run_cycle(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.processed.failed, 1);
    assert!(h.notifier.notified.lock().unwrap().is_empty());

    let retry = h
        .service
        .monitor()
        .retry_failed_posts(&[post.id.clone()], 3)
        .await;
    assert_eq!(retry.success, vec![post.id.clone()]);

    let stored = h.service.scheduler().get_post(&post.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PostStatus::Pending);
    assert_eq!(stored.platform_post_id.as_deref(), Some("bluesky-post-2"));

    // The scheduler leaves resubmitted posts to the monitor
    let report = h.service.run_cycle(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.processed.processed, 0);
    assert_eq!(report.monitor.published, 1);
    assert_eq!(adapter.create_call_count(), 2);

    let stored = h.service.scheduler().get_post(&post.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PostStatus::Published);
    let statuses: Vec<PostStatus> = h
        .service
        .scheduler()
        .post_history(&post.id)
        .await
        .unwrap()
        .into_iter()
        .map(|l| l.status)
        .collect();
    assert_eq!(
        statuses,
        vec![PostStatus::Failed, PostStatus::Pending, PostStatus::Published]
    );
}

#[tokio::test]
async fn test_remote_rejection_notifies_user() {
    let adapter = Arc::new(MockAdapter::with_status(
        Platform::TikTok,
        libpostflow::types::RemotePostStatus::Failed {
            reason: "Video failed moderation".to_string(),
        },
    ));
    let h = setup(vec![adapter], "").await;
    connect(&h, "frank", Platform::TikTok).await;

    let mut data = post_in(&h, "frank", Platform::TikTok, 1);
    data.media_urls = vec!["https://cdn.example/clip.mp4".to_string()];
    let post = h.service.scheduler().schedule_post(data).await.unwrap();
    h.clock.advance(Duration::minutes(2));

    let report = h.service.run_cycle(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.processed.completed, 1);
    assert_eq!(report.monitor.failed_posts.len(), 1);
    assert_eq!(report.notified, 1);
    assert_eq!(*h.notifier.notified.lock().unwrap(), vec!["frank".to_string()]);

    let stored = h.service.scheduler().get_post(&post.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PostStatus::Failed);
    assert_eq!(stored.error.as_deref(), Some("Video failed moderation"));
}

#[tokio::test]
async fn test_media_url_uploaded_before_publishing() {
    let media_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/clip.mp4"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "video/mp4")
                .set_body_bytes(vec![0u8; 64]),
        )
        .expect(1)
        .mount(&media_server)
        .await;

    let adapter = Arc::new(MockAdapter::success(Platform::YouTube));
    let h = setup(vec![adapter.clone()], "").await;
    connect(&h, "gina", Platform::YouTube).await;

    let mut data = post_in(&h, "gina", Platform::YouTube, 1);
    data.media_urls = vec![format!("{}/clip.mp4", media_server.uri())];
    let post = h.service.scheduler().schedule_post(data).await.unwrap();
    h.clock.advance(Duration::minutes(2));

    let summary = h.service.scheduler().process_due_posts().await.unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(adapter.upload_call_count(), 1);
    assert_eq!(
        adapter.create_calls()[0].media_ids,
        vec!["youtube-media-1".to_string()]
    );

    let stored = h.service.scheduler().get_post(&post.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PostStatus::Completed);
    // The stored reference stays the URL the user gave
    assert_eq!(stored.media_urls, vec![format!("{}/clip.mp4", media_server.uri())]);
}

#[tokio::test]
async fn test_unreachable_media_fails_post_without_publishing() {
    let media_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&media_server)
        .await;

    let adapter = Arc::new(MockAdapter::success(Platform::LinkedIn));
    let h = setup(vec![adapter.clone()], "").await;
    connect(&h, "gina", Platform::LinkedIn).await;

    let mut data = post_in(&h, "gina", Platform::LinkedIn, 1);
    data.media_urls = vec![format!("{}/gone.png", media_server.uri())];
    let post = h.service.scheduler().schedule_post(data).await.unwrap();
    h.clock.advance(Duration::minutes(2));

    let summary = h.service.scheduler().process_due_posts().await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(adapter.upload_call_count(), 0);
    assert_eq!(adapter.create_call_count(), 0);

    let stored = h.service.scheduler().get_post(&post.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PostStatus::Failed);
    assert!(stored.error.unwrap().contains("fetch_media"));
}

#[tokio::test]
async fn test_failing_status_lookup_notifies_once_across_cycles() {
    let adapter = Arc::new(MockAdapter::new(MockConfig {
        status_error: Some(PlatformError::auth("token revoked")),
        ..MockConfig::new(Platform::Twitter)
    }));
    let h = setup(vec![adapter.clone()], "").await;
    connect(&h, "hank", Platform::Twitter).await;

    let post = h
        .service
        .scheduler()
        .schedule_post(post_in(&h, "hank", Platform::Twitter, 1))
        .await
        .unwrap();
    h.clock.advance(Duration::minutes(2));

    for _ in 0..5 {
        h.service.run_cycle(&CancellationToken::new()).await.unwrap();
        h.clock.advance(Duration::minutes(1));
    }

    assert_eq!(*h.notifier.notified.lock().unwrap(), vec!["hank".to_string()]);
    assert_eq!(adapter.status_call_count(), 5);

    let stored = h.service.scheduler().get_post(&post.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PostStatus::Completed);
}
