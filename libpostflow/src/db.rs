//! Database operations for Postflow

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;

use crate::error::{DbError, PostflowError, Result};
use crate::types::{Credential, Platform, PostStatus, PostStatusLog, ScheduledPost};

const POST_COLUMNS: &str = r#"
    p.id, p.user_id, p.platform, p.content, p.media_urls, p.scheduled_time, p.status,
    p.error, p.platform_post_id, p.metrics, p.created_at, p.updated_at,
    (SELECT COUNT(*) FROM post_status_logs l WHERE l.post_id = p.id AND l.status = 'failed') AS retry_count
"#;

/// Status-log entry written in the same transaction as a transition
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub status: PostStatus,
    pub platform_id: Option<String>,
    pub error_message: Option<String>,
}

/// Column changes applied together with a status transition
#[derive(Debug, Clone, Default)]
pub struct TransitionUpdate {
    /// Replaces the stored error; `None` clears it
    pub error: Option<String>,
    /// Kept unchanged when `None`
    pub platform_post_id: Option<String>,
    /// Forget the platform id so the post is published again
    pub clear_platform_post_id: bool,
    /// Kept unchanged when `None`
    pub metrics: Option<serde_json::Value>,
    pub log: Option<LogEntry>,
}

/// OAuth handshake state taken back at callback time
#[derive(Debug, Clone)]
pub struct OAuthState {
    pub platform: Platform,
    pub code_verifier: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database file and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
        }

        // Forward slashes work for SQLite URLs on every platform
        let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));

        let pool = SqlitePool::connect(&db_url)
            .await
            .map_err(DbError::SqlxError)?;

        Self::migrate(pool).await
    }

    /// Private in-memory database, one connection so every query sees the same data
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(DbError::SqlxError)?;

        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Scheduled posts
    // ------------------------------------------------------------------

    pub async fn insert_scheduled_post(&self, post: &ScheduledPost) -> Result<()> {
        let media_urls = encode_json(&post.media_urls)?;
        let metrics = post.metrics.as_ref().map(encode_json).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO scheduled_posts
                (id, user_id, platform, content, media_urls, scheduled_time, status,
                 error, platform_post_id, metrics, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&post.id)
        .bind(&post.user_id)
        .bind(post.platform.as_str())
        .bind(&post.content)
        .bind(media_urls)
        .bind(post.scheduled_time.timestamp_millis())
        .bind(post.status.as_str())
        .bind(&post.error)
        .bind(&post.platform_post_id)
        .bind(metrics)
        .bind(post.created_at.timestamp_millis())
        .bind(post.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_scheduled_post(&self, post_id: &str) -> Result<Option<ScheduledPost>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM scheduled_posts p WHERE p.id = ?",
            POST_COLUMNS
        ))
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.map(|r| row_to_post(&r)).transpose()
    }

    /// PENDING posts not yet sent to their platform whose scheduled time is at
    /// or before `now`, oldest first
    ///
    /// Resubmitted posts wait in PENDING with a platform id until the monitor
    /// confirms them, so they are left out.
    pub async fn due_posts(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledPost>> {
        self.select_due(&[PostStatus::Pending], now, true).await
    }

    /// Posts in any of `statuses` whose scheduled time is at or before `now`
    pub async fn posts_due_in(
        &self,
        statuses: &[PostStatus],
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledPost>> {
        self.select_due(statuses, now, false).await
    }

    async fn select_due(
        &self,
        statuses: &[PostStatus],
        now: DateTime<Utc>,
        unsubmitted_only: bool,
    ) -> Result<Vec<ScheduledPost>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT {} FROM scheduled_posts p WHERE p.status IN ({}) AND p.scheduled_time <= ? {} \
             ORDER BY p.scheduled_time ASC, p.created_at ASC",
            POST_COLUMNS,
            placeholders(statuses.len()),
            if unsubmitted_only {
                "AND p.platform_post_id IS NULL"
            } else {
                ""
            }
        );

        let mut query = sqlx::query(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }
        let rows = query
            .bind(now.timestamp_millis())
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(row_to_post).collect()
    }

    /// Posts for a user in any of `statuses`, ordered by scheduled time ascending
    pub async fn posts_for_user(
        &self,
        user_id: &str,
        statuses: &[PostStatus],
    ) -> Result<Vec<ScheduledPost>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT {} FROM scheduled_posts p WHERE p.user_id = ? AND p.status IN ({}) \
             ORDER BY p.scheduled_time ASC, p.created_at ASC",
            POST_COLUMNS,
            placeholders(statuses.len())
        );

        let mut query = sqlx::query(&sql).bind(user_id);
        for status in statuses {
            query = query.bind(status.as_str());
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(row_to_post).collect()
    }

    /// Move a post from `from` to `to` if it is still in `from`
    ///
    /// Returns `false` when another writer got there first. The optional log
    /// entry is appended in the same transaction as the status change.
    pub async fn transition_post(
        &self,
        post_id: &str,
        from: PostStatus,
        to: PostStatus,
        update: TransitionUpdate,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if !from.can_transition_to(to) {
            return Err(PostflowError::InvalidInput(format!(
                "Post cannot move from {} to {}",
                from, to
            )));
        }

        let metrics = update.metrics.as_ref().map(encode_json).transpose()?;
        let now_ms = now.timestamp_millis();

        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        let result = sqlx::query(
            r#"
            UPDATE scheduled_posts
            SET status = ?,
                error = ?,
                platform_post_id = CASE WHEN ? THEN NULL ELSE COALESCE(?, platform_post_id) END,
                metrics = COALESCE(?, metrics),
                status_check_failures = 0,
                updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(to.as_str())
        .bind(&update.error)
        .bind(update.clear_platform_post_id)
        .bind(&update.platform_post_id)
        .bind(metrics)
        .bind(now_ms)
        .bind(post_id)
        .bind(from.as_str())
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 0 {
            tx.rollback().await.map_err(DbError::SqlxError)?;
            return Ok(false);
        }

        if let Some(log) = &update.log {
            sqlx::query(
                r#"
                INSERT INTO post_status_logs (post_id, status, platform_id, error_message, created_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(post_id)
            .bind(log.status.as_str())
            .bind(&log.platform_id)
            .bind(&log.error_message)
            .bind(now_ms)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;
        }

        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(true)
    }

    /// Note another failed attempt on a post that stays FAILED
    ///
    /// Refreshes the stored error and appends a FAILED log entry, which bumps
    /// the derived retry count.
    pub async fn record_failed_attempt(
        &self,
        post_id: &str,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let now_ms = now.timestamp_millis();
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        let result = sqlx::query(
            "UPDATE scheduled_posts SET error = ?, updated_at = ? WHERE id = ? AND status = 'failed'",
        )
        .bind(error_message)
        .bind(now_ms)
        .bind(post_id)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 0 {
            tx.rollback().await.map_err(DbError::SqlxError)?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO post_status_logs (post_id, status, platform_id, error_message, created_at)
            VALUES (?, 'failed', NULL, ?, ?)
            "#,
        )
        .bind(post_id)
        .bind(error_message)
        .bind(now_ms)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(true)
    }

    /// Count a failed status lookup on a post still in `status`
    ///
    /// Stores the lookup error and returns the number of failures in a row,
    /// or `None` when the post has moved on. `updated_at` is left alone so
    /// retention still runs from the last real change.
    pub async fn record_status_check_failure(
        &self,
        post_id: &str,
        status: PostStatus,
        error_message: &str,
    ) -> Result<Option<u32>> {
        let failures: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE scheduled_posts
            SET status_check_failures = status_check_failures + 1, error = ?
            WHERE id = ? AND status = ?
            RETURNING status_check_failures
            "#,
        )
        .bind(error_message)
        .bind(post_id)
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(failures.map(|n| n as u32))
    }

    /// Forget earlier lookup failures once the platform answers again
    pub async fn clear_status_check_failures(
        &self,
        post_id: &str,
        status: PostStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_posts
            SET status_check_failures = 0, error = NULL
            WHERE id = ? AND status = ? AND status_check_failures > 0
            "#,
        )
        .bind(post_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    /// Overwrite editable fields of a post
    pub async fn update_post_fields(
        &self,
        post_id: &str,
        content: &str,
        media_urls: &[String],
        scheduled_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_posts
            SET content = ?, media_urls = ?, scheduled_time = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(content)
        .bind(encode_json(&media_urls)?)
        .bind(scheduled_time.timestamp_millis())
        .bind(now.timestamp_millis())
        .bind(post_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete a post and its status log
    pub async fn delete_scheduled_post(&self, post_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        sqlx::query("DELETE FROM post_status_logs WHERE post_id = ?")
            .bind(post_id)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

        let result = sqlx::query("DELETE FROM scheduled_posts WHERE id = ?")
            .bind(post_id)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete terminal posts last touched before `cutoff`, returning how many went
    pub async fn delete_terminal_posts_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let cutoff_ms = cutoff.timestamp_millis();
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        sqlx::query(
            r#"
            DELETE FROM post_status_logs WHERE post_id IN (
                SELECT id FROM scheduled_posts
                WHERE status IN ('completed', 'published', 'failed') AND updated_at < ?
            )
            "#,
        )
        .bind(cutoff_ms)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        let result = sqlx::query(
            r#"
            DELETE FROM scheduled_posts
            WHERE status IN ('completed', 'published', 'failed') AND updated_at < ?
            "#,
        )
        .bind(cutoff_ms)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(result.rows_affected())
    }

    /// Status log for a post, oldest first
    pub async fn status_logs(&self, post_id: &str) -> Result<Vec<PostStatusLog>> {
        let rows = sqlx::query(
            r#"
            SELECT id, post_id, status, platform_id, error_message, created_at
            FROM post_status_logs
            WHERE post_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(post_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter()
            .map(|r| -> Result<PostStatusLog> {
                Ok(PostStatusLog {
                    id: r.get("id"),
                    post_id: r.get("post_id"),
                    status: parse_column(r, "status")?,
                    platform_id: r.get("platform_id"),
                    error_message: r.get("error_message"),
                    created_at: millis_to_datetime(r.get("created_at"))?,
                })
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Credentials
    // ------------------------------------------------------------------

    pub async fn upsert_credential(&self, credential: &Credential) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO platform_credentials
                (user_id, platform, access_token, refresh_token, expires_at, scope,
                 platform_user_id, username, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, platform) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at,
                scope = excluded.scope,
                platform_user_id = COALESCE(excluded.platform_user_id, platform_credentials.platform_user_id),
                username = COALESCE(excluded.username, platform_credentials.username),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&credential.user_id)
        .bind(credential.platform.as_str())
        .bind(&credential.access_token)
        .bind(&credential.refresh_token)
        .bind(credential.expires_at.map(|t| t.timestamp_millis()))
        .bind(&credential.scope)
        .bind(&credential.platform_user_id)
        .bind(&credential.username)
        .bind(credential.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_credential(
        &self,
        user_id: &str,
        platform: Platform,
    ) -> Result<Option<Credential>> {
        let row = sqlx::query(
            r#"
            SELECT user_id, platform, access_token, refresh_token, expires_at, scope,
                   platform_user_id, username, updated_at
            FROM platform_credentials
            WHERE user_id = ? AND platform = ?
            "#,
        )
        .bind(user_id)
        .bind(platform.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.map(|r| -> Result<Credential> {
            Ok(Credential {
                user_id: r.get("user_id"),
                platform: parse_column(&r, "platform")?,
                access_token: r.get("access_token"),
                refresh_token: r.get("refresh_token"),
                expires_at: r
                    .get::<Option<i64>, _>("expires_at")
                    .map(millis_to_datetime)
                    .transpose()?,
                scope: r.get("scope"),
                platform_user_id: r.get("platform_user_id"),
                username: r.get("username"),
                updated_at: millis_to_datetime(r.get("updated_at"))?,
            })
        })
        .transpose()
    }

    pub async fn delete_credential(&self, user_id: &str, platform: Platform) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM platform_credentials WHERE user_id = ? AND platform = ?")
                .bind(user_id)
                .bind(platform.as_str())
                .execute(&self.pool)
                .await
                .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    // ------------------------------------------------------------------
    // OAuth handshake state
    // ------------------------------------------------------------------

    pub async fn insert_oauth_state(
        &self,
        state: &str,
        platform: Platform,
        code_verifier: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO oauth_states (state, platform, code_verifier, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(state)
        .bind(platform.as_str())
        .bind(code_verifier)
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Remove and return a stored state, so each state is usable once
    pub async fn take_oauth_state(&self, state: &str) -> Result<Option<OAuthState>> {
        let row = sqlx::query(
            "DELETE FROM oauth_states WHERE state = ? RETURNING platform, code_verifier, created_at",
        )
        .bind(state)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.map(|r| -> Result<OAuthState> {
            Ok(OAuthState {
                platform: parse_column(&r, "platform")?,
                code_verifier: r.get("code_verifier"),
                created_at: millis_to_datetime(r.get("created_at"))?,
            })
        })
        .transpose()
    }

    pub async fn purge_oauth_states_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM oauth_states WHERE created_at < ?")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected())
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn encode_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| DbError::CorruptRow(format!("unserializable value: {}", e)).into())
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| DbError::CorruptRow(format!("timestamp out of range: {}", ms)).into())
}

fn parse_column<T>(row: &SqliteRow, column: &str) -> Result<T>
where
    T: std::str::FromStr,
{
    let raw: String = row.get(column);
    raw.parse()
        .map_err(|_| DbError::CorruptRow(format!("invalid {} '{}'", column, raw)).into())
}

fn row_to_post(r: &SqliteRow) -> Result<ScheduledPost> {
    let media_urls: String = r.get("media_urls");
    let media_urls: Vec<String> = serde_json::from_str(&media_urls)
        .map_err(|e| DbError::CorruptRow(format!("media_urls: {}", e)))?;

    let metrics = r
        .get::<Option<String>, _>("metrics")
        .map(|m| serde_json::from_str(&m))
        .transpose()
        .map_err(|e| DbError::CorruptRow(format!("metrics: {}", e)))?;

    Ok(ScheduledPost {
        id: r.get("id"),
        user_id: r.get("user_id"),
        platform: parse_column(r, "platform")?,
        content: r.get("content"),
        media_urls,
        scheduled_time: millis_to_datetime(r.get("scheduled_time"))?,
        status: parse_column(r, "status")?,
        error: r.get("error"),
        retry_count: r.get::<i64, _>("retry_count") as u32,
        platform_post_id: r.get("platform_post_id"),
        metrics,
        created_at: millis_to_datetime(r.get("created_at"))?,
        updated_at: millis_to_datetime(r.get("updated_at"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccessTokenData, NewScheduledPost};
    use chrono::Duration;
    use tempfile::TempDir;

    async fn setup_test_db() -> (Database, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::new(db_path.to_str().unwrap()).await.unwrap();
        (db, temp_dir)
    }

    fn test_post(user_id: &str, scheduled_time: DateTime<Utc>) -> ScheduledPost {
        NewScheduledPost {
            user_id: user_id.to_string(),
            platform: Platform::Twitter,
            content: "Test post content".to_string(),
            scheduled_time,
            media_urls: vec!["https://cdn.example.com/a.png".to_string()],
        }
        .into_post(Utc::now())
    }

    fn fail_log(message: &str) -> TransitionUpdate {
        TransitionUpdate {
            error: Some(message.to_string()),
            log: Some(LogEntry {
                status: PostStatus::Failed,
                platform_id: None,
                error_message: Some(message.to_string()),
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_database_initialization_with_invalid_path() {
        #[cfg(unix)]
        let invalid_path = "/tmp/test\0invalid.db";
        #[cfg(windows)]
        let invalid_path = "C:\\invalid<>path\\test.db";

        let result = Database::new(invalid_path).await;
        assert!(matches!(result, Err(PostflowError::Database(_))));
    }

    #[tokio::test]
    async fn test_insert_and_get_post() {
        let (db, _dir) = setup_test_db().await;
        let post = test_post("user-1", Utc::now() + Duration::hours(1));

        db.insert_scheduled_post(&post).await.unwrap();
        let loaded = db.get_scheduled_post(&post.id).await.unwrap().unwrap();

        assert_eq!(loaded.id, post.id);
        assert_eq!(loaded.platform, Platform::Twitter);
        assert_eq!(loaded.media_urls, post.media_urls);
        assert_eq!(loaded.status, PostStatus::Pending);
        assert_eq!(loaded.retry_count, 0);
        assert_eq!(
            loaded.scheduled_time.timestamp_millis(),
            post.scheduled_time.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn test_get_nonexistent_post_returns_none() {
        let db = Database::in_memory().await.unwrap();
        assert!(db.get_scheduled_post("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_due_posts_filters_by_time_and_status() {
        let db = Database::in_memory().await.unwrap();
        let now = Utc::now();

        let due = test_post("user-1", now - Duration::minutes(5));
        let later = test_post("user-1", now + Duration::minutes(5));
        let exact = test_post("user-2", now);
        for post in [&due, &later, &exact] {
            db.insert_scheduled_post(post).await.unwrap();
        }

        let found = db.due_posts(now).await.unwrap();
        let ids: Vec<_> = found.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec![due.id.as_str(), exact.id.as_str()]);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let db = Database::in_memory().await.unwrap();
        let post = test_post("user-1", Utc::now());
        db.insert_scheduled_post(&post).await.unwrap();

        let now = Utc::now();
        let first = db
            .transition_post(&post.id, PostStatus::Pending, PostStatus::Processing, TransitionUpdate::default(), now)
            .await
            .unwrap();
        let second = db
            .transition_post(&post.id, PostStatus::Pending, PostStatus::Processing, TransitionUpdate::default(), now)
            .await
            .unwrap();

        assert!(first);
        assert!(!second);
        assert!(db.status_logs(&post.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_transition_rejected() {
        let db = Database::in_memory().await.unwrap();
        let result = db
            .transition_post("any", PostStatus::Pending, PostStatus::Completed, TransitionUpdate::default(), Utc::now())
            .await;
        assert!(matches!(result, Err(PostflowError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_failed_logs_drive_retry_count() {
        let db = Database::in_memory().await.unwrap();
        let post = test_post("user-1", Utc::now());
        db.insert_scheduled_post(&post).await.unwrap();
        let now = Utc::now();

        for _ in 0..2 {
            assert!(db
                .transition_post(&post.id, PostStatus::Pending, PostStatus::Failed, fail_log("boom"), now)
                .await
                .unwrap());
            assert!(db
                .transition_post(&post.id, PostStatus::Failed, PostStatus::Pending, TransitionUpdate::default(), now)
                .await
                .unwrap());
        }

        let loaded = db.get_scheduled_post(&post.id).await.unwrap().unwrap();
        assert_eq!(loaded.retry_count, 2);
        assert_eq!(loaded.status, PostStatus::Pending);
        assert!(loaded.error.is_none());

        let logs = db.status_logs(&post.id).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().all(|l| l.status == PostStatus::Failed));
    }

    #[tokio::test]
    async fn test_record_failed_attempt_only_on_failed_posts() {
        let db = Database::in_memory().await.unwrap();
        let post = test_post("user-1", Utc::now());
        db.insert_scheduled_post(&post).await.unwrap();
        let now = Utc::now();

        assert!(!db.record_failed_attempt(&post.id, "early", now).await.unwrap());

        db.transition_post(&post.id, PostStatus::Pending, PostStatus::Failed, fail_log("first"), now)
            .await
            .unwrap();
        assert!(db.record_failed_attempt(&post.id, "second", now).await.unwrap());

        let loaded = db.get_scheduled_post(&post.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, PostStatus::Failed);
        assert_eq!(loaded.error.as_deref(), Some("second"));
        assert_eq!(loaded.retry_count, 2);
    }

    #[tokio::test]
    async fn test_status_check_failures_count_until_transition() {
        let db = Database::in_memory().await.unwrap();
        let post = test_post("user-1", Utc::now());
        db.insert_scheduled_post(&post).await.unwrap();
        let now = Utc::now();

        for expected in 1..=3 {
            let failures = db
                .record_status_check_failure(&post.id, PostStatus::Pending, "token revoked")
                .await
                .unwrap();
            assert_eq!(failures, Some(expected));
        }
        let loaded = db.get_scheduled_post(&post.id).await.unwrap().unwrap();
        assert_eq!(loaded.error.as_deref(), Some("token revoked"));
        assert_eq!(
            loaded.updated_at.timestamp_millis(),
            post.updated_at.timestamp_millis()
        );

        // Wrong status leaves the post alone
        let missed = db
            .record_status_check_failure(&post.id, PostStatus::Completed, "token revoked")
            .await
            .unwrap();
        assert_eq!(missed, None);

        assert!(db
            .clear_status_check_failures(&post.id, PostStatus::Pending)
            .await
            .unwrap());
        assert!(!db
            .clear_status_check_failures(&post.id, PostStatus::Pending)
            .await
            .unwrap());
        let loaded = db.get_scheduled_post(&post.id).await.unwrap().unwrap();
        assert!(loaded.error.is_none());

        db.record_status_check_failure(&post.id, PostStatus::Pending, "again")
            .await
            .unwrap();
        db.transition_post(&post.id, PostStatus::Pending, PostStatus::Failed, fail_log("gone"), now)
            .await
            .unwrap();
        db.transition_post(
            &post.id,
            PostStatus::Failed,
            PostStatus::Pending,
            TransitionUpdate::default(),
            now,
        )
        .await
        .unwrap();
        let failures = db
            .record_status_check_failure(&post.id, PostStatus::Pending, "again")
            .await
            .unwrap();
        assert_eq!(failures, Some(1));
    }

    #[tokio::test]
    async fn test_transition_keeps_platform_id_when_not_given() {
        let db = Database::in_memory().await.unwrap();
        let post = test_post("user-1", Utc::now());
        db.insert_scheduled_post(&post).await.unwrap();
        let now = Utc::now();

        db.transition_post(&post.id, PostStatus::Pending, PostStatus::Processing, TransitionUpdate::default(), now)
            .await
            .unwrap();
        db.transition_post(
            &post.id,
            PostStatus::Processing,
            PostStatus::Completed,
            TransitionUpdate {
                platform_post_id: Some("tweet-1".to_string()),
                ..Default::default()
            },
            now,
        )
        .await
        .unwrap();
        db.transition_post(
            &post.id,
            PostStatus::Completed,
            PostStatus::Published,
            TransitionUpdate {
                metrics: Some(serde_json::json!({"likes": 3})),
                ..Default::default()
            },
            now,
        )
        .await
        .unwrap();

        let loaded = db.get_scheduled_post(&post.id).await.unwrap().unwrap();
        assert_eq!(loaded.platform_post_id.as_deref(), Some("tweet-1"));
        assert_eq!(loaded.metrics, Some(serde_json::json!({"likes": 3})));
        assert_eq!(loaded.status, PostStatus::Published);
    }

    #[tokio::test]
    async fn test_posts_for_user_ordering() {
        let db = Database::in_memory().await.unwrap();
        let now = Utc::now();
        let late = test_post("user-1", now + Duration::hours(3));
        let early = test_post("user-1", now + Duration::hours(1));
        let other = test_post("user-2", now + Duration::hours(2));
        for post in [&late, &early, &other] {
            db.insert_scheduled_post(post).await.unwrap();
        }

        let posts = db
            .posts_for_user("user-1", &[PostStatus::Pending, PostStatus::Processing])
            .await
            .unwrap();
        let ids: Vec<_> = posts.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec![early.id.as_str(), late.id.as_str()]);
    }

    #[tokio::test]
    async fn test_delete_removes_logs() {
        let db = Database::in_memory().await.unwrap();
        let post = test_post("user-1", Utc::now());
        db.insert_scheduled_post(&post).await.unwrap();
        db.transition_post(&post.id, PostStatus::Pending, PostStatus::Failed, fail_log("x"), Utc::now())
            .await
            .unwrap();

        assert!(db.delete_scheduled_post(&post.id).await.unwrap());
        assert!(db.get_scheduled_post(&post.id).await.unwrap().is_none());
        assert!(db.status_logs(&post.id).await.unwrap().is_empty());
        assert!(!db.delete_scheduled_post(&post.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_retention_only_touches_terminal_posts() {
        let db = Database::in_memory().await.unwrap();
        let then = Utc::now() - Duration::days(40);
        let failed = test_post("user-1", then);
        let pending = test_post("user-1", then);
        db.insert_scheduled_post(&failed).await.unwrap();
        db.insert_scheduled_post(&pending).await.unwrap();
        db.transition_post(&failed.id, PostStatus::Pending, PostStatus::Failed, fail_log("x"), then)
            .await
            .unwrap();

        let removed = db
            .delete_terminal_posts_before(Utc::now() - Duration::days(30))
            .await
            .unwrap();

        assert_eq!(removed, 1);
        assert!(db.get_scheduled_post(&failed.id).await.unwrap().is_none());
        assert!(db.get_scheduled_post(&pending.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_credential_upsert_and_lookup() {
        let db = Database::in_memory().await.unwrap();
        let now = Utc::now();
        let mut credential = Credential::from_token(
            "user-1",
            Platform::LinkedIn,
            AccessTokenData {
                access_token: "first".to_string(),
                refresh_token: Some("refresh".to_string()),
                expires_at: Some(now + Duration::hours(1)),
                token_type: None,
                scope: None,
            },
            now,
        );
        credential.username = Some("alice".to_string());
        db.upsert_credential(&credential).await.unwrap();

        credential.access_token = "second".to_string();
        credential.username = None;
        db.upsert_credential(&credential).await.unwrap();

        let loaded = db
            .get_credential("user-1", Platform::LinkedIn)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.access_token, "second");
        assert_eq!(loaded.username.as_deref(), Some("alice"));
        assert!(db.get_credential("user-1", Platform::Twitter).await.unwrap().is_none());

        assert!(db.delete_credential("user-1", Platform::LinkedIn).await.unwrap());
        assert!(db.get_credential("user-1", Platform::LinkedIn).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oauth_state_is_single_use() {
        let db = Database::in_memory().await.unwrap();
        db.insert_oauth_state("state-1", Platform::Twitter, Some("verifier"), Utc::now())
            .await
            .unwrap();

        let taken = db.take_oauth_state("state-1").await.unwrap().unwrap();
        assert_eq!(taken.platform, Platform::Twitter);
        assert_eq!(taken.code_verifier.as_deref(), Some("verifier"));
        assert!(db.take_oauth_state("state-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_database_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested").join("posts.db");
        let path = db_path.to_str().unwrap();
        let post = test_post("user-1", Utc::now());

        {
            let db = Database::new(path).await.unwrap();
            db.insert_scheduled_post(&post).await.unwrap();
        }

        let db = Database::new(path).await.unwrap();
        assert!(db.get_scheduled_post(&post.id).await.unwrap().is_some());
    }
}
