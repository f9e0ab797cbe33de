//! Integration tests for postflow-send

use assert_cmd::Command;
use chrono::{Duration, Utc};
use libpostflow::{Database, NewScheduledPost, Platform, PostStatus};
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Config with a fresh database and no platform apps configured
async fn setup_test_env() -> (TempDir, String, String) {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.toml");
    let db_path = temp_dir.path().join("postflow.db");

    let config_content = format!(
        r#"
[database]
path = "{}"

[scheduling]
poll_interval = 1

[retry]
max_attempts = 1
backoff_ms = 0
"#,
        db_path.display().to_string().replace('\\', "/")
    );
    fs::write(&config_path, config_content).unwrap();

    let _db = Database::new(db_path.to_str().unwrap()).await.unwrap();

    (
        temp_dir,
        config_path.to_str().unwrap().to_string(),
        db_path.to_str().unwrap().to_string(),
    )
}

async fn create_due_post(db_path: &str, platform: Platform) -> String {
    let db = Database::new(db_path).await.unwrap();
    let now = Utc::now();
    let post = NewScheduledPost {
        user_id: "alice".to_string(),
        platform,
        content: "Due a minute ago".to_string(),
        scheduled_time: now - Duration::minutes(1),
        media_urls: vec![],
    }
    .into_post(now - Duration::minutes(5));
    db.insert_scheduled_post(&post).await.unwrap();
    post.id
}

#[test]
fn test_help_lists_options() {
    Command::cargo_bin("postflow-send")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--poll-interval"))
        .stdout(predicate::str::contains("--once"));
}

#[test]
fn test_missing_config_is_configuration_error() {
    let temp_dir = TempDir::new().unwrap();
    Command::cargo_bin("postflow-send")
        .unwrap()
        .env("POSTFLOW_CONFIG", temp_dir.path().join("absent.toml"))
        .arg("--once")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Error:"));
}

#[tokio::test]
async fn test_once_with_empty_queue() {
    let (_temp_dir, config_path, _db_path) = setup_test_env().await;

    Command::cargo_bin("postflow-send")
        .unwrap()
        .env("POSTFLOW_CONFIG", &config_path)
        .arg("--once")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"processed\""))
        .stdout(predicate::str::contains("\"completed\": 0"));
}

#[tokio::test]
async fn test_once_fails_post_for_unconfigured_platform() {
    let (_temp_dir, config_path, db_path) = setup_test_env().await;
    let post_id = create_due_post(&db_path, Platform::Twitter).await;

    Command::cargo_bin("postflow-send")
        .unwrap()
        .arg("--config")
        .arg(&config_path)
        .arg("--once")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"failed\": 1"));

    let db = Database::new(&db_path).await.unwrap();
    let post = db.get_scheduled_post(&post_id).await.unwrap().unwrap();
    assert_eq!(post.status, PostStatus::Failed);
    assert!(post.error.is_some());

    let history = db.status_logs(&post_id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, PostStatus::Failed);
}
