//! Integration tests for `cross-queue tokens`

use assert_cmd::Command;
use chrono::{Duration, Utc};
use libcrosscast::{Database, Platform, Profile};
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Config whose Twitter endpoint refuses connections, so a refresh fails
/// as a network error without leaving the machine
async fn setup_test_env() -> (TempDir, String, Database) {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.toml");
    let db_path = temp_dir.path().join("crosscast.db");

    let config_content = format!(
        r#"
[database]
path = "{}"

[tokens]
threshold_hours = 24
inter_call_delay_ms = 0

[platforms.twitter]
api_base = "http://127.0.0.1:9"
client_id = "client"
client_secret = "secret"
timeout_secs = 2
"#,
        db_path.to_string_lossy().replace('\\', "\\\\")
    );
    fs::write(&config_path, config_content).unwrap();

    let db = Database::new(&db_path.to_string_lossy()).await.unwrap();
    (temp_dir, config_path.to_string_lossy().to_string(), db)
}

async fn create_profile(db: &Database, expires_in: Duration) -> Profile {
    let profile = Profile::new(
        "user-1",
        Platform::Twitter,
        "acct-1",
        "access",
        Some("refresh"),
        Some(Utc::now() + expires_in),
    );
    db.create_profile(&profile).await.unwrap();
    profile
}

fn cross_queue(config_path: &str) -> Command {
    let mut cmd = Command::cargo_bin("cross-queue").unwrap();
    cmd.env("CROSSCAST_CONFIG", config_path)
        .env_remove("CROSSCAST_DB_PATH");
    cmd
}

#[tokio::test]
async fn test_tokens_status_lists_only_expiring_profiles() {
    let (_temp_dir, config_path, db) = setup_test_env().await;
    let soon = create_profile(&db, Duration::hours(23)).await;
    let later = create_profile(&db, Duration::hours(25)).await;

    let output = cross_queue(&config_path)
        .args(["tokens", "status", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let ids: Vec<&str> = json
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["profileId"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec![soon.id.as_str()]);
    assert!(!ids.contains(&later.id.as_str()));
}

#[tokio::test]
async fn test_tokens_status_text_when_nothing_expires() {
    let (_temp_dir, config_path, _db) = setup_test_env().await;

    cross_queue(&config_path)
        .args(["tokens", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No tokens expiring"));
}

#[tokio::test]
async fn test_tokens_refresh_network_failure_keeps_profile_active() {
    let (_temp_dir, config_path, db) = setup_test_env().await;
    let profile = create_profile(&db, Duration::hours(2)).await;

    let output = cross_queue(&config_path)
        .args(["tokens", "refresh", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["total"], 1);
    assert_eq!(json["failed"], 1);
    assert_eq!(json["outcomes"][0]["outcome"]["result"], "failed");
    assert_eq!(json["outcomes"][0]["outcome"]["kind"], "network");

    let stored = db.get_profile(&profile.id).await.unwrap().unwrap();
    assert!(stored.is_active);
}
