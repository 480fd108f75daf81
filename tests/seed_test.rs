//! Queueing and dispatch of seed operations.

mod common;

use common::{options, RecordingSeeder, Stub, StubDriver};
use std::path::PathBuf;
use std::time::Duration;
use throwaway_db::{Error, SeedOperation, ThrowawayDb};

#[tokio::test]
async fn test_operations_before_serving_are_queued_then_applied() {
    let root = tempfile::tempdir().unwrap();
    let seeder = RecordingSeeder::new();
    let db = ThrowawayDb::builder()
        .options(options(Stub::Healthy, root.path()))
        .client_driver(StubDriver::new())
        .seeder(seeder.clone())
        .build()
        .unwrap();

    db.create_db("app").await.unwrap();
    db.load_data_from_file("json", "/fixtures/users.json")
        .await
        .unwrap();
    assert!(seeder.applied().is_empty(), "nothing applied before serving");

    db.start().ready().await.unwrap();

    assert_eq!(
        seeder.applied(),
        vec![
            SeedOperation::CreateDb("app".to_string()),
            SeedOperation::LoadFile {
                kind: "json".to_string(),
                path: PathBuf::from("/fixtures/users.json"),
            },
        ]
    );
    assert!(db.seed_failures().is_empty());
    db.stop().await.unwrap();
}

#[tokio::test]
async fn test_operations_while_serving_apply_immediately() {
    let root = tempfile::tempdir().unwrap();
    let seeder = RecordingSeeder::new();
    let db = ThrowawayDb::builder()
        .options(options(Stub::Healthy, root.path()))
        .client_driver(StubDriver::new())
        .seeder(seeder.clone())
        .build()
        .unwrap();
    db.start().ready().await.unwrap();

    db.create_db("a")
        .await
        .unwrap()
        .delete_db("b")
        .await
        .unwrap();

    assert_eq!(
        seeder.applied(),
        vec![
            SeedOperation::CreateDb("a".to_string()),
            SeedOperation::DeleteDb("b".to_string()),
        ]
    );
    db.stop().await.unwrap();
}

#[tokio::test]
async fn test_default_seeder_rejects_when_serving() {
    let root = tempfile::tempdir().unwrap();
    let db = ThrowawayDb::builder()
        .options(options(Stub::Healthy, root.path()))
        .client_driver(StubDriver::new())
        .build()
        .unwrap();
    db.start().ready().await.unwrap();

    let err = db.create_db("app").await.unwrap_err();
    assert!(matches!(err, Error::SeedUnsupported(_)));
    assert!(err.with_suggestion().contains("Hint:"));
    db.stop().await.unwrap();
}

#[tokio::test]
async fn test_queued_failures_are_recorded_not_fatal() {
    let root = tempfile::tempdir().unwrap();
    let db = ThrowawayDb::builder()
        .options(options(Stub::Healthy, root.path()))
        .client_driver(StubDriver::new())
        .build()
        .unwrap();

    db.delete_db("legacy").await.unwrap();
    db.start().ready().await.unwrap();

    let failures = db.seed_failures();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].contains("legacy"));
    assert!(db.connection().is_some(), "instance keeps serving");
    db.stop().await.unwrap();
}

#[tokio::test]
async fn test_operations_after_failure_are_rejected() {
    let root = tempfile::tempdir().unwrap();
    let opts = options(Stub::NeverReady, root.path())
        .with_sentinel_timeout(Duration::from_millis(300));
    let db = ThrowawayDb::builder()
        .options(opts)
        .client_driver(StubDriver::new())
        .build()
        .unwrap();

    assert!(db.start().ready().await.is_err());

    let err = db.load_data_from_file("json", "/x.json").await.unwrap_err();
    assert!(matches!(err, Error::NotServing(ref state) if state == "failed"));
}

#[tokio::test]
async fn test_queued_operations_are_reported_when_start_fails() {
    let root = tempfile::tempdir().unwrap();
    let opts = options(Stub::NeverReady, root.path())
        .with_sentinel_timeout(Duration::from_millis(300));
    let seeder = RecordingSeeder::new();
    let db = ThrowawayDb::builder()
        .options(opts)
        .client_driver(StubDriver::new())
        .seeder(seeder.clone())
        .build()
        .unwrap();

    db.create_db("app").await.unwrap();
    assert!(db.start().ready().await.is_err());

    let failures = db.seed_failures();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].contains("create database 'app'"));
    assert!(failures[0].contains("not applied"));
    assert!(seeder.applied().is_empty());
}

#[tokio::test]
async fn test_queued_operations_are_reported_when_start_is_cancelled() {
    let root = tempfile::tempdir().unwrap();
    let db = ThrowawayDb::builder()
        .options(options(Stub::SlowInit, root.path()))
        .client_driver(StubDriver::new())
        .build()
        .unwrap();

    db.load_data_from_file("json", "/fixtures/users.json")
        .await
        .unwrap();
    let handle = db.start();
    tokio::time::sleep(Duration::from_millis(200)).await;
    db.stop().await.unwrap();
    assert!(handle.ready().await.is_err());

    let failures = db.seed_failures();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].contains("not applied"));
}
