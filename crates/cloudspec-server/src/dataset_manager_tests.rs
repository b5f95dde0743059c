use super::*;

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn fixture_db_bytes(marker: &str) -> Vec<u8> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fixture.sqlite3");
    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute_batch(&format!(
        "CREATE TABLE servers (vendor_id TEXT, api_reference TEXT, name TEXT, vcpus INTEGER, memory_amount INTEGER);
         CREATE TABLE server_prices (vendor_id TEXT, server_id TEXT, region_id TEXT, zone_id TEXT, allocation TEXT, price REAL, currency TEXT);
         INSERT INTO servers VALUES ('aws', 'm5.large', '{marker}', 2, 8192);
         INSERT INTO server_prices VALUES ('aws', 'm5.large', 'us-east-1', 'a', 'ondemand', 0.096, 'USD');
         INSERT INTO server_prices VALUES ('aws', 'm5.large', 'us-east-1', 'a', 'spot', 0.031, 'USD');"
    ))
    .unwrap();
    drop(conn);
    std::fs::read(&path).unwrap()
}

fn manager_options(root: &Path) -> DatasetOptions {
    DatasetOptions {
        data_dir: root.join("snapshots"),
        retention: 2,
        ..DatasetOptions::default()
    }
}

fn generation_dirs(root: &Path) -> usize {
    std::fs::read_dir(root.join("snapshots"))
        .unwrap()
        .flatten()
        .filter(|e| e.path().is_dir())
        .count()
}

#[tokio::test]
async fn first_load_publishes_a_queryable_generation() {
    let root = tempfile::tempdir().unwrap();
    let source = Arc::new(FakeArtifactSource::new(fixture_db_bytes("one"), "v1"));
    let manager = DatasetManager::new(source, manager_options(root.path())).unwrap();
    manager.load_initial().await.unwrap();

    let session = manager.session().await.unwrap();
    assert_eq!(session.snapshot().version(), "v1");
    let name: String = session
        .connection()
        .query_row("SELECT name FROM servers WHERE vendor_id='aws'", [], |row| {
            row.get(0)
        })
        .unwrap();
    assert_eq!(name, "one");

    // Augmentation ran before publish: the floor-price rollup is queryable
    // and ignores the spot row.
    let floor: f64 = session
        .connection()
        .query_row(
            "SELECT min_price FROM server_floor_prices WHERE vendor_id='aws' AND server_id='m5.large'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert!((floor - 0.096).abs() < 1e-9);
}

#[tokio::test]
async fn repeated_checks_fetch_only_when_the_version_changes() {
    let root = tempfile::tempdir().unwrap();
    let source = Arc::new(FakeArtifactSource::new(fixture_db_bytes("one"), "v1"));
    let manager =
        DatasetManager::new(Arc::clone(&source) as _, manager_options(root.path())).unwrap();
    manager.load_initial().await.unwrap();
    assert_eq!(source.fetch_calls.load(Ordering::Relaxed), 1);

    manager.refresh_now().await.unwrap();
    manager.refresh_now().await.unwrap();
    assert_eq!(source.fetch_calls.load(Ordering::Relaxed), 1);

    source.set_artifact(fixture_db_bytes("two"), "v2").await;
    manager.refresh_now().await.unwrap();
    assert_eq!(source.fetch_calls.load(Ordering::Relaxed), 2);
    assert_eq!(manager.snapshot().await.version(), "v2");
}

#[tokio::test]
async fn a_probe_blind_source_still_skips_unchanged_artifacts() {
    let root = tempfile::tempdir().unwrap();
    let source = Arc::new(FakeArtifactSource::new(fixture_db_bytes("one"), "v1"));
    source.set_probe_answers(false).await;
    let manager =
        DatasetManager::new(Arc::clone(&source) as _, manager_options(root.path())).unwrap();
    manager.load_initial().await.unwrap();

    // Without a fingerprint every check downloads, but an identical version
    // is still discarded instead of re-materialized.
    manager.refresh_now().await.unwrap();
    assert_eq!(source.fetch_calls.load(Ordering::Relaxed), 2);
    assert_eq!(generation_dirs(root.path()), 1);
}

#[tokio::test]
async fn old_generations_are_removed_once_unreferenced() {
    let root = tempfile::tempdir().unwrap();
    let source = Arc::new(FakeArtifactSource::new(fixture_db_bytes("one"), "v1"));
    let manager =
        DatasetManager::new(Arc::clone(&source) as _, manager_options(root.path())).unwrap();
    manager.load_initial().await.unwrap();

    for (marker, version) in [("two", "v2"), ("three", "v3"), ("four", "v4")] {
        source.set_artifact(fixture_db_bytes(marker), version).await;
        manager.refresh_now().await.unwrap();
    }
    assert_eq!(generation_dirs(root.path()), 2);
    assert_eq!(manager.snapshot().await.version(), "v4");
}

#[tokio::test]
async fn an_open_session_pins_its_generation_across_publishes() {
    let root = tempfile::tempdir().unwrap();
    let source = Arc::new(FakeArtifactSource::new(fixture_db_bytes("one"), "v1"));
    let manager =
        DatasetManager::new(Arc::clone(&source) as _, manager_options(root.path())).unwrap();
    manager.load_initial().await.unwrap();
    let session = manager.session().await.unwrap();

    for (marker, version) in [("two", "v2"), ("three", "v3"), ("four", "v4")] {
        source.set_artifact(fixture_db_bytes(marker), version).await;
        manager.refresh_now().await.unwrap();
    }

    // The pinned generation left the keep list but its directory survives
    // while the session is open.
    assert_eq!(generation_dirs(root.path()), 3);
    let name: String = session
        .connection()
        .query_row("SELECT name FROM servers", [], |row| row.get(0))
        .unwrap();
    assert_eq!(name, "one");

    drop(session);
    assert_eq!(generation_dirs(root.path()), 2);
}

#[tokio::test]
async fn a_failed_fetch_keeps_the_previous_generation_live() {
    let root = tempfile::tempdir().unwrap();
    let source = Arc::new(FakeArtifactSource::new(fixture_db_bytes("one"), "v1"));
    let manager =
        DatasetManager::new(Arc::clone(&source) as _, manager_options(root.path())).unwrap();
    manager.load_initial().await.unwrap();

    source.set_artifact(fixture_db_bytes("two"), "v2").await;
    source.set_fail_fetch(true).await;
    assert!(manager.refresh_now().await.is_err());
    assert_eq!(manager.snapshot().await.version(), "v1");

    source.set_fail_fetch(false).await;
    manager.refresh_now().await.unwrap();
    assert_eq!(manager.snapshot().await.version(), "v2");
}

#[tokio::test]
async fn a_corrupt_artifact_never_replaces_a_good_generation() {
    let root = tempfile::tempdir().unwrap();
    let source = Arc::new(FakeArtifactSource::new(fixture_db_bytes("one"), "v1"));
    let manager =
        DatasetManager::new(Arc::clone(&source) as _, manager_options(root.path())).unwrap();
    manager.load_initial().await.unwrap();

    source.set_artifact(b"not a database".to_vec(), "v2").await;
    assert!(manager.refresh_now().await.is_err());

    let health = manager.health().await;
    assert!(health.ready);
    assert_eq!(health.version_hash.as_deref(), Some("v1"));
    // The aborted generation's directory was cleaned up.
    assert_eq!(generation_dirs(root.path()), 1);

    let session = manager.session().await.unwrap();
    assert_eq!(session.snapshot().version(), "v1");
}

#[tokio::test]
async fn health_reports_version_and_freshness_once_ready() {
    let root = tempfile::tempdir().unwrap();
    let source = Arc::new(FakeArtifactSource::new(fixture_db_bytes("one"), "v1"));
    let manager = DatasetManager::new(source, manager_options(root.path())).unwrap();

    let before = manager.health().await;
    assert!(!before.ready);
    assert!(before.version_hash.is_none());

    manager.load_initial().await.unwrap();
    let after = manager.health().await;
    assert!(after.ready);
    assert_eq!(after.version_hash.as_deref(), Some("v1"));
    assert!(after.last_updated.is_some());
}

#[tokio::test]
async fn startup_sweeps_generations_left_by_a_dead_process() {
    let root = tempfile::tempdir().unwrap();
    let stale = root.path().join("snapshots").join("gen-000041");
    std::fs::create_dir_all(&stale).unwrap();
    std::fs::write(stale.join("dataset.sqlite3"), b"leftover").unwrap();

    let source = Arc::new(FakeArtifactSource::new(fixture_db_bytes("one"), "v1"));
    let manager = DatasetManager::new(source, manager_options(root.path())).unwrap();
    manager.load_initial().await.unwrap();

    assert_eq!(generation_dirs(root.path()), 1);
    assert!(!stale.exists());
}
