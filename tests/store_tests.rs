//! Tests for the record stores.
//!
//! Validates optimistic versioning, atomic file persistence, and the
//! conflict retry helper against both backends.

mod common;

use chrono::Utc;
use common::{ConflictingStore, IMAGE, PROVIDER};
use image_distributor::{
    Error, ErrorKind, FileStore, ImageStore, MemoryStore, NodeImage, NodeImageSpec, NodeImageState,
    retry_on_conflict,
};
use std::sync::atomic::Ordering;
use tempfile::TempDir;

fn image(name: &str) -> NodeImage {
    NodeImage::new(
        name,
        NodeImageSpec {
            name: IMAGE.to_string(),
            provider: PROVIDER.to_string(),
        },
        Utc::now(),
    )
}

fn file_store() -> (TempDir, FileStore) {
    let dir = TempDir::new().unwrap();
    let store = FileStore::with_path(dir.path().join("images")).unwrap();
    (dir, store)
}

// =============================================================================
// Versioning
// =============================================================================

async fn check_versioning(store: &dyn ImageStore) {
    let created = store.create(image("a")).await.unwrap();
    assert_eq!(created.metadata.resource_version, 1);

    let err = store.create(image("a")).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)));

    let mut first = created.clone();
    first.add_release("r1");
    let stored = store.update(first).await.unwrap();
    assert_eq!(stored.metadata.resource_version, 2);

    // A writer holding the old copy loses.
    let mut stale = created;
    stale.add_release("r2");
    let err = store.update(stale).await.unwrap_err();
    assert!(matches!(err, Error::Conflict { expected: 1, actual: 2, .. }));
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let current = store.get("a").await.unwrap().unwrap();
    assert_eq!(current.status.releases, vec!["r1".to_string()]);
}

#[tokio::test]
async fn test_memory_store_versioning() {
    check_versioning(&MemoryStore::new()).await;
}

#[tokio::test]
async fn test_file_store_versioning() {
    let (_dir, store) = file_store();
    check_versioning(&store).await;
}

#[tokio::test]
async fn test_update_of_absent_record() {
    let store = MemoryStore::new();
    let err = store.update(image("ghost")).await.unwrap_err();
    assert!(matches!(err, Error::ImageNotFound(_)));
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

// =============================================================================
// Deletion
// =============================================================================

#[tokio::test]
async fn test_file_store_delete_checks_version() {
    let (_dir, store) = file_store();
    let created = store.create(image("a")).await.unwrap();
    let mut changed = created.clone();
    changed.status.state = Some(NodeImageState::Available);
    store.update(changed).await.unwrap();

    let err = store.delete("a", Some(1)).await.unwrap_err();
    assert!(matches!(err, Error::Conflict { .. }));
    assert!(store.get("a").await.unwrap().is_some());

    assert!(store.delete("a", Some(2)).await.unwrap());
    assert!(store.get("a").await.unwrap().is_none());
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let (_dir, store) = file_store();
    store.create(image("a")).await.unwrap();
    assert!(store.delete("a", None).await.unwrap());
    assert!(!store.delete("a", None).await.unwrap());
    assert!(!store.delete("a", Some(7)).await.unwrap());
}

// =============================================================================
// Persistence
// =============================================================================

#[tokio::test]
async fn test_file_store_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("images");
    {
        let store = FileStore::with_path(root.clone()).unwrap();
        let mut created = store.create(image("b")).await.unwrap();
        created.add_release("r1");
        created.set_last_used_at(Utc::now());
        store.update(created).await.unwrap();
        store.create(image("a")).await.unwrap();
    }

    let store = FileStore::with_path(root).unwrap();
    let all = store.list().await.unwrap();
    let names: Vec<_> = all.iter().map(|i| i.name().to_string()).collect();
    assert_eq!(names, vec!["a", "b"]);
    assert_eq!(all[1].status.releases, vec!["r1".to_string()]);
    assert!(all[1].last_used_at().is_some());
}

#[tokio::test]
async fn test_file_store_leaves_no_temp_files() {
    let (dir, store) = file_store();
    let created = store.create(image("a")).await.unwrap();
    store.update(created).await.unwrap();

    let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("images"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.contains(".tmp."))
        .collect();
    assert!(leftovers.is_empty(), "temp files left: {:?}", leftovers);
}

#[tokio::test]
async fn test_file_store_skips_corrupt_records() {
    let (dir, store) = file_store();
    store.create(image("good")).await.unwrap();
    std::fs::write(dir.path().join("images").join("bad.json"), b"{not json").unwrap();
    std::fs::write(dir.path().join("images").join("notes.txt"), b"ignored").unwrap();

    let all = store.list().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].name(), "good");
}

#[tokio::test]
async fn test_file_store_rejects_bad_names() {
    let (_dir, store) = file_store();
    assert!(matches!(
        store.get("../escape").await.unwrap_err(),
        Error::InvalidImageName { .. }
    ));
    assert!(store.create(image("Upper")).await.is_err());
}

// =============================================================================
// Conflict Retry
// =============================================================================

#[tokio::test]
async fn test_retry_on_conflict_recovers() {
    let store = ConflictingStore::new(4);
    store.create(image("a")).await.unwrap();

    let updated = retry_on_conflict(&store, "a", |img| Ok(img.add_release("r1")))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(updated.status.releases, vec!["r1".to_string()]);
    assert_eq!(store.updates.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_retry_on_conflict_exhausts() {
    let store = ConflictingStore::new(5);
    store.create(image("a")).await.unwrap();

    let err = retry_on_conflict(&store, "a", |img| Ok(img.add_release("r1")))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ConflictRetriesExhausted { .. }));
    assert_eq!(err.kind(), ErrorKind::Transient);
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_retry_on_conflict_propagates_mutation_error() {
    let store = MemoryStore::new();
    store.create(image("a")).await.unwrap();

    let err = retry_on_conflict(&store, "a", |_| Err(Error::Internal("nope".to_string())))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Internal(_)));
    let current = store.get("a").await.unwrap().unwrap();
    assert_eq!(current.metadata.resource_version, 1);
}
