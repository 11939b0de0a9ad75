//! Tests for reference tracking.
//!
//! Validates set semantics of the consumer list, create-on-first-reference,
//! retention cancellation, and that no reference is lost under concurrent
//! or conflicting writes.

mod common;

use common::{ConflictingStore, Harness, IMAGE, PROVIDER, YieldingStore};
use image_distributor::{
    Error, ImageStore, ManualClock, NodeImageSpec, NodeImageState, ReconcileEvent, RecordingSink,
    ReferenceTracker, ReleaseComponent, ReleaseDescriptor, MAX_CONFLICT_RETRIES,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn spec() -> NodeImageSpec {
    NodeImageSpec {
        name: IMAGE.to_string(),
        provider: PROVIDER.to_string(),
    }
}

fn release(name: &str) -> ReleaseDescriptor {
    ReleaseDescriptor {
        name: name.to_string(),
        components: vec![
            ReleaseComponent {
                name: "flatcar".to_string(),
                version: "3975.2.0".to_string(),
            },
            ReleaseComponent {
                name: "kubernetes".to_string(),
                version: "v1.30.4".to_string(),
            },
            ReleaseComponent {
                name: "os-tooling".to_string(),
                version: "v1.18.1".to_string(),
            },
        ],
    }
}

// =============================================================================
// Set Semantics
// =============================================================================

#[tokio::test]
async fn test_releases_track_added_minus_removed() {
    let h = Harness::new(Duration::ZERO, &["dc1"]);
    let d = &h.distributor;

    d.on_consumer_added("a", IMAGE, PROVIDER).await.unwrap();
    d.on_consumer_added("a", IMAGE, PROVIDER).await.unwrap();
    d.on_consumer_added("b", IMAGE, PROVIDER).await.unwrap();
    d.on_consumer_removed("a", IMAGE).await.unwrap();
    d.on_consumer_removed("a", IMAGE).await.unwrap();
    d.on_consumer_removed("c", IMAGE).await.unwrap();
    d.on_consumer_added("c", IMAGE, PROVIDER).await.unwrap();

    let image = h.get(IMAGE).await.unwrap();
    let releases: BTreeSet<_> = image.status.releases.iter().cloned().collect();
    assert_eq!(releases, BTreeSet::from(["b".to_string(), "c".to_string()]));
    assert_eq!(image.status.releases.len(), 2);
}

#[tokio::test]
async fn test_duplicate_add_does_not_write() {
    let h = Harness::new(Duration::ZERO, &["dc1"]);
    let first = h
        .distributor
        .on_consumer_added("a", IMAGE, PROVIDER)
        .await
        .unwrap();
    let second = h
        .distributor
        .on_consumer_added("a", IMAGE, PROVIDER)
        .await
        .unwrap();
    assert_eq!(
        first.metadata.resource_version,
        second.metadata.resource_version
    );
}

#[tokio::test]
async fn test_remove_on_absent_record_is_noop() {
    let h = Harness::new(Duration::ZERO, &["dc1"]);
    let result = h
        .distributor
        .on_consumer_removed("a", IMAGE)
        .await
        .unwrap();
    assert!(result.is_none());
    assert!(h.get(IMAGE).await.is_none());
}

#[tokio::test]
async fn test_last_removal_keeps_record() {
    let h = Harness::new(Duration::ZERO, &["dc1"]);
    h.distributor
        .on_consumer_added("a", IMAGE, PROVIDER)
        .await
        .unwrap();
    h.distributor.on_consumer_removed("a", IMAGE).await.unwrap();

    let image = h.get(IMAGE).await.unwrap();
    assert!(image.status.releases.is_empty());
    assert_eq!(image.state(), Some(NodeImageState::Pending));
}

// =============================================================================
// Creation and Cancellation
// =============================================================================

#[tokio::test]
async fn test_first_reference_creates_record() {
    let h = Harness::new(Duration::ZERO, &["dc1"]);
    let image = h
        .distributor
        .on_consumer_added("a", IMAGE, PROVIDER)
        .await
        .unwrap();

    assert_eq!(image.spec, spec());
    assert_eq!(image.state(), Some(NodeImageState::Pending));
    assert!(h.events.events().iter().any(|e| matches!(
        e,
        ReconcileEvent::RecordCreated { provider, .. } if provider == PROVIDER
    )));
}

#[tokio::test]
async fn test_rereference_clears_retention() {
    let h = Harness::new(Duration::ZERO, &["dc1"]);
    h.distributor
        .on_consumer_added("a", IMAGE, PROVIDER)
        .await
        .unwrap();
    h.distributor.on_consumer_removed("a", IMAGE).await.unwrap();

    // Put the record into a retention window by hand.
    let mut image = h.get(IMAGE).await.unwrap();
    image.status.state = Some(NodeImageState::AwaitingDeletion);
    image.set_last_used_at(common::start_time());
    h.store.update(image).await.unwrap();

    let image = h
        .distributor
        .on_consumer_added("b", IMAGE, PROVIDER)
        .await
        .unwrap();

    assert_eq!(image.state(), Some(NodeImageState::Pending));
    assert!(image.last_used_at().is_none());
    assert_eq!(image.status.releases, vec!["b".to_string()]);
}

#[tokio::test]
async fn test_provider_mismatch_rejected() {
    let h = Harness::new(Duration::ZERO, &["dc1"]);
    h.distributor
        .on_consumer_added("a", IMAGE, PROVIDER)
        .await
        .unwrap();

    let err = h
        .distributor
        .on_consumer_added("b", IMAGE, "capvcd")
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ProviderMismatch { .. }));
    assert_eq!(
        h.get(IMAGE).await.unwrap().status.releases,
        vec!["a".to_string()]
    );
}

#[tokio::test]
async fn test_invalid_consumer_rejected() {
    let h = Harness::new(Duration::ZERO, &["dc1"]);
    let err = h
        .distributor
        .on_consumer_added("Not Valid", IMAGE, PROVIDER)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidConsumerId { .. }));
    assert!(h.get(IMAGE).await.is_none());
}

#[tokio::test]
async fn test_release_feed_uses_provider_prefixed_record() {
    let h = Harness::new(Duration::ZERO, &["dc1"]);
    let image = h
        .distributor
        .on_release_added(&release("vsphere-30.1.0"))
        .await
        .unwrap();

    assert_eq!(image.name(), format!("capv-{}", IMAGE));
    assert_eq!(image.spec, spec());
    assert_eq!(image.status.releases, vec!["vsphere-30.1.0".to_string()]);

    let image = h
        .distributor
        .on_release_removed(&release("vsphere-30.1.0"))
        .await
        .unwrap()
        .unwrap();
    assert!(image.status.releases.is_empty());
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_interleaved_adds_and_removes_are_not_lost() {
    // Five writers: each can lose at most four races, below the retry bound.
    for _ in 0..20 {
        let store = Arc::new(YieldingStore::new());
        let tracker = Arc::new(ReferenceTracker::new(
            store.clone(),
            Arc::new(ManualClock::new(common::start_time())),
            Arc::new(RecordingSink::new()),
        ));
        tracker.add_reference(IMAGE, &spec(), "old-1").await.unwrap();
        tracker.add_reference(IMAGE, &spec(), "old-2").await.unwrap();

        let mut tasks = tokio::task::JoinSet::new();
        for consumer in ["new-1", "new-2", "new-3"] {
            let tracker = tracker.clone();
            tasks.spawn(async move {
                tracker.add_reference(IMAGE, &spec(), consumer).await.map(|_| ())
            });
        }
        for consumer in ["old-1", "old-2"] {
            let tracker = tracker.clone();
            tasks.spawn(async move {
                tracker.remove_reference(IMAGE, consumer).await.map(|_| ())
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }

        let image = store.get(IMAGE).await.unwrap().unwrap();
        let releases: BTreeSet<_> = image.status.releases.iter().cloned().collect();
        assert_eq!(
            releases,
            BTreeSet::from([
                "new-1".to_string(),
                "new-2".to_string(),
                "new-3".to_string()
            ])
        );
        assert_eq!(image.status.releases.len(), 3);
    }
}

#[tokio::test]
async fn test_conflicting_writes_are_retried() {
    let store = Arc::new(ConflictingStore::new(2));
    let tracker = ReferenceTracker::new(
        store.clone(),
        Arc::new(ManualClock::new(common::start_time())),
        Arc::new(RecordingSink::new()),
    );

    let image = tracker.add_reference(IMAGE, &spec(), "a").await.unwrap();

    assert_eq!(image.status.releases, vec!["a".to_string()]);
    assert_eq!(store.updates.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_conflict_exhaustion_is_transient() {
    let store = Arc::new(ConflictingStore::new(usize::MAX));
    let tracker = ReferenceTracker::new(
        store.clone(),
        Arc::new(ManualClock::new(common::start_time())),
        Arc::new(RecordingSink::new()),
    );

    let err = tracker.add_reference(IMAGE, &spec(), "a").await.unwrap_err();

    assert!(matches!(
        err,
        Error::ConflictRetriesExhausted { attempts, .. } if attempts == MAX_CONFLICT_RETRIES
    ));
    assert!(err.is_retryable());
    assert!(store.get(IMAGE).await.unwrap().unwrap().status.releases.is_empty());
}
