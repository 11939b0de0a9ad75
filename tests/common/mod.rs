//! Shared fixtures for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use image_distributor::source::validate_s3_url;
use image_distributor::{
    Distributor, Error, ImageStore, Location, ManualClock, MemoryProvider, MemoryStore, NodeImage,
    ProviderRegistry, Reconciler, RecordingSink, ReferenceTracker, Result, RetentionPolicy,
    SourceResolver,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const IMAGE: &str = "flatcar-stable-3975.2.0-kube-1.30.4-tooling-1.18.1-gs";
pub const PROVIDER: &str = "capv";
pub const BUCKET_URL: &str = "https://node-images.s3.eu-central-1.amazonaws.com";

pub const HOUR: Duration = Duration::from_secs(3600);

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

// =============================================================================
// Source Double
// =============================================================================

/// Source resolver whose reachability is set by the test.
pub struct StaticSource {
    base: String,
    reachable: AtomicBool,
    probes: AtomicUsize,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::with_base(BUCKET_URL)
    }

    pub fn with_base(base: &str) -> Self {
        Self {
            base: base.to_string(),
            reachable: AtomicBool::new(true),
            probes: AtomicUsize::new(0),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceResolver for StaticSource {
    fn resolve_url(&self, key: &str) -> String {
        format!("{}/{}", self.base, key)
    }

    fn validate_url(&self, url: &str) -> Result<()> {
        validate_s3_url(url)
    }

    async fn probe(&self, url: &str, cancel: &CancellationToken) -> Result<bool> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled(format!("probe {}", url)));
        }
        self.probes.fetch_add(1, Ordering::SeqCst);
        Ok(self.reachable.load(Ordering::SeqCst))
    }
}

// =============================================================================
// Harness
// =============================================================================

/// A distributor wired to in-memory collaborators.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub provider: Arc<MemoryProvider>,
    pub source: Arc<StaticSource>,
    pub clock: Arc<ManualClock>,
    pub events: Arc<RecordingSink>,
    pub distributor: Distributor,
}

impl Harness {
    /// One `capv` provider over `locations`.
    pub fn new(retention: Duration, locations: &[&str]) -> Self {
        let provider = MemoryProvider::new(
            PROVIDER,
            locations.iter().map(|l| Location::new(*l)).collect(),
        );
        Self::with_parts(retention, provider, StaticSource::new())
    }

    pub fn with_parts(retention: Duration, provider: MemoryProvider, source: StaticSource) -> Self {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(provider);
        let source = Arc::new(source);
        let clock = Arc::new(ManualClock::new(start_time()));
        let events = Arc::new(RecordingSink::new());

        let mut registry = ProviderRegistry::new();
        registry.register(provider.clone());

        let tracker = ReferenceTracker::new(store.clone(), clock.clone(), events.clone());
        let reconciler = Reconciler::new(
            store.clone(),
            registry,
            source.clone(),
            RetentionPolicy::new(retention),
            clock.clone(),
            events.clone(),
        );
        let distributor = Distributor::new(store.clone(), tracker, reconciler, "stable");

        Self {
            store,
            provider,
            source,
            clock,
            events,
            distributor,
        }
    }

    pub async fn get(&self, name: &str) -> Option<NodeImage> {
        self.store.get(name).await.unwrap()
    }

    pub async fn reconcile(&self, name: &str) -> Result<image_distributor::ReconcileOutcome> {
        self.distributor
            .reconcile(name, &CancellationToken::new())
            .await
    }
}

// =============================================================================
// Store Double
// =============================================================================

/// Store that rejects the first `conflicts` updates with a version conflict.
pub struct ConflictingStore {
    inner: MemoryStore,
    remaining: AtomicUsize,
    pub updates: AtomicUsize,
}

impl ConflictingStore {
    pub fn new(conflicts: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            remaining: AtomicUsize::new(conflicts),
            updates: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ImageStore for ConflictingStore {
    async fn get(&self, name: &str) -> Result<Option<NodeImage>> {
        self.inner.get(name).await
    }

    async fn create(&self, image: NodeImage) -> Result<NodeImage> {
        self.inner.create(image).await
    }

    async fn update(&self, image: NodeImage) -> Result<NodeImage> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        let left = self.remaining.load(Ordering::SeqCst);
        if left > 0 {
            self.remaining.store(left - 1, Ordering::SeqCst);
            return Err(Error::Conflict {
                name: image.name().to_string(),
                expected: image.metadata.resource_version,
                actual: image.metadata.resource_version + 1,
            });
        }
        self.inner.update(image).await
    }

    async fn delete(&self, name: &str, expected_version: Option<u64>) -> Result<bool> {
        self.inner.delete(name, expected_version).await
    }

    async fn list(&self) -> Result<Vec<NodeImage>> {
        self.inner.list().await
    }
}

/// Store that yields to the scheduler around every read and write, so
/// concurrent read-modify-write cycles interleave.
pub struct YieldingStore {
    inner: MemoryStore,
}

impl YieldingStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
        }
    }
}

#[async_trait]
impl ImageStore for YieldingStore {
    async fn get(&self, name: &str) -> Result<Option<NodeImage>> {
        let image = self.inner.get(name).await;
        tokio::task::yield_now().await;
        image
    }

    async fn create(&self, image: NodeImage) -> Result<NodeImage> {
        tokio::task::yield_now().await;
        self.inner.create(image).await
    }

    async fn update(&self, image: NodeImage) -> Result<NodeImage> {
        tokio::task::yield_now().await;
        self.inner.update(image).await
    }

    async fn delete(&self, name: &str, expected_version: Option<u64>) -> Result<bool> {
        self.inner.delete(name, expected_version).await
    }

    async fn list(&self) -> Result<Vec<NodeImage>> {
        self.inner.list().await
    }
}
