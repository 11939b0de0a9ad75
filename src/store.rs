//! # Node Image Persistence
//!
//! Versioned storage for [`NodeImage`] records with optimistic concurrency.
//!
//! ## Versioning
//!
//! Every record carries `metadata.resource_version`. A write succeeds only
//! when the caller's copy has the version currently stored; the store then
//! bumps it. A stale copy is rejected with [`Error::Conflict`] and the caller
//! re-reads:
//!
//! ```text
//!   get() ──▶ mutate ──▶ update(v) ──┬──▶ ok (v+1)
//!     ▲                              │
//!     └──────── Conflict ◀───────────┘   (at most MAX_CONFLICT_RETRIES)
//! ```
//!
//! [`retry_on_conflict`] wraps that loop. Exhaustion surfaces as
//! [`Error::ConflictRetriesExhausted`], a transient error.
//!
//! ## Backends
//!
//! | Backend       | Durability          | Use                       |
//! |---------------|---------------------|---------------------------|
//! | [`MemoryStore`] | process lifetime  | tests, embedding          |
//! | [`FileStore`]   | one JSON file per record, atomic writes | CLI |

use crate::constants::{MAX_CONFLICT_RETRIES, RECORD_EXTENSION, STATE_DIR};
use crate::error::{Error, Result};
use crate::nodeimage::{NodeImage, validate_image_name};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

// =============================================================================
// Store Trait
// =============================================================================

/// Persistence backend for node image records.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Reads a record. `None` if it does not exist.
    async fn get(&self, name: &str) -> Result<Option<NodeImage>>;

    /// Creates a record. Fails with [`Error::AlreadyExists`] if the name is
    /// taken. Returns the stored copy (version 1).
    async fn create(&self, image: NodeImage) -> Result<NodeImage>;

    /// Replaces a record if its version matches the stored one.
    ///
    /// Returns the stored copy with the bumped version.
    async fn update(&self, image: NodeImage) -> Result<NodeImage>;

    /// Removes a record.
    ///
    /// With `expected_version`, the removal is rejected with
    /// [`Error::Conflict`] when the stored version differs. Removing an
    /// absent record succeeds and returns `false`.
    async fn delete(&self, name: &str, expected_version: Option<u64>) -> Result<bool>;

    /// Lists all records, sorted by name.
    async fn list(&self) -> Result<Vec<NodeImage>>;
}

/// Applies `mutate` to the current copy of `name` and writes it back,
/// re-reading on conflicts.
///
/// `mutate` returns `Ok(true)` if it changed the record. Unchanged records
/// are not written. Returns `None` if the record does not exist.
pub async fn retry_on_conflict<F>(
    store: &dyn ImageStore,
    name: &str,
    mut mutate: F,
) -> Result<Option<NodeImage>>
where
    F: FnMut(&mut NodeImage) -> Result<bool> + Send,
{
    for attempt in 1..=MAX_CONFLICT_RETRIES {
        let Some(mut image) = store.get(name).await? else {
            return Ok(None);
        };

        if !mutate(&mut image)? {
            return Ok(Some(image));
        }

        match store.update(image).await {
            Ok(stored) => return Ok(Some(stored)),
            Err(Error::Conflict {
                expected, actual, ..
            }) => {
                debug!(
                    "Conflict updating {} (attempt {}/{}): have v{}, stored v{}",
                    name, attempt, MAX_CONFLICT_RETRIES, expected, actual
                );
            }
            // Deleted between read and write.
            Err(Error::ImageNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        }
    }

    warn!(
        "Giving up on {} after {} conflicting writes",
        name, MAX_CONFLICT_RETRIES
    );
    Err(Error::ConflictRetriesExhausted {
        name: name.to_string(),
        attempts: MAX_CONFLICT_RETRIES,
    })
}

// =============================================================================
// Memory Store
// =============================================================================

/// In-memory record store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, NodeImage>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(e: std::sync::PoisonError<T>) -> Error {
    Error::Internal(format!("lock poisoned: {}", e))
}

#[async_trait]
impl ImageStore for MemoryStore {
    async fn get(&self, name: &str) -> Result<Option<NodeImage>> {
        let records = self.records.read().map_err(poisoned)?;
        Ok(records.get(name).cloned())
    }

    async fn create(&self, mut image: NodeImage) -> Result<NodeImage> {
        let mut records = self.records.write().map_err(poisoned)?;
        if records.contains_key(image.name()) {
            return Err(Error::AlreadyExists(image.name().to_string()));
        }
        image.metadata.resource_version = 1;
        records.insert(image.name().to_string(), image.clone());
        Ok(image)
    }

    async fn update(&self, mut image: NodeImage) -> Result<NodeImage> {
        let mut records = self.records.write().map_err(poisoned)?;
        let Some(current) = records.get_mut(image.name()) else {
            return Err(Error::ImageNotFound(image.name().to_string()));
        };
        check_version(image.name(), image.metadata.resource_version, current)?;
        image.metadata.resource_version = current.metadata.resource_version + 1;
        *current = image.clone();
        Ok(image)
    }

    async fn delete(&self, name: &str, expected_version: Option<u64>) -> Result<bool> {
        let mut records = self.records.write().map_err(poisoned)?;
        let Some(current) = records.get(name) else {
            return Ok(false);
        };
        if let Some(expected) = expected_version {
            check_version(name, expected, current)?;
        }
        records.remove(name);
        Ok(true)
    }

    async fn list(&self) -> Result<Vec<NodeImage>> {
        let records = self.records.read().map_err(poisoned)?;
        let mut all: Vec<_> = records.values().cloned().collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(all)
    }
}

fn check_version(name: &str, expected: u64, current: &NodeImage) -> Result<()> {
    if current.metadata.resource_version != expected {
        return Err(Error::Conflict {
            name: name.to_string(),
            expected,
            actual: current.metadata.resource_version,
        });
    }
    Ok(())
}

// =============================================================================
// File Store
// =============================================================================

/// File-backed record store.
///
/// Layout:
///
/// ```text
/// <root>/
/// ├── capv-flatcar-stable-3975.2.0-kube-1.30.4-tooling-1.18.1-gs.json
/// └── capvcd-flatcar-stable-3975.2.0-kube-1.30.4-tooling-1.18.1-gs.json
/// ```
///
/// Writes go to a uniquely named temp file and are renamed into place, so a
/// crash never leaves a half-written record. Version checks and writes run
/// under one process-wide lock; the store is not meant to be shared between
/// processes.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Creates a store at the default location.
    pub fn new() -> Result<Self> {
        Self::with_path(Self::default_path())
    }

    /// Creates a store rooted at `root`, creating the directory if needed.
    pub fn with_path(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root).map_err(|e| Error::StoreFailed {
            path: root.clone(),
            reason: e.to_string(),
        })?;

        info!("Node image store initialized at: {}", root.display());

        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    /// Returns the default store path.
    pub fn default_path() -> PathBuf {
        match dirs::data_local_dir() {
            Some(data) => data.join(STATE_DIR).join("images"),
            None => PathBuf::from(".").join(STATE_DIR).join("images"),
        }
    }

    fn record_path(&self, name: &str) -> Result<PathBuf> {
        // Names are DNS-1123 subdomains, which rules out path separators.
        validate_image_name(name)?;
        Ok(self.root.join(format!("{}.{}", name, RECORD_EXTENSION)))
    }

    fn read_record(&self, path: &Path) -> Result<Option<NodeImage>> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::StoreFailed {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                });
            }
        };
        Ok(Some(serde_json::from_slice(&data)?))
    }

    fn write_record(&self, path: &Path, image: &NodeImage) -> Result<()> {
        let data = serde_json::to_vec_pretty(image)?;
        let temp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::now_v7()));
        fs::write(&temp_path, &data).map_err(|e| Error::StoreFailed {
            path: temp_path.clone(),
            reason: e.to_string(),
        })?;
        fs::rename(&temp_path, path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            Error::StoreFailed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
        })?;
        debug!(
            "Wrote {} (v{}, {} bytes)",
            path.display(),
            image.metadata.resource_version,
            data.len()
        );
        Ok(())
    }
}

#[async_trait]
impl ImageStore for FileStore {
    async fn get(&self, name: &str) -> Result<Option<NodeImage>> {
        let path = self.record_path(name)?;
        self.read_record(&path)
    }

    async fn create(&self, mut image: NodeImage) -> Result<NodeImage> {
        let path = self.record_path(image.name())?;
        let _guard = self.write_lock.lock().map_err(poisoned)?;
        if path.exists() {
            return Err(Error::AlreadyExists(image.name().to_string()));
        }
        image.metadata.resource_version = 1;
        self.write_record(&path, &image)?;
        Ok(image)
    }

    async fn update(&self, mut image: NodeImage) -> Result<NodeImage> {
        let path = self.record_path(image.name())?;
        let _guard = self.write_lock.lock().map_err(poisoned)?;
        let Some(current) = self.read_record(&path)? else {
            return Err(Error::ImageNotFound(image.name().to_string()));
        };
        check_version(image.name(), image.metadata.resource_version, &current)?;
        image.metadata.resource_version = current.metadata.resource_version + 1;
        self.write_record(&path, &image)?;
        Ok(image)
    }

    async fn delete(&self, name: &str, expected_version: Option<u64>) -> Result<bool> {
        let path = self.record_path(name)?;
        let _guard = self.write_lock.lock().map_err(poisoned)?;
        let Some(current) = self.read_record(&path)? else {
            return Ok(false);
        };
        if let Some(expected) = expected_version {
            check_version(name, expected, &current)?;
        }
        fs::remove_file(&path).map_err(|e| Error::StoreFailed {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        Ok(true)
    }

    async fn list(&self) -> Result<Vec<NodeImage>> {
        let entries = fs::read_dir(&self.root).map_err(|e| Error::StoreFailed {
            path: self.root.clone(),
            reason: e.to_string(),
        })?;

        let mut all = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            match self.read_record(&path) {
                Ok(Some(image)) => all.push(image),
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable record {}: {}", path.display(), e),
            }
        }
        all.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodeimage::NodeImageSpec;
    use chrono::Utc;
    use tempfile::TempDir;

    fn image(name: &str) -> NodeImage {
        NodeImage::new(
            name,
            NodeImageSpec {
                name: name.to_string(),
                provider: "capv".to_string(),
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_memory_store_rejects_stale_update() {
        let store = MemoryStore::new();
        let created = store.create(image("flatcar")).await.unwrap();
        assert_eq!(created.metadata.resource_version, 1);

        let mut first = created.clone();
        first.add_release("v1");
        let stored = store.update(first).await.unwrap();
        assert_eq!(stored.metadata.resource_version, 2);

        let mut stale = created;
        stale.add_release("v2");
        let err = store.update(stale).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { expected: 1, actual: 2, .. }));
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::with_path(temp.path().to_path_buf()).unwrap();

        store.create(image("flatcar")).await.unwrap();
        let loaded = store.get("flatcar").await.unwrap().unwrap();
        assert_eq!(loaded.metadata.resource_version, 1);
        assert!(temp.path().join("flatcar.json").exists());

        assert!(store.delete("flatcar", Some(1)).await.unwrap());
        assert!(store.get("flatcar").await.unwrap().is_none());
        assert!(!store.delete("flatcar", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_file_store_rejects_path_traversal() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::with_path(temp.path().to_path_buf()).unwrap();
        assert!(store.get("../etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn test_retry_on_conflict_skips_unchanged() {
        let store = MemoryStore::new();
        store.create(image("flatcar")).await.unwrap();

        let out = retry_on_conflict(&store, "flatcar", |_| Ok(false))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.metadata.resource_version, 1);
    }

    #[tokio::test]
    async fn test_retry_on_conflict_absent_record() {
        let store = MemoryStore::new();
        let out = retry_on_conflict(&store, "missing", |_| Ok(true)).await.unwrap();
        assert!(out.is_none());
    }
}
