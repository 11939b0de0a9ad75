//! In-process image catalog.
//!
//! [`MemoryProvider`] keeps a set of `(location, image)` pairs and logs every
//! call it receives. Faults can be queued per operation and location to drive
//! the error paths of the reconciler:
//!
//! ```rust,ignore
//! let provider = MemoryProvider::new("capv", vec![Location::new("dc1")]);
//! provider.fail_next(ProviderOp::Create, "dc1");
//! // next create at dc1 returns Error::ProviderFailed
//! ```
//!
//! The binary uses it for dry runs: nothing leaves the process.

use crate::error::{Error, Result};
use crate::provider::{Location, Provider};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Provider operation, for call accounting and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderOp {
    Exists,
    Create,
    Delete,
}

impl std::fmt::Display for ProviderOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exists => write!(f, "exists"),
            Self::Create => write!(f, "create"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// One recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCall {
    pub op: ProviderOp,
    pub image: String,
    pub location: String,
}

/// Provider backed by an in-memory catalog.
#[derive(Debug)]
pub struct MemoryProvider {
    tag: String,
    locations: Vec<Location>,
    catalog: RwLock<HashSet<(String, String)>>,
    calls: Mutex<Vec<ProviderCall>>,
    faults: Mutex<Vec<(ProviderOp, String)>>,
    create_delay: Option<Duration>,
}

impl MemoryProvider {
    /// Creates an empty catalog over `locations`.
    pub fn new(tag: impl Into<String>, locations: Vec<Location>) -> Self {
        Self {
            tag: tag.into(),
            locations,
            catalog: RwLock::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            faults: Mutex::new(Vec::new()),
            create_delay: None,
        }
    }

    /// Seeds the catalog with `image` at `location`.
    pub fn with_image(self, location: &str, image: &str) -> Self {
        self.insert_image(location, image);
        self
    }

    /// Makes every `create` take `delay` before completing.
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    /// Adds `image` at `location` out-of-band.
    pub fn insert_image(&self, location: &str, image: &str) {
        self.catalog
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((location.to_string(), image.to_string()));
    }

    /// Removes `image` from `location` out-of-band.
    pub fn remove_image(&self, location: &str, image: &str) {
        self.catalog
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(location.to_string(), image.to_string()));
    }

    /// Returns true if `image` is registered at `location`.
    pub fn contains(&self, location: &str, image: &str) -> bool {
        self.catalog
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&(location.to_string(), image.to_string()))
    }

    /// Makes the next `op` at `location` fail once.
    pub fn fail_next(&self, op: ProviderOp, location: &str) {
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((op, location.to_string()));
    }

    /// Returns every call received so far.
    pub fn calls(&self) -> Vec<ProviderCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Returns how many times `op` was called.
    pub fn call_count(&self, op: ProviderOp) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|c| c.op == op)
            .count()
    }

    /// Returns how many times `op` was called at `location`.
    pub fn call_count_at(&self, op: ProviderOp, location: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|c| c.op == op && c.location == location)
            .count()
    }

    fn record(&self, op: ProviderOp, image: &str, location: &Location) -> Result<()> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(ProviderCall {
                op,
                image: image.to_string(),
                location: location.name.clone(),
            });

        let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pos) = faults
            .iter()
            .position(|(o, l)| *o == op && *l == location.name)
        {
            faults.remove(pos);
            return Err(Error::ProviderFailed {
                provider: self.tag.clone(),
                operation: op.to_string(),
                image: image.to_string(),
                location: location.name.clone(),
                reason: "injected fault".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    fn name(&self) -> &str {
        &self.tag
    }

    fn locations(&self) -> Vec<Location> {
        self.locations.clone()
    }

    async fn exists(
        &self,
        image: &str,
        location: &Location,
        _cancel: &CancellationToken,
    ) -> Result<bool> {
        self.record(ProviderOp::Exists, image, location)?;
        Ok(self.contains(&location.name, image))
    }

    async fn create(
        &self,
        source_url: &str,
        image: &str,
        location: &Location,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.record(ProviderOp::Create, image, location)?;

        if let Some(delay) = self.create_delay {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled(format!("import of {} at {}", image, location)));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        debug!("memory: imported {} from {} at {}", image, source_url, location);
        self.insert_image(&location.name, image);
        Ok(())
    }

    async fn delete(
        &self,
        image: &str,
        location: &Location,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        self.record(ProviderOp::Delete, image, location)?;
        self.remove_image(&location.name, image);
        Ok(())
    }
}
