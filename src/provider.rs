//! Provider capability contract.
//!
//! A provider is an infrastructure backend hosting image catalogs at one or
//! more [`Location`]s. It exposes four capabilities:
//! - `exists`: is the image registered at a location?
//! - `create`: import the image from a source URL into a location
//! - `delete`: remove the image from a location (idempotent)
//! - `locations`: enumerate the configured locations
//!
//! The reconciler is written once against this trait; backends are looked up
//! by tag in a [`crate::providers::ProviderRegistry`] built at startup.
//!
//! # Cancellation
//!
//! Every network-bound call receives the pass's [`CancellationToken`].
//! Implementations should abort promptly and return
//! [`crate::Error::Cancelled`] once it fires. The reconciler additionally
//! races every call against the token and a timeout, so a backend that
//! ignores the token still cannot hold a pass hostage.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Location
// =============================================================================

/// An addressable target within a provider.
///
/// Opaque to the reconciler beyond its name. The attributes carry the
/// backend-specific coordinates (datacenter/datastore/folder for hypervisor
/// backends, org/vdc/catalog for cloud catalogs) and are validated by the
/// provider that owns the location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    /// Unique name within the provider.
    pub name: String,
    /// Backend-specific coordinates.
    #[serde(default, flatten)]
    pub attributes: BTreeMap<String, String>,
}

impl Location {
    /// Creates a location without attributes.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Adds an attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Returns an attribute value.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

// =============================================================================
// Provider Trait
// =============================================================================

/// Image catalog backend.
///
/// # Contract
///
/// ```text
/// exists(name, loc) ──false──▶ create(url, name, loc)
///        │
///        └──true──▶ (nothing to do)
///
/// delete(name, loc)   Ok(()) even if the image is already gone
/// ```
///
/// `create` is only invoked after `exists` returned `false` for the same
/// location within the same pass; implementations do not re-check.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Returns the provider tag (e.g. `capv`).
    fn name(&self) -> &str;

    /// Returns the configured locations.
    ///
    /// Enumerated fully on every call; order is not significant.
    fn locations(&self) -> Vec<Location>;

    /// Checks whether `image` is registered at `location`.
    ///
    /// A "not found" lookup is `Ok(false)`. Anything else the backend cannot
    /// answer (auth, network, ambiguous result) is an error.
    async fn exists(
        &self,
        image: &str,
        location: &Location,
        cancel: &CancellationToken,
    ) -> Result<bool>;

    /// Imports `image` from `source_url` into `location`.
    async fn create(
        &self,
        source_url: &str,
        image: &str,
        location: &Location,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Removes `image` from `location`.
    ///
    /// Succeeds if the image is already absent.
    async fn delete(
        &self,
        image: &str,
        location: &Location,
        cancel: &CancellationToken,
    ) -> Result<()>;
}
