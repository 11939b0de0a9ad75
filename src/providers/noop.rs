//! No-op provider.
//!
//! Every image exists at its single location and deletes always succeed, so
//! a record owned by this provider goes straight to `Available` without any
//! upload. Used for end-to-end runs without infrastructure.

use crate::constants::PROVIDER_TEST;
use crate::error::Result;
use crate::provider::{Location, Provider};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Provider that owns nothing and succeeds at everything.
#[derive(Debug, Clone)]
pub struct NoopProvider {
    tag: String,
    locations: Vec<Location>,
}

impl NoopProvider {
    /// Creates a provider tagged `test` with one location named `noop`.
    pub fn new() -> Self {
        Self::with_locations(PROVIDER_TEST, vec![Location::new("noop")])
    }

    /// Creates a provider under a custom tag and locations.
    pub fn with_locations(tag: impl Into<String>, locations: Vec<Location>) -> Self {
        Self {
            tag: tag.into(),
            locations,
        }
    }
}

impl Default for NoopProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for NoopProvider {
    fn name(&self) -> &str {
        &self.tag
    }

    fn locations(&self) -> Vec<Location> {
        self.locations.clone()
    }

    async fn exists(
        &self,
        _image: &str,
        _location: &Location,
        _cancel: &CancellationToken,
    ) -> Result<bool> {
        Ok(true)
    }

    async fn create(
        &self,
        _source_url: &str,
        image: &str,
        location: &Location,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        debug!("noop: create {} at {}", image, location);
        Ok(())
    }

    async fn delete(
        &self,
        image: &str,
        location: &Location,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        debug!("noop: delete {} at {}", image, location);
        Ok(())
    }
}
