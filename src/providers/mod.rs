//! Provider backends and the tag registry.
//!
//! Backends shipped in-tree:
//! - [`NoopProvider`]: reports every image as present (tag `test`)
//! - [`MemoryProvider`]: in-process catalog with fault injection
//!
//! Hypervisor and cloud-catalog SDK backends live outside this crate and
//! plug in through [`ProviderRegistry::register`].

pub mod memory;
pub mod noop;

pub use self::memory::{MemoryProvider, ProviderCall, ProviderOp};
pub use self::noop::NoopProvider;

use crate::provider::Provider;
use std::collections::HashMap;
use std::sync::Arc;

/// Mapping from provider tag to implementation.
///
/// Built once at startup and shared read-only by every reconciliation pass.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider under its own tag, replacing any previous one.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.register_as(provider.name().to_string(), provider);
    }

    /// Registers a provider under an explicit tag.
    pub fn register_as(&mut self, tag: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(tag.into(), provider);
    }

    /// Gets a provider by tag.
    pub fn get(&self, tag: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(tag).cloned()
    }

    /// Returns all registered tags, sorted.
    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<_> = self.providers.keys().cloned().collect();
        tags.sort();
        tags
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("tags", &self.tags())
            .finish()
    }
}
