//! YAML configuration.
//!
//! ```yaml
//! retentionPeriod: 24h          # 0 deletes unreferenced images at once
//! stateDir: /var/lib/image-distributor
//! flatcarChannel: stable
//! source:
//!   bucket: node-images
//!   region: eu-central-1
//!   probeTimeout: 30s
//! providers:
//!   capv:
//!     kind: memory
//!     locations:
//!       - name: dc1
//!         datacenter: Datacenter
//!         datastore: vsanDatastore
//!         folder: images
//!   capvcd:
//!     kind: memory
//!     locations:
//!       - name: vcd-1
//!         org: giantswarm
//!         vdc: vdc-1
//!         catalog: images
//! ```
//!
//! Durations take an `s`, `m`, `h` or `d` suffix, or are a bare number of
//! seconds.

use crate::constants::{DEFAULT_FLATCAR_CHANNEL, DEFAULT_PROBE_TIMEOUT};
use crate::error::{Error, Result};
use crate::provider::Location;
use crate::providers::{MemoryProvider, NoopProvider, ProviderRegistry};
use crate::retention::RetentionPolicy;
use crate::source::S3Source;
use serde::{Deserialize, Deserializer};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    /// How long unreferenced images are kept.
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub retention_period: Duration,

    /// Root of the file store.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    /// Flatcar channel for images derived from releases.
    #[serde(default = "default_flatcar_channel")]
    pub flatcar_channel: String,

    /// Where source artifacts are published.
    pub source: SourceConfig,

    /// Provider tag to backend.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
}

/// Source artifact bucket.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SourceConfig {
    pub bucket: String,
    pub region: String,
    #[serde(
        default = "default_probe_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub probe_timeout: Duration,
}

/// One provider backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    #[serde(default)]
    pub locations: Vec<Location>,
}

/// In-tree backend kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Every image is always present.
    Noop,
    /// In-process catalog (dry runs).
    Memory,
}

fn default_flatcar_channel() -> String {
    DEFAULT_FLATCAR_CHANNEL.to_string()
}

fn default_probe_timeout() -> Duration {
    DEFAULT_PROBE_TIMEOUT
}

impl Config {
    /// Parses and validates a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&yaml)
    }

    /// Checks cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.source.bucket.is_empty() {
            return Err(Error::InvalidConfig("source.bucket is empty".to_string()));
        }
        if self.source.region.is_empty() {
            return Err(Error::InvalidConfig("source.region is empty".to_string()));
        }
        if self.flatcar_channel.is_empty() {
            return Err(Error::InvalidConfig("flatcarChannel is empty".to_string()));
        }

        for (tag, provider) in &self.providers {
            if tag.is_empty() {
                return Err(Error::InvalidConfig("empty provider tag".to_string()));
            }
            let mut seen = HashSet::new();
            for location in &provider.locations {
                if location.name.is_empty() {
                    return Err(Error::InvalidConfig(format!(
                        "provider {}: location without a name",
                        tag
                    )));
                }
                if !seen.insert(location.name.as_str()) {
                    return Err(Error::InvalidConfig(format!(
                        "provider {}: duplicate location {}",
                        tag, location.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Returns the retention policy.
    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy::new(self.retention_period)
    }

    /// Builds the source artifact resolver.
    pub fn build_source(&self) -> S3Source {
        S3Source::new(&self.source.bucket, &self.source.region)
            .with_probe_timeout(self.source.probe_timeout)
    }

    /// Builds the provider registry.
    pub fn build_registry(&self) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        for (tag, provider) in &self.providers {
            match provider.kind {
                ProviderKind::Noop => {
                    let locations = if provider.locations.is_empty() {
                        vec![Location::new("noop")]
                    } else {
                        provider.locations.clone()
                    };
                    registry.register_as(
                        tag.clone(),
                        Arc::new(NoopProvider::with_locations(tag.clone(), locations)),
                    );
                }
                ProviderKind::Memory => {
                    registry.register_as(
                        tag.clone(),
                        Arc::new(MemoryProvider::new(tag.clone(), provider.locations.clone())),
                    );
                }
            }
        }
        registry
    }
}

// =============================================================================
// Durations
// =============================================================================

/// Parses `90`, `90s`, `15m`, `24h` or `7d`.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let invalid = |reason: &str| Error::InvalidDuration {
        value: value.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(invalid("empty"));
    }

    let (digits, unit) = match trimmed.char_indices().last() {
        Some((idx, c)) if c.is_ascii_alphabetic() => (&trimmed[..idx], Some(c)),
        _ => (trimmed, None),
    };

    let amount: u64 = digits
        .parse()
        .map_err(|_| invalid("expected a whole number"))?;

    let multiplier = match unit {
        None | Some('s') => 1,
        Some('m') => 60,
        Some('h') => 60 * 60,
        Some('d') => 24 * 60 * 60,
        Some(_) => return Err(invalid("unit must be one of s, m, h, d")),
    };

    amount
        .checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(|| invalid("too large"))
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}
