//! Node image record types.
//!
//! This module defines the persisted record for one distributable image:
//! - `NodeImage`: metadata + immutable spec + mutable status
//! - `NodeImageSpec`: catalog name and owning provider
//! - `NodeImageStatus`: consumer set and lifecycle state
//! - `NodeImageState`: lifecycle state machine
//!
//! # Lifecycle
//!
//! ```text
//!   (none) ──▶ Pending ──▶ Uploading ──▶ Available ◀──▶ Missing
//!                 ▲                          │
//!                 │ re-referenced            │ unreferenced
//!                 │                          ▼
//!                 └──────────────── AwaitingDeletion ──▶ Deleting ──▶ Deleted
//!
//!   any state ──▶ Error (retried by the next pass)
//! ```
//!
//! `(none)` is the "never reconciled" sentinel: a record freshly created by
//! the reference tracker. Such a record is never eligible for retention or
//! deletion, even while its consumer set is momentarily empty.

use crate::constants::{
    LAST_USED_ANNOTATION, MAX_CONSUMER_ID_LEN, MAX_IMAGE_NAME_LEN, NAME_VALID_CHARS,
};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// State
// =============================================================================

/// Lifecycle state of a node image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum NodeImageState {
    /// Referenced, not yet checked against the catalogs.
    Pending,
    /// Upload to at least one location is in progress.
    Uploading,
    /// Present at every location.
    Available,
    /// Source artifact is not reachable yet.
    Missing,
    /// Last pass failed; the next pass retries.
    Error,
    /// Unreferenced, inside the retention window.
    AwaitingDeletion,
    /// Removal from the catalogs is in progress.
    Deleting,
    /// Removed from every catalog; the record is about to go away.
    Deleted,
}

impl std::fmt::Display for NodeImageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Uploading => write!(f, "Uploading"),
            Self::Available => write!(f, "Available"),
            Self::Missing => write!(f, "Missing"),
            Self::Error => write!(f, "Error"),
            Self::AwaitingDeletion => write!(f, "AwaitingDeletion"),
            Self::Deleting => write!(f, "Deleting"),
            Self::Deleted => write!(f, "Deleted"),
        }
    }
}

// =============================================================================
// Metadata
// =============================================================================

/// Record metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Record identity.
    pub name: String,
    /// Optimistic-concurrency version, bumped by every successful write.
    #[serde(default)]
    pub resource_version: u64,
    /// When the record was created.
    pub creation_timestamp: DateTime<Utc>,
    /// Set once deletion of the record was requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    /// Free-form annotations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

// =============================================================================
// Spec / Status
// =============================================================================

/// Desired state. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeImageSpec {
    /// Name of the image in the provider catalogs.
    pub name: String,
    /// Tag of the provider owning the image.
    pub provider: String,
}

/// Observed state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeImageStatus {
    /// Consumers currently requiring the image.
    #[serde(default)]
    pub releases: Vec<String>,
    /// Lifecycle state; `None` until the first reference lands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<NodeImageState>,
}

// =============================================================================
// Node Image
// =============================================================================

/// A distributable node image and its distribution status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeImage {
    pub metadata: ObjectMeta,
    pub spec: NodeImageSpec,
    #[serde(default)]
    pub status: NodeImageStatus,
}

impl NodeImage {
    /// Creates a fresh record with an empty status.
    pub fn new(
        name: impl Into<String>,
        spec: NodeImageSpec,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            metadata: ObjectMeta {
                name: name.into(),
                resource_version: 0,
                creation_timestamp: now,
                deletion_timestamp: None,
                annotations: BTreeMap::new(),
            },
            spec,
            status: NodeImageStatus::default(),
        }
    }

    /// Returns the record name.
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Returns the current state, if the record was ever referenced.
    pub fn state(&self) -> Option<NodeImageState> {
        self.status.state
    }

    /// Returns true while at least one consumer requires the image.
    pub fn is_referenced(&self) -> bool {
        !self.status.releases.is_empty()
    }

    /// Returns true once deletion of the record was requested.
    pub fn is_deletion_requested(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Returns true if the consumer is listed.
    pub fn has_release(&self, consumer: &str) -> bool {
        self.status.releases.iter().any(|r| r == consumer)
    }

    /// Adds a consumer. Returns false if it was already listed.
    pub fn add_release(&mut self, consumer: &str) -> bool {
        if self.has_release(consumer) {
            return false;
        }
        self.status.releases.push(consumer.to_string());
        true
    }

    /// Removes a consumer. Returns false if it was not listed.
    pub fn remove_release(&mut self, consumer: &str) -> bool {
        let before = self.status.releases.len();
        self.status.releases.retain(|r| r != consumer);
        self.status.releases.len() != before
    }

    /// Returns when the image became unreferenced, if it is in a
    /// retention window.
    ///
    /// An unparsable annotation reads as absent.
    pub fn last_used_at(&self) -> Option<DateTime<Utc>> {
        self.metadata
            .annotations
            .get(LAST_USED_ANNOTATION)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    /// Stamps the time the image became unreferenced.
    pub fn set_last_used_at(&mut self, at: DateTime<Utc>) {
        self.metadata
            .annotations
            .insert(LAST_USED_ANNOTATION.to_string(), at.to_rfc3339());
    }

    /// Clears the last-used stamp. Returns false if none was set.
    pub fn clear_last_used_at(&mut self) -> bool {
        self.metadata.annotations.remove(LAST_USED_ANNOTATION).is_some()
    }

    /// Cancels a pending retention window or deletion request.
    ///
    /// `AwaitingDeletion` (and the never-reconciled sentinel) go back to
    /// `Pending`; the last-used stamp and any deletion request are cleared.
    /// Returns true if anything changed.
    pub fn cancel_retention(&mut self) -> bool {
        let mut changed = self.clear_last_used_at();
        if matches!(
            self.status.state,
            None | Some(NodeImageState::AwaitingDeletion)
        ) {
            self.status.state = Some(NodeImageState::Pending);
            changed = true;
        }
        if self.metadata.deletion_timestamp.take().is_some() {
            changed = true;
        }
        changed
    }
}

// =============================================================================
// Validation
// =============================================================================

/// Validates an image name (DNS-1123 subdomain rules).
pub fn validate_image_name(name: &str) -> Result<()> {
    validate_name(name, MAX_IMAGE_NAME_LEN).map_err(|reason| Error::InvalidImageName {
        name: truncate(name),
        reason,
    })
}

/// Validates a consumer identifier.
pub fn validate_consumer_id(id: &str) -> Result<()> {
    validate_name(id, MAX_CONSUMER_ID_LEN).map_err(|reason| Error::InvalidConsumerId {
        id: truncate(id),
        reason,
    })
}

fn validate_name(value: &str, max_len: usize) -> std::result::Result<(), String> {
    if value.is_empty() {
        return Err("empty".to_string());
    }
    if value.len() > max_len {
        return Err(format!("exceeds maximum length of {} bytes", max_len));
    }
    if !value.chars().all(|c| NAME_VALID_CHARS.contains(c)) {
        return Err("contains invalid characters".to_string());
    }
    let starts_ok = value.chars().next().is_some_and(|c| c.is_ascii_alphanumeric());
    let ends_ok = value.chars().last().is_some_and(|c| c.is_ascii_alphanumeric());
    if !starts_ok || !ends_ok {
        return Err("must start and end with an alphanumeric character".to_string());
    }
    Ok(())
}

fn truncate(value: &str) -> String {
    if value.len() > 50 {
        value.chars().take(50).collect::<String>() + "..."
    } else {
        value.to_string()
    }
}
