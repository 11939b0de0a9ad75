//! # Distribution Constants
//!
//! Cadences, timeouts, limits and well-known keys for node image
//! distribution. These constants are the **single source of truth** for the
//! timing behavior of a reconciliation pass.
//!
//! ## Cadences
//!
//! ```text
//!   successful pass ──────────────► requeue after REQUEUE_INTERVAL (5 min)
//!   source artifact missing ──────► requeue after MISSING_RECHECK_DELAY
//!   awaiting deletion ────────────► requeue after the remaining retention
//! ```
//!
//! ## Cross-References
//!
//! - [`crate::reconciler`]: Uses the cadences and provider timeouts
//! - [`crate::source`]: Uses the artifact layout and probe timeout
//! - [`crate::nodeimage`]: Uses name limits and the last-used annotation

use std::time::Duration;

// =============================================================================
// Cadences
// =============================================================================

/// Re-queue interval applied after every successful pass.
///
/// Re-validates catalog presence so that images removed out-of-band from a
/// provider catalog are uploaded again without an external trigger.
pub const REQUEUE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Fixed delay before re-checking a source artifact that was not reachable.
pub const MISSING_RECHECK_DELAY: Duration = Duration::from_secs(60);

// =============================================================================
// Timeouts
// =============================================================================

/// Upper bound for `exists` and `delete` provider calls.
pub const PROVIDER_CALL_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Upper bound for a provider `create` call.
///
/// OVA imports move several GiB; a pull-by-URL import into a remote catalog
/// can take well over ten minutes on slow links.
pub const PROVIDER_CREATE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Default upper bound for the HEAD probe against the source artifact.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Persistence
// =============================================================================

/// Maximum read-modify-write attempts before a conflict is surfaced as a
/// transient error.
pub const MAX_CONFLICT_RETRIES: u32 = 5;

/// Annotation holding the RFC 3339 time an image became unreferenced.
pub const LAST_USED_ANNOTATION: &str = "image-distributor.io/last-used";

/// File extension of records written by the file store.
pub const RECORD_EXTENSION: &str = "json";

/// Default state directory name (under the user's data directory).
pub const STATE_DIR: &str = "image-distributor";

// =============================================================================
// Names
// =============================================================================

/// Maximum image name length (DNS-1123 subdomain limit).
pub const MAX_IMAGE_NAME_LEN: usize = 253;

/// Maximum consumer identifier length.
pub const MAX_CONSUMER_ID_LEN: usize = 253;

/// Characters allowed in image names and consumer identifiers.
pub const NAME_VALID_CHARS: &str = "abcdefghijklmnopqrstuvwxyz0123456789-.";

// =============================================================================
// Source Artifact Layout
// =============================================================================

/// Key prefix under which the image pipeline publishes OVAs.
///
/// Shared by every provider: one artifact serves all catalogs.
pub const ARTIFACT_PREFIX: &str = "capv";

/// File extension of published artifacts.
pub const ARTIFACT_EXTENSION: &str = "ova";

/// Marker separating the OS/Kubernetes part of an image name from the
/// tooling suffix.
pub const TOOLING_MARKER: &str = "-tooling-";

/// Host suffix of S3 virtual-hosted-style URLs.
pub const S3_HOST_SUFFIX: &str = "amazonaws.com";

// =============================================================================
// Releases
// =============================================================================

/// Flatcar channel used when a release does not pin one.
pub const DEFAULT_FLATCAR_CHANNEL: &str = "stable";

/// Release component carrying the Flatcar version.
pub const COMPONENT_FLATCAR: &str = "flatcar";

/// Release component carrying the Kubernetes version.
pub const COMPONENT_KUBERNETES: &str = "kubernetes";

/// Release component carrying the OS tooling version.
pub const COMPONENT_OS_TOOLING: &str = "os-tooling";

// =============================================================================
// Provider Tags
// =============================================================================

/// Tag of the no-op provider.
pub const PROVIDER_TEST: &str = "test";

/// Tag of the vSphere provider.
pub const PROVIDER_VSPHERE: &str = "capv";

/// Tag of the Cloud Director provider.
pub const PROVIDER_CLOUD_DIRECTOR: &str = "capvcd";
