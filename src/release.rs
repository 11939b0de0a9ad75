//! Release descriptors to image requests.
//!
//! A release (e.g. `vsphere-30.1.0`) pins component versions. The node
//! image it needs is named after the Flatcar, Kubernetes and OS tooling
//! versions, and is owned by the provider the release name starts with:
//!
//! ```text
//! vsphere-30.1.0 { flatcar 3975.2.0, kubernetes v1.30.4, os-tooling v1.18.1 }
//!   ──▶ image     flatcar-stable-3975.2.0-kube-1.30.4-tooling-1.18.1-gs
//!   ──▶ provider  capv
//!   ──▶ record    capv-flatcar-stable-3975.2.0-kube-1.30.4-tooling-1.18.1-gs
//! ```

use crate::constants::{
    COMPONENT_FLATCAR, COMPONENT_KUBERNETES, COMPONENT_OS_TOOLING, PROVIDER_CLOUD_DIRECTOR,
    PROVIDER_VSPHERE,
};
use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// One pinned component of a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseComponent {
    pub name: String,
    pub version: String,
}

/// A release and its pinned components.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseDescriptor {
    pub name: String,
    #[serde(default)]
    pub components: Vec<ReleaseComponent>,
}

impl ReleaseDescriptor {
    /// Returns the version of `component`, if pinned.
    pub fn component(&self, component: &str) -> Option<&str> {
        self.components
            .iter()
            .find(|c| c.name == component)
            .map(|c| c.version.as_str())
    }
}

/// The node image a release requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRequest {
    /// Record name: `<provider tag>-<image name>`.
    pub object_name: String,
    /// Catalog name of the image.
    pub image_name: String,
    /// Provider tag.
    pub provider: String,
}

/// `<provider>-<major>.<minor>.<patch>`, capturing the provider name.
static RELEASE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([a-z-]+)-\d+\.\d+\.\d+").expect("valid regex"));

/// Extracts the provider part of a release name (`vsphere-1.2.3` → `vsphere`).
pub fn provider_from_release_name(release: &str) -> Result<String> {
    RELEASE_NAME
        .captures(release)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| Error::InvalidRelease {
            release: release.to_string(),
            reason: "provider name not found".to_string(),
        })
}

/// Maps a release provider name to the provider tag owning its images.
pub fn provider_tag(provider_name: &str) -> &str {
    match provider_name {
        "vsphere" => PROVIDER_VSPHERE,
        "cloud-director" => PROVIDER_CLOUD_DIRECTOR,
        other => other,
    }
}

/// Builds the catalog name of a node image.
pub fn build_image_name(channel: &str, flatcar: &str, kubernetes: &str, tooling: &str) -> String {
    format!(
        "flatcar-{}-{}-kube-{}-tooling-{}-gs",
        channel,
        flatcar,
        kubernetes.strip_prefix('v').unwrap_or(kubernetes),
        tooling.strip_prefix('v').unwrap_or(tooling),
    )
}

/// Derives the image request of a release.
pub fn node_image_for_release(release: &ReleaseDescriptor, channel: &str) -> Result<ImageRequest> {
    let invalid = |reason: String| Error::InvalidRelease {
        release: release.name.clone(),
        reason,
    };

    let mut versions = Vec::with_capacity(3);
    for component in [COMPONENT_FLATCAR, COMPONENT_KUBERNETES, COMPONENT_OS_TOOLING] {
        let version = release
            .component(component)
            .ok_or_else(|| invalid(format!("component {} not found", component)))?;
        if version.is_empty() {
            return Err(invalid(format!("{} version is empty", component)));
        }
        versions.push(version);
    }
    if channel.is_empty() {
        return Err(invalid("flatcar channel is empty".to_string()));
    }

    let image_name = build_image_name(channel, versions[0], versions[1], versions[2]);
    let provider = provider_tag(&provider_from_release_name(&release.name)?).to_string();

    Ok(ImageRequest {
        object_name: format!("{}-{}", provider, image_name),
        image_name,
        provider,
    })
}
