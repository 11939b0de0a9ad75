//! # Source Artifact Resolution
//!
//! Every node image is published once by the image pipeline as an OVA in an
//! S3 bucket. Provider imports pull it by URL; the reconciler only needs to
//! know where it lives and whether it is there yet.
//!
//! ## Key Layout
//!
//! ```text
//! capv/<image name>/<image name up to "-tooling-", "kube-" → "kube-v">.ova
//!
//! capv/flatcar-stable-3975.2.0-kube-1.30.4-tooling-1.18.1-gs/
//!      flatcar-stable-3975.2.0-kube-v1.30.4.ova
//! ```
//!
//! The `capv/` prefix is shared by every provider.
//!
//! ## URL Shape
//!
//! Virtual-hosted S3 URLs only: `https://<bucket>.s3.<region>.amazonaws.com/<key>`.
//! Anything else is rejected by [`SourceResolver::validate_url`] before a
//! provider is contacted.
//!
//! ## Probing
//!
//! A `HEAD` against the URL decides reachability. Any 2xx is reachable; any
//! other status is "not there yet", which the reconciler reports as the
//! `Missing` state. Transport failures are transient errors.

use crate::constants::{
    ARTIFACT_EXTENSION, ARTIFACT_PREFIX, DEFAULT_PROBE_TIMEOUT, S3_HOST_SUFFIX, TOOLING_MARKER,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

/// Derives the object key of an image's source artifact from its catalog
/// name.
pub fn image_key(image_name: &str) -> String {
    let base = image_name
        .split(TOOLING_MARKER)
        .next()
        .unwrap_or(image_name)
        .replacen("kube-", "kube-v", 1);
    format!(
        "{}/{}/{}.{}",
        ARTIFACT_PREFIX, image_name, base, ARTIFACT_EXTENSION
    )
}

/// Object-store backend holding source artifacts.
#[async_trait]
pub trait SourceResolver: Send + Sync {
    /// Builds the retrieval URL for an object key.
    fn resolve_url(&self, key: &str) -> String;

    /// Checks that `url` is well-formed for this backend.
    ///
    /// Violations are configuration errors.
    fn validate_url(&self, url: &str) -> Result<()>;

    /// Checks whether the artifact at `url` is reachable.
    async fn probe(&self, url: &str, cancel: &CancellationToken) -> Result<bool>;
}

// =============================================================================
// S3
// =============================================================================

/// S3 bucket addressed with virtual-hosted-style URLs.
#[derive(Debug, Clone)]
pub struct S3Source {
    bucket: String,
    region: String,
    http: reqwest::Client,
    probe_timeout: Duration,
}

impl S3Source {
    /// Creates a source for `bucket` in `region`.
    pub fn new(bucket: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            region: region.into(),
            http: reqwest::Client::new(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Sets the upper bound for a single probe.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Returns the bucket name.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Returns the region.
    pub fn region(&self) -> &str {
        &self.region
    }

    async fn head(&self, url: &str) -> Result<bool> {
        let response = tokio::time::timeout(self.probe_timeout, self.http.head(url).send())
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("probe {}", url),
                duration: self.probe_timeout,
            })?
            .map_err(|e| Error::SourceProbeFailed {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        debug!("HEAD {} -> {}", url, status);
        Ok(status.is_success())
    }
}

#[async_trait]
impl SourceResolver for S3Source {
    fn resolve_url(&self, key: &str) -> String {
        format!(
            "https://{}.s3.{}.{}/{}",
            self.bucket, self.region, S3_HOST_SUFFIX, key
        )
    }

    fn validate_url(&self, url: &str) -> Result<()> {
        validate_s3_url(url)
    }

    async fn probe(&self, url: &str, cancel: &CancellationToken) -> Result<bool> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled(format!("probe {}", url))),
            result = self.head(url) => result,
        }
    }
}

/// Checks that `url` is a virtual-hosted S3 object URL.
pub fn validate_s3_url(url: &str) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidSourceUrl {
        url: url.to_string(),
        reason: reason.to_string(),
    };

    if url.is_empty() {
        return Err(invalid("empty"));
    }

    let parsed = Url::parse(url).map_err(|e| invalid(&e.to_string()))?;

    if parsed.scheme() != "https" {
        return Err(invalid("scheme must be https"));
    }

    let host = parsed.host_str().ok_or_else(|| invalid("missing host"))?;
    let Some(prefix) = host.strip_suffix(&format!(".{}", S3_HOST_SUFFIX)) else {
        return Err(invalid("host is not an S3 endpoint"));
    };
    // <bucket>.s3.<region>
    let labels: Vec<&str> = prefix.rsplitn(3, '.').collect();
    match labels.as_slice() {
        [region, "s3", bucket] if !region.is_empty() && !bucket.is_empty() => {}
        _ => return Err(invalid("host must be <bucket>.s3.<region>.amazonaws.com")),
    }

    if parsed.path().trim_start_matches('/').is_empty() {
        return Err(invalid("missing object key"));
    }

    Ok(())
}
