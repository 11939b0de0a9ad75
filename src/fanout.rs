//! Location fan-out.
//!
//! Applies one per-location operation across every location of a provider
//! within a single pass. The two directions fail differently:
//!
//! | Direction | On a failing location                               |
//! |-----------|-----------------------------------------------------|
//! | ensure    | stop; the next pass resumes via `exists`            |
//! | sweep     | keep going; report every location left behind       |
//!
//! Ensure stops early because uploads are expensive and a retried pass
//! re-checks the satisfied locations cheaply. The sweep continues so one
//! unreachable location does not keep the image alive everywhere else.
//!
//! Location order follows `Provider::locations()` and carries no meaning.

use crate::constants::{PROVIDER_CALL_TIMEOUT, PROVIDER_CREATE_TIMEOUT};
use crate::error::{Error, ErrorKind, Result};
use crate::events::{EventSink, ReconcileEvent};
use crate::nodeimage::NodeImageState;
use crate::provider::{Location, Provider};
use crate::source::SourceResolver;
use crate::status::{StatusWriter, bounded};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Result of an ensure fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// Present at every location.
    Available,
    /// Source artifact not reachable; nothing was uploaded past this point.
    SourceMissing,
}

/// Fans one image out over a provider's locations.
pub struct LocationFanOut<'a> {
    provider: &'a dyn Provider,
    status: &'a StatusWriter<'a>,
    events: &'a dyn EventSink,
    cancel: &'a CancellationToken,
}

impl<'a> LocationFanOut<'a> {
    pub fn new(
        provider: &'a dyn Provider,
        status: &'a StatusWriter<'a>,
        events: &'a dyn EventSink,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            provider,
            status,
            events,
            cancel,
        }
    }

    /// Makes `image` present at every location, uploading from `url` where
    /// it is missing. Stops at the first failing location.
    pub async fn ensure(
        &self,
        source: &dyn SourceResolver,
        image: &str,
        url: &str,
    ) -> Result<EnsureOutcome> {
        let record = self.status.name();

        for location in self.provider.locations() {
            // Probe failures of any kind other than cancellation mean "not
            // there yet".
            let reachable = match source.probe(url, self.cancel).await {
                Ok(reachable) => reachable,
                Err(e) if e.kind() == ErrorKind::Cancelled => return Err(e),
                Err(e) => {
                    debug!("Probe of {} failed: {}", url, e);
                    false
                }
            };
            if !reachable {
                self.status.set_state(NodeImageState::Missing).await?;
                self.events.emit(ReconcileEvent::SourceMissing {
                    image: record.to_string(),
                    url: url.to_string(),
                });
                return Ok(EnsureOutcome::SourceMissing);
            }

            let present = match self.exists(image, &location).await {
                Ok(present) => present,
                Err(e) => return self.fail(e).await,
            };
            if present {
                self.status.set_state(NodeImageState::Available).await?;
                self.events.emit(ReconcileEvent::AlreadyPresent {
                    image: record.to_string(),
                    location: location.name.clone(),
                });
                continue;
            }

            self.status.set_state(NodeImageState::Uploading).await?;
            self.events.emit(ReconcileEvent::UploadStarted {
                image: record.to_string(),
                location: location.name.clone(),
                url: url.to_string(),
            });

            if let Err(e) = self.create(url, image, &location).await {
                return self.fail(e).await;
            }

            self.status.set_state(NodeImageState::Available).await?;
            self.events.emit(ReconcileEvent::UploadCompleted {
                image: record.to_string(),
                location: location.name.clone(),
            });
        }

        Ok(EnsureOutcome::Available)
    }

    /// Removes `image` from every location.
    ///
    /// Returns the names of the locations where removal failed. Only
    /// cancellation stops the sweep early.
    pub async fn sweep(&self, image: &str) -> Result<Vec<String>> {
        let record = self.status.name();
        let mut failed = Vec::new();

        for location in self.provider.locations() {
            self.status.set_state(NodeImageState::Deleting).await?;

            let operation = format!("delete {} at {}", image, location);
            let result = bounded(
                operation,
                PROVIDER_CALL_TIMEOUT,
                self.cancel,
                self.provider.delete(image, &location, self.cancel),
            )
            .await;

            match result {
                Ok(()) => debug!("Deleted {} at {}", image, location),
                Err(e) if e.kind() == ErrorKind::Cancelled => return Err(e),
                Err(e) => {
                    self.events.emit(ReconcileEvent::LocationDeleteFailed {
                        image: record.to_string(),
                        location: location.name.clone(),
                        reason: e.to_string(),
                    });
                    failed.push(location.name);
                }
            }
        }

        Ok(failed)
    }

    async fn exists(&self, image: &str, location: &Location) -> Result<bool> {
        bounded(
            format!("exists {} at {}", image, location),
            PROVIDER_CALL_TIMEOUT,
            self.cancel,
            self.provider.exists(image, location, self.cancel),
        )
        .await
    }

    async fn create(&self, url: &str, image: &str, location: &Location) -> Result<()> {
        bounded(
            format!("create {} at {}", image, location),
            PROVIDER_CREATE_TIMEOUT,
            self.cancel,
            self.provider.create(url, image, location, self.cancel),
        )
        .await
    }

    /// Surfaces a provider failure. Cancellation leaves the state as is so
    /// the next pass resumes from it.
    async fn fail<T>(&self, err: Error) -> Result<T> {
        if err.kind() != ErrorKind::Cancelled {
            self.status.set_state(NodeImageState::Error).await?;
        }
        Err(err)
    }
}
