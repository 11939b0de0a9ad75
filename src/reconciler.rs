//! # Image Reconciliation
//!
//! [`Reconciler::reconcile`] drives one record one step closer to its
//! desired state. It is invoked per record key, at least once per change,
//! and again on the returned requeue delay.
//!
//! ## Decision Sequence
//!
//! ```text
//!   record gone ─────────────────────────────────────▶ done
//!   deletion requested, unreferenced ────────────────▶ sweep locations ─▶ remove record
//!   deletion requested, referenced ──────────────────▶ drop the request, go on
//!   unreferenced (state set):
//!       period == 0 or window elapsed ───────────────▶ request deletion ─▶ sweep ─▶ remove
//!       window not started ──────────────────────────▶ AwaitingDeletion, requeue(period)
//!       window running ──────────────────────────────▶ requeue(remaining)
//!   otherwise:
//!       resolve + validate source URL ───────────────▶ Error on malformed URL
//!       provider unknown ────────────────────────────▶ Error, requeue(5m)
//!       fan out over locations ──────────────────────▶ Available, requeue(5m)
//!                                                      Missing,   requeue(60s)
//!                                                      Error,     hard error
//! ```
//!
//! ## Concurrency
//!
//! Passes for the same record are expected to be serialized by the caller.
//! The reconciler still never writes from a cached copy: every write
//! re-reads the record and retries on version conflicts, so a reference
//! added mid-pass is never overwritten.
//!
//! ## Cancellation
//!
//! Every provider call and source probe races the caller's token. A
//! cancelled pass returns [`Error::Cancelled`] and leaves the record in the
//! state it had reached (for instance `Uploading`); the next pass checks
//! `exists` again before re-attempting an upload.

use crate::clock::Clock;
use crate::constants::{MISSING_RECHECK_DELAY, REQUEUE_INTERVAL};
use crate::error::{Error, Result};
use crate::events::{EventSink, ReconcileEvent};
use crate::fanout::{EnsureOutcome, LocationFanOut};
use crate::nodeimage::{NodeImage, NodeImageState};
use crate::providers::ProviderRegistry;
use crate::retention::{RetentionDecision, RetentionPolicy};
use crate::source::{SourceResolver, image_key};
use crate::status::StatusWriter;
use crate::store::ImageStore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What the caller should do after a successful pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Invoke again after this delay. `None` when the record is gone.
    pub requeue_after: Option<Duration>,
}

impl ReconcileOutcome {
    /// Nothing left to do.
    pub fn done() -> Self {
        Self {
            requeue_after: None,
        }
    }

    /// Look again after `after`.
    pub fn requeue(after: Duration) -> Self {
        Self {
            requeue_after: Some(after),
        }
    }
}

/// The image reconciliation engine.
pub struct Reconciler {
    store: Arc<dyn ImageStore>,
    providers: ProviderRegistry,
    source: Arc<dyn SourceResolver>,
    retention: RetentionPolicy,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ImageStore>,
        providers: ProviderRegistry,
        source: Arc<dyn SourceResolver>,
        retention: RetentionPolicy,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            providers,
            source,
            retention,
            clock,
            events,
        }
    }

    /// Returns the configured provider registry.
    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Returns the retention policy.
    pub fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    /// Runs one pass for the record `name`.
    pub async fn reconcile(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome> {
        let Some(mut image) = self.store.get(name).await? else {
            debug!("Node image {} not found, nothing to do", name);
            return Ok(ReconcileOutcome::done());
        };

        let status = StatusWriter::new(self.store.as_ref(), self.events.as_ref(), name);

        // Step 1: deletion requested.
        if image.is_deletion_requested() {
            if !image.is_referenced() {
                return self.finalize(&image, &status, cancel).await;
            }
            image = status
                .update(|img| Ok(img.metadata.deletion_timestamp.take().is_some()))
                .await?;
            self.events.emit(ReconcileEvent::DeletionBlocked {
                image: name.to_string(),
                releases: image.status.releases.len(),
            });
        }

        // Steps 2 and 3: retention.
        let now = self.clock.now();
        match self.retention.evaluate(&image, now) {
            RetentionDecision::NotEligible => {
                if image.is_referenced()
                    && image.state() == Some(NodeImageState::AwaitingDeletion)
                {
                    image = status.update(|img| Ok(img.cancel_retention())).await?;
                    self.events.emit(ReconcileEvent::RetentionCancelled {
                        image: name.to_string(),
                    });
                }
            }
            RetentionDecision::DeleteNow => {
                if let Some(marked) = self.mark_for_deletion(&status, now).await? {
                    info!("Node image {} unreferenced, deleting", name);
                    return self.finalize(&marked, &status, cancel).await;
                }
                debug!("Node image {} re-referenced before deletion", name);
            }
            RetentionDecision::StartGracePeriod { requeue_after } => {
                if self.start_grace_period(&status, now).await? {
                    return Ok(ReconcileOutcome::requeue(requeue_after));
                }
                debug!("Node image {} re-referenced before retention", name);
            }
            RetentionDecision::Wait { remaining } => {
                self.events.emit(ReconcileEvent::RetentionWaiting {
                    image: name.to_string(),
                    remaining,
                });
                return Ok(ReconcileOutcome::requeue(remaining));
            }
        }

        // Steps 4 and 5: make the image available.
        self.ensure(&image, &status, cancel).await
    }

    /// Requests deletion of `name` regardless of retention.
    ///
    /// The next pass removes the image from every location and drops the
    /// record, unless consumers still reference it.
    pub async fn request_deletion(&self, name: &str) -> Result<()> {
        let now = self.clock.now();
        let status = StatusWriter::new(self.store.as_ref(), self.events.as_ref(), name);
        status
            .update(|img| {
                if img.is_deletion_requested() {
                    return Ok(false);
                }
                img.metadata.deletion_timestamp = Some(now);
                Ok(true)
            })
            .await?;
        self.events.emit(ReconcileEvent::DeletionRequested {
            image: name.to_string(),
        });
        Ok(())
    }

    async fn ensure(
        &self,
        image: &NodeImage,
        status: &StatusWriter<'_>,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome> {
        let name = image.name();

        let url = self.source.resolve_url(&image_key(&image.spec.name));
        if let Err(e) = self.source.validate_url(&url) {
            warn!("Node image {} has an invalid source URL: {}", name, e);
            status.set_state(NodeImageState::Error).await?;
            return Err(e);
        }

        let Some(provider) = self.providers.get(&image.spec.provider) else {
            status.set_state(NodeImageState::Error).await?;
            self.events.emit(ReconcileEvent::ProviderNotConfigured {
                image: name.to_string(),
                provider: image.spec.provider.clone(),
            });
            return Ok(ReconcileOutcome::requeue(REQUEUE_INTERVAL));
        };

        let fanout = LocationFanOut::new(provider.as_ref(), status, self.events.as_ref(), cancel);
        match fanout.ensure(self.source.as_ref(), &image.spec.name, &url).await? {
            EnsureOutcome::Available => Ok(ReconcileOutcome::requeue(REQUEUE_INTERVAL)),
            EnsureOutcome::SourceMissing => Ok(ReconcileOutcome::requeue(MISSING_RECHECK_DELAY)),
        }
    }

    /// Removes the image from every location, then drops the record.
    async fn finalize(
        &self,
        image: &NodeImage,
        status: &StatusWriter<'_>,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome> {
        let name = image.name();
        self.begin_deletion(status).await?;

        match self.providers.get(&image.spec.provider) {
            Some(provider) => {
                let fanout =
                    LocationFanOut::new(provider.as_ref(), status, self.events.as_ref(), cancel);
                let failed = fanout.sweep(&image.spec.name).await?;
                if !failed.is_empty() {
                    status.set_state(NodeImageState::Error).await?;
                    return Err(Error::DeletionIncomplete {
                        image: name.to_string(),
                        failed,
                    });
                }
            }
            None => {
                warn!(
                    "Provider {} not configured, skipping catalog cleanup for {}",
                    image.spec.provider, name
                );
                self.events.emit(ReconcileEvent::ProviderNotConfigured {
                    image: name.to_string(),
                    provider: image.spec.provider.clone(),
                });
            }
        }

        let mut releases = 0;
        let mut previous = None;
        let deleted = status
            .update(|img| {
                releases = img.status.releases.len();
                previous = img.state();
                if releases > 0 || previous == Some(NodeImageState::Deleted) {
                    return Ok(false);
                }
                img.status.state = Some(NodeImageState::Deleted);
                Ok(true)
            })
            .await?;

        if releases > 0 {
            // Re-referenced while the sweep ran; the next pass uploads again.
            self.events.emit(ReconcileEvent::DeletionBlocked {
                image: name.to_string(),
                releases,
            });
            return Ok(ReconcileOutcome::requeue(Duration::ZERO));
        }
        if previous != Some(NodeImageState::Deleted) {
            self.events.emit(ReconcileEvent::StateChanged {
                image: name.to_string(),
                from: previous,
                to: NodeImageState::Deleted,
            });
        }

        // Rejected if a consumer showed up since the last read.
        self.store
            .delete(name, Some(deleted.metadata.resource_version))
            .await?;

        self.events.emit(ReconcileEvent::Removed {
            image: name.to_string(),
        });
        Ok(ReconcileOutcome::done())
    }

    /// Moves the record to `Deleting`, dropping the last-used stamp in the
    /// same write so the stamp never outlives `AwaitingDeletion`.
    async fn begin_deletion(&self, status: &StatusWriter<'_>) -> Result<()> {
        let mut previous = None;
        status
            .update(|img| {
                previous = img.state();
                let cleared = img.clear_last_used_at();
                if previous == Some(NodeImageState::Deleting) {
                    return Ok(cleared);
                }
                img.status.state = Some(NodeImageState::Deleting);
                Ok(true)
            })
            .await?;

        if previous != Some(NodeImageState::Deleting) {
            self.events.emit(ReconcileEvent::StateChanged {
                image: status.name().to_string(),
                from: previous,
                to: NodeImageState::Deleting,
            });
        }
        Ok(())
    }

    /// Marks an unreferenced record for deletion. `None` if it picked up a
    /// consumer in the meantime.
    async fn mark_for_deletion(
        &self,
        status: &StatusWriter<'_>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Option<NodeImage>> {
        let mut referenced = false;
        let image = status
            .update(|img| {
                referenced = img.is_referenced();
                if referenced || img.is_deletion_requested() {
                    return Ok(false);
                }
                img.metadata.deletion_timestamp = Some(now);
                Ok(true)
            })
            .await?;
        Ok((!referenced).then_some(image))
    }

    /// Enters the retention window. Returns false if the record picked up a
    /// consumer in the meantime.
    async fn start_grace_period(
        &self,
        status: &StatusWriter<'_>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<bool> {
        let mut referenced = false;
        let mut previous = None;
        status
            .update(|img| {
                referenced = img.is_referenced();
                if referenced {
                    return Ok(false);
                }
                previous = img.state();
                img.status.state = Some(NodeImageState::AwaitingDeletion);
                img.set_last_used_at(now);
                Ok(true)
            })
            .await?;

        if referenced {
            return Ok(false);
        }

        let name = status.name().to_string();
        if previous != Some(NodeImageState::AwaitingDeletion) {
            self.events.emit(ReconcileEvent::StateChanged {
                image: name.clone(),
                from: previous,
                to: NodeImageState::AwaitingDeletion,
            });
        }
        self.events.emit(ReconcileEvent::RetentionStarted {
            image: name,
            period: self.retention.period(),
        });
        Ok(true)
    }
}
