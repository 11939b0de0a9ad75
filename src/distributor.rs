//! Entry points.
//!
//! [`Distributor`] bundles the reference tracker and the reconciler behind
//! the calls an outer control loop makes:
//!
//! | Trigger                          | Call                          |
//! |----------------------------------|-------------------------------|
//! | consumer starts needing an image | [`Distributor::on_consumer_added`]   |
//! | consumer stops needing an image  | [`Distributor::on_consumer_removed`] |
//! | release created / deleted        | [`Distributor::on_release_added`] / [`Distributor::on_release_removed`] |
//! | record changed or timer fired    | [`Distributor::reconcile`]           |
//! | periodic resync                  | [`Distributor::reconcile_all`]       |

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::Result;
use crate::events::{EventSink, TracingSink};
use crate::nodeimage::{NodeImage, NodeImageSpec};
use crate::reconciler::{ReconcileOutcome, Reconciler};
use crate::references::ReferenceTracker;
use crate::release::{ImageRequest, ReleaseDescriptor, node_image_for_release};
use crate::store::ImageStore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Summary of a resync over every record.
#[derive(Debug, Default)]
pub struct PassReport {
    /// Records reconciled without error.
    pub succeeded: usize,
    /// Records whose pass failed, with the error message.
    pub failed: Vec<(String, String)>,
    /// Shortest requeue delay requested by any record.
    pub next_requeue: Option<Duration>,
}

/// Node image distribution service.
pub struct Distributor {
    store: Arc<dyn ImageStore>,
    tracker: ReferenceTracker,
    reconciler: Reconciler,
    flatcar_channel: String,
}

impl Distributor {
    pub fn new(
        store: Arc<dyn ImageStore>,
        tracker: ReferenceTracker,
        reconciler: Reconciler,
        flatcar_channel: impl Into<String>,
    ) -> Self {
        Self {
            store,
            tracker,
            reconciler,
            flatcar_channel: flatcar_channel.into(),
        }
    }

    /// Wires a distributor from configuration, with wall-clock time and
    /// `tracing` events.
    pub fn from_config(config: &Config, store: Arc<dyn ImageStore>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let events: Arc<dyn EventSink> = Arc::new(TracingSink);

        let tracker = ReferenceTracker::new(store.clone(), clock.clone(), events.clone());
        let reconciler = Reconciler::new(
            store.clone(),
            config.build_registry(),
            Arc::new(config.build_source()),
            config.retention(),
            clock,
            events,
        );

        info!(
            "Distributor configured: providers={:?}, retention={:?}",
            reconciler.providers().tags(),
            config.retention_period
        );

        Self::new(store, tracker, reconciler, config.flatcar_channel.clone())
    }

    /// Returns the record store.
    pub fn store(&self) -> &Arc<dyn ImageStore> {
        &self.store
    }

    /// Returns the reconciler.
    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// `consumer` now requires `image_name`, owned by `provider`.
    pub async fn on_consumer_added(
        &self,
        consumer: &str,
        image_name: &str,
        provider: &str,
    ) -> Result<NodeImage> {
        let spec = NodeImageSpec {
            name: image_name.to_string(),
            provider: provider.to_string(),
        };
        self.tracker.add_reference(image_name, &spec, consumer).await
    }

    /// `consumer` no longer requires `image_name`.
    pub async fn on_consumer_removed(
        &self,
        consumer: &str,
        image_name: &str,
    ) -> Result<Option<NodeImage>> {
        self.tracker.remove_reference(image_name, consumer).await
    }

    /// A release was created; reference the image it needs.
    pub async fn on_release_added(&self, release: &ReleaseDescriptor) -> Result<NodeImage> {
        let request = self.request_for(release)?;
        let spec = NodeImageSpec {
            name: request.image_name,
            provider: request.provider,
        };
        self.tracker
            .add_reference(&request.object_name, &spec, &release.name)
            .await
    }

    /// A release was deleted; drop its reference.
    pub async fn on_release_removed(
        &self,
        release: &ReleaseDescriptor,
    ) -> Result<Option<NodeImage>> {
        let request = self.request_for(release)?;
        self.tracker
            .remove_reference(&request.object_name, &release.name)
            .await
    }

    /// Runs one pass for `name`.
    pub async fn reconcile(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome> {
        self.reconciler.reconcile(name, cancel).await
    }

    /// Requests deletion of `name`.
    pub async fn request_deletion(&self, name: &str) -> Result<()> {
        self.reconciler.request_deletion(name).await
    }

    /// Runs one pass over every record.
    ///
    /// Failures are collected, not propagated; the caller retries on its
    /// own cadence. Stops early on cancellation.
    pub async fn reconcile_all(&self, cancel: &CancellationToken) -> Result<PassReport> {
        let mut report = PassReport::default();

        for image in self.store.list().await? {
            if cancel.is_cancelled() {
                break;
            }
            let name = image.name();
            match self.reconciler.reconcile(name, cancel).await {
                Ok(outcome) => {
                    report.succeeded += 1;
                    if let Some(after) = outcome.requeue_after {
                        report.next_requeue =
                            Some(report.next_requeue.map_or(after, |cur| cur.min(after)));
                    }
                }
                Err(e) => {
                    warn!("Reconcile of {} failed: {}", name, e);
                    report.failed.push((name.to_string(), e.to_string()));
                }
            }
        }

        Ok(report)
    }

    fn request_for(&self, release: &ReleaseDescriptor) -> Result<ImageRequest> {
        node_image_for_release(release, &self.flatcar_channel)
    }
}
