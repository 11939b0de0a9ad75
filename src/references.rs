//! Reference tracking.
//!
//! Keeps `status.releases` of each record equal to the set of consumers
//! currently requiring the image. Records are created on first reference;
//! removal of the last reference only empties the set and leaves the
//! retention decision to the reconciler.
//!
//! All writes are read-modify-write against the persisted record through
//! [`retry_on_conflict`], so concurrent adds and removes for different
//! consumers of the same image are never lost.

use crate::clock::Clock;
use crate::constants::MAX_CONFLICT_RETRIES;
use crate::error::{Error, Result};
use crate::events::{EventSink, ReconcileEvent};
use crate::nodeimage::{
    NodeImage, NodeImageSpec, NodeImageState, validate_consumer_id, validate_image_name,
};
use crate::store::{ImageStore, retry_on_conflict};
use std::sync::Arc;
use tracing::debug;

/// Maintains the consumer set of node image records.
pub struct ReferenceTracker {
    store: Arc<dyn ImageStore>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
}

impl ReferenceTracker {
    pub fn new(
        store: Arc<dyn ImageStore>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            clock,
            events,
        }
    }

    /// Records that `consumer` requires the image `name`.
    ///
    /// Creates the record if needed. A renewed reference cancels a pending
    /// retention window or deletion request. Adding a consumer twice is a
    /// no-op. Fails with [`Error::ProviderMismatch`] if the record exists
    /// under another provider.
    pub async fn add_reference(
        &self,
        name: &str,
        spec: &NodeImageSpec,
        consumer: &str,
    ) -> Result<NodeImage> {
        validate_image_name(name)?;
        validate_consumer_id(consumer)?;

        for _ in 0..MAX_CONFLICT_RETRIES {
            self.ensure_record(name, spec).await?;

            let mut added = false;
            let mut previous = None;
            let updated = retry_on_conflict(self.store.as_ref(), name, |image| {
                if image.spec.provider != spec.provider {
                    return Err(Error::ProviderMismatch {
                        image: name.to_string(),
                        existing: image.spec.provider.clone(),
                        requested: spec.provider.clone(),
                    });
                }
                previous = image.state();
                added = image.add_release(consumer);
                let cancelled = image.cancel_retention();
                Ok(added || cancelled)
            })
            .await?;

            // Removed between create and update; start over.
            let Some(image) = updated else {
                debug!("Record {} vanished while adding {}, retrying", name, consumer);
                continue;
            };

            if added {
                self.events.emit(ReconcileEvent::ReferenceAdded {
                    image: name.to_string(),
                    consumer: consumer.to_string(),
                });
            }
            if previous == Some(NodeImageState::AwaitingDeletion) {
                self.events.emit(ReconcileEvent::RetentionCancelled {
                    image: name.to_string(),
                });
            }
            if let Some(to) = image.state()
                && previous != Some(to)
            {
                self.events.emit(ReconcileEvent::StateChanged {
                    image: name.to_string(),
                    from: previous,
                    to,
                });
            }
            return Ok(image);
        }

        Err(Error::ConflictRetriesExhausted {
            name: name.to_string(),
            attempts: MAX_CONFLICT_RETRIES,
        })
    }

    /// Records that `consumer` no longer requires the image `name`.
    ///
    /// Absent records and unknown consumers are no-ops. Returns the current
    /// record, if any.
    pub async fn remove_reference(&self, name: &str, consumer: &str) -> Result<Option<NodeImage>> {
        validate_consumer_id(consumer)?;

        let mut removed = false;
        let updated = retry_on_conflict(self.store.as_ref(), name, |image| {
            removed = image.remove_release(consumer);
            Ok(removed)
        })
        .await?;

        if removed && updated.is_some() {
            self.events.emit(ReconcileEvent::ReferenceRemoved {
                image: name.to_string(),
                consumer: consumer.to_string(),
            });
        }
        Ok(updated)
    }

    async fn ensure_record(&self, name: &str, spec: &NodeImageSpec) -> Result<()> {
        if self.store.get(name).await?.is_some() {
            return Ok(());
        }

        let image = NodeImage::new(name, spec.clone(), self.clock.now());
        match self.store.create(image).await {
            Ok(_) => {
                self.events.emit(ReconcileEvent::RecordCreated {
                    image: name.to_string(),
                    provider: spec.provider.clone(),
                });
                Ok(())
            }
            // Lost the race to another consumer.
            Err(Error::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
