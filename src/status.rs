//! Single write path for record state.
//!
//! Every state transition of a pass goes through [`StatusWriter::set_state`],
//! which re-reads the persisted record and writes only when the state
//! actually changes. Repeated passes over a settled image therefore produce
//! no writes and no change events.

use crate::error::{Error, Result};
use crate::events::{EventSink, ReconcileEvent};
use crate::nodeimage::{NodeImage, NodeImageState};
use crate::store::{ImageStore, retry_on_conflict};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Writes state transitions of one record.
pub struct StatusWriter<'a> {
    store: &'a dyn ImageStore,
    events: &'a dyn EventSink,
    name: &'a str,
}

impl<'a> StatusWriter<'a> {
    pub fn new(store: &'a dyn ImageStore, events: &'a dyn EventSink, name: &'a str) -> Self {
        Self {
            store,
            events,
            name,
        }
    }

    /// Returns the record name.
    pub fn name(&self) -> &str {
        self.name
    }

    /// Moves the record to `state` unless it is already there.
    ///
    /// Fails with [`Error::ImageNotFound`] if the record is gone.
    pub async fn set_state(&self, state: NodeImageState) -> Result<NodeImage> {
        let mut previous = None;
        let mut changed = false;
        let image = retry_on_conflict(self.store, self.name, |image| {
            previous = image.state();
            changed = previous != Some(state);
            if changed {
                image.status.state = Some(state);
            }
            Ok(changed)
        })
        .await?
        .ok_or_else(|| Error::ImageNotFound(self.name.to_string()))?;

        if changed {
            self.events.emit(ReconcileEvent::StateChanged {
                image: self.name.to_string(),
                from: previous,
                to: state,
            });
        }
        Ok(image)
    }

    /// Applies an arbitrary change to the record.
    ///
    /// Fails with [`Error::ImageNotFound`] if the record is gone.
    pub async fn update<F>(&self, mutate: F) -> Result<NodeImage>
    where
        F: FnMut(&mut NodeImage) -> Result<bool> + Send,
    {
        retry_on_conflict(self.store, self.name, mutate)
            .await?
            .ok_or_else(|| Error::ImageNotFound(self.name.to_string()))
    }
}

/// Runs a network-bound call, giving up on cancellation or after `limit`.
pub async fn bounded<T, F>(
    operation: String,
    limit: Duration,
    cancel: &CancellationToken,
    call: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled(operation)),
        result = tokio::time::timeout(limit, call) => match result {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                operation,
                duration: limit,
            }),
        },
    }
}
