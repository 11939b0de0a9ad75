//! Structured reconciliation events.
//!
//! Each decision the reference tracker or the reconciler takes is reported
//! as a typed [`ReconcileEvent`] to an [`EventSink`]. The default sink
//! forwards to `tracing`; [`RecordingSink`] keeps events for assertions.

use crate::nodeimage::NodeImageState;
use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A decision taken for one image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ReconcileEvent {
    RecordCreated {
        image: String,
        provider: String,
    },
    ReferenceAdded {
        image: String,
        consumer: String,
    },
    ReferenceRemoved {
        image: String,
        consumer: String,
    },
    StateChanged {
        image: String,
        from: Option<NodeImageState>,
        to: NodeImageState,
    },
    AlreadyPresent {
        image: String,
        location: String,
    },
    UploadStarted {
        image: String,
        location: String,
        url: String,
    },
    UploadCompleted {
        image: String,
        location: String,
    },
    SourceMissing {
        image: String,
        url: String,
    },
    ProviderNotConfigured {
        image: String,
        provider: String,
    },
    RetentionStarted {
        image: String,
        period: Duration,
    },
    RetentionWaiting {
        image: String,
        remaining: Duration,
    },
    RetentionCancelled {
        image: String,
    },
    DeletionRequested {
        image: String,
    },
    DeletionBlocked {
        image: String,
        releases: usize,
    },
    LocationDeleteFailed {
        image: String,
        location: String,
        reason: String,
    },
    Removed {
        image: String,
    },
}

impl ReconcileEvent {
    /// Returns the image the event is about.
    pub fn image(&self) -> &str {
        match self {
            Self::RecordCreated { image, .. }
            | Self::ReferenceAdded { image, .. }
            | Self::ReferenceRemoved { image, .. }
            | Self::StateChanged { image, .. }
            | Self::AlreadyPresent { image, .. }
            | Self::UploadStarted { image, .. }
            | Self::UploadCompleted { image, .. }
            | Self::SourceMissing { image, .. }
            | Self::ProviderNotConfigured { image, .. }
            | Self::RetentionStarted { image, .. }
            | Self::RetentionWaiting { image, .. }
            | Self::RetentionCancelled { image }
            | Self::DeletionRequested { image }
            | Self::DeletionBlocked { image, .. }
            | Self::LocationDeleteFailed { image, .. }
            | Self::Removed { image } => image,
        }
    }
}

/// Consumer of reconciliation events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ReconcileEvent);
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: ReconcileEvent) {
        match &event {
            ReconcileEvent::StateChanged { image, from, to } => {
                let from = from.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string());
                info!(image = %image, from = %from, to = %to, "State changed");
            }
            ReconcileEvent::UploadStarted {
                image,
                location,
                url,
            } => info!(image = %image, location = %location, url = %url, "Uploading"),
            ReconcileEvent::UploadCompleted { image, location } => {
                info!(image = %image, location = %location, "Upload completed")
            }
            ReconcileEvent::SourceMissing { image, url } => {
                warn!(image = %image, url = %url, "Source artifact not reachable")
            }
            ReconcileEvent::ProviderNotConfigured { image, provider } => {
                warn!(image = %image, provider = %provider, "Provider not configured")
            }
            ReconcileEvent::LocationDeleteFailed {
                image,
                location,
                reason,
            } => warn!(image = %image, location = %location, reason = %reason, "Delete failed"),
            ReconcileEvent::DeletionBlocked { image, releases } => {
                warn!(image = %image, releases = releases, "Deletion blocked by live references")
            }
            ReconcileEvent::RetentionStarted { image, period } => {
                info!(image = %image, period = ?period, "Retention started")
            }
            ReconcileEvent::Removed { image } => info!(image = %image, "Removed"),
            other => match serde_json::to_string(other) {
                Ok(json) => debug!(image = %other.image(), "{}", json),
                Err(_) => debug!(image = %other.image(), "{:?}", other),
            },
        }
    }
}

/// Keeps events in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ReconcileEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every event emitted so far.
    pub fn events(&self) -> Vec<ReconcileEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Returns the states `image` passed through, in order.
    pub fn transitions(&self, image: &str) -> Vec<NodeImageState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ReconcileEvent::StateChanged { image: i, to, .. } if i == image => Some(to),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: ReconcileEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}
