//! # image-distributor
//!
//! **Node Image Lifecycle Reconciliation**
//!
//! Propagates node images (Flatcar + Kubernetes + tooling OVAs) from a
//! central S3 bucket into the image catalogs of one or more infrastructure
//! providers, keeps them there while any release needs them, and removes
//! them once nothing does.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                         image-distributor                           │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │   release feed                          timer / record change       │
//! │        │                                         │                  │
//! │        ▼                                         ▼                  │
//! │  ┌──────────────────┐                 ┌─────────────────────────┐   │
//! │  │ ReferenceTracker │                 │       Reconciler        │   │
//! │  │ add / remove     │                 │ deletion → retention →  │   │
//! │  │ consumer         │                 │ source → fan-out        │   │
//! │  └────────┬─────────┘                 └──┬──────────┬───────────┘   │
//! │           │                              │          │               │
//! │           ▼                              ▼          ▼               │
//! │  ┌──────────────────────────────┐  ┌──────────┐ ┌────────────────┐  │
//! │  │ ImageStore (versioned)       │  │Retention │ │ LocationFanOut │  │
//! │  │ MemoryStore │ FileStore      │  │ Policy   │ │ ensure │ sweep │  │
//! │  └──────────────────────────────┘  └──────────┘ └───────┬────────┘  │
//! ├─────────────────────────────────────────────────────────┼───────────┤
//! │                     Provider backends (by tag)          ▼           │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────────┐   │
//! │  │ NoopProvider │  │MemoryProvider│  │ external SDK backends    │   │
//! │  │   (test)     │  │  (dry run)   │  │ (hypervisor, cloud cat.) │   │
//! │  └──────────────┘  └──────────────┘  └──────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Image Lifecycle
//!
//! ```text
//!   ┌─────────┐  ref   ┌─────────┐        ┌───────────┐        ┌───────────┐
//!   │ (none)  │ ─────► │ Pending │ ─────► │ Uploading │ ─────► │ Available │ ◄─┐
//!   └─────────┘        └─────────┘        └───────────┘        └─────┬─────┘   │
//!                           ▲                                        │         │
//!                           │ re-ref                      unref      │  source │
//!                           │                                        ▼  back   │
//!                     ┌─────┴────────────┐  window     ┌──────────┐ ┌─────────┐ │
//!                     │ AwaitingDeletion │ ──────────► │ Deleting │ │ Missing │─┘
//!                     └──────────────────┘  elapsed    └────┬─────┘ └─────────┘
//!                                                           ▼
//!                                                      ┌─────────┐
//!                                                      │ Deleted │ (record removed)
//!                                                      └─────────┘
//! ```
//!
//! Any step can land in `Error`; the next pass retries from scratch.
//!
//! # Guarantees
//!
//! - **Idempotent upload**: `exists` is always checked before `create`.
//! - **Idempotent deletion**: provider deletes succeed on absent images.
//! - **No lost references**: every write re-reads and retries on conflict.
//! - **Never-referenced guard**: a freshly created record is never deleted.
//!
//! # Example
//!
//! ```rust,ignore
//! use image_distributor::{Config, Distributor, MemoryStore};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> image_distributor::Result<()> {
//!     let config = Config::load("config.yaml".as_ref())?;
//!     let distributor = Distributor::from_config(&config, Arc::new(MemoryStore::new()));
//!
//!     distributor
//!         .on_consumer_added("vsphere-30.1.0", "flatcar-stable-3975.2.0-kube-1.30.4-tooling-1.18.1-gs", "capv")
//!         .await?;
//!     let outcome = distributor
//!         .reconcile("flatcar-stable-3975.2.0-kube-1.30.4-tooling-1.18.1-gs", &CancellationToken::new())
//!         .await?;
//!     println!("requeue after {:?}", outcome.requeue_after);
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod config;
pub mod constants;
pub mod distributor;
pub mod error;
pub mod events;
pub mod fanout;
pub mod nodeimage;
pub mod provider;
pub mod reconciler;
pub mod references;
pub mod release;
pub mod retention;
pub mod source;
pub mod status;
pub mod store;

pub mod providers;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, ProviderConfig, ProviderKind, SourceConfig, parse_duration};
pub use constants::*;
pub use distributor::{Distributor, PassReport};
pub use error::{Error, ErrorKind, Result};
pub use events::{EventSink, ReconcileEvent, RecordingSink, TracingSink};
pub use fanout::{EnsureOutcome, LocationFanOut};
pub use nodeimage::{NodeImage, NodeImageSpec, NodeImageState, NodeImageStatus, ObjectMeta};
pub use provider::{Location, Provider};
pub use providers::{MemoryProvider, NoopProvider, ProviderCall, ProviderOp, ProviderRegistry};
pub use reconciler::{ReconcileOutcome, Reconciler};
pub use references::ReferenceTracker;
pub use release::{ImageRequest, ReleaseComponent, ReleaseDescriptor, node_image_for_release};
pub use retention::{RetentionDecision, RetentionPolicy};
pub use source::{S3Source, SourceResolver, image_key};
pub use status::StatusWriter;
pub use store::{FileStore, ImageStore, MemoryStore, retry_on_conflict};
