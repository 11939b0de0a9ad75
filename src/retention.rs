//! Retention of unreferenced images.
//!
//! ```text
//!                 releases empty, state set
//!   referenced ─────────────────────────────┬──▶ period == 0 ──▶ DeleteNow
//!                                           │
//!                                           └──▶ period > 0 ───▶ StartGracePeriod
//!                                                                     │
//!   AwaitingDeletion, lastUsedAt + period > now ──▶ Wait(remaining) ◀─┘
//!   AwaitingDeletion, lastUsedAt + period <= now ─▶ DeleteNow
//! ```
//!
//! A record that was never reconciled (no state) is never eligible, even
//! with an empty consumer set: the reference tracker creates the record and
//! fills in the first consumer in two separate writes.

use crate::nodeimage::{NodeImage, NodeImageState};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// What to do with an image this pass, as far as retention goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionDecision {
    /// Referenced, or never reconciled.
    NotEligible,
    /// Delete in this pass.
    DeleteNow,
    /// Enter `AwaitingDeletion` and look again after the period.
    StartGracePeriod { requeue_after: Duration },
    /// Still inside the window.
    Wait { remaining: Duration },
}

/// How long unreferenced images are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    period: Duration,
}

impl RetentionPolicy {
    /// Creates a policy. A zero period deletes unreferenced images at once.
    pub fn new(period: Duration) -> Self {
        Self { period }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Decides the retention step for `image` at `now`.
    pub fn evaluate(&self, image: &NodeImage, now: DateTime<Utc>) -> RetentionDecision {
        if image.is_referenced() {
            return RetentionDecision::NotEligible;
        }
        let Some(state) = image.state() else {
            return RetentionDecision::NotEligible;
        };

        if self.period.is_zero() {
            return RetentionDecision::DeleteNow;
        }

        match (state, image.last_used_at()) {
            (NodeImageState::AwaitingDeletion, Some(last_used)) => {
                // Clock skew can put the stamp in the future; count that as zero.
                let elapsed = (now - last_used).to_std().unwrap_or(Duration::ZERO);
                if elapsed >= self.period {
                    RetentionDecision::DeleteNow
                } else {
                    RetentionDecision::Wait {
                        remaining: self.period - elapsed,
                    }
                }
            }
            _ => RetentionDecision::StartGracePeriod {
                requeue_after: self.period,
            },
        }
    }
}
