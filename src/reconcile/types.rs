//! Reconciliation worker types.

use chrono::{DateTime, Timelike, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::storage::DatabaseError;

/// Truncate a timestamp to its hour bucket (minutes/seconds/subseconds zeroed).
pub fn truncate_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        // Only fails on out-of-range values, which 0 never is.
        .unwrap_or(ts)
}

/// What a single fold did to the hourly metric store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldOutcome {
    /// A new metric row was created for the hour.
    Created,
    /// An existing row was raised to a larger value.
    Updated,
    /// The stored value already covers the session (idempotent re-run).
    Unchanged,
    /// Nothing to fold (non-positive session mileage or hour value).
    Skipped,
}

/// Counts reported by one `reconcile_active_sessions` run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub sessions_seen: u32,
    pub metrics_created: u32,
    pub metrics_updated: u32,
    pub failures: u32,
}

impl ReconcileReport {
    pub(crate) fn record(&mut self, outcome: FoldOutcome) {
        match outcome {
            FoldOutcome::Created => self.metrics_created += 1,
            FoldOutcome::Updated => self.metrics_updated += 1,
            FoldOutcome::Unchanged | FoldOutcome::Skipped => {}
        }
    }
}

/// Counts reported by one `expire_inactive_sessions` run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub sessions_expired: u32,
    pub metrics_created: u32,
    pub metrics_updated: u32,
    pub failures: u32,
}

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Session for cyclist {0} failed to fold: {1}")]
    FoldFailed(Uuid, String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}
