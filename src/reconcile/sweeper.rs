//! Session expiry sweeper.
//!
//! Removes live sessions that have gone quiet. Each expired session gets a
//! final fold (keyed to its own last activity, since the session is already
//! stale) before the row is deleted, so the trailing partial hour is never
//! lost. Fold and delete commit together.

use chrono::{DateTime, Duration, Utc};
use rusqlite::params;

use crate::storage::SharedDatabase;

use super::types::{FoldOutcome, ReconcileError, SweepReport};
use super::worker::{fold_session, with_retry};

/// Sweeper deleting inactive live sessions after a final fold.
pub struct ExpirySweeper {
    db: SharedDatabase,
}

impl ExpirySweeper {
    /// Create a new sweeper over the shared database.
    pub fn new(db: SharedDatabase) -> Self {
        Self { db }
    }

    /// Expire every live session whose last activity is older than
    /// `now − timeout`. Per-session failures are logged and counted; the
    /// failing session stays in the store for the next sweep.
    pub fn expire_inactive_sessions(
        &self,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<SweepReport, ReconcileError> {
        let cutoff = now - timeout;

        let expired: Vec<_> = crate::storage::lock(&self.db)?
            .list_live_sessions()?
            .into_iter()
            .filter(|s| s.last_activity_at < cutoff)
            .collect();

        let mut report = SweepReport::default();

        for session in &expired {
            let result = with_retry(|| {
                let mut db = crate::storage::lock(&self.db)?;
                let tx = db.transaction()?;

                let outcome = fold_session(&tx, session, session.last_activity_at)?;

                tx.execute(
                    "DELETE FROM live_sessions WHERE cyclist_id = ?1",
                    params![session.cyclist_id.to_string()],
                )?;
                tx.commit()?;

                Ok(outcome)
            });

            match result {
                Ok(outcome) => {
                    report.sessions_expired += 1;
                    match outcome {
                        FoldOutcome::Created => report.metrics_created += 1,
                        FoldOutcome::Updated => report.metrics_updated += 1,
                        FoldOutcome::Unchanged | FoldOutcome::Skipped => {}
                    }
                }
                Err(e) => {
                    report.failures += 1;
                    tracing::warn!(
                        cyclist_id = %session.cyclist_id,
                        device_id = %session.device_id,
                        last_activity = %session.last_activity_at,
                        error = %e,
                        "session expiry failed, leaving session for next sweep"
                    );
                }
            }
        }

        if report.sessions_expired > 0 {
            tracing::info!(
                expired = report.sessions_expired,
                created = report.metrics_created,
                updated = report.metrics_updated,
                failures = report.failures,
                "expired inactive sessions"
            );
        }

        Ok(report)
    }
}
