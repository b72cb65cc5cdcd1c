//! Reconciliation worker: folds live sessions into hourly metrics.
//!
//! Runs once per scheduler tick. For every live session it computes the
//! distance attributable to the current hour bucket and upserts it into
//! `hourly_metrics` under a monotonic merge: an existing value is only ever
//! raised, never lowered, which makes repeated runs idempotent and guards
//! against out-of-order ticks.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::time::Duration;
use uuid::Uuid;

use crate::sessions::types::LiveSession;
use crate::storage::database::primary_group_id;
use crate::storage::{DatabaseError, SharedDatabase};

use super::types::{truncate_to_hour, FoldOutcome, ReconcileError, ReconcileReport};

/// Attempts for transient (locked/busy) store failures.
const RETRY_ATTEMPTS: u32 = 3;
/// Base backoff between retry attempts.
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Periodic worker folding live sessions into hour-bucketed history.
pub struct ReconcileWorker {
    db: SharedDatabase,
}

impl ReconcileWorker {
    /// Create a new worker over the shared database.
    pub fn new(db: SharedDatabase) -> Self {
        Self { db }
    }

    /// Fold every live session's accumulated distance into the hour bucket
    /// containing `now`.
    ///
    /// Per-session failures are logged and counted; they never abort the
    /// rest of the batch. Running this twice without intervening ingestion
    /// produces no additional writes.
    pub fn reconcile_active_sessions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<ReconcileReport, ReconcileError> {
        let sessions = crate::storage::lock(&self.db)?.list_live_sessions()?;

        let mut report = ReconcileReport {
            sessions_seen: sessions.len() as u32,
            ..Default::default()
        };

        for session in &sessions {
            let result = with_retry(|| {
                let db = crate::storage::lock(&self.db)?;
                fold_session(db.connection(), session, now)
            });

            match result {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    report.failures += 1;
                    tracing::warn!(
                        cyclist_id = %session.cyclist_id,
                        device_id = %session.device_id,
                        hour = %truncate_to_hour(now),
                        error = %e,
                        "session fold failed, continuing with remaining sessions"
                    );
                }
            }
        }

        tracing::debug!(
            sessions = report.sessions_seen,
            created = report.metrics_created,
            updated = report.metrics_updated,
            failures = report.failures,
            "reconcile tick complete"
        );

        Ok(report)
    }
}

/// Fold one live session into the hour bucket containing `reference`.
///
/// The hour value is re-derived on every call: for a session that started in
/// an earlier hour, `cumulative_km` is session-relative, so the share
/// belonging to the current hour is
/// `(history before session start) + cumulative − (history before this hour)`.
/// The upsert never lowers a stored value; the group snapshot on an existing
/// row follows the cyclist's current primary group even when the value stands.
pub(crate) fn fold_session(
    conn: &Connection,
    session: &LiveSession,
    reference: DateTime<Utc>,
) -> Result<FoldOutcome, DatabaseError> {
    if session.cumulative_km <= 0.0 {
        return Ok(FoldOutcome::Skipped);
    }

    let hour_bucket = truncate_to_hour(reference);
    let session_start_hour = truncate_to_hour(session.started_at);

    let value_for_this_hour = if session_start_hour == hour_bucket {
        // The whole session so far belongs to this hour.
        session.cumulative_km
    } else {
        let at_session_start =
            sum_metrics_before(conn, session.cyclist_id, session.device_id, session_start_hour)?;
        let at_hour_start =
            sum_metrics_before(conn, session.cyclist_id, session.device_id, hour_bucket)?;
        at_session_start + session.cumulative_km - at_hour_start
    };

    let existing: Option<(f64, Option<String>)> = conn
        .query_row(
            "SELECT distance_km, group_id FROM hourly_metrics
             WHERE cyclist_id = ?1 AND device_id = ?2 AND hour_ts = ?3",
            params![
                session.cyclist_id.to_string(),
                session.device_id.to_string(),
                hour_bucket.to_rfc3339(),
            ],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match existing {
        None => {
            if value_for_this_hour <= 0.0 {
                return Ok(FoldOutcome::Skipped);
            }
            let group_id = primary_group_id(conn, session.cyclist_id)?;
            conn.execute(
                "INSERT INTO hourly_metrics (id, cyclist_id, device_id, hour_ts, distance_km, group_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    Uuid::new_v4().to_string(),
                    session.cyclist_id.to_string(),
                    session.device_id.to_string(),
                    hour_bucket.to_rfc3339(),
                    value_for_this_hour,
                    group_id.map(|g| g.to_string()),
                ],
            )?;
            Ok(FoldOutcome::Created)
        }
        Some((stored, stored_group)) => {
            let group_id =
                primary_group_id(conn, session.cyclist_id)?.map(|g| g.to_string());

            // Monotonic merge: only overwrite with a strictly larger value.
            if value_for_this_hour > stored {
                conn.execute(
                    "UPDATE hourly_metrics SET distance_km = ?4, group_id = ?5
                     WHERE cyclist_id = ?1 AND device_id = ?2 AND hour_ts = ?3",
                    params![
                        session.cyclist_id.to_string(),
                        session.device_id.to_string(),
                        hour_bucket.to_rfc3339(),
                        value_for_this_hour,
                        group_id,
                    ],
                )?;
                Ok(FoldOutcome::Updated)
            } else {
                // The value stands, but a membership change mid-session
                // still retargets the stored group snapshot.
                if group_id != stored_group {
                    conn.execute(
                        "UPDATE hourly_metrics SET group_id = ?4
                         WHERE cyclist_id = ?1 AND device_id = ?2 AND hour_ts = ?3",
                        params![
                            session.cyclist_id.to_string(),
                            session.device_id.to_string(),
                            hour_bucket.to_rfc3339(),
                            group_id,
                        ],
                    )?;
                }
                Ok(FoldOutcome::Unchanged)
            }
        }
    }
}

/// Sum of hourly metrics for a (cyclist, device) pair strictly before a
/// bucket boundary.
fn sum_metrics_before(
    conn: &Connection,
    cyclist_id: Uuid,
    device_id: Uuid,
    before: DateTime<Utc>,
) -> Result<f64, DatabaseError> {
    conn.query_row(
        "SELECT COALESCE(SUM(distance_km), 0.0) FROM hourly_metrics
         WHERE cyclist_id = ?1 AND device_id = ?2 AND hour_ts < ?3",
        params![
            cyclist_id.to_string(),
            device_id.to_string(),
            before.to_rfc3339(),
        ],
        |row| row.get(0),
    )
    .map_err(DatabaseError::from)
}

/// Run an operation, retrying a bounded number of times when the store
/// reports a transient lock/busy condition.
pub(crate) fn with_retry<T>(
    mut op: impl FnMut() -> Result<T, DatabaseError>,
) -> Result<T, DatabaseError> {
    let mut attempt = 0;
    loop {
        match op() {
            Err(e) if e.is_transient() && attempt + 1 < RETRY_ATTEMPTS => {
                attempt += 1;
                tracing::debug!(attempt, error = %e, "transient store error, retrying");
                std::thread::sleep(RETRY_BACKOFF * attempt);
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::groups::Group;
    use crate::registry::{Cyclist, Device};
    use crate::storage::Database;
    use chrono::TimeZone;

    fn setup() -> (Database, Cyclist, Device) {
        let db = Database::open_in_memory().expect("Failed to create database");
        let cyclist = Cyclist::new("TAG-1", "Alex");
        let device = Device::new("HW-1", "Counter");
        db.insert_cyclist(&cyclist).unwrap();
        db.insert_device(&device).unwrap();
        (db, cyclist, device)
    }

    fn insert_session(db: &Database, session: &LiveSession) {
        db.connection()
            .execute(
                "INSERT INTO live_sessions (cyclist_id, device_id, cumulative_km, started_at, last_activity_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    session.cyclist_id.to_string(),
                    session.device_id.to_string(),
                    session.cumulative_km,
                    session.started_at.to_rfc3339(),
                    session.last_activity_at.to_rfc3339(),
                ],
            )
            .unwrap();
    }

    fn set_session_mileage(db: &Database, cyclist_id: Uuid, km: f64) {
        db.connection()
            .execute(
                "UPDATE live_sessions SET cumulative_km = ?2 WHERE cyclist_id = ?1",
                params![cyclist_id.to_string(), km],
            )
            .unwrap();
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 10, h, m, 0).unwrap()
    }

    #[test]
    fn test_truncate_to_hour() {
        let ts = at(9, 42);
        assert_eq!(truncate_to_hour(ts), at(9, 0));
        assert_eq!(truncate_to_hour(at(9, 0)), at(9, 0));
    }

    #[test]
    fn test_fold_same_hour_writes_cumulative() {
        let (db, cyclist, device) = setup();
        let session = LiveSession {
            cyclist_id: cyclist.id,
            device_id: device.id,
            cumulative_km: 1.5,
            started_at: at(9, 5),
            last_activity_at: at(9, 10),
        };
        insert_session(&db, &session);

        let outcome = fold_session(db.connection(), &session, at(9, 10)).unwrap();
        assert_eq!(outcome, FoldOutcome::Created);

        let value = db.get_metric_value(cyclist.id, device.id, at(9, 0)).unwrap();
        assert_eq!(value, Some(1.5));
    }

    #[test]
    fn test_fold_is_idempotent() {
        let (db, cyclist, device) = setup();
        let session = LiveSession {
            cyclist_id: cyclist.id,
            device_id: device.id,
            cumulative_km: 2.0,
            started_at: at(9, 5),
            last_activity_at: at(9, 10),
        };
        insert_session(&db, &session);

        assert_eq!(
            fold_session(db.connection(), &session, at(9, 10)).unwrap(),
            FoldOutcome::Created
        );
        assert_eq!(
            fold_session(db.connection(), &session, at(9, 10)).unwrap(),
            FoldOutcome::Unchanged
        );
        assert_eq!(db.count_metrics_for_pair(cyclist.id, device.id).unwrap(), 1);
    }

    #[test]
    fn test_fold_skips_zero_mileage() {
        let (db, cyclist, device) = setup();
        let session = LiveSession {
            cyclist_id: cyclist.id,
            device_id: device.id,
            cumulative_km: 0.0,
            started_at: at(9, 5),
            last_activity_at: at(9, 5),
        };
        insert_session(&db, &session);

        assert_eq!(
            fold_session(db.connection(), &session, at(9, 10)).unwrap(),
            FoldOutcome::Skipped
        );
        assert_eq!(db.count_metrics_for_pair(cyclist.id, device.id).unwrap(), 0);
    }

    #[test]
    fn test_fold_splits_across_hours() {
        let (db, cyclist, device) = setup();
        let mut session = LiveSession {
            cyclist_id: cyclist.id,
            device_id: device.id,
            cumulative_km: 3.0,
            started_at: at(9, 5),
            last_activity_at: at(9, 55),
        };
        insert_session(&db, &session);

        // Fold at the end of hour 9: the whole 3.0 km lands in hour 9.
        fold_session(db.connection(), &session, at(9, 55)).unwrap();

        // The ride continues into hour 10, reaching 5.0 km total.
        session.cumulative_km = 5.0;
        session.last_activity_at = at(10, 20);
        set_session_mileage(&db, cyclist.id, 5.0);

        fold_session(db.connection(), &session, at(10, 20)).unwrap();

        assert_eq!(
            db.get_metric_value(cyclist.id, device.id, at(9, 0)).unwrap(),
            Some(3.0)
        );
        assert_eq!(
            db.get_metric_value(cyclist.id, device.id, at(10, 0)).unwrap(),
            Some(2.0)
        );
    }

    #[test]
    fn test_fold_monotonic_merge_never_decreases() {
        let (db, cyclist, device) = setup();
        let session = LiveSession {
            cyclist_id: cyclist.id,
            device_id: device.id,
            cumulative_km: 4.0,
            started_at: at(9, 5),
            last_activity_at: at(9, 30),
        };
        insert_session(&db, &session);
        fold_session(db.connection(), &session, at(9, 30)).unwrap();

        // A recomputation producing a smaller value must not lower the row.
        let smaller = LiveSession {
            cumulative_km: 2.5,
            ..session.clone()
        };
        assert_eq!(
            fold_session(db.connection(), &smaller, at(9, 30)).unwrap(),
            FoldOutcome::Unchanged
        );
        assert_eq!(
            db.get_metric_value(cyclist.id, device.id, at(9, 0)).unwrap(),
            Some(4.0)
        );
    }

    #[test]
    fn test_fold_snapshots_primary_group() {
        let (db, cyclist, device) = setup();
        let class = Group::new("5a", "5a");
        db.insert_group(&class).unwrap();
        db.add_cyclist_to_group(cyclist.id, class.id).unwrap();

        let session = LiveSession {
            cyclist_id: cyclist.id,
            device_id: device.id,
            cumulative_km: 1.0,
            started_at: at(9, 5),
            last_activity_at: at(9, 10),
        };
        insert_session(&db, &session);
        fold_session(db.connection(), &session, at(9, 10)).unwrap();

        let group_id: Option<String> = db
            .connection()
            .query_row(
                "SELECT group_id FROM hourly_metrics WHERE cyclist_id = ?1",
                params![cyclist.id.to_string()],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(group_id, Some(class.id.to_string()));
    }

    #[test]
    fn test_unchanged_fold_refreshes_group_snapshot() {
        let (db, cyclist, device) = setup();
        let old_class = Group::new("5a", "5a");
        let new_class = Group::new("5b", "5b");
        db.insert_group(&old_class).unwrap();
        db.insert_group(&new_class).unwrap();
        db.add_cyclist_to_group(cyclist.id, old_class.id).unwrap();

        let session = LiveSession {
            cyclist_id: cyclist.id,
            device_id: device.id,
            cumulative_km: 2.0,
            started_at: at(9, 5),
            last_activity_at: at(9, 10),
        };
        insert_session(&db, &session);
        fold_session(db.connection(), &session, at(9, 10)).unwrap();

        // Membership moves to a different class mid-session.
        db.connection()
            .execute(
                "DELETE FROM cyclist_groups WHERE cyclist_id = ?1",
                params![cyclist.id.to_string()],
            )
            .unwrap();
        db.add_cyclist_to_group(cyclist.id, new_class.id).unwrap();

        // No new distance: the value stands but the snapshot must move.
        assert_eq!(
            fold_session(db.connection(), &session, at(9, 10)).unwrap(),
            FoldOutcome::Unchanged
        );

        let group_id: Option<String> = db
            .connection()
            .query_row(
                "SELECT group_id FROM hourly_metrics WHERE cyclist_id = ?1",
                params![cyclist.id.to_string()],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(group_id, Some(new_class.id.to_string()));
        assert_eq!(
            db.get_metric_value(cyclist.id, device.id, at(9, 0)).unwrap(),
            Some(2.0)
        );
    }

    #[test]
    fn test_fold_failure_does_not_abort_batch() {
        let (db, cyclist, device) = setup();

        // Second cyclist whose membership points at a group row with a
        // corrupt id, so its fold fails at the snapshot lookup.
        let broken = Cyclist::new("TAG-2", "Billie");
        db.insert_cyclist(&broken).unwrap();
        db.connection()
            .execute(
                "INSERT INTO groups (id, name, short_label, created_at)
                 VALUES ('not-a-uuid', 'Broken', 'BR', '2025-06-10T08:00:00+00:00')",
                [],
            )
            .unwrap();
        db.connection()
            .execute(
                "INSERT INTO cyclist_groups (id, cyclist_id, group_id, joined_at)
                 VALUES (?1, ?2, 'not-a-uuid', '2025-06-10T08:00:00+00:00')",
                params![Uuid::new_v4().to_string(), broken.id.to_string()],
            )
            .unwrap();

        for id in [cyclist.id, broken.id] {
            insert_session(
                &db,
                &LiveSession {
                    cyclist_id: id,
                    device_id: device.id,
                    cumulative_km: 1.0,
                    started_at: at(9, 5),
                    last_activity_at: at(9, 10),
                },
            );
        }

        let db = crate::storage::shared(db);
        let worker = ReconcileWorker::new(db.clone());
        let report = worker.reconcile_active_sessions(at(9, 10)).unwrap();

        assert_eq!(report.sessions_seen, 2);
        assert_eq!(report.metrics_created, 1);
        assert_eq!(report.failures, 1);

        // The healthy session folded despite its neighbour failing.
        let guard = crate::storage::lock(&db).unwrap();
        assert_eq!(
            guard.get_metric_value(cyclist.id, device.id, at(9, 0)).unwrap(),
            Some(1.0)
        );
    }

    #[test]
    fn test_with_retry_recovers_from_transient_errors() {
        let mut calls = 0;
        let result = with_retry(|| {
            calls += 1;
            if calls < 3 {
                Err(DatabaseError::QueryFailed("database is locked".to_string()))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);

        // Attempts are bounded; the last error surfaces.
        let mut calls = 0;
        let err = with_retry(|| -> Result<(), DatabaseError> {
            calls += 1;
            Err(DatabaseError::QueryFailed("database is locked".to_string()))
        })
        .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(calls, RETRY_ATTEMPTS);

        // Non-transient failures are not retried.
        let mut calls = 0;
        let _ = with_retry(|| -> Result<(), DatabaseError> {
            calls += 1;
            Err(DatabaseError::InvalidData("bad row".to_string()))
        });
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_worker_reports_counts() {
        let (db, cyclist, device) = setup();
        let session = LiveSession {
            cyclist_id: cyclist.id,
            device_id: device.id,
            cumulative_km: 1.5,
            started_at: at(9, 5),
            last_activity_at: at(9, 10),
        };
        insert_session(&db, &session);

        let worker = ReconcileWorker::new(crate::storage::shared(db));
        let report = worker.reconcile_active_sessions(at(9, 10)).unwrap();
        assert_eq!(report.sessions_seen, 1);
        assert_eq!(report.metrics_created, 1);
        assert_eq!(report.metrics_updated, 0);
        assert_eq!(report.failures, 0);

        // Second run with no new ingestion: zero additional writes.
        let report = worker.reconcile_active_sessions(at(9, 10)).unwrap();
        assert_eq!(report.metrics_created, 0);
        assert_eq!(report.metrics_updated, 0);
    }
}
