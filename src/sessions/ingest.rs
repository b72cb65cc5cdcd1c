//! Distance ingestion.
//!
//! Entry point for distance deltas reported by counting stations. One call
//! updates the cyclist's live session and the running totals on cyclist,
//! device and group chain as a single transaction, so a partial increment is
//! never observable.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use thiserror::Error;
use uuid::Uuid;

use crate::reconcile::worker::fold_session;
use crate::storage::database::{primary_group_id, row_to_session};
use crate::storage::{DatabaseError, SharedDatabase};

/// Maximum group parent-chain length followed when crediting ancestors.
const MAX_ANCESTOR_DEPTH: usize = 64;

/// Result of a successful ingest call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IngestOutcome {
    /// The delta was recorded.
    Recorded {
        /// Session mileage after this delta.
        session_km: f64,
    },
    /// Distance collection is disabled for the cyclist or device; nothing
    /// was written.
    Skipped,
}

/// Ingestion service: locate-or-create the live session and credit totals.
pub struct IngestService {
    db: SharedDatabase,
}

impl IngestService {
    /// Create a new ingestion service over the shared database.
    pub fn new(db: SharedDatabase) -> Self {
        Self { db }
    }

    /// Record a distance delta for a cyclist on a device.
    ///
    /// If the cyclist's open session belongs to a different device, the old
    /// session is folded into history and closed, and a fresh session starts
    /// on the new device. Mileage is never merged across devices.
    pub fn ingest(
        &self,
        tag: &str,
        hardware_id: &str,
        delta_km: f64,
        at: Option<DateTime<Utc>>,
    ) -> Result<IngestOutcome, IngestError> {
        if !delta_km.is_finite() || delta_km < 0.0 {
            return Err(IngestError::Validation(format!(
                "distance delta must be a non-negative number, got {delta_km}"
            )));
        }

        let mut db = crate::storage::lock(&self.db).map_err(IngestError::from)?;

        let cyclist = db
            .get_cyclist_by_tag(tag)?
            .ok_or_else(|| IngestError::CyclistNotFound(tag.to_string()))?;
        let device = db
            .get_device_by_hardware_id(hardware_id)?
            .ok_or_else(|| IngestError::DeviceNotFound(hardware_id.to_string()))?;

        if !cyclist.collection_enabled {
            tracing::debug!(tag, "distance collection disabled for cyclist, skipping");
            return Ok(IngestOutcome::Skipped);
        }
        if !device.enabled {
            tracing::debug!(hardware_id, "device disabled, skipping");
            return Ok(IngestOutcome::Skipped);
        }

        let now = at.unwrap_or_else(Utc::now);
        let coins = delta_km * crate::storage::Settings::current().coins_per_km;

        let tx = db.transaction()?;

        let session_km = upsert_session(&tx, cyclist.id, device.id, delta_km, now)?;

        tx.execute(
            "UPDATE cyclists SET distance_total_km = distance_total_km + ?2,
             coins_total = coins_total + ?3, last_active_at = ?4 WHERE id = ?1",
            params![
                cyclist.id.to_string(),
                delta_km,
                coins,
                now.to_rfc3339()
            ],
        )
        .map_err(DatabaseError::from)?;

        tx.execute(
            "UPDATE devices SET distance_total_km = distance_total_km + ?2 WHERE id = ?1",
            params![device.id.to_string(), delta_km],
        )
        .map_err(DatabaseError::from)?;

        if let Some(group_id) = primary_group_id(&tx, cyclist.id)? {
            for gid in group_and_ancestors(&tx, group_id)? {
                tx.execute(
                    "UPDATE groups SET distance_total_km = distance_total_km + ?2,
                     coins_total = coins_total + ?3 WHERE id = ?1",
                    params![gid.to_string(), delta_km, coins],
                )
                .map_err(DatabaseError::from)?;
            }
        }

        tx.commit()
            .map_err(|e| DatabaseError::TransactionFailed(e.to_string()))?;

        Ok(IngestOutcome::Recorded { session_km })
    }
}

/// Create or update the cyclist's live session, returning the session
/// mileage after the delta. A device switch closes the old session first.
fn upsert_session(
    tx: &Connection,
    cyclist_id: Uuid,
    device_id: Uuid,
    delta_km: f64,
    now: DateTime<Utc>,
) -> Result<f64, IngestError> {
    let existing = tx
        .query_row(
            "SELECT cyclist_id, device_id, cumulative_km, started_at, last_activity_at
             FROM live_sessions WHERE cyclist_id = ?1",
            params![cyclist_id.to_string()],
            row_to_session,
        )
        .optional()
        .map_err(DatabaseError::from)?;

    match existing {
        Some(session) if session.device_id == device_id => {
            tx.execute(
                "UPDATE live_sessions SET cumulative_km = cumulative_km + ?2,
                 last_activity_at = ?3 WHERE cyclist_id = ?1",
                params![cyclist_id.to_string(), delta_km, now.to_rfc3339()],
            )
            .map_err(DatabaseError::from)?;
            Ok(session.cumulative_km + delta_km)
        }
        Some(session) => {
            // Device switch: settle the old session's history, then start
            // fresh on the new device.
            tracing::info!(
                cyclist_id = %cyclist_id,
                old_device = %session.device_id,
                new_device = %device_id,
                "device switch mid-session, closing previous session"
            );
            fold_session(tx, &session, session.last_activity_at)?;
            tx.execute(
                "DELETE FROM live_sessions WHERE cyclist_id = ?1",
                params![cyclist_id.to_string()],
            )
            .map_err(DatabaseError::from)?;
            insert_session(tx, cyclist_id, device_id, delta_km, now)?;
            Ok(delta_km)
        }
        None => {
            insert_session(tx, cyclist_id, device_id, delta_km, now)?;
            Ok(delta_km)
        }
    }
}

fn insert_session(
    tx: &Connection,
    cyclist_id: Uuid,
    device_id: Uuid,
    delta_km: f64,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    tx.execute(
        "INSERT INTO live_sessions (cyclist_id, device_id, cumulative_km, started_at, last_activity_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            cyclist_id.to_string(),
            device_id.to_string(),
            delta_km,
            now.to_rfc3339(),
            now.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// The group itself plus its ancestors, nearest first. Cycle-safe.
fn group_and_ancestors(
    conn: &Connection,
    group_id: Uuid,
) -> Result<Vec<Uuid>, DatabaseError> {
    let mut chain = vec![group_id];
    let mut visited: HashSet<Uuid> = chain.iter().copied().collect();

    let mut current = group_id;
    for _ in 0..MAX_ANCESTOR_DEPTH {
        let parent: Option<String> = conn
            .query_row(
                "SELECT parent_id FROM groups WHERE id = ?1",
                params![current.to_string()],
                |row| row.get(0),
            )
            .optional()?
            .flatten();

        let parent = match parent {
            Some(p) => Uuid::parse_str(&p)
                .map_err(|e| DatabaseError::InvalidData(format!("group parent id: {e}")))?,
            None => break,
        };

        if !visited.insert(parent) {
            tracing::warn!(group_id = %group_id, "cycle detected in group parent chain");
            break;
        }
        chain.push(parent);
        current = parent;
    }

    Ok(chain)
}

/// Ingestion errors.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Cyclist not found for tag: {0}")]
    CyclistNotFound(String),

    #[error("Device not found for hardware id: {0}")]
    DeviceNotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}
