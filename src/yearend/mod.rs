//! Year-end snapshot and reset.
//!
//! Snapshots the running totals of a top-level group's whole subtree
//! (groups, member cyclists, assigned devices), then zeroes them, as one
//! all-or-nothing transaction. The hourly metric history and live sessions
//! are deliberately untouched: history stays queryable across years. A
//! snapshot supports a one-shot undo that restores the totals and marks the
//! snapshot consumed.

use chrono::{Datelike, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use thiserror::Error;
use uuid::Uuid;

use crate::groups::GroupForest;
use crate::storage::{DatabaseError, SharedDatabase};

/// Counts from one reset run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YearEndSummary {
    pub snapshot_id: Uuid,
    pub groups: u32,
    pub cyclists: u32,
    pub devices: u32,
}

/// Service performing the year-end snapshot + reset and its undo.
pub struct YearEndService {
    db: SharedDatabase,
}

impl YearEndService {
    /// Create a new year-end service over the shared database.
    pub fn new(db: SharedDatabase) -> Self {
        Self { db }
    }

    /// Snapshot and zero the totals of a top-level group's subtree.
    pub fn reset(&self, group_id: Uuid) -> Result<YearEndSummary, YearEndError> {
        let mut db = crate::storage::lock(&self.db)?;

        let groups = db.list_groups()?;
        let root = groups
            .iter()
            .find(|g| g.id == group_id)
            .ok_or(YearEndError::GroupNotFound(group_id))?;
        if root.parent_id.is_some() {
            return Err(YearEndError::NotTopLevel(group_id));
        }

        let forest = GroupForest::from_groups(&groups);
        let mut subtree = vec![group_id];
        subtree.extend(forest.descendants(group_id));
        let subtree_set: HashSet<Uuid> = subtree.iter().copied().collect();

        let snapshot_id = Uuid::new_v4();
        let year = Utc::now().year();

        let tx = db.transaction()?;

        tx.execute(
            "INSERT INTO year_snapshots (id, group_id, year, taken_at, consumed)
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![
                snapshot_id.to_string(),
                group_id.to_string(),
                year,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(DatabaseError::from)?;

        let mut summary = YearEndSummary {
            snapshot_id,
            groups: 0,
            cyclists: 0,
            devices: 0,
        };

        for g in groups.iter().filter(|g| subtree_set.contains(&g.id)) {
            snapshot_detail(&tx, snapshot_id, "group", g.id, g.distance_total_km, g.coins_total)?;
            tx.execute(
                "UPDATE groups SET distance_total_km = 0.0, coins_total = 0.0 WHERE id = ?1",
                params![g.id.to_string()],
            )
            .map_err(DatabaseError::from)?;
            summary.groups += 1;
        }

        for (id, distance, coins) in subtree_cyclists(&tx, &subtree)? {
            snapshot_detail(&tx, snapshot_id, "cyclist", id, distance, coins)?;
            tx.execute(
                "UPDATE cyclists SET distance_total_km = 0.0, coins_total = 0.0 WHERE id = ?1",
                params![id.to_string()],
            )
            .map_err(DatabaseError::from)?;
            summary.cyclists += 1;
        }

        for (id, distance) in subtree_devices(&tx, &subtree)? {
            snapshot_detail(&tx, snapshot_id, "device", id, distance, 0.0)?;
            tx.execute(
                "UPDATE devices SET distance_total_km = 0.0 WHERE id = ?1",
                params![id.to_string()],
            )
            .map_err(DatabaseError::from)?;
            summary.devices += 1;
        }

        tx.commit()
            .map_err(|e| DatabaseError::TransactionFailed(e.to_string()))?;

        tracing::info!(
            group_id = %group_id,
            year,
            groups = summary.groups,
            cyclists = summary.cyclists,
            devices = summary.devices,
            "year-end totals snapshotted and reset"
        );

        Ok(summary)
    }

    /// Restore totals from an unconsumed snapshot and mark it consumed.
    pub fn undo(&self, snapshot_id: Uuid) -> Result<(), YearEndError> {
        let mut db = crate::storage::lock(&self.db)?;
        let tx = db.transaction()?;

        let consumed: Option<bool> = tx
            .query_row(
                "SELECT consumed FROM year_snapshots WHERE id = ?1",
                params![snapshot_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(DatabaseError::from)?;

        match consumed {
            None => return Err(YearEndError::SnapshotNotFound(snapshot_id)),
            Some(true) => return Err(YearEndError::SnapshotConsumed(snapshot_id)),
            Some(false) => {}
        }

        let details: Vec<(String, String, f64, f64)> = {
            let mut stmt = tx
                .prepare(
                    "SELECT entity_kind, entity_id, distance_total_km, coins_total
                     FROM year_snapshot_details WHERE snapshot_id = ?1",
                )
                .map_err(DatabaseError::from)?;
            let rows = stmt
                .query_map(params![snapshot_id.to_string()], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })
                .map_err(DatabaseError::from)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(DatabaseError::from)?;
            rows
        };

        for (kind, entity_id, distance, coins) in details {
            let sql = match kind.as_str() {
                "group" => "UPDATE groups SET distance_total_km = ?2, coins_total = ?3 WHERE id = ?1",
                "cyclist" => {
                    "UPDATE cyclists SET distance_total_km = ?2, coins_total = ?3 WHERE id = ?1"
                }
                "device" => "UPDATE devices SET distance_total_km = ?2 WHERE id = ?1",
                other => {
                    return Err(YearEndError::Database(DatabaseError::InvalidData(format!(
                        "unknown snapshot entity kind: {other}"
                    ))))
                }
            };
            if kind == "device" {
                tx.execute(sql, params![entity_id, distance])
                    .map_err(DatabaseError::from)?;
            } else {
                tx.execute(sql, params![entity_id, distance, coins])
                    .map_err(DatabaseError::from)?;
            }
        }

        tx.execute(
            "UPDATE year_snapshots SET consumed = 1 WHERE id = ?1",
            params![snapshot_id.to_string()],
        )
        .map_err(DatabaseError::from)?;

        tx.commit()
            .map_err(|e| DatabaseError::TransactionFailed(e.to_string()))?;

        tracing::info!(snapshot_id = %snapshot_id, "year-end reset undone");

        Ok(())
    }
}

fn snapshot_detail(
    tx: &Connection,
    snapshot_id: Uuid,
    kind: &str,
    entity_id: Uuid,
    distance: f64,
    coins: f64,
) -> Result<(), DatabaseError> {
    tx.execute(
        "INSERT INTO year_snapshot_details
         (id, snapshot_id, entity_kind, entity_id, distance_total_km, coins_total)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            Uuid::new_v4().to_string(),
            snapshot_id.to_string(),
            kind,
            entity_id.to_string(),
            distance,
            coins,
        ],
    )?;
    Ok(())
}

/// Distinct cyclists belonging to any group in the subtree.
fn subtree_cyclists(
    tx: &Connection,
    subtree: &[Uuid],
) -> Result<Vec<(Uuid, f64, f64)>, DatabaseError> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();

    for group_id in subtree {
        let mut stmt = tx.prepare(
            "SELECT c.id, c.distance_total_km, c.coins_total FROM cyclists c
             JOIN cyclist_groups cg ON cg.cyclist_id = c.id
             WHERE cg.group_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![group_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, f64>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        for (id_str, distance, coins) in rows {
            let id = Uuid::parse_str(&id_str)
                .map_err(|e| DatabaseError::InvalidData(format!("cyclist id: {e}")))?;
            if seen.insert(id) {
                out.push((id, distance, coins));
            }
        }
    }

    Ok(out)
}

/// Devices assigned to any group in the subtree.
fn subtree_devices(tx: &Connection, subtree: &[Uuid]) -> Result<Vec<(Uuid, f64)>, DatabaseError> {
    let mut out = Vec::new();

    for group_id in subtree {
        let mut stmt = tx.prepare(
            "SELECT id, distance_total_km FROM devices WHERE group_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![group_id.to_string()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        for (id_str, distance) in rows {
            let id = Uuid::parse_str(&id_str)
                .map_err(|e| DatabaseError::InvalidData(format!("device id: {e}")))?;
            out.push((id, distance));
        }
    }

    Ok(out)
}

/// Year-end errors.
#[derive(Debug, Error)]
pub enum YearEndError {
    #[error("Group not found: {0}")]
    GroupNotFound(Uuid),

    #[error("Group is not top-level: {0}")]
    NotTopLevel(Uuid),

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(Uuid),

    #[error("Snapshot already consumed: {0}")]
    SnapshotConsumed(Uuid),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}
