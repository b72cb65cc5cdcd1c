//! Database operations using rusqlite.
//!
//! Holds the connection, runs versioned migrations, and provides CRUD for
//! groups, cyclists, devices, live sessions and hourly metrics. The
//! reconciliation worker and ingestion service run their multi-statement
//! logic directly against the connection/transaction they get from here.

use crate::groups::Group;
use crate::registry::{Cyclist, Device};
use crate::sessions::types::LiveSession;
use crate::storage::schema::{CURRENT_VERSION, SCHEMA, SCHEMA_VERSION_TABLE};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Database wrapper for SQLite operations.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open or create a database at the given path.
    pub fn open(path: &PathBuf) -> Result<Self, DatabaseError> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DatabaseError::IoError(e.to_string()))?;
        }

        let conn =
            Connection::open(path).map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

        let db = Self { conn };
        db.initialize()?;

        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

        let db = Self { conn };
        db.initialize()?;

        Ok(db)
    }

    /// Initialize the database schema.
    fn initialize(&self) -> Result<(), DatabaseError> {
        self.conn
            .execute_batch(SCHEMA_VERSION_TABLE)
            .map_err(|e| DatabaseError::MigrationFailed(e.to_string()))?;

        let current_version = self.get_schema_version()?;

        if current_version < CURRENT_VERSION {
            self.migrate(current_version)?;
        }

        Ok(())
    }

    /// Get the current schema version.
    fn get_schema_version(&self) -> Result<i32, DatabaseError> {
        let result: rusqlite::Result<i32> = self.conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        );

        match result {
            Ok(version) => Ok(version),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
            Err(e) => Err(DatabaseError::QueryFailed(e.to_string())),
        }
    }

    /// Run database migrations.
    fn migrate(&self, from_version: i32) -> Result<(), DatabaseError> {
        if from_version < 1 {
            self.conn
                .execute_batch(SCHEMA)
                .map_err(|e| DatabaseError::MigrationFailed(e.to_string()))?;

            self.conn
                .execute(
                    "INSERT INTO schema_version (version, applied_at) VALUES (?, datetime('now'))",
                    [CURRENT_VERSION],
                )
                .map_err(|e| DatabaseError::MigrationFailed(e.to_string()))?;

            tracing::info!("Database migrated to version {}", CURRENT_VERSION);
        }

        // Future migrations would go here:
        // if from_version < 2 { ... }

        Ok(())
    }

    /// Get a reference to the underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Begin a transaction.
    pub fn transaction(&mut self) -> Result<rusqlite::Transaction<'_>, DatabaseError> {
        self.conn
            .transaction()
            .map_err(|e| DatabaseError::TransactionFailed(e.to_string()))
    }

    // ========== Group CRUD ==========

    /// Insert a new group.
    pub fn insert_group(&self, group: &Group) -> Result<(), DatabaseError> {
        self.conn.execute(
            "INSERT INTO groups (id, name, short_label, parent_id, distance_total_km,
             coins_total, visible, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                group.id.to_string(),
                group.name,
                group.short_label,
                group.parent_id.map(|p| p.to_string()),
                group.distance_total_km,
                group.coins_total,
                group.visible,
                group.created_at.to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    /// Get a group by id.
    pub fn get_group(&self, id: Uuid) -> Result<Option<Group>, DatabaseError> {
        self.conn
            .query_row(
                "SELECT id, name, short_label, parent_id, distance_total_km,
                 coins_total, visible, created_at FROM groups WHERE id = ?1",
                params![id.to_string()],
                row_to_group,
            )
            .optional()
            .map_err(DatabaseError::from)
    }

    /// List all groups.
    pub fn list_groups(&self) -> Result<Vec<Group>, DatabaseError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, short_label, parent_id, distance_total_km,
             coins_total, visible, created_at FROM groups ORDER BY name ASC",
        )?;

        let rows = stmt.query_map([], row_to_group)?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(DatabaseError::from)
    }

    // ========== Cyclist CRUD ==========

    /// Insert a new cyclist.
    pub fn insert_cyclist(&self, cyclist: &Cyclist) -> Result<(), DatabaseError> {
        self.conn.execute(
            "INSERT INTO cyclists (id, tag, name, distance_total_km, coins_total,
             collection_enabled, visible, last_active_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                cyclist.id.to_string(),
                cyclist.tag,
                cyclist.name,
                cyclist.distance_total_km,
                cyclist.coins_total,
                cyclist.collection_enabled,
                cyclist.visible,
                cyclist.last_active_at.map(|t| t.to_rfc3339()),
                cyclist.created_at.to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    /// Get a cyclist by id.
    pub fn get_cyclist(&self, id: Uuid) -> Result<Option<Cyclist>, DatabaseError> {
        self.conn
            .query_row(
                "SELECT id, tag, name, distance_total_km, coins_total, collection_enabled,
                 visible, last_active_at, created_at FROM cyclists WHERE id = ?1",
                params![id.to_string()],
                row_to_cyclist,
            )
            .optional()
            .map_err(DatabaseError::from)
    }

    /// Get a cyclist by identity tag.
    pub fn get_cyclist_by_tag(&self, tag: &str) -> Result<Option<Cyclist>, DatabaseError> {
        self.conn
            .query_row(
                "SELECT id, tag, name, distance_total_km, coins_total, collection_enabled,
                 visible, last_active_at, created_at FROM cyclists WHERE tag = ?1",
                params![tag],
                row_to_cyclist,
            )
            .optional()
            .map_err(DatabaseError::from)
    }

    /// List all cyclists.
    pub fn list_cyclists(&self) -> Result<Vec<Cyclist>, DatabaseError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, tag, name, distance_total_km, coins_total, collection_enabled,
             visible, last_active_at, created_at FROM cyclists ORDER BY name ASC",
        )?;

        let rows = stmt.query_map([], row_to_cyclist)?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(DatabaseError::from)
    }

    /// Add a cyclist to a group.
    pub fn add_cyclist_to_group(&self, cyclist_id: Uuid, group_id: Uuid) -> Result<(), DatabaseError> {
        self.conn.execute(
            "INSERT INTO cyclist_groups (id, cyclist_id, group_id, joined_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                Uuid::new_v4().to_string(),
                cyclist_id.to_string(),
                group_id.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    /// Resolve the cyclist's primary group: first visible membership in join
    /// order, else the first membership.
    pub fn primary_group_id(&self, cyclist_id: Uuid) -> Result<Option<Uuid>, DatabaseError> {
        primary_group_id(&self.conn, cyclist_id)
    }

    // ========== Device CRUD ==========

    /// Insert a new device.
    pub fn insert_device(&self, device: &Device) -> Result<(), DatabaseError> {
        self.conn.execute(
            "INSERT INTO devices (id, hardware_id, name, group_id, distance_total_km,
             enabled, visible, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                device.id.to_string(),
                device.hardware_id,
                device.name,
                device.group_id.map(|g| g.to_string()),
                device.distance_total_km,
                device.enabled,
                device.visible,
                device.created_at.to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    /// Get a device by id.
    pub fn get_device(&self, id: Uuid) -> Result<Option<Device>, DatabaseError> {
        self.conn
            .query_row(
                "SELECT id, hardware_id, name, group_id, distance_total_km, enabled,
                 visible, created_at FROM devices WHERE id = ?1",
                params![id.to_string()],
                row_to_device,
            )
            .optional()
            .map_err(DatabaseError::from)
    }

    /// Get a device by hardware identity.
    pub fn get_device_by_hardware_id(&self, hardware_id: &str) -> Result<Option<Device>, DatabaseError> {
        self.conn
            .query_row(
                "SELECT id, hardware_id, name, group_id, distance_total_km, enabled,
                 visible, created_at FROM devices WHERE hardware_id = ?1",
                params![hardware_id],
                row_to_device,
            )
            .optional()
            .map_err(DatabaseError::from)
    }

    // ========== Live sessions ==========

    /// Get the live session for a cyclist, if any.
    pub fn get_live_session(&self, cyclist_id: Uuid) -> Result<Option<LiveSession>, DatabaseError> {
        self.conn
            .query_row(
                "SELECT cyclist_id, device_id, cumulative_km, started_at, last_activity_at
                 FROM live_sessions WHERE cyclist_id = ?1",
                params![cyclist_id.to_string()],
                row_to_session,
            )
            .optional()
            .map_err(DatabaseError::from)
    }

    /// List all live sessions.
    pub fn list_live_sessions(&self) -> Result<Vec<LiveSession>, DatabaseError> {
        let mut stmt = self.conn.prepare(
            "SELECT cyclist_id, device_id, cumulative_km, started_at, last_activity_at
             FROM live_sessions ORDER BY started_at ASC",
        )?;

        let rows = stmt.query_map([], row_to_session)?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(DatabaseError::from)
    }

    /// Number of live sessions currently in the store.
    pub fn count_live_sessions(&self) -> Result<u32, DatabaseError> {
        self.conn
            .query_row("SELECT COUNT(*) FROM live_sessions", [], |row| row.get(0))
            .map_err(DatabaseError::from)
    }

    // ========== Hourly metrics ==========

    /// Stored per-hour distance for one (cyclist, device, hour) key.
    pub fn get_metric_value(
        &self,
        cyclist_id: Uuid,
        device_id: Uuid,
        hour_ts: DateTime<Utc>,
    ) -> Result<Option<f64>, DatabaseError> {
        self.conn
            .query_row(
                "SELECT distance_km FROM hourly_metrics
                 WHERE cyclist_id = ?1 AND device_id = ?2 AND hour_ts = ?3",
                params![
                    cyclist_id.to_string(),
                    device_id.to_string(),
                    hour_ts.to_rfc3339(),
                ],
                |row| row.get(0),
            )
            .optional()
            .map_err(DatabaseError::from)
    }

    /// Sum of all stored per-hour distances for one (cyclist, device) pair.
    pub fn sum_metrics_for_pair(
        &self,
        cyclist_id: Uuid,
        device_id: Uuid,
    ) -> Result<f64, DatabaseError> {
        self.conn
            .query_row(
                "SELECT COALESCE(SUM(distance_km), 0.0) FROM hourly_metrics
                 WHERE cyclist_id = ?1 AND device_id = ?2",
                params![cyclist_id.to_string(), device_id.to_string()],
                |row| row.get(0),
            )
            .map_err(DatabaseError::from)
    }

    /// Number of metric rows for one (cyclist, device) pair.
    pub fn count_metrics_for_pair(
        &self,
        cyclist_id: Uuid,
        device_id: Uuid,
    ) -> Result<u32, DatabaseError> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM hourly_metrics
                 WHERE cyclist_id = ?1 AND device_id = ?2",
                params![cyclist_id.to_string(), device_id.to_string()],
                |row| row.get(0),
            )
            .map_err(DatabaseError::from)
    }
}

// ========== Row parsing helpers (shared with worker/aggregation SQL) ==========

pub(crate) fn row_to_group(row: &Row<'_>) -> rusqlite::Result<Group> {
    Ok(Group {
        id: parse_uuid(row, 0)?,
        name: row.get(1)?,
        short_label: row.get(2)?,
        parent_id: parse_opt_uuid(row, 3)?,
        distance_total_km: row.get(4)?,
        coins_total: row.get(5)?,
        visible: row.get(6)?,
        created_at: parse_ts(row, 7)?,
    })
}

pub(crate) fn row_to_cyclist(row: &Row<'_>) -> rusqlite::Result<Cyclist> {
    Ok(Cyclist {
        id: parse_uuid(row, 0)?,
        tag: row.get(1)?,
        name: row.get(2)?,
        distance_total_km: row.get(3)?,
        coins_total: row.get(4)?,
        collection_enabled: row.get(5)?,
        visible: row.get(6)?,
        last_active_at: parse_opt_ts(row, 7)?,
        created_at: parse_ts(row, 8)?,
    })
}

pub(crate) fn row_to_device(row: &Row<'_>) -> rusqlite::Result<Device> {
    Ok(Device {
        id: parse_uuid(row, 0)?,
        hardware_id: row.get(1)?,
        name: row.get(2)?,
        group_id: parse_opt_uuid(row, 3)?,
        distance_total_km: row.get(4)?,
        enabled: row.get(5)?,
        visible: row.get(6)?,
        created_at: parse_ts(row, 7)?,
    })
}

pub(crate) fn row_to_session(row: &Row<'_>) -> rusqlite::Result<LiveSession> {
    Ok(LiveSession {
        cyclist_id: parse_uuid(row, 0)?,
        device_id: parse_uuid(row, 1)?,
        cumulative_km: row.get(2)?,
        started_at: parse_ts(row, 3)?,
        last_activity_at: parse_ts(row, 4)?,
    })
}

/// Primary-group query usable inside a transaction as well.
pub(crate) fn primary_group_id(
    conn: &Connection,
    cyclist_id: Uuid,
) -> Result<Option<Uuid>, DatabaseError> {
    let id_str: Option<String> = conn
        .query_row(
            "SELECT g.id FROM groups g
             JOIN cyclist_groups cg ON cg.group_id = g.id
             WHERE cg.cyclist_id = ?1
             ORDER BY g.visible DESC, cg.rowid ASC
             LIMIT 1",
            params![cyclist_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;

    match id_str {
        Some(s) => Ok(Some(Uuid::parse_str(&s).map_err(|e| {
            DatabaseError::InvalidData(format!("group id: {e}"))
        })?)),
        None => Ok(None),
    }
}

fn parse_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let s: String = row.get(idx)?;
    Uuid::parse_str(&s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_opt_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let s: Option<String> = row.get(idx)?;
    match s {
        Some(s) => Uuid::parse_str(&s).map(Some).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        }),
        None => Ok(None),
    }
}

fn parse_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    match s {
        Some(s) => DateTime::parse_from_rfc3339(&s)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    idx,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            }),
        None => Ok(None),
    }
}

/// Database errors.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl From<rusqlite::Error> for DatabaseError {
    fn from(e: rusqlite::Error) -> Self {
        DatabaseError::QueryFailed(e.to_string())
    }
}

impl DatabaseError {
    /// Whether the underlying failure looks like a transient lock/busy
    /// condition worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            DatabaseError::QueryFailed(msg) | DatabaseError::TransactionFailed(msg) => {
                msg.contains("database is locked") || msg.contains("database table is locked")
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_initializes() {
        let db = Database::open_in_memory().expect("Failed to create database");
        assert_eq!(db.get_schema_version().unwrap(), CURRENT_VERSION);
    }

    #[test]
    fn test_group_insert_and_get() {
        let db = Database::open_in_memory().expect("Failed to create database");
        let school = Group::new("Riverdale Primary", "RIV");

        db.insert_group(&school).expect("Failed to insert group");

        let retrieved = db
            .get_group(school.id)
            .expect("Failed to get group")
            .expect("Group not found");

        assert_eq!(retrieved.id, school.id);
        assert_eq!(retrieved.name, "Riverdale Primary");
        assert!(retrieved.parent_id.is_none());
        assert_eq!(retrieved.distance_total_km, 0.0);
        assert!(retrieved.visible);
    }

    #[test]
    fn test_group_hierarchy_roundtrip() {
        let db = Database::open_in_memory().expect("Failed to create database");
        let school = Group::new("School", "SCH");
        let class = Group::new_child("5a", "5a", school.id);

        db.insert_group(&school).unwrap();
        db.insert_group(&class).unwrap();

        let retrieved = db.get_group(class.id).unwrap().unwrap();
        assert_eq!(retrieved.parent_id, Some(school.id));

        let all = db.list_groups().unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_cyclist_lookup_by_tag() {
        let db = Database::open_in_memory().expect("Failed to create database");
        let cyclist = Cyclist::new("TAG-0001", "Alex");

        db.insert_cyclist(&cyclist).expect("Failed to insert cyclist");

        let by_tag = db
            .get_cyclist_by_tag("TAG-0001")
            .expect("Failed to query")
            .expect("Cyclist not found");
        assert_eq!(by_tag.id, cyclist.id);
        assert!(by_tag.collection_enabled);

        assert!(db.get_cyclist_by_tag("TAG-MISSING").unwrap().is_none());
    }

    #[test]
    fn test_primary_group_prefers_first_visible() {
        let db = Database::open_in_memory().expect("Failed to create database");

        let mut hidden = Group::new("Hidden", "HID");
        hidden.visible = false;
        let visible = Group::new("Visible", "VIS");
        db.insert_group(&hidden).unwrap();
        db.insert_group(&visible).unwrap();

        let cyclist = Cyclist::new("TAG-0002", "Billie");
        db.insert_cyclist(&cyclist).unwrap();

        // Joined the hidden group first, the visible one second.
        db.add_cyclist_to_group(cyclist.id, hidden.id).unwrap();
        db.add_cyclist_to_group(cyclist.id, visible.id).unwrap();

        let primary = db.primary_group_id(cyclist.id).unwrap();
        assert_eq!(primary, Some(visible.id));
    }

    #[test]
    fn test_primary_group_falls_back_to_first() {
        let db = Database::open_in_memory().expect("Failed to create database");

        let mut first = Group::new("First", "1ST");
        first.visible = false;
        let mut second = Group::new("Second", "2ND");
        second.visible = false;
        db.insert_group(&first).unwrap();
        db.insert_group(&second).unwrap();

        let cyclist = Cyclist::new("TAG-0003", "Chris");
        db.insert_cyclist(&cyclist).unwrap();
        db.add_cyclist_to_group(cyclist.id, first.id).unwrap();
        db.add_cyclist_to_group(cyclist.id, second.id).unwrap();

        assert_eq!(db.primary_group_id(cyclist.id).unwrap(), Some(first.id));
    }

    #[test]
    fn test_primary_group_none_without_membership() {
        let db = Database::open_in_memory().expect("Failed to create database");
        let cyclist = Cyclist::new("TAG-0004", "Dana");
        db.insert_cyclist(&cyclist).unwrap();

        assert!(db.primary_group_id(cyclist.id).unwrap().is_none());
    }

    #[test]
    fn test_device_lookup_by_hardware_id() {
        let db = Database::open_in_memory().expect("Failed to create database");
        let device = Device::new("HW-42", "Bike rack counter");

        db.insert_device(&device).expect("Failed to insert device");

        let by_hw = db
            .get_device_by_hardware_id("HW-42")
            .expect("Failed to query")
            .expect("Device not found");
        assert_eq!(by_hw.id, device.id);
        assert!(by_hw.enabled);
    }

    #[test]
    fn test_metric_sums_empty_pair() {
        let db = Database::open_in_memory().expect("Failed to create database");
        let sum = db
            .sum_metrics_for_pair(Uuid::new_v4(), Uuid::new_v4())
            .expect("Failed to sum");
        assert_eq!(sum, 0.0);
    }
}
