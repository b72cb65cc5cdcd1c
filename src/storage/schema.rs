//! Database schema definitions for SchoolRide.

/// SQL schema for creating all database tables.
pub const SCHEMA: &str = r#"
-- Groups table (schools, classes), forms a forest via parent_id
CREATE TABLE IF NOT EXISTS groups (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    short_label TEXT NOT NULL DEFAULT '',
    parent_id TEXT REFERENCES groups(id),
    distance_total_km REAL NOT NULL DEFAULT 0.0,
    coins_total REAL NOT NULL DEFAULT 0.0,
    visible INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_groups_parent_id ON groups(parent_id);

-- Cyclists table
CREATE TABLE IF NOT EXISTS cyclists (
    id TEXT PRIMARY KEY,
    tag TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    distance_total_km REAL NOT NULL DEFAULT 0.0,
    coins_total REAL NOT NULL DEFAULT 0.0,
    collection_enabled INTEGER NOT NULL DEFAULT 1,
    visible INTEGER NOT NULL DEFAULT 1,
    last_active_at TEXT,
    created_at TEXT NOT NULL
);

-- Cyclist group memberships (join order preserved via rowid)
CREATE TABLE IF NOT EXISTS cyclist_groups (
    id TEXT PRIMARY KEY,
    cyclist_id TEXT NOT NULL REFERENCES cyclists(id) ON DELETE CASCADE,
    group_id TEXT NOT NULL REFERENCES groups(id),
    joined_at TEXT NOT NULL,
    UNIQUE(cyclist_id, group_id)
);

CREATE INDEX IF NOT EXISTS idx_cyclist_groups_cyclist ON cyclist_groups(cyclist_id);
CREATE INDEX IF NOT EXISTS idx_cyclist_groups_group ON cyclist_groups(group_id);

-- Devices table (counting stations a cyclist rides against)
CREATE TABLE IF NOT EXISTS devices (
    id TEXT PRIMARY KEY,
    hardware_id TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    group_id TEXT REFERENCES groups(id),
    distance_total_km REAL NOT NULL DEFAULT 0.0,
    enabled INTEGER NOT NULL DEFAULT 1,
    visible INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);

-- Live sessions: one mutable row per cyclist, distance since started_at
CREATE TABLE IF NOT EXISTS live_sessions (
    cyclist_id TEXT PRIMARY KEY REFERENCES cyclists(id),
    device_id TEXT NOT NULL REFERENCES devices(id),
    cumulative_km REAL NOT NULL DEFAULT 0.0,
    started_at TEXT NOT NULL,
    last_activity_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_live_sessions_last_activity ON live_sessions(last_activity_at);

-- Hourly metrics: immutable-once-settled history, one row per
-- (cyclist, device, hour); distance_km is per-hour, not cumulative
CREATE TABLE IF NOT EXISTS hourly_metrics (
    id TEXT PRIMARY KEY,
    cyclist_id TEXT REFERENCES cyclists(id),
    device_id TEXT NOT NULL REFERENCES devices(id),
    hour_ts TEXT NOT NULL,
    distance_km REAL NOT NULL,
    group_id TEXT REFERENCES groups(id),
    UNIQUE(cyclist_id, device_id, hour_ts)
);

CREATE INDEX IF NOT EXISTS idx_hourly_metrics_hour ON hourly_metrics(hour_ts);
CREATE INDEX IF NOT EXISTS idx_hourly_metrics_group ON hourly_metrics(group_id);
CREATE INDEX IF NOT EXISTS idx_hourly_metrics_pair ON hourly_metrics(cyclist_id, device_id);

-- Year-end snapshots (one per top-level group per reset)
CREATE TABLE IF NOT EXISTS year_snapshots (
    id TEXT PRIMARY KEY,
    group_id TEXT NOT NULL REFERENCES groups(id),
    year INTEGER NOT NULL,
    taken_at TEXT NOT NULL,
    consumed INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS year_snapshot_details (
    id TEXT PRIMARY KEY,
    snapshot_id TEXT NOT NULL REFERENCES year_snapshots(id) ON DELETE CASCADE,
    entity_kind TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    distance_total_km REAL NOT NULL,
    coins_total REAL NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_snapshot_details_snapshot ON year_snapshot_details(snapshot_id);
"#;

/// SQL for the schema version tracking table.
pub const SCHEMA_VERSION_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);
"#;

/// Current schema version.
pub const CURRENT_VERSION: i32 = 1;
