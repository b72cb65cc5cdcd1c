//! Live session domain types.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// The mutable record of one cyclist's in-progress ride on one device.
///
/// Keyed by cyclist: a cyclist has at most one live session at a time.
/// `cumulative_km` is the distance accumulated since `started_at`, not the
/// cyclist's lifetime total.
#[derive(Debug, Clone)]
pub struct LiveSession {
    pub cyclist_id: Uuid,
    pub device_id: Uuid,
    pub cumulative_km: f64,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}
