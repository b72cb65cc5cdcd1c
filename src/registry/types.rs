//! Cyclist and device domain types.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A tracked participant.
///
/// `tag` is the external identity (badge/chip id) ingestion looks up by.
/// `distance_total_km`/`coins_total` are cumulative since the last year-end
/// reset.
#[derive(Debug, Clone)]
pub struct Cyclist {
    pub id: Uuid,
    pub tag: String,
    pub name: String,
    pub distance_total_km: f64,
    pub coins_total: f64,
    pub collection_enabled: bool,
    pub visible: bool,
    pub last_active_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Cyclist {
    /// Create a new cyclist with the given identity tag.
    pub fn new(tag: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tag: tag.into(),
            name: name.into(),
            distance_total_km: 0.0,
            coins_total: 0.0,
            collection_enabled: true,
            visible: true,
            last_active_at: None,
            created_at: Utc::now(),
        }
    }
}

/// A counting station / measurement device.
#[derive(Debug, Clone)]
pub struct Device {
    pub id: Uuid,
    pub hardware_id: String,
    pub name: String,
    pub group_id: Option<Uuid>,
    pub distance_total_km: f64,
    pub enabled: bool,
    pub visible: bool,
    pub created_at: DateTime<Utc>,
}

impl Device {
    /// Create a new device with the given hardware identity.
    pub fn new(hardware_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            hardware_id: hardware_id.into(),
            name: name.into(),
            group_id: None,
            distance_total_km: 0.0,
            enabled: true,
            visible: true,
            created_at: Utc::now(),
        }
    }
}
