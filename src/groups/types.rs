//! Group domain types.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A named group in the hierarchy (a school, or a class within a school).
///
/// Groups form a forest: `parent_id == None` marks a top-level group.
/// `distance_total_km` is a running total maintained incrementally by
/// ingestion (own distance plus all descendants) and zeroed only by the
/// year-end reset.
#[derive(Debug, Clone)]
pub struct Group {
    pub id: Uuid,
    pub name: String,
    pub short_label: String,
    pub parent_id: Option<Uuid>,
    pub distance_total_km: f64,
    pub coins_total: f64,
    pub visible: bool,
    pub created_at: DateTime<Utc>,
}

impl Group {
    /// Create a new top-level group.
    pub fn new(name: impl Into<String>, short_label: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            short_label: short_label.into(),
            parent_id: None,
            distance_total_km: 0.0,
            coins_total: 0.0,
            visible: true,
            created_at: Utc::now(),
        }
    }

    /// Create a new child group under the given parent.
    pub fn new_child(
        name: impl Into<String>,
        short_label: impl Into<String>,
        parent_id: Uuid,
    ) -> Self {
        Self {
            parent_id: Some(parent_id),
            ..Self::new(name, short_label)
        }
    }

    /// Whether this group has no parent.
    pub fn is_top_level(&self) -> bool {
        self.parent_id.is_none()
    }
}
