//! Aggregation engine.
//!
//! Computes per-group figures for the five leaderboard windows from the
//! hourly metric history, rolls child figures up into their ancestors, and
//! picks the record holder per window. Reads only; the sole side effect is
//! the TTL result cache.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::groups::GroupForest;
use crate::reconcile::truncate_to_hour;
use crate::storage::{DatabaseError, Settings, SharedDatabase};

use super::cache::FigureCache;
use super::windows::TimeWindow;

/// One figure per leaderboard window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WindowFigures {
    pub daily: f64,
    pub weekly: f64,
    pub monthly: f64,
    pub yearly: f64,
    pub total: f64,
}

impl WindowFigures {
    /// Figure for one window.
    pub fn get(&self, window: TimeWindow) -> f64 {
        match window {
            TimeWindow::Daily => self.daily,
            TimeWindow::Weekly => self.weekly,
            TimeWindow::Monthly => self.monthly,
            TimeWindow::Yearly => self.yearly,
            TimeWindow::Total => self.total,
        }
    }

    fn set(&mut self, window: TimeWindow, value: f64) {
        match window {
            TimeWindow::Daily => self.daily = value,
            TimeWindow::Weekly => self.weekly = value,
            TimeWindow::Monthly => self.monthly = value,
            TimeWindow::Yearly => self.yearly = value,
            TimeWindow::Total => self.total = value,
        }
    }

    fn add(&mut self, window: TimeWindow, value: f64) {
        self.set(window, self.get(window) + value);
    }
}

/// The group holding the maximum figure for a window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordHolder {
    pub group_id: Uuid,
    pub value_km: f64,
}

/// Aggregation output: rolled-up figures for the requested groups, the
/// per-window record holders, and the double-count-free grand total.
#[derive(Debug, Clone, Default)]
pub struct AggregateResult {
    /// Rolled-up figures per requested group. Unknown groups are absent.
    pub figures: HashMap<Uuid, WindowFigures>,
    /// Record holder per window; a window with no positive figure has none.
    pub record_holders: HashMap<TimeWindow, RecordHolder>,
    /// Sum over the requested top-level groups only, so descendants are
    /// never counted twice.
    pub grand_total: WindowFigures,
}

/// Read-side engine computing leaderboard figures from hourly metrics.
pub struct AggregationEngine {
    db: SharedDatabase,
    cache: FigureCache,
}

impl AggregationEngine {
    /// Create a new engine over the shared database.
    pub fn new(db: SharedDatabase) -> Self {
        Self {
            db,
            cache: FigureCache::new(),
        }
    }

    /// Compute figures and record holders for the candidate groups at `now`.
    ///
    /// Results are cached per (candidate set, hour bucket) with the
    /// configured TTL; within one worker tick repeated reads hit the cache.
    pub fn aggregate(
        &self,
        candidates: &[Uuid],
        now: DateTime<Utc>,
    ) -> Result<AggregateResult, AggregateError> {
        // A repeated id would hit grand_total twice.
        let mut candidates = candidates.to_vec();
        candidates.sort();
        candidates.dedup();

        let hour_bucket = truncate_to_hour(now);
        let ttl = Duration::from_secs(Settings::current().cache_ttl_secs);

        if let Some(hit) = self.cache.get(&candidates, hour_bucket, ttl) {
            return Ok(hit);
        }

        let result = self.compute(&candidates, now)?;
        self.cache.put(&candidates, hour_bucket, ttl, result.clone());

        Ok(result)
    }

    fn compute(
        &self,
        candidates: &[Uuid],
        now: DateTime<Utc>,
    ) -> Result<AggregateResult, AggregateError> {
        let db = crate::storage::lock(&self.db)?;

        let groups = db.list_groups()?;
        let forest = GroupForest::from_groups(&groups);

        // Tie-break ordering: name first, id second.
        let names: HashMap<Uuid, String> =
            groups.iter().map(|g| (g.id, g.name.clone())).collect();

        let mut result = AggregateResult::default();

        for window in TimeWindow::ALL {
            let base = sum_by_group(db.connection(), window, now)?;
            let rolled = roll_up(&base, &forest);

            for &candidate in candidates {
                if !forest.contains(candidate) {
                    continue;
                }
                let value = rolled.get(&candidate).copied().unwrap_or(0.0);
                result.figures.entry(candidate).or_default().set(window, value);

                if forest.is_top_level(candidate) {
                    result.grand_total.add(window, value);
                }
            }

            if let Some(holder) = record_holder(window, &result.figures, &names) {
                result.record_holders.insert(window, holder);
            }
        }

        Ok(result)
    }
}

/// Per-window sums straight from the metric history, grouped by the group
/// snapshotted at fold time. Rows without a group, or whose group no longer
/// exists, are skipped by the caller's roll-up.
fn sum_by_group(
    conn: &Connection,
    window: TimeWindow,
    now: DateTime<Utc>,
) -> Result<HashMap<Uuid, f64>, AggregateError> {
    let mut out = HashMap::new();

    let mut collect = |rows: Vec<(String, f64)>| {
        for (id_str, sum) in rows {
            match Uuid::parse_str(&id_str) {
                Ok(id) => {
                    out.insert(id, sum);
                }
                Err(_) => {
                    tracing::warn!(group_id = %id_str, "skipping metric rows with malformed group id");
                }
            }
        }
    };

    match window.range(now) {
        Some((start, end)) => {
            let mut stmt = conn
                .prepare(
                    "SELECT group_id, COALESCE(SUM(distance_km), 0.0) FROM hourly_metrics
                     WHERE group_id IS NOT NULL AND hour_ts >= ?1 AND hour_ts <= ?2
                     GROUP BY group_id",
                )
                .map_err(DatabaseError::from)?;
            let rows = stmt
                .query_map(params![start.to_rfc3339(), end.to_rfc3339()], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
                })
                .map_err(DatabaseError::from)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(DatabaseError::from)?;
            collect(rows);
        }
        None => {
            let mut stmt = conn
                .prepare(
                    "SELECT group_id, COALESCE(SUM(distance_km), 0.0) FROM hourly_metrics
                     WHERE group_id IS NOT NULL GROUP BY group_id",
                )
                .map_err(DatabaseError::from)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
                })
                .map_err(DatabaseError::from)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(DatabaseError::from)?;
            collect(rows);
        }
    }

    Ok(out)
}

/// Propagate each group's direct figure into its ancestors.
///
/// Every contribution is added to each ancestor exactly once. An invisible
/// group keeps its own figure but is never used as a pass-through: the walk
/// stops once the chain reaches an invisible node. Groups in the metric
/// history that no longer exist are skipped.
fn roll_up(base: &HashMap<Uuid, f64>, forest: &GroupForest) -> HashMap<Uuid, f64> {
    let mut out: HashMap<Uuid, f64> = HashMap::new();

    for (&group_id, &value) in base {
        if !forest.contains(group_id) {
            tracing::debug!(group_id = %group_id, "metric group no longer exists, skipping");
            continue;
        }
        *out.entry(group_id).or_default() += value;

        let mut child = group_id;
        for parent in forest.ancestors(group_id) {
            if !forest.is_visible(child) {
                break;
            }
            *out.entry(parent).or_default() += value;
            child = parent;
        }
    }

    out
}

/// Strictly-greatest figure among the candidates; ties go to the
/// lexicographically smaller name, then the smaller id. All-zero windows
/// have no holder.
fn record_holder(
    window: TimeWindow,
    figures: &HashMap<Uuid, WindowFigures>,
    names: &HashMap<Uuid, String>,
) -> Option<RecordHolder> {
    let mut ordered: Vec<(&Uuid, &WindowFigures)> = figures.iter().collect();
    ordered.sort_by(|a, b| {
        let name_a = names.get(a.0).map(String::as_str).unwrap_or("");
        let name_b = names.get(b.0).map(String::as_str).unwrap_or("");
        name_a.cmp(name_b).then(a.0.cmp(b.0))
    });

    let mut best: Option<RecordHolder> = None;
    for (&group_id, figs) in ordered {
        let value = figs.get(window);
        if value <= 0.0 {
            continue;
        }
        // Strict comparison keeps the first-in-sort-order group on ties.
        if best.map(|b| value > b.value_km).unwrap_or(true) {
            best = Some(RecordHolder {
                group_id,
                value_km: value,
            });
        }
    }

    best
}

/// Aggregation errors.
#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}
