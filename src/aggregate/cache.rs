//! Aggregation result cache.
//!
//! Figures are cheap to rebuild but read far more often than they change,
//! so results are cached in memory keyed by (candidate set, hour bucket)
//! with a TTL kept below the worker tick interval. A cached figure can
//! therefore never survive into a tick where new hourly data has landed.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::engine::AggregateResult;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    candidates: Vec<Uuid>,
    hour_bucket: DateTime<Utc>,
}

struct CacheEntry {
    inserted_at: Instant,
    result: AggregateResult,
}

/// In-memory TTL cache for aggregation results.
#[derive(Default)]
pub struct FigureCache {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl FigureCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a fresh cached result, if any.
    pub fn get(
        &self,
        candidates: &[Uuid],
        hour_bucket: DateTime<Utc>,
        ttl: Duration,
    ) -> Option<AggregateResult> {
        let key = Self::key(candidates, hour_bucket);
        let entries = self.entries.lock().ok()?;
        let entry = entries.get(&key)?;
        if entry.inserted_at.elapsed() < ttl {
            Some(entry.result.clone())
        } else {
            None
        }
    }

    /// Store a result, evicting stale entries as a side effect.
    pub fn put(
        &self,
        candidates: &[Uuid],
        hour_bucket: DateTime<Utc>,
        ttl: Duration,
        result: AggregateResult,
    ) {
        let key = Self::key(candidates, hour_bucket);
        if let Ok(mut entries) = self.entries.lock() {
            entries.retain(|_, e| e.inserted_at.elapsed() < ttl);
            entries.insert(
                key,
                CacheEntry {
                    inserted_at: Instant::now(),
                    result,
                },
            );
        }
    }

    fn key(candidates: &[Uuid], hour_bucket: DateTime<Utc>) -> CacheKey {
        let mut candidates = candidates.to_vec();
        candidates.sort();
        candidates.dedup();
        CacheKey {
            candidates,
            hour_bucket,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_hit_within_ttl() {
        let cache = FigureCache::new();
        let hour = Utc.with_ymd_and_hms(2025, 6, 10, 9, 0, 0).unwrap();
        let id = Uuid::new_v4();
        let ttl = Duration::from_secs(55);

        assert!(cache.get(&[id], hour, ttl).is_none());
        cache.put(&[id], hour, ttl, AggregateResult::default());
        assert!(cache.get(&[id], hour, ttl).is_some());

        // Candidate order must not matter.
        let other = Uuid::new_v4();
        cache.put(&[id, other], hour, ttl, AggregateResult::default());
        assert!(cache.get(&[other, id], hour, ttl).is_some());
    }

    #[test]
    fn test_expired_entry_misses() {
        let cache = FigureCache::new();
        let hour = Utc.with_ymd_and_hms(2025, 6, 10, 9, 0, 0).unwrap();
        let id = Uuid::new_v4();

        cache.put(&[id], hour, Duration::from_secs(55), AggregateResult::default());
        assert!(cache.get(&[id], hour, Duration::ZERO).is_none());
    }

    #[test]
    fn test_different_hour_misses() {
        let cache = FigureCache::new();
        let hour = Utc.with_ymd_and_hms(2025, 6, 10, 9, 0, 0).unwrap();
        let next = Utc.with_ymd_and_hms(2025, 6, 10, 10, 0, 0).unwrap();
        let id = Uuid::new_v4();
        let ttl = Duration::from_secs(55);

        cache.put(&[id], hour, ttl, AggregateResult::default());
        assert!(cache.get(&[id], next, ttl).is_none());
    }
}
