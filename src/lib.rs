//! SchoolRide - Cycling Distance Tracker for Schools
//!
//! A self-hosted service that tracks cumulative cycling distance for
//! cyclists and devices inside a school/class hierarchy, converts distance
//! into reward coins, folds live riding sessions into hour-bucketed
//! history, and serves time-windowed leaderboard figures.

pub mod aggregate;
pub mod groups;
pub mod reconcile;
pub mod registry;
pub mod scheduler;
pub mod sessions;
pub mod storage;
pub mod yearend;

// Re-export commonly used types
pub use aggregate::AggregationEngine;
pub use reconcile::{ExpirySweeper, ReconcileWorker};
pub use scheduler::Scheduler;
pub use sessions::IngestService;
pub use storage::{AppConfig, Database};
pub use yearend::YearEndService;
