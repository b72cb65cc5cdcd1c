//! Leaderboard aggregation: time windows, roll-up and record holders.

pub mod cache;
pub mod engine;
pub mod windows;

pub use cache::FigureCache;
pub use engine::{AggregateError, AggregateResult, AggregationEngine, RecordHolder, WindowFigures};
pub use windows::TimeWindow;
