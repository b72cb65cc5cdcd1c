//! Session reconciliation: the fold of live sessions into hourly history.

pub mod sweeper;
pub mod types;
pub mod worker;

pub use sweeper::ExpirySweeper;
pub use types::{truncate_to_hour, FoldOutcome, ReconcileError, ReconcileReport, SweepReport};
pub use worker::ReconcileWorker;
