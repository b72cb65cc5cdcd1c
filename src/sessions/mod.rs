//! Live sessions and distance ingestion.

pub mod ingest;
pub mod types;

pub use ingest::{IngestError, IngestOutcome, IngestService};
pub use types::LiveSession;
