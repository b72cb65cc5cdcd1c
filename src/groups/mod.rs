//! Group hierarchy: schools and classes with running totals.

pub mod hierarchy;
pub mod types;

pub use hierarchy::GroupForest;
pub use types::Group;
