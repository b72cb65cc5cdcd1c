//! Entity registry: cyclists and devices.

pub mod types;

pub use types::{Cyclist, Device};
