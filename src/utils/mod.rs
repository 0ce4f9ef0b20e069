//! Grid utilities.

pub mod mask;

pub use mask::{build_auto_mask, percentile};
