//! Classification and detection metrics.

mod average_precision;
pub use average_precision::*;

mod classification;
pub use classification::*;

mod detection;
pub use detection::*;
