//! Training and evaluation passes of the multi-task model.

mod trainer;
pub use trainer::*;

mod evaluator;
pub use evaluator::*;
