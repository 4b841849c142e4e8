//! Loss functions.

mod bce_with_logits_loss;
pub use bce_with_logits_loss::*;
