//! Multi-task chest X-ray classification and detection.

mod common;
pub mod dataset;
pub mod engine;
pub mod inference;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod utils;
pub mod vocabulary;
