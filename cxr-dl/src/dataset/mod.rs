//! Annotation loading, sample construction and batching.

mod annotation;
pub use annotation::*;

mod index;
pub use index::*;

mod target;
pub use target::*;

mod transform;
pub use transform::*;

mod provider;
pub use provider::*;

mod batch;
pub use batch::*;
