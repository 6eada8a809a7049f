//! Fixed, ordered validation chain applied to every payload crossing a
//! component boundary — Qflow component C3.

pub mod cache;
pub mod error;
pub mod pipeline;

pub use cache::ValidationCache;
pub use error::ValidationError;
pub use pipeline::{PayloadValidationRequest, ValidationOutcome, ValidationPipeline};
